mod balancer;
mod connection;
mod node;
mod pool;

pub use self::balancer::{LoadBalancer, LowestLoad, RegionAffinity, RoundRobin, SelectionHints};
pub use self::connection::{Connection, ConnectionState};
pub use self::node::Node;
pub use self::pool::NodePool;

pub(crate) use self::connection::ConnectionEvent;
pub(crate) use self::node::Command;
pub(crate) use self::pool::Shared;

use serde::Deserialize;

/// How to reach a single Lavalink node.
#[derive(Clone, Debug, Deserialize)]
pub struct NodeConfig {
    /// Unique name of the node within its pool.
    pub name: String,
    /// Base address for REST requests, such as `http://localhost:2333`.
    pub http_host: String,
    /// Address of the WebSocket, such as `ws://localhost:2333/v4/websocket`.
    pub websocket_host: String,
    pub password: String,
    /// Region the node serves, compared against the voice server's region
    /// when selecting a node.
    #[serde(default)]
    pub region: Option<String>,
}

impl NodeConfig {
    pub fn new(
        name: impl Into<String>,
        http_host: impl Into<String>,
        websocket_host: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            http_host: http_host.into(),
            websocket_host: websocket_host.into(),
            password: password.into(),
            region: None,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }
}

/// Whether a node can currently be routed to.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum NodeStatus {
    /// Connecting for the first time or reconnecting after a drop.
    Connecting,
    /// A session is established; only nodes in this state are selected.
    Connected,
    /// The node was closed, removed, or gave up reconnecting.
    Disconnected,
}
