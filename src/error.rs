use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// The errors that can occur while talking to Lavalink nodes or driving
/// links.
#[derive(Debug, Error)]
pub enum Error {
    /// No node in the pool is connected, or every connected node was
    /// excluded from selection.
    #[error("no nodes available")]
    NoNodesAvailable,
    /// Joining the voice channel on a node timed out or was rejected.
    #[error("link for guild {guild_id} failed to connect: {reason}")]
    LinkConnection { guild_id: u64, reason: String },
    /// A command was issued while the link was migrating and the pool is
    /// configured to fail such commands.
    #[error("link for guild {0} is migrating to another node")]
    LinkMigrating(u64),
    /// A command was issued on a link that isn't bound to a node.
    #[error("link for guild {0} is not connected to a node")]
    LinkNotConnected(u64),
    /// The link was destroyed and can no longer be used.
    #[error("link for guild {0} was destroyed")]
    LinkDestroyed(u64),
    #[error("a link for guild {0} already exists")]
    LinkAlreadyExists(u64),
    #[error("a node named {0:?} already exists")]
    NodeAlreadyExists(String),
    #[error("no node named {0:?}")]
    NodeNotFound(String),
    /// The node has no active session to issue commands on.
    #[error("node {0:?} is not connected")]
    NodeNotConnected(String),
    /// The node has no route planner configured.
    #[error("node {0:?} has no route planner configured")]
    NoRoutePlanner(String),
    /// The node sent something that couldn't be understood.
    #[error("remote protocol error: {0}")]
    RemoteProtocol(String),
    /// The connection to the node could not be re-established.
    #[error("connection to node {0:?} was lost")]
    ConnectionLost(String),
    #[error("invalid {field}: {reason}")]
    InvalidArgument {
        field: &'static str,
        reason: String,
    },
    /// The node answered a REST request with a non-success status.
    #[error("request to {path} failed with status {status}: {message}")]
    Rest {
        status: u16,
        path: String,
        message: String,
    },
    #[error("request timed out")]
    Timeout,
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),
    #[error("invalid http request: {0}")]
    HttpRequest(#[from] hyper::http::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

impl Error {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidArgument {
            field,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
