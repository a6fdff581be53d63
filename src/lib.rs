//! A Lavalink client spreading guild voice sessions over a pool of nodes.
//!
//! A [`NodePool`] keeps one WebSocket per node, reconnecting and resuming as
//! needed, and hands out one [`Link`] per guild. Links forward player
//! commands to the node they are bound to and move to another node when
//! theirs goes away.
//!
//! [`Link`]: link/struct.Link.html
//! [`NodePool`]: nodes/struct.NodePool.html

#[macro_use] extern crate log;

pub mod config;
pub mod event_handler;
pub mod link;
pub mod model;
pub mod nodes;
pub mod player;

mod error;

pub use self::config::{CommandTransport, LoadWeights, MigrationCommandPolicy, PoolConfig, ReconnectPolicy};
pub use self::error::{Error, Result};
pub use self::event_handler::{EventHandler, EventSource, LinkEvent, NodeEvent};
pub use self::link::{Link, LinkState, PlayOptions, VoiceServerUpdate};
pub use self::nodes::{LoadBalancer, Node, NodeConfig, NodePool, NodeStatus, SelectionHints};
pub use self::player::Player;
