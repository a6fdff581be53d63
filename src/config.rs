//! Settings shared by every node and link of a [`NodePool`].
//!
//! [`NodePool`]: ../nodes/struct.NodePool.html

use serde::Deserialize;
use std::time::Duration;

/// Configuration applied pool-wide.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// The ID of the bot user the nodes play audio as.
    pub user_id: u64,
    /// Sent as the `Client-Name` header when connecting to a node.
    pub client_name: String,
    /// How lost connections are re-established.
    pub reconnect: ReconnectPolicy,
    /// Interval between WebSocket pings. A connection that stays silent for
    /// two intervals is considered dead.
    pub heartbeat_interval: Duration,
    /// How long a node keeps a session alive after the connection drops.
    ///
    /// `None` disables resuming.
    pub resume_timeout: Option<Duration>,
    /// Which channel player commands are sent over.
    pub command_transport: CommandTransport,
    /// What happens to commands issued while a link migrates.
    pub migration_commands: MigrationCommandPolicy,
    /// How long a link waits for a node to acknowledge a voice join.
    pub link_connect_timeout: Duration,
    /// How many times each step of re-applying player state after a
    /// migration is attempted.
    pub reapply_attempts: u32,
    /// Upper bound for a single REST request.
    pub request_timeout: Duration,
    pub load_weights: LoadWeights,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            user_id: 0,
            client_name: format!("lavalink-cluster/{}", env!("CARGO_PKG_VERSION")),
            reconnect: ReconnectPolicy::default(),
            heartbeat_interval: Duration::from_secs(30),
            resume_timeout: Some(Duration::from_secs(60)),
            command_transport: CommandTransport::default(),
            migration_commands: MigrationCommandPolicy::default(),
            link_connect_timeout: Duration::from_secs(10),
            reapply_attempts: 3,
            request_timeout: Duration::from_secs(10),
            load_weights: LoadWeights::default(),
        }
    }
}

/// Exponential backoff between reconnection attempts.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Attempts made before the node is reported unavailable. `None` retries
    /// forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: Some(10),
        }
    }
}

impl ReconnectPolicy {
    /// The delay before the given attempt, counting from 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `attempt` attempts failed.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }
}

/// The channel player commands travel over.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CommandTransport {
    /// Every command is a REST request.
    #[default]
    Rest,
    /// Commands are sent over the WebSocket while it is open.
    Duplex {
        /// Send over REST when the WebSocket is down instead of failing.
        fallback_to_rest: bool,
    },
}

/// How a link treats commands issued while it is moving to another node.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MigrationCommandPolicy {
    /// Wait for the migration to finish, then apply on the new node.
    #[default]
    Queue,
    /// Fail immediately with [`Error::LinkMigrating`].
    ///
    /// [`Error::LinkMigrating`]: ../enum.Error.html#variant.LinkMigrating
    Fail,
}

/// Weights used when computing a node's load score. Lower scores win.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LoadWeights {
    pub playing_players: f64,
    /// Multiplied by the node's system load, which ranges 0 to 1.
    pub cpu: f64,
    /// Multiplied by the number of missing frames per minute.
    pub frame_deficit: f64,
    /// Added when the node's region differs from the requested one.
    pub region_mismatch: f64,
}

impl Default for LoadWeights {
    fn default() -> Self {
        Self {
            playing_players: 1.0,
            cpu: 10.0,
            frame_deficit: 0.01,
            region_mismatch: 50.0,
        }
    }
}
