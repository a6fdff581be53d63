use hyper::body::Bytes;
use hyper::client::HttpConnector;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::{Body, Client, Method, Request, StatusCode};
use parking_lot::RwLock;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use super::{Connection, ConnectionEvent, NodeConfig, NodeStatus, SelectionHints};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tokio::time;
use crate::config::{CommandTransport, PoolConfig};
use crate::event_handler::{EventSource, NodeEvent};
use crate::model::{
    Band,
    Filters,
    Outbound,
    PlayerInfo,
    Ready,
    RoutePlannerStatus,
    Stats,
    UnmarkAddress,
    UpdatePlayer,
    UpdateSession,
    UpdateTrack,
    VoiceServerEvent,
    VoiceState,
};
use crate::{Error, Result};

/// Characters escaped in a URL path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// A player command, sent over whichever transport the pool is configured
/// for.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Command {
    Voice(VoiceState),
    Play {
        track: String,
        start: Option<u64>,
        end: Option<u64>,
        paused: Option<bool>,
        no_replace: bool,
    },
    Stop,
    Pause(bool),
    Seek(u64),
    Volume(u16),
    /// The complete set of bands; bands left out are reset.
    Equalizer(Vec<Band>),
}

impl Command {
    fn to_outbound(&self, guild_id: u64) -> Outbound {
        let guild_id = guild_id.to_string();

        match self.clone() {
            Command::Voice(voice) => Outbound::VoiceUpdate {
                session_id: voice.session_id,
                event: VoiceServerEvent {
                    guild_id: guild_id.clone(),
                    token: voice.token,
                    endpoint: voice.endpoint,
                },
                guild_id,
            },
            Command::Play { track, start, end, paused, no_replace } => Outbound::Play {
                guild_id,
                track,
                start_time: start,
                end_time: end,
                pause: paused,
                no_replace,
            },
            Command::Stop => Outbound::Stop { guild_id },
            Command::Pause(pause) => Outbound::Pause { guild_id, pause },
            Command::Seek(position) => Outbound::Seek { guild_id, position },
            Command::Volume(volume) => Outbound::Volume { guild_id, volume },
            Command::Equalizer(bands) => Outbound::Equalizer { guild_id, bands },
        }
    }

    fn to_update(&self) -> (UpdatePlayer, bool) {
        let mut update = UpdatePlayer::default();
        let mut no_replace = false;

        match self.clone() {
            Command::Voice(voice) => update.voice = Some(voice),
            Command::Play { track, start, end, paused, no_replace: keep } => {
                update.track = Some(UpdateTrack { encoded: Some(track) });
                update.position = start;
                update.end_time = end;
                update.paused = paused;
                no_replace = keep;
            },
            Command::Stop => update.track = Some(UpdateTrack { encoded: None }),
            Command::Pause(paused) => update.paused = Some(paused),
            Command::Seek(position) => update.position = Some(position),
            Command::Volume(volume) => update.volume = Some(volume),
            Command::Equalizer(bands) => update.filters = Some(Filters {
                equalizer: Some(bands),
            }),
        }

        (update, no_replace)
    }
}

/// A single Lavalink node: its WebSocket, its REST API and the load it last
/// reported.
pub struct Node {
    config: NodeConfig,
    pool_config: Arc<PoolConfig>,
    http: Client<HttpConnector>,
    connection: Arc<Connection>,
    status: watch::Sender<NodeStatus>,
    stats: RwLock<Option<Stats>>,
    events: EventSource<NodeEvent>,
}

impl Node {
    pub(crate) fn new(config: NodeConfig, pool_config: Arc<PoolConfig>) -> Self {
        Self {
            connection: Arc::new(Connection::new(&config, &pool_config)),
            http: Client::new(),
            status: watch::channel(NodeStatus::Disconnected).0,
            stats: RwLock::new(None),
            events: EventSource::new(),
            config,
            pool_config,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn region(&self) -> Option<&str> {
        self.config.region.as_deref()
    }

    pub fn status(&self) -> NodeStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<NodeStatus> {
        self.status.subscribe()
    }

    /// Whether the node can be routed to.
    pub fn is_available(&self) -> bool {
        self.status() == NodeStatus::Connected
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// The latest statistics reported by the node, if any arrived yet.
    pub fn stats(&self) -> Option<Stats> {
        self.stats.read().clone()
    }

    pub fn events(&self) -> &EventSource<NodeEvent> {
        &self.events
    }

    /// Scores how busy the node is; lower is better.
    ///
    /// The score weighs playing players, CPU load and missing frames, plus a
    /// penalty when the node's region differs from the hinted one. A node
    /// that hasn't reported statistics yet scores zero before penalties.
    pub fn load_score(&self, hints: &SelectionHints) -> f64 {
        let weights = &self.pool_config.load_weights;
        let mut score = self.stats.read().as_ref().map_or(0.0, |stats| {
            let missing = stats.frame_stats.as_ref().map_or(0, |frames| {
                frames.deficit.max(0) + frames.nulled.max(0)
            });

            f64::from(stats.playing_players) * weights.playing_players
                + stats.cpu.system_load * weights.cpu
                + missing as f64 * weights.frame_deficit
        });

        if let (Some(wanted), Some(region)) = (hints.region.as_deref(), self.region()) {
            if !wanted.eq_ignore_ascii_case(region) {
                score += weights.region_mismatch;
            }
        }

        score
    }

    pub(crate) fn connect(&self, events: UnboundedSender<ConnectionEvent>) {
        self.status.send_replace(NodeStatus::Connecting);
        self.connection.start(events);
    }

    /// Drops the current socket, if any, and opens a new one.
    pub(crate) async fn reconnect(&self, events: UnboundedSender<ConnectionEvent>) {
        self.status.send_replace(NodeStatus::Connecting);
        self.connection.restart(events).await;
    }

    /// Closes the WebSocket. The node stops being selectable.
    pub fn close(&self) {
        self.connection.close(1000, "Client closed");
        self.mark_unavailable(Error::NodeNotConnected(self.name().to_owned()));
    }

    pub(crate) fn update_stats(&self, stats: Stats) {
        trace!("[{}] Stats: {:?}", self.name(), stats);
        *self.stats.write() = Some(stats.clone());

        self.events.dispatch(&NodeEvent::Stats {
            node: self.name().to_owned(),
            stats,
        });
    }

    pub(crate) fn mark_ready(&self, ready: &Ready) {
        let previous = self.status.send_replace(NodeStatus::Connected);

        self.events.dispatch(&NodeEvent::Ready {
            node: self.name().to_owned(),
            session_id: ready.session_id.clone(),
            resumed: ready.resumed,
        });

        if previous != NodeStatus::Connected {
            info!("[{}] Node available (resumed: {})", self.name(), ready.resumed);

            self.events.dispatch(&NodeEvent::Available {
                node: self.name().to_owned(),
            });
        }
    }

    pub(crate) fn mark_reconnecting(&self, code: Option<u16>, reason: String) {
        self.status.send_if_modified(|status| {
            let reconnecting = *status == NodeStatus::Connected;

            if reconnecting {
                *status = NodeStatus::Connecting;
            }

            reconnecting
        });

        self.events.dispatch(&NodeEvent::Disconnected {
            node: self.name().to_owned(),
            code,
            reason,
        });
    }

    pub(crate) fn mark_unavailable(&self, error: Error) {
        let previous = self.status.send_replace(NodeStatus::Disconnected);

        if previous != NodeStatus::Disconnected {
            warn!("[{}] Node unavailable: {}", self.name(), error);

            self.events.dispatch(&NodeEvent::Unavailable {
                node: self.name().to_owned(),
                error: Arc::new(error),
            });
        }
    }

    /// Sends a command for a guild's player.
    ///
    /// Returns the player as held by the node when the command went over
    /// REST.
    pub(crate) async fn execute(&self, guild_id: u64, command: &Command) -> Result<Option<PlayerInfo>> {
        if let CommandTransport::Duplex { fallback_to_rest } = self.pool_config.command_transport {
            if self.connection.is_open() {
                self.connection.send(&command.to_outbound(guild_id))?;

                return Ok(None);
            }

            if !fallback_to_rest {
                return Err(Error::NodeNotConnected(self.name().to_owned()));
            }

            debug!("[{}] WebSocket is down, sending over REST", self.name());
        }

        let (update, no_replace) = command.to_update();

        self.update_player(guild_id, &update, no_replace).await.map(Some)
    }

    /// Retrieves the player of a guild, or `None` if the node has none.
    pub async fn get_player(&self, guild_id: u64) -> Result<Option<PlayerInfo>> {
        let path = self.player_path(guild_id)?;

        match self.request_json(Method::GET, &path, None::<&()>).await {
            Ok(player) => Ok(player),
            Err(Error::Rest { status: 404, .. }) => Ok(None),
            Err(why) => Err(why),
        }
    }

    /// Applies a partial update to a guild's player, creating it if needed.
    ///
    /// With `no_replace`, a track in the update is ignored when one is
    /// already playing.
    pub async fn update_player(
        &self,
        guild_id: u64,
        update: &UpdatePlayer,
        no_replace: bool,
    ) -> Result<PlayerInfo> {
        let path = format!("{}?noReplace={}", self.player_path(guild_id)?, no_replace);

        self.request_json(Method::PATCH, &path, Some(update))
            .await?
            .ok_or_else(|| Error::RemoteProtocol(format!("empty response to PATCH {}", path)))
    }

    /// Destroys a guild's player on the node.
    pub async fn destroy_player(&self, guild_id: u64) -> Result<()> {
        if let CommandTransport::Duplex { .. } = self.pool_config.command_transport {
            if self.connection.is_open() {
                return self.connection.send(&Outbound::Destroy {
                    guild_id: guild_id.to_string(),
                });
            }
        }

        let path = self.player_path(guild_id)?;

        match self.request(Method::DELETE, &path, None).await {
            Ok(_) | Err(Error::Rest { status: 404, .. }) => Ok(()),
            Err(why) => Err(why),
        }
    }

    /// Tells the node to keep the session alive for `timeout` after the
    /// WebSocket drops.
    pub(crate) async fn configure_resuming(&self, timeout: Duration) -> Result<()> {
        let path = format!("/v4/sessions/{}", self.encoded_session()?);
        let body = UpdateSession {
            resuming: true,
            timeout: timeout.as_secs(),
        };

        self.request_json::<Value>(Method::PATCH, &path, Some(&body)).await.map(|_| ())
    }

    /// Retrieves the status of the route planner, or `None` if the node has
    /// no route planner configured.
    pub async fn address_status_or_none(&self) -> Result<Option<RoutePlannerStatus>> {
        let json = self.request_json::<Value>(Method::GET, "/v4/routeplanner/status", None::<&()>).await?;

        match json {
            Some(json) if json.get("class").map_or(false, |class| !class.is_null()) => {
                serde_json::from_value(json).map(Some).map_err(From::from)
            },
            // An empty body or `{}` means no route planner is set.
            _ => Ok(None),
        }
    }

    /// Retrieves the status of the route planner.
    ///
    /// Resolves to [`Error::NoRoutePlanner`] if none is configured.
    ///
    /// [`Error::NoRoutePlanner`]: ../enum.Error.html#variant.NoRoutePlanner
    pub async fn address_status(&self) -> Result<RoutePlannerStatus> {
        self.address_status_or_none()
            .await?
            .ok_or_else(|| Error::NoRoutePlanner(self.name().to_owned()))
    }

    /// Unmarks a failed route planner address.
    pub async fn unmark_address(&self, address: &str) -> Result<()> {
        let body = serde_json::to_vec(&UnmarkAddress { address })?;

        self.request(Method::POST, "/v4/routeplanner/free/address", Some(body)).await.map(|_| ())
    }

    /// Unmarks all failed route planner addresses.
    pub async fn unmark_all_addresses(&self) -> Result<()> {
        self.request(Method::POST, "/v4/routeplanner/free/all", None).await.map(|_| ())
    }

    fn encoded_session(&self) -> Result<String> {
        let session_id = self.connection
            .session_id()
            .ok_or_else(|| Error::NodeNotConnected(self.name().to_owned()))?;

        Ok(utf8_percent_encode(&session_id, SEGMENT).to_string())
    }

    fn player_path(&self, guild_id: u64) -> Result<String> {
        Ok(format!("/v4/sessions/{}/players/{}", self.encoded_session()?, guild_id))
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&impl Serialize>,
    ) -> Result<Option<T>> {
        let body = body.map(serde_json::to_vec).transpose()?;

        match self.request(method, path, body).await? {
            Some(bytes) if !bytes.is_empty() => Ok(Some(serde_json::from_slice(&bytes)?)),
            _ => Ok(None),
        }
    }

    /// Performs a request against the node's REST API. Resolves to `None` on
    /// `204 No Content`.
    async fn request(&self, method: Method, path: &str, body: Option<Vec<u8>>) -> Result<Option<Bytes>> {
        let uri = format!("{}{}", self.config.http_host.trim_end_matches('/'), path);
        let mut builder = Request::builder()
            .method(method.clone())
            .uri(&uri)
            .header(AUTHORIZATION, self.config.password.as_str())
            .header("User-Id", self.pool_config.user_id.to_string())
            .header("Client-Name", self.pool_config.client_name.as_str());

        let body = match body {
            Some(json) => {
                builder = builder.header(CONTENT_TYPE, "application/json");

                Body::from(json)
            },
            None => Body::empty(),
        };
        let request = builder.body(body)?;

        debug!("[{}] {} {}", self.name(), method, path);

        let exchange = async {
            let response = self.http.request(request).await?;
            let status = response.status();
            let bytes = hyper::body::to_bytes(response.into_body()).await?;

            Ok::<_, Error>((status, bytes))
        };
        let (status, bytes) = time::timeout(self.pool_config.request_timeout, exchange)
            .await
            .map_err(|_| Error::Timeout)??;

        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        if !status.is_success() {
            return Err(Error::Rest {
                status: status.as_u16(),
                path: path.to_owned(),
                message: error_message(&bytes),
            });
        }

        Ok(Some(bytes))
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.config.name)
            .field("http_host", &self.config.http_host)
            .field("status", &self.status())
            .field("connection", &self.connection)
            .finish()
    }
}

fn error_message(body: &[u8]) -> String {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|json| json.get("message").and_then(Value::as_str).map(str::to_owned))
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned())
}
