//! Payloads exchanged with Lavalink nodes over the WebSocket and REST API.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::{Error, Result};

/// A message received over a node's WebSocket, keyed by its `op` field.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Inbound {
    /// Sent once a session is established or resumed.
    Ready(Ready),
    PlayerUpdate(PlayerUpdate),
    Stats(Stats),
    Event(RemoteEvent),
}

impl Inbound {
    /// Decodes a text frame, reporting unknown ops and malformed payloads as
    /// [`Error::RemoteProtocol`].
    ///
    /// [`Error::RemoteProtocol`]: ../enum.Error.html#variant.RemoteProtocol
    pub fn decode(text: &str) -> Result<Self> {
        let json = serde_json::from_str::<Value>(text)
            .map_err(|why| Error::RemoteProtocol(format!("invalid JSON: {}", why)))?;

        if json.get("op").and_then(Value::as_str).is_none() {
            return Err(Error::RemoteProtocol(format!("no opcode present in payload: {}", text)));
        }

        serde_json::from_value(json).map_err(|why| Error::RemoteProtocol(why.to_string()))
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ready {
    pub resumed: bool,
    pub session_id: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdate {
    pub guild_id: String,
    pub state: PlayerUpdateState,
}

/// The node's view of a player's position and voice connection.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct PlayerUpdateState {
    /// Unix timestamp in milliseconds.
    pub time: u64,
    /// Position of the track in milliseconds.
    pub position: u64,
    /// Whether the node is connected to the voice gateway.
    pub connected: bool,
    /// Round trip to the voice gateway in milliseconds, `-1` when unknown.
    pub ping: i64,
}

/// Aggregate load reported by a node roughly once a minute.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Stats {
    pub players: u32,
    pub playing_players: u32,
    /// Uptime in milliseconds.
    pub uptime: u64,
    pub memory: Memory,
    pub cpu: Cpu,
    pub frame_stats: Option<FrameStats>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Memory {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Cpu {
    pub cores: u32,
    pub system_load: f64,
    pub lavalink_load: f64,
}

/// Frames sent over the last minute. Absent until a player has been active.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct FrameStats {
    pub sent: i64,
    pub nulled: i64,
    pub deficit: i64,
}

/// A track or voice event, keyed by its `type` field.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum RemoteEvent {
    TrackStartEvent(TrackStart),
    TrackEndEvent(TrackEnd),
    TrackExceptionEvent(TrackException),
    TrackStuckEvent(TrackStuck),
    WebSocketClosedEvent(WebSocketClosed),
}

impl RemoteEvent {
    pub fn guild_id(&self) -> &str {
        match self {
            RemoteEvent::TrackStartEvent(e) => &e.guild_id,
            RemoteEvent::TrackEndEvent(e) => &e.guild_id,
            RemoteEvent::TrackExceptionEvent(e) => &e.guild_id,
            RemoteEvent::TrackStuckEvent(e) => &e.guild_id,
            RemoteEvent::WebSocketClosedEvent(e) => &e.guild_id,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackStart {
    pub guild_id: String,
    pub track: Track,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackEnd {
    pub guild_id: String,
    pub track: Track,
    pub reason: TrackEndReason,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

impl TrackEndReason {
    /// Whether the player moves on to another track, in which case the
    /// current track is not cleared.
    pub fn is_replaced(self) -> bool {
        self == TrackEndReason::Replaced
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackException {
    pub guild_id: String,
    pub track: Track,
    pub exception: Exception,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Exception {
    pub message: Option<String>,
    pub severity: String,
    pub cause: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackStuck {
    pub guild_id: String,
    pub track: Track,
    pub threshold_ms: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketClosed {
    pub guild_id: String,
    pub code: u16,
    pub reason: String,
    pub by_remote: bool,
}

/// A track as returned by the node. `encoded` is the opaque identifier used
/// to play it.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Track {
    pub encoded: String,
    #[serde(default)]
    pub info: TrackInfo,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TrackInfo {
    pub identifier: String,
    pub is_seekable: bool,
    pub author: String,
    pub length: u64,
    pub is_stream: bool,
    pub position: u64,
    pub title: String,
    pub uri: Option<String>,
    pub source_name: String,
}

/// Credentials for the voice gateway, as received from Discord's voice
/// server update and the bot's own voice state.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceState {
    pub token: String,
    pub endpoint: String,
    pub session_id: String,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Band {
    pub band: u8,
    pub gain: f32,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Filters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub equalizer: Option<Vec<Band>>,
}

/// A player as held by the node.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct PlayerInfo {
    pub guild_id: String,
    pub track: Option<Track>,
    pub volume: u16,
    pub paused: bool,
    pub state: PlayerUpdateState,
    pub voice: Option<VoiceState>,
    pub filters: Filters,
}

/// A partial update of a player, sent as `PATCH` body. Absent fields are
/// left untouched by the node.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlayer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<UpdateTrack>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Filters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceState>,
}

/// `encoded: None` serializes as `null`, which stops the player.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UpdateTrack {
    pub encoded: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct UpdateSession {
    pub resuming: bool,
    pub timeout: u64,
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct UnmarkAddress<'a> {
    pub address: &'a str,
}

/// Player commands sent over the WebSocket, keyed by `op`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Outbound {
    #[serde(rename_all = "camelCase")]
    VoiceUpdate {
        guild_id: String,
        session_id: String,
        event: VoiceServerEvent,
    },
    #[serde(rename_all = "camelCase")]
    Play {
        guild_id: String,
        track: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        start_time: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        end_time: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pause: Option<bool>,
        no_replace: bool,
    },
    #[serde(rename_all = "camelCase")]
    Stop { guild_id: String },
    #[serde(rename_all = "camelCase")]
    Pause { guild_id: String, pause: bool },
    #[serde(rename_all = "camelCase")]
    Seek { guild_id: String, position: u64 },
    #[serde(rename_all = "camelCase")]
    Volume { guild_id: String, volume: u16 },
    #[serde(rename_all = "camelCase")]
    Equalizer { guild_id: String, bands: Vec<Band> },
    #[serde(rename_all = "camelCase")]
    Destroy { guild_id: String },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VoiceServerEvent {
    pub guild_id: String,
    pub token: String,
    pub endpoint: String,
}

/// The state of a node's route planner.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RoutePlannerStatus {
    /// The planner implementation, such as `RotatingIpRoutePlanner`.
    pub class: String,
    pub details: RoutePlannerDetails,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RoutePlannerDetails {
    pub ip_block: IpBlock,
    pub failing_addresses: Vec<FailingAddress>,
    pub rotate_index: Option<String>,
    pub ip_index: Option<String>,
    pub current_address: Option<String>,
    pub current_address_index: Option<String>,
    pub block_index: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct IpBlock {
    #[serde(rename = "type")]
    pub kind: String,
    pub size: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct FailingAddress {
    pub failing_address: String,
    pub failing_timestamp: u64,
    pub failing_time: String,
}

/// Parses a guild ID as sent by the node.
pub(crate) fn parse_guild_id(raw: &str) -> Result<u64> {
    raw.parse()
        .map_err(|_| Error::RemoteProtocol(format!("invalid guild id {:?}", raw)))
}
