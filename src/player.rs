//! The local view of a guild's audio player.
//!
//! Two writers touch a player: commands issued through its [`Link`], which
//! update it optimistically, and messages pushed by the node, which are
//! authoritative and overwrite whatever was set locally.
//!
//! [`Link`]: ../link/struct.Link.html

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use crate::model::{Band, PlayerInfo, PlayerUpdateState, TrackEndReason};
use crate::{Error, Result};

pub const MAX_VOLUME: u16 = 1000;
pub const DEFAULT_VOLUME: u16 = 100;
pub const BAND_COUNT: u8 = 15;
pub const MIN_GAIN: f32 = -0.25;
pub const MAX_GAIN: f32 = 1.0;

/// Who wrote the player state last.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StateSource {
    /// A command issued locally that the node hasn't confirmed yet.
    Local,
    /// A message pushed by the node.
    Remote,
}

/// The state of a player at one point in time.
#[derive(Clone, Debug, PartialEq)]
pub struct PlayerState {
    /// The encoded track being played.
    pub track: Option<String>,
    pub paused: bool,
    /// The volume setting, on a scale of 0 to 1000.
    pub volume: u16,
    /// Equalizer gains keyed by band.
    pub equalizers: BTreeMap<u8, f32>,
    /// Whether the node reported being connected to the voice gateway.
    pub voice_connected: bool,
    pub source: StateSource,
    position: Duration,
    updated_at: Instant,
}

impl PlayerState {
    fn new() -> Self {
        Self {
            track: None,
            paused: false,
            volume: DEFAULT_VOLUME,
            equalizers: BTreeMap::new(),
            voice_connected: false,
            source: StateSource::Local,
            position: Duration::ZERO,
            updated_at: Instant::now(),
        }
    }

    /// The estimated position, extrapolated from the last update while a
    /// track is playing.
    pub fn position(&self) -> Duration {
        match self.track {
            None => Duration::ZERO,
            Some(_) if self.paused => self.position,
            Some(_) => self.position + self.updated_at.elapsed(),
        }
    }

    fn set_position(&mut self, position: Duration) {
        self.position = position;
        self.updated_at = Instant::now();
    }
}

/// The parts of a player that are re-applied when a link moves between
/// nodes.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub track: Option<String>,
    pub position: Duration,
    pub paused: bool,
    pub volume: u16,
    pub equalizers: BTreeMap<u8, f32>,
}

impl Snapshot {
    pub fn bands(&self) -> Vec<Band> {
        bands(&self.equalizers)
    }
}

/// An optimistic change made by a command.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Change {
    Play {
        track: String,
        position: Duration,
        paused: Option<bool>,
    },
    Stop,
    Pause(bool),
    Seek(Duration),
    Volume(u16),
    Equalizer(Vec<Band>),
    ResetEqualizer,
}

/// A local write that can be undone if the command carrying it fails.
#[derive(Debug)]
pub(crate) struct Provisional {
    previous: PlayerState,
    revision: u64,
}

#[derive(Debug)]
struct Cell {
    state: PlayerState,
    revision: u64,
}

impl Cell {
    fn touch(&mut self, source: StateSource) -> &mut PlayerState {
        self.revision += 1;
        self.state.source = source;

        &mut self.state
    }
}

/// A struct containing the state of a guild's audio player.
#[derive(Debug)]
pub struct Player {
    guild_id: u64,
    cell: RwLock<Cell>,
}

impl Player {
    pub fn new(guild_id: u64) -> Self {
        Self {
            guild_id,
            cell: RwLock::new(Cell {
                state: PlayerState::new(),
                revision: 0,
            }),
        }
    }

    /// The ID of the guild that the player represents.
    pub fn guild_id(&self) -> u64 {
        self.guild_id
    }

    pub fn state(&self) -> PlayerState {
        self.cell.read().state.clone()
    }

    pub fn track(&self) -> Option<String> {
        self.cell.read().state.track.clone()
    }

    pub fn paused(&self) -> bool {
        self.cell.read().state.paused
    }

    pub fn volume(&self) -> u16 {
        self.cell.read().state.volume
    }

    /// The estimated position of the current track. Zero when nothing is
    /// playing.
    pub fn position(&self) -> Duration {
        self.cell.read().state.position()
    }

    /// The estimated position in milliseconds.
    pub fn position_ms(&self) -> u64 {
        self.position().as_millis() as u64
    }

    pub fn equalizers(&self) -> BTreeMap<u8, f32> {
        self.cell.read().state.equalizers.clone()
    }

    pub fn source(&self) -> StateSource {
        self.cell.read().state.source
    }

    pub fn voice_connected(&self) -> bool {
        self.cell.read().state.voice_connected
    }

    pub fn snapshot(&self) -> Snapshot {
        let cell = self.cell.read();

        Snapshot {
            track: cell.state.track.clone(),
            position: cell.state.position(),
            paused: cell.state.paused,
            volume: cell.state.volume,
            equalizers: cell.state.equalizers.clone(),
        }
    }

    pub(crate) fn apply_local(&self, change: &Change) -> Provisional {
        let mut cell = self.cell.write();
        let previous = cell.state.clone();
        let state = cell.touch(StateSource::Local);

        match change {
            Change::Play { track, position, paused } => {
                state.track = Some(track.clone());
                state.set_position(*position);

                if let Some(paused) = paused {
                    state.paused = *paused;
                }
            },
            Change::Stop => {
                state.track = None;
                state.set_position(Duration::ZERO);
            },
            Change::Pause(paused) => {
                let position = state.position();
                state.set_position(position);
                state.paused = *paused;
            },
            Change::Seek(position) => state.set_position(*position),
            Change::Volume(volume) => state.volume = *volume,
            Change::Equalizer(bands) => {
                for band in bands {
                    state.equalizers.insert(band.band, band.gain);
                }
            },
            Change::ResetEqualizer => state.equalizers.clear(),
        }

        Provisional {
            previous,
            revision: cell.revision,
        }
    }

    /// Undoes a local write, unless something else wrote since.
    pub(crate) fn rollback(&self, provisional: Provisional) -> bool {
        let mut cell = self.cell.write();

        if cell.revision != provisional.revision {
            return false;
        }

        cell.state = provisional.previous;
        cell.revision += 1;

        true
    }

    /// Applies a position update pushed by the node.
    pub(crate) fn apply_update(&self, update: &PlayerUpdateState) {
        let mut cell = self.cell.write();
        let state = cell.touch(StateSource::Remote);

        state.set_position(Duration::from_millis(update.position));
        state.voice_connected = update.connected;
    }

    /// Overwrites the state with the player held by the node.
    pub(crate) fn apply_info(&self, info: &PlayerInfo) {
        let mut cell = self.cell.write();
        let state = cell.touch(StateSource::Remote);

        state.track = info.track.as_ref().map(|track| track.encoded.clone());
        state.paused = info.paused;
        state.volume = info.volume;
        state.voice_connected = info.state.connected;
        state.set_position(Duration::from_millis(info.state.position));

        if let Some(bands) = &info.filters.equalizer {
            state.equalizers = bands.iter().map(|band| (band.band, band.gain)).collect();
        }
    }

    pub(crate) fn track_started(&self, encoded: &str) {
        let mut cell = self.cell.write();
        let state = cell.touch(StateSource::Remote);

        state.track = Some(encoded.to_owned());
        state.set_position(Duration::ZERO);
    }

    pub(crate) fn track_ended(&self, encoded: &str, reason: TrackEndReason) {
        let mut cell = self.cell.write();

        // A replaced track is followed by the start of the new one, and a
        // late end event must not clear a track started since.
        if reason.is_replaced() || cell.state.track.as_deref() != Some(encoded) {
            return;
        }

        let state = cell.touch(StateSource::Remote);
        state.track = None;
        state.set_position(Duration::ZERO);
    }

    /// Restores a snapshot after it was replayed on another node.
    pub(crate) fn restore(&self, snapshot: &Snapshot) {
        let mut cell = self.cell.write();
        let state = cell.touch(StateSource::Local);

        state.track = snapshot.track.clone();
        state.paused = snapshot.paused;
        state.volume = snapshot.volume;
        state.equalizers = snapshot.equalizers.clone();
        state.set_position(snapshot.position);
    }

    pub(crate) fn set_voice_connected(&self, connected: bool) {
        self.cell.write().state.voice_connected = connected;
    }

    pub(crate) fn reset(&self) {
        let mut cell = self.cell.write();
        cell.revision += 1;
        cell.state = PlayerState::new();
    }
}

pub fn validate_volume(volume: u16) -> Result<()> {
    if volume > MAX_VOLUME {
        return Err(Error::invalid("volume", format!("{} exceeds {}", volume, MAX_VOLUME)));
    }

    Ok(())
}

/// Checks the band index and clamps the gain into the accepted range.
pub fn equalizer_band(band: u8, gain: f32) -> Result<Band> {
    if band >= BAND_COUNT {
        return Err(Error::invalid("band", format!("{} is not in 0..{}", band, BAND_COUNT)));
    }

    if gain.is_nan() {
        return Err(Error::invalid("gain", "NaN"));
    }

    Ok(Band {
        band,
        gain: gain.clamp(MIN_GAIN, MAX_GAIN),
    })
}

pub(crate) fn bands(equalizers: &BTreeMap<u8, f32>) -> Vec<Band> {
    equalizers
        .iter()
        .map(|(&band, &gain)| Band { band, gain })
        .collect()
}
