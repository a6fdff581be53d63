//! Links: one voice session per guild, bound to one node at a time.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use parking_lot::RwLock;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::time;
use crate::config::{MigrationCommandPolicy, PoolConfig};
use crate::event_handler::{EventSource, LinkEvent};
use crate::model::{PlayerUpdateState, RemoteEvent, RoutePlannerStatus, VoiceState};
use crate::nodes::{Command, Node, SelectionHints, Shared};
use crate::player::{self, Change, Player, Snapshot};
use crate::{Error, Result};

/// The lifecycle of a link's voice connection.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum LinkState {
    NotConnected,
    /// Voice credentials were sent to a node, waiting for it to join.
    Connecting,
    Connected,
    /// Destroyed, or moving to another node failed.
    Disconnected,
}

/// The voice server credentials a node needs to join a voice channel.
pub type VoiceServerUpdate = VoiceState;

/// Options for starting a track.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlayOptions {
    /// The encoded track.
    pub track: String,
    pub start: Option<Duration>,
    pub end: Option<Duration>,
    /// Pause or unpause along with starting the track.
    pub paused: Option<bool>,
    /// Leave the current track playing if there is one.
    pub no_replace: bool,
}

impl PlayOptions {
    pub fn new(track: impl Into<String>) -> Self {
        Self {
            track: track.into(),
            ..Default::default()
        }
    }
}

/// A guild's voice session.
///
/// Commands issued on a link are applied one at a time in the order they
/// were issued, and update the [`Player`] optimistically until the node
/// reports otherwise. When the node goes away the link moves to another one
/// and replays its player state there.
///
/// [`Player`]: ../player/struct.Player.html
pub struct Link {
    guild_id: u64,
    pool: Weak<Shared>,
    config: Arc<PoolConfig>,
    node: RwLock<Option<Arc<Node>>>,
    state: watch::Sender<LinkState>,
    voice: RwLock<Option<VoiceState>>,
    player: Player,
    gate: Mutex<()>,
    migrations: AtomicUsize,
    migration_epoch: AtomicU64,
    destroyed: AtomicBool,
    events: EventSource<LinkEvent>,
}

impl Link {
    pub(crate) fn new(guild_id: u64, pool: Weak<Shared>, config: Arc<PoolConfig>) -> Self {
        Self {
            guild_id,
            pool,
            config,
            node: RwLock::new(None),
            state: watch::channel(LinkState::NotConnected).0,
            voice: RwLock::new(None),
            player: Player::new(guild_id),
            gate: Mutex::new(()),
            migrations: AtomicUsize::new(0),
            migration_epoch: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
            events: EventSource::new(),
        }
    }

    pub fn guild_id(&self) -> u64 {
        self.guild_id
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// The node the link is currently bound to.
    pub fn node(&self) -> Option<Arc<Node>> {
        self.node.read().clone()
    }

    pub fn player(&self) -> &Player {
        &self.player
    }

    pub fn events(&self) -> &EventSource<LinkEvent> {
        &self.events
    }

    pub fn is_migrating(&self) -> bool {
        self.migrations.load(Ordering::Acquire) > 0
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Joins the voice channel described by the credentials.
    ///
    /// A node is selected from the pool unless the link is already bound to
    /// an available one. Resolves once the node reports being connected, or
    /// to [`Error::LinkConnection`] when it doesn't within the configured
    /// timeout.
    ///
    /// [`Error::LinkConnection`]: ../enum.Error.html#variant.LinkConnection
    pub async fn connect(&self, voice: VoiceServerUpdate) -> Result<()> {
        let _gate = self.acquire().await?;
        *self.voice.write() = Some(voice.clone());

        let node = match self.node() {
            Some(node) if node.is_available() => node,
            _ => self.shared()?.select_node(&HashSet::new(), &self.hints())?,
        };
        self.bind(Some(Arc::clone(&node)));

        self.join(&node, &voice).await.map_err(|why| {
            self.set_state(LinkState::NotConnected);
            why
        })
    }

    /// Plays an encoded track from the start.
    pub async fn play(&self, track: impl Into<String>) -> Result<()> {
        self.play_with(PlayOptions::new(track)).await
    }

    pub async fn play_with(&self, options: PlayOptions) -> Result<()> {
        if let (Some(start), Some(end)) = (options.start, options.end) {
            if end <= start {
                return Err(Error::invalid("end", "must be after start"));
            }
        }

        let keeps_current = options.no_replace && self.player.track().is_some();
        let change = Change::Play {
            track: options.track.clone(),
            position: options.start.unwrap_or_default(),
            paused: options.paused,
        };
        let command = Command::Play {
            track: options.track,
            start: options.start.map(millis),
            end: options.end.map(millis),
            paused: options.paused,
            no_replace: options.no_replace,
        };

        self.command((!keeps_current).then_some(change), command).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.command(Some(Change::Stop), Command::Stop).await
    }

    /// Pauses or unpauses playback.
    pub async fn pause(&self, paused: bool) -> Result<()> {
        self.command(Some(Change::Pause(paused)), Command::Pause(paused)).await
    }

    pub async fn unpause(&self) -> Result<()> {
        self.pause(false).await
    }

    /// Seeks the current track to the given position.
    pub async fn seek(&self, position: Duration) -> Result<()> {
        self.command(Some(Change::Seek(position)), Command::Seek(millis(position))).await
    }

    /// Sets the volume, on a scale of 0 to 1000.
    pub async fn set_volume(&self, volume: u16) -> Result<()> {
        player::validate_volume(volume)?;

        self.command(Some(Change::Volume(volume)), Command::Volume(volume)).await
    }

    /// Sets the gain of one equalizer band, 0 to 14. The gain is clamped to
    /// -0.25..=1.0.
    pub async fn set_equalizer(&self, band: u8, gain: f32) -> Result<()> {
        self.set_equalizers([(band, gain)]).await
    }

    pub async fn set_equalizers(&self, gains: impl IntoIterator<Item = (u8, f32)>) -> Result<()> {
        let bands = gains
            .into_iter()
            .map(|(band, gain)| player::equalizer_band(band, gain))
            .collect::<Result<Vec<_>>>()?;

        let mut equalizers = self.player.equalizers();
        for band in &bands {
            equalizers.insert(band.band, band.gain);
        }

        let command = Command::Equalizer(player::bands(&equalizers));

        self.command(Some(Change::Equalizer(bands)), command).await
    }

    pub async fn reset_equalizers(&self) -> Result<()> {
        self.command(Some(Change::ResetEqualizer), Command::Equalizer(Vec::new())).await
    }

    /// Destroys the player on the node and unregisters the link from its
    /// pool. Calling this again does nothing.
    ///
    /// Local teardown always happens; an error from the node is returned
    /// afterwards.
    pub async fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let _gate = self.gate.lock().await;
        let node = self.node.write().take();
        let result = match node {
            Some(node) if node.is_available() => node.destroy_player(self.guild_id).await,
            _ => Ok(()),
        };

        self.voice.write().take();
        self.player.reset();
        self.set_state(LinkState::Disconnected);

        if let Some(pool) = self.pool.upgrade() {
            pool.forget_link(self);
        }

        if let Err(why) = &result {
            warn!("[{}] Failed to destroy remote player: {}", self.guild_id, why);
        }

        result
    }

    /// Moves the link to the named node, replaying the player there.
    pub async fn migrate_to(&self, node: &str) -> Result<()> {
        let target = self.shared()?
            .node(node)
            .ok_or_else(|| Error::NodeNotFound(node.to_owned()))?;

        if !target.is_available() {
            return Err(Error::NodeNotConnected(node.to_owned()));
        }

        self.migrate(None, Some(target)).await
    }

    /// Retrieves the route planner status of the link's node, or `None` if
    /// it has none configured.
    pub async fn address_status_or_none(&self) -> Result<Option<RoutePlannerStatus>> {
        self.bound_node()?.address_status_or_none().await
    }

    pub async fn address_status(&self) -> Result<RoutePlannerStatus> {
        self.bound_node()?.address_status().await
    }

    pub async fn unmark_address(&self, address: &str) -> Result<()> {
        self.bound_node()?.unmark_address(address).await
    }

    pub async fn unmark_all_addresses(&self) -> Result<()> {
        self.bound_node()?.unmark_all_addresses().await
    }

    /// Moves away from a node that became unavailable.
    pub(crate) async fn migrate_from(&self, failed: Arc<Node>) -> Result<()> {
        self.migrate(Some(failed), None).await
    }

    /// Re-establishes the player on the same node after its session was
    /// lost, moving elsewhere if that fails.
    pub(crate) async fn resync(&self, node: Arc<Node>) {
        let result = async {
            let _gate = self.gate.lock().await;

            if self.is_destroyed() || !self.is_bound_to(&node) {
                return Ok(());
            }

            info!("[{}] Re-syncing player on {}", self.guild_id, node.name());

            let snapshot = self.player.snapshot();
            let voice = self.voice.read().clone();

            if let Some(voice) = voice {
                self.join(&node, &voice).await?;
            }

            self.reapply(&node, &snapshot).await;

            Ok::<_, Error>(())
        }.await;

        if let Err(why) = result {
            warn!("[{}] Re-sync on {} failed: {}", self.guild_id, node.name(), why);

            let _ = self.migrate(Some(node), None).await;
        }
    }

    pub(crate) fn handle_player_update(&self, state: PlayerUpdateState) {
        self.player.apply_update(&state);

        if state.connected && self.state() == LinkState::Connecting {
            self.set_state(LinkState::Connected);
        }

        self.events.dispatch(&LinkEvent::PlayerUpdate {
            guild_id: self.guild_id,
            state,
        });
    }

    pub(crate) fn handle_event(&self, event: RemoteEvent) {
        let guild_id = self.guild_id;
        let event = match event {
            RemoteEvent::TrackStartEvent(e) => {
                self.player.track_started(&e.track.encoded);

                LinkEvent::TrackStart { guild_id, track: e.track }
            },
            RemoteEvent::TrackEndEvent(e) => {
                self.player.track_ended(&e.track.encoded, e.reason);

                LinkEvent::TrackEnd { guild_id, track: e.track, reason: e.reason }
            },
            RemoteEvent::TrackExceptionEvent(e) => LinkEvent::TrackException {
                guild_id,
                track: e.track,
                exception: e.exception,
            },
            RemoteEvent::TrackStuckEvent(e) => LinkEvent::TrackStuck {
                guild_id,
                track: e.track,
                threshold_ms: e.threshold_ms,
            },
            RemoteEvent::WebSocketClosedEvent(e) => {
                self.player.set_voice_connected(false);

                LinkEvent::WebSocketClosed {
                    guild_id,
                    code: e.code,
                    reason: e.reason,
                    by_remote: e.by_remote,
                }
            },
        };

        self.events.dispatch(&event);
    }

    pub(crate) fn is_bound_to(&self, node: &Node) -> bool {
        self.node.read().as_deref().map_or(false, |bound| std::ptr::eq(bound, node))
    }

    async fn command(&self, change: Option<Change>, command: Command) -> Result<()> {
        let _gate = self.acquire().await?;
        let node = self.bound_node()?;
        let provisional = change.map(|change| self.player.apply_local(&change));

        match node.execute(self.guild_id, &command).await {
            Ok(Some(info)) => {
                self.player.apply_info(&info);

                Ok(())
            },
            Ok(None) => Ok(()),
            Err(why) => {
                if let Some(provisional) = provisional {
                    self.player.rollback(provisional);
                }

                Err(why)
            },
        }
    }

    /// Waits for the link's turn to issue a command.
    async fn acquire(&self) -> Result<MutexGuard<'_, ()>> {
        let epoch = self.migration_epoch.load(Ordering::Acquire);
        let fail_fast = self.config.migration_commands == MigrationCommandPolicy::Fail;

        if self.is_destroyed() {
            return Err(Error::LinkDestroyed(self.guild_id));
        }

        if fail_fast && self.is_migrating() {
            return Err(Error::LinkMigrating(self.guild_id));
        }

        let gate = self.gate.lock().await;

        if self.is_destroyed() {
            return Err(Error::LinkDestroyed(self.guild_id));
        }

        // A migration started while waiting has completed by now; under the
        // fail policy the command must not be applied to the new node.
        if fail_fast && self.migration_epoch.load(Ordering::Acquire) != epoch {
            return Err(Error::LinkMigrating(self.guild_id));
        }

        Ok(gate)
    }

    async fn migrate(&self, failed: Option<Arc<Node>>, target: Option<Arc<Node>>) -> Result<()> {
        self.migration_epoch.fetch_add(1, Ordering::AcqRel);
        let _migrating = Migrating::enter(&self.migrations);

        self.migrate_locked(failed, target).await
    }

    async fn migrate_locked(&self, failed: Option<Arc<Node>>, target: Option<Arc<Node>>) -> Result<()> {
        let _gate = self.gate.lock().await;

        if self.is_destroyed() {
            return Ok(());
        }

        if let Some(failed) = &failed {
            if !self.is_bound_to(failed) {
                debug!("[{}] Already moved off {}", self.guild_id, failed.name());

                return Ok(());
            }
        }

        let previous = self.node();
        let previous_state = self.state();
        let from = previous.as_ref().map(|node| node.name().to_owned());
        let snapshot = self.player.snapshot();
        let voice = self.voice.read().clone();
        let hints = self.hints();
        let mut excluded = HashSet::new();

        if let Some(failed) = &failed {
            excluded.insert(failed.name().to_owned());
        }

        info!("[{}] Migrating from {:?}", self.guild_id, from);

        let outcome = loop {
            let node = match &target {
                Some(target) if excluded.contains(target.name()) => {
                    break Err(Error::NodeNotConnected(target.name().to_owned()));
                },
                Some(target) => Arc::clone(target),
                None => match self.shared().and_then(|pool| pool.select_node(&excluded, &hints)) {
                    Ok(node) => node,
                    Err(why) => break Err(why),
                },
            };

            self.bind(Some(Arc::clone(&node)));

            let candidate = Candidate {
                link: self,
                node: Arc::clone(&node),
                // Only an explicit move has a healthy node to fall back to.
                previous: previous.clone().filter(|_| failed.is_none()),
                state: previous_state,
                voice_connected: self.player.voice_connected(),
                settled: false,
            };

            if let Some(voice) = &voice {
                if let Err(why) = self.join(&node, voice).await {
                    warn!("[{}] Joining voice on {} failed: {}", self.guild_id, node.name(), why);
                    excluded.insert(node.name().to_owned());
                    candidate.abandon().await;

                    continue;
                }
            }

            self.reapply(&node, &snapshot).await;
            candidate.settle();

            break Ok(node);
        };

        match outcome {
            Ok(node) => {
                if let Some(previous) = previous.filter(|previous| failed.is_none() && !Arc::ptr_eq(previous, &node)) {
                    if previous.is_available() {
                        if let Err(why) = previous.destroy_player(self.guild_id).await {
                            warn!("[{}] Failed to clean up player on {}: {}", self.guild_id, previous.name(), why);
                        }
                    }
                }

                info!("[{}] Migrated to {}", self.guild_id, node.name());

                self.events.dispatch(&LinkEvent::Migrated {
                    guild_id: self.guild_id,
                    from,
                    to: node.name().to_owned(),
                });

                Ok(())
            },
            Err(why) => {
                error!("[{}] Migration failed: {}", self.guild_id, why);

                self.bind(None);
                self.set_state(LinkState::Disconnected);

                let reason = why.to_string();
                self.events.dispatch(&LinkEvent::MigrationFailed {
                    guild_id: self.guild_id,
                    error: Arc::new(why),
                });

                Err(Error::LinkConnection {
                    guild_id: self.guild_id,
                    reason,
                })
            },
        }
    }

    /// Sends the voice credentials and waits for the node to report the
    /// voice connection.
    async fn join(&self, node: &Node, voice: &VoiceState) -> Result<()> {
        let mut state = self.state.subscribe();

        self.player.set_voice_connected(false);
        self.set_state(LinkState::Connecting);

        let info = node.execute(self.guild_id, &Command::Voice(voice.clone())).await?;

        if info.map_or(false, |info| info.state.connected) {
            self.set_state(LinkState::Connected);
        }

        let timeout = self.config.link_connect_timeout;
        let connected = state.wait_for(|state| *state == LinkState::Connected);
        let joined = time::timeout(timeout, connected)
            .await
            .map_or(false, |result| result.is_ok());

        if !joined {
            return Err(Error::LinkConnection {
                guild_id: self.guild_id,
                reason: format!("{} did not join voice within {:?}", node.name(), timeout),
            });
        }

        Ok(())
    }

    /// Replays a snapshot on a node. Each step is retried, and steps that
    /// keep failing are skipped and left out of the local player.
    async fn reapply(&self, node: &Node, snapshot: &Snapshot) {
        type Forget = fn(&mut Snapshot);

        let mut steps: Vec<(&str, Command, Forget)> = Vec::new();

        match &snapshot.track {
            Some(track) => steps.push(("track", Command::Play {
                track: track.clone(),
                start: Some(millis(snapshot.position)),
                end: None,
                paused: Some(snapshot.paused),
                no_replace: false,
            }, |restored: &mut Snapshot| {
                restored.track = None;
                restored.position = Duration::ZERO;
                restored.paused = false;
            })),
            None => steps.push(("pause", Command::Pause(snapshot.paused), |restored: &mut Snapshot| restored.paused = false)),
        }

        steps.push(("volume", Command::Volume(snapshot.volume), |restored: &mut Snapshot| {
            restored.volume = player::DEFAULT_VOLUME;
        }));

        if !snapshot.equalizers.is_empty() {
            steps.push(("equalizer", Command::Equalizer(snapshot.bands()), |restored: &mut Snapshot| {
                restored.equalizers.clear();
            }));
        }

        let attempts = self.config.reapply_attempts.max(1);
        let mut restored = snapshot.clone();
        let mut latest = None;

        for (step, command, forget) in steps {
            let mut applied = false;

            for attempt in 1..=attempts {
                match node.execute(self.guild_id, &command).await {
                    Ok(info) => {
                        latest = info.or(latest);
                        applied = true;

                        break;
                    },
                    Err(why) if attempt < attempts => {
                        debug!("[{}] Re-applying {} failed (attempt {}): {}", self.guild_id, step, attempt, why);
                    },
                    Err(why) => {
                        warn!("[{}] Giving up re-applying {} on {}: {}", self.guild_id, step, node.name(), why);
                    },
                }
            }

            if !applied {
                forget(&mut restored);
            }
        }

        self.player.restore(&restored);

        if let Some(info) = latest {
            self.player.apply_info(&info);
        }
    }

    fn bind(&self, node: Option<Arc<Node>>) {
        *self.node.write() = node;
    }

    fn bound_node(&self) -> Result<Arc<Node>> {
        self.node().ok_or(Error::LinkNotConnected(self.guild_id))
    }

    fn shared(&self) -> Result<Arc<Shared>> {
        self.pool.upgrade().ok_or(Error::NoNodesAvailable)
    }

    fn hints(&self) -> SelectionHints {
        self.voice
            .read()
            .as_ref()
            .map(|voice| SelectionHints::from_endpoint(&voice.endpoint))
            .unwrap_or_default()
    }

    fn set_state(&self, state: LinkState) {
        if self.state.send_replace(state) != state {
            self.events.dispatch(&LinkEvent::StateChanged {
                guild_id: self.guild_id,
                state,
            });
        }
    }
}

/// Counts a link as migrating for as long as it is held.
struct Migrating<'a>(&'a AtomicUsize);

impl<'a> Migrating<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::AcqRel);

        Migrating(count)
    }
}

impl Drop for Migrating<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A node a migrating link was bound to before it joined voice and received
/// the player state there.
///
/// Dropping it unsettled, as when the migration is cancelled part-way,
/// binds the link back to the node it was moved off of (or unbinds it) and
/// removes the player from the candidate in the background.
struct Candidate<'a> {
    link: &'a Link,
    node: Arc<Node>,
    previous: Option<Arc<Node>>,
    state: LinkState,
    voice_connected: bool,
    settled: bool,
}

impl Candidate<'_> {
    fn settle(mut self) {
        self.settled = true;
    }

    /// Removes the player from a candidate that failed to join.
    async fn abandon(mut self) {
        if self.is_fresh() && self.node.is_available() {
            if let Err(why) = self.node.destroy_player(self.link.guild_id).await {
                warn!("[{}] Failed to clean up player on {}: {}", self.link.guild_id, self.node.name(), why);
            }
        }

        self.settled = true;
    }

    fn is_fresh(&self) -> bool {
        self.previous.as_ref().map_or(true, |previous| !Arc::ptr_eq(previous, &self.node))
    }
}

impl Drop for Candidate<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        let link = self.link;

        warn!("[{}] Migration to {} was cancelled", link.guild_id, self.node.name());

        match self.previous.clone().filter(|previous| previous.is_available()) {
            Some(previous) => {
                link.bind(Some(previous));
                link.player.set_voice_connected(self.voice_connected);
                link.set_state(self.state);
            },
            None => {
                link.bind(None);
                link.set_state(LinkState::Disconnected);
            },
        }

        if !self.is_fresh() {
            return;
        }

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let node = Arc::clone(&self.node);
            let guild_id = link.guild_id;

            runtime.spawn(async move {
                if let Err(why) = node.destroy_player(guild_id).await {
                    warn!("[{}] Failed to clean up player on {}: {}", guild_id, node.name(), why);
                }
            });
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("guild_id", &self.guild_id)
            .field("state", &self.state())
            .field("node", &self.node().map(|node| node.name().to_owned()))
            .field("migrating", &self.is_migrating())
            .finish()
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}
