//! Typed events emitted by links and nodes, and the fan-out that delivers
//! them to registered handlers.

use parking_lot::RwLock;
use std::error::Error as StdError;
use std::fmt::Debug;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use crate::link::LinkState;
use crate::model::{Exception, PlayerUpdateState, Stats, Track, TrackEndReason};
use crate::Error;

/// Error returned by a handler. It is logged and does not affect delivery to
/// other handlers.
pub type HandlerError = Box<dyn StdError + Send + Sync>;

/// An event type that can be filtered by kind.
pub trait Event: Clone + Debug + Send + Sync + 'static {
    type Kind: Copy + Debug + Eq + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

pub trait EventHandler<E: Event>: Send + Sync {
    /// Tymethod called for each event the handler subscribed to.
    fn on_event(&self, event: &E) -> Result<(), HandlerError>;
}

impl<E, F> EventHandler<E> for F
where
    E: Event,
    F: Fn(&E) -> Result<(), HandlerError> + Send + Sync,
{
    fn on_event(&self, event: &E) -> Result<(), HandlerError> {
        self(event)
    }
}

/// Identifies a subscription so it can be removed again.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ListenerId(u64);

enum Sink<E: Event> {
    Handler(Arc<dyn EventHandler<E>>),
    Channel(UnboundedSender<E>),
}

impl<E: Event> Clone for Sink<E> {
    fn clone(&self) -> Self {
        match self {
            Sink::Handler(handler) => Sink::Handler(Arc::clone(handler)),
            Sink::Channel(tx) => Sink::Channel(tx.clone()),
        }
    }
}

struct Listener<E: Event> {
    id: ListenerId,
    kinds: Option<Vec<E::Kind>>,
    sink: Sink<E>,
}

impl<E: Event> Listener<E> {
    fn wants(&self, kind: E::Kind) -> bool {
        self.kinds.as_ref().map_or(true, |kinds| kinds.contains(&kind))
    }
}

/// Delivers events to handlers in the order they are emitted.
///
/// Handlers run synchronously on the emitting task, so they should hand long
/// work off elsewhere; [`subscribe_channel`] does that for async consumers.
///
/// [`subscribe_channel`]: #method.subscribe_channel
pub struct EventSource<E: Event> {
    listeners: RwLock<Vec<Listener<E>>>,
    next_id: AtomicU64,
}

impl<E: Event> Default for EventSource<E> {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<E: Event> Debug for EventSource<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSource")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl<E: Event> EventSource<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for every event.
    pub fn subscribe(&self, handler: impl EventHandler<E> + 'static) -> ListenerId {
        self.register(None, Sink::Handler(Arc::new(handler)))
    }

    /// Registers a handler for the given kinds of events only.
    pub fn subscribe_to(
        &self,
        kinds: impl IntoIterator<Item = E::Kind>,
        handler: impl EventHandler<E> + 'static,
    ) -> ListenerId {
        self.register(Some(kinds.into_iter().collect()), Sink::Handler(Arc::new(handler)))
    }

    /// Queues matching events into a channel. The subscription ends once the
    /// receiver is dropped.
    pub fn subscribe_channel(
        &self,
        kinds: Option<Vec<E::Kind>>,
    ) -> UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.register(kinds, Sink::Channel(tx));

        rx
    }

    /// Removes a handler. Returns whether it was registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|listener| listener.id != id);

        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Delivers the event to every interested handler. A handler that errors
    /// or panics is logged and skipped.
    pub fn dispatch(&self, event: &E) {
        let kind = event.kind();
        let sinks = self.listeners
            .read()
            .iter()
            .filter(|listener| listener.wants(kind))
            .map(|listener| (listener.id, listener.sink.clone()))
            .collect::<Vec<_>>();
        let mut closed = Vec::new();

        for (id, sink) in sinks {
            match sink {
                Sink::Handler(handler) => {
                    match panic::catch_unwind(AssertUnwindSafe(|| handler.on_event(event))) {
                        Ok(Ok(())) => {},
                        Ok(Err(why)) => warn!("Handler {:?} failed on {:?}: {}", id, kind, why),
                        Err(_) => error!("Handler {:?} panicked on {:?}", id, kind),
                    }
                },
                Sink::Channel(tx) => {
                    if tx.send(event.clone()).is_err() {
                        closed.push(id);
                    }
                },
            }
        }

        if !closed.is_empty() {
            self.listeners.write().retain(|listener| !closed.contains(&listener.id));
        }
    }

    fn register(&self, kinds: Option<Vec<E::Kind>>, sink: Sink<E>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push(Listener { id, kinds, sink });

        id
    }
}

/// Events concerning a single link.
#[derive(Clone, Debug)]
pub enum LinkEvent {
    TrackStart {
        guild_id: u64,
        track: Track,
    },
    TrackEnd {
        guild_id: u64,
        track: Track,
        reason: TrackEndReason,
    },
    TrackException {
        guild_id: u64,
        track: Track,
        exception: Exception,
    },
    TrackStuck {
        guild_id: u64,
        track: Track,
        threshold_ms: u64,
    },
    /// The node's connection to the Discord voice gateway closed.
    WebSocketClosed {
        guild_id: u64,
        code: u16,
        reason: String,
        by_remote: bool,
    },
    PlayerUpdate {
        guild_id: u64,
        state: PlayerUpdateState,
    },
    StateChanged {
        guild_id: u64,
        state: LinkState,
    },
    /// The link moved to another node and its player state was re-applied.
    Migrated {
        guild_id: u64,
        from: Option<String>,
        to: String,
    },
    /// The link could not be moved and is now disconnected.
    MigrationFailed {
        guild_id: u64,
        error: Arc<Error>,
    },
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum LinkEventKind {
    TrackStart,
    TrackEnd,
    TrackException,
    TrackStuck,
    WebSocketClosed,
    PlayerUpdate,
    StateChanged,
    Migrated,
    MigrationFailed,
}

impl Event for LinkEvent {
    type Kind = LinkEventKind;

    fn kind(&self) -> LinkEventKind {
        match self {
            LinkEvent::TrackStart { .. } => LinkEventKind::TrackStart,
            LinkEvent::TrackEnd { .. } => LinkEventKind::TrackEnd,
            LinkEvent::TrackException { .. } => LinkEventKind::TrackException,
            LinkEvent::TrackStuck { .. } => LinkEventKind::TrackStuck,
            LinkEvent::WebSocketClosed { .. } => LinkEventKind::WebSocketClosed,
            LinkEvent::PlayerUpdate { .. } => LinkEventKind::PlayerUpdate,
            LinkEvent::StateChanged { .. } => LinkEventKind::StateChanged,
            LinkEvent::Migrated { .. } => LinkEventKind::Migrated,
            LinkEvent::MigrationFailed { .. } => LinkEventKind::MigrationFailed,
        }
    }
}

/// Events concerning a node.
#[derive(Clone, Debug)]
pub enum NodeEvent {
    /// A session was established. `resumed` tells whether the previous
    /// session was picked up again.
    Ready {
        node: String,
        session_id: String,
        resumed: bool,
    },
    Stats {
        node: String,
        stats: Stats,
    },
    /// The WebSocket closed unexpectedly and is being re-established.
    Disconnected {
        node: String,
        code: Option<u16>,
        reason: String,
    },
    /// The node can be selected for new links again.
    Available {
        node: String,
    },
    /// The node can no longer be selected, carrying
    /// [`Error::ConnectionLost`] when reconnecting gave up.
    ///
    /// [`Error::ConnectionLost`]: ../enum.Error.html#variant.ConnectionLost
    Unavailable {
        node: String,
        error: Arc<Error>,
    },
    /// The node sent a message that couldn't be decoded.
    ProtocolError {
        node: String,
        error: Arc<Error>,
    },
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum NodeEventKind {
    Ready,
    Stats,
    Disconnected,
    Available,
    Unavailable,
    ProtocolError,
}

impl Event for NodeEvent {
    type Kind = NodeEventKind;

    fn kind(&self) -> NodeEventKind {
        match self {
            NodeEvent::Ready { .. } => NodeEventKind::Ready,
            NodeEvent::Stats { .. } => NodeEventKind::Stats,
            NodeEvent::Disconnected { .. } => NodeEventKind::Disconnected,
            NodeEvent::Available { .. } => NodeEventKind::Available,
            NodeEvent::Unavailable { .. } => NodeEventKind::Unavailable,
            NodeEvent::ProtocolError { .. } => NodeEventKind::ProtocolError,
        }
    }
}
