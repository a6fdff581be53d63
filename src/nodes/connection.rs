use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use super::NodeConfig;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use crate::config::{PoolConfig, ReconnectPolicy};
use crate::model::Inbound;
use crate::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The lifecycle of a node's WebSocket.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ConnectionState {
    /// Never started.
    Idle,
    /// Opening a fresh session.
    Connecting,
    /// The socket is open.
    Open,
    /// Reopening with the previous session ID.
    Resuming,
    /// Closed on request or after giving up reconnecting.
    Closed,
}

/// What the receive loop reports to the owner of the connection, in the order
/// it happened.
#[derive(Debug)]
pub(crate) enum ConnectionEvent {
    Inbound(Inbound),
    ProtocolError(Error),
    /// The socket dropped; a reconnect is scheduled.
    Disconnected {
        code: Option<u16>,
        reason: String,
    },
    /// Reconnecting was given up.
    Lost(Error),
}

enum Exit {
    Shutdown,
    Dropped {
        code: Option<u16>,
        reason: String,
    },
}

/// One WebSocket to one node, re-established with backoff when it drops.
pub struct Connection {
    node: String,
    url: String,
    password: String,
    user_id: u64,
    client_name: String,
    reconnect: ReconnectPolicy,
    heartbeat: Duration,
    connect_timeout: Duration,
    resume: bool,
    state: watch::Sender<ConnectionState>,
    session_id: RwLock<Option<String>>,
    outbound: RwLock<Option<UnboundedSender<Message>>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub(crate) fn new(node: &NodeConfig, config: &PoolConfig) -> Self {
        Self {
            node: node.name.clone(),
            url: node.websocket_host.clone(),
            password: node.password.clone(),
            user_id: config.user_id,
            client_name: config.client_name.clone(),
            reconnect: config.reconnect.clone(),
            heartbeat: config.heartbeat_interval,
            connect_timeout: config.request_timeout,
            resume: config.resume_timeout.is_some(),
            state: watch::channel(ConnectionState::Idle).0,
            session_id: RwLock::new(None),
            outbound: RwLock::new(None),
            shutdown: watch::channel(false).0,
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watches state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// The session ID issued by the node, which doubles as resume key.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Spawns the connection task, unless one is already running.
    pub(crate) fn start(self: &Arc<Self>, events: UnboundedSender<ConnectionEvent>) {
        let mut task = self.task.lock();

        if task.as_ref().map_or(false, |task| !task.is_finished()) {
            return;
        }

        self.shutdown.send_replace(false);
        let shutdown = self.shutdown.subscribe();

        *task = Some(tokio::spawn(Arc::clone(self).run(events, shutdown)));
    }

    /// Stops the running task, if any, and starts a fresh one. The session ID
    /// is kept so the new socket may resume.
    pub(crate) async fn restart(self: &Arc<Self>, events: UnboundedSender<ConnectionEvent>) {
        self.shutdown.send_replace(true);

        let task = self.task.lock().take();

        if let Some(task) = task {
            let _ = task.await;
        }

        self.start(events);
    }

    /// Queues a JSON payload on the socket.
    ///
    /// The frame is handed to the connection task whole, so dropping the
    /// caller's future never leaves a partial write behind.
    pub fn send(&self, payload: &impl Serialize) -> Result<()> {
        let text = serde_json::to_string(payload)?;
        let outbound = self.outbound.read();
        let tx = outbound
            .as_ref()
            .filter(|_| self.is_open())
            .ok_or_else(|| Error::NodeNotConnected(self.node.clone()))?;

        debug!("[{}] Sending {}", self.node, text);

        tx.send(Message::Text(text.into()))
            .map_err(|_| Error::NodeNotConnected(self.node.clone()))
    }

    /// Sends a close frame and stops reconnecting.
    pub fn close(&self, code: u16, reason: &str) {
        info!("[{}] Closing connection: {} {}", self.node, code, reason);

        if let Some(tx) = self.outbound.read().as_ref() {
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: reason.to_owned().into(),
            };
            let _ = tx.send(Message::Close(Some(frame)));
        }

        self.shutdown.send_replace(true);

        if self.task.lock().as_ref().map_or(true, |task| task.is_finished()) {
            self.set_state(ConnectionState::Closed);
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);

        if previous != state {
            trace!("[{}] Connection state {:?} -> {:?}", self.node, previous, state);
        }
    }

    async fn run(
        self: Arc<Self>,
        events: UnboundedSender<ConnectionEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut failures = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let resuming = self.resume && self.session_id.read().is_some();
            self.set_state(if resuming {
                ConnectionState::Resuming
            } else {
                ConnectionState::Connecting
            });

            match self.open(resuming).await {
                Ok(ws) => {
                    info!("[{}] Connected to {} (resuming: {})", self.node, self.url, resuming);
                    failures = 0;
                    self.set_state(ConnectionState::Open);

                    match self.pump(ws, &events, &mut shutdown).await {
                        Exit::Shutdown => break,
                        Exit::Dropped { code, reason } => {
                            warn!("[{}] Connection dropped ({:?}): {}", self.node, code, reason);

                            if events.send(ConnectionEvent::Disconnected { code, reason }).is_err() {
                                break;
                            }
                        },
                    }
                },
                Err(why) => {
                    failures += 1;
                    warn!("[{}] Connection attempt {} failed: {}", self.node, failures, why);
                },
            }

            if !self.reconnect.allows(failures) {
                error!("[{}] Giving up after {} failed attempts", self.node, failures);
                *self.session_id.write() = None;
                let _ = events.send(ConnectionEvent::Lost(Error::ConnectionLost(self.node.clone())));

                break;
            }

            let delay = self.reconnect.delay(failures.max(1));
            debug!("[{}] Reconnecting in {:?}", self.node, delay);

            tokio::select! {
                _ = time::sleep(delay) => {},
                _ = shutdown.changed() => {},
            }
        }

        self.set_state(ConnectionState::Closed);
    }

    async fn open(&self, resuming: bool) -> Result<WsStream> {
        let mut request = self.url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert("Authorization", header_value(&self.password)?);
        headers.insert("User-Id", header_value(&self.user_id.to_string())?);
        headers.insert("Client-Name", header_value(&self.client_name)?);

        if resuming {
            if let Some(session_id) = self.session_id() {
                headers.insert("Session-Id", header_value(&session_id)?);
            }
        }

        let (ws, _) = time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| Error::Timeout)??;

        Ok(ws)
    }

    async fn pump(
        &self,
        ws: WsStream,
        events: &UnboundedSender<ConnectionEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Exit {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel();
        *self.outbound.write() = Some(tx);

        let mut heartbeat = time::interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();

        let exit = loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_ok() && !*shutdown.borrow() {
                        continue;
                    }

                    // Flush what was queued before closing, the close frame
                    // included.
                    while let Ok(message) = rx.try_recv() {
                        let _ = sink.send(message).await;
                    }

                    break Exit::Shutdown;
                },
                Some(message) = rx.recv() => {
                    if let Err(why) = sink.send(message).await {
                        break Exit::Dropped { code: None, reason: why.to_string() };
                    }
                },
                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > self.heartbeat * 2 {
                        break Exit::Dropped { code: None, reason: "heartbeat timed out".to_owned() };
                    }

                    if let Err(why) = sink.send(Message::Ping(Default::default())).await {
                        break Exit::Dropped { code: None, reason: why.to_string() };
                    }
                },
                frame = stream.next() => {
                    last_seen = Instant::now();

                    match frame {
                        Some(Ok(Message::Text(text))) => self.handle_text(text.as_str(), events),
                        Some(Ok(Message::Close(frame))) => {
                            info!("[{}] Received a close: {:?}", self.node, frame);

                            break match frame {
                                Some(frame) => Exit::Dropped {
                                    code: Some(u16::from(frame.code)),
                                    reason: frame.reason.to_string(),
                                },
                                None => Exit::Dropped { code: None, reason: String::new() },
                            };
                        },
                        Some(Ok(Message::Binary(data))) => {
                            warn!("[{}] Ignoring {} bytes of binary data", self.node, data.len());
                        },
                        Some(Ok(other)) => trace!("[{}] Received {:?}", self.node, other),
                        Some(Err(why)) => break Exit::Dropped { code: None, reason: why.to_string() },
                        None => break Exit::Dropped { code: None, reason: "stream ended".to_owned() },
                    }
                },
            }
        };

        *self.outbound.write() = None;

        if let Exit::Shutdown = exit {
            let _ = sink.close().await;
        }

        exit
    }

    fn handle_text(&self, text: &str, events: &UnboundedSender<ConnectionEvent>) {
        trace!("[{}] Received text: {}", self.node, text);

        let event = match Inbound::decode(text) {
            Ok(Inbound::Ready(ready)) => {
                let previous = self.session_id.write().replace(ready.session_id.clone());

                if previous.is_some() && !ready.resumed {
                    info!("[{}] Session was not resumed, player state needs a re-sync", self.node);
                }

                ConnectionEvent::Inbound(Inbound::Ready(ready))
            },
            Ok(message) => ConnectionEvent::Inbound(message),
            Err(why) => {
                warn!("[{}] Error handling received message: {}", self.node, why);

                ConnectionEvent::ProtocolError(why)
            },
        };

        let _ = events.send(event);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("node", &self.node)
            .field("url", &self.url)
            .field("state", &self.state())
            .field("session_id", &self.session_id())
            .finish()
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|why| Error::invalid("header", why.to_string()))
}
