#![allow(dead_code)]

//! An in-process stand-in for a Lavalink node: a WebSocket acceptor that
//! sends `ready`/`stats` and buffers events for resumed sessions, plus the
//! REST routes the client uses.

use futures::{SinkExt, StreamExt};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use lavalink_cluster::model::VoiceState;
use lavalink_cluster::nodes::{Node, NodeConfig, NodeStatus};
use lavalink_cluster::{PoolConfig, ReconnectPolicy};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request as WsRequest, Response as WsResponse};
use tokio_tungstenite::tungstenite::Message;

pub const PASSWORD: &str = "youshallnotpass";
pub const USER_ID: u64 = 42;

/// A request as seen by the mock. WebSocket ops are recorded with method
/// `WS` and the op name as path.
#[derive(Clone, Debug)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub body: Value,
}

enum Control {
    Send(String),
    Drop,
}

struct MockPlayer {
    track: Option<String>,
    volume: u64,
    paused: bool,
    position: u64,
    connected: bool,
    voice: Option<Value>,
    equalizer: Option<Value>,
}

impl MockPlayer {
    fn new() -> Self {
        Self {
            track: None,
            volume: 100,
            paused: false,
            position: 0,
            connected: false,
            voice: None,
            equalizer: None,
        }
    }

    fn to_json(&self, guild_id: u64) -> Value {
        json!({
            "guildId": guild_id.to_string(),
            "track": self.track.as_ref().map(|encoded| json!({"encoded": encoded, "info": {}})),
            "volume": self.volume,
            "paused": self.paused,
            "state": {
                "time": 0,
                "position": self.position,
                "connected": self.connected,
                "ping": 1,
            },
            "voice": self.voice,
            "filters": match &self.equalizer {
                Some(bands) => json!({"equalizer": bands}),
                None => json!({}),
            },
        })
    }
}

struct State {
    name: String,
    session_id: String,
    playing_players: u32,
    killed: AtomicBool,
    resumable: AtomicBool,
    fail_voice: AtomicBool,
    fail_rest: AtomicBool,
    reject_tracks: AtomicBool,
    ack_delay: Mutex<Duration>,
    route_planner: Mutex<Option<Value>>,
    players: Mutex<HashMap<u64, MockPlayer>>,
    requests: Mutex<Vec<Recorded>>,
    handshakes: Mutex<Vec<HashMap<String, String>>>,
    sockets: Mutex<Vec<UnboundedSender<Control>>>,
    buffered: Mutex<Vec<String>>,
}

impl State {
    fn record(&self, method: &str, path: &str, body: Value) {
        self.requests.lock().push(Recorded {
            method: method.to_owned(),
            path: path.to_owned(),
            body,
        });
    }

    fn push_text(&self, text: String) {
        let mut sockets = self.sockets.lock();
        sockets.retain(|socket| !socket.is_closed());

        if sockets.is_empty() {
            self.buffered.lock().push(text);

            return;
        }

        for socket in sockets.iter() {
            let _ = socket.send(Control::Send(text.clone()));
        }
    }

    /// Applies a partial player update, returning the player as it was
    /// after the update and whether a voice join should be acknowledged.
    fn apply(&self, guild_id: u64, body: &Value, no_replace: bool) -> (Value, bool) {
        let mut players = self.players.lock();
        let player = players.entry(guild_id).or_insert_with(MockPlayer::new);

        if let Some(track) = body.get("track") {
            if !(no_replace && player.track.is_some()) {
                match track.get("encoded") {
                    Some(Value::String(encoded)) => {
                        player.track = Some(encoded.clone());
                        player.position = 0;
                    },
                    Some(Value::Null) => {
                        player.track = None;
                        player.position = 0;
                    },
                    _ => {},
                }
            }
        }

        if let Some(position) = body.get("position").and_then(Value::as_u64) {
            player.position = position;
        }

        if let Some(volume) = body.get("volume").and_then(Value::as_u64) {
            player.volume = volume;
        }

        if let Some(paused) = body.get("paused").and_then(Value::as_bool) {
            player.paused = paused;
        }

        if let Some(filters) = body.get("filters") {
            player.equalizer = filters.get("equalizer").cloned();
        }

        let mut ack = false;

        if let Some(voice) = body.get("voice") {
            player.voice = Some(voice.clone());
            player.connected = false;
            ack = !self.fail_voice.load(Ordering::SeqCst);
        }

        (player.to_json(guild_id), ack)
    }

    /// Reports the voice connection of a guild's player as established.
    fn acknowledge(self: &Arc<Self>, guild_id: u64) {
        let delay = *self.ack_delay.lock();
        let state = Arc::clone(self);

        tokio::spawn(async move {
            if !delay.is_zero() {
                time::sleep(delay).await;
            }

            let position = {
                let mut players = state.players.lock();
                let Some(player) = players.get_mut(&guild_id) else {
                    return;
                };

                player.connected = true;
                player.position
            };

            state.push_text(json!({
                "op": "playerUpdate",
                "guildId": guild_id.to_string(),
                "state": {"time": 0, "position": position, "connected": true, "ping": 1},
            }).to_string());
        });
    }
}

pub struct MockNode {
    state: Arc<State>,
    http_addr: SocketAddr,
    ws_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl MockNode {
    /// Starts a node reporting the given number of playing players.
    pub async fn start(name: &str, playing_players: u32) -> Self {
        let state = Arc::new(State {
            name: name.to_owned(),
            session_id: format!("session-{}", name),
            playing_players,
            killed: AtomicBool::new(false),
            resumable: AtomicBool::new(true),
            fail_voice: AtomicBool::new(false),
            fail_rest: AtomicBool::new(false),
            reject_tracks: AtomicBool::new(false),
            ack_delay: Mutex::new(Duration::ZERO),
            route_planner: Mutex::new(None),
            players: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            handshakes: Mutex::new(Vec::new()),
            sockets: Mutex::new(Vec::new()),
            buffered: Mutex::new(Vec::new()),
        });

        let ws = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_addr = ws.local_addr().unwrap();
        let ws_task = tokio::spawn({
            let state = Arc::clone(&state);

            async move {
                while let Ok((stream, _)) = ws.accept().await {
                    tokio::spawn(serve_socket(Arc::clone(&state), stream));
                }
            }
        });

        let http = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        http.set_nonblocking(true).unwrap();
        let http_addr = http.local_addr().unwrap();
        let service = make_service_fn({
            let state = Arc::clone(&state);

            move |_| {
                let state = Arc::clone(&state);

                async move {
                    Ok::<_, Infallible>(service_fn(move |request| handle(Arc::clone(&state), request)))
                }
            }
        });
        let server = Server::from_tcp(http).unwrap().serve(service);
        let http_task = tokio::spawn(async move {
            let _ = server.await;
        });

        Self {
            state,
            http_addr,
            ws_addr,
            tasks: vec![ws_task, http_task],
        }
    }

    pub fn config(&self) -> NodeConfig {
        NodeConfig::new(
            self.state.name.as_str(),
            format!("http://{}", self.http_addr),
            format!("ws://{}/v4/websocket", self.ws_addr),
            PASSWORD,
        )
    }

    pub fn session_id(&self) -> &str {
        &self.state.session_id
    }

    /// Sends a message to connected clients, or buffers it for the next
    /// resumed session.
    pub fn push(&self, message: Value) {
        self.state.push_text(message.to_string());
    }

    pub fn push_raw(&self, text: &str) {
        self.state.push_text(text.to_owned());
    }

    /// Drops every socket without a close frame.
    pub fn drop_connections(&self) {
        for socket in self.state.sockets.lock().drain(..) {
            let _ = socket.send(Control::Drop);
        }
    }

    /// Stops accepting connections and fails every REST request.
    pub fn kill(&self) {
        self.state.killed.store(true, Ordering::SeqCst);

        for task in &self.tasks {
            task.abort();
        }

        self.drop_connections();
    }

    pub fn set_resumable(&self, resumable: bool) {
        self.state.resumable.store(resumable, Ordering::SeqCst);
    }

    /// Never acknowledges voice joins.
    pub fn fail_voice(&self, fail: bool) {
        self.state.fail_voice.store(fail, Ordering::SeqCst);
    }

    /// Answers every REST request with a 500.
    pub fn fail_rest(&self, fail: bool) {
        self.state.fail_rest.store(fail, Ordering::SeqCst);
    }

    /// Answers player updates that load a track with 400.
    pub fn reject_tracks(&self, reject: bool) {
        self.state.reject_tracks.store(reject, Ordering::SeqCst);
    }

    pub fn set_ack_delay(&self, delay: Duration) {
        *self.state.ack_delay.lock() = delay;
    }

    pub fn set_route_planner(&self, status: Option<Value>) {
        *self.state.route_planner.lock() = status;
    }

    pub fn player(&self, guild_id: u64) -> Option<Value> {
        self.state.players.lock().get(&guild_id).map(|player| player.to_json(guild_id))
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.requests.lock().clone()
    }

    /// Player updates sent over REST or the WebSocket, in arrival order.
    pub fn player_updates(&self) -> Vec<Value> {
        self.requests()
            .into_iter()
            .filter(|request| request.method == "PATCH" && request.path.contains("/players/"))
            .map(|request| request.body)
            .collect()
    }

    pub fn handshakes(&self) -> Vec<HashMap<String, String>> {
        self.state.handshakes.lock().clone()
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }

        self.drop_connections();
    }
}

async fn serve_socket(state: Arc<State>, stream: TcpStream) {
    let mut headers = HashMap::new();
    let callback = |request: &WsRequest, response: WsResponse| {
        for (name, value) in request.headers() {
            headers.insert(name.as_str().to_owned(), value.to_str().unwrap_or_default().to_owned());
        }

        Ok::<_, ErrorResponse>(response)
    };

    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };

    let resumed = state.resumable.load(Ordering::SeqCst)
        && headers.get("session-id") == Some(&state.session_id);
    state.handshakes.lock().push(headers);

    let stats = json!({
        "op": "stats",
        "players": state.playing_players,
        "playingPlayers": state.playing_players,
        "uptime": 1000,
        "memory": {"free": 1, "used": 1, "allocated": 2, "reservable": 4},
        "cpu": {"cores": 4, "systemLoad": 0.0, "lavalinkLoad": 0.0},
    });
    let ready = json!({"op": "ready", "resumed": resumed, "sessionId": state.session_id});

    for message in [stats, ready] {
        if ws.send(Message::Text(message.to_string().into())).await.is_err() {
            return;
        }
    }

    let (tx, mut rx) = mpsc::unbounded_channel();

    {
        let mut sockets = state.sockets.lock();
        let buffered = std::mem::take(&mut *state.buffered.lock());

        if resumed {
            for text in buffered {
                let _ = tx.send(Control::Send(text));
            }
        }

        sockets.push(tx);
    }

    loop {
        tokio::select! {
            control = rx.recv() => match control {
                Some(Control::Send(text)) => {
                    if ws.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                },
                Some(Control::Drop) | None => break,
            },
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(op) = serde_json::from_str::<Value>(text.as_str()) {
                        handle_op(&state, op);
                    }
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {},
            },
        }
    }
}

fn handle_op(state: &Arc<State>, op: Value) {
    let name = op["op"].as_str().unwrap_or_default().to_owned();
    state.record("WS", &name, op.clone());

    let Some(guild_id) = op["guildId"].as_str().and_then(|id| id.parse().ok()) else {
        return;
    };

    let body = match name.as_str() {
        "voiceUpdate" => json!({"voice": {
            "token": op["event"]["token"],
            "endpoint": op["event"]["endpoint"],
            "sessionId": op["sessionId"],
        }}),
        "play" => json!({
            "track": {"encoded": op["track"]},
            "position": op["startTime"],
            "paused": op["pause"],
        }),
        "stop" => json!({"track": {"encoded": null}}),
        "pause" => json!({"paused": op["pause"]}),
        "seek" => json!({"position": op["position"]}),
        "volume" => json!({"volume": op["volume"]}),
        "equalizer" => json!({"filters": {"equalizer": op["bands"]}}),
        "destroy" => {
            state.players.lock().remove(&guild_id);

            return;
        },
        _ => return,
    };

    let no_replace = op["noReplace"].as_bool().unwrap_or(false);
    let (_, ack) = state.apply(guild_id, &body, no_replace);

    if ack {
        state.acknowledge(guild_id);
    }
}

async fn handle(state: Arc<State>, request: Request<Body>) -> Result<Response<Body>, Infallible> {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let no_replace = request.uri().query().map_or(false, |query| query.contains("noReplace=true"));
    let authorized = request
        .headers()
        .get("authorization")
        .map_or(false, |value| value.as_bytes() == PASSWORD.as_bytes());
    let bytes = hyper::body::to_bytes(request.into_body()).await.unwrap_or_default();
    let body = serde_json::from_slice::<Value>(&bytes).unwrap_or(Value::Null);

    state.record(method.as_str(), &path, body.clone());

    if !authorized {
        return Ok(respond(StatusCode::UNAUTHORIZED, Some(json!({"message": "Unauthorized"}))));
    }

    if state.killed.load(Ordering::SeqCst) || state.fail_rest.load(Ordering::SeqCst) {
        return Ok(respond(StatusCode::INTERNAL_SERVER_ERROR, Some(json!({"message": "boom"}))));
    }

    let segments = path.trim_matches('/').split('/').collect::<Vec<_>>();
    let session_known = |session_id: &str| session_id == state.session_id;

    let response = match (&method, segments.as_slice()) {
        (&Method::PATCH, ["v4", "sessions", session_id, "players", guild_id]) if session_known(session_id) => {
            match guild_id.parse::<u64>() {
                Ok(_) if body.get("track").is_some() && state.reject_tracks.load(Ordering::SeqCst) => {
                    respond(StatusCode::BAD_REQUEST, Some(json!({"message": "track rejected"})))
                },
                Ok(guild_id) => {
                    let (player, ack) = state.apply(guild_id, &body, no_replace);

                    if ack {
                        state.acknowledge(guild_id);
                    }

                    respond(StatusCode::OK, Some(player))
                },
                Err(_) => respond(StatusCode::BAD_REQUEST, Some(json!({"message": "bad guild"}))),
            }
        },
        (&Method::GET, ["v4", "sessions", session_id, "players", guild_id]) if session_known(session_id) => {
            let player = guild_id
                .parse::<u64>()
                .ok()
                .and_then(|guild_id| state.players.lock().get(&guild_id).map(|player| player.to_json(guild_id)));

            match player {
                Some(player) => respond(StatusCode::OK, Some(player)),
                None => respond(StatusCode::NOT_FOUND, Some(json!({"message": "Player not found"}))),
            }
        },
        (&Method::DELETE, ["v4", "sessions", session_id, "players", guild_id]) if session_known(session_id) => {
            if let Ok(guild_id) = guild_id.parse::<u64>() {
                state.players.lock().remove(&guild_id);
            }

            respond(StatusCode::NO_CONTENT, None)
        },
        (&Method::PATCH, ["v4", "sessions", session_id]) if session_known(session_id) => {
            respond(StatusCode::OK, Some(body))
        },
        (&Method::GET, ["v4", "routeplanner", "status"]) => match state.route_planner.lock().clone() {
            Some(status) => respond(StatusCode::OK, Some(status)),
            None => respond(StatusCode::NO_CONTENT, None),
        },
        (&Method::POST, ["v4", "routeplanner", "free", "address" | "all"]) => {
            respond(StatusCode::NO_CONTENT, None)
        },
        _ => respond(StatusCode::NOT_FOUND, Some(json!({"message": "Not found"}))),
    };

    Ok(response)
}

fn respond(status: StatusCode, body: Option<Value>) -> Response<Body> {
    let mut response = Response::new(body.map_or_else(Body::empty, |body| Body::from(body.to_string())));
    *response.status_mut() = status;

    response
}

/// A pool configuration with short timeouts and a quick, bounded backoff.
pub fn config() -> PoolConfig {
    PoolConfig {
        user_id: USER_ID,
        reconnect: ReconnectPolicy {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_attempts: Some(3),
        },
        link_connect_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

pub fn voice() -> VoiceState {
    VoiceState {
        token: "token".to_owned(),
        endpoint: "us-east123.discord.media:443".to_owned(),
        session_id: "voice-session".to_owned(),
    }
}

pub async fn wait_for_status(node: &Node, status: NodeStatus) {
    let mut receiver = node.subscribe_status();
    let reached = receiver.wait_for(|current| *current == status);

    time::timeout(Duration::from_secs(5), reached)
        .await
        .expect("node status timed out")
        .expect("node dropped");
}

pub async fn wait_available(node: &Node) {
    wait_for_status(node, NodeStatus::Connected).await;
}

/// Polls a condition until it holds, failing after five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = time::Instant::now() + Duration::from_secs(5);

    while !condition() {
        assert!(time::Instant::now() < deadline, "condition not met in time");
        time::sleep(Duration::from_millis(10)).await;
    }
}
