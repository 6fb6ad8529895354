//! Test helpers for integration tests
//!
//! Provides mock servers for the REST API and the WebSocket gateway, each
//! bound to an ephemeral local port.

use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chat_gateway::protocol::OpCode;
use chat_gateway::GatewayMessage;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;

async fn bind() -> Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    Ok((listener, addr))
}

// ============================================================================
// REST API
// ============================================================================

/// A scripted REST response
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

impl MockResponse {
    /// 200 with a JSON body
    pub fn json(body: Value) -> Self {
        Self::status(200, body)
    }

    pub fn status(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body,
        }
    }

    /// 429 with the standard rate-limit body
    pub fn rate_limited(retry_after: f64, global: bool) -> Self {
        let mut response = Self::status(
            429,
            json!({
                "message": "You are being rate limited.",
                "retry_after": retry_after,
                "global": global,
            }),
        );
        if global {
            response = response.header("x-ratelimit-global", "true");
        }
        response
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, Json(self.body)).into_response();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                response.headers_mut().insert(name, value);
            }
        }
        response
    }
}

/// A request seen by [`MockApi`]
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub authorization: Option<String>,
    pub received_at: Instant,
}

#[derive(Default)]
struct ApiState {
    routes: Mutex<HashMap<String, VecDeque<MockResponse>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// REST server answering from per-path response queues
///
/// Each request pops the next response for its path; the last one repeats.
/// Unscripted paths answer 404.
pub struct MockApi {
    addr: SocketAddr,
    state: Arc<ApiState>,
    _handle: JoinHandle<()>,
}

impl MockApi {
    pub async fn start() -> Result<Self> {
        let state = Arc::new(ApiState::default());
        let app = Router::new()
            .fallback(respond)
            .with_state(Arc::clone(&state));

        let (listener, addr) = bind().await?;
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        Ok(Self {
            addr,
            state,
            _handle: handle,
        })
    }

    /// Versioned API base to put in `HttpConfig::api_base`
    pub fn base_url(&self) -> String {
        format!("http://{}/api/v10", self.addr)
    }

    /// Queue a response for a path below the API base, e.g. `/gateway/bot`
    pub fn push(&self, path: &str, response: MockResponse) {
        self.state
            .routes
            .lock()
            .entry(format!("/api/v10{path}"))
            .or_default()
            .push_back(response);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().clone()
    }

    /// Requests seen for a path below the API base
    pub fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        let full = format!("/api/v10{path}");
        self.requests()
            .into_iter()
            .filter(|request| request.path == full)
            .collect()
    }
}

async fn respond(
    State(state): State<Arc<ApiState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let path = uri.path().to_string();
    state.requests.lock().push(RecordedRequest {
        method,
        path: path.clone(),
        authorization: headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        received_at: Instant::now(),
    });

    let scripted = {
        let mut routes = state.routes.lock();
        routes.get_mut(&path).and_then(|queue| {
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        })
    };

    scripted
        .unwrap_or_else(|| {
            MockResponse::status(404, json!({"code": 0, "message": format!("no mock for {path}")}))
        })
        .into_response()
}

// ============================================================================
// Gateway
// ============================================================================

/// What the gateway does on the first connection right after its Ready
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterReady {
    /// Close the connection with this code
    Close(u16),
    /// Send Invalid Session with this `d`
    InvalidSession(bool),
    /// Ask the client for an immediate heartbeat
    RequestHeartbeat,
}

/// How [`MockGateway`] treats its connections
#[derive(Debug, Clone)]
pub struct GatewayBehavior {
    pub heartbeat_interval_ms: u64,
    /// Zero-based connection indexes whose heartbeats are never acknowledged
    pub silent_connections: Vec<usize>,
    /// Answer every resume with a non-resumable Invalid Session
    pub reject_resume: bool,
    pub after_first_ready: Option<AfterReady>,
    /// Close any connection with this code instead of answering Identify
    pub close_on_identify: Option<u16>,
    /// Dispatched after every Ready, as (event name, data)
    pub dispatches: Vec<(String, Value)>,
}

impl Default for GatewayBehavior {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 45_000,
            silent_connections: Vec::new(),
            reject_resume: false,
            after_first_ready: None,
            close_on_identify: None,
            dispatches: Vec::new(),
        }
    }
}

/// A frame the gateway received from a client
#[derive(Debug, Clone)]
pub struct ReceivedFrame {
    /// Zero-based index of the connection it arrived on
    pub connection: usize,
    pub op: OpCode,
    pub d: Value,
}

struct GatewayState {
    behavior: GatewayBehavior,
    connections: AtomicUsize,
    sessions: AtomicUsize,
    received: Mutex<Vec<ReceivedFrame>>,
}

/// Gateway server speaking the JSON protocol over a real WebSocket
///
/// Every Identify gets a Ready for a fresh `session-N` with user id 42.
pub struct MockGateway {
    addr: SocketAddr,
    state: Arc<GatewayState>,
    _handle: JoinHandle<()>,
}

impl MockGateway {
    pub async fn start(behavior: GatewayBehavior) -> Result<Self> {
        let state = Arc::new(GatewayState {
            behavior,
            connections: AtomicUsize::new(0),
            sessions: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
        });
        let app = Router::new()
            .route("/", get(upgrade))
            .with_state(Arc::clone(&state));

        let (listener, addr) = bind().await?;
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        Ok(Self {
            addr,
            state,
            _handle: handle,
        })
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<ReceivedFrame> {
        self.state.received.lock().clone()
    }

    /// Received frames other than heartbeats
    pub fn commands(&self) -> Vec<ReceivedFrame> {
        self.received()
            .into_iter()
            .filter(|frame| frame.op != OpCode::Heartbeat)
            .collect()
    }

    /// Received frames with one op code
    pub fn frames(&self, op: OpCode) -> Vec<ReceivedFrame> {
        self.received()
            .into_iter()
            .filter(|frame| frame.op == op)
            .collect()
    }
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<Arc<GatewayState>>) -> Response {
    ws.on_upgrade(move |socket| serve_connection(socket, state))
}

fn server_message(op: OpCode, d: Value) -> GatewayMessage {
    GatewayMessage {
        op,
        t: None,
        s: None,
        d,
    }
}

fn dispatch(seq: &mut u64, name: &str, d: Value) -> GatewayMessage {
    *seq += 1;
    GatewayMessage {
        op: OpCode::Dispatch,
        t: Some(name.to_string()),
        s: Some(*seq),
        d,
    }
}

async fn send(socket: &mut WebSocket, message: &GatewayMessage) -> bool {
    let Ok(text) = message.to_json() else {
        return false;
    };
    socket.send(Message::Text(text)).await.is_ok()
}

/// Send a close frame, then read until the client finishes the handshake
async fn close(mut socket: WebSocket, code: u16) {
    let frame = CloseFrame {
        code,
        reason: Cow::Borrowed("mock close"),
    };
    if socket.send(Message::Close(Some(frame))).await.is_err() {
        return;
    }
    while let Some(Ok(_)) = socket.recv().await {}
}

async fn serve_connection(mut socket: WebSocket, state: Arc<GatewayState>) {
    let connection = state.connections.fetch_add(1, Ordering::SeqCst);
    let behavior = &state.behavior;
    let mut seq = 0u64;

    let hello = server_message(
        OpCode::Hello,
        json!({"heartbeat_interval": behavior.heartbeat_interval_ms}),
    );
    if !send(&mut socket, &hello).await {
        return;
    }

    while let Some(Ok(frame)) = socket.recv().await {
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(message) = GatewayMessage::from_json(&text) else {
            continue;
        };
        state.received.lock().push(ReceivedFrame {
            connection,
            op: message.op,
            d: message.d.clone(),
        });

        let replies = match message.op {
            OpCode::Heartbeat if !behavior.silent_connections.contains(&connection) => {
                vec![server_message(OpCode::HeartbeatAck, Value::Null)]
            }
            OpCode::Identify => {
                if let Some(code) = behavior.close_on_identify {
                    close(socket, code).await;
                    return;
                }
                let session = state.sessions.fetch_add(1, Ordering::SeqCst);
                let ready = json!({
                    "session_id": format!("session-{session}"),
                    "user": {"id": "42", "username": "mock"},
                });
                let mut replies = vec![dispatch(&mut seq, "READY", ready)];
                for (name, data) in &behavior.dispatches {
                    replies.push(dispatch(&mut seq, name, data.clone()));
                }
                replies
            }
            OpCode::Resume if behavior.reject_resume => {
                vec![server_message(OpCode::InvalidSession, Value::Bool(false))]
            }
            OpCode::Resume => {
                seq = message.d["seq"].as_u64().unwrap_or(0);
                vec![dispatch(&mut seq, "RESUMED", json!({}))]
            }
            _ => Vec::new(),
        };

        for reply in &replies {
            if !send(&mut socket, reply).await {
                return;
            }
        }

        if message.op == OpCode::Identify && connection == 0 {
            let follow_up = match behavior.after_first_ready {
                Some(AfterReady::Close(code)) => {
                    close(socket, code).await;
                    return;
                }
                Some(AfterReady::InvalidSession(resumable)) => {
                    server_message(OpCode::InvalidSession, Value::Bool(resumable))
                }
                Some(AfterReady::RequestHeartbeat) => server_message(OpCode::Heartbeat, Value::Null),
                None => continue,
            };
            if !send(&mut socket, &follow_up).await {
                return;
            }
        }
    }
}

/// Poll `condition` every 10ms until it holds; false on timeout
pub async fn eventually(within: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + within;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
