//! Transport session.
//!
//! Owns the WebSocket lifecycle: connect, resume the server-side seat
//! with the persisted token, queue outbound messages while the link is
//! down, heartbeat, detect silent failures, and reconnect with
//! exponential backoff.
//!
//! The session is driven from a single control thread: the owner calls
//! [`Session::poll`] from its frame loop, and every timer (heartbeat,
//! reconnect) and socket read happens inside that call. Nothing blocks:
//! delays are deadline checks against `Instant`s and the socket read
//! uses a short timeout.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use marble_shared::config::ClientConfig;
use marble_shared::event::{Dispatcher, HandlerId};
use marble_shared::net::{self, ClientMsg, Inbound, Welcome};

use crate::token::TokenStore;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long one `poll` waits on the socket before yielding back to the
/// caller's frame loop.
const POLL_READ_TIMEOUT: Duration = Duration::from_millis(10);

/// Connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Not connected, no attempt in flight.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Link is up; sends go straight out.
    Open,
    /// Link went down; a reconnect may be pending.
    Closed,
    /// Attempt budget exhausted. Terminal until [`Session::reset`].
    GaveUp,
}

/// Exponential backoff: `base × 2^(attempt − 1)` for attempt ≥ 1.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exp)
}

/// Resilient client session over a WebSocket.
///
/// Application messages go through [`Session::send`]; they are queued
/// whenever the link is not open and flushed in order on the next open,
/// right after the automatic `join` resume frame. Inbound traffic fans
/// out through two dispatchers: transport lifecycle events (`open`,
/// `close`, `error`, `reconnect_exhausted`) and application events
/// (`message` plus one event per inbound `type`), kept separate so a
/// server message type can never collide with a lifecycle event.
pub struct Session {
    cfg: ClientConfig,
    status: SessionStatus,
    ws: Option<WsStream>,
    queue: VecDeque<String>,
    attempts: u32,
    last_pong: Instant,
    next_ping: Option<Instant>,
    reconnect_at: Option<Instant>,
    token: Option<String>,
    store: TokenStore,
    player_id: Option<u64>,
    transport: Dispatcher,
    events: Dispatcher,
}

impl Session {
    /// Creates a session and reads any persisted token. Does not connect.
    pub fn new(cfg: ClientConfig, store: TokenStore) -> Self {
        let token = store.load();
        if token.is_some() {
            info!("loaded persisted session token");
        }
        Self {
            cfg,
            status: SessionStatus::Disconnected,
            ws: None,
            queue: VecDeque::new(),
            attempts: 0,
            last_pong: Instant::now(),
            next_ping: None,
            reconnect_at: None,
            token,
            store,
            player_id: None,
            transport: Dispatcher::new(),
            events: Dispatcher::new(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Identity assigned by the server's `welcome`, if any yet.
    pub fn player_id(&self) -> Option<u64> {
        self.player_id
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Messages waiting for the next open.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Registers an application event handler (`message`, `welcome`,
    /// `state`, `error`, or any other inbound `type`).
    pub fn on(&mut self, kind: &str, handler: impl FnMut(&Value) + 'static) -> HandlerId {
        self.events.on(kind, handler)
    }

    pub fn off(&mut self, kind: &str, id: HandlerId) -> bool {
        self.events.off(kind, id)
    }

    /// Registers a transport lifecycle handler (`open`, `close`,
    /// `error`, `reconnect_exhausted`).
    pub fn on_transport(&mut self, kind: &str, handler: impl FnMut(&Value) + 'static) -> HandlerId {
        self.transport.on(kind, handler)
    }

    pub fn off_transport(&mut self, kind: &str, id: HandlerId) -> bool {
        self.transport.off(kind, id)
    }

    /// Opens the channel. A handshake failure is not raised; it is
    /// scheduled away like any other link loss.
    pub async fn connect(&mut self) {
        if self.ws.is_some() {
            return;
        }
        if self.status == SessionStatus::GaveUp {
            warn!("session gave up; call reset() to try again");
            return;
        }
        self.status = SessionStatus::Connecting;
        self.reconnect_at = None;
        debug!(url = %self.cfg.server_url, "opening channel");
        match connect_async(self.cfg.server_url.as_str()).await {
            Ok((ws, _resp)) => self.on_open(ws).await,
            Err(e) => {
                warn!(error = %e, "connect failed");
                self.transport.trigger("error", &Value::String(e.to_string()));
                self.status = SessionStatus::Closed;
                self.schedule_reconnect();
            }
        }
    }

    /// Fire-and-forget send. When the link is open the message goes out
    /// now; otherwise it is queued for the next open. The caller cannot
    /// tell which happened; consult [`Session::status`] if it matters.
    pub async fn send(&mut self, msg: &ClientMsg) {
        match net::encode(msg) {
            Ok(text) => self.send_text(text).await,
            Err(e) => warn!(error = %e, "unencodable message dropped"),
        }
    }

    /// Raw passthrough variant of [`Session::send`] for pre-serialized
    /// or non-JSON payloads.
    pub async fn send_text(&mut self, text: String) {
        self.queue.push_back(text);
        if self.status == SessionStatus::Open {
            self.flush_queue().await;
        }
    }

    /// Returns a gave-up session to service: clears the attempt counter
    /// and connects on the next poll.
    pub fn reset(&mut self) {
        if self.status == SessionStatus::GaveUp {
            self.status = SessionStatus::Closed;
        }
        self.attempts = 0;
        self.reconnect_at = Some(Instant::now());
    }

    /// Drives the session one step: fires due timers and reads the
    /// socket briefly. Call once per frame.
    pub async fn poll(&mut self) {
        if let Some(at) = self.reconnect_at {
            if self.status != SessionStatus::Open && Instant::now() >= at {
                self.reconnect_at = None;
                self.connect().await;
            }
        }
        if self.status == SessionStatus::Open {
            self.drive_heartbeat().await;
            self.read_socket().await;
        }
    }

    async fn on_open(&mut self, ws: WsStream) {
        self.ws = Some(ws);
        self.status = SessionStatus::Open;
        self.attempts = 0;
        self.reconnect_at = None;
        self.last_pong = Instant::now();
        info!("channel open");

        // Resume frame first, then the backlog, then heartbeat.
        let join = ClientMsg::Join {
            token: self.token.clone(),
        };
        match net::encode(&join) {
            Ok(text) => {
                self.transmit_control(text).await;
            }
            Err(e) => warn!(error = %e, "could not encode join"),
        }
        if self.status == SessionStatus::Open {
            self.flush_queue().await;
        }
        if self.status == SessionStatus::Open {
            self.next_ping = Some(Instant::now() + self.cfg.heartbeat_interval());
            self.transport.trigger("open", &Value::Null);
        }
    }

    /// Sends a session-generated frame. Not requeued on failure: control
    /// frames are regenerated on the next open.
    async fn transmit_control(&mut self, text: String) {
        let Some(ws) = self.ws.as_mut() else {
            return;
        };
        if let Err(e) = ws.send(Message::Text(text)).await {
            warn!(error = %e, "send failed");
            self.transport.trigger("error", &Value::String(e.to_string()));
            self.handle_close(None).await;
        }
    }

    /// Flushes the queue strictly in FIFO order. A frame that fails to
    /// transmit goes back to the front so order and the never-drop
    /// invariant survive the link loss.
    async fn flush_queue(&mut self) {
        while self.status == SessionStatus::Open {
            let Some(text) = self.queue.pop_front() else {
                break;
            };
            let Some(ws) = self.ws.as_mut() else {
                self.queue.push_front(text);
                break;
            };
            if let Err(e) = ws.send(Message::Text(text.clone())).await {
                warn!(error = %e, "flush failed; frame stays queued");
                self.queue.push_front(text);
                self.transport.trigger("error", &Value::String(e.to_string()));
                self.handle_close(None).await;
                break;
            }
        }
    }

    async fn drive_heartbeat(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_pong) > self.cfg.heartbeat_timeout() {
            self.force_close(net::CLOSE_HEARTBEAT_TIMEOUT, "heartbeat timeout")
                .await;
            return;
        }
        if let Some(at) = self.next_ping {
            if now >= at {
                self.next_ping = Some(now + self.cfg.heartbeat_interval());
                let ping = ClientMsg::Ping {
                    timestamp: chrono::Utc::now().timestamp_millis(),
                };
                match net::encode(&ping) {
                    Ok(text) => self.transmit_control(text).await,
                    Err(e) => warn!(error = %e, "could not encode ping"),
                }
            }
        }
    }

    async fn read_socket(&mut self) {
        let Some(ws) = self.ws.as_mut() else {
            return;
        };
        match timeout(POLL_READ_TIMEOUT, ws.next()).await {
            Err(_) => {} // Nothing this frame.
            Ok(None) => self.handle_close(None).await,
            Ok(Some(Ok(msg))) => self.handle_frame(msg).await,
            Ok(Some(Err(e))) => {
                warn!(error = %e, "socket error");
                self.transport.trigger("error", &Value::String(e.to_string()));
                self.handle_close(None).await;
            }
        }
    }

    async fn handle_frame(&mut self, msg: Message) {
        match msg {
            Message::Text(text) => self.handle_text(&text),
            Message::Close(frame) => {
                let code = frame.map(|f| u16::from(f.code));
                self.handle_close(code).await;
            }
            // Protocol-level pings are answered by the socket layer.
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Binary(bin) => debug!(len = bin.len(), "ignoring binary frame"),
            Message::Frame(_) => {}
        }
    }

    fn handle_text(&mut self, text: &str) {
        match Inbound::parse(text) {
            // Not JSON: forwarded untouched, never fatal.
            Inbound::Raw(raw) => self.events.trigger("message", &Value::String(raw)),
            Inbound::Untyped(v) => self.events.trigger("message", &v),
            Inbound::Typed { kind, payload } => self.handle_typed(&kind, payload),
        }
    }

    fn handle_typed(&mut self, kind: &str, payload: Value) {
        match kind {
            // Consumed by the heartbeat; not an application event.
            "pong" => {
                self.last_pong = Instant::now();
            }
            "welcome" => {
                let welcome = Welcome::from_value(&payload);
                if let Some(token) = welcome.token {
                    self.store.save(&token);
                    self.token = Some(token);
                }
                if let Some(id) = welcome.player.as_ref().and_then(|p| p.id) {
                    self.player_id = Some(id);
                }
                info!(player = ?self.player_id, room = ?welcome.room_id, "welcome received");
                self.events.trigger("message", &payload);
                self.events.trigger("welcome", &payload);
            }
            _ => {
                self.events.trigger("message", &payload);
                self.events.trigger(kind, &payload);
            }
        }
    }

    async fn force_close(&mut self, code: u16, reason: &'static str) {
        warn!(code, reason, "forcing close");
        if let Some(ws) = self.ws.as_mut() {
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            };
            let _ = ws.send(Message::Close(Some(frame))).await;
        }
        self.handle_close(Some(code)).await;
    }

    /// Tears down the link. `None` means the peer vanished without a
    /// close frame, which counts as a dirty closure.
    async fn handle_close(&mut self, code: Option<u16>) {
        if self.ws.is_none() && self.status != SessionStatus::Open {
            return;
        }
        // Heartbeat stops with the link; a stale deadline must not fire
        // against the next socket.
        self.next_ping = None;
        if let Some(mut ws) = self.ws.take() {
            let _ = ws.close(None).await;
        }
        self.status = SessionStatus::Closed;
        info!(code = ?code, "channel closed");
        self.transport.trigger("close", &json!({ "code": code }));

        let clean = code.map(net::is_clean_close).unwrap_or(false);
        if !clean {
            self.schedule_reconnect();
        }
    }

    /// At most one reconnect timer exists; scheduling while one is
    /// pending is a no-op.
    fn schedule_reconnect(&mut self) {
        if self.status == SessionStatus::GaveUp || self.reconnect_at.is_some() {
            return;
        }
        self.attempts += 1;
        if self.attempts > self.cfg.max_reconnect_attempts {
            self.status = SessionStatus::GaveUp;
            warn!(
                attempts = self.attempts - 1,
                "reconnect attempts exhausted"
            );
            self.transport
                .trigger("reconnect_exhausted", &json!({ "attempts": self.attempts - 1 }));
            return;
        }
        let delay = backoff_delay(self.cfg.reconnect_base(), self.attempts);
        debug!(
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
        self.reconnect_at = Some(Instant::now() + delay);
    }
}
