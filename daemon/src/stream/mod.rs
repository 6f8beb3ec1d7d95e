//! Feedback stream client.
//!
//! Owns at most one WebSocket connection to the job feedback endpoint:
//!
//! - `Idle -> Connecting -> Open -> Idle`, with scheduled reconnects after
//!   unclean closes (bounded exponential backoff)
//! - authorization token acquisition with its own retry budget, since the
//!   signer may not be ready when the first connect happens
//! - heartbeat pings while open
//! - fan-out of normalized events to every registered receiver
//!
//! All state transitions happen under one mutex. Every `connect()` and
//! `disconnect()` bumps a generation number; a connection task whose
//! generation is stale can no longer change state or schedule reconnects.

pub mod protocol;

use crate::auth::AuthSession;
use crate::backoff::Backoff;
use crate::config::{EndpointResolver, StreamConfig};
use common::JobFeedback;
use futures_util::{SinkExt, StreamExt};
use protocol::{ClientMessage, ServerMessage};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

type FeedbackSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum UrlError {
    #[error("invalid server URL: {0}")]
    Parse(#[from] url::ParseError),

    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),
}

/// Build the feedback endpoint URL from the API base URL.
pub fn feedback_url(base_url: &str) -> Result<Url, UrlError> {
    let mut url = Url::parse(base_url)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(UrlError::UnsupportedScheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|_| UrlError::UnsupportedScheme(scheme.to_string()))?;
    let path = format!("{}{}", url.path().trim_end_matches('/'), common::FEEDBACK_PATH);
    url.set_path(&path);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectInfo {
    pub code: Option<u16>,
    pub reason: String,
    /// Only a close frame with code 1000 counts as clean.
    pub clean: bool,
}

impl DisconnectInfo {
    fn unclean(reason: impl Into<String>) -> Self {
        Self {
            code: None,
            reason: reason.into(),
            clean: false,
        }
    }

    fn from_frame(frame: Option<CloseFrame>) -> Self {
        match frame {
            Some(frame) => Self {
                code: Some(u16::from(frame.code)),
                reason: frame.reason.as_str().to_string(),
                clean: frame.code == CloseCode::Normal,
            },
            None => Self::unclean("closed without a close frame"),
        }
    }

    fn client_closed() -> Self {
        Self {
            code: Some(u16::from(CloseCode::Normal)),
            reason: "client disconnected".to_string(),
            clean: true,
        }
    }
}

impl fmt::Display for DisconnectInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code: {})", self.reason, code),
            None => write!(f, "{}", self.reason),
        }
    }
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Connected,
    Disconnected(DisconnectInfo),
    Feedback(JobFeedback),
    Error(String),
}

struct ActiveConnection {
    shutdown: oneshot::Sender<()>,
}

struct ClientState {
    phase: ConnectionState,
    generation: u64,
    reconnect: Backoff,
    leases: usize,
    connection: Option<ActiveConnection>,
    start_timer: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
}

struct ClientInner {
    config: StreamConfig,
    session: Arc<dyn AuthSession>,
    endpoint: Arc<dyn EndpointResolver>,
    connected: AtomicBool,
    listeners: Mutex<Vec<mpsc::UnboundedSender<StreamEvent>>>,
    state: Mutex<ClientState>,
}

/// Handle to the feedback stream. Cheap to clone; all clones share one
/// connection.
#[derive(Clone)]
pub struct FeedbackClient {
    inner: Arc<ClientInner>,
}

impl FeedbackClient {
    pub fn new(
        config: StreamConfig,
        session: Arc<dyn AuthSession>,
        endpoint: Arc<dyn EndpointResolver>,
    ) -> Self {
        let reconnect = Backoff::new(
            config.reconnect_base_delay(),
            config.reconnect_max_delay(),
            config.max_reconnect_attempts,
        );
        Self {
            inner: Arc::new(ClientInner {
                config,
                session,
                endpoint,
                connected: AtomicBool::new(false),
                listeners: Mutex::new(Vec::new()),
                state: Mutex::new(ClientState {
                    phase: ConnectionState::Idle,
                    generation: 0,
                    reconnect,
                    leases: 0,
                    connection: None,
                    start_timer: None,
                    reconnect_timer: None,
                }),
            }),
        }
    }

    /// Register a new receiver. Every receiver sees every event, in order.
    pub fn events(&self) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.listeners.lock().unwrap().push(tx);
        rx
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().unwrap().phase
    }

    pub fn active_leases(&self) -> usize {
        self.inner.state.lock().unwrap().leases
    }

    /// Connect after the configured start-up delay. Repeated calls while a
    /// start is pending or a connection exists do nothing.
    pub fn start(&self) {
        let mut state = self.inner.state.lock().unwrap();
        self.start_locked(&mut state);
    }

    fn start_locked(&self, state: &mut ClientState) {
        let pending = state.start_timer.as_ref().is_some_and(|timer| !timer.is_finished());
        if pending || state.phase != ConnectionState::Idle {
            return;
        }
        let delay = self.inner.config.start_delay();
        let generation = state.generation;
        log::debug!("Feedback stream starting in {:?}", delay);
        let client = self.clone();
        state.start_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = client.inner.state.lock().unwrap();
            if state.generation == generation {
                state.start_timer = None;
                client.open_locked(&mut state);
            }
        }));
    }

    /// Open the connection unless one is already open or being opened.
    /// Without a login session this stays idle. An explicit connect starts
    /// with a fresh reconnect budget.
    pub fn connect(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.phase == ConnectionState::Idle {
            state.reconnect.reset();
        }
        self.open_locked(&mut state);
    }

    fn open_locked(&self, state: &mut ClientState) {
        if state.phase != ConnectionState::Idle {
            log::debug!("Feedback stream already {}, ignoring connect", state.phase);
            return;
        }
        if !self.inner.session.is_logged_in() {
            log::debug!("No active session, feedback stream stays idle");
            return;
        }
        if let Some(timer) = state.reconnect_timer.take() {
            timer.abort();
        }

        state.generation += 1;
        state.phase = ConnectionState::Connecting;
        let generation = state.generation;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        state.connection = Some(ActiveConnection { shutdown: shutdown_tx });

        let client = self.clone();
        tokio::spawn(async move {
            client.run_connection(generation, shutdown_rx).await;
        });
    }

    /// Cancel pending timers, close the connection and reset the reconnect
    /// budget. Safe to call at any time.
    pub fn disconnect(&self) {
        let mut state = self.inner.state.lock().unwrap();
        self.disconnect_locked(&mut state);
    }

    fn disconnect_locked(&self, state: &mut ClientState) {
        if let Some(timer) = state.start_timer.take() {
            timer.abort();
        }
        if let Some(timer) = state.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(connection) = state.connection.take() {
            let _ = connection.shutdown.send(());
        }
        let was_open = state.phase == ConnectionState::Open;
        state.generation += 1;
        state.phase = ConnectionState::Idle;
        state.reconnect.reset();
        self.inner.connected.store(false, Ordering::SeqCst);

        if was_open {
            log::info!("Feedback stream disconnected");
            self.emit(StreamEvent::Disconnected(DisconnectInfo::client_closed()));
        }
    }

    /// Register interest in the stream. The first lease starts it, dropping
    /// the last one disconnects it.
    pub fn acquire(&self) -> StreamLease {
        let mut state = self.inner.state.lock().unwrap();
        state.leases += 1;
        if state.leases == 1 {
            self.start_locked(&mut state);
        }
        drop(state);
        StreamLease {
            client: self.clone(),
        }
    }

    fn release(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.leases = state.leases.saturating_sub(1);
        if state.leases == 0 {
            log::debug!("Last stream consumer gone, disconnecting");
            self.disconnect_locked(&mut state);
        }
    }

    fn emit(&self, event: StreamEvent) {
        let mut listeners = self.inner.listeners.lock().unwrap();
        listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }

    async fn run_connection(self, generation: u64, mut shutdown: oneshot::Receiver<()>) {
        let url = match self.resolve_url() {
            Ok(url) => url,
            Err(e) => {
                log::error!("Cannot build feedback URL: {:#}", e);
                self.settle_idle(generation, format!("Cannot build feedback URL: {:#}", e));
                return;
            }
        };

        let token = tokio::select! {
            token = self.acquire_token(url.as_str()) => token,
            _ = &mut shutdown => return,
        };
        let Some(token) = token else {
            self.settle_idle(generation, "Unable to obtain authorization token".to_string());
            return;
        };

        let mut request_url = url.clone();
        request_url.query_pairs_mut().append_pair("auth", &token);

        log::info!("Connecting to feedback stream at {}", url);
        let connect_result = tokio::select! {
            result = tokio_tungstenite::connect_async(request_url.as_str()) => result,
            _ = &mut shutdown => return,
        };
        let mut socket = match connect_result {
            Ok((socket, _response)) => socket,
            Err(e) => {
                log::warn!("Feedback stream connection failed: {}", e);
                self.emit_if_current(generation, StreamEvent::Error(format!("Connection failed: {}", e)));
                self.handle_close(generation, DisconnectInfo::unclean(e.to_string()));
                return;
            }
        };

        if !self.mark_open(generation) {
            close_quietly(&mut socket).await;
            return;
        }

        match self.drive(generation, &mut socket, &mut shutdown).await {
            Some(info) => self.handle_close(generation, info),
            None => close_quietly(&mut socket).await,
        }
    }

    fn resolve_url(&self) -> anyhow::Result<Url> {
        let base = self.inner.endpoint.base_url()?;
        Ok(feedback_url(&base)?)
    }

    /// Ask the session for a token, backing off while the signer is not
    /// ready. `None` once the attempt budget is spent.
    async fn acquire_token(&self, url: &str) -> Option<String> {
        let config = &self.inner.config;
        let attempts = config.token_attempts.max(1);
        let mut backoff = Backoff::new(config.token_base_delay(), config.token_max_delay(), attempts - 1);
        loop {
            match self.inner.session.sign_request(url, "GET").await {
                Ok(token) => return Some(token),
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        log::debug!(
                            "Auth token attempt {}/{} failed ({}), retrying in {:?}",
                            backoff.attempts(),
                            attempts,
                            e,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        log::error!("Giving up on auth token after {} attempts: {}", attempts, e);
                        return None;
                    }
                },
            }
        }
    }

    /// Pump one open connection until it closes (`Some`) or shutdown is
    /// requested (`None`).
    async fn drive(
        &self,
        generation: u64,
        socket: &mut FeedbackSocket,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> Option<DisconnectInfo> {
        let period = self.inner.config.heartbeat_interval();
        let mut heartbeat = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = &mut *shutdown => return None,
                _ = heartbeat.tick() => {
                    let ping = match protocol::encode(&ClientMessage::Ping) {
                        Ok(ping) => ping,
                        Err(e) => {
                            log::error!("Failed to encode ping: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = socket.send(Message::text(ping)).await {
                        log::warn!("Heartbeat failed: {}", e);
                        return Some(DisconnectInfo::unclean(format!("Heartbeat failed: {}", e)));
                    }
                }
                frame = socket.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_text(generation, text.as_str()),
                    Some(Ok(Message::Close(frame))) => return Some(DisconnectInfo::from_frame(frame)),
                    Some(Ok(Message::Binary(_))) => log::debug!("Ignoring binary frame on feedback stream"),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("Feedback stream error: {}", e);
                        self.emit_if_current(generation, StreamEvent::Error(e.to_string()));
                        return Some(DisconnectInfo::unclean(e.to_string()));
                    }
                    None => return Some(DisconnectInfo::unclean("stream ended")),
                },
            }
        }
    }

    fn handle_text(&self, generation: u64, text: &str) {
        match protocol::decode(text) {
            Ok(ServerMessage::Connected { message }) => {
                log::info!("Feedback stream says: {}", message.as_deref().unwrap_or("connected"));
            }
            Ok(ServerMessage::Pong) => log::trace!("pong"),
            Ok(ServerMessage::Error { error }) => {
                log::warn!("Feedback stream reported an error: {}", error);
                self.emit_if_current(generation, StreamEvent::Error(error));
            }
            Ok(ServerMessage::JobFeedback { feedback }) => match feedback.normalize() {
                Ok(feedback) => self.emit_if_current(generation, StreamEvent::Feedback(feedback)),
                Err(e) => log::warn!("Dropping job feedback: {}", e),
            },
            Ok(ServerMessage::Unknown) => log::debug!("Ignoring message of unknown type: {}", text),
            Err(e) => log::warn!("Dropping malformed message: {}", e),
        }
    }

    fn mark_open(&self, generation: u64) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        if state.generation != generation {
            return false;
        }
        state.phase = ConnectionState::Open;
        state.reconnect.reset();
        self.inner.connected.store(true, Ordering::SeqCst);
        log::info!("Feedback stream connected");
        self.emit(StreamEvent::Connected);
        true
    }

    fn emit_if_current(&self, generation: u64, event: StreamEvent) {
        let state = self.inner.state.lock().unwrap();
        if state.generation == generation {
            self.emit(event);
        }
    }

    /// Give up on this attempt without scheduling a reconnect.
    fn settle_idle(&self, generation: u64, error: String) {
        let mut state = self.inner.state.lock().unwrap();
        if state.generation != generation {
            return;
        }
        state.phase = ConnectionState::Idle;
        state.connection = None;
        self.emit(StreamEvent::Error(error));
    }

    fn handle_close(&self, generation: u64, info: DisconnectInfo) {
        let mut state = self.inner.state.lock().unwrap();
        if state.generation != generation {
            return;
        }
        state.phase = ConnectionState::Idle;
        state.connection = None;
        self.inner.connected.store(false, Ordering::SeqCst);
        self.emit(StreamEvent::Disconnected(info.clone()));

        if info.clean {
            log::info!("Feedback stream closed: {}", info);
            return;
        }
        match state.reconnect.next_delay() {
            Some(delay) => {
                log::info!(
                    "Feedback stream lost ({}), reconnecting in {:?} (attempt {}/{})",
                    info,
                    delay,
                    state.reconnect.attempts(),
                    state.reconnect.max_attempts()
                );
                let client = self.clone();
                state.reconnect_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let mut state = client.inner.state.lock().unwrap();
                    if state.generation == generation {
                        state.reconnect_timer = None;
                        client.open_locked(&mut state);
                    }
                }));
            }
            None => log::warn!(
                "Feedback stream lost ({}), giving up after {} reconnect attempts",
                info,
                state.reconnect.attempts()
            ),
        }
    }
}

async fn close_quietly(socket: &mut FeedbackSocket) {
    if tokio::time::timeout(CLOSE_TIMEOUT, socket.close(None)).await.is_err() {
        log::debug!("Timed out closing feedback stream");
    }
}

/// Keeps the feedback stream running while held.
pub struct StreamLease {
    client: FeedbackClient,
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        self.client.release();
    }
}
