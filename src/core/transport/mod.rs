//! Persistent bidirectional transport to the assistant proxy.
//!
//! One WebSocket carries raw PCM both ways plus small JSON control frames.
//! The client keeps explicit state control: it never auto-reconnects, and
//! every connection transition is reported through the state callback so
//! the session controller alone decides what happens next.

mod messages;

pub use messages::ControlMessage;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::CoreConfig;

/// Error types for transport operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("transport not initialized")]
    NotReady,
    #[error("transport not connected")]
    NotConnected,
    #[error("send timed out")]
    Timeout,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("malformed control message: {0}")]
    Decode(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Callback for binary audio frames received from the proxy.
pub type AudioReceivedCallback =
    Arc<dyn Fn(Bytes) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Callback for connection state changes: `(connected, close_code)`.
/// The close code is 0 on connect and when the peer supplied none.
pub type StateChangeCallback =
    Arc<dyn Fn(bool, u16) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Callback for assistant speech events: `true` at speech start.
pub type SpeechEventCallback =
    Arc<dyn Fn(bool) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Configuration for the proxy client.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Proxy endpoint URL, e.g. `wss://proxy.example/ws`.
    pub endpoint_url: String,
    /// Optional bearer token sent on the upgrade request.
    pub auth_token: Option<String>,
    /// Session identifier appended as the final URL path segment so the
    /// proxy can correlate reconnects.
    pub session_id: String,
    /// Upper bound on a single `send_audio` call.
    pub send_timeout: Duration,
    /// Keep-alive ping cadence.
    pub keepalive_interval: Duration,
    /// Connect/handshake timeout.
    pub network_timeout: Duration,
    /// Depth of the outbound frame queue feeding the connection task.
    pub send_queue_depth: usize,
}

impl TransportConfig {
    pub fn new(endpoint_url: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            auth_token: None,
            session_id: session_id.into(),
            send_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(10),
            network_timeout: Duration::from_secs(10),
            send_queue_depth: 32,
        }
    }

    /// Derive the transport configuration from the core configuration, so
    /// its timing knobs take effect on the wire.
    pub fn from_core(config: &CoreConfig, session_id: impl Into<String>) -> Self {
        Self {
            auth_token: config.auth_token.clone(),
            send_timeout: config.transport_send_timeout,
            keepalive_interval: config.transport_keepalive,
            network_timeout: config.transport_reconnect_backoff,
            ..Self::new(config.endpoint_url.clone(), session_id)
        }
    }
}

/// Counters kept by the client. Hot-path failures are absorbed and counted
/// here rather than propagated.
#[derive(Debug, Default)]
pub struct TransportStats {
    pub frames_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub frames_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub send_timeouts: AtomicU64,
    pub decode_errors: AtomicU64,
}

/// Point-in-time copy of [`TransportStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportStatsSnapshot {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub send_timeouts: u64,
    pub decode_errors: u64,
}

impl TransportStats {
    fn snapshot(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            send_timeouts: self.send_timeouts.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

struct SendRequest {
    message: Message,
    ack: oneshot::Sender<Result<(), String>>,
}

#[derive(Clone)]
struct CallbackSet {
    on_audio: Option<AudioReceivedCallback>,
    on_state: Option<StateChangeCallback>,
    on_speech: Option<SpeechEventCallback>,
}

/// WebSocket client for the assistant proxy.
pub struct ProxyClient {
    config: TransportConfig,
    state: Arc<Mutex<ClientState>>,
    connected: Arc<Mutex<bool>>,
    stats: Arc<TransportStats>,
    send_tx: Option<mpsc::Sender<SendRequest>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    connection_handle: Option<JoinHandle<()>>,
    on_audio: Option<AudioReceivedCallback>,
    on_state: Option<StateChangeCallback>,
    on_speech: Option<SpeechEventCallback>,
}

impl ProxyClient {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(ClientState::Disconnected)),
            connected: Arc::new(Mutex::new(false)),
            stats: Arc::new(TransportStats::default()),
            send_tx: None,
            shutdown_tx: None,
            connection_handle: None,
            on_audio: None,
            on_state: None,
            on_speech: None,
        }
    }

    /// Register the binary-audio callback. Must be set before `connect`.
    pub fn on_audio(&mut self, callback: AudioReceivedCallback) {
        self.on_audio = Some(callback);
    }

    /// Register the connection state-change callback.
    pub fn on_state(&mut self, callback: StateChangeCallback) {
        self.on_state = Some(callback);
    }

    /// Register the assistant speech-event callback.
    pub fn on_speech(&mut self, callback: SpeechEventCallback) {
        self.on_speech = Some(callback);
    }

    fn build_request(&self) -> TransportResult<Request> {
        let mut url = Url::parse(&self.config.endpoint_url)
            .map_err(|e| TransportError::InvalidArgument(format!("invalid endpoint URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| {
                TransportError::InvalidArgument("endpoint URL cannot be a base".to_string())
            })?
            .push(&self.config.session_id);

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidArgument(e.to_string()))?;

        if let Some(token) = &self.config.auth_token {
            let value = format!("Bearer {token}")
                .parse()
                .map_err(|_| TransportError::InvalidArgument("malformed auth token".to_string()))?;
            request.headers_mut().insert("Authorization", value);
        }

        Ok(request)
    }

    /// Open the connection and wait for the handshake to complete.
    ///
    /// Connecting an already-connected client is a warning no-op; state
    /// transitions are explicit, so a dead connection must be
    /// `disconnect`ed before `connect` is called again.
    pub async fn connect(&mut self) -> TransportResult<()> {
        if self
            .connection_handle
            .as_ref()
            .is_some_and(|h| !h.is_finished())
        {
            warn!("proxy client already connected");
            return Ok(());
        }

        let request = self.build_request()?;

        // A stale Failed from a previous attempt must not short-circuit the
        // wait loop below.
        *self.state.lock() = ClientState::Connecting;

        let (send_tx, send_rx) = mpsc::channel(self.config.send_queue_depth);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        self.send_tx = Some(send_tx);
        self.shutdown_tx = Some(shutdown_tx);

        let callbacks = CallbackSet {
            on_audio: self.on_audio.clone(),
            on_state: self.on_state.clone(),
            on_speech: self.on_speech.clone(),
        };

        info!("connecting to proxy: {}", self.config.endpoint_url);
        let handle = tokio::spawn(run_connection(
            request,
            self.config.clone(),
            self.state.clone(),
            self.connected.clone(),
            self.stats.clone(),
            callbacks,
            send_rx,
            shutdown_rx,
        ));
        self.connection_handle = Some(handle);

        // Wait for the connection task to report a terminal handshake state.
        let deadline = tokio::time::Instant::now() + self.config.network_timeout;
        loop {
            match *self.state.lock() {
                ClientState::Connected => return Ok(()),
                ClientState::Failed => {
                    return Err(TransportError::ConnectionFailed(
                        "websocket handshake failed".to_string(),
                    ));
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(TransportError::ConnectionFailed(
                    "connect timed out".to_string(),
                ));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Send one binary audio frame.
    ///
    /// A zero-length payload is the legal end-of-turn marker. The call
    /// fails with `Timeout` if the frame cannot be handed to the wire
    /// within the configured send window, so a capture thread is never
    /// blocked longer than that.
    pub async fn send_audio(&self, data: Bytes) -> TransportResult<()> {
        if data.len() % 2 != 0 {
            return Err(TransportError::InvalidArgument(format!(
                "audio payload of {} bytes is not sample-aligned",
                data.len()
            )));
        }
        if !self.is_connected() {
            warn!("cannot send: transport not connected");
            return Err(TransportError::NotConnected);
        }
        let send_tx = self.send_tx.as_ref().ok_or(TransportError::NotReady)?;

        let len = data.len();
        if len == 0 {
            info!("sending empty frame to signal end of turn");
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        let request = SendRequest {
            message: Message::Binary(data.into()),
            ack: ack_tx,
        };

        let outcome = timeout(self.config.send_timeout, async {
            send_tx
                .send(request)
                .await
                .map_err(|_| TransportError::NotConnected)?;
            match ack_rx.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(TransportError::ConnectionFailed(e)),
                Err(_) => Err(TransportError::NotConnected),
            }
        })
        .await;

        match outcome {
            Ok(Ok(())) => {
                self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                self.stats.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
                debug!("sent {} byte audio frame", len);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                self.stats.send_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!("audio send timed out after {:?}", self.config.send_timeout);
                Err(TransportError::Timeout)
            }
        }
    }

    /// Mutex-guarded connected flag combined with connection-task liveness.
    pub fn is_connected(&self) -> bool {
        let connected = *self.connected.lock();
        connected
            && self
                .connection_handle
                .as_ref()
                .is_some_and(|h| !h.is_finished())
    }

    /// Close the connection and wait for the task to exit.
    pub async fn disconnect(&mut self) {
        if let Some(shutdown) = &self.shutdown_tx {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.connection_handle.take() {
            if timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("connection task did not exit within shutdown grace");
            }
        }
        self.send_tx = None;
        self.shutdown_tx = None;
        *self.connected.lock() = false;
        *self.state.lock() = ClientState::Disconnected;
        info!("proxy client disconnected");
    }

    pub fn stats(&self) -> TransportStatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for ProxyClient {
    fn drop(&mut self) {
        if let Some(shutdown) = &self.shutdown_tx {
            let _ = shutdown.send(());
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_connection(
    request: Request,
    config: TransportConfig,
    state: Arc<Mutex<ClientState>>,
    connected: Arc<Mutex<bool>>,
    stats: Arc<TransportStats>,
    callbacks: CallbackSet,
    mut send_rx: mpsc::Receiver<SendRequest>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    *state.lock() = ClientState::Connecting;

    let ws_stream = match timeout(config.network_timeout, connect_async(request)).await {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(e)) => {
            error!("failed to connect to proxy: {}", e);
            *state.lock() = ClientState::Failed;
            return;
        }
        Err(_) => {
            error!("proxy handshake timed out");
            *state.lock() = ClientState::Failed;
            return;
        }
    };

    info!("proxy websocket connected");
    *connected.lock() = true;
    *state.lock() = ClientState::Connected;
    if let Some(on_state) = &callbacks.on_state {
        on_state(true, 0).await;
    }

    let (mut ws_sink, mut ws_source) = ws_stream.split();

    let mut keepalive = tokio::time::interval_at(
        tokio::time::Instant::now() + config.keepalive_interval,
        config.keepalive_interval,
    );

    let mut close_code: u16 = 0;
    let mut close_reported = false;

    loop {
        tokio::select! {
            Some(request) = send_rx.recv() => {
                let result = ws_sink
                    .send(request.message)
                    .await
                    .map_err(|e| e.to_string());
                let failed = result.is_err();
                if let Err(e) = &result {
                    error!("websocket send failed: {}", e);
                }
                let _ = request.ack.send(result);
                if failed {
                    break;
                }
            }

            _ = keepalive.tick() => {
                if let Err(e) = ws_sink.send(Message::Ping(Vec::new().into())).await {
                    error!("keep-alive ping failed: {}", e);
                    break;
                }
                debug!("sent keep-alive ping");
            }

            incoming = ws_source.next() => {
                match incoming {
                    Some(Ok(message)) => {
                        if handle_message(
                            message,
                            &callbacks,
                            &stats,
                            &connected,
                            &mut close_code,
                            &mut close_reported,
                        )
                        .await
                        {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        error!("websocket error: {}", e);
                        break;
                    }
                    None => {
                        info!("websocket stream ended");
                        break;
                    }
                }
            }

            _ = shutdown_rx.recv() => {
                debug!("transport shutdown signal received");
                let _ = ws_sink.send(Message::Close(None)).await;
                break;
            }
        }
    }

    *connected.lock() = false;
    *state.lock() = ClientState::Disconnected;
    if !close_reported {
        if let Some(on_state) = &callbacks.on_state {
            on_state(false, close_code).await;
        }
    }
    info!("proxy connection task exit");
}

/// Dispatch one received frame. Returns true when the connection is over.
async fn handle_message(
    message: Message,
    callbacks: &CallbackSet,
    stats: &TransportStats,
    connected: &Mutex<bool>,
    close_code: &mut u16,
    close_reported: &mut bool,
) -> bool {
    match message {
        Message::Binary(data) => {
            stats.frames_received.fetch_add(1, Ordering::Relaxed);
            stats
                .bytes_received
                .fetch_add(data.len() as u64, Ordering::Relaxed);
            debug!("received {} byte audio frame", data.len());
            if let Some(on_audio) = &callbacks.on_audio {
                on_audio(Bytes::from(data)).await;
            }
            false
        }
        Message::Text(text) => {
            debug!("received control frame: {}", text.as_str());
            match ControlMessage::parse(text.as_str()) {
                Ok(ControlMessage::SpeechStart) => {
                    info!("assistant started speaking");
                    if let Some(on_speech) = &callbacks.on_speech {
                        on_speech(true).await;
                    }
                }
                Ok(ControlMessage::SpeechEnd) => {
                    info!("assistant stopped speaking");
                    if let Some(on_speech) = &callbacks.on_speech {
                        on_speech(false).await;
                    }
                }
                Ok(ControlMessage::Unknown) => {
                    warn!("ignoring control message with unknown type: {}", text.as_str());
                }
                Err(e) => {
                    stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("failed to parse control message: {}", e);
                }
            }
            false
        }
        Message::Close(frame) => {
            let (code, reason) = frame
                .map(|f| (u16::from(f.code), f.reason.to_string()))
                .unwrap_or((0, String::new()));
            if code == 1_000 {
                info!("websocket close: normal closure (reason='{}')", reason);
            } else {
                warn!("websocket close: code={}, reason='{}'", code, reason);
            }
            *close_code = code;
            *connected.lock() = false;
            if let Some(on_state) = &callbacks.on_state {
                on_state(false, code).await;
            }
            *close_reported = true;
            false
        }
        Message::Ping(payload) => {
            // Pong is handled by the websocket library.
            debug!("received ping ({} bytes)", payload.len());
            false
        }
        Message::Pong(_) => {
            debug!("received pong (keepalive)");
            false
        }
        Message::Frame(_) => {
            warn!("ignoring unexpected raw frame");
            false
        }
    }
}
