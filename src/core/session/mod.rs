//! Session controller.
//!
//! Owns the assistant state machine and wires the stages together: capture
//! chunks flow through the mute gate to the transport, received audio flows
//! into the playback stage, and speech events from the proxy drive the
//! half-duplex interlock. The controller is the only component that decides
//! state transitions; the transport just reports what happened.

mod state;

pub use state::{AssistantState, SessionStats, SessionStatsSnapshot, Status, StatusCallback, UiEvent};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::core::aec::AecProcessor;
use crate::core::capture::{CaptureError, CaptureSink, CaptureStage};
use crate::core::playback::{PlaybackError, PlaybackStage, PlaybackState};
use crate::core::transport::{ProxyClient, TransportError};

/// Error types for session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),
    #[error("playback error: {0}")]
    Playback(#[from] PlaybackError),
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// State shared with the transport and capture callbacks. Holds no
/// transport handle, so callback registration cannot create a cycle.
struct SessionShared {
    config: CoreConfig,
    status: Mutex<Status>,
    status_callback: Mutex<Option<StatusCallback>>,
    mic_muted_for_speech: AtomicBool,
    capture: Arc<CaptureStage>,
    playback: Arc<PlaybackStage>,
    stats: SessionStats,
}

impl SessionShared {
    /// Apply a status mutation and publish the new status if it changed.
    async fn update_status(&self, mutate: impl FnOnce(&mut Status)) {
        let (changed, status, callback) = {
            let mut status = self.status.lock();
            let before = *status;
            mutate(&mut status);
            (
                *status != before,
                *status,
                self.status_callback.lock().clone(),
            )
        };
        if changed {
            debug!("status changed: {:?}", status);
            if let Some(callback) = callback {
                callback(status).await;
            }
        }
    }

    async fn set_state(&self, new_state: AssistantState) {
        self.update_status(|s| s.state = new_state).await;
    }

    async fn handle_transport_state(&self, connected: bool, close_code: u16) {
        self.update_status(|s| s.proxy_connected = connected).await;

        if connected {
            info!("proxy connected");
            return;
        }

        let streaming = self.status.lock().state == AssistantState::Streaming;
        if streaming {
            warn!(
                "transport lost while streaming (close code {}); entering error state",
                close_code
            );
            self.set_state(AssistantState::Error).await;
            self.capture.stop().await;
            // A stale mute would silently eat the next turn after reconnect.
            self.mic_muted_for_speech.store(false, Ordering::Release);
        } else {
            info!("proxy disconnected (close code {})", close_code);
        }
    }
}

/// The assistant session: one per device.
pub struct SessionController {
    shared: Arc<SessionShared>,
    transport: Arc<RwLock<ProxyClient>>,
    aec: Option<Arc<AecProcessor>>,
}

impl SessionController {
    /// Wire a controller from its collaborators. The AEC processor is only
    /// used when `config.aec_enabled` is set.
    ///
    /// Derive the collaborator configurations from the same `config`
    /// (`CaptureConfig::from`, `PlaybackConfig::from`,
    /// `TransportConfig::from_core`, `AecProcessor::from_core`) so the core
    /// knobs take effect in every stage.
    pub fn new(
        config: CoreConfig,
        transport: ProxyClient,
        capture: Arc<CaptureStage>,
        playback: Arc<PlaybackStage>,
        aec: Option<Arc<AecProcessor>>,
    ) -> Self {
        let shared = Arc::new(SessionShared {
            config,
            status: Mutex::new(Status::default()),
            status_callback: Mutex::new(None),
            mic_muted_for_speech: AtomicBool::new(false),
            capture,
            playback,
            stats: SessionStats::default(),
        });
        Self {
            shared,
            transport: Arc::new(RwLock::new(transport)),
            aec,
        }
    }

    /// Register the UI status callback.
    pub fn on_status(&self, callback: StatusCallback) {
        *self.shared.status_callback.lock() = Some(callback);
    }

    /// Register transport callbacks and open the connection.
    pub async fn start(&self) -> SessionResult<()> {
        let mut transport = self.transport.write().await;

        let shared = self.shared.clone();
        transport.on_audio(Arc::new(move |data: Bytes| {
            let shared = shared.clone();
            Box::pin(async move {
                match shared.playback.stream_write(&data).await {
                    Ok(()) => {}
                    Err(PlaybackError::NotReady) => {
                        debug!(
                            "dropping {} received bytes: no active playback stream",
                            data.len()
                        );
                    }
                    Err(e) => warn!("playback write failed: {}", e),
                }
            })
        }));

        let shared = self.shared.clone();
        transport.on_speech(Arc::new(move |is_speaking: bool| {
            let shared = shared.clone();
            Box::pin(async move {
                shared
                    .mic_muted_for_speech
                    .store(is_speaking, Ordering::Release);
                debug!("mic mute for assistant speech: {}", is_speaking);
            })
        }));

        let shared = self.shared.clone();
        transport.on_state(Arc::new(move |connected: bool, close_code: u16| {
            let shared = shared.clone();
            Box::pin(async move {
                shared.handle_transport_state(connected, close_code).await;
            })
        }));

        transport.connect().await?;
        Ok(())
    }

    /// Explicit reconnect after a disconnect was observed. The caller
    /// applies `transport_reconnect_backoff` between attempts.
    pub async fn reconnect(&self) -> SessionResult<()> {
        let mut transport = self.transport.write().await;
        transport.disconnect().await;
        transport.connect().await?;
        Ok(())
    }

    /// UI event ingress.
    pub async fn handle_ui_event(&self, event: UiEvent) -> SessionResult<()> {
        match event {
            UiEvent::RecordStart => self.record_start().await,
            UiEvent::RecordStop => self.record_stop().await,
        }
    }

    async fn record_start(&self) -> SessionResult<()> {
        let status = *self.shared.status.lock();
        if !status.proxy_connected {
            warn!("record start ignored: proxy not connected");
            return Ok(());
        }
        if status.state == AssistantState::Streaming {
            warn!("record start ignored: already streaming");
            return Ok(());
        }

        // Wire the capture sink first: enabling the AEC branch attaches the
        // playback reference tap, which must be in place before this turn's
        // worker starts feeding it.
        let sink = self.build_capture_sink();

        // Tear down any stale stream left from a previous turn.
        if self.shared.playback.state() != PlaybackState::Stopped {
            debug!("tearing down stale playback stream");
            self.shared.playback.stream_end().await?;
        }
        self.shared.playback.stream_start()?;

        self.shared.set_state(AssistantState::Streaming).await;

        self.shared.capture.start(sink)?;
        info!("recording started");
        Ok(())
    }

    async fn record_stop(&self) -> SessionResult<()> {
        if self.shared.status.lock().state != AssistantState::Streaming {
            warn!("record stop ignored: not streaming");
            return Ok(());
        }

        self.shared.set_state(AssistantState::Idle).await;
        self.shared.capture.stop().await;
        // The playback stream stays open so the assistant can finish
        // speaking; the next record start recycles it.
        info!("recording stopped");
        Ok(())
    }

    /// Build the capture sink: transport directly, or through the AEC
    /// branch when enabled.
    fn build_capture_sink(&self) -> CaptureSink {
        let transport_sink = self.transport_sink();

        if self.shared.config.aec_enabled {
            if let Some(aec) = &self.aec {
                self.shared.playback.set_reference_tap(aec.reference());
                aec.start(transport_sink);
                return aec.capture_sink();
            }
            warn!("aec enabled but no processor wired; sending mic audio unprocessed");
        }
        transport_sink
    }

    /// The terminal sink: mute gate, then transport. Send failures are
    /// absorbed and counted; the capture loop never sees them.
    fn transport_sink(&self) -> CaptureSink {
        let shared = self.shared.clone();
        let transport = self.transport.clone();
        Arc::new(move |chunk: Bytes| {
            let shared = shared.clone();
            let transport = transport.clone();
            Box::pin(async move {
                if shared.mic_muted_for_speech.load(Ordering::Acquire) {
                    shared.stats.chunks_muted.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                // An empty chunk only ever arrives when the capture stage
                // is configured to emit the end-of-turn marker; forward it.

                let result = {
                    let transport = transport.read().await;
                    transport.send_audio(chunk).await
                };
                match result {
                    Ok(()) => {
                        shared.stats.chunks_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TransportError::Timeout) => {
                        shared.stats.send_timeouts.fetch_add(1, Ordering::Relaxed);
                        warn!("dropping capture chunk: send timed out");
                    }
                    Err(TransportError::NotConnected) => {
                        shared.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                        debug!("dropping capture chunk: transport not connected");
                    }
                    Err(e) => {
                        shared.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                        warn!("dropping capture chunk: {}", e);
                    }
                }
            })
        })
    }

    /// Force the assistant state. Idempotent; the status surface publishes
    /// only on change.
    pub async fn set_state(&self, state: AssistantState) {
        self.shared.set_state(state).await;
    }

    /// Wi-Fi state from the host network stack.
    pub async fn set_wifi_connected(&self, connected: bool) {
        self.shared
            .update_status(|s| s.wifi_connected = connected)
            .await;
    }

    pub fn get_status(&self) -> Status {
        *self.shared.status.lock()
    }

    /// True while the proxy reports the assistant speaking.
    pub fn mic_muted_for_speech(&self) -> bool {
        self.shared.mic_muted_for_speech.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> SessionStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Stop everything: capture, AEC, playback, transport.
    pub async fn shutdown(&self) {
        info!("session shutting down");
        if self.shared.capture.is_running() {
            self.shared.capture.stop().await;
        }
        if let Some(aec) = &self.aec {
            aec.stop().await;
        }
        if self.shared.playback.state() != PlaybackState::Stopped {
            if let Err(e) = self.shared.playback.stream_end().await {
                warn!("playback teardown failed: {}", e);
            }
        }
        self.transport.write().await.disconnect().await;
        self.shared.set_state(AssistantState::Idle).await;
    }
}
