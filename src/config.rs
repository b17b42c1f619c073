//! In-process configuration for the endpoint core.
//!
//! There is no CLI surface and no environment lookup; the embedding
//! application constructs a [`CoreConfig`] and hands it to the session
//! controller. Sample rates are fixed by the wire protocol.

use std::time::Duration;

/// Capture sample rate in Hz (device to proxy). Fixed by the wire protocol.
pub const CAPTURE_SAMPLE_RATE_HZ: u32 = 16_000;

/// Playback sample rate in Hz (proxy to device). Fixed by the wire protocol.
pub const PLAYBACK_SAMPLE_RATE_HZ: u32 = 24_000;

/// Configuration for the audio session core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Endpoint URL of the proxy (required), e.g. `wss://proxy.example/ws`.
    pub endpoint_url: String,
    /// Opaque bearer token sent as a transport header when present.
    pub auth_token: Option<String>,
    /// Capture chunk duration. 100 ms = 1,600 samples at 16 kHz.
    pub capture_chunk_ms: u32,
    /// Bytes the playback ring must hold before the worker starts writing.
    pub playback_prebuffer_ms: u32,
    /// Total playback ring capacity.
    pub playback_ring_capacity_ms: u32,
    /// Upper bound on a single transport send before it fails with `Timeout`.
    pub transport_send_timeout: Duration,
    /// Keep-alive ping cadence on the transport.
    pub transport_keepalive: Duration,
    /// Network/connect timeout and the backoff the embedder should apply
    /// between explicit reconnect attempts. The core never auto-reconnects.
    pub transport_reconnect_backoff: Duration,
    /// Whether the acoustic-echo-cancellation branch is wired in.
    pub aec_enabled: bool,
    /// Window of downsampled playback retained as the AEC reference signal.
    pub aec_reference_window_ms: u32,
    /// Playback volume, integer percent 0..=100.
    pub volume_percent: u32,
    /// Emit a zero-length capture chunk as an end-of-turn marker on stop.
    /// Off by default: the proxy's endpoint VAD is authoritative.
    pub emit_end_marker: bool,
}

impl CoreConfig {
    /// Create a configuration with the protocol defaults for `endpoint_url`.
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            auth_token: None,
            capture_chunk_ms: 100,
            playback_prebuffer_ms: 500,
            playback_ring_capacity_ms: 2_000,
            transport_send_timeout: Duration::from_millis(5_000),
            transport_keepalive: Duration::from_millis(10_000),
            transport_reconnect_backoff: Duration::from_millis(10_000),
            aec_enabled: false,
            aec_reference_window_ms: 500,
            volume_percent: 100,
            emit_end_marker: false,
        }
    }

    /// Capture chunk size in samples (mono, 16 kHz).
    pub fn capture_chunk_samples(&self) -> usize {
        (CAPTURE_SAMPLE_RATE_HZ / 1_000) as usize * self.capture_chunk_ms as usize
    }

    /// Capture chunk size in bytes (16-bit samples).
    pub fn capture_chunk_bytes(&self) -> usize {
        self.capture_chunk_samples() * 2
    }

    /// Playback pre-buffer threshold in bytes.
    pub fn playback_prebuffer_bytes(&self) -> usize {
        (PLAYBACK_SAMPLE_RATE_HZ / 1_000) as usize * self.playback_prebuffer_ms as usize * 2
    }

    /// Playback ring capacity in bytes.
    pub fn playback_ring_bytes(&self) -> usize {
        (PLAYBACK_SAMPLE_RATE_HZ / 1_000) as usize * self.playback_ring_capacity_ms as usize * 2
    }

    /// AEC reference window in bytes of 16 kHz mono PCM.
    pub fn aec_reference_bytes(&self) -> usize {
        (CAPTURE_SAMPLE_RATE_HZ / 1_000) as usize * self.aec_reference_window_ms as usize * 2
    }
}
