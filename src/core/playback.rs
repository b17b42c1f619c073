//! Streaming playback stage.
//!
//! Received 24 kHz PCM is pushed into a ring and a worker task writes it to
//! the I²S sink. The worker holds off until a pre-buffer threshold is
//! reached so initial network jitter never causes audible starvation, then
//! the sink hardware paces the drain. Volume is applied in place on the way
//! out, and an optional tap feeds the echo-canceller reference buffer.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::CoreConfig;
use crate::core::aec::AecReferenceBuffer;
use crate::core::pcm::bytes_to_samples;
use crate::core::ring::{PcmRing, PushMode, RingError};

/// Largest single pop handed to the I²S sink.
pub const POP_CHUNK_BYTES: usize = 4_096;

/// Pop deadline while the stream is live.
const STREAM_POP_DEADLINE: Duration = Duration::from_millis(100);

/// Pop deadline while draining after `stream_end`.
const DRAIN_POP_DEADLINE: Duration = Duration::from_millis(10);

/// How long `stream_end` waits for a graceful drain before cancelling.
const DRAIN_GRACE: Duration = Duration::from_secs(3);

/// Poll cadence while waiting for the pre-buffer threshold.
const PREBUFFER_POLL: Duration = Duration::from_millis(10);

/// Error types for playback operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PlaybackError {
    #[error("playback stream not active")]
    NotReady,
    #[error("playback already streaming")]
    AlreadyStreaming,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("i2s write failed: {0}")]
    Io(String),
    #[error("fatal playback failure: {0}")]
    Fatal(String),
}

/// Result type for playback operations.
pub type PlaybackResult<T> = Result<T, PlaybackError>;

/// Speaker output seam. The hardware driver paces writes at wall-clock
/// rate, so a write may legitimately take as long as the audio it carries.
#[async_trait]
pub trait I2sSink: Send + Sync {
    async fn write(&self, pcm: &[u8]) -> PlaybackResult<()>;
}

/// Playback stream lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Streaming,
    Draining,
}

/// Events emitted by the playback worker.
#[derive(Debug, Clone)]
pub enum PlaybackEvent {
    /// First write after the pre-buffer threshold was reached.
    Started,
    /// The ring drained after `stream_end`.
    Completed,
    /// The I²S sink failed; the stream is dead.
    Error(String),
}

/// Callback type for playback events.
pub type PlaybackEventCallback =
    Arc<dyn Fn(PlaybackEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Configuration for the playback stage.
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Ring capacity in bytes (96 KB ≈ 2 s at 24 kHz mono).
    pub ring_capacity_bytes: usize,
    /// Bytes required before the worker starts writing (≈ 500 ms).
    pub prebuffer_bytes: usize,
    /// Initial volume, integer percent 0..=100.
    pub volume_percent: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            ring_capacity_bytes: 96_000,
            prebuffer_bytes: 24_000,
            volume_percent: 100,
        }
    }
}

impl From<&CoreConfig> for PlaybackConfig {
    fn from(config: &CoreConfig) -> Self {
        Self {
            ring_capacity_bytes: config.playback_ring_bytes(),
            prebuffer_bytes: config.playback_prebuffer_bytes(),
            volume_percent: config.volume_percent,
        }
    }
}

/// Playback stage owning the ring and worker task.
pub struct PlaybackStage {
    sink: Arc<dyn I2sSink>,
    config: PlaybackConfig,
    ring: Mutex<Option<Arc<PcmRing>>>,
    state: Mutex<PlaybackState>,
    streaming_active: Arc<AtomicBool>,
    volume: Arc<AtomicU32>,
    worker: Mutex<Option<JoinHandle<()>>>,
    event_callback: Mutex<Option<PlaybackEventCallback>>,
    reference_tap: Arc<Mutex<Option<Arc<AecReferenceBuffer>>>>,
}

impl PlaybackStage {
    pub fn new(sink: Arc<dyn I2sSink>, config: PlaybackConfig) -> Self {
        let volume = config.volume_percent.min(100);
        Self {
            sink,
            config,
            ring: Mutex::new(None),
            state: Mutex::new(PlaybackState::Stopped),
            streaming_active: Arc::new(AtomicBool::new(false)),
            volume: Arc::new(AtomicU32::new(volume)),
            worker: Mutex::new(None),
            event_callback: Mutex::new(None),
            reference_tap: Arc::new(Mutex::new(None)),
        }
    }

    /// Register the event callback. Takes effect at the next `stream_start`.
    pub fn on_event(&self, callback: PlaybackEventCallback) {
        *self.event_callback.lock() = Some(callback);
    }

    /// Attach the echo-canceller reference tap. The worker reads the tap
    /// live, so this takes effect immediately, even for a stream that is
    /// already running; the tap itself never blocks the worker.
    pub fn set_reference_tap(&self, tap: Arc<AecReferenceBuffer>) {
        *self.reference_tap.lock() = Some(tap);
    }

    pub fn state(&self) -> PlaybackState {
        *self.state.lock()
    }

    /// Allocate the ring and spawn the worker task.
    pub fn stream_start(&self) -> PlaybackResult<()> {
        let mut state = self.state.lock();
        if *state != PlaybackState::Stopped {
            warn!("stream_start while {:?}", *state);
            return Err(PlaybackError::AlreadyStreaming);
        }

        let ring = Arc::new(
            PcmRing::new(self.config.ring_capacity_bytes)
                .map_err(|e| PlaybackError::Fatal(e.to_string()))?,
        );
        *self.ring.lock() = Some(ring.clone());
        self.streaming_active.store(true, Ordering::Release);
        *state = PlaybackState::Streaming;
        drop(state);

        let worker = tokio::spawn(playback_worker(
            self.sink.clone(),
            ring,
            self.streaming_active.clone(),
            self.volume.clone(),
            self.config.prebuffer_bytes,
            self.event_callback.lock().clone(),
            self.reference_tap.clone(),
        ));
        *self.worker.lock() = Some(worker);

        info!(
            "playback stream started (ring {} bytes, prebuffer {} bytes)",
            self.config.ring_capacity_bytes, self.config.prebuffer_bytes
        );
        Ok(())
    }

    /// Blocking push of a received PCM chunk into the ring.
    ///
    /// Waits without bound for space; the network producer absorbs the
    /// backpressure naturally.
    pub async fn stream_write(&self, pcm: &[u8]) -> PlaybackResult<()> {
        let ring = self
            .ring
            .lock()
            .clone()
            .ok_or(PlaybackError::NotReady)?;
        if !self.streaming_active.load(Ordering::Acquire) {
            return Err(PlaybackError::NotReady);
        }

        // A frame larger than the ring can never fit whole; feed it through
        // in ring-sized slices, each blocking until space frees up.
        let max_piece = self.config.ring_capacity_bytes / 2 & !1;
        for piece in pcm.chunks(max_piece.max(2)) {
            ring.push(piece, PushMode::Block, None)
                .await
                .map_err(map_ring_error)?;
        }
        Ok(())
    }

    /// End the stream: the worker drains whatever is buffered, then exits.
    /// After the grace window the worker is cancelled and the ring freed.
    pub async fn stream_end(&self) -> PlaybackResult<()> {
        {
            let mut state = self.state.lock();
            if *state == PlaybackState::Stopped {
                return Err(PlaybackError::NotReady);
            }
            *state = PlaybackState::Draining;
        }
        self.streaming_active.store(false, Ordering::Release);

        let worker = self.worker.lock().take();
        if let Some(mut worker) = worker {
            if tokio::time::timeout(DRAIN_GRACE, &mut worker).await.is_err() {
                warn!("playback drain timed out; cancelling worker");
                worker.abort();
            }
        }

        // Free the ring; waking any producer still blocked on it.
        let ring = self.ring.lock().take();
        if let Some(ring) = ring {
            ring.reset();
        }
        *self.state.lock() = PlaybackState::Stopped;
        info!("playback stream ended");
        Ok(())
    }

    /// Set the output volume in integer percent, 0..=100.
    pub fn set_volume(&self, percent: u32) -> PlaybackResult<()> {
        if percent > 100 {
            return Err(PlaybackError::InvalidArgument(format!(
                "volume {percent} out of range 0..=100"
            )));
        }
        self.volume.store(percent, Ordering::Release);
        Ok(())
    }

    pub fn volume(&self) -> u32 {
        self.volume.load(Ordering::Acquire)
    }

    /// Bytes currently buffered, 0 when no stream is active.
    pub fn buffered_bytes(&self) -> usize {
        self.ring.lock().as_ref().map_or(0, |r| r.len())
    }
}

fn map_ring_error(e: RingError) -> PlaybackError {
    match e {
        RingError::NotReady => PlaybackError::NotReady,
        RingError::InvalidArgument(m) => PlaybackError::InvalidArgument(m),
        RingError::Allocation(m) => PlaybackError::Fatal(m),
    }
}

/// Scale samples in place: `sample * percent / 100` with a 32-bit
/// intermediate. No clipping is needed for percent ≤ 100.
fn apply_volume(pcm: &mut [u8], percent: u32) {
    if percent == 100 {
        return;
    }
    for pair in pcm.chunks_exact_mut(2) {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        let scaled = (i32::from(sample) * percent as i32 / 100) as i16;
        pair.copy_from_slice(&scaled.to_le_bytes());
    }
}

async fn emit(callback: &Option<PlaybackEventCallback>, event: PlaybackEvent) {
    if let Some(callback) = callback {
        callback(event).await;
    }
}

async fn playback_worker(
    sink: Arc<dyn I2sSink>,
    ring: Arc<PcmRing>,
    streaming_active: Arc<AtomicBool>,
    volume: Arc<AtomicU32>,
    prebuffer_bytes: usize,
    event_callback: Option<PlaybackEventCallback>,
    reference_tap: Arc<Mutex<Option<Arc<AecReferenceBuffer>>>>,
) {
    info!("playback worker started");

    // Hold off until the pre-buffer fills; an ended stream drains whatever
    // is present.
    while ring.len() < prebuffer_bytes && streaming_active.load(Ordering::Acquire) {
        tokio::time::sleep(PREBUFFER_POLL).await;
    }

    let mut started = false;
    let mut buf = vec![0u8; POP_CHUNK_BYTES];

    loop {
        let deadline = if streaming_active.load(Ordering::Acquire) {
            STREAM_POP_DEADLINE
        } else {
            DRAIN_POP_DEADLINE
        };

        let popped = match ring.pop_up_to(&mut buf, POP_CHUNK_BYTES, deadline).await {
            Ok(n) => n,
            Err(e) => {
                error!("playback ring pop failed: {}", e);
                emit(&event_callback, PlaybackEvent::Error(e.to_string())).await;
                break;
            }
        };

        if popped == 0 {
            if !streaming_active.load(Ordering::Acquire) && ring.is_empty() {
                debug!("playback ring drained");
                emit(&event_callback, PlaybackEvent::Completed).await;
                break;
            }
            continue;
        }

        if !started {
            started = true;
            emit(&event_callback, PlaybackEvent::Started).await;
        }

        apply_volume(&mut buf[..popped], volume.load(Ordering::Acquire));

        // Read the tap live: it may be attached after the worker spawned.
        let tap = reference_tap.lock().clone();
        if let Some(tap) = tap {
            tap.feed(&bytes_to_samples(&buf[..popped]));
        }

        if let Err(e) = sink.write(&buf[..popped]).await {
            error!("i2s write failed: {}", e);
            emit(&event_callback, PlaybackEvent::Error(e.to_string())).await;
            break;
        }
    }

    info!("playback worker exit");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;

    /// Sink that records every byte it is handed.
    struct RecordingSink {
        bytes: SyncMutex<Vec<u8>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                bytes: SyncMutex::new(Vec::new()),
            })
        }

        fn written(&self) -> Vec<u8> {
            self.bytes.lock().clone()
        }
    }

    #[async_trait]
    impl I2sSink for RecordingSink {
        async fn write(&self, pcm: &[u8]) -> PlaybackResult<()> {
            self.bytes.lock().extend_from_slice(pcm);
            Ok(())
        }
    }

    fn stage(sink: Arc<RecordingSink>) -> PlaybackStage {
        PlaybackStage::new(sink, PlaybackConfig::default())
    }

    #[tokio::test]
    async fn prebuffer_gates_the_first_write() {
        let sink = RecordingSink::new();
        let playback = stage(sink.clone());
        playback.stream_start().unwrap();

        // 12,000 bytes is below the 24,000 byte threshold.
        playback.stream_write(&vec![1u8; 12_000][..]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(sink.written().is_empty());

        // Crossing the threshold releases the worker.
        playback.stream_write(&vec![1u8; 12_500][..]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!sink.written().is_empty());

        playback.stream_end().await.unwrap();
    }

    #[tokio::test]
    async fn drain_flushes_below_prebuffer() {
        let sink = RecordingSink::new();
        let playback = stage(sink.clone());
        playback.stream_start().unwrap();

        playback.stream_write(&[9u8; 2_000][..]).await.unwrap();
        playback.stream_end().await.unwrap();

        assert_eq!(sink.written().len(), 2_000);
        assert_eq!(playback.state(), PlaybackState::Stopped);
    }

    #[tokio::test]
    async fn events_fire_in_order() {
        let sink = RecordingSink::new();
        let playback = stage(sink.clone());

        let events = Arc::new(SyncMutex::new(Vec::new()));
        let callback_events = events.clone();
        playback.on_event(Arc::new(move |event| {
            let events = callback_events.clone();
            Box::pin(async move {
                events.lock().push(event);
            })
        }));

        playback.stream_start().unwrap();
        playback.stream_write(&vec![3u8; 30_000][..]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        playback.stream_end().await.unwrap();

        let events = events.lock();
        assert!(matches!(events.first(), Some(PlaybackEvent::Started)));
        assert!(matches!(events.last(), Some(PlaybackEvent::Completed)));
    }

    #[tokio::test]
    async fn volume_scales_samples() {
        let sink = RecordingSink::new();
        let playback = stage(sink.clone());
        playback.set_volume(50).unwrap();
        playback.stream_start().unwrap();

        let samples = vec![32_000i16; 1_000];
        let bytes = crate::core::pcm::samples_to_bytes(&samples);
        playback.stream_write(&bytes).await.unwrap();
        playback.stream_end().await.unwrap();

        let written = bytes_to_samples(&sink.written());
        assert_eq!(written.len(), 1_000);
        for sample in written {
            assert!((sample - 16_000).abs() <= 1, "got {sample}");
        }
    }

    #[tokio::test]
    async fn volume_over_100_is_rejected() {
        let playback = stage(RecordingSink::new());
        assert!(matches!(
            playback.set_volume(101),
            Err(PlaybackError::InvalidArgument(_))
        ));
        assert_eq!(playback.volume(), 100);
    }

    #[tokio::test]
    async fn write_without_stream_is_not_ready() {
        let playback = stage(RecordingSink::new());
        assert!(matches!(
            playback.stream_write(&[0u8; 2][..]).await,
            Err(PlaybackError::NotReady)
        ));
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let playback = stage(RecordingSink::new());
        playback.stream_start().unwrap();
        assert!(matches!(
            playback.stream_start(),
            Err(PlaybackError::AlreadyStreaming)
        ));
        playback.stream_end().await.unwrap();
    }

    #[tokio::test]
    async fn reference_tap_sees_downsampled_audio() {
        let sink = RecordingSink::new();
        let playback = stage(sink.clone());
        let tap = Arc::new(AecReferenceBuffer::new(16_000).unwrap());
        playback.set_reference_tap(tap.clone());

        playback.stream_start().unwrap();
        let bytes = crate::core::pcm::samples_to_bytes(&vec![1_200i16; 2_400]);
        playback.stream_write(&bytes).await.unwrap();
        playback.stream_end().await.unwrap();

        // 2,400 samples at 24 kHz become ~1,600 at 16 kHz; the worker pops
        // in 4,096-byte slices so per-slice flooring may shave a sample.
        let buffered = tap.buffered_samples();
        assert!((1_590..=1_600).contains(&buffered), "got {buffered}");
    }

    #[tokio::test]
    async fn reference_tap_attached_after_start_still_sees_audio() {
        let sink = RecordingSink::new();
        let playback = stage(sink.clone());

        playback.stream_start().unwrap();
        let tap = Arc::new(AecReferenceBuffer::new(16_000).unwrap());
        playback.set_reference_tap(tap.clone());

        let bytes = crate::core::pcm::samples_to_bytes(&vec![900i16; 2_400]);
        playback.stream_write(&bytes).await.unwrap();
        playback.stream_end().await.unwrap();

        assert!(tap.buffered_samples() > 0);
    }
}
