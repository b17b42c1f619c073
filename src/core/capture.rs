//! Microphone capture stage.
//!
//! Pulls fixed-size 32-bit frames from the I²S source, converts them to
//! 16-bit PCM at 16 kHz and emits 100 ms chunks to a sink callback. The
//! stage never stops on read errors; a dead microphone just reports zero
//! throughput until the driver recovers.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::CoreConfig;
use crate::core::pcm::samples_to_bytes;

/// Samples per I²S read (1,024 bytes of 32-bit data).
pub const I2S_FRAME_SAMPLES: usize = 256;

/// Arithmetic right shift bringing the 32-bit slot down to 16 bits.
const CONVERSION_SHIFT: u32 = 14;

/// Fixed software gain applied when the gain path is enabled.
const GAIN_FACTOR: i32 = 10;

/// How long `stop` waits for the task to observe the flag.
const STOP_GRACE: Duration = Duration::from_millis(50);

/// Error types for capture operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CaptureError {
    #[error("capture not initialized")]
    NotReady,
    #[error("capture already running")]
    AlreadyRunning,
    #[error("i2s read failed: {0}")]
    Io(String),
}

/// Result type for capture operations.
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Microphone input seam. The hardware driver behind this trait should
/// bound each read to roughly one frame period (~16 ms) plus a small
/// timeout so the capture loop can observe its stop flag promptly.
#[async_trait]
pub trait I2sSource: Send + Sync {
    /// Read one frame of raw 32-bit samples. Returns the sample count read;
    /// 0 means the driver had nothing within its deadline.
    async fn read_frame(&self, frame: &mut [i32]) -> CaptureResult<usize>;
}

/// Destination for converted capture chunks. Chunks are 3,200 bytes of
/// 16 kHz mono PCM; an empty payload is the optional end-of-stream marker.
pub type CaptureSink =
    Arc<dyn Fn(Bytes) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Configuration for the capture stage.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Samples per emitted chunk (1,600 = 100 ms at 16 kHz).
    pub chunk_samples: usize,
    /// Apply the fixed software gain after conversion.
    pub gain_enabled: bool,
    /// Emit one empty chunk when the task exits.
    pub emit_end_marker: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            chunk_samples: 1_600,
            gain_enabled: false,
            emit_end_marker: false,
        }
    }
}

impl From<&CoreConfig> for CaptureConfig {
    fn from(config: &CoreConfig) -> Self {
        Self {
            chunk_samples: config.capture_chunk_samples(),
            gain_enabled: false,
            emit_end_marker: config.emit_end_marker,
        }
    }
}

/// Convert one 32-bit I²S slot sample to 16-bit PCM.
///
/// `>>` on `i32` is an arithmetic shift, so negative samples keep their
/// sign through the conversion.
pub fn convert_sample(raw: i32) -> i16 {
    (raw >> CONVERSION_SHIFT) as i16
}

fn apply_gain(sample: i16) -> i16 {
    (i32::from(sample) * GAIN_FACTOR).clamp(-32_767, 32_767) as i16
}

/// Capture stage driving the microphone-to-sink pipeline.
pub struct CaptureStage {
    source: Arc<dyn I2sSource>,
    config: CaptureConfig,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureStage {
    pub fn new(source: Arc<dyn I2sSource>, config: CaptureConfig) -> Self {
        Self {
            source,
            config,
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    /// Start the capture task. Starting while already running is a no-op.
    pub fn start(&self, sink: CaptureSink) -> CaptureResult<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("capture already running");
            return Ok(());
        }

        let source = self.source.clone();
        let config = self.config.clone();
        let running = self.running.clone();
        let handle = tokio::spawn(capture_loop(source, config, running, sink));
        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Signal the task to exit and wait briefly for it to observe the flag.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            warn!("capture not running");
            return;
        }
        info!("stopping capture");

        let handle = self.task.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(STOP_GRACE, &mut handle).await.is_err() {
                // The loop observes the flag at its next read deadline.
                warn!("capture task still draining after stop");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

async fn capture_loop(
    source: Arc<dyn I2sSource>,
    config: CaptureConfig,
    running: Arc<AtomicBool>,
    sink: CaptureSink,
) {
    info!("capture task started");

    let mut frame = vec![0i32; I2S_FRAME_SAMPLES];
    let mut chunk: Vec<i16> = Vec::with_capacity(config.chunk_samples);

    while running.load(Ordering::Acquire) {
        let read = match source.read_frame(&mut frame).await {
            Ok(n) => n,
            Err(e) => {
                warn!("i2s read failed: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
        };
        if read == 0 {
            continue;
        }

        for &raw in &frame[..read] {
            let mut sample = convert_sample(raw);
            if config.gain_enabled {
                sample = apply_gain(sample);
            }
            chunk.push(sample);

            if chunk.len() == config.chunk_samples {
                sink(Bytes::from(samples_to_bytes(&chunk))).await;
                chunk.clear();
            }
        }
    }

    if config.emit_end_marker {
        sink(Bytes::new()).await;
    }

    info!("capture task exit");
}
