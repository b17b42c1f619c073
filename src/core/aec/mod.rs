//! Acoustic echo cancellation branch.
//!
//! Optional stage between capture and transport. The DSP itself lives
//! behind the [`EchoCanceller`] seam; this module owns the plumbing: the
//! reference tap from playback, mic/reference interleaving, and the queue
//! that decouples cancellation from the (possibly network-blocking) sink.

mod reference;

pub use reference::{AecReferenceBuffer, MAX_RESAMPLE_CHUNK};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::core::capture::CaptureSink;
use crate::core::pcm::{bytes_to_samples, samples_to_bytes};
use crate::core::ring::RingResult;

/// Cleaned chunks buffered between the fetch task and the output task.
const OUTPUT_QUEUE_CHUNKS: usize = 10;

/// Longest a canceller `fetch` may wait before returning empty.
pub const FETCH_DEADLINE: Duration = Duration::from_secs(2);

/// Grace given to the fetch/output tasks on shutdown.
const STOP_GRACE: Duration = Duration::from_secs(3);

/// Error types for AEC operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AecError {
    #[error("aec not running")]
    NotReady,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("aec engine failure: {0}")]
    Fatal(String),
}

/// Result type for AEC operations.
pub type AecResult<T> = Result<T, AecError>;

/// Echo-cancellation DSP seam.
///
/// The engine consumes interleaved `[mic0, ref0, mic1, ref1, …]` frames of
/// `chunk_size()` samples per channel and produces cleaned mic audio on its
/// own cadence. `fetch` may wait up to [`FETCH_DEADLINE`] for output.
#[async_trait]
pub trait EchoCanceller: Send + Sync {
    /// Samples per channel the engine expects per `feed`.
    fn chunk_size(&self) -> usize;
    /// Feed one interleaved mic+reference frame.
    fn feed(&self, interleaved: &[i16]) -> AecResult<()>;
    /// Fetch the next cleaned mic chunk; empty when nothing is ready.
    async fn fetch(&self) -> AecResult<Vec<i16>>;
}

/// Canceller that passes the microphone channel through unchanged.
///
/// Stands in where no DSP library is wired; the plumbing (interleave,
/// queue, tasks) stays identical so enabling a real engine is a one-line
/// swap.
pub struct PassthroughCanceller {
    chunk_size: usize,
    queue: Mutex<VecDeque<Vec<i16>>>,
    available: Notify,
}

impl PassthroughCanceller {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            queue: Mutex::new(VecDeque::new()),
            available: Notify::new(),
        }
    }
}

#[async_trait]
impl EchoCanceller for PassthroughCanceller {
    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn feed(&self, interleaved: &[i16]) -> AecResult<()> {
        if interleaved.len() != self.chunk_size * 2 {
            return Err(AecError::InvalidArgument(format!(
                "expected {} interleaved samples, got {}",
                self.chunk_size * 2,
                interleaved.len()
            )));
        }
        let mic: Vec<i16> = interleaved.iter().step_by(2).copied().collect();
        self.queue.lock().push_back(mic);
        self.available.notify_waiters();
        Ok(())
    }

    async fn fetch(&self) -> AecResult<Vec<i16>> {
        let deadline = tokio::time::Instant::now() + FETCH_DEADLINE;
        loop {
            let notified = self.available.notified();
            if let Some(chunk) = self.queue.lock().pop_front() {
                return Ok(chunk);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }
}

/// AEC stage: interleaves mic and reference audio into the canceller and
/// routes cleaned audio to the user sink through a bounded queue.
pub struct AecProcessor {
    canceller: Arc<dyn EchoCanceller>,
    reference: Arc<AecReferenceBuffer>,
    running: Arc<AtomicBool>,
    queue_tx: Mutex<Option<mpsc::Sender<Vec<i16>>>>,
    fetch_task: Mutex<Option<JoinHandle<()>>>,
    output_task: Mutex<Option<JoinHandle<()>>>,
    pending: Mutex<Vec<i16>>,
}

impl AecProcessor {
    pub fn new(canceller: Arc<dyn EchoCanceller>, reference: Arc<AecReferenceBuffer>) -> Self {
        Self {
            canceller,
            reference,
            running: Arc::new(AtomicBool::new(false)),
            queue_tx: Mutex::new(None),
            fetch_task: Mutex::new(None),
            output_task: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Build a processor whose reference window is sized from the core
    /// configuration.
    pub fn from_core(canceller: Arc<dyn EchoCanceller>, config: &CoreConfig) -> RingResult<Self> {
        let reference = Arc::new(AecReferenceBuffer::new(config.aec_reference_bytes())?);
        Ok(Self::new(canceller, reference))
    }

    /// Samples per channel the engine processes per call.
    pub fn chunk_size(&self) -> usize {
        self.canceller.chunk_size()
    }

    /// The reference buffer playback should tap into.
    pub fn reference(&self) -> Arc<AecReferenceBuffer> {
        self.reference.clone()
    }

    /// Spawn the fetch and output tasks. Cleaned audio flows to `sink`,
    /// which may block on network I/O without stalling the canceller.
    pub fn start(&self, sink: CaptureSink) {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("aec already running");
            return;
        }

        let (queue_tx, mut queue_rx) = mpsc::channel::<Vec<i16>>(OUTPUT_QUEUE_CHUNKS);
        *self.queue_tx.lock() = Some(queue_tx.clone());

        let output = tokio::spawn(async move {
            info!("aec output task started");
            while let Some(chunk) = queue_rx.recv().await {
                sink(Bytes::from(samples_to_bytes(&chunk))).await;
            }
            info!("aec output task exit");
        });
        *self.output_task.lock() = Some(output);

        let canceller = self.canceller.clone();
        let running = self.running.clone();
        let fetch = tokio::spawn(async move {
            info!("aec fetch task started");
            while running.load(Ordering::Acquire) {
                match canceller.fetch().await {
                    Ok(chunk) if chunk.is_empty() => {}
                    Ok(chunk) => match queue_tx.try_send(chunk) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!("aec output queue full, dropping chunk");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    },
                    Err(e) => warn!("aec fetch failed: {}", e),
                }
            }
            info!("aec fetch task exit");
        });
        *self.fetch_task.lock() = Some(fetch);

        info!("aec started (chunk size {} samples)", self.chunk_size());
    }

    /// Feed one mic chunk with its aligned reference chunk. Both must be
    /// exactly `chunk_size()` samples.
    pub fn process(&self, mic: &[i16], reference: &[i16]) -> AecResult<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(AecError::NotReady);
        }
        let chunk = self.chunk_size();
        if mic.len() != chunk || reference.len() != chunk {
            warn!(
                "invalid aec chunk: expected {} samples, got mic={} ref={}",
                chunk,
                mic.len(),
                reference.len()
            );
            return Err(AecError::InvalidArgument(format!(
                "expected {chunk} samples per channel"
            )));
        }

        let mut interleaved = Vec::with_capacity(chunk * 2);
        for (m, r) in mic.iter().zip(reference) {
            interleaved.push(*m);
            interleaved.push(*r);
        }
        self.canceller.feed(&interleaved)
    }

    /// Capture sink that re-chunks 100 ms capture chunks into engine-sized
    /// frames, pairing each with reference audio from the playback tap.
    ///
    /// An empty capture chunk (end-of-stream marker) is forwarded through
    /// the output queue so ordering is preserved.
    pub fn capture_sink(self: &Arc<Self>) -> CaptureSink {
        let processor = self.clone();
        Arc::new(move |chunk: Bytes| {
            let processor = processor.clone();
            Box::pin(async move {
                if chunk.is_empty() {
                    let queue_tx = processor.queue_tx.lock().clone();
                    if let Some(queue_tx) = queue_tx {
                        if queue_tx.try_send(Vec::new()).is_err() {
                            warn!("aec output queue full, dropping end marker");
                        }
                    }
                    return;
                }

                let chunk_samples = processor.chunk_size();
                let mut reference = vec![0i16; chunk_samples];

                let frames: Vec<Vec<i16>> = {
                    let mut pending = processor.pending.lock();
                    pending.extend(bytes_to_samples(&chunk));
                    let mut frames = Vec::new();
                    while pending.len() >= chunk_samples {
                        frames.push(pending.drain(..chunk_samples).collect());
                    }
                    frames
                };

                for mic in frames {
                    if !processor.reference.get(&mut reference) {
                        debug!("aec running without reference signal");
                    }
                    if let Err(e) = processor.process(&mic, &reference) {
                        warn!("aec process failed: {}", e);
                    }
                }
            })
        })
    }

    /// Stop both tasks, draining the queue before the output task exits.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        // Dropping the stored sender lets the output task drain and exit
        // once the fetch task has released its clone.
        *self.queue_tx.lock() = None;

        let fetch = self.fetch_task.lock().take();
        if let Some(mut fetch) = fetch {
            if tokio::time::timeout(STOP_GRACE, &mut fetch).await.is_err() {
                warn!("aec fetch task did not stop in time; cancelling");
                fetch.abort();
            }
        }
        let output = self.output_task.lock().take();
        if let Some(mut output) = output {
            if tokio::time::timeout(STOP_GRACE, &mut output).await.is_err() {
                warn!("aec output task did not stop in time; cancelling");
                output.abort();
            }
        }
        self.pending.lock().clear();
        info!("aec stopped");
    }
}
