//! Bounded byte ring for PCM audio.
//!
//! One ring type serves both directions of the pipeline: capture pushes with
//! drop-on-full semantics (a late network must never stall the microphone),
//! playback pushes with blocking semantics (the network producer absorbs
//! backpressure). All pushes must be sample-aligned; because of that the
//! byte-oriented ring never tears a 16-bit sample across a pop.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Bytes per 16-bit PCM sample.
pub const SAMPLE_BYTES: usize = 2;

/// Rings at or above this size are considered large allocations and must
/// fail loud instead of aborting when the host cannot provide the memory.
const LARGE_ALLOC_BYTES: usize = 32 * 1024;

/// Push behavior when the ring cannot fit the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushMode {
    /// Return 0 immediately if there is insufficient free space.
    Drop,
    /// Wait until space frees up, bounded by the supplied deadline.
    Block,
}

/// Error types for ring operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RingError {
    #[error("ring not initialized")]
    NotReady,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("allocation failed: {0}")]
    Allocation(String),
}

/// Result type for ring operations.
pub type RingResult<T> = Result<T, RingError>;

struct RingState {
    buf: Vec<u8>,
    head: usize,
    len: usize,
}

/// Capacity-bounded byte store with blocking and non-blocking variants.
///
/// Invariant: `capacity() - free() == len()` at all times.
pub struct PcmRing {
    state: Mutex<RingState>,
    capacity: usize,
    space_available: Notify,
    data_available: Notify,
}

impl PcmRing {
    /// Create a ring with the given byte capacity.
    ///
    /// Zero capacity is a programmer error (`NotReady`). Large buffers are
    /// allocated fallibly so an exhausted host fails loud rather than
    /// aborting the process.
    pub fn new(capacity: usize) -> RingResult<Self> {
        if capacity == 0 {
            return Err(RingError::NotReady);
        }

        let mut buf = Vec::new();
        buf.try_reserve_exact(capacity).map_err(|e| {
            warn!("ring allocation of {} bytes failed: {}", capacity, e);
            RingError::Allocation(format!("{capacity} bytes: {e}"))
        })?;
        buf.resize(capacity, 0);

        if capacity >= LARGE_ALLOC_BYTES {
            debug!("allocated {} byte ring", capacity);
        }

        Ok(Self {
            state: Mutex::new(RingState { buf, head: 0, len: 0 }),
            capacity,
            space_available: Notify::new(),
            data_available: Notify::new(),
        })
    }

    /// Push `bytes` into the ring.
    ///
    /// Returns the number of bytes actually enqueued: `bytes.len()` on
    /// success, 0 when a `Drop` push does not fit or a `Block` push times
    /// out. Payloads must be a multiple of the sample size; a payload larger
    /// than the whole ring can never fit and is rejected.
    pub async fn push(
        &self,
        bytes: &[u8],
        mode: PushMode,
        deadline: Option<Duration>,
    ) -> RingResult<usize> {
        if bytes.is_empty() {
            return Ok(0);
        }
        if bytes.len() % SAMPLE_BYTES != 0 {
            return Err(RingError::InvalidArgument(format!(
                "payload of {} bytes is not sample-aligned",
                bytes.len()
            )));
        }
        if bytes.len() > self.capacity {
            return Err(RingError::InvalidArgument(format!(
                "payload of {} bytes exceeds ring capacity {}",
                bytes.len(),
                self.capacity
            )));
        }

        let deadline_at = deadline.map(|d| Instant::now() + d);

        loop {
            // Register for wakeups before checking, so a pop between the
            // unlock and the await cannot be missed.
            let space = self.space_available.notified();

            {
                let mut state = self.state.lock();
                if self.capacity - state.len >= bytes.len() {
                    Self::write_wrapped(&mut state, self.capacity, bytes);
                    drop(state);
                    self.data_available.notify_waiters();
                    return Ok(bytes.len());
                }
                if mode == PushMode::Drop {
                    debug!("ring full; dropping {} bytes", bytes.len());
                    return Ok(0);
                }
            }

            match deadline_at {
                Some(at) => {
                    let now = Instant::now();
                    if now >= at {
                        debug!("blocking push timed out ({} bytes)", bytes.len());
                        return Ok(0);
                    }
                    // A timeout here just re-checks; the next iteration
                    // observes the expired deadline and returns 0.
                    let _ = tokio::time::timeout(at - now, space).await;
                }
                None => space.await,
            }
        }
    }

    /// Non-blocking drop-on-full push usable from synchronous contexts.
    pub fn try_push(&self, bytes: &[u8]) -> RingResult<usize> {
        if bytes.is_empty() {
            return Ok(0);
        }
        if bytes.len() % SAMPLE_BYTES != 0 {
            return Err(RingError::InvalidArgument(format!(
                "payload of {} bytes is not sample-aligned",
                bytes.len()
            )));
        }

        let mut state = self.state.lock();
        if bytes.len() > self.capacity || self.capacity - state.len < bytes.len() {
            debug!("ring full; dropping {} bytes", bytes.len());
            return Ok(0);
        }
        Self::write_wrapped(&mut state, self.capacity, bytes);
        drop(state);
        self.data_available.notify_waiters();
        Ok(bytes.len())
    }

    /// Pop up to `max_bytes` into `dst`, waiting up to `deadline` for data.
    ///
    /// Returns the byte count read, 0 on timeout or when `max_bytes` is 0.
    pub async fn pop_up_to(
        &self,
        dst: &mut [u8],
        max_bytes: usize,
        deadline: Duration,
    ) -> RingResult<usize> {
        let max = max_bytes.min(dst.len());
        if max == 0 {
            return Ok(0);
        }

        let deadline_at = Instant::now() + deadline;

        loop {
            let data = self.data_available.notified();

            {
                let mut state = self.state.lock();
                if state.len > 0 {
                    let n = state.len.min(max);
                    Self::read_wrapped(&mut state, self.capacity, &mut dst[..n]);
                    drop(state);
                    self.space_available.notify_waiters();
                    return Ok(n);
                }
            }

            let now = Instant::now();
            if now >= deadline_at {
                return Ok(0);
            }
            let _ = tokio::time::timeout(deadline_at - now, data).await;
        }
    }

    /// Non-blocking pop usable from synchronous contexts. Returns bytes read.
    pub fn try_pop(&self, dst: &mut [u8]) -> usize {
        if dst.is_empty() {
            return 0;
        }
        let mut state = self.state.lock();
        if state.len == 0 {
            return 0;
        }
        let n = state.len.min(dst.len());
        Self::read_wrapped(&mut state, self.capacity, &mut dst[..n]);
        drop(state);
        self.space_available.notify_waiters();
        n
    }

    /// Drop all buffered bytes.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.head = 0;
        state.len = 0;
        drop(state);
        self.space_available.notify_waiters();
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.state.lock().len
    }

    /// True when no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total byte capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free bytes remaining.
    pub fn free(&self) -> usize {
        self.capacity - self.len()
    }

    fn write_wrapped(state: &mut RingState, capacity: usize, bytes: &[u8]) {
        let tail = (state.head + state.len) % capacity;
        let first = (capacity - tail).min(bytes.len());
        state.buf[tail..tail + first].copy_from_slice(&bytes[..first]);
        let rest = bytes.len() - first;
        if rest > 0 {
            state.buf[..rest].copy_from_slice(&bytes[first..]);
        }
        state.len += bytes.len();
    }

    fn read_wrapped(state: &mut RingState, capacity: usize, dst: &mut [u8]) {
        let n = dst.len();
        let first = (capacity - state.head).min(n);
        dst[..first].copy_from_slice(&state.buf[state.head..state.head + first]);
        if n > first {
            let rest = n - first;
            dst[first..].copy_from_slice(&state.buf[..rest]);
        }
        state.head = (state.head + n) % capacity;
        state.len -= n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn capacity_invariant_holds() {
        let ring = PcmRing::new(64).unwrap();
        assert_eq!(ring.capacity() - ring.free(), ring.len());

        ring.push(&[0u8; 16], PushMode::Drop, None).await.unwrap();
        assert_eq!(ring.len(), 16);
        assert_eq!(ring.capacity() - ring.free(), ring.len());

        let mut dst = [0u8; 8];
        let n = ring
            .pop_up_to(&mut dst, 8, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(n, 8);
        assert_eq!(ring.len(), 8);
        assert_eq!(ring.capacity() - ring.free(), ring.len());
    }

    #[tokio::test]
    async fn zero_capacity_is_not_ready() {
        assert!(matches!(PcmRing::new(0), Err(RingError::NotReady)));
    }

    #[tokio::test]
    async fn misaligned_push_is_rejected() {
        let ring = PcmRing::new(64).unwrap();
        let err = ring.push(&[0u8; 3], PushMode::Drop, None).await.unwrap_err();
        assert!(matches!(err, RingError::InvalidArgument(_)));
        assert_eq!(ring.len(), 0);
    }

    #[tokio::test]
    async fn drop_push_on_full_leaves_state_unchanged() {
        let ring = PcmRing::new(16).unwrap();
        assert_eq!(ring.push(&[1u8; 12], PushMode::Drop, None).await.unwrap(), 12);

        // 8 > 4 free bytes: dropped, nothing changes.
        assert_eq!(ring.push(&[2u8; 8], PushMode::Drop, None).await.unwrap(), 0);
        assert_eq!(ring.len(), 12);

        let mut dst = [0u8; 16];
        let n = ring
            .pop_up_to(&mut dst, 16, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(n, 12);
        assert!(dst[..12].iter().all(|&b| b == 1));
    }

    #[tokio::test]
    async fn blocking_push_times_out_with_zero() {
        let ring = PcmRing::new(8).unwrap();
        ring.push(&[0u8; 8], PushMode::Drop, None).await.unwrap();
        let n = ring
            .push(&[0u8; 4], PushMode::Block, Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(ring.len(), 8);
    }

    #[tokio::test]
    async fn blocking_push_wakes_when_consumer_drains() {
        let ring = Arc::new(PcmRing::new(8).unwrap());
        ring.push(&[0u8; 8], PushMode::Drop, None).await.unwrap();

        let producer = {
            let ring = ring.clone();
            tokio::spawn(async move {
                ring.push(&[7u8; 4], PushMode::Block, Some(Duration::from_secs(2)))
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut dst = [0u8; 8];
        ring.pop_up_to(&mut dst, 8, Duration::from_millis(10))
            .await
            .unwrap();

        assert_eq!(producer.await.unwrap(), 4);
        assert_eq!(ring.len(), 4);
    }

    #[tokio::test]
    async fn pop_timeout_returns_zero() {
        let ring = PcmRing::new(16).unwrap();
        let mut dst = [0u8; 8];
        let n = ring
            .pop_up_to(&mut dst, 8, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn pop_zero_max_returns_zero() {
        let ring = PcmRing::new(16).unwrap();
        ring.push(&[0u8; 4], PushMode::Drop, None).await.unwrap();
        let mut dst = [0u8; 8];
        let n = ring
            .pop_up_to(&mut dst, 0, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(ring.len(), 4);
    }

    #[tokio::test]
    async fn pops_stay_sample_aligned() {
        let ring = PcmRing::new(32).unwrap();
        ring.push(&[0u8; 10], PushMode::Drop, None).await.unwrap();
        ring.push(&[0u8; 6], PushMode::Drop, None).await.unwrap();

        let mut dst = [0u8; 32];
        loop {
            let n = ring
                .pop_up_to(&mut dst, 32, Duration::from_millis(5))
                .await
                .unwrap();
            if n == 0 {
                break;
            }
            assert_eq!(n % SAMPLE_BYTES, 0);
        }
    }

    #[tokio::test]
    async fn wraparound_preserves_order() {
        let ring = PcmRing::new(8).unwrap();
        ring.push(&[1, 2, 3, 4, 5, 6], PushMode::Drop, None).await.unwrap();

        let mut dst = [0u8; 4];
        ring.pop_up_to(&mut dst, 4, Duration::from_millis(5)).await.unwrap();
        assert_eq!(&dst, &[1, 2, 3, 4]);

        // Tail wraps around the end of the buffer.
        ring.push(&[7, 8, 9, 10], PushMode::Drop, None).await.unwrap();
        let mut rest = [0u8; 8];
        let n = ring
            .pop_up_to(&mut rest, 8, Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(n, 6);
        assert_eq!(&rest[..6], &[5, 6, 7, 8, 9, 10]);
    }

    #[tokio::test]
    async fn reset_drops_everything() {
        let ring = PcmRing::new(16).unwrap();
        ring.push(&[0u8; 12], PushMode::Drop, None).await.unwrap();
        ring.reset();
        assert_eq!(ring.len(), 0);
        assert_eq!(ring.free(), 16);
    }

    #[test]
    fn try_push_and_try_pop_round_trip() {
        let ring = PcmRing::new(16).unwrap();
        assert_eq!(ring.try_push(&[1, 2, 3, 4]).unwrap(), 4);
        assert_eq!(ring.try_push(&[0u8; 14]).unwrap(), 0); // would overflow

        let mut dst = [0u8; 16];
        assert_eq!(ring.try_pop(&mut dst), 4);
        assert_eq!(&dst[..4], &[1, 2, 3, 4]);
        assert_eq!(ring.try_pop(&mut dst), 0);
    }
}
