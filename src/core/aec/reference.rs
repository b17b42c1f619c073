//! Reference-signal buffer for the echo canceller.
//!
//! The playback worker taps its outgoing 24 kHz audio into this buffer; the
//! AEC stage reads it back at the 16 kHz capture rate as the "known echo"
//! input. The tap must never block playback, so writes are drop-on-full and
//! reads zero-fill on underrun.

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{CAPTURE_SAMPLE_RATE_HZ, PLAYBACK_SAMPLE_RATE_HZ};
use crate::core::pcm::{bytes_to_samples, samples_to_bytes};
use crate::core::resampler::{resample_linear, resample_output_len};
use crate::core::ring::{PcmRing, RingResult};

/// Most samples a single `feed` call will produce after downsampling;
/// larger callers are truncated to this window.
pub const MAX_RESAMPLE_CHUNK: usize = 4_096;

/// Bounded time-window of downsampled playback audio.
pub struct AecReferenceBuffer {
    ring: PcmRing,
    scratch: Mutex<Vec<i16>>,
}

impl AecReferenceBuffer {
    /// Create a reference buffer holding `window_bytes` of 16 kHz mono PCM.
    pub fn new(window_bytes: usize) -> RingResult<Self> {
        let ring = PcmRing::new(window_bytes)?;
        info!("reference buffer created: {} bytes", window_bytes);
        Ok(Self {
            ring,
            scratch: Mutex::new(vec![0i16; MAX_RESAMPLE_CHUNK]),
        })
    }

    /// Downsample a 24 kHz playback chunk and enqueue it.
    ///
    /// Overflow drops the chunk; an oversized chunk is truncated to the
    /// scratch window first.
    pub fn feed(&self, pcm_24k: &[i16]) {
        if pcm_24k.is_empty() {
            return;
        }

        let mut input = pcm_24k;
        let out_len =
            resample_output_len(input.len(), PLAYBACK_SAMPLE_RATE_HZ, CAPTURE_SAMPLE_RATE_HZ);
        if out_len > MAX_RESAMPLE_CHUNK {
            warn!(
                "reference chunk too large ({} samples), truncating to {}",
                out_len, MAX_RESAMPLE_CHUNK
            );
            let max_input = resample_output_len(
                MAX_RESAMPLE_CHUNK,
                CAPTURE_SAMPLE_RATE_HZ,
                PLAYBACK_SAMPLE_RATE_HZ,
            );
            input = &input[..max_input.min(input.len())];
        }

        let mut scratch = self.scratch.lock();
        let produced = resample_linear(
            input,
            PLAYBACK_SAMPLE_RATE_HZ,
            &mut scratch,
            CAPTURE_SAMPLE_RATE_HZ,
        );
        if produced == 0 {
            return;
        }

        let bytes = samples_to_bytes(&scratch[..produced]);
        match self.ring.try_push(&bytes) {
            Ok(0) => debug!("reference buffer full, dropping {} samples", produced),
            Ok(_) => {}
            Err(e) => warn!("reference push failed: {}", e),
        }
    }

    /// Fill `output` with exactly `output.len()` reference samples.
    ///
    /// Returns `true` only when the whole request was served from buffered
    /// audio; on underrun the remainder is zero-filled and `false` signals
    /// "no reference" to the caller.
    pub fn get(&self, output: &mut [i16]) -> bool {
        if output.is_empty() {
            return false;
        }

        let mut bytes = vec![0u8; output.len() * 2];
        let retrieved = self.ring.try_pop(&mut bytes);

        let samples = bytes_to_samples(&bytes[..retrieved]);
        output[..samples.len()].copy_from_slice(&samples);
        output[samples.len()..].fill(0);

        if retrieved < bytes.len() {
            if retrieved > 0 {
                debug!(
                    "reference underrun: got {}/{} samples",
                    retrieved / 2,
                    output.len()
                );
            }
            return false;
        }
        true
    }

    /// Buffered reference audio in samples.
    pub fn buffered_samples(&self) -> usize {
        self.ring.len() / 2
    }

    /// Drop all buffered reference audio.
    pub fn reset(&self) {
        self.ring.reset();
    }
}
