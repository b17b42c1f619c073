//! voxlink: firmware core of a full-duplex voice-assistant endpoint.
//!
//! The crate coordinates a real-time audio session: a capture stage turns
//! the 32-bit I²S microphone stream into 100 ms chunks of 16 kHz PCM, a
//! persistent WebSocket carries audio both ways, and a playback stage
//! streams 24 kHz speech back out with pre-buffering. A half-duplex
//! interlock mutes the uplink while the assistant speaks, and an optional
//! echo-cancellation branch sits between capture and transport.
//!
//! Hardware and host services are trait seams ([`core::capture::I2sSource`],
//! [`core::playback::I2sSink`], [`core::identity::KvStore`],
//! [`core::aec::EchoCanceller`]) so the whole pipeline runs in tests.

pub mod config;
pub mod core;

// Re-export commonly used items for convenience
pub use config::{CoreConfig, CAPTURE_SAMPLE_RATE_HZ, PLAYBACK_SAMPLE_RATE_HZ};
pub use core::{
    AssistantState, CaptureStage, PlaybackStage, ProxyClient, SessionController, Status, UiEvent,
};
