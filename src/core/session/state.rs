//! Session state, UI events and status egress types.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Assistant lifecycle. One live session per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssistantState {
    /// Waiting for the user to start a turn.
    #[default]
    Idle,
    /// Capture is running and audio is flowing to the proxy.
    Streaming,
    /// A fatal transport or playback failure; cleared by the next
    /// successful record start.
    Error,
}

/// Events arriving from the UI collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiEvent {
    RecordStart,
    RecordStop,
}

/// Status surface published to the UI on every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Status {
    pub state: AssistantState,
    pub wifi_connected: bool,
    pub proxy_connected: bool,
}

/// Callback type for status updates.
pub type StatusCallback =
    Arc<dyn Fn(Status) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Hot-path counters. Dropped chunks are counted, never re-queued.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub chunks_sent: AtomicU64,
    pub chunks_muted: AtomicU64,
    pub send_timeouts: AtomicU64,
    pub send_failures: AtomicU64,
}

/// Point-in-time copy of [`SessionStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatsSnapshot {
    pub chunks_sent: u64,
    pub chunks_muted: u64,
    pub send_timeouts: u64,
    pub send_failures: u64,
}

impl SessionStats {
    pub fn snapshot(&self) -> SessionStatsSnapshot {
        SessionStatsSnapshot {
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            chunks_muted: self.chunks_muted.load(Ordering::Relaxed),
            send_timeouts: self.send_timeouts.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }
}
