pub mod aec;
pub mod capture;
pub mod identity;
pub mod pcm;
pub mod playback;
pub mod resampler;
pub mod ring;
pub mod session;
pub mod transport;

// Re-export commonly used types for convenience
pub use aec::{AecError, AecProcessor, AecReferenceBuffer, AecResult, EchoCanceller, PassthroughCanceller};
pub use capture::{
    convert_sample, CaptureConfig, CaptureError, CaptureResult, CaptureSink, CaptureStage,
    I2sSource,
};
pub use identity::{load_or_create_session_id, KvError, KvStore, IDENTITY_NAMESPACE, SESSION_ID_KEY};
pub use playback::{
    I2sSink, PlaybackConfig, PlaybackError, PlaybackEvent, PlaybackEventCallback, PlaybackResult,
    PlaybackStage, PlaybackState,
};
pub use ring::{PcmRing, PushMode, RingError, RingResult};
pub use session::{
    AssistantState, SessionController, SessionError, SessionResult, SessionStats,
    SessionStatsSnapshot, Status, StatusCallback, UiEvent,
};
pub use transport::{
    AudioReceivedCallback, ControlMessage, ProxyClient, SpeechEventCallback, StateChangeCallback,
    TransportConfig, TransportError, TransportResult, TransportStats, TransportStatsSnapshot,
};
