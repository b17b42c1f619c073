//! Control-message schema for the proxy channel.
//!
//! The proxy drives the half-duplex interlock with small JSON text frames.
//! Only the `type` key is recognized; everything else is ignored so the
//! proxy can extend the schema without breaking deployed devices.

use serde::Deserialize;

use super::TransportError;

/// Text frames received from the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// The assistant started speaking; mute the microphone uplink.
    #[serde(rename = "speech_start")]
    SpeechStart,
    /// The assistant finished speaking; resume the microphone uplink.
    #[serde(rename = "speech_end")]
    SpeechEnd,
    /// Any `type` this device does not understand.
    #[serde(other)]
    Unknown,
}

impl ControlMessage {
    /// Parse a text frame. Malformed JSON is a `Decode` error the caller
    /// absorbs; an unrecognized `type` parses to [`ControlMessage::Unknown`].
    pub fn parse(text: &str) -> Result<Self, TransportError> {
        serde_json::from_str(text).map_err(|e| TransportError::Decode(e.to_string()))
    }
}
