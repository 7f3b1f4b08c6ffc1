//! Wire vocabulary of both legs.
//!
//! The telephony leg speaks `{"type": ...}` frames, the voice service speaks
//! `{"event": ...}` frames. Inbound frames decode into closed enums with an
//! explicit `Unrecognized` arm; outbound frames are built by the functions
//! below and returned as ready-to-send JSON text.

use serde::Deserialize;
use serde_json::json;

use crate::session::CallSession;

/// Media format announced to the voice service in the `start` event.
pub const MEDIA_ENCODING: &str = "base64";
pub const MEDIA_SAMPLE_RATE: u32 = 8000;
pub const MEDIA_BIT_RATE: &str = "128kbps";

/// Mark name acknowledging each combined payload played out.
pub const RESPONSE_MARK: &str = "responsePart";

/// Frames received from the telephony leg.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
#[serde(rename_all = "lowercase")]
pub enum CallerFrame {
    /// Caller audio: `{"type": "audio", "data": {"audio_b64": "..."}}`.
    Audio { data: CallerAudio },
    #[serde(other)]
    Unrecognized,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct CallerAudio {
    pub audio_b64: String,
}

/// Events received from the voice service.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
#[serde(rename_all = "lowercase")]
pub enum ServiceEvent {
    Media {
        #[serde(default)]
        media: ServiceMedia,
    },
    /// Barge-in: drop everything not yet played.
    Clear,
    #[serde(other)]
    Unrecognized,
}

#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
pub struct ServiceMedia {
    #[serde(default)]
    pub payload: String, // base64-encoded audio
}

pub fn decode_caller(text: &str) -> Result<CallerFrame, serde_json::Error> {
    serde_json::from_str(text)
}

pub fn decode_service(text: &str) -> Result<ServiceEvent, serde_json::Error> {
    serde_json::from_str(text)
}

/// First half of the voice-service open handshake.
pub fn connected_event() -> String {
    json!({ "event": "connected" }).to_string()
}

/// Second half of the open handshake, describing the call.
pub fn start_event(session: &CallSession) -> String {
    json!({
        "event": "start",
        "start": {
            "call_sid": session.call_id,
            "stream_sid": session.stream_id,
            "from": session.from_number,
            "to": session.to_number,
            "media_format": {
                "encoding": MEDIA_ENCODING,
                "sample_rate": MEDIA_SAMPLE_RATE,
                "bit_rate": MEDIA_BIT_RATE,
            }
        }
    })
    .to_string()
}

/// Caller audio wrapped for the voice service. The payload is passed through as-is.
pub fn media_event(stream_id: &str, payload_b64: &str) -> String {
    json!({
        "event": "media",
        "stream_sid": stream_id,
        "media": { "payload": payload_b64 }
    })
    .to_string()
}

pub fn stop_event(stream_id: &str) -> String {
    json!({
        "event": "stop",
        "stream_sid": stream_id,
    })
    .to_string()
}

pub fn mark_event(stream_id: &str, name: &str) -> String {
    json!({
        "event": "mark",
        "stream_sid": stream_id,
        "mark": { "name": name }
    })
    .to_string()
}

/// Voice-service audio for the telephony leg.
pub fn caller_audio(audio_b64: &str, chunk_id: u64) -> String {
    json!({
        "type": "audio",
        "audio_b64": audio_b64,
        "chunk_id": chunk_id,
    })
    .to_string()
}

/// Tell the telephony leg to discard any audio it is still playing.
pub fn caller_clear() -> String {
    json!({ "type": "clear" }).to_string()
}
