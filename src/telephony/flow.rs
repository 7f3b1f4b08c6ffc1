use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::AppState;

/// Samples per chunk the provider should stream to us.
pub const STREAM_CHUNK_SIZE: u32 = 320;
pub const STREAM_SAMPLE_RATE: &str = "8k";

#[derive(Debug, Default, Deserialize)]
pub struct FlowRequest {
    #[serde(default)]
    pub call_id: String,
    #[serde(default)]
    pub account_id: Option<serde_json::Value>,
    #[serde(default)]
    pub from_number: Option<String>,
    #[serde(default)]
    pub to_number: Option<String>,
}

/// Call flow instruction: open a media stream to this bridge.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct FlowResponse {
    pub action: &'static str,
    pub ws_url: String,
    pub chunk_size: u32,
    pub sample_rate: &'static str,
    pub record: bool,
}

impl FlowResponse {
    pub fn stream(domain: &str, call_id: &str) -> Self {
        Self {
            action: "stream",
            ws_url: media_stream_url(domain, call_id),
            chunk_size: STREAM_CHUNK_SIZE,
            sample_rate: STREAM_SAMPLE_RATE,
            record: true,
        }
    }
}

/// Handle POST /api/v1/calls/flow: tell the provider where to stream the call.
pub async fn handle_flow(
    State(state): State<AppState>,
    Json(request): Json<FlowRequest>,
) -> Json<FlowResponse> {
    tracing::info!(
        call_id = %request.call_id,
        from = request.from_number.as_deref().unwrap_or_default(),
        to = request.to_number.as_deref().unwrap_or_default(),
        account_id = ?request.account_id,
        "Call flow requested"
    );

    Json(FlowResponse::stream(
        &state.config.server.domain,
        &request.call_id,
    ))
}

/// Media socket URL carrying the call id. Bare hosts get `wss://`.
pub fn media_stream_url(domain: &str, call_id: &str) -> String {
    let domain = domain.trim().trim_end_matches('/');
    let base = if domain.starts_with("https://") || domain.starts_with("http://") {
        domain
            .replace("https://", "wss://")
            .replace("http://", "ws://")
    } else if domain.starts_with("wss://") || domain.starts_with("ws://") {
        domain.to_string()
    } else {
        format!("wss://{domain}")
    };

    format!(
        "{base}/api/v1/calls/media-stream?call_id={}",
        urlencoded(call_id)
    )
}

fn urlencoded(s: &str) -> String {
    s.bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                String::from(b as char)
            }
            _ => format!("%{b:02X}"),
        })
        .collect()
}
