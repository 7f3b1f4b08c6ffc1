use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use crate::session::{AccountMeta, Notification};
use crate::AppState;

/// Status callback body posted by the telephony provider.
///
/// Every id is kept as a raw JSON value; providers send them as strings or
/// numbers depending on the event.
#[derive(Debug, Default, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub event: Option<Value>,
    #[serde(default)]
    pub data: Option<WebhookData>,
    #[serde(default)]
    pub account_id: Option<Value>,
    #[serde(default)]
    pub call_app_id: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WebhookData {
    #[serde(default)]
    pub call_id: Option<Value>,
    #[serde(default)]
    pub from: Option<Value>,
    #[serde(default)]
    pub to: Option<Value>,
    #[serde(default)]
    pub stream_id: Option<Value>,
}

impl WebhookPayload {
    /// Decode a raw request body. Content type is not checked.
    pub fn from_body(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    /// Map the provider event onto a store notification, if it is one we track.
    pub fn into_notification(self) -> Option<Notification> {
        let event = id_string(self.event);
        let data = self.data.unwrap_or_default();

        let call_id = id_string(data.call_id);
        if call_id.is_empty() {
            tracing::warn!(event = %event, "No call_id in webhook, ignoring");
            return None;
        }

        match event.as_str() {
            "call.initiated" => Some(Notification::CallStarted {
                call_id,
                from: id_string(data.from),
                to: id_string(data.to),
                account: AccountMeta {
                    account_id: id_string(self.account_id),
                    call_app_id: id_string(self.call_app_id),
                },
            }),
            "stream.initiated" => Some(Notification::StreamStarted {
                call_id,
                stream_id: id_string(data.stream_id),
            }),
            "call.completed" => Some(Notification::CallCompleted { call_id }),
            other => {
                tracing::debug!(call_id = %call_id, event = %other, "Untracked webhook event");
                None
            }
        }
    }
}

/// Provider ids arrive as strings or numbers.
fn id_string(value: Option<Value>) -> String {
    match value {
        Some(Value::String(s)) => s,
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Handle POST /api/v1/webhooks/receiver: call lifecycle notifications.
///
/// Always acknowledges; anything we cannot use is logged and dropped.
pub async fn handle_receiver(State(state): State<AppState>, body: Bytes) -> Json<&'static str> {
    match WebhookPayload::from_body(&body) {
        Ok(payload) => {
            tracing::info!(event = ?payload.event, "Webhook received");
            if let Some(notification) = payload.into_notification() {
                state.sessions.apply(notification);
            }
        }
        Err(e) => {
            tracing::warn!(bytes = body.len(), "Undecodable webhook body, ignoring: {e}");
        }
    }

    Json("Webhook received.")
}
