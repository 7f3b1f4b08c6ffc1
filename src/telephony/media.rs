use std::sync::Arc;

use axum::extract::rejection::QueryRejection;
use axum::extract::ws::WebSocket;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::StreamExt;
use serde::Deserialize;

use crate::relay::MediaRelay;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct MediaParams {
    /// Call id the stream flow embedded in the socket URL.
    #[serde(default)]
    call_id: Option<String>,
}

/// WebSocket upgrade handler for GET /api/v1/calls/media-stream.
pub async fn handle_media_upgrade(
    ws: WebSocketUpgrade,
    params: Result<Query<MediaParams>, QueryRejection>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    // An unreadable query must not refuse the call; the relay copes without an id.
    let call_id = match params {
        Ok(Query(p)) => p.call_id,
        Err(e) => {
            tracing::warn!("Unreadable media stream query: {e}");
            None
        }
    };
    ws.on_upgrade(move |socket| handle_media_stream(socket, call_id, state))
}

/// Run one call's relay over the accepted telephony socket.
async fn handle_media_stream(socket: WebSocket, call_id: Option<String>, state: AppState) {
    tracing::info!(call_id = ?call_id, "Telephony media stream connected");

    let relay = MediaRelay::correlate(
        call_id.as_deref(),
        &state.sessions,
        Arc::clone(&state.voice),
        state.relay,
    );
    let resolved = relay.session().call_id.clone();
    tracing::debug!(call_id = %resolved, state = ?relay.state(), "Relay ready");

    let (sink, stream) = socket.split();
    let outcome = relay.run(sink, stream).await;

    tracing::info!(call_id = %resolved, ?outcome, "Telephony media stream closed");
}
