//! Local voice service and telephony leg used by the relay tests.

use std::time::Duration;

use axum::extract::ws::Message as CallerMessage;
use futures::channel::mpsc;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::session::CallSession;

pub const WAIT: Duration = Duration::from_secs(5);

pub type ServerSocket = WebSocketStream<TcpStream>;

pub fn session(call_id: &str, stream_id: &str) -> CallSession {
    CallSession {
        call_id: call_id.to_string(),
        stream_id: stream_id.to_string(),
        from_number: "1555".to_string(),
        to_number: "1666".to_string(),
    }
}

pub async fn voice_service() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

pub async fn accept(listener: &TcpListener) -> ServerSocket {
    let (stream, _) = tokio::time::timeout(WAIT, listener.accept())
        .await
        .expect("relay never connected")
        .unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

/// Answer every connection attempt with 403.
pub async fn reject_forever(listener: TcpListener) {
    while let Ok((stream, _)) = listener.accept().await {
        let _ = tokio_tungstenite::accept_hdr_async(stream, |_: &Request, _: Response| {
            let mut denied = ErrorResponse::new(Some("forbidden".to_string()));
            *denied.status_mut() = StatusCode::FORBIDDEN;
            Err(denied)
        })
        .await;
    }
}

/// Next text frame from the relay as JSON. `None` once the relay closes.
pub async fn try_next_event(ws: &mut ServerSocket) -> Option<Value> {
    loop {
        let msg = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for relay")?;
        match msg {
            Ok(Message::Text(text)) => return Some(serde_json::from_str(text.as_str()).unwrap()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

pub async fn next_event(ws: &mut ServerSocket) -> Value {
    try_next_event(ws).await.expect("relay closed the voice leg")
}

/// Consume `connected` + `start`, returning the start event.
pub async fn expect_handshake(ws: &mut ServerSocket) -> Value {
    let connected = next_event(ws).await;
    assert_eq!(connected["event"], "connected");
    let start = next_event(ws).await;
    assert_eq!(start["event"], "start");
    start
}

pub async fn send_event(ws: &mut ServerSocket, event: Value) {
    ws.send(Message::Text(event.to_string().into())).await.unwrap();
}

/// Test side of a telephony leg wired to a relay through channels.
pub struct CallerLeg {
    pub to_relay: mpsc::UnboundedSender<Result<CallerMessage, axum::Error>>,
    pub from_relay: mpsc::UnboundedReceiver<CallerMessage>,
}

pub type RelaySink = mpsc::UnboundedSender<CallerMessage>;
pub type RelayStream = mpsc::UnboundedReceiver<Result<CallerMessage, axum::Error>>;

pub fn caller_leg() -> (CallerLeg, RelaySink, RelayStream) {
    let (to_relay, relay_rx) = mpsc::unbounded();
    let (relay_tx, from_relay) = mpsc::unbounded();
    (
        CallerLeg {
            to_relay,
            from_relay,
        },
        relay_tx,
        relay_rx,
    )
}

impl CallerLeg {
    pub fn send(&self, frame: Value) {
        self.to_relay
            .unbounded_send(Ok(CallerMessage::Text(frame.to_string().into())))
            .unwrap();
    }

    /// Next frame the relay sent to the caller, `None` once the relay closed the leg.
    pub async fn recv(&mut self) -> Option<Value> {
        let msg = tokio::time::timeout(WAIT, self.from_relay.next())
            .await
            .expect("timed out waiting for caller frame")?;
        match msg {
            CallerMessage::Text(text) => Some(serde_json::from_str(text.as_str()).unwrap()),
            other => panic!("unexpected caller frame {other:?}"),
        }
    }

    pub fn hang_up(&self) {
        self.to_relay.close_channel();
    }
}
