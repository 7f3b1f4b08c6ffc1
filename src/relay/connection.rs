use std::time::Duration;

use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::config::VoiceConfig;
use crate::protocol;
use crate::session::CallSession;

pub type VoiceSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens and re-opens the voice-service leg of a call.
///
/// Every successful connect is followed by the open handshake (`connected`
/// then `start`). Authorization rejections are final; any other failure is
/// retried after a fixed delay until the call is cancelled.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    url: String,
    authorization: Option<HeaderValue>,
    reconnect_delay: Duration,
}

impl ConnectionManager {
    pub fn new(
        url: &str,
        api_key: Option<&str>,
        reconnect_delay: Duration,
    ) -> Result<Self, ConnectError> {
        // Catch unusable endpoints at startup rather than on the first call.
        url.into_client_request()
            .map_err(|e| ConnectError::Request(format!("{url}: {e}")))?;

        let authorization = api_key
            .map(|key| {
                HeaderValue::from_str(&format!("Bearer {key}"))
                    .map_err(|e| ConnectError::Request(format!("api key: {e}")))
            })
            .transpose()?;

        Ok(Self {
            url: url.to_string(),
            authorization,
            reconnect_delay,
        })
    }

    pub fn from_config(config: &VoiceConfig) -> Result<Self, ConnectError> {
        Self::new(
            config.ws_url.trim(),
            config.api_key.as_deref(),
            config.reconnect_delay(),
        )
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    /// One attempt: open the socket and send the open handshake.
    pub async fn connect(&self, session: &CallSession) -> Result<VoiceSocket, ConnectError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectError::Request(e.to_string()))?;
        if let Some(ref auth) = self.authorization {
            request.headers_mut().insert(AUTHORIZATION, auth.clone());
        }

        tracing::info!(
            call_id = %session.call_id,
            stream_id = %session.stream_id,
            "Connecting to voice service"
        );

        let (mut socket, response) = connect_async(request).await.map_err(classify)?;
        tracing::debug!(status = %response.status(), "Voice service accepted connection");

        socket
            .send(Message::Text(protocol::connected_event().into()))
            .await?;
        socket
            .send(Message::Text(protocol::start_event(session).into()))
            .await?;

        tracing::info!(
            call_id = %session.call_id,
            stream_id = %session.stream_id,
            "Sent connected and start events to voice service"
        );
        Ok(socket)
    }

    /// Connect, retrying transient failures every `reconnect_delay`.
    ///
    /// Waits `first_delay` before the first attempt. Only returns an error
    /// for an authorization rejection or when `cancel` fires.
    pub async fn connect_with_retry(
        &self,
        session: &CallSession,
        cancel: &CancellationToken,
        first_delay: Duration,
    ) -> Result<VoiceSocket, ConnectError> {
        let mut delay = first_delay;
        let mut attempt: u32 = 0;

        loop {
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ConnectError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            attempt += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(ConnectError::Cancelled),
                r = self.connect(session) => r,
            };

            match result {
                Ok(socket) => return Ok(socket),
                Err(e) if e.is_permanent() => {
                    tracing::error!(call_id = %session.call_id, "Voice service refused the call: {e}");
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        call_id = %session.call_id,
                        attempt,
                        "Voice service connect failed, retrying in {:?}: {e}",
                        self.reconnect_delay
                    );
                    delay = self.reconnect_delay;
                }
            }
        }
    }
}

/// Whether a close frame from the voice service means our credentials were refused.
pub fn is_rejection(frame: Option<&CloseFrame>) -> bool {
    frame.is_some_and(|f| f.code == CloseCode::Policy)
}

fn classify(err: tungstenite::Error) -> ConnectError {
    if let tungstenite::Error::Http(ref response) = err {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return ConnectError::Rejected(status.as_u16());
        }
    }
    ConnectError::Transport(err)
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("voice service rejected authorization (HTTP {0})")]
    Rejected(u16),
    #[error("invalid voice service request: {0}")]
    Request(String),
    #[error("voice service connection failed: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("connect cancelled")]
    Cancelled,
}

impl ConnectError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, ConnectError::Rejected(_))
    }
}
