//! Per-call media relay between the telephony leg and the voice service.

pub mod buffer;
pub mod connection;
#[cfg(test)]
pub(crate) mod testing;

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use base64::Engine;
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::{self, Message as VoiceMessage};
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::protocol::{self, CallerFrame, ServiceEvent};
use crate::session::{self, CallSession, SessionStore};

pub use buffer::JitterBuffer;
pub use connection::{ConnectError, ConnectionManager, VoiceSocket};

/// Lifecycle of one relay. `Closed` is reachable from every state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Correlating,
    VoiceLegConnecting,
    Streaming,
    Draining,
    Closed,
}

/// Why a relay finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The telephony leg closed or failed.
    CallerHungUp,
    /// The voice service refused our credentials.
    VoiceRejected,
    /// The call completed while the relay was still running.
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
    pub flush_threshold: usize,
}

impl From<&RelayConfig> for RelaySettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            flush_threshold: config.flush_threshold,
        }
    }
}

/// How a single streaming phase ended.
#[derive(Debug)]
enum StreamEnd {
    CallerGone,
    VoiceLost,
    VoiceRejected,
    Cancelled,
}

enum Flow {
    Continue,
    Stop(StreamEnd),
}

enum Streamed {
    /// Voice leg dropped; reconnect and keep the caller.
    VoiceLost,
    /// Relay is done. Carries the voice socket if it is still usable.
    Finished(RelayOutcome, Option<VoiceSocket>),
}

enum Input<E> {
    Cancelled,
    Caller(Option<Result<Message, E>>),
    Voice(Option<Result<VoiceMessage, tungstenite::Error>>),
}

/// Runs one call: resolves its session, keeps a voice-service leg open for
/// as long as the caller stays, and shuttles audio both ways.
pub struct MediaRelay {
    session: CallSession,
    connector: Arc<ConnectionManager>,
    settings: RelaySettings,
    cancel: CancellationToken,
    state: RelayState,
    buffer: JitterBuffer,
    /// Combined payloads sent to the caller so far.
    chunk_id: u64,
}

impl MediaRelay {
    /// Resolve the call behind a freshly accepted telephony socket.
    ///
    /// `identifier` is the call id passed on the socket, if any. Never
    /// fails: unknown or malformed identifiers fall back to defaults.
    pub fn correlate(
        identifier: Option<&str>,
        store: &SessionStore,
        connector: Arc<ConnectionManager>,
        settings: RelaySettings,
    ) -> Self {
        let session = CallSession::resolve(identifier, store);
        // Anonymous sessions share the placeholder id, never a stored call's token.
        let cancel = match identifier.filter(|id| session::is_valid_identifier(id)) {
            Some(id) => store.cancellation(id),
            None => CancellationToken::new(),
        };
        let mut relay = Self {
            session,
            connector,
            settings,
            cancel,
            state: RelayState::Idle,
            // Every push that fills the buffer is followed by a flush.
            buffer: JitterBuffer::new(settings.flush_threshold),
            chunk_id: 0,
        };
        relay.transition(RelayState::Correlating);

        tracing::info!(
            call_id = %relay.session.call_id,
            stream_id = %relay.session.stream_id,
            from = %relay.session.from_number,
            to = %relay.session.to_number,
            "Call session resolved"
        );
        relay
    }

    pub fn session(&self) -> &CallSession {
        &self.session
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Drive the call to completion. Closes both legs before returning.
    pub async fn run<S, R, E>(mut self, mut caller_tx: S, mut caller_rx: R) -> RelayOutcome
    where
        S: Sink<Message> + Unpin,
        S::Error: Display,
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let mut first_delay = Duration::ZERO;

        let (outcome, voice) = loop {
            self.transition(RelayState::VoiceLegConnecting);
            let voice = match self.open_voice_leg(&mut caller_rx, first_delay).await {
                Ok(socket) => socket,
                Err(outcome) => break (outcome, None),
            };

            self.transition(RelayState::Streaming);
            match self.stream(&mut caller_tx, &mut caller_rx, voice).await {
                Streamed::VoiceLost => {
                    tracing::warn!(
                        call_id = %self.session.call_id,
                        "Voice service disconnected, reconnecting in {:?}",
                        self.connector.reconnect_delay()
                    );
                    first_delay = self.connector.reconnect_delay();
                }
                Streamed::Finished(outcome, voice) => break (outcome, voice),
            }
        };

        self.transition(RelayState::Draining);
        self.drain(voice).await;

        self.transition(RelayState::Closed);
        if let Err(e) = caller_tx.close().await {
            tracing::debug!(call_id = %self.session.call_id, "Caller leg already closed: {e}");
        }

        tracing::info!(call_id = %self.session.call_id, ?outcome, "Relay finished");
        outcome
    }

    /// Wait for the connection manager while still watching the caller.
    async fn open_voice_leg<R, E>(
        &self,
        caller_rx: &mut R,
        first_delay: Duration,
    ) -> Result<VoiceSocket, RelayOutcome>
    where
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let establish = self
            .connector
            .connect_with_retry(&self.session, &self.cancel, first_delay);
        tokio::pin!(establish);

        loop {
            tokio::select! {
                result = &mut establish => {
                    return match result {
                        Ok(socket) => Ok(socket),
                        Err(ConnectError::Cancelled) => Err(RelayOutcome::Cancelled),
                        Err(_) => Err(RelayOutcome::VoiceRejected),
                    };
                }
                frame = caller_rx.next() => match frame {
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!(call_id = %self.session.call_id, "Caller left before voice leg was up");
                        return Err(RelayOutcome::CallerHungUp);
                    }
                    Some(Err(e)) => {
                        tracing::warn!(call_id = %self.session.call_id, "Caller leg error: {e}");
                        return Err(RelayOutcome::CallerHungUp);
                    }
                    Some(Ok(_)) => {
                        tracing::debug!(call_id = %self.session.call_id, "Voice leg down, dropping caller frame");
                    }
                },
            }
        }
    }

    /// Forward in both directions until either side stops.
    async fn stream<S, R, E>(
        &mut self,
        caller_tx: &mut S,
        caller_rx: &mut R,
        mut voice: VoiceSocket,
    ) -> Streamed
    where
        S: Sink<Message> + Unpin,
        S::Error: Display,
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let cancel = self.cancel.clone();

        let end = loop {
            let input = tokio::select! {
                _ = cancel.cancelled() => Input::Cancelled,
                frame = caller_rx.next() => Input::Caller(frame),
                msg = voice.next() => Input::Voice(msg),
            };

            let flow = match input {
                Input::Cancelled => {
                    tracing::info!(call_id = %self.session.call_id, "Call completed, stopping relay");
                    Flow::Stop(StreamEnd::Cancelled)
                }
                Input::Caller(frame) => self.on_caller_frame(frame, &mut voice).await,
                Input::Voice(msg) => self.on_voice_message(msg, caller_tx, &mut voice).await,
            };

            if let Flow::Stop(end) = flow {
                break end;
            }
        };

        tracing::debug!(call_id = %self.session.call_id, ?end, "Streaming stopped");

        match end {
            StreamEnd::CallerGone => Streamed::Finished(RelayOutcome::CallerHungUp, Some(voice)),
            StreamEnd::Cancelled => {
                self.flush_remaining(caller_tx).await;
                Streamed::Finished(RelayOutcome::Cancelled, Some(voice))
            }
            StreamEnd::VoiceRejected => {
                self.flush_remaining(caller_tx).await;
                Streamed::Finished(RelayOutcome::VoiceRejected, None)
            }
            StreamEnd::VoiceLost => {
                self.flush_remaining(caller_tx).await;
                Streamed::VoiceLost
            }
        }
    }

    /// Telephony → voice service.
    async fn on_caller_frame<E: Display>(
        &mut self,
        frame: Option<Result<Message, E>>,
        voice: &mut VoiceSocket,
    ) -> Flow {
        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => {
                tracing::info!(call_id = %self.session.call_id, "Caller leg closed");
                return Flow::Stop(StreamEnd::CallerGone);
            }
            Some(Err(e)) => {
                tracing::warn!(call_id = %self.session.call_id, "Caller leg error: {e}");
                return Flow::Stop(StreamEnd::CallerGone);
            }
            Some(Ok(_)) => return Flow::Continue,
        };

        match protocol::decode_caller(text.as_str()) {
            Ok(CallerFrame::Audio { data }) => {
                let event = protocol::media_event(&self.session.stream_id, &data.audio_b64);
                if let Err(e) = voice.send(VoiceMessage::Text(event.into())).await {
                    tracing::warn!(call_id = %self.session.call_id, "Failed to forward caller audio: {e}");
                    return Flow::Stop(StreamEnd::VoiceLost);
                }
                tracing::trace!(
                    call_id = %self.session.call_id,
                    b64_len = data.audio_b64.len(),
                    "Forwarded caller audio"
                );
            }
            Ok(CallerFrame::Unrecognized) => {
                tracing::debug!(call_id = %self.session.call_id, frame = %text.as_str(), "Ignoring caller frame");
            }
            Err(e) => {
                tracing::warn!(call_id = %self.session.call_id, "Failed to parse caller frame: {e}");
            }
        }
        Flow::Continue
    }

    /// Voice service → telephony.
    async fn on_voice_message<S>(
        &mut self,
        msg: Option<Result<VoiceMessage, tungstenite::Error>>,
        caller_tx: &mut S,
        voice: &mut VoiceSocket,
    ) -> Flow
    where
        S: Sink<Message> + Unpin,
        S::Error: Display,
    {
        let text = match msg {
            Some(Ok(VoiceMessage::Text(text))) => text,
            Some(Ok(VoiceMessage::Close(frame))) => {
                if connection::is_rejection(frame.as_ref()) {
                    tracing::error!(
                        call_id = %self.session.call_id,
                        ?frame,
                        "Voice service revoked authorization"
                    );
                    return Flow::Stop(StreamEnd::VoiceRejected);
                }
                tracing::warn!(call_id = %self.session.call_id, ?frame, "Voice service closed the stream");
                return Flow::Stop(StreamEnd::VoiceLost);
            }
            None => return Flow::Stop(StreamEnd::VoiceLost),
            Some(Err(e)) => {
                tracing::warn!(call_id = %self.session.call_id, "Voice service socket error: {e}");
                return Flow::Stop(StreamEnd::VoiceLost);
            }
            Some(Ok(_)) => return Flow::Continue,
        };

        match protocol::decode_service(text.as_str()) {
            Ok(ServiceEvent::Media { media }) => {
                self.on_media(&media.payload, caller_tx, voice).await
            }
            Ok(ServiceEvent::Clear) => {
                // Empty first so nothing stale can follow the clear.
                let dropped = self.buffer.flush();
                if let Err(e) = send_text(caller_tx, protocol::caller_clear()).await {
                    tracing::warn!(call_id = %self.session.call_id, "Failed to forward clear: {e}");
                    return Flow::Stop(StreamEnd::CallerGone);
                }
                tracing::debug!(call_id = %self.session.call_id, dropped, "Clear event received, buffer flushed");
                Flow::Continue
            }
            Ok(ServiceEvent::Unrecognized) => {
                tracing::debug!(call_id = %self.session.call_id, event = %text.as_str(), "Ignoring voice service event");
                Flow::Continue
            }
            Err(e) => {
                tracing::warn!(call_id = %self.session.call_id, "Failed to parse voice service event: {e}");
                Flow::Continue
            }
        }
    }

    async fn on_media<S>(&mut self, payload: &str, caller_tx: &mut S, voice: &mut VoiceSocket) -> Flow
    where
        S: Sink<Message> + Unpin,
        S::Error: Display,
    {
        if payload.is_empty() {
            return Flow::Continue;
        }
        let audio = match base64::engine::general_purpose::STANDARD.decode(payload) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(call_id = %self.session.call_id, "Failed to decode voice service audio: {e}");
                return Flow::Continue;
            }
        };

        let seq = self.buffer.push(Bytes::from(audio));
        tracing::trace!(call_id = %self.session.call_id, seq, "Buffered voice audio");

        if self.buffer.len() < self.settings.flush_threshold {
            return Flow::Continue;
        }

        if let Err(e) = self.flush_to_caller(caller_tx).await {
            tracing::warn!(call_id = %self.session.call_id, "Failed to send audio to caller: {e}");
            return Flow::Stop(StreamEnd::CallerGone);
        }

        let mark = protocol::mark_event(&self.session.stream_id, protocol::RESPONSE_MARK);
        if let Err(e) = voice.send(VoiceMessage::Text(mark.into())).await {
            tracing::warn!(call_id = %self.session.call_id, "Failed to send mark: {e}");
            return Flow::Stop(StreamEnd::VoiceLost);
        }
        Flow::Continue
    }

    /// Send everything buffered as one combined payload.
    async fn flush_to_caller<S>(&mut self, caller_tx: &mut S) -> Result<(), S::Error>
    where
        S: Sink<Message> + Unpin,
    {
        let Some(combined) = self.buffer.drain_combined() else {
            return Ok(());
        };

        let b64 = base64::engine::general_purpose::STANDARD.encode(&combined);
        send_text(caller_tx, protocol::caller_audio(&b64, self.chunk_id)).await?;
        tracing::debug!(
            call_id = %self.session.call_id,
            chunk_id = self.chunk_id,
            bytes = combined.len(),
            "Sent buffered audio to caller"
        );
        self.chunk_id += 1;
        Ok(())
    }

    /// Deliver a partial buffer when the voice leg goes away.
    async fn flush_remaining<S>(&mut self, caller_tx: &mut S)
    where
        S: Sink<Message> + Unpin,
        S::Error: Display,
    {
        if self.buffer.is_empty() {
            return;
        }
        if let Err(e) = self.flush_to_caller(caller_tx).await {
            tracing::debug!(call_id = %self.session.call_id, "Could not deliver remaining audio: {e}");
        }
    }

    /// Best-effort `stop` to the voice service, then close it.
    async fn drain(&self, voice: Option<VoiceSocket>) {
        let Some(mut socket) = voice else {
            tracing::debug!(call_id = %self.session.call_id, "No voice leg to stop");
            return;
        };

        let stop = protocol::stop_event(&self.session.stream_id);
        match socket.send(VoiceMessage::Text(stop.into())).await {
            Ok(()) => tracing::info!(call_id = %self.session.call_id, "Sent stop event to voice service"),
            Err(e) => tracing::warn!(call_id = %self.session.call_id, "Failed to send stop event: {e}"),
        }
        if let Err(e) = socket.close(None).await {
            tracing::debug!(call_id = %self.session.call_id, "Voice socket close: {e}");
        }
    }

    fn transition(&mut self, next: RelayState) {
        tracing::debug!(
            call_id = %self.session.call_id,
            from = ?self.state,
            to = ?next,
            "Relay state change"
        );
        self.state = next;
    }
}

async fn send_text<S>(sink: &mut S, text: String) -> Result<(), S::Error>
where
    S: Sink<Message> + Unpin,
{
    sink.send(Message::Text(text.into())).await
}
