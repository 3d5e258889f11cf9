//! Per-connection streaming session
//!
//! Each inbound text frame is one user turn. Output fragments go back as
//! text frames in the order they were produced, followed by a single
//! [`END_OF_RESPONSE`] frame. The next inbound frame is not read until that
//! sentinel has been sent.

use std::fmt::Display;
use std::sync::Arc;

use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use uuid::Uuid;

use crate::bridge::{Responder, TerminalReason};

/// Sentinel frame closing every turn
pub const END_OF_RESPONSE: &str = "[[END_OF_RESPONSE]]";

/// Why a session stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Client closed the connection or the inbound stream ended
    ClientClosed,
    /// Client sent a frame the protocol does not allow
    ProtocolViolation(String),
    /// Reading from or writing to the client failed
    Transport(String),
    /// The backend could not serve the turn; its sentinel was still sent
    BackendUnavailable(String),
}

pub struct StreamingSession {
    id: Uuid,
    responder: Arc<dyn Responder>,
    turns_completed: u64,
    closed: bool,
}

impl StreamingSession {
    pub fn new(responder: Arc<dyn Responder>) -> Self {
        Self {
            id: Uuid::new_v4(),
            responder,
            turns_completed: 0,
            closed: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn turns_completed(&self) -> u64 {
        self.turns_completed
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Serve the connection until the client leaves or an error ends it
    pub async fn run<R, RE, W>(&mut self, mut inbound: R, mut outbound: W) -> SessionEnd
    where
        R: Stream<Item = Result<Message, RE>> + Unpin,
        RE: Display,
        W: Sink<Message> + Unpin,
        W::Error: Display,
    {
        tracing::info!(session = %self.id, "Session opened");

        let end = self.serve(&mut inbound, &mut outbound).await;
        self.closed = true;

        match &end {
            SessionEnd::ClientClosed => tracing::info!(
                session = %self.id,
                turns = self.turns_completed,
                "Session closed by client"
            ),
            other => tracing::warn!(
                session = %self.id,
                turns = self.turns_completed,
                "Session ended: {:?}",
                other
            ),
        }

        end
    }

    async fn serve<R, RE, W>(&mut self, inbound: &mut R, outbound: &mut W) -> SessionEnd
    where
        R: Stream<Item = Result<Message, RE>> + Unpin,
        RE: Display,
        W: Sink<Message> + Unpin,
        W::Error: Display,
    {
        while let Some(frame) = inbound.next().await {
            let message = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Close(_)) => return SessionEnd::ClientClosed,
                Ok(Message::Binary(_)) => {
                    return SessionEnd::ProtocolViolation(
                        "binary frames are not supported".to_string(),
                    )
                }
                Err(e) => return SessionEnd::Transport(e.to_string()),
            };

            if let Some(end) = self.serve_turn(message, outbound).await {
                return end;
            }
        }

        SessionEnd::ClientClosed
    }

    /// Run one turn. Returns `Some` when the session has to stop.
    async fn serve_turn<W>(&mut self, message: String, outbound: &mut W) -> Option<SessionEnd>
    where
        W: Sink<Message> + Unpin,
        W::Error: Display,
    {
        tracing::debug!(session = %self.id, bytes = message.len(), "Turn started");

        let mut stream = self.responder.respond(message);
        while let Some(fragment) = stream.next_fragment().await {
            if let Err(e) = outbound.send(Message::Text(fragment)).await {
                // Dropping the stream leaves the turn draining on its own task
                return Some(SessionEnd::Transport(e.to_string()));
            }
        }

        let backend_error = match stream.finish().await {
            Ok(turn) => {
                if turn.reason() == Some(TerminalReason::StreamClosed) {
                    tracing::warn!(
                        session = %self.id,
                        deadline_exceeded = turn.deadline_exceeded(),
                        "Turn ended without a prompt boundary"
                    );
                }
                None
            }
            Err(e) => {
                tracing::error!(session = %self.id, "Turn failed: {}", e);
                Some(e.to_string())
            }
        };

        if let Err(e) = outbound
            .send(Message::Text(END_OF_RESPONSE.to_string()))
            .await
        {
            return Some(SessionEnd::Transport(e.to_string()));
        }
        self.turns_completed += 1;

        backend_error.map(SessionEnd::BackendUnavailable)
    }
}
