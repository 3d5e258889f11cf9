//! Mock backend for local testing
//!
//! Echoes the user text back with a prefix, one word per fragment, so a
//! client can exercise streaming without a model on the machine.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::bridge::{Responder, TerminalReason, Turn, TurnStream};

pub struct MockResponder {
    delay: Duration,
}

impl MockResponder {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for MockResponder {
    fn default() -> Self {
        Self::new(Duration::from_millis(20))
    }
}

impl Responder for MockResponder {
    fn respond(&self, message: String) -> TurnStream {
        let (tx, rx) = mpsc::channel(8);
        let delay = self.delay;

        let outcome = tokio::spawn(async move {
            let mut turn = Turn::new(message);
            let reply = format!("[MOCK] You said: {}", turn.input());

            for word in reply.split_whitespace() {
                let fragment = format!("{} ", word);
                turn.push(&fragment);
                if tx.send(fragment).await.is_err() {
                    break;
                }
                tokio::time::sleep(delay).await;
            }

            turn.finish(TerminalReason::BoundaryFound);
            Ok(turn)
        });

        TurnStream::new(rx, outcome)
    }
}
