//! Turn bridge between user messages and the backing process output

pub mod boundary;
mod turn;

pub use boundary::{BoundaryDetector, PromptBoundary};
pub use turn::{LlamaResponder, Responder, TerminalReason, Turn, TurnBridge, TurnStream};
