//! Backing process management
//!
//! This module handles spawning, monitoring, and reading from the
//! llama-cli subprocess that holds the conversation.

mod reader;
mod supervisor;

pub use reader::{OutputReader, ReadOutcome};
pub use supervisor::{
    default_model_path, locate_executable, ProcessHandle, ProcessInput, ProcessOutput,
    ProcessState, ProcessStatus, ProcessSupervisor, TurnIo,
};
