//! Application state management

use std::sync::Arc;

use crate::bridge::{LlamaResponder, Responder, TurnBridge};
use crate::config::BridgeConfig;
use crate::mock::MockResponder;
use crate::process::ProcessSupervisor;
use crate::Result;

/// State shared by every request handler
pub struct AppState {
    pub config: BridgeConfig,

    /// Answers user turns for every session
    pub responder: Arc<dyn Responder>,

    /// Backing process manager; absent when serving the mock backend
    pub supervisor: Option<Arc<ProcessSupervisor>>,
}

impl AppState {
    /// State backed by the llama-cli process
    pub fn new(config: BridgeConfig) -> Self {
        let supervisor = Arc::new(ProcessSupervisor::new(
            config.process.clone(),
            config.turn.read_window,
            config.restart.clone(),
        ));
        let bridge = TurnBridge::from_config(&config.turn);
        let responder = Arc::new(LlamaResponder::new(supervisor.clone(), bridge));

        Self {
            config,
            responder,
            supervisor: Some(supervisor),
        }
    }

    /// State backed by the word-by-word echo responder
    pub fn mock(config: BridgeConfig) -> Self {
        Self {
            config,
            responder: Arc::new(MockResponder::default()),
            supervisor: None,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        if self.supervisor.is_some() {
            "llama"
        } else {
            "mock"
        }
    }

    /// Start the backing process. Fails on a missing executable or model.
    pub async fn start_backend(&self) -> Result<()> {
        if let Some(supervisor) = &self.supervisor {
            supervisor.ensure_started().await?;
        }
        Ok(())
    }

    /// Stop the backing process
    pub async fn stop_backend(&self) {
        if let Some(supervisor) = &self.supervisor {
            supervisor.shutdown().await;
        }
    }
}
