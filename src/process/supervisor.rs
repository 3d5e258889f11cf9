//! Backing process supervision
//!
//! Spawns the single llama-cli process, tracks its lifecycle, restarts it
//! after a crash within a bounded budget, and shuts it down.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr};
use tokio::sync::{Mutex, MutexGuard};

use super::reader::OutputReader;
use crate::config::{LaunchConfig, ProcessConfig, RestartPolicy};
use crate::utils::require_regular_file;
use crate::{Error, Result};

/// Lifecycle of the backing process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcessState {
    NotStarted,
    Starting,
    Ready,
    /// Output closed or the process exited unexpectedly. Terminal for a handle.
    Crashed,
    /// Torn down on request
    Stopped,
}

pub type ProcessInput = Box<dyn AsyncWrite + Send + Unpin>;
pub type ProcessOutput = Box<dyn AsyncRead + Send + Unpin>;

/// Input and output pipes, held together under the turn lock
pub struct TurnIo {
    pub(crate) stdin: ProcessInput,
    pub(crate) stdout: OutputReader<ProcessOutput>,
}

/// One running backing process and its pipes
pub struct ProcessHandle {
    generation: u64,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    launch: LaunchConfig,
    state: parking_lot::Mutex<ProcessState>,

    /// Held for the whole of a turn so turns never interleave on the pipes
    io: Mutex<TurnIo>,

    child: Mutex<Option<Child>>,
}

impl ProcessHandle {
    fn new(
        generation: u64,
        child: Option<Child>,
        stdin: ProcessInput,
        stdout: ProcessOutput,
        launch: LaunchConfig,
        read_window: usize,
    ) -> Self {
        Self {
            generation,
            pid: child.as_ref().and_then(|c| c.id()),
            started_at: Utc::now(),
            launch,
            state: parking_lot::Mutex::new(ProcessState::Starting),
            io: Mutex::new(TurnIo {
                stdin,
                stdout: OutputReader::new(stdout, read_window),
            }),
            child: Mutex::new(child),
        }
    }

    /// Wrap already-open pipes in a ready handle with no child behind it
    #[cfg(test)]
    pub(crate) fn from_streams(
        stdin: ProcessInput,
        stdout: ProcessOutput,
        launch: LaunchConfig,
        read_window: usize,
    ) -> Self {
        let handle = Self::new(0, None, stdin, stdout, launch, read_window);
        handle.mark_ready();
        handle
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn launch(&self) -> &LaunchConfig {
        &self.launch
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock()
    }

    fn mark_ready(&self) {
        let mut state = self.state.lock();
        if *state == ProcessState::Starting {
            *state = ProcessState::Ready;
        }
    }

    /// Record an unexpected end of output. Has no effect after a requested stop.
    pub(crate) fn mark_crashed(&self) {
        let mut state = self.state.lock();
        if matches!(*state, ProcessState::Starting | ProcessState::Ready) {
            tracing::error!(
                generation = self.generation,
                pid = ?self.pid,
                "llama-cli process terminated unexpectedly"
            );
            *state = ProcessState::Crashed;
        }
    }

    /// Acquire the turn lock
    pub async fn lock_turn(&self) -> MutexGuard<'_, TurnIo> {
        self.io.lock().await
    }

    /// Check if the child has exited
    pub async fn has_exited(&self) -> bool {
        let mut child = self.child.lock().await;
        match child.as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Close stdin, give the process a moment to exit, then kill it
    async fn shutdown(&self) {
        *self.state.lock() = ProcessState::Stopped;

        // Waits for an in-flight turn to drain, but not forever
        match tokio::time::timeout(Duration::from_secs(5), self.io.lock()).await {
            Ok(mut io) => {
                if let Err(e) = io.stdin.shutdown().await {
                    tracing::debug!("Failed to close llama-cli stdin: {}", e);
                }
            }
            Err(_) => tracing::warn!("Turn still in flight at shutdown, killing llama-cli"),
        }

        let mut child = self.child.lock().await;
        if let Some(child) = child.as_mut() {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(2)) => {
                    tracing::warn!("llama-cli did not exit gracefully, killing...");
                    child.kill().await.ok();
                }
                status = child.wait() => {
                    tracing::info!("llama-cli exited with status: {:?}", status);
                }
            }
        }
    }
}

/// Point-in-time view of the supervised process
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStatus {
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub generation: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub restart_attempts: u32,
    pub total_spawns: u64,
}

/// Owns the backing process. At most one handle is live at a time.
pub struct ProcessSupervisor {
    process: ProcessConfig,
    read_window: usize,
    restart: RestartPolicy,

    /// Serializes start, restart and shutdown
    lifecycle: Mutex<()>,

    current: parking_lot::RwLock<Option<Arc<ProcessHandle>>>,
    restarting: parking_lot::Mutex<bool>,
    restart_attempts: AtomicU32,
    spawns: AtomicU64,
}

impl ProcessSupervisor {
    pub fn new(process: ProcessConfig, read_window: usize, restart: RestartPolicy) -> Self {
        Self {
            process,
            read_window,
            restart,
            lifecycle: Mutex::new(()),
            current: parking_lot::RwLock::new(None),
            restarting: parking_lot::Mutex::new(false),
            restart_attempts: AtomicU32::new(0),
            spawns: AtomicU64::new(0),
        }
    }

    /// Return the live handle, starting the process if needed.
    ///
    /// Idempotent while the process is ready. A crashed process is replaced
    /// only while the restart budget lasts.
    pub async fn ensure_started(&self) -> Result<Arc<ProcessHandle>> {
        let _lifecycle = self.lifecycle.lock().await;

        let existing = self.current.read().clone();
        if let Some(handle) = existing {
            if handle.state() == ProcessState::Ready && handle.has_exited().await {
                handle.mark_crashed();
            }

            match handle.state() {
                ProcessState::Ready | ProcessState::Starting => return Ok(handle),
                ProcessState::Crashed => self.begin_restart(&handle).await?,
                ProcessState::Stopped | ProcessState::NotStarted => {}
            }
        }

        let spawned = self.spawn().await;
        *self.restarting.lock() = false;
        let handle = Arc::new(spawned?);
        *self.current.write() = Some(handle.clone());
        Ok(handle)
    }

    async fn begin_restart(&self, crashed: &ProcessHandle) -> Result<()> {
        let attempt = self.restart_attempts.load(Ordering::SeqCst) + 1;
        if attempt > self.restart.max_attempts {
            tracing::error!(
                generation = crashed.generation(),
                max_attempts = self.restart.max_attempts,
                "Restart budget exhausted; operator restart required"
            );
            return Err(Error::ProcessTerminated(format!(
                "llama-cli generation {} crashed and automatic restarts are exhausted",
                crashed.generation()
            )));
        }
        self.restart_attempts.store(attempt, Ordering::SeqCst);

        let delay = self.restart.delay_for(attempt);
        tracing::warn!(
            generation = crashed.generation(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "llama-cli crashed; transitioning Crashed -> Starting"
        );
        *self.restarting.lock() = true;
        tokio::time::sleep(delay).await;
        Ok(())
    }

    /// Operator restart: tears down whatever is running and resets the budget
    pub async fn restart(&self) -> Result<Arc<ProcessHandle>> {
        {
            let _lifecycle = self.lifecycle.lock().await;
            let existing = self.current.write().take();
            if let Some(handle) = existing {
                tracing::info!(generation = handle.generation(), "Restarting llama-cli on request");
                handle.shutdown().await;
            }
            self.restart_attempts.store(0, Ordering::SeqCst);
        }
        self.ensure_started().await
    }

    /// Stop the process. A later `ensure_started` spawns a new one.
    pub async fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let existing = self.current.read().clone();
        if let Some(handle) = existing {
            if handle.state() != ProcessState::Stopped {
                handle.shutdown().await;
                tracing::info!(generation = handle.generation(), "llama-cli stopped");
            }
        }
    }

    /// A turn reached its boundary, so the process is healthy again
    pub fn note_healthy_turn(&self) {
        self.restart_attempts.store(0, Ordering::SeqCst);
    }

    pub fn current(&self) -> Option<Arc<ProcessHandle>> {
        self.current.read().clone()
    }

    pub fn total_spawns(&self) -> u64 {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ProcessStatus {
        let current = self.current();
        let state = if *self.restarting.lock() {
            ProcessState::Starting
        } else {
            current
                .as_ref()
                .map(|h| h.state())
                .unwrap_or(ProcessState::NotStarted)
        };

        ProcessStatus {
            state,
            pid: current.as_ref().and_then(|h| h.pid()),
            generation: current.as_ref().map(|h| h.generation()),
            started_at: current.as_ref().map(|h| h.started_at()),
            restart_attempts: self.restart_attempts.load(Ordering::SeqCst),
            total_spawns: self.total_spawns(),
        }
    }

    async fn spawn(&self) -> Result<ProcessHandle> {
        let launch = self.process.resolve();
        require_regular_file(&launch.executable, "llama-cli executable")?;
        require_regular_file(&launch.model, "model file")?;

        tracing::info!(
            "Spawning llama-cli from {:?} with model {:?}",
            launch.executable,
            launch.model
        );

        let mut child = tokio::process::Command::new(&launch.executable)
            .args(launch.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {}", launch.executable.display(), e)))?;

        let generation = self.spawns.fetch_add(1, Ordering::SeqCst) + 1;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Spawn("Failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn("Failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Spawn("Failed to capture stderr".to_string()))?;

        tokio::spawn(drain_stderr(stderr, generation));

        let warmup = launch.warmup;
        let handle = ProcessHandle::new(
            generation,
            Some(child),
            Box::new(stdin),
            Box::new(stdout),
            launch,
            self.read_window,
        );

        // The startup banner is left in the pipe; the first turn reads past it
        if !warmup.is_zero() {
            tokio::time::sleep(warmup).await;
        }
        handle.mark_ready();

        tracing::info!(generation, pid = ?handle.pid(), "llama-cli ready");
        Ok(handle)
    }
}

/// Forward stderr to the log so the pipe never fills
async fn drain_stderr(stderr: ChildStderr, generation: u64) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                tracing::debug!(target: "llama_bridge::stderr", generation, "{}", text.trim_end());
            }
            Err(e) => {
                tracing::debug!(generation, "llama-cli stderr closed: {}", e);
                break;
            }
        }
    }
}

/// Find llama-cli in PATH or common build locations
pub fn locate_executable() -> PathBuf {
    if let Ok(path) = which::which("llama-cli") {
        return path;
    }

    let home = dirs::home_dir().unwrap_or_default();
    let default_build = home.join("implementation/server-core/llama.cpp/build/bin/llama-cli");

    let common_paths = [
        default_build.clone(),
        home.join("llama.cpp/build/bin/llama-cli"),
        home.join(".local/bin/llama-cli"),
        PathBuf::from("/usr/local/bin/llama-cli"),
        PathBuf::from("/opt/homebrew/bin/llama-cli"),
    ];

    common_paths
        .into_iter()
        .find(|path| path.is_file())
        .unwrap_or(default_build)
}

/// Model artifact used when none is configured
pub fn default_model_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join("implementation/server-core/model_storage/Llama-3.2-1B-Instruct-Q4_K_M.gguf")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("llama-cli");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn process_config(dir: &Path, body: &str) -> ProcessConfig {
        let model = dir.join("model.gguf");
        std::fs::write(&model, b"GGUF").unwrap();
        ProcessConfig {
            executable: Some(write_script(dir, body)),
            model: Some(model),
            warmup_ms: 0,
            ..ProcessConfig::default()
        }
    }

    fn fast_restarts(max_attempts: u32) -> RestartPolicy {
        RestartPolicy {
            max_attempts,
            min_delay_ms: 1,
            max_delay_ms: 5,
        }
    }

    #[tokio::test]
    async fn test_missing_executable_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = process_config(dir.path(), "exit 0");
        let missing = dir.path().join("no-such-llama-cli");
        config.executable = Some(missing.clone());

        let supervisor = ProcessSupervisor::new(config, 128, RestartPolicy::default());
        let err = supervisor.ensure_started().await.err().unwrap();

        assert_eq!(err.config_path(), Some(missing.as_path()));
        assert_eq!(supervisor.total_spawns(), 0);
        assert_eq!(supervisor.status().state, ProcessState::NotStarted);
    }

    #[tokio::test]
    async fn test_missing_model_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = process_config(dir.path(), "exit 0");
        let missing = dir.path().join("absent.gguf");
        config.model = Some(missing.clone());

        let supervisor = ProcessSupervisor::new(config, 128, RestartPolicy::default());
        let err = supervisor.ensure_started().await.err().unwrap();

        assert_eq!(err.config_path(), Some(missing.as_path()));
        assert!(err.to_string().contains("model file not found"));
        assert_eq!(supervisor.total_spawns(), 0);
    }

    #[tokio::test]
    async fn test_ensure_started_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = process_config(dir.path(), "exec cat > /dev/null");
        let supervisor = ProcessSupervisor::new(config, 128, RestartPolicy::default());

        let first = supervisor.ensure_started().await.unwrap();
        let second = supervisor.ensure_started().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(supervisor.total_spawns(), 1);
        assert_eq!(first.state(), ProcessState::Ready);
        assert!(first.pid().is_some());

        supervisor.shutdown().await;
        assert_eq!(first.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_launch_uses_fixed_argument_set() {
        let dir = tempfile::tempdir().unwrap();
        let args_file = dir.path().join("args.txt");
        let body = format!(
            "printf '%s\\n' \"$@\" > '{}'\nexec cat > /dev/null",
            args_file.display()
        );
        let config = process_config(dir.path(), &body);
        let model = config.model.clone().unwrap();
        let supervisor = ProcessSupervisor::new(config, 128, RestartPolicy::default());
        supervisor.ensure_started().await.unwrap();

        let mut recorded = String::new();
        for _ in 0..50 {
            recorded = std::fs::read_to_string(&args_file).unwrap_or_default();
            if recorded.lines().count() == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let expected = format!(
            "-m\n{}\n--system-prompt\nYou are a helpful assistant.\n-n\n256\n--split-mode\nnone\n--main-gpu\n0\n",
            model.display()
        );
        assert_eq!(recorded, expected);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_crashed_process_restarts_within_budget() {
        let dir = tempfile::tempdir().unwrap();
        let config = process_config(dir.path(), "exit 0");
        let supervisor = ProcessSupervisor::new(config, 128, fast_restarts(1));

        let first = supervisor.ensure_started().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let second = supervisor.ensure_started().await.unwrap();
        assert_eq!(first.state(), ProcessState::Crashed);
        assert_eq!(second.generation(), 2);
        assert_eq!(supervisor.status().restart_attempts, 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let err = supervisor.ensure_started().await.err().unwrap();
        assert!(matches!(err, Error::ProcessTerminated(_)));
        assert_eq!(supervisor.total_spawns(), 2);
        assert_eq!(supervisor.status().state, ProcessState::Crashed);
    }

    #[tokio::test]
    async fn test_no_automatic_restart_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let config = process_config(dir.path(), "exit 0");
        let supervisor = ProcessSupervisor::new(config, 128, RestartPolicy::disabled());

        supervisor.ensure_started().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(supervisor.ensure_started().await.is_err());
        assert_eq!(supervisor.total_spawns(), 1);
    }

    #[tokio::test]
    async fn test_operator_restart_resets_budget() {
        let dir = tempfile::tempdir().unwrap();
        let config = process_config(dir.path(), "exit 0");
        let supervisor = ProcessSupervisor::new(config, 128, RestartPolicy::disabled());

        supervisor.ensure_started().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(supervisor.ensure_started().await.is_err());

        let fresh = supervisor.restart().await.unwrap();
        assert_eq!(fresh.generation(), 2);
        assert_eq!(supervisor.status().restart_attempts, 0);
    }

    #[tokio::test]
    async fn test_start_after_shutdown_spawns_new_process() {
        let dir = tempfile::tempdir().unwrap();
        let config = process_config(dir.path(), "exec cat > /dev/null");
        let supervisor = ProcessSupervisor::new(config, 128, RestartPolicy::disabled());

        let first = supervisor.ensure_started().await.unwrap();
        supervisor.shutdown().await;
        let second = supervisor.ensure_started().await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.state(), ProcessState::Ready);
        supervisor.shutdown().await;
    }
}
