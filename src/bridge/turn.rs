//! Turn execution against the backing process
//!
//! A turn writes one user message to the process and reads its output until
//! the boundary detector fires, the output closes, or the turn deadline
//! passes. Output is pushed into a bounded channel as it arrives, so the
//! reader never runs far ahead of a slow client.
//!
//! Each turn runs on its own task and holds the handle's turn lock until it
//! ends. If the receiving side goes away the task keeps reading to the
//! boundary anyway, leaving the pipe clean for the next turn. A turn that
//! misses its deadline is reported as closed straight away, then drains to
//! the prompt under the same lock; if the prompt never comes the process is
//! marked crashed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::boundary::{BoundaryDetector, PromptBoundary};
use crate::config::TurnConfig;
use crate::process::{ProcessHandle, ProcessState, ProcessSupervisor, ReadOutcome};
use crate::{Error, Result};

/// Why a turn stopped reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TerminalReason {
    BoundaryFound,
    StreamClosed,
}

/// One user message and the output produced for it
#[derive(Debug, Clone)]
pub struct Turn {
    input: String,
    output: String,
    reason: Option<TerminalReason>,
    deadline_exceeded: bool,
}

impl Turn {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: String::new(),
            reason: None,
            deadline_exceeded: false,
        }
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    /// Everything read so far, in arrival order
    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn reason(&self) -> Option<TerminalReason> {
        self.reason
    }

    pub fn boundary_detected(&self) -> bool {
        self.reason == Some(TerminalReason::BoundaryFound)
    }

    /// The turn was cut off by its deadline rather than by the process
    pub fn deadline_exceeded(&self) -> bool {
        self.deadline_exceeded
    }

    pub fn is_complete(&self) -> bool {
        self.reason.is_some()
    }

    /// Append output. Ignored once the turn is complete.
    pub fn push(&mut self, text: &str) {
        if self.reason.is_none() {
            self.output.push_str(text);
        }
    }

    pub fn finish(&mut self, reason: TerminalReason) {
        if self.reason.is_none() {
            self.reason = Some(reason);
        }
    }

    fn finish_deadline(&mut self) {
        if self.reason.is_none() {
            self.deadline_exceeded = true;
            self.reason = Some(TerminalReason::StreamClosed);
        }
    }
}

/// Where the framed result of a turn comes from
enum Outcome {
    Task(JoinHandle<Result<Turn>>),
    /// Sent by a task that may keep running after the turn is framed
    Reported(oneshot::Receiver<Result<Turn>>),
}

/// Receiving end of a running turn
pub struct TurnStream {
    fragments: mpsc::Receiver<String>,
    outcome: Outcome,
}

impl TurnStream {
    pub fn new(fragments: mpsc::Receiver<String>, outcome: JoinHandle<Result<Turn>>) -> Self {
        Self {
            fragments,
            outcome: Outcome::Task(outcome),
        }
    }

    fn reported(
        fragments: mpsc::Receiver<String>,
        outcome: oneshot::Receiver<Result<Turn>>,
    ) -> Self {
        Self {
            fragments,
            outcome: Outcome::Reported(outcome),
        }
    }

    /// Next output fragment, or `None` once the turn has stopped producing
    pub async fn next_fragment(&mut self) -> Option<String> {
        self.fragments.recv().await
    }

    /// Wait for the turn to end.
    ///
    /// Fragments not yet received are discarded; the turn still runs to its
    /// boundary.
    pub async fn finish(self) -> Result<Turn> {
        drop(self.fragments);
        match self.outcome {
            Outcome::Task(task) => task
                .await
                .map_err(|e| Error::Other(format!("Turn task failed: {}", e)))?,
            Outcome::Reported(report) => report
                .await
                .map_err(|_| Error::Other("Turn task ended without a result".into()))?,
        }
    }
}

/// Something that answers a user message with a stream of fragments
pub trait Responder: Send + Sync {
    fn respond(&self, message: String) -> TurnStream;
}

/// Runs turns against a process handle
#[derive(Clone)]
pub struct TurnBridge {
    detector: Arc<dyn BoundaryDetector>,
    timeout: Duration,
    drain_timeout: Duration,
    channel_capacity: usize,
}

impl TurnBridge {
    pub fn new(
        detector: Arc<dyn BoundaryDetector>,
        timeout: Duration,
        channel_capacity: usize,
    ) -> Self {
        Self {
            detector,
            timeout,
            drain_timeout: timeout,
            channel_capacity: channel_capacity.max(1),
        }
    }

    pub fn from_config(config: &TurnConfig) -> Self {
        Self::new(
            Arc::new(PromptBoundary::new(&config.prompt)),
            config.timeout(),
            config.channel_capacity,
        )
        .with_drain_timeout(config.drain_timeout())
    }

    /// How long a turn that missed its deadline may keep reading to the
    /// prompt before the process is given up on
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Start a turn. Each call is a fresh turn; it waits for any turn
    /// already in flight on the same handle.
    pub fn turn(&self, handle: Arc<ProcessHandle>, message: String) -> TurnStream {
        self.start(message, async move { Ok(handle) }, || {})
    }

    /// Spawn the turn task. `acquire` yields the handle to run against and
    /// `on_boundary` runs when the turn ends at the prompt.
    fn start<A, B>(&self, message: String, acquire: A, on_boundary: B) -> TurnStream
    where
        A: Future<Output = Result<Arc<ProcessHandle>>> + Send + 'static,
        B: FnOnce() + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let (report, outcome) = oneshot::channel();
        let bridge = self.clone();

        tokio::spawn(async move {
            let mut report = Report(Some(report));
            let result = match acquire.await {
                Ok(handle) => bridge.run_turn(&handle, message, tx, &mut report).await,
                Err(e) => Err(e),
            };
            if matches!(&result, Ok(turn) if turn.boundary_detected()) {
                on_boundary();
            }
            report.deliver(result);
        });

        TurnStream::reported(rx, outcome)
    }

    async fn run_turn(
        &self,
        handle: &ProcessHandle,
        message: String,
        tx: mpsc::Sender<String>,
        report: &mut Report,
    ) -> Result<Turn> {
        let mut io = handle.lock_turn().await;

        if handle.state() != ProcessState::Ready {
            return Err(Error::ProcessTerminated(format!(
                "llama-cli generation {} is {:?}",
                handle.generation(),
                handle.state()
            )));
        }

        let mut turn = Turn::new(message);
        let mut line = String::with_capacity(turn.input().len() + 1);
        line.push_str(turn.input());
        line.push('\n');

        let written = async {
            io.stdin.write_all(line.as_bytes()).await?;
            io.stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            handle.mark_crashed();
            return Err(Error::ProcessTerminated(format!(
                "Failed to write to llama-cli stdin: {}",
                e
            )));
        }

        let mut deadline = Instant::now() + self.timeout;
        let mut sink = FragmentSink::new(tx);
        // Output read after the deadline, scanned for the prompt only
        let mut late: Option<String> = None;

        loop {
            let outcome = match io.stdout.read_chunk(Some(deadline)).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!("Error reading from llama-cli stdout: {}", e);
                    ReadOutcome::Closed {
                        tail: String::new(),
                    }
                }
            };

            match outcome {
                ReadOutcome::Text(text) => {
                    if text.is_empty() {
                        continue;
                    }
                    let at_boundary = match late.as_mut() {
                        Some(late) => {
                            late.push_str(&text);
                            self.detector.is_boundary(late.as_str())
                        }
                        None => {
                            turn.push(&text);
                            sink.send(text).await;
                            self.detector.is_boundary(turn.output())
                        }
                    };
                    if at_boundary {
                        turn.finish(TerminalReason::BoundaryFound);
                        break;
                    }
                }
                ReadOutcome::Closed { tail } => {
                    if !tail.is_empty() && late.is_none() {
                        turn.push(&tail);
                        sink.send(tail).await;
                    }
                    handle.mark_crashed();
                    turn.finish(TerminalReason::StreamClosed);
                    break;
                }
                ReadOutcome::TimedOut if late.is_none() => {
                    tracing::warn!(
                        generation = handle.generation(),
                        timeout_secs = self.timeout.as_secs_f64(),
                        "Turn deadline passed before the prompt returned; draining in the background"
                    );
                    turn.finish_deadline();
                    sink.close();
                    report.deliver(Ok(turn.clone()));
                    late = Some(turn.output().to_string());
                    deadline = Instant::now() + self.drain_timeout;
                }
                ReadOutcome::TimedOut => {
                    tracing::error!(
                        generation = handle.generation(),
                        drain_secs = self.drain_timeout.as_secs_f64(),
                        "llama-cli never returned to the prompt after a missed deadline"
                    );
                    handle.mark_crashed();
                    break;
                }
            }
        }

        tracing::debug!(
            generation = handle.generation(),
            bytes = turn.output().len(),
            reason = ?turn.reason(),
            deadline_exceeded = turn.deadline_exceeded(),
            "Turn complete"
        );

        Ok(turn)
    }
}

/// Hands the framed turn to its stream exactly once
struct Report(Option<oneshot::Sender<Result<Turn>>>);

impl Report {
    fn deliver(&mut self, result: Result<Turn>) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(result);
        }
    }
}

/// Forwards fragments until the receiver disappears, then discards them
struct FragmentSink {
    tx: Option<mpsc::Sender<String>>,
}

impl FragmentSink {
    fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx: Some(tx) }
    }

    async fn send(&mut self, fragment: String) {
        if let Some(tx) = &self.tx {
            if tx.send(fragment).await.is_err() {
                tracing::debug!("Turn receiver dropped, draining remaining output");
                self.tx = None;
            }
        }
    }

    /// End the fragment stream for the receiver
    fn close(&mut self) {
        self.tx = None;
    }
}

/// Serves turns from the supervised llama-cli process
pub struct LlamaResponder {
    supervisor: Arc<ProcessSupervisor>,
    bridge: TurnBridge,
}

impl LlamaResponder {
    pub fn new(supervisor: Arc<ProcessSupervisor>, bridge: TurnBridge) -> Self {
        Self { supervisor, bridge }
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }
}

impl Responder for LlamaResponder {
    fn respond(&self, message: String) -> TurnStream {
        let starting = self.supervisor.clone();
        let healthy = self.supervisor.clone();
        self.bridge.start(
            message,
            async move { starting.ensure_started().await },
            move || healthy.note_healthy_turn(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessConfig;
    use std::path::PathBuf;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};

    fn launch() -> crate::config::LaunchConfig {
        ProcessConfig {
            executable: Some(PathBuf::from("/test/llama-cli")),
            model: Some(PathBuf::from("/test/model.gguf")),
            ..ProcessConfig::default()
        }
        .resolve()
    }

    /// Handle over in-memory pipes, plus the process side of both pipes
    fn piped_handle(window: usize) -> (Arc<ProcessHandle>, DuplexStream, DuplexStream) {
        let (stdin_ours, stdin_theirs) = tokio::io::duplex(4096);
        let (stdout_theirs, stdout_ours) = tokio::io::duplex(4096);
        let handle = ProcessHandle::from_streams(
            Box::new(stdin_ours),
            Box::new(stdout_ours),
            launch(),
            window,
        );
        (Arc::new(handle), stdin_theirs, stdout_theirs)
    }

    /// Echo each input line a character at a time, then print the prompt
    async fn echo_process(stdin: DuplexStream, mut stdout: DuplexStream) {
        let mut lines = BufReader::new(stdin).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            for ch in line.chars() {
                let mut buf = [0u8; 4];
                if stdout.write_all(ch.encode_utf8(&mut buf).as_bytes()).await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            if stdout.write_all(b"\n> ").await.is_err() {
                return;
            }
        }
    }

    fn bridge(timeout: Duration, capacity: usize) -> TurnBridge {
        TurnBridge::new(Arc::new(PromptBoundary::default()), timeout, capacity)
    }

    async fn collect(mut stream: TurnStream) -> (Vec<String>, Result<Turn>) {
        let mut fragments = Vec::new();
        while let Some(fragment) = stream.next_fragment().await {
            fragments.push(fragment);
        }
        (fragments, stream.finish().await)
    }

    #[tokio::test]
    async fn test_echo_turn_ends_at_prompt() {
        let (handle, stdin, stdout) = piped_handle(128);
        tokio::spawn(echo_process(stdin, stdout));

        let stream = bridge(Duration::from_secs(5), 8).turn(handle, "Hello".into());
        let (fragments, turn) = collect(stream).await;
        let turn = turn.unwrap();

        let joined = fragments.concat();
        assert!(joined.contains("Hello"));
        assert_eq!(joined, turn.output());
        assert_eq!(turn.reason(), Some(TerminalReason::BoundaryFound));
        assert!(!turn.deadline_exceeded());
    }

    #[tokio::test]
    async fn test_small_window_still_concatenates_exactly() {
        let (handle, stdin, mut stdout) = piped_handle(3);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdin).lines();
            let _ = lines.next_line().await;
            stdout
                .write_all("Bonjour, ça va très bien\n> ".as_bytes())
                .await
                .unwrap();
            let _ = lines.next_line().await;
        });

        let stream = bridge(Duration::from_secs(5), 2).turn(handle, "Salut".into());
        let (fragments, turn) = collect(stream).await;
        let turn = turn.unwrap();

        assert!(fragments.len() > 1);
        assert_eq!(fragments.concat(), "Bonjour, ça va très bien\n> ");
        assert_eq!(turn.output(), fragments.concat());
    }

    #[tokio::test]
    async fn test_closed_output_ends_turn_and_marks_crash() {
        let (handle, stdin, stdout) = piped_handle(128);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdin).lines();
            let _ = lines.next_line().await;
            drop(stdout);
        });

        let stream = bridge(Duration::from_secs(5), 8).turn(handle.clone(), "Hello".into());
        let (fragments, turn) = collect(stream).await;
        let turn = turn.unwrap();

        assert!(fragments.concat().is_empty());
        assert_eq!(turn.reason(), Some(TerminalReason::StreamClosed));
        assert!(!turn.deadline_exceeded());
        assert_eq!(handle.state(), ProcessState::Crashed);

        let next = bridge(Duration::from_secs(5), 8).turn(handle, "again".into());
        let (fragments, turn) = collect(next).await;
        assert!(fragments.is_empty());
        assert!(matches!(turn, Err(Error::ProcessTerminated(_))));
    }

    #[tokio::test]
    async fn test_partial_output_is_kept_when_stream_closes() {
        let (handle, stdin, mut stdout) = piped_handle(128);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdin).lines();
            let _ = lines.next_line().await;
            stdout.write_all(b"cut off mid").await.unwrap();
        });

        let stream = bridge(Duration::from_secs(5), 8).turn(handle, "Hello".into());
        let (fragments, turn) = collect(stream).await;

        assert_eq!(fragments.concat(), "cut off mid");
        assert_eq!(turn.unwrap().reason(), Some(TerminalReason::StreamClosed));
    }

    #[tokio::test]
    async fn test_deadline_closes_turn_then_drains_late_answer() {
        let (handle, stdin, mut stdout) = piped_handle(128);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdin).lines();
            let _ = lines.next_line().await;
            tokio::time::sleep(Duration::from_millis(300)).await;
            stdout.write_all(b"answer-for-A\n> ").await.unwrap();

            let second = lines.next_line().await.unwrap().unwrap();
            stdout
                .write_all(format!("answer-for-{}\n> ", second).as_bytes())
                .await
                .unwrap();
            let _ = lines.next_line().await;
        });

        let slow = bridge(Duration::from_millis(100), 8).with_drain_timeout(Duration::from_secs(2));
        let started = Instant::now();
        let (a_fragments, a_turn) = collect(slow.turn(handle.clone(), "A".into())).await;
        let a_turn = a_turn.unwrap();

        // Framed at the deadline, not when the late answer shows up
        assert!(started.elapsed() < Duration::from_millis(290));
        assert!(a_fragments.is_empty());
        assert_eq!(a_turn.reason(), Some(TerminalReason::StreamClosed));
        assert!(a_turn.deadline_exceeded());

        let (b_fragments, b_turn) =
            collect(bridge(Duration::from_secs(2), 8).turn(handle.clone(), "B".into())).await;

        assert_eq!(b_fragments.concat(), "answer-for-B\n> ");
        assert!(b_turn.unwrap().boundary_detected());
        assert_eq!(handle.state(), ProcessState::Ready);
    }

    #[tokio::test]
    async fn test_missing_prompt_after_deadline_marks_crash() {
        let (handle, stdin, mut stdout) = piped_handle(128);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdin).lines();
            let _ = lines.next_line().await;
            stdout.write_all(b"thinking").await.unwrap();
            // Never prints the prompt; keeps both pipes open
            let _ = lines.next_line().await;
            drop(stdout);
        });

        let bridge = bridge(Duration::from_millis(100), 8).with_drain_timeout(Duration::from_millis(100));
        let (fragments, turn) = collect(bridge.turn(handle.clone(), "Hi".into())).await;
        let turn = turn.unwrap();

        assert_eq!(fragments.concat(), "thinking");
        assert_eq!(turn.reason(), Some(TerminalReason::StreamClosed));
        assert!(turn.deadline_exceeded());

        // The next turn waits out the drain and finds the process given up on
        let (fragments, next) = collect(bridge.turn(handle.clone(), "again".into())).await;
        assert!(fragments.is_empty());
        assert!(matches!(next, Err(Error::ProcessTerminated(_))));
        assert_eq!(handle.state(), ProcessState::Crashed);
    }

    #[tokio::test]
    async fn test_abandoned_turn_is_drained_before_next() {
        let (handle, stdin, mut stdout) = piped_handle(8);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdin).lines();
            let _ = lines.next_line().await;
            let long = "word ".repeat(60);
            stdout.write_all(long.as_bytes()).await.unwrap();
            stdout.write_all(b"\n> ").await.unwrap();

            let second = lines.next_line().await.unwrap().unwrap();
            stdout
                .write_all(format!("{}\n> ", second).as_bytes())
                .await
                .unwrap();
            let _ = lines.next_line().await;
        });

        let bridge = bridge(Duration::from_secs(5), 1);
        let mut first = bridge.turn(handle.clone(), "tell me a story".into());
        assert!(first.next_fragment().await.is_some());
        drop(first);

        let (fragments, turn) = collect(bridge.turn(handle, "second".into())).await;
        assert_eq!(fragments.concat(), "second\n> ");
        assert!(turn.unwrap().boundary_detected());
    }

    #[tokio::test]
    async fn test_concurrent_turns_do_not_interleave() {
        let (handle, stdin, stdout) = piped_handle(4);
        tokio::spawn(echo_process(stdin, stdout));

        let bridge = bridge(Duration::from_secs(5), 4);
        let a = bridge.turn(handle.clone(), "alpha-alpha-alpha".into());
        let b = bridge.turn(handle.clone(), "beta-beta-beta".into());

        let ((a_fragments, a_turn), (b_fragments, b_turn)) = tokio::join!(collect(a), collect(b));

        assert_eq!(a_fragments.concat(), "alpha-alpha-alpha\n> ");
        assert_eq!(b_fragments.concat(), "beta-beta-beta\n> ");
        assert!(a_turn.unwrap().boundary_detected());
        assert!(b_turn.unwrap().boundary_detected());
    }

    #[test]
    fn test_turn_output_is_append_only_until_complete() {
        let mut turn = Turn::new("q");
        turn.push("a");
        turn.push("b");
        turn.finish(TerminalReason::BoundaryFound);
        turn.push("c");
        turn.finish(TerminalReason::StreamClosed);

        assert_eq!(turn.output(), "ab");
        assert_eq!(turn.reason(), Some(TerminalReason::BoundaryFound));
    }
}
