/// Login session lifecycle: spawn the login subprocess, stream its merged
/// stdout/stderr through the prompt matcher, hand the device prompt off
/// exactly once, and report how the session ended.
use crate::config::WatchConfig;
use crate::prompt::{DevicePrompt, PromptMatcher, PromptPatterns};
use crate::transcript::Transcript;
use crate::watchdog::{self, Termination};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// Errors that prevent the login process from starting.
#[derive(Debug)]
pub enum LaunchError {
    /// The working directory does not exist or is not a directory.
    WorkingDir { path: PathBuf },
    /// The executable does not exist.
    NotFound { path: PathBuf },
    /// The executable exists but cannot be run.
    NotExecutable { path: PathBuf },
    /// Any other spawn failure.
    Spawn {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::WorkingDir { path } => {
                write!(f, "working directory does not exist: {}", path.display())
            }
            LaunchError::NotFound { path } => {
                write!(f, "login executable not found: {}", path.display())
            }
            LaunchError::NotExecutable { path } => {
                write!(f, "login executable is not executable: {}", path.display())
            }
            LaunchError::Spawn { path, source } => {
                write!(f, "failed to spawn {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Lifecycle of the login process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Exited,
    Terminated,
}

/// The single login process being supervised.
#[derive(Debug)]
pub struct LoginSession {
    child: Child,
    pid: u32,
    executable: PathBuf,
    args: Vec<String>,
    working_dir: PathBuf,
    started_at: DateTime<Utc>,
    started: Instant,
    state: SessionState,
}

impl LoginSession {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn state(&self) -> SessionState {
        self.state
    }
}

/// Why a watch was cut short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The configured login timeout elapsed.
    Timeout,
    /// The caller's cancellation future completed (e.g. Ctrl-C).
    Interrupted,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::Timeout => write!(f, "timed out"),
            CancelReason::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// How a watch ended.
#[derive(Debug)]
pub enum WatchStatus {
    /// The login process exited on its own (None if killed by a signal).
    Exited { exit_code: Option<i32> },
    /// Timeout or cancellation; the process was terminated.
    Cancelled {
        reason: CancelReason,
        termination: Termination,
    },
    /// Reading the output or waiting on the process failed.
    IoError {
        source: std::io::Error,
        termination: Termination,
    },
}

/// Result of a completed watch.
#[derive(Debug)]
pub struct WatchOutcome {
    pub status: WatchStatus,
    /// The prompt handed to `on_match`, if one was seen.
    pub prompt: Option<DevicePrompt>,
    /// Total output lines read.
    pub lines: usize,
    /// Last few output lines, for error reports.
    pub tail: Vec<String>,
    pub duration: Duration,
}

/// Timing knobs for a watch.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub timeout: Option<Duration>,
    pub grace_period: Duration,
    /// How long to keep reading after exit while a forked helper holds the pipe.
    pub drain_timeout: Duration,
    pub tail_lines: usize,
}

impl From<&WatchConfig> for WatchOptions {
    fn from(config: &WatchConfig) -> Self {
        Self {
            timeout: config.timeout_secs.map(Duration::from_secs),
            grace_period: Duration::from_secs(config.grace_period_secs),
            drain_timeout: Duration::from_millis(config.drain_timeout_ms),
            tail_lines: config.tail_lines,
        }
    }
}

/// Supervises one login process and scrapes its device prompt.
pub struct LoginWatcher {
    patterns: PromptPatterns,
    options: WatchOptions,
    transcript: Option<Transcript>,
}

impl LoginWatcher {
    pub fn new(patterns: PromptPatterns, options: WatchOptions) -> Self {
        Self {
            patterns,
            options,
            transcript: None,
        }
    }

    /// Mirror every output line into a timestamped transcript file.
    pub fn with_transcript(mut self, transcript: Transcript) -> Self {
        self.transcript = Some(transcript);
        self
    }

    /// Spawn the login process with piped output and no terminal.
    ///
    /// The process leads its own process group (via `process_group(0)`)
    /// so termination also reaches anything it forks.
    pub fn start(
        &self,
        executable: &Path,
        args: &[String],
        working_dir: &Path,
    ) -> Result<LoginSession, LaunchError> {
        if !working_dir.is_dir() {
            return Err(LaunchError::WorkingDir {
                path: working_dir.to_path_buf(),
            });
        }
        // Bare command names are resolved through PATH by spawn itself
        if executable.components().count() > 1 {
            check_executable(executable)?;
        }

        tracing::info!(
            command = %executable.display(),
            args = ?args,
            cwd = %working_dir.display(),
            "spawning login process"
        );

        let child = Command::new(executable)
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => LaunchError::NotFound {
                    path: executable.to_path_buf(),
                },
                std::io::ErrorKind::PermissionDenied => LaunchError::NotExecutable {
                    path: executable.to_path_buf(),
                },
                _ => LaunchError::Spawn {
                    path: executable.to_path_buf(),
                    source: e,
                },
            })?;

        let pid = child.id().unwrap_or(0);
        tracing::info!(pid, "login process started");

        Ok(LoginSession {
            child,
            pid,
            executable: executable.to_path_buf(),
            args: args.to_vec(),
            working_dir: working_dir.to_path_buf(),
            started_at: Utc::now(),
            started: Instant::now(),
            state: SessionState::Running,
        })
    }

    /// Read the session's output until it exits, fails, times out or `cancel` completes.
    ///
    /// `on_match` runs at most once, as soon as a complete device prompt has
    /// been seen; output keeps being drained and logged afterwards.
    pub async fn watch<F, C>(
        &mut self,
        session: &mut LoginSession,
        on_match: F,
        cancel: C,
    ) -> WatchOutcome
    where
        F: FnOnce(DevicePrompt),
        C: Future<Output = ()>,
    {
        tracing::info!(
            pid = session.pid,
            patterns = self.patterns.version(),
            timeout_secs = ?self.options.timeout.map(|t| t.as_secs()),
            "watching login output"
        );

        let (tx, rx) = mpsc::channel(256);
        if let Some(stdout) = session.child.stdout.take() {
            tokio::spawn(pump_lines(stdout, StreamKind::Stdout, tx.clone()));
        }
        if let Some(stderr) = session.child.stderr.take() {
            tokio::spawn(pump_lines(stderr, StreamKind::Stderr, tx.clone()));
        }
        drop(tx);

        self.supervise(session, rx, on_match, cancel).await
    }

    /// Drive the session from an already-wired line channel.
    async fn supervise<F, C>(
        &mut self,
        session: &mut LoginSession,
        mut rx: mpsc::Receiver<LineEvent>,
        on_match: F,
        cancel: C,
    ) -> WatchOutcome
    where
        F: FnOnce(DevicePrompt),
        C: Future<Output = ()>,
    {
        let mut sink = LineSink {
            matcher: self.patterns.matcher(),
            transcript: self.transcript.as_mut(),
            on_match: Some(on_match),
            prompt: None,
            lines: 0,
            tail: VecDeque::with_capacity(self.options.tail_lines),
            tail_lines: self.options.tail_lines,
        };

        let deadline = self.options.timeout.map(|t| tokio::time::Instant::now() + t);
        let timer = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(timer);
        tokio::pin!(cancel);

        let grace = self.options.grace_period;
        let pid = session.pid;
        let mut streams_open = true;

        let status = loop {
            tokio::select! {
                event = rx.recv(), if streams_open => match event {
                    Some(Ok((kind, line))) => sink.line(kind, line),
                    Some(Err(e)) => {
                        tracing::error!(pid, error = %e, "failed to read login output");
                        let termination = watchdog::terminate(&mut session.child, pid, grace).await;
                        session.state = SessionState::Terminated;
                        break WatchStatus::IoError { source: e, termination };
                    }
                    None => {
                        // Both pipes closed; the exit status is still pending
                        tracing::debug!(pid, "login output streams closed");
                        streams_open = false;
                    }
                },
                result = session.child.wait() => match result {
                    Ok(status) => {
                        session.state = SessionState::Exited;
                        drain(&mut rx, &mut sink, self.options.drain_timeout).await;
                        break WatchStatus::Exited { exit_code: status.code() };
                    }
                    Err(e) => {
                        tracing::error!(pid, error = %e, "failed to wait for login process");
                        let termination = watchdog::terminate(&mut session.child, pid, grace).await;
                        session.state = SessionState::Terminated;
                        break WatchStatus::IoError { source: e, termination };
                    }
                },
                () = &mut cancel => {
                    tracing::warn!(pid, "login watch cancelled");
                    let termination = watchdog::terminate(&mut session.child, pid, grace).await;
                    session.state = SessionState::Terminated;
                    break WatchStatus::Cancelled { reason: CancelReason::Interrupted, termination };
                }
                () = &mut timer => {
                    tracing::warn!(pid, "login timed out before completing");
                    let termination = watchdog::terminate(&mut session.child, pid, grace).await;
                    session.state = SessionState::Terminated;
                    break WatchStatus::Cancelled { reason: CancelReason::Timeout, termination };
                }
            }
        };

        let duration = session.started.elapsed();
        tracing::info!(
            pid,
            status = ?status,
            lines = sink.lines,
            prompt_seen = sink.matcher.emitted(),
            duration_secs = duration.as_secs(),
            "login watch finished"
        );

        WatchOutcome {
            status,
            prompt: sink.prompt,
            lines: sink.lines,
            tail: sink.tail.into(),
            duration,
        }
    }
}

fn check_executable(path: &Path) -> Result<(), LaunchError> {
    let metadata = std::fs::metadata(path).map_err(|_| LaunchError::NotFound {
        path: path.to_path_buf(),
    })?;
    if !metadata.is_file() || metadata.permissions().mode() & 0o111 == 0 {
        return Err(LaunchError::NotExecutable {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

type LineEvent = Result<(StreamKind, String), std::io::Error>;

/// Forward newline-delimited output into the channel. Invalid UTF-8 is
/// replaced rather than treated as a read error.
async fn pump_lines<R>(reader: R, kind: StreamKind, tx: mpsc::Sender<LineEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut segments = BufReader::new(reader).split(b'\n');
    loop {
        match segments.next_segment().await {
            Ok(Some(bytes)) => {
                let mut line = String::from_utf8_lossy(&bytes).into_owned();
                if line.ends_with('\r') {
                    line.pop();
                }
                if tx.send(Ok((kind, line))).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                break;
            }
        }
    }
}

/// Read whatever is still queued after exit, bounded by `limit`.
async fn drain<F: FnOnce(DevicePrompt)>(
    rx: &mut mpsc::Receiver<LineEvent>,
    sink: &mut LineSink<'_, F>,
    limit: Duration,
) {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(Ok((kind, line)))) => sink.line(kind, line),
            Ok(Some(Err(e))) => {
                tracing::warn!(error = %e, "read error while draining login output");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                tracing::debug!("output pipe still held open after exit, stop draining");
                break;
            }
        }
    }
}

/// Output tail, matcher and the one-shot prompt callback for a single watch.
struct LineSink<'a, F> {
    matcher: PromptMatcher<'a>,
    transcript: Option<&'a mut Transcript>,
    on_match: Option<F>,
    prompt: Option<DevicePrompt>,
    lines: usize,
    /// Only the last `tail_lines` lines are kept.
    tail: VecDeque<String>,
    tail_lines: usize,
}

impl<F: FnOnce(DevicePrompt)> LineSink<'_, F> {
    fn line(&mut self, kind: StreamKind, line: String) {
        tracing::info!(stream = kind.as_str(), "{line}");
        if let Some(transcript) = self.transcript.as_mut() {
            transcript.write_line(&line);
        }

        if let Some(prompt) = self.matcher.feed(&line) {
            tracing::info!(url = ?prompt.url, "device prompt captured");
            if let Some(on_match) = self.on_match.take() {
                on_match(prompt.clone());
            }
            self.prompt = Some(prompt);
        }
        self.lines += 1;
        if self.tail_lines == 0 {
            return;
        }
        if self.tail.len() == self.tail_lines {
            self.tail.pop_front();
        }
        self.tail.push_back(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PatternConfig;
    use std::future::pending;

    const PROMPT_LINE: &str = "To sign in, use a web browser to open the page https://example.com/device and enter the code ABCD-1234 to authenticate.";

    fn watcher(options: WatchOptions) -> LoginWatcher {
        let patterns = PromptPatterns::compile(&PatternConfig::default()).unwrap();
        LoginWatcher::new(patterns, options)
    }

    fn fast_options() -> WatchOptions {
        WatchOptions {
            timeout: None,
            grace_period: Duration::from_secs(2),
            drain_timeout: Duration::from_millis(500),
            tail_lines: 5,
        }
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    fn start_sh(watcher: &LoginWatcher, dir: &Path, script: &str) -> LoginSession {
        watcher.start(Path::new("sh"), &sh(script), dir).unwrap()
    }

    #[tokio::test]
    async fn test_single_prompt_fires_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = watcher(fast_options());
        let script = format!("echo starting; echo '{PROMPT_LINE}'; echo waiting");
        let mut session = start_sh(&watcher, dir.path(), &script);

        let mut seen = Vec::new();
        let outcome = watcher
            .watch(&mut session, |p| seen.push(p), pending())
            .await;

        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].code, "ABCD-1234");
        assert_eq!(seen[0].url.as_deref(), Some("https://example.com/device"));
        assert_eq!(outcome.prompt, Some(seen[0].clone()));
        assert!(matches!(outcome.status, WatchStatus::Exited { exit_code: Some(0) }));
        assert_eq!(outcome.lines, 3);
        assert_eq!(session.state(), SessionState::Exited);
    }

    #[tokio::test]
    async fn test_exit_without_prompt_never_fires() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = watcher(fast_options());
        let mut session = start_sh(&watcher, dir.path(), "echo 'error: not logged in'; exit 1");

        let mut fired = false;
        let outcome = watcher
            .watch(&mut session, |_| fired = true, pending())
            .await;

        assert!(!fired);
        assert!(outcome.prompt.is_none());
        assert!(matches!(outcome.status, WatchStatus::Exited { exit_code: Some(1) }));
        assert_eq!(outcome.tail, vec!["error: not logged in"]);
    }

    #[tokio::test]
    async fn test_repeated_prompt_fires_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = watcher(fast_options());
        let script = "for c in AAAA-1111 BBBB-2222 CCCC-3333; do \
                      echo \"log into https://github.com/login/device and use code $c\"; done";
        let mut session = start_sh(&watcher, dir.path(), script);

        let mut seen = Vec::new();
        let outcome = watcher
            .watch(&mut session, |p| seen.push(p), pending())
            .await;

        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].code, "AAAA-1111");
        assert_eq!(outcome.lines, 3);
    }

    #[tokio::test]
    async fn test_split_prompt_across_stdout_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = watcher(fast_options());
        let script = "echo 'open the page https://example.com/device'; sleep 0.2; \
                      echo 'and enter the code ABCD-1234' >&2";
        let mut session = start_sh(&watcher, dir.path(), script);

        let mut seen = Vec::new();
        watcher
            .watch(&mut session, |p| seen.push(p), pending())
            .await;

        assert_eq!(
            seen,
            vec![DevicePrompt {
                code: "ABCD-1234".into(),
                url: Some("https://example.com/device".into()),
            }]
        );
    }

    #[tokio::test]
    async fn test_silence_is_not_completion() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = watcher(fast_options());
        let script = format!("sleep 1; echo '{PROMPT_LINE}'");
        let mut session = start_sh(&watcher, dir.path(), &script);

        let outcome = watcher.watch(&mut session, |_| {}, pending()).await;
        assert!(outcome.prompt.is_some());
        assert!(outcome.duration >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_prompt_delivered_while_process_still_running() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = watcher(fast_options());
        let script = format!("echo '{PROMPT_LINE}'; sleep 30");
        let mut session = start_sh(&watcher, dir.path(), &script);

        // Cancel as soon as the prompt arrives: proves on_match ran before exit
        let (tx, rx) = tokio::sync::oneshot::channel();
        let cancel = async {
            let _ = rx.await;
        };
        let outcome = watcher
            .watch(
                &mut session,
                move |p| {
                    let _ = tx.send(p);
                },
                cancel,
            )
            .await;

        assert!(outcome.prompt.is_some());
        assert!(matches!(
            outcome.status,
            WatchStatus::Cancelled {
                reason: CancelReason::Interrupted,
                ..
            }
        ));
        assert!(outcome.duration < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancel_before_match_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = watcher(fast_options());
        let mut session = start_sh(&watcher, dir.path(), "echo booting; sleep 30");

        let start = Instant::now();
        let mut fired = false;
        let outcome = watcher
            .watch(
                &mut session,
                |_| fired = true,
                tokio::time::sleep(Duration::from_millis(200)),
            )
            .await;

        assert!(!fired);
        assert!(matches!(
            outcome.status,
            WatchStatus::Cancelled {
                reason: CancelReason::Interrupted,
                termination: Termination::Graceful { .. },
            }
        ));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn test_cancel_escalates_when_sigterm_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = fast_options();
        options.grace_period = Duration::from_millis(300);
        let mut watcher = watcher(options);
        let mut session = start_sh(&watcher, dir.path(), "trap '' TERM; echo ready; sleep 30");

        let start = Instant::now();
        let outcome = watcher
            .watch(
                &mut session,
                |_| {},
                tokio::time::sleep(Duration::from_millis(300)),
            )
            .await;

        assert!(matches!(
            outcome.status,
            WatchStatus::Cancelled {
                termination: Termination::Killed,
                ..
            }
        ));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_timeout_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = fast_options();
        options.timeout = Some(Duration::from_millis(300));
        let mut watcher = watcher(options);
        let mut session = start_sh(&watcher, dir.path(), "sleep 30");

        let outcome = watcher.watch(&mut session, |_| {}, pending()).await;
        assert!(matches!(
            outcome.status,
            WatchStatus::Cancelled {
                reason: CancelReason::Timeout,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_forked_helper_holding_pipe_does_not_hang() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = fast_options();
        options.drain_timeout = Duration::from_millis(200);
        let mut watcher = watcher(options);
        let mut session = start_sh(&watcher, dir.path(), "sleep 3 & echo done");

        let start = Instant::now();
        let outcome = watcher.watch(&mut session, |_| {}, pending()).await;
        assert!(matches!(outcome.status, WatchStatus::Exited { exit_code: Some(0) }));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_invalid_utf8_and_crlf_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = watcher(fast_options());
        let script = r"printf 'bad \377 byte\r\nlog into https://github.com/login/device and use code ZZZZ-0000\r\n'";
        let mut session = start_sh(&watcher, dir.path(), script);

        let outcome = watcher.watch(&mut session, |_| {}, pending()).await;
        assert_eq!(outcome.lines, 2);
        assert_eq!(outcome.prompt.unwrap().code, "ZZZZ-0000");
        assert!(outcome.tail[0].starts_with("bad "));
        assert!(!outcome.tail[1].ends_with('\r'));
    }

    /// Yields one line, then fails every read.
    struct BrokenPipe {
        served: bool,
    }

    impl AsyncRead for BrokenPipe {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            if self.served {
                return std::task::Poll::Ready(Err(std::io::Error::other("pipe broken")));
            }
            self.served = true;
            buf.put_slice(b"partial line\n");
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_pump_forwards_read_errors() {
        let (tx, mut rx) = mpsc::channel(8);
        pump_lines(BrokenPipe { served: false }, StreamKind::Stdout, tx).await;

        match rx.recv().await {
            Some(Ok((StreamKind::Stdout, line))) => assert_eq!(line, "partial line"),
            other => panic!("expected a line, got {other:?}"),
        }
        match rx.recv().await {
            Some(Err(e)) => assert_eq!(e.to_string(), "pipe broken"),
            other => panic!("expected a read error, got {other:?}"),
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_read_error_ends_watch_and_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = watcher(fast_options());
        let mut session = start_sh(&watcher, dir.path(), "sleep 30");

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(pump_lines(BrokenPipe { served: false }, StreamKind::Stderr, tx));

        let start = Instant::now();
        let mut fired = false;
        let outcome = watcher
            .supervise(&mut session, rx, |_| fired = true, pending())
            .await;

        assert!(!fired);
        match &outcome.status {
            WatchStatus::IoError { source, termination } => {
                assert_eq!(source.to_string(), "pipe broken");
                assert!(matches!(termination, Termination::Graceful { .. }));
            }
            other => panic!("expected IoError, got {other:?}"),
        }
        assert_eq!(outcome.tail, vec!["partial line"]);
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_long_output_keeps_only_tail() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = watcher(fast_options());
        let script = "i=0; while [ $i -lt 5000 ]; do echo line$i; i=$((i+1)); done";
        let mut session = start_sh(&watcher, dir.path(), script);

        let outcome = watcher.watch(&mut session, |_| {}, pending()).await;
        assert_eq!(outcome.lines, 5000);
        assert_eq!(outcome.tail.len(), 5);
        assert_eq!(outcome.tail[4], "line4999");
    }

    #[tokio::test]
    async fn test_zero_tail_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = fast_options();
        options.tail_lines = 0;
        let mut watcher = watcher(options);
        let mut session = start_sh(&watcher, dir.path(), "echo a; echo b");

        let outcome = watcher.watch(&mut session, |_| {}, pending()).await;
        assert_eq!(outcome.lines, 2);
        assert!(outcome.tail.is_empty());
    }

    #[tokio::test]
    async fn test_tail_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = watcher(fast_options());
        let mut session = start_sh(&watcher, dir.path(), "for i in 1 2 3 4 5 6 7 8; do echo line$i; done");

        let outcome = watcher.watch(&mut session, |_| {}, pending()).await;
        assert_eq!(outcome.lines, 8);
        assert_eq!(outcome.tail, vec!["line4", "line5", "line6", "line7", "line8"]);
    }

    #[tokio::test]
    async fn test_transcript_records_output() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("runtime.log");
        let transcript = Transcript::open(&log_path, false).unwrap();
        let mut watcher = watcher(fast_options()).with_transcript(transcript);
        let mut session = start_sh(&watcher, dir.path(), "echo one; echo two >&2");

        watcher.watch(&mut session, |_| {}, pending()).await;
        drop(watcher);

        let contents = std::fs::read_to_string(&log_path).unwrap();
        assert!(contents.contains("] one"));
        assert!(contents.contains("] two"));
    }

    #[tokio::test]
    async fn test_runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let mut watcher = watcher(fast_options());
        let mut session = start_sh(&watcher, dir.path(), "ls");
        assert_eq!(session.working_dir(), dir.path());
        assert_eq!(session.args()[0], "-c");
        assert!(session.pid() > 0);

        let outcome = watcher.watch(&mut session, |_| {}, pending()).await;
        assert!(outcome.tail.iter().any(|l| l == "marker.txt"));
    }

    #[test]
    fn test_launch_missing_executable() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = watcher(fast_options());
        let err = watcher
            .start(&dir.path().join("code"), &[], dir.path())
            .unwrap_err();
        assert!(matches!(err, LaunchError::NotFound { .. }));
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_launch_missing_command_on_path() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = watcher(fast_options());
        let err = watcher
            .start(Path::new("nonexistent-binary-xyz"), &[], dir.path())
            .unwrap_err();
        assert!(matches!(err, LaunchError::NotFound { .. }));
    }

    #[test]
    fn test_launch_non_executable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("code");
        std::fs::write(&path, "#!/bin/sh\necho hi\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let watcher = watcher(fast_options());
        let err = watcher.start(&path, &[], dir.path()).unwrap_err();
        assert!(matches!(err, LaunchError::NotExecutable { .. }));
    }

    #[test]
    fn test_launch_missing_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = watcher(fast_options());
        let err = watcher
            .start(Path::new("sh"), &[], &dir.path().join("nope"))
            .unwrap_err();
        assert!(matches!(err, LaunchError::WorkingDir { .. }));
    }

    #[test]
    fn test_options_from_config() {
        let config = WatchConfig {
            timeout_secs: Some(60),
            ..WatchConfig::default()
        };
        let options = WatchOptions::from(&config);
        assert_eq!(options.timeout, Some(Duration::from_secs(60)));
        assert_eq!(options.grace_period, Duration::from_secs(5));
        assert_eq!(options.drain_timeout, Duration::from_secs(2));
        assert_eq!(options.tail_lines, 20);
    }
}
