//! Backend process and pipe ownership.
//!
//! [`ProcessSupervisor::start`] spawns the backend, connects to its pipe and
//! hands back a stream of [`SupervisorEvent`]s. Four tasks run behind it: a
//! pipe reader, a single pipe writer, line readers for the process's own
//! stdout/stderr, and an exit watcher.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use cmserver_core::{Environment, NameMatching, current_environment, merge_environment};

use crate::error::{ClientError, ClientResult, DrainReason, StartupError};
use crate::pipe::{self, ConnectConfig, PipeStream};

const READ_CHUNK: usize = 8 * 1024;
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
const DIAGNOSTIC_LINES: usize = 20;

/// Which of the process's own channels produced a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// How the backend process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    /// Exit code zero.
    pub fn is_clean(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Something that happened to the process or its pipe.
#[derive(Debug)]
pub enum SupervisorEvent {
    /// Bytes read from the pipe.
    Data(Vec<u8>),
    /// Reading or writing the pipe failed.
    PipeError(std::io::Error),
    /// The backend closed the pipe.
    PipeEnd,
    /// The process exited. Sent after its stdout/stderr were drained.
    ProcessExit(ExitInfo),
    /// A line the process printed outside the pipe.
    OtherOutput { source: OutputSource, line: String },
}

/// What to launch and how.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Backend executable.
    pub program: PathBuf,
    /// Arguments appended after the server-mode arguments.
    pub extra_args: Vec<String>,
    /// Variables layered over the inherited environment.
    pub env: Environment,
    pub working_dir: Option<PathBuf>,
    pub pipe_path: PathBuf,
    pub connect: ConnectConfig,
    /// How long `shutdown` waits before killing the process.
    pub shutdown_grace: Duration,
}

impl LaunchSpec {
    /// Creates a spec for `program` with a fresh pipe path.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
            env: Environment::new(),
            working_dir: None,
            pipe_path: pipe::unique_pipe_path(None),
            connect: ConnectConfig::default(),
            shutdown_grace: Duration::from_secs(5),
        }
    }

    /// Builder: set pipe path.
    pub fn with_pipe_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.pipe_path = path.into();
        self
    }

    /// Builder: set environment overrides.
    pub fn with_env(mut self, env: Environment) -> Self {
        self.env = env;
        self
    }

    /// Builder: set extra arguments.
    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// Builder: set working directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Builder: set connect policy.
    pub fn with_connect(mut self, connect: ConnectConfig) -> Self {
        self.connect = connect;
        self
    }

    /// Builder: set shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Full argument list: `-E server --experimental --pipe=<path>` plus extras.
    pub fn command_args(&self) -> Vec<String> {
        let mut args = vec![
            "-E".to_string(),
            "server".to_string(),
            "--experimental".to_string(),
            format!("--pipe={}", self.pipe_path.display()),
        ];
        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// Environment the child runs with. Pure function of the two maps.
    pub fn child_environment(&self, base: &Environment) -> Environment {
        merge_environment(base, &self.env, NameMatching::host())
    }
}

/// Owns one running backend process and its pipe.
#[derive(Debug)]
pub struct ProcessSupervisor {
    writer: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    exit: watch::Receiver<Option<ExitInfo>>,
    pipe_open: watch::Receiver<bool>,
    pid: Option<u32>,
    pipe_path: PathBuf,
    grace: Duration,
}

impl ProcessSupervisor {
    /// Spawns the backend and connects to its pipe.
    ///
    /// # Errors
    ///
    /// A [`StartupError`] if the process cannot be spawned, exits before the
    /// pipe is connected, or the pipe never appears.
    pub async fn start(
        spec: &LaunchSpec,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SupervisorEvent>), StartupError> {
        pipe::remove_stale(&spec.pipe_path)?;

        let args = spec.command_args();
        let env = spec.child_environment(&current_environment());
        let mut command = Command::new(&spec.program);
        command
            .args(&args)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| StartupError::Spawn {
            program: spec.program.display().to_string(),
            source,
        })?;
        let pid = child.id();
        info!(
            program = %spec.program.display(),
            pid = ?pid,
            pipe = %spec.pipe_path.display(),
            "backend spawned"
        );

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut output_tasks = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            output_tasks.push(spawn_line_reader(stdout, OutputSource::Stdout, events_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            output_tasks.push(spawn_line_reader(stderr, OutputSource::Stderr, events_tx.clone()));
        }

        let connected = pipe::connect_with_backoff(&spec.pipe_path, &spec.connect, || {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let exit = ExitInfo::from(status);
                    Err(StartupError::ProcessExited {
                        code: exit.code,
                        signal: exit.signal,
                        diagnostic: String::new(),
                    })
                }
                Ok(None) => Ok(()),
                Err(e) => {
                    warn!(error = %e, "could not poll backend status");
                    Ok(())
                }
            }
        })
        .await;

        let stream = match connected {
            Ok(stream) => stream,
            Err(mut error) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                drop(events_tx);
                join_with_timeout(output_tasks).await;

                if let StartupError::ProcessExited { diagnostic, .. } = &mut error {
                    *diagnostic = collect_stderr(&mut events_rx);
                }
                remove_pipe_file(&spec.pipe_path);
                return Err(error);
            }
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let (pipe_open_tx, pipe_open) = watch::channel(true);
        tokio::spawn(read_pipe(read_half, events_tx.clone(), pipe_open_tx));

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_pipe(write_half, writer_rx, events_tx.clone()));

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit) = watch::channel(None);
        tokio::spawn(watch_exit(
            child,
            kill_rx,
            exit_tx,
            output_tasks,
            events_tx,
            spec.pipe_path.clone(),
        ));

        let supervisor = Self {
            writer: Mutex::new(Some(writer_tx)),
            kill: Mutex::new(Some(kill_tx)),
            exit,
            pipe_open,
            pid,
            pipe_path: spec.pipe_path.clone(),
            grace: spec.shutdown_grace,
        };
        Ok((supervisor, events_rx))
    }

    /// OS process id, if the process was still running when spawned.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn pipe_path(&self) -> &Path {
        &self.pipe_path
    }

    /// Exit status, once the process is gone.
    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    /// Queues one framed message for the single pipe writer.
    ///
    /// Each call is written whole, so concurrent senders never interleave.
    pub fn send(&self, frame: Vec<u8>) -> ClientResult<()> {
        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        match writer.as_ref() {
            Some(tx) if tx.send(frame).is_ok() => Ok(()),
            _ => Err(ClientError::closed(DrainReason::TransportFailed(
                "pipe writer is closed".into(),
            ))),
        }
    }

    /// Kills the process without waiting.
    pub fn kill(&self) {
        let kill = self.kill.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(tx) = kill {
            debug!(pid = ?self.pid, "killing backend");
            let _ = tx.send(());
        }
    }

    /// Closes the write side of the pipe, then waits for the backend to close
    /// the pipe and exit. Kills it once the grace period runs out.
    pub async fn shutdown(&self) -> Option<ExitInfo> {
        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner).take();
        drop(writer);

        let mut pipe_open = self.pipe_open.clone();
        let mut exit = self.exit.clone();
        let graceful = tokio::time::timeout(self.grace, async {
            let _ = pipe_open.wait_for(|open| !open).await;
            let _ = exit.wait_for(Option::is_some).await;
        })
        .await;

        if graceful.is_err() {
            warn!(
                pid = ?self.pid,
                grace_ms = self.grace.as_millis() as u64,
                "backend did not exit in time"
            );
            self.kill();
            let _ = exit.wait_for(Option::is_some).await;
        }

        self.exit_info()
    }
}

fn spawn_line_reader<R>(
    reader: R,
    source: OutputSource,
    events: mpsc::UnboundedSender<SupervisorEvent>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if events.send(SupervisorEvent::OtherOutput { source, line }).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(source = %source, error = %e, "stopped reading backend output");
                    break;
                }
            }
        }
    })
}

async fn read_pipe<R>(
    mut reader: R,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    open: watch::Sender<bool>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                let _ = events.send(SupervisorEvent::PipeEnd);
                break;
            }
            Ok(n) => {
                if events.send(SupervisorEvent::Data(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = events.send(SupervisorEvent::PipeError(e));
                break;
            }
        }
    }
    let _ = open.send(false);
}

async fn write_pipe<W>(
    mut writer: W,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
) where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            let _ = events.send(SupervisorEvent::PipeError(e));
            return;
        }
    }

    debug!("closing pipe write side");
    if let Err(e) = writer.shutdown().await {
        debug!(error = %e, "pipe shutdown failed");
    }
}

async fn watch_exit(
    mut child: Child,
    kill: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    output_tasks: Vec<JoinHandle<()>>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    pipe_path: PathBuf,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill => {
            let _ = child.start_kill();
            child.wait().await
        }
    };

    let exit = match status {
        Ok(status) => ExitInfo::from(status),
        Err(e) => {
            warn!(error = %e, "failed to wait for backend");
            ExitInfo {
                code: None,
                signal: None,
            }
        }
    };
    info!(code = ?exit.code, signal = ?exit.signal, "backend exited");

    join_with_timeout(output_tasks).await;
    remove_pipe_file(&pipe_path);

    let _ = exit_tx.send(Some(exit));
    let _ = events.send(SupervisorEvent::ProcessExit(exit));
}

async fn join_with_timeout(tasks: Vec<JoinHandle<()>>) {
    let all = async {
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, all).await.is_err() {
        debug!("backend output still open after exit");
    }
}

/// Last stderr lines still sitting in the event queue.
fn collect_stderr(events: &mut mpsc::UnboundedReceiver<SupervisorEvent>) -> String {
    let mut lines = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SupervisorEvent::OtherOutput {
            source: OutputSource::Stderr,
            line,
        } = event
        {
            lines.push(line);
        }
    }
    let skip = lines.len().saturating_sub(DIAGNOSTIC_LINES);
    lines.split_off(skip).join("\n")
}

fn remove_pipe_file(path: &Path) {
    if cfg!(unix) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            debug!(path = %path.display(), error = %e, "could not remove pipe file");
        }
    }
}
