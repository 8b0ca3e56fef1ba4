//! The protocol client facade.
//!
//! One [`ProtocolClient`] drives one backend process. A single event-loop
//! task consumes supervisor events, feeds pipe bytes through the framer and
//! dispatches every envelope; the public methods only register a cookie, queue
//! a frame for the writer and await their own completion.

use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, trace, warn};

use cmserver_core::{CacheFileReader, CacheReader};
use cmserver_protocol::{
    CacheContent, CmakeInputs, CodeModel, DEFAULT_MAX_BUFFER_SIZE, Envelope, GlobalSettings,
    GlobalSettingsUpdate, Hello, MessageFramer, ProtocolResult, Reply, Request, RequestEnvelope,
    encode_message,
};

use crate::correlator::{Completion, RequestCorrelator};
use crate::dispatch::{Dispatcher, Routed};
use crate::error::{ClientError, ClientResult, DrainReason, StartupError};
use crate::handshake::{GeneratorSelector, HandshakeNegotiator, classify_handshake_error};
use crate::hooks::ClientHooks;
use crate::state::{ServerState, StateCell};
use crate::supervisor::{ExitInfo, LaunchSpec, OutputSource, ProcessSupervisor, SupervisorEvent};

const STDERR_TAIL_LINES: usize = 20;

/// Default time the client waits for the exit status after losing the pipe.
pub const DEFAULT_EXIT_WAIT: Duration = Duration::from_secs(2);

/// Everything needed to start a session.
#[derive(Clone)]
pub struct ClientParams {
    pub launch: LaunchSpec,
    /// Caller's nominal source directory.
    pub source_dir: String,
    pub build_dir: String,
    pub selector: GeneratorSelector,
    pub cache_reader: Arc<dyn CacheReader>,
    pub hooks: ClientHooks,
    pub max_buffer_size: usize,
    /// How long a broken pipe waits for the process exit that explains it.
    pub exit_wait: Duration,
}

impl std::fmt::Debug for ClientParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientParams")
            .field("launch", &self.launch)
            .field("source_dir", &self.source_dir)
            .field("build_dir", &self.build_dir)
            .field("hooks", &self.hooks)
            .field("max_buffer_size", &self.max_buffer_size)
            .field("exit_wait", &self.exit_wait)
            .finish_non_exhaustive()
    }
}

impl ClientParams {
    pub fn new(
        launch: LaunchSpec,
        source_dir: impl Into<String>,
        build_dir: impl Into<String>,
        selector: GeneratorSelector,
    ) -> Self {
        Self {
            launch,
            source_dir: source_dir.into(),
            build_dir: build_dir.into(),
            selector,
            cache_reader: Arc::new(CacheFileReader),
            hooks: ClientHooks::default(),
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            exit_wait: DEFAULT_EXIT_WAIT,
        }
    }

    /// Builder: set hooks.
    pub fn with_hooks(mut self, hooks: ClientHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Builder: set cache reader.
    pub fn with_cache_reader(mut self, reader: Arc<dyn CacheReader>) -> Self {
        self.cache_reader = reader;
        self
    }

    /// Builder: set max framer buffer size.
    pub fn with_max_buffer_size(mut self, max: usize) -> Self {
        self.max_buffer_size = max;
        self
    }

    /// Builder: set exit wait.
    pub fn with_exit_wait(mut self, wait: Duration) -> Self {
        self.exit_wait = wait;
        self
    }
}

/// One-shot slot resolving the `start` future. First writer wins.
#[derive(Clone)]
struct StartupSlot(Arc<Mutex<Option<oneshot::Sender<ClientResult<()>>>>>);

impl StartupSlot {
    fn new() -> (Self, oneshot::Receiver<ClientResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self(Arc::new(Mutex::new(Some(tx)))), rx)
    }

    /// Returns false if `start` was already resolved.
    fn resolve(&self, result: ClientResult<()>) -> bool {
        let tx = self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
        match tx {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    fn is_pending(&self) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

struct Inner {
    supervisor: ProcessSupervisor,
    correlator: Arc<RequestCorrelator>,
    state: Arc<StateCell>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    /// Registers, frames and queues `request`, if `state` allows it.
    fn submit(
        &self,
        request: Request,
        allowed: impl Fn(ServerState) -> bool,
    ) -> ClientResult<Completion> {
        let kind = request.kind();
        let state = self.state.get();
        if !allowed(state) {
            return Err(ClientError::InvalidState {
                operation: kind,
                state,
            });
        }

        let (cookie, completion) = self.correlator.register()?;
        let frame = match encode_message(&RequestEnvelope::new(cookie.clone(), request)) {
            Ok(frame) => frame,
            Err(e) => {
                self.correlator.abandon(&cookie);
                return Err(e.into());
            }
        };
        if let Err(e) = self.supervisor.send(frame) {
            self.correlator.abandon(&cookie);
            return Err(e);
        }

        debug!(cookie = %cookie, kind = kind, "request sent");
        Ok(completion)
    }
}

async fn settle(completion: Completion) -> ClientResult<Reply> {
    completion
        .await
        .unwrap_or_else(|_| Err(ClientError::closed(DrainReason::Shutdown)))
}

fn decode_reply<T: DeserializeOwned>(reply: Reply) -> ClientResult<T> {
    let Reply {
        in_reply_to,
        content,
        ..
    } = reply;
    serde_json::from_value(Value::Object(content))
        .map_err(|source| ClientError::UnexpectedReply { in_reply_to, source })
}

/// Handle to a running backend session. Cheap to clone.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use cmserver_client::{ClientParams, GeneratorChoice, LaunchSpec, ProtocolClient};
///
/// # async fn demo() -> cmserver_client::ClientResult<()> {
/// let selector: cmserver_client::GeneratorSelector =
///     Arc::new(|| Box::pin(async { Some(GeneratorChoice::new("Ninja")) }));
/// let params = ClientParams::new(LaunchSpec::new("cmake"), "/src", "/src/build", selector);
///
/// let client = ProtocolClient::start(params).await?;
/// client.configure(vec!["-DCMAKE_BUILD_TYPE=Debug".into()]).await?;
/// client.compute().await?;
/// let model = client.codemodel().await?;
/// println!("{} targets", model.targets().count());
/// client.shutdown().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ProtocolClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ProtocolClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolClient")
            .field("state", &self.state())
            .field("pid", &self.pid())
            .field("pending", &self.inner.correlator.len())
            .finish()
    }
}

impl ProtocolClient {
    /// Spawns the backend and completes the handshake.
    ///
    /// Resolves once the backend has accepted the handshake.
    ///
    /// # Errors
    ///
    /// [`ClientError::Startup`] when the backend cannot start, exits early or
    /// rejects the handshake; transport and framing errors as they occur. The
    /// process is shut down before the error is returned.
    pub async fn start(params: ClientParams) -> ClientResult<Self> {
        let state = Arc::new(StateCell::new());
        let (supervisor, events) = ProcessSupervisor::start(&params.launch).await?;
        state.transition(ServerState::AwaitingHello);

        let correlator = Arc::new(RequestCorrelator::new());
        let inner = Arc::new(Inner {
            supervisor,
            correlator: correlator.clone(),
            state: state.clone(),
            event_loop: Mutex::new(None),
        });

        let negotiator = Arc::new(
            HandshakeNegotiator::new(
                params.source_dir.clone(),
                params.build_dir.clone(),
                params.selector.clone(),
            )
            .with_cache_reader(params.cache_reader.clone()),
        );
        let (startup, ready) = StartupSlot::new();

        let event_loop = EventLoop {
            inner: Arc::downgrade(&inner),
            correlator: correlator.clone(),
            state,
            hooks: params.hooks.clone(),
            dispatcher: Dispatcher::new(correlator, params.hooks.clone()),
            framer: MessageFramer::with_max_buffer_size(params.max_buffer_size),
            negotiator,
            startup,
            stderr_tail: VecDeque::new(),
            exit_wait: params.exit_wait,
            pipe_lost: None,
            failed: false,
        };
        let handle = tokio::spawn(event_loop.run(events));
        *inner
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        let client = Self { inner };
        let outcome = ready.await.unwrap_or_else(|_| {
            Err(ClientError::closed(DrainReason::TransportFailed(
                "event loop stopped during startup".into(),
            )))
        });

        match outcome {
            Ok(()) => {
                info!(pid = ?client.pid(), "backend ready");
                Ok(client)
            }
            Err(e) => {
                warn!(error = %e, "backend startup failed");
                let _ = client.shutdown().await;
                Err(e)
            }
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        self.inner.state.get()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ServerState> {
        self.inner.state.subscribe()
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.supervisor.pid()
    }

    pub fn pipe_path(&self) -> &Path {
        self.inner.supervisor.pipe_path()
    }

    /// Number of requests awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.len()
    }

    /// Sends `request` and waits for its reply.
    ///
    /// No timeout is applied. A caller that gives up simply drops the future;
    /// the cookie stays registered until the reply arrives or the connection
    /// is drained.
    pub async fn send_request(&self, request: Request) -> ClientResult<Reply> {
        let kind = request.kind();
        let completion = self
            .inner
            .submit(request, |state| state == ServerState::Ready)?;
        let reply = settle(completion).await?;
        if reply.in_reply_to != kind {
            warn!(
                cookie = %reply.cookie,
                expected = kind,
                in_reply_to = %reply.in_reply_to,
                "reply does not match request type"
            );
        }
        Ok(reply)
    }

    /// Runs `configure` with extra cache arguments such as `-DFOO=bar`.
    pub async fn configure(&self, cache_arguments: Vec<String>) -> ClientResult<()> {
        self.send_request(Request::configure(cache_arguments))
            .await
            .map(drop)
    }

    /// Runs `compute`, which generates the build system.
    pub async fn compute(&self) -> ClientResult<()> {
        self.send_request(Request::Compute).await.map(drop)
    }

    pub async fn codemodel(&self) -> ClientResult<CodeModel> {
        decode_reply(self.send_request(Request::Codemodel).await?)
    }

    pub async fn get_cache(&self) -> ClientResult<CacheContent> {
        decode_reply(self.send_request(Request::Cache).await?)
    }

    pub async fn get_global_settings(&self) -> ClientResult<GlobalSettings> {
        decode_reply(self.send_request(Request::GlobalSettings).await?)
    }

    pub async fn set_global_settings(&self, update: GlobalSettingsUpdate) -> ClientResult<()> {
        self.send_request(Request::SetGlobalSettings(update))
            .await
            .map(drop)
    }

    pub async fn cmake_inputs(&self) -> ClientResult<CmakeInputs> {
        decode_reply(self.send_request(Request::CmakeInputs).await?)
    }

    /// Rejects every pending request, closes the pipe and waits for the
    /// backend to exit. Safe to call more than once.
    pub async fn shutdown(&self) -> ClientResult<Option<ExitInfo>> {
        let inner = &self.inner;
        if inner.state.transition(ServerState::ShuttingDown) {
            info!(pid = ?self.pid(), "shutting down backend");
        }

        let drained = inner.correlator.drain_all(DrainReason::Shutdown);
        if drained > 0 {
            debug!(count = drained, "rejected pending requests");
        }

        let exit = inner.supervisor.shutdown().await;
        inner.state.transition(ServerState::Terminated);

        let handle = inner
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .is_err()
        {
            debug!("event loop still draining after shutdown");
        }

        Ok(exit)
    }
}

struct EventLoop {
    inner: Weak<Inner>,
    correlator: Arc<RequestCorrelator>,
    state: Arc<StateCell>,
    hooks: ClientHooks,
    dispatcher: Dispatcher,
    framer: MessageFramer,
    negotiator: Arc<HandshakeNegotiator>,
    startup: StartupSlot,
    stderr_tail: VecDeque<String>,
    exit_wait: Duration,
    pipe_lost: Option<PipeLost>,
    failed: bool,
}

/// A pipe failure still waiting for the process exit that explains it.
struct PipeLost {
    error: ClientError,
    deadline: Instant,
}

impl EventLoop {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<SupervisorEvent>) {
        loop {
            let event = match self.pipe_lost.as_ref().map(|lost| lost.deadline) {
                Some(deadline) => tokio::select! {
                    event = events.recv() => event,
                    _ = sleep_until(deadline) => {
                        self.on_exit_wait_expired();
                        continue;
                    }
                },
                None => events.recv().await,
            };
            let Some(event) = event else {
                break;
            };

            match event {
                SupervisorEvent::Data(chunk) => {
                    if self.failed {
                        continue;
                    }
                    if let Err(e) = self.on_data(&chunk) {
                        self.fail_connection(e.into());
                    }
                }
                SupervisorEvent::PipeError(e) => self.on_pipe_lost(ClientError::Io(e)),
                SupervisorEvent::PipeEnd => self.on_pipe_lost(ClientError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "backend closed the pipe",
                ))),
                SupervisorEvent::ProcessExit(exit) => self.on_process_exit(exit),
                SupervisorEvent::OtherOutput { source, line } => {
                    self.on_other_output(source, line);
                }
            }
        }

        debug!("supervisor events finished");
        if !self.state.get().is_terminal() {
            self.state.transition(ServerState::Crashed);
        }
        self.correlator.drain_all(DrainReason::BackendExited);
        self.startup.resolve(Err(ClientError::closed(DrainReason::BackendExited)));
    }

    fn on_data(&mut self, chunk: &[u8]) -> ProtocolResult<()> {
        for payload in self.framer.feed(chunk)? {
            trace!(payload = %payload, "envelope received");
            let envelope = Envelope::decode(&payload)?;
            if let Routed::Hello(hello) = self.dispatcher.dispatch(envelope) {
                self.begin_handshake(hello);
            }
        }
        Ok(())
    }

    fn begin_handshake(&mut self, hello: Hello) {
        if !self.state.transition(ServerState::Handshaking) {
            warn!(state = %self.state.get(), "hello arrived in unexpected state");
            return;
        }
        let Some(inner) = self.inner.upgrade() else {
            return;
        };

        tokio::spawn(handshake(
            inner,
            self.negotiator.clone(),
            hello,
            self.startup.clone(),
        ));
    }

    /// The pipe failed or reached its end.
    ///
    /// A dying backend breaks the pipe before its exit status is known, so
    /// the connection is only failed once the exit wait runs out without a
    /// [`SupervisorEvent::ProcessExit`].
    fn on_pipe_lost(&mut self, error: ClientError) {
        if self.failed || self.pipe_lost.is_some() {
            debug!(error = %error, "pipe already lost");
            return;
        }
        match self.state.get() {
            ServerState::ShuttingDown | ServerState::Terminated | ServerState::Crashed => {
                debug!(error = %error, "pipe closed");
            }
            state => {
                warn!(
                    state = %state,
                    error = %error,
                    wait_ms = self.exit_wait.as_millis() as u64,
                    "pipe lost, waiting for backend exit"
                );
                self.pipe_lost = Some(PipeLost {
                    error,
                    deadline: Instant::now() + self.exit_wait,
                });
            }
        }
    }

    fn on_exit_wait_expired(&mut self) {
        if let Some(lost) = self.pipe_lost.take() {
            warn!("backend still running without its pipe");
            self.fail_connection(lost.error);
        }
    }

    fn on_process_exit(&mut self, exit: ExitInfo) {
        if let Some(lost) = self.pipe_lost.take() {
            debug!(error = %lost.error, "pipe loss explained by backend exit");
        }

        let state = self.state.get();
        match state {
            ServerState::ShuttingDown => {
                self.state.transition(ServerState::Terminated);
                self.correlator.drain_all(DrainReason::Shutdown);
            }
            ServerState::Terminated | ServerState::Crashed => {
                self.correlator.drain_all(DrainReason::BackendExited);
            }
            _ => {
                let startup_error = StartupError::ProcessExited {
                    code: exit.code,
                    signal: exit.signal,
                    diagnostic: self.diagnostic(),
                };

                if exit.is_clean() {
                    info!(state = %state, "backend exited on its own");
                    self.state.transition(ServerState::Terminated);
                    self.startup.resolve(Err(startup_error.into()));
                    self.correlator.drain_all(DrainReason::BackendExited);
                    return;
                }

                error!(
                    code = ?exit.code,
                    signal = ?exit.signal,
                    state = %state,
                    "backend crashed"
                );
                self.state.transition(ServerState::Crashed);
                let during_startup = self.startup.resolve(Err(startup_error.into()));
                if !during_startup {
                    self.hooks.crash(exit.code, exit.signal);
                }
                self.correlator.drain_all(DrainReason::Crashed {
                    code: exit.code,
                    signal: exit.signal,
                });
            }
        }
    }

    fn on_other_output(&mut self, source: OutputSource, line: String) {
        debug!(source = %source, line = %line, "backend output");
        self.hooks.other_output(source, &line);
        if source == OutputSource::Stderr {
            if self.stderr_tail.len() == STDERR_TAIL_LINES {
                self.stderr_tail.pop_front();
            }
            self.stderr_tail.push_back(line);
        }
    }

    fn diagnostic(&self) -> String {
        self.stderr_tail
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Transport or framing failure: nothing more can be trusted.
    fn fail_connection(&mut self, error: ClientError) {
        if self.failed {
            return;
        }
        self.failed = true;
        self.pipe_lost = None;

        let reason = DrainReason::TransportFailed(error.to_string());
        if self.state.get() == ServerState::ShuttingDown {
            debug!(error = %error, "transport error during shutdown");
        } else {
            error!(error = %error, "connection failed");
            self.state.transition(ServerState::Crashed);
        }

        if self.startup.is_pending() {
            self.startup.resolve(Err(error));
        }
        self.correlator.drain_all(reason);

        if let Some(inner) = self.inner.upgrade() {
            inner.supervisor.kill();
        }
    }
}

async fn handshake(
    inner: Arc<Inner>,
    negotiator: Arc<HandshakeNegotiator>,
    hello: Hello,
    startup: StartupSlot,
) {
    let outcome: ClientResult<()> = async {
        let params = negotiator.parameters(&hello).await?;
        debug!(
            source = %params.source_directory,
            generator = ?params.generator,
            "sending handshake"
        );
        let completion = inner.submit(Request::Handshake(params), |state| {
            state == ServerState::Handshaking
        })?;

        match settle(completion).await {
            Ok(_) => Ok(()),
            Err(ClientError::Server { message, .. }) => Err(classify_handshake_error(
                &message,
                Path::new(negotiator.build_dir()),
            )
            .into()),
            Err(e) => Err(e),
        }
    }
    .await;

    match outcome {
        Ok(()) => {
            if inner.state.transition(ServerState::Ready) {
                startup.resolve(Ok(()));
            } else {
                let state = inner.state.get();
                startup.resolve(Err(ClientError::InvalidState {
                    operation: "complete handshake",
                    state,
                }));
            }
        }
        Err(e) => {
            startup.resolve(Err(e));
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::generator::fixed_selector;

    fn reply(in_reply_to: &str, content: Value) -> Reply {
        let Value::Object(content) = content else {
            panic!("content must be an object");
        };
        Reply {
            cookie: "1".into(),
            in_reply_to: in_reply_to.into(),
            content,
        }
    }

    #[tokio::test]
    async fn startup_slot_keeps_the_first_result() {
        let (slot, rx) = StartupSlot::new();
        assert!(slot.is_pending());

        assert!(slot.resolve(Err(ClientError::closed(DrainReason::BackendExited))));
        assert!(!slot.is_pending());
        assert!(!slot.clone().resolve(Ok(())));

        let result = rx.await.unwrap();
        assert!(matches!(
            result,
            Err(ClientError::ConnectionClosed {
                reason: DrainReason::BackendExited
            })
        ));
    }

    #[test]
    fn typed_reply_is_decoded_from_content() {
        let settings: GlobalSettings = decode_reply(reply(
            "globalSettings",
            json!({"generator": "Ninja", "trace": true}),
        ))
        .unwrap();
        assert_eq!(settings.generator, "Ninja");
        assert!(settings.trace);
    }

    #[test]
    fn badly_shaped_reply_names_its_request() {
        let err = decode_reply::<CodeModel>(reply(
            "codemodel",
            json!({"configurations": "not a list"}),
        ))
        .unwrap_err();
        match err {
            ClientError::UnexpectedReply { in_reply_to, .. } => {
                assert_eq!(in_reply_to, "codemodel")
            }
            other => panic!("expected an unexpected reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_completion_reads_as_shutdown() {
        let (tx, rx) = oneshot::channel::<ClientResult<Reply>>();
        drop(tx);
        let err = settle(rx).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::ConnectionClosed {
                reason: DrainReason::Shutdown
            }
        ));
    }

    #[test]
    fn params_default_to_bounded_waits() {
        let params = ClientParams::new(
            LaunchSpec::new("cmake"),
            "/src",
            "/build",
            fixed_selector(None),
        );
        assert_eq!(params.exit_wait, DEFAULT_EXIT_WAIT);
        assert_eq!(params.max_buffer_size, DEFAULT_MAX_BUFFER_SIZE);

        let params = params.with_exit_wait(Duration::from_millis(50));
        assert_eq!(params.exit_wait, Duration::from_millis(50));
    }
}
