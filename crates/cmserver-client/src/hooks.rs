//! Caller-supplied notification callbacks.
//!
//! Hooks run on the dispatch task, so they must return quickly; anything slow
//! belongs on a channel or a spawned task.

use std::fmt;
use std::sync::Arc;

use cmserver_protocol::Progress;

use crate::supervisor::OutputSource;

/// One progress report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub cookie: Option<String>,
    pub message: String,
    pub minimum: i64,
    pub maximum: i64,
    pub current: i64,
}

impl From<Progress> for ProgressUpdate {
    fn from(p: Progress) -> Self {
        Self {
            cookie: p.cookie,
            message: p.progress_message,
            minimum: p.progress_minimum,
            maximum: p.progress_maximum,
            current: p.progress_current,
        }
    }
}

pub type MessageHook = Arc<dyn Fn(&str, Option<&str>) + Send + Sync>;
pub type ProgressHook = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;
pub type DirtyHook = Arc<dyn Fn() + Send + Sync>;
pub type CrashHook = Arc<dyn Fn(Option<i32>, Option<i32>) + Send + Sync>;
pub type OutputHook = Arc<dyn Fn(OutputSource, &str) + Send + Sync>;

/// Set of optional callbacks invoked by the dispatcher.
#[derive(Clone, Default)]
pub struct ClientHooks {
    on_message: Option<MessageHook>,
    on_progress: Option<ProgressHook>,
    on_dirty: Option<DirtyHook>,
    on_crash: Option<CrashHook>,
    on_other_output: Option<OutputHook>,
}

impl fmt::Debug for ClientHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHooks")
            .field("on_message", &self.on_message.is_some())
            .field("on_progress", &self.on_progress.is_some())
            .field("on_dirty", &self.on_dirty.is_some())
            .field("on_crash", &self.on_crash.is_some())
            .field("on_other_output", &self.on_other_output.is_some())
            .finish()
    }
}

impl ClientHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: status text, with an optional title.
    pub fn on_message(mut self, f: impl Fn(&str, Option<&str>) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(f));
        self
    }

    /// Builder: progress reports.
    pub fn on_progress(mut self, f: impl Fn(&ProgressUpdate) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(f));
        self
    }

    /// Builder: configuration became stale.
    pub fn on_dirty(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_dirty = Some(Arc::new(f));
        self
    }

    /// Builder: backend crashed after startup, with exit code and signal.
    pub fn on_crash(
        mut self,
        f: impl Fn(Option<i32>, Option<i32>) + Send + Sync + 'static,
    ) -> Self {
        self.on_crash = Some(Arc::new(f));
        self
    }

    /// Builder: lines the backend printed outside the pipe.
    pub fn on_other_output(
        mut self,
        f: impl Fn(OutputSource, &str) + Send + Sync + 'static,
    ) -> Self {
        self.on_other_output = Some(Arc::new(f));
        self
    }

    pub(crate) fn message(&self, text: &str, title: Option<&str>) {
        if let Some(hook) = &self.on_message {
            hook(text, title);
        }
    }

    pub(crate) fn progress(&self, update: &ProgressUpdate) {
        if let Some(hook) = &self.on_progress {
            hook(update);
        }
    }

    pub(crate) fn dirty(&self) {
        if let Some(hook) = &self.on_dirty {
            hook();
        }
    }

    pub(crate) fn crash(&self, code: Option<i32>, signal: Option<i32>) {
        if let Some(hook) = &self.on_crash {
            hook(code, signal);
        }
    }

    pub(crate) fn other_output(&self, source: OutputSource, line: &str) {
        if let Some(hook) = &self.on_other_output {
            hook(source, line);
        }
    }
}
