use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use tracing::{error, info, warn};

use crate::error::{ScriptError, ScriptErrorKind};

/// Diagnostics sink provided by the host. Every user-visible message from the loader, the
/// watchers and the scripts themselves goes through here.
pub trait HostFacade: Send + Sync {
    fn error(&self, message: &str);
    fn warn(&self, message: &str);
    fn info(&self, message: &str);
    fn print_exception(&self, error: &ScriptError, context: &str);

    fn report(&self, error: &ScriptError) {
        match error {
            ScriptError::DirectoryNotScript { .. } => self.error(&error.context_message()),
            ScriptError::Compile { .. } => {
                self.error(&error.context_message());
                self.print_exception(error, &error.context_message());
            }
            _ => self.print_exception(error, &error.context_message()),
        }
    }
}

/// Forwards diagnostics to `tracing`, tagged with the addon name.
pub struct TracingFacade {
    addon: String,
}

impl TracingFacade {
    pub fn new(addon: impl Into<String>) -> Self {
        Self { addon: addon.into() }
    }
}

impl HostFacade for TracingFacade {
    fn error(&self, message: &str) {
        error!(target: "scripts", addon = %self.addon, "{message}");
    }

    fn warn(&self, message: &str) {
        warn!(target: "scripts", addon = %self.addon, "{message}");
    }

    fn info(&self, message: &str) {
        info!(target: "scripts", addon = %self.addon, "{message}");
    }

    fn print_exception(&self, err: &ScriptError, context: &str) {
        error!(
            target: "scripts",
            addon = %self.addon,
            kind = err.kind().label(),
            path = %err.path().display(),
            "{context}: {err}"
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticLevel {
    Error,
    Warn,
    Info,
    Exception,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub message: String,
    pub kind: Option<ScriptErrorKind>,
    pub path: Option<PathBuf>,
}

/// Keeps every diagnostic in memory so callers can assert on per-file failures.
#[derive(Default)]
pub struct RecordingFacade {
    entries: Mutex<Vec<Diagnostic>>,
}

impl RecordingFacade {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<Diagnostic> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn messages(&self, level: DiagnosticLevel) -> Vec<String> {
        self.entries().into_iter().filter(|entry| entry.level == level).map(|entry| entry.message).collect()
    }

    pub fn exceptions_of(&self, kind: ScriptErrorKind) -> Vec<Diagnostic> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.level == DiagnosticLevel::Exception && entry.kind == Some(kind))
            .collect()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn push(&self, level: DiagnosticLevel, message: String, error: Option<&ScriptError>) {
        let entry = Diagnostic {
            level,
            message,
            kind: error.map(ScriptError::kind),
            path: error.map(|err| err.path().to_path_buf()),
        };
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).push(entry);
    }
}

impl HostFacade for RecordingFacade {
    fn error(&self, message: &str) {
        self.push(DiagnosticLevel::Error, message.to_string(), None);
    }

    fn warn(&self, message: &str) {
        self.push(DiagnosticLevel::Warn, message.to_string(), None);
    }

    fn info(&self, message: &str) {
        self.push(DiagnosticLevel::Info, message.to_string(), None);
    }

    fn print_exception(&self, error: &ScriptError, context: &str) {
        self.push(DiagnosticLevel::Exception, format!("{context}: {error}"), Some(error));
    }
}
