use std::io;
use std::path::{Path, PathBuf};

use rhai::EvalAltResult;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptErrorKind {
    FileAccess,
    Compile,
    BindingResolution,
    Execution,
    WatchSetup,
    DirectoryNotScript,
}

impl ScriptErrorKind {
    pub fn label(self) -> &'static str {
        match self {
            ScriptErrorKind::FileAccess => "file-access",
            ScriptErrorKind::Compile => "compile",
            ScriptErrorKind::BindingResolution => "binding-resolution",
            ScriptErrorKind::Execution => "execution",
            ScriptErrorKind::WatchSetup => "watch-setup",
            ScriptErrorKind::DirectoryNotScript => "directory",
        }
    }
}

/// Failure of one unit of work: loading a file, running a script, reloading it or watching it.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("cannot read '{}': {source}", .path.display())]
    FileAccess {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot compile '{}': {message}", .path.display())]
    Compile { path: PathBuf, message: String },
    #[error("unresolved binding '{name}' in '{}'", .path.display())]
    BindingResolution { path: PathBuf, name: String },
    #[error("'{}' failed: {message}", .path.display())]
    Execution { path: PathBuf, message: String },
    #[error("cannot watch '{}': {source}", .path.display())]
    WatchSetup {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
    #[error("'{}' is a directory, not a script", .path.display())]
    DirectoryNotScript { path: PathBuf },
}

impl ScriptError {
    /// Maps an engine evaluation failure onto the taxonomy, unwrapping nested function-call frames.
    pub fn from_eval(path: &Path, err: Box<EvalAltResult>) -> Self {
        let path = path.to_path_buf();
        match *err {
            EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => Self::from_eval(&path, inner),
            EvalAltResult::ErrorVariableNotFound(name, _) | EvalAltResult::ErrorPropertyNotFound(name, _) => {
                ScriptError::BindingResolution { path, name }
            }
            EvalAltResult::ErrorParsing(kind, pos) => {
                ScriptError::Compile { path, message: format!("{kind} ({pos})") }
            }
            other => ScriptError::Execution { path, message: other.to_string() },
        }
    }

    pub fn kind(&self) -> ScriptErrorKind {
        match self {
            ScriptError::FileAccess { .. } => ScriptErrorKind::FileAccess,
            ScriptError::Compile { .. } => ScriptErrorKind::Compile,
            ScriptError::BindingResolution { .. } => ScriptErrorKind::BindingResolution,
            ScriptError::Execution { .. } => ScriptErrorKind::Execution,
            ScriptError::WatchSetup { .. } => ScriptErrorKind::WatchSetup,
            ScriptError::DirectoryNotScript { .. } => ScriptErrorKind::DirectoryNotScript,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            ScriptError::FileAccess { path, .. }
            | ScriptError::Compile { path, .. }
            | ScriptError::BindingResolution { path, .. }
            | ScriptError::Execution { path, .. }
            | ScriptError::WatchSetup { path, .. }
            | ScriptError::DirectoryNotScript { path } => path,
        }
    }

    pub fn file_name(&self) -> String {
        let path = self.path();
        path.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string())
    }

    /// Human readable context line passed to the host alongside the error itself.
    pub fn context_message(&self) -> String {
        let name = self.file_name();
        match self {
            ScriptError::FileAccess { .. } => format!("Failed to access script '{name}'"),
            ScriptError::Compile { .. } => format!("Failed to parse script '{name}'"),
            ScriptError::BindingResolution { name: binding, .. } => {
                format!("No property or missing import for '{binding}' in script {name}")
            }
            ScriptError::Execution { .. } => format!("Script '{name}' failed while running"),
            ScriptError::WatchSetup { .. } => format!("Failed to watch script '{name}' for changes"),
            ScriptError::DirectoryNotScript { path } => {
                format!("Found a directory where a script was expected: {}", path.display())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rhai::Position;

    #[test]
    fn variable_not_found_maps_to_binding_resolution() {
        let err: Box<EvalAltResult> = EvalAltResult::ErrorVariableNotFound("svc".into(), Position::NONE).into();
        let mapped = ScriptError::from_eval(Path::new("/tmp/app.rhai"), err);
        assert_eq!(mapped.kind(), ScriptErrorKind::BindingResolution);
        assert_eq!(mapped.context_message(), "No property or missing import for 'svc' in script app.rhai");
    }

    #[test]
    fn nested_call_errors_are_unwrapped() {
        let inner: Box<EvalAltResult> = EvalAltResult::ErrorVariableNotFound("x".into(), Position::NONE).into();
        let outer: Box<EvalAltResult> =
            EvalAltResult::ErrorInFunctionCall("helper".into(), String::new(), inner, Position::NONE).into();
        let mapped = ScriptError::from_eval(Path::new("lib.rhai"), outer);
        assert!(matches!(mapped, ScriptError::BindingResolution { ref name, .. } if name == "x"));
    }

    #[test]
    fn runtime_errors_map_to_execution() {
        let thrown = rhai::Dynamic::from("boom".to_string());
        let err: Box<EvalAltResult> = EvalAltResult::ErrorRuntime(thrown, Position::NONE).into();
        let mapped = ScriptError::from_eval(Path::new("lib.rhai"), err);
        assert_eq!(mapped.kind(), ScriptErrorKind::Execution);
        assert_eq!(mapped.file_name(), "lib.rhai");
    }

    #[test]
    fn kind_labels_are_stable() {
        assert_eq!(ScriptErrorKind::DirectoryNotScript.label(), "directory");
        assert_eq!(ScriptErrorKind::WatchSetup.label(), "watch-setup");
    }
}
