pub mod api;
pub mod bindings;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod facade;
pub mod loader;
pub mod registry;
pub mod unit;
pub mod watcher;

pub use bindings::{BindingValue, ExecutionScope, SharedBindings};
pub use config::HostConfig;
pub use error::{ScriptError, ScriptErrorKind};
pub use facade::{HostFacade, RecordingFacade, TracingFacade};
pub use loader::{LoadReport, ScriptLoader};
pub use registry::{ReloadRegistry, ReloadSummary};
pub use unit::{ReloadOutcome, ScriptCategory, ScriptUnit, UnitState, UnloadHook};
pub use watcher::{ReloadWatcher, WatcherState};
