use anyhow::{Context, Result};
use notify::event::ModifyKind;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::WatchConfig;
use crate::error::ScriptError;
use crate::registry::ReloadRegistry;
use crate::watcher::ReloadWatcher;

enum DispatchSignal {
    Fs(notify::Result<Event>),
    Shutdown,
}

#[derive(Default)]
struct WatchTable {
    /// Watch count per parent directory; the directory is unwatched when it drops to zero.
    directories: HashMap<PathBuf, usize>,
    members: HashSet<PathBuf>,
}

/// Multiplexes every script watcher over one `notify` watcher. Events are matched against the
/// registry on the `script-watch` thread, debounced per watcher, and reloads run one at a time on
/// the `script-reload` thread.
pub struct WatchDispatcher {
    registry: Arc<ReloadRegistry>,
    notifier: Mutex<Option<RecommendedWatcher>>,
    table: Mutex<WatchTable>,
    signals: Sender<DispatchSignal>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl WatchDispatcher {
    pub fn start(registry: Arc<ReloadRegistry>, config: &WatchConfig) -> Result<Self> {
        let (signals, rx) = channel();
        let fs_signals = signals.clone();
        let mut notifier = notify::recommended_watcher(move |res| {
            let _ = fs_signals.send(DispatchSignal::Fs(res));
        })
        .context("create script watcher")?;
        notifier
            .configure(
                NotifyConfig::default().with_compare_contents(false).with_poll_interval(config.poll_interval()),
            )
            .context("configure script watcher")?;

        let (jobs_tx, jobs_rx) = channel::<Arc<ReloadWatcher>>();
        let worker = thread::Builder::new()
            .name("script-reload".to_string())
            .spawn(move || {
                while let Ok(watcher) = jobs_rx.recv() {
                    watcher.dispatch();
                }
            })
            .context("spawn script-reload worker")?;
        let loop_registry = Arc::clone(&registry);
        let debounce = config.debounce();
        let dispatcher = thread::Builder::new()
            .name("script-watch".to_string())
            .spawn(move || run_dispatch_loop(rx, loop_registry, jobs_tx, debounce))
            .context("spawn script-watch dispatcher")?;

        debug!(debounce_ms = debounce.as_millis() as u64, "script watch dispatcher started");
        Ok(Self {
            registry,
            notifier: Mutex::new(Some(notifier)),
            table: Mutex::new(WatchTable::default()),
            signals,
            threads: Mutex::new(vec![dispatcher, worker]),
            running: AtomicBool::new(true),
        })
    }

    pub fn registry(&self) -> &Arc<ReloadRegistry> {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Registers `watcher` and starts monitoring its parent directory. On a watch failure the
    /// watcher is stopped; it stays registered so bulk reloads still reach its unit.
    pub fn attach(&self, watcher: Arc<ReloadWatcher>) -> Result<(), ScriptError> {
        self.registry.register(Arc::clone(&watcher));
        let mut table = lock(&self.table);
        if !table.members.insert(watcher.path().to_path_buf()) {
            return Ok(());
        }
        let directory = watcher.directory().to_path_buf();
        if table.directories.get(&directory).copied().unwrap_or(0) == 0 {
            if let Err(source) = self.watch_directory(&directory) {
                table.members.remove(watcher.path());
                watcher.stop();
                return Err(ScriptError::WatchSetup { path: watcher.path().to_path_buf(), source });
            }
        }
        *table.directories.entry(directory).or_insert(0) += 1;
        Ok(())
    }

    /// Deregisters and stops the watcher for `path`, releasing its directory watch.
    pub fn detach(&self, path: &Path) -> Option<Arc<ReloadWatcher>> {
        let removed = self.registry.unregister(path);
        let mut table = lock(&self.table);
        if table.members.remove(path) {
            let directory = path.parent().map(Path::to_path_buf).unwrap_or_default();
            let remaining = match table.directories.get_mut(&directory) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    *count
                }
                None => 0,
            };
            if remaining == 0 {
                table.directories.remove(&directory);
                if let Some(notifier) = lock(&self.notifier).as_mut() {
                    if let Err(err) = notifier.unwatch(&directory) {
                        debug!(directory = %directory.display(), "unwatch failed: {err}");
                    }
                }
            }
        }
        removed
    }

    pub fn watched_directories(&self) -> Vec<PathBuf> {
        let mut directories: Vec<PathBuf> = lock(&self.table).directories.keys().cloned().collect();
        directories.sort();
        directories
    }

    /// Stops every watcher and joins both threads. Safe to call more than once.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.registry.stop_all();
        lock(&self.notifier).take();
        let _ = self.signals.send(DispatchSignal::Shutdown);
        let threads: Vec<JoinHandle<()>> = lock(&self.threads).drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                warn!("script watch thread panicked during shutdown");
            }
        }
        debug!("script watch dispatcher stopped");
    }

    fn watch_directory(&self, directory: &Path) -> Result<(), notify::Error> {
        let mut notifier = lock(&self.notifier);
        match notifier.as_mut() {
            Some(notifier) => notifier.watch(directory, RecursiveMode::NonRecursive),
            None => Err(notify::Error::generic("script watch dispatcher is shut down")),
        }
    }
}

impl Drop for WatchDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_dispatch_loop(
    rx: Receiver<DispatchSignal>,
    registry: Arc<ReloadRegistry>,
    jobs: Sender<Arc<ReloadWatcher>>,
    debounce: Duration,
) {
    let mut pending: Vec<(Arc<ReloadWatcher>, Instant)> = Vec::new();
    loop {
        let now = Instant::now();
        let wait = pending.iter().map(|(_, deadline)| deadline.saturating_duration_since(now)).min();
        let signal = match wait {
            Some(wait) => match rx.recv_timeout(wait) {
                Ok(signal) => Some(signal),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match rx.recv() {
                Ok(signal) => Some(signal),
                Err(_) => break,
            },
        };
        match signal {
            Some(DispatchSignal::Shutdown) => break,
            Some(DispatchSignal::Fs(Ok(event))) if is_relevant(&event.kind) => {
                for path in &event.paths {
                    let changed = normalize_watch_path(path);
                    let Some(watcher) = registry.match_event(&changed) else {
                        continue;
                    };
                    // Trailing edge: every further event pushes the deadline out.
                    let deadline = Instant::now() + debounce;
                    match pending.iter_mut().find(|(queued, _)| Arc::ptr_eq(queued, &watcher)) {
                        Some(entry) => entry.1 = deadline,
                        None => pending.push((watcher, deadline)),
                    }
                }
            }
            Some(DispatchSignal::Fs(Ok(_))) | None => {}
            Some(DispatchSignal::Fs(Err(err))) => warn!("script watcher error: {err}"),
        }

        let now = Instant::now();
        let (due, waiting): (Vec<_>, Vec<_>) = pending.drain(..).partition(|(_, deadline)| *deadline <= now);
        pending = waiting;
        for (watcher, _) in due {
            if jobs.send(watcher).is_err() {
                return;
            }
        }
    }
}

fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Name(_))
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Create(_)
    )
}

/// Absolute, canonical form of `path`. Falls back to the canonical parent joined with the file
/// name when the file itself is gone (editors that save by rename).
pub fn normalize_watch_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else if let Ok(cwd) = env::current_dir() {
        cwd.join(path)
    } else {
        path.to_path_buf()
    };
    match fs::canonicalize(&absolute) {
        Ok(canonical) => canonical,
        Err(_) => {
            if let (Some(parent), Some(name)) = (absolute.parent(), absolute.file_name()) {
                if let Ok(parent_canon) = fs::canonicalize(parent) {
                    return parent_canon.join(name);
                }
            }
            absolute
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
