//! Configuration file watching with debounced reloads.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::observability::metrics;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("Failed to create file watcher: {0}")]
    WatcherInit(#[from] notify::Error),

    #[error("Config path has no file name: {0}")]
    NoFileName(PathBuf),
}

/// Publishes every valid revision of the config file on a watch channel.
///
/// Events are coalesced until the file has been quiet for the debounce
/// period. Invalid revisions are logged and skipped. Receivers only ever see
/// the latest snapshot. Dropping the watcher stops the debounce thread.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    _debounce_handle: thread::JoinHandle<()>,
}

impl ConfigWatcher {
    pub fn start(
        path: impl Into<PathBuf>,
        updates: watch::Sender<Arc<Config>>,
        debounce: Duration,
    ) -> Result<Self, WatcherError> {
        let config_path: PathBuf = path.into();
        let config_filename = config_path
            .file_name()
            .map(|s| s.to_os_string())
            .ok_or_else(|| WatcherError::NoFileName(config_path.clone()))?;
        let watch_dir = match config_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (raw_tx, raw_rx) = mpsc::channel();
        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| {
                if let Ok(event) = result {
                    let _ = raw_tx.send(event);
                }
            },
            notify::Config::default(),
        )?;

        // the directory, so editors that replace the file are still seen
        watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;
        info!("Watching {} for configuration changes", config_path.display());

        let debounce_handle = thread::spawn(move || {
            debounce_loop(raw_rx, &config_path, &config_filename, updates, debounce);
        });

        Ok(Self {
            _watcher: watcher,
            _debounce_handle: debounce_handle,
        })
    }
}

fn debounce_loop(
    rx: mpsc::Receiver<Event>,
    config_path: &Path,
    config_filename: &OsString,
    updates: watch::Sender<Arc<Config>>,
    debounce: Duration,
) {
    let mut pending_reload: Option<Instant> = None;

    loop {
        if updates.is_closed() {
            debug!("No configuration subscribers left, stopping watcher");
            break;
        }

        let timeout = match pending_reload {
            Some(last) => debounce.saturating_sub(last.elapsed()),
            None => Duration::from_secs(1),
        };

        match rx.recv_timeout(timeout) {
            Ok(event) => {
                if is_config_event(&event, config_filename) {
                    pending_reload = Some(Instant::now());
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if let Some(last) = pending_reload {
                    if last.elapsed() >= debounce {
                        pending_reload = None;
                        publish(config_path, &updates);
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn publish(config_path: &Path, updates: &watch::Sender<Arc<Config>>) {
    match Config::load_blocking(config_path) {
        Ok(config) => {
            info!("Configuration change detected in {}", config_path.display());
            updates.send_replace(Arc::new(config));
        }
        Err(e) => {
            metrics::record_reload("invalid");
            warn!("Ignoring invalid configuration: {:#}", e);
        }
    }
}

fn is_config_event(event: &Event, config_filename: &OsString) -> bool {
    let relevant = matches!(
        event.kind,
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
    );

    relevant
        && event
            .paths
            .iter()
            .any(|p| p.file_name().map(|name| name == config_filename).unwrap_or(false))
}
