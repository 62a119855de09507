//! Shared servers endpoints can run on, and the redeploy watcher that polls
//! configuration files for changes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::BrokerError;

pub trait Server: Send + Sync {
    fn id(&self) -> &str;

    fn is_started(&self) -> bool;

    fn start(&self) -> Result<(), BrokerError>;

    fn stop(&self);
}

/// Server registered from settings. Holds no resources of its own; its
/// lifecycle brackets the endpoints that reference it.
pub struct SharedServer {
    id: String,
    started: AtomicBool,
}

impl SharedServer {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            started: AtomicBool::new(false),
        }
    }
}

impl Server for SharedServer {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn start(&self) -> Result<(), BrokerError> {
        if !self.started.swap(true, Ordering::SeqCst) {
            tracing::info!(server = %self.id, "shared server started");
        }
        Ok(())
    }

    fn stop(&self) {
        if self.started.swap(false, Ordering::SeqCst) {
            tracing::info!(server = %self.id, "shared server stopped");
        }
    }
}

// ---------------------------------------------------------------------------
// Redeploy watcher
// ---------------------------------------------------------------------------

type ChangeHandler = Arc<dyn Fn(&[PathBuf]) + Send + Sync>;

/// Polls a set of files and reports when any of them changes.
pub struct RedeployWatcher {
    paths: Vec<PathBuf>,
    interval: Duration,
    on_change: ChangeHandler,
    snapshot: Mutex<HashMap<PathBuf, Option<SystemTime>>>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl RedeployWatcher {
    pub fn new<F>(paths: Vec<PathBuf>, interval: Duration, on_change: F) -> Self
    where
        F: Fn(&[PathBuf]) + Send + Sync + 'static,
    {
        let snapshot = paths.iter().map(|p| (p.clone(), modified(p))).collect();
        Self {
            paths,
            interval,
            on_change: Arc::new(on_change),
            snapshot: Mutex::new(snapshot),
            task: Mutex::new(None),
        }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Compare modification times with the last check and return the files
    /// that changed (including ones that appeared or disappeared).
    pub fn check(&self) -> Vec<PathBuf> {
        let mut snapshot = self.snapshot.lock();
        let mut changed = Vec::new();
        for path in &self.paths {
            let now = modified(path);
            if snapshot.get(path) != Some(&now) {
                snapshot.insert(path.clone(), now);
                changed.push(path.clone());
            }
        }
        changed
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Start polling on the current tokio runtime. Without a runtime the
    /// watcher stays idle.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no async runtime; redeploy watcher not started");
            return;
        };

        let token = CancellationToken::new();
        let shutdown = token.clone();
        let watcher = Arc::downgrade(self);
        let interval = self.interval;
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(watcher) = watcher.upgrade() else { break };
                        let changed = watcher.check();
                        if !changed.is_empty() {
                            tracing::info!(files = changed.len(), "redeploy watcher detected changes");
                            (watcher.on_change)(&changed);
                        }
                    }
                }
            }
        });
        *task = Some((token, handle));
        tracing::debug!(paths = self.paths.len(), interval_ms = interval.as_millis() as u64, "redeploy watcher started");
    }

    pub fn stop(&self) {
        if let Some((token, handle)) = self.task.lock().take() {
            token.cancel();
            handle.abort();
            tracing::debug!("redeploy watcher stopped");
        }
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_reports_new_and_changed_files() {
        let dir = std::env::temp_dir().join(format!("broker-redeploy-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("settings.json");
        let _ = std::fs::remove_file(&file);

        let watcher = RedeployWatcher::new(vec![file.clone()], Duration::from_secs(1), |_| {});
        assert!(watcher.check().is_empty());

        std::fs::write(&file, "{}").unwrap();
        assert_eq!(watcher.check(), vec![file.clone()]);
        assert!(watcher.check().is_empty());

        std::fs::remove_file(&file).unwrap();
        assert_eq!(watcher.check(), vec![file]);
    }

    #[test]
    fn shared_server_lifecycle() {
        let server = SharedServer::new("main");
        assert!(!server.is_started());
        server.start().unwrap();
        assert!(server.is_started());
        server.stop();
        assert!(!server.is_started());
    }
}
