//! Config file watcher (C7).
//!
//! Watches the config file's *parent directory*, not the file itself —
//! atomic editors and `mv`-based writers replace the file's inode, which a
//! direct file watch can miss. Events are filtered down to the resolved
//! config path, debounced (default 10s, cancel-and-restart on every new
//! event), and handed off to the async runtime: `notify`'s callback runs on
//! its own thread, so the handoff is a plain channel send, never a direct
//! async call from that thread. Grounded in original_source's
//! `config/watcher.py`, which does the same thing with a `watchdog.Observer`
//! and `call_soon_threadsafe`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(10);

pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    debounce_task: JoinHandle<()>,
}

impl ConfigWatcher {
    /// Start watching `config_path`'s parent directory. `on_change` fires at
    /// most once per debounce window after the last relevant filesystem
    /// event, even if many writes happen in quick succession.
    pub fn start<F>(config_path: impl AsRef<Path>, debounce: Duration, on_change: F) -> notify::Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let config_path = config_path.as_ref().canonicalize().unwrap_or_else(|_| config_path.as_ref().to_path_buf());
        let parent = config_path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<()>();
        let watched_path = config_path.clone();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<NotifyEvent>| {
            let Ok(event) = res else { return };
            if !matches!(
                event.kind,
                EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
            ) {
                return;
            }
            let touches_config = event.paths.iter().any(|p| {
                p.canonicalize().map(|c| c == watched_path).unwrap_or_else(|_| p == &watched_path)
            });
            if touches_config {
                // Thread handoff: notify's callback runs on its own thread,
                // never call async code directly from here.
                let _ = raw_tx.send(());
            }
        })?;

        watcher.watch(&parent, RecursiveMode::NonRecursive)?;

        let debounce_task = tokio::spawn(async move {
            loop {
                if raw_rx.recv().await.is_none() {
                    break;
                }
                // Collapse a burst of events into one: keep resetting the
                // deadline until `debounce` passes with no new event.
                loop {
                    match tokio::time::timeout(debounce, raw_rx.recv()).await {
                        Ok(Some(())) => continue,
                        Ok(None) => return,
                        Err(_) => break,
                    }
                }
                on_change();
            }
        });

        Ok(Self {
            _watcher: watcher,
            debounce_task,
        })
    }

    pub fn stop(self) {
        self.debounce_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn debounces_rapid_writes_into_one_callback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "services: []\n").unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let watcher = ConfigWatcher::start(&path, Duration::from_millis(100), move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        for i in 0..3 {
            let mut f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            writeln!(f, "services: [] # rev {i}").unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        watcher.stop();
    }
}
