//! Reload the configuration file when it changes on disk.
//!
//! The parent directory is watched rather than the file itself: editors and
//! config management tools usually replace a file by renaming a new one over
//! it, which a watch on the old inode never reports.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::MessengerConfig;

pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<MessengerConfig>,
}

impl ConfigWatcher {
    /// Returns the watcher and a receiver that yields each configuration
    /// that loaded and validated after a change.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<MessengerConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let watcher = Self {
            path: path.to_path_buf(),
            update_tx,
        };
        (watcher, update_rx)
    }

    /// Start watching. Dropping the returned handle stops the watch.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let Self { path, update_tx } = self;
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = path.file_name().map(|n| n.to_os_string());
        let target = path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::error!(error = %e, "config watch error");
                        return;
                    }
                };
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    return;
                }
                let ours = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                if !ours {
                    return;
                }
                match load_config(&target) {
                    Ok(config) => {
                        tracing::info!(path = %target.display(), "configuration reloaded");
                        let _ = update_tx.send(config);
                    }
                    // a half-written file fails to parse; the final write triggers again
                    Err(e) => tracing::warn!(
                        path = %target.display(),
                        error = %e,
                        "reload rejected, keeping current configuration"
                    ),
                }
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        tracing::info!(path = %path.display(), "watching configuration");
        Ok(watcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rewritten_file_is_delivered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("msgr.toml");
        std::fs::write(&path, "[identity]\nname = \"osd.1\"\n").unwrap();

        let (watcher, mut updates) = ConfigWatcher::new(&path);
        let _handle = watcher.run().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        std::fs::write(&path, "[identity]\nname = \"osd.2\"\n").unwrap();
        let config = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match updates.recv().await {
                    Some(c) if c.identity.name == "osd.2" => return c,
                    Some(_) => continue,
                    None => panic!("watcher closed"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(config.identity.name, "osd.2");
    }
}
