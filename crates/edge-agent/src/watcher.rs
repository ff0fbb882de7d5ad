//! # Configuration Watcher
//!
//! Change notification for the configuration directory, exposed as two independently
//! selectable streams: change events and watch-subsystem errors.
//!
//! [`NotifyWatcher`] is the shipped implementation, backed by the platform's native
//! notification API through [`notify::RecommendedWatcher`]. The watch lives as long as
//! the `events` receiver; after an error the caller drops the streams and re-establishes
//! the watch by calling [`ConfigWatcher::watch`] again.

use crate::error::ConfigError;
use crate::messages::ChangeKind;
use async_trait::async_trait;
use notify::event::{AccessKind, AccessMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, trace};

const STREAM_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// The two halves of an established watch. Dropping `events` ends the watch.
pub struct WatchStreams {
    pub events: mpsc::Receiver<ChangeEvent>,
    pub errors: mpsc::Receiver<ConfigError>,
}

#[async_trait]
pub trait ConfigWatcher: Send + Sync {
    /// Starts watching `dir`. Fails if the watch cannot be established at all.
    async fn watch(&self, dir: &Path) -> Result<WatchStreams, ConfigError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NotifyWatcher;

impl NotifyWatcher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConfigWatcher for NotifyWatcher {
    async fn watch(&self, dir: &Path) -> Result<WatchStreams, ConfigError> {
        let dir = dir.to_path_buf();
        let (events_tx, events) = mpsc::channel(STREAM_CAPACITY);
        let (errors_tx, errors) = mpsc::channel(1);
        let watch_error = |e: notify::Error, path: &Path| ConfigError::Watch {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };

        // The handler runs on the watcher's own thread, so blocking sends are allowed.
        let forward = events_tx.clone();
        let watched = dir.clone();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    if let Some(error) = lost_directory(&event, &watched) {
                        let _ = errors_tx.try_send(error);
                        return;
                    }
                    for change in translate(event) {
                        trace!(path = %change.path.display(), kind = %change.kind, "Change detected");
                        if forward.blocking_send(change).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    let _ = errors_tx.try_send(watch_error(e, &watched));
                }
            }
        })
        .map_err(|e| watch_error(e, &dir))?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| watch_error(e, &dir))?;
        debug!(dir = %dir.display(), "Watching configuration directory");

        tokio::spawn(hold(watcher, events_tx, dir));
        Ok(WatchStreams { events, errors })
    }
}

/// Keeps the OS watch registered until the consumer drops its event stream.
async fn hold(watcher: RecommendedWatcher, events: mpsc::Sender<ChangeEvent>, dir: PathBuf) {
    events.closed().await;
    drop(watcher);
    debug!(dir = %dir.display(), "Watch ended");
}

fn lost_directory(event: &Event, dir: &Path) -> Option<ConfigError> {
    let removed = matches!(event.kind, EventKind::Remove(_));
    (removed && event.paths.iter().any(|path| path == dir)).then(|| ConfigError::Watch {
        path: dir.to_path_buf(),
        reason: "watched directory removed".to_string(),
    })
}

fn translate(event: Event) -> Vec<ChangeEvent> {
    let kind = match event.kind {
        EventKind::Create(_) => ChangeKind::Created,
        EventKind::Modify(_) | EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
            ChangeKind::Modified
        }
        EventKind::Remove(_) => ChangeKind::Removed,
        _ => return Vec::new(),
    };
    event
        .paths
        .into_iter()
        .map(|path| ChangeEvent { path, kind })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, ModifyKind, RemoveKind};
    use std::fs;
    use std::time::Duration;

    async fn next_for(streams: &mut WatchStreams, path: &Path) -> ChangeEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), streams.events.recv())
                .await
                .unwrap()
                .unwrap();
            if event.path == path {
                return event;
            }
        }
    }

    #[test]
    fn event_kinds_map_to_changes() {
        let created = Event::new(EventKind::Create(CreateKind::File)).add_path("a.json".into());
        let written = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path("b.json".into());
        let removed = Event::new(EventKind::Remove(RemoveKind::File)).add_path("c.json".into());
        let opened = Event::new(EventKind::Access(AccessKind::Open(AccessMode::Read)))
            .add_path("d.json".into());

        assert_eq!(translate(created)[0].kind, ChangeKind::Created);
        assert_eq!(translate(written)[0].kind, ChangeKind::Modified);
        assert_eq!(translate(removed)[0].kind, ChangeKind::Removed);
        assert!(translate(opened).is_empty());
    }

    #[test]
    fn removing_the_watched_directory_is_an_error() {
        let dir = Path::new("/etc/opt/edge-agent");
        let gone = Event::new(EventKind::Remove(RemoveKind::Folder)).add_path(dir.into());
        let file = Event::new(EventKind::Remove(RemoveKind::File)).add_path(dir.join("asset.json"));

        assert!(matches!(lost_directory(&gone, dir), Some(ConfigError::Watch { .. })));
        assert!(lost_directory(&file, dir).is_none());
    }

    #[tokio::test]
    async fn missing_directory_fails_to_watch() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let result = NotifyWatcher::new().watch(&missing).await;
        assert!(matches!(result, Err(ConfigError::Watch { .. })));
    }

    #[tokio::test]
    async fn detects_a_rewritten_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("asset.json");
        fs::write(&path, "{}").unwrap();

        let mut streams = NotifyWatcher::new().watch(dir.path()).await.unwrap();
        fs::write(&path, r#"{"machineId": "press-7"}"#).unwrap();

        let event = next_for(&mut streams, &path).await;
        assert_eq!(event.kind, ChangeKind::Modified);
    }

    #[tokio::test]
    async fn detects_a_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut streams = NotifyWatcher::new().watch(dir.path()).await.unwrap();

        let path = dir.path().join("equipment.json");
        fs::write(&path, "{}").unwrap();

        let event = next_for(&mut streams, &path).await;
        assert_eq!(event.kind, ChangeKind::Created);
    }
}
