//! File watcher.
//!
//! Emits add/change/unlink events with absolute paths, debounced. Events
//! are coalesced per path in a queue; while indexing is active the queue
//! holds (unlink overrides queued add/change), and once the indexer is idle
//! the queue drains as one incremental batch.

use notify::RecursiveMode;
use notify_debouncer_full::{new_debouncer, DebounceEventResult, DebouncedEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::config::{Config, WATCHER_DEBOUNCE_MS};
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    Add,
    Change,
    Unlink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: FileEventKind,
}

/// Per-path coalescing queue. The newest event wins, except that a change
/// arriving after a queued unlink means the file was recreated and is
/// treated as an add.
#[derive(Default)]
pub struct EventQueue {
    pending: Mutex<HashMap<PathBuf, FileEventKind>>,
}

impl EventQueue {
    pub fn push(&self, path: PathBuf, kind: FileEventKind) {
        let mut pending = self.pending.lock();
        let next = match (pending.get(&path), kind) {
            (Some(FileEventKind::Unlink), FileEventKind::Change) => FileEventKind::Add,
            (_, incoming) => incoming,
        };
        pending.insert(path, next);
    }

    pub fn drain(&self) -> Vec<FileEvent> {
        let mut pending = self.pending.lock();
        let mut events: Vec<FileEvent> = pending
            .drain()
            .map(|(path, kind)| FileEvent { path, kind })
            .collect();
        // Deterministic batch order for the incremental pass.
        events.sort_by(|a, b| a.path.cmp(&b.path));
        events
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }
}

pub struct FileWatcher {
    _debouncer:
        notify_debouncer_full::Debouncer<notify::RecommendedWatcher, notify_debouncer_full::RecommendedCache>,
    drain_task: tokio::task::JoinHandle<()>,
    queue: Arc<EventQueue>,
}

impl FileWatcher {
    /// Watch `config.search_directory` recursively. Drained batches are
    /// delivered on `events_tx`; while `busy` is set the queue keeps
    /// accumulating instead of draining.
    pub fn start(
        config: Arc<Config>,
        busy: Arc<AtomicBool>,
        events_tx: mpsc::UnboundedSender<Vec<FileEvent>>,
    ) -> EngineResult<Self> {
        let root = config.search_directory.clone();
        let queue = Arc::new(EventQueue::default());
        let wakeup = Arc::new(Notify::new());

        let callback_queue = Arc::clone(&queue);
        let callback_wakeup = Arc::clone(&wakeup);
        let callback_config = Arc::clone(&config);

        let mut debouncer = new_debouncer(
            Duration::from_millis(WATCHER_DEBOUNCE_MS),
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    let mut queued = false;
                    for event in &events {
                        let Some(kind) = classify(event) else {
                            continue;
                        };
                        for path in &event.paths {
                            if !watchable(path, &callback_config) {
                                continue;
                            }
                            callback_queue.push(path.clone(), kind);
                            queued = true;
                        }
                    }
                    if queued {
                        callback_wakeup.notify_one();
                    }
                }
                Err(errors) => {
                    for e in errors {
                        warn!(error = ?e, "File watcher error");
                    }
                }
            },
        )
        .map_err(|e| EngineError::WatcherError(e.to_string()))?;

        debouncer
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| EngineError::WatcherError(e.to_string()))?;

        let drain_queue = Arc::clone(&queue);
        let drain_task = tokio::spawn(async move {
            loop {
                wakeup.notified().await;
                loop {
                    if drain_queue.is_empty() {
                        break;
                    }
                    if busy.load(Ordering::Acquire) {
                        // Indexing is active; keep queueing.
                        tokio::time::sleep(Duration::from_millis(WATCHER_DEBOUNCE_MS)).await;
                        continue;
                    }
                    let batch = drain_queue.drain();
                    if batch.is_empty() {
                        break;
                    }
                    debug!(events = batch.len(), "Draining watcher queue");
                    if events_tx.send(batch).is_err() {
                        return;
                    }
                }
            }
        });

        info!(root = %root.display(), debounce_ms = WATCHER_DEBOUNCE_MS, "File watcher started");
        Ok(Self {
            _debouncer: debouncer,
            drain_task,
            queue,
        })
    }

    pub fn queued_events(&self) -> usize {
        self.queue.len()
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.drain_task.abort();
    }
}

fn classify(event: &DebouncedEvent) -> Option<FileEventKind> {
    use notify::EventKind;
    match event.kind {
        EventKind::Create(_) => Some(FileEventKind::Add),
        EventKind::Modify(_) => Some(FileEventKind::Change),
        EventKind::Remove(_) => Some(FileEventKind::Unlink),
        _ => None,
    }
}

/// Cheap pre-filter applied on the watcher thread; the indexer re-validates
/// everything it is handed.
fn watchable(path: &Path, config: &Config) -> bool {
    let ext = path
        .extension()
        .unwrap_or_default()
        .to_string_lossy()
        .to_lowercase();
    if !config.is_supported_extension(&ext) {
        return false;
    }
    !path.components().any(|component| {
        matches!(
            component,
            std::path::Component::Normal(name)
                if matches!(
                    name.to_string_lossy().as_ref(),
                    "node_modules" | ".git" | "target" | "dist" | "build" | "__pycache__"
                )
        )
    })
}
