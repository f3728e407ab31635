//! Indexing orchestrator.
//!
//! Drives discovery -> pre-filter -> read -> chunk -> embed -> persist for a
//! workspace, with single-flight protection, per-batch progress, periodic
//! and strict final saves, watcher integration, and workspace switching.

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::{Cache, StoredChunk};
use crate::chunker::{self, ChunkPolicy};
use crate::config::Config;
use crate::embedder::TextEmbedder;
use crate::error::{EngineError, EngineResult};
use crate::hasher;
use crate::progress::{Progress, ProgressWriter};
use crate::watcher::{FileEvent, FileEventKind, FileWatcher};
use crate::worker_pool::WorkerPool;

/// Discovery never descends further than this.
const MAX_RECURSION_DEPTH: usize = 20;

/// Pre-filter stat/hash batch size; a yield point sits between batches.
const PRE_FILTER_BATCH: usize = 500;

/// Everything one indexing pass needs, swapped wholesale on workspace
/// switch. Old readers keep their snapshot until their next operation.
#[derive(Clone)]
pub struct Workspace {
    pub config: Arc<Config>,
    pub cache: Arc<Cache>,
    pub pool: Arc<WorkerPool>,
    pub embedder: Arc<dyn TextEmbedder>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOutcome {
    Done(IndexSummary),
    Skipped { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexSummary {
    pub mode: String,
    pub files_discovered: usize,
    pub files_indexed: usize,
    pub files_unchanged: usize,
    pub files_removed: usize,
    pub files_failed: usize,
    pub chunks_added: usize,
    pub batches_embedded: usize,
    pub duration_ms: u64,
}

struct PendingFile {
    path: String,
    hash: String,
    pieces: Vec<chunker::ChunkPiece>,
    vectors: Vec<Option<Vec<f32>>>,
    call_targets: Vec<String>,
    failed: bool,
    committed: bool,
}

pub struct Indexer {
    workspace: RwLock<Workspace>,
    is_indexing: Arc<AtomicBool>,
    progress: Mutex<ProgressWriter>,
    watcher: Mutex<Option<FileWatcher>>,
    watcher_consumer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Indexer {
    pub fn new(workspace: Workspace) -> Self {
        let progress_path = workspace.cache.paths().progress();
        Self {
            workspace: RwLock::new(workspace),
            is_indexing: Arc::new(AtomicBool::new(false)),
            progress: Mutex::new(ProgressWriter::new(progress_path)),
            watcher: Mutex::new(None),
            watcher_consumer: Mutex::new(None),
        }
    }

    /// Snapshot of the current workspace bundle; callers keep it for the
    /// duration of one operation.
    pub fn workspace(&self) -> Workspace {
        self.workspace.read().clone()
    }

    pub fn is_indexing(&self) -> bool {
        self.is_indexing.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // Full indexing
    // -----------------------------------------------------------------------

    /// Index the whole workspace. A sibling call while one is running
    /// returns `Skipped` immediately.
    pub async fn index_all(&self, force: bool) -> EngineResult<IndexOutcome> {
        let Some(_guard) = self.try_begin() else {
            return Ok(IndexOutcome::Skipped {
                reason: "indexing is already in progress".into(),
            });
        };
        let ws = self.workspace();
        ws.cache.load().await?;

        let started_at = chrono::Utc::now();
        let start = std::time::Instant::now();
        let mode = if force || ws.cache.store_len() == 0 {
            "initial"
        } else {
            "incremental"
        };

        self.write_progress(&ws, 0, 0, "Discovering files", mode);
        let discovered = discover_files(&ws.config).await?;
        let discovered_set: BTreeSet<String> = discovered
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect();

        // Full walks also notice files that vanished since the last pass.
        let removed: Vec<String> = ws
            .cache
            .file_hashes_snapshot()
            .into_keys()
            .filter(|path| !discovered_set.contains(path))
            .collect();

        self.write_progress(&ws, 0, discovered.len(), "Hashing files", mode);
        let (work, unchanged, failed_stat) = self.pre_filter(&ws, &discovered, force).await?;

        let summary = self
            .run_pipeline(&ws, work, removed, mode, started_at, start)
            .await?;
        let summary = IndexSummary {
            files_discovered: discovered.len(),
            files_unchanged: unchanged,
            files_failed: summary.files_failed + failed_stat,
            ..summary
        };

        info!(
            mode,
            discovered = summary.files_discovered,
            indexed = summary.files_indexed,
            unchanged = summary.files_unchanged,
            removed = summary.files_removed,
            chunks = summary.chunks_added,
            duration_ms = summary.duration_ms,
            "Indexing complete"
        );
        Ok(IndexOutcome::Done(summary))
    }

    /// Incremental pass over watcher events. Unlinks drop chunks and
    /// hashes; adds and changes run the normal pipeline.
    pub async fn index_files(&self, events: Vec<FileEvent>) -> EngineResult<IndexOutcome> {
        if events.is_empty() {
            return Ok(IndexOutcome::Done(IndexSummary {
                mode: "incremental".into(),
                ..IndexSummary::default()
            }));
        }
        let Some(_guard) = self.try_begin() else {
            return Ok(IndexOutcome::Skipped {
                reason: "indexing is already in progress".into(),
            });
        };
        let ws = self.workspace();
        ws.cache.load().await?;

        let started_at = chrono::Utc::now();
        let start = std::time::Instant::now();

        let mut removed = Vec::new();
        let mut candidates = Vec::new();
        for event in events {
            let path_str = event.path.to_string_lossy().to_string();
            match event.kind {
                FileEventKind::Unlink => removed.push(path_str),
                FileEventKind::Add | FileEventKind::Change => {
                    if event.path.is_file() {
                        candidates.push(event.path);
                    } else {
                        // Raced with a delete after the event fired.
                        removed.push(path_str);
                    }
                }
            }
        }
        // Keep only removals the cache actually knows about.
        removed.retain(|path| ws.cache.file_hash(path).is_some());

        let (work, unchanged, failed_stat) = self.pre_filter(&ws, &candidates, false).await?;
        let discovered = candidates.len();

        let summary = self
            .run_pipeline(&ws, work, removed, "incremental", started_at, start)
            .await?;
        let summary = IndexSummary {
            files_discovered: discovered,
            files_unchanged: unchanged,
            files_failed: summary.files_failed + failed_stat,
            ..summary
        };

        debug!(
            indexed = summary.files_indexed,
            removed = summary.files_removed,
            "Incremental pass complete"
        );
        Ok(IndexOutcome::Done(summary))
    }

    fn try_begin(&self) -> Option<IndexingGuard<'_>> {
        if self
            .is_indexing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let ws = self.workspace();
        ws.cache.set_indexing(true);
        Some(IndexingGuard {
            flag: &self.is_indexing,
            cache: ws.cache,
        })
    }

    // -----------------------------------------------------------------------
    // Pre-filter
    // -----------------------------------------------------------------------

    /// Stat + hash candidates in yielding batches. Drops oversize and
    /// non-regular files and, unless `force`, files whose hash matches the
    /// cache. Returns `(work, unchanged_count, failed_count)`.
    async fn pre_filter(
        &self,
        ws: &Workspace,
        candidates: &[PathBuf],
        force: bool,
    ) -> EngineResult<(Vec<(PathBuf, String)>, usize, usize)> {
        let mut work = Vec::new();
        let mut unchanged = 0usize;
        let mut failed = 0usize;

        for batch in candidates.chunks(PRE_FILTER_BATCH) {
            let max_file_size = ws.config.max_file_size;
            let batch: Vec<PathBuf> = batch.to_vec();
            let hashed: Vec<(PathBuf, Option<String>)> =
                tokio::task::spawn_blocking(move || {
                    batch
                        .par_iter()
                        .map(|path| {
                            let meta = match std::fs::metadata(path) {
                                Ok(m) if m.is_file() => m,
                                _ => return (path.clone(), None),
                            };
                            if meta.len() > max_file_size {
                                return (path.clone(), None);
                            }
                            (path.clone(), hasher::hash_file(path).ok())
                        })
                        .collect()
                })
                .await
                .map_err(|_| EngineError::Cancelled)?;

            let skip_unchanged = !force && ws.config.smart_indexing;
            for (path, hash) in hashed {
                let Some(hash) = hash else {
                    failed += 1;
                    continue;
                };
                let path_str = path.to_string_lossy().to_string();
                if skip_unchanged
                    && ws.cache.file_hash(&path_str).as_deref() == Some(hash.as_str())
                {
                    unchanged += 1;
                    continue;
                }
                work.push((path, hash));
            }
            tokio::task::yield_now().await;
        }
        Ok((work, unchanged, failed))
    }

    // -----------------------------------------------------------------------
    // Read -> chunk -> embed -> persist
    // -----------------------------------------------------------------------

    async fn run_pipeline(
        &self,
        ws: &Workspace,
        work: Vec<(PathBuf, String)>,
        removed: Vec<String>,
        mode: &str,
        started_at: chrono::DateTime<chrono::Utc>,
        start: std::time::Instant,
    ) -> EngineResult<IndexSummary> {
        let mut summary = IndexSummary {
            mode: mode.to_string(),
            ..IndexSummary::default()
        };

        for path in &removed {
            ws.cache.remove_chunks_for_file(path).await?;
            ws.cache.delete_file_hash(path).await?;
            ws.cache.remove_file_edges(path).await?;
            summary.files_removed += 1;
        }

        let policy = ChunkPolicy::from_config(&ws.config);
        let total = work.len();
        self.write_progress(ws, 0, total, "Reading files", mode);

        // Read and chunk, keeping per-file order; failures are logged and
        // skipped.
        let mut pending: Vec<PendingFile> = Vec::with_capacity(total);
        for (path, hash) in work {
            match self.read_and_chunk(ws, &path, &hash, policy).await {
                Ok(Some(file)) => pending.push(file),
                Ok(None) => summary.files_failed += 1,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Skipping unreadable file");
                    summary.files_failed += 1;
                }
            }
            tokio::task::yield_now().await;
        }

        // Empty files carry a hash but no chunks; commit them immediately.
        for file in pending.iter().filter(|f| f.pieces.is_empty()) {
            ws.cache.remove_chunks_for_file(&file.path).await?;
            ws.cache.set_file_hash(&file.path, &file.hash).await?;
            summary.files_indexed += 1;
        }
        pending.retain(|f| !f.pieces.is_empty());

        // Cross-file batches of batch_size texts; a file commits as soon as
        // all of its pieces have vectors.
        let batch_size = ws.config.batch_size;
        let mut batch: Vec<(usize, usize)> = Vec::with_capacity(batch_size);
        let mut committed = 0usize;
        let mut batches_since_save = 0usize;

        let indexed_files: BTreeSet<String> = ws
            .cache
            .file_hashes_snapshot()
            .into_keys()
            .chain(pending.iter().map(|f| f.path.clone()))
            .collect();

        let piece_refs: Vec<(usize, usize)> = pending
            .iter()
            .enumerate()
            .flat_map(|(fi, f)| (0..f.pieces.len()).map(move |pi| (fi, pi)))
            .collect();

        for (fi, pi) in piece_refs {
            batch.push((fi, pi));
            if batch.len() >= batch_size {
                let flushed = std::mem::take(&mut batch);
                committed += self
                    .flush_batch(ws, &mut pending, flushed, &indexed_files, &mut summary)
                    .await?;
                summary.batches_embedded += 1;
                batches_since_save += 1;
                self.write_progress(ws, committed, total, "Embedding", mode);
                if batches_since_save >= ws.config.save_every_n {
                    batches_since_save = 0;
                    ws.cache.save(false).await?;
                }
            }
        }
        if !batch.is_empty() {
            let flushed = std::mem::take(&mut batch);
            committed += self
                .flush_batch(ws, &mut pending, flushed, &indexed_files, &mut summary)
                .await?;
            summary.batches_embedded += 1;
            self.write_progress(ws, committed, total, "Embedding", mode);
        }

        summary.files_indexed += committed;
        summary.files_failed += pending.iter().filter(|f| f.failed).count();

        // Structural changes happened; let the ANN index catch up in the
        // background while the strict final save runs.
        if summary.chunks_added > 0 || summary.files_removed > 0 {
            let cache = Arc::clone(&ws.cache);
            tokio::spawn(async move {
                if let Err(e) = cache.ensure_ann_index().await {
                    debug!(error = %e, "Background ANN build failed");
                }
            });
        }

        let ended_at = chrono::Utc::now();
        let duration_ms = start.elapsed().as_millis() as u64;
        summary.duration_ms = duration_ms;
        ws.cache
            .record_index_run(started_at, ended_at, mode, duration_ms);

        if summary.files_indexed > 0 || summary.files_removed > 0 {
            self.write_progress(ws, committed, total, "Saving", mode);
            ws.cache.save(true).await?;
        }
        self.write_progress(ws, committed, total, "Indexing complete", mode);
        Ok(summary)
    }

    async fn read_and_chunk(
        &self,
        ws: &Workspace,
        path: &Path,
        hash: &str,
        policy: ChunkPolicy,
    ) -> EngineResult<Option<PendingFile>> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            EngineError::FileReadError {
                path: path.display().to_string(),
                detail: e.to_string(),
            }
        })?;
        // The size may have grown since pre-filter; re-check.
        if bytes.len() as u64 > ws.config.max_file_size {
            warn!(file = %path.display(), size = bytes.len(), "File grew past limit, skipping");
            return Ok(None);
        }

        let pieces = chunker::chunk_bytes(&bytes, path, policy)?;
        let call_targets = if ws.config.call_graph_enabled {
            let language = crate::lang::language_of(path);
            let text = String::from_utf8_lossy(&bytes);
            crate::callgraph::extract_references(&text, language)
        } else {
            Vec::new()
        };

        let vectors = vec![None; pieces.len()];
        Ok(Some(PendingFile {
            path: path.to_string_lossy().to_string(),
            hash: hash.to_string(),
            pieces,
            vectors,
            call_targets,
            failed: false,
            committed: false,
        }))
    }

    /// Embed one batch (retrying once) and commit every file whose pieces
    /// are now fully vectored. Returns the number of committed files.
    async fn flush_batch(
        &self,
        ws: &Workspace,
        pending: &mut [PendingFile],
        batch: Vec<(usize, usize)>,
        indexed_files: &BTreeSet<String>,
        summary: &mut IndexSummary,
    ) -> EngineResult<usize> {
        let texts: Vec<String> = batch
            .iter()
            .map(|&(fi, pi)| pending[fi].pieces[pi].text.clone())
            .collect();

        let vectors = match ws.pool.submit(texts.clone()).await {
            Ok(vectors) => Some(vectors),
            Err(first) => {
                warn!(error = %first, "Embedding batch failed, retrying once");
                match ws.pool.submit(texts).await {
                    Ok(vectors) => Some(vectors),
                    Err(second) => {
                        warn!(error = %second, "Embedding batch failed twice, skipping batch");
                        None
                    }
                }
            }
        };

        match vectors {
            Some(vectors) => {
                for (&(fi, pi), vector) in batch.iter().zip(vectors) {
                    pending[fi].vectors[pi] = Some(vector);
                }
            }
            None => {
                for &(fi, _) in &batch {
                    pending[fi].failed = true;
                }
            }
        }

        let mut committed = 0usize;
        let touched: BTreeSet<usize> = batch.iter().map(|&(fi, _)| fi).collect();
        for fi in touched {
            let ready = {
                let file = &pending[fi];
                !file.failed && !file.committed && file.vectors.iter().all(|v| v.is_some())
            };
            if !ready {
                continue;
            }

            let (path, hash, chunks, call_targets) = {
                let file = &pending[fi];
                let chunks: Vec<StoredChunk> = file
                    .pieces
                    .iter()
                    .zip(file.vectors.iter())
                    .map(|(piece, vector)| StoredChunk {
                        file: file.path.clone(),
                        start_line: piece.start_line,
                        end_line: piece.end_line,
                        content: piece.text.clone(),
                        token_count: piece.token_count,
                        vector: vector.clone().unwrap_or_default(),
                    })
                    .collect();
                (
                    file.path.clone(),
                    file.hash.clone(),
                    chunks,
                    file.call_targets.clone(),
                )
            };

            // Replace-then-hash ordering: the hash entry appears only after
            // its chunks are in the store.
            ws.cache.remove_chunks_for_file(&path).await?;
            summary.chunks_added += chunks.len();
            ws.cache.add_chunks(chunks).await?;
            ws.cache.set_file_hash(&path, &hash).await?;

            if ws.config.call_graph_enabled {
                let targets =
                    crate::callgraph::resolve_references(&path, &call_targets, indexed_files);
                ws.cache.set_file_edges(&path, targets).await?;
            }

            pending[fi].committed = true;
            committed += 1;
        }

        Ok(committed)
    }

    fn write_progress(&self, ws: &Workspace, progress: usize, total: usize, message: &str, mode: &str) {
        self.progress.lock().write(Progress {
            progress,
            total,
            message: message.to_string(),
            updated_at: None,
            index_mode: Some(mode.to_string()),
            worker_circuit_open: ws.pool.circuit_open(),
            workers_disabled_until: ws.pool.workers_disabled_until(),
        });
    }

    // -----------------------------------------------------------------------
    // Watcher integration
    // -----------------------------------------------------------------------

    /// Start watching the current workspace; drained event batches feed
    /// incremental passes. No-op when already watching.
    pub fn setup_file_watcher(self: Arc<Self>) -> EngineResult<()> {
        let mut watcher_slot = self.watcher.lock();
        if watcher_slot.is_some() {
            return Ok(());
        }
        let ws = self.workspace();
        if !ws.config.watch_files {
            return Ok(());
        }

        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Vec<FileEvent>>();
        let watcher = FileWatcher::start(
            Arc::clone(&ws.config),
            Arc::clone(&self.is_indexing),
            events_tx,
        )?;

        let indexer = Arc::clone(&self);
        let consumer = tokio::spawn(async move {
            while let Some(events) = events_rx.recv().await {
                loop {
                    match indexer.index_files(events.clone()).await {
                        Ok(IndexOutcome::Skipped { .. }) => {
                            // A full pass grabbed the flag between drain and
                            // here; retry shortly rather than dropping work.
                            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                        }
                        Ok(IndexOutcome::Done(_)) => break,
                        Err(e) => {
                            warn!(error = %e, "Incremental indexing failed");
                            break;
                        }
                    }
                }
            }
        });

        *watcher_slot = Some(watcher);
        *self.watcher_consumer.lock() = Some(consumer);
        Ok(())
    }

    pub fn stop_file_watcher(&self) {
        self.watcher.lock().take();
        if let Some(task) = self.watcher_consumer.lock().take() {
            task.abort();
        }
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.lock().is_some()
    }

    // -----------------------------------------------------------------------
    // Workspace switching
    // -----------------------------------------------------------------------

    /// Swap to a new workspace bundle: terminate workers, stop the watcher,
    /// load the new cache, optionally restart the watcher. On load failure
    /// the prior workspace is restored.
    pub async fn update_workspace_state(
        self: Arc<Self>,
        next: Workspace,
        restart_watcher: bool,
    ) -> EngineResult<()> {
        if self.is_indexing() {
            return Err(EngineError::IndexInProgress);
        }

        let was_watching = self.is_watching();
        self.stop_file_watcher();

        let previous = {
            let mut slot = self.workspace.write();
            let previous = slot.clone();
            *slot = next.clone();
            previous
        };
        previous.pool.terminate();

        if let Err(e) = next.cache.load().await {
            // Roll back to the previous workspace; its pool is gone, so
            // rebuild-by-caller is not needed for queries (fallback embeds
            // on the main thread).
            warn!(error = %e, "Workspace switch failed, rolling back");
            *self.workspace.write() = previous;
            *self.progress.lock() =
                ProgressWriter::new(self.workspace().cache.paths().progress());
            if was_watching {
                let _ = Arc::clone(&self).setup_file_watcher();
            }
            return Err(e);
        }

        *self.progress.lock() = ProgressWriter::new(next.cache.paths().progress());
        if restart_watcher && next.config.watch_files {
            Arc::clone(&self).setup_file_watcher()?;
        }
        info!(
            workspace = %next.config.search_directory.display(),
            "Workspace switched"
        );
        Ok(())
    }

    /// Graceful drain: stop the watcher, terminate workers, final save.
    pub async fn shutdown(&self) {
        self.stop_file_watcher();
        let ws = self.workspace();
        ws.pool.terminate();
        if let Err(e) = ws.cache.save(false).await {
            warn!(error = %e, "Final save on shutdown failed");
        }
    }
}

struct IndexingGuard<'a> {
    flag: &'a AtomicBool,
    cache: Arc<Cache>,
}

impl Drop for IndexingGuard<'_> {
    fn drop(&mut self) {
        self.cache.set_indexing(false);
        self.flag.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

fn build_exclude_set(patterns: &[String]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => warn!(pattern = %pattern, error = %e, "Ignoring invalid exclude pattern"),
        }
    }
    builder.build().unwrap_or_else(|_| GlobSet::empty())
}

/// Enumerate indexable files under the search directory, honoring the
/// extension list, exclude globs, gitignore rules, and the depth bound.
async fn discover_files(config: &Arc<Config>) -> EngineResult<Vec<PathBuf>> {
    let config = Arc::clone(config);
    tokio::task::spawn_blocking(move || {
        let excludes = build_exclude_set(&config.exclude_patterns);
        let root = config.search_directory.clone();
        let files: Vec<PathBuf> = WalkBuilder::new(&root)
            .hidden(false)
            .git_ignore(true)
            .git_global(true)
            .git_exclude(true)
            .max_depth(Some(MAX_RECURSION_DEPTH))
            .build()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_some_and(|ft| ft.is_file()))
            .filter(|entry| {
                let ext = entry
                    .path()
                    .extension()
                    .unwrap_or_default()
                    .to_string_lossy()
                    .to_lowercase();
                config.is_supported_extension(&ext)
            })
            .filter(|entry| {
                let relative = entry.path().strip_prefix(&root).unwrap_or(entry.path());
                !excludes.is_match(relative) && !excludes.is_match(entry.path())
            })
            .map(|entry| entry.into_path())
            .collect();
        Ok(files)
    })
    .await
    .map_err(|_| EngineError::Cancelled)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ann::{AnnBackend, StubAnn};
    use crate::cache::{CachePaths, CacheSettings};
    use crate::config::VectorStoreFormat;
    use crate::embedder::HashEmbedder;
    use crate::worker_pool::EmbedderFactory;
    use tempfile::TempDir;

    fn test_workspace(root: &Path, cache_dir: &Path) -> Workspace {
        let config = Arc::new(Config {
            search_directory: root.to_path_buf(),
            cache_directory: Some(cache_dir.to_path_buf()),
            embedding_model: "hash-projection-test".into(),
            batch_size: 2,
            save_every_n: 2,
            watch_files: false,
            ..Config::default()
        });
        let settings = CacheSettings {
            embedding_model: config.embedding_model.clone(),
            vector_store_format: VectorStoreFormat::Binary,
            enable_cache: true,
            ann_enabled: true,
            ann_min_chunks: 5000,
            ann_index_cache: true,
            ann_params: crate::ann::AnnParams::from_config(&config),
        };
        let cache = Arc::new(Cache::with_ann_factory(
            CachePaths::new(cache_dir.to_path_buf()),
            Vec::new(),
            settings,
            Box::new(|_, _| Ok(Box::new(StubAnn::new()) as Box<dyn AnnBackend>)),
        ));
        let embedder: Arc<dyn TextEmbedder> = Arc::new(HashEmbedder::default());
        let factory: EmbedderFactory =
            Arc::new(|| Arc::new(HashEmbedder::default()) as Arc<dyn TextEmbedder>);
        let pool = Arc::new(WorkerPool::new(1, factory, Arc::clone(&embedder)));
        Workspace {
            config,
            cache,
            pool,
            embedder,
        }
    }

    fn write_file(root: &Path, name: &str, content: &str) -> PathBuf {
        let path = root.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn fresh_index_stores_chunks_and_hashes() {
        let root = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        write_file(root.path(), "a.js", "export function greet(){return 'hi'}");
        write_file(root.path(), "b.js", "console.log('bye')");

        let indexer = Arc::new(Indexer::new(test_workspace(root.path(), cache_dir.path())));
        let outcome = indexer.index_all(false).await.unwrap();
        let IndexOutcome::Done(summary) = outcome else {
            panic!("expected Done");
        };
        assert_eq!(summary.files_indexed, 2);
        assert_eq!(summary.chunks_added, 2);

        let ws = indexer.workspace();
        assert_eq!(ws.cache.store_len(), 2);
        let meta = ws.cache.meta_snapshot();
        assert_eq!(meta.files_indexed, 2);
        assert_eq!(meta.chunks_stored, 2);
        assert_eq!(meta.last_index_mode.as_deref(), Some("initial"));
        assert!(meta.last_index_ended_at >= meta.last_index_started_at);
    }

    #[tokio::test]
    async fn second_pass_embeds_nothing_when_unchanged() {
        let root = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        write_file(root.path(), "a.js", "export function greet(){return 'hi'}");

        let indexer = Arc::new(Indexer::new(test_workspace(root.path(), cache_dir.path())));
        indexer.index_all(false).await.unwrap();

        let IndexOutcome::Done(second) = indexer.index_all(false).await.unwrap() else {
            panic!("expected Done");
        };
        assert_eq!(second.files_indexed, 0);
        assert_eq!(second.batches_embedded, 0);
        assert_eq!(second.files_unchanged, 1);
    }

    #[tokio::test]
    async fn changed_file_is_reembedded_alone() {
        let root = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        let a = write_file(root.path(), "a.js", "export function greet(){return 'hi'}");
        write_file(root.path(), "b.js", "console.log('bye')");

        let indexer = Arc::new(Indexer::new(test_workspace(root.path(), cache_dir.path())));
        indexer.index_all(false).await.unwrap();
        let ws = indexer.workspace();
        let old_hash = ws.cache.file_hash(&a.to_string_lossy()).unwrap();

        std::fs::write(&a, "export function greet(name){return 'hi '+name}").unwrap();
        let IndexOutcome::Done(second) = indexer.index_all(false).await.unwrap() else {
            panic!("expected Done");
        };
        assert_eq!(second.files_indexed, 1);
        assert_eq!(second.files_unchanged, 1);
        assert_eq!(second.mode, "incremental");

        let new_hash = ws.cache.file_hash(&a.to_string_lossy()).unwrap();
        assert_ne!(old_hash, new_hash);
        // Old chunk replaced, not duplicated.
        assert_eq!(ws.cache.store_len(), 2);
    }

    #[tokio::test]
    async fn unlink_event_removes_chunks_and_hash() {
        let root = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        write_file(root.path(), "a.js", "export function greet(){return 'hi'}");
        let b = write_file(root.path(), "b.js", "console.log('bye')");

        let indexer = Arc::new(Indexer::new(test_workspace(root.path(), cache_dir.path())));
        indexer.index_all(false).await.unwrap();

        std::fs::remove_file(&b).unwrap();
        let outcome = indexer
            .index_files(vec![FileEvent {
                path: b.clone(),
                kind: FileEventKind::Unlink,
            }])
            .await
            .unwrap();
        let IndexOutcome::Done(summary) = outcome else {
            panic!("expected Done");
        };
        assert_eq!(summary.files_removed, 1);

        let ws = indexer.workspace();
        assert_eq!(ws.cache.store_len(), 1);
        assert!(ws.cache.file_hash(&b.to_string_lossy()).is_none());
        ws.cache.with_store(|store| {
            assert!(store.iter().all(|c| !c.file.ends_with("b.js")));
        });
    }

    #[tokio::test]
    async fn concurrent_index_all_skips() {
        let root = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        for i in 0..100 {
            write_file(
                root.path(),
                &format!("file_{i}.js"),
                &format!("export const value_{i} = {i};\n").repeat(40),
            );
        }

        let indexer = Arc::new(Indexer::new(test_workspace(root.path(), cache_dir.path())));
        let first = {
            let indexer = Arc::clone(&indexer);
            tokio::spawn(async move { indexer.index_all(true).await })
        };
        // Wait for the first call to claim the flag before racing it.
        let mut attempts = 0;
        while !indexer.is_indexing() && attempts < 1000 {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            attempts += 1;
        }
        let second = indexer.index_all(true).await.unwrap();
        let first = first.await.unwrap().unwrap();

        let outcomes = [first, second];
        let done = outcomes
            .iter()
            .filter(|o| matches!(o, IndexOutcome::Done(_)))
            .count();
        let skipped = outcomes.iter().any(|o| {
            matches!(o, IndexOutcome::Skipped { reason } if reason.contains("already in progress"))
        });
        assert_eq!(done, 1);
        assert!(skipped);
    }

    #[tokio::test]
    async fn empty_file_sets_hash_without_chunks() {
        let root = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        let empty = write_file(root.path(), "empty.js", "");

        let indexer = Arc::new(Indexer::new(test_workspace(root.path(), cache_dir.path())));
        indexer.index_all(false).await.unwrap();

        let ws = indexer.workspace();
        assert_eq!(ws.cache.store_len(), 0);
        assert!(ws.cache.file_hash(&empty.to_string_lossy()).is_some());
    }

    #[tokio::test]
    async fn oversize_file_is_skipped() {
        let root = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        let mut ws_template = test_workspace(root.path(), cache_dir.path());
        let mut config = (*ws_template.config).clone();
        config.max_file_size = 64;
        ws_template.config = Arc::new(config);

        write_file(root.path(), "small.js", "let a = 1;");
        write_file(root.path(), "big.js", &"x".repeat(100));

        let indexer = Arc::new(Indexer::new(ws_template));
        let IndexOutcome::Done(summary) = indexer.index_all(false).await.unwrap() else {
            panic!("expected Done");
        };
        assert_eq!(summary.files_indexed, 1);

        let ws = indexer.workspace();
        ws.cache.with_store(|store| {
            assert!(store.iter().all(|c| c.file.ends_with("small.js")));
        });
    }

    #[tokio::test]
    async fn progress_file_reaches_total() {
        let root = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        write_file(root.path(), "a.js", "export function greet(){return 'hi'}");
        write_file(root.path(), "b.js", "console.log('bye')");

        let indexer = Arc::new(Indexer::new(test_workspace(root.path(), cache_dir.path())));
        indexer.index_all(false).await.unwrap();

        let progress =
            crate::progress::ProgressWriter::read(&cache_dir.path().join("progress.json"))
                .unwrap();
        assert_eq!(progress.progress, 2);
        assert_eq!(progress.total, 2);
        assert!(progress.updated_at.is_some());
    }

    #[tokio::test]
    async fn workspace_switch_swaps_cache_and_rolls_back_nothing_on_success() {
        let root_a = TempDir::new().unwrap();
        let root_b = TempDir::new().unwrap();
        let cache_a = TempDir::new().unwrap();
        let cache_b = TempDir::new().unwrap();
        write_file(root_a.path(), "a.js", "let a = 1;");
        write_file(root_b.path(), "b.js", "let b = 2;");

        let indexer = Arc::new(Indexer::new(test_workspace(root_a.path(), cache_a.path())));
        indexer.index_all(false).await.unwrap();
        assert_eq!(indexer.workspace().cache.store_len(), 1);

        let next = test_workspace(root_b.path(), cache_b.path());
        Arc::clone(&indexer)
            .update_workspace_state(next, false)
            .await
            .unwrap();
        assert_eq!(indexer.workspace().cache.store_len(), 0);
        assert_eq!(
            indexer.workspace().config.search_directory,
            root_b.path().to_path_buf()
        );

        indexer.index_all(false).await.unwrap();
        assert_eq!(indexer.workspace().cache.store_len(), 1);
    }
}
