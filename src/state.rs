//! Engine wiring: builds the workspace bundle (config snapshot, cache,
//! worker pool, embedder), owns the workspace lock, and handles workspace
//! switching and graceful shutdown.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::cache::{Cache, CachePaths, CacheSettings};
use crate::config::{Config, EMBED_BATCH_TIMEOUT_SECS};
use crate::embedder::{FastTextEmbedder, TextEmbedder};
use crate::error::{EngineError, EngineResult};
use crate::hasher;
use crate::indexer::{IndexOutcome, Indexer, Workspace};
use crate::lock::WorkspaceLock;
use crate::subprocess::SubprocessEmbedder;
use crate::worker_pool::{EmbedderFactory, WorkerPool};

pub struct Engine {
    pub indexer: Arc<Indexer>,
    lock: Mutex<Option<WorkspaceLock>>,
}

/// Compatibility cache directories probed read-only at load time.
fn compat_cache_dirs(config: &Config) -> Vec<PathBuf> {
    if config.cache_directory.is_some() {
        return Vec::new();
    }
    let root = dirs::cache_dir().unwrap_or_else(|| PathBuf::from(".heuristic-cache"));
    hasher::compat_workspace_keys(&config.search_directory)
        .into_iter()
        .map(|key| root.join("heuristic-mcp").join(key))
        .collect()
}

/// Build the full workspace bundle for a config snapshot.
pub fn build_workspace(config: Arc<Config>) -> EngineResult<Workspace> {
    let cache_dir = config.resolve_cache_dir();
    let cache = Arc::new(Cache::new(
        CachePaths::new(cache_dir),
        compat_cache_dirs(&config),
        CacheSettings::from_config(&config),
    ));

    let main_embedder = Arc::new(FastTextEmbedder::new(config.embedding_model.clone()));
    if config.preload_embedding_model {
        main_embedder.preload();
    }
    let embedder: Arc<dyn TextEmbedder> = main_embedder;

    let worker_count = config.worker_threads.resolve();
    let factory: EmbedderFactory = if config.embedding_process_per_batch {
        let model = config.embedding_model.clone();
        Arc::new(move || {
            Arc::new(SubprocessEmbedder::new(
                model.clone(),
                Duration::from_secs(EMBED_BATCH_TIMEOUT_SECS),
            )) as Arc<dyn TextEmbedder>
        })
    } else {
        let model = config.embedding_model.clone();
        Arc::new(move || Arc::new(FastTextEmbedder::new(model.clone())) as Arc<dyn TextEmbedder>)
    };
    let pool = Arc::new(WorkerPool::new(worker_count, factory, Arc::clone(&embedder)));

    Ok(Workspace {
        config,
        cache,
        pool,
        embedder,
    })
}

impl Engine {
    /// Construct the engine for `workspace_root`: load config, acquire the
    /// workspace lock, load the cache, and start the watcher if enabled.
    pub async fn new(workspace_root: &Path) -> EngineResult<Arc<Self>> {
        let root = hasher::canonicalize_workspace(workspace_root);
        let config = Arc::new(Config::load(&root)?);
        let workspace = build_workspace(Arc::clone(&config))?;

        let lock = WorkspaceLock::acquire(workspace.cache.paths().dir(), &root)?;
        workspace.cache.load().await?;

        let indexer = Arc::new(Indexer::new(workspace));
        if config.watch_files {
            Arc::clone(&indexer).setup_file_watcher()?;
        }

        info!(workspace = %root.display(), "Engine ready");
        Ok(Arc::new(Self {
            indexer,
            lock: Mutex::new(Some(lock)),
        }))
    }

    /// Switch to another workspace. Builds a fresh config snapshot and
    /// cache, re-locks, and optionally kicks off a background reindex.
    pub async fn set_workspace(
        &self,
        workspace_path: &Path,
        reindex: bool,
    ) -> EngineResult<String> {
        let root = hasher::canonicalize_workspace(workspace_path);
        if !root.is_dir() {
            return Err(EngineError::ConfigInvalid(format!(
                "workspace path does not exist: {}",
                workspace_path.display()
            )));
        }

        let config = Arc::new(Config::load(&root)?);
        let next = build_workspace(Arc::clone(&config))?;
        let next_lock = WorkspaceLock::acquire(next.cache.paths().dir(), &root)?;

        let watch = config.watch_files;
        match Arc::clone(&self.indexer)
            .update_workspace_state(next, watch)
            .await
        {
            Ok(()) => {
                // The old lock releases only after the switch commits.
                *self.lock.lock() = Some(next_lock);
            }
            Err(e) => {
                drop(next_lock);
                return Err(e);
            }
        }

        if reindex {
            let indexer = Arc::clone(&self.indexer);
            tokio::spawn(async move {
                match indexer.index_all(true).await {
                    Ok(IndexOutcome::Done(summary)) => {
                        info!(files = summary.files_indexed, "Reindex after switch complete")
                    }
                    Ok(IndexOutcome::Skipped { reason }) => {
                        warn!(reason = %reason, "Reindex after switch skipped")
                    }
                    Err(e) => warn!(error = %e, "Reindex after switch failed"),
                }
            });
        }

        Ok(format!("Workspace set to {}", root.display()))
    }

    /// Graceful drain: watcher, workers, final save, lock release.
    pub async fn shutdown(&self) {
        self.indexer.shutdown().await;
        if let Some(mut lock) = self.lock.lock().take() {
            lock.release();
        }
        info!("Engine shut down");
    }
}
