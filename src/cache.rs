//! Persistent per-workspace cache: vector store, file-hash map, call graph,
//! and the ANN index, with atomic multi-artifact saves.
//!
//! Concurrency discipline:
//! - `is_saving` excludes structural mutation for the duration of a save;
//! - the reader counter (`start_read`/`end_read`) blocks saves and mutators
//!   while a multi-step read session is open;
//! - `is_clearing` is exclusive with both indexing and saving;
//! - ANN rebuilds are serialized by the `ann_loading` sentinel and queries
//!   return `None` while the index is unavailable.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::ann::{self, AnnBackend, AnnMeta, AnnParams};
use crate::callgraph::CallGraph;
use crate::config::{Config, VectorStoreFormat, SAVE_TIMEOUT_SECS};
use crate::error::{EngineError, EngineResult};
use crate::store::{self, StoreTelemetry, TEMP_GRACE};

pub use crate::store::CachePaths;

/// Cache format version; bumped on incompatible layout changes.
pub const CACHE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheMeta {
    pub version: u32,
    pub embedding_model: String,
    pub dim: u32,
    pub last_save_time: Option<DateTime<Utc>>,
    pub last_index_started_at: Option<DateTime<Utc>>,
    pub last_index_ended_at: Option<DateTime<Utc>>,
    pub files_indexed: usize,
    pub chunks_stored: usize,
    /// "initial" or "incremental".
    pub last_index_mode: Option<String>,
    pub index_duration_ms: Option<u64>,
}

impl Default for CacheMeta {
    fn default() -> Self {
        Self {
            version: CACHE_VERSION,
            embedding_model: String::new(),
            dim: 0,
            last_save_time: None,
            last_index_started_at: None,
            last_index_ended_at: None,
            files_indexed: 0,
            chunks_stored: 0,
            last_index_mode: None,
            index_duration_ms: None,
        }
    }
}

/// One embedded chunk, addressed by its position in the ordered store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredChunk {
    pub file: String,
    pub start_line: u32,
    pub end_line: u32,
    pub content: String,
    pub token_count: u32,
    pub vector: Vec<f32>,
}

/// Serialized form of a chunk. In binary mode the vector lives in
/// `vectors.bin` and this record omits it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChunkRecord {
    file: String,
    start_line: u32,
    end_line: u32,
    content: String,
    token_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    vector: Option<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub embedding_model: String,
    pub vector_store_format: VectorStoreFormat,
    /// When false, the cache is memory-only: load and save are no-ops.
    pub enable_cache: bool,
    pub ann_enabled: bool,
    pub ann_min_chunks: usize,
    pub ann_index_cache: bool,
    pub ann_params: AnnParams,
}

impl CacheSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            embedding_model: config.embedding_model.clone(),
            vector_store_format: config.vector_store_format,
            enable_cache: config.enable_cache,
            ann_enabled: config.ann_enabled,
            ann_min_chunks: config.ann_min_chunks,
            ann_index_cache: config.ann_index_cache,
            ann_params: AnnParams::from_config(config),
        }
    }
}

#[derive(Default)]
struct CacheData {
    store: Vec<StoredChunk>,
    file_hashes: HashMap<String, String>,
    call_graph: CallGraph,
    meta: CacheMeta,
}

struct AnnState {
    backend: Option<Box<dyn AnnBackend>>,
    dirty: bool,
    ef_search: usize,
}

pub type AnnFactory =
    Box<dyn Fn(usize, AnnParams) -> EngineResult<Box<dyn AnnBackend>> + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnStats {
    pub enabled: bool,
    pub eligible: bool,
    pub built: bool,
    pub dirty: bool,
    pub indexed_vectors: usize,
    pub store_size: usize,
    pub min_chunks: usize,
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

pub struct Cache {
    paths: CachePaths,
    compat_dirs: Vec<PathBuf>,
    settings: CacheSettings,
    ann_factory: AnnFactory,
    data: RwLock<CacheData>,
    ann: Mutex<AnnState>,
    telemetry: Mutex<StoreTelemetry>,
    load_lock: tokio::sync::Mutex<()>,
    loaded: AtomicBool,
    is_saving: AtomicBool,
    is_clearing: AtomicBool,
    is_indexing: AtomicBool,
    ann_loading: AtomicBool,
    readers: AtomicUsize,
}

/// RAII handle for a multi-step read session. Structural mutation and saves
/// wait until every open session ends.
pub struct ReadGuard<'a> {
    cache: &'a Cache,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.cache.readers.fetch_sub(1, Ordering::AcqRel);
    }
}

struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Cache {
    pub fn new(paths: CachePaths, compat_dirs: Vec<PathBuf>, settings: CacheSettings) -> Self {
        Self::with_ann_factory(
            paths,
            compat_dirs,
            settings,
            Box::new(|dim, params| ann::new_backend(dim, params)),
        )
    }

    pub fn with_ann_factory(
        paths: CachePaths,
        compat_dirs: Vec<PathBuf>,
        settings: CacheSettings,
        ann_factory: AnnFactory,
    ) -> Self {
        let ef_search = settings.ann_params.ef_search;
        Self {
            paths,
            compat_dirs,
            settings,
            ann_factory,
            data: RwLock::new(CacheData::default()),
            ann: Mutex::new(AnnState {
                backend: None,
                dirty: false,
                ef_search,
            }),
            telemetry: Mutex::new(StoreTelemetry::default()),
            load_lock: tokio::sync::Mutex::new(()),
            loaded: AtomicBool::new(false),
            is_saving: AtomicBool::new(false),
            is_clearing: AtomicBool::new(false),
            is_indexing: AtomicBool::new(false),
            ann_loading: AtomicBool::new(false),
            readers: AtomicUsize::new(0),
        }
    }

    pub fn paths(&self) -> &CachePaths {
        &self.paths
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn is_saving(&self) -> bool {
        self.is_saving.load(Ordering::Acquire)
    }

    pub fn set_indexing(&self, active: bool) {
        self.is_indexing.store(active, Ordering::Release);
    }

    pub fn is_indexing(&self) -> bool {
        self.is_indexing.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // Read access
    // -----------------------------------------------------------------------

    pub fn start_read(&self) -> ReadGuard<'_> {
        self.readers.fetch_add(1, Ordering::AcqRel);
        ReadGuard { cache: self }
    }

    pub fn store_len(&self) -> usize {
        self.data.read().store.len()
    }

    /// Run `f` over the ordered chunk sequence under the read lock.
    pub fn with_store<R>(&self, f: impl FnOnce(&[StoredChunk]) -> R) -> R {
        f(&self.data.read().store)
    }

    pub fn file_hash(&self, file: &str) -> Option<String> {
        self.data.read().file_hashes.get(file).cloned()
    }

    pub fn file_hashes_snapshot(&self) -> HashMap<String, String> {
        self.data.read().file_hashes.clone()
    }

    pub fn call_graph_snapshot(&self) -> CallGraph {
        self.data.read().call_graph.clone()
    }

    pub fn meta_snapshot(&self) -> CacheMeta {
        self.data.read().meta.clone()
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Wait until structural mutation is permitted: no save running and no
    /// open read session. Bounded by the save deadline.
    async fn begin_mutation(&self) -> EngineResult<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(SAVE_TIMEOUT_SECS);
        loop {
            if self.is_clearing.load(Ordering::Acquire) {
                return Err(EngineError::Cancelled);
            }
            if !self.is_saving.load(Ordering::Acquire) && self.readers.load(Ordering::Acquire) == 0
            {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::SaveInProgress);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    /// Append chunks for `file` at the end of the store. Appends keep ANN
    /// positions valid, so the index is extended in place when possible.
    pub async fn add_chunks(&self, chunks: Vec<StoredChunk>) -> EngineResult<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        self.begin_mutation().await?;
        let mut data = self.data.write();
        let base = data.store.len();
        data.store.extend(chunks.iter().cloned());
        if data.meta.dim == 0 {
            if let Some(first) = chunks.first() {
                data.meta.dim = first.vector.len() as u32;
            }
        }
        drop(data);

        let mut ann = self.ann.lock();
        let already_dirty = ann.dirty;
        if let Some(backend) = ann.backend.as_mut() {
            if !already_dirty {
                let mut became_dirty = false;
                for (offset, chunk) in chunks.iter().enumerate() {
                    if backend
                        .add_point((base + offset) as u64, &chunk.vector)
                        .is_err()
                    {
                        became_dirty = true;
                        break;
                    }
                }
                if became_dirty {
                    ann.dirty = true;
                }
            }
        }
        Ok(())
    }

    /// Remove every chunk belonging to `file`. Removal shifts positions, so
    /// the ANN index is invalidated.
    pub async fn remove_chunks_for_file(&self, file: &str) -> EngineResult<usize> {
        self.begin_mutation().await?;
        let mut data = self.data.write();
        let before = data.store.len();
        data.store.retain(|c| c.file != file);
        let removed = before - data.store.len();
        drop(data);

        if removed > 0 {
            self.ann.lock().dirty = true;
        }
        Ok(removed)
    }

    pub async fn set_file_hash(&self, file: &str, hash: &str) -> EngineResult<()> {
        self.begin_mutation().await?;
        self.data
            .write()
            .file_hashes
            .insert(file.to_string(), hash.to_string());
        Ok(())
    }

    pub async fn delete_file_hash(&self, file: &str) -> EngineResult<()> {
        self.begin_mutation().await?;
        self.data.write().file_hashes.remove(file);
        Ok(())
    }

    pub async fn set_file_edges(
        &self,
        file: &str,
        targets: std::collections::BTreeSet<String>,
    ) -> EngineResult<()> {
        self.begin_mutation().await?;
        self.data.write().call_graph.set_file_edges(file, targets);
        Ok(())
    }

    pub async fn remove_file_edges(&self, file: &str) -> EngineResult<()> {
        self.begin_mutation().await?;
        self.data.write().call_graph.remove_file(file);
        Ok(())
    }

    pub fn record_index_run(
        &self,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        mode: &str,
        duration_ms: u64,
    ) {
        let mut data = self.data.write();
        data.meta.last_index_started_at = Some(started_at);
        data.meta.last_index_ended_at = Some(ended_at.max(started_at));
        data.meta.last_index_mode = Some(mode.to_string());
        data.meta.index_duration_ms = Some(duration_ms);
    }

    // -----------------------------------------------------------------------
    // Load
    // -----------------------------------------------------------------------

    /// Load cache artifacts from disk. Idempotent; concurrent callers
    /// collapse onto one pass. Invariant violations reset the in-memory
    /// state to empty and leave the on-disk files for the next save to
    /// overwrite.
    pub async fn load(&self) -> EngineResult<()> {
        if !self.settings.enable_cache {
            self.loaded.store(true, Ordering::Release);
            return Ok(());
        }
        if self.loaded.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.load_lock.lock().await;
        if self.loaded.load(Ordering::Acquire) {
            return Ok(());
        }

        self.paths.ensure_dir()?;
        {
            let mut telemetry = self.telemetry.lock();
            *telemetry = StoreTelemetry::load(&self.paths.telemetry());
            store::sweep_stale_temps(self.paths.dir(), TEMP_GRACE, &mut telemetry);
            telemetry.persist(&self.paths.telemetry());
        }

        let load_dir = self.effective_load_dir();
        let Some(load_dir) = load_dir else {
            debug!("No existing cache artifacts, starting empty");
            self.loaded.store(true, Ordering::Release);
            return Ok(());
        };

        let loaded = {
            let dir = load_dir.clone();
            let settings = self.settings.clone();
            tokio::task::spawn_blocking(move || read_cache_data(&dir, &settings))
                .await
                .map_err(|_| EngineError::Cancelled)?
        };

        match loaded {
            Ok(data) => {
                info!(
                    chunks = data.store.len(),
                    files = data.file_hashes.len(),
                    dir = %load_dir.display(),
                    "Cache loaded"
                );
                *self.data.write() = data;
                self.try_load_ann(&load_dir);
            }
            Err(e) => {
                warn!(kind = e.kind(), error = %e, "Cache load failed; resetting in-memory state");
                *self.data.write() = CacheData::default();
                let mut telemetry = self.telemetry.lock();
                telemetry.corruption_auto_clears += 1;
                telemetry.persist(&self.paths.telemetry());
            }
        }

        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    /// The directory actually read at load time: the canonical cache dir if
    /// it holds a meta file, else the first compatibility-key dir that does.
    /// Compat dirs are never written; the next save lands canonically.
    fn effective_load_dir(&self) -> Option<PathBuf> {
        if self.paths.meta().is_file() {
            return Some(self.paths.dir().to_path_buf());
        }
        for compat in &self.compat_dirs {
            if compat.join("meta.json").is_file() {
                info!(dir = %compat.display(), "Reading legacy cache location; will migrate on next save");
                return Some(compat.clone());
            }
        }
        None
    }

    fn try_load_ann(&self, load_dir: &std::path::Path) {
        if !self.settings.ann_enabled || !self.settings.ann_index_cache {
            return;
        }
        let ann_index = load_dir.join("ann-index.bin");
        let ann_meta_path = load_dir.join("ann-meta.json");
        if !ann_index.is_file() {
            return;
        }

        let (dim, count) = {
            let data = self.data.read();
            (data.meta.dim as usize, data.store.len())
        };
        if dim == 0 || count == 0 {
            return;
        }

        let expected = AnnMeta::current(
            &self.settings.embedding_model,
            dim,
            count,
            self.settings.ann_params,
        );
        let trusted = AnnMeta::load(&ann_meta_path)
            .map(|meta| meta.matches(&expected))
            .unwrap_or(false);
        if !trusted {
            debug!("Persisted ANN index does not match store; will rebuild lazily");
            self.ann.lock().dirty = true;
            return;
        }

        match (self.ann_factory)(dim, self.settings.ann_params) {
            Ok(mut backend) => match backend.load(&ann_index) {
                Ok(()) if backend.len() == count => {
                    let mut ann = self.ann.lock();
                    backend.set_ef_search(ann.ef_search);
                    ann.backend = Some(backend);
                    ann.dirty = false;
                    info!(count, "ANN index loaded from disk");
                }
                Ok(()) => {
                    warn!("ANN index size disagrees with store; will rebuild lazily");
                    self.ann.lock().dirty = true;
                }
                Err(e) => {
                    warn!(error = %e, "ANN index load failed; will rebuild lazily");
                    self.ann.lock().dirty = true;
                }
            },
            Err(e) => warn!(error = %e, "ANN backend unavailable"),
        }
    }

    // -----------------------------------------------------------------------
    // Save
    // -----------------------------------------------------------------------

    /// Atomically persist every artifact. With `throw_on_error` the first
    /// failure propagates; otherwise it is logged and the next periodic
    /// save retries.
    pub async fn save(&self, throw_on_error: bool) -> EngineResult<()> {
        match self.save_inner().await {
            Ok(()) => Ok(()),
            Err(e) if throw_on_error => Err(e),
            Err(e) => {
                warn!(kind = e.kind(), error = %e, "Cache save failed; will retry on next save");
                Ok(())
            }
        }
    }

    async fn save_inner(&self) -> EngineResult<()> {
        if !self.settings.enable_cache {
            return Ok(());
        }
        if self.is_clearing.load(Ordering::Acquire) {
            return Err(EngineError::Cancelled);
        }
        if self
            .is_saving
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::SaveInProgress);
        }
        let _saving = FlagGuard(&self.is_saving);

        // Saves wait for open read sessions, bounded by the save deadline.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(SAVE_TIMEOUT_SECS);
        while self.readers.load(Ordering::Acquire) > 0 {
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::Cancelled);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        self.paths.ensure_dir()?;

        let now = Utc::now();
        let (meta, artifacts) = {
            let mut data = self.data.write();
            data.meta.version = CACHE_VERSION;
            data.meta.embedding_model = self.settings.embedding_model.clone();
            data.meta.chunks_stored = data.store.len();
            data.meta.files_indexed = data.file_hashes.len();
            data.meta.last_save_time = Some(now);
            if let Some(first) = data.store.first() {
                data.meta.dim = first.vector.len() as u32;
            }
            let meta = data.meta.clone();
            let artifacts = build_artifacts(&self.paths, &data, &self.settings)?;
            (meta, artifacts)
        };

        let telemetry_path = self.paths.telemetry();
        let mut telemetry = self.telemetry.lock().clone();
        let (result, telemetry) = tokio::task::spawn_blocking(move || {
            let result = store::atomic_replace_many(artifacts, &mut telemetry);
            telemetry.persist(&telemetry_path);
            (result, telemetry)
        })
        .await
        .map_err(|_| EngineError::Cancelled)?;
        *self.telemetry.lock() = telemetry;
        result?;

        // The two vector formats never coexist after a successful save.
        if self.settings.vector_store_format == VectorStoreFormat::Json {
            let _ = std::fs::remove_file(self.paths.vectors_bin());
        }

        if let Err(e) = self.persist_ann() {
            warn!(error = %e, "ANN persistence failed");
        }

        debug!(
            chunks = meta.chunks_stored,
            files = meta.files_indexed,
            "Cache saved"
        );
        Ok(())
    }

    fn persist_ann(&self) -> EngineResult<()> {
        if !self.settings.ann_index_cache {
            return Ok(());
        }
        let ann = self.ann.lock();
        let index_path = self.paths.ann_index();
        let meta_path = self.paths.ann_meta();
        match ann.backend.as_ref() {
            Some(backend) if !ann.dirty => {
                let tmp = index_path.with_extension("bin.tmp.ann");
                backend.save(&tmp)?;
                std::fs::rename(&tmp, &index_path).map_err(EngineError::Io)?;
                let (dim, count) = {
                    let data = self.data.read();
                    (data.meta.dim as usize, data.store.len())
                };
                let meta = AnnMeta::current(
                    &self.settings.embedding_model,
                    dim,
                    count,
                    self.settings.ann_params,
                );
                let mut telemetry = self.telemetry.lock();
                store::atomic_replace_json(&meta_path, &meta, &mut telemetry)?;
                telemetry.persist(&self.paths.telemetry());
                Ok(())
            }
            _ => {
                // A dirty or absent index must not be trusted on the next
                // start.
                let _ = std::fs::remove_file(&index_path);
                let _ = std::fs::remove_file(&meta_path);
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Clear
    // -----------------------------------------------------------------------

    /// Drop all in-memory state and remove cache artifacts. Rejected while
    /// indexing or saving.
    pub fn clear(&self) -> EngineResult<()> {
        if self.is_indexing.load(Ordering::Acquire) {
            return Err(EngineError::IndexInProgress);
        }
        if self.is_saving.load(Ordering::Acquire) {
            return Err(EngineError::SaveInProgress);
        }
        if self
            .is_clearing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::Cancelled);
        }
        let _clearing = FlagGuard(&self.is_clearing);

        *self.data.write() = CacheData::default();
        {
            let mut ann = self.ann.lock();
            ann.backend = None;
            ann.dirty = false;
        }

        for path in [
            self.paths.meta(),
            self.paths.embeddings(),
            self.paths.vectors_bin(),
            self.paths.file_hashes(),
            self.paths.call_graph(),
            self.paths.ann_index(),
            self.paths.ann_meta(),
            self.paths.progress(),
        ] {
            let _ = std::fs::remove_file(path);
        }
        info!("Cache cleared");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // ANN
    // -----------------------------------------------------------------------

    /// Candidate chunk positions for `vector`, or `None` when the ANN index
    /// is unavailable, dirty, rebuilding, or the store is below the
    /// eligibility threshold.
    pub fn query_ann(&self, vector: &[f32], k: usize) -> Option<Vec<(usize, f32)>> {
        if !self.settings.ann_enabled || k == 0 {
            return None;
        }
        if self.ann_loading.load(Ordering::Acquire) {
            return None;
        }
        let store_len = self.store_len();
        if store_len < self.settings.ann_min_chunks {
            return None;
        }
        let ann = self.ann.lock();
        let backend = ann.backend.as_ref()?;
        if ann.dirty {
            return None;
        }
        match backend.search_knn(vector, k) {
            Ok(matches) => Some(ann::sanitize_matches(matches, store_len, k)),
            Err(e) => {
                debug!(error = %e, "ANN query failed");
                None
            }
        }
    }

    /// Build the ANN index if it is missing or dirty and the store is
    /// eligible. Rebuilds are serialized; a second caller returns
    /// immediately while the first builds.
    pub async fn ensure_ann_index(&self) -> EngineResult<()> {
        if !self.settings.ann_enabled {
            return Ok(());
        }
        if self.store_len() < self.settings.ann_min_chunks {
            return Ok(());
        }
        {
            let ann = self.ann.lock();
            if ann.backend.is_some() && !ann.dirty {
                return Ok(());
            }
        }
        if self
            .ann_loading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        let _loading = FlagGuard(&self.ann_loading);

        let (vectors, dim) = {
            let data = self.data.read();
            let dim = data.meta.dim as usize;
            (
                data.store.iter().map(|c| c.vector.clone()).collect::<Vec<_>>(),
                dim,
            )
        };
        if dim == 0 || vectors.is_empty() {
            return Ok(());
        }

        let params = self.settings.ann_params;
        let ef_search = self.ann.lock().ef_search;
        let mut backend = (self.ann_factory)(dim, params)?;
        backend.set_ef_search(ef_search);

        let count = vectors.len();
        let built = tokio::task::spawn_blocking(move || {
            backend.build(&vectors).map(|_| backend)
        })
        .await
        .map_err(|_| EngineError::Cancelled)??;

        let mut ann = self.ann.lock();
        ann.backend = Some(built);
        ann.dirty = false;
        info!(count, "ANN index built");
        Ok(())
    }

    pub fn invalidate_ann_index(&self) {
        self.ann.lock().dirty = true;
    }

    pub fn set_ef_search(&self, ef: usize) {
        let mut ann = self.ann.lock();
        ann.ef_search = ef;
        if let Some(backend) = ann.backend.as_mut() {
            backend.set_ef_search(ef);
        }
    }

    pub fn ann_stats(&self) -> AnnStats {
        let store_len = self.store_len();
        let ann = self.ann.lock();
        AnnStats {
            enabled: self.settings.ann_enabled,
            eligible: store_len >= self.settings.ann_min_chunks,
            built: ann.backend.is_some(),
            dirty: ann.dirty,
            indexed_vectors: ann.backend.as_ref().map(|b| b.len()).unwrap_or(0),
            store_size: store_len,
            min_chunks: self.settings.ann_min_chunks,
            m: self.settings.ann_params.m,
            ef_construction: self.settings.ann_params.ef_construction,
            ef_search: ann.ef_search,
        }
    }
}

// ---------------------------------------------------------------------------
// Artifact serialization
// ---------------------------------------------------------------------------

fn build_artifacts(
    paths: &CachePaths,
    data: &CacheData,
    settings: &CacheSettings,
) -> EngineResult<Vec<(PathBuf, Vec<u8>)>> {
    let mut artifacts = Vec::with_capacity(5);

    artifacts.push((
        paths.meta(),
        serde_json::to_string_pretty(&data.meta)?.into_bytes(),
    ));

    let records: Vec<ChunkRecord> = data
        .store
        .iter()
        .map(|chunk| ChunkRecord {
            file: chunk.file.clone(),
            start_line: chunk.start_line,
            end_line: chunk.end_line,
            content: chunk.content.clone(),
            token_count: chunk.token_count,
            vector: match settings.vector_store_format {
                VectorStoreFormat::Json => Some(chunk.vector.clone()),
                VectorStoreFormat::Binary => None,
            },
        })
        .collect();
    artifacts.push((
        paths.embeddings(),
        serde_json::to_string_pretty(&records)?.into_bytes(),
    ));

    if settings.vector_store_format == VectorStoreFormat::Binary {
        let vectors: Vec<Vec<f32>> = data.store.iter().map(|c| c.vector.clone()).collect();
        artifacts.push((
            paths.vectors_bin(),
            store::encode_vectors(data.meta.dim, &vectors)?,
        ));
    }

    artifacts.push((
        paths.file_hashes(),
        serde_json::to_string_pretty(&data.file_hashes)?.into_bytes(),
    ));
    artifacts.push((
        paths.call_graph(),
        serde_json::to_string_pretty(&data.call_graph)?.into_bytes(),
    ));

    Ok(artifacts)
}

fn read_cache_data(dir: &std::path::Path, settings: &CacheSettings) -> EngineResult<CacheData> {
    let meta_raw = std::fs::read_to_string(dir.join("meta.json"))
        .map_err(|e| EngineError::CacheCorrupt(format!("meta.json unreadable: {e}")))?;
    let meta: CacheMeta = serde_json::from_str(&meta_raw)
        .map_err(|e| EngineError::CacheCorrupt(format!("meta.json invalid: {e}")))?;

    if meta.version != CACHE_VERSION {
        return Err(EngineError::CacheVersionMismatch {
            found: meta.version,
            expected: CACHE_VERSION,
        });
    }
    if meta.embedding_model != settings.embedding_model {
        return Err(EngineError::ModelMismatch {
            cached: meta.embedding_model,
            configured: settings.embedding_model.clone(),
        });
    }
    if let (Some(started), Some(ended)) = (meta.last_index_started_at, meta.last_index_ended_at) {
        if ended < started {
            return Err(EngineError::CacheCorrupt(
                "index timestamps out of order".into(),
            ));
        }
    }

    let embeddings_path = dir.join("embeddings.json");
    let records: Vec<ChunkRecord> = if embeddings_path.is_file() {
        let raw = std::fs::read_to_string(&embeddings_path)
            .map_err(|e| EngineError::CacheCorrupt(format!("embeddings.json unreadable: {e}")))?;
        serde_json::from_str(&raw)
            .map_err(|e| EngineError::CacheCorrupt(format!("embeddings.json invalid: {e}")))?
    } else if meta.chunks_stored == 0 {
        Vec::new()
    } else {
        return Err(EngineError::CacheCorrupt("embeddings.json missing".into()));
    };

    if records.len() != meta.chunks_stored {
        return Err(EngineError::CacheCorrupt(format!(
            "store length {} disagrees with meta.chunksStored {}",
            records.len(),
            meta.chunks_stored
        )));
    }

    let needs_binary = records.iter().any(|r| r.vector.is_none());
    let binary_vectors = if needs_binary {
        let bytes = std::fs::read(dir.join("vectors.bin"))
            .map_err(|e| EngineError::CacheCorrupt(format!("vectors.bin unreadable: {e}")))?;
        let (dim, vectors) = store::decode_vectors(&bytes)?;
        if dim != meta.dim {
            return Err(EngineError::CacheCorrupt(format!(
                "vectors.bin dim {dim} disagrees with meta.dim {}",
                meta.dim
            )));
        }
        if vectors.len() != records.len() {
            return Err(EngineError::CacheCorrupt(format!(
                "vectors.bin count {} disagrees with store length {}",
                vectors.len(),
                records.len()
            )));
        }
        Some(vectors)
    } else {
        None
    };

    let mut chunks = Vec::with_capacity(records.len());
    for (index, record) in records.into_iter().enumerate() {
        let vector = match record.vector {
            Some(v) => v,
            None => binary_vectors
                .as_ref()
                .and_then(|vs| vs.get(index))
                .cloned()
                .ok_or_else(|| EngineError::CacheCorrupt("vector missing for chunk".into()))?,
        };
        if vector.len() != meta.dim as usize {
            return Err(EngineError::CacheCorrupt(format!(
                "chunk {index} vector dim {} disagrees with meta.dim {}",
                vector.len(),
                meta.dim
            )));
        }
        chunks.push(StoredChunk {
            file: record.file,
            start_line: record.start_line,
            end_line: record.end_line,
            content: record.content,
            token_count: record.token_count,
            vector,
        });
    }

    let file_hashes: HashMap<String, String> = std::fs::read_to_string(dir.join("file-hashes.json"))
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();

    // Every chunk's file must carry a hash entry; anything else means the
    // artifacts were written out of step.
    for chunk in &chunks {
        if !file_hashes.contains_key(&chunk.file) {
            return Err(EngineError::CacheCorrupt(format!(
                "chunk file {} has no hash entry",
                chunk.file
            )));
        }
    }

    let call_graph: CallGraph = std::fs::read_to_string(dir.join("call-graph.json"))
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();

    Ok(CacheData {
        store: chunks,
        file_hashes,
        call_graph,
        meta,
    })
}
