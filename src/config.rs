use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{EngineError, EngineResult};

/// Prefix for environment variable overrides, e.g. `HEURISTIC_MCP_BATCH_SIZE`.
pub const ENV_PREFIX: &str = "HEURISTIC_MCP_";

/// Maximum allowed length for search queries (characters).
pub const MAX_SEARCH_QUERY_LENGTH: usize = 1000;

/// Stores larger than this are never exact-scanned as an ANN fallback.
pub const MAX_FULL_SCAN_SIZE: usize = 5000;

/// Default per-batch embedding deadline.
pub const EMBED_BATCH_TIMEOUT_SECS: u64 = 120;

/// Deadline for a save waiting on active readers.
pub const SAVE_TIMEOUT_SECS: u64 = 30;

/// File watcher debounce window.
pub const WATCHER_DEBOUNCE_MS: u64 = 200;

/// Canonical list of file extensions considered indexable and embeddable.
/// Discovery and the watcher both use this single list so they never diverge.
pub const DEFAULT_EXTENSIONS: &[&str] = &[
    // JavaScript / TypeScript
    "ts", "tsx", "js", "jsx", "mjs", "cjs",
    // Systems / compiled
    "rs", "py", "go", "java", "c", "cpp", "h", "hpp", "cs", "rb", "php", "swift", "kt", "scala",
    // Web
    "html", "css", "scss", "less",
    // Data / config
    "json", "yaml", "yml", "toml", "xml",
    // Documentation
    "md", "mdx", "txt", "rst",
    // Query / schema
    "sql", "graphql", "gql",
    // Shell
    "sh", "bash", "zsh", "ps1",
    // Frontend frameworks
    "vue", "svelte", "astro",
    // Misc languages
    "lua", "zig", "dart", "ex", "exs",
];

/// Directory-name globs excluded from discovery in addition to gitignore rules.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "**/node_modules/**",
    "**/.git/**",
    "**/target/**",
    "**/dist/**",
    "**/build/**",
    "**/out/**",
    "**/__pycache__/**",
    "**/.next/**",
    "**/coverage/**",
    "**/vendor/**",
    "**/.cache/**",
];

/// Worker pool sizing: `auto` resolves at pool construction to
/// `min(cores - 1, 4)`; an explicit `0` disables workers entirely and routes
/// embedding through the main-thread embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerThreads {
    Auto,
    Count(u32),
}

impl WorkerThreads {
    pub fn resolve(&self) -> usize {
        match self {
            WorkerThreads::Auto => {
                let cores = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(2);
                cores.saturating_sub(1).clamp(1, 4)
            }
            WorkerThreads::Count(n) => *n as usize,
        }
    }
}

impl Serialize for WorkerThreads {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            WorkerThreads::Auto => serializer.serialize_str("auto"),
            WorkerThreads::Count(n) => serializer.serialize_u32(*n),
        }
    }
}

impl<'de> Deserialize<'de> for WorkerThreads {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::String(s) if s.eq_ignore_ascii_case("auto") => {
                Ok(WorkerThreads::Auto)
            }
            serde_json::Value::Number(n) => {
                let n = n
                    .as_u64()
                    .ok_or_else(|| D::Error::custom("workerThreads must be a non-negative integer"))?;
                Ok(WorkerThreads::Count(n as u32))
            }
            other => Err(D::Error::custom(format!(
                "workerThreads must be \"auto\" or 0..=32, got {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorStoreFormat {
    Json,
    Binary,
}

/// Immutable configuration snapshot. Workspace switching builds a new
/// snapshot and swaps the `Arc`; in-flight operations keep their reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub search_directory: PathBuf,
    pub file_extensions: Vec<String>,
    pub exclude_patterns: Vec<String>,
    /// Model token budget per chunk; the chunker targets 0.85x of this.
    pub chunk_size: u32,
    /// Explicit overlap in tokens; 0 derives 0.18x of the target budget.
    pub chunk_overlap: u32,
    pub batch_size: usize,
    pub max_file_size: u64,
    pub max_results: usize,
    pub enable_cache: bool,
    /// Explicit cache directory; empty resolves to
    /// `<globalCache>/heuristic-mcp/<workspaceKey>`.
    pub cache_directory: Option<PathBuf>,
    pub watch_files: bool,
    pub verbose: bool,
    pub worker_threads: WorkerThreads,
    pub embedding_model: String,
    pub semantic_weight: f32,
    pub exact_match_boost: f32,
    pub recency_boost: f32,
    pub recency_decay_days: u32,
    pub smart_indexing: bool,
    pub call_graph_enabled: bool,
    pub call_graph_boost: f32,
    pub call_graph_max_hops: u32,
    pub ann_enabled: bool,
    pub ann_min_chunks: usize,
    pub ann_min_candidates: usize,
    pub ann_max_candidates: usize,
    pub ann_candidate_multiplier: f32,
    pub ann_ef_construction: usize,
    pub ann_ef_search: usize,
    pub ann_m: usize,
    pub ann_index_cache: bool,
    /// Locked to "cosine"; any other value is rejected at validation.
    pub ann_metric: String,
    pub preload_embedding_model: bool,
    pub unload_model_after_search: bool,
    pub embedding_process_per_batch: bool,
    pub vector_store_format: VectorStoreFormat,
    /// Periodic save cadence during indexing, in embedding batches.
    pub save_every_n: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            search_directory: PathBuf::from("."),
            file_extensions: DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            exclude_patterns: DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect(),
            chunk_size: 512,
            chunk_overlap: 0,
            batch_size: 100,
            max_file_size: 2 * 1024 * 1024,
            max_results: 10,
            enable_cache: true,
            cache_directory: None,
            watch_files: true,
            verbose: false,
            worker_threads: WorkerThreads::Auto,
            embedding_model: "Qwen/Qwen3-Embedding-0.6B".to_string(),
            semantic_weight: 0.7,
            exact_match_boost: 1.5,
            recency_boost: 0.05,
            recency_decay_days: 30,
            smart_indexing: true,
            call_graph_enabled: true,
            call_graph_boost: 0.05,
            call_graph_max_hops: 2,
            ann_enabled: true,
            ann_min_chunks: 5000,
            ann_min_candidates: 50,
            ann_max_candidates: 500,
            ann_candidate_multiplier: 8.0,
            ann_ef_construction: 128,
            ann_ef_search: 64,
            ann_m: 16,
            ann_index_cache: true,
            ann_metric: "cosine".to_string(),
            preload_embedding_model: false,
            unload_model_after_search: false,
            embedding_process_per_batch: false,
            vector_store_format: VectorStoreFormat::Binary,
            save_every_n: 5,
        }
    }
}

impl Config {
    /// Build a snapshot for a workspace: defaults, then an optional JSON
    /// config file in the workspace root, then environment overrides.
    pub fn load(workspace_root: &std::path::Path) -> EngineResult<Self> {
        let mut config = Config {
            search_directory: workspace_root.to_path_buf(),
            ..Config::default()
        };

        let config_path = workspace_root.join("heuristic-mcp.json");
        if config_path.is_file() {
            let raw = std::fs::read_to_string(&config_path)?;
            config = serde_json::from_str::<Config>(&raw).map_err(|e| {
                EngineError::ConfigInvalid(format!("{}: {e}", config_path.display()))
            })?;
            if config.search_directory.as_os_str().is_empty()
                || config.search_directory == PathBuf::from(".")
            {
                config.search_directory = workspace_root.to_path_buf();
            }
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `HEURISTIC_MCP_*` environment overrides. Unparseable values are
    /// ignored, matching the tolerant env handling used elsewhere.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_string("SEARCH_DIRECTORY") {
            self.search_directory = PathBuf::from(v);
        }
        if let Some(v) = env_list("FILE_EXTENSIONS") {
            self.file_extensions = v;
        }
        if let Some(v) = env_list("EXCLUDE_PATTERNS") {
            self.exclude_patterns = v;
        }
        if let Some(v) = env_parse("CHUNK_SIZE") {
            self.chunk_size = v;
        }
        if let Some(v) = env_parse("CHUNK_OVERLAP") {
            self.chunk_overlap = v;
        }
        if let Some(v) = env_parse("BATCH_SIZE") {
            self.batch_size = v;
        }
        if let Some(v) = env_parse("MAX_FILE_SIZE") {
            self.max_file_size = v;
        }
        if let Some(v) = env_parse("MAX_RESULTS") {
            self.max_results = v;
        }
        if let Some(v) = env_bool("ENABLE_CACHE") {
            self.enable_cache = v;
        }
        if let Some(v) = env_string("CACHE_DIRECTORY") {
            self.cache_directory = Some(PathBuf::from(v));
        }
        if let Some(v) = env_bool("WATCH_FILES") {
            self.watch_files = v;
        }
        if let Some(v) = env_bool("VERBOSE") {
            self.verbose = v;
        }
        if let Some(v) = env_string("WORKER_THREADS") {
            if v.eq_ignore_ascii_case("auto") {
                self.worker_threads = WorkerThreads::Auto;
            } else if let Ok(n) = v.parse::<u32>() {
                self.worker_threads = WorkerThreads::Count(n);
            }
        }
        if let Some(v) = env_string("EMBEDDING_MODEL") {
            self.embedding_model = v;
        }
        if let Some(v) = env_parse("SEMANTIC_WEIGHT") {
            self.semantic_weight = v;
        }
        if let Some(v) = env_parse("EXACT_MATCH_BOOST") {
            self.exact_match_boost = v;
        }
        if let Some(v) = env_parse("RECENCY_BOOST") {
            self.recency_boost = v;
        }
        if let Some(v) = env_parse("RECENCY_DECAY_DAYS") {
            self.recency_decay_days = v;
        }
        if let Some(v) = env_bool("SMART_INDEXING") {
            self.smart_indexing = v;
        }
        if let Some(v) = env_bool("CALL_GRAPH_ENABLED") {
            self.call_graph_enabled = v;
        }
        if let Some(v) = env_parse("CALL_GRAPH_BOOST") {
            self.call_graph_boost = v;
        }
        if let Some(v) = env_parse("CALL_GRAPH_MAX_HOPS") {
            self.call_graph_max_hops = v;
        }
        if let Some(v) = env_bool("ANN_ENABLED") {
            self.ann_enabled = v;
        }
        if let Some(v) = env_parse("ANN_MIN_CHUNKS") {
            self.ann_min_chunks = v;
        }
        if let Some(v) = env_parse("ANN_MIN_CANDIDATES") {
            self.ann_min_candidates = v;
        }
        if let Some(v) = env_parse("ANN_MAX_CANDIDATES") {
            self.ann_max_candidates = v;
        }
        if let Some(v) = env_parse("ANN_CANDIDATE_MULTIPLIER") {
            self.ann_candidate_multiplier = v;
        }
        if let Some(v) = env_parse("ANN_EF_CONSTRUCTION") {
            self.ann_ef_construction = v;
        }
        if let Some(v) = env_parse("ANN_EF_SEARCH") {
            self.ann_ef_search = v;
        }
        if let Some(v) = env_parse("ANN_M") {
            self.ann_m = v;
        }
        if let Some(v) = env_bool("ANN_INDEX_CACHE") {
            self.ann_index_cache = v;
        }
        if let Some(v) = env_bool("PRELOAD_EMBEDDING_MODEL") {
            self.preload_embedding_model = v;
        }
        if let Some(v) = env_bool("UNLOAD_MODEL_AFTER_SEARCH") {
            self.unload_model_after_search = v;
        }
        if let Some(v) = env_bool("EMBEDDING_PROCESS_PER_BATCH") {
            self.embedding_process_per_batch = v;
        }
        if let Some(v) = env_string("VECTOR_STORE_FORMAT") {
            match v.to_ascii_lowercase().as_str() {
                "json" => self.vector_store_format = VectorStoreFormat::Json,
                "binary" => self.vector_store_format = VectorStoreFormat::Binary,
                _ => {}
            }
        }
        if let Some(v) = env_parse("SAVE_EVERY_N") {
            self.save_every_n = v;
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if !(0.0..=1.0).contains(&self.semantic_weight) {
            return Err(EngineError::ConfigInvalid(format!(
                "semanticWeight must be in [0,1], got {}",
                self.semantic_weight
            )));
        }
        if self.exact_match_boost < 0.0 {
            return Err(EngineError::ConfigInvalid(format!(
                "exactMatchBoost must be >= 0, got {}",
                self.exact_match_boost
            )));
        }
        if !(0.0..=1.0).contains(&self.recency_boost) {
            return Err(EngineError::ConfigInvalid(format!(
                "recencyBoost must be in [0,1], got {}",
                self.recency_boost
            )));
        }
        if !(1..=365).contains(&self.recency_decay_days) {
            return Err(EngineError::ConfigInvalid(format!(
                "recencyDecayDays must be in [1,365], got {}",
                self.recency_decay_days
            )));
        }
        if !(1..=64).contains(&self.ann_m) {
            return Err(EngineError::ConfigInvalid(format!(
                "annM must be in [1,64], got {}",
                self.ann_m
            )));
        }
        if let WorkerThreads::Count(n) = self.worker_threads {
            if n > 32 {
                return Err(EngineError::ConfigInvalid(format!(
                    "workerThreads must be \"auto\" or 0..=32, got {n}"
                )));
            }
        }
        if !self.ann_metric.eq_ignore_ascii_case("cosine") {
            return Err(EngineError::ConfigInvalid(format!(
                "annMetric is locked to \"cosine\", got \"{}\"",
                self.ann_metric
            )));
        }
        if self.batch_size == 0 {
            return Err(EngineError::ConfigInvalid(
                "batchSize must be at least 1".to_string(),
            ));
        }
        if self.chunk_size < 16 {
            return Err(EngineError::ConfigInvalid(format!(
                "chunkSize must be at least 16 tokens, got {}",
                self.chunk_size
            )));
        }
        Ok(())
    }

    /// Cache directory for this snapshot; the explicit override wins,
    /// otherwise the workspace-keyed directory under the global cache root.
    pub fn resolve_cache_dir(&self) -> PathBuf {
        if let Some(dir) = &self.cache_directory {
            return dir.clone();
        }
        let root = dirs::cache_dir().unwrap_or_else(|| PathBuf::from(".heuristic-cache"));
        root.join("heuristic-mcp")
            .join(crate::hasher::workspace_key(&self.search_directory))
    }

    pub fn is_supported_extension(&self, ext: &str) -> bool {
        self.file_extensions.iter().any(|e| e == ext)
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{key}"))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.trim().parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env_string(key).map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

fn env_list(key: &str) -> Option<Vec<String>> {
    env_string(key).map(|v| {
        v.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}
