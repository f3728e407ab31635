//! Approximate nearest-neighbor index.
//!
//! HNSW over unit-norm vectors with the metric locked to cosine; because
//! vectors are normalized the backend works in inner-product space and
//! similarities are clamped to [-1, 1]. The backend sits behind a trait so
//! tests can use an exact-scan stub instead of the native index.

use serde::{Deserialize, Serialize};
use std::path::Path;
use usearch::ffi::{IndexOptions, MetricKind, ScalarKind};

use crate::error::{EngineError, EngineResult};

/// `ann-meta.json` format version.
pub const ANN_META_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnParams {
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

impl AnnParams {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            m: config.ann_m,
            ef_construction: config.ann_ef_construction,
            ef_search: config.ann_ef_search,
        }
    }
}

/// Sidecar metadata persisted next to `ann-index.bin`. The on-disk index is
/// trusted only when this matches the live store exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnnMeta {
    pub version: u32,
    pub embedding_model: String,
    pub dim: u32,
    pub count: u64,
    pub metric: String,
    pub m: u32,
    pub ef_construction: u32,
}

impl AnnMeta {
    pub fn current(model: &str, dim: usize, count: usize, params: AnnParams) -> Self {
        Self {
            version: ANN_META_VERSION,
            embedding_model: model.to_string(),
            dim: dim as u32,
            count: count as u64,
            metric: "cosine".to_string(),
            m: params.m as u32,
            ef_construction: params.ef_construction as u32,
        }
    }

    pub fn load(path: &Path) -> Option<Self> {
        let raw = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// The persisted index is trusted iff every field matches the live
    /// store; anything else means rebuild.
    pub fn matches(&self, expected: &AnnMeta) -> bool {
        self == expected
    }
}

pub trait AnnBackend: Send + Sync {
    /// Rebuild from scratch over the full vector store; labels are the
    /// store positions `0..vectors.len()`.
    fn build(&mut self, vectors: &[Vec<f32>]) -> EngineResult<()>;

    /// Append one labeled point; valid only for labels past the current end.
    fn add_point(&mut self, label: u64, vector: &[f32]) -> EngineResult<()>;

    /// Up to `k` `(label, similarity)` pairs, similarity in [-1, 1],
    /// best first. May return fewer; may include stale labels the caller
    /// must range-check.
    fn search_knn(&self, query: &[f32], k: usize) -> EngineResult<Vec<(u64, f32)>>;

    fn set_ef_search(&mut self, ef: usize);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn save(&self, path: &Path) -> EngineResult<()>;

    fn load(&mut self, path: &Path) -> EngineResult<()>;
}

/// Drop invalid labels, dedupe, and cap at `k`, preserving rank order.
pub fn sanitize_matches(
    matches: Vec<(u64, f32)>,
    store_len: usize,
    k: usize,
) -> Vec<(usize, f32)> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(k.min(matches.len()));
    for (label, score) in matches {
        if label as usize >= store_len {
            continue;
        }
        let idx = label as usize;
        if !seen.insert(idx) {
            continue;
        }
        out.push((idx, score.clamp(-1.0, 1.0)));
        if out.len() >= k {
            break;
        }
    }
    out
}

// ---------------------------------------------------------------------------
// usearch HNSW backend
// ---------------------------------------------------------------------------

pub struct UsearchAnn {
    index: usearch::Index,
    dim: usize,
    params: AnnParams,
}

impl UsearchAnn {
    pub fn new(dim: usize, params: AnnParams) -> EngineResult<Self> {
        let index = Self::make_index(dim, params)?;
        Ok(Self { index, dim, params })
    }

    fn make_index(dim: usize, params: AnnParams) -> EngineResult<usearch::Index> {
        let options = IndexOptions {
            dimensions: dim,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: params.m,
            expansion_add: params.ef_construction,
            expansion_search: params.ef_search,
            multi: false,
        };
        usearch::Index::new(&options)
            .map_err(|e| EngineError::AnnUnavailable(format!("index create failed: {e}")))
    }

    fn reserve(&self, capacity: usize) -> EngineResult<()> {
        self.index
            .reserve(capacity)
            .map_err(|e| EngineError::AnnUnavailable(format!("reserve failed: {e}")))
    }
}

impl AnnBackend for UsearchAnn {
    fn build(&mut self, vectors: &[Vec<f32>]) -> EngineResult<()> {
        self.index = Self::make_index(self.dim, self.params)?;
        self.reserve(vectors.len().max(1024))?;
        for (label, vector) in vectors.iter().enumerate() {
            self.index
                .add(label as u64, vector)
                .map_err(|e| EngineError::AnnUnavailable(format!("add failed: {e}")))?;
        }
        Ok(())
    }

    fn add_point(&mut self, label: u64, vector: &[f32]) -> EngineResult<()> {
        if self.index.size() + 1 >= self.index.capacity() {
            self.reserve((self.index.capacity() * 2).max(1024))?;
        }
        self.index
            .add(label, vector)
            .map_err(|e| EngineError::AnnUnavailable(format!("add failed: {e}")))
    }

    fn search_knn(&self, query: &[f32], k: usize) -> EngineResult<Vec<(u64, f32)>> {
        if self.index.size() == 0 {
            return Ok(Vec::new());
        }
        let matches = self
            .index
            .search(query, k)
            .map_err(|e| EngineError::AnnUnavailable(format!("search failed: {e}")))?;
        Ok(matches
            .keys
            .iter()
            .zip(matches.distances.iter())
            // usearch reports cosine distance; similarity = 1 - distance.
            .map(|(key, distance)| (*key, 1.0 - distance))
            .collect())
    }

    fn set_ef_search(&mut self, ef: usize) {
        self.params.ef_search = ef;
        self.index.change_expansion_search(ef);
    }

    fn len(&self) -> usize {
        self.index.size()
    }

    fn save(&self, path: &Path) -> EngineResult<()> {
        self.index
            .save(path.to_string_lossy().as_ref())
            .map_err(|e| EngineError::AnnUnavailable(format!("save failed: {e}")))
    }

    fn load(&mut self, path: &Path) -> EngineResult<()> {
        self.index
            .load(path.to_string_lossy().as_ref())
            .map_err(|e| EngineError::AnnUnavailable(format!("load failed: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Exact-scan stub backend
// ---------------------------------------------------------------------------

/// Brute-force backend used by the test suite. Same contract, no native
/// dependency, and trivially correct: full scan sorted by dot product.
#[derive(Default)]
pub struct StubAnn {
    points: Vec<(u64, Vec<f32>)>,
    pub ef_search: usize,
}

impl StubAnn {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AnnBackend for StubAnn {
    fn build(&mut self, vectors: &[Vec<f32>]) -> EngineResult<()> {
        self.points = vectors
            .iter()
            .enumerate()
            .map(|(label, v)| (label as u64, v.clone()))
            .collect();
        Ok(())
    }

    fn add_point(&mut self, label: u64, vector: &[f32]) -> EngineResult<()> {
        self.points.push((label, vector.to_vec()));
        Ok(())
    }

    fn search_knn(&self, query: &[f32], k: usize) -> EngineResult<Vec<(u64, f32)>> {
        let mut scored: Vec<(u64, f32)> = self
            .points
            .iter()
            .map(|(label, v)| {
                let dot = v.iter().zip(query).map(|(a, b)| a * b).sum::<f32>();
                (*label, dot.clamp(-1.0, 1.0))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    fn set_ef_search(&mut self, ef: usize) {
        self.ef_search = ef;
    }

    fn len(&self) -> usize {
        self.points.len()
    }

    fn save(&self, path: &Path) -> EngineResult<()> {
        let vectors: Vec<&Vec<f32>> = self.points.iter().map(|(_, v)| v).collect();
        let json = serde_json::to_vec(&vectors)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    fn load(&mut self, path: &Path) -> EngineResult<()> {
        let raw = std::fs::read(path)?;
        let vectors: Vec<Vec<f32>> = serde_json::from_slice(&raw)?;
        self.points = vectors
            .into_iter()
            .enumerate()
            .map(|(label, v)| (label as u64, v))
            .collect();
        Ok(())
    }
}

/// Which backend to construct; tests inject the stub through the cache.
pub fn new_backend(dim: usize, params: AnnParams) -> EngineResult<Box<dyn AnnBackend>> {
    Ok(Box::new(UsearchAnn::new(dim, params)?))
}
