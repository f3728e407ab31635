//! Embedding capability.
//!
//! The engine consumes an opaque `TextEmbedder`: a batch of texts in, the
//! same number of unit-norm vectors of uniform dimension out. The in-process
//! implementation lazily loads Qwen3-Embedding-0.6B via fastembed's candle
//! backend; a deterministic hash-projection embedder backs the test suite.

use candle_core::{DType, Device};
use fastembed::Qwen3TextEmbedding;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};

/// Maximum token length for embedding model truncation. Qwen3 supports up
/// to 32768; 8192 balances quality and CPU memory for code.
const QWEN3_MAX_LENGTH: usize = 8192;

/// Intra-op thread cap applied at model load.
const DEFAULT_INTRA_OP_THREADS: usize = 2;

pub trait TextEmbedder: Send + Sync {
    fn model_id(&self) -> &str;

    /// Vector dimension. Lazy implementations report 0 until first load.
    fn dim(&self) -> usize;

    /// Embed a batch. Returns exactly `texts.len()` unit-norm vectors of
    /// uniform dimension, or one of `ModelLoadFailed`, `BatchTimeout`,
    /// `DimensionMismatch`, `ChildCrashed`.
    fn embed(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>>;

    /// Drop any loaded model state. Default is a no-op.
    fn unload(&self) {}
}

/// Validate and normalize a returned batch against the embedder contract.
pub fn verify_batch(
    expected_len: usize,
    mut vectors: Vec<Vec<f32>>,
) -> EngineResult<Vec<Vec<f32>>> {
    if vectors.len() != expected_len {
        return Err(EngineError::DimensionMismatch {
            expected: expected_len,
            got: vectors.len(),
        });
    }
    let dim = vectors.first().map(|v| v.len()).unwrap_or(0);
    for vector in &mut vectors {
        if vector.len() != dim {
            return Err(EngineError::DimensionMismatch {
                expected: dim,
                got: vector.len(),
            });
        }
        normalize(vector);
    }
    Ok(vectors)
}

/// L2-normalize in place. A zero vector becomes a unit basis vector so the
/// unit-norm invariant holds for degenerate inputs.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    } else if let Some(first) = vector.first_mut() {
        *first = 1.0;
    }
}

// ---------------------------------------------------------------------------
// In-process embedder
// ---------------------------------------------------------------------------

pub struct FastTextEmbedder {
    repo_id: String,
    model: Mutex<Option<Qwen3TextEmbedding>>,
    initialized: AtomicBool,
    dim: AtomicUsize,
    intra_op_threads: usize,
}

impl FastTextEmbedder {
    pub fn new(repo_id: impl Into<String>) -> Self {
        Self {
            repo_id: repo_id.into(),
            model: Mutex::new(None),
            initialized: AtomicBool::new(false),
            dim: AtomicUsize::new(0),
            intra_op_threads: DEFAULT_INTRA_OP_THREADS,
        }
    }

    /// Lazily initialize the model (downloads weights on first use).
    /// Concurrent callers collapse onto one load under the lock.
    fn ensure_model(&self) -> EngineResult<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut guard = self.model.lock();
        if guard.is_some() {
            self.initialized.store(true, Ordering::Release);
            return Ok(());
        }

        if std::env::var_os("OMP_NUM_THREADS").is_none() {
            // SAFETY: set before any model thread pool spins up, under the
            // model init lock, matching the single-init guarantee above.
            unsafe {
                std::env::set_var("OMP_NUM_THREADS", self.intra_op_threads.to_string());
            }
        }

        info!(
            model = %self.repo_id,
            max_len = QWEN3_MAX_LENGTH,
            intra_op_threads = self.intra_op_threads,
            "Loading embedding model"
        );

        let model = Qwen3TextEmbedding::from_hf(
            &self.repo_id,
            &Device::Cpu,
            DType::F32,
            QWEN3_MAX_LENGTH,
        )
        .map_err(|e| EngineError::ModelLoadFailed(format!("{}: {e}", self.repo_id)))?;

        let dim = model.config().hidden_size;
        self.dim.store(dim, Ordering::Release);
        *guard = Some(model);
        self.initialized.store(true, Ordering::Release);
        info!(model = %self.repo_id, dim, "Embedding model ready");
        Ok(())
    }

    /// Kick off model load in the background. Never blocks the caller; a
    /// failed preload is logged and retried on first real use.
    pub fn preload(self: &Arc<Self>) {
        let this = Arc::clone(self);
        std::thread::Builder::new()
            .name("embed-preload".into())
            .spawn(move || {
                if let Err(e) = this.ensure_model() {
                    warn!(error = %e, "Embedding model preload failed");
                }
            })
            .ok();
    }

    pub fn is_loaded(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }
}

impl TextEmbedder for FastTextEmbedder {
    fn model_id(&self) -> &str {
        &self.repo_id
    }

    fn dim(&self) -> usize {
        self.dim.load(Ordering::Acquire)
    }

    fn embed(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_model()?;
        let guard = self.model.lock();
        let model = guard
            .as_ref()
            .ok_or_else(|| EngineError::ModelLoadFailed("model unloaded during embed".into()))?;

        let vectors = model
            .embed(texts)
            .map_err(|e| EngineError::ModelLoadFailed(format!("embedding failed: {e}")))?;
        verify_batch(texts.len(), vectors)
    }

    fn unload(&self) {
        let mut guard = self.model.lock();
        if guard.take().is_some() {
            self.initialized.store(false, Ordering::Release);
            info!(model = %self.repo_id, "Embedding model unloaded");
        }
    }
}

// ---------------------------------------------------------------------------
// Deterministic embedder for tests
// ---------------------------------------------------------------------------

/// Hash-projection embedder: each lowercase token hashes to a signed bucket.
/// Deterministic across platforms and runs, so tests never download a model.
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(8) }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(64)
    }
}

impl TextEmbedder for HashEmbedder {
    fn model_id(&self) -> &str {
        "hash-projection-test"
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        let vectors = texts
            .iter()
            .map(|text| {
                let mut vector = vec![0.0f32; self.dim];
                for token in text
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|t| !t.is_empty())
                {
                    let hash = xxhash_rust::xxh3::xxh3_64(token.to_lowercase().as_bytes());
                    let idx = (hash % self.dim as u64) as usize;
                    let sign = if (hash >> 32) & 1 == 0 { 1.0 } else { -1.0 };
                    vector[idx] += sign;
                }
                vector
            })
            .collect();
        verify_batch(texts.len(), vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    #[test]
    fn hash_embedder_is_deterministic() {
        let embedder = HashEmbedder::default();
        let a = embedder.embed(&["fn main() {}".to_string()]).unwrap();
        let b = embedder.embed(&["fn main() {}".to_string()]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn hash_embedder_vectors_are_unit_norm() {
        let embedder = HashEmbedder::default();
        let vectors = embedder
            .embed(&[
                "export function greet(){return 'hi'}".to_string(),
                "console.log('bye')".to_string(),
                "".to_string(),
            ])
            .unwrap();
        assert_eq!(vectors.len(), 3);
        for v in &vectors {
            assert!((norm(v) - 1.0).abs() < 1e-4);
            assert_eq!(v.len(), 64);
        }
    }

    #[test]
    fn similar_texts_score_higher_than_unrelated() {
        let embedder = HashEmbedder::default();
        let vectors = embedder
            .embed(&[
                "fn greet(name: &str) -> String".to_string(),
                "fn greet(user: &str) -> String".to_string(),
                "SELECT count(*) FROM orders".to_string(),
            ])
            .unwrap();
        let dot = |a: &[f32], b: &[f32]| a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>();
        assert!(dot(&vectors[0], &vectors[1]) > dot(&vectors[0], &vectors[2]));
    }

    #[test]
    fn verify_batch_rejects_short_batches() {
        let result = verify_batch(2, vec![vec![1.0, 0.0]]);
        assert!(matches!(
            result,
            Err(EngineError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn verify_batch_rejects_ragged_dims() {
        let result = verify_batch(2, vec![vec![1.0, 0.0], vec![1.0]]);
        assert!(result.is_err());
    }

    #[test]
    fn normalize_handles_zero_vector() {
        let mut v = vec![0.0f32; 4];
        normalize(&mut v);
        assert!((norm(&v) - 1.0).abs() < 1e-6);
    }
}
