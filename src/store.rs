//! On-disk artifact plumbing: cache directory layout, the atomic-replace
//! idiom, stale temp sweeping, replace telemetry, and the binary vector
//! codec.
//!
//! Atomic replace = write `<name>.tmp.<suffix>` -> fsync -> rename over the
//! final name, so readers never observe a torn file. Telemetry counters are
//! persisted to `binary-store-telemetry.json` alongside the artifacts.

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};

/// `vectors.bin` magic.
pub const VECTORS_MAGIC: &[u8; 4] = b"HMV1";

/// `vectors.bin` format version.
pub const VECTORS_VERSION: u32 = 1;

/// Temp files older than this are swept at startup.
pub const TEMP_GRACE: Duration = Duration::from_secs(15 * 60);

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

// ---------------------------------------------------------------------------
// Cache directory layout
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CachePaths {
    dir: PathBuf,
}

impl CachePaths {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn meta(&self) -> PathBuf {
        self.dir.join("meta.json")
    }

    pub fn embeddings(&self) -> PathBuf {
        self.dir.join("embeddings.json")
    }

    pub fn vectors_bin(&self) -> PathBuf {
        self.dir.join("vectors.bin")
    }

    pub fn file_hashes(&self) -> PathBuf {
        self.dir.join("file-hashes.json")
    }

    pub fn call_graph(&self) -> PathBuf {
        self.dir.join("call-graph.json")
    }

    pub fn ann_index(&self) -> PathBuf {
        self.dir.join("ann-index.bin")
    }

    pub fn ann_meta(&self) -> PathBuf {
        self.dir.join("ann-meta.json")
    }

    pub fn progress(&self) -> PathBuf {
        self.dir.join("progress.json")
    }

    pub fn lock(&self) -> PathBuf {
        self.dir.join("server.lock.json")
    }

    pub fn telemetry(&self) -> PathBuf {
        self.dir.join("binary-store-telemetry.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.dir.join("logs")
    }

    pub fn ensure_dir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)
    }
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreTelemetry {
    pub atomic_replace_attempts: u64,
    pub atomic_replace_failures: u64,
    pub retry_count: u64,
    pub fallback_copies: u64,
    pub rollback_count: u64,
    pub corruption_auto_clears: u64,
}

impl StoreTelemetry {
    pub fn load(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    /// Persisted directly (not via atomic replace): telemetry must not
    /// recurse into the machinery it measures.
    pub fn persist(&self, path: &Path) {
        if let Ok(json) = serde_json::to_string_pretty(self) {
            if let Err(e) = std::fs::write(path, json) {
                debug!(path = %path.display(), error = %e, "Telemetry write failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Atomic replace
// ---------------------------------------------------------------------------

fn tmp_path_for(target: &Path) -> PathBuf {
    let suffix = format!(
        "{}-{}",
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "artifact".to_string());
    target.with_file_name(format!("{name}.tmp.{suffix}"))
}

fn fsync_file(path: &Path) -> std::io::Result<()> {
    let file = std::fs::File::open(path)?;
    file.sync_all()
}

/// Write `bytes` to a sibling temp file, fsync, rename over `target`.
/// Retries the rename once; a second failure falls back to a direct copy so
/// a save can still complete on filesystems with flaky rename semantics.
pub fn atomic_replace(
    target: &Path,
    bytes: &[u8],
    telemetry: &mut StoreTelemetry,
) -> EngineResult<()> {
    atomic_replace_with(target, bytes, telemetry, fsync_file)
}

/// Same as [`atomic_replace`] with an injectable fsync, so tests can crash
/// the sequence at the durability boundary.
pub fn atomic_replace_with<F>(
    target: &Path,
    bytes: &[u8],
    telemetry: &mut StoreTelemetry,
    fsync: F,
) -> EngineResult<()>
where
    F: Fn(&Path) -> std::io::Result<()>,
{
    telemetry.atomic_replace_attempts += 1;
    let tmp = tmp_path_for(target);

    let write_result = (|| -> std::io::Result<()> {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.flush()?;
        drop(file);
        fsync(&tmp)
    })();

    if let Err(e) = write_result {
        telemetry.atomic_replace_failures += 1;
        telemetry.rollback_count += 1;
        let _ = std::fs::remove_file(&tmp);
        return Err(EngineError::Io(e));
    }

    match std::fs::rename(&tmp, target) {
        Ok(()) => Ok(()),
        Err(first) => {
            telemetry.retry_count += 1;
            warn!(target = %target.display(), error = %first, "Rename failed, retrying");
            match std::fs::rename(&tmp, target) {
                Ok(()) => Ok(()),
                Err(_) => {
                    telemetry.fallback_copies += 1;
                    let copy_result = std::fs::copy(&tmp, target);
                    let _ = std::fs::remove_file(&tmp);
                    match copy_result {
                        Ok(_) => Ok(()),
                        Err(e) => {
                            telemetry.atomic_replace_failures += 1;
                            telemetry.rollback_count += 1;
                            Err(EngineError::Io(e))
                        }
                    }
                }
            }
        }
    }
}

/// JSON artifacts are written 2-space indented.
pub fn atomic_replace_json<T: Serialize>(
    target: &Path,
    value: &T,
    telemetry: &mut StoreTelemetry,
) -> EngineResult<()> {
    let json = serde_json::to_string_pretty(value)?;
    atomic_replace(target, json.as_bytes(), telemetry)
}

/// Atomically replace a set of artifacts together: every payload is staged
/// to a temp file and fsynced before any rename happens, so a failure during
/// staging leaves all prior artifacts untouched. A crash mid-rename can
/// leave a mixed set only within the rename window, which the startup sweep
/// then evidences in telemetry.
pub fn atomic_replace_many(
    artifacts: Vec<(PathBuf, Vec<u8>)>,
    telemetry: &mut StoreTelemetry,
) -> EngineResult<()> {
    atomic_replace_many_with(artifacts, telemetry, fsync_file)
}

pub fn atomic_replace_many_with<F>(
    artifacts: Vec<(PathBuf, Vec<u8>)>,
    telemetry: &mut StoreTelemetry,
    fsync: F,
) -> EngineResult<()>
where
    F: Fn(&Path) -> std::io::Result<()>,
{
    let mut staged: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(artifacts.len());

    for (target, bytes) in &artifacts {
        telemetry.atomic_replace_attempts += 1;
        let tmp = tmp_path_for(target);
        let write_result = (|| -> std::io::Result<()> {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.flush()?;
            drop(file);
            fsync(&tmp)
        })();
        match write_result {
            Ok(()) => staged.push((tmp, target.clone())),
            Err(e) => {
                telemetry.atomic_replace_failures += 1;
                telemetry.rollback_count += 1;
                let _ = std::fs::remove_file(&tmp);
                for (tmp, _) in staged {
                    let _ = std::fs::remove_file(tmp);
                }
                return Err(EngineError::Io(e));
            }
        }
    }

    for (tmp, target) in staged {
        if let Err(first) = std::fs::rename(&tmp, &target) {
            telemetry.retry_count += 1;
            warn!(target = %target.display(), error = %first, "Rename failed, retrying");
            if std::fs::rename(&tmp, &target).is_err() {
                telemetry.fallback_copies += 1;
                let copied = std::fs::copy(&tmp, &target);
                let _ = std::fs::remove_file(&tmp);
                if let Err(e) = copied {
                    telemetry.atomic_replace_failures += 1;
                    telemetry.rollback_count += 1;
                    return Err(EngineError::Io(e));
                }
            }
        }
    }
    Ok(())
}

/// Remove `*.tmp.*` leftovers older than the grace window. Each sweep is
/// evidence of an interrupted replace, so the counters record it.
pub fn sweep_stale_temps(dir: &Path, grace: Duration, telemetry: &mut StoreTelemetry) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    let mut swept = 0u64;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.contains(".tmp.") {
            continue;
        }
        let old_enough = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok())
            .map(|age| age >= grace)
            .unwrap_or(true);
        if old_enough && std::fs::remove_file(entry.path()).is_ok() {
            swept += 1;
            debug!(file = %name, "Swept stale temp file");
        }
    }
    if swept > 0 {
        telemetry.atomic_replace_failures += swept;
        telemetry.rollback_count += 1;
        warn!(swept, dir = %dir.display(), "Swept stale temp files from interrupted save");
    }
}

// ---------------------------------------------------------------------------
// Binary vector codec
// ---------------------------------------------------------------------------

/// Encode vectors as the `HMV1` binary layout: magic, version, dim, count,
/// then `count * dim` little-endian f32 values.
pub fn encode_vectors(dim: u32, vectors: &[Vec<f32>]) -> EngineResult<Vec<u8>> {
    let mut out = Vec::with_capacity(16 + vectors.len() * dim as usize * 4);
    out.extend_from_slice(VECTORS_MAGIC);
    out.extend_from_slice(&VECTORS_VERSION.to_le_bytes());
    out.extend_from_slice(&dim.to_le_bytes());
    out.extend_from_slice(&(vectors.len() as u64).to_le_bytes());
    for vector in vectors {
        if vector.len() != dim as usize {
            return Err(EngineError::DimensionMismatch {
                expected: dim as usize,
                got: vector.len(),
            });
        }
        for value in vector {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
    Ok(out)
}

/// Decode an `HMV1` payload back into `(dim, vectors)`.
pub fn decode_vectors(bytes: &[u8]) -> EngineResult<(u32, Vec<Vec<f32>>)> {
    let mut cursor = std::io::Cursor::new(bytes);

    let mut magic = [0u8; 4];
    cursor
        .read_exact(&mut magic)
        .map_err(|_| EngineError::CacheCorrupt("vectors.bin truncated header".into()))?;
    if &magic != VECTORS_MAGIC {
        return Err(EngineError::CacheCorrupt(format!(
            "vectors.bin bad magic {magic:?}"
        )));
    }

    let version = read_u32(&mut cursor)?;
    if version != VECTORS_VERSION {
        return Err(EngineError::CacheVersionMismatch {
            found: version,
            expected: VECTORS_VERSION,
        });
    }

    let dim = read_u32(&mut cursor)?;
    let count = read_u64(&mut cursor)?;

    let expected_bytes = 16u64 + count * dim as u64 * 4;
    if bytes.len() as u64 != expected_bytes {
        return Err(EngineError::CacheCorrupt(format!(
            "vectors.bin length {} != expected {expected_bytes}",
            bytes.len()
        )));
    }

    let mut vectors = Vec::with_capacity(count as usize);
    let mut buf = [0u8; 4];
    for _ in 0..count {
        let mut vector = Vec::with_capacity(dim as usize);
        for _ in 0..dim {
            cursor
                .read_exact(&mut buf)
                .map_err(|_| EngineError::CacheCorrupt("vectors.bin truncated body".into()))?;
            vector.push(f32::from_le_bytes(buf));
        }
        vectors.push(vector);
    }
    Ok((dim, vectors))
}

fn read_u32(cursor: &mut std::io::Cursor<&[u8]>) -> EngineResult<u32> {
    let mut buf = [0u8; 4];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| EngineError::CacheCorrupt("vectors.bin truncated header".into()))?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(cursor: &mut std::io::Cursor<&[u8]>) -> EngineResult<u64> {
    let mut buf = [0u8; 8];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| EngineError::CacheCorrupt("vectors.bin truncated header".into()))?;
    Ok(u64::from_le_bytes(buf))
}
