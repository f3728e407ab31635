//! Content hashing and workspace key derivation.
//!
//! Change detection uses xxh3-128: fast, stable across platforms, and
//! collision-resistant enough for content addressing. It is not a
//! cryptographic hash and is never used as one.

use md5::{Digest, Md5};
use std::path::{Path, PathBuf};
use xxhash_rust::xxh3::xxh3_128;

/// 128-bit content hash rendered as 32 lowercase hex chars.
/// Identical bytes produce identical hashes on every platform.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:032x}", xxh3_128(bytes))
}

/// Hash a file's current on-disk content.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(content_hash(&bytes))
}

/// Canonicalize a workspace path for keying: resolve symlinks and
/// absolutize; on Windows also lowercase the full path so drive-letter case
/// never splits the cache.
pub fn canonicalize_workspace(path: &Path) -> PathBuf {
    let resolved = dunce::canonicalize(path)
        .or_else(|_| std::env::current_dir().map(|cwd| cwd.join(path)))
        .unwrap_or_else(|_| path.to_path_buf());
    if cfg!(windows) {
        PathBuf::from(resolved.to_string_lossy().to_lowercase())
    } else {
        resolved
    }
}

/// Workspace key: first 12 hex chars of md5 over the canonicalized path.
pub fn workspace_key(workspace: &Path) -> String {
    key_of(&canonicalize_workspace(workspace))
}

/// Compatibility key variants accepted read-only: a drive-letter-case-only
/// variant and the legacy no-case-fold form. A cache found under one of
/// these is migrated to the canonical key on the next save.
pub fn compat_workspace_keys(workspace: &Path) -> Vec<String> {
    let canonical = canonicalize_workspace(workspace);
    let mut keys = Vec::new();

    let raw = dunce::canonicalize(workspace).unwrap_or_else(|_| workspace.to_path_buf());
    let legacy = key_of(&raw);
    if legacy != key_of(&canonical) {
        keys.push(legacy);
    }

    if cfg!(windows) {
        let text = raw.to_string_lossy();
        if let Some(rest) = text.get(1..) {
            if text
                .chars()
                .next()
                .map(|c| c.is_ascii_lowercase())
                .unwrap_or(false)
            {
                let flipped = format!(
                    "{}{rest}",
                    text.chars().next().unwrap_or_default().to_ascii_uppercase()
                );
                let variant = key_of(Path::new(&flipped));
                if !keys.contains(&variant) && variant != key_of(&canonical) {
                    keys.push(variant);
                }
            }
        }
    }

    keys
}

fn key_of(path: &Path) -> String {
    let mut hasher = Md5::new();
    hasher.update(path.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..12].to_string()
}
