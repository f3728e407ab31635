//! Indexing progress record, rewritten atomically after every batch.
//! Consumers treat `progress.json` as a hint only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::store::{self, StoreTelemetry};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Progress {
    pub progress: usize,
    pub total: usize,
    pub message: String,
    pub updated_at: Option<DateTime<Utc>>,
    /// "initial" or "incremental".
    pub index_mode: Option<String>,
    pub worker_circuit_open: bool,
    /// Epoch millis; present while the circuit breaker has workers parked.
    pub workers_disabled_until: Option<u64>,
}

pub struct ProgressWriter {
    path: PathBuf,
    last_written: Option<DateTime<Utc>>,
}

impl ProgressWriter {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            last_written: None,
        }
    }

    /// Write the record with a monotonic `updated_at`. Write failures are
    /// swallowed: progress is advisory and must never fail indexing.
    pub fn write(&mut self, mut progress: Progress) {
        let mut now = Utc::now();
        if let Some(last) = self.last_written {
            if now <= last {
                now = last + chrono::Duration::milliseconds(1);
            }
        }
        self.last_written = Some(now);
        progress.updated_at = Some(now);

        let mut scratch = StoreTelemetry::default();
        if let Err(e) = store::atomic_replace_json(&self.path, &progress, &mut scratch) {
            tracing::debug!(error = %e, "Progress write failed");
        }
    }

    pub fn read(path: &std::path::Path) -> Option<Progress> {
        let raw = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }
}
