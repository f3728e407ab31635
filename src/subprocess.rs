//! Subprocess-per-batch embedding.
//!
//! Spawns `heuristic-mcp embed-worker`, streams one batch over stdio as
//! length-prefixed JSON frames, and exits. The parent owns the per-batch
//! deadline; on timeout the child is killed and the caller may reschedule
//! the batch once. Used when the config demands memory isolation
//! (`embeddingProcessPerBatch`).

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::embedder::{verify_batch, TextEmbedder};
use crate::error::{EngineError, EngineResult};

/// Upper bound on a single frame; a batch of 100 chunks at 8K tokens stays
/// far below this.
const MAX_FRAME_BYTES: u32 = 256 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
pub struct EmbedRequest {
    pub model: String,
    pub texts: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EmbedResponse {
    #[serde(default)]
    pub vectors: Vec<Vec<f32>>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Write one `u32`-length-prefixed JSON frame.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, payload: &T) -> EngineResult<()> {
    let body = serde_json::to_vec(payload)?;
    let len = body.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Read one length-prefixed JSON frame.
pub fn read_frame<R: Read, T: for<'de> Deserialize<'de>>(reader: &mut R) -> EngineResult<T> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes);
    if len == 0 || len > MAX_FRAME_BYTES {
        return Err(EngineError::ChildCrashed(format!(
            "invalid frame length {len}"
        )));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;
    Ok(serde_json::from_slice(&body)?)
}

pub struct SubprocessEmbedder {
    model_id: String,
    dim: std::sync::atomic::AtomicUsize,
    deadline: Duration,
    /// Binary to spawn; defaults to the current executable.
    program: std::path::PathBuf,
}

impl SubprocessEmbedder {
    pub fn new(model_id: impl Into<String>, deadline: Duration) -> Self {
        let program = std::env::current_exe()
            .unwrap_or_else(|_| std::path::PathBuf::from("heuristic-mcp"));
        Self {
            model_id: model_id.into(),
            dim: std::sync::atomic::AtomicUsize::new(0),
            deadline,
            program,
        }
    }

    fn run_child(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        let mut child = Command::new(&self.program)
            .arg("embed-worker")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| EngineError::ChildCrashed(format!("spawn failed: {e}")))?;

        let request = EmbedRequest {
            model: self.model_id.clone(),
            texts: texts.to_vec(),
        };

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::ChildCrashed("child stdin unavailable".into()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::ChildCrashed("child stdout unavailable".into()))?;

        write_frame(&mut stdin, &request)?;
        drop(stdin);

        let completed = Arc::new(AtomicBool::new(false));
        let killer = spawn_watchdog(child.id(), self.deadline, Arc::clone(&completed));

        let result: EngineResult<EmbedResponse> = read_frame(&mut stdout);
        completed.store(true, Ordering::Release);

        let status = child
            .wait()
            .map_err(|e| EngineError::ChildCrashed(format!("wait failed: {e}")))?;
        let timed_out = killer.join().unwrap_or(false);

        if timed_out {
            return Err(EngineError::BatchTimeout(self.deadline));
        }

        let response = result.map_err(|e| match e {
            EngineError::Io(_) if !status.success() => {
                EngineError::ChildCrashed(format!("child exited with {status}"))
            }
            other => other,
        })?;

        if let Some(error) = response.error {
            return Err(EngineError::ChildCrashed(error));
        }
        if !status.success() {
            return Err(EngineError::ChildCrashed(format!(
                "child exited with {status}"
            )));
        }
        Ok(response.vectors)
    }
}

/// Kill the child once the deadline passes unless `completed` flips first.
/// Returns a handle resolving to whether the kill fired.
fn spawn_watchdog(
    pid: u32,
    deadline: Duration,
    completed: Arc<AtomicBool>,
) -> std::thread::JoinHandle<bool> {
    std::thread::spawn(move || {
        let step = Duration::from_millis(50);
        let mut waited = Duration::ZERO;
        while waited < deadline {
            if completed.load(Ordering::Acquire) {
                return false;
            }
            std::thread::sleep(step);
            waited += step;
        }
        if completed.load(Ordering::Acquire) {
            return false;
        }
        warn!(pid, ?deadline, "Embedding child exceeded deadline, killing");
        kill_pid(pid);
        true
    })
}

#[cfg(unix)]
fn kill_pid(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_pid(pid: u32) {
    let _ = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F"])
        .output();
}

impl TextEmbedder for SubprocessEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dim(&self) -> usize {
        self.dim.load(Ordering::Acquire)
    }

    fn embed(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self.run_child(texts)?;
        let vectors = verify_batch(texts.len(), vectors)?;
        if let Some(first) = vectors.first() {
            self.dim.store(first.len(), Ordering::Release);
        }
        Ok(vectors)
    }
}

/// Child-side loop: read one request frame from stdin, embed with the given
/// embedder, write one response frame, return. Invoked from main in
/// `embed-worker` mode.
pub fn run_embed_worker(embedder: &dyn TextEmbedder) -> EngineResult<()> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut reader = stdin.lock();
    let mut writer = stdout.lock();

    let request: EmbedRequest = read_frame(&mut reader)?;
    let response = match embedder.embed(&request.texts) {
        Ok(vectors) => EmbedResponse {
            vectors,
            error: None,
        },
        Err(e) => EmbedResponse {
            vectors: Vec::new(),
            error: Some(e.to_string()),
        },
    };
    write_frame(&mut writer, &response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let request = EmbedRequest {
            model: "test-model".into(),
            texts: vec!["one".into(), "two".into()],
        };
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &request).unwrap();

        let mut cursor = std::io::Cursor::new(buffer);
        let back: EmbedRequest = read_frame(&mut cursor).unwrap();
        assert_eq!(back.model, "test-model");
        assert_eq!(back.texts.len(), 2);
    }

    #[test]
    fn frame_rejects_oversize_length() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&u32::MAX.to_le_bytes());
        buffer.extend_from_slice(b"junk");
        let mut cursor = std::io::Cursor::new(buffer);
        let result: EngineResult<EmbedResponse> = read_frame(&mut cursor);
        assert!(matches!(result, Err(EngineError::ChildCrashed(_))));
    }

    #[test]
    fn frame_rejects_truncated_body() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&100u32.to_le_bytes());
        buffer.extend_from_slice(b"{}");
        let mut cursor = std::io::Cursor::new(buffer);
        let result: EngineResult<EmbedResponse> = read_frame(&mut cursor);
        assert!(result.is_err());
    }

    #[test]
    fn response_error_field_roundtrip() {
        let response = EmbedResponse {
            vectors: Vec::new(),
            error: Some("model load failed".into()),
        };
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &response).unwrap();
        let mut cursor = std::io::Cursor::new(buffer);
        let back: EmbedResponse = read_frame(&mut cursor).unwrap();
        assert_eq!(back.error.as_deref(), Some("model load failed"));
    }
}
