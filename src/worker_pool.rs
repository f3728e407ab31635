//! Bounded embedding worker pool.
//!
//! `N` worker threads, each owning its own embedder instance, consume a
//! FIFO job queue. A semaphore bounds in-flight jobs for backpressure.
//! Consecutive worker failures open a circuit breaker: while open (and for
//! `workerThreads = 0`), submissions route through the main-thread embedder
//! on the blocking pool. `terminate()` drains queued jobs with `Cancelled`
//! and fails new submissions fast.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{oneshot, Semaphore};
use tracing::{info, warn};

use crate::embedder::TextEmbedder;
use crate::error::{EngineError, EngineResult};

/// Consecutive failures that open the circuit.
pub const CIRCUIT_THRESHOLD: u32 = 3;

/// How long the circuit stays open.
pub const CIRCUIT_COOLDOWN: Duration = Duration::from_secs(60);

/// In-flight jobs allowed per worker before `submit` awaits.
const BACKPRESSURE_FACTOR: usize = 2;

/// Per-batch deadline; a worker that exceeds it fails the submission (and
/// feeds the breaker) without killing the pool.
const BATCH_DEADLINE: Duration = Duration::from_secs(crate::config::EMBED_BATCH_TIMEOUT_SECS);

pub type EmbedderFactory = Arc<dyn Fn() -> Arc<dyn TextEmbedder> + Send + Sync>;

struct Job {
    texts: Vec<String>,
    reply: oneshot::Sender<EngineResult<Vec<Vec<f32>>>>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

/// Circuit breaker over consecutive worker failures.
struct Breaker {
    threshold: u32,
    cooldown: Duration,
    consecutive_failures: AtomicU32,
    /// Epoch millis until which the circuit is open; 0 = closed.
    open_until_ms: AtomicU64,
}

impl Breaker {
    fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            consecutive_failures: AtomicU32::new(0),
            open_until_ms: AtomicU64::new(0),
        }
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn is_open(&self) -> bool {
        let until = self.open_until_ms.load(Ordering::Acquire);
        until != 0 && Self::now_ms() < until
    }

    /// Open timestamp if set, even past cooldown (cleared only by success).
    fn disabled_until_ms(&self) -> Option<u64> {
        let until = self.open_until_ms.load(Ordering::Acquire);
        (until != 0).then_some(until)
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.threshold && !self.is_open() {
            let until = Self::now_ms() + self.cooldown.as_millis() as u64;
            self.open_until_ms.store(until, Ordering::Release);
            warn!(
                failures,
                cooldown_secs = self.cooldown.as_secs(),
                "Embedding worker circuit opened"
            );
        }
    }

    fn record_success(&self) {
        let was_open = self.open_until_ms.swap(0, Ordering::AcqRel) != 0;
        self.consecutive_failures.store(0, Ordering::Release);
        if was_open {
            info!("Embedding worker circuit closed");
        }
    }
}

pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
    worker_count: usize,
    fallback: Arc<dyn TextEmbedder>,
    breaker: Arc<Breaker>,
    terminated: Arc<AtomicBool>,
    in_flight: Arc<Semaphore>,
}

impl WorkerPool {
    /// `worker_count = 0` disables workers entirely; every submission runs
    /// on the fallback embedder.
    pub fn new(worker_count: usize, factory: EmbedderFactory, fallback: Arc<dyn TextEmbedder>) -> Self {
        Self::with_breaker(worker_count, factory, fallback, CIRCUIT_THRESHOLD, CIRCUIT_COOLDOWN)
    }

    pub fn with_breaker(
        worker_count: usize,
        factory: EmbedderFactory,
        fallback: Arc<dyn TextEmbedder>,
        threshold: u32,
        cooldown: Duration,
    ) -> Self {
        let breaker = Arc::new(Breaker::new(threshold, cooldown));
        let terminated = Arc::new(AtomicBool::new(false));
        let permits = (worker_count.max(1)) * BACKPRESSURE_FACTOR;

        let (sender, handles) = if worker_count > 0 {
            let (tx, rx) = mpsc::channel::<Job>();
            let rx = Arc::new(Mutex::new(rx));
            let mut handles = Vec::with_capacity(worker_count);
            for worker_id in 0..worker_count {
                let rx = Arc::clone(&rx);
                let factory = Arc::clone(&factory);
                let breaker = Arc::clone(&breaker);
                let terminated = Arc::clone(&terminated);
                let spawned = std::thread::Builder::new()
                    .name(format!("embed-worker-{worker_id}"))
                    .spawn(move || worker_loop(worker_id, rx, factory, breaker, terminated));
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(e) => warn!(worker_id, error = %e, "Failed to spawn embedding worker"),
                }
            }
            if handles.is_empty() {
                warn!("No embedding workers started; using main-thread embedder");
                (None, handles)
            } else {
                (Some(tx), handles)
            }
        } else {
            info!("Embedding workers disabled; using main-thread embedder");
            (None, Vec::new())
        };

        let live_workers = if sender.is_some() { worker_count } else { 0 };
        Self {
            sender: Mutex::new(sender),
            workers: Mutex::new(handles),
            worker_count: live_workers,
            fallback,
            breaker,
            terminated,
            in_flight: Arc::new(Semaphore::new(permits)),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn circuit_open(&self) -> bool {
        self.breaker.is_open()
    }

    /// Epoch millis until which workers are disabled, for progress records.
    pub fn workers_disabled_until(&self) -> Option<u64> {
        self.breaker.disabled_until_ms()
    }

    /// Embed one batch. FIFO across submissions. Fails fast with `Cancelled`
    /// after `terminate()`.
    pub async fn submit(&self, texts: Vec<String>) -> EngineResult<Vec<Vec<f32>>> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(EngineError::Cancelled);
        }
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        if self.worker_count == 0 || self.breaker.is_open() {
            return self.embed_on_fallback(texts).await;
        }

        let permit = Arc::clone(&self.in_flight)
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Cancelled)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let guard = self.sender.lock();
            let sender = guard.as_ref().ok_or(EngineError::Cancelled)?;
            sender
                .send(Job {
                    texts,
                    reply: reply_tx,
                    _permit: permit,
                })
                .map_err(|_| EngineError::Cancelled)?;
        }

        match tokio::time::timeout(BATCH_DEADLINE, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EngineError::Cancelled),
            Err(_) => {
                self.breaker.record_failure();
                Err(EngineError::BatchTimeout(BATCH_DEADLINE))
            }
        }
    }

    async fn embed_on_fallback(&self, texts: Vec<String>) -> EngineResult<Vec<Vec<f32>>> {
        let embedder = Arc::clone(&self.fallback);
        tokio::task::spawn_blocking(move || embedder.embed(&texts))
            .await
            .map_err(|_| EngineError::Cancelled)?
    }

    /// Abort the pool: queued jobs drain with `Cancelled`, new submissions
    /// fail fast, worker threads exit after their current batch. Safe to
    /// call concurrently with `submit` and more than once.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        // Dropping the sender closes the queue; workers drain what is left,
        // see the terminated flag, and reply Cancelled.
        self.sender.lock().take();

        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        if handles.is_empty() {
            return;
        }
        // Join off the async runtime; an in-flight batch may take a while
        // and shutdown is best-effort.
        std::thread::Builder::new()
            .name("embed-pool-reaper".into())
            .spawn(move || {
                for handle in handles {
                    let _ = handle.join();
                }
            })
            .ok();
        info!("Embedding worker pool terminated");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    factory: EmbedderFactory,
    breaker: Arc<Breaker>,
    terminated: Arc<AtomicBool>,
) {
    let mut embedder: Option<Arc<dyn TextEmbedder>> = None;

    loop {
        let job = {
            let guard = rx.lock();
            guard.recv()
        };
        let job = match job {
            Ok(job) => job,
            Err(_) => break,
        };

        if terminated.load(Ordering::Acquire) {
            let _ = job.reply.send(Err(EngineError::Cancelled));
            continue;
        }

        let instance = embedder.get_or_insert_with(|| factory()).clone();
        let result = instance.embed(&job.texts);
        match &result {
            Ok(_) => breaker.record_success(),
            Err(e) => {
                warn!(worker_id, error = %e, "Embedding batch failed in worker");
                breaker.record_failure();
            }
        }
        let _ = job.reply.send(result);
    }
}
