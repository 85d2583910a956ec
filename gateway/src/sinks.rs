//! Sink workers
//!
//! Each sink runs on its own worker thread behind an unbounded queue, so a
//! slow or failing disk never holds up reconstruction. Failed writes are
//! retried with exponential backoff; a sink that keeps failing drops the
//! item and reports it. Running out of storage shuts the process down.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use image_reconstruction::GenerationId;
use replay_store::{FragmentStore, StoreError};
use waps_packet::WapsFragment;

use crate::events::{EventBus, IesEvent};
use crate::shutdown::Shutdown;
use crate::stats::SessionStats;

const ENOSPC: i32 = 28;
const EDQUOT: i32 = 122;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Rejected(String),
}

impl SinkError {
    /// Storage is exhausted; retrying will not help
    pub fn is_fatal(&self) -> bool {
        let code = match self {
            SinkError::Io(e) => e.raw_os_error(),
            SinkError::Store(e) => e.raw_os_error(),
            SinkError::Rejected(_) => None,
        };
        matches!(code, Some(ENOSPC) | Some(EDQUOT))
    }
}

pub type Result<T> = std::result::Result<T, SinkError>;

/// A blocking consumer of items
pub trait Sink<T>: Send + 'static {
    fn name(&self) -> &'static str;

    fn write(&mut self, item: &T) -> Result<()>;

    /// Called whenever the queue runs empty and on close
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Queue depth that raises a back-pressure event
    pub high_water: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 10_000,
            high_water: 1_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }

    /// Depth that raises a back-pressure event, never below 1
    pub fn high_water_mark(&self) -> usize {
        self.high_water.max(1)
    }

    /// Depth at which a lagging queue counts as caught up
    pub fn low_water_mark(&self) -> usize {
        self.high_water_mark() / 2
    }
}

/// Collaborators every sink worker reports to
#[derive(Clone)]
pub struct SinkContext {
    pub bus: EventBus,
    pub stats: Arc<SessionStats>,
    pub shutdown: Shutdown,
}

struct Queue {
    depth: AtomicUsize,
    lagging: AtomicBool,
}

/// Producer side of a sink. Submitting never blocks.
pub struct SinkHandle<T> {
    name: &'static str,
    tx: mpsc::UnboundedSender<T>,
    queue: Arc<Queue>,
    high_water: usize,
    bus: EventBus,
}

impl<T> Clone for SinkHandle<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
            queue: Arc::clone(&self.queue),
            high_water: self.high_water,
            bus: self.bus.clone(),
        }
    }
}

impl<T> SinkHandle<T> {
    pub fn submit(&self, item: T) {
        let depth = self.queue.depth.fetch_add(1, Ordering::SeqCst) + 1;
        if self.tx.send(item).is_err() {
            self.queue.depth.fetch_sub(1, Ordering::SeqCst);
            warn!("{} sink is closed, item dropped", self.name);
            return;
        }
        if depth >= self.high_water && !self.queue.lagging.swap(true, Ordering::SeqCst) {
            self.bus.publish(IesEvent::SinkBackpressure {
                sink: self.name.to_string(),
                depth,
                at: Utc::now(),
            });
        }
    }

    pub fn depth(&self) -> usize {
        self.queue.depth.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

pub struct SinkWorker {
    name: &'static str,
    thread: thread::JoinHandle<()>,
}

impl SinkWorker {
    /// Wait for the queue to drain. Every handle must be dropped first.
    pub fn join(self) {
        if self.thread.join().is_err() {
            warn!("{} sink worker panicked", self.name);
        }
    }

    /// [`join`](Self::join) without blocking the runtime
    pub async fn join_async(self) {
        let name = self.name;
        if tokio::task::spawn_blocking(move || self.join()).await.is_err() {
            warn!("{} sink join failed", name);
        }
    }
}

pub fn spawn_sink<T, S>(sink: S, retry: RetryPolicy, ctx: SinkContext) -> std::io::Result<(SinkHandle<T>, SinkWorker)>
where
    T: Send + 'static,
    S: Sink<T>,
{
    let name = sink.name();
    let (tx, rx) = mpsc::unbounded_channel();
    let queue = Arc::new(Queue {
        depth: AtomicUsize::new(0),
        lagging: AtomicBool::new(false),
    });
    let handle = SinkHandle {
        name,
        tx,
        queue: Arc::clone(&queue),
        high_water: retry.high_water_mark(),
        bus: ctx.bus.clone(),
    };
    let thread = thread::Builder::new()
        .name(format!("sink-{name}"))
        .spawn(move || run_worker(sink, rx, queue, retry, ctx))?;
    Ok((handle, SinkWorker { name, thread }))
}

fn run_worker<T, S: Sink<T>>(
    mut sink: S,
    mut rx: mpsc::UnboundedReceiver<T>,
    queue: Arc<Queue>,
    retry: RetryPolicy,
    ctx: SinkContext,
) {
    let name = sink.name();
    let mut out_of_storage = false;
    debug!("{} sink worker started", name);

    while let Some(item) = rx.blocking_recv() {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match sink.write(&item) {
                Ok(()) => break,
                Err(err) => err,
            };
            if err.is_fatal() {
                report(&ctx, name, &err, true, true);
                if !out_of_storage {
                    out_of_storage = true;
                    ctx.shutdown.trigger_fatal();
                }
                break;
            }
            // once storage ran out, drain without retrying
            if out_of_storage || attempt >= retry.max_attempts {
                report(&ctx, name, &err, true, false);
                break;
            }
            if attempt == 1 {
                report(&ctx, name, &err, false, false);
            }
            thread::sleep(retry.backoff(attempt));
        }

        let depth = queue.depth.fetch_sub(1, Ordering::SeqCst) - 1;
        if depth <= retry.low_water_mark() {
            queue.lagging.store(false, Ordering::SeqCst);
        }
        if depth == 0 {
            if let Err(e) = sink.flush() {
                warn!("{} sink flush failed: {}", name, e);
            }
        }
    }

    if let Err(e) = sink.flush() {
        warn!("{} sink final flush failed: {}", name, e);
    }
    debug!("{} sink worker stopped", name);
}

fn report(ctx: &SinkContext, sink: &str, err: &SinkError, dropped: bool, fatal: bool) {
    ctx.stats.record_sink_failure();
    ctx.bus.publish(IesEvent::SinkUnavailable {
        sink: sink.to_string(),
        error: err.to_string(),
        dropped,
        fatal,
        at: Utc::now(),
    });
}

/// Fragment to persist with the generation it was attributed to
#[derive(Debug, Clone)]
pub struct PersistRecord {
    pub generation: GenerationId,
    pub fragment: WapsFragment,
}

/// Persistence sink over any [`FragmentStore`]
pub struct StoreSink {
    store: Box<dyn FragmentStore>,
}

impl StoreSink {
    pub fn new(store: Box<dyn FragmentStore>) -> Self {
        Self { store }
    }
}

impl Sink<PersistRecord> for StoreSink {
    fn name(&self) -> &'static str {
        "store"
    }

    fn write(&mut self, record: &PersistRecord) -> Result<()> {
        if !self.store.append(record.generation.0, &record.fragment)? {
            debug!("{} already stored", record.fragment.name());
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.store.flush()?;
        Ok(())
    }
}
