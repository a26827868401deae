//! Bounded priority message queue with TTL, batching, and rate limiting
//!
//! One queue per concern per session; queues are never shared across clients.
//! Ordering is priority-first (Critical > High > Normal > Low), FIFO within a
//! priority. Expired entries are reclaimed on enqueue when at capacity and
//! skipped lazily on dequeue.

use async_trait::async_trait;
use signstream_core::MessagePriority;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue '{0}' is full")]
    Full(String),

    #[error("queue '{0}' is stopped")]
    Stopped(String),
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_size: usize,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub processor_count: usize,
    pub max_retries: u32,
    /// Bound on concurrently processing messages across processors.
    pub concurrency_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            batch_size: 10,
            batch_timeout: Duration::from_millis(10),
            processor_count: 1,
            max_retries: 3,
            concurrency_limit: 100,
        }
    }
}

/// A message plus its queueing metadata.
#[derive(Debug, Clone)]
pub struct QueuedMessage<T> {
    pub id: String,
    pub content: T,
    pub priority: MessagePriority,
    pub created_at: Instant,
    pub expires_at: Option<Instant>,
    pub retries: u32,
}

impl<T> QueuedMessage<T> {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

/// Handler invoked by queue processors.
#[async_trait]
pub trait QueueHandler<T: Sync>: Send + Sync {
    async fn handle(&self, message: &QueuedMessage<T>) -> anyhow::Result<()>;

    /// Invoked for a flushed batch of two or more messages. `priority` is the
    /// max priority over the batch members.
    async fn handle_batch(
        &self,
        messages: &[QueuedMessage<T>],
        priority: MessagePriority,
    ) -> anyhow::Result<()> {
        let _ = priority;
        for message in messages {
            self.handle(message).await?;
        }
        Ok(())
    }
}

/// Heap key: max-heap pops highest priority, then lowest sequence (FIFO).
struct HeapKey {
    priority: MessagePriority,
    seq: u64,
    id: String,
}

impl PartialEq for HeapKey {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for HeapKey {}

impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct Inner<T> {
    heap: BinaryHeap<HeapKey>,
    lookup: HashMap<String, QueuedMessage<T>>,
    seq: u64,
}

#[derive(Default)]
struct Counters {
    queued: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    expired: AtomicU64,
}

pub struct MessageQueue<T> {
    name: String,
    config: QueueConfig,
    inner: Mutex<Inner<T>>,
    notify: Notify,
    handlers: Mutex<Vec<Arc<dyn QueueHandler<T>>>>,
    pending_batch: Mutex<Vec<QueuedMessage<T>>>,
    batch_timer: Mutex<Option<JoinHandle<()>>>,
    rate_limiter: Arc<Semaphore>,
    cancel: CancellationToken,
    counters: Counters,
    processing_times: Mutex<VecDeque<f64>>,
    throughput_samples: Mutex<VecDeque<u64>>,
}

impl<T: Clone + Send + Sync + 'static> MessageQueue<T> {
    pub fn new(name: impl Into<String>, config: QueueConfig) -> Arc<Self> {
        let name = name.into();
        debug!(queue = %name, max_size = config.max_size, "message queue created");
        Arc::new(Self {
            name,
            rate_limiter: Arc::new(Semaphore::new(config.concurrency_limit.max(1))),
            config,
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                lookup: HashMap::new(),
                seq: 0,
            }),
            notify: Notify::new(),
            handlers: Mutex::new(Vec::new()),
            pending_batch: Mutex::new(Vec::new()),
            batch_timer: Mutex::new(None),
            cancel: CancellationToken::new(),
            counters: Counters::default(),
            processing_times: Mutex::new(VecDeque::new()),
            throughput_samples: Mutex::new(VecDeque::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a message. When at capacity, expired entries are reclaimed
    /// first; if the queue is still full the message is rejected.
    pub fn enqueue(
        &self,
        content: T,
        priority: MessagePriority,
        ttl: Option<Duration>,
    ) -> Result<String, QueueError> {
        self.enqueue_message(content, priority, ttl, None, 0)
    }

    fn enqueue_message(
        &self,
        content: T,
        priority: MessagePriority,
        ttl: Option<Duration>,
        id: Option<String>,
        retries: u32,
    ) -> Result<String, QueueError> {
        if self.cancel.is_cancelled() {
            return Err(QueueError::Stopped(self.name.clone()));
        }
        let now = Instant::now();
        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        {
            let mut inner = self.inner.lock().expect("queue poisoned");
            if inner.lookup.len() >= self.config.max_size {
                let expired: Vec<String> = inner
                    .lookup
                    .iter()
                    .filter(|(_, m)| m.is_expired(now))
                    .map(|(id, _)| id.clone())
                    .collect();
                for expired_id in &expired {
                    inner.lookup.remove(expired_id);
                    self.counters.expired.fetch_add(1, Ordering::Relaxed);
                }
                if inner.lookup.len() >= self.config.max_size {
                    return Err(QueueError::Full(self.name.clone()));
                }
            }

            inner.seq += 1;
            let seq = inner.seq;
            inner.heap.push(HeapKey {
                priority,
                seq,
                id: id.clone(),
            });
            inner.lookup.insert(
                id.clone(),
                QueuedMessage {
                    id: id.clone(),
                    content,
                    priority,
                    created_at: now,
                    expires_at: ttl.map(|t| now + t),
                    retries,
                },
            );
        }

        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        Ok(id)
    }

    /// Pop the highest-priority non-expired message, waiting up to `timeout`.
    pub async fn dequeue(&self, timeout: Duration) -> Option<QueuedMessage<T>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = self.try_dequeue() {
                return Some(message);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(deadline - now) => return None,
                _ = self.cancel.cancelled() => return None,
            }
        }
    }

    /// Non-blocking dequeue, skipping stale heap keys and expired entries.
    pub fn try_dequeue(&self) -> Option<QueuedMessage<T>> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("queue poisoned");
        while let Some(key) = inner.heap.pop() {
            let Some(message) = inner.lookup.remove(&key.id) else {
                continue; // reclaimed while still on the heap
            };
            if message.is_expired(now) {
                self.counters.expired.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            return Some(message);
        }
        None
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().expect("queue poisoned").lookup.len()
    }

    pub fn add_handler(&self, handler: Arc<dyn QueueHandler<T>>) {
        self.handlers.lock().expect("handlers poisoned").push(handler);
    }

    /// Start processor workers and the throughput monitor.
    pub fn start(self: &Arc<Self>) {
        for index in 0..self.config.processor_count {
            let queue = self.clone();
            tokio::spawn(async move { queue.processor_loop(index).await });
        }
        let queue = self.clone();
        tokio::spawn(async move { queue.throughput_monitor().await });
        debug!(
            queue = %self.name,
            processors = self.config.processor_count,
            "message queue started"
        );
    }

    /// Stop processors; pending work is dropped.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.notify.notify_waiters();
        if let Some(timer) = self.batch_timer.lock().expect("timer poisoned").take() {
            timer.abort();
        }
    }

    async fn processor_loop(self: Arc<Self>, index: usize) {
        debug!(queue = %self.name, index, "processor started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let Ok(_permit) = self.rate_limiter.clone().acquire_owned().await else {
                break;
            };
            let message = tokio::select! {
                m = self.dequeue(Duration::from_secs(1)) => m,
                _ = self.cancel.cancelled() => break,
            };
            let Some(message) = message else {
                // nothing arrived; flush a lingering partial batch
                self.flush_batch().await;
                continue;
            };

            if self.config.batch_size > 1 && message.priority < MessagePriority::Critical {
                self.add_to_batch(message).await;
            } else {
                self.process_one(message).await;
            }
        }
        debug!(queue = %self.name, index, "processor stopped");
    }

    async fn add_to_batch(self: &Arc<Self>, message: QueuedMessage<T>) {
        let (flush_now, arm_timer) = {
            let mut pending = self.pending_batch.lock().expect("batch poisoned");
            pending.push(message);
            (pending.len() >= self.config.batch_size, pending.len() == 1)
        };

        if flush_now {
            self.flush_batch().await;
        } else if arm_timer {
            let queue = self.clone();
            let timeout = self.config.batch_timeout;
            let handle = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                // drop our own handle without aborting, then flush
                queue.batch_timer.lock().expect("timer poisoned").take();
                queue.flush_pending().await;
            });
            if let Some(previous) = self
                .batch_timer
                .lock()
                .expect("timer poisoned")
                .replace(handle)
            {
                previous.abort();
            }
        }
    }

    /// Flush the pending batch: one message runs alone, two or more run as a
    /// synthetic batch at the max priority of its members.
    pub async fn flush_batch(&self) {
        if let Some(timer) = self.batch_timer.lock().expect("timer poisoned").take() {
            timer.abort();
        }
        self.flush_pending().await;
    }

    async fn flush_pending(&self) {
        let batch: Vec<QueuedMessage<T>> = {
            let mut pending = self.pending_batch.lock().expect("batch poisoned");
            pending.drain(..).collect()
        };
        if batch.is_empty() {
            return;
        }
        if batch.len() == 1 {
            let message = batch.into_iter().next().expect("len checked");
            self.process_one(message).await;
            return;
        }

        let started = Instant::now();
        let priority = batch
            .iter()
            .map(|m| m.priority)
            .max()
            .unwrap_or(MessagePriority::Normal);
        let handlers = self.handlers.lock().expect("handlers poisoned").clone();
        let mut failed = false;
        for handler in handlers {
            if let Err(e) = handler.handle_batch(&batch, priority).await {
                error!(queue = %self.name, error = %e, "batch handler failed");
                failed = true;
                break;
            }
        }

        if failed {
            for message in batch {
                self.retry_or_fail(message);
            }
        } else {
            let elapsed = started.elapsed().as_secs_f64() * 1000.0;
            self.record_processed(batch.len() as u64, elapsed);
        }
    }

    async fn process_one(&self, message: QueuedMessage<T>) {
        let started = Instant::now();
        let handlers = self.handlers.lock().expect("handlers poisoned").clone();
        for handler in handlers {
            if let Err(e) = handler.handle(&message).await {
                warn!(queue = %self.name, id = %message.id, error = %e, "handler failed");
                self.retry_or_fail(message);
                return;
            }
        }
        let elapsed = started.elapsed().as_secs_f64() * 1000.0;
        self.record_processed(1, elapsed);
    }

    fn retry_or_fail(&self, message: QueuedMessage<T>) {
        if message.retries < self.config.max_retries {
            let retries = message.retries + 1;
            debug!(queue = %self.name, id = %message.id, retries, "requeueing message");
            let _ = self.enqueue_message(
                message.content,
                message.priority,
                message.expires_at.map(|at| {
                    at.checked_duration_since(Instant::now())
                        .unwrap_or(Duration::ZERO)
                }),
                Some(message.id),
                retries,
            );
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            error!(queue = %self.name, id = %message.id, "message failed after retries");
        }
    }

    fn record_processed(&self, count: u64, elapsed_ms: f64) {
        self.counters.processed.fetch_add(count, Ordering::Relaxed);
        let mut times = self.processing_times.lock().expect("times poisoned");
        times.push_back(elapsed_ms);
        while times.len() > 1000 {
            times.pop_front();
        }
    }

    async fn throughput_monitor(self: Arc<Self>) {
        let mut last_processed = 0u64;
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = self.cancel.cancelled() => break,
            }
            let processed = self.counters.processed.load(Ordering::Relaxed);
            let delta = processed.saturating_sub(last_processed);
            last_processed = processed;
            let mut samples = self.throughput_samples.lock().expect("samples poisoned");
            samples.push_back(delta);
            while samples.len() > 60 {
                samples.pop_front();
            }
        }
    }

    pub fn stats(&self) -> serde_json::Value {
        let avg_processing = {
            let times = self.processing_times.lock().expect("times poisoned");
            if times.is_empty() {
                0.0
            } else {
                times.iter().sum::<f64>() / times.len() as f64
            }
        };
        let throughput = {
            let samples = self.throughput_samples.lock().expect("samples poisoned");
            if samples.is_empty() {
                0.0
            } else {
                samples.iter().sum::<u64>() as f64 / samples.len() as f64
            }
        };
        serde_json::json!({
            "name": self.name,
            "queue_depth": self.depth(),
            "messages_queued": self.counters.queued.load(Ordering::Relaxed),
            "messages_processed": self.counters.processed.load(Ordering::Relaxed),
            "messages_failed": self.counters.failed.load(Ordering::Relaxed),
            "messages_expired": self.counters.expired.load(Ordering::Relaxed),
            "avg_processing_time_ms": avg_processing,
            "throughput_per_second": throughput,
            "batch_size": self.config.batch_size,
            "pending_batch_size": self.pending_batch.lock().expect("batch poisoned").len(),
            "is_processing": !self.cancel.is_cancelled(),
        })
    }
}
