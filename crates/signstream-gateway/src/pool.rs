//! Connection pool — owns every live session and its lifecycle
//!
//! One session per connection: its own ingress queue, pipeline worker, and
//! egress worker. Pool-global state lives in a DashMap and atomics, never
//! held across I/O. Egress batches non-priority messages (flush on size, a
//! short timer, or the receive wait timing out); priority sends bypass
//! batching entirely.

use async_trait::async_trait;
use dashmap::DashMap;
use signstream_core::config::AppConfig;
use signstream_core::{ClientId, Error, MessagePriority, QualityProfile, Result, ServerMessage};
use signstream_llm::AnalysisService;
use signstream_media::LandmarkExtractor;
use signstream_session::{
    MessageQueue, Outbound, PipelineCommand, PipelineStats, PipelineWorker, ProcessingPipeline,
    QueueConfig,
};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Inactivity window after which a client is considered stale.
const STALE_THRESHOLD: Duration = Duration::from_secs(300);
/// Grace between the shutdown notice and closing sessions.
const SHUTDOWN_NOTICE_GRACE: Duration = Duration::from_millis(500);
const LATENCY_SAMPLE_CAP: usize = 100;
const EGRESS_WAIT: Duration = Duration::from_secs(1);

/// Transport write-half abstraction so the pool can drive any bidirectional
/// connection (and tests can drive a recording sink).
#[async_trait]
pub trait MessageSink: Send {
    async fn send_text(&mut self, text: String) -> anyhow::Result<()>;
    async fn close(&mut self);
}

/// Per-connection transfer counters and rolling latency samples.
#[derive(Debug)]
struct ConnectionMetrics {
    connected_at_wall: chrono::DateTime<chrono::Utc>,
    messages_sent: u64,
    messages_received: u64,
    bytes_sent: u64,
    bytes_received: u64,
    errors: u64,
    latency_samples: VecDeque<f64>,
}

impl ConnectionMetrics {
    fn new() -> Self {
        Self {
            connected_at_wall: chrono::Utc::now(),
            messages_sent: 0,
            messages_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
            errors: 0,
            latency_samples: VecDeque::new(),
        }
    }

    fn avg_latency_ms(&self) -> f64 {
        if self.latency_samples.is_empty() {
            return 0.0;
        }
        self.latency_samples.iter().sum::<f64>() / self.latency_samples.len() as f64
    }
}

/// All state tied to one client connection.
pub struct ClientSession {
    pub id: ClientId,
    pub group: String,
    connected_at: Instant,
    pub ingress: Arc<MessageQueue<PipelineCommand>>,
    egress_tx: mpsc::Sender<Outbound>,
    pub stats: Arc<PipelineStats>,
    metrics: Mutex<ConnectionMetrics>,
    healthy: AtomicBool,
    unhealthy_since: Mutex<Option<Instant>>,
    last_activity: Mutex<Instant>,
    cancel: CancellationToken,
}

impl ClientSession {
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    fn mark_unhealthy(&self) {
        if self.healthy.swap(false, Ordering::Relaxed) {
            warn!(client = %self.id, "connection marked unhealthy");
            *self.unhealthy_since.lock().expect("lock poisoned") = Some(Instant::now());
        }
    }

    fn clear_unhealthy(&self) {
        if !self.healthy.swap(true, Ordering::Relaxed) {
            info!(client = %self.id, "connection recovered");
            *self.unhealthy_since.lock().expect("lock poisoned") = None;
        }
    }

    fn unhealthy_for(&self) -> Option<Duration> {
        self.unhealthy_since
            .lock()
            .expect("lock poisoned")
            .map(|at| at.elapsed())
    }

    /// Record inbound traffic and refresh the activity clock.
    pub fn record_received(&self, bytes: usize) {
        let mut metrics = self.metrics.lock().expect("lock poisoned");
        metrics.messages_received += 1;
        metrics.bytes_received += bytes as u64;
        drop(metrics);
        self.touch();
    }

    pub fn touch(&self) {
        *self.last_activity.lock().expect("lock poisoned") = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().expect("lock poisoned").elapsed()
    }

    fn record_sent(&self, bytes: usize, latency_ms: f64) {
        let mut metrics = self.metrics.lock().expect("lock poisoned");
        metrics.messages_sent += 1;
        metrics.bytes_sent += bytes as u64;
        metrics.latency_samples.push_back(latency_ms);
        while metrics.latency_samples.len() > LATENCY_SAMPLE_CAP {
            metrics.latency_samples.pop_front();
        }
    }

    fn record_send_error(&self) {
        self.metrics.lock().expect("lock poisoned").errors += 1;
        self.mark_unhealthy();
    }

    pub fn metrics_snapshot(&self) -> serde_json::Value {
        let metrics = self.metrics.lock().expect("lock poisoned");
        serde_json::json!({
            "client_id": self.id.as_str(),
            "group": self.group,
            "connected_at": metrics.connected_at_wall.to_rfc3339(),
            "connection_duration_seconds": self.connected_at.elapsed().as_secs_f64(),
            "messages_sent": metrics.messages_sent,
            "messages_received": metrics.messages_received,
            "bytes_sent": metrics.bytes_sent,
            "bytes_received": metrics.bytes_received,
            "errors": metrics.errors,
            "avg_latency_ms": metrics.avg_latency_ms(),
            "is_healthy": self.is_healthy(),
            "queue_depth": self.ingress.depth(),
            "pipeline": self.stats.snapshot(),
        })
    }
}

pub struct ConnectionPool {
    config: AppConfig,
    extractor: Arc<dyn LandmarkExtractor>,
    analysis: Arc<AnalysisService>,
    sessions: DashMap<ClientId, Arc<ClientSession>>,
    groups: DashMap<String, HashSet<ClientId>>,
    shutting_down: AtomicBool,
    total_connections: AtomicU64,
    peak_connections: AtomicU64,
    started_at: Instant,
    cancel: CancellationToken,
}

impl ConnectionPool {
    pub fn new(
        config: AppConfig,
        extractor: Arc<dyn LandmarkExtractor>,
        analysis: Arc<AnalysisService>,
    ) -> Arc<Self> {
        info!(
            max_connections = config.pool.max_connections,
            "connection pool initialized"
        );
        Arc::new(Self {
            config,
            extractor,
            analysis,
            sessions: DashMap::new(),
            groups: DashMap::new(),
            shutting_down: AtomicBool::new(false),
            total_connections: AtomicU64::new(0),
            peak_connections: AtomicU64::new(0),
            started_at: Instant::now(),
            cancel: CancellationToken::new(),
        })
    }

    /// Start background workers (health probing).
    pub fn start(self: &Arc<Self>) {
        let pool = self.clone();
        tokio::spawn(async move { pool.health_check_loop().await });
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> usize {
        self.sessions.len()
    }

    /// Register a new connection: assign an id, create the session with its
    /// ingress queue and pipeline, and start its egress worker.
    pub fn connect(
        self: &Arc<Self>,
        sink: Box<dyn MessageSink>,
        group: &str,
    ) -> Result<Arc<ClientSession>> {
        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }
        if self.sessions.len() >= self.config.pool.max_connections {
            return Err(Error::CapacityExceeded(format!(
                "pool full (max: {})",
                self.config.pool.max_connections
            )));
        }

        let id = ClientId::new(uuid::Uuid::new_v4().to_string());
        let ingress = MessageQueue::new(
            format!("ingress-{}", id),
            QueueConfig {
                max_size: self.config.pool.max_queue_size,
                batch_size: 1,
                processor_count: 0,
                ..QueueConfig::default()
            },
        );
        let stats = Arc::new(PipelineStats::new(
            self.config.video.default_quality_profile(),
        ));
        let (egress_tx, egress_rx) = mpsc::channel(self.config.pool.max_queue_size.max(16));
        let cancel = self.cancel.child_token();

        let session = Arc::new(ClientSession {
            id: id.clone(),
            group: group.to_string(),
            connected_at: Instant::now(),
            ingress: ingress.clone(),
            egress_tx: egress_tx.clone(),
            stats: stats.clone(),
            metrics: Mutex::new(ConnectionMetrics::new()),
            healthy: AtomicBool::new(true),
            unhealthy_since: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            cancel,
        });

        self.sessions.insert(id.clone(), session.clone());
        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(id.clone());
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.peak_connections
            .fetch_max(self.sessions.len() as u64, Ordering::Relaxed);

        let (pipeline, analysis_rx) = ProcessingPipeline::new(
            id.clone(),
            &self.config,
            self.extractor.clone(),
            self.analysis.clone(),
            egress_tx,
            ingress,
            stats,
        );
        let worker = PipelineWorker::new(pipeline, analysis_rx, session.cancel.child_token());
        tokio::spawn(worker.run());

        let egress_session = session.clone();
        let batch_size = self.config.pool.batch_size;
        let batch_timeout = Duration::from_millis(self.config.pool.batch_timeout_ms);
        tokio::spawn(async move {
            egress_worker(egress_session, egress_rx, sink, batch_size, batch_timeout).await;
        });

        info!(client = %id, group, "client connected to pool");
        Ok(session)
    }

    /// Tear a session down. Idempotent; safe to call while frames are in
    /// flight — their responses are suppressed once the egress closes.
    pub async fn disconnect(&self, id: &ClientId) {
        let Some((_, session)) = self.sessions.remove(id) else {
            return;
        };
        if let Some(mut group) = self.groups.get_mut(&session.group) {
            group.remove(id);
        }
        session.cancel.cancel();
        session.ingress.stop();
        info!(client = %id, "client disconnected from pool");
    }

    /// Enqueue a message for one client. Returns false when the session is
    /// missing, marked unhealthy, or its egress queue is full.
    pub fn send(
        &self,
        id: &ClientId,
        message: ServerMessage,
        priority: bool,
        may_batch: bool,
    ) -> bool {
        let Some(session) = self.sessions.get(id) else {
            return false;
        };
        if !session.is_healthy() {
            return false;
        }
        self.push_egress(&session, message, priority, may_batch)
    }

    fn push_egress(
        &self,
        session: &ClientSession,
        message: ServerMessage,
        priority: bool,
        may_batch: bool,
    ) -> bool {
        let outbound = Outbound {
            message,
            priority,
            may_batch,
        };
        match session.egress_tx.try_send(outbound) {
            Ok(()) => true,
            Err(_) => {
                session.record_send_error();
                false
            }
        }
    }

    /// Fan a message out to every client (optionally one group, minus
    /// exclusions).
    pub fn broadcast(
        &self,
        message: &ServerMessage,
        group: Option<&str>,
        exclude: Option<&HashSet<ClientId>>,
    ) -> usize {
        let targets: Vec<Arc<ClientSession>> = match group {
            Some(group) => {
                let Some(members) = self.groups.get(group) else {
                    return 0;
                };
                members
                    .iter()
                    .filter_map(|id| self.sessions.get(id).map(|s| s.clone()))
                    .collect()
            }
            None => self.sessions.iter().map(|e| e.value().clone()).collect(),
        };

        let mut sent = 0;
        for session in targets {
            if exclude.is_some_and(|set| set.contains(&session.id)) {
                continue;
            }
            if session.is_healthy() && self.push_egress(&session, message.clone(), false, true) {
                sent += 1;
            }
        }
        debug!(sent, "broadcast delivered");
        sent
    }

    pub fn get_session(&self, id: &ClientId) -> Option<Arc<ClientSession>> {
        self.sessions.get(id).map(|s| s.clone())
    }

    pub fn client_metrics(&self, id: &ClientId) -> Option<serde_json::Value> {
        self.sessions.get(id).map(|s| s.metrics_snapshot())
    }

    /// Operator override: pin a client's quality profile until the next
    /// adaptation cycle.
    pub fn force_profile(&self, id: &ClientId, profile: QualityProfile) -> bool {
        let Some(session) = self.sessions.get(id) else {
            return false;
        };
        session
            .ingress
            .enqueue(
                PipelineCommand::ForceProfile { profile },
                MessagePriority::High,
                None,
            )
            .is_ok()
    }

    pub fn stats(&self) -> serde_json::Value {
        let mut messages_sent = 0u64;
        let mut messages_received = 0u64;
        let mut bytes_sent = 0u64;
        let mut bytes_received = 0u64;
        let mut errors = 0u64;
        let mut latency_sum = 0.0;
        let mut latency_count = 0usize;
        let mut unhealthy = 0usize;
        let mut queue_depths = serde_json::Map::new();

        for entry in self.sessions.iter() {
            let session = entry.value();
            let metrics = session.metrics.lock().expect("lock poisoned");
            messages_sent += metrics.messages_sent;
            messages_received += metrics.messages_received;
            bytes_sent += metrics.bytes_sent;
            bytes_received += metrics.bytes_received;
            errors += metrics.errors;
            if !metrics.latency_samples.is_empty() {
                latency_sum += metrics.avg_latency_ms();
                latency_count += 1;
            }
            drop(metrics);
            if !session.is_healthy() {
                unhealthy += 1;
            }
            queue_depths.insert(
                session.id.as_str().to_string(),
                session.ingress.depth().into(),
            );
        }

        let operations = messages_sent + messages_received;
        serde_json::json!({
            "total_connections": self.total_connections.load(Ordering::Relaxed),
            "active_connections": self.sessions.len(),
            "peak_connections": self.peak_connections.load(Ordering::Relaxed),
            "unhealthy_connections": unhealthy,
            "total_messages_sent": messages_sent,
            "total_messages_received": messages_received,
            "total_bytes_sent": bytes_sent,
            "total_bytes_received": bytes_received,
            "avg_latency_ms": if latency_count > 0 { latency_sum / latency_count as f64 } else { 0.0 },
            "error_rate_percent": if operations > 0 { errors as f64 / operations as f64 * 100.0 } else { 0.0 },
            "uptime_seconds": self.started_at.elapsed().as_secs_f64(),
            "shutting_down": self.is_shutting_down(),
            "queue_depths": queue_depths,
        })
    }

    async fn health_check_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.pool.health_check_interval_secs.max(1));
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = self.cancel.cancelled() => break,
            }

            let sessions: Vec<Arc<ClientSession>> =
                self.sessions.iter().map(|e| e.value().clone()).collect();
            let mut to_disconnect = Vec::new();

            for session in sessions {
                if session.idle_for() > STALE_THRESHOLD {
                    info!(client = %session.id, "stale connection, disconnecting");
                    to_disconnect.push(session.id.clone());
                    continue;
                }
                if session.unhealthy_for().is_some_and(|d| d > interval) {
                    info!(client = %session.id, "unhealthy connection did not recover, disconnecting");
                    to_disconnect.push(session.id.clone());
                    continue;
                }
                // Probe regardless of health; a successful write clears the
                // unhealthy mark in the egress worker.
                self.push_egress(&session, ServerMessage::health_ping(), true, false);
            }

            for id in to_disconnect {
                self.disconnect(&id).await;
            }
        }
    }

    /// Graceful shutdown: refuse new connections, notify every client, close
    /// sessions in parallel under a deadline, then force-close stragglers.
    pub async fn shutdown(self: &Arc<Self>) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            active = self.sessions.len(),
            "starting graceful pool shutdown"
        );

        let sessions: Vec<Arc<ClientSession>> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        for session in &sessions {
            self.push_egress(session, ServerMessage::server_shutdown(), true, false);
        }
        tokio::time::sleep(SHUTDOWN_NOTICE_GRACE).await;

        let deadline = Duration::from_secs(self.config.pool.shutdown_timeout_secs);
        let mut tasks = Vec::new();
        for session in &sessions {
            let pool = self.clone();
            let id = session.id.clone();
            tasks.push(tokio::spawn(async move { pool.disconnect(&id).await }));
        }
        let drained = tokio::time::timeout(deadline, futures::future::join_all(tasks)).await;
        if drained.is_err() {
            warn!("graceful shutdown deadline exceeded, force closing");
        }

        // Anything still registered gets force-closed.
        let remaining: Vec<ClientId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in remaining {
            self.disconnect(&id).await;
        }

        self.cancel.cancel();
        info!("connection pool shut down");
    }
}

/// Single cooperative egress task per client: accumulates non-priority
/// messages and flushes on size, timer, or wait timeout.
async fn egress_worker(
    session: Arc<ClientSession>,
    mut rx: mpsc::Receiver<Outbound>,
    mut sink: Box<dyn MessageSink>,
    batch_size: usize,
    batch_timeout: Duration,
) {
    let mut pending: Vec<ServerMessage> = Vec::new();
    let mut deadline: Option<Instant> = None;

    loop {
        let wait = deadline
            .map(|d| d.saturating_duration_since(Instant::now()).min(EGRESS_WAIT))
            .unwrap_or(EGRESS_WAIT);

        let received = tokio::select! {
            _ = session.cancel.cancelled() => break,
            received = tokio::time::timeout(wait, rx.recv()) => received,
        };

        match received {
            Ok(Some(outbound)) => {
                if outbound.priority || !outbound.may_batch {
                    send_now(&session, sink.as_mut(), outbound.message).await;
                } else {
                    pending.push(outbound.message);
                    if pending.len() >= batch_size {
                        flush(&session, sink.as_mut(), &mut pending, &mut deadline).await;
                    } else if pending.len() == 1 {
                        deadline = Some(Instant::now() + batch_timeout);
                    }
                }
            }
            Ok(None) => break,
            Err(_) => {
                // wait timed out
                if !pending.is_empty() {
                    flush(&session, sink.as_mut(), &mut pending, &mut deadline).await;
                }
            }
        }

        if deadline.is_some_and(|d| Instant::now() >= d) {
            flush(&session, sink.as_mut(), &mut pending, &mut deadline).await;
        }
    }

    if !pending.is_empty() {
        flush(&session, sink.as_mut(), &mut pending, &mut deadline).await;
    }
    sink.close().await;
    debug!(client = %session.id, "egress worker stopped");
}

async fn flush(
    session: &ClientSession,
    sink: &mut dyn MessageSink,
    pending: &mut Vec<ServerMessage>,
    deadline: &mut Option<Instant>,
) {
    *deadline = None;
    if pending.is_empty() {
        return;
    }
    let messages: Vec<ServerMessage> = pending.drain(..).collect();
    if messages.len() == 1 {
        let message = messages.into_iter().next().expect("len checked");
        send_now(session, sink, message).await;
    } else {
        send_now(session, sink, ServerMessage::batch(messages)).await;
    }
}

async fn send_now(session: &ClientSession, sink: &mut dyn MessageSink, message: ServerMessage) {
    let text = match serde_json::to_string(&message) {
        Ok(text) => text,
        Err(e) => {
            warn!(client = %session.id, error = %e, "failed to serialize message");
            return;
        }
    };
    let bytes = text.len();
    let started = Instant::now();
    match sink.send_text(text).await {
        Ok(()) => {
            session.record_sent(bytes, started.elapsed().as_secs_f64() * 1000.0);
            session.clear_unhealthy();
        }
        Err(e) => {
            warn!(client = %session.id, error = %e, "egress send failed");
            session.record_send_error();
        }
    }
}
