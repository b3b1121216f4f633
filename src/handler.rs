//! Agent orchestration: lifecycle, background tasks and the host-facing API.
//!
//! One [`GuardAgentHandler`] exists per `(api_key, project_id, endpoint)`
//! triple; the [`guard_agent`] factory returns the existing instance for a
//! repeated construction. The handler owns the buffer and the transport and
//! runs three background tasks while started:
//!
//! 1. **Flusher** — wakes on the flush interval or the buffer's high-water
//!    signal, swaps the queues and ships both batches concurrently.
//! 2. **Heartbeat** — pushes an [`AgentStatus`] snapshot every
//!    `flush_interval × 2` seconds and persists it to the durable store.
//! 3. **Rule poller** — fetches the dynamic rule document and publishes
//!    changed versions to subscribers.
//!
//! Each task is an independent loop on its own cancellation token, so the
//! tasks can be torn down individually and `stop()` stays bounded.
//!
//! Producer-facing calls never fail once the agent has started: transport
//! and store problems are absorbed into counters and surface through
//! [`GuardAgentHandler::get_status`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::EventBuffer;
use crate::circuit_breaker::CircuitState;
use crate::config::{AgentConfig, ConfigError};
use crate::encryption::EncryptionError;
use crate::models::{AgentHealth, AgentStatus, DynamicRules, SecurityEvent, SecurityMetric};
use crate::store::{SharedStore, STATUS_TTL};
use crate::transport::{HttpTransport, TransportError};
use crate::utils::get_current_timestamp;
use crate::AGENT_VERSION;

/// Errors surfaced by the handler factory and `start`.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("an agent already exists for this project with a different configuration")]
    ConfigConflict,

    #[error("encryption initialization failed: {0}")]
    EncryptionInit(#[source] EncryptionError),

    #[error("startup error: {0}")]
    Startup(String),
}

/// Handler lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Default)]
struct Counters {
    events_received: AtomicU64,
    metrics_received: AtomicU64,
    events_sent: AtomicU64,
    metrics_sent: AtomicU64,
    events_failed: AtomicU64,
    metrics_failed: AtomicU64,
    errors: AtomicU64,
    dropped_encrypted: AtomicU64,
    rules_fetched: AtomicU64,
    /// Consecutive delivery failures, tracked per stream so a healthy
    /// metrics channel cannot mask a failing events channel (or vice
    /// versa) in the degraded-status check.
    consecutive_event_failures: AtomicU64,
    consecutive_metric_failures: AtomicU64,
}

/// Singleton orchestrator for the guard agent.
pub struct GuardAgentHandler {
    config: Arc<AgentConfig>,
    buffer: Arc<EventBuffer>,
    transport: Arc<HttpTransport>,
    store: tokio::sync::RwLock<Option<SharedStore>>,
    counters: Counters,
    state: Mutex<AgentState>,
    /// Serialises start/stop; never held across producer calls.
    lifecycle: tokio::sync::Mutex<()>,
    cancel: Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started_at: Mutex<Option<Instant>>,
    rules_tx: watch::Sender<Option<DynamicRules>>,
}

impl std::fmt::Debug for GuardAgentHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardAgentHandler").finish_non_exhaustive()
    }
}

type RegistryKey = (String, String, String);

fn registry() -> &'static Mutex<HashMap<RegistryKey, Arc<GuardAgentHandler>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<RegistryKey, Arc<GuardAgentHandler>>>> =
        OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Singleton factory: returns the handler registered for the configuration's
/// `(api_key, project_id, endpoint)` identity, creating it on first use.
///
/// A repeated construction with the same identity but different remaining
/// options fails with [`AgentError::ConfigConflict`]; configuration is
/// frozen at first construction.
pub fn guard_agent(config: AgentConfig) -> Result<Arc<GuardAgentHandler>, AgentError> {
    config.validate()?;

    let key = (
        config.api_key.clone(),
        config.project_id.clone(),
        config.endpoint.clone(),
    );

    let mut registry = registry().lock().expect("registry lock poisoned");
    if let Some(existing) = registry.get(&key) {
        if *existing.config != config {
            return Err(AgentError::ConfigConflict);
        }
        return Ok(Arc::clone(existing));
    }

    let handler = Arc::new(GuardAgentHandler::new(config)?);
    registry.insert(key, Arc::clone(&handler));
    Ok(handler)
}

/// Clears the handler registry. Test hook only; running handlers are not
/// stopped.
pub fn reset_registry() {
    registry().lock().expect("registry lock poisoned").clear();
}

impl GuardAgentHandler {
    fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let config = Arc::new(config);
        let transport = HttpTransport::new(Arc::clone(&config))
            .map_err(|e| AgentError::Startup(e.to_string()))?;
        let buffer = EventBuffer::new(&config);
        let (rules_tx, _) = watch::channel(None);

        Ok(GuardAgentHandler {
            config,
            buffer: Arc::new(buffer),
            transport: Arc::new(transport),
            store: tokio::sync::RwLock::new(None),
            counters: Counters::default(),
            state: Mutex::new(AgentState::Stopped),
            lifecycle: tokio::sync::Mutex::new(()),
            cancel: Mutex::new(CancellationToken::new()),
            tasks: Mutex::new(Vec::new()),
            started_at: Mutex::new(None),
            rules_tx,
        })
    }

    /// Starts the agent: verifies the encryption key, recovers spilled
    /// items from the durable store and spawns the background tasks.
    /// Idempotent; calling `start` on a running agent succeeds.
    pub async fn start(self: &Arc<Self>) -> Result<(), AgentError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() == AgentState::Running {
            warn!("Agent is already running");
            return Ok(());
        }
        self.set_state(AgentState::Starting);

        if let Err(err) = self.transport.verify_encryption() {
            self.set_state(AgentState::Stopped);
            return Err(AgentError::EncryptionInit(err));
        }

        self.buffer.recover().await;

        let token = CancellationToken::new();
        *self.cancel.lock().expect("cancel lock poisoned") = token.clone();

        let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
        tasks.push(self.spawn_flusher(token.clone()));
        tasks.push(self.spawn_heartbeat(token.clone()));
        tasks.push(self.spawn_rule_poller(token));
        drop(tasks);

        *self.started_at.lock().expect("started_at lock poisoned") = Some(Instant::now());
        self.set_state(AgentState::Running);
        info!("Agent started (project {})", self.config.project_id);
        Ok(())
    }

    /// Stops the agent: cancels the background tasks, performs a final
    /// flush bounded by `max(flush_interval, 5 s)` and joins the tasks.
    /// Idempotent and infallible; once entered it runs to completion.
    pub async fn stop(self: &Arc<Self>) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() == AgentState::Stopped {
            return;
        }
        self.set_state(AgentState::Stopping);
        info!("Stopping agent");

        self.cancel.lock().expect("cancel lock poisoned").cancel();

        let deadline = Duration::from_secs(self.config.flush_interval.max(5));
        if tokio::time::timeout(deadline, self.flush_once()).await.is_err() {
            warn!("Final flush exceeded shutdown deadline, abandoning");
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
            tasks.drain(..).collect()
        };
        for mut handle in handles {
            if tokio::time::timeout(Duration::from_secs(5), &mut handle).await.is_err() {
                warn!("Background task did not stop in time, aborting");
                handle.abort();
            }
        }

        self.set_state(AgentState::Stopped);
        info!("Agent stopped");
    }

    /// Enqueues a security event. No-op when events are disabled; never
    /// fails once the agent has started.
    pub async fn send_event(&self, event: SecurityEvent) {
        if !self.config.enable_events {
            return;
        }
        self.counters.events_received.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Event buffered: {:?} from {}",
            event.event_type, event.ip_address
        );
        self.buffer.add_event(event).await;
    }

    /// Enqueues a metric. No-op when metrics are disabled.
    pub async fn send_metric(&self, metric: SecurityMetric) {
        if !self.config.enable_metrics {
            return;
        }
        self.counters.metrics_received.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Metric buffered: {:?} = {}",
            metric.metric_type, metric.value
        );
        self.buffer.add_metric(metric).await;
    }

    /// Attaches a durable store. Permitted before or after start; when the
    /// agent is already running and was memory-only, spilled state from a
    /// previous process is recovered immediately.
    pub async fn initialize_store(&self, store: SharedStore) {
        let had_store = self.buffer.has_store().await;
        self.buffer.attach_store(Arc::clone(&store)).await;
        *self.store.write().await = Some(store);
        info!("Durable store attached");

        if self.state() == AgentState::Running && !had_store {
            self.buffer.recover().await;
        }
    }

    /// Last cached dynamic rule document, if any poll has succeeded.
    pub fn get_dynamic_rules(&self) -> Option<DynamicRules> {
        self.rules_tx.borrow().clone()
    }

    /// Subscription to rule updates; receivers observe every published
    /// version change.
    pub fn subscribe_rules(&self) -> watch::Receiver<Option<DynamicRules>> {
        self.rules_tx.subscribe()
    }

    /// Composes the current agent status from counters and buffer state.
    pub async fn get_status(&self) -> AgentStatus {
        let buffer_stats = self.buffer.stats().await;
        let buffer_size = buffer_stats.event_count + buffer_stats.metric_count;
        let breaker_state = self.transport.circuit_state().await;
        let transport_stats = self.transport.stats();

        let status = if self.state() != AgentState::Running {
            AgentHealth::Stopped
        } else if breaker_state == CircuitState::Open {
            AgentHealth::Error
        } else if self.counters.consecutive_event_failures.load(Ordering::Relaxed) >= 1
            || self.counters.consecutive_metric_failures.load(Ordering::Relaxed) >= 1
            // Combined queues at or above 90% of their joint capacity.
            || buffer_size * 5 >= buffer_stats.capacity * 9
        {
            AgentHealth::Degraded
        } else {
            AgentHealth::Healthy
        };

        let uptime = self
            .started_at
            .lock()
            .expect("started_at lock poisoned")
            .map(|started| started.elapsed().as_secs_f64())
            .unwrap_or(0.0);

        AgentStatus {
            timestamp: get_current_timestamp(),
            status,
            uptime_seconds: uptime,
            events_sent: self.counters.events_sent.load(Ordering::Relaxed),
            metrics_sent: self.counters.metrics_sent.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            buffer_size,
            last_flush_ts: buffer_stats.last_flush_ts,
            last_error: transport_stats.last_error,
            version: AGENT_VERSION.to_string(),
        }
    }

    /// Debug aggregate of all counters and component stats.
    pub async fn get_stats(&self) -> serde_json::Value {
        let buffer_stats = self.buffer.stats().await;
        let transport_stats = self.transport.stats();
        let breaker = self.transport.circuit_state().await;

        serde_json::json!({
            "state": format!("{:?}", self.state()),
            "events_received": self.counters.events_received.load(Ordering::Relaxed),
            "metrics_received": self.counters.metrics_received.load(Ordering::Relaxed),
            "events_sent": self.counters.events_sent.load(Ordering::Relaxed),
            "metrics_sent": self.counters.metrics_sent.load(Ordering::Relaxed),
            "events_failed": self.counters.events_failed.load(Ordering::Relaxed),
            "metrics_failed": self.counters.metrics_failed.load(Ordering::Relaxed),
            "errors": self.counters.errors.load(Ordering::Relaxed),
            "dropped_encrypted": self.counters.dropped_encrypted.load(Ordering::Relaxed),
            "rules_fetched": self.counters.rules_fetched.load(Ordering::Relaxed),
            "cached_rules_version": self.get_dynamic_rules().map(|r| r.version),
            "buffer": buffer_stats,
            "transport": transport_stats,
            "circuit_breaker_state": format!("{breaker:?}"),
        })
    }

    /// Quick health probe: running, breaker not open, buffer below 95%.
    pub async fn health_check(&self) -> bool {
        if self.state() != AgentState::Running {
            return false;
        }
        if self.transport.circuit_state().await == CircuitState::Open {
            return false;
        }
        let buffer_stats = self.buffer.stats().await;
        let used = buffer_stats.event_count + buffer_stats.metric_count;
        used * 20 < buffer_stats.capacity * 2 * 19
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AgentState {
        *self.state.lock().expect("state lock poisoned")
    }

    /// Forces a flush of both queues through the transport.
    pub async fn flush_buffer(&self) {
        self.flush_once().await;
    }

    fn set_state(&self, state: AgentState) {
        *self.state.lock().expect("state lock poisoned") = state;
    }

    fn spawn_flusher(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let handler = Arc::clone(self);
        let interval = Duration::from_secs(self.config.flush_interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick flushes an empty buffer; harmless.
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        handler.flush_once().await;
                    }
                    () = handler.buffer.wait_high_water() => {
                        debug!("High-water mark reached, flushing early");
                        handler.flush_once().await;
                    }
                    () = token.cancelled() => {
                        debug!("Flusher shutting down");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_heartbeat(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let handler = Arc::clone(self);
        let interval = Duration::from_secs(self.config.flush_interval * 2);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        handler.heartbeat().await;
                    }
                    () = token.cancelled() => {
                        debug!("Heartbeat shutting down");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_rule_poller(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let handler = Arc::clone(self);
        let interval = Duration::from_secs(self.config.rule_poll_interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        handler.poll_rules().await;
                    }
                    () = token.cancelled() => {
                        debug!("Rule poller shutting down");
                        break;
                    }
                }
            }
        })
    }

    async fn flush_once(&self) {
        let (events, metrics) = self.buffer.flush().await;
        if events.is_empty() && metrics.is_empty() {
            return;
        }
        debug!(
            "Flushing {} events and {} metrics",
            events.len(),
            metrics.len()
        );

        let (events_result, metrics_result) = tokio::join!(
            self.transport.send_events(&events),
            self.transport.send_metrics(&metrics),
        );

        let requeue_events = self.settle_events(events_result, events).await;
        let requeue_metrics = self.settle_metrics(metrics_result, metrics).await;
        if !requeue_events.is_empty() || !requeue_metrics.is_empty() {
            self.buffer
                .on_delivery_failure(requeue_events, requeue_metrics)
                .await;
        }
    }

    /// Applies the delivery outcome to an event batch, returning the items
    /// that must go back into the buffer.
    async fn settle_events(
        &self,
        result: Result<(), TransportError>,
        events: Vec<SecurityEvent>,
    ) -> Vec<SecurityEvent> {
        let count = events.len() as u64;
        match Self::classify_delivery(&result) {
            Delivery::Delivered => {
                self.counters.events_sent.fetch_add(count, Ordering::Relaxed);
                self.counters
                    .consecutive_event_failures
                    .store(0, Ordering::Relaxed);
                self.buffer.on_delivery_success(events.len(), 0).await;
                Vec::new()
            }
            Delivery::DropEncrypted => {
                error!("Dropping {} events: encryption failed", count);
                self.counters.dropped_encrypted.fetch_add(count, Ordering::Relaxed);
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                Vec::new()
            }
            Delivery::RebufferReduced => {
                self.record_event_failure();
                self.counters.events_failed.fetch_add(count, Ordering::Relaxed);
                let mut events = events;
                let keep = events.len() / 2;
                warn!(
                    "Payload too large, re-buffering {} of {} events",
                    keep, count
                );
                events.truncate(keep);
                events
            }
            Delivery::Drop => {
                self.record_event_failure();
                self.counters.events_failed.fetch_add(count, Ordering::Relaxed);
                warn!("Dropping {} events after permanent failure", count);
                Vec::new()
            }
            Delivery::Rebuffer => {
                self.record_event_failure();
                self.counters.events_failed.fetch_add(count, Ordering::Relaxed);
                events
            }
        }
    }

    /// Mirror of [`Self::settle_events`] for metrics.
    async fn settle_metrics(
        &self,
        result: Result<(), TransportError>,
        metrics: Vec<SecurityMetric>,
    ) -> Vec<SecurityMetric> {
        let count = metrics.len() as u64;
        match Self::classify_delivery(&result) {
            Delivery::Delivered => {
                self.counters.metrics_sent.fetch_add(count, Ordering::Relaxed);
                self.counters
                    .consecutive_metric_failures
                    .store(0, Ordering::Relaxed);
                self.buffer.on_delivery_success(0, metrics.len()).await;
                Vec::new()
            }
            Delivery::DropEncrypted => {
                error!("Dropping {} metrics: encryption failed", count);
                self.counters.dropped_encrypted.fetch_add(count, Ordering::Relaxed);
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                Vec::new()
            }
            Delivery::RebufferReduced => {
                self.record_metric_failure();
                self.counters.metrics_failed.fetch_add(count, Ordering::Relaxed);
                let mut metrics = metrics;
                let keep = metrics.len() / 2;
                warn!(
                    "Payload too large, re-buffering {} of {} metrics",
                    keep, count
                );
                metrics.truncate(keep);
                metrics
            }
            Delivery::Drop => {
                self.record_metric_failure();
                self.counters.metrics_failed.fetch_add(count, Ordering::Relaxed);
                warn!("Dropping {} metrics after permanent failure", count);
                Vec::new()
            }
            Delivery::Rebuffer => {
                self.record_metric_failure();
                self.counters.metrics_failed.fetch_add(count, Ordering::Relaxed);
                metrics
            }
        }
    }

    fn classify_delivery(result: &Result<(), TransportError>) -> Delivery {
        match result {
            Ok(()) => Delivery::Delivered,
            Err(TransportError::Encryption(_)) => Delivery::DropEncrypted,
            Err(TransportError::Permanent { status })
                if *status == reqwest::StatusCode::PAYLOAD_TOO_LARGE =>
            {
                Delivery::RebufferReduced
            }
            Err(TransportError::Permanent { .. }) | Err(TransportError::Init(_)) => Delivery::Drop,
            Err(TransportError::CircuitOpen)
            | Err(TransportError::RetriableStatus { .. })
            | Err(TransportError::Network(_)) => Delivery::Rebuffer,
        }
    }

    fn record_event_failure(&self) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        self.counters
            .consecutive_event_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    fn record_metric_failure(&self) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        self.counters
            .consecutive_metric_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    async fn heartbeat(&self) {
        let status = self.get_status().await;

        if let Some(store) = self.store.read().await.clone() {
            if let Ok(json) = serde_json::to_string(&status) {
                let key = self.config.store_key("status:last");
                if let Err(err) = store.set(&key, &json, Some(STATUS_TTL)).await {
                    debug!("Failed to persist status snapshot: {}", err);
                }
            }
        }

        if let Err(err) = self.transport.send_status(&status).await {
            debug!("Heartbeat delivery failed: {}", err);
        }
    }

    async fn poll_rules(&self) {
        match self.transport.fetch_dynamic_rules().await {
            Ok(Some(rules)) => {
                let changed = self
                    .rules_tx
                    .borrow()
                    .as_ref()
                    .map_or(true, |cached| cached.version != rules.version);
                if !changed {
                    return;
                }
                self.counters.rules_fetched.fetch_add(1, Ordering::Relaxed);
                info!(
                    "Dynamic rules updated to version {}",
                    rules.version
                );

                if let Some(store) = self.store.read().await.clone() {
                    if let Ok(json) = serde_json::to_string(&rules) {
                        let key = self.config.store_key("rules:cache");
                        if let Err(err) = store.set(&key, &json, None).await {
                            debug!("Failed to persist rules cache: {}", err);
                        }
                    }
                }

                self.rules_tx.send_replace(Some(rules));
            }
            Ok(None) => {}
            Err(err) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                debug!("Rule poll failed: {}", err);
            }
        }
    }
}

/// What to do with a flushed batch after the transport settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Delivered,
    DropEncrypted,
    RebufferReduced,
    Drop,
    Rebuffer,
}
