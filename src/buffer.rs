//! In-memory event and metric buffering with durable overflow.
//!
//! Two bounded FIFO queues (events, metrics) hold telemetry between
//! flushes. When a queue is full the oldest item is spilled to the durable
//! store if one is attached, otherwise dropped and counted. On start,
//! [`EventBuffer::recover`] drains spilled items back into memory in
//! sequence order, so a restart loses nothing that reached the store.
//!
//! Producers never block on transport: an add either fits in memory,
//! spills durably, or evicts the oldest item. The buffer is the sole
//! backpressure surface of the agent.

use std::collections::{HashSet, VecDeque};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::models::{SecurityEvent, SecurityMetric};
use crate::store::{SharedStore, OVERFLOW_TTL};
use crate::utils::{get_current_timestamp, redact_sensitive};

/// Queue fill ratio at which the flusher is woken early.
const HIGH_WATER_NUMERATOR: usize = 4;
const HIGH_WATER_DENOMINATOR: usize = 5;

/// Point-in-time buffer statistics.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct BufferStats {
    pub event_count: usize,
    pub metric_count: usize,
    pub capacity: usize,
    pub dropped_events: u64,
    pub dropped_metrics: u64,
    pub events_flushed: u64,
    pub metrics_flushed: u64,
    pub store_errors: u64,
    pub recover_errors: u64,
    pub overflow_entries: u64,
    pub last_flush_ts: Option<f64>,
}

#[derive(Debug, Default)]
struct BufferInner {
    events: VecDeque<(u64, SecurityEvent)>,
    metrics: VecDeque<(u64, SecurityMetric)>,
    sequence: u64,
    dropped_events: u64,
    dropped_metrics: u64,
    events_flushed: u64,
    metrics_flushed: u64,
    store_errors: u64,
    recover_errors: u64,
    overflow_entries: u64,
    last_flush: Option<f64>,
}

/// Bounded buffer for events and metrics with optional durable overflow.
pub struct EventBuffer {
    capacity: usize,
    sensitive_headers: HashSet<String>,
    events_prefix: String,
    metrics_prefix: String,
    store: RwLock<Option<SharedStore>>,
    inner: Mutex<BufferInner>,
    high_water: Notify,
}

impl EventBuffer {
    pub fn new(config: &AgentConfig) -> Self {
        EventBuffer {
            capacity: config.buffer_size,
            sensitive_headers: config.sensitive_headers.clone(),
            events_prefix: config.store_key("overflow:events:"),
            metrics_prefix: config.store_key("overflow:metrics:"),
            store: RwLock::new(None),
            inner: Mutex::new(BufferInner::default()),
            high_water: Notify::new(),
        }
    }

    /// Attaches a durable store. May happen before or after start; the
    /// handler triggers a recovery pass when attaching late.
    pub async fn attach_store(&self, store: SharedStore) {
        *self.store.write().await = Some(store);
    }

    pub async fn has_store(&self) -> bool {
        self.store.read().await.is_some()
    }

    /// Resolves when an add left a queue at or above the high-water mark.
    /// Notifications coalesce; the caller re-arms by awaiting again.
    pub async fn wait_high_water(&self) {
        self.high_water.notified().await;
    }

    /// Adds an event. Sensitive metadata headers are redacted before the
    /// event is stored anywhere.
    pub async fn add_event(&self, mut event: SecurityEvent) {
        if !event.metadata.is_empty() {
            event.metadata = redact_sensitive(&event.metadata, &self.sensitive_headers);
        }

        let store = self.store.read().await.clone();
        let mut inner = self.inner.lock().await;
        inner.sequence += 1;
        let seq = inner.sequence;

        if inner.events.len() >= self.capacity {
            if let Some((old_seq, old_event)) = inner.events.pop_front() {
                let spilled = match &store {
                    Some(store) => {
                        Self::spill(store, &self.events_prefix, old_seq, &old_event).await
                    }
                    None => false,
                };
                if spilled {
                    inner.overflow_entries += 1;
                } else {
                    if store.is_some() {
                        inner.store_errors += 1;
                    }
                    inner.dropped_events += 1;
                    debug!("Event buffer full, dropping oldest event");
                }
            }
        }
        inner.events.push_back((seq, event));

        if self.at_high_water(inner.events.len()) {
            self.high_water.notify_one();
        }
    }

    /// Adds a metric; same overflow policy as [`EventBuffer::add_event`].
    pub async fn add_metric(&self, metric: SecurityMetric) {
        let store = self.store.read().await.clone();
        let mut inner = self.inner.lock().await;
        inner.sequence += 1;
        let seq = inner.sequence;

        if inner.metrics.len() >= self.capacity {
            if let Some((old_seq, old_metric)) = inner.metrics.pop_front() {
                let spilled = match &store {
                    Some(store) => {
                        Self::spill(store, &self.metrics_prefix, old_seq, &old_metric).await
                    }
                    None => false,
                };
                if spilled {
                    inner.overflow_entries += 1;
                } else {
                    if store.is_some() {
                        inner.store_errors += 1;
                    }
                    inner.dropped_metrics += 1;
                    debug!("Metric buffer full, dropping oldest metric");
                }
            }
        }
        inner.metrics.push_back((seq, metric));

        if self.at_high_water(inner.metrics.len()) {
            self.high_water.notify_one();
        }
    }

    /// Atomically swaps both queues with empty ones and returns their
    /// contents in insertion order.
    pub async fn flush(&self) -> (Vec<SecurityEvent>, Vec<SecurityMetric>) {
        let mut inner = self.inner.lock().await;
        let events: Vec<SecurityEvent> =
            std::mem::take(&mut inner.events).into_iter().map(|(_, e)| e).collect();
        let metrics: Vec<SecurityMetric> =
            std::mem::take(&mut inner.metrics).into_iter().map(|(_, m)| m).collect();
        inner.last_flush = Some(get_current_timestamp());
        (events, metrics)
    }

    /// Records a successful delivery of a flushed batch.
    pub async fn on_delivery_success(&self, event_count: usize, metric_count: usize) {
        let mut inner = self.inner.lock().await;
        inner.events_flushed += event_count as u64;
        inner.metrics_flushed += metric_count as u64;
    }

    /// Returns undelivered items to the buffer: re-prepends up to capacity
    /// (they are older than anything enqueued since the flush) and spills
    /// the remainder.
    pub async fn on_delivery_failure(&self, events: Vec<SecurityEvent>, metrics: Vec<SecurityMetric>) {
        let store = self.store.read().await.clone();
        let mut inner = self.inner.lock().await;

        let overflow_events = Self::requeue(&mut inner, events, self.capacity);
        for event in overflow_events {
            inner.sequence += 1;
            let seq = inner.sequence;
            let spilled = match &store {
                Some(store) => Self::spill(store, &self.events_prefix, seq, &event).await,
                None => false,
            };
            if spilled {
                inner.overflow_entries += 1;
            } else {
                if store.is_some() {
                    inner.store_errors += 1;
                }
                inner.dropped_events += 1;
            }
        }

        let overflow_metrics = Self::requeue(&mut inner, metrics, self.capacity);
        for metric in overflow_metrics {
            inner.sequence += 1;
            let seq = inner.sequence;
            let spilled = match &store {
                Some(store) => Self::spill(store, &self.metrics_prefix, seq, &metric).await,
                None => false,
            };
            if spilled {
                inner.overflow_entries += 1;
            } else {
                if store.is_some() {
                    inner.store_errors += 1;
                }
                inner.dropped_metrics += 1;
            }
        }
    }

    /// Drains overflow entries from the store back into memory, oldest
    /// sequence first, up to capacity per queue. Recovered and malformed
    /// entries are deleted from the store; entries beyond capacity stay.
    pub async fn recover(&self) -> (usize, usize) {
        let Some(store) = self.store.read().await.clone() else {
            return (0, 0);
        };

        let mut inner = self.inner.lock().await;

        let event_keys = Self::sorted_overflow_keys(&store, &self.events_prefix, &mut inner).await;
        let mut recovered_events = 0usize;
        let mut remaining = 0u64;
        for (seq, key) in event_keys {
            if inner.events.len() >= self.capacity {
                remaining += 1;
                continue;
            }
            if let Some(event) = Self::load::<SecurityEvent>(&store, &key, &mut inner).await {
                inner.sequence = inner.sequence.max(seq);
                inner.events.push_back((seq, event));
                recovered_events += 1;
            }
        }

        let metric_keys = Self::sorted_overflow_keys(&store, &self.metrics_prefix, &mut inner).await;
        let mut recovered_metrics = 0usize;
        for (seq, key) in metric_keys {
            if inner.metrics.len() >= self.capacity {
                remaining += 1;
                continue;
            }
            if let Some(metric) = Self::load::<SecurityMetric>(&store, &key, &mut inner).await {
                inner.sequence = inner.sequence.max(seq);
                inner.metrics.push_back((seq, metric));
                recovered_metrics += 1;
            }
        }

        inner.overflow_entries = remaining;

        if recovered_events > 0 || recovered_metrics > 0 {
            info!(
                "Recovered {} events and {} metrics from overflow store",
                recovered_events, recovered_metrics
            );
        }
        (recovered_events, recovered_metrics)
    }

    pub async fn size(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.events.len() + inner.metrics.len()
    }

    pub async fn stats(&self) -> BufferStats {
        let inner = self.inner.lock().await;
        BufferStats {
            event_count: inner.events.len(),
            metric_count: inner.metrics.len(),
            capacity: self.capacity,
            dropped_events: inner.dropped_events,
            dropped_metrics: inner.dropped_metrics,
            events_flushed: inner.events_flushed,
            metrics_flushed: inner.metrics_flushed,
            store_errors: inner.store_errors,
            recover_errors: inner.recover_errors,
            overflow_entries: inner.overflow_entries,
            last_flush_ts: inner.last_flush,
        }
    }

    fn at_high_water(&self, len: usize) -> bool {
        len * HIGH_WATER_DENOMINATOR >= self.capacity * HIGH_WATER_NUMERATOR
    }

    async fn spill<T: Serialize>(store: &SharedStore, prefix: &str, seq: u64, item: &T) -> bool {
        let json = match serde_json::to_string(item) {
            Ok(json) => json,
            Err(err) => {
                warn!("Failed to serialize overflow item: {}", err);
                return false;
            }
        };
        let key = format!("{prefix}{seq}");
        match store.set(&key, &json, Some(OVERFLOW_TTL)).await {
            Ok(()) => true,
            Err(err) => {
                warn!("Failed to spill item to store: {}", err);
                false
            }
        }
    }

    async fn load<T: DeserializeOwned>(
        store: &SharedStore,
        key: &str,
        inner: &mut BufferInner,
    ) -> Option<T> {
        let value = match store.get(key).await {
            Ok(Some(value)) => value,
            Ok(None) => return None,
            Err(err) => {
                warn!("Failed to read overflow key {}: {}", key, err);
                inner.store_errors += 1;
                return None;
            }
        };
        let _ = store.delete(key).await;
        match serde_json::from_str(&value) {
            Ok(item) => Some(item),
            Err(err) => {
                warn!("Skipping malformed overflow entry {}: {}", key, err);
                inner.recover_errors += 1;
                None
            }
        }
    }

    async fn sorted_overflow_keys(
        store: &SharedStore,
        prefix: &str,
        inner: &mut BufferInner,
    ) -> Vec<(u64, String)> {
        let keys = match store.keys(prefix).await {
            Ok(keys) => keys,
            Err(err) => {
                warn!("Failed to list overflow keys: {}", err);
                inner.store_errors += 1;
                return Vec::new();
            }
        };
        let mut parsed: Vec<(u64, String)> = keys
            .into_iter()
            .filter_map(|key| {
                key.rsplit(':')
                    .next()
                    .and_then(|suffix| suffix.parse::<u64>().ok())
                    .map(|seq| (seq, key))
            })
            .collect();
        parsed.sort_by_key(|(seq, _)| *seq);
        parsed
    }

    fn requeue<T: RequeueTarget>(
        inner: &mut BufferInner,
        mut items: Vec<T>,
        capacity: usize,
    ) -> Vec<T> {
        let room = capacity.saturating_sub(T::queue_len(inner));
        let overflow = items.split_off(items.len().min(room));
        let stamped: Vec<(u64, T)> = items
            .into_iter()
            .map(|item| {
                inner.sequence += 1;
                (inner.sequence, item)
            })
            .collect();
        // Prepend in reverse so the batch keeps its relative order at the
        // front of the queue.
        for (seq, item) in stamped.into_iter().rev() {
            T::push_front(inner, seq, item);
        }
        overflow
    }
}

/// Internal dispatch for requeueing either item type onto its own queue.
trait RequeueTarget: Sized {
    fn queue_len(inner: &BufferInner) -> usize;
    fn push_front(inner: &mut BufferInner, seq: u64, item: Self);
}

impl RequeueTarget for SecurityEvent {
    fn queue_len(inner: &BufferInner) -> usize {
        inner.events.len()
    }
    fn push_front(inner: &mut BufferInner, seq: u64, item: Self) {
        inner.events.push_front((seq, item));
    }
}

impl RequeueTarget for SecurityMetric {
    fn queue_len(inner: &BufferInner) -> usize {
        inner.metrics.len()
    }
    fn push_front(inner: &mut BufferInner, seq: u64, item: Self) {
        inner.metrics.push_front((seq, item));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SecurityEventType, SecurityMetricType};
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn config(buffer_size: usize) -> AgentConfig {
        AgentConfig {
            api_key: "test-api-key-123".to_string(),
            project_id: "proj-1".to_string(),
            buffer_size,
            ..Default::default()
        }
    }

    fn event(reason: &str) -> SecurityEvent {
        SecurityEvent::new(SecurityEventType::SuspiciousRequest, "203.0.113.1", "blocked", reason)
    }

    fn metric(value: f64) -> SecurityMetric {
        SecurityMetric::new(SecurityMetricType::RequestCount, value)
    }

    #[tokio::test]
    async fn test_flush_returns_items_in_insertion_order() {
        let buffer = EventBuffer::new(&config(10));
        for i in 0..5 {
            buffer.add_event(event(&format!("e{i}"))).await;
        }
        let (events, metrics) = buffer.flush().await;
        assert!(metrics.is_empty());
        let reasons: Vec<&str> = events.iter().map(|e| e.reason.as_str()).collect();
        assert_eq!(reasons, vec!["e0", "e1", "e2", "e3", "e4"]);

        // Queues are empty after the swap.
        assert_eq!(buffer.size().await, 0);
        assert!(buffer.stats().await.last_flush_ts.is_some());
    }

    #[tokio::test]
    async fn test_overflow_without_store_drops_oldest() {
        let buffer = EventBuffer::new(&config(2));
        for i in 0..5 {
            buffer.add_event(event(&format!("e{i}"))).await;
        }

        let stats = buffer.stats().await;
        assert_eq!(stats.event_count, 2);
        assert_eq!(stats.dropped_events, 3);

        let (events, _) = buffer.flush().await;
        let reasons: Vec<&str> = events.iter().map(|e| e.reason.as_str()).collect();
        assert_eq!(reasons, vec!["e3", "e4"]);
    }

    #[tokio::test]
    async fn test_overflow_with_store_spills_oldest() {
        let buffer = EventBuffer::new(&config(2));
        buffer.attach_store(Arc::new(MemoryStore::new())).await;
        for i in 0..5 {
            buffer.add_event(event(&format!("e{i}"))).await;
        }

        let stats = buffer.stats().await;
        assert_eq!(stats.event_count, 2);
        assert_eq!(stats.dropped_events, 0);
        assert_eq!(stats.overflow_entries, 3);

        let store = buffer.store.read().await.clone().unwrap();
        let mut keys = store.keys("agent:overflow:events:").await.unwrap();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "agent:overflow:events:1",
                "agent:overflow:events:2",
                "agent:overflow:events:3"
            ]
        );

        let (events, _) = buffer.flush().await;
        let reasons: Vec<&str> = events.iter().map(|e| e.reason.as_str()).collect();
        assert_eq!(reasons, vec!["e3", "e4"]);
    }

    #[tokio::test]
    async fn test_recover_restores_in_sequence_order_up_to_capacity() {
        let store: SharedStore = Arc::new(MemoryStore::new());

        // Fill a buffer past capacity so three events spill, then simulate a
        // crash by building a fresh buffer over the same store.
        let buffer = EventBuffer::new(&config(2));
        buffer.attach_store(Arc::clone(&store)).await;
        for i in 0..5 {
            buffer.add_event(event(&format!("e{i}"))).await;
        }
        drop(buffer);

        let recovered = EventBuffer::new(&config(2));
        recovered.attach_store(Arc::clone(&store)).await;
        let (event_count, metric_count) = recovered.recover().await;
        assert_eq!((event_count, metric_count), (2, 0));

        let (events, _) = recovered.flush().await;
        let reasons: Vec<&str> = events.iter().map(|e| e.reason.as_str()).collect();
        assert_eq!(reasons, vec!["e0", "e1"]);

        // The entry beyond capacity stays in the store.
        let keys = store.keys("agent:overflow:events:").await.unwrap();
        assert_eq!(keys, vec!["agent:overflow:events:3"]);
        assert_eq!(recovered.stats().await.overflow_entries, 1);
    }

    #[tokio::test]
    async fn test_recover_skips_and_deletes_malformed_entries() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        store
            .set("agent:overflow:events:1", "not json", None)
            .await
            .unwrap();
        store
            .set(
                "agent:overflow:events:2",
                &serde_json::to_string(&event("good")).unwrap(),
                None,
            )
            .await
            .unwrap();

        let buffer = EventBuffer::new(&config(10));
        buffer.attach_store(Arc::clone(&store)).await;
        let (event_count, _) = buffer.recover().await;
        assert_eq!(event_count, 1);

        let stats = buffer.stats().await;
        assert_eq!(stats.recover_errors, 1);
        assert!(store.keys("agent:overflow:events:").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delivery_failure_requeues_in_order_and_spills_remainder() {
        let buffer = EventBuffer::new(&config(3));
        buffer.attach_store(Arc::new(MemoryStore::new())).await;

        for i in 0..3 {
            buffer.add_event(event(&format!("e{i}"))).await;
        }
        let (events, metrics) = buffer.flush().await;
        assert_eq!(events.len(), 3);

        // A new event arrives while the batch is in flight.
        buffer.add_event(event("e3")).await;

        buffer.on_delivery_failure(events, metrics).await;

        let stats = buffer.stats().await;
        assert_eq!(stats.event_count, 3);
        assert_eq!(stats.dropped_events, 0);
        assert_eq!(stats.overflow_entries, 1);

        let (requeued, _) = buffer.flush().await;
        let reasons: Vec<&str> = requeued.iter().map(|e| e.reason.as_str()).collect();
        assert_eq!(reasons, vec!["e0", "e1", "e3"]);
    }

    #[tokio::test]
    async fn test_delivery_failure_without_store_drops_remainder() {
        let buffer = EventBuffer::new(&config(2));
        buffer.add_event(event("e0")).await;
        buffer.add_event(event("e1")).await;
        let (events, metrics) = buffer.flush().await;

        buffer.add_event(event("e2")).await;
        buffer.on_delivery_failure(events, metrics).await;

        let stats = buffer.stats().await;
        assert_eq!(stats.event_count, 2);
        assert_eq!(stats.dropped_events, 1);
    }

    #[tokio::test]
    async fn test_metadata_redacted_on_add() {
        let buffer = EventBuffer::new(&config(10));
        let mut ev = event("probe");
        ev.metadata
            .insert("Authorization".to_string(), serde_json::json!("Bearer token"));
        ev.metadata
            .insert("path".to_string(), serde_json::json!("/admin"));
        buffer.add_event(ev).await;

        let (events, _) = buffer.flush().await;
        assert_eq!(
            events[0].metadata["Authorization"],
            serde_json::json!("[REDACTED]")
        );
        assert_eq!(events[0].metadata["path"], serde_json::json!("/admin"));
    }

    #[tokio::test]
    async fn test_high_water_notification() {
        let buffer = Arc::new(EventBuffer::new(&config(5)));

        for i in 0..4 {
            buffer.add_event(event(&format!("e{i}"))).await;
        }
        // 4/5 = 80%: the notification must already be armed.
        tokio::time::timeout(std::time::Duration::from_millis(100), buffer.wait_high_water())
            .await
            .expect("high-water signal expected at 80% fill");
    }

    #[tokio::test]
    async fn test_metrics_queue_is_independent() {
        let buffer = EventBuffer::new(&config(2));
        for i in 0..3 {
            buffer.add_metric(metric(f64::from(i))).await;
        }
        buffer.add_event(event("e0")).await;

        let stats = buffer.stats().await;
        assert_eq!(stats.metric_count, 2);
        assert_eq!(stats.event_count, 1);
        assert_eq!(stats.dropped_metrics, 1);
        assert_eq!(stats.dropped_events, 0);

        let (_, metrics) = buffer.flush().await;
        let values: Vec<f64> = metrics.iter().map(|m| m.value).collect();
        assert_eq!(values, vec![1.0, 2.0]);
    }
}
