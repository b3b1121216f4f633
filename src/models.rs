//! Wire data model shared between the agent and the management backend.
//!
//! All types round-trip through `serde_json`. Timestamps on events and
//! metrics are epoch seconds as `f64`; the batch envelope carries an
//! ISO-8601 UTC timestamp with seconds precision.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::get_current_timestamp;

/// Classification of a security event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    IpBanned,
    RateLimited,
    SuspiciousRequest,
    CloudBlocked,
    CountryBlocked,
    PenetrationAttempt,
    BehavioralViolation,
    UserAgentBlocked,
    CustomRuleTriggered,
    PathExcluded,
    DynamicRuleUpdated,
    ErrorResponse,
    LoginAttempt,
    SuspiciousActivity,
}

/// Classification of a performance metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMetricType {
    RequestCount,
    ResponseTime,
    ErrorRate,
    BandwidthUsage,
    ThreatLevel,
    BlockRate,
    CacheHitRate,
}

/// A single security event produced by the host middleware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    pub event_type: SecurityEventType,
    pub ip_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub action_taken: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time: Option<f64>,
    /// Free-form context. Sensitive headers are redacted before the event
    /// enters the buffer.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl SecurityEvent {
    /// Creates an event stamped with the current time.
    pub fn new(event_type: SecurityEventType, ip_address: &str, action_taken: &str, reason: &str) -> Self {
        SecurityEvent {
            timestamp: get_current_timestamp(),
            event_type,
            ip_address: ip_address.to_string(),
            country: None,
            user_agent: None,
            action_taken: action_taken.to_string(),
            reason: reason.to_string(),
            endpoint: None,
            method: None,
            status_code: None,
            response_time: None,
            metadata: HashMap::new(),
        }
    }
}

/// A single performance or usage metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityMetric {
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    pub metric_type: SecurityMetricType,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,
}

impl SecurityMetric {
    /// Creates a metric stamped with the current time.
    pub fn new(metric_type: SecurityMetricType, value: f64) -> Self {
        SecurityMetric {
            timestamp: get_current_timestamp(),
            metric_type,
            value,
            endpoint: None,
            tags: HashMap::new(),
        }
    }
}

/// The unit of transport: a snapshot of the buffer taken by `flush`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    pub project_id: String,
    #[serde(default)]
    pub events: Vec<SecurityEvent>,
    #[serde(default)]
    pub metrics: Vec<SecurityMetric>,
    pub batch_id: String,
    /// Batch creation time, ISO-8601 UTC with seconds precision on the wire.
    #[serde(with = "iso8601_seconds")]
    pub batch_timestamp: f64,
}

impl EventBatch {
    pub fn new(project_id: &str, events: Vec<SecurityEvent>, metrics: Vec<SecurityMetric>) -> Self {
        EventBatch {
            project_id: project_id.to_string(),
            events,
            metrics,
            batch_id: crate::utils::generate_batch_id(),
            batch_timestamp: get_current_timestamp(),
        }
    }
}

/// Serialises an epoch-seconds `f64` as an ISO-8601 UTC string and accepts
/// either form on the way back in.
mod iso8601_seconds {
    use super::*;
    use serde::de::Error as DeError;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        let datetime: DateTime<Utc> = Utc
            .timestamp_opt(ts.floor() as i64, 0)
            .single()
            .ok_or_else(|| serde::ser::Error::custom("timestamp out of range"))?;
        serializer.serialize_str(&datetime.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Iso(String),
            Epoch(f64),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Epoch(ts) => Ok(ts),
            Raw::Iso(s) => DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.timestamp() as f64)
                .map_err(DeError::custom),
        }
    }
}

/// Per-endpoint rate limit carried by a dynamic rule document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRateLimit {
    pub requests: u32,
    pub window_seconds: u32,
}

/// Dynamic security policy pulled from the backend.
///
/// Every field is defaulted so a partial document still parses; the backend
/// is free to omit sections it does not manage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DynamicRules {
    #[serde(default)]
    pub ip_blacklist: HashSet<String>,
    #[serde(default)]
    pub ip_whitelist: HashSet<String>,
    #[serde(default)]
    pub blocked_countries: HashSet<String>,
    #[serde(default)]
    pub country_whitelist: HashSet<String>,
    #[serde(default)]
    pub endpoint_rate_limits: HashMap<String, EndpointRateLimit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_rate_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_rate_window: Option<u32>,
    #[serde(default)]
    pub emergency_mode: bool,
    #[serde(default)]
    pub emergency_whitelist: HashSet<String>,
    #[serde(default)]
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default = "default_rules_ttl")]
    pub ttl: u64,
}

fn default_rules_ttl() -> u64 {
    300
}

/// Agent health classification reported in heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentHealth {
    Healthy,
    Degraded,
    Error,
    Stopped,
}

/// Status snapshot pushed to the backend and exposed to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub timestamp: f64,
    pub status: AgentHealth,
    pub uptime_seconds: f64,
    pub events_sent: u64,
    pub metrics_sent: u64,
    pub errors: u64,
    pub buffer_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_flush_ts: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub version: String,
}
