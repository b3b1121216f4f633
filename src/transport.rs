//! HTTP transport to the management backend.
//!
//! Every outbound call is composed the same way:
//!
//! 1. acquire a rate-limiter slot (suspends, never fails),
//! 2. run the HTTP attempt under the circuit breaker,
//! 3. on a retriable outcome, back off with jitter and re-enter step 2,
//!    so the breaker sees attempt-level outcomes.
//!
//! Event and metric batches are sealed with the payload encryptor before
//! they leave the process; status heartbeats go out in the clear. Dynamic
//! rules are fetched with `If-None-Match` so an unchanged document costs a
//! 304.

use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, ETAG, IF_NONE_MATCH, USER_AGENT};
use reqwest::StatusCode;
use serde::Serialize;
use tracing::{debug, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitError, CircuitState};
use crate::config::AgentConfig;
use crate::encryption::{EncryptionError, PayloadEncryptor};
use crate::models::{AgentStatus, DynamicRules, SecurityEvent, SecurityMetric};
use crate::rate_limiter::RateLimiter;
use crate::utils::{calculate_backoff_delay, get_current_timestamp};
use crate::AGENT_VERSION;

/// Transport failure classification.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The circuit breaker rejected the attempt; no HTTP was performed.
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// 408, 429 or 5xx: the backend may recover, the attempt is retried.
    #[error("retriable response status {status}")]
    RetriableStatus { status: StatusCode },

    /// Any other 4xx: retrying cannot help.
    #[error("permanent response status {status}")]
    Permanent { status: StatusCode },

    /// Connection, DNS or timeout failure.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The payload could not be sealed; the batch is unsendable.
    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    /// Client or header construction failed.
    #[error("transport initialization failed: {0}")]
    Init(String),
}

impl TransportError {
    /// Whether the retry policy applies to this failure.
    pub fn is_retriable(&self) -> bool {
        match self {
            TransportError::CircuitOpen
            | TransportError::RetriableStatus { .. }
            | TransportError::Network(_) => true,
            TransportError::Permanent { .. }
            | TransportError::Encryption(_)
            | TransportError::Init(_) => false,
        }
    }

    /// HTTP status attached to the failure, when there is one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            TransportError::RetriableStatus { status } | TransportError::Permanent { status } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

/// Point-in-time transport statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub requests_failed: u64,
    pub bytes_sent: u64,
    pub last_success_ts: Option<f64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct StatsInner {
    requests_sent: u64,
    requests_failed: u64,
    bytes_sent: u64,
    last_success_ts: Option<f64>,
    last_error: Option<String>,
}

/// Resilient HTTP client for the backend API.
pub struct HttpTransport {
    config: Arc<AgentConfig>,
    client: reqwest::Client,
    encryptor: PayloadEncryptor,
    breaker: CircuitBreaker,
    rate_limiter: RateLimiter,
    headers: HeaderMap,
    stats: std::sync::Mutex<StatsInner>,
    rules_etag: std::sync::Mutex<Option<String>>,
}

impl HttpTransport {
    pub fn new(config: Arc<AgentConfig>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout))
            .build()
            .map_err(|e| TransportError::Init(format!("failed to build HTTP client: {e}")))?;

        let headers = Self::build_headers(&config)?;
        let encryptor = PayloadEncryptor::new(&config.api_key, &config.project_id);

        Ok(HttpTransport {
            config,
            client,
            encryptor,
            breaker: CircuitBreaker::default(),
            rate_limiter: RateLimiter::default(),
            headers,
            stats: std::sync::Mutex::new(StatsInner::default()),
            rules_etag: std::sync::Mutex::new(None),
        })
    }

    fn build_headers(config: &AgentConfig) -> Result<HeaderMap, TransportError> {
        let mut headers = HeaderMap::new();
        let bearer = format!("Bearer {}", config.api_key);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&bearer)
                .map_err(|e| TransportError::Init(format!("invalid api_key header: {e}")))?,
        );
        headers.insert(
            "X-Project-Id",
            HeaderValue::from_str(&config.project_id)
                .map_err(|e| TransportError::Init(format!("invalid project_id header: {e}")))?,
        );
        headers.insert(
            "X-Agent-Version",
            HeaderValue::from_str(AGENT_VERSION)
                .map_err(|e| TransportError::Init(format!("invalid version header: {e}")))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let user_agent = format!("fastapi-guard-agent/{AGENT_VERSION}");
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&user_agent)
                .map_err(|e| TransportError::Init(format!("invalid user agent: {e}")))?,
        );
        Ok(headers)
    }

    /// Verifies the derived encryption key with a round-trip probe. Called
    /// by the handler during start; failure aborts startup.
    pub fn verify_encryption(&self) -> Result<(), EncryptionError> {
        self.encryptor.verify()
    }

    /// Sends a batch of events to the encrypted intake endpoint.
    pub async fn send_events(&self, events: &[SecurityEvent]) -> Result<(), TransportError> {
        if events.is_empty() {
            return Ok(());
        }
        let body = self.encrypted_body(&serde_json::json!({ "events": events }))?;
        let url = format!("{}/api/v1/events/encrypted", self.config.base_url());
        self.post_with_retry(&url, body).await
    }

    /// Sends a batch of metrics to the encrypted intake endpoint.
    pub async fn send_metrics(&self, metrics: &[SecurityMetric]) -> Result<(), TransportError> {
        if metrics.is_empty() {
            return Ok(());
        }
        let body = self.encrypted_body(&serde_json::json!({ "metrics": metrics }))?;
        let url = format!("{}/api/v1/metrics/encrypted", self.config.base_url());
        self.post_with_retry(&url, body).await
    }

    /// Pushes an agent status heartbeat. Status payloads are not encrypted.
    pub async fn send_status(&self, status: &AgentStatus) -> Result<(), TransportError> {
        let body = serde_json::to_vec(status)
            .map_err(|e| TransportError::Encryption(EncryptionError::Serialization(e)))?;
        let url = format!("{}/api/v1/agents/status", self.config.base_url());
        self.post_with_retry(&url, body).await
    }

    /// Fetches the dynamic rule document. `Ok(None)` means the cached
    /// version is still current (HTTP 304). Rule polling is a GET, so the
    /// retry policy does not apply; the poller simply tries again next tick.
    pub async fn fetch_dynamic_rules(&self) -> Result<Option<DynamicRules>, TransportError> {
        self.rate_limiter.acquire().await;

        let url = format!(
            "{}/api/v1/projects/{}/rules",
            self.config.base_url(),
            self.config.project_id
        );
        let etag = self.rules_etag.lock().expect("etag lock poisoned").clone();

        let result = self
            .breaker
            .call(async {
                let mut request = self.client.get(&url).headers(self.headers.clone());
                if let Some(etag) = &etag {
                    request = request.header(IF_NONE_MATCH, etag);
                }
                let response = request.send().await.map_err(TransportError::Network)?;

                if response.status() == StatusCode::NOT_MODIFIED {
                    return Ok(None);
                }
                Self::classify(response.status())?;

                let fresh_etag = response
                    .headers()
                    .get(ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(String::from);
                let mut rules: DynamicRules =
                    response.json().await.map_err(TransportError::Network)?;
                if rules.etag.is_none() {
                    rules.etag = fresh_etag.clone();
                }
                Ok(Some((rules, fresh_etag)))
            })
            .await;

        match result {
            Ok(Some((rules, fresh_etag))) => {
                self.record_success();
                if let Some(etag) = fresh_etag.or_else(|| rules.etag.clone()) {
                    *self.rules_etag.lock().expect("etag lock poisoned") = Some(etag);
                }
                Ok(Some(rules))
            }
            Ok(None) => {
                self.record_success();
                debug!("Dynamic rules unchanged (304)");
                Ok(None)
            }
            Err(CircuitError::Open) => {
                self.record_failure(&TransportError::CircuitOpen);
                Err(TransportError::CircuitOpen)
            }
            Err(CircuitError::Inner(err)) => {
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    /// Probes the backend health endpoint.
    pub async fn test_connection(&self) -> bool {
        self.rate_limiter.acquire().await;
        let url = format!("{}/api/v1/health", self.config.base_url());
        let result = self
            .breaker
            .call(async {
                let response = self
                    .client
                    .get(&url)
                    .headers(self.headers.clone())
                    .send()
                    .await
                    .map_err(TransportError::Network)?;
                Self::classify(response.status())
            })
            .await;
        result.is_ok()
    }

    pub async fn circuit_state(&self) -> CircuitState {
        self.breaker.state().await
    }

    pub fn stats(&self) -> TransportStats {
        let stats = self.stats.lock().expect("stats lock poisoned");
        TransportStats {
            requests_sent: stats.requests_sent,
            requests_failed: stats.requests_failed,
            bytes_sent: stats.bytes_sent,
            last_success_ts: stats.last_success_ts,
            last_error: stats.last_error.clone(),
        }
    }

    pub async fn rate_limiter_stats(&self) -> crate::rate_limiter::RateLimiterStats {
        self.rate_limiter.stats().await
    }

    fn encrypted_body(&self, plaintext: &serde_json::Value) -> Result<Vec<u8>, TransportError> {
        let payload = self.encryptor.encrypt(plaintext)?;
        let envelope = serde_json::json!({
            "project_id": self.config.project_id,
            "encrypted": true,
            "payload": payload,
        });
        serde_json::to_vec(&envelope)
            .map_err(|e| TransportError::Encryption(EncryptionError::Serialization(e)))
    }

    async fn post_with_retry(&self, url: &str, body: Vec<u8>) -> Result<(), TransportError> {
        self.rate_limiter.acquire().await;

        let attempts = self.config.retry_attempts + 1;
        let mut last_err = TransportError::CircuitOpen;

        for attempt in 1..=attempts {
            let result = self.breaker.call(self.post_once(url, body.clone())).await;
            match result {
                Ok(()) => {
                    self.record_success();
                    debug!("POST {} succeeded (attempt {})", url, attempt);
                    return Ok(());
                }
                Err(CircuitError::Open) => {
                    warn!(
                        "POST {} short-circuited by open breaker (attempt {}/{})",
                        url, attempt, attempts
                    );
                    last_err = TransportError::CircuitOpen;
                    self.record_failure(&last_err);
                }
                Err(CircuitError::Inner(err)) => {
                    self.record_failure(&err);
                    if !err.is_retriable() {
                        warn!("POST {} failed permanently: {}", url, err);
                        return Err(err);
                    }
                    warn!(
                        "POST {} attempt {}/{} failed: {}",
                        url, attempt, attempts, err
                    );
                    last_err = err;
                }
            }

            if attempt < attempts {
                let delay = calculate_backoff_delay(attempt, self.config.backoff_factor);
                tokio::time::sleep(delay).await;
            }
        }
        Err(last_err)
    }

    async fn post_once(&self, url: &str, body: Vec<u8>) -> Result<(), TransportError> {
        {
            let mut stats = self.stats.lock().expect("stats lock poisoned");
            stats.bytes_sent += body.len() as u64;
        }
        let response = self
            .client
            .post(url)
            .headers(self.headers.clone())
            .body(body)
            .send()
            .await
            .map_err(TransportError::Network)?;
        Self::classify(response.status())
    }

    fn classify(status: StatusCode) -> Result<(), TransportError> {
        if status.is_success() {
            Ok(())
        } else if status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
        {
            Err(TransportError::RetriableStatus { status })
        } else {
            Err(TransportError::Permanent { status })
        }
    }

    fn record_success(&self) {
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        stats.requests_sent += 1;
        stats.last_success_ts = Some(get_current_timestamp());
    }

    fn record_failure(&self, err: &TransportError) {
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        stats.requests_failed += 1;
        stats.last_error = Some(err.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> HttpTransport {
        let config = Arc::new(AgentConfig {
            api_key: "test-api-key-123".to_string(),
            project_id: "proj-1".to_string(),
            endpoint: "https://api.example.com/".to_string(),
            retry_attempts: 0,
            ..Default::default()
        });
        HttpTransport::new(config).unwrap()
    }

    #[test]
    fn test_classify_success() {
        assert!(HttpTransport::classify(StatusCode::OK).is_ok());
        assert!(HttpTransport::classify(StatusCode::CREATED).is_ok());
        assert!(HttpTransport::classify(StatusCode::ACCEPTED).is_ok());
    }

    #[test]
    fn test_classify_retriable() {
        for status in [
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            let err = HttpTransport::classify(status).unwrap_err();
            assert!(err.is_retriable(), "{status} must be retriable");
            assert_eq!(err.status(), Some(status));
        }
    }

    #[test]
    fn test_classify_permanent() {
        for status in [
            StatusCode::BAD_REQUEST,
            StatusCode::UNAUTHORIZED,
            StatusCode::FORBIDDEN,
            StatusCode::NOT_FOUND,
            StatusCode::PAYLOAD_TOO_LARGE,
        ] {
            let err = HttpTransport::classify(status).unwrap_err();
            assert!(!err.is_retriable(), "{status} must be permanent");
        }
    }

    #[test]
    fn test_headers_include_identity() {
        let transport = transport();
        assert_eq!(
            transport.headers.get(AUTHORIZATION).unwrap(),
            "Bearer test-api-key-123"
        );
        assert_eq!(transport.headers.get("X-Project-Id").unwrap(), "proj-1");
        assert_eq!(
            transport.headers.get("X-Agent-Version").unwrap(),
            crate::AGENT_VERSION
        );
        let user_agent = transport.headers.get(USER_AGENT).unwrap().to_str().unwrap();
        assert!(user_agent.starts_with("fastapi-guard-agent/"));
    }

    #[test]
    fn test_encrypted_body_envelope_shape() {
        let transport = transport();
        let body = transport
            .encrypted_body(&serde_json::json!({ "events": [] }))
            .unwrap();
        let envelope: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(envelope["project_id"], "proj-1");
        assert_eq!(envelope["encrypted"], true);
        assert!(envelope["payload"].is_string());

        // The payload must open under the same derived key.
        let payload = envelope["payload"].as_str().unwrap();
        let opened: serde_json::Value = transport.encryptor.decrypt(payload).unwrap();
        assert_eq!(opened, serde_json::json!({ "events": [] }));
    }

    #[test]
    fn test_verify_encryption_succeeds_for_valid_key() {
        assert!(transport().verify_encryption().is_ok());
    }

    #[tokio::test]
    async fn test_stats_start_empty() {
        let transport = transport();
        let stats = transport.stats();
        assert_eq!(stats.requests_sent, 0);
        assert_eq!(stats.requests_failed, 0);
        assert_eq!(stats.bytes_sent, 0);
        assert!(stats.last_error.is_none());
        assert_eq!(transport.circuit_state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_empty_batches_are_not_sent() {
        let transport = transport();
        transport.send_events(&[]).await.unwrap();
        transport.send_metrics(&[]).await.unwrap();
        assert_eq!(transport.stats().requests_sent, 0);
        assert_eq!(transport.stats().bytes_sent, 0);
    }
}
