pub mod mock_server;

use guard_agent::config::AgentConfig;
use guard_agent::models::{SecurityEvent, SecurityEventType};

/// Fast-cadence config pointed at the mock backend. Each test uses its own
/// project id so the global handler registry never collides across tests.
pub fn test_config(endpoint: &str, project_id: &str) -> AgentConfig {
    AgentConfig {
        api_key: "integration-test-key".to_string(),
        project_id: project_id.to_string(),
        endpoint: endpoint.to_string(),
        buffer_size: 10,
        flush_interval: 1,
        retry_attempts: 0,
        backoff_factor: 0.1,
        timeout: 5,
        ..Default::default()
    }
}

pub fn test_event(reason: &str) -> SecurityEvent {
    SecurityEvent::new(
        SecurityEventType::SuspiciousRequest,
        "203.0.113.10",
        "blocked",
        reason,
    )
}
