//! # Guard Agent
//!
//! Embedded telemetry and control-plane agent for the guard security
//! middleware. The agent collects security events and performance metrics
//! produced at request time, batches them in memory (with optional durable
//! overflow to an external key/value store), encrypts each batch with
//! AES-256-GCM and delivers it to the management backend over HTTP with
//! retries, a circuit breaker and client-side rate limiting. It also polls
//! the backend for dynamic rule documents and pushes periodic status
//! heartbeats.
//!
//! ## Architecture
//!
//! ```text
//!   host middleware
//!        │ send_event / send_metric
//!        v
//!   ┌──────────┐   overflow    ┌───────────┐
//!   │  Buffer  │──────────────>│  KvStore  │ (optional, host-owned)
//!   └────┬─────┘<──recover─────└───────────┘
//!        │ flush (timer / high-water / stop)
//!        v
//!   ┌───────────┐  encrypt → breaker → rate limit → HTTP
//!   │ Transport │────────────────────────────────────────> backend
//!   └───────────┘
//! ```
//!
//! The [`handler`] module owns the lifecycle: a singleton
//! [`handler::GuardAgentHandler`] runs the flush loop, the heartbeat loop
//! and the rule poller as independent cancellable tasks.
//!
//! ## Example
//!
//! ```rust,no_run
//! use guard_agent::config::AgentConfig;
//! use guard_agent::handler::guard_agent;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AgentConfig {
//!     api_key: "my-project-api-key".to_string(),
//!     project_id: "proj-1".to_string(),
//!     ..Default::default()
//! };
//!
//! let agent = guard_agent(config)?;
//! agent.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod circuit_breaker;
pub mod config;
pub mod encryption;
pub mod handler;
pub mod logger;
pub mod models;
pub mod rate_limiter;
pub mod store;
pub mod transport;
pub mod utils;

/// Agent version reported in `X-Agent-Version` and status payloads.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
