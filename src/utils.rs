//! Small helpers shared across the agent: timestamps, header redaction,
//! payload clamping, IP anonymisation, backoff delays and batch ids.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;

/// Placeholder written over redacted header values.
pub const REDACTED: &str = "[REDACTED]";

/// Suffix appended to clamped payload fields.
const TRUNCATION_MARKER: &str = "...[TRUNCATED]";

/// Upper bound for a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Current system time as seconds since the Unix epoch.
///
/// Used uniformly for every timestamp that goes on the wire.
pub fn get_current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Generates a unique batch id: millisecond timestamp plus random hex.
pub fn generate_batch_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let random: u32 = rand::thread_rng().gen();
    format!("{millis}-{random:08x}")
}

/// Returns a copy of `headers` with sensitive keys (case-insensitive)
/// replaced by [`REDACTED`].
pub fn redact_sensitive(
    headers: &HashMap<String, serde_json::Value>,
    sensitive: &HashSet<String>,
) -> HashMap<String, serde_json::Value> {
    let lowered: HashSet<String> = sensitive.iter().map(|h| h.to_lowercase()).collect();
    headers
        .iter()
        .map(|(key, value)| {
            if lowered.contains(&key.to_lowercase()) {
                (key.clone(), serde_json::Value::String(REDACTED.to_string()))
            } else {
                (key.clone(), value.clone())
            }
        })
        .collect()
}

/// Clamps a payload string to `max_bytes`, appending a truncation marker
/// when anything was cut. Truncation lands on a char boundary.
pub fn clamp_payload(value: &str, max_bytes: usize) -> String {
    if value.len() <= max_bytes {
        return value.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &value[..end], TRUNCATION_MARKER)
}

/// Masks the tail of an IP address when anonymisation is enabled: the last
/// octet for IPv4, the last 80 bits for IPv6. Unparseable input is returned
/// unchanged.
pub fn anonymize_ip(ip: &str, enabled: bool) -> String {
    if !enabled {
        return ip.to_string();
    }
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            let octets = v4.octets();
            Ipv4Addr::new(octets[0], octets[1], octets[2], 0).to_string()
        }
        Ok(IpAddr::V6(v6)) => {
            let segments = v6.segments();
            Ipv6Addr::new(segments[0], segments[1], segments[2], 0, 0, 0, 0, 0).to_string()
        }
        Err(_) => ip.to_string(),
    }
}

/// Backoff before retrying attempt `attempt` (1-based): exponential in the
/// attempt number, scaled by `backoff_factor`, with 0-30% jitter, capped at
/// 30 seconds.
pub fn calculate_backoff_delay(attempt: u32, backoff_factor: f64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let base = backoff_factor * f64::from(1u32 << exponent);
    let jitter = 1.0 + rand::thread_rng().gen_range(0.0..0.3);
    Duration::from_secs_f64(base * jitter).min(MAX_BACKOFF)
}
