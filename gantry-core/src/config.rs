//! Pipeline configuration surface.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_INCOMPLETE_REQUEST_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_ENDPOINT_TIMEOUT_MS: u64 = 58_000;
pub const DEFAULT_MAX_OPEN_CONNECTIONS: usize = 20_000;
pub const DEFAULT_MIME_TYPE: &str = "application/json";
pub const DEFAULT_CHARSET: &str = "UTF-8";

macro_rules! define_const {
    ($name: ident, $val: expr, $type: ty) => {
        const fn $name() -> $type {
            $val
        }
    };
}

/// Per-server pipeline configuration. All timeouts are in milliseconds;
/// a value of zero disables the corresponding limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Idle time allowed between requests before the connection is closed.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Time allowed between frames of a partially received request before
    /// the cycle fails with 408.
    #[serde(default = "default_incomplete_request_timeout_ms")]
    pub incomplete_request_timeout_ms: u64,
    /// Default endpoint execution timeout, overridable per endpoint.
    #[serde(default = "default_endpoint_timeout_ms")]
    pub endpoint_timeout_ms: u64,
    /// New connections beyond this count are rejected with 503.
    #[serde(default = "default_max_open_connections")]
    pub max_open_connections: usize,
    /// Global request body ceiling in bytes, overridable per endpoint.
    /// Zero disables the global check.
    #[serde(default)]
    pub max_request_body_bytes: usize,
    /// Mime type used when neither the response nor the request names one.
    #[serde(default = "default_mime_type")]
    pub default_mime_type: String,
    /// Charset used when the response names none.
    #[serde(default = "default_charset")]
    pub default_charset: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            idle_timeout_ms: default_idle_timeout_ms(),
            incomplete_request_timeout_ms: default_incomplete_request_timeout_ms(),
            endpoint_timeout_ms: default_endpoint_timeout_ms(),
            max_open_connections: default_max_open_connections(),
            max_request_body_bytes: 0,
            default_mime_type: default_mime_type(),
            default_charset: default_charset(),
        }
    }
}

define_const!(default_idle_timeout_ms, DEFAULT_IDLE_TIMEOUT_MS, u64);
define_const!(
    default_incomplete_request_timeout_ms,
    DEFAULT_INCOMPLETE_REQUEST_TIMEOUT_MS,
    u64
);
define_const!(default_endpoint_timeout_ms, DEFAULT_ENDPOINT_TIMEOUT_MS, u64);
define_const!(
    default_max_open_connections,
    DEFAULT_MAX_OPEN_CONNECTIONS,
    usize
);

fn default_mime_type() -> String {
    DEFAULT_MIME_TYPE.to_string()
}

fn default_charset() -> String {
    DEFAULT_CHARSET.to_string()
}

impl PipelineConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        nonzero_ms(self.idle_timeout_ms)
    }

    pub fn incomplete_request_timeout(&self) -> Option<Duration> {
        nonzero_ms(self.incomplete_request_timeout_ms)
    }

    pub fn endpoint_timeout(&self) -> Option<Duration> {
        nonzero_ms(self.endpoint_timeout_ms)
    }
}

fn nonzero_ms(ms: u64) -> Option<Duration> {
    (ms != 0).then(|| Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_deserialize_defaults() {
        let config: PipelineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.idle_timeout_ms, DEFAULT_IDLE_TIMEOUT_MS);
        assert_eq!(config.default_mime_type, "application/json");
        assert_eq!(config.max_request_body_bytes, 0);
    }

    #[test]
    fn test_zero_timeout_disables() {
        let config: PipelineConfig = serde_json::from_str(
            "{\"idle_timeout_ms\": 0, \"incomplete_request_timeout_ms\": 250, \"endpoint_timeout_ms\": 0}",
        )
        .unwrap();
        assert!(config.idle_timeout().is_none());
        assert_eq!(
            config.incomplete_request_timeout(),
            Some(Duration::from_millis(250))
        );
        assert!(config.endpoint_timeout().is_none());
    }
}
