//! Registry Configuration
//!
//! Timing knobs and endpoints for the backend adapters, with environment
//! variable overrides. Service identity and TTLs live in
//! [`waypoint_core::ServiceConf`]; this covers how we talk to the backends.

use std::time::Duration;

/// Backend connection and timing configuration with sensible defaults
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    // Etcd settings
    /// Etcd endpoints (env: ETCD_ENDPOINTS, comma-separated)
    pub etcd_endpoints: Vec<String>,

    /// Initial interval for etcd connection retry
    pub etcd_backoff_initial: Duration,

    /// Maximum interval for etcd connection retry
    pub etcd_backoff_max: Duration,

    /// Maximum elapsed time for etcd connection retries
    pub etcd_backoff_max_elapsed: Duration,

    /// Multiplier for etcd backoff
    pub etcd_backoff_multiplier: f64,

    /// Wait between lease recovery attempts
    pub etcd_retry_backoff: Duration,

    /// Delay before resubscribing after the watch stream ends
    pub watch_resubscribe_delay: Duration,

    // Consul settings
    /// Consul agent address (env: CONSUL_HTTP_ADDR)
    pub consul_addr: String,

    /// Long-poll wait passed to blocking queries
    pub consul_wait: Duration,

    /// Backoff after a failed blocking query
    pub consul_error_backoff: Duration,

    // Kubernetes settings
    /// ConfigMap poll interval (None = half the service TTL)
    pub kube_poll_interval: Option<Duration>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            etcd_endpoints: vec!["http://127.0.0.1:2379".to_string()],
            etcd_backoff_initial: Duration::from_secs(1),
            etcd_backoff_max: Duration::from_secs(10),
            etcd_backoff_max_elapsed: Duration::from_secs(60),
            etcd_backoff_multiplier: 2.0,
            etcd_retry_backoff: Duration::from_secs(5),
            watch_resubscribe_delay: Duration::from_millis(200),

            consul_addr: "http://127.0.0.1:8500".to_string(),
            consul_wait: Duration::from_secs(30),
            consul_error_backoff: Duration::from_secs(5),

            kube_poll_interval: None,
        }
    }
}

impl RegistryConfig {
    /// Create configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(endpoints) = std::env::var("ETCD_ENDPOINTS") {
            config.etcd_endpoints = parse_endpoints(&endpoints);
        }

        if let Ok(addr) = std::env::var("CONSUL_HTTP_ADDR") {
            config.consul_addr = normalize_consul_addr(&addr);
        }

        if let Ok(wait) = std::env::var("CONSUL_WAIT_SECS") {
            if let Ok(parsed) = wait.parse::<u64>() {
                config.consul_wait = Duration::from_secs(parsed);
            }
        }

        if let Ok(interval) = std::env::var("KUBE_POLL_INTERVAL_SECS") {
            if let Ok(parsed) = interval.parse::<u64>() {
                config.kube_poll_interval = Some(Duration::from_secs(parsed.max(1)));
            }
        }

        config
    }

    /// Request timeout for blocking queries: the wait plus Consul's jitter
    /// allowance (wait / 16) plus slack.
    pub fn consul_request_timeout(&self) -> Duration {
        self.consul_wait + self.consul_wait / 16 + Duration::from_secs(5)
    }
}

/// Split a comma-separated endpoint list, dropping blanks.
pub fn parse_endpoints(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Consul accepts bare `host:port`; reqwest needs a scheme.
pub fn normalize_consul_addr(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}
