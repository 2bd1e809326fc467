use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `MAILFLOW__` and an optional TOML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// ─── Scheduler Config ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// A job left in `processing` longer than this is handed back to the queue.
    #[serde(default = "default_stale_claim_secs")]
    pub stale_claim_secs: u64,
}

fn default_poll_interval_ms() -> u64 { 5_000 }
fn default_batch_size() -> usize { 50 }
fn default_max_retries() -> u32 { 3 }
fn default_base_delay_secs() -> u64 { 300 }
fn default_workers() -> usize { 2 }
fn default_stale_claim_secs() -> u64 { 600 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            base_delay_secs: default_base_delay_secs(),
            workers: default_workers(),
            stale_claim_secs: default_stale_claim_secs(),
        }
    }
}

// ─── Delivery Config ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Logs messages instead of sending them (development).
    Log,
    Smtp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_transport")]
    pub transport: TransportKind,
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_from")]
    pub default_from: String,
    #[serde(default)]
    pub default_reply_to: Option<String>,
}

fn default_transport() -> TransportKind { TransportKind::Log }
fn default_send_timeout_secs() -> u64 { 30 }
fn default_from() -> String { "Voice Market <hello@voicemarket.io>".to_string() }

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            send_timeout_secs: default_send_timeout_secs(),
            default_from: default_from(),
            default_reply_to: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "default_smtp_host")]
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_starttls")]
    pub starttls: bool,
}

fn default_smtp_host() -> String { "localhost".to_string() }
fn default_smtp_port() -> u16 { 587 }
fn default_starttls() -> bool { true }

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_smtp_host(),
            port: default_smtp_port(),
            username: None,
            password: None,
            starttls: default_starttls(),
        }
    }
}

// ─── Reconciler Config ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcilerConfig {
    /// Lookups retried for an unknown provider message id before dropping.
    #[serde(default = "default_unknown_event_retries")]
    pub unknown_event_retries: u32,
    #[serde(default = "default_unknown_event_retry_delay_ms")]
    pub unknown_event_retry_delay_ms: u64,
}

fn default_unknown_event_retries() -> u32 { 3 }
fn default_unknown_event_retry_delay_ms() -> u64 { 250 }

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            unknown_event_retries: default_unknown_event_retries(),
            unknown_event_retry_delay_ms: default_unknown_event_retry_delay_ms(),
        }
    }
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            scheduler: SchedulerConfig::default(),
            delivery: DeliveryConfig::default(),
            smtp: SmtpConfig::default(),
            reconciler: ReconcilerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and an optional config file.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("MAILFLOW")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(","),
            )
            .build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.scheduler.batch_size, 50);
        assert_eq!(config.scheduler.max_retries, 3);
        assert_eq!(config.scheduler.base_delay_secs, 300);
        assert_eq!(config.delivery.send_timeout_secs, 30);
        assert_eq!(config.delivery.transport, TransportKind::Log);
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let config: AppConfig = serde_json::from_value(serde_json::json!({
            "node_id": "worker-7",
            "scheduler": { "batch_size": 10 },
            "delivery": { "transport": "smtp" }
        }))
        .unwrap();
        assert_eq!(config.node_id, "worker-7");
        assert_eq!(config.scheduler.batch_size, 10);
        assert_eq!(config.scheduler.poll_interval_ms, 5_000);
        assert_eq!(config.delivery.transport, TransportKind::Smtp);
        assert_eq!(config.smtp.port, 587);
    }
}
