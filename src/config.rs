use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

/// Wire protocol spoken by a backend endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    /// Claude Messages API; requests pass through untranslated.
    #[default]
    #[serde(alias = "claude", alias = "anthropic")]
    Native,
    #[serde(alias = "openai")]
    OpenaiChat,
    OpenaiResponses,
    Gemini,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::OpenaiChat => "openai-chat",
            Self::OpenaiResponses => "openai-responses",
            Self::Gemini => "gemini",
        }
    }

    pub const ALL: [Protocol; 4] = [
        Protocol::Native,
        Protocol::OpenaiChat,
        Protocol::OpenaiResponses,
        Protocol::Gemini,
    ];
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configured backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,

    #[serde(alias = "api_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub protocol: Protocol,

    /// Model name sent upstream instead of the client's. Required for
    /// protocols other than the client's own dialect.
    #[serde(default, alias = "model_override", skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Endpoint {
    pub fn new(name: &str, base_url: &str, api_key: &str, protocol: Protocol) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
            enabled: true,
            protocol,
            model: None,
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Failover tuning. Values are milliseconds unless noted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationConfig {
    /// Consecutive failures on one endpoint before rotating away from it.
    #[serde(default = "default_failures_before_rotate")]
    pub failures_before_rotate: u32,

    /// Upper bound on waiting for in-flight requests to drain before a rotation.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Re-check interval while draining.
    #[serde(default = "default_drain_poll_ms")]
    pub drain_poll_ms: u64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            failures_before_rotate: default_failures_before_rotate(),
            drain_timeout_ms: default_drain_timeout_ms(),
            drain_poll_ms: default_drain_poll_ms(),
        }
    }
}

impl RotationConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn drain_poll(&self) -> Duration {
        Duration::from_millis(self.drain_poll_ms.max(1))
    }

    /// At least one failure is needed before a rotation can happen.
    pub fn threshold(&self) -> u32 {
        self.failures_before_rotate.max(1)
    }
}

/// Parsed JSON configuration (deserializable).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(rename = "Endpoints")]
    pub endpoints: Vec<Endpoint>,

    #[serde(default)]
    #[serde(rename = "Rotation")]
    pub rotation: RotationConfig,

    #[serde(default = "default_port")]
    #[serde(rename = "PORT")]
    pub port: u16,

    #[serde(default = "default_host")]
    #[serde(rename = "HOST")]
    pub host: String,

    #[serde(default = "default_timeout")]
    #[serde(rename = "API_TIMEOUT_MS")]
    pub api_timeout_ms: u64,

    #[serde(default)]
    #[serde(rename = "PROXY_URL")]
    pub proxy_url: Option<String>,

    /// Maximum number of idle connections per host in the shared HTTP pool.
    #[serde(default = "default_pool_max_idle_per_host")]
    #[serde(rename = "POOL_MAX_IDLE_PER_HOST")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in milliseconds (0 = no timeout).
    #[serde(default = "default_pool_idle_timeout_ms")]
    #[serde(rename = "POOL_IDLE_TIMEOUT_MS")]
    pub pool_idle_timeout_ms: u64,

    /// SSE channel buffer size per stream (number of chunks).
    #[serde(default = "default_sse_buffer_size")]
    #[serde(rename = "SSE_BUFFER_SIZE")]
    pub sse_buffer_size: usize,

    /// How often daily stats are flushed to storage (0 = only at shutdown).
    #[serde(default = "default_stats_flush_secs")]
    #[serde(rename = "STATS_FLUSH_INTERVAL_SECS")]
    pub stats_flush_interval_secs: u64,
}

/// Runtime configuration shared across all handlers via Axum state.
/// Wraps the parsed config plus a shared reqwest::Client connection pool.
#[derive(Debug, Clone)]
pub struct Config {
    inner: Arc<ConfigInner>,
}

#[derive(Debug)]
struct ConfigInner {
    file: ConfigFile,
    http_client: reqwest::Client,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let content =
            fs::read_to_string(path).context(format!("Failed to read config file: {}", path))?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let file: ConfigFile =
            serde_json::from_str(content).context("Failed to parse config JSON")?;
        Self::from_config_file(file)
    }

    pub fn from_config_file(file: ConfigFile) -> Result<Self> {
        validate_endpoints(&file.endpoints)?;

        // Build a single shared reqwest::Client with a properly-sized connection pool.
        let mut client_builder = reqwest::Client::builder()
            .timeout(Duration::from_millis(file.api_timeout_ms))
            .pool_max_idle_per_host(file.pool_max_idle_per_host)
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true);

        if file.pool_idle_timeout_ms > 0 {
            client_builder =
                client_builder.pool_idle_timeout(Duration::from_millis(file.pool_idle_timeout_ms));
        }

        if let Some(proxy_url) = file.proxy_url.as_deref().filter(|u| !u.is_empty()) {
            let proxy = reqwest::Proxy::all(proxy_url)
                .context(format!("Invalid PROXY_URL: {}", proxy_url))?;
            client_builder = client_builder.proxy(proxy);
        }

        let http_client = client_builder.build()?;

        Ok(Config {
            inner: Arc::new(ConfigInner { file, http_client }),
        })
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.inner.file.endpoints
    }

    pub fn rotation(&self) -> &RotationConfig {
        &self.inner.file.rotation
    }

    pub fn host(&self) -> &str {
        &self.inner.file.host
    }

    pub fn port(&self) -> u16 {
        self.inner.file.port
    }

    pub fn api_timeout_ms(&self) -> u64 {
        self.inner.file.api_timeout_ms
    }

    pub fn sse_buffer_size(&self) -> usize {
        self.inner.file.sse_buffer_size.max(1)
    }

    pub fn stats_flush_interval(&self) -> Option<Duration> {
        match self.inner.file.stats_flush_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Get the shared HTTP client. One pool for all requests.
    pub fn http_client(&self) -> &reqwest::Client {
        &self.inner.http_client
    }
}

/// Endpoint names key rotation and stats, so they must be unique and non-empty.
pub fn validate_endpoints(endpoints: &[Endpoint]) -> Result<()> {
    let mut seen = HashSet::new();
    for endpoint in endpoints {
        if endpoint.name.trim().is_empty() {
            bail!("Endpoint with base_url {} has an empty name", endpoint.base_url);
        }
        if endpoint.base_url.trim().is_empty() {
            bail!("Endpoint {} has an empty base_url", endpoint.name);
        }
        if !seen.insert(endpoint.name.as_str()) {
            bail!("Duplicate endpoint name: {}", endpoint.name);
        }
        // No client speaks these dialects, so the upstream model is never inherited.
        if matches!(endpoint.protocol, Protocol::Gemini | Protocol::OpenaiResponses)
            && endpoint.model.as_deref().map_or(true, |m| m.trim().is_empty())
        {
            bail!(
                "Endpoint {} uses protocol {} and needs a model",
                endpoint.name,
                endpoint.protocol
            );
        }
    }
    Ok(())
}

fn default_enabled() -> bool {
    true
}

fn default_failures_before_rotate() -> u32 {
    2
}

fn default_drain_timeout_ms() -> u64 {
    500
}

fn default_drain_poll_ms() -> u64 {
    50
}

fn default_port() -> u16 {
    3456
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_timeout() -> u64 {
    600000 // 10 minutes
}

fn default_pool_max_idle_per_host() -> usize {
    64
}

fn default_pool_idle_timeout_ms() -> u64 {
    90000 // 90 seconds
}

fn default_sse_buffer_size() -> usize {
    32
}

fn default_stats_flush_secs() -> u64 {
    60
}
