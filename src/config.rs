use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub load_balancer: LoadBalancerConfig,
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub rate_limiter: Option<RateLimiterConfig>,
    pub logger: Option<LoggerConfig>,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(with = "duration_serde")]
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            drain_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoadBalancerConfig {
    pub method: LoadBalancingMethod,
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum LoadBalancingMethod {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
}

impl LoadBalancingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalancingMethod::RoundRobin => "RoundRobin",
            LoadBalancingMethod::WeightedRoundRobin => "WeightedRoundRobin",
            LoadBalancingMethod::LeastConnections => "LeastConnections",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default = "default_connect_timeout", with = "duration_serde")]
    pub connect_timeout: Duration,
    #[serde(default = "default_read_timeout", with = "duration_serde")]
    pub read_timeout: Duration,
    #[serde(default)]
    pub max_connections: usize,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterConfig {
    pub enabled: bool,
    #[serde(rename = "type", default = "default_limiter_type")]
    pub limiter_type: String,
    #[serde(default)]
    pub token_bucket: Option<TokenBucketConfig>,
    /// Derive client identity from `X-Forwarded-For` / `X-Real-IP`.
    #[serde(default)]
    pub trust_forwarded_headers: bool,
}

fn default_limiter_type() -> String {
    "TokenBucket".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenBucketConfig {
    pub rate: f64,
    pub burst: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggerConfig {
    #[serde(rename = "logLevel")]
    pub log_level: String,
    #[serde(rename = "nodeIP", default)]
    pub node_ip: String,
    #[serde(rename = "podIP", default)]
    pub pod_ip: String,
    #[serde(rename = "serviceName")]
    pub service_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
            path: "/metrics".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Blocking variant used from the file watcher thread
    pub fn load_blocking(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)
            .context("Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            anyhow::bail!("No backends configured");
        }

        let mut seen = HashSet::new();
        for backend in &self.backends {
            if backend.id.is_empty() {
                anyhow::bail!("Backend ID is required");
            }
            if backend.url.is_empty() {
                anyhow::bail!("Backend URL is required for backend '{}'", backend.id);
            }
            reqwest::Url::parse(&backend.url)
                .with_context(|| format!("Invalid URL for backend '{}': {}", backend.id, backend.url))?;
            if let Some(weight) = backend.weight {
                if !(weight > 0.0) {
                    anyhow::bail!("Backend weight must be positive for backend '{}'", backend.id);
                }
            }
            if !seen.insert(backend.id.as_str()) {
                anyhow::bail!("Duplicate backend ID: {}", backend.id);
            }
        }

        if let Some(rate_limiter) = &self.rate_limiter {
            if rate_limiter.enabled {
                if rate_limiter.limiter_type != "TokenBucket" {
                    anyhow::bail!("Unsupported rate limiter type: {}", rate_limiter.limiter_type);
                }
                let bucket = rate_limiter
                    .token_bucket
                    .as_ref()
                    .context("Token bucket configuration is required")?;
                if !(bucket.rate > 0.0) {
                    anyhow::bail!("Token bucket rate must be positive");
                }
                if bucket.burst == 0 {
                    anyhow::bail!("Token bucket burst must be positive");
                }
            }
        }

        let logger = self.logger.as_ref().context("Logger configuration is required")?;
        match logger.log_level.as_str() {
            "debug" | "info" | "warn" | "error" | "fatal" => {}
            other => anyhow::bail!("Unsupported log level: {}", other),
        }
        if logger.service_name.is_empty() {
            anyhow::bail!("Logger service name is required");
        }

        Ok(())
    }

    /// Token bucket defaults when rate limiting is enabled
    pub fn token_bucket(&self) -> Option<&TokenBucketConfig> {
        self.rate_limiter
            .as_ref()
            .filter(|rl| rl.enabled)
            .and_then(|rl| rl.token_bucket.as_ref())
    }

    pub fn trust_forwarded_headers(&self) -> bool {
        self.rate_limiter
            .as_ref()
            .map(|rl| rl.trust_forwarded_headers)
            .unwrap_or(false)
    }

    /// Filter directive for the tracing subscriber
    pub fn log_filter(&self) -> &'static str {
        match self.logger.as_ref().map(|l| l.log_level.as_str()) {
            Some("debug") => "debug",
            Some("warn") => "warn",
            Some("error") | Some("fatal") => "error",
            _ => "info",
        }
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse_duration(s: &str) -> std::result::Result<Duration, Box<dyn std::error::Error + Send + Sync>> {
        let s = s.trim();
        if let Some(num) = s.strip_suffix("ms") {
            Ok(Duration::from_millis(num.trim().parse()?))
        } else if let Some(num) = s.strip_suffix('s') {
            Ok(Duration::from_secs(num.trim().parse()?))
        } else if let Some(num) = s.strip_suffix('m') {
            scaled_secs(num, 60)
        } else if let Some(num) = s.strip_suffix('h') {
            scaled_secs(num, 3600)
        } else {
            Ok(Duration::from_secs(s.parse()?))
        }
    }

    fn scaled_secs(num: &str, unit: u64) -> std::result::Result<Duration, Box<dyn std::error::Error + Send + Sync>> {
        num.trim()
            .parse::<u64>()?
            .checked_mul(unit)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration out of range: {}", num.trim()).into())
    }
}
