use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Environment variables that override the base URL of a default upstream.
pub const UPSTREAM_URL_OVERRIDES: [(&str, &str); 3] = [
    ("SMART_HOME_URL", SMART_HOME_APP),
    ("DEVICE_SERVICE_URL", DEVICE_SERVICE),
    ("TELEMETRY_SERVICE_URL", TELEMETRY_SERVICE),
];

pub const SMART_HOME_APP: &str = "smart-home-app";
pub const DEVICE_SERVICE: &str = "device-service";
pub const TELEMETRY_SERVICE: &str = "telemetry-service";

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub upstreams: Vec<UpstreamConfig>,
    pub routing: RoutingConfig,
    pub client: ClientConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
    pub cors: CorsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct UpstreamConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub match_policy: MatchPolicy,
    /// Evaluated top to bottom; the last entry must be the `/` catch-all.
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchPolicy {
    /// Prefix must end at a path segment boundary.
    #[default]
    Segment,
    /// Plain string-prefix comparison.
    Raw,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RouteConfig {
    pub path: String,
    pub upstream: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub pool_idle_timeout: Duration,
    pub pool_max_idle_per_host: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub access_log: AccessLogConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AccessLogConfig {
    pub enabled: bool,
    pub format: AccessLogFormat,
    /// `stdout` or a file path opened in append mode.
    pub output: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLogFormat {
    #[default]
    Json,
    Common,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CorsConfig {
    pub enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            upstreams: vec![
                UpstreamConfig {
                    name: SMART_HOME_APP.to_string(),
                    url: "http://smarthome-app:8080".to_string(),
                    description: "Smart Home monolith application".to_string(),
                },
                UpstreamConfig {
                    name: DEVICE_SERVICE.to_string(),
                    url: "http://device-service:8082".to_string(),
                    description: "Device management microservice".to_string(),
                },
                UpstreamConfig {
                    name: TELEMETRY_SERVICE.to_string(),
                    url: "http://telemetry-service:8083".to_string(),
                    description: "Telemetry collection microservice".to_string(),
                },
            ],
            routing: RoutingConfig::default(),
            client: ClientConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            cors: CorsConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        let route = |path: &str, upstream: &str| RouteConfig {
            path: path.to_string(),
            upstream: upstream.to_string(),
        };
        Self {
            match_policy: MatchPolicy::Segment,
            routes: vec![
                route("/api/v1/sensors", SMART_HOME_APP),
                route("/api/v1/devices", DEVICE_SERVICE),
                route("/api/v1/telemetry", TELEMETRY_SERVICE),
                route("/", SMART_HOME_APP),
            ],
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            access_log: AccessLogConfig::default(),
        }
    }
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            format: AccessLogFormat::Json,
            output: "stdout".to_string(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "/metrics".to_string(),
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    /// Load configuration from an optional YAML file, then apply
    /// environment overrides and validate the result.
    pub async fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read config file: {}", path))?;
                Self::from_yaml(&content)
                    .with_context(|| format!("Failed to parse config file: {}", path))?
            }
            None => Config::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply overrides resolved through `lookup` (the process environment in
    /// production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        for (var, upstream_name) in UPSTREAM_URL_OVERRIDES {
            let Some(url) = lookup(var) else { continue };
            match self.upstreams.iter_mut().find(|u| u.name == upstream_name) {
                Some(upstream) => upstream.url = url,
                None => anyhow::bail!(
                    "{} is set but no upstream named '{}' is configured",
                    var,
                    upstream_name
                ),
            }
        }

        if let Some(port) = lookup("PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid PORT value: {}", port))?;
        }

        if let Some(host) = lookup("GATEWAY_HOST") {
            self.server.host = host;
        }

        if let Some(secs) = lookup("UPSTREAM_TIMEOUT_SECS") {
            let secs: u64 = secs
                .trim()
                .parse()
                .with_context(|| format!("Invalid UPSTREAM_TIMEOUT_SECS value: {}", secs))?;
            self.client.timeout = Duration::from_secs(secs);
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be zero");
        }

        if self.client.timeout.is_zero() {
            anyhow::bail!("Upstream timeout cannot be zero");
        }

        if self.upstreams.is_empty() {
            anyhow::bail!("At least one upstream must be configured");
        }

        let mut names = HashSet::new();
        for upstream in &self.upstreams {
            if !names.insert(upstream.name.as_str()) {
                anyhow::bail!("Duplicate upstream name: {}", upstream.name);
            }

            let url = reqwest::Url::parse(&upstream.url)
                .with_context(|| format!("Invalid URL for upstream '{}'", upstream.name))?;
            if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
                anyhow::bail!(
                    "Upstream '{}' must use an absolute http(s) URL, got {}",
                    upstream.name,
                    upstream.url
                );
            }
        }

        for route in &self.routing.routes {
            if !route.path.starts_with('/') {
                anyhow::bail!("Route path must start with '/': {}", route.path);
            }
            if !names.contains(route.upstream.as_str()) {
                anyhow::bail!("Route references unknown upstream: {}", route.upstream);
            }
        }

        if self.metrics.enabled {
            let path = self.metrics.path.as_str();
            if !path.starts_with('/') || matches!(path, "/health" | "/gateway/status" | "/gateway/services") {
                anyhow::bail!("Invalid metrics path: {}", path);
            }
        }

        match self.routing.routes.last() {
            Some(last) if last.path == "/" => {}
            _ => anyhow::bail!("The last route must be the '/' catch-all"),
        }

        Ok(())
    }

    pub fn upstream(&self, name: &str) -> Option<&UpstreamConfig> {
        self.upstreams.iter().find(|u| u.name == name)
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() != 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse_duration(
        s: &str,
    ) -> std::result::Result<Duration, Box<dyn std::error::Error + Send + Sync>> {
        let s = s.trim();
        if let Some(num) = s.strip_suffix("ms") {
            Ok(Duration::from_millis(num.parse()?))
        } else if let Some(num) = s.strip_suffix('s') {
            Ok(Duration::from_secs(num.parse()?))
        } else if let Some(num) = s.strip_suffix('m') {
            Ok(Duration::from_secs(scaled(num, 60)?))
        } else if let Some(num) = s.strip_suffix('h') {
            Ok(Duration::from_secs(scaled(num, 3600)?))
        } else {
            Ok(Duration::from_secs(s.parse()?))
        }
    }

    fn scaled(
        num: &str,
        unit_secs: u64,
    ) -> std::result::Result<u64, Box<dyn std::error::Error + Send + Sync>> {
        num.parse::<u64>()?
            .checked_mul(unit_secs)
            .ok_or_else(|| format!("duration out of range: {}", num).into())
    }
}
