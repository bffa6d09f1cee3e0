use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use thiserror::Error;
use url::Url;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 10000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),

    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("invalid URL in {var}: {source}")]
    InvalidEnvUrl {
        var: String,
        source: url::ParseError,
    },
}

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("No backends configured")]
    NoBackends,

    #[error("Route references unknown backend: {0}")]
    UnknownBackend(String),

    #[error("Route prefix must start with '/': {0}")]
    InvalidRoutePrefix(String),

    #[error("retry.max_attempts must be between 1 and 10, got {0}")]
    InvalidRetryAttempts(u32),
}

/// Gateway configuration
///
/// Loaded once at startup, either from a YAML file or from environment
/// variables, and never mutated afterwards.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Listener for inbound requests
    #[serde(default)]
    pub listener: Listener,
    /// Maps logical service names (auth, users, notifications, ...) to their
    /// base URLs
    pub backends: HashMap<String, Url>,
    /// Route rules; when empty, a default table is derived from the
    /// configured backends
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub warmup: WarmupConfig,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let config = serde_yaml::from_reader(file)?;
        Ok(config)
    }

    /// Builds a config from environment variables with hardcoded defaults.
    ///
    /// `AUTH_SERVICE_URL`, `USERS_SERVICE_URL` and `NOTIFICATIONS_SERVICE_URL`
    /// override the default backend URLs; `CHAT_SERVICE_URL` and
    /// `PAYMENTS_SERVICE_URL` add their backends only when set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(|var| std::env::var(var).ok())
    }

    pub fn from_env_with(
        get: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let host = get("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = get("PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let mut backends = HashMap::new();
        for (name, var, default) in [
            ("auth", "AUTH_SERVICE_URL", Some("http://127.0.0.1:7071")),
            ("users", "USERS_SERVICE_URL", Some("http://127.0.0.1:7072")),
            (
                "notifications",
                "NOTIFICATIONS_SERVICE_URL",
                Some("http://127.0.0.1:7073"),
            ),
            ("chat", "CHAT_SERVICE_URL", None),
            ("payments", "PAYMENTS_SERVICE_URL", None),
        ] {
            let raw = match (get(var), default) {
                (Some(value), _) => value,
                (None, Some(default)) => default.to_string(),
                (None, None) => continue,
            };
            let url = Url::parse(&raw).map_err(|source| ConfigError::InvalidEnvUrl {
                var: var.to_string(),
                source,
            })?;
            backends.insert(name.to_string(), url);
        }

        Ok(Self {
            listener: Listener { host, port },
            backends,
            routes: Vec::new(),
            retry: RetryConfig::default(),
            warmup: WarmupConfig::default(),
        })
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;

        if self.backends.is_empty() {
            return Err(ValidationError::NoBackends);
        }

        for route in &self.routes {
            if !route.prefix.starts_with('/') {
                return Err(ValidationError::InvalidRoutePrefix(route.prefix.clone()));
            }
            if !self.backends.contains_key(&route.backend) {
                return Err(ValidationError::UnknownBackend(route.backend.clone()));
            }
        }

        if self.retry.max_attempts == 0 || self.retry.max_attempts > 10 {
            return Err(ValidationError::InvalidRetryAttempts(
                self.retry.max_attempts,
            ));
        }

        Ok(())
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Default for Listener {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

/// A single route rule: requests whose path starts with `prefix` (on a
/// segment boundary) go to `backend`, with the prefix rewritten per
/// `rewrite`. Omitting `rewrite` keeps the prefix unchanged.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RouteConfig {
    pub prefix: String,
    pub backend: String,
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub rewrite: Option<RewriteConfig>,
}

/// Path rewrite rule: either strip the matched prefix or replace it with a
/// literal string.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RewriteConfig {
    Strip,
    Replace(String),
}

/// Retry policy for transport-level failures against cold backends
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Bounded number of attempts per inbound request
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles each attempt after that
    pub base_delay_ms: u64,
    /// Timeout for the first attempt
    pub attempt_timeout_secs: u64,
    /// Added per retry so later attempts accommodate a cold start
    pub timeout_increment_secs: u64,
    /// Upper bound for any single attempt
    pub max_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            attempt_timeout_secs: 10,
            timeout_increment_secs: 10,
            max_timeout_secs: 30,
        }
    }
}

/// Best-effort background warm-up probing
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct WarmupConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub probe_path: String,
    pub probe_timeout_secs: u64,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 240,
            probe_path: "/api/health".to_string(),
            probe_timeout_secs: 5,
        }
    }
}
