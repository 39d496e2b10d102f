//! Configuration types and loading logic.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use quefork_tracing::TracingConfig;
use serde::Deserialize;

/// Top-level service configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InterceptorConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub tracing: TracingConfig,
}

/// Server listen configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
}

/// Upstream fetch configuration for the proxy endpoint's HTTP client.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,
}

fn default_listen_address() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_upstream_timeout() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_upstream_timeout(),
        }
    }
}

impl InterceptorConfig {
    /// Load configuration from TOML file and environment variables.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (QUEFORK_ prefix, __ for nesting)
    /// 2. TOML config file
    /// 3. Defaults
    pub fn load(config_path: &str) -> anyhow::Result<Self> {
        let config: InterceptorConfig = Figment::new()
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("QUEFORK_").split("__"))
            .extract()?;
        Ok(config)
    }
}
