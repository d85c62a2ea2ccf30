//! Layered configuration: defaults, then `config/` files, then
//! `TOLLBOOTH__`-prefixed environment variables. Loaded once at startup and
//! immutable for the process lifetime.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub upstream: UpstreamSettings,
    pub relay: RelayTimingSettings,
    pub ledger: LedgerSettings,
    /// Models advertised by `/v1/models`.
    pub models: Vec<String>,
    pub logging: LoggingSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApplicationSettings {
    pub host: String,
    pub port: u16,
    pub environment: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamSettings {
    pub host: String,
    pub port: u16,
    /// Absent in development/test setups; the upstream leg then speaks
    /// plain HTTP.
    #[serde(default)]
    pub tls: Option<UpstreamTlsSettings>,
}

impl UpstreamSettings {
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamTlsSettings {
    pub client_cert_path: PathBuf,
    pub client_key_path: PathBuf,
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    /// SNI/verification name; defaults to the upstream host.
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default = "default_verify_hostname")]
    pub verify_hostname: bool,
}

fn default_verify_hostname() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayTimingSettings {
    pub request_timeout_secs: u64,
    pub idle_read_timeout_secs: u64,
    pub pool_idle_secs: u64,
    pub max_body_bytes: usize,
}

impl RelayTimingSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn idle_read_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_read_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerSettings {
    pub capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Start with default values
            .set_default("application.host", "0.0.0.0")?
            .set_default("application.port", 8080)?
            .set_default("application.environment", environment.clone())?
            .set_default("upstream.host", "localhost")?
            .set_default("upstream.port", 8443)?
            .set_default("relay.request_timeout_secs", 60)?
            .set_default("relay.idle_read_timeout_secs", 30)?
            .set_default("relay.pool_idle_secs", 90)?
            .set_default("relay.max_body_bytes", 2 * 1024 * 1024)?
            .set_default("ledger.capacity", 1000)?
            .set_default("models", vec!["gpt-4o-mini".to_string(), "gpt-4o".to_string()])?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "json")?
            // Add configuration file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{environment}")).required(false))
            .add_source(File::with_name("config/local").required(false))
            // Add environment variables with prefix
            .add_source(Environment::with_prefix("TOLLBOOTH").separator("__"))
            .build()?;

        config.try_deserialize()
    }
}
