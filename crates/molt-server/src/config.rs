//! Server configuration.
//!
//! Settings are layered, later sources winning:
//!
//! 1. built-in defaults
//! 2. an optional TOML file (`--config`)
//! 3. environment variables prefixed with `MOLT_`, nested keys joined by `__`
//!    (`MOLT_GENERATION__SUPERVISOR__WORKERS=8`)
//! 4. command-line flags
//!
//! ```toml
//! admin = "127.0.0.1:9100"
//! log_format = "json"
//!
//! [generation]
//! listen = ["0.0.0.0:8080", "/run/app.sock"]
//! exchange_path = "/run/molt/exchange.sock"
//!
//! [generation.supervisor]
//! workers = 8
//! max_rss_kb = 204800
//! ```

use std::fmt;
use std::path::Path;

use molt::{BindAddress, GenerationConfig};
use serde::Deserialize;
use tracing::info;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "MOLT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub generation: GenerationConfig,
    /// Admin HTTP front-end address; disabled when unset.
    pub admin: Option<BindAddress>,
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            generation: GenerationConfig::default(),
            admin: None,
            log_format: LogFormat::Text,
        }
    }
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen: Vec<BindAddress>,
    pub exchange_path: Option<std::path::PathBuf>,
    pub admin: Option<BindAddress>,
    pub workers: Option<usize>,
    pub log_format: Option<LogFormat>,
}

impl ServerConfig {
    /// Load defaults, then `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("generation.listen"),
            )
            .build()?;
        let config: ServerConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&mut self, overrides: Overrides) -> Result<(), ConfigError> {
        if !overrides.listen.is_empty() {
            self.generation.listen = overrides.listen;
        }
        if let Some(path) = overrides.exchange_path {
            self.generation.exchange_path = path;
        }
        if overrides.admin.is_some() {
            self.admin = overrides.admin;
        }
        if let Some(workers) = overrides.workers {
            self.generation.supervisor.workers = workers;
        }
        if let Some(format) = overrides.log_format {
            self.log_format = format;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let workers = self.generation.supervisor.workers;
        if !molt::config::WORKER_COUNT_RANGE.contains(&workers) {
            return Err(ConfigError::InvalidValue {
                field: "generation.supervisor.workers",
                message: format!(
                    "{workers} is outside {}..={}",
                    molt::config::WORKER_COUNT_RANGE.start(),
                    molt::config::WORKER_COUNT_RANGE.end()
                ),
            });
        }
        if self.generation.listen.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "generation.listen",
                message: "at least one address is required".to_string(),
            });
        }
        if let Some(admin) = &self.admin {
            if admin.is_unix() {
                return Err(ConfigError::InvalidValue {
                    field: "admin",
                    message: format!("{admin} must be a host:port address"),
                });
            }
            if self.generation.listen.contains(admin) {
                return Err(ConfigError::InvalidValue {
                    field: "admin",
                    message: format!("{admin} is already a worker listener"),
                });
            }
        }
        Ok(())
    }

    /// Log the effective configuration.
    pub fn log_config(&self) {
        let generation = &self.generation;
        let supervisor = &generation.supervisor;
        for address in &generation.listen {
            info!("Listening on: {}", address);
        }
        info!("Descriptor exchange: {}", generation.exchange_path.display());
        match &self.admin {
            Some(admin) => info!("Admin front-end: {}", admin),
            None => info!("Admin front-end: disabled"),
        }
        info!("Workers: {}", supervisor.workers);
        match supervisor.max_rss_kb {
            Some(kb) => info!("Per-worker RSS ceiling: {} KiB", kb),
            None => info!("Per-worker RSS ceiling: none"),
        }
        match supervisor.max_total_mem_kb {
            Some(kb) => info!("Aggregate memory ceiling: {} KiB", kb),
            None => info!("Aggregate memory ceiling: none"),
        }
        if let Some(max) = supervisor.max_requests {
            info!("Requests per worker: {}", max);
        }
        info!("Drain failsafe: {}s", supervisor.failsafe_timeout_secs);
    }
}
