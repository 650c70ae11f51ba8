use crate::orchestrator::OrchestratorSettings;
use anyhow::Context;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use therapy_sim_core::protocol::ProtocolTemplate;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub api_base_url: String,
    pub api_token: Option<String>,
    pub session_minutes: u32,
    pub tick_interval: Duration,
    pub send_safety_timeout: Duration,
    pub warning_thresholds: Vec<u32>,
    pub request_timeout: Duration,
    pub protocol_template_path: Option<PathBuf>,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with_overrides(None, None)
    }

    /// Loads configuration from environment variables, letting explicitly
    /// supplied values take precedence over `API_BASE_URL` and `API_TOKEN`.
    pub fn from_env_with_overrides(
        base_url: Option<String>,
        token: Option<String>,
    ) -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let api_base_url = base_url
            .or_else(|| std::env::var("API_BASE_URL").ok())
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingVar("API_BASE_URL".to_string()))?;

        let api_token = token
            .or_else(|| std::env::var("API_TOKEN").ok())
            .filter(|token| !token.trim().is_empty());

        let session_minutes = parse_var("SESSION_MINUTES", 60u32)?;

        let tick_secs = parse_var("TICK_INTERVAL_SECS", 60u64)?;
        if tick_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "TICK_INTERVAL_SECS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        let send_safety_timeout =
            Duration::from_millis(parse_var("SEND_SAFETY_TIMEOUT_MS", 4500u64)?);

        let warning_thresholds = match std::env::var("WARNING_THRESHOLDS") {
            Ok(value) => parse_thresholds(&value).map_err(|e| {
                ConfigError::InvalidValue("WARNING_THRESHOLDS".to_string(), e)
            })?,
            Err(_) => vec![10, 5, 0],
        };

        let request_timeout = Duration::from_secs(parse_var("REQUEST_TIMEOUT_SECS", 30u64)?);

        let protocol_template_path = std::env::var("PROTOCOL_TEMPLATE_PATH")
            .ok()
            .map(PathBuf::from);

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            api_base_url,
            api_token,
            session_minutes,
            tick_interval: Duration::from_secs(tick_secs),
            send_safety_timeout,
            warning_thresholds,
            request_timeout,
            protocol_template_path,
            log_level,
        })
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            session_minutes: self.session_minutes,
            tick_interval: self.tick_interval,
            send_safety_timeout: self.send_safety_timeout,
            thresholds: self.warning_thresholds.clone(),
        }
    }

    /// Loads the configured protocol template, or the built-in one.
    pub fn load_template(&self) -> anyhow::Result<ProtocolTemplate> {
        match &self.protocol_template_path {
            Some(path) => ProtocolTemplate::from_file(path).with_context(|| {
                format!("Failed to load protocol template from {}", path.display())
            }),
            None => Ok(ProtocolTemplate::default()),
        }
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value.trim().parse::<T>().map_err(|_| {
            ConfigError::InvalidValue(name.to_string(), format!("'{}' is not a number", value))
        }),
        Err(_) => Ok(default),
    }
}

/// Parses a comma separated list of minute marks, e.g. `"10,5,0"`.
fn parse_thresholds(value: &str) -> Result<Vec<u32>, String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<u32>()
                .map_err(|_| format!("'{}' is not a whole number of minutes", part))
        })
        .collect()
}
