use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::{
    backoff::{BackoffConfig, JitterConfig, JitterKind},
    workflow::RetryOptions,
    Error, Result,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Defaults applied to steps that are wrapped with retry and timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub max_duration: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffConfig>,
    /// Per-attempt deadline
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            max_duration: None,
            backoff: None,
            timeout: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RetryConfig {
    pub fn to_options(&self) -> RetryOptions {
        let mut options = RetryOptions::new(self.max_attempts);
        if let Some(backoff) = &self.backoff {
            options = options.with_backoff(backoff.clone());
        }
        if let Some(budget) = self.max_duration {
            options = options.with_max_duration(budget);
        }
        options
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load environment variables from .env file if it exists
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backoff = match lookup("WORKFLOW_BACKOFF") {
            Some(kind) => Some(backoff_from_lookup(&kind, &lookup)?),
            None => {
                if lookup("WORKFLOW_JITTER").is_some() {
                    return Err(Error::Config(
                        "WORKFLOW_JITTER requires WORKFLOW_BACKOFF to be set".to_string(),
                    ));
                }
                None
            }
        };

        let config = Config {
            retry: RetryConfig {
                max_attempts: parse_var(&lookup, "WORKFLOW_MAX_ATTEMPTS")?
                    .unwrap_or_else(default_max_attempts),
                max_duration: parse_var(&lookup, "WORKFLOW_MAX_DURATION_MS")?
                    .map(Duration::from_millis),
                backoff,
                timeout: parse_var(&lookup, "WORKFLOW_TIMEOUT_MS")?.map(Duration::from_millis),
            },
            logging: LoggingConfig {
                level: lookup("LOG_LEVEL").unwrap_or_else(default_log_level),
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(Error::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.timeout == Some(Duration::ZERO) {
            return Err(Error::Config("retry.timeout must be greater than zero".to_string()));
        }
        if let Some(backoff) = &self.retry.backoff {
            backoff
                .validate()
                .map_err(|e| Error::Config(format!("retry.backoff: {}", e)))?;
        }
        if self.logging.level.trim().is_empty() {
            return Err(Error::Config("logging.level must not be empty".to_string()));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{} has an invalid value '{}': {}", key, raw, e))),
        None => Ok(None),
    }
}

fn backoff_from_lookup<F>(kind: &str, lookup: &F) -> Result<BackoffConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let base = Duration::from_millis(parse_var(lookup, "WORKFLOW_BACKOFF_BASE_MS")?.unwrap_or(1000));

    let mut backoff = match kind.to_lowercase().as_str() {
        "exponential" => match parse_var::<f64, _>(lookup, "WORKFLOW_BACKOFF_FACTOR")? {
            Some(factor) => BackoffConfig::Exponential {
                base,
                factor,
                max: None,
                jitter: None,
            },
            None => BackoffConfig::exponential(base),
        },
        "linear" => {
            let increment = parse_var(lookup, "WORKFLOW_BACKOFF_INCREMENT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(base);
            BackoffConfig::linear(base, increment)
        }
        "constant" => BackoffConfig::constant(base),
        other => {
            return Err(Error::Config(format!(
                "WORKFLOW_BACKOFF must be exponential, linear or constant, got '{}'",
                other
            )))
        }
    };

    if let Some(cap) = parse_var(lookup, "WORKFLOW_BACKOFF_MAX_MS")? {
        backoff = backoff.with_max(Duration::from_millis(cap));
    }

    if let Some(jitter) = lookup("WORKFLOW_JITTER") {
        let kind: JitterKind = jitter
            .parse()
            .map_err(|e| Error::Config(format!("WORKFLOW_JITTER: {}", e)))?;
        backoff = backoff.with_jitter(JitterConfig::new(kind));
    }

    Ok(backoff)
}
