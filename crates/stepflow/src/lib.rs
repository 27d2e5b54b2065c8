pub mod backoff;
pub mod config;
pub mod metrics;
pub mod workflow;

use std::time::Duration;
use thiserror::Error;

pub use backoff::{calculate_delay, BackoffConfig, FixedRandom, JitterConfig, JitterKind, RandomSource, ThreadRandom};
pub use workflow::{
    from_fn, retry, timeout, Operation, OperationExt, RetryDelay, RetryOptions, RunReport, RunStatus,
    Workflow, WorkflowContext,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Step '{step}' failed on attempt {attempt}: {source}")]
    Step {
        step: String,
        attempt: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    #[error("{} timed out after {duration:?}", describe(.step))]
    Timeout {
        step: Option<String>,
        duration: Duration,
    },
    #[error("{} exhausted retries after {attempts} attempt(s): {source}", describe(.step))]
    RetryExhausted {
        step: Option<String>,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },
    #[error(transparent)]
    Operation(#[from] anyhow::Error),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Metrics error: {0}")]
    Metrics(String),
}

pub type Result<T> = std::result::Result<T, Error>;

fn describe(step: &Option<String>) -> String {
    match step {
        Some(name) => format!("Step '{}'", name),
        None => "Operation".to_string(),
    }
}

impl Error {
    /// Attach a step name and attempt number to an error raised inside that step.
    ///
    /// Raw operation failures become [`Error::Step`]; timeout and exhaustion
    /// errors that were raised outside a step scope pick up the name. Anything
    /// already tagged passes through untouched.
    pub(crate) fn in_step(self, step: &str, attempt: u32) -> Self {
        match self {
            Error::Operation(source) => Error::Step {
                step: step.to_string(),
                attempt,
                source: source.into(),
            },
            Error::Timeout { step: None, duration } => Error::Timeout {
                step: Some(step.to_string()),
                duration,
            },
            Error::RetryExhausted { step: name, attempts, source } => Error::RetryExhausted {
                step: name.or_else(|| Some(step.to_string())),
                attempts,
                source: Box::new(source.in_step(step, attempts)),
            },
            other => other,
        }
    }

    /// Number of attempts made, when the error records it.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Error::Step { attempt, .. } => Some(*attempt),
            Error::RetryExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Follow the retry-exhaustion chain down to the last underlying failure.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::RetryExhausted { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
