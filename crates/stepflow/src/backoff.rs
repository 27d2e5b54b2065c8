//! Backoff policies for retry delays
//!
//! A policy is a closed set of variants (exponential, linear, constant), each
//! optionally capped and jittered. [`calculate_delay`] is pure given its
//! random source, so tests inject a [`FixedRandom`].

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Error, Result};

/// Backoff policy used to space out retry attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// `base * factor^attempt`
    Exponential {
        #[serde(with = "humantime_serde")]
        base: Duration,
        #[serde(default = "default_exponential_factor")]
        factor: f64,
        #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
        max: Option<Duration>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        jitter: Option<JitterConfig>,
    },
    /// `initial + attempt * increment`
    Linear {
        #[serde(with = "humantime_serde")]
        initial: Duration,
        #[serde(with = "humantime_serde")]
        increment: Duration,
        #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
        max: Option<Duration>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        jitter: Option<JitterConfig>,
    },
    /// Same delay for every attempt
    Constant {
        #[serde(with = "humantime_serde")]
        duration: Duration,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        jitter: Option<JitterConfig>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JitterConfig {
    #[serde(rename = "type")]
    pub kind: JitterKind,
    /// Only read by [`JitterKind::Decorrelated`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factor: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterKind {
    /// Uniform in `0..delay`
    Full,
    /// Uniform in `delay/2..delay`
    Equal,
    /// `random * delay * factor`
    Decorrelated,
}

impl JitterConfig {
    pub fn new(kind: JitterKind) -> Self {
        Self { kind, factor: None }
    }
}

impl std::str::FromStr for JitterKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "full" => Ok(JitterKind::Full),
            "equal" => Ok(JitterKind::Equal),
            "decorrelated" => Ok(JitterKind::Decorrelated),
            other => Err(Error::Validation(format!(
                "jitter must be full, equal or decorrelated, got '{}'",
                other
            ))),
        }
    }
}

impl BackoffConfig {
    pub fn exponential(base: Duration) -> Self {
        BackoffConfig::Exponential {
            base,
            factor: default_exponential_factor(),
            max: None,
            jitter: None,
        }
    }

    pub fn linear(initial: Duration, increment: Duration) -> Self {
        BackoffConfig::Linear {
            initial,
            increment,
            max: None,
            jitter: None,
        }
    }

    pub fn constant(duration: Duration) -> Self {
        BackoffConfig::Constant {
            duration,
            jitter: None,
        }
    }

    /// Cap the pre-jitter delay. Has no effect on constant backoff.
    pub fn with_max(mut self, cap: Duration) -> Self {
        match &mut self {
            BackoffConfig::Exponential { max, .. } | BackoffConfig::Linear { max, .. } => {
                *max = Some(cap);
            }
            BackoffConfig::Constant { .. } => {}
        }
        self
    }

    pub fn with_jitter(mut self, config: JitterConfig) -> Self {
        match &mut self {
            BackoffConfig::Exponential { jitter, .. }
            | BackoffConfig::Linear { jitter, .. }
            | BackoffConfig::Constant { jitter, .. } => *jitter = Some(config),
        }
        self
    }

    pub fn jitter(&self) -> Option<&JitterConfig> {
        match self {
            BackoffConfig::Exponential { jitter, .. }
            | BackoffConfig::Linear { jitter, .. }
            | BackoffConfig::Constant { jitter, .. } => jitter.as_ref(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let BackoffConfig::Exponential { factor, .. } = self {
            if !factor.is_finite() || *factor < 0.0 {
                return Err(Error::Validation(format!(
                    "exponential backoff factor must be a non-negative number, got {}",
                    factor
                )));
            }
        }
        if let Some(jitter) = self.jitter() {
            if let Some(factor) = jitter.factor {
                if !factor.is_finite() || factor < 0.0 {
                    return Err(Error::Validation(format!(
                        "jitter factor must be a non-negative number, got {}",
                        factor
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Source of uniformly distributed numbers in `[0, 1)`
pub trait RandomSource: Send + Sync {
    fn next_f64(&self) -> f64;
}

/// Thread-local RNG from the `rand` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_f64(&self) -> f64 {
        rand::rng().random::<f64>()
    }
}

/// Always returns the same value. Handy for deterministic jitter.
#[derive(Debug, Clone, Copy)]
pub struct FixedRandom(pub f64);

impl RandomSource for FixedRandom {
    fn next_f64(&self) -> f64 {
        self.0
    }
}

/// Compute the delay before retry number `attempt` (zero-indexed, the first
/// attempt is not counted).
///
/// The cap is applied before jitter. Decorrelated jitter scales the current
/// capped delay rather than the previous delay, so it can land above `max`.
pub fn calculate_delay(config: &BackoffConfig, attempt: u32, random: &dyn RandomSource) -> Duration {
    let (raw, max, jitter) = match config {
        BackoffConfig::Exponential {
            base,
            factor,
            max,
            jitter,
        } => {
            let nanos = nanos(*base) * factor.powi(attempt.min(i32::MAX as u32) as i32);
            (nanos, *max, jitter)
        }
        BackoffConfig::Linear {
            initial,
            increment,
            max,
            jitter,
        } => {
            let nanos = nanos(*initial) + f64::from(attempt) * nanos(*increment);
            (nanos, *max, jitter)
        }
        BackoffConfig::Constant { duration, jitter } => (nanos(*duration), None, jitter),
    };

    let capped = match max {
        Some(max) => raw.min(nanos(max)),
        None => raw,
    };

    let delay = match jitter {
        None => capped,
        Some(jitter) => apply_jitter(capped, jitter, random),
    };

    from_nanos(delay)
}

fn apply_jitter(delay: f64, jitter: &JitterConfig, random: &dyn RandomSource) -> f64 {
    match jitter.kind {
        JitterKind::Full => random.next_f64() * delay,
        JitterKind::Equal => {
            let half = delay / 2.0;
            half + random.next_f64() * half
        }
        JitterKind::Decorrelated => {
            let factor = jitter.factor.unwrap_or(DEFAULT_DECORRELATED_FACTOR);
            random.next_f64() * delay * factor
        }
    }
}

const DEFAULT_DECORRELATED_FACTOR: f64 = 3.0;

fn nanos(duration: Duration) -> f64 {
    duration.as_nanos() as f64
}

// Negative and NaN clamp to zero, anything past u64 nanoseconds saturates.
fn from_nanos(nanos: f64) -> Duration {
    if nanos.is_nan() || nanos <= 0.0 {
        Duration::ZERO
    } else if nanos >= u64::MAX as f64 {
        Duration::from_nanos(u64::MAX)
    } else {
        Duration::from_nanos(nanos.round() as u64)
    }
}

fn default_exponential_factor() -> f64 {
    2.0
}
