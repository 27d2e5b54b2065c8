//! Step lifecycle events
//!
//! The executor and the retry wrapper report what they do through an
//! [`EventSink`]. The default sink writes through `tracing` and bumps the
//! prometheus counters in [`crate::metrics`].

use std::time::Duration;
use tracing::{debug, info, warn};

use crate::metrics;

#[derive(Debug, Clone, PartialEq)]
pub enum StepEvent {
    StepStarted {
        step: String,
        attempt: u32,
    },
    CacheHit {
        step: String,
    },
    StepSucceeded {
        step: String,
        attempt: u32,
        elapsed: Duration,
    },
    StepFailed {
        step: String,
        attempt: u32,
        error: String,
    },
    /// `step` is `None` when the retry wrapper runs outside a step.
    RetryScheduled {
        step: Option<String>,
        attempt: u32,
        delay: Duration,
    },
}

impl StepEvent {
    pub fn step(&self) -> Option<&str> {
        match self {
            StepEvent::StepStarted { step, .. }
            | StepEvent::CacheHit { step }
            | StepEvent::StepSucceeded { step, .. }
            | StepEvent::StepFailed { step, .. } => Some(step),
            StepEvent::RetryScheduled { step, .. } => step.as_deref(),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &StepEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &StepEvent) {
        match event {
            StepEvent::StepStarted { step, attempt } => {
                metrics::STEPS_STARTED_TOTAL.inc();
                info!("Executing step: {} (attempt {})", step, attempt);
            }
            StepEvent::CacheHit { step } => {
                metrics::STEP_CACHE_HITS_TOTAL.inc();
                debug!("Step {} already completed, returning cached result", step);
            }
            StepEvent::StepSucceeded { step, attempt, elapsed } => {
                info!(
                    "Step {} completed successfully on attempt {} in {:?}",
                    step, attempt, elapsed
                );
            }
            StepEvent::StepFailed { step, attempt, error } => {
                metrics::STEP_FAILURES_TOTAL.inc();
                warn!("Step {} failed on attempt {}: {}", step, attempt, error);
            }
            StepEvent::RetryScheduled { step, attempt, delay } => {
                metrics::RETRIES_SCHEDULED_TOTAL.inc();
                warn!(
                    step = step.as_deref().unwrap_or("-"),
                    attempt = *attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after failed attempt"
                );
            }
        }
    }
}

/// Keeps every event in memory, in emission order.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: std::sync::Mutex<Vec<StepEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StepEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: &StepEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}
