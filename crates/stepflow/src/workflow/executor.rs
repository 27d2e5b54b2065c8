use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    workflow::{EventSink, Operation, StepEvent, Timer, TokioTimer, WorkflowState},
    Result,
};

/// What a step's operation can see of the run driving it.
#[derive(Clone)]
struct StepScope {
    name: String,
    events: Arc<dyn EventSink>,
    timer: Arc<dyn Timer>,
}

tokio::task_local! {
    static CURRENT_STEP: StepScope;
}

/// Name of the step whose operation is currently being driven, if any.
///
/// Lets the retry and timeout wrappers label their errors and events without
/// being told which step they belong to.
pub fn current_step() -> Option<String> {
    CURRENT_STEP.try_with(|scope| scope.name.clone()).ok()
}

/// Event sink of the run driving the current step.
pub(crate) fn current_event_sink() -> Option<Arc<dyn EventSink>> {
    CURRENT_STEP.try_with(|scope| scope.events.clone()).ok()
}

/// Timer of the run driving the current step.
pub(crate) fn current_timer() -> Option<Arc<dyn Timer>> {
    CURRENT_STEP.try_with(|scope| scope.timer.clone()).ok()
}

/// Runs step operations against one run's [`WorkflowState`], memoizing
/// successful results by step name.
pub struct StepExecutor {
    state: WorkflowState,
    events: Arc<dyn EventSink>,
    timer: Arc<dyn Timer>,
}

impl StepExecutor {
    pub fn new(events: Arc<dyn EventSink>) -> Self {
        Self {
            state: WorkflowState::new(),
            events,
            timer: Arc::new(TokioTimer),
        }
    }

    /// Timer handed to retry and timeout wrappers that were not given one.
    pub fn with_timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = timer;
        self
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    /// Execute `operation` as step `name`, or return its cached result if the
    /// step already completed in this run.
    ///
    /// A step that completed without a cached value is executed again. That
    /// covers results serializing to `null` and results that cannot be
    /// serialized at all. Failures are tagged with the step name and attempt
    /// number and passed back; they are never cached.
    ///
    /// While the operation runs, retry and timeout wrappers inside it pick up
    /// this executor's event sink and timer unless they were given their own.
    pub async fn run_step<O>(&mut self, name: &str, mut operation: O) -> Result<O::Output>
    where
        O: Operation,
        O::Output: Serialize + DeserializeOwned,
    {
        if self.state.is_completed(name) {
            if let Some(cached) = self.state.cached_result(name) {
                let value = serde_json::from_value(cached.clone())?;
                self.events.emit(&StepEvent::CacheHit {
                    step: name.to_string(),
                });
                return Ok(value);
            }
            debug!("Step {} completed without a cached result, running it again", name);
        }

        let attempt = self.state.record_attempt(name);
        self.events.emit(&StepEvent::StepStarted {
            step: name.to_string(),
            attempt,
        });

        let started = Instant::now();
        let span = info_span!("step", step = %name, attempt);
        let scope = StepScope {
            name: name.to_string(),
            events: self.events.clone(),
            timer: self.timer.clone(),
        };
        let outcome = CURRENT_STEP
            .scope(scope, operation.call())
            .instrument(span)
            .await;

        match outcome {
            Ok(value) => {
                let serialized = match serde_json::to_value(&value) {
                    Ok(serialized) => serialized,
                    Err(e) => {
                        warn!("Step {} result cannot be cached, it will run again if called: {}", name, e);
                        Value::Null
                    }
                };
                self.state.record_success(name, serialized);
                self.events.emit(&StepEvent::StepSucceeded {
                    step: name.to_string(),
                    attempt,
                    elapsed: started.elapsed(),
                });
                Ok(value)
            }
            Err(err) => {
                let err = err.in_step(name, attempt);
                self.events.emit(&StepEvent::StepFailed {
                    step: name.to_string(),
                    attempt,
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }
}
