//! Bounded retry around an [`Operation`]
//!
//! Attempts run strictly one after another. Between attempts the wrapper
//! sleeps for a delay taken from [`RetryOptions`]: a fixed duration, a
//! schedule function, or a [`BackoffConfig`]. The loop stops on the first
//! success, after `max_attempts` failures, or once `max_duration` of wall time
//! has elapsed, whichever comes first.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::{
    backoff::{calculate_delay, BackoffConfig, RandomSource, ThreadRandom},
    workflow::{
        executor::{current_event_sink, current_timer},
        current_step, EventSink, Operation, StepEvent, Timer, TokioTimer, TracingEventSink,
    },
    Error, Result,
};

/// Used when no delay is configured.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub enum RetryDelay {
    Fixed(Duration),
    /// Called with the zero-indexed retry number.
    Schedule(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
    Backoff(BackoffConfig),
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryDelay::Fixed(duration) => f.debug_tuple("Fixed").field(duration).finish(),
            RetryDelay::Schedule(_) => f.write_str("Schedule(<fn>)"),
            RetryDelay::Backoff(config) => f.debug_tuple("Backoff").field(config).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Total attempts including the first one. Must be at least 1.
    pub max_attempts: u32,
    pub delay: Option<RetryDelay>,
    /// Wall-clock budget measured from the first attempt.
    pub max_duration: Option<Duration>,
}

impl RetryOptions {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            delay: None,
            max_duration: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(RetryDelay::Fixed(delay));
        self
    }

    pub fn with_schedule<F>(mut self, schedule: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.delay = Some(RetryDelay::Schedule(Arc::new(schedule)));
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.delay = Some(RetryDelay::Backoff(backoff));
        self
    }

    pub fn with_max_duration(mut self, budget: Duration) -> Self {
        self.max_duration = Some(budget);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Validation(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        if let Some(RetryDelay::Backoff(config)) = &self.delay {
            config.validate()?;
        }
        Ok(())
    }

    /// Delay before the retry numbered `retry` (zero-indexed).
    pub fn delay_for(&self, retry: u32, random: &dyn RandomSource) -> Duration {
        match &self.delay {
            None => DEFAULT_RETRY_DELAY,
            Some(RetryDelay::Fixed(duration)) => *duration,
            Some(RetryDelay::Schedule(schedule)) => schedule(retry),
            Some(RetryDelay::Backoff(config)) => calculate_delay(config, retry, random),
        }
    }
}

/// Wrap `operation` so each invocation retries according to `options`.
pub fn retry<O: Operation>(options: RetryOptions, operation: O) -> Retry<O> {
    Retry::new(options, operation)
}

/// Retries the inner operation according to its [`RetryOptions`].
///
/// Inside a step, the timer and event sink default to the ones of the run
/// driving that step. Outside a step they fall back to [`TokioTimer`] and
/// [`TracingEventSink`].
pub struct Retry<O> {
    inner: O,
    options: RetryOptions,
    timer: Option<Arc<dyn Timer>>,
    random: Arc<dyn RandomSource>,
    events: Option<Arc<dyn EventSink>>,
}

impl<O: Operation> Retry<O> {
    pub fn new(options: RetryOptions, inner: O) -> Self {
        Self {
            inner,
            options,
            timer: None,
            random: Arc::new(ThreadRandom),
            events: None,
        }
    }

    pub fn with_timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = Some(timer);
        self
    }

    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    fn timer(&self) -> Arc<dyn Timer> {
        self.timer
            .clone()
            .or_else(current_timer)
            .unwrap_or_else(|| Arc::new(TokioTimer) as Arc<dyn Timer>)
    }

    fn events(&self) -> Arc<dyn EventSink> {
        self.events
            .clone()
            .or_else(current_event_sink)
            .unwrap_or_else(|| Arc::new(TracingEventSink) as Arc<dyn EventSink>)
    }
}

#[async_trait]
impl<O: Operation> Operation for Retry<O> {
    type Output = O::Output;

    async fn call(&mut self) -> Result<O::Output> {
        self.options.validate()?;

        let step = current_step();
        let timer = self.timer();
        let events = self.events();
        let started = timer.now();
        let mut attempt: u32 = 0;

        loop {
            let err = match self.inner.call().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            attempt += 1;

            if attempt >= self.options.max_attempts {
                return Err(exhausted(step, attempt, err));
            }

            if let Some(budget) = self.options.max_duration {
                let elapsed = timer.now().saturating_duration_since(started);
                if elapsed >= budget {
                    debug!(
                        "Retry budget of {:?} used up after {} attempt(s) ({:?} elapsed)",
                        budget, attempt, elapsed
                    );
                    return Err(exhausted(step, attempt, err));
                }
            }

            let delay = self.options.delay_for(attempt - 1, self.random.as_ref());
            debug!("Attempt {} failed: {}", attempt, err);
            events.emit(&StepEvent::RetryScheduled {
                step: step.clone(),
                attempt,
                delay,
            });
            timer.sleep(delay).await;
        }
    }
}

fn exhausted(step: Option<String>, attempts: u32, last: Error) -> Error {
    Error::RetryExhausted {
        step,
        attempts,
        source: Box::new(last),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::FixedRandom;
    use crate::workflow::{from_fn, ManualTimer, RecordingEventSink};
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio_test::{assert_err, assert_ok};

    fn flaky(calls: Arc<AtomicU32>, failures: u32) -> impl Operation<Output = u32> {
        from_fn(move || {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= failures {
                    Err(Error::from(anyhow!("transient failure {}", n)))
                } else {
                    Ok(n)
                }
            }
        })
    }

    fn harness<O: Operation>(options: RetryOptions, op: O) -> (Retry<O>, Arc<ManualTimer>) {
        let timer = Arc::new(ManualTimer::new());
        let retry = retry(options, op)
            .with_timer(timer.clone())
            .with_random(Arc::new(FixedRandom(0.5)));
        (retry, timer)
    }

    #[tokio::test]
    async fn test_always_failing_exhausts_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let (mut op, timer) = harness(
            RetryOptions::new(3).with_delay(Duration::from_millis(10)),
            flaky(calls.clone(), u32::MAX),
        );

        let err = assert_err!(op.call().await);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(timer.sleeps().len(), 2);
        match &err {
            Error::RetryExhausted { attempts, source, .. } => {
                assert_eq!(*attempts, 3);
                assert!(source.to_string().contains("transient failure 3"));
            }
            other => panic!("expected RetryExhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_succeeds_on_third_call() {
        let calls = Arc::new(AtomicU32::new(0));
        let (mut op, timer) = harness(
            RetryOptions::new(5).with_delay(Duration::from_millis(10)),
            flaky(calls.clone(), 2),
        );

        let value = assert_ok!(op.call().await);
        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(timer.sleeps(), vec![Duration::from_millis(10); 2]);
    }

    #[tokio::test]
    async fn test_single_attempt_is_terminal() {
        let calls = Arc::new(AtomicU32::new(0));
        let (mut op, timer) = harness(RetryOptions::new(1), flaky(calls.clone(), u32::MAX));

        let err = assert_err!(op.call().await);
        assert_eq!(err.attempts(), Some(1));
        assert!(matches!(err, Error::RetryExhausted { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(timer.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_max_duration_stops_early() {
        let calls = Arc::new(AtomicU32::new(0));
        let (mut op, timer) = harness(
            RetryOptions::new(10)
                .with_delay(Duration::from_millis(60))
                .with_max_duration(Duration::from_millis(100)),
            flaky(calls.clone(), u32::MAX),
        );

        let err = assert_err!(op.call().await);
        // 0ms, 60ms, 120ms: the third failure lands past the budget
        assert_eq!(err.attempts(), Some(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(timer.sleeps().len(), 2);
    }

    #[tokio::test]
    async fn test_default_delay_is_one_second() {
        let calls = Arc::new(AtomicU32::new(0));
        let (mut op, timer) = harness(RetryOptions::new(2), flaky(calls, 1));

        assert_ok!(op.call().await);
        assert_eq!(timer.sleeps(), vec![Duration::from_secs(1)]);
    }

    #[tokio::test]
    async fn test_schedule_receives_zero_indexed_retry() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = seen.clone();
        let options = RetryOptions::new(4).with_schedule(move |retry| {
            recorded.lock().unwrap().push(retry);
            Duration::from_millis(5 * (u64::from(retry) + 1))
        });
        let (mut op, timer) = harness(options, flaky(Arc::new(AtomicU32::new(0)), u32::MAX));

        assert_err!(op.call().await);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(
            timer.sleeps(),
            vec![
                Duration::from_millis(5),
                Duration::from_millis(10),
                Duration::from_millis(15)
            ]
        );
    }

    #[tokio::test]
    async fn test_backoff_config_drives_delays() {
        let options = RetryOptions::new(4).with_backoff(
            BackoffConfig::exponential(Duration::from_millis(100)).with_max(Duration::from_millis(300)),
        );
        let (mut op, timer) = harness(options, flaky(Arc::new(AtomicU32::new(0)), u32::MAX));

        assert_err!(op.call().await);
        assert_eq!(
            timer.sleeps(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300)
            ]
        );
    }

    #[tokio::test]
    async fn test_zero_attempts_rejected_without_calling() {
        let calls = Arc::new(AtomicU32::new(0));
        let (mut op, _timer) = harness(RetryOptions::new(0), flaky(calls.clone(), 0));

        let err = assert_err!(op.call().await);
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_retry_scheduled_events() {
        let sink = Arc::new(RecordingEventSink::new());
        let (op, _timer) = harness(
            RetryOptions::new(3).with_delay(Duration::from_millis(7)),
            flaky(Arc::new(AtomicU32::new(0)), 2),
        );
        let mut op = op.with_event_sink(sink.clone());

        assert_ok!(op.call().await);
        assert_eq!(
            sink.events(),
            vec![
                StepEvent::RetryScheduled {
                    step: None,
                    attempt: 1,
                    delay: Duration::from_millis(7)
                },
                StepEvent::RetryScheduled {
                    step: None,
                    attempt: 2,
                    delay: Duration::from_millis(7)
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_wrapper_is_reusable() {
        let calls = Arc::new(AtomicU32::new(0));
        let (mut op, _timer) = harness(
            RetryOptions::new(2).with_delay(Duration::ZERO),
            flaky(calls.clone(), 1),
        );

        assert_eq!(assert_ok!(op.call().await), 2);
        // second invocation starts a fresh loop
        assert_eq!(assert_ok!(op.call().await), 3);
    }
}
