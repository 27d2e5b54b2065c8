use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::{
    metrics,
    workflow::{current_step, executor::current_timer, Operation, Timer, TokioTimer},
    Error, Result,
};

/// Wrap `operation` so each invocation races a fresh deadline of `duration`.
pub fn timeout<O: Operation>(duration: Duration, operation: O) -> Timeout<O> {
    Timeout::new(duration, operation)
}

/// Races one invocation of the inner operation against a deadline.
///
/// When the deadline wins the inner future is dropped. Work it already handed
/// off elsewhere (spawned tasks, remote calls) is not stopped, so wrapped
/// operations have to tolerate being abandoned mid-flight.
///
/// Inside a step the deadline is measured with the run's timer unless one was
/// set with [`Timeout::with_timer`].
pub struct Timeout<O> {
    inner: O,
    duration: Duration,
    timer: Option<Arc<dyn Timer>>,
}

impl<O: Operation> Timeout<O> {
    pub fn new(duration: Duration, inner: O) -> Self {
        Self {
            inner,
            duration,
            timer: None,
        }
    }

    pub fn with_timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = Some(timer);
        self
    }
}

#[async_trait]
impl<O: Operation> Operation for Timeout<O> {
    type Output = O::Output;

    async fn call(&mut self) -> Result<O::Output> {
        let duration = self.duration;
        let timer = self
            .timer
            .clone()
            .or_else(current_timer)
            .unwrap_or_else(|| Arc::new(TokioTimer) as Arc<dyn Timer>);
        tokio::select! {
            biased;
            outcome = self.inner.call() => outcome,
            _ = timer.sleep(duration) => {
                let step = current_step();
                metrics::TIMEOUTS_TOTAL.inc();
                warn!("{} timed out after {:?}", step.as_deref().unwrap_or("operation"), duration);
                Err(Error::Timeout { step, duration })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{from_fn, ManualTimer, OperationExt, RetryOptions};
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_fast_operation_passes_through() {
        let mut op = timeout(
            Duration::from_secs(5),
            from_fn(|| async { Ok::<_, Error>("done") }),
        );
        assert_eq!(assert_ok!(op.call().await), "done");
    }

    #[tokio::test]
    async fn test_failure_passes_through_unchanged() {
        let mut op = timeout(
            Duration::from_secs(5),
            from_fn(|| async { Err::<(), _>(Error::from(anyhow!("bad request"))) }),
        );
        let err = assert_err!(op.call().await);
        assert!(matches!(err, Error::Operation(_)));
        assert_eq!(err.to_string(), "bad request");
    }

    #[tokio::test]
    async fn test_deadline_releases_caller() {
        let timer = Arc::new(ManualTimer::new());
        let mut op = timeout(
            Duration::from_millis(250),
            from_fn(|| futures::future::pending::<Result<u32>>()),
        )
        .with_timer(timer.clone());

        let err = assert_err!(op.call().await);
        match err {
            Error::Timeout { step, duration } => {
                assert_eq!(step, None);
                assert_eq!(duration, Duration::from_millis(250));
            }
            other => panic!("expected Timeout, got {:?}", other),
        }
        assert_eq!(timer.sleeps(), vec![Duration::from_millis(250)]);
    }

    #[tokio::test]
    async fn test_real_clock_timeout() {
        let mut op = from_fn(|| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, Error>(1u8)
        })
        .with_timeout(Duration::from_millis(20));

        let started = std::time::Instant::now();
        assert!(assert_err!(op.call().await).is_timeout());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_each_retry_attempt_gets_fresh_deadline() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut op = from_fn(move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    // hangs until the deadline fires
                    futures::future::pending::<()>().await;
                }
                Ok::<_, Error>(n)
            }
        })
        .with_timeout(Duration::from_millis(20))
        .with_retry(RetryOptions::new(3).with_delay(Duration::from_millis(1)));

        assert_eq!(assert_ok!(op.call().await), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
