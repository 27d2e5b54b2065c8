use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::{
    metrics,
    workflow::{EventSink, RunStatus, Timer, TokioTimer, TracingEventSink, WorkflowContext},
    Result,
};

type Definition<I, O> =
    dyn for<'a> Fn(&'a mut WorkflowContext, I) -> BoxFuture<'a, Result<O>> + Send + Sync;

/// Outcome of one run, alongside the definition's own result.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub workflow: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub completed_steps: Vec<String>,
}

/// A named workflow definition. Cheap to clone; every call to [`Workflow::run`]
/// executes the definition against brand new state.
pub struct Workflow<I, O> {
    name: String,
    definition: Arc<Definition<I, O>>,
    events: Arc<dyn EventSink>,
    timer: Arc<dyn Timer>,
}

impl<I, O> Clone for Workflow<I, O> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            definition: self.definition.clone(),
            events: self.events.clone(),
            timer: self.timer.clone(),
        }
    }
}

impl<I, O> Workflow<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Bind `definition` to a name.
    ///
    /// ```no_run
    /// use stepflow::Workflow;
    ///
    /// let greet = Workflow::<String, String>::make("greet", |ctx, name| {
    ///     Box::pin(async move {
    ///         let greeting = ctx
    ///             .step_fn("compose", move || {
    ///                 let name = name.clone();
    ///                 async move { Ok::<_, stepflow::Error>(format!("hello, {}", name)) }
    ///             })
    ///             .await?;
    ///         Ok::<_, stepflow::Error>(greeting)
    ///     })
    /// });
    /// ```
    pub fn make<F>(name: impl Into<String>, definition: F) -> Self
    where
        F: for<'a> Fn(&'a mut WorkflowContext, I) -> BoxFuture<'a, Result<O>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            definition: Arc::new(definition),
            events: Arc::new(TracingEventSink),
            timer: Arc::new(TokioTimer),
        }
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Timer handed to `WorkflowContext::sleep`.
    pub fn with_timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = timer;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn run(&self, input: I) -> Result<O> {
        let (_, result) = self.run_with_report(input).await;
        result
    }

    /// Like [`Workflow::run`], also returning what the run got through.
    pub async fn run_with_report(&self, input: I) -> (RunReport, Result<O>) {
        let mut ctx = WorkflowContext::new(&self.name, self.events.clone(), self.timer.clone());
        let run_id = ctx.run_id();
        let started_at = Utc::now();
        let span = info_span!("workflow", name = %self.name, run_id = %run_id);

        info!(parent: &span, "Executing workflow: {}", self.name);
        let result = (self.definition)(&mut ctx, input).instrument(span.clone()).await;

        let status = match &result {
            Ok(_) => {
                info!(parent: &span, "Workflow {} completed successfully", self.name);
                RunStatus::Succeeded
            }
            Err(e) => {
                error!(parent: &span, "Workflow {} failed: {}", self.name, e);
                RunStatus::Failed
            }
        };
        metrics::RUNS_TOTAL.with_label_values(&[status.as_label()]).inc();

        let report = RunReport {
            run_id,
            workflow: self.name.clone(),
            status,
            started_at,
            finished_at: Utc::now(),
            completed_steps: ctx.completed_steps().to_vec(),
        };
        (report, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{from_fn, RecordingEventSink, StepEvent};
    use crate::Error;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn doubling(calls: Arc<AtomicU32>) -> Workflow<u32, u32> {
        Workflow::<u32, u32>::make("double", move |ctx, input| {
            let calls = calls.clone();
            Box::pin(async move {
                let step_calls = calls.clone();
                let doubled = ctx
                    .step(
                        "double",
                        from_fn(move || {
                            let step_calls = step_calls.clone();
                            async move {
                                step_calls.fetch_add(1, Ordering::SeqCst);
                                Ok::<_, Error>(input * 2)
                            }
                        }),
                    )
                    .await?;
                // same name again within the run hits the cache
                let again = ctx
                    .step("double", from_fn(|| async { Ok::<_, Error>(0u32) }))
                    .await?;
                Ok::<_, Error>(doubled + again)
            })
        })
    }

    #[tokio::test]
    async fn test_run_memoizes_within_run_only() {
        let calls = Arc::new(AtomicU32::new(0));
        let workflow = doubling(calls.clone());

        assert_eq!(workflow.run(5).await.unwrap(), 20);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // a new run starts from empty state
        assert_eq!(workflow.run(5).await.unwrap(), 20);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_runs_are_isolated() {
        let calls = Arc::new(AtomicU32::new(0));
        let workflow = doubling(calls.clone());
        let other = workflow.clone();

        let (a, b) = tokio::join!(workflow.run(1), other.run(10));
        assert_eq!(a.unwrap(), 4);
        assert_eq!(b.unwrap(), 40);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_propagates_with_report() {
        let sink = Arc::new(RecordingEventSink::new());
        let workflow = Workflow::<(), u32>::make("deploy", |ctx, _| {
            Box::pin(async move {
                ctx.step_fn("build", || async { Ok::<_, Error>(1u32) }).await?;
                ctx.step_fn("ship", || async {
                    Err::<u32, _>(Error::from(anyhow!("registry unavailable")))
                })
                .await
            })
        })
        .with_event_sink(sink.clone());

        let (report, result) = workflow.run_with_report(()).await;
        let err = result.unwrap_err();

        assert!(matches!(err, Error::Step { ref step, attempt: 1, .. } if step == "ship"));
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.workflow, "deploy");
        assert_eq!(report.completed_steps, vec!["build".to_string()]);
        assert!(report.finished_at >= report.started_at);
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, StepEvent::StepFailed { step, .. } if step == "ship")));
    }

    #[tokio::test]
    async fn test_run_ids_are_unique() {
        let workflow = Workflow::<(), ()>::make("noop", |_ctx, _| Box::pin(async { Ok::<_, Error>(()) }));
        let (first, _) = workflow.run_with_report(()).await;
        let (second, _) = workflow.run_with_report(()).await;

        assert_ne!(first.run_id, second.run_id);
        assert_eq!(first.status, RunStatus::Succeeded);
    }
}
