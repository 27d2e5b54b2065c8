use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::{
    workflow::{from_fn, EventSink, Operation, StepExecutor, Timer},
    Result,
};

/// Handle a workflow definition uses to issue steps during one run.
///
/// Each run gets its own context; the definition receives it as
/// `&mut WorkflowContext`, which keeps steps within a run sequential.
pub struct WorkflowContext {
    run_id: Uuid,
    workflow: String,
    executor: StepExecutor,
    timer: Arc<dyn Timer>,
}

impl WorkflowContext {
    pub fn new(workflow: &str, events: Arc<dyn EventSink>, timer: Arc<dyn Timer>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            workflow: workflow.to_string(),
            executor: StepExecutor::new(events).with_timer(timer.clone()),
            timer,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn workflow_name(&self) -> &str {
        &self.workflow
    }

    /// Run `operation` as the step `name`, memoized for the rest of this run.
    pub async fn step<O>(&mut self, name: &str, operation: O) -> Result<O::Output>
    where
        O: Operation,
        O::Output: Serialize + DeserializeOwned,
    {
        self.executor.run_step(name, operation).await
    }

    /// Shorthand for `step(name, from_fn(f))`.
    pub async fn step_fn<F, Fut, T>(&mut self, name: &str, f: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Serialize + DeserializeOwned + Send,
    {
        self.executor.run_step(name, from_fn(f)).await
    }

    /// Plain suspension, unrelated to any retry or timeout.
    pub async fn sleep(&self, duration: Duration) {
        debug!("Workflow {} sleeping for {:?}", self.workflow, duration);
        self.timer.sleep(duration).await;
    }

    pub fn completed_steps(&self) -> &[String] {
        self.executor.state().completed_steps()
    }

    pub fn attempts(&self, step: &str) -> u32 {
        self.executor.state().attempts(step)
    }

    pub fn step_output(&self, step: &str) -> Option<&Value> {
        self.executor.state().cached_result(step)
    }

    /// Snapshot of this run's progress, for logging or display.
    pub fn to_json(&self) -> Value {
        let outputs: serde_json::Map<String, Value> = self
            .completed_steps()
            .iter()
            .filter_map(|step| self.step_output(step).map(|v| (step.clone(), v.clone())))
            .collect();

        serde_json::json!({
            "run_id": self.run_id.to_string(),
            "workflow": self.workflow,
            "completed_steps": self.completed_steps(),
            "step_outputs": outputs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{ManualTimer, RecordingEventSink};
    use crate::Error;
    use serde_json::json;

    fn context() -> (WorkflowContext, Arc<ManualTimer>) {
        let timer = Arc::new(ManualTimer::new());
        let ctx = WorkflowContext::new("release", Arc::new(RecordingEventSink::new()), timer.clone());
        (ctx, timer)
    }

    #[tokio::test]
    async fn test_step_fn_and_outputs() {
        let (mut ctx, _timer) = context();

        let version = ctx
            .step_fn("version", || async { Ok::<_, Error>("1.4.0".to_string()) })
            .await
            .unwrap();
        ctx.step_fn("announce", || async { Ok::<_, Error>(()) }).await.unwrap();

        assert_eq!(version, "1.4.0");
        assert_eq!(ctx.step_output("version"), Some(&json!("1.4.0")));
        assert_eq!(ctx.attempts("announce"), 1);

        let snapshot = ctx.to_json();
        assert_eq!(snapshot["workflow"], "release");
        assert_eq!(snapshot["completed_steps"], json!(["version", "announce"]));
        assert_eq!(snapshot["step_outputs"], json!({"version": "1.4.0"}));
    }

    #[tokio::test]
    async fn test_sleep_uses_timer() {
        let (ctx, timer) = context();
        ctx.sleep(Duration::from_secs(30)).await;
        assert_eq!(timer.sleeps(), vec![Duration::from_secs(30)]);
    }

    #[tokio::test]
    async fn test_cached_value_type_mismatch_is_an_error() {
        let (mut ctx, _timer) = context();
        ctx.step_fn("count", || async { Ok::<_, Error>("not a number".to_string()) })
            .await
            .unwrap();

        let err = ctx
            .step_fn("count", || async { Ok::<_, Error>(3u32) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
