use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::{Error, Result};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref RUNS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("stepflow_runs_total", "Total number of finished workflow runs."),
        &["status"]
    )
    .expect("metric definition is valid");
    pub static ref STEPS_STARTED_TOTAL: IntCounter = IntCounter::new(
        "stepflow_steps_started_total",
        "Total number of step executions started."
    )
    .expect("metric definition is valid");
    pub static ref STEP_CACHE_HITS_TOTAL: IntCounter = IntCounter::new(
        "stepflow_step_cache_hits_total",
        "Total number of step calls answered from the run cache."
    )
    .expect("metric definition is valid");
    pub static ref STEP_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "stepflow_step_failures_total",
        "Total number of failed step executions."
    )
    .expect("metric definition is valid");
    pub static ref RETRIES_SCHEDULED_TOTAL: IntCounter = IntCounter::new(
        "stepflow_retries_scheduled_total",
        "Total number of retries scheduled after a failed attempt."
    )
    .expect("metric definition is valid");
    pub static ref TIMEOUTS_TOTAL: IntCounter = IntCounter::new(
        "stepflow_timeouts_total",
        "Total number of attempts abandoned at their deadline."
    )
    .expect("metric definition is valid");
}

/// Register all collectors with [`REGISTRY`]. Call once at startup.
pub fn register_metrics() -> Result<()> {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(RUNS_TOTAL.clone()),
        Box::new(STEPS_STARTED_TOTAL.clone()),
        Box::new(STEP_CACHE_HITS_TOTAL.clone()),
        Box::new(STEP_FAILURES_TOTAL.clone()),
        Box::new(RETRIES_SCHEDULED_TOTAL.clone()),
        Box::new(TIMEOUTS_TOTAL.clone()),
    ];
    for collector in collectors {
        REGISTRY
            .register(collector)
            .map_err(|e| Error::Metrics(e.to_string()))?;
    }
    Ok(())
}

/// Render the registry in the prometheus text exposition format.
pub fn gather_metrics() -> Result<String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| Error::Metrics(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| Error::Metrics(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_gather() {
        // Registration is global; a second registration from another test is
        // the only way this can fail.
        let _ = register_metrics();
        RUNS_TOTAL.with_label_values(&["succeeded"]).inc();

        let output = gather_metrics().unwrap();
        assert!(output.contains("stepflow_runs_total"));
        assert!(output.contains("status=\"succeeded\""));
    }
}
