use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Succeeded,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Succeeded => write!(f, "Succeeded"),
            RunStatus::Failed => write!(f, "Failed"),
        }
    }
}

impl RunStatus {
    /// Label value used for the runs counter.
    pub fn as_label(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }
}

/// Progress of a single run: which steps finished, what they returned and
/// how often each was attempted.
///
/// Owned by exactly one run and dropped with it. Nothing here is shared or
/// persisted, so no locking is involved.
#[derive(Debug, Default)]
pub struct WorkflowState {
    /// Completion order
    completed: Vec<String>,
    completed_set: HashSet<String>,
    results: HashMap<String, Value>,
    attempts: HashMap<String, u32>,
}

impl WorkflowState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_completed(&self, step: &str) -> bool {
        self.completed_set.contains(step)
    }

    pub fn cached_result(&self, step: &str) -> Option<&Value> {
        self.results.get(step)
    }

    /// Mark `step` completed. A `null` result is not cached, so the step will
    /// run again if it is called a second time.
    pub fn record_success(&mut self, step: &str, result: Value) {
        if self.completed_set.insert(step.to_string()) {
            self.completed.push(step.to_string());
        }
        if !result.is_null() {
            self.results.insert(step.to_string(), result);
        }
    }

    /// Bump the attempt counter for `step` and return the new count.
    pub fn record_attempt(&mut self, step: &str) -> u32 {
        let count = self.attempts.entry(step.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn attempts(&self, step: &str) -> u32 {
        self.attempts.get(step).copied().unwrap_or(0)
    }

    pub fn completed_steps(&self) -> &[String] {
        &self.completed
    }
}
