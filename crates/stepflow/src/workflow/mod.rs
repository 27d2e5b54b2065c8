pub mod context;
pub mod engine;
pub mod events;
pub mod executor;
pub mod operation;
pub mod retry;
pub mod state;
pub mod timeout;
pub mod timer;

pub use context::WorkflowContext;
pub use engine::{RunReport, Workflow};
pub use events::{EventSink, RecordingEventSink, StepEvent, TracingEventSink};
pub use executor::{current_step, StepExecutor};
pub use operation::{from_fn, FnOperation, Operation, OperationExt};
pub use retry::{retry, Retry, RetryDelay, RetryOptions, DEFAULT_RETRY_DELAY};
pub use state::{RunStatus, WorkflowState};
pub use timeout::{timeout, Timeout};
pub use timer::{ManualTimer, Timer, TokioTimer};
