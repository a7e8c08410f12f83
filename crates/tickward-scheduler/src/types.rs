use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Lease duration used when a task does not specify one.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(5 * 60);

/// Body of a scheduled task.
///
/// Handlers should watch [`TaskContext::cancelled`] and return early once the
/// execution timeout fires; the scheduler never aborts a running handler.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<()> {
        (self)(ctx).await
    }
}

/// What caused an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// A due cron tick.
    Scheduled,
    /// The one-off run of a `run_immediately` task.
    Immediate,
    /// An out-of-band `run_task` call.
    Manual,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Trigger::Scheduled => "scheduled",
            Trigger::Immediate => "immediate",
            Trigger::Manual => "manual",
        };
        write!(f, "{s}")
    }
}

/// Per-execution context handed to a [`TaskHandler`].
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_name: String,
    trigger: Trigger,
    fire_time: DateTime<Utc>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    fencing_token: String,
}

impl TaskContext {
    pub(crate) fn new(
        task_name: String,
        trigger: Trigger,
        fire_time: DateTime<Utc>,
        cancel: CancellationToken,
        deadline: Option<Instant>,
        fencing_token: String,
    ) -> Self {
        Self {
            task_name,
            trigger,
            fire_time,
            cancel,
            deadline,
            fencing_token,
        }
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn trigger(&self) -> Trigger {
        self.trigger
    }

    /// The tick this execution belongs to (dispatch time for manual runs).
    pub fn fire_time(&self) -> DateTime<Utc> {
        self.fire_time
    }

    /// Resolves once the execution timeout has elapsed.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Token proving lease ownership for this execution. Pass it to
    /// downstream writes that can reject stale holders.
    pub fn fencing_token(&self) -> &str {
        &self.fencing_token
    }
}

/// Options accepted by `register_with_options`.
#[derive(Debug, Clone)]
pub struct RegisterOptions {
    /// Execute once as soon as the scheduler is running, regardless of schedule.
    pub run_immediately: bool,
    /// How long the lease is held before it expires on its own.
    pub lease_duration: Duration,
    /// Cancel the handler's context after this long. `None` disables it.
    pub timeout: Option<Duration>,
    /// Informational only; has no effect on ordering.
    pub priority: i32,
    /// Extra attempts after a returned error. Ignored unless `idempotent`.
    pub retry_count: u32,
    /// The handler tolerates being run more than once for the same tick.
    pub idempotent: bool,
}

impl Default for RegisterOptions {
    fn default() -> Self {
        Self {
            run_immediately: false,
            lease_duration: DEFAULT_LEASE,
            timeout: None,
            priority: 0,
            retry_count: 0,
            idempotent: false,
        }
    }
}

impl RegisterOptions {
    pub fn run_immediately(mut self, yes: bool) -> Self {
        self.run_immediately = yes;
        self
    }

    pub fn lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Opt into automatic retry of returned errors.
    pub fn retry_idempotent(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self.idempotent = true;
        self
    }

    /// Attempts the execution wrapper will make for one firing.
    pub(crate) fn max_attempts(&self) -> u32 {
        if self.idempotent {
            self.retry_count.saturating_add(1)
        } else {
            1
        }
    }
}

/// A registered task. Immutable once registered.
#[derive(Clone)]
pub struct TaskDescriptor {
    pub name: String,
    pub schedule: String,
    pub handler: Arc<dyn TaskHandler>,
    pub options: RegisterOptions,
}

impl std::fmt::Debug for TaskDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDescriptor")
            .field("name", &self.name)
            .field("schedule", &self.schedule)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Read-only snapshot of a task and its schedule state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub name: String,
    pub schedule: String,
    pub next_run: Option<DateTime<Utc>>,
    pub prev_run: Option<DateTime<Utc>>,
    pub lease_secs: u64,
    pub timeout_secs: Option<u64>,
    pub run_immediately: bool,
    pub priority: i32,
    pub retry_count: u32,
    pub idempotent: bool,
}

/// How one execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// The handler returned an error.
    Error,
    /// Another holder owns the lease; the handler was not invoked.
    SkippedLocked,
    /// The lease store could not be reached; the handler was not invoked.
    LockUnavailable,
    /// The handler panicked.
    Panicked,
}

impl Outcome {
    /// Whether the handler actually ran.
    pub fn executed(&self) -> bool {
        matches!(self, Outcome::Success | Outcome::Error | Outcome::Panicked)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Outcome::Success => "success",
            Outcome::Error => "error",
            Outcome::SkippedLocked => "skipped_locked",
            Outcome::LockUnavailable => "lock_unavailable",
            Outcome::Panicked => "panicked",
        };
        write!(f, "{s}")
    }
}

/// Result of one firing. Logged and optionally forwarded to a record sink;
/// never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub task_name: String,
    pub trigger: Trigger,
    pub fire_time: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub outcome: Outcome,
    /// Handler invocations made (0 when skipped).
    pub attempts: u32,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_defaults() {
        let opts = RegisterOptions::default();
        assert_eq!(opts.lease_duration, Duration::from_secs(300));
        assert!(!opts.run_immediately);
        assert_eq!(opts.timeout, None);
        assert_eq!(opts.max_attempts(), 1);
    }

    #[test]
    fn retry_requires_idempotent_opt_in() {
        let mut opts = RegisterOptions::default();
        opts.retry_count = 3;
        assert_eq!(opts.max_attempts(), 1);
        assert_eq!(RegisterOptions::default().retry_idempotent(3).max_attempts(), 4);
    }

    #[test]
    fn outcome_wire_names() {
        assert_eq!(serde_json::to_string(&Outcome::SkippedLocked).unwrap(), r#""skipped_locked""#);
        assert_eq!(Outcome::Panicked.to_string(), "panicked");
        assert!(Outcome::Error.executed());
        assert!(!Outcome::LockUnavailable.executed());
        assert_eq!(Trigger::Manual.to_string(), "manual");
    }
}
