use std::any::Any;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    lock::{lock_key, LeaseGuard, LeaseLock},
    types::{ExecutionRecord, Outcome, TaskContext, TaskDescriptor, Trigger},
};

/// Runs single firings of tasks: lease, timeout, panic recovery, logging.
#[derive(Clone)]
pub struct Executor {
    lock: LeaseLock,
    distributed: bool,
    records: Option<mpsc::Sender<ExecutionRecord>>,
}

impl Executor {
    /// `distributed` only affects logging; exclusion always goes through `lock`.
    pub fn new(lock: LeaseLock, distributed: bool, records: Option<mpsc::Sender<ExecutionRecord>>) -> Self {
        Self {
            lock,
            distributed,
            records,
        }
    }

    /// Execute one firing of `task` to completion and return its record.
    ///
    /// Never panics and never returns an error: every failure is folded into
    /// the record's outcome.
    pub async fn execute(&self, task: TaskDescriptor, trigger: Trigger, fire_time: DateTime<Utc>) -> ExecutionRecord {
        let started_at = Utc::now();
        let started = Instant::now();
        let key = lock_key(&task.name);

        let guard = match self.lock.try_acquire(&key, task.options.lease_duration).await {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                info!(task = %task.name, %trigger, distributed = self.distributed, "skipped: lock held elsewhere");
                return self.finish(&task, trigger, fire_time, started_at, started, Outcome::SkippedLocked, 0, None);
            }
            Err(e) => {
                error!(task = %task.name, %trigger, error = %e, "lease acquisition failed, skipping tick");
                return self.finish(
                    &task,
                    trigger,
                    fire_time,
                    started_at,
                    started,
                    Outcome::LockUnavailable,
                    0,
                    Some(e.to_string()),
                );
            }
        };

        let (outcome, attempts, err) = self.run_handler(&task, trigger, fire_time, &guard).await;

        let held = guard.held_for();
        if let Err(e) = guard.release().await {
            warn!(task = %task.name, error = %e, "lease release failed; it will expire on its own");
        }
        if held > task.options.lease_duration {
            warn!(
                task = %task.name,
                held_ms = held.as_millis() as u64,
                lease_ms = task.options.lease_duration.as_millis() as u64,
                "execution outlived its lease; another instance may have run the same tick"
            );
        }

        self.finish(&task, trigger, fire_time, started_at, started, outcome, attempts, err)
    }

    /// Invoke the handler, retrying returned errors only when the task opted in.
    async fn run_handler(
        &self,
        task: &TaskDescriptor,
        trigger: Trigger,
        fire_time: DateTime<Utc>,
        guard: &LeaseGuard,
    ) -> (Outcome, u32, Option<String>) {
        let cancel = CancellationToken::new();
        let deadline = task.options.timeout.map(|t| Instant::now() + t);
        let _timer = deadline.map(|at| {
            let cancel = cancel.clone();
            AbortOnDrop(tokio::spawn(async move {
                tokio::time::sleep_until(at).await;
                cancel.cancel();
            }))
        });

        let max_attempts = task.options.max_attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let ctx = TaskContext::new(
                task.name.clone(),
                trigger,
                fire_time,
                cancel.clone(),
                deadline,
                guard.token().to_string(),
            );
            let handler = Arc::clone(&task.handler);
            // Own task so a panic unwinds there and surfaces as a JoinError.
            let joined = tokio::spawn(async move { handler.run(ctx).await }).await;

            if cancel.is_cancelled() {
                warn!(task = %task.name, timeout_ms = task.options.timeout.map(|t| t.as_millis() as u64), "execution exceeded its timeout");
            }

            match joined {
                Ok(Ok(())) => return (Outcome::Success, attempt, None),
                Ok(Err(e)) => {
                    let message = format!("{e:#}");
                    if attempt < max_attempts && !cancel.is_cancelled() {
                        warn!(task = %task.name, attempt, max_attempts, error = %message, "handler failed, retrying");
                        continue;
                    }
                    return (Outcome::Error, attempt, Some(message));
                }
                Err(e) if e.is_panic() => {
                    return (Outcome::Panicked, attempt, Some(panic_message(e.into_panic())));
                }
                Err(e) => return (Outcome::Error, attempt, Some(e.to_string())),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        task: &TaskDescriptor,
        trigger: Trigger,
        fire_time: DateTime<Utc>,
        started_at: DateTime<Utc>,
        started: Instant,
        outcome: Outcome,
        attempts: u32,
        error: Option<String>,
    ) -> ExecutionRecord {
        let record = ExecutionRecord {
            task_name: task.name.clone(),
            trigger,
            fire_time,
            started_at,
            duration: started.elapsed(),
            outcome,
            attempts,
            error,
        };
        log_record(&record);

        if let Some(ref tx) = self.records {
            // try_send never blocks the execution path.
            if tx.try_send(record.clone()).is_err() {
                warn!(task = %record.task_name, "record sink full or closed; record dropped");
            }
        }
        record
    }
}

fn log_record(record: &ExecutionRecord) {
    let duration_ms = record.duration.as_millis() as u64;
    let error = record.error.as_deref().unwrap_or_default();
    match record.outcome {
        Outcome::Success => info!(
            task = %record.task_name,
            trigger = %record.trigger,
            fire_time = %record.fire_time,
            duration_ms,
            attempts = record.attempts,
            "task succeeded"
        ),
        Outcome::Error => warn!(
            task = %record.task_name,
            trigger = %record.trigger,
            duration_ms,
            attempts = record.attempts,
            error,
            "task failed"
        ),
        Outcome::Panicked => error!(
            task = %record.task_name,
            trigger = %record.trigger,
            duration_ms,
            error,
            "task panicked"
        ),
        // Already logged where the lease decision was made.
        Outcome::SkippedLocked | Outcome::LockUnavailable => {}
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic: <non-string payload>".to_string()
    }
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
