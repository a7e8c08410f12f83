use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tickward_core::config::SchedulerConfig;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{
    clock::{Clock, SystemClock},
    error::{Result, SchedulerError},
    executor::Executor,
    lock::LeaseLock,
    registry::TaskRegistry,
    store::{LeaseStore, MemoryStore},
    types::{ExecutionRecord, RegisterOptions, TaskDescriptor, TaskHandler, TaskInfo, Trigger},
};

/// Lifecycle of a [`Scheduler`]. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Created,
    Running,
    Stopped,
}

/// Configures and builds a [`Scheduler`].
pub struct SchedulerBuilder {
    store: Option<Arc<dyn LeaseStore>>,
    clock: Arc<dyn Clock>,
    records: Option<mpsc::Sender<ExecutionRecord>>,
    idle_poll: Duration,
    defaults: RegisterOptions,
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self {
            store: None,
            clock: Arc::new(SystemClock),
            records: None,
            idle_poll: SchedulerConfig::default().idle_poll(),
            defaults: RegisterOptions::default(),
        }
    }
}

impl SchedulerBuilder {
    /// Coordinate with other instances through `store`. Without this, ticks
    /// are only mutually exclusive inside this process.
    pub fn distributed_lock(self, store: impl LeaseStore) -> Self {
        self.distributed_lock_shared(Arc::new(store))
    }

    pub fn distributed_lock_shared(mut self, store: Arc<dyn LeaseStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Forward every finished execution to `tx` (non-blocking, drops when full).
    pub fn record_sink(mut self, tx: mpsc::Sender<ExecutionRecord>) -> Self {
        self.records = Some(tx);
        self
    }

    /// Apply defaults (lease, timeout, idle poll) from configuration.
    pub fn config(mut self, config: &SchedulerConfig) -> Self {
        self.idle_poll = config.idle_poll();
        self.defaults.lease_duration = config.default_lease();
        self.defaults.timeout = config.default_timeout();
        self
    }

    pub fn build(self) -> Scheduler {
        let distributed = self.store.is_some();
        let lock = match self.store {
            Some(store) => LeaseLock::from_shared(store),
            None => LeaseLock::new(MemoryStore::new()),
        };

        Scheduler {
            inner: Arc::new(Inner {
                registry: TaskRegistry::new(),
                executor: Executor::new(lock, distributed, self.records),
                clock: self.clock,
                state: Mutex::new(EngineState::Created),
                wake: Notify::new(),
                shutdown: CancellationToken::new(),
                loop_handle: Mutex::new(None),
                in_flight: TaskTracker::new(),
                idle_poll: self.idle_poll,
                defaults: self.defaults,
                distributed,
            }),
        }
    }
}

struct Inner {
    registry: TaskRegistry,
    executor: Executor,
    clock: Arc<dyn Clock>,
    state: Mutex<EngineState>,
    /// Wakes the loop when the set of fire times changes.
    wake: Notify,
    shutdown: CancellationToken,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    in_flight: TaskTracker,
    idle_poll: Duration,
    defaults: RegisterOptions,
    distributed: bool,
}

impl Inner {
    /// Hand one firing to the executor on its own task.
    fn dispatch(&self, task: TaskDescriptor, trigger: Trigger, fire_time: DateTime<Utc>) {
        debug!(task = %task.name, %trigger, %fire_time, "dispatching");
        let executor = self.executor.clone();
        self.in_flight.spawn(async move {
            executor.execute(task, trigger, fire_time).await;
        });
    }
}

/// Cron-driven task scheduler.
///
/// Build one per process and share it by cloning the handle. Each due tick
/// is dispatched asynchronously through the execution wrapper; with a
/// distributed lock, at most one instance of the fleet runs a given tick.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// In-process-only scheduler with defaults. See [`Scheduler::builder`].
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::default()
    }

    pub fn state(&self) -> EngineState {
        *self.lock_state()
    }

    pub fn is_distributed(&self) -> bool {
        self.inner.distributed
    }

    /// Options used by [`Scheduler::register`]; start from these when
    /// customising a registration.
    pub fn default_options(&self) -> RegisterOptions {
        self.inner.defaults.clone()
    }

    /// Register `handler` under `name` with the default options.
    pub fn register(&self, name: &str, spec: &str, handler: impl TaskHandler) -> Result<()> {
        self.register_with_options(name, spec, handler, self.default_options())
    }

    /// Register `handler` under `name`.
    ///
    /// Fails with `InvalidSchedule` or `DuplicateTask` without touching any
    /// existing task, and with `SchedulerStopped` once stopped. A
    /// `run_immediately` task registered while running is dispatched at once;
    /// one registered before `start` runs when the scheduler starts.
    pub fn register_with_options(
        &self,
        name: &str,
        spec: &str,
        handler: impl TaskHandler,
        options: RegisterOptions,
    ) -> Result<()> {
        self.register_handler(name, spec, Arc::new(handler), options)
    }

    /// [`Scheduler::register_with_options`] for a handler that is already shared.
    pub fn register_handler(
        &self,
        name: &str,
        spec: &str,
        handler: Arc<dyn TaskHandler>,
        options: RegisterOptions,
    ) -> Result<()> {
        let now = self.inner.clock.now();
        // Hold the state across the insert so `start` cannot miss an
        // immediate task registered concurrently.
        let state = self.lock_state();
        if *state == EngineState::Stopped {
            return Err(SchedulerError::SchedulerStopped);
        }
        let descriptor = self
            .inner
            .registry
            .register(name, spec, handler, options, now)?;
        let running = *state == EngineState::Running;
        drop(state);

        self.inner.wake.notify_one();
        if running && descriptor.options.run_immediately {
            self.inner.dispatch(descriptor, Trigger::Immediate, now);
        }
        Ok(())
    }

    /// Remove a task; its pending tick is dropped. Returns whether it existed.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.inner.registry.unregister(name);
        if removed {
            self.inner.wake.notify_one();
        }
        removed
    }

    /// Begin firing due tasks. A second call is a no-op.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut state = self.lock_state();
        match *state {
            EngineState::Running => return Ok(()),
            EngineState::Stopped => return Err(SchedulerError::SchedulerStopped),
            EngineState::Created => {}
        }
        *state = EngineState::Running;

        let handle = tokio::spawn(run_loop(Arc::clone(&self.inner)));
        *self
            .inner
            .loop_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        let immediate = self.inner.registry.immediate();
        drop(state);

        info!(
            tasks = self.inner.registry.len(),
            distributed = self.inner.distributed,
            "scheduler started"
        );
        let now = self.inner.clock.now();
        for task in immediate {
            self.inner.dispatch(task, Trigger::Immediate, now);
        }
        Ok(())
    }

    /// Stop scheduling new ticks and wait for the loop to exit.
    ///
    /// Executions already dispatched keep running; use [`Scheduler::drain`]
    /// to wait for them.
    pub async fn stop(&self) {
        {
            let mut state = self.lock_state();
            if *state == EngineState::Stopped {
                return;
            }
            *state = EngineState::Stopped;
        }
        self.inner.shutdown.cancel();
        self.inner.wake.notify_one();

        let handle = self
            .inner
            .loop_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "scheduler loop ended abnormally");
            }
        }
        info!(in_flight = self.inner.in_flight.len(), "scheduler stopped");
    }

    /// Wait up to `timeout` for dispatched executions to finish. Returns
    /// whether all of them did.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.inner.in_flight.close();
        let drained = tokio::time::timeout(timeout, self.inner.in_flight.wait())
            .await
            .is_ok();
        if !drained {
            warn!(
                in_flight = self.inner.in_flight.len(),
                "drain timed out with executions still running"
            );
        }
        drained
    }

    /// Run `name` now, out of band, with the same locking, timeout and panic
    /// handling as a scheduled tick. Returns as soon as the run is accepted.
    pub fn run_task(&self, name: &str) -> Result<()> {
        if self.state() == EngineState::Stopped {
            return Err(SchedulerError::SchedulerStopped);
        }
        let task = self
            .inner
            .registry
            .lookup(name)
            .ok_or_else(|| SchedulerError::UnknownTask {
                name: name.to_string(),
            })?;
        info!(task = %name, "manual run requested");
        self.inner.dispatch(task, Trigger::Manual, self.inner.clock.now());
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<TaskDescriptor> {
        self.inner.registry.lookup(name)
    }

    pub fn list_all(&self) -> Vec<TaskDescriptor> {
        self.inner.registry.list_all()
    }

    pub fn get_task_info(&self, name: &str) -> Result<TaskInfo> {
        self.inner
            .registry
            .info(name)
            .ok_or_else(|| SchedulerError::UnknownTask {
                name: name.to_string(),
            })
    }

    pub fn get_all_tasks_info(&self) -> HashMap<String, TaskInfo> {
        self.inner.registry.infos()
    }

    /// Executions dispatched and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Whether the scheduling loop is alive.
    pub fn health_check(&self) -> bool {
        if self.state() != EngineState::Running {
            return false;
        }
        self.inner
            .loop_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Handle that does not keep the scheduler alive. Use it from task
    /// handlers that need to call back into their own scheduler.
    pub fn downgrade(&self) -> WeakScheduler {
        WeakScheduler {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Non-owning [`Scheduler`] handle.
#[derive(Clone)]
pub struct WeakScheduler {
    inner: Weak<Inner>,
}

impl WeakScheduler {
    pub fn upgrade(&self) -> Option<Scheduler> {
        self.inner.upgrade().map(|inner| Scheduler { inner })
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleep until the earliest fire time, claim due ticks, dispatch them.
async fn run_loop(inner: Arc<Inner>) {
    info!("scheduler loop started");
    loop {
        let now = inner.clock.now();
        for (task, fire_time) in inner.registry.take_due(now) {
            if inner.shutdown.is_cancelled() {
                break;
            }
            inner.dispatch(task, Trigger::Scheduled, fire_time);
        }

        // Never sleep past idle_poll so wall-clock jumps are noticed.
        let wait = inner
            .registry
            .earliest_next()
            .map(|next| (next - inner.clock.now()).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(inner.idle_poll)
            .min(inner.idle_poll);

        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = inner.wake.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
    info!("scheduler loop stopped");
}
