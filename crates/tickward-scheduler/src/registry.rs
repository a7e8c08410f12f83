use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::info;

use crate::{
    cron::CronSchedule,
    error::{Result, SchedulerError},
    types::{RegisterOptions, TaskDescriptor, TaskHandler, TaskInfo},
};

/// Runtime binding between a task and its cron schedule.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub descriptor: TaskDescriptor,
    pub cron: CronSchedule,
    pub next: Option<DateTime<Utc>>,
    pub prev: Option<DateTime<Utc>>,
}

impl ScheduleEntry {
    fn info(&self) -> TaskInfo {
        let opts = &self.descriptor.options;
        TaskInfo {
            name: self.descriptor.name.clone(),
            schedule: self.descriptor.schedule.clone(),
            next_run: self.next,
            prev_run: self.prev,
            lease_secs: opts.lease_duration.as_secs(),
            timeout_secs: opts.timeout.map(|t| t.as_secs()),
            run_immediately: opts.run_immediately,
            priority: opts.priority,
            retry_count: opts.retry_count,
            idempotent: opts.idempotent,
        }
    }
}

/// Name → task map. Writes happen at register/unregister and on every tick;
/// lookups and listings take the read lock.
///
/// Every accessor returns owned snapshots, never references into the map.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, ScheduleEntry>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `spec`, compute the first fire time after `now` and store
    /// the task. Nothing is stored on error.
    pub fn register(
        &self,
        name: &str,
        spec: &str,
        handler: Arc<dyn TaskHandler>,
        options: RegisterOptions,
        now: DateTime<Utc>,
    ) -> Result<TaskDescriptor> {
        let cron = CronSchedule::parse(spec)?;
        let next = cron
            .next_after(now)
            .ok_or_else(|| SchedulerError::invalid_schedule(spec, "expression never fires"))?;

        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        if tasks.contains_key(name) {
            return Err(SchedulerError::DuplicateTask {
                name: name.to_string(),
            });
        }

        let descriptor = TaskDescriptor {
            name: name.to_string(),
            schedule: cron.expr().to_string(),
            handler,
            options,
        };
        tasks.insert(
            name.to_string(),
            ScheduleEntry {
                descriptor: descriptor.clone(),
                cron,
                next: Some(next),
                prev: None,
            },
        );
        info!(task = %name, schedule = %spec, next = %next, "task registered");
        Ok(descriptor)
    }

    /// Remove a task. Returns whether it existed.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self
            .tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some();
        if removed {
            info!(task = %name, "task unregistered");
        }
        removed
    }

    pub fn lookup(&self, name: &str) -> Option<TaskDescriptor> {
        self.read().get(name).map(|e| e.descriptor.clone())
    }

    /// All descriptors, ordered by name.
    pub fn list_all(&self) -> Vec<TaskDescriptor> {
        let mut all: Vec<_> = self.read().values().map(|e| e.descriptor.clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn info(&self, name: &str) -> Option<TaskInfo> {
        self.read().get(name).map(ScheduleEntry::info)
    }

    pub fn infos(&self) -> HashMap<String, TaskInfo> {
        self.read()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.info()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Tasks registered with `run_immediately`.
    pub fn immediate(&self) -> Vec<TaskDescriptor> {
        self.read()
            .values()
            .filter(|e| e.descriptor.options.run_immediately)
            .map(|e| e.descriptor.clone())
            .collect()
    }

    /// Claim every tick due at `now`.
    ///
    /// For each due task `prev` becomes the due fire time and `next` is
    /// advanced past `now` before the caller dispatches anything, so a tick
    /// is handed out exactly once. Ticks missed while the caller was late
    /// are skipped.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<(TaskDescriptor, DateTime<Utc>)> {
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        let mut due = Vec::new();
        for entry in tasks.values_mut() {
            let Some(fire) = entry.next.filter(|n| *n <= now) else {
                continue;
            };
            entry.prev = Some(fire);
            entry.next = entry.cron.next_after(fire.max(now));
            due.push((entry.descriptor.clone(), fire));
        }
        due
    }

    /// Earliest pending fire time across all tasks.
    pub fn earliest_next(&self) -> Option<DateTime<Utc>> {
        self.read().values().filter_map(|e| e.next).min()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, ScheduleEntry>> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner)
    }
}
