//! Built-in task table.
//!
//! Each row names a task, its default schedule and options. Rows can be
//! retuned or disabled from `[tasks.<name>]`; a row whose effective schedule
//! does not parse aborts startup.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use tickward_core::config::TaskOverride;
use tickward_scheduler::{
    CronSchedule, LeaseLock, RegisterOptions, Scheduler, TaskContext, TaskHandler, WeakScheduler,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::store::StoreHandle;

pub const LEASE_SWEEP: &str = "lease-sweep";
pub const STORE_PROBE: &str = "store-probe";
pub const SCHEDULER_STATS: &str = "scheduler-stats";

/// What built-in handlers may reach.
pub struct Deps {
    pub store: StoreHandle,
    pub scheduler: WeakScheduler,
}

struct BuiltinTask {
    name: &'static str,
    schedule: &'static str,
    run_immediately: bool,
    /// `None` keeps `[scheduler].default_lease_secs`.
    lease: Option<Duration>,
    /// `None` keeps `[scheduler].default_timeout_secs`.
    timeout: Option<Duration>,
    priority: i32,
    /// Retries for handlers that are safe to run twice per tick.
    idempotent_retries: Option<u32>,
    build: fn(&Deps) -> Arc<dyn TaskHandler>,
}

const TABLE: &[BuiltinTask] = &[
    BuiltinTask {
        name: LEASE_SWEEP,
        schedule: "0 */10 * * * *",
        run_immediately: false,
        lease: Some(Duration::from_secs(60)),
        timeout: Some(Duration::from_secs(30)),
        priority: 0,
        idempotent_retries: Some(2),
        build: |deps| {
            Arc::new(LeaseSweep {
                store: deps.store.clone(),
            })
        },
    },
    BuiltinTask {
        name: STORE_PROBE,
        schedule: "*/30 * * * * *",
        run_immediately: true,
        lease: Some(Duration::from_secs(15)),
        timeout: Some(Duration::from_secs(5)),
        priority: 10,
        idempotent_retries: None,
        build: |deps| {
            Arc::new(StoreProbe {
                store: deps.store.clone(),
            })
        },
    },
    BuiltinTask {
        name: SCHEDULER_STATS,
        schedule: "0 * * * * *",
        run_immediately: false,
        lease: None,
        timeout: None,
        priority: -10,
        idempotent_retries: None,
        build: |deps| {
            Arc::new(SchedulerStats {
                scheduler: deps.scheduler.clone(),
            })
        },
    },
];

/// A table row after applying configuration.
#[derive(Debug, Clone)]
pub struct ResolvedTask {
    pub name: &'static str,
    pub schedule: CronSchedule,
    pub options: RegisterOptions,
}

/// Merge the table with `overrides` on top of `defaults`. Disabled rows are
/// left out. Fails on the first row whose schedule is invalid.
pub fn resolve(
    overrides: &BTreeMap<String, TaskOverride>,
    defaults: &RegisterOptions,
) -> anyhow::Result<Vec<ResolvedTask>> {
    for name in overrides.keys() {
        if !TABLE.iter().any(|row| row.name == name.as_str()) {
            warn!(task = %name, "override for unknown built-in task ignored");
        }
    }

    let mut resolved = Vec::new();
    for row in TABLE {
        let ov = overrides.get(row.name).cloned().unwrap_or_default();
        if !ov.enabled {
            info!(task = row.name, "built-in task disabled by config");
            continue;
        }

        let spec = ov.schedule.as_deref().unwrap_or(row.schedule);
        let schedule = CronSchedule::parse(spec).with_context(|| format!("built-in task '{}'", row.name))?;

        let mut options = defaults.clone();
        options.run_immediately = ov.run_immediately.unwrap_or(row.run_immediately);
        if let Some(lease) = ov.lease_secs.map(Duration::from_secs).or(row.lease) {
            options.lease_duration = lease;
        }
        options.timeout = match ov.timeout_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => row.timeout.or(options.timeout),
        };
        options.priority = ov.priority.unwrap_or(row.priority);
        if let Some(retries) = row.idempotent_retries {
            options = options.retry_idempotent(retries);
        }

        resolved.push(ResolvedTask {
            name: row.name,
            schedule,
            options,
        });
    }
    Ok(resolved)
}

/// Register every enabled built-in task. Returns the registered names.
pub fn register_builtin(
    scheduler: &Scheduler,
    store: &StoreHandle,
    overrides: &BTreeMap<String, TaskOverride>,
) -> anyhow::Result<Vec<&'static str>> {
    let deps = Deps {
        store: store.clone(),
        scheduler: scheduler.downgrade(),
    };
    let resolved = resolve(overrides, &scheduler.default_options())?;

    let mut names = Vec::with_capacity(resolved.len());
    for task in resolved {
        let row = TABLE
            .iter()
            .find(|row| row.name == task.name)
            .ok_or_else(|| anyhow!("no handler for '{}'", task.name))?;
        scheduler
            .register_handler(task.name, task.schedule.expr(), (row.build)(&deps), task.options)
            .with_context(|| format!("registering built-in task '{}'", task.name))?;
        names.push(task.name);
    }
    Ok(names)
}

/// Cleanup: drop lease rows whose TTL has passed.
struct LeaseSweep {
    store: StoreHandle,
}

#[async_trait]
impl TaskHandler for LeaseSweep {
    async fn run(&self, _ctx: TaskContext) -> anyhow::Result<()> {
        let removed = self.store.purge_expired().await?;
        if removed > 0 {
            info!(removed, store = self.store.kind(), "expired leases swept");
        }
        Ok(())
    }
}

/// Health check: acquire and release a throwaway lease.
struct StoreProbe {
    store: StoreHandle,
}

#[async_trait]
impl TaskHandler for StoreProbe {
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<()> {
        let lock = LeaseLock::from_shared(self.store.lease_store());
        let key = format!("scheduler:probe:{}", ctx.fencing_token());
        let started = Instant::now();

        let probe = async {
            let Some(guard) = lock.try_acquire(&key, Duration::from_secs(30)).await? else {
                bail!("probe key {key} is unexpectedly held");
            };
            guard.release().await?;
            anyhow::Ok(())
        };

        tokio::select! {
            result = probe => result?,
            _ = ctx.cancelled() => bail!("lease store did not answer before the timeout"),
        }
        debug!(
            store = self.store.kind(),
            round_trip_ms = started.elapsed().as_millis() as u64,
            "lease store probe ok"
        );
        Ok(())
    }
}

/// Logs a one-line summary of the registry.
struct SchedulerStats {
    scheduler: WeakScheduler,
}

#[async_trait]
impl TaskHandler for SchedulerStats {
    async fn run(&self, _ctx: TaskContext) -> anyhow::Result<()> {
        let scheduler = self
            .scheduler
            .upgrade()
            .ok_or_else(|| anyhow!("scheduler has been dropped"))?;

        let infos = scheduler.get_all_tasks_info();
        let never_run = infos.values().filter(|i| i.prev_run.is_none()).count();
        let next = infos
            .values()
            .filter_map(|i| i.next_run.map(|at| (at, i.name.as_str())))
            .min();

        info!(
            tasks = infos.len(),
            never_run,
            in_flight = scheduler.in_flight(),
            state = ?scheduler.state(),
            next_task = next.map(|(_, name)| name).unwrap_or("-"),
            next_run = %next.map(|(at, _)| at.to_rfc3339()).unwrap_or_default(),
            "scheduler stats"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tickward_scheduler::{ExecutionRecord, MemoryStore, Outcome};
    use tokio::sync::mpsc;

    fn overrides(entries: &[(&str, TaskOverride)]) -> BTreeMap<String, TaskOverride> {
        entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn defaults_resolve_every_row() {
        let resolved = resolve(&BTreeMap::new(), &RegisterOptions::default()).unwrap();
        let names: Vec<_> = resolved.iter().map(|t| t.name).collect();
        assert_eq!(names, [LEASE_SWEEP, STORE_PROBE, SCHEDULER_STATS]);

        let probe = &resolved[1];
        assert!(probe.options.run_immediately);
        assert_eq!(probe.options.timeout, Some(Duration::from_secs(5)));

        let sweep = &resolved[0];
        assert!(sweep.options.idempotent);
        assert_eq!(sweep.options.retry_count, 2);

        // No row lease: the configured default applies.
        let defaults = RegisterOptions::default().lease_duration(Duration::from_secs(42));
        let stats = resolve(&BTreeMap::new(), &defaults).unwrap().remove(2);
        assert_eq!(stats.options.lease_duration, Duration::from_secs(42));
    }

    #[test]
    fn overrides_retune_and_disable_rows() {
        let ov = overrides(&[
            (
                STORE_PROBE,
                TaskOverride {
                    schedule: Some("0 * * * * *".into()),
                    run_immediately: Some(false),
                    timeout_secs: Some(0),
                    priority: Some(1),
                    ..TaskOverride::default()
                },
            ),
            (
                LEASE_SWEEP,
                TaskOverride {
                    enabled: false,
                    ..TaskOverride::default()
                },
            ),
        ]);

        let resolved = resolve(&ov, &RegisterOptions::default()).unwrap();
        assert_eq!(resolved.len(), 2);
        let probe = resolved.iter().find(|t| t.name == STORE_PROBE).unwrap();
        assert_eq!(probe.schedule.expr(), "0 * * * * *");
        assert!(!probe.options.run_immediately);
        assert_eq!(probe.options.timeout, None);
        assert_eq!(probe.options.priority, 1);
    }

    #[test]
    fn invalid_override_schedule_is_fatal() {
        let ov = overrides(&[(
            SCHEDULER_STATS,
            TaskOverride {
                schedule: Some("every minute".into()),
                ..TaskOverride::default()
            },
        )]);
        let err = resolve(&ov, &RegisterOptions::default()).unwrap_err();
        assert!(format!("{err:#}").contains("scheduler-stats"));
    }

    async fn run_once(
        scheduler: &Scheduler,
        rx: &mut mpsc::Receiver<ExecutionRecord>,
        name: &str,
    ) -> ExecutionRecord {
        scheduler.run_task(name).unwrap();
        rx.recv().await.unwrap()
    }

    #[tokio::test]
    async fn builtin_handlers_succeed_against_a_memory_store() {
        let (tx, mut rx) = mpsc::channel(16);
        let store = StoreHandle::Memory(MemoryStore::new());
        let scheduler = Scheduler::builder()
            .distributed_lock_shared(store.lease_store())
            .record_sink(tx)
            .build();

        let names = register_builtin(&scheduler, &store, &BTreeMap::new()).unwrap();
        assert_eq!(names.len(), 3);
        assert!(matches!(
            register_builtin(&scheduler, &store, &BTreeMap::new()),
            Err(e) if format!("{e:#}").contains("already registered")
        ));

        for name in [LEASE_SWEEP, STORE_PROBE, SCHEDULER_STATS] {
            let record = run_once(&scheduler, &mut rx, name).await;
            assert_eq!(record.outcome, Outcome::Success, "{name}: {:?}", record.error);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lease_sweep_purges_expired_rows() {
        let (tx, mut rx) = mpsc::channel(16);
        let memory = MemoryStore::new();
        let store = StoreHandle::Memory(memory.clone());
        let scheduler = Scheduler::builder().record_sink(tx).build();
        register_builtin(&scheduler, &store, &BTreeMap::new()).unwrap();

        let stale = LeaseLock::new(memory.clone());
        let guard = stale
            .try_acquire("scheduler:lock:abandoned", Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        std::mem::forget(guard);
        tokio::time::advance(Duration::from_secs(2)).await;

        let record = run_once(&scheduler, &mut rx, LEASE_SWEEP).await;
        assert_eq!(record.outcome, Outcome::Success);
        assert_eq!(memory.purge_expired(), 0);
    }
}
