//! `tickward-scheduler`: cron-driven task scheduler with lease-based
//! per-tick mutual exclusion.
//!
//! # Overview
//!
//! Tasks are registered in memory under a unique name with a six-field cron
//! expression. The [`Scheduler`] loop sleeps until the earliest fire time,
//! claims every due tick and hands each one to the [`executor::Executor`],
//! which takes a lease on `scheduler:lock:<task>` before running the handler.
//! When several instances share a [`LeaseStore`], exactly one of them runs a
//! given tick; the others log a skip.
//!
//! # Lease backends
//!
//! | Backend         | Scope                                  |
//! |-----------------|----------------------------------------|
//! | [`MemoryStore`] | One process (tests, single instance)   |
//! | [`SqliteStore`] | Every instance sharing the SQLite file |
//!
//! # Cron format
//!
//! `sec min hour day-of-month month day-of-week`, evaluated in UTC. See
//! [`cron`] for the accepted syntax.

pub mod clock;
pub mod cron;
pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
pub mod lock;
pub mod registry;
pub mod store;
pub mod types;

pub use clock::{Clock, MonotonicClock, SystemClock};
pub use cron::{next_fire_time, CronSchedule};
pub use db::SqliteStore;
pub use engine::{EngineState, Scheduler, SchedulerBuilder, WeakScheduler};
pub use error::{LockError, Result, SchedulerError, StoreError};
pub use lock::{lock_key, LeaseGuard, LeaseLock};
pub use store::{LeaseStore, MemoryStore};
pub use types::{
    ExecutionRecord, Outcome, RegisterOptions, TaskContext, TaskDescriptor, TaskHandler, TaskInfo,
    Trigger,
};
