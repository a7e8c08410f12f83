use std::collections::BTreeMap;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 18790;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_LEASE_SECS: u64 = 300; // 5 minutes
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_IDLE_POLL_SECS: u64 = 60; // loop wake-up when nothing is registered
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Top-level config (tickward.toml + TICKWARD_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickwardConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Per-task overrides for the static task table, keyed by task name.
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Coordinate ticks across instances through the shared lease store.
    /// When false, mutual exclusion is in-process only.
    #[serde(default = "bool_true")]
    pub distributed_lock: bool,
    #[serde(default = "default_lease_secs")]
    pub default_lease_secs: u64,
    /// 0 disables the execution timeout.
    #[serde(default)]
    pub default_timeout_secs: u64,
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    #[serde(default = "default_idle_poll_secs")]
    pub idle_poll_secs: u64,
}

impl SchedulerConfig {
    pub fn default_lease(&self) -> Duration {
        Duration::from_secs(self.default_lease_secs)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        (self.default_timeout_secs > 0).then(|| Duration::from_secs(self.default_timeout_secs))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_secs(self.idle_poll_secs.max(1))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            distributed_lock: true,
            default_lease_secs: DEFAULT_LEASE_SECS,
            default_timeout_secs: 0,
            drain_timeout_secs: DEFAULT_DRAIN_TIMEOUT_SECS,
            idle_poll_secs: DEFAULT_IDLE_POLL_SECS,
        }
    }
}

/// Backend holding the leases shared by every instance of the fleet.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StoreKind {
    /// Process-local map. Only useful for single-instance deployments and tests.
    Memory,
    /// SQLite file shared by all instances on the same host or volume.
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_kind")]
    pub kind: StoreKind,
    #[serde(default = "default_store_path")]
    pub path: String,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: default_store_kind(),
            path: default_store_path(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

/// Override for one row of the static task table. Unset fields keep the
/// built-in defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOverride {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    pub schedule: Option<String>,
    pub run_immediately: Option<bool>,
    pub lease_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub priority: Option<i32>,
}

impl Default for TaskOverride {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule: None,
            run_immediately: None,
            lease_secs: None,
            timeout_secs: None,
            priority: None,
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_lease_secs() -> u64 {
    DEFAULT_LEASE_SECS
}
fn default_drain_timeout_secs() -> u64 {
    DEFAULT_DRAIN_TIMEOUT_SECS
}
fn default_idle_poll_secs() -> u64 {
    DEFAULT_IDLE_POLL_SECS
}
fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
fn default_store_kind() -> StoreKind {
    StoreKind::Sqlite
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_store_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tickward/leases.db", home)
}

impl TickwardConfig {
    /// Load config from a TOML file with TICKWARD_* env var overrides.
    ///
    /// Path resolution: explicit argument, else ~/.tickward/tickward.toml.
    /// Nested keys are addressed with a double underscore, e.g.
    /// `TICKWARD_SCHEDULER__DISTRIBUTED_LOCK=false`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("TICKWARD_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tickward/tickward.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = TickwardConfig::load(Some("/nonexistent/tickward.toml")).unwrap();
        assert!(cfg.scheduler.distributed_lock);
        assert_eq!(cfg.scheduler.default_lease(), Duration::from_secs(300));
        assert_eq!(cfg.scheduler.default_timeout(), None);
        assert_eq!(cfg.store.kind, StoreKind::Sqlite);
        assert_eq!(cfg.gateway.port, DEFAULT_PORT);
        assert!(cfg.tasks.is_empty());
    }

    #[test]
    fn file_values_and_task_overrides_are_read() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[scheduler]
distributed_lock = false
default_timeout_secs = 45

[store]
kind = "memory"

[tasks.lease-sweep]
schedule = "0 */5 * * * *"
priority = 3

[tasks.store-probe]
enabled = false
"#
        )
        .unwrap();

        let cfg = TickwardConfig::load(file.path().to_str()).unwrap();
        assert!(!cfg.scheduler.distributed_lock);
        assert_eq!(cfg.scheduler.default_timeout(), Some(Duration::from_secs(45)));
        assert_eq!(cfg.store.kind, StoreKind::Memory);

        let sweep = &cfg.tasks["lease-sweep"];
        assert!(sweep.enabled);
        assert_eq!(sweep.schedule.as_deref(), Some("0 */5 * * * *"));
        assert_eq!(sweep.priority, Some(3));
        assert!(!cfg.tasks["store-probe"].enabled);
    }

    #[test]
    fn unknown_store_kind_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[store]\nkind = \"redis\"").unwrap();
        let err = TickwardConfig::load(file.path().to_str()).unwrap_err();
        assert!(err.to_string().starts_with("Configuration error"));
    }
}
