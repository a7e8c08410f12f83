use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tickward_scheduler::{ExecutionRecord, Scheduler};
use tokio::sync::mpsc;
use tracing::debug;

use crate::store::StoreHandle;

/// Shared state handed to every Axum handler.
pub struct AppState {
    pub scheduler: Scheduler,
    pub store: StoreHandle,
    pub started_at: DateTime<Utc>,
    /// Latest execution record per task, fed by the scheduler's record sink.
    pub last_runs: DashMap<String, ExecutionRecord>,
}

impl AppState {
    pub fn new(scheduler: Scheduler, store: StoreHandle) -> Self {
        Self {
            scheduler,
            store,
            started_at: Utc::now(),
            last_runs: DashMap::new(),
        }
    }

    pub fn record(&self, record: ExecutionRecord) {
        self.last_runs.insert(record.task_name.clone(), record);
    }
}

/// Consume execution records until every sender is gone.
pub fn spawn_record_collector(state: Arc<AppState>, mut rx: mpsc::Receiver<ExecutionRecord>) {
    tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            state.record(record);
        }
        debug!("record sink closed");
    });
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/tasks", get(crate::http::tasks::list_tasks))
        .route("/tasks/{name}", get(crate::http::tasks::get_task))
        .route("/tasks/{name}/run", post(crate::http::tasks::run_task))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
