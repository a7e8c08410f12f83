use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use serde_json::{json, Value};

use crate::app::AppState;

/// GET /health: 200 while the scheduling loop is alive, 503 otherwise.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let scheduler = &state.scheduler;
    let healthy = scheduler.health_check();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = json!({
        "status": if healthy { "ok" } else { "unavailable" },
        "version": env!("CARGO_PKG_VERSION"),
        "commit": env!("TICKWARD_GIT_SHA"),
        "scheduler": scheduler.state(),
        "distributed_lock": scheduler.is_distributed(),
        "store": state.store.kind(),
        "tasks": scheduler.list_all().len(),
        "in_flight": scheduler.in_flight(),
        "uptime_secs": (Utc::now() - state.started_at).num_seconds(),
    });
    (status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tickward_scheduler::{MemoryStore, Scheduler};

    use crate::store::StoreHandle;

    #[tokio::test]
    async fn reports_unavailable_until_started_and_after_stop() {
        let scheduler = Scheduler::new();
        let state = Arc::new(AppState::new(
            scheduler.clone(),
            StoreHandle::Memory(MemoryStore::new()),
        ));

        let (status, Json(body)) = health_handler(State(state.clone())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["scheduler"], "created");

        scheduler.start().unwrap();
        let (status, Json(body)) = health_handler(State(state.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["store"], "memory");

        scheduler.stop().await;
        let (status, Json(body)) = health_handler(State(state)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["scheduler"], "stopped");
    }
}
