//! Task introspection and manual trigger endpoints.
//!
//! - `GET /tasks`: every registered task, ordered by name
//! - `GET /tasks/{name}`: one task plus its latest execution record
//! - `POST /tasks/{name}/run`: out-of-band run through the usual lease

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use tickward_scheduler::{ExecutionRecord, SchedulerError, TaskInfo};
use tracing::{info, warn};

use crate::app::AppState;

type ApiError = (StatusCode, Json<Value>);

#[derive(Serialize)]
pub struct TaskList {
    pub tasks: Vec<TaskInfo>,
}

#[derive(Serialize)]
pub struct TaskDetail {
    #[serde(flatten)]
    pub info: TaskInfo,
    pub last_run: Option<ExecutionRecord>,
}

/// GET /tasks
pub async fn list_tasks(State(state): State<Arc<AppState>>) -> Json<TaskList> {
    let mut tasks: Vec<TaskInfo> = state.scheduler.get_all_tasks_info().into_values().collect();
    tasks.sort_by(|a, b| a.name.cmp(&b.name));
    Json(TaskList { tasks })
}

/// GET /tasks/{name}
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<TaskDetail>, ApiError> {
    let info = state.scheduler.get_task_info(&name).map_err(scheduler_error)?;
    let last_run = state.last_runs.get(&name).map(|r| r.value().clone());
    Ok(Json(TaskDetail { info, last_run }))
}

/// POST /tasks/{name}/run: 202 once the run is dispatched. The outcome shows
/// up later in `last_run`.
pub async fn run_task(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    state.scheduler.run_task(&name).map_err(scheduler_error)?;
    info!(task = %name, "manual run accepted via HTTP");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"accepted": true, "task": name})),
    ))
}

fn scheduler_error(err: SchedulerError) -> ApiError {
    let status = match err {
        SchedulerError::UnknownTask { .. } => StatusCode::NOT_FOUND,
        SchedulerError::SchedulerStopped => StatusCode::SERVICE_UNAVAILABLE,
        SchedulerError::InvalidSchedule { .. } | SchedulerError::DuplicateTask { .. } => {
            StatusCode::BAD_REQUEST
        }
    };
    if status != StatusCode::NOT_FOUND {
        warn!(error = %err, "task request rejected");
    }
    (status, Json(json!({"error": err.to_string()})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tickward_scheduler::{MemoryStore, Outcome, Scheduler, TaskContext};
    use tokio::sync::mpsc;

    use crate::app::spawn_record_collector;
    use crate::store::StoreHandle;

    fn state_with(scheduler: &Scheduler) -> Arc<AppState> {
        Arc::new(AppState::new(
            scheduler.clone(),
            StoreHandle::Memory(MemoryStore::new()),
        ))
    }

    fn noop(_ctx: TaskContext) -> impl std::future::Future<Output = anyhow::Result<()>> + Send {
        async { Ok(()) }
    }

    #[tokio::test]
    async fn list_is_sorted_by_name() {
        let scheduler = Scheduler::new();
        for name in ["zeta", "alpha", "mid"] {
            scheduler.register(name, "0 0 * * * *", noop).unwrap();
        }
        let Json(list) = list_tasks(State(state_with(&scheduler))).await;
        let names: Vec<_> = list.tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn unknown_task_is_404() {
        let state = state_with(&Scheduler::new());
        let err = get_task(State(state.clone()), Path("ghost".into())).await.err().unwrap();
        assert_eq!(err.0, StatusCode::NOT_FOUND);

        let err = run_task(State(state), Path("ghost".into())).await.unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn run_after_stop_is_503() {
        let scheduler = Scheduler::new();
        scheduler.register("ping", "0 0 * * * *", noop).unwrap();
        scheduler.stop().await;

        let err = run_task(State(state_with(&scheduler)), Path("ping".into()))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn manual_run_is_accepted_and_recorded() {
        let (tx, rx) = mpsc::channel(8);
        let scheduler = Scheduler::builder().record_sink(tx).build();
        scheduler.register("ping", "0 0 * * * *", noop).unwrap();
        let state = state_with(&scheduler);
        spawn_record_collector(state.clone(), rx);

        let (status, Json(body)) = run_task(State(state.clone()), Path("ping".into())).await.unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["task"], "ping");

        let mut detail = None;
        for _ in 0..50 {
            let Json(d) = get_task(State(state.clone()), Path("ping".into())).await.unwrap();
            if d.last_run.is_some() {
                detail = Some(d);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let detail = detail.expect("record never arrived");
        assert_eq!(detail.info.name, "ping");
        assert_eq!(detail.last_run.unwrap().outcome, Outcome::Success);
    }
}
