//! Dashboard snapshot: queue depth, runner fleet and recent decisions.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use fleet_common::DashboardData;

use crate::AppState;

/// `GET /api/v1/dashboard`
pub async fn dashboard(State(state): State<Arc<AppState>>) -> Json<DashboardData> {
    Json(DashboardData {
        session_queue: state.queue.snapshot(),
        runners: state.scheduler.runner_states().await,
        global_scheduling_decisions: state.scheduler.global_decisions(),
    })
}
