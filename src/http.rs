//! Minimal admin HTTP surface: liveness and a coarse status snapshot.
//! The full fleet-management REST API is out of scope for this crate.

use crate::Panel;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn router(panel: Arc<Panel>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(panel)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct StatusResponse {
    node_count: usize,
    group_count: usize,
    health_checker_running: bool,
    in_flight_migrations: usize,
}

async fn status(State(panel): State<Arc<Panel>>) -> impl IntoResponse {
    let nodes = panel.node_service.list().await;
    let groups = panel.group_service.list().await;
    Json(StatusResponse {
        node_count: nodes.len(),
        group_count: groups.len(),
        health_checker_running: panel.health_checker.is_running(),
        in_flight_migrations: panel.failover.in_flight_migrations(),
    })
}
