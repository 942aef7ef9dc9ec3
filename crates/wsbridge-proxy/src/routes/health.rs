//! `GET /healthz`, served on its own listener (`health_addr`) rather than the
//! front door, so it's reachable without admission (spec.md §6 names the
//! probe as an external collaborator; spec.md §9 names "health address" as
//! its own restart-requiring bind target).

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
struct Health {
    status: &'static str,
    active_connections: u64,
    total_connections: u64,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Health> {
    Json(Health {
        status: "ok",
        active_connections: state.connections.active(),
        total_connections: state.connections.total(),
    })
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/healthz", get(health))
}
