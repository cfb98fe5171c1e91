//! # Operator Routes
//!
//! Health, trigger catalog, subscription status and change ingest.

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use super::state::AppState;
use crate::enqueuer::{catalog, DocumentChange, SubscriptionInfo};

pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_handler))
        .route("/enqueuers", get(enqueuers_handler))
        .route("/subscriptions", get(subscriptions_handler))
        .route("/changes", post(changes_handler))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub replica_id: String,
    pub running_workers: usize,
    pub backlog: usize,
    pub subscriptions: usize,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionsResponse {
    pub subscriptions: Vec<SubscriptionInfo>,
    pub total: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        replica_id: state.replica_id.clone(),
        running_workers: state.scheduler.running(),
        backlog: state.scheduler.backlog(),
        subscriptions: state.enqueuers.subscriptions().len(),
    })
}

async fn enqueuers_handler(State(state): State<AppState>) -> Json<Value> {
    Json(catalog(&state.enqueuers))
}

async fn subscriptions_handler(State(state): State<AppState>) -> Json<SubscriptionsResponse> {
    let subscriptions = state.enqueuers.subscriptions();
    let total = subscriptions.len();
    Json(SubscriptionsResponse {
        subscriptions,
        total,
    })
}

async fn changes_handler(
    State(state): State<AppState>,
    Json(change): Json<DocumentChange>,
) -> (StatusCode, Json<Value>) {
    let collection = change.collection.clone();
    match state.feed.publish(change) {
        Ok(delivered) => {
            debug!(collection = %collection, delivered, "Change published");
            (StatusCode::ACCEPTED, Json(json!({ "delivered": delivered })))
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "message": e.to_string() })),
        ),
    }
}
