//! HTTP surface: the webhook receiver, the admin sync trigger, and a
//! health probe.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{error, info, warn};

use billmirror_core::{EntityKind, Reconciler};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/billing", post(receive_webhook))
        .route("/admin/sync", post(trigger_full_sync))
        .route("/admin/sync/{kind}", post(trigger_kind_sync))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "billmirror-api",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Receive one provider event. The fixed "OK"/"Err" bodies are what the
/// provider's delivery machinery expects; anything else counts as a
/// failed delivery and gets retried.
async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get("Stripe-Signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let event = match state.dispatcher.verify(&body, signature) {
        Ok(event) => event,
        Err(error) => {
            warn!(%error, "Rejected webhook payload");
            return (StatusCode::BAD_REQUEST, "Err").into_response();
        }
    };

    // Ack immediately; the refetch-and-apply runs after the response so a
    // slow provider API cannot time out the delivery.
    let dispatcher = state.dispatcher.clone();
    tokio::spawn(async move {
        if let Err(error) = dispatcher.dispatch(&event).await {
            error!(event_type = %event.event_type, %error, "Webhook dispatch failed");
        }
    });

    (StatusCode::OK, "OK").into_response()
}

async fn trigger_full_sync(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !authorized(&headers, &state.config.admin_api_token) {
        return unauthorized();
    }

    info!("Admin requested full sync");
    tokio::spawn(run_admin_sync(state.reconciler.clone(), None));
    (
        StatusCode::ACCEPTED,
        Json(json!({"status": "accepted", "scope": "all"})),
    )
        .into_response()
}

async fn trigger_kind_sync(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers, &state.config.admin_api_token) {
        return unauthorized();
    }

    let Some(kind) = EntityKind::parse(&kind) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("unknown entity kind: {kind}")})),
        )
            .into_response();
    };

    info!(kind = %kind, "Admin requested sync");
    tokio::spawn(run_admin_sync(state.reconciler.clone(), Some(kind)));
    (
        StatusCode::ACCEPTED,
        Json(json!({"status": "accepted", "scope": kind.as_str()})),
    )
        .into_response()
}

fn authorized(headers: &HeaderMap, admin_token: &str) -> bool {
    let presented = headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    bool::from(presented.as_bytes().ct_eq(admin_token.as_bytes()))
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "invalid admin token"})),
    )
        .into_response()
}

async fn run_admin_sync(reconciler: Arc<Reconciler>, kind: Option<EntityKind>) {
    match kind {
        Some(kind) => match reconciler.sync_kind(kind).await {
            Ok(report) => info!(%report, "Admin sync finished"),
            Err(error) => error!(kind = %kind, %error, "Admin sync failed"),
        },
        None => {
            let outcomes = reconciler.sync_all().await;
            let failed = outcomes.iter().filter(|o| !o.succeeded()).count();
            info!(kinds = outcomes.len(), failed, "Admin full sync finished");
        }
    }
}
