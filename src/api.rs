//! Read-only HTTP endpoints served next to the websocket upgrade.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};

use crate::context::GatewayContext;

pub fn routes() -> Router<Arc<GatewayContext>> {
    Router::new()
        .route("/health", get(health))
        .route("/connections", get(connections))
        .route("/info", get(info))
}

async fn health(State(ctx): State<Arc<GatewayContext>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "agent-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": ctx.counts(),
    }))
}

async fn connections(State(ctx): State<Arc<GatewayContext>>) -> Json<Value> {
    Json(ctx.registry.lock().snapshot())
}

async fn info(State(ctx): State<Arc<GatewayContext>>) -> Json<Value> {
    Json(ctx.info())
}
