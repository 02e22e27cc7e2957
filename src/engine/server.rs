// Hearth Agent Engine — Inbound HTTP Surface
//
// The seam the orchestrator calls. Transport adapters (chat, mail) live on
// the orchestrator side; this surface only accepts routed messages and a
// few operator controls. Turns resolve to JSON — errors ride inside the
// reply object, never as a 5xx with a stack trace.

use crate::engine::agent_loop::ConversationEngine;
use crate::engine::heartbeat;
use crate::engine::trace::TraceContext;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use log::info;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

#[derive(Debug, Deserialize)]
struct MessageIn {
    conversation_id: String,
    message: String,
    #[serde(default)]
    trace_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HaltIn {
    halted: bool,
}

pub fn router(engine: Arc<ConversationEngine>) -> Router {
    Router::new()
        .route("/message", post(handle_message))
        .route("/health", get(health))
        .route("/halt", post(set_halt))
        .route("/resume", post(resume_cost))
        .route("/backfill", post(run_backfill))
        .layer(CorsLayer::permissive())
        .with_state(engine)
}

async fn handle_message(
    State(engine): State<Arc<ConversationEngine>>,
    Json(body): Json<MessageIn>,
) -> Json<Value> {
    let trace = TraceContext::from_incoming(body.trace_id);
    info!(
        "[server] Message for {} ({} chars, trace={})",
        body.conversation_id,
        body.message.len(),
        trace.short()
    );
    let reply = engine.handle_message(&body.conversation_id, &body.message, &trace).await;
    Json(json!(reply))
}

async fn health(State(engine): State<Arc<ConversationEngine>>) -> Json<Value> {
    let catalog_age_secs = {
        let catalog = engine.state.catalog.lock();
        catalog.fetched_at.map(|at| at.elapsed().as_secs())
    };
    let index_ready = engine.state.tool_index.lock().await.is_ready();
    Json(json!({
        "agent_id": engine.state.config.agent_id,
        "halted": engine.state.is_halted(),
        "breaker_tripped": engine.state.breaker.is_tripped(),
        "cost_paused": engine.state.cost.paused().map(|p| p.reason),
        "hour_tokens": engine.state.cost.hour_total(),
        "catalog_age_secs": catalog_age_secs,
        "tool_index_ready": index_ready,
    }))
}

async fn set_halt(
    State(engine): State<Arc<ConversationEngine>>,
    Json(body): Json<HaltIn>,
) -> Json<Value> {
    engine.state.halt.store(body.halted, Ordering::SeqCst);
    info!("[server] Halt flag set to {}", body.halted);
    Json(json!({ "halted": body.halted }))
}

async fn resume_cost(State(engine): State<Arc<ConversationEngine>>) -> Json<Value> {
    engine.state.cost.resume(true);
    info!("[server] Cost monitor resumed (window reset)");
    Json(json!({ "resumed": true }))
}

/// Event-triggered conversation backfill: extract facts from unprocessed
/// historical conversations in the background.
async fn run_backfill(State(engine): State<Arc<ConversationEngine>>) -> Json<Value> {
    let engine_clone = engine.clone();
    tokio::spawn(async move {
        let trace = TraceContext::new();
        match heartbeat::backfill_conversations(&engine_clone, &trace).await {
            Ok(total) => info!("[server] Backfill finished: {} conversation(s)", total),
            Err(e) => log::warn!("[server] Backfill failed: {}", e),
        }
    });
    Json(json!({ "started": true }))
}
