// Hearth Agent Engine — process shell.
//
// Startup order: env config → logging → shared state → collaborator
// clients → catalog + tool index (fail-soft) → playbook seeding →
// heartbeat → HTTP surface. Shutdown drains in-flight turns.

use hearth_agent::engine::agent_loop::ConversationEngine;
use hearth_agent::engine::config::EngineConfig;
use hearth_agent::engine::embedding::EmbeddingClient;
use hearth_agent::engine::heartbeat;
use hearth_agent::engine::orchestrator::HttpOrchestrator;
use hearth_agent::engine::provider::HttpModelClient;
use hearth_agent::engine::server;
use hearth_agent::engine::state::EngineState;
use hearth_agent::engine::trace::TraceContext;
use log::{info, warn};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), String> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = EngineConfig::from_env().map_err(|e| e.to_string())?;
    std::fs::create_dir_all(&config.data_dir).map_err(|e| e.to_string())?;
    info!(
        "[main] Hearth agent '{}' starting — data dir {}, orchestrator {}",
        config.agent_id,
        config.data_dir.display(),
        config.orchestrator_url
    );

    let listen_addr = config.listen_addr.clone();
    let state = Arc::new(EngineState::new(config.clone()).map_err(|e| e.to_string())?);
    let backend = Arc::new(HttpModelClient::new(&config));
    let host = Arc::new(HttpOrchestrator::new(&config));
    let embeddings = Arc::new(EmbeddingClient::new(&config));

    let engine = ConversationEngine::new(state.clone(), backend, host.clone(), embeddings);

    // First catalog fetch + index build. Both fail soft: an unreachable
    // orchestrator or embedding service degrades, it does not abort boot.
    engine.refresh_catalog_if_stale().await;

    let trace = TraceContext::new();
    match state.playbooks.seed_defaults(host.as_ref(), &trace).await {
        Ok((created, updated)) => {
            info!("[main] Playbooks seeded ({} created, {} updated)", created, updated)
        }
        Err(e) => warn!("[main] Playbook seeding deferred: {}", e),
    }

    let heartbeat_handle = heartbeat::spawn_heartbeat(engine.clone());

    let app = server::router(engine);
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .map_err(|e| format!("bind {listen_addr}: {e}"))?;
    info!("[main] Listening on {}", listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| e.to_string())?;

    heartbeat_handle.abort();
    info!("[main] Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("[main] Shutdown signal received — draining in-flight turns");
}
