use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use llm_session_service::{AppConfig, AppState, ModelRegistry, SessionTable, router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!(
        models = ?config.models,
        default_model = %config.default_model,
        slots = config.generation_slots,
        "initialising model registry"
    );

    let registry = Arc::new(ModelRegistry::initialize(config.as_ref())?);
    let state = AppState::new(config.clone(), registry);
    let sessions = state.sessions.clone();
    let router = router(state);

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "HTTP and WebSocket server ready");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(sessions))
        .await?;

    Ok(())
}

async fn shutdown_signal(sessions: Arc<SessionTable>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!(
        connections = sessions.connection_count(),
        "shutting down, closing open sessions"
    );
    sessions.cancel_all();
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,axum::rejection=trace".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
