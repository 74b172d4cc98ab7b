use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade, rejection::JsonRejection},
    response::IntoResponse,
    routing::{get, post},
};
use futures::StreamExt;
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    config::AppConfig,
    connection,
    encoder::{self, SessionMode},
    error::ServiceError,
    model::{ModelMetadata, ModelRegistry},
    params::{RawParameters, ValidationError},
    protocol::{GenerateRequest, HttpGenerateRequest, OpenSessionRequest, Reply, Response},
    session::{GenerationSlots, InferenceSession, SessionTable},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<ModelRegistry>,
    pub slots: Arc<GenerationSlots>,
    pub sessions: Arc<SessionTable>,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, registry: Arc<ModelRegistry>) -> Self {
        let slots = Arc::new(GenerationSlots::new(config.generation_slots, config.slot_scope));
        Self {
            slots,
            sessions: SessionTable::new(),
            registry,
            config,
        }
    }
}

#[derive(Serialize)]
struct MetadataResponse {
    default_model: String,
    models: Vec<ModelMetadata>,
    max_length_ceiling: usize,
    session_idle_timeout_secs: u64,
    connections: usize,
    active_sessions: usize,
    generation_slots: usize,
    free_generation_slots: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/generate", post(generate_one_shot))
        .route("/api/v2/generate", get(generate_streaming))
        .route("/metadata", get(metadata))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn health() -> &'static str {
    "ok"
}

async fn generate_one_shot(
    State(state): State<AppState>,
    body: Result<Json<HttpGenerateRequest>, JsonRejection>,
) -> Result<Json<Response>, ServiceError> {
    let Json(request) = body.map_err(|e| ValidationError::Malformed(e.body_text()))?;
    let outputs = run_one_shot(&state, request).await?;
    Ok(Json(Response::Success(Reply::Outputs(outputs))))
}

/// Runs a request through an ephemeral session: open, one generate cycle,
/// discard. Nothing partial escapes on failure.
pub async fn run_one_shot(
    state: &AppState,
    request: HttpGenerateRequest,
) -> Result<String, ServiceError> {
    let HttpGenerateRequest { inputs, params } = request;
    let open = OpenSessionRequest {
        model: params.model.clone(),
        max_length: params.max_length,
        max_new_tokens: params.max_new_tokens,
    };
    // The length constraint is carried by the session; the cycle runs to
    // the session budget.
    let generate = GenerateRequest {
        inputs,
        stop_sequence: None,
        params: RawParameters {
            max_length: None,
            max_new_tokens: None,
            ..params
        },
    };

    let mut session = InferenceSession::new();
    let session_id = session.open(
        &open,
        &state.registry,
        &state.slots,
        &state.config.generation,
    )?;
    let cycle = session.begin_generate(generate, &state.slots, &state.config.generation)?;

    let result = match encoder::encode(SessionMode::OneShot, cycle).next().await {
        Some(Ok(Reply::Outputs(outputs))) => Ok(outputs),
        Some(Ok(other)) => Err(ServiceError::Other(format!(
            "unexpected one-shot reply {other:?}"
        ))),
        Some(Err(err)) => Err(err),
        None => Err(ServiceError::Other("one-shot encoder produced no reply".into())),
    };
    session.close();

    if let Err(err) = &result {
        info!(%session_id, error = %err, "one-shot generation failed");
    }
    result
}

async fn generate_streaming(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::serve_socket(state, socket))
}

async fn metadata(State(state): State<AppState>) -> Json<MetadataResponse> {
    Json(MetadataResponse {
        default_model: state.registry.default_model().to_string(),
        models: state.registry.metadata(),
        max_length_ceiling: state.config.generation.max_length_ceiling,
        session_idle_timeout_secs: state.config.session_idle_timeout.as_secs(),
        connections: state.sessions.connection_count(),
        active_sessions: state.sessions.active_sessions(),
        generation_slots: state.slots.capacity(),
        free_generation_slots: state.slots.available(),
    })
}
