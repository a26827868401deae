//! HTTP server and composition root
//!
//! Constructs the extractor, LLM clients, and pool in dependency order and
//! injects handles; no ambient globals. Serves the WebSocket upgrade, the
//! story endpoint, and the health/admin surface.

use crate::pool::ConnectionPool;
use crate::ws::handle_connection;
use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use signstream_core::config::AppConfig;
use signstream_llm::{AnalysisService, LlmClient, StoryGenerator, StoryRequest, StoryRequestError};
use signstream_media::CentroidExtractor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

pub struct AppState {
    pub config: AppConfig,
    pub pool: Arc<ConnectionPool>,
    pub story: StoryGenerator,
    pub started_at: Instant,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/ws", get(ws_handler))
        .route("/config", get(config_handler))
        .route("/stats", get(stats_handler))
        .route(
            "/api/asl-world/story/recognize_and_generate",
            post(story_handler),
        )
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .with_state(state)
}

/// Build the application and serve until SIGTERM/SIGINT, then drain the pool.
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let extractor = Arc::new(CentroidExtractor::new(config.extractor.detection_confidence));
    let llm = Arc::new(LlmClient::new(&config.llm));
    let analysis = Arc::new(AnalysisService::new(
        llm.clone(),
        config.llm.analysis_model.clone(),
    ));
    let story = StoryGenerator::new(llm, config.llm.story_model.clone());

    let pool = ConnectionPool::new(config.clone(), extractor, analysis);
    pool.start();

    let state = Arc::new(AppState {
        config: config.clone(),
        pool: pool.clone(),
        story,
        started_at: Instant::now(),
    });
    let app = build_router(state);

    let bind_addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address: {e}"))?;

    info!("Signstream v{} starting", env!("CARGO_PKG_VERSION"));
    info!("  Listening on: {}", bind_addr);
    info!("  WebSocket: ws://{}/ws", bind_addr);
    info!("  Story API: http://{}/api/asl-world/story/recognize_and_generate", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {bind_addr}: {e}"))?;

    let shutdown_pool = pool.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown_pool.shutdown().await;
    info!("Signstream stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!(error = %e, "failed to install SIGTERM handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn index_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": if state.pool.is_shutting_down() { "shutting_down" } else { "healthy" },
        "service": "signstream",
        "version": env!("CARGO_PKG_VERSION"),
        "active_connections": state.pool.active_connections(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

async fn config_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.config.safe_subset())
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "pool": state.pool.stats(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

async fn story_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StoryRequest>,
) -> impl IntoResponse {
    let topic = match request.resolve_topic() {
        Ok(topic) => topic,
        Err(e) => return story_validation_error(e),
    };

    let (stories, fallback_used) = state.story.generate(&topic).await;
    let mut body = serde_json::json!({
        "success": true,
        "stories": stories,
    });
    if fallback_used {
        body["user_message"] =
            "Story service is temporarily degraded; generated a practice story offline.".into();
    }
    (StatusCode::OK, Json(body))
}

fn story_validation_error(error: StoryRequestError) -> (StatusCode, Json<serde_json::Value>) {
    let user_message = match &error {
        StoryRequestError::ConflictingInputs => {
            "Please provide exactly one of: a picture, a word, or a custom topic."
        }
        StoryRequestError::Empty => "Please provide a picture, a word, or a custom topic.",
        StoryRequestError::PromptTooLong(_) => "That topic is too long; please shorten it.",
        StoryRequestError::InvalidFrameData => "The picture could not be read; please retake it.",
        StoryRequestError::FrameTooLarge(_) => "The picture is too large; please use a smaller one.",
    };
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({
            "success": false,
            "error_type": "validation_error",
            "user_message": user_message,
            "error": error.to_string(),
            "retry_allowed": true,
            "retry_delay_seconds": 0,
            "processing_stages": { "validation": "failed" },
        })),
    )
}
