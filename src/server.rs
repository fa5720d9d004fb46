use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{routing::{get, post}, Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{info, warn};

use crate::agent::engine::Services;
use crate::agent::tools::ToolRegistry;
use crate::connection::{handle_socket, ConnectionRegistry};
use crate::image_store::{ImageStore, ImageStoreError};
use crate::models::GeminiClient;
use crate::search::TavilyClient;
use crate::settings::EffectiveSettings;

const UPLOAD_LIMIT_BYTES: usize = 25 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub services: Services,
    pub connections: ConnectionRegistry,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(services: Services, metrics: Option<PrometheusHandle>) -> Self {
        Self { services, connections: ConnectionRegistry::new(), metrics }
    }

    /// Wire the production Gemini and Tavily clients from settings.
    pub fn from_settings(settings: EffectiveSettings, metrics: Option<PrometheusHandle>) -> anyhow::Result<Self> {
        let images = ImageStore::new(&settings.static_dir)?;
        let model = GeminiClient::new(settings.model_base_url.clone(), settings.gemini_api_key.clone(), settings.model_timeout);
        let search = TavilyClient::new(
            settings.search_base_url.clone(),
            settings.tavily_api_key.clone(),
            settings.search_depth.clone(),
        );
        let services = Services {
            model: Arc::new(model),
            search: Arc::new(search),
            tools: Arc::new(ToolRegistry::with_default_tools()),
            images,
            settings: Arc::new(settings),
        };
        Ok(Self::new(services, metrics))
    }
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    /// Reference to send back as `{"file_path": ...}` to start a session.
    pub file_path: String,
    pub url: String,
}

async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, (StatusCode, String)> {
    while let Some(field) = multipart.next_field().await.map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))? {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("upload").to_string();
        let bytes = field.bytes().await.map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
        let reference = state.services.images.save_upload(&file_name, &bytes).map_err(|e| match e {
            ImageStoreError::Io(_) | ImageStoreError::Encode { .. } => {
                warn!(error = %e, "upload could not be stored");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
            other => (StatusCode::UNPROCESSABLE_ENTITY, other.to_string()),
        })?;
        info!(image = %reference.id, dimensions = %reference.dimensions, "image uploaded");
        return Ok(Json(UploadResponse { url: reference.url(), file_path: reference.id }));
    }
    Err((StatusCode::BAD_REQUEST, "missing multipart field `file`".into()))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.services, state.connections))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "model": state.services.settings.model,
        "connections": state.connections.len().await,
    }))
}

async fn metrics(State(state): State<AppState>) -> Result<String, StatusCode> {
    state.metrics.as_ref().map(|h| h.render()).ok_or(StatusCode::NOT_FOUND)
}

pub fn router(state: AppState) -> Router {
    let static_root = state.services.images.root().to_path_buf();
    Router::new()
        .route("/upload", post(upload).layer(DefaultBodyLimit::max(UPLOAD_LIMIT_BYTES)))
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .nest_service("/static", ServeDir::new(static_root))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}
