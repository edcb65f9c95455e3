//! # Queue Warden HTTP Service
//!
//! HTTP surface over the configured broker bindings. Routes mirror the
//! paths the existing UI clients call: list brokers, list queues, list
//! messages, purge, delete one or many, move one or many. Responses are
//! pretty-printed JSON.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use broker_runtime::{Broker, BrokerAdapter, BrokerError};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, future::Future, net::SocketAddr, sync::Arc, time::Duration};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

// ============================================================================
// Application State
// ============================================================================

/// Broker bindings by name.
pub type AdapterMap = HashMap<String, Arc<dyn BrokerAdapter>>;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    adapters: Arc<AdapterMap>,
    request_timeout: Duration,
}

impl AppState {
    pub fn new(adapters: AdapterMap, request_timeout: Duration) -> Self {
        Self {
            adapters: Arc::new(adapters),
            request_timeout,
        }
    }

    fn adapter(&self, broker_id: &str) -> Result<Arc<dyn BrokerAdapter>, ApiError> {
        self.adapters
            .get(broker_id)
            .cloned()
            .ok_or_else(|| ApiError::UnknownBroker(broker_id.to_string()))
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Upper bound on a single request, covering the full drain an
    /// operation may perform.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    1355
}

fn default_request_timeout_seconds() -> u64 {
    300
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_seconds: default_request_timeout_seconds(),
        }
    }
}

/// Errors from server startup.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Failed to bind {address}: {message}")]
    BindFailed { address: String, message: String },

    #[error("HTTP server failed: {message}")]
    ServerFailed { message: String },
}

// ============================================================================
// Error mapping
// ============================================================================

/// One request's terminal failure, mapped onto the legacy status scheme:
/// 400 for bad or missing identifiers, 404 for an unknown broker binding,
/// 504 for an operation that outran the request timeout, 500 for
/// everything the backend reports.
#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("No connection found for {0}")]
    UnknownBroker(String),

    #[error(transparent)]
    Backend(#[from] BrokerError),

    /// Multi-item failure: one string per failed target.
    #[error("{} item(s) failed", .0.len())]
    BackendList(Vec<String>),

    #[error("Operation timed out")]
    Timeout,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(message) => pretty_json(StatusCode::BAD_REQUEST, &message),
            Self::UnknownBroker(broker) => pretty_json(
                StatusCode::NOT_FOUND,
                &format!("No connection found for {broker}"),
            ),
            Self::Backend(error) => {
                pretty_json(StatusCode::INTERNAL_SERVER_ERROR, &error.to_string())
            }
            Self::BackendList(errors) => pretty_json(StatusCode::INTERNAL_SERVER_ERROR, &errors),
            Self::Timeout => pretty_json(
                StatusCode::GATEWAY_TIMEOUT,
                &"Operation timed out".to_string(),
            ),
        }
    }
}

/// Serialize with indentation, matching the wire format the UI clients
/// already parse.
fn pretty_json<T: Serialize>(status: StatusCode, value: &T) -> Response {
    match serde_json::to_string_pretty(value) {
        Ok(body) => (
            status,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Response serialization failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create HTTP router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/brokers", get(list_brokers))
        .route("/brokers/{broker_id}/queues", get(list_queues))
        .route(
            "/brokers/{broker_id}/queues/{queue_name}",
            delete(purge_queue),
        )
        .route(
            "/brokers/{broker_id}/queues/{queue_name}/messages",
            get(list_messages).delete(delete_messages),
        )
        .route(
            "/brokers/{broker_id}/queues/{queue_name}/messages/{message_id}",
            delete(delete_message),
        )
        .route(
            "/brokers/{broker_id}/queues/{queue_name}/toqueue/{to_queue_name}/messages",
            post(move_messages),
        )
        .route(
            "/brokers/{broker_id}/queues/{queue_name}/toqueue/{to_queue_name}/messages/{message_id}",
            post(move_message),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                // TODO lock CORS down to the UI's domains
                .layer(CorsLayer::permissive())
                .into_inner(),
        )
        .with_state(state)
}

/// Start HTTP server with graceful shutdown on SIGINT/SIGTERM.
pub async fn start_server(config: ServerConfig, adapters: AdapterMap) -> Result<(), ServiceError> {
    let state = AppState::new(
        adapters,
        Duration::from_secs(config.request_timeout_seconds),
    );
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e: std::net::AddrParseError| ServiceError::BindFailed {
            address: format!("{}:{}", config.host, config.port),
            message: e.to_string(),
        })?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ServiceError::BindFailed {
            address: addr.to_string(),
            message: e.to_string(),
        })?;

    info!("Starting HTTP server on {}", addr);

    let shutdown_signal = async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C signal handler");
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => error!(error = %e, "Failed to install SIGTERM signal handler"),
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT, initiating graceful shutdown"),
            _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .map_err(|e| ServiceError::ServerFailed {
            message: e.to_string(),
        })?;

    info!("HTTP server shutdown complete");
    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

/// Request body for the multi-item delete and move operations.
#[derive(Debug, Deserialize)]
struct MessageIdsRequest {
    #[serde(rename = "messageIDs")]
    message_ids: Vec<String>,
}

impl MessageIdsRequest {
    fn validated(self) -> Result<Vec<String>, ApiError> {
        if self.message_ids.is_empty() {
            return Err(ApiError::BadRequest("no message IDs given".to_string()));
        }
        Ok(self.message_ids)
    }
}

/// Bound one backend call by the configured request timeout. The
/// operation runs on its own task and always runs to completion, so a
/// drain that outlives the deadline still returns every message it holds
/// to its queue; only the wait for the result is abandoned here.
async fn bounded<T: Send + 'static>(
    state: &AppState,
    operation: impl Future<Output = T> + Send + 'static,
) -> Result<T, ApiError> {
    let task = tokio::spawn(operation);
    match tokio::time::timeout(state.request_timeout, task).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ApiError::Backend(BrokerError::transport(format!(
            "operation task failed: {e}"
        )))),
        Err(_) => Err(ApiError::Timeout),
    }
}

fn multi_result(errors: Vec<BrokerError>) -> Result<Response, ApiError> {
    if errors.is_empty() {
        Ok(pretty_json(StatusCode::OK, &()))
    } else {
        Err(ApiError::BackendList(
            errors.iter().map(ToString::to_string).collect(),
        ))
    }
}

async fn list_brokers(State(state): State<AppState>) -> Result<Response, ApiError> {
    let mut brokers: Vec<Broker> = state
        .adapters
        .keys()
        .map(|name| Broker::new(name, HashMap::new()))
        .collect();
    brokers.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(pretty_json(StatusCode::OK, &brokers))
}

async fn list_queues(
    State(state): State<AppState>,
    Path(broker_id): Path<String>,
) -> Result<Response, ApiError> {
    let adapter = state.adapter(&broker_id)?;
    let queues = bounded(&state, async move { adapter.get_all_queues().await }).await??;
    Ok(pretty_json(StatusCode::OK, &queues))
}

async fn list_messages(
    State(state): State<AppState>,
    Path((broker_id, queue_name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let adapter = state.adapter(&broker_id)?;
    let messages = bounded(&state, async move {
        adapter.get_all_messages(&queue_name).await
    })
    .await??;
    Ok(pretty_json(StatusCode::OK, &messages))
}

async fn purge_queue(
    State(state): State<AppState>,
    Path((broker_id, queue_name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let adapter = state.adapter(&broker_id)?;
    bounded(&state, async move { adapter.purge(&queue_name).await }).await??;
    Ok(pretty_json(StatusCode::OK, &()))
}

async fn delete_message(
    State(state): State<AppState>,
    Path((broker_id, queue_name, message_id)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    let adapter = state.adapter(&broker_id)?;
    bounded(&state, async move {
        adapter.delete_one(&queue_name, &message_id).await
    })
    .await??;
    Ok(pretty_json(StatusCode::OK, &()))
}

async fn delete_messages(
    State(state): State<AppState>,
    Path((broker_id, queue_name)): Path<(String, String)>,
    Json(request): Json<MessageIdsRequest>,
) -> Result<Response, ApiError> {
    let message_ids = request.validated()?;
    let adapter = state.adapter(&broker_id)?;
    let errors = bounded(&state, async move {
        adapter.delete_many(&queue_name, &message_ids).await
    })
    .await?;
    multi_result(errors)
}

async fn move_message(
    State(state): State<AppState>,
    Path((broker_id, queue_name, to_queue_name, message_id)): Path<(
        String,
        String,
        String,
        String,
    )>,
) -> Result<Response, ApiError> {
    let adapter = state.adapter(&broker_id)?;
    bounded(&state, async move {
        adapter
            .move_one(&queue_name, &to_queue_name, &message_id)
            .await
    })
    .await??;
    Ok(pretty_json(StatusCode::OK, &()))
}

async fn move_messages(
    State(state): State<AppState>,
    Path((broker_id, queue_name, to_queue_name)): Path<(String, String, String)>,
    Json(request): Json<MessageIdsRequest>,
) -> Result<Response, ApiError> {
    let message_ids = request.validated()?;
    let adapter = state.adapter(&broker_id)?;
    let errors = bounded(&state, async move {
        adapter
            .move_many(&queue_name, &to_queue_name, &message_ids)
            .await
    })
    .await?;
    multi_result(errors)
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
