//! HTTP-to-stdio bridge implementation

use crate::error::{BridgeError, Result};
use crate::relay::{Relay, RelayConfig};
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Request, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use futures::future::try_join_all;
use serde::Serialize;
use serde_json::Value;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Default ceiling on inbound HTTP request bodies, in bytes.
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Configuration for the HTTP bridge server.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Local address to bind the HTTP server to (e.g., `127.0.0.1:3000`).
    /// Use port 0 to bind to a random available port.
    pub bind_addr: SocketAddr,

    /// Path or name of the subprocess executable to spawn.
    pub command: String,

    /// Command-line arguments to pass to the subprocess.
    pub args: Vec<String>,

    /// Environment overlay merged over the inherited environment when
    /// spawning the subprocess. The overlay wins on key collision.
    pub env: Vec<(String, String)>,

    /// How long a relayed request may wait for a subprocess response.
    pub request_timeout: Duration,

    /// Inbound HTTP bodies larger than this are rejected with
    /// [`BridgeError::PayloadTooLarge`] before they are fully buffered.
    pub max_body_bytes: usize,
}

/// Shared state for the bridge
struct BridgeState {
    relay: Relay,
    max_body_bytes: usize,
}

/// Starts the HTTP bridge server and blocks until shutdown.
///
/// Spawns the subprocess, sets up the router, and binds to the configured
/// address.
///
/// # Port Binding
///
/// If `config.bind_addr` specifies port 0, the OS will assign a random
/// available port. The actual bound port is printed to stderr as
/// `TETHER_BOUND_PORT=<port>` to assist with test infrastructure
/// integration.
pub async fn start_bridge(config: BridgeConfig) -> Result<()> {
    info!("Starting HTTP bridge on {}", config.bind_addr);

    let relay = Relay::spawn(RelayConfig {
        command: config.command.clone(),
        args: config.args.clone(),
        env: config.env.clone(),
        request_timeout: config.request_timeout,
    })?;

    let state = Arc::new(BridgeState {
        relay,
        max_body_bytes: config.max_body_bytes,
    });
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .map_err(|e| BridgeError::HttpServer(format!("Failed to bind: {}", e)))?;

    let local_addr = listener
        .local_addr()
        .map_err(|e| BridgeError::HttpServer(format!("Failed to get local addr: {}", e)))?;

    info!("HTTP bridge listening on http://{}", local_addr);

    // Print machine-readable bound port for test infrastructure (always print, tests parse it)
    eprintln!("TETHER_BOUND_PORT={}", local_addr.port());

    axum::serve(listener, app)
        .await
        .map_err(|e| BridgeError::HttpServer(format!("Server error: {}", e)))?;

    Ok(())
}

fn build_router(state: Arc<BridgeState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .fallback(handle_rpc)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthStatus {
    ok: bool,
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(HealthStatus { ok: true })
}

/// Entry point for everything that is not the health check: POST bodies
/// are relayed to the subprocess, any other method is rejected.
async fn handle_rpc(State(state): State<Arc<BridgeState>>, request: Request) -> Response {
    if request.method() != Method::POST {
        return error_response(&BridgeError::MethodNotAllowed);
    }

    match relay_payload(&state, request.into_body()).await {
        Ok(Some(value)) => json_response(value),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            warn!("request failed: {}", e);
            error_response(&e)
        }
    }
}

/// Read the bounded body, parse it, and dispatch by shape.
///
/// A single message object yields its response (or `None` for a
/// notification). An array is a batch: every element is dispatched
/// concurrently, the results keep the input order, and entries for
/// notifications are omitted. One failing element fails the whole batch.
async fn relay_payload(state: &BridgeState, body: Body) -> Result<Option<Value>> {
    let bytes = read_body(body, state.max_body_bytes).await?;
    let payload: Value = serde_json::from_slice(&bytes)
        .map_err(|e| BridgeError::InvalidRequestBody(e.to_string()))?;

    match payload {
        Value::Array(messages) => {
            let results = try_join_all(messages.iter().map(|m| state.relay.send(m))).await?;
            let results: Vec<Value> = results.into_iter().flatten().collect();
            Ok(Some(Value::Array(results)))
        }
        message @ Value::Object(_) => state.relay.send(&message).await,
        _ => Err(BridgeError::InvalidRequestBody(
            "body must be a JSON object or array".to_string(),
        )),
    }
}

/// Buffer the request body, rejecting it as soon as the ceiling is crossed.
async fn read_body(body: Body, limit: usize) -> Result<Bytes> {
    axum::body::to_bytes(body, limit)
        .await
        .map_err(|_| BridgeError::PayloadTooLarge(limit))
}

/// Create a JSON response with appropriate headers
fn json_response(value: Value) -> Response {
    json_response_with_status(StatusCode::OK, value)
}

/// Create a JSON response with the provided status.
fn json_response_with_status(status: StatusCode, value: Value) -> Response {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&value).unwrap_or_default()))
        .unwrap_or_else(|_| (status, "Failed to create response").into_response())
}

/// Shape a failure as `{"error": "<message>"}` with the mapped status.
fn error_response(error: &BridgeError) -> Response {
    json_response_with_status(
        error.status_code(),
        serde_json::json!({ "error": error.to_string() }),
    )
}
