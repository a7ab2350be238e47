//! Minimal upstream for local testing: replies with a fixed message and the
//! request it received.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, Method, Uri},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use tokio::net::TcpListener;
use tracing::{debug, info};

#[derive(Clone)]
struct EchoState {
    message: Arc<str>,
}

pub fn router(message: impl Into<String>) -> Router {
    let state = EchoState {
        message: Arc::from(message.into()),
    };

    Router::new()
        .route("/health", get(health))
        .fallback(echo)
        .with_state(state)
}

pub async fn run(port: u16, message: String) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind echo server on {}", addr))?;

    info!("Starting echo server on {} with message: {}", addr, message);

    axum::serve(listener, router(message))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("Echo server error")
}

async fn echo(
    State(state): State<EchoState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    debug!("Echoing {} {} ({} byte body)", method, uri.path(), body.len());

    let mut response = format!(
        "Server Message: {}\n\nRequest Details:\nMethod: {}\nPath: {}\nHeaders:\n",
        state.message,
        method,
        uri.path()
    );
    for (name, value) in headers.iter() {
        response.push_str(&format!("{}: {}\n", name, String::from_utf8_lossy(value.as_bytes())));
    }
    if !body.is_empty() {
        response.push_str(&format!("\nRequest Body:\n{}", String::from_utf8_lossy(&body)));
    }

    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], response)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
