//! Same-origin proxy that keeps the API key off the client

use crate::config::Config;
use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

#[derive(Clone)]
pub struct ProxyState {
    client: reqwest::Client,
    upstream: String,
    api_key: Option<String>,
}

impl ProxyState {
    pub fn new(upstream: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            upstream: upstream.into(),
            api_key,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.completion_endpoint(), config.get_api_key())
    }
}

pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/api/chat", post(chat))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the process exits
pub async fn serve(state: ProxyState, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind proxy to {addr}"))?;
    let local = listener.local_addr().context("Failed to read bound address")?;
    tracing::info!("Server running on http://{local}");

    axum::serve(listener, router(state))
        .await
        .context("Proxy server stopped")
}

/// Forward a chat body upstream.
///
/// Upstream rejections keep their status and body so an overloaded model
/// still reads as a 503 on the client side. Failures before any upstream
/// response (no key, transport error) are a 500 carrying the error chain.
async fn chat(State(state): State<ProxyState>, Json(body): Json<Value>) -> Response {
    let turns = body
        .get("contents")
        .and_then(Value::as_array)
        .map_or(0, Vec::len);
    tracing::info!(turns, "forwarding chat request");

    match forward(&state, &body).await {
        Ok((status, text)) => {
            if !status.is_success() {
                tracing::warn!(%status, "upstream rejected request");
            }
            (status, [(header::CONTENT_TYPE, "application/json")], text).into_response()
        }
        Err(e) => {
            tracing::error!("proxy error: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": format!("{e:#}") })),
            )
                .into_response()
        }
    }
}

async fn forward(state: &ProxyState, body: &Value) -> Result<(StatusCode, String)> {
    let api_key = state
        .api_key
        .as_deref()
        .context("Proxy has no API key configured")?;

    let response = state
        .client
        .post(&state.upstream)
        .header("x-goog-api-key", api_key)
        .json(body)
        .send()
        .await
        .context("Upstream request failed")?;

    let status = StatusCode::from_u16(response.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let text = response
        .text()
        .await
        .context("Failed to read upstream response")?;

    Ok((status, text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    async fn spawn_proxy(state: ProxyState) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        format!("http://{addr}/api/chat")
    }

    fn chat_body() -> Value {
        serde_json::json!({
            "contents": [{ "role": "user", "parts": [{ "text": "Hello" }] }]
        })
    }

    #[tokio::test]
    async fn forwards_body_and_returns_upstream_json() {
        let upstream = MockServer::start();
        let mock = upstream.mock(|when, then| {
            when.method(POST)
                .path("/models/gemini-1.5-flash:generateContent")
                .header("x-goog-api-key", "secret")
                .json_body(chat_body());
            then.status(200).json_body(serde_json::json!({
                "candidates": [{ "content": { "parts": [{ "text": "**Hi** there" }] } }]
            }));
        });

        let url = spawn_proxy(ProxyState::new(
            upstream.url("/models/gemini-1.5-flash:generateContent"),
            Some("secret".to_string()),
        ))
        .await;

        let response = reqwest::Client::new()
            .post(&url)
            .json(&chat_body())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        let json: Value = response.json().await.unwrap();
        assert_eq!(
            json["candidates"][0]["content"]["parts"][0]["text"],
            "**Hi** there"
        );
        mock.assert();
    }

    #[tokio::test]
    async fn upstream_errors_keep_status_and_body() {
        let upstream = MockServer::start();
        upstream.mock(|when, then| {
            when.method(POST);
            then.status(503).json_body(serde_json::json!({
                "error": { "code": 503, "message": "The model is overloaded.", "status": "UNAVAILABLE" }
            }));
        });

        let url = spawn_proxy(ProxyState::new(upstream.url("/generate"), Some("k".to_string()))).await;

        let response = reqwest::Client::new()
            .post(&url)
            .json(&chat_body())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 503);
        let json: Value = response.json().await.unwrap();
        assert_eq!(json["error"]["status"], "UNAVAILABLE");
    }

    #[tokio::test]
    async fn missing_key_is_a_500_with_message() {
        let url = spawn_proxy(ProxyState::new("http://127.0.0.1:1/generate", None)).await;

        let response = reqwest::Client::new()
            .post(&url)
            .json(&chat_body())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 500);
        let json: Value = response.json().await.unwrap();
        assert_eq!(json["error"], "Proxy has no API key configured");
    }

    #[tokio::test]
    async fn unreachable_upstream_is_a_500() {
        let url = spawn_proxy(ProxyState::new(
            "http://127.0.0.1:1/generate",
            Some("k".to_string()),
        ))
        .await;

        let response = reqwest::Client::new()
            .post(&url)
            .json(&chat_body())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 500);
        let json: Value = response.json().await.unwrap();
        let message = json["error"].as_str().unwrap();
        assert!(message.starts_with("Upstream request failed: "), "{message}");
        assert!(message.len() > "Upstream request failed: ".len());
    }
}
