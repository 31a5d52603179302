//! HTTP layer.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐  POST /code   ┌───────────────────────────────────────────┐
//! │  Client  │ ────────────> │  api.rs   (Router, AppState, validation)  │
//! │          │ <──────────── │     │                                     │
//! └──────────┘  SSE events   │     │ JobRunner::spawn()                  │
//!                            │     v                                     │
//!                            │  jobs.rs  (per-job triple, deadline,      │
//!                            │            concurrency permits)           │
//!                            │     │                                     │
//!                            │     │ WorkflowEngine::run()  (background) │
//!                            │     v                                     │
//!                            │  workflow/ + sandbox/ + events/           │
//!                            └───────────────────────────────────────────┘
//! ```
//!
//! One job per request; the only thing crossing back from the background
//! task to the response is the event relay's consumer half.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::config::Settings;

pub mod api;
pub mod jobs;

pub use api::{AppState, SharedState};
pub use jobs::JobRunner;

/// Build the application router.
pub fn build_router(state: SharedState) -> Router {
    api::api_router().with_state(state)
}

/// Start the service and block until shutdown.
pub async fn start_server(settings: Settings) -> Result<()> {
    let keepalive = settings.keepalive();
    let dev_mode = settings.server.dev_mode;
    let host = if dev_mode {
        "0.0.0.0".to_string()
    } else {
        settings.server.host.clone()
    };
    let port = settings.server.port;

    let jobs = JobRunner::new(settings).context("Failed to initialize job runner")?;
    let state = Arc::new(AppState { jobs, keepalive });

    let mut app = build_router(state);
    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    let local_addr = listener.local_addr()?;
    println!("patchpilot listening on http://{local_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    println!("\nShutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_router() -> Router {
        let settings = Settings::default();
        let keepalive = settings.keepalive();
        let jobs = JobRunner::new(settings).unwrap();
        build_router(Arc::new(AppState { jobs, keepalive }))
    }

    #[tokio::test]
    async fn health_endpoint_reports_service_status() {
        let app = test_router();
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let health: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(health["status"], "healthy");
        assert!(health["services"]["sandbox"].is_string());
        assert_eq!(health["services"]["github"], "unconfigured");
    }

    #[tokio::test]
    async fn code_endpoint_rejects_invalid_repo_url() {
        let app = test_router();
        let req = Request::builder()
            .method("POST")
            .uri("/code")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({
                    "repo_url": "https://gitlab.com/a/b",
                    "prompt": "Add input validation to the endpoints",
                })
                .to_string(),
            ))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn code_endpoint_rejects_short_prompt() {
        let app = test_router();
        let req = Request::builder()
            .method("POST")
            .uri("/code")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({
                    "repo_url": "https://github.com/octocat/hello-world",
                    "prompt": "short",
                })
                .to_string(),
            ))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let app = test_router();
        let req = Request::builder()
            .uri("/nope")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
