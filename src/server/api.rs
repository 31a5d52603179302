//! Route handlers: the code-change endpoint and the health probe.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tracing::info;

use super::jobs::{JobRejected, JobRequest, JobRunner};
use crate::collab::github::parse_owner_repo;
use crate::sandbox::SandboxDriver;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub jobs: JobRunner,
    pub keepalive: Duration,
}

pub type SharedState = Arc<AppState>;

// ── Request payload ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CodeRequest {
    pub repo_url: String,
    pub prompt: String,
    #[serde(default)]
    pub branch_name: Option<String>,
}

const MIN_PROMPT_LEN: usize = 10;
const MAX_PROMPT_LEN: usize = 2000;

fn validate(request: &CodeRequest) -> Result<(), String> {
    if !request.repo_url.starts_with("https://github.com/")
        || parse_owner_repo(&request.repo_url).is_none()
    {
        return Err("repo_url must be an https://github.com/<owner>/<repo> URL".to_string());
    }
    let prompt_len = request.prompt.trim().chars().count();
    if !(MIN_PROMPT_LEN..=MAX_PROMPT_LEN).contains(&prompt_len) {
        return Err(format!(
            "prompt must be between {MIN_PROMPT_LEN} and {MAX_PROMPT_LEN} characters"
        ));
    }
    Ok(())
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    BadRequest(String),
    Busy,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::Busy => (
                StatusCode::TOO_MANY_REQUESTS,
                "maximum concurrent jobs reached; try again later".to_string(),
            ),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/code", post(create_code_change))
        .route("/health", get(health_check))
}

/// Accept a change request and answer with the job's live event stream.
async fn create_code_change(
    State(state): State<SharedState>,
    Json(request): Json<CodeRequest>,
) -> Result<Response, ApiError> {
    validate(&request).map_err(ApiError::BadRequest)?;
    info!(repo_url = %request.repo_url, prompt_len = request.prompt.len(), "code request accepted");

    let stream = state
        .jobs
        .spawn(JobRequest {
            repo_url: request.repo_url,
            prompt: request.prompt,
            branch_name: request.branch_name,
        })
        .map_err(|JobRejected::Busy| ApiError::Busy)?;

    Ok(stream.into_sse(state.keepalive).into_response())
}

async fn health_check(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let sandbox = match state.jobs.sandbox().ping().await {
        Ok(()) => "ok",
        Err(_) => "unavailable",
    };
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "services": {
            "sandbox": sandbox,
            "llm": if state.jobs.llm_configured() { "configured" } else { "unconfigured" },
            "github": if state.jobs.github_configured() { "configured" } else { "unconfigured" },
        },
    }))
}
