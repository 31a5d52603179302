//! Language-model collaborator.
//!
//! The engine only ever sees the [`LanguageModel`] trait; the production
//! implementation speaks to an OpenAI-compatible chat-completions endpoint.
//! Responses are treated as untrusted text: JSON is dug out of whatever prose
//! surrounds it, and anything unparseable is a `CollaboratorError`.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::config::LlmSettings;
use crate::errors::CollaboratorError;
use crate::workflow::state::{AgentAction, Plan, WorkflowState};

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Produce an implementation plan for the job's prompt and analysis.
    async fn plan(&self, state: &WorkflowState) -> Result<Plan, CollaboratorError>;

    /// Propose the next action inside `implement_changes`, or signal
    /// completion.
    async fn propose_next_action(
        &self,
        state: &WorkflowState,
    ) -> Result<AgentAction, CollaboratorError>;

    /// Suggest a git branch name for the change request.
    async fn suggest_branch_name(&self, prompt: &str) -> Result<String, CollaboratorError>;
}

// ── System prompts ───────────────────────────────────────────────────

const PLAN_SYSTEM_PROMPT: &str = r#"You are a software engineering planner. Analyze the change request and repository summary, then respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "summary": "Brief description of the change",
  "steps": ["ordered implementation steps"],
  "files_to_modify": ["existing files that need changes"],
  "new_files": ["files to create"],
  "considerations": ["risks or things to watch"]
}

Rules:
- Preserve existing code; plan incremental changes, not rewrites.
- Match existing file extensions and patterns (.js vs .jsx etc.).
- Use paths relative to the repository root.
"#;

const ACTION_SYSTEM_PROMPT: &str = r#"You are a coding agent implementing a planned change inside a repository checkout. Respond with valid JSON only (no markdown) matching exactly one of:
{"action": "write_file", "path": "relative/path", "content": "full file content", "description": "what changed"}
{"action": "run_command", "command": "shell command to run in the repository root"}
{"action": "done", "summary": "what was implemented"}

Rules:
- write_file replaces the whole file; include complete content.
- Use paths relative to the repository root.
- Signal done as soon as the plan is fully implemented.
"#;

const BRANCH_SYSTEM_PROMPT: &str = "Respond with a single git branch name for the described change: kebab-case, max 50 characters, prefixed with feature/ or fix/. Respond with the branch name only.";

// ── HTTP implementation ──────────────────────────────────────────────

pub struct HttpLanguageModel {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    model: String,
}

impl HttpLanguageModel {
    pub fn new(settings: &LlmSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: settings.api_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn chat(&self, system: &str, user: String) -> Result<String, CollaboratorError> {
        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.api_url))
            .json(&json!({
                "model": self.model,
                "temperature": 0.2,
                "messages": [
                    {"role": "system", "content": system},
                    {"role": "user", "content": user},
                ],
            }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CollaboratorError::Llm(format!("request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::Llm(format!(
                "endpoint returned {status}: {}",
                body.chars().take(300).collect::<String>()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CollaboratorError::Llm(format!("invalid response body: {e}")))?;
        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                CollaboratorError::InvalidResponse("response missing message content".to_string())
            })?;
        debug!(chars = content.len(), "language model responded");
        Ok(content.to_string())
    }
}

fn plan_context(state: &WorkflowState) -> String {
    let analysis = state
        .analysis
        .as_ref()
        .map(|a| a.summary())
        .unwrap_or_else(|| "no analysis available".to_string());
    format!(
        "## Change request\n{}\n\n## Repository\n{}\n\nRespond with JSON only.",
        state.prompt, analysis
    )
}

fn action_context(state: &WorkflowState) -> String {
    let plan = state
        .plan
        .as_ref()
        .and_then(|p| serde_json::to_string_pretty(p).ok())
        .unwrap_or_else(|| "no plan available".to_string());
    let applied: Vec<String> = state
        .changes
        .iter()
        .map(|c| format!("- {} ({:?})", c.path, c.action))
        .collect();
    format!(
        "## Change request\n{}\n\n## Plan\n{}\n\n## Changes applied so far\n{}\n\nPropose the next action as JSON only.",
        state.prompt,
        plan,
        if applied.is_empty() {
            "none yet".to_string()
        } else {
            applied.join("\n")
        }
    )
}

#[async_trait]
impl LanguageModel for HttpLanguageModel {
    async fn plan(&self, state: &WorkflowState) -> Result<Plan, CollaboratorError> {
        let response = self.chat(PLAN_SYSTEM_PROMPT, plan_context(state)).await?;
        Plan::parse(&response)
    }

    async fn propose_next_action(
        &self,
        state: &WorkflowState,
    ) -> Result<AgentAction, CollaboratorError> {
        let response = self
            .chat(ACTION_SYSTEM_PROMPT, action_context(state))
            .await?;
        AgentAction::parse(&response)
    }

    async fn suggest_branch_name(&self, prompt: &str) -> Result<String, CollaboratorError> {
        let response = self
            .chat(
                BRANCH_SYSTEM_PROMPT,
                format!("Change request: {prompt}\n\nBranch name:"),
            )
            .await?;
        let name = response
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("")
            .to_string();
        if name.is_empty() {
            return Err(CollaboratorError::InvalidResponse(
                "empty branch name suggestion".to_string(),
            ));
        }
        Ok(name)
    }
}
