//! Per-job orchestration: one (sandbox, engine, relay) triple per request.
//!
//! The runner is intentionally thin. It acquires a concurrency permit, wires
//! the triple together, spawns the engine on a background task, and hands the
//! consumer half of the relay back to the HTTP layer. A job-level deadline,
//! distinct from per-command timeouts, kills the engine task, forces sandbox
//! teardown through the engine's active-container slot, and publishes the
//! terminal error itself.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::collab::{GitHubClient, HttpLanguageModel};
use crate::config::Settings;
use crate::errors::SandboxError;
use crate::events::{self, Event, EventStream};
use crate::sandbox::{DockerSandbox, SandboxDriver};
use crate::workflow::{WorkflowConfig, WorkflowEngine, WorkflowState};

pub struct JobRequest {
    pub repo_url: String,
    pub prompt: String,
    pub branch_name: Option<String>,
}

#[derive(Debug)]
pub enum JobRejected {
    /// The concurrent-job ceiling is reached.
    Busy,
}

pub struct JobRunner {
    sandbox: Arc<DockerSandbox>,
    llm: Arc<HttpLanguageModel>,
    github: Arc<GitHubClient>,
    settings: Settings,
    permits: Arc<Semaphore>,
}

impl JobRunner {
    pub fn new(settings: Settings) -> Result<Self, SandboxError> {
        let sandbox = Arc::new(DockerSandbox::connect(settings.policy.clone())?);
        let llm = Arc::new(HttpLanguageModel::new(&settings.llm));
        let github = Arc::new(GitHubClient::new(&settings.github));
        let permits = Arc::new(Semaphore::new(settings.workflow.max_concurrent_jobs));
        Ok(Self {
            sandbox,
            llm,
            github,
            settings,
            permits,
        })
    }

    pub fn sandbox(&self) -> &DockerSandbox {
        &self.sandbox
    }

    pub fn llm_configured(&self) -> bool {
        self.llm.is_configured()
    }

    pub fn github_configured(&self) -> bool {
        self.github.is_configured()
    }

    /// Start a job and return the event stream to serve to the client.
    /// The job keeps running if the client later disconnects.
    pub fn spawn(&self, request: JobRequest) -> Result<EventStream, JobRejected> {
        let permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| JobRejected::Busy)?;

        let job_id = Uuid::new_v4().simple().to_string();
        let (relay, stream) = events::channel(self.settings.workflow.event_buffer);
        let engine = WorkflowEngine::new(
            Arc::clone(&self.sandbox),
            Arc::clone(&self.llm),
            Arc::clone(&self.github),
            relay.clone(),
            self.settings.sandbox.clone(),
            WorkflowConfig {
                max_retries: self.settings.workflow.max_retries,
                implement_iteration_cap: self.settings.workflow.implement_iteration_cap,
                github_token: self.settings.github.token.clone(),
            },
        );
        let active = engine.active_container();
        let state = WorkflowState::new(
            job_id.clone(),
            request.repo_url,
            request.prompt,
            request.branch_name,
        );
        let job_timeout = self.settings.job_timeout();
        let sandbox = Arc::clone(&self.sandbox);

        tokio::spawn(async move {
            let _permit = permit;
            match tokio::time::timeout(job_timeout, engine.run(state)).await {
                Ok(Ok(state)) => {
                    info!(job_id = %job_id, pr_url = ?state.pr_url, "job completed");
                }
                Ok(Err(err)) => {
                    // Terminal error event was already published by the engine.
                    warn!(job_id = %job_id, error = %err, "job failed");
                }
                Err(_) => {
                    warn!(
                        job_id = %job_id,
                        timeout_secs = job_timeout.as_secs(),
                        "job deadline exceeded; forcing sandbox teardown"
                    );
                    let container = active.lock().expect("active container lock").take();
                    if let Some(name) = container {
                        if let Err(e) = sandbox.destroy_container(&name).await {
                            error!(job_id = %job_id, error = %e, "forced teardown failed");
                        }
                    }
                    relay
                        .publish(Event::error(format!(
                            "Job exceeded the {}s deadline and was aborted",
                            job_timeout.as_secs()
                        )))
                        .await;
                }
            }
        });

        Ok(stream)
    }
}
