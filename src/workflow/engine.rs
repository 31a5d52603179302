//! The retryable attempt loop around the step sequence.

use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};

use crate::collab::{LanguageModel, SourceControl};
use crate::errors::WorkflowError;
use crate::events::{Event, EventRelay};
use crate::sandbox::{SandboxDriver, SandboxInstance, SandboxLimits};
use crate::workflow::state::{Step, WorkflowState};

#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Full restarts permitted after the first failed attempt.
    pub max_retries: u32,
    /// Upper bound on propose/apply rounds inside `implement_changes`.
    pub implement_iteration_cap: u32,
    /// Token used for clone/push URL injection. The source-control
    /// collaborator carries its own credential for API calls.
    pub github_token: Option<String>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            implement_iteration_cap: 20,
            github_token: None,
        }
    }
}

pub struct WorkflowEngine<S, L, G> {
    pub(crate) sandbox: Arc<S>,
    pub(crate) llm: Arc<L>,
    pub(crate) source_control: Arc<G>,
    pub(crate) relay: EventRelay,
    pub(crate) limits: SandboxLimits,
    pub(crate) config: WorkflowConfig,
    /// Name of the attempt's live container, exposed so the orchestrator can
    /// force teardown if the engine task is killed by the job deadline.
    active_container: Arc<Mutex<Option<String>>>,
}

impl<S, L, G> WorkflowEngine<S, L, G>
where
    S: SandboxDriver,
    L: LanguageModel,
    G: SourceControl,
{
    pub fn new(
        sandbox: Arc<S>,
        llm: Arc<L>,
        source_control: Arc<G>,
        relay: EventRelay,
        limits: SandboxLimits,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            sandbox,
            llm,
            source_control,
            relay,
            limits,
            config,
            active_container: Arc::new(Mutex::new(None)),
        }
    }

    pub fn active_container(&self) -> Arc<Mutex<Option<String>>> {
        Arc::clone(&self.active_container)
    }

    /// Drive the job to a terminal state. Exactly one terminal event is
    /// published: success, or error once the retry budget is exhausted or a
    /// teardown failure makes retrying unsafe.
    pub async fn run(&self, mut state: WorkflowState) -> Result<WorkflowState, WorkflowError> {
        info!(job_id = %state.job_id, repo = %state.repo_url, "workflow started");
        loop {
            match self.run_attempt(&mut state).await {
                Ok(()) => {
                    let context = state
                        .plan
                        .as_ref()
                        .map(|p| p.summary.clone())
                        .unwrap_or_else(|| "Change request implemented".to_string());
                    self.relay
                        .publish(Event::success(context, state.pr_url.clone()))
                        .await;
                    info!(job_id = %state.job_id, pr_url = ?state.pr_url, "workflow succeeded");
                    return Ok(state);
                }
                Err(WorkflowError::FatalTeardown(e)) => {
                    let fatal = WorkflowError::FatalTeardown(e);
                    error!(job_id = %state.job_id, error = %fatal, "teardown failure; aborting job");
                    self.relay.publish(Event::error(fatal.to_string())).await;
                    return Err(fatal);
                }
                Err(err) => {
                    // handle_error: bump the counter, then either restart
                    // from the entry state with the original inputs or abort.
                    state.retry_count += 1;
                    state.last_error = Some(err.to_string());
                    warn!(
                        job_id = %state.job_id,
                        step = %state.current_step,
                        retry = state.retry_count,
                        error = %err,
                        "attempt failed"
                    );
                    if state.retry_count > self.config.max_retries {
                        let aborted = WorkflowError::Aborted {
                            retries: self.config.max_retries,
                            last_error: err.to_string(),
                        };
                        self.relay.publish(Event::error(aborted.to_string())).await;
                        return Err(aborted);
                    }
                    self.relay
                        .publish(Event::message(format!(
                            "Attempt failed: {err}. Restarting from {} (retry {}/{}).",
                            Step::entry(),
                            state.retry_count,
                            self.config.max_retries
                        )))
                        .await;
                    state.reset_for_retry();
                }
            }
        }
    }

    /// One full pass: provision, run the step sequence, tear down. The
    /// sandbox created here is destroyed on every exit path of this function;
    /// a teardown failure outranks a step failure because it risks leaking
    /// the environment.
    async fn run_attempt(&self, state: &mut WorkflowState) -> Result<(), WorkflowError> {
        let instance = self.sandbox.create(&self.limits).await?;
        *self.active_container.lock().expect("active container lock") =
            Some(instance.container_name.clone());

        let result = self.run_steps(&instance, state).await;

        self.active_container
            .lock()
            .expect("active container lock")
            .take();
        if let Err(err) = &result {
            warn!(job_id = %state.job_id, error = %err, "attempt ended with step error");
        }
        match self.sandbox.destroy(instance).await {
            Ok(()) => result,
            Err(e) => Err(WorkflowError::FatalTeardown(e)),
        }
    }

    async fn run_steps(
        &self,
        instance: &SandboxInstance,
        state: &mut WorkflowState,
    ) -> Result<(), WorkflowError> {
        let mut step = Step::entry();
        loop {
            state.current_step = step;
            self.relay
                .publish(Event::progress(step.progress_percent(), step.name()))
                .await;
            info!(job_id = %state.job_id, step = %step, "step started");

            match step {
                Step::AnalyzeRepository => self.analyze_repository(instance, state).await?,
                Step::CreatePlan => self.create_plan(state).await?,
                Step::ImplementChanges => self.implement_changes(instance, state).await?,
                Step::CommitChanges => self.commit_changes(instance, state).await?,
                Step::PushChanges => self.push_changes(instance, state).await?,
                Step::CreatePullRequest => self.create_pull_request(state).await?,
            }

            match step.next() {
                Some(next) => step = next,
                None => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_config_defaults() {
        let config = WorkflowConfig::default();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.implement_iteration_cap, 20);
        assert!(config.github_token.is_none());
    }
}
