//! Typed error hierarchy for patchpilot.
//!
//! Three top-level enums cover the three subsystems:
//! - `SandboxError` — isolation engine failures (provisioning, execution, teardown)
//! - `CollaboratorError` — language-model and source-control call failures
//! - `WorkflowError` — step routing and terminal outcomes of the workflow engine

use thiserror::Error;

/// Errors from the sandbox execution engine.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Failed to provision sandbox: {0}")]
    Provision(String),

    #[error("Invalid sandbox limits: {0}")]
    InvalidLimits(String),

    #[error("Command failed in sandbox {id}: {message}")]
    Exec { id: String, message: String },

    #[error("Command exceeded {timeout_secs}s wall-clock limit: {command}")]
    Timeout { command: String, timeout_secs: u64 },

    #[error("Resource limit exceeded (exit code {exit_code}): {command}")]
    ResourceLimit { command: String, exit_code: i64 },

    #[error("File write verification failed for {path}: {reason}")]
    FileWrite { path: String, reason: String },

    #[error("Failed to tear down sandbox {id}: {message}")]
    Teardown { id: String, message: String },
}

/// Errors from the external collaborators consumed by the workflow engine.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("Language model call failed: {0}")]
    Llm(String),

    #[error("Source control call failed: {0}")]
    SourceControl(String),

    #[error("Collaborator returned invalid data: {0}")]
    InvalidResponse(String),
}

/// Errors from the workflow engine.
///
/// Any error raised inside a step is converted into one of these at the step
/// boundary and routed to the engine's error handler; only `FatalTeardown`
/// bypasses the retry loop.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Step {step} failed: {message}")]
    Step { step: &'static str, message: String },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error("Workflow aborted after {retries} retries: {last_error}")]
    Aborted { retries: u32, last_error: String },

    #[error("Sandbox teardown failed, aborting without retry: {0}")]
    FatalTeardown(#[source] SandboxError),
}

impl WorkflowError {
    pub fn step(step: &'static str, message: impl Into<String>) -> Self {
        Self::Step {
            step,
            message: message.into(),
        }
    }

    /// Teardown failures risk resource leaks and must never be papered over
    /// by a retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalTeardown(_) | Self::Aborted { .. })
    }
}
