//! Sandbox execution engine.
//!
//! ## Overview
//!
//! Each job owns exactly one [`SandboxInstance`]: a resource-bounded container
//! with a fresh host-backed working directory bound at `/workspace`. Commands
//! run under a declarative privilege policy (package installation elevated,
//! everything else as an unprivileged user), with a hard wall-clock timeout,
//! a memory/CPU ceiling, a pids limit, and a non-executable size-capped
//! scratch area.
//!
//! The engine talks to the sandbox through the [`SandboxDriver`] trait so that
//! the workflow can be exercised in tests without a container runtime; the
//! production implementation is [`docker::DockerSandbox`].
//!
//! Instances are consumed by `destroy`, so a created sandbox can only be torn
//! down once; the orchestrator's forced-teardown path uses
//! [`SandboxDriver::destroy_container`] when a job deadline kills the engine
//! mid-flight.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::errors::SandboxError;

pub mod docker;
pub mod limits;

pub use docker::DockerSandbox;
pub use limits::{Privilege, PrivilegePolicy, SandboxLimits};

// ── Instance ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Creating,
    Ready,
    Executing,
    Destroying,
    Destroyed,
}

/// One isolated execution environment, owned by exactly one job.
#[derive(Debug)]
pub struct SandboxInstance {
    pub id: String,
    pub container_name: String,
    /// Host-visible directory bound into the container at `/workspace`.
    pub workdir: PathBuf,
    created_at: Instant,
    state: Mutex<Lifecycle>,
}

impl SandboxInstance {
    pub fn new(id: String, container_name: String, workdir: PathBuf) -> Self {
        Self {
            id,
            container_name,
            workdir,
            created_at: Instant::now(),
            state: Mutex::new(Lifecycle::Creating),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.state.lock().expect("sandbox state lock poisoned")
    }

    pub fn set_lifecycle(&self, state: Lifecycle) {
        *self.state.lock().expect("sandbox state lock poisoned") = state;
    }

    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }
}

// ── Command results ──────────────────────────────────────────────────

/// Outcome of one command execution. Immutable once produced.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Exit 137 = SIGKILL, which inside a memory-limited container almost
    /// always means the kernel OOM killer fired.
    pub fn resource_limited(&self) -> bool {
        self.exit_code == 137
    }

    /// Combined output for error messages, trimmed to a reasonable size.
    pub fn output_snippet(&self, max_len: usize) -> String {
        let combined = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        let mut end = combined.len().min(max_len);
        while end > 0 && !combined.is_char_boundary(end) {
            end -= 1;
        }
        combined[..end].to_string()
    }
}

// ── Driver contract ──────────────────────────────────────────────────

#[async_trait]
pub trait SandboxDriver: Send + Sync {
    /// Provision a fresh instance. Safe to retry on transient failure: any
    /// leftover container with the same name is removed first.
    async fn create(&self, limits: &SandboxLimits) -> Result<SandboxInstance, SandboxError>;

    /// Run a command under an explicit privilege level with a hard wall-clock
    /// timeout. A timed-out command yields a `CommandResult` flagged
    /// `timed_out` rather than hanging, and the instance stays usable.
    async fn execute(
        &self,
        instance: &SandboxInstance,
        command: &str,
        privilege: Privilege,
        timeout: Duration,
    ) -> Result<CommandResult, SandboxError>;

    /// Write arbitrary bytes to a path inside the instance. Must survive
    /// content that is unsafe to splice into a shell line (quotes, newlines,
    /// non-ASCII) and transports larger than a single command line; verified
    /// by digest read-back.
    async fn write_file(
        &self,
        instance: &SandboxInstance,
        path: &str,
        bytes: &[u8],
    ) -> Result<(), SandboxError>;

    async fn read_file(&self, instance: &SandboxInstance, path: &str)
        -> Result<String, SandboxError>;

    async fn list_files(
        &self,
        instance: &SandboxInstance,
        directory: &str,
    ) -> Result<Vec<String>, SandboxError>;

    /// Free the environment and its backing storage. Consumes the instance,
    /// so teardown happens at most once per creation.
    async fn destroy(&self, instance: SandboxInstance) -> Result<(), SandboxError>;

    /// Forced teardown by container name, for exit paths where the owning
    /// task was killed before it could call [`destroy`](Self::destroy).
    async fn destroy_container(&self, container_name: &str) -> Result<(), SandboxError>;

    /// Cheap liveness probe of the underlying runtime.
    async fn ping(&self) -> Result<(), SandboxError>;

    fn policy(&self) -> &PrivilegePolicy;

    /// Execute with the privilege level chosen by the declarative policy.
    async fn run(
        &self,
        instance: &SandboxInstance,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult, SandboxError> {
        let privilege = self.policy().privilege_for(command);
        self.execute(instance, command, privilege, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(exit_code: i64, timed_out: bool) -> CommandResult {
        CommandResult {
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::from_millis(5),
            timed_out,
        }
    }

    #[test]
    fn command_result_success_requires_zero_exit_and_no_timeout() {
        assert!(result(0, false).success());
        assert!(!result(1, false).success());
        assert!(!result(0, true).success());
    }

    #[test]
    fn oom_kill_exit_code_flags_resource_limit() {
        assert!(result(137, false).resource_limited());
        assert!(!result(1, false).resource_limited());
    }

    #[test]
    fn output_snippet_prefers_stderr_and_truncates_on_char_boundary() {
        let mut r = result(1, false);
        r.stdout = "stdout text".to_string();
        r.stderr = "stderr text that is quite long".to_string();
        assert_eq!(r.output_snippet(6), "stderr");

        let mut r = result(1, false);
        r.stdout = "héllo".to_string();
        // 2 lands inside the two-byte 'é'; snippet must back off to 'h'.
        assert_eq!(r.output_snippet(2), "h");
    }

    #[test]
    fn instance_lifecycle_transitions() {
        let instance = SandboxInstance::new(
            "job-1".to_string(),
            "patchpilot-job-1".to_string(),
            PathBuf::from("/tmp/patchpilot-job-1"),
        );
        assert_eq!(instance.lifecycle(), Lifecycle::Creating);
        instance.set_lifecycle(Lifecycle::Ready);
        assert_eq!(instance.lifecycle(), Lifecycle::Ready);
        instance.set_lifecycle(Lifecycle::Destroying);
        assert_eq!(instance.lifecycle(), Lifecycle::Destroying);
    }
}
