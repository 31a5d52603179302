//! Docker-backed sandbox driver built on bollard.
//!
//! Containers are created from a minimal base image with a host directory
//! bound at `/workspace`, resource ceilings applied via `HostConfig`, and a
//! noexec tmpfs at `/tmp` so payloads written to scratch space cannot
//! self-execute. The container idles on `sleep infinity`; every operation is
//! a `docker exec` against it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::exec::StartExecResults;
use bollard::exec::StartExecOptions;
use bollard::models::{ContainerCreateBody, ExecConfig, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, RemoveContainerOptionsBuilder,
    StartContainerOptions, StopContainerOptionsBuilder,
};
use bollard::Docker;
use futures_util::{StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{CommandResult, Lifecycle, Privilege, PrivilegePolicy, SandboxDriver, SandboxInstance};
use crate::errors::SandboxError;
use crate::sandbox::SandboxLimits;

/// Mount point of the per-job working directory inside the container.
pub const WORKSPACE: &str = "/workspace";

/// Timeout for internal file/setup operations, independent of the
/// per-command timeout applied to workflow commands.
const FILE_OP_TIMEOUT: Duration = Duration::from_secs(60);
const SETUP_TIMEOUT: Duration = Duration::from_secs(180);

/// Base64 payload bytes appended per exec when transferring file content.
/// Keeps each command line far below the in-container ARG_MAX.
const WRITE_CHUNK_BYTES: usize = 48 * 1024;

pub struct DockerSandbox {
    docker: Docker,
    policy: PrivilegePolicy,
    workdir_root: PathBuf,
}

impl DockerSandbox {
    /// Connect to the local Docker daemon. The connection itself is lazy;
    /// use [`SandboxDriver::ping`] to find out whether the daemon is up.
    pub fn connect(policy: PrivilegePolicy) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::RuntimeUnavailable(e.to_string()))?;
        Ok(Self {
            docker,
            policy,
            workdir_root: std::env::temp_dir(),
        })
    }

    fn workdir_for(&self, container_name: &str) -> PathBuf {
        self.workdir_root.join(container_name)
    }

    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        let (from_image, tag) = match image.rsplit_once(':') {
            Some((img, tag)) => (img, tag),
            None => (image, "latest"),
        };
        info!(image, "pulling sandbox base image");
        self.docker
            .create_image(
                Some(
                    CreateImageOptionsBuilder::new()
                        .from_image(from_image)
                        .tag(tag)
                        .build(),
                ),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| SandboxError::Provision(format!("image pull failed for {image}: {e}")))?;
        Ok(())
    }

    async fn remove_container_if_exists(&self, container_name: &str) -> Result<(), SandboxError> {
        match self
            .docker
            .remove_container(
                container_name,
                Some(
                    RemoveContainerOptionsBuilder::new()
                        .force(true)
                        .v(true)
                        .build(),
                ),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(SandboxError::Teardown {
                id: container_name.to_string(),
                message: e.to_string(),
            }),
        }
    }

    /// Install the configured packages with elevated privilege. Failures are
    /// logged, not fatal: the workflow surfaces the real problem when a later
    /// command needs the missing tool.
    async fn install_setup_packages(
        &self,
        instance: &SandboxInstance,
        limits: &SandboxLimits,
    ) -> Result<(), SandboxError> {
        if limits.setup_packages.is_empty() {
            return Ok(());
        }
        let command = format!("apk add --no-cache {}", limits.setup_packages.join(" "));
        let result = self
            .execute(instance, &command, Privilege::Elevated, SETUP_TIMEOUT)
            .await?;
        if result.success() {
            debug!(id = %instance.id, packages = ?limits.setup_packages, "sandbox setup packages installed");
        } else {
            warn!(
                id = %instance.id,
                exit_code = result.exit_code,
                stderr = %result.output_snippet(400),
                "sandbox package install failed"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl SandboxDriver for DockerSandbox {
    async fn create(&self, limits: &SandboxLimits) -> Result<SandboxInstance, SandboxError> {
        limits.validate()?;
        self.ensure_image(&limits.image).await?;

        let id = Uuid::new_v4().simple().to_string();
        let container_name = format!("patchpilot-{id}");
        let workdir = self.workdir_for(&container_name);
        std::fs::create_dir_all(&workdir)
            .map_err(|e| SandboxError::Provision(format!("workdir creation failed: {e}")))?;

        // Retry-safety: a previous half-provisioned attempt with this name is
        // cleared before creating.
        self.remove_container_if_exists(&container_name).await.ok();

        let config = ContainerCreateBody {
            image: Some(limits.image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: Some(WORKSPACE.to_string()),
            env: Some(vec![
                format!("HOME={WORKSPACE}"),
                "PYTHONUNBUFFERED=1".to_string(),
                "PYTHONDONTWRITEBYTECODE=1".to_string(),
            ]),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{}:{}", workdir.display(), WORKSPACE)]),
                network_mode: Some("bridge".to_string()),
                memory: Some(limits.memory_bytes),
                nano_cpus: Some(limits.nano_cpus()),
                pids_limit: Some(limits.pids_limit),
                tmpfs: Some(HashMap::from([(
                    "/tmp".to_string(),
                    limits.tmpfs_options(),
                )])),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        self.docker
            .create_container(
                Some(
                    CreateContainerOptionsBuilder::new()
                        .name(&container_name)
                        .build(),
                ),
                config,
            )
            .await
            .map_err(|e| SandboxError::Provision(format!("create_container failed: {e}")))?;

        self.docker
            .start_container(&container_name, None::<StartContainerOptions>)
            .await
            .map_err(|e| SandboxError::Provision(format!("start_container failed: {e}")))?;

        let instance = SandboxInstance::new(id, container_name, workdir);
        self.install_setup_packages(&instance, limits).await?;
        instance.set_lifecycle(Lifecycle::Ready);
        info!(id = %instance.id, container = %instance.container_name, "sandbox provisioned");
        Ok(instance)
    }

    async fn execute(
        &self,
        instance: &SandboxInstance,
        command: &str,
        privilege: Privilege,
        timeout: Duration,
    ) -> Result<CommandResult, SandboxError> {
        instance.set_lifecycle(Lifecycle::Executing);
        let started = Instant::now();

        let exec = self
            .docker
            .create_exec(
                &instance.container_name,
                ExecConfig {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    user: Some(privilege.user().to_string()),
                    working_dir: Some(WORKSPACE.to_string()),
                    cmd: Some(vec![
                        "sh".to_string(),
                        "-c".to_string(),
                        command.to_string(),
                    ]),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::Exec {
                id: instance.id.clone(),
                message: format!("create_exec failed: {e}"),
            })?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut timed_out = false;

        let start = self
            .docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await
            .map_err(|e| SandboxError::Exec {
                id: instance.id.clone(),
                message: format!("start_exec failed: {e}"),
            })?;

        if let StartExecResults::Attached { mut output, .. } = start {
            let deadline = started + timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    timed_out = true;
                    break;
                }
                match tokio::time::timeout(remaining, output.next()).await {
                    Ok(Some(Ok(LogOutput::StdOut { message }))) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(Some(Ok(LogOutput::StdErr { message }))) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(e))) => {
                        instance.set_lifecycle(Lifecycle::Ready);
                        return Err(SandboxError::Exec {
                            id: instance.id.clone(),
                            message: format!("exec stream failed: {e}"),
                        });
                    }
                    Ok(None) => break,
                    Err(_) => {
                        timed_out = true;
                        break;
                    }
                }
            }
        }

        let exit_code = if timed_out {
            -1
        } else {
            self.docker
                .inspect_exec(&exec.id)
                .await
                .ok()
                .and_then(|inspect| inspect.exit_code)
                .unwrap_or(-1)
        };

        instance.set_lifecycle(Lifecycle::Ready);
        let result = CommandResult {
            exit_code,
            stdout,
            stderr,
            duration: started.elapsed(),
            timed_out,
        };
        debug!(
            id = %instance.id,
            command = %truncate(command, 120),
            exit_code = result.exit_code,
            timed_out = result.timed_out,
            duration_ms = result.duration.as_millis() as u64,
            "sandbox command finished"
        );
        Ok(result)
    }

    /// Binary-safe transfer: the payload crosses the boundary as base64
    /// chunks appended to a staging file, decoded by a trusted `base64 -d`
    /// invocation inside the sandbox. Raw content is never spliced into a
    /// shell line, so quotes, newlines and arbitrary bytes survive intact.
    /// The write is verified by comparing SHA-256 digests.
    async fn write_file(
        &self,
        instance: &SandboxInstance,
        path: &str,
        bytes: &[u8],
    ) -> Result<(), SandboxError> {
        let staging = format!("/tmp/.patchpilot-{}.b64", Uuid::new_v4().simple());
        let encoded = BASE64.encode(bytes);

        // Reset the staging file up front so zero-length payloads decode to
        // an empty file instead of a missing one.
        let clear = format!(
            "rm -f {q} && : > {q}",
            q = shell_quote(&staging)
        );
        self.checked_exec(instance, &clear, path).await?;

        for chunk in encoded.as_bytes().chunks(WRITE_CHUNK_BYTES) {
            // Base64 alphabet only; safe inside single quotes by construction.
            let chunk = std::str::from_utf8(chunk).expect("base64 output is ASCII");
            let append = format!("printf %s '{}' >> {}", chunk, shell_quote(&staging));
            self.checked_exec(instance, &append, path).await?;
        }

        let decode = match parent_dir(path) {
            Some(parent) => format!(
                "mkdir -p {} && base64 -d {} > {} && rm -f {}",
                shell_quote(&parent),
                shell_quote(&staging),
                shell_quote(path),
                shell_quote(&staging)
            ),
            None => format!(
                "base64 -d {} > {} && rm -f {}",
                shell_quote(&staging),
                shell_quote(path),
                shell_quote(&staging)
            ),
        };
        self.checked_exec(instance, &decode, path).await?;

        // Read-back verification: digest of the decoded file must match the
        // digest of what we meant to write.
        let expected = hex_digest(bytes);
        let verify = format!("sha256sum {}", shell_quote(path));
        let result = self.checked_exec(instance, &verify, path).await?;
        let actual = result
            .stdout
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string();
        if actual != expected {
            return Err(SandboxError::FileWrite {
                path: path.to_string(),
                reason: format!("digest mismatch: expected {expected}, read back {actual}"),
            });
        }
        Ok(())
    }

    async fn read_file(
        &self,
        instance: &SandboxInstance,
        path: &str,
    ) -> Result<String, SandboxError> {
        let command = format!("cat {}", shell_quote(path));
        let result = self
            .execute(instance, &command, Privilege::Restricted, FILE_OP_TIMEOUT)
            .await?;
        if result.timed_out {
            return Err(SandboxError::Timeout {
                command,
                timeout_secs: FILE_OP_TIMEOUT.as_secs(),
            });
        }
        if !result.success() {
            return Err(SandboxError::Exec {
                id: instance.id.clone(),
                message: format!("read of {path} failed: {}", result.output_snippet(400)),
            });
        }
        Ok(result.stdout)
    }

    async fn list_files(
        &self,
        instance: &SandboxInstance,
        directory: &str,
    ) -> Result<Vec<String>, SandboxError> {
        let command = format!("find {} -type f | head -1000", shell_quote(directory));
        let result = self
            .execute(instance, &command, Privilege::Restricted, FILE_OP_TIMEOUT)
            .await?;
        if !result.success() {
            return Err(SandboxError::Exec {
                id: instance.id.clone(),
                message: format!("listing {directory} failed: {}", result.output_snippet(400)),
            });
        }
        Ok(result
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn destroy(&self, instance: SandboxInstance) -> Result<(), SandboxError> {
        instance.set_lifecycle(Lifecycle::Destroying);
        let _ = self
            .docker
            .stop_container(
                &instance.container_name,
                Some(StopContainerOptionsBuilder::new().t(5).build()),
            )
            .await;
        self.remove_container_if_exists(&instance.container_name)
            .await?;
        if let Err(e) = std::fs::remove_dir_all(&instance.workdir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(SandboxError::Teardown {
                    id: instance.id.clone(),
                    message: format!("workdir removal failed: {e}"),
                });
            }
        }
        instance.set_lifecycle(Lifecycle::Destroyed);
        info!(id = %instance.id, uptime_secs = instance.uptime().as_secs(), "sandbox destroyed");
        Ok(())
    }

    async fn destroy_container(&self, container_name: &str) -> Result<(), SandboxError> {
        let _ = self
            .docker
            .stop_container(
                container_name,
                Some(StopContainerOptionsBuilder::new().t(5).build()),
            )
            .await;
        self.remove_container_if_exists(container_name).await?;
        let workdir = self.workdir_for(container_name);
        if let Err(e) = std::fs::remove_dir_all(&workdir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(SandboxError::Teardown {
                    id: container_name.to_string(),
                    message: format!("workdir removal failed: {e}"),
                });
            }
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), SandboxError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::RuntimeUnavailable(e.to_string()))
    }

    fn policy(&self) -> &PrivilegePolicy {
        &self.policy
    }
}

impl DockerSandbox {
    /// Run an internal file-plumbing command restricted; failures map to
    /// `FileWrite` (or the timeout/resource classes when that is what
    /// actually happened) so callers see typed errors for the operation.
    async fn checked_exec(
        &self,
        instance: &SandboxInstance,
        command: &str,
        path: &str,
    ) -> Result<CommandResult, SandboxError> {
        let result = self
            .execute(instance, command, Privilege::Restricted, FILE_OP_TIMEOUT)
            .await?;
        if result.timed_out {
            return Err(SandboxError::Timeout {
                command: command.to_string(),
                timeout_secs: FILE_OP_TIMEOUT.as_secs(),
            });
        }
        if result.resource_limited() {
            return Err(SandboxError::ResourceLimit {
                command: command.to_string(),
                exit_code: result.exit_code,
            });
        }
        if !result.success() {
            return Err(SandboxError::FileWrite {
                path: path.to_string(),
                reason: result.output_snippet(400),
            });
        }
        Ok(result)
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

fn is_not_found(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError { status_code, .. } if *status_code == 404
    )
}

/// Single-quote a string for `sh -c`, escaping embedded single quotes.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn parent_dir(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    if idx == 0 {
        return None;
    }
    Some(trimmed[..idx].to_string())
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn truncate(s: &str, max_len: usize) -> &str {
    match s.char_indices().nth(max_len) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
