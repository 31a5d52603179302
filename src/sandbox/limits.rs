//! Resource limits and the privilege policy for sandboxed execution.

use serde::Deserialize;
use std::time::Duration;

use crate::errors::SandboxError;

/// Resource and image configuration for one sandbox.
///
/// Loaded from the `[sandbox]` section of `patchpilot.toml`; every field has
/// a default so a missing file yields a working configuration. The default
/// image is a minimal Alpine: it boots fast, and the provisioning step
/// installs the package manager payloads (git, python) the generated code
/// needs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxLimits {
    pub image: String,
    pub memory_bytes: i64,
    pub cpus: f64,
    pub pids_limit: i64,
    pub command_timeout_secs: u64,
    /// Size of the tmpfs scratch area at /tmp, mounted noexec,nosuid.
    pub scratch_size_mb: u64,
    /// Packages installed (elevated) right after the container starts.
    pub setup_packages: Vec<String>,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            image: "alpine:latest".to_string(),
            memory_bytes: 512 * 1024 * 1024,
            cpus: 0.5,
            pids_limit: 100,
            command_timeout_secs: 300,
            scratch_size_mb: 100,
            setup_packages: vec![
                "git".to_string(),
                "python3".to_string(),
                "py3-pip".to_string(),
            ],
        }
    }
}

impl SandboxLimits {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn nano_cpus(&self) -> i64 {
        (self.cpus * 1_000_000_000.0) as i64
    }

    pub fn tmpfs_options(&self) -> String {
        format!("rw,noexec,nosuid,size={}m", self.scratch_size_mb)
    }

    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.image.trim().is_empty() {
            return Err(SandboxError::InvalidLimits("image must not be empty".into()));
        }
        if self.memory_bytes <= 0 {
            return Err(SandboxError::InvalidLimits(format!(
                "memory_bytes must be positive, got {}",
                self.memory_bytes
            )));
        }
        if self.cpus <= 0.0 {
            return Err(SandboxError::InvalidLimits(format!(
                "cpus must be positive, got {}",
                self.cpus
            )));
        }
        if self.pids_limit <= 0 {
            return Err(SandboxError::InvalidLimits(format!(
                "pids_limit must be positive, got {}",
                self.pids_limit
            )));
        }
        if self.command_timeout_secs == 0 {
            return Err(SandboxError::InvalidLimits(
                "command_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

// ── Privilege policy ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// Root inside the container; reserved for provisioning commands.
    Elevated,
    /// Unprivileged uid:gid for everything generated or untrusted.
    Restricted,
}

impl Privilege {
    pub fn user(&self) -> &'static str {
        match self {
            Privilege::Elevated => "root",
            Privilege::Restricted => "1000:1000",
        }
    }
}

/// Declarative mapping from a command to its privilege level: commands whose
/// first word matches an elevated prefix (package managers) run as root,
/// everything else runs restricted.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrivilegePolicy {
    pub elevated_prefixes: Vec<String>,
}

impl Default for PrivilegePolicy {
    fn default() -> Self {
        Self {
            elevated_prefixes: vec!["apk".to_string(), "apt-get".to_string()],
        }
    }
}

impl PrivilegePolicy {
    pub fn privilege_for(&self, command: &str) -> Privilege {
        let first_word = command.trim().split_whitespace().next().unwrap_or("");
        if self.elevated_prefixes.iter().any(|p| p == first_word) {
            Privilege::Elevated
        } else {
            Privilege::Restricted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_are_valid() {
        let limits = SandboxLimits::default();
        limits.validate().unwrap();
        assert_eq!(limits.image, "alpine:latest");
        assert_eq!(limits.memory_bytes, 512 * 1024 * 1024);
        assert_eq!(limits.pids_limit, 100);
        assert_eq!(limits.tmpfs_options(), "rw,noexec,nosuid,size=100m");
    }

    #[test]
    fn nano_cpus_conversion() {
        let limits = SandboxLimits {
            cpus: 0.5,
            ..Default::default()
        };
        assert_eq!(limits.nano_cpus(), 500_000_000);
    }

    #[test]
    fn invalid_limits_are_rejected() {
        let mut limits = SandboxLimits::default();
        limits.memory_bytes = 0;
        assert!(limits.validate().is_err());

        let mut limits = SandboxLimits::default();
        limits.cpus = -1.0;
        assert!(limits.validate().is_err());

        let mut limits = SandboxLimits::default();
        limits.image = "  ".to_string();
        assert!(limits.validate().is_err());

        let mut limits = SandboxLimits::default();
        limits.command_timeout_secs = 0;
        assert!(limits.validate().is_err());
    }

    #[test]
    fn package_managers_run_elevated_everything_else_restricted() {
        let policy = PrivilegePolicy::default();
        assert_eq!(
            policy.privilege_for("apk add --no-cache git"),
            Privilege::Elevated
        );
        assert_eq!(
            policy.privilege_for("  apt-get install -y curl"),
            Privilege::Elevated
        );
        assert_eq!(policy.privilege_for("git clone x"), Privilege::Restricted);
        assert_eq!(policy.privilege_for("rm -rf /"), Privilege::Restricted);
        // Prefix must match the whole first word; no substring tricks.
        assert_eq!(
            policy.privilege_for("apkful-tool --run"),
            Privilege::Restricted
        );
        assert_eq!(policy.privilege_for(""), Privilege::Restricted);
    }

    #[test]
    fn privilege_user_mapping() {
        assert_eq!(Privilege::Elevated.user(), "root");
        assert_eq!(Privilege::Restricted.user(), "1000:1000");
    }
}
