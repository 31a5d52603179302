//! Runtime configuration for patchpilot.
//!
//! Settings come from `patchpilot.toml` (every section optional, defaults
//! apply when the file is missing) plus environment variables for secrets:
//! `GITHUB_TOKEN` and `LLM_API_KEY` are never read from the file.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::sandbox::{PrivilegePolicy, SandboxLimits};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Binds on all interfaces and relaxes CORS.
    pub dev_mode: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkflowSettings {
    pub max_retries: u32,
    pub implement_iteration_cap: u32,
    /// Whole-job deadline, distinct from the per-command timeout.
    pub job_timeout_secs: u64,
    pub max_concurrent_jobs: usize,
    pub event_buffer: usize,
    pub keepalive_secs: u64,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            max_retries: 2,
            implement_iteration_cap: 20,
            job_timeout_secs: 1800,
            max_concurrent_jobs: 5,
            event_buffer: crate::events::relay::DEFAULT_CAPACITY,
            keepalive_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub api_url: String,
    pub model: String,
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GitHubSettings {
    pub api_url: String,
    #[serde(skip)]
    pub token: Option<String>,
}

impl Default for GitHubSettings {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub sandbox: SandboxLimits,
    pub policy: PrivilegePolicy,
    pub workflow: WorkflowSettings,
    pub llm: LlmSettings,
    pub github: GitHubSettings,
}

impl Settings {
    /// Load from an explicit path, or `./patchpilot.toml` when present, or
    /// defaults. Secrets are then filled in from the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let default_path = Path::new("patchpilot.toml");
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        settings.llm.api_key = non_empty_env("LLM_API_KEY");
        settings.github.token = non_empty_env("GITHUB_TOKEN");
        Ok(settings)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.workflow.job_timeout_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.workflow.keepalive_secs.max(1))
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn defaults_are_sensible() {
        let settings = Settings::default();
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.workflow.max_retries, 2);
        assert_eq!(settings.workflow.max_concurrent_jobs, 5);
        assert_eq!(settings.sandbox.image, "alpine:latest");
        assert!(settings.github.token.is_none());
    }

    #[test]
    fn load_without_file_falls_back_to_defaults() {
        // No patchpilot.toml ships with the repository, so a bare load
        // resolves to defaults.
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.sandbox.image, "alpine:latest");
    }

    #[test]
    fn load_full_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patchpilot.toml");
        fs::write(
            &path,
            r#"
[server]
port = 9090
dev_mode = true

[sandbox]
image = "alpine:3.20"
memory_bytes = 268435456
cpus = 1.0

[workflow]
max_retries = 5
job_timeout_secs = 600

[llm]
model = "gpt-4o-mini"
"#,
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.server.port, 9090);
        assert!(settings.server.dev_mode);
        assert_eq!(settings.sandbox.image, "alpine:3.20");
        assert_eq!(settings.sandbox.memory_bytes, 268_435_456);
        assert_eq!(settings.workflow.max_retries, 5);
        assert_eq!(settings.job_timeout(), Duration::from_secs(600));
        assert_eq!(settings.llm.model, "gpt-4o-mini");
        // Untouched sections keep defaults.
        assert_eq!(settings.workflow.max_concurrent_jobs, 5);
        assert_eq!(settings.sandbox.pids_limit, 100);
    }

    #[test]
    fn load_partial_sandbox_section_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patchpilot.toml");
        fs::write(&path, "[sandbox]\nimage = \"python:3.12-slim\"\n").unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.sandbox.image, "python:3.12-slim");
        assert_eq!(settings.sandbox.memory_bytes, 512 * 1024 * 1024);
        assert_eq!(settings.server.port, 8080);
    }

    #[test]
    fn load_invalid_toml_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patchpilot.toml");
        fs::write(&path, "not valid toml {{{{").unwrap();
        assert!(Settings::load(Some(&path)).is_err());
    }

    #[test]
    fn secrets_are_not_readable_from_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patchpilot.toml");
        // serde(skip) means a token in the file is ignored rather than loaded.
        fs::write(&path, "[github]\ntoken = \"leaked\"\n").unwrap();
        let settings = Settings::from_file(&path).unwrap();
        assert!(settings.github.token.is_none());
    }
}
