//! Source-control collaborator: GitHub's REST API.

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::config::GitHubSettings;
use crate::errors::CollaboratorError;

#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Default branch of the repository, used as the pull-request base.
    async fn default_branch(&self, owner_repo: &str) -> Result<String, CollaboratorError>;

    /// Open a pull request and return its URL.
    async fn open_pull_request(
        &self,
        owner_repo: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<String, CollaboratorError>;
}

pub struct GitHubClient {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl GitHubClient {
    pub fn new(settings: &GitHubSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: settings.api_url.trim_end_matches('/').to_string(),
            token: settings.token.clone(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.token.is_some()
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder
            .header("User-Agent", "patchpilot")
            .header("Accept", "application/vnd.github+json");
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl SourceControl for GitHubClient {
    async fn default_branch(&self, owner_repo: &str) -> Result<String, CollaboratorError> {
        let url = format!("{}/repos/{}", self.api_url, owner_repo);
        let response = self
            .request(self.client.get(&url))
            .send()
            .await
            .map_err(|e| CollaboratorError::SourceControl(format!("request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CollaboratorError::SourceControl(format!(
                "repository lookup for {owner_repo} returned {status}"
            )));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CollaboratorError::SourceControl(format!("invalid response: {e}")))?;
        body["default_branch"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                CollaboratorError::InvalidResponse("repository missing default_branch".to_string())
            })
    }

    async fn open_pull_request(
        &self,
        owner_repo: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<String, CollaboratorError> {
        let url = format!("{}/repos/{}/pulls", self.api_url, owner_repo);
        let response = self
            .request(self.client.post(&url))
            .json(&json!({
                "title": title,
                "body": body,
                "head": head,
                "base": base,
            }))
            .send()
            .await
            .map_err(|e| CollaboratorError::SourceControl(format!("request failed: {e}")))?;
        let status = response.status();
        let payload: serde_json::Value = response.json().await.unwrap_or_default();
        if !status.is_success() {
            let message = payload["message"].as_str().unwrap_or("unknown error");
            return Err(CollaboratorError::SourceControl(format!(
                "pull request creation returned {status}: {message}"
            )));
        }
        let pr_url = payload["html_url"].as_str().map(str::to_string).ok_or_else(|| {
            CollaboratorError::InvalidResponse("pull request response missing html_url".to_string())
        })?;
        info!(pr_url = %pr_url, "pull request opened");
        Ok(pr_url)
    }
}

/// Extract `owner/repo` from the GitHub URL formats we accept.
pub fn parse_owner_repo(url: &str) -> Option<String> {
    let url = url.trim().trim_end_matches('/').trim_end_matches(".git");
    if let Some(pos) = url.find("github.com/") {
        let rest = &url[pos + "github.com/".len()..];
        let parts: Vec<&str> = rest.splitn(3, '/').collect();
        if parts.len() >= 2 && !parts[0].is_empty() && !parts[1].is_empty() {
            return Some(format!("{}/{}", parts[0], parts[1]));
        }
    }
    None
}
