//! The six workflow steps.
//!
//! Each step is a function of the current state plus the collaborators; it
//! mutates only the passed-in `WorkflowState` and reports its result through
//! the event relay before control leaves the step.

use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

use crate::collab::git;
use crate::collab::github::parse_owner_repo;
use crate::collab::{LanguageModel, SourceControl};
use crate::errors::WorkflowError;
use crate::events::Event;
use crate::sandbox::docker::{shell_quote, WORKSPACE};
use crate::sandbox::{SandboxDriver, SandboxInstance};
use crate::workflow::engine::WorkflowEngine;
use crate::workflow::state::{AgentAction, ChangeAction, FileChange, RepoAnalysis, WorkflowState};

impl<S, L, G> WorkflowEngine<S, L, G>
where
    S: SandboxDriver,
    L: LanguageModel,
    G: SourceControl,
{
    pub(crate) async fn analyze_repository(
        &self,
        instance: &SandboxInstance,
        state: &mut WorkflowState,
    ) -> Result<(), WorkflowError> {
        let repo_name = repo_name_from_url(&state.repo_url);
        let repo_path = format!("{WORKSPACE}/{repo_name}");
        let timeout = self.limits.command_timeout();

        git::clone_repository(
            self.sandbox.as_ref(),
            instance,
            &state.repo_url,
            &repo_path,
            self.config.github_token.as_deref(),
            timeout,
        )
        .await
        .map_err(|e| WorkflowError::step("analyze_repository", e.to_string()))?;

        git::configure_identity(self.sandbox.as_ref(), instance, &repo_path, timeout)
            .await
            .map_err(|e| WorkflowError::step("analyze_repository", e.to_string()))?;

        let files = self.sandbox.list_files(instance, &repo_path).await?;
        let prefix = format!("{repo_path}/");
        let relative: Vec<String> = files
            .iter()
            .filter(|f| !f.contains("/.git/"))
            .map(|f| f.strip_prefix(&prefix).unwrap_or(f).to_string())
            .collect();
        let analysis = RepoAnalysis::from_files(relative);

        self.relay
            .publish(Event::message(format!(
                "Repository analyzed: {}",
                analysis.summary()
            )))
            .await;
        state.repo_path = Some(repo_path);
        state.analysis = Some(analysis);
        Ok(())
    }

    pub(crate) async fn create_plan(&self, state: &mut WorkflowState) -> Result<(), WorkflowError> {
        let plan = self.llm.plan(state).await?;
        self.relay
            .publish(Event::message(format!("Plan created: {}", plan.summary)))
            .await;
        state.plan = Some(plan);
        Ok(())
    }

    pub(crate) async fn implement_changes(
        &self,
        instance: &SandboxInstance,
        state: &mut WorkflowState,
    ) -> Result<(), WorkflowError> {
        let repo_path = state.repo_path.clone().ok_or_else(|| {
            WorkflowError::step("implement_changes", "repository path missing from state")
        })?;
        let timeout = self.limits.command_timeout();

        let branch = self.resolve_branch_name(state).await;
        git::create_branch(self.sandbox.as_ref(), instance, &repo_path, &branch, timeout)
            .await
            .map_err(|e| WorkflowError::step("implement_changes", e.to_string()))?;
        self.relay
            .publish(Event::message(format!("Working on branch {branch}")))
            .await;
        state.branch_name = Some(branch);

        let mut completed = false;
        for _ in 0..self.config.implement_iteration_cap {
            match self.llm.propose_next_action(state).await? {
                AgentAction::WriteFile {
                    path,
                    content,
                    description,
                } => {
                    let rel = normalize_repo_path(&path).ok_or_else(|| {
                        WorkflowError::step(
                            "implement_changes",
                            format!("refusing path outside the repository: {path}"),
                        )
                    })?;
                    let full = format!("{repo_path}/{rel}");
                    let existed = self.file_exists(instance, &full).await?;
                    self.sandbox
                        .write_file(instance, &full, content.as_bytes())
                        .await?;
                    state.changes.push(FileChange {
                        path: rel.clone(),
                        action: if existed {
                            ChangeAction::Modified
                        } else {
                            ChangeAction::Created
                        },
                        description,
                    });
                    self.relay
                        .publish(Event::tool(
                            format!("write {rel}"),
                            format!("{} bytes written and verified", content.len()),
                        ))
                        .await;
                }
                AgentAction::RunCommand { command } => {
                    // Privilege is decided from the raw command; the cd
                    // wrapper would otherwise force everything restricted.
                    let privilege = self.sandbox.policy().privilege_for(&command);
                    let wrapped = format!("cd {} && {}", shell_quote(&repo_path), command);
                    let result = self
                        .sandbox
                        .execute(instance, &wrapped, privilege, timeout)
                        .await?;
                    let output = if result.timed_out {
                        format!(
                            "timed out after {}s; process terminated",
                            self.limits.command_timeout_secs
                        )
                    } else if result.resource_limited() {
                        format!("killed: resource limit exceeded (exit {})", result.exit_code)
                    } else {
                        format!(
                            "exit {}: {}",
                            result.exit_code,
                            result.output_snippet(400)
                        )
                    };
                    self.relay.publish(Event::tool(command, output)).await;
                }
                AgentAction::Done { summary } => {
                    self.relay
                        .publish(Event::message(format!("Implementation complete: {summary}")))
                        .await;
                    completed = true;
                    break;
                }
            }
        }
        if !completed {
            self.relay
                .publish(Event::message(format!(
                    "Iteration cap ({}) reached; proceeding with the changes made so far",
                    self.config.implement_iteration_cap
                )))
                .await;
        }

        // Write-then-verify: never report this step successful on the
        // strength of the model's claims alone. Every recorded change must
        // be independently observable inside the sandbox.
        for change in &state.changes {
            let full = format!("{repo_path}/{}", change.path);
            if !self.file_exists(instance, &full).await? {
                return Err(WorkflowError::step(
                    "implement_changes",
                    format!(
                        "claimed file {} does not exist in the sandbox",
                        change.path
                    ),
                ));
            }
        }
        Ok(())
    }

    pub(crate) async fn commit_changes(
        &self,
        instance: &SandboxInstance,
        state: &mut WorkflowState,
    ) -> Result<(), WorkflowError> {
        let repo_path = state.repo_path.clone().ok_or_else(|| {
            WorkflowError::step("commit_changes", "repository path missing from state")
        })?;
        let timeout = self.limits.command_timeout();

        let staged = git::stage_and_status(self.sandbox.as_ref(), instance, &repo_path, timeout)
            .await
            .map_err(|e| WorkflowError::step("commit_changes", e.to_string()))?;
        if staged.is_empty() {
            // An attempt that changed nothing is a failure, not a quiet
            // success with no commit behind it.
            return Err(WorkflowError::step(
                "commit_changes",
                "working tree has no changes to commit",
            ));
        }

        let message = first_line_truncated(&state.prompt, 72);
        let sha = git::commit(self.sandbox.as_ref(), instance, &repo_path, &message, timeout)
            .await
            .map_err(|e| WorkflowError::step("commit_changes", e.to_string()))?;
        self.relay
            .publish(Event::tool(
                "git commit",
                format!("{} ({} paths staged)", &sha[..sha.len().min(12)], staged.len()),
            ))
            .await;
        state.commit_sha = Some(sha);
        Ok(())
    }

    pub(crate) async fn push_changes(
        &self,
        instance: &SandboxInstance,
        state: &mut WorkflowState,
    ) -> Result<(), WorkflowError> {
        let repo_path = state.repo_path.clone().ok_or_else(|| {
            WorkflowError::step("push_changes", "repository path missing from state")
        })?;
        let branch = state.branch_name.clone().ok_or_else(|| {
            WorkflowError::step("push_changes", "branch name missing from state")
        })?;

        git::push(
            self.sandbox.as_ref(),
            instance,
            &repo_path,
            &state.repo_url,
            &branch,
            self.config.github_token.as_deref(),
            self.limits.command_timeout(),
        )
        .await
        .map_err(|e| WorkflowError::step("push_changes", e.to_string()))?;
        self.relay
            .publish(Event::tool("git push", format!("pushed {branch}")))
            .await;
        Ok(())
    }

    pub(crate) async fn create_pull_request(
        &self,
        state: &mut WorkflowState,
    ) -> Result<(), WorkflowError> {
        let owner_repo = parse_owner_repo(&state.repo_url).ok_or_else(|| {
            WorkflowError::step(
                "create_pull_request",
                format!("cannot extract owner/repo from {}", state.repo_url),
            )
        })?;
        let branch = state.branch_name.clone().ok_or_else(|| {
            WorkflowError::step("create_pull_request", "branch name missing from state")
        })?;

        let base = match self.source_control.default_branch(&owner_repo).await {
            Ok(base) => base,
            Err(e) => {
                warn!(error = %e, "default branch lookup failed; assuming main");
                "main".to_string()
            }
        };
        let title = first_line_truncated(&state.prompt, 72);
        let body = pr_body(state);
        let url = self
            .source_control
            .open_pull_request(&owner_repo, &branch, &base, &title, &body)
            .await?;
        self.relay
            .publish(Event::message(format!("Pull request opened: {url}")))
            .await;
        state.pr_url = Some(url);
        Ok(())
    }

    // ── Step helpers ─────────────────────────────────────────────────

    async fn resolve_branch_name(&self, state: &WorkflowState) -> String {
        if let Some(requested) = &state.requested_branch {
            let name = sanitize_branch_name(requested);
            if !name.is_empty() {
                return name;
            }
        }
        let suggested = match self.llm.suggest_branch_name(&state.prompt).await {
            Ok(name) => sanitize_branch_name(&name),
            Err(e) => {
                warn!(error = %e, "branch name suggestion failed; deriving from prompt");
                String::new()
            }
        };
        let stem = if suggested.is_empty() {
            format!("feature/{}", slugify(&state.prompt, 40))
        } else {
            suggested
        };
        // Suffix with the job id so reruns of the same prompt never collide.
        let suffix: String = state.job_id.chars().take(8).collect();
        format!("{stem}-{suffix}")
    }

    async fn file_exists(
        &self,
        instance: &SandboxInstance,
        full_path: &str,
    ) -> Result<bool, WorkflowError> {
        let command = format!("test -f {}", shell_quote(full_path));
        let result = self
            .sandbox
            .run(instance, &command, self.limits.command_timeout())
            .await?;
        Ok(result.success())
    }
}

// ── Pure helpers ─────────────────────────────────────────────────────

fn repo_name_from_url(repo_url: &str) -> String {
    let trimmed = repo_url.trim_end_matches('/').trim_end_matches(".git");
    trimmed
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("repo")
        .to_string()
}

/// Reject absolute paths and traversal; return the normalized relative path.
fn normalize_repo_path(path: &str) -> Option<String> {
    let rel = path.trim().trim_start_matches('/');
    if rel.is_empty() || rel.split('/').any(|seg| seg == "..") {
        return None;
    }
    Some(rel.to_string())
}

/// Kebab-case slug of a title, capped at `max_len` characters.
fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    slug.chars().take(max_len).collect::<String>()
        .trim_end_matches('-')
        .to_string()
}

/// Strip everything a git ref cannot carry, lowercase, and ensure a
/// conventional type prefix.
fn sanitize_branch_name(raw: &str) -> String {
    static BRANCH_CHARS: OnceLock<Regex> = OnceLock::new();
    let re = BRANCH_CHARS.get_or_init(|| Regex::new(r"[^a-zA-Z0-9\-/]").expect("valid regex"));
    let cleaned = re.replace_all(raw.trim(), "").to_lowercase();
    let cleaned = cleaned.trim_matches('/').trim_matches('-').to_string();
    if cleaned.is_empty() {
        return String::new();
    }
    let prefixed = if ["feature/", "fix/", "add/", "update/", "improve/"]
        .iter()
        .any(|p| cleaned.starts_with(p))
    {
        cleaned
    } else {
        format!("feature/{cleaned}")
    };
    prefixed.chars().take(60).collect::<String>()
        .trim_end_matches(['-', '/'])
        .to_string()
}

fn first_line_truncated(text: &str, max_len: usize) -> String {
    let first_line = text.lines().next().unwrap_or(text).trim();
    first_line.chars().take(max_len).collect()
}

fn pr_body(state: &WorkflowState) -> String {
    let summary = state
        .plan
        .as_ref()
        .map(|p| p.summary.clone())
        .unwrap_or_else(|| state.prompt.clone());
    let mut body = format!("## Summary\n\n{summary}\n");
    if !state.changes.is_empty() {
        body.push_str("\n## Changes\n\n");
        for change in &state.changes {
            let verb = match change.action {
                ChangeAction::Created => "created",
                ChangeAction::Modified => "modified",
            };
            if change.description.is_empty() {
                body.push_str(&format!("- `{}` ({verb})\n", change.path));
            } else {
                body.push_str(&format!(
                    "- `{}` ({verb}): {}\n",
                    change.path, change.description
                ));
            }
        }
    }
    body.push_str("\n---\n*Opened by patchpilot*\n");
    body
}
