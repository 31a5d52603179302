//! Workflow state: the per-job context threaded through the state machine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::CollaboratorError;

// ── Step state machine ───────────────────────────────────────────────

/// Named states of the workflow. Every step has two logical outgoing edges:
/// `continue` (encoded by [`Step::next`]) and `error` (routed by the engine
/// to its single error handler).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    AnalyzeRepository,
    CreatePlan,
    ImplementChanges,
    CommitChanges,
    PushChanges,
    CreatePullRequest,
}

impl Step {
    pub fn entry() -> Self {
        Step::AnalyzeRepository
    }

    pub fn next(self) -> Option<Step> {
        match self {
            Step::AnalyzeRepository => Some(Step::CreatePlan),
            Step::CreatePlan => Some(Step::ImplementChanges),
            Step::ImplementChanges => Some(Step::CommitChanges),
            Step::CommitChanges => Some(Step::PushChanges),
            Step::PushChanges => Some(Step::CreatePullRequest),
            Step::CreatePullRequest => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Step::AnalyzeRepository => "analyze_repository",
            Step::CreatePlan => "create_plan",
            Step::ImplementChanges => "implement_changes",
            Step::CommitChanges => "commit_changes",
            Step::PushChanges => "push_changes",
            Step::CreatePullRequest => "create_pull_request",
        }
    }

    /// Coarse progress figure reported when the step begins.
    pub fn progress_percent(&self) -> u8 {
        match self {
            Step::AnalyzeRepository => 10,
            Step::CreatePlan => 25,
            Step::ImplementChanges => 45,
            Step::CommitChanges => 70,
            Step::PushChanges => 85,
            Step::CreatePullRequest => 95,
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ── Repository analysis ──────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoAnalysis {
    pub files: Vec<String>,
    pub file_count: usize,
    /// Language name -> file count, by extension.
    pub languages: BTreeMap<String, usize>,
    pub key_files: Vec<String>,
}

impl RepoAnalysis {
    pub fn from_files(files: Vec<String>) -> Self {
        let mut languages: BTreeMap<String, usize> = BTreeMap::new();
        for file in &files {
            if let Some(lang) = language_for(file) {
                *languages.entry(lang.to_string()).or_insert(0) += 1;
            }
        }
        let key_files = identify_key_files(&files);
        Self {
            file_count: files.len(),
            files,
            languages,
            key_files,
        }
    }

    pub fn summary(&self) -> String {
        let langs: Vec<String> = self
            .languages
            .iter()
            .map(|(lang, count)| format!("{lang} ({count})"))
            .collect();
        format!(
            "{} files; languages: {}; key files: {}",
            self.file_count,
            if langs.is_empty() {
                "none detected".to_string()
            } else {
                langs.join(", ")
            },
            self.key_files.join(", ")
        )
    }
}

fn language_for(file: &str) -> Option<&'static str> {
    let ext = file.rsplit_once('.')?.1.to_ascii_lowercase();
    let lang = match ext.as_str() {
        "py" => "Python",
        "js" => "JavaScript",
        "jsx" => "JSX",
        "ts" => "TypeScript",
        "tsx" => "TSX",
        "rs" => "Rust",
        "go" => "Go",
        "java" => "Java",
        "rb" => "Ruby",
        "php" => "PHP",
        "c" => "C",
        "cpp" | "cc" => "C++",
        "cs" => "C#",
        "html" => "HTML",
        "css" => "CSS",
        "vue" => "Vue",
        _ => return None,
    };
    Some(lang)
}

/// Files that anchor an implementation plan: manifests, entry points, docs.
fn identify_key_files(files: &[String]) -> Vec<String> {
    const KEY_NAMES: &[&str] = &[
        "README.md",
        "package.json",
        "requirements.txt",
        "pyproject.toml",
        "Cargo.toml",
        "go.mod",
        "Dockerfile",
        "docker-compose.yml",
        "Makefile",
        "main.py",
        "app.py",
        "server.py",
        "index.js",
        "index.ts",
        "main.js",
        "App.js",
        "App.jsx",
        "App.tsx",
    ];
    let mut key_files: Vec<String> = files
        .iter()
        .filter(|f| {
            let basename = f.rsplit('/').next().unwrap_or(f);
            KEY_NAMES.iter().any(|k| k.eq_ignore_ascii_case(basename))
        })
        .cloned()
        .collect();
    key_files.sort();
    key_files.dedup();
    key_files
}

// ── Plan and agent actions ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub summary: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub files_to_modify: Vec<String>,
    #[serde(default)]
    pub new_files: Vec<String>,
    #[serde(default)]
    pub considerations: Vec<String>,
}

impl Plan {
    /// Parse a plan out of a model response, tolerating markdown fences and
    /// prose around the JSON object.
    pub fn parse(raw: &str) -> Result<Self, CollaboratorError> {
        serde_json::from_str(extract_json_object(raw))
            .map_err(|e| CollaboratorError::InvalidResponse(format!("plan was not valid JSON: {e}")))
    }
}

/// One move proposed by the language model inside `implement_changes`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AgentAction {
    WriteFile {
        path: String,
        content: String,
        #[serde(default)]
        description: String,
    },
    RunCommand {
        command: String,
    },
    Done {
        summary: String,
    },
}

impl AgentAction {
    pub fn parse(raw: &str) -> Result<Self, CollaboratorError> {
        serde_json::from_str(extract_json_object(raw)).map_err(|e| {
            CollaboratorError::InvalidResponse(format!("action was not valid JSON: {e}"))
        })
    }
}

/// Trim a response down to its outermost JSON object.
fn extract_json_object(raw: &str) -> &str {
    match (raw.find('{'), raw.rfind('}')) {
        (Some(start), Some(end)) if end > start => &raw[start..=end],
        _ => raw,
    }
}

// ── File changes ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Created,
    Modified,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
    /// Path relative to the repository root.
    pub path: String,
    pub action: ChangeAction,
    pub description: String,
}

// ── Workflow state ───────────────────────────────────────────────────

/// Accumulated job context. Mutated only by the workflow engine, one step at
/// a time; the stream-serving side never touches it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub job_id: String,
    pub repo_url: String,
    pub prompt: String,
    pub requested_branch: Option<String>,

    /// Repository checkout path inside the sandbox.
    pub repo_path: Option<String>,
    pub analysis: Option<RepoAnalysis>,
    pub plan: Option<Plan>,
    pub changes: Vec<FileChange>,
    pub branch_name: Option<String>,
    pub commit_sha: Option<String>,
    pub pr_url: Option<String>,

    pub current_step: Step,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl WorkflowState {
    pub fn new(
        job_id: impl Into<String>,
        repo_url: impl Into<String>,
        prompt: impl Into<String>,
        requested_branch: Option<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            repo_url: repo_url.into(),
            prompt: prompt.into(),
            requested_branch,
            repo_path: None,
            analysis: None,
            plan: None,
            changes: Vec::new(),
            branch_name: None,
            commit_sha: None,
            pr_url: None,
            current_step: Step::entry(),
            retry_count: 0,
            last_error: None,
        }
    }

    /// Full restart: discard all per-attempt progress, keeping only the
    /// original inputs, the retry counter, and the last recorded error.
    /// Partial state from a failed attempt is never resumed.
    pub fn reset_for_retry(&mut self) {
        self.repo_path = None;
        self.analysis = None;
        self.plan = None;
        self.changes.clear();
        self.branch_name = None;
        self.commit_sha = None;
        self.pr_url = None;
        self.current_step = Step::entry();
    }
}
