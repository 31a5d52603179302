//! Engine-level integration tests.
//!
//! The workflow engine runs against an in-memory sandbox driver and scripted
//! collaborators, which lets the retry loop, teardown accounting, event
//! ordering, and write-verification behavior be exercised without a container
//! runtime.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use patchpilot::collab::{LanguageModel, SourceControl};
use patchpilot::errors::{CollaboratorError, SandboxError, WorkflowError};
use patchpilot::events::{self, Event, EventKind, EventStream};
use patchpilot::sandbox::{
    CommandResult, Privilege, PrivilegePolicy, SandboxDriver, SandboxInstance, SandboxLimits,
};
use patchpilot::workflow::state::{AgentAction, Plan, WorkflowState};
use patchpilot::workflow::{WorkflowConfig, WorkflowEngine};

// ── Mock sandbox driver ──────────────────────────────────────────────

#[derive(Default)]
struct MockSandbox {
    policy: PrivilegePolicy,
    creates_attempted: AtomicU32,
    creates_succeeded: AtomicU32,
    destroys: AtomicU32,
    /// Inject this many transient provision failures before creates succeed.
    provision_failures: AtomicU32,
    /// Pretend writes succeed without storing anything (a lying driver).
    drop_writes: bool,
    /// Commands containing any of these substrings report a wall-clock
    /// timeout instead of completing.
    timeout_markers: Vec<String>,
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl MockSandbox {
    fn ok(stdout: &str) -> CommandResult {
        CommandResult {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
            duration: Duration::from_millis(1),
            timed_out: false,
        }
    }

    fn failed(exit_code: i64) -> CommandResult {
        CommandResult {
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::from_millis(1),
            timed_out: false,
        }
    }

    fn timed_out() -> CommandResult {
        CommandResult {
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::from_secs(300),
            timed_out: true,
        }
    }
}

/// Contents of the single-quoted arguments in a mock command line.
fn quoted_args(command: &str) -> Vec<String> {
    command
        .split('\'')
        .enumerate()
        .filter(|(i, _)| i % 2 == 1)
        .map(|(_, s)| s.to_string())
        .collect()
}

#[async_trait]
impl SandboxDriver for MockSandbox {
    async fn create(&self, _limits: &SandboxLimits) -> Result<SandboxInstance, SandboxError> {
        let attempt = self.creates_attempted.fetch_add(1, Ordering::SeqCst) + 1;
        if self.provision_failures.load(Ordering::SeqCst) > 0 {
            self.provision_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(SandboxError::Provision(
                "injected transient provisioning failure".to_string(),
            ));
        }
        self.creates_succeeded.fetch_add(1, Ordering::SeqCst);
        // Every attempt gets a fresh environment.
        self.files.lock().unwrap().clear();
        Ok(SandboxInstance::new(
            format!("mock-{attempt}"),
            format!("patchpilot-mock-{attempt}"),
            PathBuf::from(format!("/tmp/patchpilot-mock-{attempt}")),
        ))
    }

    async fn execute(
        &self,
        instance: &SandboxInstance,
        command: &str,
        _privilege: Privilege,
        _timeout: Duration,
    ) -> Result<CommandResult, SandboxError> {
        if self.timeout_markers.iter().any(|m| command.contains(m)) {
            return Ok(Self::timed_out());
        }
        if command.starts_with("git clone") {
            // Seed a plausible checkout at the clone destination.
            let args = quoted_args(command);
            let dest = args.last().cloned().unwrap_or_default();
            let mut files = self.files.lock().unwrap();
            files.insert(format!("{dest}/README.md"), b"# Demo".to_vec());
            files.insert(format!("{dest}/src/app.py"), b"print('hi')\n".to_vec());
            return Ok(Self::ok(""));
        }
        if command.contains("test -f") {
            let args = quoted_args(command);
            let path = args.last().cloned().unwrap_or_default();
            return Ok(if self.files.lock().unwrap().contains_key(&path) {
                Self::ok("")
            } else {
                Self::failed(1)
            });
        }
        if command.contains("status --porcelain") {
            let dirty = !self.files.lock().unwrap().is_empty();
            // The seeded checkout is "clean"; only extra writes make it dirty.
            let modified = self
                .files
                .lock()
                .unwrap()
                .keys()
                .filter(|k| !k.ends_with("README.md") && !k.ends_with("src/app.py"))
                .count();
            return Ok(if dirty && modified > 0 {
                Self::ok(" M src/app.py\n")
            } else {
                Self::ok("")
            });
        }
        if command.contains("rev-parse HEAD") {
            return Ok(Self::ok("0123456789abcdef0123456789abcdef01234567\n"));
        }
        let _ = instance;
        Ok(Self::ok(""))
    }

    async fn write_file(
        &self,
        _instance: &SandboxInstance,
        path: &str,
        bytes: &[u8],
    ) -> Result<(), SandboxError> {
        if self.drop_writes {
            // Claim success without writing: the defect class the engine's
            // verification pass must catch.
            return Ok(());
        }
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn read_file(
        &self,
        _instance: &SandboxInstance,
        path: &str,
    ) -> Result<String, SandboxError> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|b| String::from_utf8_lossy(b).to_string())
            .ok_or_else(|| SandboxError::Exec {
                id: "mock".to_string(),
                message: format!("no such file: {path}"),
            })
    }

    async fn list_files(
        &self,
        _instance: &SandboxInstance,
        directory: &str,
    ) -> Result<Vec<String>, SandboxError> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(directory))
            .cloned()
            .collect())
    }

    async fn destroy(&self, _instance: SandboxInstance) -> Result<(), SandboxError> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn destroy_container(&self, _container_name: &str) -> Result<(), SandboxError> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self) -> Result<(), SandboxError> {
        Ok(())
    }

    fn policy(&self) -> &PrivilegePolicy {
        &self.policy
    }
}

// ── Mock collaborators ───────────────────────────────────────────────

struct MockLlm {
    actions: Mutex<VecDeque<AgentAction>>,
    fail_plan: bool,
}

impl MockLlm {
    fn with_actions(actions: Vec<AgentAction>) -> Self {
        Self {
            actions: Mutex::new(actions.into()),
            fail_plan: false,
        }
    }

    fn failing_plan() -> Self {
        Self {
            actions: Mutex::new(VecDeque::new()),
            fail_plan: true,
        }
    }
}

#[async_trait]
impl LanguageModel for MockLlm {
    async fn plan(&self, _state: &WorkflowState) -> Result<Plan, CollaboratorError> {
        if self.fail_plan {
            return Err(CollaboratorError::Llm(
                "model endpoint permanently unavailable".to_string(),
            ));
        }
        Ok(Plan {
            summary: "Add the requested feature".to_string(),
            steps: vec!["write the code".to_string()],
            files_to_modify: vec![],
            new_files: vec!["src/feature.py".to_string()],
            considerations: vec![],
        })
    }

    async fn propose_next_action(
        &self,
        _state: &WorkflowState,
    ) -> Result<AgentAction, CollaboratorError> {
        Ok(self
            .actions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(AgentAction::Done {
                summary: "nothing left to do".to_string(),
            }))
    }

    async fn suggest_branch_name(&self, _prompt: &str) -> Result<String, CollaboratorError> {
        Ok("feature/test-change".to_string())
    }
}

struct MockSourceControl {
    prs_opened: AtomicU32,
}

impl MockSourceControl {
    fn new() -> Self {
        Self {
            prs_opened: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl SourceControl for MockSourceControl {
    async fn default_branch(&self, _owner_repo: &str) -> Result<String, CollaboratorError> {
        Ok("main".to_string())
    }

    async fn open_pull_request(
        &self,
        owner_repo: &str,
        head: &str,
        base: &str,
        _title: &str,
        _body: &str,
    ) -> Result<String, CollaboratorError> {
        assert_eq!(owner_repo, "octocat/hello-world");
        assert_eq!(base, "main");
        assert!(!head.is_empty());
        self.prs_opened.fetch_add(1, Ordering::SeqCst);
        Ok("https://github.com/octocat/hello-world/pull/42".to_string())
    }
}

// ── Harness ──────────────────────────────────────────────────────────

fn build_engine(
    sandbox: Arc<MockSandbox>,
    llm: Arc<MockLlm>,
    source_control: Arc<MockSourceControl>,
    max_retries: u32,
) -> (
    WorkflowEngine<MockSandbox, MockLlm, MockSourceControl>,
    EventStream,
) {
    let (relay, stream) = events::channel(256);
    let engine = WorkflowEngine::new(
        sandbox,
        llm,
        source_control,
        relay,
        SandboxLimits::default(),
        WorkflowConfig {
            max_retries,
            implement_iteration_cap: 10,
            github_token: Some("test-token".to_string()),
        },
    );
    (engine, stream)
}

fn job_state() -> WorkflowState {
    WorkflowState::new(
        "0123456789abcdef",
        "https://github.com/octocat/hello-world",
        "Add a feature module with a greeting function",
        None,
    )
}

fn default_actions() -> Vec<AgentAction> {
    vec![
        AgentAction::WriteFile {
            path: "src/feature.py".to_string(),
            content: "def greet():\n    return 'hello'\n".to_string(),
            description: "new feature module".to_string(),
        },
        AgentAction::Done {
            summary: "feature implemented".to_string(),
        },
    ]
}

async fn drain(stream: &mut EventStream) -> Vec<Event> {
    let mut events = Vec::new();
    while let Some(event) = stream.recv().await {
        events.push(event);
    }
    events
}

// ── Tests ────────────────────────────────────────────────────────────

#[tokio::test]
async fn full_workflow_reaches_success() {
    let sandbox = Arc::new(MockSandbox::default());
    let llm = Arc::new(MockLlm::with_actions(default_actions()));
    let source_control = Arc::new(MockSourceControl::new());
    let (engine, _stream) = build_engine(sandbox.clone(), llm, source_control.clone(), 2);

    let state = engine.run(job_state()).await.unwrap();

    assert_eq!(state.retry_count, 0);
    assert_eq!(
        state.pr_url.as_deref(),
        Some("https://github.com/octocat/hello-world/pull/42")
    );
    assert!(state.commit_sha.is_some());
    assert!(state
        .branch_name
        .as_deref()
        .unwrap()
        .starts_with("feature/test-change"));
    assert_eq!(state.changes.len(), 1);
    assert_eq!(source_control.prs_opened.load(Ordering::SeqCst), 1);

    // No leaked instances.
    assert_eq!(sandbox.creates_succeeded.load(Ordering::SeqCst), 1);
    assert_eq!(sandbox.destroys.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn events_arrive_in_order_and_end_with_one_terminal() {
    let sandbox = Arc::new(MockSandbox::default());
    let llm = Arc::new(MockLlm::with_actions(default_actions()));
    let source_control = Arc::new(MockSourceControl::new());
    let (engine, mut stream) = build_engine(sandbox, llm, source_control, 2);

    engine.run(job_state()).await.unwrap();
    let events = drain(&mut stream).await;

    // First event is the entry step's progress marker.
    match &events[0].kind {
        EventKind::Progress { step, progress } => {
            assert_eq!(step, "analyze_repository");
            assert_eq!(*progress, 10);
        }
        other => panic!("Expected initial progress event, got {other:?}"),
    }

    // Progress strictly increases through the step sequence (publish order
    // equals consume order).
    let progress: Vec<u8> = events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::Progress { progress, .. } => Some(*progress),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![10, 25, 45, 70, 85, 95]);

    // Exactly one terminal event, and it is last.
    let terminal_count = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminal_count, 1);
    assert!(events.last().unwrap().is_terminal());
    assert!(matches!(
        events.last().unwrap().kind,
        EventKind::Success { .. }
    ));
}

#[tokio::test]
async fn transient_provision_failure_is_retried_once() {
    let sandbox = Arc::new(MockSandbox::default());
    sandbox.provision_failures.store(1, Ordering::SeqCst);
    let llm = Arc::new(MockLlm::with_actions(default_actions()));
    let source_control = Arc::new(MockSourceControl::new());
    let (engine, mut stream) =
        build_engine(sandbox.clone(), llm, source_control, 2);

    let state = engine.run(job_state()).await.unwrap();
    let events = drain(&mut stream).await;

    assert_eq!(state.retry_count, 1);
    assert!(state.pr_url.is_some());
    // Exactly one successful sandbox lifecycle despite two attempts.
    assert_eq!(sandbox.creates_attempted.load(Ordering::SeqCst), 2);
    assert_eq!(sandbox.creates_succeeded.load(Ordering::SeqCst), 1);
    assert_eq!(sandbox.destroys.load(Ordering::SeqCst), 1);
    assert!(matches!(
        events.last().unwrap().kind,
        EventKind::Success { .. }
    ));
}

#[tokio::test]
async fn unrecoverable_failure_aborts_after_exact_retry_budget() {
    let max_retries = 2;
    let sandbox = Arc::new(MockSandbox::default());
    let llm = Arc::new(MockLlm::failing_plan());
    let source_control = Arc::new(MockSourceControl::new());
    let (engine, mut stream) =
        build_engine(sandbox.clone(), llm, source_control.clone(), max_retries);

    let err = engine.run(job_state()).await.unwrap_err();
    let events = drain(&mut stream).await;

    match err {
        WorkflowError::Aborted { retries, last_error } => {
            assert_eq!(retries, max_retries);
            assert!(last_error.contains("permanently unavailable"));
        }
        other => panic!("Expected Aborted, got {other}"),
    }

    // max_retries + 1 full attempts, each with its own sandbox lifecycle.
    assert_eq!(
        sandbox.creates_succeeded.load(Ordering::SeqCst),
        max_retries + 1
    );
    assert_eq!(sandbox.destroys.load(Ordering::SeqCst), max_retries + 1);
    assert_eq!(source_control.prs_opened.load(Ordering::SeqCst), 0);

    // Exactly one terminal error event.
    let errors = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::Error { .. }))
        .count();
    assert_eq!(errors, 1);
    assert!(events.last().unwrap().is_terminal());
}

#[tokio::test]
async fn unverified_writes_never_pass_implement_changes() {
    let sandbox = Arc::new(MockSandbox {
        drop_writes: true,
        ..Default::default()
    });
    let llm = Arc::new(MockLlm::with_actions(default_actions()));
    let source_control = Arc::new(MockSourceControl::new());
    let (engine, _stream) =
        build_engine(sandbox.clone(), llm, source_control.clone(), 0);

    let err = engine.run(job_state()).await.unwrap_err();

    match err {
        WorkflowError::Aborted { last_error, .. } => {
            assert!(
                last_error.contains("does not exist in the sandbox"),
                "unexpected error: {last_error}"
            );
            assert!(last_error.contains("implement_changes"));
        }
        other => panic!("Expected Aborted, got {other}"),
    }
    // Never advanced to commit/push/PR.
    assert_eq!(source_control.prs_opened.load(Ordering::SeqCst), 0);
    assert_eq!(sandbox.creates_succeeded.load(Ordering::SeqCst), 1);
    assert_eq!(sandbox.destroys.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn timed_out_command_is_reported_and_job_continues() {
    let sandbox = Arc::new(MockSandbox {
        timeout_markers: vec!["sleep".to_string()],
        ..Default::default()
    });
    let mut actions = vec![AgentAction::RunCommand {
        command: "sleep 600".to_string(),
    }];
    actions.extend(default_actions());
    let llm = Arc::new(MockLlm::with_actions(actions));
    let source_control = Arc::new(MockSourceControl::new());
    let (engine, mut stream) = build_engine(sandbox, llm, source_control, 0);

    let state = engine.run(job_state()).await.unwrap();
    let events = drain(&mut stream).await;

    assert!(state.pr_url.is_some());
    let timeout_reported = events.iter().any(|e| match &e.kind {
        EventKind::Tool { command, output } => {
            command.contains("sleep") && output.contains("timed out")
        }
        _ => false,
    });
    assert!(timeout_reported, "timeout should surface as a tool event");
}

#[tokio::test]
async fn attempt_with_no_changes_fails_at_commit() {
    let sandbox = Arc::new(MockSandbox::default());
    let llm = Arc::new(MockLlm::with_actions(vec![AgentAction::Done {
        summary: "claims success without doing anything".to_string(),
    }]));
    let source_control = Arc::new(MockSourceControl::new());
    let (engine, _stream) = build_engine(sandbox, llm, source_control.clone(), 0);

    let err = engine.run(job_state()).await.unwrap_err();
    match err {
        WorkflowError::Aborted { last_error, .. } => {
            assert!(last_error.contains("no changes"), "got: {last_error}");
        }
        other => panic!("Expected Aborted, got {other}"),
    }
    assert_eq!(source_control.prs_opened.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn job_survives_client_disconnect() {
    let sandbox = Arc::new(MockSandbox::default());
    let llm = Arc::new(MockLlm::with_actions(default_actions()));
    let source_control = Arc::new(MockSourceControl::new());
    let (engine, stream) =
        build_engine(sandbox.clone(), llm, source_control.clone(), 2);

    // Client goes away before the job even starts.
    drop(stream);

    let state = engine.run(job_state()).await.unwrap();
    assert!(state.pr_url.is_some());
    assert_eq!(source_control.prs_opened.load(Ordering::SeqCst), 1);
    assert_eq!(sandbox.destroys.load(Ordering::SeqCst), 1);
}
