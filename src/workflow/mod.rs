//! Workflow engine.
//!
//! A finite-state machine over named steps:
//!
//! ```text
//! analyze_repository → create_plan → implement_changes
//!        → commit_changes → push_changes → create_pull_request → success
//! ```
//!
//! Every step either continues to the next in sequence or routes to the
//! engine's error handler, which restarts the whole sequence from the entry
//! state until the retry budget is exhausted. Each attempt provisions its own
//! sandbox and tears it down on every exit path.

pub mod engine;
pub mod state;
mod steps;

pub use engine::{WorkflowConfig, WorkflowEngine};
pub use state::WorkflowState;
