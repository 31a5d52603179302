//! External collaborators consumed by the workflow engine.
//!
//! The engine treats both as opaque, possibly-slow, possibly-failing remote
//! calls: the language model ([`llm`]) and the source-control host
//! ([`github`]). Repository git operations ([`git`]) are not remote calls
//! (they execute inside the job's sandbox) but sit at the same boundary from
//! the engine's point of view.

pub mod git;
pub mod github;
pub mod llm;

pub use github::{GitHubClient, SourceControl};
pub use llm::{HttpLanguageModel, LanguageModel};
