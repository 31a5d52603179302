//! Progress events and the per-job relay that carries them to the client.
//!
//! Every unit of progress the workflow engine reports is an [`Event`]: a closed
//! tagged union serialized as one JSON object per server-sent frame. The
//! [`relay`] module provides the bounded FIFO channel that moves events from
//! the background job onto the live stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod relay;

pub use relay::{channel, EventRelay, EventStream};

// ── Event payload variants ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Coarse progress through the workflow, 0-100.
    Progress { progress: u8, step: String },

    /// Informational message for the client log.
    Message { message: String },

    /// A command or file operation executed inside the sandbox.
    Tool { command: String, output: String },

    /// Terminal: the job finished and (usually) produced a pull request.
    Success {
        context: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pr_url: Option<String>,
    },

    /// Terminal: the job failed and was abandoned.
    Error { error: String },

    /// Injected by the relay on an idle timer to keep the transport alive.
    /// Consumers treat these as no-ops.
    Keepalive,

    /// Forward-compatibility fallback for consumers of this enum: an event
    /// type this version does not know about.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    #[serde(flatten)]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
        }
    }

    pub fn progress(progress: u8, step: impl Into<String>) -> Self {
        Self::new(EventKind::Progress {
            progress: progress.min(100),
            step: step.into(),
        })
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self::new(EventKind::Message {
            message: message.into(),
        })
    }

    pub fn tool(command: impl Into<String>, output: impl Into<String>) -> Self {
        Self::new(EventKind::Tool {
            command: command.into(),
            output: output.into(),
        })
    }

    pub fn success(context: impl Into<String>, pr_url: Option<String>) -> Self {
        Self::new(EventKind::Success {
            context: context.into(),
            pr_url,
        })
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::new(EventKind::Error {
            error: error.into(),
        })
    }

    pub fn keepalive() -> Self {
        Self::new(EventKind::Keepalive)
    }

    /// Terminal events end the stream for their job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::Success { .. } | EventKind::Error { .. }
        )
    }

    /// Serialize for the wire. Serialization of these closed types cannot
    /// realistically fail, but the stream must never die on a bad frame, so
    /// fall back to a hand-built error object.
    pub fn to_wire_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"type":"error","error":"event serialization failed: {}"}}"#,
                e
            )
        })
    }
}
