use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::content::PhaseContent;
use crate::ids::{MessageId, ThreadId};
use crate::phase::Phase;
use crate::priors::Prior;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Author {
    User,
    Ai,
}

/// A conversation message. Immutable once created, except that an assistant
/// message's `content` is written exactly once when its cycle yields.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub content: String,
    pub author: Author,
    pub thread_id: ThreadId,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn user(content: impl Into<String>, thread_id: ThreadId) -> Self {
        Self {
            id: MessageId::new(),
            content: content.into(),
            author: Author::User,
            thread_id,
            timestamp: Utc::now(),
        }
    }

    /// Empty-content companion created alongside every user message and
    /// filled in when the cycle yields.
    pub fn assistant_placeholder(thread_id: ThreadId) -> Self {
        Self {
            id: MessageId::new(),
            content: String::new(),
            author: Author::Ai,
            thread_id,
            timestamp: Utc::now(),
        }
    }

    pub fn is_pending_assistant(&self) -> bool {
        self.author == Author::Ai && self.content.is_empty()
    }
}

/// Rendering status of a recorded step. `Pending` is never produced by the
/// engine itself; it exists so view-layer snapshots that track a phase
/// before its envelope lands deserialize losslessly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Complete,
    Error,
}

/// One recorded phase delivery for a message. Exactly one Step exists per
/// (message id, phase); redelivery replaces it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Step {
    pub phase: Phase,
    pub raw_content: PhaseContent,
    pub display_content: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priors: Option<Vec<Prior>>,
}

impl Step {
    pub fn complete(phase: Phase, raw_content: PhaseContent) -> Self {
        let display_content = raw_content.display_content();
        Self {
            phase,
            raw_content,
            display_content,
            status: StepStatus::Complete,
            priors: None,
        }
    }

    /// A step whose structured payload could not be decoded for its phase.
    /// The raw text is kept for display; the status marks the fault so a
    /// view can render it as degraded rather than silently normal.
    pub fn errored(phase: Phase, raw_content: PhaseContent) -> Self {
        let display_content = raw_content.display_content();
        Self {
            phase,
            raw_content,
            display_content,
            status: StepStatus::Error,
            priors: None,
        }
    }

    pub fn with_priors(mut self, priors: Vec<Prior>) -> Self {
        self.priors = Some(priors);
        self
    }
}
