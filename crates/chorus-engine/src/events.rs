use serde::Serialize;

use chorus_core::ids::{MessageId, ThreadId};
use chorus_core::phase::Phase;

/// Engine lifecycle events published to subscribed view layers.
///
/// Collaborators subscribe to this stream instead of listening for ambient
/// global events; the ids on each variant let a subscriber filter to the
/// message or thread it renders.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    PhaseAdvanced {
        message_id: MessageId,
        phase: Phase,
    },

    PriorsUpdated {
        message_id: MessageId,
        count: usize,
    },

    /// The cycle reached `yield` and the assistant message was written.
    CycleCompleted {
        message_id: MessageId,
        thread_id: ThreadId,
    },

    CycleError {
        message_id: Option<MessageId>,
        kind: String,
        detail: String,
    },

    /// The server reported a connection-level failure.
    ServerError {
        message: String,
    },
}

impl EngineEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PhaseAdvanced { .. } => "phase_advanced",
            Self::PriorsUpdated { .. } => "priors_updated",
            Self::CycleCompleted { .. } => "cycle_completed",
            Self::CycleError { .. } => "cycle_error",
            Self::ServerError { .. } => "server_error",
        }
    }
}
