use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::ids::{MessageId, ThreadId, UserId};
use crate::messages::Message;
use crate::priors::Prior;

/// Outbound envelopes, serialized as `{ "type": ..., "data": {...} }`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientEnvelope {
    SubmitPrompt {
        message_id: MessageId,
        content: String,
        thread_id: ThreadId,
    },
    CreateThread {
        name: String,
        user_id: UserId,
    },
    GetThreadMessages {
        thread_id: ThreadId,
        user_id: UserId,
    },
}

impl ClientEnvelope {
    pub fn envelope_type(&self) -> &'static str {
        match self {
            Self::SubmitPrompt { .. } => "submit_prompt",
            Self::CreateThread { .. } => "create_thread",
            Self::GetThreadMessages { .. } => "get_thread_messages",
        }
    }
}

/// Payload of a `chorus_step` envelope.
///
/// `step` and `content` stay loosely typed here: phase validation and
/// content normalization are the controller's job, so a server-side bug is
/// logged where it can be attributed to a message rather than failing the
/// whole envelope parse.
#[derive(Clone, Debug, Deserialize)]
pub struct ChorusStepPayload {
    #[serde(default)]
    pub step: Option<String>,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default)]
    pub priors: Option<Vec<Prior>>,
    #[serde(rename = "loop", default)]
    pub loop_decision: Option<bool>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub message_id: Option<MessageId>,
}

/// Wire shape of a thread record announced by the server.
#[derive(Clone, Debug, Deserialize)]
pub struct ThreadPayload {
    pub id: ThreadId,
    #[serde(default)]
    pub name: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// Inbound envelopes. Unknown `type` values parse to `Unknown` and are
/// ignored downstream, keeping the client forward compatible.
#[derive(Clone, Debug)]
pub enum ServerEnvelope {
    ChorusStep(ChorusStepPayload),
    ThreadMessages { messages: Vec<Message> },
    NewThread { thread: ThreadPayload },
    Error { message: String },
    Unknown { kind: String },
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct ThreadMessagesData {
    #[serde(default)]
    messages: Vec<Message>,
}

#[derive(Deserialize)]
struct NewThreadData {
    thread: ThreadPayload,
}

#[derive(Deserialize)]
struct ErrorData {
    #[serde(default)]
    message: String,
}

impl ServerEnvelope {
    /// Parse one inbound text frame.
    pub fn parse(text: &str) -> Result<ServerEnvelope, EngineError> {
        let raw: RawEnvelope = serde_json::from_str(text)
            .map_err(|e| EngineError::MalformedEnvelope(e.to_string()))?;

        match raw.kind.as_str() {
            // `chorus_response` is the legacy alias for `chorus_step`
            "chorus_step" | "chorus_response" => {
                let payload: ChorusStepPayload = serde_json::from_value(raw.data)
                    .map_err(|e| EngineError::MalformedEnvelope(e.to_string()))?;
                Ok(ServerEnvelope::ChorusStep(payload))
            }
            "thread_messages" => {
                let data: ThreadMessagesData = serde_json::from_value(raw.data)
                    .map_err(|e| EngineError::MalformedEnvelope(e.to_string()))?;
                Ok(ServerEnvelope::ThreadMessages { messages: data.messages })
            }
            "new_thread" => {
                let data: NewThreadData = serde_json::from_value(raw.data)
                    .map_err(|e| EngineError::MalformedEnvelope(e.to_string()))?;
                Ok(ServerEnvelope::NewThread { thread: data.thread })
            }
            "error" => {
                let data: ErrorData = serde_json::from_value(raw.data).unwrap_or(ErrorData {
                    message: String::new(),
                });
                Ok(ServerEnvelope::Error { message: data.message })
            }
            other => Ok(ServerEnvelope::Unknown { kind: other.to_string() }),
        }
    }

    pub fn envelope_type(&self) -> &str {
        match self {
            Self::ChorusStep(_) => "chorus_step",
            Self::ThreadMessages { .. } => "thread_messages",
            Self::NewThread { .. } => "new_thread",
            Self::Error { .. } => "error",
            Self::Unknown { kind } => kind,
        }
    }
}
