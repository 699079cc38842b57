use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use chorus_core::ids::{MessageId, ThreadId};
use chorus_core::messages::{Author, Message, Step};
use chorus_core::phase::Phase;
use chorus_core::protocol::ThreadPayload;

use crate::error::StoreError;
use crate::steps::StepRegistry;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A conversation thread.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl From<ThreadPayload> for Thread {
    fn from(payload: ThreadPayload) -> Self {
        Self {
            id: payload.id,
            name: payload.name,
            created_at: payload.created_at,
        }
    }
}

/// Change notifications published after every store mutation.
#[derive(Clone, Debug)]
pub enum StoreEvent {
    MessageAdded { thread_id: ThreadId, message_id: MessageId },
    AssistantCompleted { thread_id: ThreadId, message_id: MessageId },
    ThreadCreated { thread_id: ThreadId },
    CurrentThreadChanged { thread_id: ThreadId },
    MessagesReplaced { thread_id: ThreadId },
}

impl StoreEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::MessageAdded { .. } => "message_added",
            Self::AssistantCompleted { .. } => "assistant_completed",
            Self::ThreadCreated { .. } => "thread_created",
            Self::CurrentThreadChanged { .. } => "current_thread_changed",
            Self::MessagesReplaced { .. } => "messages_replaced",
        }
    }
}

struct Inner {
    threads: Vec<Thread>,
    current_thread_id: Option<ThreadId>,
    messages_by_thread: HashMap<ThreadId, Vec<Message>>,
}

/// The only long-lived shared state: threads, their messages, and per-message
/// step history. Mutated by direct user actions and by the controller's
/// envelope handler, nothing else.
///
/// All mutation happens under a single write lock, so the serialization
/// invariant of the cooperative model holds on a multi-threaded runtime too.
pub struct ThreadStore {
    inner: RwLock<Inner>,
    steps: StepRegistry,
    events: broadcast::Sender<StoreEvent>,
}

impl ThreadStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(Inner {
                threads: Vec::new(),
                current_thread_id: None,
                messages_by_thread: HashMap::new(),
            }),
            steps: StepRegistry::new(),
            events,
        }
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Append a message. A user message atomically also appends its paired
    /// empty assistant placeholder; the returned id is the placeholder's.
    pub fn add_message(&self, message: Message) -> Option<MessageId> {
        let thread_id = message.thread_id.clone();
        let message_id = message.id.clone();
        let placeholder = (message.author == Author::User)
            .then(|| Message::assistant_placeholder(thread_id.clone()));
        let placeholder_id = placeholder.as_ref().map(|p| p.id.clone());

        {
            let mut inner = self.inner.write();
            let messages = inner.messages_by_thread.entry(thread_id.clone()).or_default();
            messages.push(message);
            if let Some(placeholder) = placeholder {
                messages.push(placeholder);
            }
        }

        debug!(%thread_id, %message_id, paired = placeholder_id.is_some(), "message appended");
        let _ = self.events.send(StoreEvent::MessageAdded {
            thread_id: thread_id.clone(),
            message_id,
        });
        if let Some(id) = &placeholder_id {
            let _ = self.events.send(StoreEvent::MessageAdded {
                thread_id,
                message_id: id.clone(),
            });
        }
        placeholder_id
    }

    /// Mark a thread current, synthesizing a minimal record if the id has
    /// never been seen.
    pub fn set_current_thread(&self, thread_id: &ThreadId) {
        let created = {
            let mut inner = self.inner.write();
            let known = inner.threads.iter().any(|t| &t.id == thread_id);
            if !known {
                inner.threads.push(Thread {
                    id: thread_id.clone(),
                    name: thread_id.to_string(),
                    created_at: Utc::now(),
                });
            }
            inner.current_thread_id = Some(thread_id.clone());
            !known
        };

        if created {
            let _ = self.events.send(StoreEvent::ThreadCreated {
                thread_id: thread_id.clone(),
            });
        }
        let _ = self.events.send(StoreEvent::CurrentThreadChanged {
            thread_id: thread_id.clone(),
        });
    }

    /// Create a named thread locally (before or without server acknowledgment).
    pub fn create_thread(&self, name: impl Into<String>) -> Thread {
        let thread = Thread {
            id: ThreadId::new(),
            name: name.into(),
            created_at: Utc::now(),
        };
        self.inner.write().threads.push(thread.clone());
        let _ = self.events.send(StoreEvent::ThreadCreated {
            thread_id: thread.id.clone(),
        });
        thread
    }

    /// Ingest a server-announced thread, upserting by id.
    pub fn ingest_thread(&self, thread: Thread) {
        let created = {
            let mut inner = self.inner.write();
            match inner.threads.iter_mut().find(|t| t.id == thread.id) {
                Some(existing) => {
                    *existing = thread.clone();
                    false
                }
                None => {
                    inner.threads.push(thread.clone());
                    true
                }
            }
        };
        if created {
            let _ = self.events.send(StoreEvent::ThreadCreated { thread_id: thread.id });
        }
    }

    /// Write the yield text into the most recent empty assistant message of
    /// the thread, exactly once. Returns false (and changes nothing) when no
    /// placeholder is waiting, so a stray late envelope cannot overwrite a
    /// finished message.
    pub fn update_assistant_content(&self, thread_id: &ThreadId, content: &str) -> bool {
        let completed = {
            let mut inner = self.inner.write();
            inner
                .messages_by_thread
                .get_mut(thread_id)
                .and_then(|messages| {
                    messages.iter_mut().rev().find(|m| m.is_pending_assistant())
                })
                .map(|message| {
                    message.content = content.to_string();
                    message.id.clone()
                })
        };

        match completed {
            Some(message_id) => {
                debug!(%thread_id, %message_id, "assistant message completed");
                let _ = self.events.send(StoreEvent::AssistantCompleted {
                    thread_id: thread_id.clone(),
                    message_id,
                });
                true
            }
            None => false,
        }
    }

    /// Replace a thread's message list with the server's authoritative copy.
    pub fn replace_messages(&self, thread_id: &ThreadId, messages: Vec<Message>) {
        {
            let mut inner = self.inner.write();
            let _ = inner
                .messages_by_thread
                .insert(thread_id.clone(), messages);
        }
        let _ = self.events.send(StoreEvent::MessagesReplaced {
            thread_id: thread_id.clone(),
        });
    }

    pub fn threads(&self) -> Vec<Thread> {
        self.inner.read().threads.clone()
    }

    pub fn current_thread(&self) -> Option<ThreadId> {
        self.inner.read().current_thread_id.clone()
    }

    pub fn messages(&self, thread_id: &ThreadId) -> Vec<Message> {
        self.inner
            .read()
            .messages_by_thread
            .get(thread_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn find_message(&self, message_id: &MessageId) -> Result<Message, StoreError> {
        self.inner
            .read()
            .messages_by_thread
            .values()
            .flatten()
            .find(|m| &m.id == message_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))
    }

    // Step history, keyed by (message id, phase).

    pub fn upsert_step(&self, message_id: &MessageId, step: Step) -> bool {
        self.steps.upsert(message_id, step)
    }

    pub fn steps_for(&self, message_id: &MessageId) -> Vec<Step> {
        self.steps.steps_for(message_id)
    }

    pub fn step(&self, message_id: &MessageId, phase: Phase) -> Option<Step> {
        self.steps.get(message_id, phase)
    }

    pub fn clear_steps(&self, message_id: &MessageId) {
        self.steps.clear(message_id);
    }
}

impl Default for ThreadStore {
    fn default() -> Self {
        Self::new()
    }
}
