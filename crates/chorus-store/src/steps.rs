use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use chorus_core::ids::MessageId;
use chorus_core::messages::Step;
use chorus_core::phase::Phase;

/// Phase history keyed by (message id, phase).
///
/// The map keying makes redelivery a plain overwrite: applying the same
/// envelope twice leaves the registry byte-identical to applying it once,
/// and phases for one message can never touch another message's history.
pub struct StepRegistry {
    steps: RwLock<HashMap<MessageId, BTreeMap<Phase, Step>>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self {
            steps: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace the step for `(message_id, step.phase)`.
    /// Returns true when an existing step was replaced.
    pub fn upsert(&self, message_id: &MessageId, step: Step) -> bool {
        let mut steps = self.steps.write();
        steps
            .entry(message_id.clone())
            .or_default()
            .insert(step.phase, step)
            .is_some()
    }

    /// Steps recorded for a message, in phase order.
    pub fn steps_for(&self, message_id: &MessageId) -> Vec<Step> {
        self.steps
            .read()
            .get(message_id)
            .map(|by_phase| by_phase.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, message_id: &MessageId, phase: Phase) -> Option<Step> {
        self.steps
            .read()
            .get(message_id)
            .and_then(|by_phase| by_phase.get(&phase).cloned())
    }

    /// Highest phase recorded for a message so far.
    pub fn highest_phase(&self, message_id: &MessageId) -> Option<Phase> {
        self.steps
            .read()
            .get(message_id)
            .and_then(|by_phase| by_phase.keys().next_back().copied())
    }

    /// Drop all step history for a message. Called when a fresh cycle starts
    /// for the same id.
    pub fn clear(&self, message_id: &MessageId) {
        let _ = self.steps.write().remove(message_id);
    }

    pub fn len_for(&self, message_id: &MessageId) -> usize {
        self.steps
            .read()
            .get(message_id)
            .map_or(0, BTreeMap::len)
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}
