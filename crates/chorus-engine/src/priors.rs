use std::collections::HashMap;

use parking_lot::RwLock;

use chorus_core::ids::{MessageId, PriorId};
use chorus_core::priors::Prior;

/// Working set of citation records for each in-flight cycle.
///
/// The experience phase is the sole authoritative source: every delivery
/// replaces the working set for that message. Identity is the prior id;
/// within one delivery, later duplicates overwrite earlier ones. Nothing is
/// kept past the cycle; history readers go to the completed Steps instead.
pub struct PriorAggregator {
    sets: RwLock<HashMap<MessageId, HashMap<PriorId, Prior>>>,
}

impl PriorAggregator {
    pub fn new() -> Self {
        Self {
            sets: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the working set for a message with a delivered list.
    pub fn replace_for(&self, message_id: &MessageId, priors: Vec<Prior>) {
        let mut keyed = HashMap::with_capacity(priors.len());
        for prior in priors {
            let _ = keyed.insert(prior.id.clone(), prior);
        }
        let _ = self.sets.write().insert(message_id.clone(), keyed);
    }

    /// The deduplicated view, sorted by similarity descending (ties by
    /// recency).
    pub fn sorted_view(&self, message_id: &MessageId) -> Vec<Prior> {
        let mut priors: Vec<Prior> = self
            .sets
            .read()
            .get(message_id)
            .map(|keyed| keyed.values().cloned().collect())
            .unwrap_or_default();
        priors.sort_by(Prior::display_cmp);
        priors
    }

    pub fn count_for(&self, message_id: &MessageId) -> usize {
        self.sets.read().get(message_id).map_or(0, HashMap::len)
    }

    /// Drop the working set when a fresh cycle starts for the id.
    pub fn clear(&self, message_id: &MessageId) {
        let _ = self.sets.write().remove(message_id);
    }
}

impl Default for PriorAggregator {
    fn default() -> Self {
        Self::new()
    }
}
