use chorus_core::ids::ThreadId;
use chorus_core::phase::Phase;

/// The normalized content of the most recently applied step.
#[derive(Clone, Debug)]
pub struct LastResponse {
    pub content: String,
    pub loop_decision: Option<bool>,
    pub reasoning: Option<String>,
}

/// Transient per-cycle state for one in-flight message.
///
/// Reset to its initial value every time a cycle starts for the message id,
/// append-only within one cycle. Envelopes carry no ordering guarantee
/// beyond FIFO on the socket, so `current_phase` tracks the highest phase
/// seen rather than enforcing a strict sequence.
#[derive(Clone, Debug)]
pub struct CycleState {
    pub thread_id: ThreadId,
    pub current_phase: Phase,
    pub last_response: Option<LastResponse>,
    pub error_state: Option<String>,
    /// Set by `update` with `loop == false`. The yield envelope alone never
    /// completes a cycle; this is the only gate to finalization.
    pub yield_approved: bool,
    /// Set when the yield text has been written into the assistant message.
    pub finalized: bool,
}

impl CycleState {
    pub fn new(thread_id: ThreadId) -> Self {
        Self {
            thread_id,
            current_phase: Phase::Action,
            last_response: None,
            error_state: None,
            yield_approved: false,
            finalized: false,
        }
    }

    /// Fold a delivered phase into the state. Out-of-order and duplicate
    /// deliveries are legitimate, so this never moves backwards.
    pub fn observe_phase(&mut self, phase: Phase) {
        self.current_phase = self.current_phase.max(phase);
    }

    /// Apply the `update` phase's branch decision. `loop_decision` absent is
    /// treated as false: the cycle fails toward termination, never toward an
    /// infinite hang.
    pub fn apply_update_decision(&mut self, loop_decision: Option<bool>) -> bool {
        let looping = loop_decision.unwrap_or(false);
        if looping {
            self.current_phase = Phase::Action;
            self.yield_approved = false;
        } else {
            self.current_phase = Phase::Yield;
            self.yield_approved = true;
        }
        looping
    }

    pub fn record_error(&mut self, detail: impl Into<String>) {
        self.error_state = Some(detail.into());
    }

    /// Whether the cycle is still waiting on the transport.
    pub fn is_active(&self) -> bool {
        !self.finalized
    }
}
