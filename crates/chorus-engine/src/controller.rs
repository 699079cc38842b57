use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use chorus_core::content::PhaseContent;
use chorus_core::errors::EngineError;
use chorus_core::ids::{MessageId, ThreadId, UserId};
use chorus_core::messages::{Message, Step};
use chorus_core::phase::Phase;
use chorus_core::priors::Prior;
use chorus_core::protocol::{ChorusStepPayload, ClientEnvelope, ServerEnvelope};
use chorus_core::transport::Transport;
use chorus_store::ThreadStore;

use crate::cycle::{CycleState, LastResponse};
use crate::events::EngineEvent;
use crate::priors::PriorAggregator;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Drives chorus cycles: submits prompts over the transport and folds every
/// inbound envelope into the store and per-message cycle state.
///
/// One controller serves all threads. Cycle state is keyed by the user
/// message id, so concurrent cycles never observe each other's phases.
pub struct ChorusController {
    store: Arc<ThreadStore>,
    transport: Arc<dyn Transport>,
    cycles: Mutex<HashMap<MessageId, CycleState>>,
    priors: PriorAggregator,
    events: broadcast::Sender<EngineEvent>,
}

impl ChorusController {
    pub fn new(store: Arc<ThreadStore>, transport: Arc<dyn Transport>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            transport,
            cycles: Mutex::new(HashMap::new()),
            priors: PriorAggregator::new(),
            events,
        }
    }

    /// Subscribe to engine lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &Arc<ThreadStore> {
        &self.store
    }

    /// Snapshot of the cycle state for a user message, if one was started.
    pub fn cycle_state(&self, message_id: &MessageId) -> Option<CycleState> {
        self.cycles.lock().get(message_id).cloned()
    }

    pub fn current_phase(&self, message_id: &MessageId) -> Option<Phase> {
        self.cycles.lock().get(message_id).map(|c| c.current_phase)
    }

    /// The working prior set for an in-flight cycle, sorted for display.
    pub fn priors_view(&self, message_id: &MessageId) -> Vec<Prior> {
        self.priors.sorted_view(message_id)
    }

    /// Start a cycle for a user message: reset any stale state held under its
    /// id, then submit the prompt.
    ///
    /// Fails fast with `TransportUnavailable` when the connection is down, in
    /// which case nothing is mutated and nothing is sent.
    pub async fn process_cycle(&self, message: &Message) -> Result<(), EngineError> {
        if !self.transport.is_connected() {
            return Err(EngineError::TransportUnavailable);
        }

        // Reset before sending so a fast first reply cannot race stale
        // history from an earlier run of the same id.
        let _ = self
            .cycles
            .lock()
            .insert(message.id.clone(), CycleState::new(message.thread_id.clone()));
        self.store.clear_steps(&message.id);
        self.priors.clear(&message.id);

        let envelope = ClientEnvelope::SubmitPrompt {
            message_id: message.id.clone(),
            content: message.content.clone(),
            thread_id: message.thread_id.clone(),
        };
        self.transport.send(&envelope).await?;
        debug!(message_id = %message.id, thread_id = %message.thread_id, "cycle started");
        Ok(())
    }

    /// Ask the server for a new named thread.
    pub async fn create_thread(&self, name: &str, user_id: &UserId) -> Result<(), EngineError> {
        let envelope = ClientEnvelope::CreateThread {
            name: name.to_string(),
            user_id: user_id.clone(),
        };
        self.transport.send(&envelope).await?;
        Ok(())
    }

    /// Ask the server for a thread's message history. The reply arrives as a
    /// `thread_messages` envelope and replaces the local copy.
    pub async fn request_thread_messages(
        &self,
        thread_id: &ThreadId,
        user_id: &UserId,
    ) -> Result<(), EngineError> {
        let envelope = ClientEnvelope::GetThreadMessages {
            thread_id: thread_id.clone(),
            user_id: user_id.clone(),
        };
        self.transport.send(&envelope).await?;
        Ok(())
    }

    /// Fold one inbound envelope into local state.
    pub fn handle_envelope(&self, envelope: ServerEnvelope) {
        match envelope {
            ServerEnvelope::ChorusStep(payload) => self.handle_step(payload),
            ServerEnvelope::ThreadMessages { messages } => {
                let thread_id = messages
                    .first()
                    .map(|m| m.thread_id.clone())
                    .or_else(|| self.store.current_thread());
                match thread_id {
                    Some(thread_id) => {
                        debug!(%thread_id, count = messages.len(), "replacing thread history");
                        self.store.replace_messages(&thread_id, messages);
                    }
                    None => warn!("thread_messages with no thread to attribute; dropped"),
                }
            }
            ServerEnvelope::NewThread { thread } => {
                debug!(thread_id = %thread.id, "server announced thread");
                self.store.ingest_thread(thread.into());
            }
            ServerEnvelope::Error { message } => {
                warn!(detail = %message, "server reported error");
                {
                    let mut cycles = self.cycles.lock();
                    let mut active: Vec<_> =
                        cycles.values_mut().filter(|c| c.is_active()).collect();
                    // Only attributable when exactly one cycle is in flight
                    if let [cycle] = active.as_mut_slice() {
                        cycle.record_error(message.clone());
                    }
                }
                self.publish(EngineEvent::ServerError { message });
            }
            ServerEnvelope::Unknown { kind } => {
                debug!(kind, "ignoring unknown envelope type");
            }
        }
    }

    fn handle_step(&self, payload: ChorusStepPayload) {
        let mut cycles = self.cycles.lock();

        let message_id = match Self::resolve_target(&cycles, payload.message_id.as_ref()) {
            Some(id) => id,
            None => {
                warn!(
                    message_id = ?payload.message_id,
                    "chorus step for no tracked cycle; dropped"
                );
                return;
            }
        };

        let step_name = match payload.step {
            Some(name) => name,
            None => {
                warn!(%message_id, "chorus step missing its phase name; dropped");
                return;
            }
        };

        let phase = match step_name.parse::<Phase>() {
            Ok(phase) => phase,
            Err(_) => {
                let err = EngineError::UnknownPhase(step_name);
                if let Some(cycle) = cycles.get_mut(&message_id) {
                    cycle.record_error(err.to_string());
                }
                warn!(%message_id, error = %err, "unrecognized phase");
                drop(cycles);
                self.publish(EngineEvent::CycleError {
                    message_id: Some(message_id),
                    kind: err.error_kind().to_string(),
                    detail: err.to_string(),
                });
                return;
            }
        };

        let cycle = match cycles.get_mut(&message_id) {
            Some(cycle) => cycle,
            None => return,
        };

        let content = PhaseContent::from_wire(phase, &payload.content);
        let loop_decision = payload.loop_decision.or_else(|| content.loop_decision());

        // An object payload that still normalized to Raw failed its phase's
        // structured decode; keep the text but mark the step degraded
        let decode_failed =
            payload.content.is_object() && matches!(content, PhaseContent::Raw(_));
        let mut step = if decode_failed {
            Step::errored(phase, content)
        } else {
            Step::complete(phase, content)
        };
        if phase == Phase::Experience {
            if let Some(priors) = payload.priors.clone() {
                step = step.with_priors(priors);
            }
        }
        let display = step.display_content.clone();
        let replaced = self.store.upsert_step(&message_id, step);
        if replaced {
            debug!(%message_id, phase = %phase, "step redelivered; replaced in place");
        }

        cycle.observe_phase(phase);
        cycle.last_response = Some(LastResponse {
            content: display,
            loop_decision,
            reasoning: payload.reasoning.clone(),
        });

        if phase == Phase::Experience {
            if let Some(priors) = payload.priors {
                self.priors.replace_for(&message_id, priors);
                let count = self.priors.count_for(&message_id);
                self.publish(EngineEvent::PriorsUpdated {
                    message_id: message_id.clone(),
                    count,
                });
            }
        }

        if phase == Phase::Update {
            let looping = cycle.apply_update_decision(loop_decision);
            debug!(%message_id, looping, "update decision applied");
        }

        self.publish(EngineEvent::PhaseAdvanced {
            message_id: message_id.clone(),
            phase: cycle.current_phase,
        });

        self.try_finalize(&message_id, cycle);
    }

    /// Complete the cycle once both gates are open: `update` approved the
    /// yield, and the yield step's text has arrived. Runs after every step so
    /// either arrival order works.
    fn try_finalize(&self, message_id: &MessageId, cycle: &mut CycleState) {
        if !cycle.yield_approved || cycle.finalized {
            return;
        }
        let Some(yield_step) = self.store.step(message_id, Phase::Yield) else {
            return;
        };

        cycle.finalized = true;
        if self
            .store
            .update_assistant_content(&cycle.thread_id, &yield_step.display_content)
        {
            debug!(%message_id, thread_id = %cycle.thread_id, "cycle completed");
        } else {
            // Assistant slot already written; do not clobber it
            warn!(%message_id, "no pending assistant message for yield text");
        }
        self.publish(EngineEvent::CycleCompleted {
            message_id: message_id.clone(),
            thread_id: cycle.thread_id.clone(),
        });
    }

    /// Pick which cycle an inbound step belongs to. An explicit id wins when
    /// tracked; without one, fall back to the sole active cycle. Anything
    /// else is unattributable.
    fn resolve_target(
        cycles: &HashMap<MessageId, CycleState>,
        explicit: Option<&MessageId>,
    ) -> Option<MessageId> {
        match explicit {
            Some(id) => cycles.contains_key(id).then(|| id.clone()),
            None => {
                let mut active = cycles.iter().filter(|(_, c)| c.is_active());
                match (active.next(), active.next()) {
                    (Some((id, _)), None) => Some(id.clone()),
                    _ => None,
                }
            }
        }
    }

    /// A frame that failed envelope parsing: drop it, but surface the fault
    /// on the active cycle when there is exactly one to blame.
    fn record_parse_failure(&self, err: &EngineError) {
        {
            let mut cycles = self.cycles.lock();
            let mut active: Vec<_> = cycles.values_mut().filter(|c| c.is_active()).collect();
            if let [cycle] = active.as_mut_slice() {
                cycle.record_error(err.to_string());
            }
        }
        self.publish(EngineEvent::CycleError {
            message_id: None,
            kind: err.error_kind().to_string(),
            detail: err.to_string(),
        });
    }

    fn publish(&self, event: EngineEvent) {
        debug!(event_type = event.event_type(), "engine event");
        // A send error only means nobody is subscribed right now
        let _ = self.events.send(event);
    }

    /// Spawn the inbound pump: every text frame from the transport is parsed
    /// and folded into state until the channel closes or the handle is
    /// dropped.
    pub fn attach(self: Arc<Self>, mut inbound: broadcast::Receiver<String>) -> ControllerHandle {
        let controller = self;
        let task = tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Ok(text) => match ServerEnvelope::parse(&text) {
                        Ok(envelope) => controller.handle_envelope(envelope),
                        Err(err) => {
                            warn!(error = %err, "dropping malformed inbound frame");
                            controller.record_parse_failure(&err);
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "inbound pump lagged; frames lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("inbound pump stopped");
        });
        ControllerHandle { task }
    }
}

/// Owns the inbound pump task. Dropping the handle detaches the controller
/// from the transport: frames arriving afterwards are never applied.
pub struct ControllerHandle {
    task: JoinHandle<()>,
}

impl ControllerHandle {
    pub fn shutdown(self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ControllerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use chorus_core::errors::TransportError;
    use chorus_core::messages::{Author, StepStatus};

    struct StubTransport {
        connected: AtomicBool,
        sent: Mutex<Vec<ClientEnvelope>>,
    }

    impl StubTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                connected: AtomicBool::new(true),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        fn sent(&self) -> Vec<ClientEnvelope> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn send(&self, envelope: &ClientEnvelope) -> Result<(), TransportError> {
            if !self.is_connected() {
                return Err(TransportError::NotConnected);
            }
            self.sent.lock().push(envelope.clone());
            Ok(())
        }
    }

    fn setup() -> (Arc<ChorusController>, Arc<StubTransport>, Arc<ThreadStore>, ThreadId) {
        let store = Arc::new(ThreadStore::new());
        let thread_id = ThreadId::from_raw("T1");
        store.set_current_thread(&thread_id);
        let transport = StubTransport::new();
        let controller = Arc::new(ChorusController::new(
            Arc::clone(&store),
            transport.clone() as Arc<dyn Transport>,
        ));
        (controller, transport, store, thread_id)
    }

    async fn start_cycle(
        controller: &ChorusController,
        store: &ThreadStore,
        thread_id: &ThreadId,
        prompt: &str,
    ) -> Message {
        let message = Message::user(prompt, thread_id.clone());
        store.add_message(message.clone());
        controller.process_cycle(&message).await.unwrap();
        message
    }

    fn step_envelope(
        message_id: &MessageId,
        step: &str,
        content: serde_json::Value,
        extra: serde_json::Value,
    ) -> ServerEnvelope {
        let mut data = json!({
            "step": step,
            "content": content,
            "message_id": message_id.as_str(),
        });
        if let (Some(data), Some(extra)) = (data.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                data.insert(k.clone(), v.clone());
            }
        }
        let text = json!({ "type": "chorus_step", "data": data }).to_string();
        ServerEnvelope::parse(&text).unwrap()
    }

    fn deliver_full_cycle(controller: &ChorusController, id: &MessageId, reply: &str) {
        controller.handle_envelope(step_envelope(
            id,
            "action",
            json!({"proposed_response": "draft", "confidence": 0.7}),
            json!({}),
        ));
        controller.handle_envelope(step_envelope(
            id,
            "experience",
            json!({"synthesis": "drawing on history"}),
            json!({"priors": [{"id": "p1", "content": "prior insight", "similarity": 0.8}]}),
        ));
        controller.handle_envelope(step_envelope(
            id,
            "intention",
            json!({"explicit_intent": "answer the greeting"}),
            json!({}),
        ));
        controller.handle_envelope(step_envelope(
            id,
            "observation",
            json!({"context_analysis": "simple salutation"}),
            json!({}),
        ));
        controller.handle_envelope(step_envelope(
            id,
            "update",
            json!({"reasoning": "good enough"}),
            json!({"loop": false}),
        ));
        controller.handle_envelope(step_envelope(
            id,
            "yield",
            json!({"final_response": reply}),
            json!({}),
        ));
    }

    #[tokio::test]
    async fn submit_sends_prompt_envelope() {
        let (controller, transport, store, thread_id) = setup();
        let message = start_cycle(&controller, &store, &thread_id, "hello").await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            ClientEnvelope::SubmitPrompt {
                message_id,
                content,
                thread_id: sent_thread,
            } => {
                assert_eq!(message_id, &message.id);
                assert_eq!(content, "hello");
                assert_eq!(sent_thread, &thread_id);
            }
            other => panic!("expected SubmitPrompt, got {other:?}"),
        }
        assert_eq!(
            controller.current_phase(&message.id),
            Some(Phase::Action)
        );
    }

    #[tokio::test]
    async fn disconnected_transport_fails_without_mutation() {
        let (controller, transport, store, thread_id) = setup();
        transport.disconnect();

        let message = Message::user("hello", thread_id.clone());
        store.add_message(message.clone());

        let err = controller.process_cycle(&message).await.unwrap_err();
        assert_eq!(err.error_kind(), "transport_unavailable");
        assert!(controller.cycle_state(&message.id).is_none());
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn full_cycle_fills_assistant_message() {
        let (controller, _transport, store, thread_id) = setup();
        let message = start_cycle(&controller, &store, &thread_id, "hello").await;

        deliver_full_cycle(&controller, &message.id, "hi there");

        let messages = store.messages(&thread_id);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].author, Author::Ai);
        assert_eq!(messages[1].content, "hi there");

        let state = controller.cycle_state(&message.id).unwrap();
        assert_eq!(state.current_phase, Phase::Yield);
        assert!(state.finalized);
        assert!(!state.is_active());

        let steps = store.steps_for(&message.id);
        assert_eq!(steps.len(), 6);
        assert_eq!(steps[0].phase, Phase::Action);
        assert_eq!(steps[5].phase, Phase::Yield);

        let priors = controller.priors_view(&message.id);
        assert_eq!(priors.len(), 1);
        assert_eq!(priors[0].id.as_str(), "p1");
    }

    #[tokio::test]
    async fn redelivered_step_is_idempotent() {
        let (controller, _transport, store, thread_id) = setup();
        let message = start_cycle(&controller, &store, &thread_id, "hello").await;

        let envelope = step_envelope(
            &message.id,
            "action",
            json!({"proposed_response": "draft"}),
            json!({}),
        );
        controller.handle_envelope(envelope.clone());
        controller.handle_envelope(envelope);

        let steps = store.steps_for(&message.id);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].display_content, "draft");
    }

    #[tokio::test]
    async fn cycles_are_isolated_per_message() {
        let (controller, _transport, store, thread_id) = setup();
        let first = start_cycle(&controller, &store, &thread_id, "one").await;
        let second = start_cycle(&controller, &store, &thread_id, "two").await;

        controller.handle_envelope(step_envelope(
            &second.id,
            "observation",
            json!({"context_analysis": "x"}),
            json!({}),
        ));

        assert_eq!(controller.current_phase(&first.id), Some(Phase::Action));
        assert_eq!(
            controller.current_phase(&second.id),
            Some(Phase::Observation)
        );
        assert!(store.steps_for(&first.id).is_empty());
        assert_eq!(store.steps_for(&second.id).len(), 1);
    }

    #[tokio::test]
    async fn loop_true_restarts_without_second_placeholder() {
        let (controller, _transport, store, thread_id) = setup();
        let message = start_cycle(&controller, &store, &thread_id, "hello").await;

        controller.handle_envelope(step_envelope(
            &message.id,
            "update",
            json!({"reasoning": "needs another pass"}),
            json!({"loop": true}),
        ));

        let state = controller.cycle_state(&message.id).unwrap();
        assert_eq!(state.current_phase, Phase::Action);
        assert!(!state.finalized);

        // Second iteration completes normally against the original placeholder
        deliver_full_cycle(&controller, &message.id, "second pass answer");
        let messages = store.messages(&thread_id);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "second pass answer");
    }

    #[tokio::test]
    async fn absent_loop_flag_terminates() {
        let (controller, _transport, store, thread_id) = setup();
        let message = start_cycle(&controller, &store, &thread_id, "hello").await;

        controller.handle_envelope(step_envelope(
            &message.id,
            "update",
            json!({"reasoning": "flag lost in transit"}),
            json!({}),
        ));

        let state = controller.cycle_state(&message.id).unwrap();
        assert_eq!(state.current_phase, Phase::Yield);
        assert!(state.yield_approved);
    }

    #[tokio::test]
    async fn yield_before_update_still_finalizes() {
        let (controller, _transport, store, thread_id) = setup();
        let message = start_cycle(&controller, &store, &thread_id, "hello").await;

        controller.handle_envelope(step_envelope(
            &message.id,
            "yield",
            json!({"final_response": "early bird"}),
            json!({}),
        ));
        // Yield alone never completes the cycle
        assert_eq!(store.messages(&thread_id)[1].content, "");

        controller.handle_envelope(step_envelope(
            &message.id,
            "update",
            json!({}),
            json!({"loop": false}),
        ));
        assert_eq!(store.messages(&thread_id)[1].content, "early bird");
        assert!(controller.cycle_state(&message.id).unwrap().finalized);
    }

    #[tokio::test]
    async fn late_yield_cannot_overwrite_finished_message() {
        let (controller, _transport, store, thread_id) = setup();
        let message = start_cycle(&controller, &store, &thread_id, "hello").await;
        deliver_full_cycle(&controller, &message.id, "hi there");

        controller.handle_envelope(step_envelope(
            &message.id,
            "yield",
            json!({"final_response": "stale duplicate"}),
            json!({}),
        ));

        assert_eq!(store.messages(&thread_id)[1].content, "hi there");
    }

    #[tokio::test]
    async fn unknown_phase_records_error_and_keeps_progress() {
        let (controller, _transport, store, thread_id) = setup();
        let message = start_cycle(&controller, &store, &thread_id, "hello").await;
        let mut events = controller.subscribe();

        controller.handle_envelope(step_envelope(
            &message.id,
            "intention",
            json!({"explicit_intent": "x"}),
            json!({}),
        ));
        controller.handle_envelope(step_envelope(
            &message.id,
            "transmogrify",
            json!({}),
            json!({}),
        ));

        let state = controller.cycle_state(&message.id).unwrap();
        assert_eq!(state.current_phase, Phase::Intention);
        assert!(state.error_state.is_some());
        assert_eq!(store.steps_for(&message.id).len(), 1);

        // PhaseAdvanced for intention, then the error
        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if event.event_type() == "cycle_error" {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn undecodable_object_recorded_as_errored_step() {
        let (controller, _transport, store, thread_id) = setup();
        let message = start_cycle(&controller, &store, &thread_id, "hello").await;

        // An action payload without proposed_response has no structured form
        controller.handle_envelope(step_envelope(
            &message.id,
            "action",
            json!({"confidence": 0.2}),
            json!({}),
        ));

        let steps = store.steps_for(&message.id);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::Error);
        assert_eq!(steps[0].display_content, json!({"confidence": 0.2}).to_string());
        // The phase still advances; the fault is step-local
        assert_eq!(controller.current_phase(&message.id), Some(Phase::Action));
    }

    #[tokio::test]
    async fn missing_step_name_is_dropped() {
        let (controller, _transport, store, thread_id) = setup();
        let message = start_cycle(&controller, &store, &thread_id, "hello").await;

        let text = json!({
            "type": "chorus_step",
            "data": {"content": "orphan", "message_id": message.id.as_str()}
        })
        .to_string();
        controller.handle_envelope(ServerEnvelope::parse(&text).unwrap());

        assert!(store.steps_for(&message.id).is_empty());
        assert_eq!(controller.current_phase(&message.id), Some(Phase::Action));
    }

    #[tokio::test]
    async fn untracked_message_id_is_dropped() {
        let (controller, _transport, store, thread_id) = setup();
        let _message = start_cycle(&controller, &store, &thread_id, "hello").await;

        let stranger = MessageId::from_raw("msg_stranger");
        controller.handle_envelope(step_envelope(
            &stranger,
            "action",
            json!({"proposed_response": "who?"}),
            json!({}),
        ));

        assert!(store.steps_for(&stranger).is_empty());
        assert!(controller.cycle_state(&stranger).is_none());
    }

    #[tokio::test]
    async fn step_without_id_routes_to_sole_active_cycle() {
        let (controller, _transport, store, thread_id) = setup();
        let message = start_cycle(&controller, &store, &thread_id, "hello").await;

        let text = json!({
            "type": "chorus_step",
            "data": {"step": "action", "content": {"proposed_response": "routed"}}
        })
        .to_string();
        controller.handle_envelope(ServerEnvelope::parse(&text).unwrap());

        let steps = store.steps_for(&message.id);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].display_content, "routed");
    }

    #[tokio::test]
    async fn step_without_id_ambiguous_between_two_cycles_is_dropped() {
        let (controller, _transport, store, thread_id) = setup();
        let first = start_cycle(&controller, &store, &thread_id, "one").await;
        let second = start_cycle(&controller, &store, &thread_id, "two").await;

        let text = json!({
            "type": "chorus_step",
            "data": {"step": "action", "content": "ambiguous"}
        })
        .to_string();
        controller.handle_envelope(ServerEnvelope::parse(&text).unwrap());

        assert!(store.steps_for(&first.id).is_empty());
        assert!(store.steps_for(&second.id).is_empty());
    }

    #[tokio::test]
    async fn restart_clears_stale_steps_and_priors() {
        let (controller, _transport, store, thread_id) = setup();
        let message = start_cycle(&controller, &store, &thread_id, "hello").await;
        deliver_full_cycle(&controller, &message.id, "hi there");

        controller.process_cycle(&message).await.unwrap();

        assert!(store.steps_for(&message.id).is_empty());
        assert!(controller.priors_view(&message.id).is_empty());
        assert_eq!(controller.current_phase(&message.id), Some(Phase::Action));
    }

    #[tokio::test]
    async fn malformed_frame_marks_sole_active_cycle() {
        let (controller, _transport, store, thread_id) = setup();
        let message = start_cycle(&controller, &store, &thread_id, "hello").await;
        let mut events = controller.subscribe();

        let err = ServerEnvelope::parse("{nope").unwrap_err();
        controller.record_parse_failure(&err);

        let state = controller.cycle_state(&message.id).unwrap();
        assert!(state.error_state.is_some());
        assert_eq!(state.current_phase, Phase::Action);
        match events.try_recv().unwrap() {
            EngineEvent::CycleError { message_id, kind, .. } => {
                assert!(message_id.is_none());
                assert_eq!(kind, "malformed_envelope");
            }
            other => panic!("expected CycleError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_error_marks_sole_active_cycle() {
        let (controller, _transport, store, thread_id) = setup();
        let message = start_cycle(&controller, &store, &thread_id, "hello").await;
        let mut events = controller.subscribe();

        let text = json!({"type": "error", "data": {"message": "backend exploded"}}).to_string();
        controller.handle_envelope(ServerEnvelope::parse(&text).unwrap());

        let state = controller.cycle_state(&message.id).unwrap();
        assert_eq!(state.error_state.as_deref(), Some("backend exploded"));
        match events.try_recv().unwrap() {
            EngineEvent::ServerError { message } => assert_eq!(message, "backend exploded"),
            other => panic!("expected ServerError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn new_thread_envelope_registers_thread() {
        let (controller, _transport, store, _thread_id) = setup();

        let text = json!({
            "type": "new_thread",
            "data": {"thread": {"id": "T9", "name": "fresh"}}
        })
        .to_string();
        controller.handle_envelope(ServerEnvelope::parse(&text).unwrap());

        assert!(store.threads().iter().any(|t| t.id.as_str() == "T9"));
    }

    #[tokio::test]
    async fn thread_messages_replace_history() {
        let (controller, _transport, store, thread_id) = setup();
        let _message = start_cycle(&controller, &store, &thread_id, "local copy").await;

        let text = json!({
            "type": "thread_messages",
            "data": {
                "messages": [{
                    "id": "msg_remote",
                    "content": "authoritative",
                    "author": "user",
                    "thread_id": "T1",
                    "timestamp": "2024-11-02T10:00:00Z"
                }]
            }
        })
        .to_string();
        controller.handle_envelope(ServerEnvelope::parse(&text).unwrap());

        let messages = store.messages(&thread_id);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "authoritative");
    }

    #[tokio::test]
    async fn unknown_envelope_type_changes_nothing() {
        let (controller, _transport, store, thread_id) = setup();
        let message = start_cycle(&controller, &store, &thread_id, "hello").await;

        let text = json!({"type": "presence_update", "data": {"users": 3}}).to_string();
        controller.handle_envelope(ServerEnvelope::parse(&text).unwrap());

        assert_eq!(controller.current_phase(&message.id), Some(Phase::Action));
        assert!(store.steps_for(&message.id).is_empty());
    }

    #[tokio::test]
    async fn phase_events_published_in_order() {
        let (controller, _transport, store, thread_id) = setup();
        let message = start_cycle(&controller, &store, &thread_id, "hello").await;
        let mut events = controller.subscribe();

        deliver_full_cycle(&controller, &message.id, "hi there");

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.event_type());
        }
        assert_eq!(kinds.first(), Some(&"phase_advanced"));
        assert!(kinds.contains(&"priors_updated"));
        assert_eq!(kinds.last(), Some(&"cycle_completed"));
    }

    #[tokio::test]
    async fn detached_handle_stops_applying_frames() {
        let (controller, _transport, store, thread_id) = setup();
        let message = start_cycle(&controller, &store, &thread_id, "hello").await;

        let (inbound, _) = broadcast::channel::<String>(16);
        let handle = Arc::clone(&controller).attach(inbound.subscribe());

        let frame = json!({
            "type": "chorus_step",
            "data": {
                "step": "action",
                "content": {"proposed_response": "applied"},
                "message_id": message.id.as_str()
            }
        })
        .to_string();
        inbound.send(frame).unwrap();
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(store.steps_for(&message.id).len(), 1);

        handle.shutdown();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let late = json!({
            "type": "chorus_step",
            "data": {
                "step": "experience",
                "content": {"synthesis": "too late"},
                "message_id": message.id.as_str()
            }
        })
        .to_string();
        let _ = inbound.send(late);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(store.steps_for(&message.id).len(), 1);
    }
}
