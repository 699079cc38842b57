use serde::{Deserialize, Serialize};

use crate::phase::Phase;

/// Structured payload of an `action` step.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ActionContent {
    pub proposed_response: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SourceRelevance {
    #[serde(default)]
    pub most_relevant: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
}

/// Structured payload of an `experience` step.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExperienceContent {
    pub synthesis: String,
    #[serde(default)]
    pub key_insights: Vec<String>,
    #[serde(default)]
    pub source_relevance: SourceRelevance,
}

/// Structured payload of an `intention` step.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IntentionContent {
    pub explicit_intent: String,
    #[serde(default)]
    pub implicit_intent: String,
    #[serde(default)]
    pub confidence: f64,
}

/// Structured payload of an `observation` step.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ObservationContent {
    pub context_analysis: String,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub user_state: String,
    #[serde(default)]
    pub confidence: f64,
}

/// Structured payload of an `update` step. `loop` decides whether the cycle
/// restarts from `action` or advances to `yield`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UpdateContent {
    pub reasoning: String,
    #[serde(rename = "loop", default)]
    pub loop_decision: bool,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub key_insights: Vec<String>,
}

/// Structured payload of a `yield` step. `final_response` is the only source
/// of the assistant message's visible text.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct YieldContent {
    pub final_response: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub synthesis_quality: String,
}

/// Tagged union over the six phase payload shapes.
///
/// The wire `content` field may arrive as a structured object, as a
/// JSON-encoded string of the same object, or as a bare string. All three
/// normalize through [`PhaseContent::from_wire`]; shapes that fail to decode
/// degrade to `Raw` rather than being rejected.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PhaseContent {
    Action(ActionContent),
    Experience(ExperienceContent),
    Intention(IntentionContent),
    Observation(ObservationContent),
    Update(UpdateContent),
    Yield(YieldContent),
    Raw(String),
}

impl PhaseContent {
    /// Normalize a wire `content` value for the given phase.
    pub fn from_wire(phase: Phase, value: &serde_json::Value) -> PhaseContent {
        match value {
            serde_json::Value::String(s) => {
                // A JSON-encoded object payload and a plain text payload both
                // arrive as strings; try the structured reading first.
                match serde_json::from_str::<serde_json::Value>(s) {
                    Ok(inner) if inner.is_object() => Self::decode(phase, &inner)
                        .unwrap_or_else(|| PhaseContent::Raw(s.clone())),
                    _ => PhaseContent::Raw(s.clone()),
                }
            }
            serde_json::Value::Object(_) => Self::decode(phase, value)
                .unwrap_or_else(|| PhaseContent::Raw(value.to_string())),
            other => PhaseContent::Raw(other.to_string()),
        }
    }

    fn decode(phase: Phase, value: &serde_json::Value) -> Option<PhaseContent> {
        let content = match phase {
            Phase::Action => PhaseContent::Action(serde_json::from_value(value.clone()).ok()?),
            Phase::Experience => {
                PhaseContent::Experience(serde_json::from_value(value.clone()).ok()?)
            }
            Phase::Intention => {
                PhaseContent::Intention(serde_json::from_value(value.clone()).ok()?)
            }
            Phase::Observation => {
                PhaseContent::Observation(serde_json::from_value(value.clone()).ok()?)
            }
            Phase::Update => PhaseContent::Update(serde_json::from_value(value.clone()).ok()?),
            Phase::Yield => PhaseContent::Yield(serde_json::from_value(value.clone()).ok()?),
        };
        Some(content)
    }

    /// The single human-readable string a view renders for this step.
    pub fn display_content(&self) -> String {
        match self {
            PhaseContent::Action(c) => c.proposed_response.clone(),
            PhaseContent::Experience(c) => c.synthesis.clone(),
            PhaseContent::Intention(c) => c.explicit_intent.clone(),
            PhaseContent::Observation(c) => c.context_analysis.clone(),
            PhaseContent::Update(c) => c.reasoning.clone(),
            PhaseContent::Yield(c) => c.final_response.clone(),
            PhaseContent::Raw(s) => s.clone(),
        }
    }

    /// The loop decision, when this is an `update` payload.
    pub fn loop_decision(&self) -> Option<bool> {
        match self {
            PhaseContent::Update(c) => Some(c.loop_decision),
            _ => None,
        }
    }

    /// The final response text, when this is a `yield` payload.
    pub fn final_response(&self) -> Option<&str> {
        match self {
            PhaseContent::Yield(c) => Some(&c.final_response),
            _ => None,
        }
    }
}
