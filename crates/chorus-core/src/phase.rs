use serde::{Deserialize, Serialize};

/// The six phases a single assistant response passes through.
///
/// The declaration order is the forward progression; `Update` is the only
/// phase with two outgoing edges (loop back to `Action`, or advance to
/// `Yield`).
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Action,
    Experience,
    Intention,
    Observation,
    Update,
    Yield,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::Action,
        Phase::Experience,
        Phase::Intention,
        Phase::Observation,
        Phase::Update,
        Phase::Yield,
    ];

    /// The default forward successor. `Update`'s branch is decided by the
    /// controller from the loop flag, and `Yield` is terminal.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Action => Some(Phase::Experience),
            Phase::Experience => Some(Phase::Intention),
            Phase::Intention => Some(Phase::Observation),
            Phase::Observation => Some(Phase::Update),
            Phase::Update => Some(Phase::Yield),
            Phase::Yield => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Yield)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Action => "action",
            Phase::Experience => "experience",
            Phase::Intention => "intention",
            Phase::Observation => "observation",
            Phase::Update => "update",
            Phase::Yield => "yield",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "action" => Ok(Phase::Action),
            "experience" => Ok(Phase::Experience),
            "intention" => Ok(Phase::Intention),
            "observation" => Ok(Phase::Observation),
            "update" => Ok(Phase::Update),
            "yield" => Ok(Phase::Yield),
            other => Err(format!("unknown phase: {other}")),
        }
    }
}
