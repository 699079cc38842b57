pub mod content;
pub mod errors;
pub mod ids;
pub mod messages;
pub mod phase;
pub mod priors;
pub mod protocol;
pub mod transport;

pub use content::PhaseContent;
pub use errors::{EngineError, TransportError};
pub use ids::{MessageId, PriorId, ThreadId, UserId};
pub use messages::{Author, Message, Step, StepStatus};
pub use phase::Phase;
pub use priors::Prior;
pub use protocol::{ChorusStepPayload, ClientEnvelope, ServerEnvelope};
pub use transport::Transport;
