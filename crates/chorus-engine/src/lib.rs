pub mod controller;
pub mod cycle;
pub mod events;
pub mod priors;

pub use controller::{ChorusController, ControllerHandle};
pub use cycle::{CycleState, LastResponse};
pub use events::EngineEvent;
pub use priors::PriorAggregator;
