pub mod error;
pub mod steps;
pub mod threads;

pub use error::StoreError;
pub use steps::StepRegistry;
pub use threads::{StoreEvent, Thread, ThreadStore};
