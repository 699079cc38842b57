//! Transport adapters for the chorus engine.
//!
//! [`WsTransport`] is the production adapter over a WebSocket; [`MockTransport`]
//! is the in-memory stand-in used by tests and offline tooling. Both implement
//! [`chorus_core::transport::Transport`] and expose the same inbound frame
//! subscription, so the engine never knows which one it is wired to.

pub mod mock;
pub mod ws;

pub use mock::MockTransport;
pub use ws::WsTransport;
