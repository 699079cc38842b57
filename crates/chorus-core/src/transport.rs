use async_trait::async_trait;

use crate::errors::TransportError;
use crate::protocol::ClientEnvelope;

/// Contract for the duplex message channel the engine sends through.
///
/// The engine does not own connection establishment or reconnection policy;
/// it only requires a connectivity flag and a non-blocking send. Inbound
/// frames reach the engine through the channel handed to
/// `ChorusController::attach`, not through this trait.
#[async_trait]
pub trait Transport: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Serialize and send one envelope. Must not mutate any engine state and
    /// must fail with `NotConnected` rather than buffering while down.
    async fn send(&self, envelope: &ClientEnvelope) -> Result<(), TransportError>;
}
