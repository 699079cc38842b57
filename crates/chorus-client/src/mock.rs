use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use chorus_core::errors::TransportError;
use chorus_core::protocol::ClientEnvelope;
use chorus_core::transport::Transport;

const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// In-memory transport for tests and offline tooling.
///
/// Records every envelope the engine sends and lets the test script inbound
/// frames with [`MockTransport::deliver`], which arrive exactly as WebSocket
/// text frames would.
pub struct MockTransport {
    connected: AtomicBool,
    sent: Mutex<Vec<ClientEnvelope>>,
    inbound: broadcast::Sender<String>,
}

impl MockTransport {
    pub fn new() -> Self {
        let (inbound, _) = broadcast::channel(INBOUND_CHANNEL_CAPACITY);
        Self {
            connected: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
            inbound,
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Everything the engine has sent, in order.
    pub fn sent(&self) -> Vec<ClientEnvelope> {
        self.sent.lock().clone()
    }

    /// Push one inbound frame, as if the server had sent it.
    pub fn deliver(&self, frame: impl Into<String>) {
        let _ = self.inbound.send(frame.into());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.inbound.subscribe()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
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
