use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};
use url::Url;

use chorus_core::errors::TransportError;
use chorus_core::protocol::ClientEnvelope;
use chorus_core::transport::Transport;

const INBOUND_CHANNEL_CAPACITY: usize = 256;
const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

/// WebSocket transport.
///
/// `connect` owns the socket inside a spawned pump task; the handle only
/// holds channels. Outbound envelopes are serialized on the caller's task and
/// queued; inbound text frames fan out on a broadcast channel that
/// `ChorusController::attach` consumes. When the socket drops, the connected
/// flag flips to false and stays false: reconnection means building a new
/// `WsTransport` and re-attaching.
#[derive(Debug)]
pub struct WsTransport {
    outbound: mpsc::Sender<String>,
    inbound: broadcast::Sender<String>,
    connected: watch::Receiver<bool>,
}

impl WsTransport {
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let url = Url::parse(url).map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        let (socket, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        debug!(%url, "websocket connected");

        let (mut sink, mut stream) = socket.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_CHANNEL_CAPACITY);
        let (inbound_tx, _) = broadcast::channel(INBOUND_CHANNEL_CAPACITY);
        let (connected_tx, connected_rx) = watch::channel(true);

        let inbound = inbound_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = stream.next() => match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            // Nobody subscribed yet is fine; frames are only
                            // meaningful once a controller is attached
                            let _ = inbound_tx.send(text.to_string());
                        }
                        Some(Ok(WsMessage::Ping(payload))) => {
                            if sink.send(WsMessage::Pong(payload)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            debug!("websocket closed by peer");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(error = %err, "websocket read failed");
                            break;
                        }
                    },
                    outgoing = outbound_rx.recv() => match outgoing {
                        Some(text) => {
                            if let Err(err) = sink.send(WsMessage::Text(text.into())).await {
                                warn!(error = %err, "websocket send failed");
                                break;
                            }
                        }
                        // All senders dropped: close politely
                        None => {
                            let _ = sink.send(WsMessage::Close(None)).await;
                            break;
                        }
                    },
                }
            }
            let _ = connected_tx.send(false);
            debug!("websocket pump stopped");
        });

        Ok(Self {
            outbound: outbound_tx,
            inbound,
            connected: connected_rx,
        })
    }

    /// Subscribe to inbound text frames. Hand the receiver to
    /// `ChorusController::attach`.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.inbound.subscribe()
    }

    /// A watch on the connected flag, for callers that want to react to the
    /// socket dropping.
    pub fn connection_status(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    async fn send(&self, envelope: &ClientEnvelope) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let text = serde_json::to_string(envelope)
            .map_err(|e| TransportError::Serialization(e.to_string()))?;
        debug!(envelope_type = envelope.envelope_type(), "sending envelope");
        self.outbound
            .send(text)
            .await
            .map_err(|_| TransportError::Closed)
    }
}
