/// Typed error hierarchy for the cycle engine.
///
/// No variant is fatal to the process: the store is always left in a
/// consistent, previously valid state. The worst outcome is a cycle that
/// never yields, which leaves its assistant placeholder visibly empty.
#[derive(Clone, Debug, thiserror::Error)]
pub enum EngineError {
    /// A send was attempted while the transport was disconnected. Surfaced
    /// to the caller; nothing was mutated and nothing was sent.
    #[error("transport unavailable")]
    TransportUnavailable,

    /// An inbound envelope failed to parse or was missing a required field.
    /// The envelope is dropped and the cycle stays in its last good phase.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// A `step` value outside the six known phases.
    #[error("unknown phase: {0}")]
    UnknownPhase(String),
}

impl EngineError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::TransportUnavailable => "transport_unavailable",
            Self::MalformedEnvelope(_) => "malformed_envelope",
            Self::UnknownPhase(_) => "unknown_phase",
        }
    }

    /// Whether the error only drops the offending envelope, leaving the
    /// cycle able to make progress from later deliveries.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::MalformedEnvelope(_) | Self::UnknownPhase(_))
    }
}

/// Errors surfaced by a transport adapter.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    Closed,

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<TransportError> for EngineError {
    fn from(_: TransportError) -> Self {
        EngineError::TransportUnavailable
    }
}
