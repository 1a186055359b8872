use crate::ids::PeerId;

/// Errors raised by the hub and subscriber.
///
/// Only [`RelayError::Bind`] is fatal to the process. Everything else tears
/// down at most one connection or skips one round.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Dial or upgrade failed. The subscriber backs off and dials again.
    #[error("connect failed: {0}")]
    Connect(String),
    /// Read or write failed on an established connection.
    #[error("transport error for {peer}: {reason}")]
    Transport { peer: PeerId, reason: String },
    /// Ack for a peer or round that is not ours. Ignored by the hub.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),
    /// Malformed message.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    /// The data source could not produce a payload.
    #[error("data source failed: {0}")]
    Source(String),
    /// The hub could not bind its listen address.
    #[error("bind failed: {0}")]
    Bind(#[from] std::io::Error),
}

impl RelayError {
    pub fn transport(peer: &PeerId, reason: impl Into<String>) -> Self {
        Self::Transport {
            peer: peer.clone(),
            reason: reason.into(),
        }
    }

    /// Whether the error ends the process rather than one connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Bind(_))
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::Transport { .. } => "transport",
            Self::ProtocolMismatch(_) => "protocol_mismatch",
            Self::Codec(_) => "codec",
            Self::Source(_) => "source",
            Self::Bind(_) => "bind",
        }
    }
}
