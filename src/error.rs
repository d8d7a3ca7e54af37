use std::sync::Arc;

/// Errors surfaced by negotiation sessions.
///
/// None of them is fatal to the process: the worst case is a session that has to be restarted.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A single create-offer/create-answer/set-description call failed inside the underlying
    /// connection. The state is left as the connection reports it and the next negotiation
    /// event is expected to repair it.
    #[error("negotiation failed: {0}")]
    Negotiation(Arc<webrtc::Error>),
    /// Same as [Error::Negotiation], but reported by a non-webrtc connection.
    #[error("negotiation rejected: {0}")]
    Rejected(String),
    /// Publishing to or subscribing on the signaling relay failed.
    #[error("signaling relay unavailable: {0}")]
    RelayUnavailable(String),
    /// Liveness probe on the active data channel failed.
    #[error("connection to remote peer is dead")]
    ConnectionDead,
    #[error("malformed signaling message: {0}")]
    Codec(Arc<serde_json::Error>),
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),
    #[error("channel closed")]
    Closed,
    /// Connection can't roll its pending local offer back, so a colliding remote offer can
    /// only be applied on a fresh connection.
    #[error("pending local offer cannot be rolled back")]
    RollbackUnsupported,
    /// Operation is not valid in the current state of a connection or session.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Bootstrap answer was produced for another offer than the one written by this run.
    #[error("stale answer from run '{got}', expected '{expected}'")]
    StaleAnswer { expected: String, got: String },
}

impl Error {
    pub fn channel_closed() -> Self {
        Error::Closed
    }

    /// Returns true for failures which are expected to be repaired by the next negotiation round.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Negotiation(_) | Error::Rejected(_))
    }
}

impl From<webrtc::Error> for Error {
    fn from(value: webrtc::Error) -> Self {
        Error::Negotiation(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Codec(Arc::new(value))
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(Arc::new(value))
    }
}
