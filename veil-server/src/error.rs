use thiserror::Error;

/// Failures of the chat-key broker and its store.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("{0} not found")]
    NotFound(&'static str),
    /// The operation conflicts with existing state (self-request, duplicate
    /// chat or request, request already answered).
    #[error("{0}")]
    StateConflict(&'static str),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl BrokerError {
    /// Message safe to send back to a client.
    pub fn client_message(&self) -> String {
        match self {
            Self::Storage(_) => "Internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<garde::Report> for BrokerError {
    fn from(report: garde::Report) -> Self {
        Self::InvalidInput(report.to_string())
    }
}

/// Inbound frame could not be turned into a known request.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown frame type: {0}")]
    UnknownType(String),
    #[error("invalid frame data: {0}")]
    Invalid(#[from] garde::Report),
}
