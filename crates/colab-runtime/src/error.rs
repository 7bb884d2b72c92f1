//! Error taxonomy shared across the Runtime Session Core.

use crate::types::Variant;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("not authenticated")]
    Unauthenticated,

    #[error("http error {status}: {status_text}")]
    HttpError {
        status: u16,
        status_text: String,
        body_text: String,
    },

    #[error("unexpected response shape: {message}")]
    SchemaError { message: String, body: String },

    #[error("quota denied for variant {variant:?}")]
    QuotaDenied { variant: Variant },

    #[error("quota exceeded")]
    QuotaExceeded,

    #[error("denylisted")]
    Denylisted,

    #[error("assignment failed with outcome {outcome}")]
    AssignmentFailed { outcome: String },

    #[error("assignment response is missing runtimeProxyInfo")]
    MissingProxyInfo,

    #[error("transport lost: {reason}")]
    TransportLost { reason: String },

    #[error("operation timed out")]
    Timeout,

    #[error("operation canceled")]
    Canceled,

    #[error("a session can only run one execution at a time")]
    Busy,

    #[error("malformed jupyter message: {0}")]
    ProtocolError(String),

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    History(#[from] colab_history::HistoryError),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
