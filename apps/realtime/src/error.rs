use thiserror::Error;

/// Errors surfaced by the realtime core.
///
/// Connection-level variants (`Auth`, `Transport`) are handled centrally by the
/// reconnect supervisor; per-action variants are returned to the caller.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// The broker rejected the bearer credential at handshake time.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Network-level failure: link closed, handshake timeout, socket error.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The operation needs a live connection or a LIVE chat room.
    #[error("not connected")]
    NotConnected,

    /// An async result arrived for a subscription or room that is gone.
    #[error("stale update for {0}")]
    StaleUpdate(String),

    /// A STOMP frame could not be parsed.
    #[error("malformed frame: {0}")]
    Frame(String),

    #[error("invalid payload: {0}")]
    Payload(String),

    /// The REST collaborator failed or answered with a non-success status.
    #[error("http error: {0}")]
    Http(String),

    #[error("message content is empty")]
    EmptyMessage,

    /// The room is not among the loaded rooms of this session.
    #[error("unknown chat room {0}")]
    UnknownRoom(i64),

    #[error("broker did not acknowledge receipt {0}")]
    ReceiptTimeout(String),
}

impl RealtimeError {
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn frame(message: impl Into<String>) -> Self {
        Self::Frame(message.into())
    }

    /// Whether the reconnect supervisor may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::ReceiptTimeout(_))
    }
}

impl From<serde_json::Error> for RealtimeError {
    fn from(err: serde_json::Error) -> Self {
        tracing::debug!(?err, "payload error");
        Self::Payload(err.to_string())
    }
}

impl From<reqwest::Error> for RealtimeError {
    fn from(err: reqwest::Error) -> Self {
        tracing::error!(?err, "chat api error");
        match err.status() {
            Some(status) => Self::Http(format!("{status}: {err}")),
            None => Self::Http(err.to_string()),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RealtimeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        tracing::debug!(?err, "websocket error");
        Self::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RealtimeError>;
