//! Error taxonomy shared by every client and the controller.

use thiserror::Error;

/// Result type alias using [`ControlError`].
pub type Result<T> = std::result::Result<T, ControlError>;

/// Errors surfaced by the scheduling service, the randomness source, or local configuration.
#[derive(Error, Debug)]
pub enum ControlError {
    /// The scheduling service reports that the session is not (or no longer) authenticated.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Transport failure or application-level rejection from the queue protocol.
    #[error("queue protocol error: {0}")]
    QueueProtocol(String),

    /// The streaming connection to the randomness source failed or closed early.
    #[error("stream transport error: {0}")]
    StreamTransport(String),

    /// A response body did not match the expected schema.
    #[error("malformed response: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP transport error talking to the scheduling service.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ControlError {
    /// Whether this failure should trigger a re-login.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Whether this failure belongs to the queue protocol family.
    ///
    /// Malformed bodies and HTTP transport errors are reported as queue
    /// protocol failures by the callers that log them.
    pub fn is_queue_protocol(&self) -> bool {
        matches!(
            self,
            Self::QueueProtocol(_) | Self::Serialization(_) | Self::Http(_)
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ControlError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::StreamTransport(e.to_string())
    }
}

/// Whether an application-level `message` from the scheduling service means
/// "not authenticated". The service answers 200 with a JSON `message` body in
/// that case, so the status code alone is not enough.
pub fn is_auth_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["login", "logged", "authenticat", "unauthori"]
        .iter()
        .any(|needle| lower.contains(needle))
}
