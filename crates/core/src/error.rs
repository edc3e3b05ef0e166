//! Error types for the call orchestrator

/// Result type alias using the orchestrator Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a call session
///
/// None of these are fatal to the process: transport failures become a
/// user-visible notice, negotiation failures are logged and the caller does
/// not transmit, protocol failures are logged and dropped.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signaling channel not open, closed, or a send could not be delivered
    #[error("Could not deliver: {0}")]
    Transport(String),

    /// WebSocket protocol or I/O failure
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Session description or ICE candidate could not be created or applied
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// Peer-link primitive could not be constructed or closed
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    /// Unrecognized or malformed inbound signaling message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Error reported by the signaling server
    #[error("Server error: {0}")]
    Server(String),

    /// Local media could not be acquired
    #[error("Media error: {0}")]
    Media(String),

    /// JSON encode/decode failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error comes from the signaling transport
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::WebSocket(_) | Error::Io(_))
    }

    /// Check if this error comes from offer/answer/candidate handling
    pub fn is_negotiation(&self) -> bool {
        matches!(self, Error::Negotiation(_) | Error::WebRtc(_))
    }

    /// Whether the user should be told about this error
    ///
    /// Protocol and negotiation failures are only logged.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::WebSocket(_) | Error::Server(_) | Error::Media(_)
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(e.to_string())
    }
}
