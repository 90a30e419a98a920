//! Error types for the OPS voice session system

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur in the voice session system
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Audio format error: {0}")]
    AudioFormat(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Unsupported voice: {0}")]
    UnsupportedVoice(String),

    #[error("{service} authentication failed: {message}")]
    Auth {
        service: &'static str,
        message: String,
    },

    #[error("{service} unavailable: {message}")]
    Unavailable {
        service: &'static str,
        message: String,
    },

    #[error("{service} API error {status}: {body}")]
    Api {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("{0} timed out")]
    Timeout(String),

    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: Box<VoiceError>,
    },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Turn {0} is already complete")]
    TurnCompleted(usize),

    #[error("No open turn in conversation history")]
    NoOpenTurn,

    #[error("Turn {0} is still open")]
    TurnStillOpen(usize),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Component failed: {0}")]
    Component(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VoiceError {
    /// Map a non-success HTTP status from an external capability.
    pub fn from_status(service: &'static str, status: u16, body: String) -> Self {
        match status {
            401 | 403 => VoiceError::Auth {
                service,
                message: format!("HTTP {}: {}", status, body),
            },
            _ => VoiceError::Api {
                service,
                status,
                body,
            },
        }
    }

    /// Map a `reqwest` failure from an external capability.
    pub fn http(service: &'static str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return VoiceError::Timeout(service.to_string());
        }
        if let Some(status) = err.status() {
            return VoiceError::from_status(service, status.as_u16(), err.to_string());
        }
        VoiceError::Unavailable {
            service,
            message: err.to_string(),
        }
    }

    /// Whether a retry has a chance of succeeding (network errors, rate limits, 5xx).
    pub fn is_transient(&self) -> bool {
        match self {
            VoiceError::Unavailable { .. } | VoiceError::Timeout(_) => true,
            VoiceError::Api { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            VoiceError::RetriesExhausted { .. } => true,
            _ => false,
        }
    }

    /// Errors that must abort a session (bad credentials or unusable configuration).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VoiceError::Auth { .. }
                | VoiceError::Config(_)
                | VoiceError::UnsupportedLanguage(_)
                | VoiceError::UnsupportedVoice(_)
        )
    }
}
