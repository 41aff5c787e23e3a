//! Error types for the dialogue TTS service

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the TTS task pipeline
#[derive(Error, Debug)]
pub enum Error {
    // Submission/input errors
    #[error("input error: {0}")]
    Input(#[from] InputError),

    // Provider session errors
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    // Blob/persistence errors
    #[error("storage error: {0}")]
    Storage(String),

    // Everything unexpected
    #[error("internal error: {0}")]
    Internal(String),
}

/// Input validation errors
#[derive(Error, Debug)]
pub enum InputError {
    #[error("no dialogue turns parsed from input")]
    EmptyInput,

    #[error("no voice mapping for speaker '{0}'")]
    InvalidSpeaker(String),

    #[error("text too long: {len} chars exceeds limit of {max}")]
    OversizedText { len: usize, max: usize },
}

/// Provider session errors
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("session timed out during {phase}")]
    Timeout { phase: &'static str },

    #[error("transport closed before final status")]
    Truncated,

    #[error("provider status {code}: {message}")]
    Server {
        code: i32,
        message: String,
        /// Whether the code is in the configured retryable set.
        transient: bool,
    },

    #[error("transport error: {0}")]
    Transport(String),
}

/// Failure-kind taxonomy persisted on task records.
///
/// Kinds, not types: the monitor stores the kind string, and the submission
/// entry maps kinds to HTTP responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Input,
    TransientProvider,
    FatalProvider,
    Storage,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Input => "input",
            ErrorKind::TransientProvider => "transient_provider",
            ErrorKind::FatalProvider => "fatal_provider",
            ErrorKind::Storage => "storage",
            ErrorKind::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "input" => Some(ErrorKind::Input),
            "transient_provider" => Some(ErrorKind::TransientProvider),
            "fatal_provider" => Some(ErrorKind::FatalProvider),
            "storage" => Some(ErrorKind::Storage),
            "internal" => Some(ErrorKind::Internal),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Classify this error into the persisted taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Input(_) => ErrorKind::Input,
            Error::Provider(p) => match p {
                ProviderError::Timeout { .. } => ErrorKind::TransientProvider,
                ProviderError::Truncated => ErrorKind::TransientProvider,
                ProviderError::Transport(_) => ErrorKind::TransientProvider,
                ProviderError::Server { transient: true, .. } => ErrorKind::TransientProvider,
                ProviderError::Server { transient: false, .. } => ErrorKind::FatalProvider,
            },
            Error::Storage(_) => ErrorKind::Storage,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a segment worker may retry after this error.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransientProvider
    }

    /// Create a storage error from a string
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Error::Storage(msg.into())
    }

    /// Create an internal error from a string
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("serialization error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(Error::from(InputError::EmptyInput).kind(), ErrorKind::Input);
        assert_eq!(
            Error::from(ProviderError::Truncated).kind(),
            ErrorKind::TransientProvider
        );
        assert_eq!(
            Error::from(ProviderError::Server {
                code: 45000292,
                message: "quota exceeded".into(),
                transient: true,
            })
            .kind(),
            ErrorKind::TransientProvider
        );
        assert_eq!(
            Error::from(ProviderError::Server {
                code: 40000003,
                message: "invalid credentials".into(),
                transient: false,
            })
            .kind(),
            ErrorKind::FatalProvider
        );
        assert_eq!(Error::storage("put failed").kind(), ErrorKind::Storage);
    }

    #[test]
    fn test_retryable() {
        assert!(Error::from(ProviderError::Timeout { phase: "idle" }).is_retryable());
        assert!(!Error::from(InputError::EmptyInput).is_retryable());
        assert!(!Error::storage("put failed").is_retryable());
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            ErrorKind::Input,
            ErrorKind::TransientProvider,
            ErrorKind::FatalProvider,
            ErrorKind::Storage,
            ErrorKind::Internal,
        ] {
            assert_eq!(ErrorKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ErrorKind::parse("bogus"), None);
    }
}
