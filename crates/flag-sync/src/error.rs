use open_feature::{EvaluationError, EvaluationErrorCode};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// The evaluation service rejected the API key (401/403).
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Parse error: {0}")]
    Parse(String),
    /// The coordinator was shut down and cannot be used again.
    #[error("Synchronization has been shut down")]
    Closed,
}

impl SyncError {
    /// Errors that prevent the system from ever becoming usable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::InvalidCredentials(_) | SyncError::Config(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            SyncError::Parse(error.to_string())
        } else {
            SyncError::Connection(error.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(error: serde_json::Error) -> Self {
        SyncError::Parse(error.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(error: url::ParseError) -> Self {
        SyncError::Config(format!("Invalid URL: {}", error))
    }
}

impl From<SyncError> for EvaluationError {
    fn from(error: SyncError) -> Self {
        match error {
            SyncError::InvalidCredentials(msg) => EvaluationError {
                code: EvaluationErrorCode::General(
                    "authentication/authorization error".to_string(),
                ),
                message: Some(msg),
            },
            SyncError::Connection(msg) => EvaluationError {
                code: EvaluationErrorCode::ProviderNotReady,
                message: Some(msg),
            },
            SyncError::Config(msg) => EvaluationError {
                code: EvaluationErrorCode::General("Configuration error".to_string()),
                message: Some(msg),
            },
            SyncError::Parse(msg) => EvaluationError {
                code: EvaluationErrorCode::ParseError,
                message: Some(msg),
            },
            SyncError::Closed => EvaluationError {
                code: EvaluationErrorCode::ProviderNotReady,
                message: Some("provider has been shut down".to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(SyncError::InvalidCredentials("401".into()).is_fatal());
        assert!(SyncError::Config("bad url".into()).is_fatal());
        assert!(!SyncError::Connection("refused".into()).is_fatal());
        assert!(!SyncError::Parse("eof".into()).is_fatal());
    }

    #[test]
    fn test_url_error_maps_to_config() {
        let err: SyncError = url::Url::parse("not a url").unwrap_err().into();
        assert!(matches!(err, SyncError::Config(msg) if msg.starts_with("Invalid URL")));
    }

    #[test]
    fn test_evaluation_error_mapping() {
        let err: EvaluationError = SyncError::Connection("down".into()).into();
        assert_eq!(err.code, EvaluationErrorCode::ProviderNotReady);
        assert_eq!(err.message.as_deref(), Some("down"));

        let err: EvaluationError = SyncError::Parse("eof".into()).into();
        assert_eq!(err.code, EvaluationErrorCode::ParseError);
    }
}
