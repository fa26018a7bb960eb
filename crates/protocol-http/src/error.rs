use axum::http::StatusCode;
use thiserror::Error;
use txlog::TxLogError;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Log(#[from] TxLogError),

    #[error("Log read task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Non-success response from a remote log server.
    #[error("Remote log server returned {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ProtocolError {
    /// Status a log server answers with for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            ProtocolError::Log(TxLogError::EmptyLog { .. }) => StatusCode::NOT_FOUND,
            ProtocolError::Log(TxLogError::InvalidNamespace(_)) => StatusCode::BAD_REQUEST,
            ProtocolError::Remote { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ProtocolError::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True when the remote side reported an empty or unknown log.
    pub fn is_not_found(&self) -> bool {
        self.status() == StatusCode::NOT_FOUND
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::NamespaceId;

    #[test]
    fn test_status_mapping() {
        let empty = ProtocolError::from(TxLogError::EmptyLog {
            namespace: NamespaceId::new("a"),
        });
        assert_eq!(empty.status(), StatusCode::NOT_FOUND);
        assert!(empty.is_not_found());

        let invalid = ProtocolError::from(TxLogError::InvalidNamespace("../x".into()));
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

        let corrupt = ProtocolError::from(TxLogError::ChecksumMismatch {
            offset: 0,
            expected: "00".into(),
            actual: "ff".into(),
        });
        assert_eq!(corrupt.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
