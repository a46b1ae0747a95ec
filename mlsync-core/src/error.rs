use std::fmt;

use reqwest::StatusCode;
use thiserror::Error;

/// Symbolic failure kinds understood by the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    SessionExpired,
    NetworkError,
    TokenExpired,
    SubscriptionExpired,
    StorageQuotaExceeded,
    FileTooLarge,
    TooManyRequests,
    UnsupportedFormat,
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::SessionExpired => "session_expired",
            FailureKind::NetworkError => "network_error",
            FailureKind::TokenExpired => "token_expired",
            FailureKind::SubscriptionExpired => "subscription_expired",
            FailureKind::StorageQuotaExceeded => "storage_quota_exceeded",
            FailureKind::FileTooLarge => "file_too_large",
            FailureKind::TooManyRequests => "too_many_requests",
            FailureKind::UnsupportedFormat => "unsupported_format",
            FailureKind::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let kind = match value {
            "session_expired" => FailureKind::SessionExpired,
            "network_error" => FailureKind::NetworkError,
            "token_expired" => FailureKind::TokenExpired,
            "subscription_expired" => FailureKind::SubscriptionExpired,
            "storage_quota_exceeded" => FailureKind::StorageQuotaExceeded,
            "file_too_large" => FailureKind::FileTooLarge,
            "too_many_requests" => FailureKind::TooManyRequests,
            "unsupported_format" => FailureKind::UnsupportedFormat,
            "unknown" => FailureKind::Unknown,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum IndexingError {
    /// Raw transport status, not yet mapped to a [`FailureKind`].
    #[error("indexer returned {status}: {body}")]
    Http { status: StatusCode, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("{kind}: {message}")]
    Failed { kind: FailureKind, message: String },
}

impl IndexingError {
    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        IndexingError::Failed {
            kind,
            message: message.into(),
        }
    }

    /// Symbolic kind of this failure. `None` while a transport status is still
    /// waiting to be passed through [`translate_upload_error`].
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            IndexingError::Http { .. } => None,
            IndexingError::Network(_) => Some(FailureKind::NetworkError),
            IndexingError::Url(_) => Some(FailureKind::Unknown),
            IndexingError::Failed { kind, .. } => Some(*kind),
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            IndexingError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for IndexingError {
    fn from(err: reqwest::Error) -> Self {
        let dropped_mid_request = err.status().is_none() && (err.is_request() || err.is_body());
        if err.is_connect() || err.is_timeout() || dropped_mid_request {
            return IndexingError::Network(err.to_string());
        }
        match err.status() {
            Some(status) => IndexingError::Http {
                status,
                body: String::new(),
            },
            None => IndexingError::failed(FailureKind::Unknown, err.to_string()),
        }
    }
}

/// Maps a transport-status failure onto its symbolic kind. Failures that
/// already carry a kind are returned unchanged.
pub fn translate_upload_error(err: IndexingError) -> IndexingError {
    match err {
        IndexingError::Http { status, body } => {
            let message = if body.is_empty() {
                format!("status code {}", status.as_u16())
            } else {
                body
            };
            IndexingError::Failed {
                kind: kind_for_status(status),
                message,
            }
        }
        other => other,
    }
}

fn kind_for_status(status: StatusCode) -> FailureKind {
    match status {
        StatusCode::UNAUTHORIZED => FailureKind::SessionExpired,
        StatusCode::GONE => FailureKind::TokenExpired,
        StatusCode::PAYMENT_REQUIRED => FailureKind::SubscriptionExpired,
        StatusCode::UPGRADE_REQUIRED => FailureKind::StorageQuotaExceeded,
        StatusCode::PAYLOAD_TOO_LARGE => FailureKind::FileTooLarge,
        StatusCode::TOO_MANY_REQUESTS => FailureKind::TooManyRequests,
        StatusCode::UNSUPPORTED_MEDIA_TYPE => FailureKind::UnsupportedFormat,
        _ => FailureKind::Unknown,
    }
}
