use thiserror::Error;

use crate::error::{ErrorBody, FatalConflictCode};

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// How the outbox should react to a failed send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Retryable,
    Permanent,
    ReauthRequired,
}

impl RetryClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryClass::Retryable => "retryable",
            RetryClass::Permanent => "permanent",
            RetryClass::ReauthRequired => "reauth_required",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "retryable" => Some(RetryClass::Retryable),
            "permanent" => Some(RetryClass::Permanent),
            "reauth_required" => Some(RetryClass::ReauthRequired),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Device store error: {0}")]
    Store(#[from] libsql::Error),

    /// Non-success response; `body` is set when the server sent an error envelope.
    #[error("API error ({status}): {message}")]
    Api {
        status: u16,
        message: String,
        body: Option<ErrorBody>,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ClientError {
    pub fn api(status: u16, message: impl Into<String>, body: Option<ErrorBody>) -> Self {
        Self::Api {
            status,
            message: message.into(),
            body,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn fatal_code(&self) -> Option<FatalConflictCode> {
        match self {
            Self::Api {
                body: Some(ErrorBody::FatalConflict(conflict)),
                ..
            } => Some(conflict.code),
            _ => None,
        }
    }

    /// Fatal conflicts and 4xx rejections will fail the same way on every retry.
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Api { status, .. } => match *status {
                401 | 403 => RetryClass::ReauthRequired,
                408 | 425 | 429 => RetryClass::Retryable,
                500..=599 => RetryClass::Retryable,
                _ => RetryClass::Permanent,
            },
            Self::Http(_) => RetryClass::Retryable,
            Self::Store(_) | Self::Other(_) => RetryClass::Retryable,
            Self::Json(_) | Self::InvalidRequest(_) => RetryClass::Permanent,
        }
    }

    /// Short machine-readable code stored on the outbox item.
    pub fn code(&self) -> String {
        if let Some(code) = self.fatal_code() {
            return serde_json::to_value(code)
                .ok()
                .and_then(|value| value.as_str().map(str::to_string))
                .unwrap_or_else(|| "fatal_conflict".to_string());
        }
        match self {
            Self::Api {
                body: Some(body), ..
            } => match body {
                ErrorBody::Validation { .. } => "validation".to_string(),
                ErrorBody::Unauthorized { .. } => "unauthorized".to_string(),
                ErrorBody::NotFound { .. } => "not_found".to_string(),
                ErrorBody::Conflict { .. } => "conflict".to_string(),
                ErrorBody::FatalConflict(_) => "fatal_conflict".to_string(),
                ErrorBody::Internal { .. } => "internal".to_string(),
            },
            Self::Api { status, .. } => format!("http_{}", status),
            Self::Http(_) => "network".to_string(),
            Self::Json(_) => "invalid_json".to_string(),
            Self::Store(_) => "device_store".to_string(),
            Self::InvalidRequest(_) => "invalid_request".to_string(),
            Self::Other(_) => "other".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FatalConflict;
    use crate::models::EntityType;

    #[test]
    fn fatal_conflict_is_permanent_with_its_code() {
        let conflict = FatalConflict::new(
            FatalConflictCode::CategoryArchived,
            EntityType::EntryCategory,
            "cat-1",
            "archived",
            "pick another",
        );
        let err = ClientError::api(409, "archived", Some(ErrorBody::FatalConflict(conflict)));
        assert_eq!(err.retry_class(), RetryClass::Permanent);
        assert_eq!(err.code(), "category_archived");
    }

    #[test]
    fn server_errors_are_retryable() {
        let err = ClientError::api(503, "unavailable", None);
        assert_eq!(err.retry_class(), RetryClass::Retryable);
        assert_eq!(err.code(), "http_503");
    }

    #[test]
    fn auth_errors_need_reauth() {
        let err = ClientError::api(401, "Not logged in", None);
        assert_eq!(err.retry_class(), RetryClass::ReauthRequired);
    }
}
