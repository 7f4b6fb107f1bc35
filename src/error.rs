//! Error taxonomy shared by every endpoint.
//!
//! Each error renders as `{ "error": { "kind": ..., ... } }`. Fatal conflicts
//! carry enough context (a snapshot of the offending server row and a hint) for a
//! client to repair its request instead of retrying it unchanged.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::*;
use crate::models::EntityType;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FatalConflictCode {
    CategoryNotFound,
    CategoryArchived,
    CategoryMerged,
    PaymentMethodNotFound,
    LinkedBankInvalid,
    RecurringRuleNotFound,
    RecurringRuleInactive,
    MergeTargetInvalid,
    OutboxIdReused,
}

/// A write that can never succeed as submitted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FatalConflict {
    pub code: FatalConflictCode,
    pub message: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub server_snapshot: Option<serde_json::Value>,
    pub resolution_hint: String,
    pub retryable: bool,
}

impl FatalConflict {
    pub fn new(
        code: FatalConflictCode,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        message: impl Into<String>,
        resolution_hint: impl Into<String>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            entity_type,
            entity_id: entity_id.into(),
            server_snapshot: None,
            resolution_hint: resolution_hint.into(),
            retryable: false,
        }
    }

    pub fn with_snapshot<T: Serialize>(mut self, snapshot: &T) -> Self {
        self.server_snapshot = serde_json::to_value(snapshot).ok();
        self
    }
}

/// Discriminated error body.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorBody {
    Validation { message: String },
    Unauthorized { message: String },
    NotFound { message: String },
    Conflict { message: String },
    FatalConflict(FatalConflict),
    Internal { message: String },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{}", ERR_UNAUTHORIZED)]
    Unauthorized,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{}", .0.message)]
    FatalConflict(Box<FatalConflict>),

    #[error("Database error: {0}")]
    Database(#[from] libsql::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) | Self::FatalConflict(_) => StatusCode::CONFLICT,
            Self::Database(_) | Self::Serialization(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn body(&self) -> ErrorBody {
        match self {
            Self::Validation(message) => ErrorBody::Validation {
                message: message.clone(),
            },
            Self::Unauthorized => ErrorBody::Unauthorized {
                message: ERR_UNAUTHORIZED.to_string(),
            },
            Self::NotFound(message) => ErrorBody::NotFound {
                message: message.clone(),
            },
            Self::Conflict(message) => ErrorBody::Conflict {
                message: message.clone(),
            },
            Self::FatalConflict(conflict) => ErrorBody::FatalConflict((**conflict).clone()),
            Self::Database(_) => ErrorBody::Internal {
                message: ERR_DATABASE_OPERATION.to_string(),
            },
            Self::Serialization(_) | Self::Internal(_) => ErrorBody::Internal {
                message: ERR_INTERNAL.to_string(),
            },
        }
    }
}

impl From<FatalConflict> for ApiError {
    fn from(conflict: FatalConflict) -> Self {
        Self::FatalConflict(Box::new(conflict))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "request rejected");
        }
        (status, Json(ErrorEnvelope { error: self.body() })).into_response()
    }
}
