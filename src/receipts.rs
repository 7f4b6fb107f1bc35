//! Mutation receipts keyed by the client's `X-Outbox-Id` token.
//!
//! The first successful execution of a mutation stores its exact response; a
//! retry with the same token on the same `(family, endpoint, method)` gets those
//! bytes back without re-running the mutation. Reusing a token for a different
//! operation is a fatal conflict.

use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, Method, StatusCode, Uri, header, request::Parts},
    response::{IntoResponse, Response},
};
use libsql::Connection;
use serde_json::json;
use std::future::Future;
use time::{Duration, OffsetDateTime};
use tower_sessions::Session;

use crate::auth::get_current_member;
use crate::calendar::format_instant;
use crate::constants::*;
use crate::database::Db;
use crate::error::{ApiError, ApiResult, FatalConflict, FatalConflictCode};
use crate::models::{EntityType, PublicMember};

#[derive(Debug, Clone, PartialEq)]
pub struct MutationReceipt {
    pub request_id: String,
    pub family_id: String,
    pub endpoint: String,
    pub method: String,
    pub status: u16,
    pub response_body: String,
    pub expires_at: i64,
}

/// Identity of one idempotent mutation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptKey {
    pub request_id: String,
    pub family_id: String,
    pub endpoint: String,
    pub method: String,
}

impl ReceiptKey {
    pub fn new(
        request_id: impl Into<String>,
        family_id: impl Into<String>,
        endpoint: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            family_id: family_id.into(),
            endpoint: endpoint.into(),
            method: method.into(),
        }
    }

    /// Reads the token header; no header means no replay protection.
    pub fn from_request(
        headers: &HeaderMap,
        family_id: &str,
        method: &Method,
        uri: &Uri,
    ) -> ApiResult<Option<Self>> {
        let Some(raw) = headers.get(OUTBOX_ID_HEADER) else {
            return Ok(None);
        };
        let token = raw
            .to_str()
            .map_err(|_| ApiError::validation("X-Outbox-Id must be visible ASCII"))?
            .trim();
        if token.is_empty() {
            return Err(ApiError::validation("X-Outbox-Id cannot be empty"));
        }
        if token.len() > MAX_OUTBOX_ID_LENGTH {
            return Err(ApiError::validation(format!(
                "X-Outbox-Id must be at most {} characters",
                MAX_OUTBOX_ID_LENGTH
            )));
        }
        Ok(Some(Self::new(
            token,
            family_id,
            uri.path(),
            method.as_str(),
        )))
    }

    fn matches(&self, receipt: &MutationReceipt) -> bool {
        self.family_id == receipt.family_id
            && self.endpoint == receipt.endpoint
            && self.method == receipt.method
    }
}

/// Everything a mutation handler needs besides its body: the caller, the
/// optional receipt key and the request's single clock reading.
#[derive(Debug, Clone)]
pub struct MutationContext {
    pub member: PublicMember,
    pub receipt: Option<ReceiptKey>,
    pub now: OffsetDateTime,
}

impl<S> FromRequestParts<S> for MutationContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let session = Session::from_request_parts(parts, state)
            .await
            .map_err(|(_, message)| ApiError::Internal(anyhow::anyhow!(message)))?;
        let member = get_current_member(&session).await?;
        let receipt =
            ReceiptKey::from_request(&parts.headers, &member.family_id, &parts.method, &parts.uri)?;
        Ok(Self {
            member,
            receipt,
            now: OffsetDateTime::now_utc(),
        })
    }
}

#[derive(Debug)]
pub enum ReceiptLookup {
    Miss,
    Replay(MutationReceipt),
    Mismatch(MutationReceipt),
}

pub async fn find_receipt(
    conn: &Connection,
    request_id: &str,
    now: OffsetDateTime,
) -> ApiResult<Option<MutationReceipt>> {
    let mut rows = conn
        .query(
            "SELECT request_id, family_id, endpoint, method, status, response_body, expires_at \
             FROM mutation_receipts WHERE request_id = ? AND expires_at > ?",
            libsql::params![request_id, now.unix_timestamp()],
        )
        .await?;

    let Some(row) = rows.next().await? else {
        return Ok(None);
    };
    let status: i64 = row.get(4)?;
    Ok(Some(MutationReceipt {
        request_id: row.get(0)?,
        family_id: row.get(1)?,
        endpoint: row.get(2)?,
        method: row.get(3)?,
        status: u16::try_from(status).unwrap_or(200),
        response_body: row.get(5)?,
        expires_at: row.get(6)?,
    }))
}

pub async fn lookup(
    conn: &Connection,
    key: &ReceiptKey,
    now: OffsetDateTime,
) -> ApiResult<ReceiptLookup> {
    Ok(match find_receipt(conn, &key.request_id, now).await? {
        None => ReceiptLookup::Miss,
        Some(receipt) if key.matches(&receipt) => ReceiptLookup::Replay(receipt),
        Some(receipt) => ReceiptLookup::Mismatch(receipt),
    })
}

/// Concurrent first executions of one token race here; the last writer wins,
/// which is fine because the row is addressed by the token alone.
pub async fn store(
    conn: &Connection,
    key: &ReceiptKey,
    status: StatusCode,
    response_body: &str,
    now: OffsetDateTime,
) -> ApiResult<()> {
    let expires_at = now + Duration::days(RECEIPT_TTL_DAYS);
    conn.execute(
        "INSERT OR REPLACE INTO mutation_receipts \
         (request_id, family_id, endpoint, method, status, response_body, created_at, expires_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        libsql::params![
            key.request_id.as_str(),
            key.family_id.as_str(),
            key.endpoint.as_str(),
            key.method.as_str(),
            i64::from(status.as_u16()),
            response_body,
            format_instant(now)?,
            expires_at.unix_timestamp(),
        ],
    )
    .await?;
    Ok(())
}

/// Deletes receipts whose `expires_at` has passed. Returns the number removed.
pub async fn purge_expired(conn: &Connection, now: OffsetDateTime) -> ApiResult<u64> {
    let removed = conn
        .execute(
            "DELETE FROM mutation_receipts WHERE expires_at <= ?",
            [now.unix_timestamp()],
        )
        .await?;
    Ok(removed)
}

fn reused_token(key: &ReceiptKey, receipt: &MutationReceipt) -> FatalConflict {
    let conflict = FatalConflict::new(
        FatalConflictCode::OutboxIdReused,
        EntityType::MutationReceipt,
        key.request_id.clone(),
        format!(
            "X-Outbox-Id '{}' was already used for a different operation",
            key.request_id
        ),
        "Mint a new X-Outbox-Id for this mutation; do not retry it with the same token",
    );
    // Never echo another family's request shape back.
    if receipt.family_id == key.family_id {
        conflict.with_snapshot(&json!({
            "endpoint": receipt.endpoint,
            "method": receipt.method,
        }))
    } else {
        conflict
    }
}

fn json_response(status: StatusCode, body: String) -> Response {
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}

/// Runs `work` at most once per receipt key.
///
/// `work` is only polled on a cache miss. Its successful body is serialized once
/// and the same bytes are both stored and returned, so a replay is
/// byte-identical to the original response. Failures are never cached.
pub async fn execute<F>(
    db: &Db,
    key: Option<ReceiptKey>,
    now: OffsetDateTime,
    work: F,
) -> ApiResult<Response>
where
    F: Future<Output = ApiResult<(StatusCode, serde_json::Value)>>,
{
    if let Some(key) = &key {
        let conn = db.read().await;
        match lookup(&conn, key, now).await? {
            ReceiptLookup::Miss => {}
            ReceiptLookup::Replay(receipt) => {
                tracing::info!(
                    request_id = %key.request_id,
                    endpoint = %key.endpoint,
                    "replaying cached mutation response"
                );
                let status = StatusCode::from_u16(receipt.status).unwrap_or(StatusCode::OK);
                return Ok(json_response(status, receipt.response_body));
            }
            ReceiptLookup::Mismatch(receipt) => {
                tracing::warn!(
                    request_id = %key.request_id,
                    endpoint = %key.endpoint,
                    stored_endpoint = %receipt.endpoint,
                    "outbox id reused across operations"
                );
                return Err(reused_token(key, &receipt).into());
            }
        }
    }

    let (status, value) = work.await?;
    let body = serde_json::to_string(&value)?;

    if let Some(key) = &key {
        let conn = db.write().await;
        store(&conn, key, status, &body, now).await?;
    }

    Ok(json_response(status, body))
}
