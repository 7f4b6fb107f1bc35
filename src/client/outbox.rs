//! Device-side write queue.
//!
//! Mutations made offline are queued in order and replayed strictly FIFO. The
//! item id is sent as `X-Outbox-Id`, so a send that reached the server but lost
//! its response is answered from the server's receipt on retry instead of being
//! applied twice.

use libsql::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use super::error::{ClientError, ClientResult, RetryClass};
use super::store::{DeviceDb, entity_key, from_key, to_key};
use super::transport::SyncTransport;
use crate::calendar::{format_instant, parse_instant};
use crate::constants::{OUTBOX_BACKOFF_BASE_SECS, OUTBOX_BACKOFF_MAX_SECS};
use crate::models::EntityType;

const OUTBOX_COLUMNS: &str = "seq, id, entity_type, entity_id, operation, base_updated_at, \
     method, path, body, created_at, attempts, next_retry_at, last_error_code, \
     last_error_message, failure_class";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutboxOperation {
    Create,
    Update,
    Delete,
}

/// A local write waiting to be queued.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMutation {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: OutboxOperation,
    /// The server version the local edit was made against.
    pub base_updated_at: Option<OffsetDateTime>,
    pub method: String,
    pub path: String,
    pub body: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutboxItem {
    pub seq: i64,
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: OutboxOperation,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub base_updated_at: Option<OffsetDateTime>,
    pub method: String,
    pub path: String,
    pub body: Option<Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub attempts: i64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub next_retry_at: Option<OffsetDateTime>,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
    #[serde(skip)]
    pub failure_class: Option<RetryClass>,
}

impl OutboxItem {
    /// A permanent failure blocks the queue until the caller discards the item.
    pub fn is_blocked(&self) -> bool {
        self.failure_class == Some(RetryClass::Permanent)
    }

    /// The body as sent: `base_updated_at` is added to an object body that does
    /// not already carry one, so the server can flag a soft conflict.
    pub fn request_body(&self) -> ClientResult<Option<Value>> {
        let Some(base) = self.base_updated_at else {
            return Ok(self.body.clone());
        };
        let mut body = self.body.clone().unwrap_or_else(|| Value::Object(Default::default()));
        if let Value::Object(fields) = &mut body {
            if !fields.contains_key("base_updated_at") {
                fields.insert("base_updated_at".to_string(), Value::String(format_instant(base)?));
            }
        }
        Ok(Some(body))
    }
}

/// Why a flush stopped before draining the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushStop {
    /// Head item is backing off until the given instant.
    Waiting { item_id: String, until: OffsetDateTime },
    /// Head item failed with a transient error and was rescheduled.
    Retrying { item_id: String, code: String },
    /// Head item can never succeed as queued.
    Blocked { item_id: String, code: String },
    /// The session is gone; log in again and flush.
    ReauthRequired { item_id: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    pub sent: Vec<String>,
    pub stopped: Option<FlushStop>,
}

/// `base * 2^(attempts - 1)`, capped.
pub fn backoff_delay(attempts: i64) -> Duration {
    let exponent = attempts.saturating_sub(1).clamp(0, 16) as u32;
    let secs = OUTBOX_BACKOFF_BASE_SECS
        .saturating_mul(1_i64 << exponent)
        .min(OUTBOX_BACKOFF_MAX_SECS);
    Duration::seconds(secs)
}

fn extract_item_from_row(row: &libsql::Row) -> ClientResult<OutboxItem> {
    let entity_type: String = row.get(2)?;
    let operation: String = row.get(4)?;
    let base_updated_at: Option<String> = row.get(5)?;
    let body: Option<String> = row.get(8)?;
    let created_at: String = row.get(9)?;
    let next_retry_at: Option<String> = row.get(11)?;
    let failure_class: Option<String> = row.get(14)?;

    Ok(OutboxItem {
        seq: row.get(0)?,
        id: row.get(1)?,
        entity_type: from_key(&entity_type)?,
        entity_id: row.get(3)?,
        operation: from_key(&operation)?,
        base_updated_at: base_updated_at.as_deref().map(parse_instant).transpose()?,
        method: row.get(6)?,
        path: row.get(7)?,
        body: body
            .as_deref()
            .map(serde_json::from_str::<Value>)
            .transpose()?,
        created_at: parse_instant(&created_at)?,
        attempts: row.get(10)?,
        next_retry_at: next_retry_at.as_deref().map(parse_instant).transpose()?,
        last_error_code: row.get(12)?,
        last_error_message: row.get(13)?,
        failure_class: failure_class.as_deref().and_then(RetryClass::parse),
    })
}

#[derive(Clone)]
pub struct OutboxManager {
    db: DeviceDb,
}

impl OutboxManager {
    pub fn new(db: DeviceDb) -> Self {
        Self { db }
    }

    pub async fn enqueue(
        &self,
        mutation: QueuedMutation,
        now: OffsetDateTime,
    ) -> ClientResult<OutboxItem> {
        let QueuedMutation {
            entity_type,
            entity_id,
            operation,
            base_updated_at,
            method,
            path,
            body,
        } = mutation;

        let method = method.to_ascii_uppercase();
        if !matches!(method.as_str(), "POST" | "PATCH" | "PUT" | "DELETE") {
            return Err(ClientError::invalid_request(format!(
                "{} is not a mutation method",
                method
            )));
        }
        if (operation == OutboxOperation::Delete) != (method == "DELETE") {
            return Err(ClientError::invalid_request(format!(
                "{} does not match a {:?} operation",
                method, operation
            )));
        }
        if !path.starts_with('/') {
            return Err(ClientError::invalid_request("Path must start with '/'"));
        }
        if entity_id.trim().is_empty() {
            return Err(ClientError::invalid_request("Entity id cannot be empty"));
        }

        let id = Uuid::new_v4().to_string();
        let body_text = body.as_ref().map(serde_json::to_string).transpose()?;
        let conn = self.db.write().await;
        conn.execute(
            "INSERT INTO outbox_items (id, entity_type, entity_id, operation, base_updated_at, \
             method, path, body, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            libsql::params![
                id.as_str(),
                entity_key(entity_type)?,
                entity_id.as_str(),
                to_key(&operation)?,
                base_updated_at.map(format_instant).transpose()?,
                method.as_str(),
                path.as_str(),
                body_text,
                format_instant(now)?,
            ],
        )
        .await?;

        tracing::debug!(item_id = %id, %method, %path, %entity_id, "mutation queued");
        Ok(OutboxItem {
            seq: conn.last_insert_rowid(),
            id,
            entity_type,
            entity_id,
            operation,
            base_updated_at,
            method,
            path,
            body,
            created_at: now,
            attempts: 0,
            next_retry_at: None,
            last_error_code: None,
            last_error_message: None,
            failure_class: None,
        })
    }

    async fn load_pending(conn: &Connection) -> ClientResult<Vec<OutboxItem>> {
        let sql = format!("SELECT {} FROM outbox_items ORDER BY seq ASC", OUTBOX_COLUMNS);
        let mut rows = conn.query(&sql, ()).await?;
        let mut items = Vec::new();
        while let Some(row) = rows.next().await? {
            items.push(extract_item_from_row(&row)?);
        }
        Ok(items)
    }

    /// Queued items in send order.
    pub async fn pending(&self) -> ClientResult<Vec<OutboxItem>> {
        let conn = self.db.read().await;
        Self::load_pending(&conn).await
    }

    /// Queued items touching one entity, oldest first.
    pub async fn pending_for(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> ClientResult<Vec<OutboxItem>> {
        let conn = self.db.read().await;
        let sql = format!(
            "SELECT {} FROM outbox_items WHERE entity_type = ? AND entity_id = ? ORDER BY seq ASC",
            OUTBOX_COLUMNS
        );
        let mut rows = conn
            .query(&sql, [entity_key(entity_type)?, entity_id.to_string()])
            .await?;
        let mut items = Vec::new();
        while let Some(row) = rows.next().await? {
            items.push(extract_item_from_row(&row)?);
        }
        Ok(items)
    }

    /// Drops an item, typically after the caller resolved a permanent failure.
    pub async fn discard(&self, id: &str) -> ClientResult<bool> {
        let conn = self.db.write().await;
        let removed = conn
            .execute("DELETE FROM outbox_items WHERE id = ?", [id])
            .await?;
        if removed > 0 {
            tracing::info!(item_id = %id, "outbox item discarded");
        }
        Ok(removed > 0)
    }

    async fn record_failure(
        conn: &Connection,
        item: &OutboxItem,
        error: &ClientError,
        now: OffsetDateTime,
    ) -> ClientResult<FlushStop> {
        let attempts = item.attempts + 1;
        let class = error.retry_class();
        let code = error.code();
        let next_retry_at = match class {
            RetryClass::Retryable => Some(now + backoff_delay(attempts)),
            RetryClass::Permanent | RetryClass::ReauthRequired => None,
        };

        conn.execute(
            "UPDATE outbox_items SET attempts = ?, next_retry_at = ?, last_error_code = ?, \
             last_error_message = ?, failure_class = ? WHERE id = ?",
            libsql::params![
                attempts,
                next_retry_at.map(format_instant).transpose()?,
                code.as_str(),
                error.to_string(),
                class.as_str(),
                item.id.as_str(),
            ],
        )
        .await?;

        tracing::warn!(
            item_id = %item.id,
            attempts,
            code = %code,
            class = class.as_str(),
            "outbox send failed"
        );

        let item_id = item.id.clone();
        Ok(match class {
            RetryClass::Retryable => FlushStop::Retrying { item_id, code },
            RetryClass::Permanent => FlushStop::Blocked { item_id, code },
            RetryClass::ReauthRequired => FlushStop::ReauthRequired { item_id },
        })
    }

    /// Sends queued items in order until the queue is empty or one of them
    /// cannot go out now. Later items never overtake a failed one.
    pub async fn flush(
        &self,
        transport: &dyn SyncTransport,
        now: OffsetDateTime,
    ) -> ClientResult<FlushReport> {
        let conn = self.db.write().await;
        let mut report = FlushReport::default();

        for item in Self::load_pending(&conn).await? {
            if item.is_blocked() {
                report.stopped = Some(FlushStop::Blocked {
                    item_id: item.id.clone(),
                    code: item.last_error_code.clone().unwrap_or_default(),
                });
                break;
            }
            if let Some(until) = item.next_retry_at.filter(|until| *until > now) {
                report.stopped = Some(FlushStop::Waiting {
                    item_id: item.id.clone(),
                    until,
                });
                break;
            }

            match transport.send(&item).await {
                Ok(_) => {
                    conn.execute("DELETE FROM outbox_items WHERE id = ?", [item.id.as_str()])
                        .await?;
                    report.sent.push(item.id);
                }
                Err(error) => {
                    report.stopped = Some(Self::record_failure(&conn, &item, &error, now).await?);
                    break;
                }
            }
        }

        if !report.sent.is_empty() {
            tracing::info!(sent = report.sent.len(), "outbox flushed");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1), Duration::seconds(2));
        assert_eq!(backoff_delay(2), Duration::seconds(4));
        assert_eq!(backoff_delay(5), Duration::seconds(32));
        assert_eq!(backoff_delay(40), Duration::seconds(OUTBOX_BACKOFF_MAX_SECS));
    }

    fn item(body: Option<Value>, base_updated_at: Option<OffsetDateTime>) -> OutboxItem {
        let now = OffsetDateTime::UNIX_EPOCH;
        OutboxItem {
            seq: 1,
            id: "item-1".to_string(),
            entity_type: EntityType::Entry,
            entity_id: "e-1".to_string(),
            operation: OutboxOperation::Update,
            base_updated_at,
            method: "PATCH".to_string(),
            path: "/entries/e-1".to_string(),
            body,
            created_at: now,
            attempts: 0,
            next_retry_at: None,
            last_error_code: None,
            last_error_message: None,
            failure_class: None,
        }
    }

    #[test]
    fn request_body_carries_the_base_version() {
        let base = OffsetDateTime::UNIX_EPOCH + Duration::days(1);

        let plain = item(Some(serde_json::json!({ "amount": 5 })), None);
        assert_eq!(plain.request_body().unwrap(), Some(serde_json::json!({ "amount": 5 })));

        let based = item(Some(serde_json::json!({ "amount": 5 })), Some(base));
        assert_eq!(
            based.request_body().unwrap(),
            Some(serde_json::json!({ "amount": 5, "base_updated_at": "1970-01-02T00:00:00Z" }))
        );

        let empty = item(None, Some(base));
        assert_eq!(
            empty.request_body().unwrap(),
            Some(serde_json::json!({ "base_updated_at": "1970-01-02T00:00:00Z" }))
        );

        // An explicit value in the body wins.
        let explicit = item(
            Some(serde_json::json!({ "base_updated_at": "2024-01-01T00:00:00Z" })),
            Some(base),
        );
        assert_eq!(
            explicit.request_body().unwrap(),
            Some(serde_json::json!({ "base_updated_at": "2024-01-01T00:00:00Z" }))
        );
    }
}
