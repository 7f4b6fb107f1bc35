//! Append-only change feed.
//!
//! Every committed upsert or delete of a tracked entity appends exactly one row,
//! through the same connection (and transaction) as the domain write. Row ids
//! come from the table's autoincrement key, which is the single global sequence
//! clients use as their cursor.

use libsql::Connection;
use serde::Serialize;
use serde_json::json;
use time::OffsetDateTime;

use crate::calendar::{format_instant, parse_instant};
use crate::database::{enum_from_db, enum_to_db};
use crate::error::ApiResult;
use crate::models::{ChangeAction, ChangeLogEntry, EntityType, SyncPage};

pub async fn append(
    conn: &Connection,
    family_id: &str,
    entity_type: EntityType,
    entity_id: &str,
    action: ChangeAction,
    payload: &serde_json::Value,
    now: OffsetDateTime,
) -> ApiResult<i64> {
    conn.execute(
        "INSERT INTO change_log (family_id, entity_type, entity_id, action, payload, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
        libsql::params![
            family_id,
            enum_to_db(&entity_type)?,
            entity_id,
            enum_to_db(&action)?,
            serde_json::to_string(payload)?,
            format_instant(now)?,
        ],
    )
    .await?;

    let id = conn.last_insert_rowid();
    tracing::debug!(id, family_id, entity_id, ?entity_type, ?action, "change appended");
    Ok(id)
}

/// Appends the full current snapshot of an entity.
pub async fn record_upsert<T: Serialize>(
    conn: &Connection,
    family_id: &str,
    entity_type: EntityType,
    entity_id: &str,
    snapshot: &T,
    now: OffsetDateTime,
) -> ApiResult<i64> {
    let payload = serde_json::to_value(snapshot)?;
    append(
        conn,
        family_id,
        entity_type,
        entity_id,
        ChangeAction::Upsert,
        &payload,
        now,
    )
    .await
}

pub async fn record_delete(
    conn: &Connection,
    family_id: &str,
    entity_type: EntityType,
    entity_id: &str,
    now: OffsetDateTime,
) -> ApiResult<i64> {
    append(
        conn,
        family_id,
        entity_type,
        entity_id,
        ChangeAction::Delete,
        &json!({ "id": entity_id }),
        now,
    )
    .await
}

/// Highest change id visible to `family_id`, or 0 when the family has none.
pub async fn head(conn: &Connection, family_id: &str) -> ApiResult<i64> {
    let mut rows = conn
        .query(
            "SELECT COALESCE(MAX(id), 0) FROM change_log WHERE family_id = ?",
            [family_id],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(row.get::<i64>(0)?),
        None => Ok(0),
    }
}

pub fn extract_change_from_row(row: &libsql::Row) -> ApiResult<ChangeLogEntry> {
    let entity_type: String = row.get(2)?;
    let action: String = row.get(4)?;
    let payload: String = row.get(5)?;
    let created_at: String = row.get(6)?;

    Ok(ChangeLogEntry {
        id: row.get(0)?,
        family_id: row.get(1)?,
        entity_type: enum_from_db(&entity_type)?,
        entity_id: row.get(3)?,
        action: enum_from_db(&action)?,
        payload: serde_json::from_str(&payload)?,
        created_at: parse_instant(&created_at)?,
    })
}

/// Changes with `id > cursor` in ascending order, at most `limit` rows.
pub async fn changes_after(
    conn: &Connection,
    family_id: &str,
    cursor: i64,
    limit: u32,
) -> ApiResult<Vec<ChangeLogEntry>> {
    let mut rows = conn
        .query(
            "SELECT id, family_id, entity_type, entity_id, action, payload, created_at \
             FROM change_log WHERE family_id = ? AND id > ? ORDER BY id ASC LIMIT ?",
            libsql::params![family_id, cursor, i64::from(limit)],
        )
        .await?;

    let mut changes = Vec::new();
    while let Some(row) = rows.next().await? {
        changes.push(extract_change_from_row(&row)?);
    }
    Ok(changes)
}

/// One page of the feed. `limit == 0` is a head probe: no rows, and the
/// returned cursor is the family's current maximum id.
pub async fn pull(
    conn: &Connection,
    family_id: &str,
    cursor: i64,
    limit: u32,
    now: OffsetDateTime,
) -> ApiResult<SyncPage> {
    if limit == 0 {
        return Ok(SyncPage {
            changes: Vec::new(),
            next_cursor: head(conn, family_id).await?,
            server_time: now,
        });
    }

    let changes = changes_after(conn, family_id, cursor, limit).await?;
    let next_cursor = changes.last().map(|change| change.id).unwrap_or(cursor);

    Ok(SyncPage {
        changes,
        next_cursor,
        server_time: now,
    })
}

pub async fn count_for_entity(
    conn: &Connection,
    entity_type: EntityType,
    entity_id: &str,
) -> ApiResult<i64> {
    let mut rows = conn
        .query(
            "SELECT COUNT(*) FROM change_log WHERE entity_type = ? AND entity_id = ?",
            libsql::params![enum_to_db(&entity_type)?, entity_id],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(row.get::<i64>(0)?),
        None => Ok(0),
    }
}
