//! Device-local copy of the family ledger, kept current by pulling the change
//! feed.

use libsql::Connection;
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

use super::error::ClientResult;
use super::outbox::{FlushReport, OutboxManager};
use super::store::{DeviceDb, entity_key};
use super::transport::SyncTransport;
use crate::calendar::format_instant;
use crate::constants::DEFAULT_SYNC_LIMIT;
use crate::models::{BootstrapSnapshot, ChangeAction, ChangeLogEntry, EntityType};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub flush: FlushReport,
    pub bootstrapped: bool,
    pub applied: usize,
    pub cursor: i64,
}

#[derive(Clone)]
pub struct Replica {
    db: DeviceDb,
}

async fn stored_change_id(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> ClientResult<Option<i64>> {
    let mut rows = conn
        .query(
            "SELECT last_change_id FROM replica_records WHERE entity_type = ? AND entity_id = ?",
            [entity_type, entity_id],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

async fn put_record(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
    payload: Option<&Value>,
    change_id: i64,
) -> ClientResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO replica_records \
         (entity_type, entity_id, payload, is_deleted, last_change_id) VALUES (?, ?, ?, ?, ?)",
        libsql::params![
            entity_type,
            entity_id,
            payload.map(serde_json::to_string).transpose()?,
            i64::from(payload.is_none()),
            change_id,
        ],
    )
    .await?;
    Ok(())
}

async fn put_snapshot_rows<T: Serialize>(
    conn: &Connection,
    entity_type: EntityType,
    rows: &[T],
    id_of: impl Fn(&T) -> String,
) -> ClientResult<()> {
    let key = entity_key(entity_type)?;
    for row in rows {
        let payload = serde_json::to_value(row)?;
        put_record(conn, &key, &id_of(row), Some(&payload), 0).await?;
    }
    Ok(())
}

impl Replica {
    pub fn new(db: DeviceDb) -> Self {
        Self { db }
    }

    /// `None` until the first bootstrap.
    pub async fn cursor(&self) -> ClientResult<Option<i64>> {
        let conn = self.db.read().await;
        let mut rows = conn
            .query("SELECT cursor FROM sync_state WHERE id = 1", ())
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    async fn store_cursor(conn: &Connection, cursor: i64, now: OffsetDateTime) -> ClientResult<()> {
        conn.execute(
            "INSERT INTO sync_state (id, cursor, last_synced_at) VALUES (1, ?, ?) \
             ON CONFLICT (id) DO UPDATE SET cursor = excluded.cursor, \
             last_synced_at = excluded.last_synced_at",
            libsql::params![cursor, format_instant(now)?],
        )
        .await?;
        Ok(())
    }

    /// Applies one change. Returns false when the record already reflects this
    /// change or a later one, so replays are no-ops.
    pub async fn apply_change(&self, change: &ChangeLogEntry) -> ClientResult<bool> {
        let conn = self.db.write().await;
        Self::apply_change_on(&conn, change).await
    }

    async fn apply_change_on(conn: &Connection, change: &ChangeLogEntry) -> ClientResult<bool> {
        let key = entity_key(change.entity_type)?;
        if let Some(seen) = stored_change_id(conn, &key, &change.entity_id).await? {
            if seen >= change.id {
                return Ok(false);
            }
        }

        let payload = match change.action {
            ChangeAction::Upsert => Some(&change.payload),
            ChangeAction::Delete => None,
        };
        put_record(conn, &key, &change.entity_id, payload, change.id).await?;
        Ok(true)
    }

    /// Replaces the whole replica with `snapshot` and resumes from its cursor.
    pub async fn apply_snapshot(
        &self,
        snapshot: &BootstrapSnapshot,
        now: OffsetDateTime,
    ) -> ClientResult<()> {
        let conn = self.db.write().await;
        let tx = conn.transaction().await?;
        tx.execute("DELETE FROM replica_records", ()).await?;

        put_snapshot_rows(&tx, EntityType::Entry, &snapshot.entries, |e| e.id.clone()).await?;
        put_snapshot_rows(&tx, EntityType::EntryCategory, &snapshot.entry_categories, |c| {
            c.id.clone()
        })
        .await?;
        put_snapshot_rows(&tx, EntityType::PaymentMethod, &snapshot.payment_methods, |m| {
            m.id.clone()
        })
        .await?;
        put_snapshot_rows(&tx, EntityType::RecurringRule, &snapshot.recurring_rules, |r| {
            r.id.clone()
        })
        .await?;
        put_snapshot_rows(&tx, EntityType::MonthlyBalance, &snapshot.monthly_balances, |b| {
            b.ym.to_string()
        })
        .await?;

        Self::store_cursor(&tx, snapshot.next_cursor, now).await?;
        tx.commit().await?;

        tracing::info!(cursor = snapshot.next_cursor, "replica bootstrapped");
        Ok(())
    }

    pub async fn bootstrap(
        &self,
        transport: &dyn SyncTransport,
        now: OffsetDateTime,
    ) -> ClientResult<i64> {
        let snapshot = transport.bootstrap().await?;
        self.apply_snapshot(&snapshot, now).await?;
        Ok(snapshot.next_cursor)
    }

    /// Pulls pages until the feed is drained. Each page and its cursor commit
    /// together, so an interrupted pull resumes where it stopped.
    pub async fn pull_all(
        &self,
        transport: &dyn SyncTransport,
        now: OffsetDateTime,
    ) -> ClientResult<usize> {
        let mut cursor = self.cursor().await?.unwrap_or(0);
        let mut applied = 0;

        loop {
            let page = transport.pull(cursor, DEFAULT_SYNC_LIMIT).await?;
            if page.changes.is_empty() {
                break;
            }

            let conn = self.db.write().await;
            let tx = conn.transaction().await?;
            for change in &page.changes {
                if Self::apply_change_on(&tx, change).await? {
                    applied += 1;
                }
            }
            Self::store_cursor(&tx, page.next_cursor, now).await?;
            tx.commit().await?;

            cursor = page.next_cursor;
            if page.changes.len() < DEFAULT_SYNC_LIMIT as usize {
                break;
            }
        }

        Ok(applied)
    }

    /// Flushes queued writes first so the pull that follows sees them.
    pub async fn sync_pass(
        &self,
        outbox: &OutboxManager,
        transport: &dyn SyncTransport,
        now: OffsetDateTime,
    ) -> ClientResult<SyncReport> {
        let flush = outbox.flush(transport, now).await?;

        let bootstrapped = self.cursor().await?.is_none();
        if bootstrapped {
            self.bootstrap(transport, now).await?;
        }
        let applied = self.pull_all(transport, now).await?;
        let cursor = self.cursor().await?.unwrap_or(0);

        tracing::debug!(sent = flush.sent.len(), applied, cursor, "sync pass finished");
        Ok(SyncReport {
            flush,
            bootstrapped,
            applied,
            cursor,
        })
    }

    pub async fn record(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> ClientResult<Option<Value>> {
        let key = entity_key(entity_type)?;
        let conn = self.db.read().await;
        let mut rows = conn
            .query(
                "SELECT payload FROM replica_records \
                 WHERE entity_type = ? AND entity_id = ? AND is_deleted = 0",
                [key.as_str(), entity_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => {
                let payload: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&payload)?))
            }
            None => Ok(None),
        }
    }

    /// Live records of one type, ordered by id.
    pub async fn records(&self, entity_type: EntityType) -> ClientResult<Vec<Value>> {
        let key = entity_key(entity_type)?;
        let conn = self.db.read().await;
        let mut rows = conn
            .query(
                "SELECT payload FROM replica_records \
                 WHERE entity_type = ? AND is_deleted = 0 ORDER BY entity_id ASC",
                [key.as_str()],
            )
            .await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            let payload: String = row.get(0)?;
            records.push(serde_json::from_str(&payload)?);
        }
        Ok(records)
    }
}
