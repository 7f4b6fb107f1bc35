use axum::{
    extract::State,
    http::StatusCode,
    response::Response,
};
use libsql::Connection;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::balances::recalculate;
use crate::calendar::{format_date, format_instant, local_date, parse_date, parse_instant};
use crate::change_log;
use crate::conflicts::{WriteDecision, check_entry_references, classify};
use crate::constants::MAX_MEMO_LENGTH;
use crate::database::{Db, enum_from_db, enum_to_db};
use crate::error::{ApiError, ApiResult};
use crate::extract::{AppJson, AppPath};
use crate::models::{
    CreateEntryPayload, DeletedRef, EntityType, Entry, EntryFields, MutationResponse,
    PublicMember, UpdateEntryPayload,
};
use crate::receipts::{self, MutationContext};
use crate::utils::{validate_ledger_year, validate_positive_amount};

const ENTRY_COLUMNS: &str = "id, family_id, entry_type, amount, entry_category_id, \
     payment_method_id, memo, occurred_at, occurred_on, recurring_rule_id, \
     created_by_member_id, created_by_name, created_at, updated_at";

pub fn validate_entry_fields(fields: &EntryFields) -> ApiResult<()> {
    validate_positive_amount(fields.amount)?;
    validate_ledger_year(local_date(fields.occurred_at).year(), "occurred_at")?;
    if let Some(memo) = &fields.memo {
        if memo.len() > MAX_MEMO_LENGTH {
            return Err(ApiError::validation(format!(
                "Memo must be less than {} characters",
                MAX_MEMO_LENGTH
            )));
        }
    }
    Ok(())
}

pub fn extract_entry_from_row(row: &libsql::Row) -> ApiResult<Entry> {
    let entry_type: String = row.get(2)?;
    let occurred_at: String = row.get(7)?;
    let occurred_on: String = row.get(8)?;
    let created_at: String = row.get(12)?;
    let updated_at: String = row.get(13)?;

    Ok(Entry {
        id: row.get(0)?,
        family_id: row.get(1)?,
        fields: EntryFields {
            entry_type: enum_from_db(&entry_type)?,
            amount: row.get(3)?,
            entry_category_id: row.get(4)?,
            payment_method_id: row.get(5)?,
            memo: row.get(6)?,
            occurred_at: parse_instant(&occurred_at)?,
            recurring_rule_id: row.get(9)?,
        },
        occurred_on: parse_date(&occurred_on)?,
        created_by_member_id: row.get(10)?,
        created_by_name: row.get(11)?,
        created_at: parse_instant(&created_at)?,
        updated_at: parse_instant(&updated_at)?,
    })
}

/// Builds a new entry row. `occurred_on` is always derived from `occurred_at`.
pub fn build_entry(
    id: String,
    family_id: &str,
    fields: EntryFields,
    creator: &PublicMember,
    now: OffsetDateTime,
) -> Entry {
    Entry {
        id,
        family_id: family_id.to_string(),
        occurred_on: local_date(fields.occurred_at),
        fields,
        created_by_member_id: creator.id.clone(),
        created_by_name: creator.username.clone(),
        created_at: now,
        updated_at: now,
    }
}

pub async fn find_entry(conn: &Connection, family_id: &str, id: &str) -> ApiResult<Option<Entry>> {
    let sql = format!(
        "SELECT {} FROM entries WHERE family_id = ? AND id = ?",
        ENTRY_COLUMNS
    );
    let mut rows = conn.query(&sql, [family_id, id]).await?;
    match rows.next().await? {
        Some(row) => Ok(Some(extract_entry_from_row(&row)?)),
        None => Ok(None),
    }
}

pub async fn list_entries(conn: &Connection, family_id: &str) -> ApiResult<Vec<Entry>> {
    let sql = format!(
        "SELECT {} FROM entries WHERE family_id = ? ORDER BY occurred_at ASC, id ASC",
        ENTRY_COLUMNS
    );
    let mut rows = conn.query(&sql, [family_id]).await?;
    let mut entries = Vec::new();
    while let Some(row) = rows.next().await? {
        entries.push(extract_entry_from_row(&row)?);
    }
    Ok(entries)
}

pub async fn entries_in_category(
    conn: &Connection,
    family_id: &str,
    category_id: &str,
) -> ApiResult<Vec<Entry>> {
    let sql = format!(
        "SELECT {} FROM entries WHERE family_id = ? AND entry_category_id = ?",
        ENTRY_COLUMNS
    );
    let mut rows = conn.query(&sql, [family_id, category_id]).await?;
    let mut entries = Vec::new();
    while let Some(row) = rows.next().await? {
        entries.push(extract_entry_from_row(&row)?);
    }
    Ok(entries)
}

async fn write_entry_row(conn: &Connection, verb: &str, entry: &Entry) -> ApiResult<u64> {
    let sql = format!(
        "{} INTO entries ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        verb, ENTRY_COLUMNS
    );
    let fields = &entry.fields;
    let affected = conn
        .execute(
            &sql,
            libsql::params![
                entry.id.as_str(),
                entry.family_id.as_str(),
                enum_to_db(&fields.entry_type)?,
                fields.amount,
                fields.entry_category_id.as_deref(),
                fields.payment_method_id.as_deref(),
                fields.memo.as_deref(),
                format_instant(fields.occurred_at)?,
                format_date(entry.occurred_on),
                fields.recurring_rule_id.as_deref(),
                entry.created_by_member_id.as_str(),
                entry.created_by_name.as_str(),
                format_instant(entry.created_at)?,
                format_instant(entry.updated_at)?,
            ],
        )
        .await
        .map_err(|e| {
            if e.to_string().contains("UNIQUE constraint failed") {
                ApiError::Conflict(format!("Entry id {} is already in use", entry.id))
            } else {
                ApiError::Database(e)
            }
        })?;
    Ok(affected)
}

pub async fn insert_entry(conn: &Connection, entry: &Entry) -> ApiResult<()> {
    write_entry_row(conn, "INSERT", entry).await?;
    Ok(())
}

/// Returns false when a row with the same id already existed.
pub async fn insert_entry_if_absent(conn: &Connection, entry: &Entry) -> ApiResult<bool> {
    Ok(write_entry_row(conn, "INSERT OR IGNORE", entry).await? > 0)
}

pub async fn update_entry_row(conn: &Connection, entry: &Entry) -> ApiResult<()> {
    let fields = &entry.fields;
    conn.execute(
        "UPDATE entries SET entry_type = ?, amount = ?, entry_category_id = ?, \
         payment_method_id = ?, memo = ?, occurred_at = ?, occurred_on = ?, \
         recurring_rule_id = ?, updated_at = ? WHERE family_id = ? AND id = ?",
        libsql::params![
            enum_to_db(&fields.entry_type)?,
            fields.amount,
            fields.entry_category_id.as_deref(),
            fields.payment_method_id.as_deref(),
            fields.memo.as_deref(),
            format_instant(fields.occurred_at)?,
            format_date(entry.occurred_on),
            fields.recurring_rule_id.as_deref(),
            format_instant(entry.updated_at)?,
            entry.family_id.as_str(),
            entry.id.as_str(),
        ],
    )
    .await?;
    Ok(())
}

/// Inserts `entry` and its change row in one transaction.
pub async fn commit_new_entry(conn: &Connection, entry: &Entry, now: OffsetDateTime) -> ApiResult<()> {
    let tx = conn.transaction().await?;
    insert_entry(&tx, entry).await?;
    change_log::record_upsert(&tx, &entry.family_id, EntityType::Entry, &entry.id, entry, now)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// Writes `fields` over `current`, logs the change and cascades balances from
/// the earlier of the old and new month.
async fn apply_entry_update(
    conn: &Connection,
    current: Entry,
    fields: EntryFields,
    now: OffsetDateTime,
) -> ApiResult<Entry> {
    let previous_ym = current.ym();
    let updated = Entry {
        occurred_on: local_date(fields.occurred_at),
        fields,
        updated_at: now,
        ..current
    };

    let tx = conn.transaction().await?;
    update_entry_row(&tx, &updated).await?;
    change_log::record_upsert(
        &tx,
        &updated.family_id,
        EntityType::Entry,
        &updated.id,
        &updated,
        now,
    )
    .await?;
    tx.commit().await?;

    recalculate(conn, &updated.family_id, previous_ym.min(updated.ym()), now).await?;
    Ok(updated)
}

/// Create, or upsert when the client supplied an id that already exists.
pub async fn create_entry(
    conn: &Connection,
    actor: &PublicMember,
    payload: CreateEntryPayload,
    now: OffsetDateTime,
) -> ApiResult<(StatusCode, MutationResponse<Entry>)> {
    let fields = payload.fields();
    validate_entry_fields(&fields)?;

    let id = payload
        .id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let existing = find_entry(conn, &actor.family_id, &id).await?;

    check_entry_references(
        conn,
        &actor.family_id,
        &fields,
        existing.as_ref().map(|entry| &entry.fields),
    )
    .await?;

    let decision = classify(
        &fields,
        existing.as_ref().map(|entry| (&entry.fields, entry.updated_at)),
        payload.base_updated_at,
    );

    match (decision, existing) {
        (WriteDecision::Insert, _) | (_, None) => {
            let entry = build_entry(id, &actor.family_id, fields, actor, now);
            commit_new_entry(conn, &entry, now).await?;
            recalculate(conn, &entry.family_id, entry.ym(), now).await?;
            tracing::info!(entry_id = %entry.id, family_id = %entry.family_id, "entry created");
            Ok((StatusCode::CREATED, MutationResponse::applied(entry)))
        }
        (WriteDecision::Unchanged, Some(current)) => {
            // Repairs balances left behind by an earlier partially failed write.
            recalculate(conn, &current.family_id, current.ym(), now).await?;
            Ok((StatusCode::OK, decision.respond(current)))
        }
        (WriteDecision::Apply { .. }, Some(current)) => {
            let updated = apply_entry_update(conn, current, fields, now).await?;
            Ok((StatusCode::OK, decision.respond(updated)))
        }
    }
}

pub async fn update_entry(
    conn: &Connection,
    actor: &PublicMember,
    id: &str,
    payload: UpdateEntryPayload,
    now: OffsetDateTime,
) -> ApiResult<MutationResponse<Entry>> {
    let Some(current) = find_entry(conn, &actor.family_id, id).await? else {
        return Err(ApiError::not_found(format!("Entry {} not found", id)));
    };

    let fields = payload.apply_to(&current.fields);
    validate_entry_fields(&fields)?;
    check_entry_references(conn, &actor.family_id, &fields, Some(&current.fields)).await?;

    let decision = classify(
        &fields,
        Some((&current.fields, current.updated_at)),
        payload.base_updated_at,
    );

    match decision {
        WriteDecision::Unchanged => {
            recalculate(conn, &current.family_id, current.ym(), now).await?;
            Ok(decision.respond(current))
        }
        _ => {
            if let WriteDecision::Apply { conflict: true } = decision {
                tracing::info!(entry_id = %id, "stale base version, applying last write");
            }
            let updated = apply_entry_update(conn, current, fields, now).await?;
            Ok(decision.respond(updated))
        }
    }
}

pub async fn delete_entry(
    conn: &Connection,
    actor: &PublicMember,
    id: &str,
    now: OffsetDateTime,
) -> ApiResult<MutationResponse<DeletedRef>> {
    let deleted = DeletedRef { id: id.to_string() };
    let Some(current) = find_entry(conn, &actor.family_id, id).await? else {
        return Ok(MutationResponse::unchanged(deleted));
    };

    let tx = conn.transaction().await?;
    tx.execute(
        "DELETE FROM entries WHERE family_id = ? AND id = ?",
        [actor.family_id.as_str(), id],
    )
    .await?;
    change_log::record_delete(&tx, &actor.family_id, EntityType::Entry, id, now).await?;
    tx.commit().await?;

    recalculate(conn, &actor.family_id, current.ym(), now).await?;
    tracing::info!(entry_id = %id, family_id = %actor.family_id, "entry deleted");
    Ok(MutationResponse::applied(deleted))
}

pub async fn handle_create_entry(
    State(db): State<Db>,
    ctx: MutationContext,
    AppJson(payload): AppJson<CreateEntryPayload>,
) -> ApiResult<Response> {
    let MutationContext { member, receipt, now } = ctx;
    receipts::execute(&db, receipt, now, async {
        let conn = db.write().await;
        let (status, response) = create_entry(&conn, &member, payload, now).await?;
        Ok::<_, ApiError>((status, serde_json::to_value(response)?))
    })
    .await
}

pub async fn handle_update_entry(
    State(db): State<Db>,
    AppPath(id): AppPath<String>,
    ctx: MutationContext,
    AppJson(payload): AppJson<UpdateEntryPayload>,
) -> ApiResult<Response> {
    let MutationContext { member, receipt, now } = ctx;
    receipts::execute(&db, receipt, now, async {
        let conn = db.write().await;
        let response = update_entry(&conn, &member, &id, payload, now).await?;
        Ok::<_, ApiError>((StatusCode::OK, serde_json::to_value(response)?))
    })
    .await
}

pub async fn handle_delete_entry(
    State(db): State<Db>,
    AppPath(id): AppPath<String>,
    ctx: MutationContext,
) -> ApiResult<Response> {
    let MutationContext { member, receipt, now } = ctx;
    receipts::execute(&db, receipt, now, async {
        let conn = db.write().await;
        let response = delete_entry(&conn, &member, &id, now).await?;
        Ok::<_, ApiError>((StatusCode::OK, serde_json::to_value(response)?))
    })
    .await
}
