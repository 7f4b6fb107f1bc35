use axum::{
    Json,
    extract::State,
    http::StatusCode,
};
use libsql::Connection;
use time::OffsetDateTime;
use tower_sessions::Session;

use crate::auth::get_current_member;
use crate::balances::list_balances;
use crate::categories::list_categories;
use crate::change_log;
use crate::database::Db;
use crate::entries::list_entries;
use crate::error::ApiResult;
use crate::extract::AppQuery;
use crate::models::{BootstrapSnapshot, SyncPage, SyncQuery};
use crate::payment_methods::list_payment_methods;
use crate::recurring_rules::list_recurring_rules;
use crate::utils::{validate_cursor, validate_sync_limit};

/// Full family state plus the cursor to resume pulling from.
///
/// The head is read before the tables, so a change that lands in between is
/// both in the snapshot and replayed by the next pull. Replays are harmless
/// because clients apply changes as idempotent upserts.
pub async fn bootstrap_snapshot(
    conn: &Connection,
    family_id: &str,
    now: OffsetDateTime,
) -> ApiResult<BootstrapSnapshot> {
    let next_cursor = change_log::head(conn, family_id).await?;

    Ok(BootstrapSnapshot {
        entries: list_entries(conn, family_id).await?,
        entry_categories: list_categories(conn, family_id).await?,
        payment_methods: list_payment_methods(conn, family_id).await?,
        recurring_rules: list_recurring_rules(conn, family_id).await?,
        monthly_balances: list_balances(conn, family_id, None, None).await?,
        next_cursor,
        server_time: now,
    })
}

pub async fn get_sync(
    State(db): State<Db>,
    session: Session,
    AppQuery(query): AppQuery<SyncQuery>,
) -> ApiResult<(StatusCode, Json<SyncPage>)> {
    let member = get_current_member(&session).await?;
    let cursor = validate_cursor(query.cursor)?;
    let limit = validate_sync_limit(query.limit)?;

    let conn = db.read().await;
    let page = change_log::pull(
        &conn,
        &member.family_id,
        cursor,
        limit,
        OffsetDateTime::now_utc(),
    )
    .await?;

    tracing::debug!(
        family_id = %member.family_id,
        cursor,
        returned = page.changes.len(),
        next_cursor = page.next_cursor,
        "sync page served"
    );
    Ok((StatusCode::OK, Json(page)))
}

pub async fn get_bootstrap(
    State(db): State<Db>,
    session: Session,
) -> ApiResult<(StatusCode, Json<BootstrapSnapshot>)> {
    let member = get_current_member(&session).await?;

    let conn = db.read().await;
    let snapshot = bootstrap_snapshot(&conn, &member.family_id, OffsetDateTime::now_utc()).await?;
    Ok((StatusCode::OK, Json(snapshot)))
}
