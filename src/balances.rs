//! Running monthly balances.
//!
//! `balance(ym) = balance(ym - 1) + income(ym) - expense(ym)`, summed over
//! entries whose `occurred_on` falls in `ym`. Recomputation walks forward from an
//! affected month to the current local month; each month commits on its own, so
//! a failure mid-cascade leaves earlier months done and a retry from the same
//! start month finishes the job.

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::Response,
};
use libsql::Connection;
use time::OffsetDateTime;
use tower_sessions::Session;

use crate::auth::get_current_member;
use crate::calendar::{YearMonth, format_date, format_instant, parse_instant};
use crate::change_log;
use crate::conflicts::{WriteDecision, classify};
use crate::database::{Db, bool_from_db, bool_to_db};
use crate::error::{ApiError, ApiResult};
use crate::extract::{AppJson, AppPath, AppQuery};
use crate::models::{
    EntityType, MonthlyBalance, MonthlyBalanceQuery, MonthlyBalanceRangeQuery, MutationResponse,
    PutMonthlyBalancePayload,
};
use crate::receipts::{self, MutationContext};
use crate::utils::{validate_balance, validate_ledger_year};

/// Parses a `YYYY-MM` key and keeps it inside the ledger's year range, so a
/// typo cannot start a cascade over centuries of months.
pub fn parse_ym(value: &str) -> ApiResult<YearMonth> {
    let ym: YearMonth = value.trim().parse().map_err(ApiError::Validation)?;
    validate_ledger_year(ym.year(), "Month")?;
    Ok(ym)
}

fn extract_balance_from_row(row: &libsql::Row) -> ApiResult<MonthlyBalance> {
    let ym: String = row.get(1)?;
    let is_closed: i64 = row.get(3)?;
    let updated_at: String = row.get(4)?;
    Ok(MonthlyBalance {
        family_id: row.get(0)?,
        ym: parse_ym(&ym)?,
        balance: row.get(2)?,
        is_closed: bool_from_db(is_closed),
        updated_at: parse_instant(&updated_at)?,
    })
}

pub async fn find_balance(
    conn: &Connection,
    family_id: &str,
    ym: YearMonth,
) -> ApiResult<Option<MonthlyBalance>> {
    let mut rows = conn
        .query(
            "SELECT family_id, ym, balance, is_closed, updated_at FROM monthly_balances \
             WHERE family_id = ? AND ym = ?",
            libsql::params![family_id, ym.to_string()],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(Some(extract_balance_from_row(&row)?)),
        None => Ok(None),
    }
}

/// Stored balances in `[from, to]`, ascending. Either bound may be open.
pub async fn list_balances(
    conn: &Connection,
    family_id: &str,
    from: Option<YearMonth>,
    to: Option<YearMonth>,
) -> ApiResult<Vec<MonthlyBalance>> {
    let from = from.map(|ym| ym.to_string()).unwrap_or_default();
    let to = to
        .map(|ym| ym.to_string())
        .unwrap_or_else(|| "9999-12".to_string());
    let mut rows = conn
        .query(
            "SELECT family_id, ym, balance, is_closed, updated_at FROM monthly_balances \
             WHERE family_id = ? AND ym >= ? AND ym <= ? ORDER BY ym ASC",
            libsql::params![family_id, from, to],
        )
        .await?;

    let mut balances = Vec::new();
    while let Some(row) = rows.next().await? {
        balances.push(extract_balance_from_row(&row)?);
    }
    Ok(balances)
}

/// `(income, expense)` of the entries dated inside `ym`.
pub async fn month_totals(
    conn: &Connection,
    family_id: &str,
    ym: YearMonth,
) -> ApiResult<(i64, i64)> {
    let mut rows = conn
        .query(
            "SELECT \
               COALESCE(SUM(CASE WHEN entry_type = 'income' THEN amount ELSE 0 END), 0), \
               COALESCE(SUM(CASE WHEN entry_type = 'expense' THEN amount ELSE 0 END), 0) \
             FROM entries WHERE family_id = ? AND occurred_on >= ? AND occurred_on <= ?",
            libsql::params![
                family_id,
                format_date(ym.first_day()),
                format_date(ym.last_day())
            ],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok((row.get(0)?, row.get(1)?)),
        None => Ok((0, 0)),
    }
}

/// Writes one month and its change row. `is_closed` is only set on insert;
/// an existing row keeps its flag unless `closed_override` is given.
async fn write_balance(
    conn: &Connection,
    family_id: &str,
    ym: YearMonth,
    balance: i64,
    closed_override: Option<bool>,
    now: OffsetDateTime,
) -> ApiResult<MonthlyBalance> {
    let tx = conn.transaction().await?;
    tx.execute(
        "INSERT INTO monthly_balances (family_id, ym, balance, is_closed, updated_at) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT (family_id, ym) DO UPDATE SET \
           balance = excluded.balance, \
           is_closed = CASE WHEN ? IS NULL THEN monthly_balances.is_closed ELSE excluded.is_closed END, \
           updated_at = excluded.updated_at",
        libsql::params![
            family_id,
            ym.to_string(),
            balance,
            bool_to_db(closed_override.unwrap_or(false)),
            format_instant(now)?,
            closed_override.map(bool_to_db),
        ],
    )
    .await?;

    let stored = find_balance(&tx, family_id, ym)
        .await?
        .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("balance row vanished after write")))?;
    change_log::record_upsert(
        &tx,
        family_id,
        EntityType::MonthlyBalance,
        &ym.to_string(),
        &stored,
        now,
    )
    .await?;
    tx.commit().await?;
    Ok(stored)
}

/// Recomputes `start_ym ..= current month` and returns the months whose stored
/// balance changed. Months already holding the right balance are left untouched
/// so repeated runs do not grow the change feed.
pub async fn recalculate(
    conn: &Connection,
    family_id: &str,
    start_ym: YearMonth,
    now: OffsetDateTime,
) -> ApiResult<Vec<MonthlyBalance>> {
    let current = YearMonth::from_instant(now);
    if start_ym > current {
        return Ok(Vec::new());
    }

    let mut previous_balance = find_balance(conn, family_id, start_ym.prev())
        .await?
        .map(|row| row.balance)
        .unwrap_or(0);

    let mut written = Vec::new();
    let mut ym = start_ym;
    while ym <= current {
        let (income, expense) = month_totals(conn, family_id, ym).await?;
        let balance = previous_balance
            .checked_add(income)
            .and_then(|total| total.checked_sub(expense))
            .ok_or_else(|| {
                ApiError::validation(format!("Balance for {} is out of range", ym))
            })?;

        let stored = find_balance(conn, family_id, ym).await?;
        if stored.as_ref().map(|row| row.balance) != Some(balance) {
            written.push(write_balance(conn, family_id, ym, balance, None, now).await?);
        }

        previous_balance = balance;
        ym = ym.next();
    }

    if !written.is_empty() {
        tracing::debug!(
            family_id,
            start = %start_ym,
            months = written.len(),
            "monthly balances recomputed"
        );
    }
    Ok(written)
}

/// Seeds a month by hand, then cascades the new value forward.
pub async fn put_balance(
    conn: &Connection,
    family_id: &str,
    ym: YearMonth,
    payload: PutMonthlyBalancePayload,
    now: OffsetDateTime,
) -> ApiResult<MutationResponse<MonthlyBalance>> {
    validate_balance(payload.balance)?;
    validate_ledger_year(ym.year(), "Month")?;
    let current = find_balance(conn, family_id, ym).await?;
    let is_closed = payload
        .is_closed
        .or(current.as_ref().map(|row| row.is_closed))
        .unwrap_or(false);

    let incoming = (payload.balance, is_closed);
    let stored_fields = current.as_ref().map(|row| (row.balance, row.is_closed));
    let decision = classify(
        &incoming,
        stored_fields
            .as_ref()
            .zip(current.as_ref().map(|row| row.updated_at)),
        None,
    );

    if let (WriteDecision::Unchanged, Some(row)) = (decision, current) {
        return Ok(decision.respond(row));
    }

    let stored = write_balance(conn, family_id, ym, payload.balance, Some(is_closed), now).await?;
    recalculate(conn, family_id, ym.next(), now).await?;
    tracing::info!(family_id, ym = %ym, balance = payload.balance, "monthly balance seeded");
    Ok(decision.respond(stored))
}

pub async fn get_monthly_balance(
    State(db): State<Db>,
    session: Session,
    AppQuery(query): AppQuery<MonthlyBalanceQuery>,
) -> ApiResult<(StatusCode, Json<MonthlyBalance>)> {
    let member = get_current_member(&session).await?;
    let ym = parse_ym(&query.ym)?;

    let conn = db.read().await;
    let balance = find_balance(&conn, &member.family_id, ym)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("No balance stored for {}", ym)))?;
    Ok((StatusCode::OK, Json(balance)))
}

pub async fn get_monthly_balances(
    State(db): State<Db>,
    session: Session,
    AppQuery(query): AppQuery<MonthlyBalanceRangeQuery>,
) -> ApiResult<(StatusCode, Json<Vec<MonthlyBalance>>)> {
    let member = get_current_member(&session).await?;
    let from = parse_ym(&query.from)?;
    let to = parse_ym(&query.to)?;
    if from > to {
        return Err(ApiError::validation("'from' must not be after 'to'"));
    }

    let conn = db.read().await;
    let balances = list_balances(&conn, &member.family_id, Some(from), Some(to)).await?;
    Ok((StatusCode::OK, Json(balances)))
}

pub async fn put_monthly_balance(
    State(db): State<Db>,
    AppPath(ym): AppPath<String>,
    ctx: MutationContext,
    AppJson(payload): AppJson<PutMonthlyBalancePayload>,
) -> ApiResult<Response> {
    let MutationContext { member, receipt, now } = ctx;
    let ym = parse_ym(&ym)?;
    receipts::execute(&db, receipt, now, async {
        let conn = db.write().await;
        let response = put_balance(&conn, &member.family_id, ym, payload, now).await?;
        Ok::<_, ApiError>((StatusCode::OK, serde_json::to_value(response)?))
    })
    .await
}
