//! Periodic maintenance: recurring generation, the month-boundary balance pass
//! and receipt expiry, all driven by one explicit `now`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
};
use libsql::Connection;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::balances::recalculate;
use crate::calendar::{YearMonth, local_date, to_utc};
use crate::config::Config;
use crate::constants::SCHEDULER_TOKEN_HEADER;
use crate::database::Db;
use crate::error::{ApiError, ApiResult};
use crate::extract::AppJson;
use crate::models::TickPayload;
use crate::receipts::purge_expired;
use crate::recurrence::{GenerationReport, generate_occurrences};

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TickReport {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub generation: GenerationReport,
    pub families_recalculated: usize,
    pub balances_written: usize,
    pub receipts_purged: u64,
}

/// Families owning any entry or stored balance.
async fn ledger_families(conn: &Connection) -> ApiResult<Vec<String>> {
    let mut rows = conn
        .query(
            "SELECT family_id FROM entries UNION SELECT family_id FROM monthly_balances",
            (),
        )
        .await?;
    let mut families = Vec::new();
    while let Some(row) = rows.next().await? {
        families.push(row.get::<String>(0)?);
    }
    Ok(families)
}

/// Start month per family: the previous local month, pulled earlier when the
/// generator wrote into an older month.
fn recalculation_starts(
    families: Vec<String>,
    generated: &BTreeMap<String, YearMonth>,
    previous_month: YearMonth,
) -> BTreeMap<String, YearMonth> {
    let mut starts: BTreeMap<String, YearMonth> = families
        .into_iter()
        .map(|family_id| (family_id, previous_month))
        .collect();
    for (family_id, earliest) in generated {
        starts
            .entry(family_id.clone())
            .and_modify(|start| *start = (*start).min(*earliest))
            .or_insert(*earliest);
    }
    starts
}

pub async fn run_tick(db: &Db, now: OffsetDateTime) -> ApiResult<TickReport> {
    let conn = db.write().await;
    let target = local_date(now);

    let generation = generate_occurrences(&conn, target, now).await?;

    let starts = recalculation_starts(
        ledger_families(&conn).await?,
        &generation.earliest_month,
        YearMonth::from_instant(now).prev(),
    );
    let mut balances_written = 0;
    for (family_id, start) in &starts {
        balances_written += recalculate(&conn, family_id, *start, now).await?.len();
    }

    let receipts_purged = purge_expired(&conn, now).await?;

    tracing::info!(
        date = %target,
        generated = generation.created,
        families = starts.len(),
        balances_written,
        receipts_purged,
        "scheduler tick finished"
    );

    Ok(TickReport {
        at: now,
        generation,
        families_recalculated: starts.len(),
        balances_written,
        receipts_purged,
    })
}

/// Runs `run_tick` every `interval_secs`, starting immediately.
pub fn spawn_ticker(db: Db, interval_secs: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if let Err(e) = run_tick(&db, OffsetDateTime::now_utc()).await {
                tracing::error!(error = %e, "scheduler tick failed");
            }
        }
    })
}

/// `POST /scheduler/tick`, for external schedulers. Disabled unless a token is
/// configured.
pub async fn trigger_tick(
    State(db): State<Db>,
    State(config): State<Arc<Config>>,
    headers: HeaderMap,
    payload: Option<AppJson<TickPayload>>,
) -> ApiResult<(StatusCode, Json<TickReport>)> {
    let Some(expected) = config.scheduler_token.as_deref() else {
        return Err(ApiError::not_found("Scheduler endpoint is disabled"));
    };
    let supplied = headers
        .get(SCHEDULER_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());
    if supplied != Some(expected) {
        return Err(ApiError::Unauthorized);
    }

    let at = payload
        .and_then(|AppJson(payload)| payload.at)
        .map(to_utc)
        .unwrap_or_else(OffsetDateTime::now_utc);
    let report = run_tick(&db, at).await?;
    Ok((StatusCode::OK, Json(report)))
}
