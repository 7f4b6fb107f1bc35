use axum::{
    extract::State,
    http::StatusCode,
    response::Response,
};
use libsql::Connection;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::calendar::{format_instant, local_date, parse_instant};
use crate::change_log;
use crate::conflicts::{WriteDecision, check_rule_references, classify};
use crate::constants::MAX_MEMO_LENGTH;
use crate::database::{Db, bool_from_db, bool_to_db, enum_from_db, enum_to_db};
use crate::error::{ApiError, ApiResult};
use crate::extract::{AppJson, AppPath};
use crate::models::{
    CreateRecurringRulePayload, DeletedRef, EntityType, Frequency, MutationResponse,
    PublicMember, RecurringRule, RecurringRuleFields, UpdateRecurringRulePayload,
};
use crate::receipts::{self, MutationContext};
use crate::utils::{validate_day_in_range, validate_ledger_year, validate_positive_amount};

const RULE_COLUMNS: &str = "id, family_id, entry_type, amount, entry_category_id, \
     payment_method_id, memo, frequency, day_of_month, holiday_adjustment, start_at, end_at, \
     is_active, created_by_member_id, created_by_name, created_at, updated_at";

pub fn validate_rule_fields(fields: &RecurringRuleFields) -> ApiResult<()> {
    validate_positive_amount(fields.amount)?;
    validate_ledger_year(local_date(fields.start_at).year(), "start_at")?;
    if let Some(end_at) = fields.end_at {
        validate_ledger_year(local_date(end_at).year(), "end_at")?;
    }
    if let Some(memo) = &fields.memo {
        if memo.len() > MAX_MEMO_LENGTH {
            return Err(ApiError::validation(format!(
                "Memo must be less than {} characters",
                MAX_MEMO_LENGTH
            )));
        }
    }
    if let Some(day) = fields.day_of_month {
        match fields.frequency {
            Frequency::Weekly => validate_day_in_range(day, "day_of_month (weekday)", 0, 6)?,
            _ => validate_day_in_range(day, "day_of_month", 1, 31)?,
        }
    }
    if let Some(end_at) = fields.end_at {
        if end_at < fields.start_at {
            return Err(ApiError::validation("end_at must not be before start_at"));
        }
    }
    Ok(())
}

pub fn extract_rule_from_row(row: &libsql::Row) -> ApiResult<RecurringRule> {
    let entry_type: String = row.get(2)?;
    let frequency: String = row.get(7)?;
    let holiday_adjustment: String = row.get(9)?;
    let start_at: String = row.get(10)?;
    let end_at: Option<String> = row.get(11)?;
    let is_active: i64 = row.get(12)?;
    let created_at: String = row.get(15)?;
    let updated_at: String = row.get(16)?;

    Ok(RecurringRule {
        id: row.get(0)?,
        family_id: row.get(1)?,
        fields: RecurringRuleFields {
            entry_type: enum_from_db(&entry_type)?,
            amount: row.get(3)?,
            entry_category_id: row.get(4)?,
            payment_method_id: row.get(5)?,
            memo: row.get(6)?,
            frequency: enum_from_db(&frequency)?,
            day_of_month: row.get(8)?,
            holiday_adjustment: enum_from_db(&holiday_adjustment)?,
            start_at: parse_instant(&start_at)?,
            end_at: end_at.as_deref().map(parse_instant).transpose()?,
            is_active: bool_from_db(is_active),
        },
        created_by_member_id: row.get(13)?,
        created_by_name: row.get(14)?,
        created_at: parse_instant(&created_at)?,
        updated_at: parse_instant(&updated_at)?,
    })
}

async fn query_rules(
    conn: &Connection,
    filter: &str,
    params: impl libsql::params::IntoParams,
) -> ApiResult<Vec<RecurringRule>> {
    let sql = format!(
        "SELECT {} FROM recurring_rules WHERE {} ORDER BY created_at ASC, id ASC",
        RULE_COLUMNS, filter
    );
    let mut rows = conn.query(&sql, params).await?;
    let mut rules = Vec::new();
    while let Some(row) = rows.next().await? {
        rules.push(extract_rule_from_row(&row)?);
    }
    Ok(rules)
}

pub async fn find_recurring_rule(
    conn: &Connection,
    family_id: &str,
    id: &str,
) -> ApiResult<Option<RecurringRule>> {
    let mut rules = query_rules(conn, "family_id = ? AND id = ?", [family_id, id]).await?;
    Ok(rules.pop())
}

pub async fn list_recurring_rules(
    conn: &Connection,
    family_id: &str,
) -> ApiResult<Vec<RecurringRule>> {
    query_rules(conn, "family_id = ?", [family_id]).await
}

pub async fn rules_in_category(
    conn: &Connection,
    family_id: &str,
    category_id: &str,
) -> ApiResult<Vec<RecurringRule>> {
    query_rules(
        conn,
        "family_id = ? AND entry_category_id = ?",
        [family_id, category_id],
    )
    .await
}

/// Active rules of every family, for the generator.
pub async fn list_active_rules(conn: &Connection) -> ApiResult<Vec<RecurringRule>> {
    query_rules(conn, "is_active = 1", ()).await
}

async fn insert_rule_row(conn: &Connection, rule: &RecurringRule) -> ApiResult<()> {
    let fields = &rule.fields;
    let sql = format!(
        "INSERT INTO recurring_rules ({}) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        RULE_COLUMNS
    );
    conn.execute(
        &sql,
        libsql::params![
            rule.id.as_str(),
            rule.family_id.as_str(),
            enum_to_db(&fields.entry_type)?,
            fields.amount,
            fields.entry_category_id.as_deref(),
            fields.payment_method_id.as_deref(),
            fields.memo.as_deref(),
            enum_to_db(&fields.frequency)?,
            fields.day_of_month,
            enum_to_db(&fields.holiday_adjustment)?,
            format_instant(fields.start_at)?,
            fields.end_at.map(format_instant).transpose()?,
            bool_to_db(fields.is_active),
            rule.created_by_member_id.as_str(),
            rule.created_by_name.as_str(),
            format_instant(rule.created_at)?,
            format_instant(rule.updated_at)?,
        ],
    )
    .await
    .map_err(|e| {
        if e.to_string().contains("UNIQUE constraint failed") {
            ApiError::Conflict(format!("Recurring rule id {} is already in use", rule.id))
        } else {
            ApiError::Database(e)
        }
    })?;
    Ok(())
}

pub async fn update_rule_row(conn: &Connection, rule: &RecurringRule) -> ApiResult<()> {
    let fields = &rule.fields;
    conn.execute(
        "UPDATE recurring_rules SET entry_type = ?, amount = ?, entry_category_id = ?, \
         payment_method_id = ?, memo = ?, frequency = ?, day_of_month = ?, \
         holiday_adjustment = ?, start_at = ?, end_at = ?, is_active = ?, updated_at = ? \
         WHERE family_id = ? AND id = ?",
        libsql::params![
            enum_to_db(&fields.entry_type)?,
            fields.amount,
            fields.entry_category_id.as_deref(),
            fields.payment_method_id.as_deref(),
            fields.memo.as_deref(),
            enum_to_db(&fields.frequency)?,
            fields.day_of_month,
            enum_to_db(&fields.holiday_adjustment)?,
            format_instant(fields.start_at)?,
            fields.end_at.map(format_instant).transpose()?,
            bool_to_db(fields.is_active),
            format_instant(rule.updated_at)?,
            rule.family_id.as_str(),
            rule.id.as_str(),
        ],
    )
    .await?;
    Ok(())
}

async fn write_and_log(
    conn: &Connection,
    rule: &RecurringRule,
    insert: bool,
    now: OffsetDateTime,
) -> ApiResult<()> {
    let tx = conn.transaction().await?;
    if insert {
        insert_rule_row(&tx, rule).await?;
    } else {
        update_rule_row(&tx, rule).await?;
    }
    change_log::record_upsert(
        &tx,
        &rule.family_id,
        EntityType::RecurringRule,
        &rule.id,
        rule,
        now,
    )
    .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn create_recurring_rule(
    conn: &Connection,
    actor: &PublicMember,
    payload: CreateRecurringRulePayload,
    now: OffsetDateTime,
) -> ApiResult<(StatusCode, MutationResponse<RecurringRule>)> {
    let fields = payload.fields();
    validate_rule_fields(&fields)?;

    let id = payload
        .id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let existing = find_recurring_rule(conn, &actor.family_id, &id).await?;
    check_rule_references(
        conn,
        &actor.family_id,
        &fields,
        existing.as_ref().map(|rule| &rule.fields),
    )
    .await?;

    let decision = classify(
        &fields,
        existing.as_ref().map(|rule| (&rule.fields, rule.updated_at)),
        None,
    );

    match (decision, existing) {
        (WriteDecision::Unchanged, Some(current)) => Ok((StatusCode::OK, decision.respond(current))),
        (_, Some(current)) => {
            let updated = RecurringRule {
                fields,
                updated_at: now,
                ..current
            };
            write_and_log(conn, &updated, false, now).await?;
            Ok((StatusCode::OK, decision.respond(updated)))
        }
        (_, None) => {
            let rule = RecurringRule {
                id,
                family_id: actor.family_id.clone(),
                fields,
                created_by_member_id: actor.id.clone(),
                created_by_name: actor.username.clone(),
                created_at: now,
                updated_at: now,
            };
            write_and_log(conn, &rule, true, now).await?;
            tracing::info!(rule_id = %rule.id, family_id = %rule.family_id, "recurring rule created");
            Ok((StatusCode::CREATED, MutationResponse::applied(rule)))
        }
    }
}

pub async fn update_recurring_rule(
    conn: &Connection,
    actor: &PublicMember,
    id: &str,
    payload: UpdateRecurringRulePayload,
    now: OffsetDateTime,
) -> ApiResult<MutationResponse<RecurringRule>> {
    let Some(current) = find_recurring_rule(conn, &actor.family_id, id).await? else {
        return Err(ApiError::not_found(format!("Recurring rule {} not found", id)));
    };

    let fields = payload.apply_to(&current.fields);
    validate_rule_fields(&fields)?;
    check_rule_references(conn, &actor.family_id, &fields, Some(&current.fields)).await?;

    let decision = classify(
        &fields,
        Some((&current.fields, current.updated_at)),
        payload.base_updated_at,
    );
    if decision == WriteDecision::Unchanged {
        return Ok(decision.respond(current));
    }

    let updated = RecurringRule {
        fields,
        updated_at: now,
        ..current
    };
    write_and_log(conn, &updated, false, now).await?;
    Ok(decision.respond(updated))
}

/// Generated entries keep their `recurring_rule_id`; the rule only drives them.
pub async fn delete_recurring_rule(
    conn: &Connection,
    actor: &PublicMember,
    id: &str,
    now: OffsetDateTime,
) -> ApiResult<MutationResponse<DeletedRef>> {
    let deleted = DeletedRef { id: id.to_string() };
    if find_recurring_rule(conn, &actor.family_id, id).await?.is_none() {
        return Ok(MutationResponse::unchanged(deleted));
    }

    let tx = conn.transaction().await?;
    tx.execute(
        "DELETE FROM recurring_rules WHERE family_id = ? AND id = ?",
        [actor.family_id.as_str(), id],
    )
    .await?;
    change_log::record_delete(&tx, &actor.family_id, EntityType::RecurringRule, id, now).await?;
    tx.commit().await?;

    tracing::info!(rule_id = %id, family_id = %actor.family_id, "recurring rule deleted");
    Ok(MutationResponse::applied(deleted))
}

pub async fn handle_create_recurring_rule(
    State(db): State<Db>,
    ctx: MutationContext,
    AppJson(payload): AppJson<CreateRecurringRulePayload>,
) -> ApiResult<Response> {
    let MutationContext { member, receipt, now } = ctx;
    receipts::execute(&db, receipt, now, async {
        let conn = db.write().await;
        let (status, response) = create_recurring_rule(&conn, &member, payload, now).await?;
        Ok::<_, ApiError>((status, serde_json::to_value(response)?))
    })
    .await
}

pub async fn handle_update_recurring_rule(
    State(db): State<Db>,
    AppPath(id): AppPath<String>,
    ctx: MutationContext,
    AppJson(payload): AppJson<UpdateRecurringRulePayload>,
) -> ApiResult<Response> {
    let MutationContext { member, receipt, now } = ctx;
    receipts::execute(&db, receipt, now, async {
        let conn = db.write().await;
        let response = update_recurring_rule(&conn, &member, &id, payload, now).await?;
        Ok::<_, ApiError>((StatusCode::OK, serde_json::to_value(response)?))
    })
    .await
}

pub async fn handle_delete_recurring_rule(
    State(db): State<Db>,
    AppPath(id): AppPath<String>,
    ctx: MutationContext,
) -> ApiResult<Response> {
    let MutationContext { member, receipt, now } = ctx;
    receipts::execute(&db, receipt, now, async {
        let conn = db.write().await;
        let response = delete_recurring_rule(&conn, &member, &id, now).await?;
        Ok::<_, ApiError>((StatusCode::OK, serde_json::to_value(response)?))
    })
    .await
}
