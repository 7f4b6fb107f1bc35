use axum::{
    extract::State,
    http::StatusCode,
    response::Response,
};
use libsql::Connection;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::calendar::{format_instant, parse_instant};
use crate::change_log;
use crate::conflicts::{WriteDecision, check_linked_bank, classify};
use crate::constants::MAX_PAYMENT_METHOD_NAME_LENGTH;
use crate::database::{Db, enum_from_db, enum_to_db};
use crate::error::{ApiError, ApiResult};
use crate::extract::{AppJson, AppPath};
use crate::models::{
    CreatePaymentMethodPayload, DeletedRef, EntityType, MutationResponse, PaymentMethod,
    PaymentMethodFields, PaymentMethodType, UpdatePaymentMethodPayload,
};
use crate::receipts::{self, MutationContext};
use crate::utils::{validate_day_in_range, validate_string_length};

const PAYMENT_METHOD_COLUMNS: &str = "id, family_id, name, type, card_closing_day, \
     card_payment_day, linked_bank_payment_method_id, created_at, updated_at";

/// Card settings are only meaningful on `card` methods.
pub fn validate_payment_method_fields(fields: &PaymentMethodFields) -> ApiResult<()> {
    validate_string_length(&fields.name, "Payment method name", MAX_PAYMENT_METHOD_NAME_LENGTH)?;

    let has_card_fields = fields.card_closing_day.is_some()
        || fields.card_payment_day.is_some()
        || fields.linked_bank_payment_method_id.is_some();
    if has_card_fields && fields.method_type != PaymentMethodType::Card {
        return Err(ApiError::validation(
            "Card closing/payment days and linked bank are only allowed on card payment methods",
        ));
    }
    if let Some(day) = fields.card_closing_day {
        validate_day_in_range(day, "card_closing_day", 1, 31)?;
    }
    if let Some(day) = fields.card_payment_day {
        validate_day_in_range(day, "card_payment_day", 1, 31)?;
    }
    Ok(())
}

pub fn extract_payment_method_from_row(row: &libsql::Row) -> ApiResult<PaymentMethod> {
    let method_type: String = row.get(3)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;

    Ok(PaymentMethod {
        id: row.get(0)?,
        family_id: row.get(1)?,
        fields: PaymentMethodFields {
            name: row.get(2)?,
            method_type: enum_from_db(&method_type)?,
            card_closing_day: row.get(4)?,
            card_payment_day: row.get(5)?,
            linked_bank_payment_method_id: row.get(6)?,
        },
        created_at: parse_instant(&created_at)?,
        updated_at: parse_instant(&updated_at)?,
    })
}

pub async fn find_payment_method(
    conn: &Connection,
    family_id: &str,
    id: &str,
) -> ApiResult<Option<PaymentMethod>> {
    let sql = format!(
        "SELECT {} FROM payment_methods WHERE family_id = ? AND id = ?",
        PAYMENT_METHOD_COLUMNS
    );
    let mut rows = conn.query(&sql, [family_id, id]).await?;
    match rows.next().await? {
        Some(row) => Ok(Some(extract_payment_method_from_row(&row)?)),
        None => Ok(None),
    }
}

pub async fn list_payment_methods(
    conn: &Connection,
    family_id: &str,
) -> ApiResult<Vec<PaymentMethod>> {
    let sql = format!(
        "SELECT {} FROM payment_methods WHERE family_id = ? ORDER BY name ASC, id ASC",
        PAYMENT_METHOD_COLUMNS
    );
    let mut rows = conn.query(&sql, [family_id]).await?;
    let mut methods = Vec::new();
    while let Some(row) = rows.next().await? {
        methods.push(extract_payment_method_from_row(&row)?);
    }
    Ok(methods)
}

/// Checks a newly set settlement account. A card cannot settle into itself.
async fn check_new_linked_bank(
    conn: &Connection,
    family_id: &str,
    own_id: &str,
    fields: &PaymentMethodFields,
    stored: Option<&PaymentMethodFields>,
) -> ApiResult<()> {
    let Some(bank_id) = &fields.linked_bank_payment_method_id else {
        return Ok(());
    };
    if stored.and_then(|s| s.linked_bank_payment_method_id.as_ref()) == Some(bank_id) {
        return Ok(());
    }
    if bank_id == own_id {
        return Err(ApiError::validation(
            "A card cannot be linked to itself as its settlement bank",
        ));
    }
    check_linked_bank(conn, family_id, bank_id).await?;
    Ok(())
}

async fn insert_payment_method_row(conn: &Connection, method: &PaymentMethod) -> ApiResult<()> {
    let fields = &method.fields;
    let sql = format!(
        "INSERT INTO payment_methods ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        PAYMENT_METHOD_COLUMNS
    );
    conn.execute(
        &sql,
        libsql::params![
            method.id.as_str(),
            method.family_id.as_str(),
            fields.name.as_str(),
            enum_to_db(&fields.method_type)?,
            fields.card_closing_day,
            fields.card_payment_day,
            fields.linked_bank_payment_method_id.as_deref(),
            format_instant(method.created_at)?,
            format_instant(method.updated_at)?,
        ],
    )
    .await
    .map_err(|e| {
        if e.to_string().contains("UNIQUE constraint failed") {
            ApiError::Conflict(format!("Payment method id {} is already in use", method.id))
        } else {
            ApiError::Database(e)
        }
    })?;
    Ok(())
}

async fn update_payment_method_row(conn: &Connection, method: &PaymentMethod) -> ApiResult<()> {
    let fields = &method.fields;
    conn.execute(
        "UPDATE payment_methods SET name = ?, type = ?, card_closing_day = ?, \
         card_payment_day = ?, linked_bank_payment_method_id = ?, updated_at = ? \
         WHERE family_id = ? AND id = ?",
        libsql::params![
            fields.name.as_str(),
            enum_to_db(&fields.method_type)?,
            fields.card_closing_day,
            fields.card_payment_day,
            fields.linked_bank_payment_method_id.as_deref(),
            format_instant(method.updated_at)?,
            method.family_id.as_str(),
            method.id.as_str(),
        ],
    )
    .await?;
    Ok(())
}

async fn write_and_log(
    conn: &Connection,
    method: &PaymentMethod,
    insert: bool,
    now: OffsetDateTime,
) -> ApiResult<()> {
    let tx = conn.transaction().await?;
    if insert {
        insert_payment_method_row(&tx, method).await?;
    } else {
        update_payment_method_row(&tx, method).await?;
    }
    change_log::record_upsert(
        &tx,
        &method.family_id,
        EntityType::PaymentMethod,
        &method.id,
        method,
        now,
    )
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Entries or cards still pointing at this method.
async fn usage_count(conn: &Connection, family_id: &str, id: &str) -> ApiResult<i64> {
    let mut rows = conn
        .query(
            "SELECT \
               (SELECT COUNT(*) FROM entries WHERE family_id = ?1 AND payment_method_id = ?2) + \
               (SELECT COUNT(*) FROM recurring_rules WHERE family_id = ?1 AND payment_method_id = ?2) + \
               (SELECT COUNT(*) FROM payment_methods WHERE family_id = ?1 AND linked_bank_payment_method_id = ?2)",
            [family_id, id],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(row.get(0)?),
        None => Ok(0),
    }
}

pub async fn create_payment_method(
    conn: &Connection,
    family_id: &str,
    payload: CreatePaymentMethodPayload,
    now: OffsetDateTime,
) -> ApiResult<(StatusCode, MutationResponse<PaymentMethod>)> {
    let fields = payload.fields();
    validate_payment_method_fields(&fields)?;

    let id = payload.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let existing = find_payment_method(conn, family_id, &id).await?;
    check_new_linked_bank(
        conn,
        family_id,
        &id,
        &fields,
        existing.as_ref().map(|m| &m.fields),
    )
    .await?;

    let decision = classify(
        &fields,
        existing.as_ref().map(|m| (&m.fields, m.updated_at)),
        None,
    );

    match (decision, existing) {
        (WriteDecision::Unchanged, Some(current)) => Ok((StatusCode::OK, decision.respond(current))),
        (_, Some(current)) => {
            let updated = PaymentMethod {
                fields,
                updated_at: now,
                ..current
            };
            write_and_log(conn, &updated, false, now).await?;
            Ok((StatusCode::OK, decision.respond(updated)))
        }
        (_, None) => {
            let method = PaymentMethod {
                id,
                family_id: family_id.to_string(),
                fields,
                created_at: now,
                updated_at: now,
            };
            write_and_log(conn, &method, true, now).await?;
            tracing::info!(payment_method_id = %method.id, family_id, "payment method created");
            Ok((StatusCode::CREATED, MutationResponse::applied(method)))
        }
    }
}

pub async fn update_payment_method(
    conn: &Connection,
    family_id: &str,
    id: &str,
    payload: UpdatePaymentMethodPayload,
    now: OffsetDateTime,
) -> ApiResult<MutationResponse<PaymentMethod>> {
    let Some(current) = find_payment_method(conn, family_id, id).await? else {
        return Err(ApiError::not_found(format!("Payment method {} not found", id)));
    };

    let fields = payload.apply_to(&current.fields);
    validate_payment_method_fields(&fields)?;
    check_new_linked_bank(conn, family_id, id, &fields, Some(&current.fields)).await?;

    let decision = classify(
        &fields,
        Some((&current.fields, current.updated_at)),
        payload.base_updated_at,
    );
    if decision == WriteDecision::Unchanged {
        return Ok(decision.respond(current));
    }

    let updated = PaymentMethod {
        fields,
        updated_at: now,
        ..current
    };
    write_and_log(conn, &updated, false, now).await?;
    Ok(decision.respond(updated))
}

pub async fn delete_payment_method(
    conn: &Connection,
    family_id: &str,
    id: &str,
    now: OffsetDateTime,
) -> ApiResult<MutationResponse<DeletedRef>> {
    let deleted = DeletedRef { id: id.to_string() };
    if find_payment_method(conn, family_id, id).await?.is_none() {
        return Ok(MutationResponse::unchanged(deleted));
    }

    let in_use = usage_count(conn, family_id, id).await?;
    if in_use > 0 {
        return Err(ApiError::Conflict(format!(
            "Payment method {} is still referenced by {} row(s)",
            id, in_use
        )));
    }

    let tx = conn.transaction().await?;
    tx.execute(
        "DELETE FROM payment_methods WHERE family_id = ? AND id = ?",
        [family_id, id],
    )
    .await?;
    change_log::record_delete(&tx, family_id, EntityType::PaymentMethod, id, now).await?;
    tx.commit().await?;

    tracing::info!(payment_method_id = %id, family_id, "payment method deleted");
    Ok(MutationResponse::applied(deleted))
}

pub async fn handle_create_payment_method(
    State(db): State<Db>,
    ctx: MutationContext,
    AppJson(payload): AppJson<CreatePaymentMethodPayload>,
) -> ApiResult<Response> {
    let MutationContext { member, receipt, now } = ctx;
    receipts::execute(&db, receipt, now, async {
        let conn = db.write().await;
        let (status, response) =
            create_payment_method(&conn, &member.family_id, payload, now).await?;
        Ok::<_, ApiError>((status, serde_json::to_value(response)?))
    })
    .await
}

pub async fn handle_update_payment_method(
    State(db): State<Db>,
    AppPath(id): AppPath<String>,
    ctx: MutationContext,
    AppJson(payload): AppJson<UpdatePaymentMethodPayload>,
) -> ApiResult<Response> {
    let MutationContext { member, receipt, now } = ctx;
    receipts::execute(&db, receipt, now, async {
        let conn = db.write().await;
        let response = update_payment_method(&conn, &member.family_id, &id, payload, now).await?;
        Ok::<_, ApiError>((StatusCode::OK, serde_json::to_value(response)?))
    })
    .await
}

pub async fn handle_delete_payment_method(
    State(db): State<Db>,
    AppPath(id): AppPath<String>,
    ctx: MutationContext,
) -> ApiResult<Response> {
    let MutationContext { member, receipt, now } = ctx;
    receipts::execute(&db, receipt, now, async {
        let conn = db.write().await;
        let response = delete_payment_method(&conn, &member.family_id, &id, now).await?;
        Ok::<_, ApiError>((StatusCode::OK, serde_json::to_value(response)?))
    })
    .await
}
