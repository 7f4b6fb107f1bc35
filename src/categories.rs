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
use crate::conflicts::{WriteDecision, classify};
use crate::constants::MAX_CATEGORY_NAME_LENGTH;
use crate::database::{Db, bool_from_db, bool_to_db, enum_from_db, enum_to_db};
use crate::entries::{entries_in_category, update_entry_row};
use crate::error::{ApiError, ApiResult, FatalConflict, FatalConflictCode};
use crate::extract::{AppJson, AppPath};
use crate::models::{
    CategoryFields, CreateCategoryPayload, EntityType, EntryCategory, MutationResponse,
    UpdateCategoryPayload,
};
use crate::receipts::{self, MutationContext};
use crate::recurring_rules::{rules_in_category, update_rule_row};
use crate::utils::validate_string_length;

const CATEGORY_COLUMNS: &str = "id, family_id, name, type, color, icon, is_archived, \
     merged_to_id, sort_order, created_at, updated_at";

pub fn validate_category_name(name: &str) -> ApiResult<()> {
    validate_string_length(name, "Category name", MAX_CATEGORY_NAME_LENGTH)
}

pub fn extract_category_from_row(row: &libsql::Row) -> ApiResult<EntryCategory> {
    let category_type: String = row.get(3)?;
    let is_archived: i64 = row.get(6)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;

    Ok(EntryCategory {
        id: row.get(0)?,
        family_id: row.get(1)?,
        fields: CategoryFields {
            name: row.get(2)?,
            category_type: enum_from_db(&category_type)?,
            color: row.get(4)?,
            icon: row.get(5)?,
            is_archived: bool_from_db(is_archived),
            merged_to_id: row.get(7)?,
            sort_order: row.get(8)?,
        },
        created_at: parse_instant(&created_at)?,
        updated_at: parse_instant(&updated_at)?,
    })
}

pub async fn find_category(
    conn: &Connection,
    family_id: &str,
    id: &str,
) -> ApiResult<Option<EntryCategory>> {
    let sql = format!(
        "SELECT {} FROM entry_categories WHERE family_id = ? AND id = ?",
        CATEGORY_COLUMNS
    );
    let mut rows = conn.query(&sql, [family_id, id]).await?;
    match rows.next().await? {
        Some(row) => Ok(Some(extract_category_from_row(&row)?)),
        None => Ok(None),
    }
}

pub async fn list_categories(conn: &Connection, family_id: &str) -> ApiResult<Vec<EntryCategory>> {
    let sql = format!(
        "SELECT {} FROM entry_categories WHERE family_id = ? ORDER BY sort_order ASC, name ASC",
        CATEGORY_COLUMNS
    );
    let mut rows = conn.query(&sql, [family_id]).await?;
    let mut categories = Vec::new();
    while let Some(row) = rows.next().await? {
        categories.push(extract_category_from_row(&row)?);
    }
    Ok(categories)
}

/// Names are unique per family (case-insensitive) among categories that are
/// not forwarding pointers.
async fn ensure_name_available(
    conn: &Connection,
    family_id: &str,
    name: &str,
    own_id: &str,
) -> ApiResult<()> {
    let mut rows = conn
        .query(
            "SELECT id FROM entry_categories \
             WHERE family_id = ? AND LOWER(name) = LOWER(?) AND merged_to_id IS NULL AND id != ?",
            [family_id, name, own_id],
        )
        .await?;
    if rows.next().await?.is_some() {
        return Err(ApiError::Conflict(
            "Category name already exists (case-insensitive)".to_string(),
        ));
    }
    Ok(())
}

async fn check_merge_target(
    conn: &Connection,
    family_id: &str,
    category_id: &str,
    target_id: &str,
) -> ApiResult<()> {
    let invalid = |message: String, hint: &str| {
        FatalConflict::new(
            FatalConflictCode::MergeTargetInvalid,
            EntityType::EntryCategory,
            target_id,
            message,
            hint,
        )
    };

    if target_id == category_id {
        return Err(invalid(
            "A category cannot be merged into itself".to_string(),
            "Choose a different target category",
        )
        .into());
    }
    let Some(target) = find_category(conn, family_id, target_id).await? else {
        return Err(invalid(
            format!("Merge target {} does not exist", target_id),
            "Choose an existing category",
        )
        .into());
    };
    if !target.is_assignable() {
        return Err(invalid(
            format!("Merge target {} is archived or merged", target_id),
            "Choose an active category as the merge target",
        )
        .with_snapshot(&target)
        .into());
    }
    Ok(())
}

async fn insert_category_row(conn: &Connection, category: &EntryCategory) -> ApiResult<()> {
    let fields = &category.fields;
    conn.execute(
        "INSERT INTO entry_categories (id, family_id, name, type, color, icon, is_archived, \
         merged_to_id, sort_order, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        libsql::params![
            category.id.as_str(),
            category.family_id.as_str(),
            fields.name.as_str(),
            enum_to_db(&fields.category_type)?,
            fields.color.as_deref(),
            fields.icon.as_deref(),
            bool_to_db(fields.is_archived),
            fields.merged_to_id.as_deref(),
            fields.sort_order,
            format_instant(category.created_at)?,
            format_instant(category.updated_at)?,
        ],
    )
    .await?;
    Ok(())
}

async fn update_category_row(conn: &Connection, category: &EntryCategory) -> ApiResult<()> {
    let fields = &category.fields;
    conn.execute(
        "UPDATE entry_categories SET name = ?, type = ?, color = ?, icon = ?, is_archived = ?, \
         merged_to_id = ?, sort_order = ?, updated_at = ? WHERE family_id = ? AND id = ?",
        libsql::params![
            fields.name.as_str(),
            enum_to_db(&fields.category_type)?,
            fields.color.as_deref(),
            fields.icon.as_deref(),
            bool_to_db(fields.is_archived),
            fields.merged_to_id.as_deref(),
            fields.sort_order,
            format_instant(category.updated_at)?,
            category.family_id.as_str(),
            category.id.as_str(),
        ],
    )
    .await?;
    Ok(())
}

/// Re-points entries and recurring rules from a merged category to its target,
/// logging every row it touches.
async fn forward_references(
    conn: &Connection,
    family_id: &str,
    from_id: &str,
    to_id: &str,
    now: OffsetDateTime,
) -> ApiResult<usize> {
    let entries = entries_in_category(conn, family_id, from_id).await?;
    for mut entry in entries.iter().cloned() {
        entry.fields.entry_category_id = Some(to_id.to_string());
        entry.updated_at = now;
        update_entry_row(conn, &entry).await?;
        change_log::record_upsert(conn, family_id, EntityType::Entry, &entry.id, &entry, now)
            .await?;
    }

    let rules = rules_in_category(conn, family_id, from_id).await?;
    for mut rule in rules.iter().cloned() {
        rule.fields.entry_category_id = Some(to_id.to_string());
        rule.updated_at = now;
        update_rule_row(conn, &rule).await?;
        change_log::record_upsert(conn, family_id, EntityType::RecurringRule, &rule.id, &rule, now)
            .await?;
    }

    Ok(entries.len() + rules.len())
}

pub async fn create_category(
    conn: &Connection,
    family_id: &str,
    payload: CreateCategoryPayload,
    now: OffsetDateTime,
) -> ApiResult<(StatusCode, MutationResponse<EntryCategory>)> {
    validate_category_name(&payload.name)?;
    let fields = CategoryFields {
        name: payload.name.trim().to_string(),
        category_type: payload.category_type,
        color: payload.color,
        icon: payload.icon,
        is_archived: false,
        merged_to_id: None,
        sort_order: payload.sort_order,
    };
    let id = payload.id.unwrap_or_else(|| Uuid::new_v4().to_string());

    let existing = find_category(conn, family_id, &id).await?;
    let decision = classify(
        &fields,
        existing.as_ref().map(|c| (&c.fields, c.updated_at)),
        None,
    );

    match (decision, existing) {
        (WriteDecision::Unchanged, Some(current)) => Ok((StatusCode::OK, decision.respond(current))),
        (_, Some(current)) => {
            let response = update_category(
                conn,
                family_id,
                &current.id,
                UpdateCategoryPayload {
                    name: Some(fields.name),
                    category_type: Some(fields.category_type),
                    color: Some(fields.color),
                    icon: Some(fields.icon),
                    sort_order: Some(fields.sort_order),
                    ..UpdateCategoryPayload::default()
                },
                now,
            )
            .await?;
            Ok((StatusCode::OK, response))
        }
        (_, None) => {
            ensure_name_available(conn, family_id, &fields.name, &id).await?;
            let category = EntryCategory {
                id,
                family_id: family_id.to_string(),
                fields,
                created_at: now,
                updated_at: now,
            };

            let tx = conn.transaction().await?;
            insert_category_row(&tx, &category).await?;
            change_log::record_upsert(
                &tx,
                family_id,
                EntityType::EntryCategory,
                &category.id,
                &category,
                now,
            )
            .await?;
            tx.commit().await?;

            tracing::info!(category_id = %category.id, family_id, "category created");
            Ok((StatusCode::CREATED, MutationResponse::applied(category)))
        }
    }
}

pub async fn update_category(
    conn: &Connection,
    family_id: &str,
    id: &str,
    payload: UpdateCategoryPayload,
    now: OffsetDateTime,
) -> ApiResult<MutationResponse<EntryCategory>> {
    let Some(current) = find_category(conn, family_id, id).await? else {
        return Err(ApiError::not_found(format!("Category {} not found", id)));
    };

    let fields = payload.apply_to(&current.fields);
    validate_category_name(&fields.name)?;

    let newly_merged = match (&fields.merged_to_id, &current.fields.merged_to_id) {
        (Some(target), previous) if previous.as_ref() != Some(target) => {
            check_merge_target(conn, family_id, id, target).await?;
            Some(target.clone())
        }
        _ => None,
    };

    let decision = classify(
        &fields,
        Some((&current.fields, current.updated_at)),
        payload.base_updated_at,
    );
    if decision == WriteDecision::Unchanged {
        return Ok(decision.respond(current));
    }

    if fields.merged_to_id.is_none() && fields.name != current.fields.name {
        ensure_name_available(conn, family_id, &fields.name, id).await?;
    }

    let updated = EntryCategory {
        fields,
        updated_at: now,
        ..current
    };

    let tx = conn.transaction().await?;
    update_category_row(&tx, &updated).await?;
    change_log::record_upsert(
        &tx,
        family_id,
        EntityType::EntryCategory,
        &updated.id,
        &updated,
        now,
    )
    .await?;
    if let Some(target) = &newly_merged {
        let moved = forward_references(&tx, family_id, id, target, now).await?;
        tracing::info!(category_id = %id, target = %target, moved, "category merged");
    }
    tx.commit().await?;

    Ok(decision.respond(updated))
}

pub async fn handle_create_category(
    State(db): State<Db>,
    ctx: MutationContext,
    AppJson(payload): AppJson<CreateCategoryPayload>,
) -> ApiResult<Response> {
    let MutationContext { member, receipt, now } = ctx;
    receipts::execute(&db, receipt, now, async {
        let conn = db.write().await;
        let (status, response) = create_category(&conn, &member.family_id, payload, now).await?;
        Ok::<_, ApiError>((status, serde_json::to_value(response)?))
    })
    .await
}

pub async fn handle_update_category(
    State(db): State<Db>,
    AppPath(id): AppPath<String>,
    ctx: MutationContext,
    AppJson(payload): AppJson<UpdateCategoryPayload>,
) -> ApiResult<Response> {
    let MutationContext { member, receipt, now } = ctx;
    receipts::execute(&db, receipt, now, async {
        let conn = db.write().await;
        let response = update_category(&conn, &member.family_id, &id, payload, now).await?;
        Ok::<_, ApiError>((StatusCode::OK, serde_json::to_value(response)?))
    })
    .await
}
