//! Write preconditions, evaluated before anything is committed.
//!
//! Order matters: referential validity first (fatal), then the byte-equal no-op
//! check, then the optimistic version check, which only flags and never blocks.

use libsql::Connection;
use time::OffsetDateTime;

use crate::categories::find_category;
use crate::error::{ApiResult, FatalConflict, FatalConflictCode};
use crate::models::{
    EntityType, EntryCategory, EntryFields, MutationResponse, PaymentMethod, PaymentMethodType,
    RecurringRule, RecurringRuleFields,
};
use crate::payment_methods::find_payment_method;
use crate::recurring_rules::find_recurring_rule;

/// Outcome of comparing an incoming write with the stored row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDecision {
    /// No stored row: plain insert.
    Insert,
    /// Stored row already holds exactly these values.
    Unchanged,
    /// Values differ; `conflict` is set when the caller's base version was stale.
    Apply { conflict: bool },
}

impl WriteDecision {
    pub fn respond<T>(self, data: T) -> MutationResponse<T> {
        match self {
            WriteDecision::Unchanged => MutationResponse::unchanged(data),
            WriteDecision::Apply { conflict: true } => MutationResponse::soft_conflict(data),
            WriteDecision::Insert | WriteDecision::Apply { conflict: false } => {
                MutationResponse::applied(data)
            }
        }
    }
}

pub fn classify<F: PartialEq>(
    incoming: &F,
    current: Option<(&F, OffsetDateTime)>,
    base_updated_at: Option<OffsetDateTime>,
) -> WriteDecision {
    match current {
        None => WriteDecision::Insert,
        Some((stored, _)) if stored == incoming => WriteDecision::Unchanged,
        Some((_, updated_at)) => WriteDecision::Apply {
            conflict: base_updated_at.is_some_and(|base| base != updated_at),
        },
    }
}

/// A reference only needs re-validation when it is new or was changed.
fn changed<'a>(incoming: &'a Option<String>, stored: Option<&Option<String>>) -> Option<&'a str> {
    match (incoming, stored) {
        (Some(id), Some(Some(previous))) if id == previous => None,
        (Some(id), _) => Some(id.as_str()),
        (None, _) => None,
    }
}

pub async fn check_category(
    conn: &Connection,
    family_id: &str,
    category_id: &str,
) -> ApiResult<EntryCategory> {
    let Some(category) = find_category(conn, family_id, category_id).await? else {
        return Err(FatalConflict::new(
            FatalConflictCode::CategoryNotFound,
            EntityType::EntryCategory,
            category_id,
            format!("Category {} does not exist", category_id),
            "Pick an existing category",
        )
        .into());
    };

    if let Some(target) = &category.fields.merged_to_id {
        return Err(FatalConflict::new(
            FatalConflictCode::CategoryMerged,
            EntityType::EntryCategory,
            category_id,
            format!("Category {} was merged into {}", category_id, target),
            format!("Use category {} instead", target),
        )
        .with_snapshot(&category)
        .into());
    }

    if category.fields.is_archived {
        return Err(FatalConflict::new(
            FatalConflictCode::CategoryArchived,
            EntityType::EntryCategory,
            category_id,
            format!("Category {} is archived", category_id),
            "Pick an active category or unarchive this one first",
        )
        .with_snapshot(&category)
        .into());
    }

    Ok(category)
}

pub async fn check_payment_method(
    conn: &Connection,
    family_id: &str,
    payment_method_id: &str,
) -> ApiResult<PaymentMethod> {
    find_payment_method(conn, family_id, payment_method_id)
        .await?
        .ok_or_else(|| {
            FatalConflict::new(
                FatalConflictCode::PaymentMethodNotFound,
                EntityType::PaymentMethod,
                payment_method_id,
                format!("Payment method {} does not exist", payment_method_id),
                "Pick an existing payment method",
            )
            .into()
        })
}

pub async fn check_recurring_rule(
    conn: &Connection,
    family_id: &str,
    rule_id: &str,
) -> ApiResult<RecurringRule> {
    let Some(rule) = find_recurring_rule(conn, family_id, rule_id).await? else {
        return Err(FatalConflict::new(
            FatalConflictCode::RecurringRuleNotFound,
            EntityType::RecurringRule,
            rule_id,
            format!("Recurring rule {} does not exist", rule_id),
            "Drop the recurring rule reference",
        )
        .into());
    };

    if !rule.fields.is_active {
        return Err(FatalConflict::new(
            FatalConflictCode::RecurringRuleInactive,
            EntityType::RecurringRule,
            rule_id,
            format!("Recurring rule {} is inactive", rule_id),
            "Reactivate the rule or drop the reference",
        )
        .with_snapshot(&rule)
        .into());
    }

    Ok(rule)
}

/// A card's settlement account must be a bank method of the same family.
pub async fn check_linked_bank(
    conn: &Connection,
    family_id: &str,
    bank_id: &str,
) -> ApiResult<PaymentMethod> {
    match find_payment_method(conn, family_id, bank_id).await? {
        Some(method) if method.fields.method_type == PaymentMethodType::Bank => Ok(method),
        Some(method) => Err(FatalConflict::new(
            FatalConflictCode::LinkedBankInvalid,
            EntityType::PaymentMethod,
            bank_id,
            format!("Payment method {} is not a bank account", bank_id),
            "Link the card to a bank-type payment method",
        )
        .with_snapshot(&method)
        .into()),
        None => Err(FatalConflict::new(
            FatalConflictCode::LinkedBankInvalid,
            EntityType::PaymentMethod,
            bank_id,
            format!("Linked bank {} does not exist", bank_id),
            "Link the card to an existing bank-type payment method",
        )
        .into()),
    }
}

/// Validates the references of an entry write. On update (`stored` is set) only
/// references that changed are checked; existing ones are not re-judged.
pub async fn check_entry_references(
    conn: &Connection,
    family_id: &str,
    fields: &EntryFields,
    stored: Option<&EntryFields>,
) -> ApiResult<()> {
    if let Some(id) = changed(
        &fields.entry_category_id,
        stored.map(|s| &s.entry_category_id),
    ) {
        check_category(conn, family_id, id).await?;
    }
    if let Some(id) = changed(
        &fields.payment_method_id,
        stored.map(|s| &s.payment_method_id),
    ) {
        check_payment_method(conn, family_id, id).await?;
    }
    if let Some(id) = changed(
        &fields.recurring_rule_id,
        stored.map(|s| &s.recurring_rule_id),
    ) {
        check_recurring_rule(conn, family_id, id).await?;
    }
    Ok(())
}

pub async fn check_rule_references(
    conn: &Connection,
    family_id: &str,
    fields: &RecurringRuleFields,
    stored: Option<&RecurringRuleFields>,
) -> ApiResult<()> {
    if let Some(id) = changed(
        &fields.entry_category_id,
        stored.map(|s| &s.entry_category_id),
    ) {
        check_category(conn, family_id, id).await?;
    }
    if let Some(id) = changed(
        &fields.payment_method_id,
        stored.map(|s| &s.payment_method_id),
    ) {
        check_payment_method(conn, family_id, id).await?;
    }
    Ok(())
}
