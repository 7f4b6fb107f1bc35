use serde::{Deserialize, Deserializer, Serialize};
use time::{Date, OffsetDateTime};

use crate::calendar::{YearMonth, iso_date, to_utc};

/// Deserializes a present field (including an explicit `null`) as `Some`, so that
/// partial updates can tell "clear this reference" apart from "leave it alone".
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Income,
    Expense,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethodType {
    Cash,
    Bank,
    Emoney,
    Card,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Weekly,
    Monthly,
    Bimonthly,
    Yearly,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum HolidayAdjustment {
    #[default]
    None,
    Previous,
    Next,
}

/// Entity kinds recorded in the change log.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Entry,
    EntryCategory,
    PaymentMethod,
    RecurringRule,
    MonthlyBalance,
    MutationReceipt,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Upsert,
    Delete,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictClass {
    Soft,
}

// ---------------------------------------------------------------------------
// Members
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Member {
    pub id: String,
    pub family_id: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PublicMember {
    pub id: String,
    pub family_id: String,
    pub username: String,
}

#[derive(Deserialize, Debug)]
pub struct RegisterPayload {
    pub username: String,
    pub password: String,
}

#[derive(Deserialize, Debug)]
pub struct LoginPayload {
    pub username: String,
    pub password: String,
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// Client-controlled entry attributes. Two entries with equal fields are the
/// same write.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EntryFields {
    pub entry_type: EntryType,
    pub amount: i64,
    pub entry_category_id: Option<String>,
    pub payment_method_id: Option<String>,
    pub memo: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
    pub recurring_rule_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Entry {
    pub id: String,
    pub family_id: String,
    #[serde(flatten)]
    pub fields: EntryFields,
    #[serde(with = "iso_date")]
    pub occurred_on: Date,
    pub created_by_member_id: String,
    pub created_by_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Entry {
    pub fn ym(&self) -> YearMonth {
        YearMonth::from_date(self.occurred_on)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct CreateEntryPayload {
    pub id: Option<String>,
    pub entry_type: EntryType,
    pub amount: i64,
    pub entry_category_id: Option<String>,
    pub payment_method_id: Option<String>,
    pub memo: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
    pub recurring_rule_id: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub base_updated_at: Option<OffsetDateTime>,
}

impl CreateEntryPayload {
    pub fn fields(&self) -> EntryFields {
        EntryFields {
            entry_type: self.entry_type,
            amount: self.amount,
            entry_category_id: self.entry_category_id.clone(),
            payment_method_id: self.payment_method_id.clone(),
            memo: self.memo.clone(),
            occurred_at: to_utc(self.occurred_at),
            recurring_rule_id: self.recurring_rule_id.clone(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct UpdateEntryPayload {
    pub entry_type: Option<EntryType>,
    pub amount: Option<i64>,
    #[serde(default, deserialize_with = "double_option")]
    pub entry_category_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub payment_method_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub memo: Option<Option<String>>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub occurred_at: Option<OffsetDateTime>,
    #[serde(default, deserialize_with = "double_option")]
    pub recurring_rule_id: Option<Option<String>>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub base_updated_at: Option<OffsetDateTime>,
}

impl UpdateEntryPayload {
    pub fn apply_to(&self, current: &EntryFields) -> EntryFields {
        EntryFields {
            entry_type: self.entry_type.unwrap_or(current.entry_type),
            amount: self.amount.unwrap_or(current.amount),
            entry_category_id: merge_nullable(&self.entry_category_id, &current.entry_category_id),
            payment_method_id: merge_nullable(&self.payment_method_id, &current.payment_method_id),
            memo: merge_nullable(&self.memo, &current.memo),
            occurred_at: self.occurred_at.map(to_utc).unwrap_or(current.occurred_at),
            recurring_rule_id: merge_nullable(&self.recurring_rule_id, &current.recurring_rule_id),
        }
    }
}

fn merge_nullable<T: Clone>(patch: &Option<Option<T>>, current: &Option<T>) -> Option<T> {
    match patch {
        Some(value) => value.clone(),
        None => current.clone(),
    }
}

// ---------------------------------------------------------------------------
// Entry categories
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CategoryFields {
    pub name: String,
    #[serde(rename = "type")]
    pub category_type: EntryType,
    pub color: Option<String>,
    pub icon: Option<String>,
    pub is_archived: bool,
    pub merged_to_id: Option<String>,
    pub sort_order: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EntryCategory {
    pub id: String,
    pub family_id: String,
    #[serde(flatten)]
    pub fields: CategoryFields,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl EntryCategory {
    /// Whether entries may reference this category right now.
    pub fn is_assignable(&self) -> bool {
        !self.fields.is_archived && self.fields.merged_to_id.is_none()
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct CreateCategoryPayload {
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub category_type: EntryType,
    pub color: Option<String>,
    pub icon: Option<String>,
    #[serde(default)]
    pub sort_order: i64,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct UpdateCategoryPayload {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub category_type: Option<EntryType>,
    #[serde(default, deserialize_with = "double_option")]
    pub color: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub icon: Option<Option<String>>,
    pub is_archived: Option<bool>,
    #[serde(default, deserialize_with = "double_option")]
    pub merged_to_id: Option<Option<String>>,
    pub sort_order: Option<i64>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub base_updated_at: Option<OffsetDateTime>,
}

impl UpdateCategoryPayload {
    pub fn apply_to(&self, current: &CategoryFields) -> CategoryFields {
        CategoryFields {
            name: self
                .name
                .as_ref()
                .map(|name| name.trim().to_string())
                .unwrap_or_else(|| current.name.clone()),
            category_type: self.category_type.unwrap_or(current.category_type),
            color: merge_nullable(&self.color, &current.color),
            icon: merge_nullable(&self.icon, &current.icon),
            is_archived: self.is_archived.unwrap_or(current.is_archived),
            merged_to_id: merge_nullable(&self.merged_to_id, &current.merged_to_id),
            sort_order: self.sort_order.unwrap_or(current.sort_order),
        }
    }
}

// ---------------------------------------------------------------------------
// Payment methods
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PaymentMethodFields {
    pub name: String,
    #[serde(rename = "type")]
    pub method_type: PaymentMethodType,
    pub card_closing_day: Option<i64>,
    pub card_payment_day: Option<i64>,
    pub linked_bank_payment_method_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PaymentMethod {
    pub id: String,
    pub family_id: String,
    #[serde(flatten)]
    pub fields: PaymentMethodFields,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Deserialize, Debug, Clone)]
pub struct CreatePaymentMethodPayload {
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub method_type: PaymentMethodType,
    pub card_closing_day: Option<i64>,
    pub card_payment_day: Option<i64>,
    pub linked_bank_payment_method_id: Option<String>,
}

impl CreatePaymentMethodPayload {
    pub fn fields(&self) -> PaymentMethodFields {
        PaymentMethodFields {
            name: self.name.trim().to_string(),
            method_type: self.method_type,
            card_closing_day: self.card_closing_day,
            card_payment_day: self.card_payment_day,
            linked_bank_payment_method_id: self.linked_bank_payment_method_id.clone(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct UpdatePaymentMethodPayload {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub method_type: Option<PaymentMethodType>,
    #[serde(default, deserialize_with = "double_option")]
    pub card_closing_day: Option<Option<i64>>,
    #[serde(default, deserialize_with = "double_option")]
    pub card_payment_day: Option<Option<i64>>,
    #[serde(default, deserialize_with = "double_option")]
    pub linked_bank_payment_method_id: Option<Option<String>>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub base_updated_at: Option<OffsetDateTime>,
}

impl UpdatePaymentMethodPayload {
    pub fn apply_to(&self, current: &PaymentMethodFields) -> PaymentMethodFields {
        PaymentMethodFields {
            name: self
                .name
                .as_ref()
                .map(|name| name.trim().to_string())
                .unwrap_or_else(|| current.name.clone()),
            method_type: self.method_type.unwrap_or(current.method_type),
            card_closing_day: merge_nullable(&self.card_closing_day, &current.card_closing_day),
            card_payment_day: merge_nullable(&self.card_payment_day, &current.card_payment_day),
            linked_bank_payment_method_id: merge_nullable(
                &self.linked_bank_payment_method_id,
                &current.linked_bank_payment_method_id,
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Recurring rules
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RecurringRuleFields {
    pub entry_type: EntryType,
    pub amount: i64,
    pub entry_category_id: Option<String>,
    pub payment_method_id: Option<String>,
    pub memo: Option<String>,
    pub frequency: Frequency,
    /// Weekday index 0-6 (Sunday = 0) for weekly rules, day of month otherwise.
    pub day_of_month: Option<i64>,
    pub holiday_adjustment: HolidayAdjustment,
    #[serde(with = "time::serde::rfc3339")]
    pub start_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end_at: Option<OffsetDateTime>,
    pub is_active: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RecurringRule {
    pub id: String,
    pub family_id: String,
    #[serde(flatten)]
    pub fields: RecurringRuleFields,
    pub created_by_member_id: String,
    pub created_by_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Deserialize, Debug, Clone)]
pub struct CreateRecurringRulePayload {
    pub id: Option<String>,
    pub entry_type: EntryType,
    pub amount: i64,
    pub entry_category_id: Option<String>,
    pub payment_method_id: Option<String>,
    pub memo: Option<String>,
    pub frequency: Frequency,
    pub day_of_month: Option<i64>,
    #[serde(default)]
    pub holiday_adjustment: HolidayAdjustment,
    #[serde(with = "time::serde::rfc3339")]
    pub start_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end_at: Option<OffsetDateTime>,
    pub is_active: Option<bool>,
}

impl CreateRecurringRulePayload {
    pub fn fields(&self) -> RecurringRuleFields {
        RecurringRuleFields {
            entry_type: self.entry_type,
            amount: self.amount,
            entry_category_id: self.entry_category_id.clone(),
            payment_method_id: self.payment_method_id.clone(),
            memo: self.memo.clone(),
            frequency: self.frequency,
            day_of_month: self.day_of_month,
            holiday_adjustment: self.holiday_adjustment,
            start_at: to_utc(self.start_at),
            end_at: self.end_at.map(to_utc),
            is_active: self.is_active.unwrap_or(true),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct UpdateRecurringRulePayload {
    pub entry_type: Option<EntryType>,
    pub amount: Option<i64>,
    #[serde(default, deserialize_with = "double_option")]
    pub entry_category_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub payment_method_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub memo: Option<Option<String>>,
    pub frequency: Option<Frequency>,
    #[serde(default, deserialize_with = "double_option")]
    pub day_of_month: Option<Option<i64>>,
    pub holiday_adjustment: Option<HolidayAdjustment>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub start_at: Option<OffsetDateTime>,
    #[serde(default, deserialize_with = "double_option_instant")]
    pub end_at: Option<Option<OffsetDateTime>>,
    pub is_active: Option<bool>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub base_updated_at: Option<OffsetDateTime>,
}

fn double_option_instant<'de, D>(deserializer: D) -> Result<Option<Option<OffsetDateTime>>, D::Error>
where
    D: Deserializer<'de>,
{
    time::serde::rfc3339::option::deserialize(deserializer).map(Some)
}

impl UpdateRecurringRulePayload {
    pub fn apply_to(&self, current: &RecurringRuleFields) -> RecurringRuleFields {
        RecurringRuleFields {
            entry_type: self.entry_type.unwrap_or(current.entry_type),
            amount: self.amount.unwrap_or(current.amount),
            entry_category_id: merge_nullable(&self.entry_category_id, &current.entry_category_id),
            payment_method_id: merge_nullable(&self.payment_method_id, &current.payment_method_id),
            memo: merge_nullable(&self.memo, &current.memo),
            frequency: self.frequency.unwrap_or(current.frequency),
            day_of_month: merge_nullable(&self.day_of_month, &current.day_of_month),
            holiday_adjustment: self.holiday_adjustment.unwrap_or(current.holiday_adjustment),
            start_at: self.start_at.map(to_utc).unwrap_or(current.start_at),
            end_at: merge_nullable(&self.end_at, &current.end_at).map(to_utc),
            is_active: self.is_active.unwrap_or(current.is_active),
        }
    }
}

// ---------------------------------------------------------------------------
// Monthly balances
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MonthlyBalance {
    pub family_id: String,
    pub ym: YearMonth,
    pub balance: i64,
    pub is_closed: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Deserialize, Debug)]
pub struct MonthlyBalanceQuery {
    pub ym: String,
}

#[derive(Deserialize, Debug)]
pub struct MonthlyBalanceRangeQuery {
    pub from: String,
    pub to: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct PutMonthlyBalancePayload {
    pub balance: i64,
    pub is_closed: Option<bool>,
}

// ---------------------------------------------------------------------------
// Change feed
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChangeLogEntry {
    pub id: i64,
    pub family_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub action: ChangeAction,
    pub payload: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Deserialize, Debug, Default)]
pub struct SyncQuery {
    pub cursor: Option<i64>,
    pub limit: Option<u32>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SyncPage {
    pub changes: Vec<ChangeLogEntry>,
    pub next_cursor: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub server_time: OffsetDateTime,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BootstrapSnapshot {
    pub entries: Vec<Entry>,
    pub entry_categories: Vec<EntryCategory>,
    pub payment_methods: Vec<PaymentMethod>,
    pub recurring_rules: Vec<RecurringRule>,
    pub monthly_balances: Vec<MonthlyBalance>,
    pub next_cursor: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub server_time: OffsetDateTime,
}

// ---------------------------------------------------------------------------
// Mutation results
// ---------------------------------------------------------------------------

/// Body of every successful create/update/delete.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MutationResponse<T> {
    pub data: T,
    pub idempotent: bool,
    pub conflict: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_class: Option<ConflictClass>,
}

impl<T> MutationResponse<T> {
    pub fn applied(data: T) -> Self {
        Self {
            data,
            idempotent: false,
            conflict: false,
            conflict_class: None,
        }
    }

    pub fn unchanged(data: T) -> Self {
        Self {
            data,
            idempotent: true,
            conflict: false,
            conflict_class: None,
        }
    }

    pub fn soft_conflict(data: T) -> Self {
        Self {
            data,
            idempotent: false,
            conflict: true,
            conflict_class: Some(ConflictClass::Soft),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DeletedRef {
    pub id: String,
}

#[derive(Deserialize, Debug, Default)]
pub struct TickPayload {
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub at: Option<OffsetDateTime>,
}
