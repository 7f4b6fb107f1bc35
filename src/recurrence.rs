//! Materializes recurring rules into ledger entries for one calendar date.
//!
//! A rule fires on `target` when one of its base dates, after holiday
//! adjustment, lands on `target`. Base dates are looked up in the neighbouring
//! months too, since a weekend shift can move the 1st back into the previous
//! month or the 31st forward into the next one.

use std::collections::BTreeMap;

use libsql::Connection;
use serde::Serialize;
use time::{Date, Duration, OffsetDateTime};
use uuid::Uuid;

use crate::balances::recalculate;
use crate::calendar::{
    YearMonth, days_in_month, format_date, local_date, local_midnight, shift_for_holiday,
};
use crate::categories::find_category;
use crate::change_log;
use crate::entries::{build_entry, insert_entry_if_absent};
use crate::error::ApiResult;
use crate::models::{
    EntityType, EntryFields, Frequency, PublicMember, RecurringRule, RecurringRuleFields,
};
use crate::payment_methods::find_payment_method;
use crate::recurring_rules::list_active_rules;

/// Namespace for occurrence ids; `(rule id, date)` always maps to the same entry id.
const OCCURRENCE_NAMESPACE: Uuid = Uuid::from_u128(0x6c65_6467_6572_4f63_6375_7272_656e_6365);

/// Merge chains longer than this are treated as broken.
const MAX_MERGE_HOPS: usize = 8;

#[derive(Serialize, Debug, Default, Clone, PartialEq)]
pub struct GenerationReport {
    pub rules_checked: usize,
    pub created: usize,
    pub already_present: usize,
    /// Earliest month that received a new occurrence, per family.
    pub earliest_month: BTreeMap<String, YearMonth>,
}

impl GenerationReport {
    fn record(&mut self, family_id: &str, ym: YearMonth) {
        self.created += 1;
        self.earliest_month
            .entry(family_id.to_string())
            .and_modify(|earliest| *earliest = (*earliest).min(ym))
            .or_insert(ym);
    }
}

pub fn occurrence_id(rule_id: &str, date: Date) -> String {
    let name = format!("{}:{}", rule_id, format_date(date));
    Uuid::new_v5(&OCCURRENCE_NAMESPACE, name.as_bytes()).to_string()
}

/// Weekday index with Sunday = 0.
fn weekday_index(date: Date) -> i64 {
    i64::from(date.weekday().number_days_from_sunday())
}

fn monthly_base(fields: &RecurringRuleFields, start: Date, ym: YearMonth) -> Option<Date> {
    let offset = ym.months_since(YearMonth::from_date(start));
    if offset < 0 {
        return None;
    }
    let due_month = match fields.frequency {
        Frequency::Monthly => true,
        Frequency::Bimonthly => offset % 2 == 0,
        Frequency::Yearly => ym.month() == start.month(),
        Frequency::Weekly => false,
    };
    if !due_month {
        return None;
    }

    let configured = fields.day_of_month.unwrap_or(i64::from(start.day()));
    let last = i64::from(days_in_month(ym.year(), ym.month()));
    let day = u8::try_from(configured.clamp(1, last)).ok()?;
    Date::from_calendar_date(ym.year(), ym.month(), day).ok()
}

/// Unadjusted dates of the rule that could shift onto `target`.
fn candidate_bases(fields: &RecurringRuleFields, start: Date, target: Date) -> Vec<Date> {
    match fields.frequency {
        Frequency::Weekly => {
            let weekday = fields.day_of_month.unwrap_or_else(|| weekday_index(start));
            (-2..=2)
                .map(|days| target + Duration::days(days))
                .filter(|date| weekday_index(*date) == weekday)
                .collect()
        }
        _ => {
            let ym = YearMonth::from_date(target);
            [ym.prev(), ym, ym.next()]
                .into_iter()
                .filter_map(|month| monthly_base(fields, start, month))
                .collect()
        }
    }
}

/// Whether the rule materializes an occurrence dated `target`.
pub fn fires_on(fields: &RecurringRuleFields, target: Date) -> bool {
    if !fields.is_active {
        return false;
    }
    let start = local_date(fields.start_at);
    if target < start {
        return false;
    }
    if let Some(end_at) = fields.end_at {
        if target > local_date(end_at) {
            return false;
        }
    }

    candidate_bases(fields, start, target)
        .into_iter()
        .any(|base| shift_for_holiday(base, fields.holiday_adjustment) == target)
}

/// Follows merge pointers to a live category. Archived, missing or looping
/// categories resolve to `None`.
async fn resolve_category(
    conn: &Connection,
    family_id: &str,
    category_id: &str,
) -> ApiResult<Option<String>> {
    let mut current = category_id.to_string();
    for _ in 0..MAX_MERGE_HOPS {
        let Some(category) = find_category(conn, family_id, &current).await? else {
            return Ok(None);
        };
        match category.fields.merged_to_id {
            Some(target) => current = target,
            None if category.fields.is_archived => return Ok(None),
            None => return Ok(Some(current)),
        }
    }
    Ok(None)
}

/// Builds the fields of the occurrence, re-pointing or dropping references
/// that went stale since the rule was written.
async fn occurrence_fields(
    conn: &Connection,
    rule: &RecurringRule,
    target: Date,
) -> ApiResult<EntryFields> {
    let fields = &rule.fields;

    let entry_category_id = match &fields.entry_category_id {
        Some(id) => {
            let resolved = resolve_category(conn, &rule.family_id, id).await?;
            if resolved.is_none() {
                tracing::warn!(
                    rule_id = %rule.id,
                    category_id = %id,
                    "rule category is archived or missing, generating without category"
                );
            }
            resolved
        }
        None => None,
    };

    let payment_method_id = match &fields.payment_method_id {
        Some(id) => match find_payment_method(conn, &rule.family_id, id).await? {
            Some(_) => Some(id.clone()),
            None => {
                tracing::warn!(
                    rule_id = %rule.id,
                    payment_method_id = %id,
                    "rule payment method is missing, generating without it"
                );
                None
            }
        },
        None => None,
    };

    Ok(EntryFields {
        entry_type: fields.entry_type,
        amount: fields.amount,
        entry_category_id,
        payment_method_id,
        memo: fields.memo.clone(),
        occurred_at: local_midnight(target),
        recurring_rule_id: Some(rule.id.clone()),
    })
}

/// Inserts every due occurrence for `target`. Existing occurrences are left
/// alone, so running twice for one date is harmless. Balances are not touched.
pub async fn generate_occurrences(
    conn: &Connection,
    target: Date,
    now: OffsetDateTime,
) -> ApiResult<GenerationReport> {
    let rules = list_active_rules(conn).await?;
    let mut report = GenerationReport {
        rules_checked: rules.len(),
        ..GenerationReport::default()
    };

    for rule in rules.iter().filter(|rule| fires_on(&rule.fields, target)) {
        let creator = PublicMember {
            id: rule.created_by_member_id.clone(),
            family_id: rule.family_id.clone(),
            username: rule.created_by_name.clone(),
        };
        let fields = occurrence_fields(conn, rule, target).await?;
        let entry = build_entry(
            occurrence_id(&rule.id, target),
            &rule.family_id,
            fields,
            &creator,
            now,
        );

        let tx = conn.transaction().await?;
        if insert_entry_if_absent(&tx, &entry).await? {
            change_log::record_upsert(
                &tx,
                &entry.family_id,
                EntityType::Entry,
                &entry.id,
                &entry,
                now,
            )
            .await?;
            tx.commit().await?;
            report.record(&entry.family_id, entry.ym());
            tracing::debug!(rule_id = %rule.id, entry_id = %entry.id, date = %target, "occurrence generated");
        } else {
            tx.rollback().await?;
            report.already_present += 1;
        }
    }

    if report.created > 0 {
        tracing::info!(
            date = %target,
            created = report.created,
            families = report.earliest_month.len(),
            "recurring occurrences generated"
        );
    }
    Ok(report)
}

/// Generation followed by balance recomputation of every affected family.
pub async fn run_recurring_generation(
    conn: &Connection,
    target: Date,
    now: OffsetDateTime,
) -> ApiResult<GenerationReport> {
    let report = generate_occurrences(conn, target, now).await?;
    for (family_id, start) in &report.earliest_month {
        recalculate(conn, family_id, *start, now).await?;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntryType, HolidayAdjustment};
    use time::macros::{date, datetime};

    fn rule(frequency: Frequency, day: Option<i64>, policy: HolidayAdjustment) -> RecurringRuleFields {
        RecurringRuleFields {
            entry_type: EntryType::Expense,
            amount: 1000,
            entry_category_id: None,
            payment_method_id: None,
            memo: None,
            frequency,
            day_of_month: day,
            holiday_adjustment: policy,
            start_at: datetime!(2024-01-01 00:00 +9),
            end_at: None,
            is_active: true,
        }
    }

    #[test]
    fn monthly_day_31_falls_back_to_month_end() {
        let fields = rule(Frequency::Monthly, Some(31), HolidayAdjustment::None);
        assert!(fires_on(&fields, date!(2024-02-29)));
        assert!(!fires_on(&fields, date!(2024-02-28)));
        assert!(fires_on(&fields, date!(2025-02-28)));
        assert!(fires_on(&fields, date!(2024-01-31)));
        assert!(fires_on(&fields, date!(2024-04-30)));
    }

    #[test]
    fn weekend_shift_previous_and_next() {
        // 2024-06-15 is a Saturday.
        let previous = rule(Frequency::Monthly, Some(15), HolidayAdjustment::Previous);
        assert!(fires_on(&previous, date!(2024-06-14)));
        assert!(!fires_on(&previous, date!(2024-06-15)));

        let next = rule(Frequency::Monthly, Some(15), HolidayAdjustment::Next);
        assert!(fires_on(&next, date!(2024-06-17)));
        assert!(!fires_on(&next, date!(2024-06-15)));
    }

    #[test]
    fn shift_can_cross_into_previous_month() {
        // 2024-09-01 is a Sunday; "previous" moves it to Friday 2024-08-30.
        let fields = rule(Frequency::Monthly, Some(1), HolidayAdjustment::Previous);
        assert!(fires_on(&fields, date!(2024-08-30)));
        assert!(!fires_on(&fields, date!(2024-09-01)));
    }

    #[test]
    fn bimonthly_and_yearly_follow_start_month() {
        let bimonthly = rule(Frequency::Bimonthly, Some(10), HolidayAdjustment::None);
        assert!(fires_on(&bimonthly, date!(2024-03-10)));
        assert!(!fires_on(&bimonthly, date!(2024-04-10)));

        let yearly = rule(Frequency::Yearly, Some(10), HolidayAdjustment::None);
        assert!(fires_on(&yearly, date!(2025-01-10)));
        assert!(!fires_on(&yearly, date!(2025-02-10)));
    }

    #[test]
    fn weekly_defaults_to_start_weekday() {
        // 2024-01-01 is a Monday.
        let fields = rule(Frequency::Weekly, None, HolidayAdjustment::None);
        assert!(fires_on(&fields, date!(2024-01-08)));
        assert!(!fires_on(&fields, date!(2024-01-09)));
    }

    #[test]
    fn bounds_and_inactive_rules_never_fire() {
        let mut fields = rule(Frequency::Monthly, Some(5), HolidayAdjustment::None);
        fields.end_at = Some(datetime!(2024-03-31 23:59 +9));
        assert!(fires_on(&fields, date!(2024-03-05)));
        assert!(!fires_on(&fields, date!(2024-04-05)));
        assert!(!fires_on(&fields, date!(2023-12-05)));

        fields.is_active = false;
        assert!(!fires_on(&fields, date!(2024-03-05)));
    }

    #[test]
    fn occurrence_id_is_stable() {
        let a = occurrence_id("rule-1", date!(2024-05-01));
        let b = occurrence_id("rule-1", date!(2024-05-01));
        let c = occurrence_id("rule-1", date!(2024-06-01));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
