use std::collections::BTreeMap;

use household_ledger::balances::{parse_ym, put_balance};
use household_ledger::categories::update_category;
use household_ledger::change_log::{changes_after, count_for_entity, head, pull};
use household_ledger::entries::{create_entry, delete_entry, update_entry};
use household_ledger::error::ApiError;
use household_ledger::models::{
    ChangeAction, CreatePaymentMethodPayload, CreateRecurringRulePayload, EntityType, EntryType,
    Frequency, HolidayAdjustment, PaymentMethodType, PutMonthlyBalancePayload,
    UpdateCategoryPayload, UpdateEntryPayload,
};
use household_ledger::payment_methods::create_payment_method;
use household_ledger::recurrence::run_recurring_generation;
use household_ledger::recurring_rules::create_recurring_rule;
use household_ledger::sync::bootstrap_snapshot;
use household_ledger::utils::{validate_cursor, validate_sync_limit};
use serde::Serialize;
use serde_json::Value;
use time::macros::{date, datetime};
use uuid::Uuid;

mod common;
use common::*;

#[tokio::test]
async fn paging_visits_every_change_once_in_order() {
    let (db, member, _temp_dir) = setup_test_ledger().await;
    let conn = db.write().await;
    for day in 1..=5u8 {
        let at = datetime!(2024-06-01 00:00 UTC).replace_day(day).unwrap();
        create_test_entry(&conn, &member, EntryType::Expense, 100 * i64::from(day), at).await;
    }

    let mut cursor = 0;
    let mut seen = Vec::new();
    loop {
        let page = pull(&conn, &member.family_id, cursor, 3, TEST_NOW).await.unwrap();
        assert!(page.changes.len() <= 3);
        if page.changes.is_empty() {
            assert_eq!(page.next_cursor, cursor);
            break;
        }
        assert_eq!(page.next_cursor, page.changes.last().unwrap().id);
        seen.extend(page.changes.iter().map(|change| change.id));
        cursor = page.next_cursor;
    }

    let all: Vec<i64> = changes_after(&conn, &member.family_id, 0, 500)
        .await
        .unwrap()
        .iter()
        .map(|change| change.id)
        .collect();
    assert_eq!(seen, all);
    assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(cursor, head(&conn, &member.family_id).await.unwrap());
}

#[tokio::test]
async fn zero_limit_is_a_head_probe() {
    let (db, member, _temp_dir) = setup_test_ledger().await;
    let conn = db.write().await;

    let empty = pull(&conn, &member.family_id, 0, 0, TEST_NOW).await.unwrap();
    assert!(empty.changes.is_empty());
    assert_eq!(empty.next_cursor, 0);

    create_test_entry(&conn, &member, EntryType::Income, 50, datetime!(2024-06-02 00:00 UTC)).await;
    let latest = changes_after(&conn, &member.family_id, 0, 500)
        .await
        .unwrap()
        .last()
        .map(|change| change.id)
        .unwrap();

    // The cursor argument is irrelevant to a probe.
    let probe = pull(&conn, &member.family_id, 0, 0, TEST_NOW).await.unwrap();
    assert!(probe.changes.is_empty());
    assert_eq!(probe.next_cursor, latest);
    assert_eq!(probe.server_time, TEST_NOW);
}

#[tokio::test]
async fn feeds_are_isolated_per_family() {
    let (db, member, _temp_dir) = setup_test_ledger().await;
    let neighbour = create_test_member(&db, &Uuid::new_v4().to_string()).await;
    let conn = db.write().await;

    let ours = create_test_entry(&conn, &member, EntryType::Expense, 10, datetime!(2024-06-03 00:00 UTC)).await;
    let theirs =
        create_test_entry(&conn, &neighbour, EntryType::Expense, 20, datetime!(2024-06-03 00:00 UTC))
            .await;

    let page = pull(&conn, &member.family_id, 0, 500, TEST_NOW).await.unwrap();
    assert!(page.changes.iter().all(|change| change.family_id == member.family_id));
    assert!(page.changes.iter().any(|change| change.entity_id == ours.id));
    assert!(!page.changes.iter().any(|change| change.entity_id == theirs.id));

    assert_eq!(count_for_entity(&conn, EntityType::Entry, &theirs.id).await.unwrap(), 1);
    assert!(head(&conn, &neighbour.family_id).await.unwrap() > head(&conn, &member.family_id).await.unwrap());
}

#[tokio::test]
async fn members_of_one_family_share_a_feed() {
    let (db, member, _temp_dir) = setup_test_ledger().await;
    let partner = create_test_member(&db, &member.family_id).await;
    let conn = db.write().await;

    let entry = create_test_entry(&conn, &partner, EntryType::Income, 75, datetime!(2024-06-04 00:00 UTC)).await;
    let page = pull(&conn, &member.family_id, 0, 500, TEST_NOW).await.unwrap();
    let change = page
        .changes
        .iter()
        .find(|change| change.entity_id == entry.id)
        .expect("partner's entry is visible");
    assert_eq!(change.payload["created_by_name"], partner.username.as_str());
}

#[tokio::test]
async fn bootstrap_snapshot_resumes_at_its_cursor() {
    let (db, member, _temp_dir) = setup_test_ledger().await;
    let conn = db.write().await;
    create_test_category(&conn, &member.family_id, "Salary", EntryType::Income).await;
    create_test_entry(&conn, &member, EntryType::Income, 4000, datetime!(2024-05-25 00:00 UTC)).await;

    let snapshot = bootstrap_snapshot(&conn, &member.family_id, TEST_NOW).await.unwrap();
    assert_eq!(snapshot.entries.len(), 1);
    assert_eq!(snapshot.entry_categories.len(), 1);
    assert_eq!(snapshot.monthly_balances.len(), 2);
    assert!(snapshot.payment_methods.is_empty());
    assert!(snapshot.recurring_rules.is_empty());
    assert_eq!(snapshot.next_cursor, head(&conn, &member.family_id).await.unwrap());

    let later = create_test_entry(&conn, &member, EntryType::Expense, 30, datetime!(2024-06-06 00:00 UTC)).await;
    let page = pull(&conn, &member.family_id, snapshot.next_cursor, 100, TEST_NOW)
        .await
        .unwrap();
    assert_eq!(page.changes[0].entity_id, later.id);
    assert!(page.changes.iter().all(|change| change.id > snapshot.next_cursor));
}

#[test]
fn paging_parameters_are_validated() {
    assert_eq!(validate_sync_limit(None).unwrap(), 100);
    assert_eq!(validate_sync_limit(Some(0)).unwrap(), 0);
    assert_eq!(validate_sync_limit(Some(500)).unwrap(), 500);
    assert!(matches!(validate_sync_limit(Some(501)), Err(ApiError::Validation(_))));

    assert_eq!(validate_cursor(None).unwrap(), 0);
    assert_eq!(validate_cursor(Some(42)).unwrap(), 42);
    assert!(matches!(validate_cursor(Some(-1)), Err(ApiError::Validation(_))));
}

type Replay = BTreeMap<(String, String), Value>;

fn record<T: Serialize>(state: &mut Replay, entity_type: EntityType, id: &str, row: &T) {
    let kind = serde_json::to_string(&entity_type).unwrap();
    state.insert((kind, id.to_string()), serde_json::to_value(row).unwrap());
}

#[tokio::test]
async fn replaying_the_feed_rebuilds_the_snapshot() {
    let (db, member, _temp_dir) = setup_test_ledger().await;
    let conn = db.write().await;
    let family_id = member.family_id.clone();

    let food = create_test_category(&conn, &family_id, "Food", EntryType::Expense).await;
    let meals = create_test_category(&conn, &family_id, "Meals", EntryType::Expense).await;
    let wallet = create_payment_method(
        &conn,
        &family_id,
        CreatePaymentMethodPayload {
            id: None,
            name: "Wallet".to_string(),
            method_type: PaymentMethodType::Cash,
            card_closing_day: None,
            card_payment_day: None,
            linked_bank_payment_method_id: None,
        },
        TEST_NOW,
    )
    .await
    .unwrap()
    .1
    .data;
    create_recurring_rule(
        &conn,
        &member,
        CreateRecurringRulePayload {
            id: None,
            entry_type: EntryType::Expense,
            amount: 4000,
            entry_category_id: Some(food.id.clone()),
            payment_method_id: Some(wallet.id.clone()),
            memo: Some("Rice delivery".to_string()),
            frequency: Frequency::Monthly,
            day_of_month: Some(10),
            holiday_adjustment: HolidayAdjustment::None,
            start_at: datetime!(2024-01-01 00:00 UTC),
            end_at: None,
            is_active: None,
        },
        TEST_NOW,
    )
    .await
    .unwrap();

    // Sent in the ledger offset; both the feed and the snapshot report UTC.
    let mut lunch = entry_payload(EntryType::Expense, 1200, datetime!(2024-04-08 12:00 +9));
    lunch.entry_category_id = Some(food.id.clone());
    lunch.payment_method_id = Some(wallet.id.clone());
    let lunch = create_entry(&conn, &member, lunch, TEST_NOW).await.unwrap().1.data;
    create_test_entry(&conn, &member, EntryType::Income, 300_000, datetime!(2024-05-25 00:00 UTC)).await;
    let taxi = create_test_entry(&conn, &member, EntryType::Expense, 800, datetime!(2024-06-02 12:00 UTC)).await;

    // Backdate and change the lunch, drop the taxi ride.
    update_entry(
        &conn,
        &member,
        &lunch.id,
        UpdateEntryPayload {
            amount: Some(1500),
            occurred_at: Some(datetime!(2024-03-20 03:00 UTC)),
            ..Default::default()
        },
        TEST_NOW,
    )
    .await
    .unwrap();
    delete_entry(&conn, &member, &taxi.id, TEST_NOW).await.unwrap();

    // Merging re-points the lunch and the rule.
    update_category(
        &conn,
        &family_id,
        &food.id,
        UpdateCategoryPayload {
            merged_to_id: Some(Some(meals.id.clone())),
            ..Default::default()
        },
        TEST_NOW,
    )
    .await
    .unwrap();

    put_balance(
        &conn,
        &family_id,
        parse_ym("2024-02").unwrap(),
        PutMonthlyBalancePayload {
            balance: 10_000,
            is_closed: Some(true),
        },
        TEST_NOW,
    )
    .await
    .unwrap();
    let generated = run_recurring_generation(&conn, date!(2024-06-10), TEST_NOW)
        .await
        .unwrap();
    assert_eq!(generated.created, 1);

    let page = pull(&conn, &family_id, 0, 500, TEST_NOW).await.unwrap();
    assert!(page.changes.len() < 500, "feed did not fit in one page");
    let mut replayed = Replay::new();
    for change in &page.changes {
        let key = (
            serde_json::to_string(&change.entity_type).unwrap(),
            change.entity_id.clone(),
        );
        match change.action {
            ChangeAction::Upsert => {
                replayed.insert(key, change.payload.clone());
            }
            ChangeAction::Delete => {
                replayed.remove(&key);
            }
        }
    }

    let snapshot = bootstrap_snapshot(&conn, &family_id, TEST_NOW).await.unwrap();
    let mut direct = Replay::new();
    for entry in &snapshot.entries {
        record(&mut direct, EntityType::Entry, &entry.id, entry);
    }
    for category in &snapshot.entry_categories {
        record(&mut direct, EntityType::EntryCategory, &category.id, category);
    }
    for method in &snapshot.payment_methods {
        record(&mut direct, EntityType::PaymentMethod, &method.id, method);
    }
    for rule in &snapshot.recurring_rules {
        record(&mut direct, EntityType::RecurringRule, &rule.id, rule);
    }
    for balance in &snapshot.monthly_balances {
        record(&mut direct, EntityType::MonthlyBalance, &balance.ym.to_string(), balance);
    }

    assert_eq!(snapshot.entries.len(), 3);
    assert!(snapshot.entries.iter().all(|entry| entry.id != taxi.id));
    assert!(
        snapshot
            .entries
            .iter()
            .filter(|entry| entry.fields.entry_category_id.is_some())
            .all(|entry| entry.fields.entry_category_id.as_deref() == Some(meals.id.as_str()))
    );
    assert_eq!(replayed, direct);
    assert_eq!(page.next_cursor, snapshot.next_cursor);
}
