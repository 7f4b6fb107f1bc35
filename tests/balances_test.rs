use household_ledger::balances::{find_balance, list_balances, parse_ym, put_balance, recalculate};
use household_ledger::calendar::YearMonth;
use household_ledger::constants::MAX_BALANCE;
use household_ledger::entries::{build_entry, commit_new_entry};
use household_ledger::error::ApiError;
use household_ledger::models::{EntryFields, EntryType, PutMonthlyBalancePayload};
use time::Duration;
use time::macros::datetime;

mod common;
use common::*;

fn ym(value: &str) -> YearMonth {
    parse_ym(value).expect("valid year-month")
}

#[tokio::test]
async fn balances_carry_forward_month_over_month() {
    let (db, member, _temp_dir) = setup_test_ledger().await;
    let conn = db.write().await;

    create_test_entry(&conn, &member, EntryType::Income, 3000, datetime!(2024-04-05 00:00 UTC)).await;
    create_test_entry(&conn, &member, EntryType::Expense, 1000, datetime!(2024-04-20 00:00 UTC)).await;
    create_test_entry(&conn, &member, EntryType::Expense, 500, datetime!(2024-05-02 00:00 UTC)).await;
    create_test_entry(&conn, &member, EntryType::Income, 200, datetime!(2024-06-10 00:00 UTC)).await;

    let balances = list_balances(&conn, &member.family_id, Some(ym("2024-04")), None)
        .await
        .unwrap();
    let values: Vec<(String, i64)> = balances
        .iter()
        .map(|row| (row.ym.to_string(), row.balance))
        .collect();
    assert_eq!(
        values,
        vec![
            ("2024-04".to_string(), 2000),
            ("2024-05".to_string(), 1500),
            ("2024-06".to_string(), 1700),
        ]
    );
}

#[tokio::test]
async fn recalculation_is_quiet_when_nothing_changed() {
    let (db, member, _temp_dir) = setup_test_ledger().await;
    let conn = db.write().await;
    create_test_entry(&conn, &member, EntryType::Income, 900, datetime!(2024-03-05 00:00 UTC)).await;
    let before = count_changes(&conn, &member.family_id).await;

    let written = recalculate(&conn, &member.family_id, ym("2024-01"), TEST_NOW)
        .await
        .unwrap();

    // January and February had no rows yet; they are written as zero.
    let months: Vec<String> = written.iter().map(|row| row.ym.to_string()).collect();
    assert_eq!(months, vec!["2024-01", "2024-02"]);
    assert_eq!(count_changes(&conn, &member.family_id).await, before + 2);

    let again = recalculate(&conn, &member.family_id, ym("2024-01"), TEST_NOW)
        .await
        .unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn future_start_month_is_a_no_op() {
    let (db, member, _temp_dir) = setup_test_ledger().await;
    let conn = db.write().await;

    let written = recalculate(&conn, &member.family_id, ym("2024-09"), TEST_NOW)
        .await
        .unwrap();
    assert!(written.is_empty());
    assert_eq!(count_changes(&conn, &member.family_id).await, 0);
}

#[tokio::test]
async fn seeded_balance_cascades_and_keeps_closed_flag() {
    let (db, member, _temp_dir) = setup_test_ledger().await;
    let conn = db.write().await;
    create_test_entry(&conn, &member, EntryType::Expense, 400, datetime!(2024-05-15 00:00 UTC)).await;

    let seeded = put_balance(
        &conn,
        &member.family_id,
        ym("2024-04"),
        PutMonthlyBalancePayload {
            balance: 10_000,
            is_closed: Some(true),
        },
        TEST_NOW,
    )
    .await
    .unwrap();
    assert!(!seeded.idempotent);
    assert_eq!(seeded.data.balance, 10_000);
    assert!(seeded.data.is_closed);

    let may = find_balance(&conn, &member.family_id, ym("2024-05")).await.unwrap().unwrap();
    let june = find_balance(&conn, &member.family_id, ym("2024-06")).await.unwrap().unwrap();
    assert_eq!(may.balance, 9_600);
    assert_eq!(june.balance, 9_600);

    // An entry landing in the closed month recomputes it but leaves it closed.
    create_test_entry(&conn, &member, EntryType::Income, 100, datetime!(2024-04-10 00:00 UTC)).await;
    let april = find_balance(&conn, &member.family_id, ym("2024-04")).await.unwrap().unwrap();
    assert!(april.is_closed);
    assert_eq!(april.balance, 100);
}

#[tokio::test]
async fn repeating_a_seed_is_idempotent() {
    let (db, member, _temp_dir) = setup_test_ledger().await;
    let conn = db.write().await;
    let payload = PutMonthlyBalancePayload {
        balance: 5_000,
        is_closed: None,
    };

    put_balance(&conn, &member.family_id, ym("2024-06"), payload.clone(), TEST_NOW)
        .await
        .unwrap();
    let before = count_changes(&conn, &member.family_id).await;

    let repeated = put_balance(
        &conn,
        &member.family_id,
        ym("2024-06"),
        payload,
        TEST_NOW + Duration::minutes(1),
    )
    .await
    .unwrap();
    assert!(repeated.idempotent);
    assert!(!repeated.data.is_closed);
    assert_eq!(count_changes(&conn, &member.family_id).await, before);
}

#[test]
fn malformed_month_keys_are_rejected() {
    for value in ["2024-13", "2024-6", "24-06", "june", ""] {
        assert!(
            matches!(parse_ym(value), Err(ApiError::Validation(_))),
            "{} should be rejected",
            value
        );
    }
    assert_eq!(ym(" 2024-06 ").to_string(), "2024-06");
}

#[test]
fn month_keys_outside_the_ledger_years_are_rejected() {
    for value in ["0001-01", "1999-12", "2101-01", "9999-12"] {
        assert!(
            matches!(parse_ym(value), Err(ApiError::Validation(_))),
            "{} should be rejected",
            value
        );
    }
    assert_eq!(ym("2000-01").to_string(), "2000-01");
    assert_eq!(ym("2100-12").to_string(), "2100-12");
}

#[tokio::test]
async fn seeded_balance_must_stay_within_bounds() {
    let (db, member, _temp_dir) = setup_test_ledger().await;
    let conn = db.write().await;

    for balance in [i64::MAX - 10, MAX_BALANCE + 1, -MAX_BALANCE - 1] {
        let payload = PutMonthlyBalancePayload {
            balance,
            is_closed: None,
        };
        let result = put_balance(&conn, &member.family_id, ym("2024-05"), payload, TEST_NOW).await;
        assert!(matches!(result, Err(ApiError::Validation(_))));
    }
    assert_eq!(count_changes(&conn, &member.family_id).await, 0);

    let payload = PutMonthlyBalancePayload {
        balance: -MAX_BALANCE,
        is_closed: None,
    };
    let seeded = put_balance(&conn, &member.family_id, ym("2024-05"), payload, TEST_NOW)
        .await
        .unwrap();
    assert_eq!(seeded.data.balance, -MAX_BALANCE);
}

#[tokio::test]
async fn overflowing_carry_is_an_error() {
    let (db, member, _temp_dir) = setup_test_ledger().await;
    let conn = db.write().await;

    // A stored balance no endpoint would accept, as left by an older build.
    conn.execute(
        "INSERT INTO monthly_balances (family_id, ym, balance, is_closed, updated_at) \
         VALUES (?, '2024-05', ?, 0, '2024-05-31T00:00:00Z')",
        libsql::params![member.family_id.as_str(), i64::MAX - 10],
    )
    .await
    .unwrap();

    let fields = EntryFields {
        entry_type: EntryType::Income,
        amount: 100,
        entry_category_id: None,
        payment_method_id: None,
        memo: None,
        occurred_at: datetime!(2024-06-05 00:00 UTC),
        recurring_rule_id: None,
    };
    let entry = build_entry("overflow-entry".to_string(), &member.family_id, fields, &member, TEST_NOW);
    commit_new_entry(&conn, &entry, TEST_NOW).await.unwrap();

    let result = recalculate(&conn, &member.family_id, ym("2024-06"), TEST_NOW).await;
    assert!(matches!(result, Err(ApiError::Validation(_))));
    assert!(find_balance(&conn, &member.family_id, ym("2024-06")).await.unwrap().is_none());
}
