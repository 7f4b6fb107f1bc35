#![allow(dead_code)]

use household_ledger::auth::create_member;
use household_ledger::categories::create_category;
use household_ledger::database::{Db, init_db};
use household_ledger::entries::create_entry;
use household_ledger::models::{
    CreateCategoryPayload, CreateEntryPayload, Entry, EntryCategory, EntryType, PublicMember,
};
use libsql::Connection;
use tempfile::{TempDir, tempdir};
use time::OffsetDateTime;
use time::macros::datetime;
use uuid::Uuid;

/// Fixed clock for tests: 2024-06-15 12:00 in the ledger offset.
pub const TEST_NOW: OffsetDateTime = datetime!(2024-06-15 03:00 UTC);

/// Fresh ledger database in its own temporary directory, with one member in a
/// new family. Keep the returned `TempDir` alive for the duration of the test.
pub async fn setup_test_ledger() -> (Db, PublicMember, TempDir) {
    let temp_dir = tempdir().expect("Failed to create temporary directory");
    let data_path = temp_dir
        .path()
        .to_str()
        .expect("Failed to convert path to string")
        .to_string();

    let db = init_db(&data_path)
        .await
        .unwrap_or_else(|e| panic!("Failed to initialize ledger database at {}: {}", data_path, e));
    let member = create_test_member(&db, &Uuid::new_v4().to_string()).await;

    (db, member, temp_dir)
}

pub async fn create_test_member(db: &Db, family_id: &str) -> PublicMember {
    let username = format!("member_{}", &Uuid::new_v4().simple().to_string()[..8]);
    create_member(db, family_id, &username, "password123")
        .await
        .unwrap_or_else(|e| panic!("Failed to create test member {}: {}", username, e))
}

pub fn entry_payload(
    entry_type: EntryType,
    amount: i64,
    occurred_at: OffsetDateTime,
) -> CreateEntryPayload {
    CreateEntryPayload {
        id: None,
        entry_type,
        amount,
        entry_category_id: None,
        payment_method_id: None,
        memo: None,
        occurred_at,
        recurring_rule_id: None,
        base_updated_at: None,
    }
}

pub async fn create_test_entry(
    conn: &Connection,
    member: &PublicMember,
    entry_type: EntryType,
    amount: i64,
    occurred_at: OffsetDateTime,
) -> Entry {
    let (_, response) = create_entry(
        conn,
        member,
        entry_payload(entry_type, amount, occurred_at),
        TEST_NOW,
    )
    .await
    .unwrap_or_else(|e| panic!("Failed to create test entry of {}: {}", amount, e));
    response.data
}

pub async fn create_test_category(
    conn: &Connection,
    family_id: &str,
    name: &str,
    category_type: EntryType,
) -> EntryCategory {
    let payload = CreateCategoryPayload {
        id: None,
        name: name.to_string(),
        category_type,
        color: None,
        icon: None,
        sort_order: 0,
    };
    let (_, response) = create_category(conn, family_id, payload, TEST_NOW)
        .await
        .unwrap_or_else(|e| panic!("Failed to create test category '{}': {}", name, e));
    response.data
}

pub async fn count_changes(conn: &Connection, family_id: &str) -> i64 {
    let mut rows = conn
        .query(
            "SELECT COUNT(*) FROM change_log WHERE family_id = ?",
            [family_id],
        )
        .await
        .expect("Failed to count change rows");
    let row = rows
        .next()
        .await
        .expect("Failed to read count row")
        .expect("COUNT(*) returned no row");
    row.get(0).expect("Failed to get count value")
}
