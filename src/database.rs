use anyhow::Result;
use libsql::{Builder, Connection};
use serde::{Serialize, de::DeserializeOwned};
use std::{path::Path, sync::Arc};
use tokio::sync::RwLock;

use crate::constants::DATABASE_FILE;
use crate::error::ApiResult;

const LEDGER_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS members (
    id             TEXT PRIMARY KEY,
    family_id      TEXT NOT NULL,
    name           TEXT UNIQUE NOT NULL,
    password_hash  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS entry_categories (
    id            TEXT PRIMARY KEY,
    family_id     TEXT NOT NULL,
    name          TEXT NOT NULL,
    type          TEXT NOT NULL,
    color         TEXT,
    icon          TEXT,
    is_archived   INTEGER NOT NULL DEFAULT 0,
    merged_to_id  TEXT,
    sort_order    INTEGER NOT NULL DEFAULT 0,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS payment_methods (
    id                             TEXT PRIMARY KEY,
    family_id                      TEXT NOT NULL,
    name                           TEXT NOT NULL,
    type                           TEXT NOT NULL,
    card_closing_day               INTEGER,
    card_payment_day               INTEGER,
    linked_bank_payment_method_id  TEXT,
    created_at                     TEXT NOT NULL,
    updated_at                     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS recurring_rules (
    id                    TEXT PRIMARY KEY,
    family_id             TEXT NOT NULL,
    entry_type            TEXT NOT NULL,
    amount                INTEGER NOT NULL,
    entry_category_id     TEXT,
    payment_method_id     TEXT,
    memo                  TEXT,
    frequency             TEXT NOT NULL,
    day_of_month          INTEGER,
    holiday_adjustment    TEXT NOT NULL DEFAULT 'none',
    start_at              TEXT NOT NULL,
    end_at                TEXT,
    is_active             INTEGER NOT NULL DEFAULT 1,
    created_by_member_id  TEXT NOT NULL,
    created_by_name       TEXT NOT NULL,
    created_at            TEXT NOT NULL,
    updated_at            TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS entries (
    id                    TEXT PRIMARY KEY,
    family_id             TEXT NOT NULL,
    entry_type            TEXT NOT NULL,
    amount                INTEGER NOT NULL,
    entry_category_id     TEXT,
    payment_method_id     TEXT,
    memo                  TEXT,
    occurred_at           TEXT NOT NULL,
    occurred_on           TEXT NOT NULL,
    recurring_rule_id     TEXT,
    created_by_member_id  TEXT NOT NULL,
    created_by_name       TEXT NOT NULL,
    created_at            TEXT NOT NULL,
    updated_at            TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entries_family_occurred_on
    ON entries (family_id, occurred_on);

CREATE TABLE IF NOT EXISTS monthly_balances (
    family_id   TEXT NOT NULL,
    ym          TEXT NOT NULL,
    balance     INTEGER NOT NULL,
    is_closed   INTEGER NOT NULL DEFAULT 0,
    updated_at  TEXT NOT NULL,
    PRIMARY KEY (family_id, ym)
);

CREATE TABLE IF NOT EXISTS change_log (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    family_id    TEXT NOT NULL,
    entity_type  TEXT NOT NULL,
    entity_id    TEXT NOT NULL,
    action       TEXT NOT NULL,
    payload      TEXT NOT NULL,
    created_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_change_log_family_id
    ON change_log (family_id, id);

CREATE TABLE IF NOT EXISTS mutation_receipts (
    request_id     TEXT PRIMARY KEY,
    family_id      TEXT NOT NULL,
    endpoint       TEXT NOT NULL,
    method         TEXT NOT NULL,
    status         INTEGER NOT NULL,
    response_body  TEXT NOT NULL,
    created_at     TEXT NOT NULL,
    expires_at     INTEGER NOT NULL
);
"#;

pub type Db = Arc<RwLock<Connection>>;

/// Shared ledger database (ledger.db) holding every family's rows.
pub async fn init_db(data_dir: &str) -> Result<Db> {
    tokio::fs::create_dir_all(data_dir).await?;
    let path = Path::new(data_dir).join(DATABASE_FILE);
    let db = Builder::new_local(path).build().await?;
    let conn = db.connect()?;

    conn.execute_batch(LEDGER_SCHEMA).await?;
    Ok(Arc::new(RwLock::new(conn)))
}

/// Stores a unit enum as its serde name (e.g. `EntryType::Income` -> `income`).
pub fn enum_to_db<T: Serialize>(value: &T) -> ApiResult<String> {
    Ok(serde_json::to_string(value)?.trim_matches('"').to_string())
}

pub fn enum_from_db<T: DeserializeOwned>(value: &str) -> ApiResult<T> {
    Ok(serde_json::from_str(&format!("\"{}\"", value))?)
}

pub fn bool_to_db(value: bool) -> i64 {
    i64::from(value)
}

pub fn bool_from_db(value: i64) -> bool {
    value != 0
}
