use std::path::Path;
use std::sync::Arc;

use libsql::{Builder, Connection};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::sync::RwLock;

use super::error::ClientResult;
use crate::models::EntityType;

const DEVICE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS outbox_items (
    seq                 INTEGER PRIMARY KEY AUTOINCREMENT,
    id                  TEXT UNIQUE NOT NULL,
    entity_type         TEXT NOT NULL,
    entity_id           TEXT NOT NULL,
    operation           TEXT NOT NULL,
    base_updated_at     TEXT,
    method              TEXT NOT NULL,
    path                TEXT NOT NULL,
    body                TEXT,
    created_at          TEXT NOT NULL,
    attempts            INTEGER NOT NULL DEFAULT 0,
    next_retry_at       TEXT,
    last_error_code     TEXT,
    last_error_message  TEXT,
    failure_class       TEXT
);

CREATE TABLE IF NOT EXISTS sync_state (
    id              INTEGER PRIMARY KEY CHECK (id = 1),
    cursor          INTEGER NOT NULL,
    last_synced_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS replica_records (
    entity_type     TEXT NOT NULL,
    entity_id       TEXT NOT NULL,
    payload         TEXT,
    is_deleted      INTEGER NOT NULL DEFAULT 0,
    last_change_id  INTEGER NOT NULL,
    PRIMARY KEY (entity_type, entity_id)
);
"#;

pub type DeviceDb = Arc<RwLock<Connection>>;

/// Opens (creating if needed) the device-local store at `path`.
pub async fn open_device_store(path: impl AsRef<Path>) -> ClientResult<DeviceDb> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(anyhow::Error::from)?;
        }
    }

    let db = Builder::new_local(path).build().await?;
    let conn = db.connect()?;
    conn.execute_batch(DEVICE_SCHEMA).await?;

    tracing::debug!(path = %path.display(), "device store opened");
    Ok(Arc::new(RwLock::new(conn)))
}

/// Stored text form of a snake_case enum.
pub fn to_key<T: Serialize>(value: &T) -> ClientResult<String> {
    let value = serde_json::to_value(value)?;
    Ok(value.as_str().unwrap_or_default().to_string())
}

pub fn from_key<T: DeserializeOwned>(key: &str) -> ClientResult<T> {
    Ok(serde_json::from_value(Value::String(key.to_string()))?)
}

pub fn entity_key(entity_type: EntityType) -> ClientResult<String> {
    to_key(&entity_type)
}
