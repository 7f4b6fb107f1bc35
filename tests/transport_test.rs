use std::sync::Arc;

use household_ledger::client::{
    HttpTransport, OutboxItem, OutboxOperation, RetryClass, SyncTransport,
};
use household_ledger::config::Config;
use household_ledger::database::Db;
use household_ledger::error::FatalConflictCode;
use household_ledger::models::{EntityType, PublicMember};
use household_ledger::routes::{AppState, build_router};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tower_sessions::{MemoryStore, SessionManagerLayer};

mod common;
use common::*;

/// Serves the full router on an ephemeral local port.
async fn serve_ledger() -> (String, Db, PublicMember, TempDir) {
    let (db, member, temp_dir) = setup_test_ledger().await;
    let config = Config {
        host: "127.0.0.1".to_string(),
        port: "0".to_string(),
        data_path: temp_dir.path().display().to_string(),
        session_secret: "s".repeat(64),
        tick_interval_secs: 0,
        scheduler_token: None,
    };
    let session_layer = SessionManagerLayer::new(MemoryStore::default()).with_secure(false);
    let app = build_router(AppState {
        db: db.clone(),
        config: Arc::new(config),
    })
    .layer(session_layer);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test listener");
    let addr = listener.local_addr().expect("listener has an address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("test server failed");
    });

    (format!("http://{}", addr), db, member, temp_dir)
}

fn outbox_item(id: &str, entity_id: &str, body: Value) -> OutboxItem {
    OutboxItem {
        seq: 1,
        id: id.to_string(),
        entity_type: EntityType::Entry,
        entity_id: entity_id.to_string(),
        operation: OutboxOperation::Create,
        base_updated_at: None,
        method: "POST".to_string(),
        path: "/entries".to_string(),
        body: Some(body),
        created_at: TEST_NOW,
        attempts: 0,
        next_retry_at: None,
        last_error_code: None,
        last_error_message: None,
        failure_class: None,
    }
}

#[tokio::test]
async fn requests_without_a_session_need_reauth() {
    let (base_url, _db, _member, _temp_dir) = serve_ledger().await;
    let transport = HttpTransport::new(&base_url).unwrap();

    let err = transport.pull(0, 10).await.unwrap_err();
    assert_eq!(err.status_code(), Some(401));
    assert_eq!(err.retry_class(), RetryClass::ReauthRequired);

    let err = transport.login("nobody", "wrong-password").await.unwrap_err();
    assert_eq!(err.status_code(), Some(401));
}

#[tokio::test]
async fn sends_replay_and_sync_over_http() {
    let (base_url, _db, member, _temp_dir) = serve_ledger().await;
    let transport = HttpTransport::new(&base_url).unwrap();

    let logged_in = transport.login(&member.username, "password123").await.unwrap();
    assert_eq!(logged_in.id, member.id);
    assert_eq!(logged_in.family_id, member.family_id);

    let item = outbox_item(
        "http-token-1",
        "entry-http-1",
        json!({
            "id": "entry-http-1",
            "entry_type": "income",
            "amount": 25000,
            "occurred_at": "2024-06-01T00:00:00Z"
        }),
    );
    let first = transport.send(&item).await.unwrap();
    let second = transport.send(&item).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first["data"]["id"], "entry-http-1");
    assert_eq!(first["data"]["amount"], 25000);
    assert_eq!(first["idempotent"], false);

    let page = transport.pull(0, 100).await.unwrap();
    let entry_changes: Vec<_> = page
        .changes
        .iter()
        .filter(|change| change.entity_type == EntityType::Entry)
        .collect();
    assert_eq!(entry_changes.len(), 1);
    assert_eq!(entry_changes[0].entity_id, "entry-http-1");
    assert!(page.next_cursor > 0);

    let empty = transport.pull(page.next_cursor, 100).await.unwrap();
    assert!(empty.changes.is_empty());
    assert_eq!(empty.next_cursor, page.next_cursor);

    let snapshot = transport.bootstrap().await.unwrap();
    assert_eq!(snapshot.entries.len(), 1);
    assert_eq!(snapshot.entries[0].fields.amount, 25000);
    assert_eq!(snapshot.next_cursor, page.next_cursor);
}

#[tokio::test]
async fn fatal_conflicts_decode_from_the_envelope() {
    let (base_url, _db, member, _temp_dir) = serve_ledger().await;
    let transport = HttpTransport::new(&base_url).unwrap();
    transport.login(&member.username, "password123").await.unwrap();

    let item = outbox_item(
        "http-token-2",
        "entry-http-2",
        json!({
            "id": "entry-http-2",
            "entry_type": "expense",
            "amount": 800,
            "entry_category_id": "missing-category",
            "occurred_at": "2024-06-02T00:00:00Z"
        }),
    );
    let err = transport.send(&item).await.unwrap_err();
    assert_eq!(err.status_code(), Some(409));
    assert_eq!(err.fatal_code(), Some(FatalConflictCode::CategoryNotFound));
    assert_eq!(err.retry_class(), RetryClass::Permanent);
    assert_eq!(err.code(), "category_not_found");

    let malformed = outbox_item("http-token-3", "entry-http-3", json!({ "amount": 800 }));
    let err = transport.send(&malformed).await.unwrap_err();
    assert_eq!(err.status_code(), Some(400));
    assert_eq!(err.code(), "validation");

    let snapshot = transport.bootstrap().await.unwrap();
    assert!(snapshot.entries.is_empty());
}
