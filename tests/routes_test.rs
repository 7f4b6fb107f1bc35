use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use household_ledger::config::Config;
use household_ledger::routes::{AppState, build_router};
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;
use tower_sessions::{MemoryStore, SessionManagerLayer};

mod common;
use common::*;

async fn test_app(scheduler_token: Option<&str>) -> (Router, TempDir) {
    let (db, _member, temp_dir) = setup_test_ledger().await;
    let config = Config {
        host: "127.0.0.1".to_string(),
        port: "0".to_string(),
        data_path: temp_dir.path().display().to_string(),
        session_secret: "s".repeat(64),
        tick_interval_secs: 0,
        scheduler_token: scheduler_token.map(str::to_string),
    };
    let session_layer = SessionManagerLayer::new(MemoryStore::default()).with_secure(false);
    let app = build_router(AppState {
        db,
        config: Arc::new(config),
    })
    .layer(session_layer);
    (app, temp_dir)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Option<String>, String) {
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("router is infallible");
    let status = response.status();
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .map(str::to_string);
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read response body");
    (status, cookie, String::from_utf8_lossy(&bytes).into_owned())
}

fn json_request(method: &str, uri: &str, cookie: Option<&str>, body: &Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    builder
        .body(Body::from(body.to_string()))
        .expect("valid request")
}

fn get_request(uri: &str, cookie: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    builder.body(Body::empty()).expect("valid request")
}

async fn register(app: &Router) -> String {
    let (status, cookie, body) = send(
        app,
        json_request(
            "POST",
            "/auth/register",
            None,
            &json!({ "username": "route_tester", "password": "password123" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "register failed: {}", body);
    cookie.expect("session cookie set on register")
}

#[tokio::test]
async fn ledger_routes_require_a_session() {
    let (app, _temp_dir) = test_app(None).await;

    let (status, _, body) = send(&app, get_request("/sync", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["error"]["kind"], "unauthorized");

    let (status, _, _) = send(
        &app,
        json_request("POST", "/entries", None, &json!({ "amount": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn outbox_header_replays_the_stored_response() {
    let (app, _temp_dir) = test_app(None).await;
    let cookie = register(&app).await;

    let body = json!({
        "entry_type": "income",
        "amount": 25000,
        "occurred_at": "2024-06-01T00:00:00Z"
    });
    let request = || {
        let mut request = json_request("POST", "/entries", Some(&cookie), &body);
        request
            .headers_mut()
            .insert("x-outbox-id", "route-token-1".parse().unwrap());
        request
    };

    let (first_status, _, first_body) = send(&app, request()).await;
    let (second_status, _, second_body) = send(&app, request()).await;
    assert_eq!(first_status, StatusCode::CREATED);
    assert_eq!(second_status, StatusCode::CREATED);
    assert_eq!(first_body, second_body);

    let (status, _, page) = send(&app, get_request("/sync?cursor=0&limit=500", Some(&cookie))).await;
    assert_eq!(status, StatusCode::OK);
    let page: Value = serde_json::from_str(&page).unwrap();
    let entry_changes = page["changes"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|change| change["entity_type"] == "entry")
        .count();
    assert_eq!(entry_changes, 1);

    let (status, _, probe) = send(&app, get_request("/sync?limit=0", Some(&cookie))).await;
    assert_eq!(status, StatusCode::OK);
    let probe: Value = serde_json::from_str(&probe).unwrap();
    assert_eq!(probe["next_cursor"], page["next_cursor"]);
    assert_eq!(probe["changes"], json!([]));

    let (status, _, _) = send(&app, get_request("/sync?limit=501", Some(&cookie))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn fatal_conflicts_carry_a_structured_body() {
    let (app, _temp_dir) = test_app(None).await;
    let cookie = register(&app).await;

    let (status, _, body) = send(
        &app,
        json_request(
            "POST",
            "/entries",
            Some(&cookie),
            &json!({
                "entry_type": "expense",
                "amount": 100,
                "occurred_at": "2024-06-01T00:00:00Z",
                "entry_category_id": "does-not-exist"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["error"]["kind"], "fatal_conflict");
    assert_eq!(body["error"]["code"], "category_not_found");
    assert_eq!(body["error"]["entity_id"], "does-not-exist");
    assert_eq!(body["error"]["retryable"], false);
}

#[tokio::test]
async fn scheduler_endpoint_is_token_gated() {
    let (disabled, _temp_dir) = test_app(None).await;
    let (status, _, _) = send(&disabled, json_request("POST", "/scheduler/tick", None, &json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (app, _temp_dir) = test_app(Some("tick-secret")).await;
    let mut wrong = json_request("POST", "/scheduler/tick", None, &json!({}));
    wrong
        .headers_mut()
        .insert("x-scheduler-token", "nope".parse().unwrap());
    let (status, _, _) = send(&app, wrong).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let mut right = json_request(
        "POST",
        "/scheduler/tick",
        None,
        &json!({ "at": "2024-06-15T03:00:00Z" }),
    );
    right
        .headers_mut()
        .insert("x-scheduler-token", "tick-secret".parse().unwrap());
    let (status, _, body) = send(&app, right).await;
    assert_eq!(status, StatusCode::OK, "tick failed: {}", body);
    let report: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(report["at"], "2024-06-15T03:00:00Z");
    assert_eq!(report["generation"]["created"], 0);
}

#[tokio::test]
async fn malformed_requests_get_the_validation_envelope() {
    let (app, _temp_dir) = test_app(Some("tick-secret")).await;
    let cookie = register(&app).await;

    let assert_validation = |status: StatusCode, body: &str| {
        assert_eq!(status, StatusCode::BAD_REQUEST, "unexpected body: {}", body);
        let body: Value = serde_json::from_str(body).expect("error body is JSON");
        assert_eq!(body["error"]["kind"], "validation");
        assert!(body["error"]["message"].as_str().is_some());
    };

    // Well-formed JSON missing a required field.
    let (status, _, body) = send(
        &app,
        json_request(
            "POST",
            "/entries",
            Some(&cookie),
            &json!({ "entry_type": "expense", "occurred_at": "2024-06-01T00:00:00Z" }),
        ),
    )
    .await;
    assert_validation(status, &body);

    // Not JSON at all.
    let broken = Request::builder()
        .method("PATCH")
        .uri("/entries/e-1")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::COOKIE, &cookie)
        .body(Body::from("{ amount: "))
        .expect("valid request");
    let (status, _, body) = send(&app, broken).await;
    assert_validation(status, &body);

    let (status, _, body) = send(&app, get_request("/sync?limit=-1", Some(&cookie))).await;
    assert_validation(status, &body);

    let (status, _, body) = send(&app, get_request("/sync?cursor=abc", Some(&cookie))).await;
    assert_validation(status, &body);

    let (status, _, body) = send(&app, get_request("/monthly-balances?from=2024-01", Some(&cookie))).await;
    assert_validation(status, &body);

    let (status, _, body) = send(&app, get_request("/monthly-balance?ym=0001-01", Some(&cookie))).await;
    assert_validation(status, &body);

    let mut tick = Request::builder()
        .method("POST")
        .uri("/scheduler/tick")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{ "at": "yesterday" }"#))
        .expect("valid request");
    tick.headers_mut()
        .insert("x-scheduler-token", "tick-secret".parse().unwrap());
    let (status, _, body) = send(&app, tick).await;
    assert_validation(status, &body);
}

#[tokio::test]
async fn reused_token_with_a_changed_body_replays_the_first_response() {
    let (app, _temp_dir) = test_app(None).await;
    let cookie = register(&app).await;

    let request = |amount: i64| {
        let mut request = json_request(
            "POST",
            "/entries",
            Some(&cookie),
            &json!({
                "entry_type": "expense",
                "amount": amount,
                "occurred_at": "2024-06-01T00:00:00Z"
            }),
        );
        request
            .headers_mut()
            .insert("x-outbox-id", "token-t1".parse().unwrap());
        request
    };

    let (first_status, _, first_body) = send(&app, request(500)).await;
    assert_eq!(first_status, StatusCode::CREATED, "create failed: {}", first_body);
    let (second_status, _, second_body) = send(&app, request(700)).await;
    assert_eq!(second_status, StatusCode::CREATED);
    assert_eq!(first_body, second_body);

    let created: Value = serde_json::from_str(&first_body).unwrap();
    assert_eq!(created["data"]["amount"], 500);

    let (_, _, snapshot) = send(&app, get_request("/bootstrap", Some(&cookie))).await;
    let snapshot: Value = serde_json::from_str(&snapshot).unwrap();
    let entries = snapshot["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["amount"], 500);
    assert_eq!(entries[0]["id"], created["data"]["id"]);
}
