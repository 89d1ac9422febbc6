mod common;

use common::TestApp;
use futures::future::join_all;
use serde_json::{json, Value};
use uuid::Uuid;

const BY_KEY: &str = "SELECT COUNT(*) FROM transactions WHERE branch_id = $1";

#[tokio::test]
async fn create_with_same_key_returns_the_same_row() {
    let app = TestApp::spawn().await;
    let body = app.create_body(1000.0);

    let first = app.create_transaction("create-once", &body).await;
    assert_eq!(first.status(), 201);
    let first: Value = first.json().await.unwrap();

    let second = app.create_transaction("create-once", &body).await;
    assert_eq!(second.status(), 200);
    let second: Value = second.json().await.unwrap();

    assert_eq!(first["data"], second["data"]);
    assert_eq!(first["data"]["status"], "pending");
    let number = first["data"]["transaction_number"].as_str().unwrap();
    assert!(number.starts_with(&format!("{}-", app.seed.branch_code)));
    assert_eq!(app.count(BY_KEY, app.seed.branch_id).await, 1);
}

#[tokio::test]
async fn body_key_is_accepted_when_header_is_absent() {
    let app = TestApp::spawn().await;
    let mut body = app.create_body(800.0);
    body["client_request_id"] = json!("legacy-key-1");

    let response = app
        .client
        .post(app.url("/api/transactions"))
        .header("X-User-ID", app.seed.operator_id.to_string())
        .header("X-User-Role", "operator")
        .json(&body)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 201);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["data"]["client_request_id"], "legacy-key-1");
    assert_eq!(body["data"]["branch_id"], app.seed.branch_id.to_string());
}

#[tokio::test]
async fn create_without_key_is_rejected() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .post(app.url("/api/transactions"))
        .header("X-User-ID", app.seed.operator_id.to_string())
        .header("X-User-Role", "operator")
        .header("X-Branch-ID", app.seed.branch_id.to_string())
        .json(&app.create_body(1000.0))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 422);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "validation_error");
    assert_eq!(app.count(BY_KEY, app.seed.branch_id).await, 0);
}

#[tokio::test]
async fn invalid_payloads_are_rejected_before_writing() {
    let app = TestApp::spawn().await;

    let mut negative = app.create_body(-5.0);
    negative["transaction_type"] = json!("inbound");
    assert_eq!(app.create_transaction("neg", &negative).await.status(), 422);

    let mut sideways = app.create_body(10.0);
    sideways["transaction_type"] = json!("sideways");
    assert_eq!(app.create_transaction("side", &sideways).await.status(), 422);

    let mut foreign_client = app.create_body(10.0);
    foreign_client["client_id"] = json!(Uuid::new_v4());
    assert_eq!(app.create_transaction("foreign", &foreign_client).await.status(), 404);

    assert_eq!(app.count(BY_KEY, app.seed.branch_id).await, 0);
}

#[tokio::test]
async fn concurrent_creates_with_one_key_converge() {
    let app = TestApp::spawn().await;
    let body = app.create_body(1200.0);

    let responses = join_all((0..8).map(|_| app.create_transaction("race-key", &body))).await;

    let mut ids = Vec::new();
    for response in responses {
        assert!(response.status().is_success(), "status {}", response.status());
        let body: Value = response.json().await.unwrap();
        ids.push(body["data"]["id"].as_str().unwrap().to_string());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(app.count(BY_KEY, app.seed.branch_id).await, 1);
}

#[tokio::test]
async fn list_and_get_are_branch_scoped() {
    let app = TestApp::spawn().await;

    for i in 0..3 {
        let response = app
            .create_transaction(&format!("list-{}", i), &app.create_body(100.0 * f64::from(i + 1)))
            .await;
        assert_eq!(response.status(), 201);
    }

    let page: Value = app
        .get_as_manager("/api/transactions?status=pending&per_page=2")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(page["data"]["total"], 3);
    assert_eq!(page["data"]["items"].as_array().unwrap().len(), 2);
    // Newest first
    assert_eq!(page["data"]["items"][0]["first_weight"], 300.0);

    let id = page["data"]["items"][0]["id"].as_str().unwrap();
    let one = app.get_as_manager(&format!("/api/transactions/{}", id)).await;
    assert_eq!(one.status(), 200);

    let other_branch = app
        .client
        .get(app.url(&format!("/api/transactions/{}", id)))
        .header("X-User-ID", app.seed.manager_id.to_string())
        .header("X-User-Role", "manager")
        .header("X-Branch-ID", Uuid::new_v4().to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(other_branch.status(), 404);

    let bad_status = app.get_as_manager("/api/transactions?status=done").await;
    assert_eq!(bad_status.status(), 422);
}

#[tokio::test]
async fn cancel_only_applies_to_open_transactions() {
    let app = TestApp::spawn().await;

    let created: Value = app
        .create_transaction("to-cancel", &app.create_body(900.0))
        .await
        .json()
        .await
        .unwrap();
    let id = created["data"]["id"].as_str().unwrap();

    let cancelled = app
        .post_as_manager(&format!("/api/transactions/{}/cancel", id))
        .await;
    assert_eq!(cancelled.status(), 200);
    let cancelled: Value = cancelled.json().await.unwrap();
    assert_eq!(cancelled["data"]["status"], "cancelled");

    let again = app
        .post_as_manager(&format!("/api/transactions/{}/cancel", id))
        .await;
    assert_eq!(again.status(), 409);

    let completed = app.completed_weighing(1000.0, 400.0).await;
    let completed_id = completed["transaction"]["id"].as_str().unwrap();
    let cancel_completed = app
        .post_as_manager(&format!("/api/transactions/{}/cancel", completed_id))
        .await;
    assert_eq!(cancel_completed.status(), 409);
}
