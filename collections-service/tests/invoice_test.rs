//! Invoice lifecycle integration tests for collections-service.

mod common;

use common::{TestApp, TEST_CLIENT_ID, TEST_TENANT_ID};
use reqwest::StatusCode;
use uuid::Uuid;

#[tokio::test]
async fn create_invoice_works() {
    let app = TestApp::spawn().await;

    let invoice = app.create_invoice("250.00").await;

    assert_eq!(invoice["status"], "draft");
    assert_eq!(invoice["total_amount"], "250.00");
    assert_eq!(invoice["amount_paid"], "0.00");
    assert_eq!(invoice["currency"], "EUR");
    assert_eq!(invoice["tenant_id"], TEST_TENANT_ID);
    assert_eq!(invoice["client_id"], TEST_CLIENT_ID);
    assert!(invoice["sent_utc"].is_null());
    assert_eq!(invoice["reminder_count"], 0);

    app.cleanup().await;
}

#[tokio::test]
async fn create_invoice_rejects_non_positive_amount() {
    let app = TestApp::spawn().await;

    let response = app
        .api
        .post(format!("{}/invoices", app.address))
        .header("X-Tenant-ID", TEST_TENANT_ID)
        .json(&serde_json::json!({
            "client_id": TEST_CLIENT_ID,
            "client_email": "client@example.com",
            "total_amount": "0.00",
            "currency": "EUR"
        }))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(StatusCode::BAD_REQUEST, response.status());

    app.cleanup().await;
}

#[tokio::test]
async fn create_invoice_rejects_invalid_email() {
    let app = TestApp::spawn().await;

    let response = app
        .api
        .post(format!("{}/invoices", app.address))
        .header("X-Tenant-ID", TEST_TENANT_ID)
        .json(&serde_json::json!({
            "client_id": TEST_CLIENT_ID,
            "client_email": "not-an-email",
            "total_amount": "100.00",
            "currency": "EUR"
        }))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(StatusCode::UNPROCESSABLE_ENTITY, response.status());

    app.cleanup().await;
}

#[tokio::test]
async fn create_invoice_requires_tenant_header() {
    let app = TestApp::spawn().await;

    let response = app
        .api
        .post(format!("{}/invoices", app.address))
        .json(&serde_json::json!({
            "client_id": TEST_CLIENT_ID,
            "client_email": "client@example.com",
            "total_amount": "100.00",
            "currency": "EUR"
        }))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(StatusCode::UNAUTHORIZED, response.status());

    app.cleanup().await;
}

#[tokio::test]
async fn record_sent_transitions_draft_to_sent() {
    let app = TestApp::spawn().await;

    let invoice = app.create_invoice("250.00").await;
    let invoice_id = Uuid::parse_str(invoice["invoice_id"].as_str().unwrap()).unwrap();

    let response = app
        .api
        .post(format!("{}/invoices/{}/sent", app.address, invoice_id))
        .header("X-Tenant-ID", TEST_TENANT_ID)
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(StatusCode::OK, response.status());
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["status"], "sent");
    assert!(!body["sent_utc"].is_null());

    // The returned notification id is the pixel the letter embeds
    let notification_id = Uuid::parse_str(body["notification_id"].as_str().unwrap()).unwrap();
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM notifications WHERE notification_id = $1")
            .bind(notification_id)
            .fetch_one(app.db.pool())
            .await
            .unwrap();
    assert_eq!(count, 1);

    app.cleanup().await;
}

#[tokio::test]
async fn record_sent_twice_keeps_first_timestamp() {
    let app = TestApp::spawn().await;

    let (invoice_id, _) = app.create_sent_invoice("250.00").await;

    let first: serde_json::Value = app
        .api
        .get(format!("{}/invoices/{}", app.address, invoice_id))
        .header("X-Tenant-ID", TEST_TENANT_ID)
        .send()
        .await
        .expect("Failed to execute request")
        .json()
        .await
        .expect("Failed to parse JSON");
    let first_sent = first["invoice"]["sent_utc"].as_str().unwrap().to_string();

    // A re-issued letter records another notification but never resets sent_utc
    let response = app
        .api
        .post(format!("{}/invoices/{}/sent", app.address, invoice_id))
        .header("X-Tenant-ID", TEST_TENANT_ID)
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(StatusCode::OK, response.status());
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["sent_utc"].as_str().unwrap(), first_sent);

    app.cleanup().await;
}

#[tokio::test]
async fn record_sent_conflicts_on_paid_invoice() {
    let app = TestApp::spawn().await;

    let invoice = app.create_invoice("250.00").await;
    let invoice_id = Uuid::parse_str(invoice["invoice_id"].as_str().unwrap()).unwrap();

    sqlx::query("UPDATE invoices SET status = 'paid', amount_paid = total_amount WHERE invoice_id = $1")
        .bind(invoice_id)
        .execute(app.db.pool())
        .await
        .unwrap();

    let response = app
        .api
        .post(format!("{}/invoices/{}/sent", app.address, invoice_id))
        .header("X-Tenant-ID", TEST_TENANT_ID)
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(StatusCode::CONFLICT, response.status());

    app.cleanup().await;
}

#[tokio::test]
async fn get_invoice_returns_timeline() {
    let app = TestApp::spawn().await;

    let (invoice_id, notification_id) = app.create_sent_invoice("250.00").await;

    // Open the letter and pick a method from the payment page
    app.api
        .get(format!("{}/t/open/{}", app.address, notification_id))
        .send()
        .await
        .expect("Failed to fire pixel");
    app.api
        .post(format!("{}/t/select/{}", app.address, invoice_id))
        .json(&serde_json::json!({"method": "bank_transfer"}))
        .send()
        .await
        .expect("Failed to select method");

    let response = app
        .api
        .get(format!("{}/invoices/{}", app.address, invoice_id))
        .header("X-Tenant-ID", TEST_TENANT_ID)
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(StatusCode::OK, response.status());
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["invoice"]["status"], "sent");
    assert_eq!(body["invoice"]["payment_method"], "bank_transfer");
    assert_eq!(body["selection"]["selected_method"], "bank_transfer");
    assert_eq!(body["notifications"].as_array().unwrap().len(), 1);
    assert_eq!(body["notifications"][0]["open_count"], 1);
    assert_eq!(body["dispatches"].as_array().unwrap().len(), 0);

    app.cleanup().await;
}

#[tokio::test]
async fn get_invoice_not_found() {
    let app = TestApp::spawn().await;

    let response = app
        .api
        .get(format!("{}/invoices/{}", app.address, Uuid::new_v4()))
        .header("X-Tenant-ID", TEST_TENANT_ID)
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(StatusCode::NOT_FOUND, response.status());

    app.cleanup().await;
}

#[tokio::test]
async fn invoice_is_scoped_to_its_tenant() {
    let app = TestApp::spawn().await;

    let invoice = app.create_invoice("250.00").await;
    let invoice_id = invoice["invoice_id"].as_str().unwrap();

    let response = app
        .api
        .get(format!("{}/invoices/{}", app.address, invoice_id))
        .header("X-Tenant-ID", Uuid::new_v4().to_string())
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(StatusCode::NOT_FOUND, response.status());

    app.cleanup().await;
}

#[tokio::test]
async fn list_invoices_filters_and_pages() {
    let app = TestApp::spawn().await;

    let first = app.create_invoice("100.00").await;
    app.create_invoice("200.00").await;
    app.create_invoice("300.00").await;

    let sent_id = Uuid::parse_str(first["invoice_id"].as_str().unwrap()).unwrap();
    app.api
        .post(format!("{}/invoices/{}/sent", app.address, sent_id))
        .header("X-Tenant-ID", TEST_TENANT_ID)
        .send()
        .await
        .expect("Failed to record sent");

    // Status filter
    let body: serde_json::Value = app
        .api
        .get(format!("{}/invoices?status=draft", app.address))
        .header("X-Tenant-ID", TEST_TENANT_ID)
        .send()
        .await
        .expect("Failed to list")
        .json()
        .await
        .expect("Failed to parse JSON");
    assert_eq!(body["invoices"].as_array().unwrap().len(), 2);

    // Cursor paging walks the full set without repeats
    let mut seen = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let url = match &token {
            Some(token) => format!("{}/invoices?page_size=2&page_token={}", app.address, token),
            None => format!("{}/invoices?page_size=2", app.address),
        };
        let page: serde_json::Value = app
            .api
            .get(url)
            .header("X-Tenant-ID", TEST_TENANT_ID)
            .send()
            .await
            .expect("Failed to list")
            .json()
            .await
            .expect("Failed to parse JSON");
        for invoice in page["invoices"].as_array().unwrap() {
            seen.push(invoice["invoice_id"].as_str().unwrap().to_string());
        }
        match page["next_page_token"].as_str() {
            Some(next) => token = Some(next.to_string()),
            None => break,
        }
    }
    assert_eq!(seen.len(), 3);
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 3);

    app.cleanup().await;
}
