//! Webhook reconciliation integration tests for collections-service.

mod common;

use common::{TestApp, TEST_TENANT_ID};
use reqwest::StatusCode;
use uuid::Uuid;

const TERMINAL: &str = "TERM-1";
const SECRET: &str = "terminal_secret_0123";

/// Provision terminal + sent invoice + registered transaction in one go.
/// Returns the invoice id.
async fn setup_registered_payment(app: &TestApp, total: &str, transaction_id: &str) -> Uuid {
    app.create_gateway_account(TERMINAL, SECRET).await;
    let (invoice_id, _) = app.create_sent_invoice(total).await;

    let response = app
        .api
        .post(format!("{}/t/payment-started/{}", app.address, invoice_id))
        .json(&serde_json::json!({ "transaction_id": transaction_id }))
        .send()
        .await
        .expect("Failed to register payment");
    assert_eq!(StatusCode::OK, response.status());

    invoice_id
}

async fn invoice_state(app: &TestApp, invoice_id: Uuid) -> (String, String) {
    sqlx::query_as::<_, (String, rust_decimal::Decimal)>(
        "SELECT status, amount_paid FROM invoices WHERE invoice_id = $1",
    )
    .bind(invoice_id)
    .fetch_one(app.db.pool())
    .await
    .map(|(status, paid)| (status, paid.to_string()))
    .unwrap()
}

async fn audit_outcomes(app: &TestApp) -> Vec<String> {
    sqlx::query_scalar::<_, String>(
        "SELECT outcome FROM webhook_audit ORDER BY received_utc, audit_id",
    )
    .fetch_all(app.db.pool())
    .await
    .unwrap()
}

#[tokio::test]
async fn successful_delivery_settles_the_invoice() {
    let app = TestApp::spawn().await;
    let invoice_id = setup_registered_payment(&app, "100.00", "tx-1").await;

    let body = format!(
        "terminal_id={}&transaction_id=tx-1&response_code=0&amount=100.00",
        TERMINAL
    );
    let response = app.deliver_webhook(&body, SECRET).await;

    assert_eq!(StatusCode::OK, response.status());
    assert_eq!("OK", response.text().await.unwrap());

    let (status, paid) = invoice_state(&app, invoice_id).await;
    assert_eq!(status, "paid");
    assert_eq!(paid, "100.00");

    let tx_status: String =
        sqlx::query_scalar("SELECT status FROM gateway_transactions WHERE transaction_id = $1")
            .bind("tx-1")
            .fetch_one(app.db.pool())
            .await
            .unwrap();
    assert_eq!(tx_status, "completed");

    assert_eq!(audit_outcomes(&app).await, vec!["applied"]);

    app.cleanup().await;
}

#[tokio::test]
async fn discounted_settlement_leaves_partial_paid() {
    let app = TestApp::spawn().await;
    app.create_gateway_account(TERMINAL, SECRET).await;
    let (invoice_id, _) = app.create_sent_invoice("100.00").await;

    // Selecting bank transfer charges 91.00; the invoice total stays 100.00
    app.api
        .post(format!("{}/t/select/{}", app.address, invoice_id))
        .json(&serde_json::json!({"method": "bank_transfer"}))
        .send()
        .await
        .expect("Failed to select method");
    app.api
        .post(format!("{}/t/payment-started/{}", app.address, invoice_id))
        .json(&serde_json::json!({ "transaction_id": "tx-2" }))
        .send()
        .await
        .expect("Failed to register payment");

    let body = format!(
        "terminal_id={}&transaction_id=tx-2&response_code=0&amount=91.00",
        TERMINAL
    );
    app.deliver_webhook(&body, SECRET).await;

    let (status, paid) = invoice_state(&app, invoice_id).await;
    assert_eq!(status, "partial_paid");
    assert_eq!(paid, "91.00");

    // The discounted payment still closes out the selection
    let completed: bool =
        sqlx::query_scalar("SELECT completed_payment FROM method_selections WHERE invoice_id = $1")
            .bind(invoice_id)
            .fetch_one(app.db.pool())
            .await
            .unwrap();
    assert!(completed);

    app.cleanup().await;
}

#[tokio::test]
async fn duplicate_delivery_applies_exactly_once() {
    let app = TestApp::spawn().await;
    let invoice_id = setup_registered_payment(&app, "100.00", "tx-3").await;

    let body = format!(
        "terminal_id={}&transaction_id=tx-3&response_code=0&amount=100.00",
        TERMINAL
    );
    for _ in 0..2 {
        let response = app.deliver_webhook(&body, SECRET).await;
        assert_eq!(StatusCode::OK, response.status());
        assert_eq!("OK", response.text().await.unwrap());
    }

    let (status, paid) = invoice_state(&app, invoice_id).await;
    assert_eq!(status, "paid");
    assert_eq!(paid, "100.00");

    assert_eq!(audit_outcomes(&app).await, vec!["applied", "duplicate"]);

    app.cleanup().await;
}

#[tokio::test]
async fn bad_signature_is_audited_and_never_applied() {
    let app = TestApp::spawn().await;
    let invoice_id = setup_registered_payment(&app, "100.00", "tx-4").await;

    let body = format!(
        "terminal_id={}&transaction_id=tx-4&response_code=0&amount=100.00",
        TERMINAL
    );
    let response = app.deliver_webhook(&body, "wrong_secret_000000").await;

    // The processor still gets the fixed acknowledgement
    assert_eq!(StatusCode::OK, response.status());
    assert_eq!("OK", response.text().await.unwrap());

    let (status, paid) = invoice_state(&app, invoice_id).await;
    assert_eq!(status, "sent");
    assert_eq!(paid, "0.00");

    let (outcome, signature_valid): (String, Option<bool>) = sqlx::query_as(
        "SELECT outcome, signature_valid FROM webhook_audit ORDER BY received_utc DESC LIMIT 1",
    )
    .fetch_one(app.db.pool())
    .await
    .unwrap();
    assert_eq!(outcome, "bad_signature");
    assert_eq!(signature_valid, Some(false));

    app.cleanup().await;
}

#[tokio::test]
async fn missing_signature_header_is_rejected() {
    let app = TestApp::spawn().await;
    let invoice_id = setup_registered_payment(&app, "100.00", "tx-5").await;

    let body = format!(
        "terminal_id={}&transaction_id=tx-5&response_code=0&amount=100.00",
        TERMINAL
    );
    let response = app
        .api
        .post(format!("{}/webhooks/processor", app.address))
        .header("content-type", "application/x-www-form-urlencoded")
        .body(body)
        .send()
        .await
        .expect("Failed to deliver webhook");

    assert_eq!(StatusCode::OK, response.status());
    assert_eq!("OK", response.text().await.unwrap());

    let (status, _) = invoice_state(&app, invoice_id).await;
    assert_eq!(status, "sent");
    assert!(audit_outcomes(&app).await.contains(&"bad_signature".to_string()));

    app.cleanup().await;
}

#[tokio::test]
async fn unknown_terminal_is_audited() {
    let app = TestApp::spawn().await;

    let body = "terminal_id=NOBODY&transaction_id=tx-6&response_code=0&amount=50.00";
    let response = app.deliver_webhook(body, SECRET).await;

    assert_eq!(StatusCode::OK, response.status());
    assert_eq!("OK", response.text().await.unwrap());
    assert_eq!(audit_outcomes(&app).await, vec!["unknown_terminal"]);

    app.cleanup().await;
}

#[tokio::test]
async fn malformed_payload_keeps_the_raw_body() {
    let app = TestApp::spawn().await;

    let body = "amount=not-a-number&noise=1";
    let response = app.deliver_webhook(body, SECRET).await;

    assert_eq!(StatusCode::OK, response.status());
    assert_eq!("OK", response.text().await.unwrap());

    let (outcome, raw_payload): (String, String) =
        sqlx::query_as("SELECT outcome, raw_payload FROM webhook_audit LIMIT 1")
            .fetch_one(app.db.pool())
            .await
            .unwrap();
    assert_eq!(outcome, "malformed");
    assert_eq!(raw_payload, body);

    app.cleanup().await;
}

#[tokio::test]
async fn failure_code_settles_transaction_without_touching_invoice() {
    let app = TestApp::spawn().await;
    let invoice_id = setup_registered_payment(&app, "100.00", "tx-7").await;

    let body = format!(
        "terminal_id={}&transaction_id=tx-7&response_code=05&amount=100.00",
        TERMINAL
    );
    app.deliver_webhook(&body, SECRET).await;

    let (status, paid) = invoice_state(&app, invoice_id).await;
    assert_eq!(status, "sent");
    assert_eq!(paid, "0.00");

    let (tx_status, response_code): (String, Option<String>) = sqlx::query_as(
        "SELECT status, response_code FROM gateway_transactions WHERE transaction_id = $1",
    )
    .bind("tx-7")
    .fetch_one(app.db.pool())
    .await
    .unwrap();
    assert_eq!(tx_status, "failed");
    assert_eq!(response_code.as_deref(), Some("05"));

    assert_eq!(audit_outcomes(&app).await, vec!["failure_logged"]);

    app.cleanup().await;
}

#[tokio::test]
async fn late_failure_never_downgrades_a_settled_transaction() {
    let app = TestApp::spawn().await;
    let invoice_id = setup_registered_payment(&app, "100.00", "tx-8").await;

    let success = format!(
        "terminal_id={}&transaction_id=tx-8&response_code=0&amount=100.00",
        TERMINAL
    );
    app.deliver_webhook(&success, SECRET).await;

    let failure = format!(
        "terminal_id={}&transaction_id=tx-8&response_code=91&amount=100.00",
        TERMINAL
    );
    app.deliver_webhook(&failure, SECRET).await;

    let (status, paid) = invoice_state(&app, invoice_id).await;
    assert_eq!(status, "paid");
    assert_eq!(paid, "100.00");

    let tx_status: String =
        sqlx::query_scalar("SELECT status FROM gateway_transactions WHERE transaction_id = $1")
            .bind("tx-8")
            .fetch_one(app.db.pool())
            .await
            .unwrap();
    assert_eq!(tx_status, "completed");

    app.cleanup().await;
}

#[tokio::test]
async fn success_for_unregistered_transaction_is_not_applied() {
    let app = TestApp::spawn().await;
    app.create_gateway_account(TERMINAL, SECRET).await;
    let (invoice_id, _) = app.create_sent_invoice("100.00").await;

    let body = format!(
        "terminal_id={}&transaction_id=tx-never-registered&response_code=0&amount=100.00",
        TERMINAL
    );
    let response = app.deliver_webhook(&body, SECRET).await;

    assert_eq!(StatusCode::OK, response.status());
    let (status, paid) = invoice_state(&app, invoice_id).await;
    assert_eq!(status, "sent");
    assert_eq!(paid, "0.00");
    assert_eq!(audit_outcomes(&app).await, vec!["unknown_transaction"]);

    app.cleanup().await;
}

#[tokio::test]
async fn webhook_audit_listing_filters_by_outcome() {
    let app = TestApp::spawn().await;
    setup_registered_payment(&app, "100.00", "tx-9").await;

    let body = format!(
        "terminal_id={}&transaction_id=tx-9&response_code=0&amount=100.00",
        TERMINAL
    );
    app.deliver_webhook(&body, SECRET).await;
    app.deliver_webhook(&body, SECRET).await;

    let listing: serde_json::Value = app
        .api
        .get(format!("{}/webhook-audit?outcome=duplicate", app.address))
        .header("X-Tenant-ID", TEST_TENANT_ID)
        .send()
        .await
        .expect("Failed to list audit")
        .json()
        .await
        .expect("Failed to parse JSON");

    let deliveries = listing["deliveries"].as_array().unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0]["outcome"], "duplicate");
    assert_eq!(deliveries[0]["transaction_id"], "tx-9");

    app.cleanup().await;
}
