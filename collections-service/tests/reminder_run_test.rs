//! Reminder run integration tests: rule evaluation, claim/send/finalize and
//! the run ledger, driven through the manual run endpoint.

mod common;

use common::{TestApp, TEST_TENANT_ID};
use uuid::Uuid;

/// Move an invoice's send timestamp into the past so day-window rules match.
async fn backdate_sent(app: &TestApp, invoice_id: Uuid, days: i32) {
    sqlx::query(&format!(
        "UPDATE invoices SET sent_utc = NOW() - INTERVAL '{} days' WHERE invoice_id = $1",
        days
    ))
    .bind(invoice_id)
    .execute(app.db.pool())
    .await
    .unwrap();
}

async fn open_pixel(app: &TestApp, notification_id: Uuid) {
    let response = app
        .api
        .get(format!("{}/t/open/{}", app.address, notification_id))
        .send()
        .await
        .expect("Failed to fire tracking pixel");
    assert_eq!(reqwest::StatusCode::OK, response.status());
}

async fn dispatch_rows(app: &TestApp, invoice_id: Uuid) -> Vec<(String, String, i32)> {
    sqlx::query_as::<_, (String, String, i32)>(
        "SELECT reminder_type, status, reminder_sequence FROM reminder_dispatches \
         WHERE invoice_id = $1 ORDER BY claimed_utc",
    )
    .bind(invoice_id)
    .fetch_all(app.db.pool())
    .await
    .unwrap()
}

#[tokio::test]
async fn unopened_invoice_gets_the_week_one_reminder() {
    let app = TestApp::spawn().await;

    let seed = app.seed_default_rules().await;
    assert_eq!(seed["seeded"].as_array().unwrap().len(), 3);
    assert!(seed["skipped"].as_array().unwrap().is_empty());

    let (invoice_id, _) = app.create_sent_invoice("100.00").await;
    backdate_sent(&app, invoice_id, 8).await;

    let run = app.run_reminders().await;
    assert_eq!(run["status"], "completed");
    assert_eq!(run["run_type"], "manual");
    assert_eq!(run["rules_evaluated"], 3);
    assert_eq!(run["invoices_matched"], 1);
    assert_eq!(run["dispatches_sent"], 1);
    assert_eq!(run["send_failures"], 0);

    let letters = app.sender.sent_requests();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].template, "reminder_no_open");
    assert_eq!(letters[0].recipient, "client@example.com");
    assert!(letters[0].notification_id.is_some());

    assert_eq!(
        dispatch_rows(&app, invoice_id).await,
        vec![("no_open".to_string(), "sent".to_string(), 1)]
    );

    let (count, last): (i32, Option<chrono::DateTime<chrono::Utc>>) = sqlx::query_as(
        "SELECT reminder_count, last_reminder_utc FROM invoices WHERE invoice_id = $1",
    )
    .bind(invoice_id)
    .fetch_one(app.db.pool())
    .await
    .unwrap();
    assert_eq!(count, 1);
    assert!(last.is_some());

    app.cleanup().await;
}

#[tokio::test]
async fn cooldown_suppresses_an_immediate_second_reminder() {
    let app = TestApp::spawn().await;
    app.seed_default_rules().await;
    let (invoice_id, _) = app.create_sent_invoice("100.00").await;
    backdate_sent(&app, invoice_id, 8).await;

    let first = app.run_reminders().await;
    assert_eq!(first["dispatches_sent"], 1);

    let second = app.run_reminders().await;
    assert_eq!(second["status"], "completed");
    assert_eq!(second["invoices_matched"], 0);
    assert_eq!(second["dispatches_sent"], 0);

    assert_eq!(1, app.sender.send_count());

    app.cleanup().await;
}

#[tokio::test]
async fn opened_invoice_graduates_to_the_selection_reminder() {
    let app = TestApp::spawn().await;
    app.seed_default_rules().await;
    let (invoice_id, notification_id) = app.create_sent_invoice("100.00").await;

    open_pixel(&app, notification_id).await;
    backdate_sent(&app, invoice_id, 15).await;

    let run = app.run_reminders().await;
    assert_eq!(run["dispatches_sent"], 1);

    let letters = app.sender.sent_requests();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].template, "reminder_no_selection");

    app.cleanup().await;
}

#[tokio::test]
async fn method_selection_suppresses_the_selection_reminder() {
    let app = TestApp::spawn().await;
    app.seed_default_rules().await;
    let (invoice_id, notification_id) = app.create_sent_invoice("100.00").await;

    open_pixel(&app, notification_id).await;
    let response = app
        .api
        .post(format!("{}/t/select/{}", app.address, invoice_id))
        .json(&serde_json::json!({"method": "card_single"}))
        .send()
        .await
        .expect("Failed to select method");
    assert_eq!(reqwest::StatusCode::OK, response.status());

    backdate_sent(&app, invoice_id, 15).await;

    let run = app.run_reminders().await;
    assert_eq!(run["status"], "completed");
    assert_eq!(run["dispatches_sent"], 0);
    assert_eq!(0, app.sender.send_count());

    app.cleanup().await;
}

#[tokio::test]
async fn settled_invoices_never_match() {
    let app = TestApp::spawn().await;
    app.seed_default_rules().await;
    let (invoice_id, _) = app.create_sent_invoice("100.00").await;
    backdate_sent(&app, invoice_id, 40).await;
    sqlx::query("UPDATE invoices SET status = 'paid', amount_paid = total_amount WHERE invoice_id = $1")
        .bind(invoice_id)
        .execute(app.db.pool())
        .await
        .unwrap();

    let run = app.run_reminders().await;
    assert_eq!(run["invoices_matched"], 0);
    assert_eq!(run["dispatches_sent"], 0);

    app.cleanup().await;
}

#[tokio::test]
async fn a_pending_dispute_pauses_reminders_until_resolved() {
    let app = TestApp::spawn().await;
    app.seed_default_rules().await;
    let (invoice_id, _) = app.create_sent_invoice("100.00").await;
    backdate_sent(&app, invoice_id, 8).await;

    let dispute: serde_json::Value = app
        .api
        .post(format!("{}/disputes", app.address))
        .json(&serde_json::json!({ "invoice_id": invoice_id, "comment": "Already paid" }))
        .send()
        .await
        .expect("Failed to submit dispute")
        .json()
        .await
        .unwrap();

    let held = app.run_reminders().await;
    assert_eq!(held["invoices_matched"], 0);
    assert_eq!(held["dispatches_sent"], 0);

    // A rejected claim puts the invoice straight back into the pipeline
    let response = app
        .api
        .post(format!(
            "{}/disputes/{}/resolve",
            app.address,
            dispute["dispute_id"].as_str().unwrap()
        ))
        .header("X-Tenant-ID", TEST_TENANT_ID)
        .json(&serde_json::json!({ "resolution": "resolved_unpaid" }))
        .send()
        .await
        .expect("Failed to resolve dispute");
    assert_eq!(reqwest::StatusCode::OK, response.status());

    let resumed = app.run_reminders().await;
    assert_eq!(resumed["dispatches_sent"], 1);

    app.cleanup().await;
}

#[tokio::test]
async fn a_failed_send_releases_the_claim_for_the_next_run() {
    let app = TestApp::spawn().await;
    app.seed_default_rules().await;
    let (invoice_id, _) = app.create_sent_invoice("100.00").await;
    backdate_sent(&app, invoice_id, 8).await;

    app.sender.set_failing(true);
    let failed = app.run_reminders().await;
    assert_eq!(failed["status"], "completed");
    assert_eq!(failed["invoices_matched"], 1);
    assert_eq!(failed["dispatches_sent"], 0);
    assert_eq!(failed["send_failures"], 1);

    // The released claim leaves no trace and no counter bump
    assert!(dispatch_rows(&app, invoice_id).await.is_empty());
    let count: i32 = sqlx::query_scalar("SELECT reminder_count FROM invoices WHERE invoice_id = $1")
        .bind(invoice_id)
        .fetch_one(app.db.pool())
        .await
        .unwrap();
    assert_eq!(count, 0);

    app.sender.set_failing(false);
    let retried = app.run_reminders().await;
    assert_eq!(retried["dispatches_sent"], 1);
    assert_eq!(retried["send_failures"], 0);

    assert_eq!(
        dispatch_rows(&app, invoice_id).await,
        vec![("no_open".to_string(), "sent".to_string(), 1)]
    );

    app.cleanup().await;
}

#[tokio::test]
async fn a_month_old_invoice_gets_both_applicable_reminders() {
    let app = TestApp::spawn().await;
    app.seed_default_rules().await;
    let (invoice_id, _) = app.create_sent_invoice("100.00").await;
    backdate_sent(&app, invoice_id, 31).await;

    let run = app.run_reminders().await;
    assert_eq!(run["dispatches_sent"], 2);

    // Priority order: the week-one rule fires before the overdue rule
    let templates: Vec<String> = app
        .sender
        .sent_requests()
        .iter()
        .map(|l| l.template.clone())
        .collect();
    assert_eq!(templates, vec!["reminder_no_open", "reminder_payment_overdue"]);

    let count: i32 = sqlx::query_scalar("SELECT reminder_count FROM invoices WHERE invoice_id = $1")
        .bind(invoice_id)
        .fetch_one(app.db.pool())
        .await
        .unwrap();
    assert_eq!(count, 2);

    app.cleanup().await;
}

#[tokio::test]
async fn partial_payment_keeps_the_overdue_reminder_active() {
    let app = TestApp::spawn().await;
    app.seed_default_rules().await;
    let (invoice_id, _) = app.create_sent_invoice("100.00").await;
    backdate_sent(&app, invoice_id, 31).await;
    sqlx::query("UPDATE invoices SET status = 'partial_paid', amount_paid = 30.00 WHERE invoice_id = $1")
        .bind(invoice_id)
        .execute(app.db.pool())
        .await
        .unwrap();

    let run = app.run_reminders().await;
    assert_eq!(run["dispatches_sent"], 1);

    let letters = app.sender.sent_requests();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].template, "reminder_payment_overdue");
    // The letter carries the remaining balance, not the face value
    assert_eq!(letters[0].amount_due.to_string(), "70.00");

    app.cleanup().await;
}

#[tokio::test]
async fn run_without_rules_completes_empty() {
    let app = TestApp::spawn().await;

    let run = app.run_reminders().await;
    assert_eq!(run["status"], "completed");
    assert_eq!(run["rules_evaluated"], 0);
    assert_eq!(run["dispatches_sent"], 0);

    app.cleanup().await;
}

#[tokio::test]
async fn runs_land_in_the_ledger() {
    let app = TestApp::spawn().await;
    app.seed_default_rules().await;

    app.run_reminders().await;
    app.run_reminders().await;

    let listing: serde_json::Value = app
        .api
        .get(format!("{}/runs", app.address))
        .header("X-Tenant-ID", TEST_TENANT_ID)
        .send()
        .await
        .expect("Failed to list runs")
        .json()
        .await
        .unwrap();

    let runs = listing["runs"].as_array().unwrap();
    assert_eq!(runs.len(), 2);
    for run in runs {
        assert_eq!(run["run_type"], "manual");
        assert_eq!(run["status"], "completed");
        assert!(run["completed_utc"].is_string());
    }

    app.cleanup().await;
}
