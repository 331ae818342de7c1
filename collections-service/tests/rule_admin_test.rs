//! Reminder rule administration integration tests.

mod common;

use common::{TestApp, TEST_TENANT_ID};
use reqwest::StatusCode;
use uuid::Uuid;

async fn post_rule(app: &TestApp, body: serde_json::Value) -> reqwest::Response {
    app.api
        .post(format!("{}/rules", app.address))
        .header("X-Tenant-ID", TEST_TENANT_ID)
        .json(&body)
        .send()
        .await
        .expect("Failed to create rule")
}

/// A well-formed rule body the condition tests mutate.
fn nudge_rule(days: i64) -> serde_json::Value {
    serde_json::json!({
        "name": "Gentle nudge",
        "reminder_type": "nudge",
        "trigger_conditions": [
            { "kind": "days_since_sent", "days": days },
            { "kind": "status_in", "statuses": ["sent"] }
        ],
        "action": { "kind": "email", "template": "reminder_nudge" },
        "priority": 15
    })
}

#[tokio::test]
async fn create_rule_works() {
    let app = TestApp::spawn().await;

    let response = post_rule(&app, nudge_rule(5)).await;

    assert_eq!(StatusCode::CREATED, response.status());
    let rule: serde_json::Value = response.json().await.unwrap();
    assert_eq!(rule["name"], "Gentle nudge");
    assert_eq!(rule["reminder_type"], "nudge");
    assert_eq!(rule["priority"], 15);
    assert_eq!(rule["is_active"], true);
    assert!(rule["cooldown_days"].is_null());
    assert_eq!(rule["trigger_conditions"][0]["kind"], "days_since_sent");
    assert_eq!(rule["action"]["template"], "reminder_nudge");

    app.cleanup().await;
}

#[tokio::test]
async fn duplicate_rule_name_conflicts() {
    let app = TestApp::spawn().await;

    assert_eq!(StatusCode::CREATED, post_rule(&app, nudge_rule(5)).await.status());
    assert_eq!(StatusCode::CONFLICT, post_rule(&app, nudge_rule(9)).await.status());

    app.cleanup().await;
}

#[tokio::test]
async fn rule_without_a_day_window_is_rejected() {
    let app = TestApp::spawn().await;

    let mut body = nudge_rule(5);
    body["trigger_conditions"] = serde_json::json!([
        { "kind": "status_in", "statuses": ["sent"] }
    ]);

    assert_eq!(StatusCode::BAD_REQUEST, post_rule(&app, body).await.status());

    app.cleanup().await;
}

#[tokio::test]
async fn rule_without_statuses_is_rejected() {
    let app = TestApp::spawn().await;

    let mut body = nudge_rule(5);
    body["trigger_conditions"] = serde_json::json!([
        { "kind": "days_since_sent", "days": 5 }
    ]);

    assert_eq!(StatusCode::BAD_REQUEST, post_rule(&app, body).await.status());

    app.cleanup().await;
}

#[tokio::test]
async fn duplicate_conditions_are_rejected() {
    let app = TestApp::spawn().await;

    let mut body = nudge_rule(5);
    body["trigger_conditions"] = serde_json::json!([
        { "kind": "days_since_sent", "days": 5 },
        { "kind": "days_since_sent", "days": 10 },
        { "kind": "status_in", "statuses": ["sent"] }
    ]);

    assert_eq!(StatusCode::BAD_REQUEST, post_rule(&app, body).await.status());

    app.cleanup().await;
}

#[tokio::test]
async fn negative_day_window_is_rejected() {
    let app = TestApp::spawn().await;

    assert_eq!(
        StatusCode::BAD_REQUEST,
        post_rule(&app, nudge_rule(-1)).await.status()
    );

    app.cleanup().await;
}

#[tokio::test]
async fn empty_status_list_is_rejected() {
    let app = TestApp::spawn().await;

    let mut body = nudge_rule(5);
    body["trigger_conditions"] = serde_json::json!([
        { "kind": "days_since_sent", "days": 5 },
        { "kind": "status_in", "statuses": [] }
    ]);

    assert_eq!(StatusCode::BAD_REQUEST, post_rule(&app, body).await.status());

    app.cleanup().await;
}

#[tokio::test]
async fn update_rule_keeps_absent_fields() {
    let app = TestApp::spawn().await;
    let rule: serde_json::Value = post_rule(&app, nudge_rule(5)).await.json().await.unwrap();
    let rule_id = rule["rule_id"].as_str().unwrap();

    let response = app
        .api
        .put(format!("{}/rules/{}", app.address, rule_id))
        .header("X-Tenant-ID", TEST_TENANT_ID)
        .json(&serde_json::json!({ "cooldown_days": 3 }))
        .send()
        .await
        .expect("Failed to update rule");

    assert_eq!(StatusCode::OK, response.status());
    let updated: serde_json::Value = response.json().await.unwrap();
    assert_eq!(updated["cooldown_days"], 3);
    assert_eq!(updated["name"], "Gentle nudge");
    assert_eq!(updated["priority"], 15);
    assert_eq!(updated["trigger_conditions"], rule["trigger_conditions"]);

    app.cleanup().await;
}

#[tokio::test]
async fn update_gates_new_conditions_through_the_compiler() {
    let app = TestApp::spawn().await;
    let rule: serde_json::Value = post_rule(&app, nudge_rule(5)).await.json().await.unwrap();
    let rule_id = rule["rule_id"].as_str().unwrap();

    let response = app
        .api
        .put(format!("{}/rules/{}", app.address, rule_id))
        .header("X-Tenant-ID", TEST_TENANT_ID)
        .json(&serde_json::json!({
            "trigger_conditions": [ { "kind": "days_since_sent", "days": -4 } ]
        }))
        .send()
        .await
        .expect("Failed to update rule");

    assert_eq!(StatusCode::BAD_REQUEST, response.status());

    // The stored predicate is untouched
    let rules: serde_json::Value = app
        .api
        .get(format!("{}/rules", app.address))
        .header("X-Tenant-ID", TEST_TENANT_ID)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(rules[0]["trigger_conditions"], rule["trigger_conditions"]);

    app.cleanup().await;
}

#[tokio::test]
async fn update_unknown_rule_is_not_found() {
    let app = TestApp::spawn().await;

    let response = app
        .api
        .put(format!("{}/rules/{}", app.address, Uuid::new_v4()))
        .header("X-Tenant-ID", TEST_TENANT_ID)
        .json(&serde_json::json!({ "priority": 1 }))
        .send()
        .await
        .expect("Failed to update rule");

    assert_eq!(StatusCode::NOT_FOUND, response.status());

    app.cleanup().await;
}

#[tokio::test]
async fn disabled_rule_stops_matching_but_stays_listed() {
    let app = TestApp::spawn().await;
    let rule: serde_json::Value = post_rule(&app, nudge_rule(5)).await.json().await.unwrap();
    let rule_id = rule["rule_id"].as_str().unwrap();

    let (invoice_id, _) = app.create_sent_invoice("100.00").await;
    sqlx::query("UPDATE invoices SET sent_utc = NOW() - INTERVAL '6 days' WHERE invoice_id = $1")
        .bind(invoice_id)
        .execute(app.db.pool())
        .await
        .unwrap();

    let response = app
        .api
        .post(format!("{}/rules/{}/disable", app.address, rule_id))
        .header("X-Tenant-ID", TEST_TENANT_ID)
        .send()
        .await
        .expect("Failed to disable rule");
    assert_eq!(StatusCode::OK, response.status());
    let disabled: serde_json::Value = response.json().await.unwrap();
    assert_eq!(disabled["is_active"], false);

    let run = app.run_reminders().await;
    assert_eq!(run["rules_evaluated"], 0);
    assert_eq!(run["dispatches_sent"], 0);

    let rules: serde_json::Value = app
        .api
        .get(format!("{}/rules", app.address))
        .header("X-Tenant-ID", TEST_TENANT_ID)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(rules.as_array().unwrap().len(), 1);
    assert_eq!(rules[0]["is_active"], false);

    app.cleanup().await;
}

#[tokio::test]
async fn log_only_rules_record_without_sending() {
    let app = TestApp::spawn().await;

    let body = serde_json::json!({
        "name": "Watchlist",
        "reminder_type": "watchlist",
        "trigger_conditions": [
            { "kind": "days_since_sent", "days": 3 },
            { "kind": "status_in", "statuses": ["sent"] }
        ],
        "action": { "kind": "log_only" }
    });
    assert_eq!(StatusCode::CREATED, post_rule(&app, body).await.status());

    let (invoice_id, _) = app.create_sent_invoice("100.00").await;
    sqlx::query("UPDATE invoices SET sent_utc = NOW() - INTERVAL '4 days' WHERE invoice_id = $1")
        .bind(invoice_id)
        .execute(app.db.pool())
        .await
        .unwrap();

    let run = app.run_reminders().await;
    assert_eq!(run["dispatches_sent"], 1);
    assert_eq!(0, app.sender.send_count());

    let (channel, status): (String, String) = sqlx::query_as(
        "SELECT channel, status FROM reminder_dispatches WHERE invoice_id = $1",
    )
    .bind(invoice_id)
    .fetch_one(app.db.pool())
    .await
    .unwrap();
    assert_eq!(channel, "log");
    assert_eq!(status, "sent");

    app.cleanup().await;
}

#[tokio::test]
async fn seeding_is_idempotent() {
    let app = TestApp::spawn().await;

    let first = app.seed_default_rules().await;
    assert_eq!(first["seeded"].as_array().unwrap().len(), 3);

    let second = app.seed_default_rules().await;
    assert!(second["seeded"].as_array().unwrap().is_empty());
    assert_eq!(second["skipped"].as_array().unwrap().len(), 3);

    app.cleanup().await;
}

#[tokio::test]
async fn a_customized_rule_blocks_its_default_on_seed() {
    let app = TestApp::spawn().await;

    let custom = serde_json::json!({
        "name": "Aggressive week one",
        "reminder_type": "no_open",
        "trigger_conditions": [
            { "kind": "days_since_sent", "days": 3 },
            { "kind": "status_in", "statuses": ["sent"] },
            { "kind": "opened", "value": false }
        ],
        "action": { "kind": "email", "template": "reminder_no_open" }
    });
    assert_eq!(StatusCode::CREATED, post_rule(&app, custom).await.status());

    let seed = app.seed_default_rules().await;
    assert_eq!(seed["seeded"].as_array().unwrap().len(), 2);
    assert_eq!(seed["skipped"], serde_json::json!(["no_open"]));

    app.cleanup().await;
}

#[tokio::test]
async fn rules_list_in_priority_order() {
    let app = TestApp::spawn().await;

    let late = serde_json::json!({
        "name": "Late escalation",
        "reminder_type": "escalation",
        "trigger_conditions": [
            { "kind": "days_since_sent", "days": 60 },
            { "kind": "status_in", "statuses": ["sent", "partial_paid"] }
        ],
        "action": { "kind": "email", "template": "reminder_escalation" },
        "priority": 90
    });
    post_rule(&app, late).await;
    post_rule(&app, nudge_rule(5)).await;

    let rules: serde_json::Value = app
        .api
        .get(format!("{}/rules", app.address))
        .header("X-Tenant-ID", TEST_TENANT_ID)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let names: Vec<&str> = rules
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["Gentle nudge", "Late escalation"]);

    app.cleanup().await;
}

#[tokio::test]
async fn rules_require_the_tenant_header() {
    let app = TestApp::spawn().await;

    let response = app
        .api
        .get(format!("{}/rules", app.address))
        .send()
        .await
        .expect("Failed to list rules");

    assert_eq!(StatusCode::UNAUTHORIZED, response.status());

    app.cleanup().await;
}
