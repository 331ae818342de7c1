//! Tracking pixel integration tests for collections-service.

mod common;

use common::TestApp;
use reqwest::StatusCode;
use uuid::Uuid;

#[tokio::test]
async fn open_pixel_returns_gif_and_counts_opens() {
    let app = TestApp::spawn().await;
    let (_, notification_id) = app.create_sent_invoice("120.00").await;

    let response = app
        .api
        .get(format!("{}/t/open/{}", app.address, notification_id))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(StatusCode::OK, response.status());
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    assert_eq!("image/gif", content_type);
    let body = response.bytes().await.expect("Failed to read body");
    assert_eq!(&body[..6], b"GIF89a");

    let (open_count, opened_utc): (i32, Option<chrono::DateTime<chrono::Utc>>) =
        sqlx::query_as("SELECT open_count, opened_utc FROM notifications WHERE notification_id = $1")
            .bind(notification_id)
            .fetch_one(app.db.pool())
            .await
            .unwrap();
    assert_eq!(open_count, 1);
    assert!(opened_utc.is_some());

    app.cleanup().await;
}

#[tokio::test]
async fn repeat_opens_increment_count_but_keep_first_timestamp() {
    let app = TestApp::spawn().await;
    let (_, notification_id) = app.create_sent_invoice("120.00").await;

    for _ in 0..3 {
        app.api
            .get(format!("{}/t/open/{}", app.address, notification_id))
            .send()
            .await
            .expect("Failed to fire pixel");
    }

    let (open_count, opened_utc, last_opened_utc): (
        i32,
        chrono::DateTime<chrono::Utc>,
        chrono::DateTime<chrono::Utc>,
    ) = sqlx::query_as(
        "SELECT open_count, opened_utc, last_opened_utc FROM notifications WHERE notification_id = $1",
    )
    .bind(notification_id)
    .fetch_one(app.db.pool())
    .await
    .unwrap();

    assert_eq!(open_count, 3);
    assert!(opened_utc <= last_opened_utc);

    app.cleanup().await;
}

#[tokio::test]
async fn unknown_pixel_id_still_returns_gif() {
    let app = TestApp::spawn().await;

    let response = app
        .api
        .get(format!("{}/t/open/{}", app.address, Uuid::new_v4()))
        .send()
        .await
        .expect("Failed to execute request");

    // No oracle for probers: unknown ids are indistinguishable from real ones
    assert_eq!(StatusCode::OK, response.status());
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    assert_eq!("image/gif", content_type);

    app.cleanup().await;
}
