//! HTTP letter sender tests against a mocked letter API.

use collections_service::services::{HttpLetterSender, LetterRequest, LetterSender, SenderError};
use rust_decimal::Decimal;
use secrecy::Secret;
use uuid::Uuid;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn letter() -> LetterRequest {
    LetterRequest {
        tenant_id: Uuid::new_v4(),
        invoice_id: Uuid::new_v4(),
        notification_id: Some(Uuid::new_v4()),
        recipient: "client@example.com".to_string(),
        template: "reminder_no_open".to_string(),
        amount_due: Decimal::new(9100, 2),
        currency: "EUR".to_string(),
    }
}

#[tokio::test]
async fn send_posts_the_letter_with_bearer_auth() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/letters"))
        .and(header("authorization", "Bearer letter_api_token"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "letter_id": "ltr-1" })),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let sender = HttpLetterSender::new(
        mock_server.uri(),
        Secret::new("letter_api_token".to_string()),
        true,
    );

    let receipt = sender.send(&letter()).await.expect("send failed");
    assert_eq!(receipt.letter_id.as_deref(), Some("ltr-1"));
}

#[tokio::test]
async fn api_error_status_fails_the_send() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/letters"))
        .respond_with(ResponseTemplate::new(503).set_body_string("letter queue full"))
        .mount(&mock_server)
        .await;

    let sender = HttpLetterSender::new(
        mock_server.uri(),
        Secret::new("letter_api_token".to_string()),
        true,
    );

    let err = sender.send(&letter()).await.unwrap_err();
    assert!(matches!(err, SenderError::SendFailed(_)));
}

#[tokio::test]
async fn disabled_sender_refuses_without_calling_out() {
    let sender = HttpLetterSender::new(
        "http://localhost:1".to_string(),
        Secret::new(String::new()),
        false,
    );

    let err = sender.send(&letter()).await.unwrap_err();
    assert!(matches!(err, SenderError::NotEnabled));
}

#[tokio::test]
async fn missing_base_url_is_a_configuration_error() {
    let sender = HttpLetterSender::new(String::new(), Secret::new(String::new()), true);

    let err = sender.send(&letter()).await.unwrap_err();
    assert!(matches!(err, SenderError::Configuration(_)));
}
