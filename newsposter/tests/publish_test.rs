use std::time::Duration;

use mockito::Matcher;
use newsposter::publish::instagram::InstagramTarget;
use newsposter::publish::telegram::TelegramTarget;
use newsposter::publish::{PostPayload, PublishTarget};
use newsposter::retry::RetryPolicy;

const TG_OK: &str = r#"{"ok":true,"result":{"message_id":1}}"#;

fn payload(caption: String) -> PostPayload {
    PostPayload {
        caption,
        image_url: "https://iili.io/cover.jpg".into(),
        image_bytes: vec![0xff, 0xd8, 0xff, 0xe0],
        filename: "pexels-1.jpg".into(),
    }
}

#[tokio::test]
async fn telegram_short_caption_is_a_single_photo() {
    let mut server = mockito::Server::new_async().await;
    let photo = server
        .mock("POST", "/botTEST/sendPhoto")
        .with_status(200)
        .with_body(TG_OK)
        .expect(1)
        .create_async()
        .await;
    let message = server
        .mock("POST", "/botTEST/sendMessage")
        .expect(0)
        .create_async()
        .await;

    let target = TelegramTarget::new(server.url(), "TEST", "@finance_digest", 5, RetryPolicy::once()).unwrap();
    target.create_post(&payload("Рынки растут".into())).await.unwrap();

    photo.assert_async().await;
    message.assert_async().await;
}

#[tokio::test]
async fn telegram_long_caption_sends_the_remainder() {
    let mut server = mockito::Server::new_async().await;
    let photo = server
        .mock("POST", "/botTEST/sendPhoto")
        .with_status(200)
        .with_body(TG_OK)
        .create_async()
        .await;
    let message = server
        .mock("POST", "/botTEST/sendMessage")
        .match_body(Matcher::PartialJsonString(
            r#"{"chat_id": "@finance_digest", "parse_mode": "HTML"}"#.to_string(),
        ))
        .with_status(200)
        .with_body(TG_OK)
        .expect(1)
        .create_async()
        .await;

    let caption = format!("{}\n{}", "а".repeat(900), "б".repeat(900));
    let target = TelegramTarget::new(server.url(), "TEST", "@finance_digest", 5, RetryPolicy::once()).unwrap();
    target.create_post(&payload(caption)).await.unwrap();

    photo.assert_async().await;
    message.assert_async().await;
}

#[tokio::test]
async fn telegram_rejected_token_is_not_retried() {
    let mut server = mockito::Server::new_async().await;
    let photo = server
        .mock("POST", "/botBAD/sendPhoto")
        .with_status(401)
        .with_body(r#"{"ok":false,"error_code":401,"description":"Unauthorized"}"#)
        .expect(1)
        .create_async()
        .await;

    let target = TelegramTarget::new(
        server.url(),
        "BAD",
        "@finance_digest",
        5,
        RetryPolicy::new(3, Duration::ZERO),
    )
    .unwrap();
    let err = target.create_post(&payload("x".into())).await.unwrap_err();
    assert!(err.is_unauthorized());
    photo.assert_async().await;
}

#[tokio::test]
async fn telegram_server_errors_are_retried() {
    let mut server = mockito::Server::new_async().await;
    let photo = server
        .mock("POST", "/botTEST/sendPhoto")
        .with_status(502)
        .expect(2)
        .create_async()
        .await;

    let target = TelegramTarget::new(
        server.url(),
        "TEST",
        "@finance_digest",
        5,
        RetryPolicy::new(2, Duration::ZERO),
    )
    .unwrap();
    let err = target.create_post(&payload("x".into())).await.unwrap_err();
    assert!(err.is_retryable());
    photo.assert_async().await;
}

#[tokio::test]
async fn instagram_creates_then_publishes_container() {
    let mut server = mockito::Server::new_async().await;
    let create = server
        .mock("POST", "/17841/media")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("image_url".into(), "https://iili.io/cover.jpg".into()),
            Matcher::UrlEncoded("access_token".into(), "ig-token".into()),
        ]))
        .with_status(200)
        .with_body(r#"{"id":"container-1"}"#)
        .expect(1)
        .create_async()
        .await;
    let publish = server
        .mock("POST", "/17841/media_publish")
        .match_body(Matcher::UrlEncoded("creation_id".into(), "container-1".into()))
        .with_status(200)
        .with_body(r#"{"id":"media-9"}"#)
        .expect(1)
        .create_async()
        .await;

    let target = InstagramTarget::new(server.url(), "17841", "ig-token", 5, RetryPolicy::once())
        .unwrap()
        .with_publish_delay(Duration::ZERO);
    target.create_post(&payload("Рынки растут".into())).await.unwrap();

    create.assert_async().await;
    publish.assert_async().await;
}

#[tokio::test]
async fn instagram_expired_token_fails_fast() {
    let mut server = mockito::Server::new_async().await;
    let create = server
        .mock("POST", "/17841/media")
        .with_status(400)
        .with_body(
            r#"{"error":{"message":"Error validating access token: Session has expired","type":"OAuthException","code":190}}"#,
        )
        .expect(1)
        .create_async()
        .await;
    let publish = server
        .mock("POST", "/17841/media_publish")
        .expect(0)
        .create_async()
        .await;

    let target = InstagramTarget::new(
        server.url(),
        "17841",
        "expired",
        5,
        RetryPolicy::new(3, Duration::ZERO),
    )
    .unwrap()
    .with_publish_delay(Duration::ZERO);
    let err = target.create_post(&payload("x".into())).await.unwrap_err();
    assert!(err.is_unauthorized());

    create.assert_async().await;
    publish.assert_async().await;
}
