use serde_json::json;

use captivate_service::caching::{LogicalId, OptionSet};
use captivate_service::remote::{PlayState, RemoteError};
use captivate_test::{ImageServer, decode_png, png_bytes, png_fixture};

use crate::utils::setup_session;

const RED: [u8; 4] = [255, 0, 0, 255];
const BLUE: [u8; 4] = [0, 0, 255, 255];

#[tokio::test]
async fn test_image_url_is_downloaded_once() {
    let (session, remote) = setup_session(|_| {}).await;
    let server = ImageServer::new();
    server.add("glow.png", png_bytes(144, 96, RED));

    remote.set_state("A1", "F1", json!({"imageUrl": server.url("glow.png")}));
    remote.set_state("A1", "F2", json!({"imageUrl": server.url("glow.png")}));

    let options = OptionSet::new();
    let first = session
        .resolve_feedback(&LogicalId::new("A1", "F1"), &options)
        .await;
    let second = session
        .resolve_feedback(&LogicalId::new("A1", "F2"), &options)
        .await;

    let image = decode_png(first.png64.as_deref().unwrap());
    assert_eq!(image.dimensions(), (72, 72));
    assert_eq!(image.get_pixel(36, 36).0, RED);
    assert_eq!(first.png64, second.png64);

    assert_eq!(server.hits("glow.png"), 1);
}

#[tokio::test]
async fn test_missing_image_leaves_payload_without_png() {
    let (session, remote) = setup_session(|_| {}).await;
    let server = ImageServer::new();

    remote.set_state(
        "A1",
        "F1",
        json!({"text": "Live", "imageUrl": server.url("missing.png")}),
    );

    let payload = session
        .resolve_feedback(&LogicalId::new("A1", "F1"), &OptionSet::new())
        .await;

    assert_eq!(payload.text, Some(json!("Live")));
    assert_eq!(payload.png64, None);
    assert_eq!(server.hits("missing.png"), 1);
    assert!(!session.images().contains(&server.url("missing.png")));
}

#[tokio::test]
async fn test_image64_fallback() {
    let (session, remote) = setup_session(|_| {}).await;
    let image64 = png_fixture(72, 72, BLUE);
    remote.set_state("A1", "F1", json!({"image64": image64}));

    let payload = session
        .resolve_feedback(&LogicalId::new("A1", "F1"), &OptionSet::new())
        .await;

    assert_eq!(payload.png64, Some(image64));
}

#[tokio::test]
async fn test_image_set_is_primed_on_connect() {
    captivate_test::setup();
    let remote = captivate_test::MockRemote::new();
    remote.add_image("glow", "cHJpbWVk");

    let session = captivate_service::feedback::FeedbackSession::connect(
        Default::default(),
        remote.clone(),
    )
    .await
    .unwrap();
    assert!(session.images().contains("glow"));

    remote.set_state("A1", "F1", json!({"imageName": "glow"}));
    let payload = session
        .resolve_feedback(&LogicalId::new("A1", "F1"), &OptionSet::new())
        .await;
    assert_eq!(payload.png64.as_deref(), Some("cHJpbWVk"));
}

#[tokio::test]
async fn test_image_set_failure_is_not_fatal() {
    captivate_test::setup();
    let remote = captivate_test::MockRemote::new();
    remote.fail_image_set(RemoteError::Disconnected);

    let session = captivate_service::feedback::FeedbackSession::connect(
        Default::default(),
        remote.clone(),
    )
    .await
    .unwrap();
    assert!(!session.images().contains("glow"));
}

#[tokio::test]
async fn test_running_overlay_is_composited() {
    let (session, remote) = setup_session(|_| {}).await;
    session.images().set_image("glow-running", png_fixture(72, 72, RED));
    remote.set_play_state("lower-third", PlayState::Running);

    remote.set_state(
        "A1",
        "F1",
        json!({
            "png64": png_fixture(72, 72, BLUE),
            "overlayQueryKey": "lower-third",
            "overlayImageName": "glow-idle",
            "overlayImageName_running": "glow-running",
            "overlayImageName_paused": "glow-paused",
        }),
    );

    let payload = session
        .resolve_feedback(&LogicalId::new("A1", "F1"), &OptionSet::new())
        .await;

    let image = decode_png(payload.png64.as_deref().unwrap());
    assert_eq!(image.dimensions(), (72, 72));
    assert_eq!(image.get_pixel(10, 10).0, RED);
    assert_eq!(remote.play_state_queries(), 1);
}

#[tokio::test]
async fn test_overlay_without_base_becomes_the_image() {
    let (session, remote) = setup_session(|_| {}).await;
    let overlay = png_fixture(72, 72, RED);
    session.images().set_image("glow-paused", overlay.clone());
    remote.set_play_state("lower-third", PlayState::Paused);

    remote.set_state(
        "A1",
        "F1",
        json!({
            "text": "Lower Third",
            "overlayQueryKey": "lower-third",
            "overlayImageName_paused": "glow-paused",
        }),
    );

    let payload = session
        .resolve_feedback(&LogicalId::new("A1", "F1"), &OptionSet::new())
        .await;

    assert_eq!(payload.png64, Some(overlay));
    assert_eq!(payload.text, Some(json!("Lower Third")));
}

#[tokio::test]
async fn test_unavailable_overlay_keeps_base() {
    let (session, remote) = setup_session(|_| {}).await;
    let base = png_fixture(72, 72, BLUE);

    // no play state for the layer, so the idle overlay is used, which does not exist
    remote.set_state(
        "A1",
        "F1",
        json!({
            "png64": base,
            "overlayQueryKey": "lower-third",
            "overlayImageName": "does-not-exist",
            "overlayImageName_running": "glow-running",
        }),
    );

    let payload = session
        .resolve_feedback(&LogicalId::new("A1", "F1"), &OptionSet::new())
        .await;

    assert_eq!(payload.png64, Some(base));
}
