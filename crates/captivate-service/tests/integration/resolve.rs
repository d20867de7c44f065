use std::time::Duration;

use futures::future;
use serde_json::json;

use captivate_service::caching::{CacheKey, LogicalId, OptionSet, derive_key};
use captivate_service::feedback::DisplayPayload;
use captivate_service::remote::RemoteError;

use crate::utils::{options, record_batches, setup_session};

#[tokio::test]
async fn test_concurrent_resolves_query_once() {
    let (session, remote) = setup_session(|_| {}).await;
    remote.set_state("A1", "F1", json!({"text": "Live"}));
    remote.set_delay(Duration::from_millis(50));

    let logical_id = LogicalId::new("A1", "F1");
    let options = OptionSet::new();
    let lookups = (0..5).map(|_| session.resolve_feedback(&logical_id, &options));
    let payloads = future::join_all(lookups).await;

    assert_eq!(remote.query_count("A1", "F1"), 1);
    for payload in payloads {
        assert_eq!(payload.text, Some(json!("Live")));
    }
}

#[tokio::test]
async fn test_states_are_cached_for_their_ttl() {
    let (session, remote) = setup_session(|config| {
        config.caches.feedback_ttl = Duration::from_millis(250);
    })
    .await;
    remote.set_state("A1", "F1", json!({"text": "Live"}));

    let logical_id = LogicalId::new("A1", "F1");
    let options = OptionSet::new();

    session.resolve_feedback(&logical_id, &options).await;
    session.resolve_feedback(&logical_id, &options).await;
    assert_eq!(remote.query_count("A1", "F1"), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;

    remote.set_state("A1", "F1", json!({"text": "Off Air"}));
    let payload = session.resolve_feedback(&logical_id, &options).await;
    assert_eq!(payload.text, Some(json!("Off Air")));
    assert_eq!(remote.query_count("A1", "F1"), 2);
}

#[tokio::test]
async fn test_options_are_part_of_the_key() {
    let (session, remote) = setup_session(|_| {}).await;

    let logical_id = LogicalId::new("A1", "F1");
    let first = options(json!({"inputName": "Sheet 1"}));
    let second = options(json!({"inputName": "Sheet 2"}));

    session.resolve_feedback(&logical_id, &first).await;
    session.resolve_feedback(&logical_id, &second).await;
    session.resolve_feedback(&logical_id, &first).await;

    assert_eq!(remote.query_count("A1", "F1"), 2);
    assert_eq!(session.store().len(), 2);
}

#[tokio::test]
async fn test_failures_are_reconciled() {
    let (session, remote) = setup_session(|_| {}).await;
    let batches = record_batches(&session);
    remote.fail("A1", "F1", RemoteError::Transport("connection reset".into()));

    let logical_id = LogicalId::new("A1", "F1");
    let options = OptionSet::new();
    let key = derive_key(&logical_id, &options);

    let payload = session.resolve_feedback(&logical_id, &options).await;
    assert!(payload.is_empty());
    assert!(!session.store().contains(key.as_str()));
    assert!(session.reconciler().is_pending(&key));
    assert!(session.scheduler().is_scheduled("reconcile"));

    remote.set_state("A1", "F1", json!({"text": "Live"}));
    let resolved = session.reconcile().await;
    assert_eq!(resolved, vec![key.clone()]);
    assert_eq!(*batches.lock(), vec![vec![key.clone()]]);

    // served from the store filled by the pass
    let payload = session.resolve_feedback(&logical_id, &options).await;
    assert_eq!(payload.text, Some(json!("Live")));
    assert_eq!(remote.query_count("A1", "F1"), 2);

    session.shutdown();
}

#[tokio::test]
async fn test_malformed_replies_are_not_cached() {
    let (session, remote) = setup_session(|_| {}).await;
    remote.set_reply("A1", "F1", "[1, 2, 3]");

    let logical_id = LogicalId::new("A1", "F1");
    let payload = session
        .resolve_feedback(&logical_id, &OptionSet::new())
        .await;

    assert!(payload.is_empty());
    assert!(session.store().is_empty());
    assert!(session.reconciler().is_pending(&CacheKey::from("A1~F1")));

    session.shutdown();
}

#[tokio::test]
async fn test_empty_reply_is_an_empty_payload() {
    let (session, remote) = setup_session(|_| {}).await;

    let logical_id = LogicalId::new("A1", "F1");
    let payload = session
        .resolve_feedback(&logical_id, &OptionSet::new())
        .await;

    assert_eq!(payload, DisplayPayload::default());
    assert_eq!(remote.query_count("A1", "F1"), 1);
    // an empty state is a valid state
    assert!(session.store().contains("A1~F1"));
    assert!(!session.reconciler().is_pending(&CacheKey::from("A1~F1")));
}

#[tokio::test]
async fn test_boolean_feedbacks() {
    let (session, remote) = setup_session(|_| {}).await;
    remote.set_state("A1", "on", json!({"value": true}));
    remote.set_state("A1", "zero", json!({"value": 0}));
    remote.set_state("A1", "text", json!({"value": "yes"}));

    let options = OptionSet::new();
    let resolve = |feedback_id: &str| {
        let logical_id = LogicalId::new("A1", feedback_id);
        let session = session.clone();
        let options = options.clone();
        async move { session.resolve_boolean(&logical_id, &options).await }
    };

    assert!(resolve("on").await);
    assert!(!resolve("zero").await);
    assert!(resolve("text").await);
    assert!(!resolve("missing").await);
}

#[tokio::test]
async fn test_active_sheet_query_gets_input_name() {
    let (session, remote) = setup_session(|_| {}).await;

    let logical_id = LogicalId::new("A1", "csv.input-routed.activesheet");
    session
        .resolve_feedback(&logical_id, &OptionSet::new())
        .await;

    let queries = remote.queries();
    assert_eq!(queries.len(), 1);
    assert_eq!(
        queries[0].options,
        options(json!({"inputName": "Spreadsheet: _active_"}))
    );

    // the key is derived from the options as the surface sent them
    assert!(session.store().contains("A1~csv.input-routed.activesheet"));
}

#[tokio::test]
async fn test_invalidation() {
    let (session, remote) = setup_session(|_| {}).await;

    let options = OptionSet::new();
    for feedback_id in ["F1", "F2"] {
        session
            .resolve_feedback(&LogicalId::new("A1", feedback_id), &options)
            .await;
    }
    session
        .resolve_feedback(&LogicalId::new("A2", "F1"), &options)
        .await;
    assert_eq!(session.store().len(), 3);

    session.invalidate(&LogicalId::new("A2", "F1"), &options);
    assert!(!session.store().contains("A2~F1"));

    assert_eq!(session.invalidate_prefix("A1~"), 2);
    assert!(session.store().is_empty());

    session
        .resolve_feedback(&LogicalId::new("A1", "F1"), &options)
        .await;
    assert_eq!(remote.query_count("A1", "F1"), 2);
}

#[tokio::test]
async fn test_payload_whitelist() {
    let (session, remote) = setup_session(|_| {}).await;
    remote.set_state(
        "A1",
        "F1",
        json!({
            "text": "Lower Third",
            "size": "auto",
            "color": 16777215,
            "bgcolor": 0,
            "show_topbar": false,
            "value": 1,
            "internalId": "b7c2",
            "overlayQueryKey": null,
        }),
    );

    let payload = session
        .resolve_feedback(&LogicalId::new("A1", "F1"), &OptionSet::new())
        .await;

    insta::assert_yaml_snapshot!(payload, @r###"
    text: Lower Third
    size: auto
    color: 16777215
    bgcolor: 0
    show_topbar: false
    value: 1
    "###);
}
