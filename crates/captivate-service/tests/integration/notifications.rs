use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;

use captivate_service::caching::{CacheKey, LogicalId, OptionSet};
use captivate_service::remote::{FeedbackChange, StateRecord};

use crate::utils::{options, record_batches, setup_session};

fn change(actor_id: &str, feedback_id: &str, state: Option<serde_json::Value>) -> FeedbackChange {
    let state = state.map(|state| match state {
        serde_json::Value::Object(record) => record,
        _ => panic!("states are objects"),
    });
    FeedbackChange {
        actor_id: actor_id.into(),
        feedback_id: feedback_id.into(),
        options: OptionSet::new(),
        state,
    }
}

#[tokio::test]
async fn test_pushed_state_is_stored() {
    let (session, remote) = setup_session(|_| {}).await;
    let batches = record_batches(&session);

    session
        .handle_feedback_change(change("A1", "F1", Some(json!({"text": "Live"}))))
        .await;

    let key = CacheKey::from("A1~F1");
    assert_eq!(*batches.lock(), vec![vec![key]]);

    let payload = session
        .resolve_feedback(&LogicalId::new("A1", "F1"), &OptionSet::new())
        .await;
    assert_eq!(payload.text, Some(json!("Live")));
    assert_eq!(remote.total_queries(), 0);

    session.shutdown();
}

#[tokio::test]
async fn test_pushed_state_uses_options_key() {
    let (session, _remote) = setup_session(|_| {}).await;

    let mut change = change("A1", "F1", Some(json!({"text": "Live"})));
    change.options = options(json!({"inputName": "Sheet 1"}));
    session.handle_feedback_change(change).await;

    let keys = session.store().keys();
    assert_eq!(keys.len(), 1);
    assert!(keys[0].starts_with("A1~F1+"));

    session.shutdown();
}

#[tokio::test]
async fn test_empty_notification_triggers_one_query() {
    let (session, remote) = setup_session(|_| {}).await;
    let batches = record_batches(&session);
    remote.set_state("A1", "F1", json!({"text": "Live"}));

    let logical_id = LogicalId::new("A1", "F1");
    let options = OptionSet::new();
    let key = CacheKey::from("A1~F1");

    session.resolve_feedback(&logical_id, &options).await;
    assert_eq!(remote.query_count("A1", "F1"), 1);

    remote.set_state("A1", "F1", json!({"text": "Off Air"}));
    session
        .handle_feedback_change(change("A1", "F1", Some(json!({}))))
        .await;
    assert!(!session.store().contains("A1~F1"));
    assert!(session.reconciler().is_pending(&key));
    assert_eq!(*batches.lock(), vec![vec![key.clone()]]);

    // the surface polls again right away
    let payload = session.resolve_feedback(&logical_id, &options).await;
    assert_eq!(payload.text, Some(json!("Off Air")));

    // and the trailing pass is served by the store
    assert_eq!(session.reconcile().await, vec![key]);
    assert_eq!(remote.query_count("A1", "F1"), 2);

    session.shutdown();
}

#[tokio::test]
async fn test_end_to_end_queries() {
    let (session, remote) = setup_session(|_| {}).await;
    let options = OptionSet::new();

    session
        .handle_feedback_change(change("A1", "F1", Some(json!({}))))
        .await;
    session
        .resolve_feedback(&LogicalId::new("A1", "F1"), &options)
        .await;
    assert_eq!(remote.query_count("A1", "F1"), 1);

    session
        .handle_feedback_change(change("A1", "F2", Some(json!({"text": "Live"}))))
        .await;
    session
        .resolve_feedback(&LogicalId::new("A1", "F2"), &options)
        .await;
    assert_eq!(remote.query_count("A1", "F2"), 0);

    session.shutdown();
}

#[tokio::test]
async fn test_changes_are_throttled() {
    let (session, _remote) = setup_session(|config| {
        config.scheduling.change_throttle = Duration::from_secs(10);
    })
    .await;
    let batches = record_batches(&session);

    session
        .handle_feedback_change(change("A1", "F1", Some(json!({"text": "first"}))))
        .await;
    session
        .handle_feedback_change(change("A1", "F1", Some(json!({"text": "second"}))))
        .await;
    session
        .handle_feedback_change(change("A1", "F2", Some(json!({"text": "other"}))))
        .await;

    let stored = session.store().get("A1~F1").unwrap();
    assert_eq!(stored.text, Some(json!("first")));
    assert!(session.store().contains("A1~F2"));
    assert_eq!(batches.lock().len(), 2);

    session.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_reconcile_pass_is_debounced() {
    let (session, remote) = setup_session(|config| {
        config.scheduling.change_throttle = Duration::ZERO;
    })
    .await;
    let batches = record_batches(&session);

    for feedback_id in ["F1", "F2"] {
        session
            .handle_feedback_change(change("A1", feedback_id, None))
            .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    remote.set_state("A1", "F1", json!({"text": "Live"}));
    remote.set_state("A1", "F2", json!({"text": "Off Air"}));

    // the first change re-armed the pass, nothing ran yet
    assert_eq!(remote.total_queries(), 0);
    assert!(session.scheduler().is_scheduled("reconcile"));

    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(remote.total_queries(), 2);
    assert_eq!(session.reconciler().pending_len(), 0);
    assert_eq!(
        *batches.lock(),
        vec![
            vec![CacheKey::from("A1~F1")],
            vec![CacheKey::from("A1~F2")],
            vec![CacheKey::from("A1~F1"), CacheKey::from("A1~F2")],
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_keys_marked_during_a_pass_get_their_own_pass() {
    let (session, remote) = setup_session(|config| {
        config.scheduling.change_throttle = Duration::ZERO;
    })
    .await;
    remote.set_delay(Duration::from_secs(1));

    session
        .handle_feedback_change(change("A1", "F1", None))
        .await;
    let pass = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.reconcile().await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(session.reconciler().is_running());

    // the pass scheduled for this change fires while the first one is still running
    session
        .handle_feedback_change(change("A1", "F2", None))
        .await;

    assert_eq!(pass.await.unwrap(), vec![CacheKey::from("A1~F1")]);
    assert_eq!(remote.query_count("A1", "F2"), 0);

    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(remote.query_count("A1", "F1"), 1);
    assert_eq!(remote.query_count("A1", "F2"), 1);
    assert!(session.store().contains("A1~F2"));
    assert_eq!(session.reconciler().pending_len(), 0);
    assert!(!session.scheduler().is_scheduled("reconcile"));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_pending_work() {
    let (session, remote) = setup_session(|_| {}).await;

    session
        .handle_feedback_change(change("A1", "F1", None))
        .await;
    assert!(session.scheduler().is_scheduled("reconcile"));

    session.shutdown();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(remote.total_queries(), 0);
    assert!(session.reconciler().is_pending(&CacheKey::from("A1~F1")));
}

#[tokio::test]
async fn test_notification_stream() {
    let (session, _remote) = setup_session(|_| {}).await;

    let changes = futures::stream::iter(vec![
        change("A1", "F1", Some(json!({"text": "one"}))),
        change("A1", "F2", Some(json!({"text": "two"}))),
        change("A2", "F1", None),
    ]);
    Arc::clone(&session).run_notifications(changes).await;

    assert_eq!(
        session.store().keys(),
        vec![CacheKey::from("A1~F1"), CacheKey::from("A1~F2")]
    );
    assert!(session.reconciler().is_pending(&CacheKey::from("A2~F1")));

    session.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_registry_refresh_is_debounced() {
    let (session, _remote) = setup_session(|_| {}).await;
    let refreshes = Arc::new(AtomicUsize::new(0));

    for element in ["actions", "feedbacks", "presets"] {
        let refreshes = Arc::clone(&refreshes);
        session.handle_registry_change(element, move || async move {
            refreshes.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
    assert_eq!(refreshes.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    assert!(!session.scheduler().is_scheduled("registry_refresh"));
}

#[test]
fn test_empty_change_has_no_state() {
    let change = change("A1", "F1", Some(json!({})));
    assert_eq!(change.state, Some(StateRecord::new()));
    assert_eq!(change.logical_id().as_str(), "A1~F1");
}
