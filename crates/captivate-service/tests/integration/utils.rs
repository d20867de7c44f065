use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use captivate_service::caching::{CacheKey, OptionSet};
use captivate_service::config::Config;
use captivate_service::feedback::FeedbackSession;
use captivate_test::MockRemote;

/// Connects a session to a fresh [`MockRemote`], after applying `configure` to the default config.
pub async fn setup_session<F>(configure: F) -> (Arc<FeedbackSession>, Arc<MockRemote>)
where
    F: FnOnce(&mut Config),
{
    captivate_test::setup();

    let mut config = Config::default();
    configure(&mut config);

    let remote = MockRemote::new();
    let session = FeedbackSession::connect(config, remote.clone())
        .await
        .unwrap();

    (session, remote)
}

/// Records every batch of keys the session asks the surface to poll again.
pub fn record_batches(session: &FeedbackSession) -> Arc<Mutex<Vec<Vec<CacheKey>>>> {
    let batches = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&batches);
    session.on_resolved(move |keys| sink.lock().push(keys.to_vec()));
    batches
}

pub fn options(value: Value) -> OptionSet {
    match value {
        Value::Object(map) => map,
        _ => panic!("options are objects"),
    }
}
