use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use serde_json::Value;

use super::{DisplayPayload, StateTransformer};
use crate::caching::{
    CacheEntry, CacheError, CacheKey, Coalescer, LogicalId, OptionSet, TtlStore, derive_key,
};
use crate::config::Config;
use crate::images::{self, ImageCache};
use crate::reconciler::{MissReconciler, PendingKey};
use crate::remote::{FeedbackChange, Remote, StateRecord};
use crate::scheduler::{ChangeThrottle, Scheduler};

/// Scheduler key of the debounced reconciliation pass.
const RECONCILE_KEY: &str = "reconcile";
/// Scheduler key of the debounced registry refresh.
const REGISTRY_REFRESH_KEY: &str = "registry_refresh";

/// Feedbacks matching this need an explicit input name when queried.
const ACTIVE_SHEET_FEEDBACK: &str = "input-routed.activesheet";
const ACTIVE_SHEET_INPUT: &str = "Spreadsheet: _active_";

/// Parses the raw reply to a state query. An empty reply is an empty record.
fn parse_state_record(text: &str) -> CacheEntry<StateRecord> {
    if text.trim().is_empty() {
        return Ok(StateRecord::new());
    }
    match serde_json::from_str(text)? {
        Value::Object(record) => Ok(record),
        Value::Null => Ok(StateRecord::new()),
        other => Err(CacheError::Malformed(format!(
            "expected a JSON object, got `{other}`"
        ))),
    }
}

/// The options actually sent along with a state query.
///
/// These can differ from the options the cache key is derived from.
fn query_options(logical_id: &LogicalId, options: &OptionSet) -> OptionSet {
    let mut options = options.clone();
    if logical_id.as_str().contains(ACTIVE_SHEET_FEEDBACK) && !options.contains_key("inputName") {
        options.insert("inputName".into(), ACTIVE_SHEET_INPUT.into());
    }
    options
}

/// Everything a connection to the remote application needs to serve feedback states.
///
/// A session is created per connection and shared behind an [`Arc`]. Background work it schedules
/// only holds weak references, so dropping the last handle ends the session.
pub struct FeedbackSession {
    config: Config,
    remote: Arc<dyn Remote>,
    coalescer: Coalescer<DisplayPayload>,
    transformer: StateTransformer,
    scheduler: Scheduler,
    throttle: ChangeThrottle,
    reconciler: MissReconciler<DisplayPayload>,
}

impl std::fmt::Debug for FeedbackSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedbackSession")
            .field("coalescer", &self.coalescer)
            .field("scheduler", &self.scheduler)
            .field("reconciler", &self.reconciler)
            .finish_non_exhaustive()
    }
}

impl FeedbackSession {
    /// Creates a session on top of `remote`.
    ///
    /// With `remote.prime_images` enabled, the image cache is seeded from the remote image set
    /// first. Failing to fetch that set is logged and otherwise ignored.
    pub async fn connect(config: Config, remote: Arc<dyn Remote>) -> anyhow::Result<Arc<Self>> {
        let client =
            images::create_client(&config.images).context("failed to create HTTP client")?;
        let images = ImageCache::new(client, config.caches.image_size);

        if config.remote.prime_images {
            let group = &config.remote.image_set_group;
            match remote.get_image_set(group).await {
                Ok(image_set) => {
                    tracing::debug!(%group, images = image_set.len(), "Seeding image cache");
                    images.seed(image_set);
                }
                Err(err) => {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        %group,
                        "Failed to fetch image set"
                    );
                }
            }
        }

        let transformer = StateTransformer::new(
            Arc::clone(&remote),
            images,
            config.remote.play_state_namespace.clone(),
        );
        let coalescer = Coalescer::new(TtlStore::new(), config.caches.feedback_ttl);
        let reconciler = MissReconciler::new(coalescer.clone());
        let throttle = ChangeThrottle::new(config.scheduling.change_throttle);

        Ok(Arc::new(Self {
            config,
            remote,
            coalescer,
            transformer,
            scheduler: Scheduler::new(),
            throttle,
            reconciler,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &TtlStore<DisplayPayload> {
        self.coalescer.store()
    }

    pub fn images(&self) -> &ImageCache {
        self.transformer.images()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn reconciler(&self) -> &MissReconciler<DisplayPayload> {
        &self.reconciler
    }

    /// Returns the display payload of one feedback.
    ///
    /// This never fails. When the state cannot be resolved, the key is queued for the next
    /// reconciliation pass and an empty payload is returned.
    pub async fn resolve_feedback(
        self: &Arc<Self>,
        logical_id: &LogicalId,
        options: &OptionSet,
    ) -> DisplayPayload {
        let key = derive_key(logical_id, options);
        let lookup = self
            .coalescer
            .resolve(key.clone(), || self.query(logical_id, options));

        match lookup.await {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    %key,
                    "Failed to resolve feedback state"
                );
                self.reconciler.mark_pending(PendingKey {
                    key,
                    logical_id: logical_id.clone(),
                    options: options.clone(),
                });
                self.schedule_reconcile();
                DisplayPayload::default()
            }
        }
    }

    /// Returns the state of a boolean feedback.
    pub async fn resolve_boolean(
        self: &Arc<Self>,
        logical_id: &LogicalId,
        options: &OptionSet,
    ) -> bool {
        self.resolve_feedback(logical_id, options)
            .await
            .is_truthy()
    }

    /// Drops the cached state of one feedback.
    pub fn invalidate(&self, logical_id: &LogicalId, options: &OptionSet) {
        self.store().remove(derive_key(logical_id, options).as_str());
    }

    /// Drops the cached state of all keys starting with `prefix`, returning how many there were.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let removed = self.store().remove_by_prefix(prefix);
        tracing::debug!(prefix, removed, "Invalidated cached feedback states");
        removed
    }

    /// Registers `listener` to be told which keys have a new state and should be polled again.
    pub fn on_resolved<F>(&self, listener: F)
    where
        F: Fn(&[CacheKey]) + Send + Sync + 'static,
    {
        self.reconciler.on_resolved(Arc::new(listener));
    }

    /// Handles a change notification pushed by the remote application.
    ///
    /// A pushed state is transformed and stored right away. Without a state, the cached one is
    /// dropped and the key is queued so the next reconciliation pass fetches it. Either way, the
    /// listeners are told to poll the key again.
    pub async fn handle_feedback_change(self: &Arc<Self>, change: FeedbackChange) {
        let logical_id = change.logical_id();
        if !self.throttle.admit(logical_id.as_str()) {
            metric!(counter("feedback.changes.throttled") += 1);
            tracing::trace!(%logical_id, "Dropping throttled change notification");
            return;
        }

        let key = derive_key(&logical_id, &change.options);
        match change.state {
            Some(record) if !record.is_empty() => {
                metric!(counter("feedback.changes") += 1, "state" => "pushed");
                let payload = self.transformer.transform(record).await;
                self.store()
                    .store(key.clone(), payload, self.coalescer.default_ttl());
            }
            _ => {
                metric!(counter("feedback.changes") += 1, "state" => "empty");
                self.store().remove(key.as_str());
                self.reconciler.mark_pending(PendingKey {
                    key: key.clone(),
                    logical_id,
                    options: change.options,
                });
            }
        }

        self.reconciler.notify(&[key]);
        self.schedule_reconcile();
    }

    /// Debounces a burst of registry change notifications into a single call to `refresh`.
    pub fn handle_registry_change<F, Fut>(&self, element: &str, refresh: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        tracing::debug!(element, "Registry changed");
        self.scheduler.schedule(
            REGISTRY_REFRESH_KEY,
            self.config.scheduling.registry_refresh_delay,
            refresh,
        );
    }

    /// Feeds every change of `changes` into [`handle_feedback_change`](Self::handle_feedback_change)
    /// until the stream ends.
    pub async fn run_notifications<S>(self: Arc<Self>, changes: S)
    where
        S: Stream<Item = FeedbackChange>,
    {
        let mut changes = std::pin::pin!(changes);
        while let Some(change) = changes.next().await {
            self.handle_feedback_change(change).await;
        }
        tracing::debug!("Change notification stream ended");
    }

    /// Runs a reconciliation pass right now, returning the keys it resolved.
    pub async fn reconcile(&self) -> Vec<CacheKey> {
        self.reconciler
            .reconcile(|pending| self.query(&pending.logical_id, &pending.options))
            .await
    }

    /// Cancels all scheduled background work.
    pub fn shutdown(&self) {
        tracing::debug!("Shutting down feedback session");
        self.scheduler.cancel_all();
    }

    fn schedule_reconcile(self: &Arc<Self>) {
        let session = Arc::downgrade(self);
        self.scheduler.schedule(
            RECONCILE_KEY,
            self.config.scheduling.reconcile_delay,
            move || async move {
                let Some(session) = session.upgrade() else {
                    return;
                };
                session.reconcile().await;

                // Keys marked while a pass was running, or while this one was skipped for it.
                if session.reconciler.pending_len() > 0
                    && !session.scheduler.is_scheduled(RECONCILE_KEY)
                {
                    session.schedule_reconcile();
                }
            },
        );
    }

    /// Queries and transforms the state of one feedback, bypassing all caches.
    fn query(
        &self,
        logical_id: &LogicalId,
        options: &OptionSet,
    ) -> BoxFuture<'static, CacheEntry<DisplayPayload>> {
        let remote = Arc::clone(&self.remote);
        let transformer = self.transformer.clone();
        let options = query_options(logical_id, options);
        let logical_id = logical_id.clone();

        Box::pin(async move {
            let (actor_id, feedback_id) = logical_id.split();
            let reply = remote
                .query_feedback_state(actor_id, feedback_id, &options)
                .await?;
            let record = parse_state_record(&reply)?;
            Ok(transformer.transform(record).await)
        })
    }
}
