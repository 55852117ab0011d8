//! Lifecycle event bus over the store's pub/sub.
//!
//! The atomic scripts publish most events themselves; this type covers the
//! subscriber side (per-scope and pattern subscriptions) and Rust-side
//! publishing for callers outside a script. Publish failures must never fail
//! a state transition: callers log and continue.

use std::pin::Pin;

use futures_util::{Stream, StreamExt};
use tracing::debug;

use bridgemq_models::{EventScope, LifecycleEvent};

use crate::error::{StoreError, StoreResult};
use crate::keys::Keys;
use crate::pool::Store;

/// A pinned stream of decoded lifecycle events.
pub type EventStream = Pin<Box<dyn Stream<Item = LifecycleEvent> + Send>>;

/// Handle for publishing and subscribing to lifecycle events.
pub struct EventBus {
    store: std::sync::Arc<Store>,
    keys: Keys,
}

impl EventBus {
    pub fn new(store: std::sync::Arc<Store>) -> Self {
        let keys = store.keys();
        Self { store, keys }
    }

    /// The channel name for a scope.
    pub fn channel(&self, scope: &EventScope) -> String {
        self.keys.events_channel(&scope.suffix())
    }

    /// Publish an event on a single scope.
    pub async fn publish(&self, scope: &EventScope, event: &LifecycleEvent) -> StoreResult<()> {
        let payload = serde_json::to_string(event)?;
        let channel = self.channel(scope);
        let mut conn = self.store.conn().await?;
        redis::cmd("PUBLISH")
            .arg(&channel)
            .arg(&payload)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| StoreError::EventPublish(e.to_string()))?;
        debug!(channel = %channel, event = ?event.event, "Published lifecycle event");
        Ok(())
    }

    /// Subscribe to one scope. Undecodable payloads are dropped.
    pub async fn subscribe(&self, scope: &EventScope) -> StoreResult<EventStream> {
        let mut pubsub = self.store.pubsub().await?;
        pubsub.subscribe(self.channel(scope)).await?;
        Ok(into_event_stream(pubsub))
    }

    /// Pattern subscription using the store's native glob matching
    /// (`*` and `?`). The pattern applies to the scope suffix, e.g.
    /// `mesh:*` or `job:??-region-1`.
    pub async fn psubscribe(&self, suffix_pattern: &str) -> StoreResult<EventStream> {
        let mut pubsub = self.store.pubsub().await?;
        pubsub
            .psubscribe(self.keys.events_channel(suffix_pattern))
            .await?;
        Ok(into_event_stream(pubsub))
    }
}

fn into_event_stream(pubsub: redis::aio::PubSub) -> EventStream {
    let stream = pubsub.into_on_message().filter_map(|msg| async move {
        let payload: String = msg.get_payload().ok()?;
        serde_json::from_str(&payload).ok()
    });
    Box::pin(stream)
}
