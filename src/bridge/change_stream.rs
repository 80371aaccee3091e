//! One follower per watched collection.
//!
//! A follower reads its collection's change log past the durable cursor,
//! applies each event, and only then advances the cursor. An event whose
//! reaction fails stays ahead of the cursor and is retried on the next wake.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::bridge::reactions::Reactor;
use crate::persistence::DocumentStore;
use crate::utils::error::BridgeError;

const BATCH: usize = 256;

#[derive(Debug, Clone)]
pub struct ChangeStream {
    collection: &'static str,
    store: DocumentStore,
    reactor: Reactor,
    poll_interval: Duration,
}

impl ChangeStream {
    pub fn new(
        collection: &'static str,
        store: DocumentStore,
        reactor: Reactor,
        poll_interval: Duration,
    ) -> Self {
        Self {
            collection,
            store,
            reactor,
            poll_interval,
        }
    }

    pub fn collection(&self) -> &'static str {
        self.collection
    }

    /// Follow the log until the task is aborted. Wakes on every store
    /// mutation, and at least once per poll interval.
    pub async fn run(self) {
        let changed = self.store.changes_notifier();
        info!(collection = self.collection, "Change stream started");

        loop {
            let notified = changed.notified();
            tokio::pin!(notified);
            // register before draining so a write racing the drain still wakes us
            notified.as_mut().enable();

            match self.drain().await {
                Ok(0) => {}
                Ok(n) => debug!(collection = self.collection, events = n, "Changes applied"),
                Err(e) => warn!(collection = self.collection, error = %e, "Change stream stalled, will retry"),
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = sleep(self.poll_interval) => {}
            }
        }
    }

    /// Apply every pending event. Returns how many were applied.
    pub async fn drain(&self) -> Result<usize, BridgeError> {
        let collection = self.collection;
        let mut cursor = self
            .store
            .run_blocking(move |store| store.load_cursor(collection))
            .await?;
        let mut applied = 0;

        loop {
            let from = cursor;
            let batch = self
                .store
                .run_blocking(move |store| store.changes_after(collection, from, BATCH))
                .await?;
            if batch.is_empty() {
                break;
            }
            for event in batch {
                self.reactor.react(&event).await?;
                cursor = event.seq;
                let seq = cursor;
                self.store
                    .run_blocking(move |store| store.save_cursor(collection, seq))
                    .await?;
                applied += 1;
            }
            let upto = cursor;
            self.store
                .run_blocking(move |store| store.prune_changes(collection, upto))
                .await?;
        }

        Ok(applied)
    }
}
