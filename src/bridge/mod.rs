//! The change bridge turns document store mutations into broker fan-out and
//! cascading deletes.

pub mod change_stream;
pub mod reactions;

use std::time::Duration;

use tokio::task::JoinHandle;

pub use change_stream::ChangeStream;
pub use reactions::{Reactor, WATCHED};

use crate::persistence::DocumentStore;

/// Start one change stream task per watched collection.
pub fn spawn(store: &DocumentStore, reactor: Reactor, poll_interval: Duration) -> Vec<JoinHandle<()>> {
    WATCHED
        .iter()
        .copied()
        .map(|collection| {
            let stream = ChangeStream::new(collection, store.clone(), reactor.clone(), poll_interval);
            tokio::spawn(stream.run())
        })
        .collect()
}

#[cfg(test)]
mod tests;
