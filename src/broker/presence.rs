//! Conversation-open tracking.
//!
//! A pair `(watcher, watched)` is open while at least one of the watcher's
//! connections has the conversation with `watched` on screen. Private
//! messages consult this to decide whether the recipient needs a
//! notification. Lives in its own actor, independent of the broker.

use std::collections::{HashMap, HashSet};

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::client::ConnectionId;
use crate::utils::error::BrokerError;
use crate::utils::ids::UserId;

type Pair = (UserId, UserId);

#[derive(Debug, Default)]
pub struct Conversations {
    open: HashMap<Pair, HashSet<ConnectionId>>,
}

impl Conversations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, conn: ConnectionId, watcher: UserId, watched: UserId) {
        debug!(conn = %conn, %watcher, %watched, "Conversation opened");
        self.open.entry((watcher, watched)).or_default().insert(conn);
    }

    pub fn close(&mut self, conn: &ConnectionId, watcher: &str, watched: &str) {
        let key = (watcher.to_string(), watched.to_string());
        if let Some(conns) = self.open.get_mut(&key) {
            conns.remove(conn);
            if conns.is_empty() {
                self.open.remove(&key);
            }
        }
    }

    pub fn is_open(&self, watcher: &str, watched: &str) -> bool {
        self.open
            .contains_key(&(watcher.to_string(), watched.to_string()))
    }

    /// Forget every pair opened from `conn`.
    pub fn close_connection(&mut self, conn: &ConnectionId) -> usize {
        let before = self.open.len();
        self.open.retain(|_, conns| {
            conns.remove(conn);
            !conns.is_empty()
        });
        before - self.open.len()
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}

enum ConversationCommand {
    Open {
        conn: ConnectionId,
        watcher: UserId,
        watched: UserId,
    },
    Close {
        conn: ConnectionId,
        watcher: UserId,
        watched: UserId,
    },
    IsOpen {
        watcher: UserId,
        watched: UserId,
        reply: oneshot::Sender<bool>,
    },
    CloseConnection {
        conn: ConnectionId,
    },
}

impl Conversations {
    pub fn spawn(self, queue_depth: usize) -> ConversationHandle {
        let (tx, mut rx) = mpsc::channel(queue_depth.max(1));
        let mut state = self;
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    ConversationCommand::Open {
                        conn,
                        watcher,
                        watched,
                    } => state.open(conn, watcher, watched),
                    ConversationCommand::Close {
                        conn,
                        watcher,
                        watched,
                    } => state.close(&conn, &watcher, &watched),
                    ConversationCommand::IsOpen {
                        watcher,
                        watched,
                        reply,
                    } => {
                        let _ = reply.send(state.is_open(&watcher, &watched));
                    }
                    ConversationCommand::CloseConnection { conn } => {
                        state.close_connection(&conn);
                    }
                }
            }
        });
        ConversationHandle { tx }
    }
}

#[derive(Debug, Clone)]
pub struct ConversationHandle {
    tx: mpsc::Sender<ConversationCommand>,
}

impl ConversationHandle {
    async fn send(&self, cmd: ConversationCommand) -> Result<(), BrokerError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| BrokerError::Closed("conversation"))
    }

    pub async fn open(
        &self,
        conn: ConnectionId,
        watcher: impl Into<UserId>,
        watched: impl Into<UserId>,
    ) -> Result<(), BrokerError> {
        self.send(ConversationCommand::Open {
            conn,
            watcher: watcher.into(),
            watched: watched.into(),
        })
        .await
    }

    pub async fn close(
        &self,
        conn: ConnectionId,
        watcher: impl Into<UserId>,
        watched: impl Into<UserId>,
    ) -> Result<(), BrokerError> {
        self.send(ConversationCommand::Close {
            conn,
            watcher: watcher.into(),
            watched: watched.into(),
        })
        .await
    }

    pub async fn is_open(
        &self,
        watcher: impl Into<UserId>,
        watched: impl Into<UserId>,
    ) -> Result<bool, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.send(ConversationCommand::IsOpen {
            watcher: watcher.into(),
            watched: watched.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| BrokerError::Closed("conversation"))
    }

    pub async fn close_connection(&self, conn: ConnectionId) -> Result<(), BrokerError> {
        self.send(ConversationCommand::CloseConnection { conn }).await
    }
}
