//! Attachment upload-state table.
//!
//! Holds one [`UploadState`] per attachment that is still expected to
//! arrive. Entries leave the table when the upload finishes or fails; data
//! frames for ids that are not in the table are dropped by the session.
//!
//! The first transfer connection to send data for an upload owns it. Frames
//! for that id from any other connection are dropped, and only the owner can
//! finish or fail it.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::client::ConnectionId;
use crate::utils::error::BrokerError;
use crate::utils::ids::ObjectId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadState {
    pub id: ObjectId,
    /// Declared size in bytes.
    pub total: u64,
    /// Bytes accepted so far.
    pub processed: u64,
    pub pending: bool,
    pub failed: bool,
    /// Topics told about progress and the outcome.
    #[serde(skip)]
    pub audience: Vec<String>,
    /// Transfer connection streaming the bytes, set by its first data frame.
    #[serde(skip)]
    pub owner: Option<ConnectionId>,
}

impl UploadState {
    pub fn new(id: ObjectId, total: u64, audience: Vec<String>) -> Self {
        Self {
            id,
            total,
            processed: 0,
            pending: true,
            failed: false,
            audience,
            owner: None,
        }
    }

    /// Whether `conn` may close this upload. Nobody owns a zero-byte upload
    /// until it is finished.
    pub fn closable_by(&self, conn: &ConnectionId) -> bool {
        match self.owner {
            Some(owner) => owner == *conn,
            None => self.total == 0,
        }
    }
}

/// Verdict on an incoming data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accept {
    Accepted { processed: u64, total: u64 },
    /// No upload in progress under this id.
    Unknown,
    /// Another connection owns the upload.
    Foreign,
    /// The frame would exceed the declared size.
    Overflow { total: u64 },
}

#[derive(Debug, Default)]
pub struct Uploads {
    table: HashMap<ObjectId, UploadState>,
}

impl Uploads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, state: UploadState) {
        info!(attachment = %state.id, total = state.total, "Upload expected");
        if self.table.insert(state.id, state).is_some() {
            warn!("Upload restarted, previous state replaced");
        }
    }

    pub fn accept(&mut self, id: ObjectId, conn: ConnectionId, len: u64) -> Accept {
        let Some(state) = self.table.get_mut(&id) else {
            return Accept::Unknown;
        };
        match state.owner {
            Some(owner) if owner != conn => return Accept::Foreign,
            Some(_) => {}
            None => {
                debug!(attachment = %id, conn = %conn, "Upload claimed");
                state.owner = Some(conn);
            }
        }
        let processed = state.processed.saturating_add(len);
        if processed > state.total {
            return Accept::Overflow { total: state.total };
        }
        state.processed = processed;
        Accept::Accepted {
            processed,
            total: state.total,
        }
    }

    pub fn get(&self, id: &ObjectId) -> Option<UploadState> {
        self.table.get(id).cloned()
    }

    /// Close a successful upload and return its final state. Ignored unless
    /// `conn` may close it.
    pub fn finish(&mut self, id: &ObjectId, conn: &ConnectionId) -> Option<UploadState> {
        if !self.table.get(id)?.closable_by(conn) {
            return None;
        }
        let mut state = self.table.remove(id)?;
        state.pending = false;
        debug!(attachment = %id, "Upload finished");
        Some(state)
    }

    /// Close a failed upload and return its final state. Ignored unless
    /// `conn` may close it.
    pub fn fail(&mut self, id: &ObjectId, conn: &ConnectionId) -> Option<UploadState> {
        if !self.table.get(id)?.closable_by(conn) {
            return None;
        }
        let mut state = self.table.remove(id)?;
        state.failed = true;
        Some(state)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

enum UploadCommand {
    Begin(UploadState),
    Accept {
        id: ObjectId,
        conn: ConnectionId,
        len: u64,
        reply: oneshot::Sender<Accept>,
    },
    Get {
        id: ObjectId,
        reply: oneshot::Sender<Option<UploadState>>,
    },
    Finish {
        id: ObjectId,
        conn: ConnectionId,
        reply: oneshot::Sender<Option<UploadState>>,
    },
    Fail {
        id: ObjectId,
        conn: ConnectionId,
        reply: oneshot::Sender<Option<UploadState>>,
    },
}

impl Uploads {
    pub fn spawn(mut self, queue_depth: usize) -> UploadHandle {
        let (tx, mut rx) = mpsc::channel::<UploadCommand>(queue_depth.max(1));
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    UploadCommand::Begin(state) => self.begin(state),
                    UploadCommand::Accept { id, conn, len, reply } => {
                        let _ = reply.send(self.accept(id, conn, len));
                    }
                    UploadCommand::Get { id, reply } => {
                        let _ = reply.send(self.get(&id));
                    }
                    UploadCommand::Finish { id, conn, reply } => {
                        let _ = reply.send(self.finish(&id, &conn));
                    }
                    UploadCommand::Fail { id, conn, reply } => {
                        let _ = reply.send(self.fail(&id, &conn));
                    }
                }
            }
        });
        UploadHandle { tx }
    }
}

#[derive(Debug, Clone)]
pub struct UploadHandle {
    tx: mpsc::Sender<UploadCommand>,
}

impl UploadHandle {
    async fn ask<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> UploadCommand,
    ) -> Result<T, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| BrokerError::Closed("uploads"))?;
        rx.await.map_err(|_| BrokerError::Closed("uploads"))
    }

    pub async fn begin(&self, state: UploadState) -> Result<(), BrokerError> {
        self.tx
            .send(UploadCommand::Begin(state))
            .await
            .map_err(|_| BrokerError::Closed("uploads"))
    }

    pub async fn accept(
        &self,
        id: ObjectId,
        conn: ConnectionId,
        len: u64,
    ) -> Result<Accept, BrokerError> {
        self.ask(|reply| UploadCommand::Accept {
            id,
            conn,
            len,
            reply,
        })
        .await
    }

    pub async fn get(&self, id: ObjectId) -> Result<Option<UploadState>, BrokerError> {
        self.ask(|reply| UploadCommand::Get { id, reply }).await
    }

    pub async fn finish(
        &self,
        id: ObjectId,
        conn: ConnectionId,
    ) -> Result<Option<UploadState>, BrokerError> {
        self.ask(|reply| UploadCommand::Finish { id, conn, reply })
            .await
    }

    pub async fn fail(
        &self,
        id: ObjectId,
        conn: ConnectionId,
    ) -> Result<Option<UploadState>, BrokerError> {
        self.ask(|reply| UploadCommand::Fail { id, conn, reply })
            .await
    }
}
