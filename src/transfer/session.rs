//! Per-connection transfer session.
//!
//! The session owns the in-flight buffer of every upload it has received
//! bytes for. Whenever a buffer reaches the high-water mark exactly one
//! high-water sized chunk is written to the chunk store before more bytes
//! are buffered; the finish frame writes the remainder as the last chunk.
//!
//! Chunk writes run on the blocking pool under the configured flush timeout.
//! A failed or timed-out write fails that upload only: its buffer is
//! discarded, its partial chain deleted, and `ATTACHMENT_FAILED` goes out to
//! its audience. Protocol violations are returned to the caller, which closes
//! the connection.
//!
//! Frames for an upload owned by another connection are dropped.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerHandle, PushMessage};
use crate::client::ConnectionId;
use crate::config::TransferSettings;
use crate::persistence::collections::ATTACHMENTS;
use crate::persistence::{ChunkStore, DocumentStore};
use crate::transfer::frame::{self, Frame};
use crate::transfer::uploads::{Accept, UploadHandle};
use crate::utils::error::{BrokerError, StoreError, TransferError};
use crate::utils::ids::ObjectId;

pub const ATTACHMENT_PROGRESS: &str = "ATTACHMENT_PROGRESS";
pub const ATTACHMENT_COMPLETE: &str = "ATTACHMENT_COMPLETE";
pub const ATTACHMENT_FAILED: &str = "ATTACHMENT_FAILED";

/// Everything a transfer session needs, shared by all sessions.
#[derive(Debug, Clone)]
pub struct TransferContext {
    pub store: DocumentStore,
    pub chunks: ChunkStore,
    pub uploads: UploadHandle,
    pub broker: BrokerHandle,
    pub settings: TransferSettings,
}

#[derive(Debug, Default)]
struct Buffer {
    bytes: BytesMut,
    last_chunk: Option<ObjectId>,
    flushed: u64,
    chunks: usize,
}

pub struct TransferSession {
    conn: ConnectionId,
    ctx: TransferContext,
    buffers: HashMap<ObjectId, Buffer>,
}

impl TransferSession {
    pub fn new(conn: ConnectionId, ctx: TransferContext) -> Self {
        Self {
            conn,
            ctx,
            buffers: HashMap::new(),
        }
    }

    /// Bytes currently buffered for `id`.
    pub fn buffered(&self, id: &ObjectId) -> usize {
        self.buffers.get(id).map_or(0, |b| b.bytes.len())
    }

    pub async fn handle_frame(&mut self, raw: &Bytes) -> Result<(), TransferError> {
        match frame::decode(raw, self.ctx.settings.max_frame_size)? {
            Frame::Data { id, payload } => self.on_data(id, payload).await,
            Frame::Finish(id) => self.on_finish(id).await,
        }
    }

    /// Fail every upload this connection left unfinished.
    pub async fn close(mut self) {
        let open: Vec<ObjectId> = self.buffers.keys().copied().collect();
        for id in open {
            if let Err(e) = self.abort(id, TransferError::Abandoned(id)).await {
                error!(conn = %self.conn, attachment = %id, error = %e, "Could not fail abandoned upload");
            }
        }
    }

    async fn on_data(&mut self, id: ObjectId, payload: Bytes) -> Result<(), TransferError> {
        let len = payload.len() as u64;
        match self.ctx.uploads.accept(id, self.conn, len).await? {
            Accept::Accepted { .. } => {}
            Accept::Unknown => {
                debug!(conn = %self.conn, attachment = %id, "Data for unknown or closed upload dropped");
                return Ok(());
            }
            Accept::Foreign => {
                warn!(conn = %self.conn, attachment = %id, "Data for an upload owned by another connection dropped");
                return Ok(());
            }
            Accept::Overflow { total } => {
                return self.abort(id, TransferError::Overflow { id, total }).await;
            }
        }

        let mut buffer = self.buffers.remove(&id).unwrap_or_default();
        buffer.bytes.extend_from_slice(&payload);

        let high_water = self.ctx.settings.chunk_high_water.max(1);
        while buffer.bytes.len() >= high_water {
            let chunk = buffer.bytes.split_to(high_water).freeze();
            if let Err(e) = self.write_chunk(id, &mut buffer, chunk).await {
                return self.abort(id, e).await;
            }
            self.announce_progress(id, buffer.flushed).await?;
        }

        self.buffers.insert(id, buffer);
        Ok(())
    }

    async fn on_finish(&mut self, id: ObjectId) -> Result<(), TransferError> {
        let Some(state) = self.ctx.uploads.get(id).await? else {
            debug!(conn = %self.conn, attachment = %id, "Finish for unknown or closed upload dropped");
            self.buffers.remove(&id);
            return Ok(());
        };
        if !state.closable_by(&self.conn) {
            warn!(conn = %self.conn, attachment = %id, "Finish for an upload this connection does not own dropped");
            return Ok(());
        }
        if state.processed < state.total {
            let err = TransferError::Incomplete {
                id,
                received: state.processed,
                total: state.total,
            };
            return self.abort(id, err).await;
        }

        let mut buffer = self.buffers.remove(&id).unwrap_or_default();
        let rest = buffer.bytes.split().freeze();
        // zero-byte uploads still get their (empty) first chunk
        if !rest.is_empty() || buffer.last_chunk.is_none() {
            if let Err(e) = self.write_chunk(id, &mut buffer, rest).await {
                return self.abort(id, e).await;
            }
        }

        if let Err(e) = self.mark(id, "pending", false).await {
            return self.abort(id, e.into()).await;
        }
        let Some(state) = self.ctx.uploads.finish(id, self.conn).await? else {
            return Ok(());
        };

        info!(conn = %self.conn, attachment = %id, bytes = state.total, chunks = buffer.chunks, "Upload complete");
        self.announce(
            &state.audience,
            ATTACHMENT_COMPLETE,
            &json!({ "id": id, "size": state.total }),
        )
        .await
    }

    async fn write_chunk(
        &self,
        id: ObjectId,
        buffer: &mut Buffer,
        bytes: Bytes,
    ) -> Result<(), TransferError> {
        let chunks = self.ctx.chunks.clone();
        let previous = buffer.last_chunk;
        let len = bytes.len() as u64;

        let mut task = tokio::task::spawn_blocking(move || -> Result<ObjectId, StoreError> {
            let chunk = chunks.append_chunk(id, &bytes, previous.is_none())?;
            if let Some(prev) = previous {
                if let Err(e) = chunks.link_next(prev, chunk) {
                    // unlinked, so the chain cleanup would never reach it
                    if let Err(cleanup) = chunks.delete_chain(chunk) {
                        warn!(attachment = %id, chunk = %chunk, error = %cleanup, "Could not remove unlinked chunk");
                    }
                    return Err(e);
                }
            }
            Ok(chunk)
        });

        let joined = match timeout(self.ctx.settings.flush_timeout(), &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                // the write cannot be cancelled; wait for it so the chain
                // is complete when the upload is discarded
                if let Err(e) = task.await {
                    error!(attachment = %id, error = %e, "Timed-out chunk write panicked");
                }
                return Err(TransferError::Timeout(id));
            }
        };
        let chunk = joined.map_err(StoreError::from)??;

        buffer.last_chunk = Some(chunk);
        buffer.flushed += len;
        buffer.chunks += 1;
        debug!(attachment = %id, chunk = %chunk, flushed = buffer.flushed, "Chunk written");
        Ok(())
    }

    /// Fail `id`. Returns the error again when it is a protocol violation.
    async fn abort(&mut self, id: ObjectId, err: TransferError) -> Result<(), TransferError> {
        warn!(conn = %self.conn, attachment = %id, error = %err, "Upload failed");
        self.buffers.remove(&id);

        if let Some(state) = self.ctx.uploads.fail(id, self.conn).await? {
            if let Err(e) = self.mark(id, "failed", true).await {
                error!(attachment = %id, error = %e, "Could not flag attachment as failed");
            }
            self.discard_chain(id).await;
            self.announce(
                &state.audience,
                ATTACHMENT_FAILED,
                &json!({ "id": id, "reason": err.to_string() }),
            )
            .await?;
        }

        if err.is_violation() { Err(err) } else { Ok(()) }
    }

    async fn discard_chain(&self, id: ObjectId) {
        let chunks = self.ctx.chunks.clone();
        match tokio::task::spawn_blocking(move || chunks.delete_chain(id)).await {
            Ok(Ok(0)) => {}
            Ok(Ok(removed)) => debug!(attachment = %id, removed, "Partial chain discarded"),
            Ok(Err(e)) => error!(attachment = %id, error = %e, "Could not discard partial chain"),
            Err(e) => error!(attachment = %id, error = %e, "Chain cleanup task failed"),
        }
    }

    async fn mark(&self, id: ObjectId, field: &'static str, value: bool) -> Result<(), StoreError> {
        let mut fields = Map::new();
        fields.insert(field.to_string(), Value::Bool(value));
        self.ctx
            .store
            .run_blocking(move |store| store.update_fields(ATTACHMENTS, id, fields))
            .await?;
        Ok(())
    }

    async fn announce_progress(&self, id: ObjectId, flushed: u64) -> Result<(), TransferError> {
        let Some(state) = self.ctx.uploads.get(id).await? else {
            return Ok(());
        };
        self.announce(
            &state.audience,
            ATTACHMENT_PROGRESS,
            &json!({ "id": id, "processed": flushed, "total": state.total }),
        )
        .await
    }

    async fn announce<T: Serialize>(
        &self,
        audience: &[String],
        kind: &str,
        data: &T,
    ) -> Result<(), TransferError> {
        if audience.is_empty() {
            return Ok(());
        }
        let msg = PushMessage::event(kind, data).map_err(BrokerError::from)?;
        self.ctx.broker.broadcast_multi(audience.to_vec(), &msg).await?;
        Ok(())
    }
}
