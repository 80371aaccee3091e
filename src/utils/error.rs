//! The `error` module defines the error types used within `popcast`.
//!
//! Each subsystem gets its own enum so callers can tell protocol violations
//! (connection scoped) apart from storage failures (which flag the affected
//! entity) and from a stopped actor.

use thiserror::Error;

use crate::utils::ids::ObjectId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("object ids are exactly 24 hex characters")]
pub struct InvalidObjectId;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Sled(#[from] sled::Error),

    #[error("document encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("{collection} record {id} not found")]
    NotFound {
        collection: &'static str,
        id: ObjectId,
    },

    #[error("chunk chain of {attachment} is broken: chunk {missing} is missing")]
    BrokenChain {
        attachment: ObjectId,
        missing: ObjectId,
    },

    #[error("chunk chain of {attachment} revisits chunk {chunk}")]
    CyclicChain {
        attachment: ObjectId,
        chunk: ObjectId,
    },

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("blocking store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("frame of {0} bytes is shorter than an object id")]
    FrameTooShort(usize),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("frame does not start with a hex object id")]
    InvalidId(#[from] InvalidObjectId),

    #[error("upload {id} exceeds its declared size of {total} bytes")]
    Overflow { id: ObjectId, total: u64 },

    #[error("flushing upload {0} timed out")]
    Timeout(ObjectId),

    #[error("upload {id} finished after {received} of {total} bytes")]
    Incomplete { id: ObjectId, received: u64, total: u64 },

    #[error("upload {0} abandoned by its connection")]
    Abandoned(ObjectId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl TransferError {
    /// Violations close the offending connection; everything else only fails
    /// the affected upload.
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            TransferError::FrameTooShort(_)
                | TransferError::FrameTooLarge { .. }
                | TransferError::InvalidId(_)
                | TransferError::Overflow { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("the {0} actor is no longer running")]
    Closed(&'static str),

    #[error("push message encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no credentials presented")]
    Missing,

    #[error("invalid token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("change payload encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}
