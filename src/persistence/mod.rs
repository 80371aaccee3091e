//! The `persistence` module is the storage side of popcast.
//!
//! It uses `sled` as an embedded key-value store for two things: JSON
//! documents with a per-collection change log (the feed the change bridge
//! consumes), and the linked chunk records that make up attachments.

pub mod chunk_store;
pub mod sled_store;

pub use chunk_store::{ChainReader, ChunkRecord, ChunkStore};
pub use sled_store::{ChangeEvent, ChangeOp, DocumentStore, Filter, collections};
