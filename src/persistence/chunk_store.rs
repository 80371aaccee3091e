//! Linked chunk storage for attachments
//!
//! An attachment is a singly linked chain of chunk records in the
//! `attachment_chunks` tree. The first chunk is stored under the attachment
//! id itself, later chunks under fresh ids. A record value is the 24-byte hex
//! id of the next chunk followed by the raw payload; `ObjectId::NIL` ends the
//! chain.

use std::collections::HashSet;

use bytes::Bytes;
use sled::{Db, Tree};

use crate::utils::error::StoreError;
use crate::utils::ids::ObjectId;

const CHUNKS_TREE: &str = "attachment_chunks";
const NEXT_LEN: usize = ObjectId::HEX_LEN;

#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: ObjectId,
    pub bytes: Bytes,
    pub next_chunk_id: ObjectId,
}

#[derive(Clone)]
pub struct ChunkStore {
    tree: Tree,
}

impl ChunkStore {
    pub fn new(db: &Db) -> Result<Self, StoreError> {
        Ok(Self {
            tree: db.open_tree(CHUNKS_TREE)?,
        })
    }

    /// Persist `bytes` as a chunk of `attachment` and return the chunk id.
    /// The new chunk terminates the chain until it is linked onward.
    pub fn append_chunk(
        &self,
        attachment: ObjectId,
        bytes: &[u8],
        is_first: bool,
    ) -> Result<ObjectId, StoreError> {
        let id = if is_first {
            attachment
        } else {
            ObjectId::new()
        };
        self.tree
            .insert(id.hex_bytes(), encode(ObjectId::NIL, bytes))?;
        Ok(id)
    }

    /// Point `chunk` at `next`.
    pub fn link_next(&self, chunk: ObjectId, next: ObjectId) -> Result<(), StoreError> {
        let Some(raw) = self.tree.get(chunk.hex_bytes())? else {
            return Err(StoreError::NotFound {
                collection: CHUNKS_TREE,
                id: chunk,
            });
        };
        if raw.len() < NEXT_LEN {
            return Err(StoreError::Corrupt(format!("chunk {chunk} is truncated")));
        }
        let mut value = raw.to_vec();
        value[..NEXT_LEN].copy_from_slice(&next.hex_bytes());
        self.tree.insert(chunk.hex_bytes(), value)?;
        Ok(())
    }

    pub fn get_chunk(&self, id: ObjectId) -> Result<Option<ChunkRecord>, StoreError> {
        match self.tree.get(id.hex_bytes())? {
            Some(raw) => decode(id, &raw).map(Some),
            None => Ok(None),
        }
    }

    /// Number of stored chunks across all attachments.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Walk the chain of `attachment` one chunk at a time.
    pub fn read_chain(&self, attachment: ObjectId) -> ChainReader {
        ChainReader {
            store: self.clone(),
            attachment,
            next: Some(attachment),
            visited: HashSet::new(),
        }
    }

    /// Concatenate the whole chain in memory.
    pub fn read_all(&self, attachment: ObjectId) -> Result<Vec<u8>, StoreError> {
        let mut out = Vec::new();
        for chunk in self.read_chain(attachment) {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    /// Remove every chunk reachable from `attachment`. Missing chains are a
    /// no-op; a broken chain is removed up to the break.
    pub fn delete_chain(&self, attachment: ObjectId) -> Result<usize, StoreError> {
        let mut removed = 0;
        let mut visited = HashSet::new();
        let mut next = attachment;
        while !next.is_nil() && visited.insert(next) {
            let Some(raw) = self.tree.remove(next.hex_bytes())? else {
                break;
            };
            removed += 1;
            next = decode(next, &raw)?.next_chunk_id;
        }
        Ok(removed)
    }
}

/// Iterator over the payloads of a chunk chain.
///
/// Ends after the chunk whose next pointer is nil. A missing first chunk
/// yields `NotFound`; a missing later chunk yields `BrokenChain`; a pointer
/// back to an already visited chunk yields `CyclicChain`. The iterator always
/// stops after reporting an error.
pub struct ChainReader {
    store: ChunkStore,
    attachment: ObjectId,
    next: Option<ObjectId>,
    visited: HashSet<ObjectId>,
}

impl Iterator for ChainReader {
    type Item = Result<Bytes, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next.take()?;

        if !self.visited.insert(id) {
            return Some(Err(StoreError::CyclicChain {
                attachment: self.attachment,
                chunk: id,
            }));
        }

        match self.store.get_chunk(id) {
            Ok(Some(record)) => {
                if !record.next_chunk_id.is_nil() {
                    self.next = Some(record.next_chunk_id);
                }
                Some(Ok(record.bytes))
            }
            Ok(None) if id == self.attachment => Some(Err(StoreError::NotFound {
                collection: CHUNKS_TREE,
                id,
            })),
            Ok(None) => Some(Err(StoreError::BrokenChain {
                attachment: self.attachment,
                missing: id,
            })),
            Err(e) => Some(Err(e)),
        }
    }
}

fn encode(next: ObjectId, payload: &[u8]) -> Vec<u8> {
    let mut value = Vec::with_capacity(NEXT_LEN + payload.len());
    value.extend_from_slice(&next.hex_bytes());
    value.extend_from_slice(payload);
    value
}

fn decode(id: ObjectId, raw: &[u8]) -> Result<ChunkRecord, StoreError> {
    if raw.len() < NEXT_LEN {
        return Err(StoreError::Corrupt(format!("chunk {id} is truncated")));
    }
    let next_chunk_id = ObjectId::from_hex(&raw[..NEXT_LEN])
        .map_err(|_| StoreError::Corrupt(format!("chunk {id} has a malformed next pointer")))?;
    Ok(ChunkRecord {
        id,
        bytes: Bytes::copy_from_slice(&raw[NEXT_LEN..]),
        next_chunk_id,
    })
}

impl std::fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStore")
            .field("tree", &CHUNKS_TREE)
            .finish()
    }
}
