//! Document store backed by `sled`
//!
//! Each collection is a sled tree of JSON documents keyed by the hex object
//! id. Every mutation of a [`collections::LOGGED`] collection also appends a [`ChangeEvent`] to the collection's
//! change log (`changes:<collection>`), keyed by a store-wide monotonically
//! increasing sequence number. The change bridge consumes those logs from a
//! durable cursor kept in the `bridge_cursors` tree.
//!
//! Mutations and their log entries are written under one writer lock, so a
//! reader never observes sequence `n + 1` in a log before sequence `n`.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sled::{Db, Tree};
use tokio::sync::Notify;

use crate::persistence::chunk_store::ChunkStore;
use crate::utils::error::StoreError;
use crate::utils::ids::ObjectId;

/// Collection names shared with the CRUD layer.
pub mod collections {
    pub const USERS: &str = "users";
    pub const PFPS: &str = "pfps";
    pub const SESSIONS: &str = "sessions";
    pub const INBOXES: &str = "inboxes";
    pub const POSTS: &str = "posts";
    pub const POST_IMGS: &str = "post_imgs";
    pub const POST_THUMBS: &str = "post_thumbs";
    pub const POST_VOTES: &str = "post_votes";
    pub const ROOMS: &str = "rooms";
    pub const ROOM_IMGS: &str = "room_imgs";
    pub const ROOM_MESSAGES: &str = "room_messages";
    pub const PRIVATE_MESSAGES: &str = "private_messages";
    pub const NOTIFICATIONS: &str = "notifications";
    pub const ATTACHMENTS: &str = "attachments";

    /// Collections whose mutations go to a change log.
    pub const LOGGED: &[&str] = &[
        USERS,
        PFPS,
        POST_IMGS,
        POSTS,
        ROOMS,
        ROOM_MESSAGES,
        PRIVATE_MESSAGES,
    ];
}

const CURSORS_TREE: &str = "bridge_cursors";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// One entry of a collection's change log.
///
/// `document` holds the full document after inserts and updates and is
/// `None` for deletes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub seq: u64,
    pub collection: String,
    pub op: ChangeOp,
    pub id: ObjectId,
    pub document: Option<Value>,
}

/// Top-level field equality, the only query shape the core needs.
#[derive(Debug, Clone)]
pub struct Filter {
    field: String,
    value: Value,
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Self {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn matches(&self, doc: &Value) -> bool {
        doc.get(&self.field) == Some(&self.value)
    }
}

#[derive(Clone)]
pub struct DocumentStore {
    db: Db,
    write_lock: Arc<Mutex<()>>,
    changed: Arc<Notify>,
}

impl DocumentStore {
    /// Open or create a sled database at `path`.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
            write_lock: Arc::new(Mutex::new(())),
            changed: Arc::new(Notify::new()),
        })
    }

    /// Chunk storage living in the same database.
    pub fn chunk_store(&self) -> Result<ChunkStore, StoreError> {
        ChunkStore::new(&self.db)
    }

    /// Write dirty buffers to disk.
    pub fn flush(&self) -> Result<usize, StoreError> {
        Ok(self.db.flush()?)
    }

    /// Run `f` against this store on the blocking pool. Async callers go
    /// through here so sled I/O and the write lock never stall a worker.
    pub async fn run_blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&DocumentStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store)).await?
    }

    /// Woken after every logged mutation.
    pub fn changes_notifier(&self) -> Arc<Notify> {
        self.changed.clone()
    }

    pub fn get(&self, collection: &str, id: ObjectId) -> Result<Option<Value>, StoreError> {
        match self.db.open_tree(collection)?.get(id.hex_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn exists(&self, collection: &str, id: ObjectId) -> Result<bool, StoreError> {
        Ok(self.db.open_tree(collection)?.contains_key(id.hex_bytes())?)
    }

    pub fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<(ObjectId, Value)>, StoreError> {
        let tree = self.db.open_tree(collection)?;
        let mut found = Vec::new();
        for entry in tree.iter() {
            let (key, raw) = entry?;
            let doc: Value = serde_json::from_slice(&raw)?;
            if filter.matches(&doc) {
                found.push((decode_key(&key)?, doc));
            }
        }
        Ok(found)
    }

    /// Insert `doc` under a fresh id and return it.
    pub fn insert(&self, collection: &str, doc: Value) -> Result<ObjectId, StoreError> {
        let id = ObjectId::new();
        self.insert_with_id(collection, id, doc)?;
        Ok(id)
    }

    /// Insert (or replace) `doc` under `id`. The id is mirrored into the
    /// document's `id` field.
    pub fn insert_with_id(&self, collection: &str, id: ObjectId, doc: Value) -> Result<(), StoreError> {
        let doc = with_id(doc, id)?;
        let _guard = self.lock();
        let tree = self.db.open_tree(collection)?;
        let previous = tree.insert(id.hex_bytes(), serde_json::to_vec(&doc)?)?;
        let op = if previous.is_some() {
            ChangeOp::Update
        } else {
            ChangeOp::Insert
        };
        self.log_change(collection, op, id, Some(doc))?;
        Ok(())
    }

    /// Merge `fields` into an existing document. Returns the updated document,
    /// or `None` when there is nothing to update.
    pub fn update_fields(
        &self,
        collection: &str,
        id: ObjectId,
        fields: Map<String, Value>,
    ) -> Result<Option<Value>, StoreError> {
        let _guard = self.lock();
        let tree = self.db.open_tree(collection)?;
        let Some(raw) = tree.get(id.hex_bytes())? else {
            return Ok(None);
        };
        let mut doc: Value = serde_json::from_slice(&raw)?;
        let Some(obj) = doc.as_object_mut() else {
            return Err(StoreError::Corrupt(format!("{collection}/{id} is not an object")));
        };
        for (key, value) in fields {
            if key != "id" {
                obj.insert(key, value);
            }
        }
        tree.insert(id.hex_bytes(), serde_json::to_vec(&doc)?)?;
        self.log_change(collection, ChangeOp::Update, id, Some(doc.clone()))?;
        Ok(Some(doc))
    }

    /// Delete one document. Deleting an absent document is a no-op and logs nothing.
    pub fn delete(&self, collection: &str, id: ObjectId) -> Result<bool, StoreError> {
        let _guard = self.lock();
        let tree = self.db.open_tree(collection)?;
        if tree.remove(id.hex_bytes())?.is_none() {
            return Ok(false);
        }
        self.log_change(collection, ChangeOp::Delete, id, None)?;
        Ok(true)
    }

    /// Delete every document matching `filter`; returns how many were removed.
    pub fn delete_many(&self, collection: &str, filter: &Filter) -> Result<usize, StoreError> {
        let mut removed = 0;
        for (id, _) in self.find(collection, filter)? {
            if self.delete(collection, id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn count(&self, collection: &str) -> Result<usize, StoreError> {
        Ok(self.db.open_tree(collection)?.len())
    }

    /// Change events of `collection` with a sequence number above `after`,
    /// oldest first, at most `limit` of them.
    pub fn changes_after(
        &self,
        collection: &str,
        after: u64,
        limit: usize,
    ) -> Result<Vec<ChangeEvent>, StoreError> {
        let log = self.change_log(collection)?;
        let Some(start) = after.checked_add(1) else {
            return Ok(Vec::new());
        };
        let mut events = Vec::new();
        for entry in log.range(start.to_be_bytes()..).take(limit) {
            let (_, raw) = entry?;
            events.push(serde_json::from_slice(&raw)?);
        }
        Ok(events)
    }

    /// Drop log entries up to and including `upto`; they have been processed.
    pub fn prune_changes(&self, collection: &str, upto: u64) -> Result<usize, StoreError> {
        let log = self.change_log(collection)?;
        let mut pruned = 0;
        for entry in log.range(..=upto.to_be_bytes()) {
            let (key, _) = entry?;
            log.remove(key)?;
            pruned += 1;
        }
        Ok(pruned)
    }

    pub fn load_cursor(&self, collection: &str) -> Result<u64, StoreError> {
        let cursors = self.db.open_tree(CURSORS_TREE)?;
        match cursors.get(collection)? {
            Some(raw) => {
                let bytes: [u8; 8] = raw[..]
                    .try_into()
                    .map_err(|_| StoreError::Corrupt(format!("cursor of {collection}")))?;
                Ok(u64::from_be_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    pub fn save_cursor(&self, collection: &str, seq: u64) -> Result<(), StoreError> {
        let cursors = self.db.open_tree(CURSORS_TREE)?;
        cursors.insert(collection, seq.to_be_bytes().to_vec())?;
        cursors.flush()?;
        Ok(())
    }

    fn change_log(&self, collection: &str) -> Result<Tree, StoreError> {
        Ok(self.db.open_tree(format!("changes:{collection}"))?)
    }

    // Caller holds the writer lock.
    fn log_change(
        &self,
        collection: &str,
        op: ChangeOp,
        id: ObjectId,
        document: Option<Value>,
    ) -> Result<(), StoreError> {
        if !collections::LOGGED.contains(&collection) {
            return Ok(());
        }
        // generate_id is monotonic, and +1 keeps 0 free as the "nothing seen" cursor
        let seq = self.db.generate_id()? + 1;
        let event = ChangeEvent {
            seq,
            collection: collection.to_string(),
            op,
            id,
            document,
        };
        self.change_log(collection)?
            .insert(seq.to_be_bytes(), serde_json::to_vec(&event)?)?;
        self.changed.notify_waiters();
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn with_id(doc: Value, id: ObjectId) -> Result<Value, StoreError> {
    match doc {
        Value::Object(mut obj) => {
            obj.insert("id".to_string(), Value::String(id.to_hex()));
            Ok(Value::Object(obj))
        }
        other => Err(StoreError::Corrupt(format!(
            "documents must be JSON objects, got {other}"
        ))),
    }
}

fn decode_key(key: &[u8]) -> Result<ObjectId, StoreError> {
    ObjectId::from_hex(key).map_err(|_| StoreError::Corrupt("non-hex document key".to_string()))
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("db", &"sled::Db")
            .finish()
    }
}
