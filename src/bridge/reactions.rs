//! Per-collection reactions to change events.
//!
//! Every reaction is safe to apply more than once: cascading deletes of
//! absent records are no-ops, and broadcasting to an empty or destroyed
//! topic reaches nobody.

use serde_json::{Value, json};
use tracing::{debug, info};

use crate::broker::message::{Method, PushMessage};
use crate::broker::{BrokerHandle, topic};
use crate::persistence::collections::{
    self, ATTACHMENTS, INBOXES, PFPS, POST_IMGS, POST_THUMBS, POST_VOTES, POSTS,
    PRIVATE_MESSAGES, ROOM_IMGS, ROOM_MESSAGES, ROOMS, SESSIONS, USERS,
};
use crate::persistence::{ChangeEvent, ChangeOp, ChunkStore, DocumentStore, Filter};
use crate::utils::error::BridgeError;
use crate::utils::ids::ObjectId;

/// Collections the bridge follows.
pub const WATCHED: &[&str] = collections::LOGGED;

const ENTITY_USER: &str = "USER";
const ENTITY_POST: &str = "POST";

#[derive(Debug, Clone)]
pub struct Reactor {
    store: DocumentStore,
    chunks: ChunkStore,
    broker: BrokerHandle,
}

impl Reactor {
    pub fn new(store: DocumentStore, chunks: ChunkStore, broker: BrokerHandle) -> Self {
        Self {
            store,
            chunks,
            broker,
        }
    }

    pub async fn react(&self, event: &ChangeEvent) -> Result<(), BridgeError> {
        let id = event.id;
        match (event.collection.as_str(), event.op) {
            (USERS, ChangeOp::Delete) => self.user_deleted(id).await,
            (PFPS, ChangeOp::Update) => self.profile_image_updated(id).await,
            (POST_IMGS, ChangeOp::Insert) => self.post_image_inserted(id).await,
            (POST_IMGS, ChangeOp::Update) => self.post_image_updated(id).await,
            (POSTS, ChangeOp::Update) => self.post_updated(id, event.document.as_ref()).await,
            (POSTS, ChangeOp::Delete) => self.post_deleted(id).await,
            (ROOMS, ChangeOp::Delete) => self.room_deleted(id).await,
            (ROOM_MESSAGES | PRIVATE_MESSAGES, ChangeOp::Delete) => self.message_deleted(id).await,
            _ => Ok(()),
        }
    }

    async fn user_deleted(&self, id: ObjectId) -> Result<(), BridgeError> {
        let (posts, rooms, sessions) = self
            .store
            .run_blocking(move |store| {
                let by_author = Filter::eq("author_id", id.to_hex());
                let posts = store.delete_many(POSTS, &by_author)?;
                let rooms = store.delete_many(ROOMS, &by_author)?;
                store.delete(PFPS, id)?;
                let sessions = store.delete_many(SESSIONS, &Filter::eq("uid", id.to_hex()))?;
                store.delete(INBOXES, id)?;
                Ok((posts, rooms, sessions))
            })
            .await?;
        info!(user = %id, posts, rooms, sessions, "User deleted, dependents removed");
        Ok(())
    }

    async fn profile_image_updated(&self, id: ObjectId) -> Result<(), BridgeError> {
        let msg = PushMessage::change(Method::UpdateImage, ENTITY_USER, &json!({ "id": id }))?;
        self.broker.broadcast(topic::user(id), &msg).await?;
        Ok(())
    }

    async fn post_image_inserted(&self, id: ObjectId) -> Result<(), BridgeError> {
        let post = self
            .store
            .run_blocking(move |store| store.get(POSTS, id))
            .await?;
        let Some(post) = post else {
            debug!(post = %id, "Image for missing post, nothing to announce");
            return Ok(());
        };
        let msg = PushMessage::change(Method::Insert, ENTITY_POST, &post)?;
        self.broker.broadcast(topic::POST_FEED, &msg).await?;
        Ok(())
    }

    async fn post_image_updated(&self, id: ObjectId) -> Result<(), BridgeError> {
        let msg = PushMessage::change(Method::UpdateImage, ENTITY_POST, &json!({ "id": id }))?;
        self.broker.broadcast_multi(post_topics(id), &msg).await?;
        Ok(())
    }

    async fn post_updated(&self, id: ObjectId, post: Option<&Value>) -> Result<(), BridgeError> {
        let fallback = json!({ "id": id });
        let msg = PushMessage::change(Method::Update, ENTITY_POST, post.unwrap_or(&fallback))?;
        self.broker.broadcast_multi(post_topics(id), &msg).await?;
        Ok(())
    }

    async fn post_deleted(&self, id: ObjectId) -> Result<(), BridgeError> {
        let votes = self
            .store
            .run_blocking(move |store| {
                store.delete(POST_IMGS, id)?;
                store.delete(POST_THUMBS, id)?;
                store.delete_many(POST_VOTES, &Filter::eq("post_id", id.to_hex()))
            })
            .await?;
        debug!(post = %id, votes, "Post dependents removed");

        let msg = PushMessage::change(Method::Delete, ENTITY_POST, &json!({ "id": id }))?;
        self.broker.broadcast(topic::post_card(id), &msg).await?;
        self.broker.destroy_topic(topic::post_card(id)).await?;
        self.broker.destroy_topic(topic::post_page(id)).await?;
        Ok(())
    }

    async fn room_deleted(&self, id: ObjectId) -> Result<(), BridgeError> {
        let messages = self
            .store
            .run_blocking(move |store| {
                store.delete(ROOM_IMGS, id)?;
                store.delete_many(ROOM_MESSAGES, &Filter::eq("room_id", id.to_hex()))
            })
            .await?;
        info!(room = %id, messages, "Room deleted, dependents removed");

        self.broker.destroy_topic(topic::room(id)).await?;
        self.broker.destroy_topic(topic::room_card(id)).await?;
        Ok(())
    }

    // attachments share the id of the message that carries them
    async fn message_deleted(&self, id: ObjectId) -> Result<(), BridgeError> {
        let chunks = self.chunks.clone();
        let removed = self
            .store
            .run_blocking(move |store| {
                if !store.delete(ATTACHMENTS, id)? {
                    return Ok(None);
                }
                chunks.delete_chain(id).map(Some)
            })
            .await?;
        if let Some(chunks) = removed {
            debug!(attachment = %id, chunks, "Attachment removed with its message");
        }
        Ok(())
    }
}

fn post_topics(id: ObjectId) -> Vec<String> {
    vec![topic::post_card(id), topic::post_page(id)]
}
