use super::{ChangeStream, Reactor};
use crate::broker::{Broker, BrokerHandle, PushMessage};
use crate::client::Connection;
use crate::persistence::{DocumentStore, Filter, collections};
use crate::utils::ids::ObjectId;
use serde_json::json;
use std::time::Duration;
use tempfile::{TempDir, tempdir};
use tokio::sync::mpsc;
use tungstenite::protocol::Message as WsMessage;

struct Harness {
    _dir: TempDir,
    store: DocumentStore,
    broker: BrokerHandle,
    reactor: Reactor,
}

fn harness() -> Harness {
    let dir = tempdir().unwrap();
    let store = DocumentStore::open(dir.path().to_str().unwrap()).unwrap();
    let broker = Broker::default().spawn(64);
    let reactor = Reactor::new(store.clone(), store.chunk_store().unwrap(), broker.clone());
    Harness {
        _dir: dir,
        store,
        broker,
        reactor,
    }
}

impl Harness {
    fn stream(&self, collection: &'static str) -> ChangeStream {
        ChangeStream::new(
            collection,
            self.store.clone(),
            self.reactor.clone(),
            Duration::from_millis(50),
        )
    }

    async fn subscriber(&self, topics: &[String]) -> mpsc::Receiver<WsMessage> {
        let (tx, rx) = mpsc::channel(16);
        let conn = Connection::new(tx);
        let id = conn.id;
        assert!(self.broker.register(conn).await.unwrap());
        for t in topics {
            self.broker.subscribe(id, t.clone()).await.unwrap();
        }
        rx
    }

    // a query round trip guarantees every earlier broker command was applied
    async fn settle(&self) {
        self.broker.is_online("nobody").await.unwrap();
    }
}

fn decode(msg: WsMessage) -> PushMessage {
    let WsMessage::Text(text) = msg else {
        panic!("expected a text frame");
    };
    serde_json::from_str(&text).unwrap()
}

#[tokio::test]
async fn test_user_delete_cascades() {
    let h = harness();
    let user = h.store.insert(collections::USERS, json!({ "name": "u" })).unwrap();
    let other = ObjectId::new().to_hex();
    let hex = user.to_hex();

    h.store.insert(collections::POSTS, json!({ "author_id": hex })).unwrap();
    h.store.insert(collections::POSTS, json!({ "author_id": hex })).unwrap();
    h.store.insert(collections::POSTS, json!({ "author_id": other })).unwrap();
    h.store.insert(collections::ROOMS, json!({ "author_id": hex })).unwrap();
    h.store.insert_with_id(collections::PFPS, user, json!({})).unwrap();
    h.store.insert(collections::SESSIONS, json!({ "uid": hex })).unwrap();
    h.store.insert_with_id(collections::INBOXES, user, json!({})).unwrap();

    assert!(h.store.delete(collections::USERS, user).unwrap());
    assert_eq!(h.stream(collections::USERS).drain().await.unwrap(), 2);

    let by_author = Filter::eq("author_id", hex.clone());
    assert!(h.store.find(collections::POSTS, &by_author).unwrap().is_empty());
    assert!(h.store.find(collections::ROOMS, &by_author).unwrap().is_empty());
    assert!(!h.store.exists(collections::PFPS, user).unwrap());
    assert!(!h.store.exists(collections::INBOXES, user).unwrap());
    assert!(
        h.store
            .find(collections::SESSIONS, &Filter::eq("uid", hex))
            .unwrap()
            .is_empty()
    );
    assert_eq!(h.store.count(collections::POSTS).unwrap(), 1);
}

#[tokio::test]
async fn test_cursor_is_durable() {
    let h = harness();
    let user = h.store.insert(collections::USERS, json!({})).unwrap();
    h.store.delete(collections::USERS, user).unwrap();

    assert_eq!(h.stream(collections::USERS).drain().await.unwrap(), 2);
    // a fresh follower resumes after the stored cursor
    assert_eq!(h.stream(collections::USERS).drain().await.unwrap(), 0);
    assert!(h.store.load_cursor(collections::USERS).unwrap() > 0);
    assert!(h.store.changes_after(collections::USERS, 0, 10).unwrap().is_empty());
}

#[tokio::test]
async fn test_post_update_reaches_card_and_page_once() {
    let h = harness();
    let post = h.store.insert(collections::POSTS, json!({ "title": "a" })).unwrap();
    let topics = [crate::broker::topic::post_card(post), crate::broker::topic::post_page(post)];
    let mut both = h.subscriber(&topics).await;
    let mut page = h.subscriber(&topics[1..]).await;

    let mut patch = serde_json::Map::new();
    patch.insert("title".into(), json!("b"));
    h.store.update_fields(collections::POSTS, post, patch).unwrap();
    h.stream(collections::POSTS).drain().await.unwrap();
    h.settle().await;

    let msg = decode(both.try_recv().unwrap());
    assert_eq!(msg.entity.as_deref(), Some("POST"));
    assert_eq!(msg.data_json().unwrap()["title"], "b");
    assert!(both.try_recv().is_err());
    assert!(page.try_recv().is_ok());
    assert!(page.try_recv().is_err());
}

#[tokio::test]
async fn test_post_delete_cascades_and_destroys_topics() {
    let h = harness();
    let post = h.store.insert(collections::POSTS, json!({})).unwrap();
    h.store.insert_with_id(collections::POST_IMGS, post, json!({})).unwrap();
    h.store.insert_with_id(collections::POST_THUMBS, post, json!({})).unwrap();
    h.store
        .insert(collections::POST_VOTES, json!({ "post_id": post.to_hex() }))
        .unwrap();
    let card = crate::broker::topic::post_card(post);
    let mut rx = h.subscriber(std::slice::from_ref(&card)).await;

    h.store.delete(collections::POSTS, post).unwrap();
    h.stream(collections::POSTS).drain().await.unwrap();
    h.settle().await;

    assert!(!h.store.exists(collections::POST_IMGS, post).unwrap());
    assert!(!h.store.exists(collections::POST_THUMBS, post).unwrap());
    assert_eq!(h.store.count(collections::POST_VOTES).unwrap(), 0);

    let msg = decode(rx.try_recv().unwrap());
    assert_eq!(msg.method, Some(crate::broker::Method::Delete));
    assert!(h.broker.members(card).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_post_image_insert_announces_post() {
    let h = harness();
    let mut feed = h.subscriber(&[crate::broker::topic::POST_FEED.to_string()]).await;
    let post = h.store.insert(collections::POSTS, json!({ "title": "new" })).unwrap();
    h.store.insert_with_id(collections::POST_IMGS, post, json!({})).unwrap();
    // image of a post that no longer exists is skipped
    h.store
        .insert_with_id(collections::POST_IMGS, ObjectId::new(), json!({}))
        .unwrap();

    h.stream(collections::POST_IMGS).drain().await.unwrap();
    h.settle().await;

    let msg = decode(feed.try_recv().unwrap());
    assert_eq!(msg.method, Some(crate::broker::Method::Insert));
    assert_eq!(msg.data_json().unwrap()["title"], "new");
    assert!(feed.try_recv().is_err());
}

#[tokio::test]
async fn test_profile_image_update_targets_user_topic() {
    let h = harness();
    let user = ObjectId::new();
    let mut rx = h.subscriber(&[crate::broker::topic::user(user)]).await;
    h.store.insert_with_id(collections::PFPS, user, json!({})).unwrap();
    h.store.insert_with_id(collections::PFPS, user, json!({})).unwrap();

    h.stream(collections::PFPS).drain().await.unwrap();
    h.settle().await;

    // the insert is silent, the replacement is an update
    let msg = decode(rx.try_recv().unwrap());
    assert_eq!(msg.method, Some(crate::broker::Method::UpdateImage));
    assert_eq!(msg.entity.as_deref(), Some("USER"));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_room_delete_cascades() {
    let h = harness();
    let room = h.store.insert(collections::ROOMS, json!({})).unwrap();
    h.store.insert_with_id(collections::ROOM_IMGS, room, json!({})).unwrap();
    let msg = h
        .store
        .insert(collections::ROOM_MESSAGES, json!({ "room_id": room.to_hex() }))
        .unwrap();
    h.store.insert_with_id(collections::ATTACHMENTS, msg, json!({})).unwrap();
    let chunks = h.store.chunk_store().unwrap();
    chunks.append_chunk(msg, b"data", true).unwrap();
    let _rx = h.subscriber(&[crate::broker::topic::room(room)]).await;

    h.store.delete(collections::ROOMS, room).unwrap();
    h.stream(collections::ROOMS).drain().await.unwrap();
    assert!(!h.store.exists(collections::ROOM_IMGS, room).unwrap());
    assert_eq!(h.store.count(collections::ROOM_MESSAGES).unwrap(), 0);
    assert!(h.broker.members(crate::broker::topic::room(room)).await.unwrap().is_empty());

    // the removed message takes its attachment along
    h.stream(collections::ROOM_MESSAGES).drain().await.unwrap();
    assert!(!h.store.exists(collections::ATTACHMENTS, msg).unwrap());
    assert!(chunks.get_chunk(msg).unwrap().is_none());
}

#[tokio::test]
async fn test_replayed_events_are_harmless() {
    let h = harness();
    let post = h.store.insert(collections::POSTS, json!({})).unwrap();
    h.store.delete(collections::POSTS, post).unwrap();
    let stream = h.stream(collections::POSTS);
    stream.drain().await.unwrap();

    // rewind the cursor as if the last run crashed before saving it
    h.store.save_cursor(collections::POSTS, 0).unwrap();
    stream.drain().await.unwrap();
    assert_eq!(h.store.count(collections::POSTS).unwrap(), 0);
}

#[tokio::test]
async fn test_spawned_streams_follow_changes() {
    let h = harness();
    let handles = super::spawn(&h.store, h.reactor.clone(), Duration::from_millis(20));
    let post = h.store.insert(collections::POSTS, json!({})).unwrap();
    h.store.insert_with_id(collections::POST_VOTES, ObjectId::new(), json!({ "post_id": post.to_hex() })).unwrap();
    h.store.delete(collections::POSTS, post).unwrap();

    let mut remaining = 1;
    for _ in 0..100 {
        remaining = h.store.count(collections::POST_VOTES).unwrap();
        if remaining == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(remaining, 0);
    for handle in handles {
        handle.abort();
    }
}
