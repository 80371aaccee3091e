use std::sync::Arc;

use crate::broker::{Broker, Conversations, PushMessage, VideoRooms};
use crate::client::Connection;
use crate::persistence::DocumentStore;
use crate::persistence::collections::{ATTACHMENTS, NOTIFICATIONS, PRIVATE_MESSAGES, ROOMS, USERS};
use crate::transfer::Uploads;
use crate::transport::auth::{IdentityResolver, JwtResolver, handshake_token};
use crate::transport::message::{ClientEvent, events};
use crate::transport::{ConnectionHandler, ServerContext};
use crate::utils::error::AuthError;
use crate::utils::ids::ObjectId;
use serde_json::json;
use tempfile::{TempDir, tempdir};
use tokio::sync::mpsc;
use tungstenite::handshake::server::Request;
use tungstenite::protocol::Message as WsMessage;

const SECRET: &str = "test-secret";

struct Harness {
    _dir: TempDir,
    ctx: ServerContext,
    jwt: Arc<JwtResolver>,
}

fn harness() -> Harness {
    let dir = tempdir().unwrap();
    let store = DocumentStore::open(dir.path().to_str().unwrap()).unwrap();
    let jwt = Arc::new(JwtResolver::new(SECRET));
    let ctx = ServerContext {
        broker: Broker::default().spawn(64),
        conversations: Conversations::new().spawn(16),
        video: VideoRooms::new().spawn(16),
        uploads: Uploads::new().spawn(16),
        store,
        resolver: jwt.clone(),
        outbound_buffer: 32,
    };
    Harness {
        _dir: dir,
        ctx,
        jwt,
    }
}

impl Harness {
    async fn connect(&self, identity: Option<&str>) -> (ConnectionHandler, mpsc::Receiver<WsMessage>) {
        let (tx, rx) = mpsc::channel(32);
        let conn = Connection::new(tx).with_identity(identity.map(str::to_string));
        assert!(self.ctx.broker.register(conn.clone()).await.unwrap());
        (ConnectionHandler::new(conn, self.ctx.clone()), rx)
    }

    fn user(&self) -> String {
        self.ctx.store.insert(USERS, json!({})).unwrap().to_hex()
    }

    async fn settle(&self) {
        self.ctx.broker.is_online("nobody").await.unwrap();
    }
}

fn event(value: serde_json::Value) -> ClientEvent {
    serde_json::from_value(value).unwrap()
}

fn received(rx: &mut mpsc::Receiver<WsMessage>) -> Vec<PushMessage> {
    let mut out = Vec::new();
    while let Ok(WsMessage::Text(text)) = rx.try_recv() {
        out.push(serde_json::from_str(&text).unwrap());
    }
    out
}

fn kinds(rx: &mut mpsc::Receiver<WsMessage>) -> Vec<String> {
    received(rx).into_iter().map(|m| m.kind).collect()
}

#[test]
fn test_parse_client_events() {
    assert_eq!(
        event(json!({ "event_type": "OPEN_SUBSCRIPTION", "name": "room=1" })),
        ClientEvent::OpenSubscription {
            name: "room=1".into()
        }
    );
    assert_eq!(
        event(json!({ "event_type": "OPEN_SUBSCRIPTIONS", "names": ["a", "b"] })),
        ClientEvent::OpenSubscriptions {
            names: vec!["a".into(), "b".into()]
        }
    );
    assert_eq!(
        event(json!({ "event_type": "SOMETHING_NEW", "x": 1 })),
        ClientEvent::Unknown
    );

    let room = ObjectId::new();
    let parsed = event(json!({
        "event_type": "ROOM_MESSAGE",
        "room_id": room.to_hex(),
        "content": "hi",
        "attachment": { "name": "a.png", "size": 3, "mime": "image/png" }
    }));
    let ClientEvent::RoomMessage {
        room_id,
        attachment,
        ..
    } = parsed
    else {
        panic!("expected a room message");
    };
    assert_eq!(room_id, room);
    assert_eq!(attachment.unwrap().size, 3);

    let bad_room = json!({ "event_type": "ROOM_MESSAGE", "room_id": "nope", "content": "" });
    assert!(serde_json::from_value::<ClientEvent>(bad_room).is_err());
}

#[test]
fn test_jwt_resolver() {
    let jwt = JwtResolver::new(SECRET);
    let token = jwt.issue("u1", chrono::Duration::hours(1)).unwrap();
    assert_eq!(jwt.resolve(&token).unwrap(), "u1");

    let other = JwtResolver::new("another-secret");
    assert!(matches!(other.resolve(&token), Err(AuthError::Token(_))));
    assert!(matches!(jwt.resolve(""), Err(AuthError::Missing)));

    let expired = jwt.issue("u1", chrono::Duration::hours(-2)).unwrap();
    assert!(jwt.resolve(&expired).is_err());
}

#[test]
fn test_handshake_token_sources() {
    let req = Request::builder()
        .uri("ws://localhost/?a=1&token=abc")
        .body(())
        .unwrap();
    assert_eq!(handshake_token(&req).as_deref(), Some("abc"));

    let req = Request::builder()
        .uri("ws://localhost/")
        .header("Cookie", "theme=dark; session=xyz")
        .body(())
        .unwrap();
    assert_eq!(handshake_token(&req).as_deref(), Some("xyz"));

    let req = Request::builder()
        .uri("ws://localhost/")
        .header("Cookie", "sessionid=nope")
        .body(())
        .unwrap();
    assert!(handshake_token(&req).is_none());
}

#[tokio::test]
async fn test_auth_frame_unlocks_inbox() {
    let h = harness();
    let (mut handler, mut rx) = h.connect(None).await;
    let inbox = json!({ "event_type": "OPEN_SUBSCRIPTION", "name": "inbox=u1" });

    handler.handle(event(inbox.clone())).await.unwrap();
    h.settle().await;
    assert!(h.ctx.broker.members("inbox=u1").await.unwrap().is_empty());

    handler
        .handle(event(json!({ "event_type": "AUTH", "token": "garbage" })))
        .await
        .unwrap();
    assert_eq!(kinds(&mut rx), vec![events::AUTH_FAILED]);
    assert!(handler.identity().is_none());

    let token = h.jwt.issue("u1", chrono::Duration::hours(1)).unwrap();
    handler
        .handle(event(json!({ "event_type": "AUTH", "token": token })))
        .await
        .unwrap();
    assert_eq!(kinds(&mut rx), vec![events::AUTHENTICATED]);
    assert_eq!(handler.identity(), Some("u1"));

    handler.handle(event(inbox)).await.unwrap();
    assert_eq!(h.ctx.broker.members("inbox=u1").await.unwrap().len(), 1);
    assert!(h.ctx.broker.is_online("u1").await.unwrap());
}

#[tokio::test]
async fn test_room_message_reaches_subscribers() {
    let h = harness();
    let room = h.ctx.store.insert(ROOMS, json!({ "name": "r" })).unwrap();
    let (mut a, mut rx_a) = h.connect(Some("alice")).await;
    let (mut b, _rx_b) = h.connect(Some("bob")).await;
    let (_c, mut rx_c) = h.connect(Some("carol")).await;

    a.handle(event(json!({ "event_type": "OPEN_SUBSCRIPTION", "name": format!("room={room}") })))
        .await
        .unwrap();
    b.handle(event(json!({
        "event_type": "ROOM_MESSAGE",
        "room_id": room.to_hex(),
        "content": "hello 42"
    })))
    .await
    .unwrap();
    h.settle().await;

    let got = received(&mut rx_a);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].kind, events::ROOM_MESSAGE);
    let data = got[0].data_json().unwrap();
    assert_eq!(data["content"], "hello 42");
    assert_eq!(data["author_id"], "bob");
    assert!(rx_c.try_recv().is_err());
}

#[tokio::test]
async fn test_room_message_requirements() {
    let h = harness();
    let room = h.ctx.store.insert(ROOMS, json!({})).unwrap();
    let (mut anon, _rx) = h.connect(None).await;
    let (mut user, _rx2) = h.connect(Some("u")).await;

    anon.handle(event(json!({ "event_type": "ROOM_MESSAGE", "room_id": room.to_hex(), "content": "x" })))
        .await
        .unwrap();
    user.handle(event(json!({
        "event_type": "ROOM_MESSAGE",
        "room_id": ObjectId::new().to_hex(),
        "content": "x"
    })))
    .await
    .unwrap();
    assert_eq!(h.ctx.store.count(crate::persistence::collections::ROOM_MESSAGES).unwrap(), 0);
}

#[tokio::test]
async fn test_private_message_notifies_unless_conversation_open() {
    let h = harness();
    let alice = h.user();
    let bob = h.user();
    let (mut a, mut rx_a) = h.connect(Some(&alice)).await;
    let (mut b, mut rx_b) = h.connect(Some(&bob)).await;
    a.handle(event(json!({ "event_type": "OPEN_SUBSCRIPTION", "name": format!("inbox={alice}") })))
        .await
        .unwrap();
    b.handle(event(json!({ "event_type": "OPEN_SUBSCRIPTION", "name": format!("inbox={bob}") })))
        .await
        .unwrap();

    let msg = json!({ "event_type": "PRIVATE_MESSAGE", "recipient_id": bob, "content": "hey" });
    a.handle(event(msg.clone())).await.unwrap();
    h.settle().await;

    assert_eq!(kinds(&mut rx_a), vec![events::PRIVATE_MESSAGE]);
    assert_eq!(kinds(&mut rx_b), vec![events::PRIVATE_MESSAGE, events::NOTIFICATION]);
    assert_eq!(h.ctx.store.count(NOTIFICATIONS).unwrap(), 1);

    b.handle(event(json!({ "event_type": "PRIVATE_CONVERSATION_OPEN", "uid": alice })))
        .await
        .unwrap();
    a.handle(event(msg)).await.unwrap();
    h.settle().await;

    assert_eq!(kinds(&mut rx_b), vec![events::PRIVATE_MESSAGE]);
    assert_eq!(h.ctx.store.count(NOTIFICATIONS).unwrap(), 1);
    assert_eq!(h.ctx.store.count(PRIVATE_MESSAGES).unwrap(), 2);
}

#[tokio::test]
async fn test_private_message_to_unknown_user_is_dropped() {
    let h = harness();
    let (mut a, _rx) = h.connect(Some("alice")).await;
    a.handle(event(json!({ "event_type": "PRIVATE_MESSAGE", "recipient_id": "ghost", "content": "x" })))
        .await
        .unwrap();
    a.handle(event(json!({
        "event_type": "PRIVATE_MESSAGE",
        "recipient_id": ObjectId::new().to_hex(),
        "content": "x"
    })))
    .await
    .unwrap();
    assert_eq!(h.ctx.store.count(PRIVATE_MESSAGES).unwrap(), 0);
}

#[tokio::test]
async fn test_attachment_is_requested_from_sender() {
    let h = harness();
    let room = h.ctx.store.insert(ROOMS, json!({})).unwrap();
    let (mut a, mut rx) = h.connect(Some("alice")).await;

    a.handle(event(json!({
        "event_type": "ROOM_MESSAGE",
        "room_id": room.to_hex(),
        "content": "see file",
        "attachment": { "name": "a.txt", "size": 5, "mime": "text/plain" }
    })))
    .await
    .unwrap();

    let got = received(&mut rx);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].kind, events::ATTACHMENT_REQUEST);
    let data = got[0].data_json().unwrap();
    let id: ObjectId = data["id"].as_str().unwrap().parse().unwrap();
    assert_eq!(data["size"], 5);

    let doc = h.ctx.store.get(ATTACHMENTS, id).unwrap().unwrap();
    assert_eq!(doc["pending"], true);
    let state = h.ctx.uploads.get(id).await.unwrap().unwrap();
    assert_eq!(state.total, 5);
    assert_eq!(state.audience, vec![format!("room={room}")]);
}

#[tokio::test]
async fn test_online_status_query() {
    let h = harness();
    let (mut a, mut rx) = h.connect(None).await;
    let (_b, _rx_b) = h.connect(Some("bob")).await;

    a.handle(event(json!({ "event_type": "QUERY_ONLINE_STATUS", "uid": "bob" })))
        .await
        .unwrap();
    a.handle(event(json!({ "event_type": "QUERY_ONLINE_STATUS", "uid": "zed" })))
        .await
        .unwrap();

    let got = received(&mut rx);
    assert_eq!(got[0].data_json().unwrap()["online"], true);
    assert_eq!(got[1].data_json().unwrap()["online"], false);
}

#[tokio::test]
async fn test_video_signaling() {
    let h = harness();
    let (mut a, mut rx_a) = h.connect(Some("alice")).await;
    let (mut b, mut rx_b) = h.connect(Some("bob")).await;

    a.handle(event(json!({ "event_type": "VID_JOIN", "id": "call" }))).await.unwrap();
    b.handle(event(json!({ "event_type": "VID_JOIN", "id": "call" }))).await.unwrap();
    let joined = received(&mut rx_b);
    assert_eq!(joined[0].kind, events::VID_ALL_USERS);
    assert_eq!(joined[0].data_json().unwrap()["users"], json!(["alice"]));
    received(&mut rx_a);

    b.handle(event(json!({
        "event_type": "VID_SENDING_SIGNAL",
        "user_to_signal": "alice",
        "signal": { "sdp": "offer" }
    })))
    .await
    .unwrap();
    h.settle().await;
    let offer = received(&mut rx_a);
    assert_eq!(offer[0].kind, events::VID_USER_JOINED);
    assert_eq!(offer[0].data_json().unwrap()["caller_id"], "bob");

    a.handle(event(json!({
        "event_type": "VID_RETURNING_SIGNAL",
        "caller_id": "bob",
        "signal": { "sdp": "answer" }
    })))
    .await
    .unwrap();
    h.settle().await;
    assert_eq!(kinds(&mut rx_b), vec![events::VID_RECEIVING_RETURNED_SIGNAL]);

    b.disconnect().await;
    h.settle().await;
    let left = received(&mut rx_a);
    assert_eq!(left[0].kind, events::VID_USER_LEFT);
    assert_eq!(left[0].data_json().unwrap()["uid"], "bob");
    assert!(!h.ctx.broker.is_online("bob").await.unwrap());
    assert_eq!(h.ctx.video.list_peers("call").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_disconnect_closes_conversations() {
    let h = harness();
    let (mut a, _rx) = h.connect(Some("alice")).await;
    a.handle(event(json!({ "event_type": "PRIVATE_CONVERSATION_OPEN", "uid": "bob" })))
        .await
        .unwrap();
    assert!(h.ctx.conversations.is_open("alice", "bob").await.unwrap());

    a.disconnect().await;
    assert!(!h.ctx.conversations.is_open("alice", "bob").await.unwrap());
}
