use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tempfile::{TempDir, tempdir};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tungstenite::protocol::Message as WsMessage;
use tungstenite::protocol::frame::coding::CloseCode;

use crate::broker::{Broker, BrokerHandle, Conversations, PushMessage, VideoRooms, topic};
use crate::client::Connection;
use crate::config::Settings;
use crate::persistence::DocumentStore;
use crate::persistence::collections::{ATTACHMENTS, ROOMS};
use crate::transfer::session::ATTACHMENT_COMPLETE;
use crate::transfer::{
    AttachmentMeta, TransferContext, UploadHandle, Uploads, frame, open_upload, room_audience,
    start_transfer_server,
};
use crate::transport::message::events;
use crate::transport::{JwtResolver, ServerContext, start_websocket_server};

const SECRET: &str = "integration-secret";
const WAIT: Duration = Duration::from_secs(5);

struct Stack {
    _dir: TempDir,
    store: DocumentStore,
    broker: BrokerHandle,
    uploads: UploadHandle,
    jwt: Arc<JwtResolver>,
    ws_url: String,
    transfer_url: String,
}

async fn start_stack() -> Stack {
    let dir = tempdir().unwrap();
    let store = DocumentStore::open(dir.path().to_str().unwrap()).unwrap();
    let broker = Broker::default().spawn(64);
    let uploads = Uploads::new().spawn(64);
    let jwt = Arc::new(JwtResolver::new(SECRET));

    let mut settings = Settings::default().transfer;
    settings.chunk_high_water = 8;

    let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let transfer_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_url = format!("ws://{}", ws_listener.local_addr().unwrap());
    let transfer_url = format!("ws://{}", transfer_listener.local_addr().unwrap());

    let ws_ctx = ServerContext {
        broker: broker.clone(),
        conversations: Conversations::new().spawn(16),
        video: VideoRooms::new().spawn(16),
        uploads: uploads.clone(),
        store: store.clone(),
        resolver: jwt.clone(),
        outbound_buffer: 32,
    };
    let transfer_ctx = TransferContext {
        store: store.clone(),
        chunks: store.chunk_store().unwrap(),
        uploads: uploads.clone(),
        broker: broker.clone(),
        settings,
    };
    tokio::spawn(start_websocket_server(ws_listener, ws_ctx));
    tokio::spawn(start_transfer_server(transfer_listener, transfer_ctx));

    Stack {
        _dir: dir,
        store,
        broker,
        uploads,
        jwt,
        ws_url,
        transfer_url,
    }
}

async fn next_push<S>(ws: &mut S) -> PushMessage
where
    S: futures_util::Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
{
    loop {
        let msg = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a push")
            .expect("socket closed")
            .unwrap();
        if let WsMessage::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn integration_room_message_end_to_end() {
    let stack = start_stack().await;
    let room = stack.store.insert(ROOMS, json!({ "name": "lobby" })).unwrap();

    let (mut ws_a, _) = connect_async(stack.ws_url.as_str()).await.expect("client A connect");
    let token = stack.jwt.issue("bob", chrono::Duration::hours(1)).unwrap();
    let (mut ws_b, _) = connect_async(format!("{}/?token={token}", stack.ws_url))
        .await
        .expect("client B connect");

    let subscribe = json!({ "event_type": "OPEN_SUBSCRIPTION", "name": topic::room(room) });
    ws_a.send(WsMessage::text(subscribe.to_string())).await.unwrap();
    // the status reply proves the subscription went through
    let query = json!({ "event_type": "QUERY_ONLINE_STATUS", "uid": "bob" });
    ws_a.send(WsMessage::text(query.to_string())).await.unwrap();
    let status = next_push(&mut ws_a).await;
    assert_eq!(status.kind, events::USER_ONLINE_STATUS);

    let message = json!({
        "event_type": "ROOM_MESSAGE",
        "room_id": room.to_hex(),
        "content": "hello world"
    });
    ws_b.send(WsMessage::text(message.to_string())).await.unwrap();

    let push = next_push(&mut ws_a).await;
    assert_eq!(push.kind, events::ROOM_MESSAGE);
    let data = push.data_json().unwrap();
    assert_eq!(data["content"], "hello world");
    assert_eq!(data["author_id"], "bob");
}

#[tokio::test]
async fn integration_attachment_upload_end_to_end() {
    let stack = start_stack().await;
    let room = crate::utils::ids::ObjectId::new();
    let id = crate::utils::ids::ObjectId::new();
    let data: Vec<u8> = (0..30u8).collect();

    let (tx, mut rx) = mpsc::channel(16);
    let watcher = Connection::new(tx);
    let watcher_id = watcher.id;
    stack.broker.register(watcher).await.unwrap();
    stack.broker.subscribe(watcher_id, topic::room(room)).await.unwrap();

    let meta = AttachmentMeta {
        name: "notes.txt".into(),
        size: data.len() as u64,
        mime: "text/plain".into(),
    };
    open_upload(&stack.store, &stack.uploads, id, &meta, room_audience(room))
        .await
        .unwrap();

    let (mut ws, _) = connect_async(stack.transfer_url.as_str()).await.expect("transfer connect");
    for part in data.chunks(7) {
        ws.send(WsMessage::Binary(frame::encode_data(id, part))).await.unwrap();
    }
    ws.send(WsMessage::Binary(frame::encode_finish(id))).await.unwrap();

    let completed = timeout(WAIT, async {
        loop {
            let Some(WsMessage::Text(text)) = rx.recv().await else {
                panic!("watcher queue closed");
            };
            let push: PushMessage = serde_json::from_str(&text).unwrap();
            if push.kind == ATTACHMENT_COMPLETE {
                return push;
            }
        }
    })
    .await
    .expect("upload never completed");
    assert_eq!(completed.data_json().unwrap()["size"], 30);

    let chunks = stack.store.chunk_store().unwrap();
    assert_eq!(chunks.read_all(id).unwrap(), data);
    let doc = stack.store.get(ATTACHMENTS, id).unwrap().unwrap();
    assert_eq!(doc["pending"], false);

    // a malformed frame closes the transfer connection
    ws.send(WsMessage::Binary(bytes::Bytes::from_static(b"bad"))).await.unwrap();
    let closed = timeout(WAIT, async {
        while let Some(msg) = ws.next().await {
            if let Ok(WsMessage::Close(frame)) = msg {
                return frame;
            }
        }
        None
    })
    .await
    .expect("transfer connection was not closed");
    assert_eq!(closed.map(|f| f.code), Some(CloseCode::Protocol));
}
