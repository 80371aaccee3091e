//! WebSocket transport
//!
//! The broker socket. For every connection this server:
//! - resolves an identity from the handshake (`?token=` or `session` cookie)
//! - registers a `Connection` with the broker, backed by a bounded outbound
//!   queue that a dedicated writer task drains into the socket
//! - turns control frames into broker, conversation and video operations,
//!   persisting room and private messages on the way
//! - on disconnect, unregisters the connection, leaves its video rooms and
//!   closes its conversations

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tracing::{debug, error, info, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::{BrokerHandle, ConversationHandle, Departure, PushMessage, VideoHandle, topic};
use crate::client::{Connection, Delivery};
use crate::persistence::DocumentStore;
use crate::persistence::collections::{NOTIFICATIONS, PRIVATE_MESSAGES, ROOM_MESSAGES, ROOMS, USERS};
use crate::transfer::{self, AttachmentMeta, UploadHandle};
use crate::transport::auth::{self, IdentityResolver};
use crate::transport::message::{ClientEvent, events};
use crate::utils::error::{BrokerError, TransferError};
use crate::utils::ids::{ObjectId, UserId};

/// Shared handles every broker connection works with.
#[derive(Clone)]
pub struct ServerContext {
    pub broker: BrokerHandle,
    pub conversations: ConversationHandle,
    pub video: VideoHandle,
    pub uploads: UploadHandle,
    pub store: DocumentStore,
    pub resolver: Arc<dyn IdentityResolver>,
    pub outbound_buffer: usize,
}

pub async fn start_websocket_server(listener: TcpListener, ctx: ServerContext) {
    match listener.local_addr() {
        Ok(addr) => info!("WebSocket server listening on ws://{addr}"),
        Err(e) => warn!(error = %e, "WebSocket server listening on unknown address"),
    }

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "Accept failed");
                continue;
            }
        };
        let ctx = ctx.clone();

        spawn(async move {
            let mut token = None;
            let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                token = auth::handshake_token(req);
                Ok(resp)
            };
            let ws_stream = match accept_hdr_async(stream, callback).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!(%peer, error = %e, "WebSocket handshake error");
                    return;
                }
            };

            let identity = token.and_then(|t| match ctx.resolver.resolve(&t) {
                Ok(user) => Some(user),
                Err(e) => {
                    warn!(%peer, error = %e, "Handshake token rejected, continuing anonymously");
                    None
                }
            });

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (tx, mut rx) = mpsc::channel::<WsMessage>(ctx.outbound_buffer.max(1));
            let connection = Connection::new(tx).with_identity(identity);
            let conn_id = connection.id;

            match ctx.broker.register(connection.clone()).await {
                Ok(true) => {}
                Ok(false) => {
                    let _ = ws_sender.send(WsMessage::Close(None)).await;
                    return;
                }
                Err(e) => {
                    error!(conn = %conn_id, error = %e, "Broker unavailable");
                    return;
                }
            }
            debug!(conn = %conn_id, %peer, user = ?connection.identity, "Broker connection opened");

            spawn(async move {
                while let Some(msg) = rx.recv().await {
                    if let Err(e) = ws_sender.send(msg).await {
                        debug!(conn = %conn_id, error = %e, "Failed to write to socket");
                        break;
                    }
                }
                debug!(conn = %conn_id, "Send loop closed");
            });

            let mut handler = ConnectionHandler::new(connection, ctx);
            while let Some(Ok(msg)) = ws_receiver.next().await {
                match msg {
                    WsMessage::Text(text) => {
                        let event = match serde_json::from_str::<ClientEvent>(&text) {
                            Ok(event) => event,
                            Err(err) => {
                                debug!(
                                    conn = %conn_id,
                                    error = %err,
                                    frame = %text.chars().take(100).collect::<String>(),
                                    "Invalid client event dropped"
                                );
                                continue;
                            }
                        };
                        if let Err(e) = handler.handle(event).await {
                            error!(conn = %conn_id, error = %e, "Broker stopped, closing connection");
                            break;
                        }
                    }
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }

            handler.disconnect().await;
            debug!(conn = %conn_id, "Broker connection closed");
        });
    }
}

/// Applies one connection's control frames.
pub struct ConnectionHandler {
    connection: Connection,
    ctx: ServerContext,
}

impl ConnectionHandler {
    pub fn new(connection: Connection, ctx: ServerContext) -> Self {
        Self { connection, ctx }
    }

    pub fn identity(&self) -> Option<&str> {
        self.connection.identity.as_deref()
    }

    /// Errors only when an actor is gone; everything else is handled here.
    pub async fn handle(&mut self, event: ClientEvent) -> Result<(), BrokerError> {
        let id = self.connection.id;
        match event {
            ClientEvent::OpenSubscription { name } => self.ctx.broker.subscribe(id, name).await,
            ClientEvent::CloseSubscription { name } => self.ctx.broker.unsubscribe(id, name).await,
            ClientEvent::OpenSubscriptions { names } => {
                for name in names {
                    self.ctx.broker.subscribe(id, name).await?;
                }
                Ok(())
            }
            ClientEvent::Auth { token } => self.authenticate(&token).await,
            ClientEvent::RoomMessage {
                room_id,
                content,
                attachment,
            } => self.room_message(room_id, content, attachment).await,
            ClientEvent::PrivateMessage {
                recipient_id,
                content,
                attachment,
            } => {
                self.private_message(recipient_id, content, attachment)
                    .await
            }
            ClientEvent::PrivateConversationOpen { uid } => {
                let Some(me) = self.require_identity("PRIVATE_CONVERSATION_OPEN") else {
                    return Ok(());
                };
                self.ctx.conversations.open(id, me, uid).await
            }
            ClientEvent::PrivateConversationClose { uid } => {
                let Some(me) = self.require_identity("PRIVATE_CONVERSATION_CLOSE") else {
                    return Ok(());
                };
                self.ctx.conversations.close(id, me, uid).await
            }
            ClientEvent::QueryOnlineStatus { uid } => {
                let online = self.ctx.broker.is_online(uid.clone()).await?;
                self.reply(events::USER_ONLINE_STATUS, &json!({ "uid": uid, "online": online }));
                Ok(())
            }
            ClientEvent::VidJoin { id: room } => {
                let Some(me) = self.require_identity("VID_JOIN") else {
                    return Ok(());
                };
                let peers = self.ctx.video.join(room.clone(), id, me).await?;
                self.reply(events::VID_ALL_USERS, &json!({ "id": room, "users": peers }));
                Ok(())
            }
            ClientEvent::VidLeave { id: room } => {
                if let Some(departure) = self.ctx.video.leave(room, id).await? {
                    self.announce_departure(&departure).await?;
                }
                Ok(())
            }
            ClientEvent::VidSendingSignal {
                user_to_signal,
                signal,
            } => {
                let Some(me) = self.require_identity("VID_SENDING_SIGNAL") else {
                    return Ok(());
                };
                let data = json!({ "signal": signal, "caller_id": me });
                self.direct(user_to_signal, events::VID_USER_JOINED, &data)
                    .await
            }
            ClientEvent::VidReturningSignal { caller_id, signal } => {
                let Some(me) = self.require_identity("VID_RETURNING_SIGNAL") else {
                    return Ok(());
                };
                let data = json!({ "signal": signal, "id": me });
                self.direct(caller_id, events::VID_RECEIVING_RETURNED_SIGNAL, &data)
                    .await
            }
            ClientEvent::Unknown => {
                debug!(conn = %id, "Unknown event type ignored");
                Ok(())
            }
        }
    }

    /// Leave everything this connection took part in.
    pub async fn disconnect(self) {
        let id = self.connection.id;
        if let Err(e) = self.cleanup().await {
            warn!(conn = %id, error = %e, "Cleanup after disconnect incomplete");
        }
    }

    async fn cleanup(&self) -> Result<(), BrokerError> {
        let id = self.connection.id;
        self.ctx.broker.unregister(id).await?;
        self.ctx.conversations.close_connection(id).await?;
        for departure in self.ctx.video.leave_all(id).await? {
            self.announce_departure(&departure).await?;
        }
        Ok(())
    }

    async fn authenticate(&mut self, token: &str) -> Result<(), BrokerError> {
        match self.ctx.resolver.resolve(token) {
            Ok(user) => {
                self.connection.identity = Some(user.clone());
                self.ctx.broker.register(self.connection.clone()).await?;
                info!(conn = %self.connection.id, %user, "Connection authenticated");
                self.reply(events::AUTHENTICATED, &json!({ "uid": user }));
            }
            Err(e) => {
                warn!(conn = %self.connection.id, error = %e, "Authentication failed");
                self.reply(events::AUTH_FAILED, &json!({ "reason": e.to_string() }));
            }
        }
        Ok(())
    }

    async fn room_message(
        &self,
        room: ObjectId,
        content: String,
        attachment: Option<AttachmentMeta>,
    ) -> Result<(), BrokerError> {
        let Some(me) = self.require_identity("ROOM_MESSAGE") else {
            return Ok(());
        };
        let found = self
            .ctx
            .store
            .run_blocking(move |store| store.exists(ROOMS, room))
            .await;
        match found {
            Ok(true) => {}
            Ok(false) => {
                warn!(conn = %self.connection.id, %room, "Message for unknown room dropped");
                return Ok(());
            }
            Err(e) => {
                error!(%room, error = %e, "Room lookup failed");
                return Ok(());
            }
        }

        let id = ObjectId::new();
        let doc = json!({
            "room_id": room,
            "author_id": me,
            "content": content,
            "has_attachment": attachment.is_some(),
            "created_at": chrono::Utc::now().to_rfc3339(),
        });
        let Some(message) = self
            .persist(ROOM_MESSAGES, id, doc, attachment.as_ref(), transfer::room_audience(room))
            .await?
        else {
            return Ok(());
        };

        let push = PushMessage::event(events::ROOM_MESSAGE, &message)?;
        self.ctx.broker.broadcast(topic::room(room), &push).await
    }

    async fn private_message(
        &self,
        recipient: UserId,
        content: String,
        attachment: Option<AttachmentMeta>,
    ) -> Result<(), BrokerError> {
        let Some(me) = self.require_identity("PRIVATE_MESSAGE") else {
            return Ok(());
        };
        let known = match ObjectId::from_hex(recipient.as_bytes()) {
            Ok(uid) => Some(
                self.ctx
                    .store
                    .run_blocking(move |store| store.exists(USERS, uid))
                    .await,
            ),
            Err(_) => None,
        };
        match known {
            Some(Ok(true)) => {}
            Some(Err(e)) => {
                error!(%recipient, error = %e, "Recipient lookup failed");
                return Ok(());
            }
            _ => {
                warn!(conn = %self.connection.id, %recipient, "Message for unknown user dropped");
                return Ok(());
            }
        }

        let id = ObjectId::new();
        let doc = json!({
            "sender_id": me,
            "recipient_id": recipient,
            "content": content,
            "has_attachment": attachment.is_some(),
            "created_at": chrono::Utc::now().to_rfc3339(),
        });
        let audience = transfer::private_audience(&me, &recipient);
        let Some(message) = self
            .persist(PRIVATE_MESSAGES, id, doc, attachment.as_ref(), audience.clone())
            .await?
        else {
            return Ok(());
        };

        let push = PushMessage::event(events::PRIVATE_MESSAGE, &message)?;
        self.ctx.broker.broadcast_multi(audience, &push).await?;

        if self.ctx.conversations.is_open(recipient.clone(), me.clone()).await? {
            return Ok(());
        }
        let notification = json!({
            "uid": recipient,
            "kind": events::PRIVATE_MESSAGE,
            "sender_id": me,
            "message_id": id,
            "created_at": chrono::Utc::now().to_rfc3339(),
        });
        let stored = self
            .ctx
            .store
            .run_blocking(move |store| {
                let nid = store.insert(NOTIFICATIONS, notification)?;
                store.get(NOTIFICATIONS, nid)
            })
            .await;
        match stored {
            Ok(Some(stored)) => {
                let push = PushMessage::event(events::NOTIFICATION, &stored)?;
                self.ctx.broker.broadcast(topic::inbox(&recipient), &push).await?;
            }
            Ok(None) => {}
            Err(e) => error!(%recipient, error = %e, "Could not store notification"),
        }
        Ok(())
    }

    /// Store a message (and announce its attachment, if any). Returns the
    /// stored document, or `None` when persisting failed.
    async fn persist(
        &self,
        collection: &'static str,
        id: ObjectId,
        doc: Value,
        attachment: Option<&AttachmentMeta>,
        audience: Vec<String>,
    ) -> Result<Option<Value>, BrokerError> {
        if let Some(meta) = attachment {
            match transfer::open_upload(&self.ctx.store, &self.ctx.uploads, id, meta, audience).await {
                Ok(()) => {}
                Err(TransferError::Broker(e)) => return Err(e),
                Err(e) => {
                    error!(message = %id, error = %e, "Could not register attachment");
                    return Ok(None);
                }
            }
        }

        let stored = self
            .ctx
            .store
            .run_blocking(move |store| {
                store.insert_with_id(collection, id, doc)?;
                store.get(collection, id)
            })
            .await;
        let message = match stored {
            Ok(message) => message,
            Err(e) => {
                error!(collection, message = %id, error = %e, "Could not store message");
                return Ok(None);
            }
        };

        if let Some(meta) = attachment {
            self.reply(
                events::ATTACHMENT_REQUEST,
                &json!({ "id": id, "name": meta.name, "size": meta.size }),
            );
        }
        Ok(message)
    }

    async fn announce_departure(&self, departure: &Departure) -> Result<(), BrokerError> {
        let data = json!({ "id": departure.room, "uid": departure.user });
        for peer in &departure.remaining {
            self.direct(peer.clone(), events::VID_USER_LEFT, &data).await?;
        }
        Ok(())
    }

    async fn direct<T: Serialize>(&self, user: UserId, kind: &str, data: &T) -> Result<(), BrokerError> {
        let push = PushMessage::event(kind, data)?;
        self.ctx.broker.send_direct(user, &push).await
    }

    /// Queue an event on this connection only.
    fn reply<T: Serialize>(&self, kind: &str, data: &T) {
        let msg = match PushMessage::event(kind, data).and_then(|m| m.to_ws()) {
            Ok(msg) => msg,
            Err(e) => {
                error!(kind, error = %e, "Could not encode reply");
                return;
            }
        };
        if self.connection.deliver(msg) != Delivery::Queued {
            debug!(conn = %self.connection.id, kind, "Reply not queued");
        }
    }

    fn require_identity(&self, event: &str) -> Option<UserId> {
        let identity = self.connection.identity.clone();
        if identity.is_none() {
            warn!(conn = %self.connection.id, event, "Anonymous connection, event dropped");
        }
        identity
    }
}
