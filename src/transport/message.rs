use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::transfer::AttachmentMeta;
use crate::utils::ids::{ObjectId, UserId};

/// Control frames a client sends on the broker socket.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "event_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientEvent {
    OpenSubscription {
        name: String,
    },
    CloseSubscription {
        name: String,
    },
    OpenSubscriptions {
        names: Vec<String>,
    },
    Auth {
        token: String,
    },
    RoomMessage {
        room_id: ObjectId,
        content: String,
        #[serde(default)]
        attachment: Option<AttachmentMeta>,
    },
    PrivateMessage {
        recipient_id: UserId,
        content: String,
        #[serde(default)]
        attachment: Option<AttachmentMeta>,
    },
    PrivateConversationOpen {
        uid: UserId,
    },
    PrivateConversationClose {
        uid: UserId,
    },
    QueryOnlineStatus {
        uid: UserId,
    },
    VidJoin {
        id: String,
    },
    VidLeave {
        id: String,
    },
    VidSendingSignal {
        user_to_signal: UserId,
        signal: Value,
    },
    VidReturningSignal {
        caller_id: UserId,
        signal: Value,
    },
    /// Any `event_type` this server does not know.
    #[serde(other)]
    Unknown,
}

/// `TYPE`s of the events the broker socket pushes.
pub mod events {
    pub const AUTHENTICATED: &str = "AUTHENTICATED";
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    pub const ROOM_MESSAGE: &str = "ROOM_MESSAGE";
    pub const PRIVATE_MESSAGE: &str = "PRIVATE_MESSAGE";
    pub const NOTIFICATION: &str = "NOTIFICATION";
    pub const USER_ONLINE_STATUS: &str = "USER_ONLINE_STATUS";
    pub const ATTACHMENT_REQUEST: &str = "ATTACHMENT_REQUEST";
    pub const VID_ALL_USERS: &str = "VID_ALL_USERS";
    pub const VID_USER_JOINED: &str = "VID_USER_JOINED";
    pub const VID_RECEIVING_RETURNED_SIGNAL: &str = "VID_RECEIVING_RETURNED_SIGNAL";
    pub const VID_USER_LEFT: &str = "VID_USER_LEFT";
}
