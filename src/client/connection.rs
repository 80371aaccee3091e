use tokio::sync::mpsc::{self, error::TrySendError};
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::utils::ids::UserId;

pub type ConnectionId = Uuid;

/// Outcome of handing a message to a connection's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The queue is full; this message was dropped for this connection only.
    Dropped,
    /// The writer side is gone; the connection should be unregistered.
    Closed,
}

#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub identity: Option<UserId>,
    pub sender: mpsc::Sender<WsMessage>,
}

impl Connection {
    /// Create an anonymous connection around `sender`.
    pub fn new(sender: mpsc::Sender<WsMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity: None,
            sender,
        }
    }

    pub fn with_identity(mut self, identity: Option<UserId>) -> Self {
        self.identity = identity;
        self
    }

    /// Queue `msg` without waiting.
    pub fn deliver(&self, msg: WsMessage) -> Delivery {
        match self.sender.try_send(msg) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::Dropped,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    pub fn is_user(&self, user: &str) -> bool {
        self.identity.as_deref() == Some(user)
    }
}
