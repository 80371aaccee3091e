//! Video-chat room membership.
//!
//! Rooms are keyed by the room or conversation id the clients agree on and
//! map each participating connection to the identity it joined as. Empty
//! rooms are removed.

use std::collections::{HashMap, HashSet};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::client::ConnectionId;
use crate::utils::error::BrokerError;
use crate::utils::ids::UserId;

/// A connection leaving a room, and who is still in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub room: String,
    pub user: UserId,
    pub remaining: Vec<UserId>,
}

#[derive(Debug, Default)]
pub struct VideoRooms {
    rooms: HashMap<String, HashMap<ConnectionId, UserId>>,
}

impl VideoRooms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn` to `room` and return the identities already present.
    pub fn join(&mut self, room: &str, conn: ConnectionId, user: UserId) -> Vec<UserId> {
        let members = self.rooms.entry(room.to_string()).or_default();
        let peers = members
            .iter()
            .filter(|(id, _)| **id != conn)
            .map(|(_, u)| u.clone())
            .collect();
        members.insert(conn, user);
        info!(conn = %conn, room, size = members.len(), "Joined video room");
        peers
    }

    pub fn leave(&mut self, room: &str, conn: &ConnectionId) -> Option<Departure> {
        let members = self.rooms.get_mut(room)?;
        let user = members.remove(conn)?;
        let remaining: Vec<UserId> = members.values().cloned().collect();
        if members.is_empty() {
            self.rooms.remove(room);
            debug!(room, "Video room emptied");
        }
        Some(Departure {
            room: room.to_string(),
            user,
            remaining,
        })
    }

    /// Remove `conn` from every room it joined.
    pub fn leave_all(&mut self, conn: &ConnectionId) -> Vec<Departure> {
        let joined: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, members)| members.contains_key(conn))
            .map(|(room, _)| room.clone())
            .collect();
        joined
            .iter()
            .filter_map(|room| self.leave(room, conn))
            .collect()
    }

    pub fn list_peers(&self, room: &str) -> HashSet<UserId> {
        self.rooms
            .get(room)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }
}

enum VideoCommand {
    Join {
        room: String,
        conn: ConnectionId,
        user: UserId,
        reply: oneshot::Sender<Vec<UserId>>,
    },
    Leave {
        room: String,
        conn: ConnectionId,
        reply: oneshot::Sender<Option<Departure>>,
    },
    LeaveAll {
        conn: ConnectionId,
        reply: oneshot::Sender<Vec<Departure>>,
    },
    ListPeers {
        room: String,
        reply: oneshot::Sender<HashSet<UserId>>,
    },
}

impl VideoRooms {
    pub fn spawn(mut self, queue_depth: usize) -> VideoHandle {
        let (tx, mut rx) = mpsc::channel::<VideoCommand>(queue_depth.max(1));
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    VideoCommand::Join {
                        room,
                        conn,
                        user,
                        reply,
                    } => {
                        let _ = reply.send(self.join(&room, conn, user));
                    }
                    VideoCommand::Leave { room, conn, reply } => {
                        let _ = reply.send(self.leave(&room, &conn));
                    }
                    VideoCommand::LeaveAll { conn, reply } => {
                        let _ = reply.send(self.leave_all(&conn));
                    }
                    VideoCommand::ListPeers { room, reply } => {
                        let _ = reply.send(self.list_peers(&room));
                    }
                }
            }
        });
        VideoHandle { tx }
    }
}

#[derive(Debug, Clone)]
pub struct VideoHandle {
    tx: mpsc::Sender<VideoCommand>,
}

impl VideoHandle {
    async fn ask<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> VideoCommand,
    ) -> Result<T, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| BrokerError::Closed("video"))?;
        rx.await.map_err(|_| BrokerError::Closed("video"))
    }

    pub async fn join(
        &self,
        room: impl Into<String>,
        conn: ConnectionId,
        user: impl Into<UserId>,
    ) -> Result<Vec<UserId>, BrokerError> {
        let (room, user) = (room.into(), user.into());
        self.ask(|reply| VideoCommand::Join {
            room,
            conn,
            user,
            reply,
        })
        .await
    }

    pub async fn leave(
        &self,
        room: impl Into<String>,
        conn: ConnectionId,
    ) -> Result<Option<Departure>, BrokerError> {
        let room = room.into();
        self.ask(|reply| VideoCommand::Leave { room, conn, reply })
            .await
    }

    pub async fn leave_all(&self, conn: ConnectionId) -> Result<Vec<Departure>, BrokerError> {
        self.ask(|reply| VideoCommand::LeaveAll { conn, reply }).await
    }

    pub async fn list_peers(&self, room: impl Into<String>) -> Result<HashSet<UserId>, BrokerError> {
        let room = room.into();
        self.ask(|reply| VideoCommand::ListPeers { room, reply })
            .await
    }
}
