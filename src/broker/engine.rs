//! Broker engine
//!
//! This module contains the in-memory broker responsible for:
//! - the registry of live connections and their identities
//! - topic membership, with the `inbox=<id>` authorization rule
//! - fan-out: broadcast, exclusive broadcast, multi-topic broadcast and
//!   direct sends to every connection of a user
//!
//! Concurrency: `Broker` itself is a plain synchronous structure. It is owned
//! by a single actor task ([`Broker::spawn`]) that applies [`BrokerCommand`]s
//! one at a time in arrival order; everything else talks to it through a
//! cloneable [`BrokerHandle`]. Delivery only pushes into each connection's
//! bounded outbound queue, so a slow socket never stalls the actor.

use std::collections::{HashMap, HashSet};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::message::PushMessage;
use crate::broker::topic::{self, Topic};
use crate::client::{Connection, ConnectionId, Delivery};
use crate::utils::error::BrokerError;
use crate::utils::ids::UserId;

#[derive(Debug)]
pub struct Registration {
    pub connection: Connection,
    pub topics: HashSet<String>,
}

#[derive(Debug)]
pub struct Broker {
    pub topics: HashMap<String, Topic>,
    pub clients: HashMap<ConnectionId, Registration>,
    max_connections: usize,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl Broker {
    pub fn new(max_connections: usize) -> Self {
        Self {
            topics: HashMap::new(),
            clients: HashMap::new(),
            max_connections,
        }
    }

    /// Add `connection` to the registry. Registering an id that is already
    /// present updates its identity (and re-checks its inbox memberships).
    /// Returns `false` when the connection limit is reached.
    pub fn register(&mut self, connection: Connection) -> bool {
        let id = connection.id;

        if let Some(existing) = self.clients.get_mut(&id) {
            let identity = connection.identity.clone();
            let changed = existing.connection.identity != identity;
            existing.connection = connection;
            if changed {
                info!(conn = %id, user = ?identity, "Connection identity updated");
                self.refresh_identity(id, identity);
            }
            return true;
        }

        if self.clients.len() >= self.max_connections {
            warn!(conn = %id, limit = self.max_connections, "Connection limit reached");
            return false;
        }

        info!(conn = %id, user = ?connection.identity, "Connection registered");
        self.clients.insert(
            id,
            Registration {
                connection,
                topics: HashSet::new(),
            },
        );
        true
    }

    fn refresh_identity(&mut self, id: ConnectionId, identity: Option<UserId>) {
        let Some(reg) = self.clients.get_mut(&id) else {
            return;
        };

        let mut revoked = Vec::new();
        for name in &reg.topics {
            if !topic::authorize(name, identity.as_deref()) {
                revoked.push(name.clone());
            } else if let Some(t) = self.topics.get_mut(name) {
                t.subscribe(id, identity.clone());
            }
        }

        for name in &revoked {
            reg.topics.remove(name);
        }
        for name in revoked {
            self.leave_topic(&id, &name);
        }
    }

    // Empty topics are dropped; a later subscribe recreates them.
    fn leave_topic(&mut self, id: &ConnectionId, name: &str) {
        let Some(t) = self.topics.get_mut(name) else {
            return;
        };
        t.unsubscribe(id);
        if t.is_empty() {
            self.topics.remove(name);
            debug!(topic = name, "Last member left, topic dropped");
        }
    }

    /// Remove a connection from the registry and from every topic. Unknown
    /// ids are ignored.
    pub fn unregister(&mut self, id: &ConnectionId) -> bool {
        let Some(reg) = self.clients.remove(id) else {
            debug!(conn = %id, "Unregister of unknown connection ignored");
            return false;
        };

        for name in &reg.topics {
            self.leave_topic(id, name);
        }

        info!(conn = %id, topics = reg.topics.len(), "Connection unregistered");
        true
    }

    /// Subscribe a registered connection to `name`, creating the topic on
    /// first use. Invalid names, unknown connections and unauthorized inbox
    /// subscriptions are dropped.
    pub fn subscribe(&mut self, id: &ConnectionId, name: &str) -> bool {
        if !topic::is_valid_name(name) {
            warn!(conn = %id, "Subscription to malformed topic name dropped");
            return false;
        }

        let Some(reg) = self.clients.get_mut(id) else {
            debug!(conn = %id, topic = name, "Subscribe from unregistered connection dropped");
            return false;
        };

        let identity = reg.connection.identity.clone();
        if !topic::authorize(name, identity.as_deref()) {
            warn!(conn = %id, topic = name, user = ?identity, "Unauthorized subscription dropped");
            return false;
        }

        reg.topics.insert(name.to_string());
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| Topic::new(name))
            .subscribe(*id, identity);

        debug!(conn = %id, topic = name, "Subscribed");
        true
    }

    pub fn unsubscribe(&mut self, id: &ConnectionId, name: &str) {
        if let Some(reg) = self.clients.get_mut(id) {
            reg.topics.remove(name);
        }
        self.leave_topic(id, name);
    }

    /// Deliver to every member of `name`. Returns how many queues accepted it.
    pub fn broadcast(&mut self, name: &str, msg: &WsMessage) -> usize {
        let Some(t) = self.topics.get(name) else {
            debug!(topic = name, "Broadcast to absent topic");
            return 0;
        };
        let targets: Vec<_> = t.members.keys().copied().collect();
        self.deliver(targets, msg)
    }

    /// Like `broadcast`, skipping members authenticated as any of `exclude`.
    pub fn broadcast_exclusive(
        &mut self,
        name: &str,
        msg: &WsMessage,
        exclude: &HashSet<UserId>,
    ) -> usize {
        let Some(t) = self.topics.get(name) else {
            return 0;
        };
        let targets: Vec<_> = t
            .members
            .iter()
            .filter(|(_, identity)| !identity.as_ref().is_some_and(|u| exclude.contains(u)))
            .map(|(id, _)| *id)
            .collect();
        self.deliver(targets, msg)
    }

    /// Deliver once to every connection that belongs to at least one of `names`.
    pub fn broadcast_multi(&mut self, names: &[String], msg: &WsMessage) -> usize {
        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for name in names {
            if let Some(t) = self.topics.get(name) {
                targets.extend(t.members.keys().copied().filter(|id| seen.insert(*id)));
            }
        }
        self.deliver(targets, msg)
    }

    /// Deliver to every registered connection of `user`, regardless of topics.
    pub fn send_direct(&mut self, user: &str, msg: &WsMessage) -> usize {
        let targets: Vec<_> = self
            .clients
            .values()
            .filter(|reg| reg.connection.is_user(user))
            .map(|reg| reg.connection.id)
            .collect();
        self.deliver(targets, msg)
    }

    /// Drop a topic and all its membership records.
    pub fn destroy_topic(&mut self, name: &str) -> bool {
        let Some(t) = self.topics.remove(name) else {
            return false;
        };
        for id in t.members.keys() {
            if let Some(reg) = self.clients.get_mut(id) {
                reg.topics.remove(name);
            }
        }
        info!(topic = name, members = t.members.len(), "Topic destroyed");
        true
    }

    pub fn is_online(&self, user: &str) -> bool {
        self.clients.values().any(|reg| reg.connection.is_user(user))
    }

    pub fn members(&self, name: &str) -> Vec<(ConnectionId, Option<UserId>)> {
        self.topics
            .get(name)
            .map(|t| {
                t.members
                    .iter()
                    .map(|(id, identity)| (*id, identity.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn deliver(&mut self, targets: Vec<ConnectionId>, msg: &WsMessage) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        for id in targets {
            let Some(reg) = self.clients.get(&id) else {
                continue;
            };
            match reg.connection.deliver(msg.clone()) {
                Delivery::Queued => delivered += 1,
                Delivery::Dropped => warn!(conn = %id, "Outbound queue full, message dropped"),
                Delivery::Closed => closed.push(id),
            }
        }

        for id in closed {
            warn!(conn = %id, "Connection writer is gone, unregistering");
            self.unregister(&id);
        }

        delivered
    }
}

pub enum BrokerCommand {
    Register {
        connection: Connection,
        reply: oneshot::Sender<bool>,
    },
    Unregister {
        id: ConnectionId,
    },
    Subscribe {
        id: ConnectionId,
        topic: String,
    },
    Unsubscribe {
        id: ConnectionId,
        topic: String,
    },
    Broadcast {
        topic: String,
        message: WsMessage,
    },
    BroadcastExclusive {
        topic: String,
        message: WsMessage,
        exclude: HashSet<UserId>,
    },
    BroadcastMulti {
        topics: Vec<String>,
        message: WsMessage,
    },
    SendDirect {
        user: UserId,
        message: WsMessage,
    },
    DestroyTopic {
        topic: String,
    },
    IsOnline {
        user: UserId,
        reply: oneshot::Sender<bool>,
    },
    Members {
        topic: String,
        reply: oneshot::Sender<Vec<(ConnectionId, Option<UserId>)>>,
    },
}

impl Broker {
    /// Move the broker into its own task and return a handle to it. The task
    /// ends once every handle has been dropped.
    pub fn spawn(self, queue_depth: usize) -> BrokerHandle {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        tokio::spawn(self.run(rx));
        BrokerHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<BrokerCommand>) {
        while let Some(cmd) = rx.recv().await {
            self.apply(cmd);
        }
        info!("Broker stopped");
    }

    pub fn apply(&mut self, cmd: BrokerCommand) {
        match cmd {
            BrokerCommand::Register { connection, reply } => {
                let _ = reply.send(self.register(connection));
            }
            BrokerCommand::Unregister { id } => {
                self.unregister(&id);
            }
            BrokerCommand::Subscribe { id, topic } => {
                self.subscribe(&id, &topic);
            }
            BrokerCommand::Unsubscribe { id, topic } => self.unsubscribe(&id, &topic),
            BrokerCommand::Broadcast { topic, message } => {
                self.broadcast(&topic, &message);
            }
            BrokerCommand::BroadcastExclusive {
                topic,
                message,
                exclude,
            } => {
                self.broadcast_exclusive(&topic, &message, &exclude);
            }
            BrokerCommand::BroadcastMulti { topics, message } => {
                self.broadcast_multi(&topics, &message);
            }
            BrokerCommand::SendDirect { user, message } => {
                self.send_direct(&user, &message);
            }
            BrokerCommand::DestroyTopic { topic } => {
                self.destroy_topic(&topic);
            }
            BrokerCommand::IsOnline { user, reply } => {
                let _ = reply.send(self.is_online(&user));
            }
            BrokerCommand::Members { topic, reply } => {
                let _ = reply.send(self.members(&topic));
            }
        }
    }
}

/// Cloneable front door to the broker actor.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    tx: mpsc::Sender<BrokerCommand>,
}

impl BrokerHandle {
    async fn send(&self, cmd: BrokerCommand) -> Result<(), BrokerError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| BrokerError::Closed("broker"))
    }

    async fn ask<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> BrokerCommand,
    ) -> Result<T, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| BrokerError::Closed("broker"))
    }

    pub async fn register(&self, connection: Connection) -> Result<bool, BrokerError> {
        self.ask(|reply| BrokerCommand::Register { connection, reply })
            .await
    }

    pub async fn unregister(&self, id: ConnectionId) -> Result<(), BrokerError> {
        self.send(BrokerCommand::Unregister { id }).await
    }

    pub async fn subscribe(&self, id: ConnectionId, topic: impl Into<String>) -> Result<(), BrokerError> {
        self.send(BrokerCommand::Subscribe {
            id,
            topic: topic.into(),
        })
        .await
    }

    pub async fn unsubscribe(&self, id: ConnectionId, topic: impl Into<String>) -> Result<(), BrokerError> {
        self.send(BrokerCommand::Unsubscribe {
            id,
            topic: topic.into(),
        })
        .await
    }

    pub async fn broadcast(&self, topic: impl Into<String>, msg: &PushMessage) -> Result<(), BrokerError> {
        self.send(BrokerCommand::Broadcast {
            topic: topic.into(),
            message: msg.to_ws()?,
        })
        .await
    }

    pub async fn broadcast_exclusive(
        &self,
        topic: impl Into<String>,
        msg: &PushMessage,
        exclude: impl IntoIterator<Item = UserId>,
    ) -> Result<(), BrokerError> {
        self.send(BrokerCommand::BroadcastExclusive {
            topic: topic.into(),
            message: msg.to_ws()?,
            exclude: exclude.into_iter().collect(),
        })
        .await
    }

    pub async fn broadcast_multi(&self, topics: Vec<String>, msg: &PushMessage) -> Result<(), BrokerError> {
        self.send(BrokerCommand::BroadcastMulti {
            topics,
            message: msg.to_ws()?,
        })
        .await
    }

    pub async fn send_direct(&self, user: impl Into<UserId>, msg: &PushMessage) -> Result<(), BrokerError> {
        self.send(BrokerCommand::SendDirect {
            user: user.into(),
            message: msg.to_ws()?,
        })
        .await
    }

    pub async fn destroy_topic(&self, topic: impl Into<String>) -> Result<(), BrokerError> {
        self.send(BrokerCommand::DestroyTopic {
            topic: topic.into(),
        })
        .await
    }

    pub async fn is_online(&self, user: impl Into<UserId>) -> Result<bool, BrokerError> {
        let user = user.into();
        self.ask(|reply| BrokerCommand::IsOnline { user, reply }).await
    }

    pub async fn members(
        &self,
        topic: impl Into<String>,
    ) -> Result<Vec<(ConnectionId, Option<UserId>)>, BrokerError> {
        let topic = topic.into();
        self.ask(|reply| BrokerCommand::Members { topic, reply }).await
    }
}
