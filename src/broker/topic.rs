//! Topic management
//!
//! A `Topic` holds the members of one broadcast group: the connection ids
//! subscribed to it and the identity each connection had when it joined.
//! Duplicate subscriptions are a no-op.
//!
//! Topic names follow a fixed convention (`room=<id>`, `inbox=<id>`, ...).
//! The helpers below build those names so every producer addresses the same
//! audience, and [`authorize`] enforces that `inbox=<id>` is only joinable by
//! user `<id>`.

use std::collections::HashMap;

use crate::client::ConnectionId;
use crate::utils::ids::UserId;

/// Longest topic name the broker accepts.
pub const MAX_TOPIC_LEN: usize = 128;

pub const POST_FEED: &str = "post_feed";

pub fn post_card(id: impl std::fmt::Display) -> String {
    format!("post_card={id}")
}

pub fn post_page(id: impl std::fmt::Display) -> String {
    format!("post_page={id}")
}

pub fn room(id: impl std::fmt::Display) -> String {
    format!("room={id}")
}

pub fn room_card(id: impl std::fmt::Display) -> String {
    format!("room_card={id}")
}

pub fn inbox(id: impl std::fmt::Display) -> String {
    format!("inbox={id}")
}

pub fn user(id: impl std::fmt::Display) -> String {
    format!("user={id}")
}

/// Typed view of a topic name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicName<'a> {
    PostCard(&'a str),
    PostPage(&'a str),
    PostFeed,
    Room(&'a str),
    RoomCard(&'a str),
    Inbox(&'a str),
    User(&'a str),
    Other(&'a str),
}

impl<'a> TopicName<'a> {
    pub fn parse(name: &'a str) -> Self {
        if name == POST_FEED {
            return TopicName::PostFeed;
        }
        let Some((kind, id)) = name.split_once('=') else {
            return TopicName::Other(name);
        };
        match kind {
            "post_card" => TopicName::PostCard(id),
            "post_page" => TopicName::PostPage(id),
            "room" => TopicName::Room(id),
            "room_card" => TopicName::RoomCard(id),
            "inbox" => TopicName::Inbox(id),
            "user" => TopicName::User(id),
            _ => TopicName::Other(name),
        }
    }
}

/// Owner encoded in an `inbox=<id>` topic name.
pub fn inbox_owner(name: &str) -> Option<&str> {
    match TopicName::parse(name) {
        TopicName::Inbox(owner) => Some(owner),
        _ => None,
    }
}

/// Names must be non-empty, bounded and free of whitespace/control characters.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_TOPIC_LEN
        && !name.chars().any(|c| c.is_whitespace() || c.is_control())
}

/// Whether a connection authenticated as `identity` may join `name`.
pub fn authorize(name: &str, identity: Option<&str>) -> bool {
    match inbox_owner(name) {
        Some(owner) => identity == Some(owner),
        None => true,
    }
}

#[derive(Debug, Default)]
pub struct Topic {
    pub name: String,
    pub members: HashMap<ConnectionId, Option<UserId>>,
}

impl Topic {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            members: HashMap::new(),
        }
    }

    /// Add a member. Re-adding refreshes the recorded identity.
    pub fn subscribe(&mut self, id: ConnectionId, identity: Option<UserId>) {
        self.members.insert(id, identity);
    }

    pub fn unsubscribe(&mut self, id: &ConnectionId) {
        self.members.remove(id);
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.members.contains_key(id)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
