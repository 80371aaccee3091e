//! The subscription broker: connection registry, topics, fan-out, and the
//! two side tables clients coordinate through (open conversations and video
//! rooms). Each of the three runs as its own actor.

pub mod engine;
pub mod message;
pub mod presence;
pub mod topic;
pub mod video;

pub use engine::{Broker, BrokerHandle};
pub use message::{Method, PushMessage};
pub use presence::{ConversationHandle, Conversations};
pub use video::{Departure, VideoHandle, VideoRooms};
