//! # PopCast
//!
//! `popcast` is the real-time layer of a social site. It pushes changes of
//! posts, rooms and users to the browsers watching them, carries room and
//! private chat, relays video-call signalling, and receives chat attachments
//! over a separate binary socket.
//!
//! ## Core Modules
//!
//! - `broker`: Topics, connections and fan-out, plus the open-conversation set and video rooms.
//! - `bridge`: Follows the document store's change log and turns changes into pushes and cascading deletes.
//! - `transfer`: The binary attachment protocol: frames, upload state and the per-connection session.
//! - `client`: A connected socket as the broker sees it.
//! - `config`: Loads settings from defaults, `config/` files and `POPCAST__*` variables.
//! - `persistence`: The sled-backed document store and the attachment chunk store.
//! - `transport`: The broker WebSocket server and its control protocol.
//! - `utils`: Shared error types, object ids and logging setup.

pub mod bridge;
pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod transfer;
pub mod transport;
pub mod utils;

#[cfg(test)]
mod tests;
