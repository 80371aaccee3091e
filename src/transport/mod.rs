//! The `transport` module is responsible for handling network communication
//! with clients over the broker socket.
//!
//! It defines the control protocol clients speak (`message`), how a
//! connection proves who it is (`auth`), and the WebSocket server that turns
//! control frames into broker operations (`websocket`).

pub mod auth;
pub mod message;
pub mod websocket;

pub use auth::{IdentityResolver, JwtResolver};
pub use message::ClientEvent;
pub use websocket::{ConnectionHandler, ServerContext, start_websocket_server};

#[cfg(test)]
mod tests;
