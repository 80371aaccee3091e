//! The `client` module defines the broker's view of a connected socket.
//!
//! A `Connection` carries the connection's id, the identity it authenticated
//! as (if any) and the sending side of its bounded outbound queue. A writer
//! task per socket drains that queue, so nothing that delivers to a
//! connection ever waits on its socket.

pub mod connection;
pub use connection::{Connection, ConnectionId, Delivery};
