//! isoworker transport: one WebSocket connection, many logical channels.
//!
//! - [`Multiplexer`]: frames messages, queues them until the handshake and
//!   routes port traffic by channel id
//! - [`serve`] / [`connect`]: the host and guest ends of the socket

mod connection;
mod error;
mod mux;

pub use connection::{connect, serve};
pub use error::{Result, TransportError};
pub use mux::{init_message, Multiplexer};
