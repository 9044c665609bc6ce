//! Non-blocking sockets and the packet-addressed byte queues behind
//! them.

mod address;
mod listener;
pub mod queue;
mod socket;

pub use address::NetworkAddress;
pub use listener::Listener;
pub use socket::{IoStatus, Socket, Stream};
