//! Core of `tollgate`, a reverse proxy speaking the MySQL client/server
//! protocol on both sides.
//!
//! The crate is split along the seams of the proxy's data path:
//!
//! - [`io`]: primitive field encoders/decoders (fixed-width and
//!   length-encoded integers, the various string forms)
//! - [`protocol`]: packet framing and the typed packets of the
//!   connection and command phases
//! - [`net`]: non-blocking sockets with packet-addressed byte queues
//! - [`backend`]: the set of upstream servers and their health
//! - [`pool`]: idle, authenticated server connections kept for reuse
//! - [`connection`]: the per-client state machine driving both sockets
//! - [`policy`]: the hook trait that lets operators intercept the
//!   fixed decision points of the state machine

#[macro_use]
pub mod error;

pub mod backend;
pub mod connection;
pub mod io;
pub mod net;
pub mod policy;
pub mod pool;
pub mod protocol;

pub use error::{Error, Result};
