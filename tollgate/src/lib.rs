//! The `tollgate` proxy daemon: configuration, the listener loop, and
//! the default policy.
//!
//! Everything protocol- and state-machine-shaped lives in
//! [`tollgate_core`]; this crate only assembles it.

pub mod config;
pub mod proxy;
pub mod server;
