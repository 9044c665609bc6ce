//! Packets of the connection phase: the server greeting and the
//! client's authentication response.

mod auth_response;
mod handshake;

pub use auth_response::AuthResponse;
pub use handshake::{generate_challenge, Handshake};
