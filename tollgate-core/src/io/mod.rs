//! Primitive field decoders and encoders.
//!
//! Everything in the MySQL protocol is little-endian; the traits here fix
//! the byte order and add the MySQL-specific length-encoded forms on top
//! of the plain fixed-width ones.

mod buf;
mod buf_mut;

pub use buf::BufExt;
pub use buf_mut::BufMutExt;
