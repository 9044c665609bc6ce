//! Generic response packets: OK, ERR, and EOF.

mod eof;
mod err;
mod ok;

pub use eof::EofPacket;
pub use err::{ErrPacket, ER_ACCESS_DENIED_ERROR, ER_UNKNOWN_ERROR};
pub use ok::OkPacket;
