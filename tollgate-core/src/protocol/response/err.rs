use crate::error::Result;
use crate::io::{BufExt, BufMutExt};

pub const ER_ACCESS_DENIED_ERROR: u16 = 1045;
pub const ER_UNKNOWN_ERROR: u16 = 1105;

/// Longest message the encoder will emit; anything longer is cut.
const MAX_MESSAGE_LEN: usize = 512;

/// ERR packet.
///
/// The 4.1 encoding carries a `#`-marked sqlstate; the pre-4.1 encoding
/// (code and message only) survives in one place: the refusal sent to a
/// client whose protocol version is still unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub message: String,
}

impl ErrPacket {
    pub fn new(error_code: u16, sql_state: &str, message: impl Into<String>) -> Self {
        Self {
            error_code,
            sql_state: sql_state.into(),
            message: message.into(),
        }
    }

    pub fn access_denied(username: &str) -> Self {
        Self::new(
            ER_ACCESS_DENIED_ERROR,
            "28000",
            format!("Access denied for user '{username}'"),
        )
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let header = buf.get_u8()?;
        if header != 0xFF {
            return Err(err_protocol!("expected ERR (0xFF); received 0x{header:02X}"));
        }

        let error_code = buf.get_u16()?;

        let marker = buf.get_u8()?;
        if marker != b'#' {
            return Err(err_protocol!(
                "expected sqlstate marker '#'; received 0x{marker:02X}"
            ));
        }

        let sql_state = buf.get_str(5)?.to_owned();
        let message = buf.get_str(buf.len())?.to_owned();

        Ok(Self {
            error_code,
            sql_state,
            message,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u8(0xFF);
        buf.put_u16(self.error_code);
        buf.put_u8(b'#');

        if self.sql_state.len() == 5 {
            buf.put_str(&self.sql_state);
        } else {
            buf.put_str("07000");
        }

        let message = self.message.as_bytes();
        buf.put_bytes(&message[..message.len().min(MAX_MESSAGE_LEN)]);
    }

    /// The 4.0 encoding: no sqlstate. Used when the client's protocol
    /// version is not yet known.
    pub fn encode_pre41(&self, buf: &mut Vec<u8>) {
        buf.put_u8(0xFF);
        buf.put_u16(self.error_code);

        let message = self.message.as_bytes();
        buf.put_bytes(&message[..message.len().min(MAX_MESSAGE_LEN)]);
    }
}
