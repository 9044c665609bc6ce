use crate::error::Result;
use crate::io::{BufExt, BufMutExt};
use crate::protocol::Status;

/// EOF packet, the terminator of field lists and row streams.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EofPacket {
    pub warnings: u16,
    pub status: Status,
}

impl EofPacket {
    pub fn new(status: Status) -> Self {
        Self {
            warnings: 0,
            status,
        }
    }

    /// A leading `0xFE` also starts an 8-byte length-encoded integer;
    /// only a short packet is an EOF.
    pub fn is_eof(payload: &[u8]) -> bool {
        !payload.is_empty() && payload[0] == 0xFE && payload.len() <= 9
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let header = buf.get_u8()?;
        if header != 0xFE {
            return Err(err_protocol!("expected EOF (0xFE); received 0x{header:02X}"));
        }

        let warnings = buf.get_u16()?;
        let status = Status::from_bits_truncate(buf.get_u16()?);

        Ok(Self { warnings, status })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u8(0xFE);
        buf.put_u16(self.warnings);
        buf.put_u16(self.status.bits());
    }
}
