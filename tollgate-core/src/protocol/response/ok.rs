use crate::error::Result;
use crate::io::{BufExt, BufMutExt};
use crate::protocol::Status;

/// OK packet, the server's acknowledgement of a command.
///
/// The proxy always negotiates `CLIENT_PROTOCOL_41`, so the status and
/// warning fields are unconditionally present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub insert_id: u64,
    pub status: Status,
    pub warnings: u16,
}

impl OkPacket {
    pub fn new() -> Self {
        Self {
            affected_rows: 0,
            insert_id: 0,
            status: Status::SERVER_STATUS_AUTOCOMMIT,
            warnings: 0,
        }
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let header = buf.get_u8()?;
        if header != 0x00 {
            return Err(err_protocol!("expected OK (0x00); received 0x{header:02X}"));
        }

        let affected_rows = buf.get_uint_lenenc()?.unwrap_or(0);
        let insert_id = buf.get_uint_lenenc()?.unwrap_or(0);
        let status = Status::from_bits_truncate(buf.get_u16()?);
        let warnings = buf.get_u16()?;

        Ok(Self {
            affected_rows,
            insert_id,
            status,
            warnings,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u8(0x00);
        buf.put_uint_lenenc(self.affected_rows);
        buf.put_uint_lenenc(self.insert_id);
        buf.put_u16(self.status.bits());
        buf.put_u16(self.warnings);
    }
}

impl Default for OkPacket {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{OkPacket, Status};

    const OK_HANDSHAKE: &[u8] = b"\x00\x00\x00\x02\x00\x00\x00";

    #[test]
    fn it_decodes_an_ok_packet() {
        let p = OkPacket::decode(OK_HANDSHAKE).unwrap();

        assert_eq!(p.affected_rows, 0);
        assert_eq!(p.insert_id, 0);
        assert_eq!(p.warnings, 0);
        assert!(p.status.contains(Status::SERVER_STATUS_AUTOCOMMIT));
    }

    #[test]
    fn it_round_trips() {
        let p = OkPacket {
            affected_rows: 513,
            insert_id: 0xFFFF_FFFF,
            status: Status::SERVER_STATUS_AUTOCOMMIT | Status::SERVER_MORE_RESULTS_EXISTS,
            warnings: 3,
        };

        let mut buf = Vec::new();
        p.encode(&mut buf);

        assert_eq!(OkPacket::decode(&buf).unwrap(), p);
    }

    #[test]
    fn it_rejects_a_wrong_header() {
        assert!(OkPacket::decode(b"\xFF\x00\x00\x02\x00\x00\x00").is_err());
    }
}
