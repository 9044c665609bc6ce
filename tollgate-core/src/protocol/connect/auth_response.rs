use crate::error::Result;
use crate::io::{BufExt, BufMutExt};
use crate::protocol::{Capabilities, Command};

/// Handshake response, client to server.
///
/// Pre-4.1 clients send a shorter layout; the proxy decodes just enough
/// of it to notice the missing `PROTOCOL_41` bit and refuse the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub capabilities: Capabilities,
    pub max_packet_size: u32,
    pub charset: u8,
    pub username: String,
    pub scramble: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin: Option<String>,
}

impl AuthResponse {
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        // both layouts lead with a 16-bit capability field; 4.1 clients
        // extend it to 32 bits
        let mut peek = buf;
        let capabilities_lo = Capabilities::from_bits_truncate(u32::from(peek.get_u16()?));

        if !capabilities_lo.contains(Capabilities::PROTOCOL_41) {
            return Self::decode_pre41(buf);
        }

        let capabilities = Capabilities::from_bits_truncate(buf.get_u32()?);
        let max_packet_size = buf.get_u32()?;
        let charset = buf.get_u8()?;

        // reserved
        buf.advance(23)?;

        let username = buf.get_str_nul()?.to_owned();

        let scramble = if capabilities.contains(Capabilities::SECURE_CONNECTION) {
            buf.get_bytes_lenenc()?.unwrap_or_default().to_vec()
        } else {
            let s = buf.get_str_nul()?;
            s.as_bytes().to_vec()
        };

        let database = if capabilities.contains(Capabilities::CONNECT_WITH_DB) && !buf.is_empty() {
            Some(buf.get_str_nul()?.to_owned())
        } else {
            None
        };

        let auth_plugin = if capabilities.contains(Capabilities::PLUGIN_AUTH) && !buf.is_empty() {
            Some(buf.get_str_nul()?.to_owned())
        } else {
            None
        };

        Ok(Self {
            capabilities,
            max_packet_size,
            charset,
            username,
            scramble,
            database,
            auth_plugin,
        })
    }

    /// The 4.0 layout: 16-bit capabilities, 24-bit max packet size, and
    /// a NUL-terminated username. Decoded only far enough to name the
    /// user in the refusal.
    fn decode_pre41(mut buf: &[u8]) -> Result<Self> {
        let capabilities = Capabilities::from_bits_truncate(u32::from(buf.get_u16()?));
        let max_packet_size = buf.get_u24()?;
        let username = buf.get_str_nul()?.to_owned();

        Ok(Self {
            capabilities,
            max_packet_size,
            charset: 0,
            username,
            scramble: Vec::new(),
            database: None,
            auth_plugin: None,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u32(self.capabilities.bits());
        buf.put_u32(self.max_packet_size);
        buf.put_u8(self.charset);
        buf.put_filler(23);

        buf.put_str_nul(&self.username);

        if self.capabilities.contains(Capabilities::SECURE_CONNECTION) {
            buf.put_bytes_lenenc(Some(&self.scramble));
        } else {
            buf.put_bytes(&self.scramble);
            buf.put_u8(0);
        }

        if self.capabilities.contains(Capabilities::CONNECT_WITH_DB) {
            if let Some(database) = &self.database {
                buf.put_str_nul(database);
            }
        }

        if self.capabilities.contains(Capabilities::PLUGIN_AUTH) {
            if let Some(plugin) = &self.auth_plugin {
                buf.put_str_nul(plugin);
            }
        }
    }

    /// `COM_CHANGE_USER` payload re-authenticating a pooled connection
    /// with this identity.
    pub fn encode_change_user(&self, buf: &mut Vec<u8>) {
        buf.put_u8(Command::ChangeUser as u8);
        buf.put_str_nul(&self.username);

        buf.put_u8(self.scramble.len() as u8);
        buf.put_bytes(&self.scramble);

        buf.put_str_nul(self.database.as_deref().unwrap_or(""));
    }
}

#[cfg(test)]
mod tests {
    use super::{AuthResponse, Capabilities};

    fn response() -> AuthResponse {
        AuthResponse {
            capabilities: Capabilities::base() | Capabilities::CONNECT_WITH_DB,
            max_packet_size: 16 * 1024 * 1024,
            charset: 8,
            username: "root".into(),
            scramble: vec![0xAA; 20],
            database: Some("test".into()),
            auth_plugin: None,
        }
    }

    #[test]
    fn it_round_trips() {
        let p = response();

        let mut buf = Vec::new();
        p.encode(&mut buf);

        assert_eq!(AuthResponse::decode(&buf).unwrap(), p);
    }

    #[test]
    fn it_round_trips_an_empty_scramble() {
        let mut p = response();
        p.scramble.clear();
        p.database = None;
        p.capabilities.remove(Capabilities::CONNECT_WITH_DB);

        let mut buf = Vec::new();
        p.encode(&mut buf);

        assert_eq!(AuthResponse::decode(&buf).unwrap(), p);
    }

    #[test]
    fn it_detects_a_pre41_client() {
        // capabilities 0x2405, max packet 0xFFFFFF, "old" + NUL
        let buf = b"\x05\x24\xff\xff\xffold\x00";

        let p = AuthResponse::decode(buf).unwrap();
        assert!(!p.capabilities.contains(Capabilities::PROTOCOL_41));
        assert_eq!(p.username, "old");
    }

    #[test]
    fn it_encodes_change_user() {
        let p = response();

        let mut buf = Vec::new();
        p.encode_change_user(&mut buf);

        assert_eq!(buf[0], 0x11);
        assert_eq!(&buf[1..6], b"root\x00");
        assert_eq!(buf[6], 20);
        assert_eq!(&buf[7..27], &[0xAA; 20][..]);
        assert_eq!(&buf[27..], b"test\x00");
    }
}
