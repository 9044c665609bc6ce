use rand::Rng;

use crate::error::Result;
use crate::io::{BufExt, BufMutExt};
use crate::protocol::{Capabilities, Status};

/// Initial handshake (protocol version 10), server to client.
///
/// The proxy decodes the upstream greeting to learn its capabilities and
/// challenge, and re-encodes it (possibly with a cached challenge)
/// towards the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub server_version: String,

    /// `server_version` collapsed to `major * 10000 + minor * 100 +
    /// patch`, the form version-gated workarounds compare against.
    pub version: u32,

    pub thread_id: u32,

    /// 8 bytes, plus 12 more when `SECURE_CONNECTION` was negotiated.
    pub challenge: Vec<u8>,

    pub capabilities: Capabilities,
    pub charset: u8,
    pub status: Status,
}

impl Handshake {
    pub const PROTOCOL_VERSION: u8 = 10;

    /// A greeting the proxy fabricates for clients served off a pooled
    /// connection.
    pub fn synthesized(server_version: &str, thread_id: u32, challenge: Vec<u8>) -> Result<Self> {
        Ok(Self {
            version: parse_version(server_version)?,
            server_version: server_version.to_owned(),
            thread_id,
            challenge,
            capabilities: Capabilities::base(),
            charset: 8, // latin1_swedish_ci, the reference default
            status: Status::SERVER_STATUS_AUTOCOMMIT,
        })
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let protocol_version = buf.get_u8()?;
        if protocol_version != Self::PROTOCOL_VERSION {
            return Err(err_protocol!(
                "unsupported handshake protocol version {protocol_version}"
            ));
        }

        let server_version = buf.get_str_nul()?.to_owned();
        let version = parse_version(&server_version)?;

        let thread_id = buf.get_u32()?;

        let mut challenge = Vec::with_capacity(20);
        challenge.extend_from_slice(buf.get_bytes(8)?);

        // filler
        buf.advance(1)?;

        let capabilities = Capabilities::from_bits_truncate(u32::from(buf.get_u16()?));
        let charset = buf.get_u8()?;
        let status = Status::from_bits_truncate(buf.get_u16()?);

        // reserved
        buf.advance(13)?;

        if capabilities.contains(Capabilities::SECURE_CONNECTION) {
            challenge.extend_from_slice(buf.get_bytes(12)?);
            buf.advance(1)?;
        }

        Ok(Self {
            server_version,
            version,
            thread_id,
            challenge,
            capabilities,
            charset,
            status,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u8(Self::PROTOCOL_VERSION);
        buf.put_str_nul(&self.server_version);
        buf.put_u32(self.thread_id);

        buf.put_bytes(&self.challenge[..8.min(self.challenge.len())]);
        buf.put_u8(0x00);

        buf.put_u16(self.capabilities.bits() as u16);
        buf.put_u8(self.charset);
        buf.put_u16(self.status.bits());

        buf.put_filler(13);

        if self.capabilities.contains(Capabilities::SECURE_CONNECTION) && self.challenge.len() >= 20
        {
            buf.put_bytes(&self.challenge[8..20]);
            buf.put_u8(0x00);
        }
    }
}

/// 20 printable bytes, never NUL, the way the reference server rolls its
/// scramble.
pub fn generate_challenge() -> Vec<u8> {
    let mut rng = rand::thread_rng();

    (0..20).map(|_| rng.gen_range(33..=126u8)).collect()
}

/// Validate and collapse a `M.m.p[suffix]` server version string.
fn parse_version(s: &str) -> Result<u32> {
    let invalid = || err_protocol!("malformed server version {s:?}");

    let mut parts = s.splitn(3, '.');

    let major: u32 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(invalid)?;

    let minor: u32 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(invalid)?;

    // the patch level may carry a suffix: "5.5.5-10.4.7-MariaDB"
    let patch_part = parts.next().ok_or_else(invalid)?;
    let digits = patch_part
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(patch_part.len());
    let patch: u32 = patch_part[..digits].parse().map_err(|_| invalid())?;

    if major > 10 || minor >= 100 || patch >= 100 {
        return Err(invalid());
    }

    Ok(major * 10000 + minor * 100 + patch)
}

#[cfg(test)]
mod tests {
    use super::{parse_version, Capabilities, Handshake, Status};

    const HANDSHAKE_MYSQL_5_5: &[u8] =
        b"\x0a5.5.12\x00\x15\x00\x00\x00aBcDeFgH\x00\xff\xf7\x08\x02\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00iJkLmNoPqRsT\x00";

    #[test]
    fn it_decodes_a_v10_handshake() {
        let p = Handshake::decode(HANDSHAKE_MYSQL_5_5).unwrap();

        assert_eq!(p.server_version, "5.5.12");
        assert_eq!(p.version, 50512);
        assert_eq!(p.thread_id, 0x15);
        assert_eq!(p.charset, 8);
        assert!(p.status.contains(Status::SERVER_STATUS_AUTOCOMMIT));
        assert!(p.capabilities.contains(Capabilities::PROTOCOL_41));
        assert!(p.capabilities.contains(Capabilities::SECURE_CONNECTION));
        assert_eq!(p.challenge, b"aBcDeFgHiJkLmNoPqRsT");
    }

    #[test]
    fn it_round_trips() {
        let p = Handshake::decode(HANDSHAKE_MYSQL_5_5).unwrap();

        let mut buf = Vec::new();
        p.encode(&mut buf);

        assert_eq!(Handshake::decode(&buf).unwrap(), p);
    }

    #[test]
    fn it_rejects_other_protocol_versions() {
        assert!(Handshake::decode(b"\x09whatever\x00").is_err());
    }

    #[test]
    fn it_validates_the_version_string() {
        assert_eq!(parse_version("5.1.50").unwrap(), 50150);
        assert_eq!(parse_version("10.4.7-MariaDB").unwrap(), 100407);

        assert!(parse_version("abc").is_err());
        assert!(parse_version("5.1").is_err());
        assert!(parse_version("11.0.0").is_err());
        assert!(parse_version("5.100.0").is_err());
        assert!(parse_version("5.0.100").is_err());
    }

    #[test]
    fn it_generates_twenty_printable_challenge_bytes() {
        let challenge = super::generate_challenge();

        assert_eq!(challenge.len(), 20);
        assert!(challenge.iter().all(|&b| (33..=126).contains(&b)));
    }
}
