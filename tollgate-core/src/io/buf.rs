use std::{io, str};

use byteorder::{ByteOrder, LittleEndian};
use memchr::memchr;

fn eof() -> io::Error {
    io::ErrorKind::UnexpectedEof.into()
}

/// Cursor-style decoding over a borrowed byte slice.
///
/// Every getter advances the slice; a getter that would advance past the
/// end fails with `UnexpectedEof` and leaves the slice untouched. The
/// packet layer turns that into a `Malformed` protocol error.
pub trait BufExt<'a> {
    fn advance(&mut self, n: usize) -> io::Result<()>;

    fn get_bytes(&mut self, n: usize) -> io::Result<&'a [u8]>;

    fn get_u8(&mut self) -> io::Result<u8>;

    fn get_u16(&mut self) -> io::Result<u16>;

    fn get_u24(&mut self) -> io::Result<u32>;

    fn get_u32(&mut self) -> io::Result<u32>;

    fn get_u48(&mut self) -> io::Result<u64>;

    fn get_u64(&mut self) -> io::Result<u64>;

    fn get_str(&mut self, n: usize) -> io::Result<&'a str>;

    /// Bytes up to (excluding) the next `0x00`; the NUL is consumed.
    fn get_str_nul(&mut self) -> io::Result<&'a str>;

    /// Length-encoded integer. `None` is the NULL marker (`0xFB`),
    /// distinct from the value 0. The reserved tag `0xFF` fails.
    fn get_uint_lenenc(&mut self) -> io::Result<Option<u64>>;

    fn get_bytes_lenenc(&mut self) -> io::Result<Option<&'a [u8]>>;

    fn get_str_lenenc(&mut self) -> io::Result<Option<&'a str>>;
}

impl<'a> BufExt<'a> for &'a [u8] {
    fn advance(&mut self, n: usize) -> io::Result<()> {
        if self.len() < n {
            return Err(eof());
        }

        *self = &self[n..];

        Ok(())
    }

    fn get_bytes(&mut self, n: usize) -> io::Result<&'a [u8]> {
        if self.len() < n {
            return Err(eof());
        }

        let (head, tail) = self.split_at(n);
        *self = tail;

        Ok(head)
    }

    fn get_u8(&mut self) -> io::Result<u8> {
        Ok(self.get_bytes(1)?[0])
    }

    fn get_u16(&mut self) -> io::Result<u16> {
        Ok(LittleEndian::read_u16(self.get_bytes(2)?))
    }

    fn get_u24(&mut self) -> io::Result<u32> {
        Ok(LittleEndian::read_u24(self.get_bytes(3)?))
    }

    fn get_u32(&mut self) -> io::Result<u32> {
        Ok(LittleEndian::read_u32(self.get_bytes(4)?))
    }

    fn get_u48(&mut self) -> io::Result<u64> {
        Ok(LittleEndian::read_uint(self.get_bytes(6)?, 6))
    }

    fn get_u64(&mut self) -> io::Result<u64> {
        Ok(LittleEndian::read_u64(self.get_bytes(8)?))
    }

    fn get_str(&mut self, n: usize) -> io::Result<&'a str> {
        str::from_utf8(self.get_bytes(n)?)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }

    fn get_str_nul(&mut self) -> io::Result<&'a str> {
        let nul = memchr(b'\0', self).ok_or_else(eof)?;
        let s = self.get_str(nul)?;
        self.advance(1)?;

        Ok(s)
    }

    fn get_uint_lenenc(&mut self) -> io::Result<Option<u64>> {
        Ok(match self.get_u8()? {
            0xFB => None,
            0xFC => Some(u64::from(self.get_u16()?)),
            0xFD => Some(u64::from(self.get_u24()?)),
            0xFE => Some(self.get_u64()?),

            0xFF => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "0xFF is not a valid length-encoded integer tag",
                ));
            }

            value => Some(u64::from(value)),
        })
    }

    fn get_bytes_lenenc(&mut self) -> io::Result<Option<&'a [u8]>> {
        self.get_uint_lenenc()?
            .map(|len| {
                let len = usize::try_from(len)
                    .map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?;
                self.get_bytes(len)
            })
            .transpose()
    }

    fn get_str_lenenc(&mut self) -> io::Result<Option<&'a str>> {
        self.get_bytes_lenenc()?
            .map(|bytes| {
                str::from_utf8(bytes).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
            })
            .transpose()
    }
}
