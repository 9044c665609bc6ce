use byteorder::{ByteOrder, LittleEndian};

/// Encoding counterpart of [`BufExt`](super::BufExt).
///
/// Fixed-width putters truncate the value to the field width;
/// `put_uint_lenenc` always emits the shortest legal form.
pub trait BufMutExt {
    fn put_u8(&mut self, val: u8);

    fn put_u16(&mut self, val: u16);

    fn put_u24(&mut self, val: u32);

    fn put_u32(&mut self, val: u32);

    fn put_u48(&mut self, val: u64);

    fn put_u64(&mut self, val: u64);

    fn put_bytes(&mut self, val: &[u8]);

    fn put_str(&mut self, val: &str);

    fn put_str_nul(&mut self, val: &str);

    /// Zero filler of `n` bytes.
    fn put_filler(&mut self, n: usize);

    fn put_uint_lenenc(&mut self, val: u64);

    /// `None` encodes the NULL marker (a single `0xFB`).
    fn put_bytes_lenenc(&mut self, val: Option<&[u8]>);

    fn put_str_lenenc(&mut self, val: Option<&str>);
}

impl BufMutExt for Vec<u8> {
    fn put_u8(&mut self, val: u8) {
        self.push(val);
    }

    fn put_u16(&mut self, val: u16) {
        let mut buf = [0; 2];
        LittleEndian::write_u16(&mut buf, val);
        self.extend_from_slice(&buf);
    }

    fn put_u24(&mut self, val: u32) {
        let mut buf = [0; 3];
        LittleEndian::write_u24(&mut buf, val & 0x00FF_FFFF);
        self.extend_from_slice(&buf);
    }

    fn put_u32(&mut self, val: u32) {
        let mut buf = [0; 4];
        LittleEndian::write_u32(&mut buf, val);
        self.extend_from_slice(&buf);
    }

    fn put_u48(&mut self, val: u64) {
        let mut buf = [0; 6];
        LittleEndian::write_uint(&mut buf, val & 0xFFFF_FFFF_FFFF, 6);
        self.extend_from_slice(&buf);
    }

    fn put_u64(&mut self, val: u64) {
        let mut buf = [0; 8];
        LittleEndian::write_u64(&mut buf, val);
        self.extend_from_slice(&buf);
    }

    fn put_bytes(&mut self, val: &[u8]) {
        self.extend_from_slice(val);
    }

    fn put_str(&mut self, val: &str) {
        self.extend_from_slice(val.as_bytes());
    }

    fn put_str_nul(&mut self, val: &str) {
        self.put_str(val);
        self.push(0);
    }

    fn put_filler(&mut self, n: usize) {
        self.resize(self.len() + n, 0);
    }

    fn put_uint_lenenc(&mut self, val: u64) {
        if val < 0xFB {
            self.put_u8(val as u8);
        } else if val <= 0xFFFF {
            self.put_u8(0xFC);
            self.put_u16(val as u16);
        } else if val <= 0xFF_FFFF {
            self.put_u8(0xFD);
            self.put_u24(val as u32);
        } else {
            self.put_u8(0xFE);
            self.put_u64(val);
        }
    }

    fn put_bytes_lenenc(&mut self, val: Option<&[u8]>) {
        match val {
            Some(bytes) => {
                self.put_uint_lenenc(bytes.len() as u64);
                self.put_bytes(bytes);
            }

            None => self.put_u8(0xFB),
        }
    }

    fn put_str_lenenc(&mut self, val: Option<&str>) {
        self.put_bytes_lenenc(val.map(str::as_bytes));
    }
}
