use crate::io::BufMutExt;
use crate::protocol::response::EofPacket;
use crate::protocol::{ColumnDefinition, Status};

/// A text-protocol result set a policy can fabricate without touching
/// the server.
///
/// `packets()` yields the payloads in wire order: column count, one
/// definition per column, EOF, one packet per row, EOF. Row cells are
/// length-encoded strings; `None` is SQL NULL.
#[derive(Debug, Default)]
pub struct Resultset {
    pub columns: Vec<ColumnDefinition>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl Resultset {
    pub fn packets(&self) -> Vec<Vec<u8>> {
        let mut out = Vec::with_capacity(self.columns.len() + self.rows.len() + 3);

        let mut count = Vec::new();
        count.put_uint_lenenc(self.columns.len() as u64);
        out.push(count);

        for column in &self.columns {
            let mut buf = Vec::new();
            column.encode(&mut buf);
            out.push(buf);
        }

        let mut eof = Vec::new();
        EofPacket::new(Status::SERVER_STATUS_AUTOCOMMIT).encode(&mut eof);
        out.push(eof.clone());

        for row in &self.rows {
            let mut buf = Vec::new();
            for cell in row {
                buf.put_str_lenenc(cell.as_deref());
            }
            out.push(buf);
        }

        out.push(eof);

        out
    }
}
