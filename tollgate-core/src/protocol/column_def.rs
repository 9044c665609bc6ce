use bitflags::bitflags;

use crate::error::Result;
use crate::io::{BufExt, BufMutExt};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FieldFlags: u16 {
        const NOT_NULL = 1;
        const PRIMARY_KEY = 2;
        const UNIQUE_KEY = 4;
        const MULTIPLE_KEY = 8;
        const BLOB = 16;
        const UNSIGNED = 32;
        const ZEROFILL = 64;
        const BINARY = 128;
        const ENUM = 256;
        const AUTO_INCREMENT = 512;
        const TIMESTAMP = 1024;
        const SET = 2048;
        const NO_DEFAULT_VALUE = 4096;
        const NUM = 32768;
    }
}

/// Column type byte of a field definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeId(pub u8);

impl TypeId {
    pub const DECIMAL: TypeId = TypeId(0);
    pub const TINY: TypeId = TypeId(1);
    pub const SHORT: TypeId = TypeId(2);
    pub const LONG: TypeId = TypeId(3);
    pub const FLOAT: TypeId = TypeId(4);
    pub const DOUBLE: TypeId = TypeId(5);
    pub const NULL: TypeId = TypeId(6);
    pub const TIMESTAMP: TypeId = TypeId(7);
    pub const LONGLONG: TypeId = TypeId(8);
    pub const INT24: TypeId = TypeId(9);
    pub const DATE: TypeId = TypeId(10);
    pub const TIME: TypeId = TypeId(11);
    pub const DATETIME: TypeId = TypeId(12);
    pub const YEAR: TypeId = TypeId(13);
    pub const VAR_CHAR: TypeId = TypeId(15);
    pub const BIT: TypeId = TypeId(16);
    pub const NEW_DECIMAL: TypeId = TypeId(246);
    pub const ENUM: TypeId = TypeId(247);
    pub const SET: TypeId = TypeId(248);
    pub const TINY_BLOB: TypeId = TypeId(249);
    pub const MEDIUM_BLOB: TypeId = TypeId(250);
    pub const LONG_BLOB: TypeId = TypeId(251);
    pub const BLOB: TypeId = TypeId(252);
    pub const VAR_STRING: TypeId = TypeId(253);
    pub const STRING: TypeId = TypeId(254);
    pub const GEOMETRY: TypeId = TypeId(255);
}

/// Column definition packet of a 4.1 result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub org_table: Option<String>,
    pub name: Option<String>,
    pub org_name: Option<String>,

    pub charset: u16,
    pub column_length: u32,
    pub type_id: TypeId,
    pub flags: FieldFlags,
    pub decimals: u8,
}

impl ColumnDefinition {
    /// A minimal definition, enough for a fabricated result set.
    pub fn named(name: &str, type_id: TypeId) -> Self {
        Self {
            catalog: Some("def".into()),
            schema: None,
            table: None,
            org_table: None,
            name: Some(name.into()),
            org_name: Some(name.into()),
            charset: 8,
            column_length: 0,
            type_id,
            flags: FieldFlags::empty(),
            decimals: 0,
        }
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let catalog = buf.get_str_lenenc()?.map(str::to_owned);
        let schema = buf.get_str_lenenc()?.map(str::to_owned);
        let table = buf.get_str_lenenc()?.map(str::to_owned);
        let org_table = buf.get_str_lenenc()?.map(str::to_owned);
        let name = buf.get_str_lenenc()?.map(str::to_owned);
        let org_name = buf.get_str_lenenc()?.map(str::to_owned);

        let fixed_len = buf.get_uint_lenenc()?.unwrap_or(0);
        if fixed_len != 0x0C {
            return Err(err_protocol!(
                "expected fixed-field filler 0x0C in column definition; received {fixed_len:#04X}"
            ));
        }

        let charset = buf.get_u16()?;
        let column_length = buf.get_u32()?;
        let type_id = TypeId(buf.get_u8()?);
        let flags = FieldFlags::from_bits_truncate(buf.get_u16()?);
        let decimals = buf.get_u8()?;

        // two trailing filler bytes
        buf.advance(2)?;

        Ok(Self {
            catalog,
            schema,
            table,
            org_table,
            name,
            org_name,
            charset,
            column_length,
            type_id,
            flags,
            decimals,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_str_lenenc(self.catalog.as_deref());
        buf.put_str_lenenc(self.schema.as_deref());
        buf.put_str_lenenc(self.table.as_deref());
        buf.put_str_lenenc(self.org_table.as_deref());
        buf.put_str_lenenc(self.name.as_deref());
        buf.put_str_lenenc(self.org_name.as_deref());

        buf.put_uint_lenenc(0x0C);

        buf.put_u16(self.charset);
        buf.put_u32(self.column_length);
        buf.put_u8(self.type_id.0);
        buf.put_u16(self.flags.bits());
        buf.put_u8(self.decimals);

        buf.put_filler(2);
    }
}
