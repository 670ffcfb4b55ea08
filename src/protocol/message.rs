//! Generic response packets and text-protocol result sets

use std::fmt;

use bytes::Bytes;

use super::buffer::WireReader;
use super::header;
use crate::error::{DriverError, DriverResult};

/// OK packet (`0x00` header, or `0xFE` when it replaces EOF)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
}

impl OkPacket {
    pub fn decode(payload: Bytes) -> DriverResult<Self> {
        let mut reader = WireReader::new(payload);
        let marker = reader.read_u8()?;
        if marker != header::OK && marker != header::EOF {
            return Err(DriverError::protocol(format!(
                "expected OK packet, got header 0x{marker:02x}"
            )));
        }
        let affected_rows = reader.read_lenenc_int()?.unwrap_or(0);
        let last_insert_id = reader.read_lenenc_int()?.unwrap_or(0);
        let status_flags = reader.read_u16()?;
        let warnings = reader.read_u16()?;
        let info = String::from_utf8_lossy(&reader.read_rest()).into_owned();
        Ok(Self {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
        })
    }
}

/// ERR packet (`0xFF` header)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub code: u16,
    pub sql_state: String,
    pub message: String,
}

impl ErrPacket {
    pub fn decode(payload: Bytes) -> DriverResult<Self> {
        let mut reader = WireReader::new(payload);
        let marker = reader.read_u8()?;
        if marker != header::ERR {
            return Err(DriverError::protocol(format!(
                "expected ERR packet, got header 0x{marker:02x}"
            )));
        }
        Self::decode_body(&mut reader)
    }

    /// Decode everything after the `0xFF` header
    pub fn decode_body(reader: &mut WireReader) -> DriverResult<Self> {
        let code = reader.read_u16()?;
        let sql_state = if reader.peek_u8() == Some(b'#') {
            reader.skip(1)?;
            reader.read_string(5)?
        } else {
            "HY000".to_string()
        };
        let message = String::from_utf8_lossy(&reader.read_rest()).into_owned();
        Ok(Self {
            code,
            sql_state,
            message,
        })
    }
}

impl From<ErrPacket> for DriverError {
    fn from(err: ErrPacket) -> Self {
        DriverError::Server {
            code: err.code,
            state: err.sql_state,
            message: err.message,
        }
    }
}

/// EOF packets are `0xFE` headed and shorter than any length-encoded row
pub fn is_eof(payload: &[u8]) -> bool {
    payload.first() == Some(&header::EOF) && payload.len() < 9
}

pub fn is_err(payload: &[u8]) -> bool {
    payload.first() == Some(&header::ERR)
}

pub fn is_ok(payload: &[u8]) -> bool {
    payload.first() == Some(&header::OK)
}

/// Column types the text protocol decoder distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Decimal,
    Tiny,
    Short,
    Long,
    Float,
    Double,
    Null,
    Timestamp,
    LongLong,
    Int24,
    Date,
    Time,
    DateTime,
    Year,
    VarChar,
    Bit,
    Json,
    NewDecimal,
    Blob,
    VarString,
    String,
    Other(u8),
}

impl From<u8> for ColumnType {
    fn from(code: u8) -> Self {
        match code {
            0x00 => ColumnType::Decimal,
            0x01 => ColumnType::Tiny,
            0x02 => ColumnType::Short,
            0x03 => ColumnType::Long,
            0x04 => ColumnType::Float,
            0x05 => ColumnType::Double,
            0x06 => ColumnType::Null,
            0x07 => ColumnType::Timestamp,
            0x08 => ColumnType::LongLong,
            0x09 => ColumnType::Int24,
            0x0A => ColumnType::Date,
            0x0B => ColumnType::Time,
            0x0C => ColumnType::DateTime,
            0x0D => ColumnType::Year,
            0x0F => ColumnType::VarChar,
            0x10 => ColumnType::Bit,
            0xF5 => ColumnType::Json,
            0xF6 => ColumnType::NewDecimal,
            0xF9..=0xFC => ColumnType::Blob,
            0xFD => ColumnType::VarString,
            0xFE => ColumnType::String,
            other => ColumnType::Other(other),
        }
    }
}

impl ColumnType {
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            ColumnType::Tiny
                | ColumnType::Short
                | ColumnType::Long
                | ColumnType::LongLong
                | ColumnType::Int24
                | ColumnType::Year
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, ColumnType::Float | ColumnType::Double)
    }
}

const UNSIGNED_FLAG: u16 = 0x20;
const BINARY_CHARSET: u16 = 63;

/// Column definition (protocol 4.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub schema: String,
    pub table: String,
    pub name: String,
    pub charset: u16,
    pub length: u32,
    pub column_type: ColumnType,
    pub flags: u16,
    pub decimals: u8,
}

impl ColumnDefinition {
    pub fn decode(payload: Bytes) -> DriverResult<Self> {
        let mut reader = WireReader::new(payload);
        reader.skip_lenenc_bytes()?; // catalog
        let schema = reader.read_lenenc_string()?.unwrap_or_default();
        let table = reader.read_lenenc_string()?.unwrap_or_default();
        reader.skip_lenenc_bytes()?; // original table
        let name = reader.read_lenenc_string()?.unwrap_or_default();
        reader.skip_lenenc_bytes()?; // original name
        reader.skip_lenenc_int()?; // length of fixed fields
        let charset = reader.read_u16()?;
        let length = reader.read_u32()?;
        let column_type = ColumnType::from(reader.read_u8()?);
        let flags = reader.read_u16()?;
        let decimals = reader.read_u8()?;
        Ok(Self {
            schema,
            table,
            name,
            charset,
            length,
            column_type,
            flags,
            decimals,
        })
    }

    pub fn is_unsigned(&self) -> bool {
        self.flags & UNSIGNED_FLAG != 0
    }

    pub fn is_binary(&self) -> bool {
        self.charset == BINARY_CHARSET
    }
}

/// Decoded column value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Bytes),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            Value::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Int(v) => u64::try_from(*v).ok(),
            Value::UInt(v) => Some(*v),
            Value::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Int(v) => Some(*v != 0),
            Value::UInt(v) => Some(*v != 0),
            Value::Text(s) => match s.as_str() {
                "1" | "ON" | "on" | "true" => Some(true),
                "0" | "OFF" | "off" | "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int(v) => write!(f, "{v}"),
            Value::UInt(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(s) => write!(f, "{s}"),
            Value::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
        }
    }
}

/// Decode one text-protocol row against its column definitions
pub fn decode_text_row(payload: Bytes, columns: &[ColumnDefinition]) -> DriverResult<Vec<Value>> {
    let mut reader = WireReader::new(payload);
    let mut values = Vec::with_capacity(columns.len());
    for column in columns {
        let value = match reader.read_lenenc_bytes()? {
            None => Value::Null,
            Some(raw) => decode_text_value(raw, column)?,
        };
        values.push(value);
    }
    Ok(values)
}

fn decode_text_value(raw: Bytes, column: &ColumnDefinition) -> DriverResult<Value> {
    let ty = column.column_type;
    if ty.is_integer() {
        return if column.is_unsigned() {
            btoi::btou::<u64>(&raw)
                .map(Value::UInt)
                .map_err(|e| DriverError::protocol(format!("column '{}': {e}", column.name)))
        } else {
            btoi::btoi::<i64>(&raw)
                .map(Value::Int)
                .map_err(|e| DriverError::protocol(format!("column '{}': {e}", column.name)))
        };
    }
    if ty.is_float() {
        let text = std::str::from_utf8(&raw)
            .map_err(|e| DriverError::protocol(format!("column '{}': {e}", column.name)))?;
        return text
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|e| DriverError::protocol(format!("column '{}': {e}", column.name)));
    }
    if column.is_binary() && !matches!(ty, ColumnType::Decimal | ColumnType::NewDecimal) {
        return Ok(Value::Bytes(raw));
    }
    Ok(Value::Text(String::from_utf8_lossy(&raw).into_owned()))
}

/// Complete outcome of a text-protocol query
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub columns: Vec<ColumnDefinition>,
    pub rows: Vec<Vec<Value>>,
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub warnings: u16,
    pub status_flags: u16,
}

impl QueryResult {
    pub fn from_ok(ok: OkPacket) -> Self {
        Self {
            affected_rows: ok.affected_rows,
            last_insert_id: ok.last_insert_id,
            warnings: ok.warnings,
            status_flags: ok.status_flags,
            ..Default::default()
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// First row, if any
    pub fn first_row(&self) -> Option<&[Value]> {
        self.rows.first().map(Vec::as_slice)
    }
}
