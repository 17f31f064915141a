use serde::{Deserialize, Serialize};

use super::value::Value;

/// SQL data types, in wire tag order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    Null = 0,
    VarChar,
    Char,
    WVarChar,
    WChar,
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Decimal,
    Numeric,
    Real,
    Double,
    Float,
    Timestamp,
    Date,
    Time,
    Blob,
}

impl DataType {
    const ALL: [DataType; 18] = [
        DataType::Null,
        DataType::VarChar,
        DataType::Char,
        DataType::WVarChar,
        DataType::WChar,
        DataType::TinyInt,
        DataType::SmallInt,
        DataType::Integer,
        DataType::BigInt,
        DataType::Decimal,
        DataType::Numeric,
        DataType::Real,
        DataType::Double,
        DataType::Float,
        DataType::Timestamp,
        DataType::Date,
        DataType::Time,
        DataType::Blob,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    /// Text types carry an owned string payload
    pub fn is_text(self) -> bool {
        matches!(
            self,
            DataType::VarChar | DataType::Char | DataType::WVarChar | DataType::WChar
        )
    }

    /// Fixed payload size in bytes, or `None` for variable-length types
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            DataType::Null => Some(0),
            DataType::TinyInt => Some(1),
            DataType::SmallInt => Some(2),
            DataType::Integer | DataType::Real => Some(4),
            DataType::BigInt
            | DataType::Decimal
            | DataType::Numeric
            | DataType::Double
            | DataType::Float
            | DataType::Timestamp
            | DataType::Date
            | DataType::Time => Some(8),
            _ => None,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Column flag bits
pub mod column_flags {
    /// The column holds a header (column name) rather than row data
    pub const IS_HEADER: u32 = 1;
}

/// Cursor flag bits
pub mod cursor_flags {
    pub const IS_STATIC: u32 = 1;
    pub const IS_DYNAMIC: u32 = 2;
    pub const FORWARD_ONLY: u32 = 4;

    /// Flags used when the caller does not ask for anything specific
    pub const DEFAULT: u32 = IS_DYNAMIC | FORWARD_ONLY;
}

/// One cell of a result set together with its column flags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnData {
    pub flags: u32,
    pub value: Value,
}

impl ColumnData {
    pub fn new(value: Value) -> Self {
        Self { flags: 0, value }
    }

    pub fn header(name: impl Into<String>) -> Self {
        Self {
            flags: column_flags::IS_HEADER,
            value: Value::VarChar(name.into()),
        }
    }

    pub fn is_header(&self) -> bool {
        self.flags & column_flags::IS_HEADER != 0
    }
}

/// Declared type of a result column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColType {
    pub data_type: DataType,
    /// Declared size, or -1 when the driver does not know it
    pub size: i32,
}
