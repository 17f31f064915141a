//! SQLite driver backed by rusqlite
//!
//! Cursors are materialized when the statement executes, so they are
//! static: the row count is known and any row can be revisited. Values are
//! read according to the column's declared type when that conversion is
//! lossless, otherwise according to SQLite's storage class.

use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use parking_lot::Mutex;
use rusqlite::types::{Value as SqliteValue, ValueRef};
use rusqlite::Connection;
use sqlipc_client::{cursor_flags, ColType, DataType, Value};

use super::{OpenTarget, SqlCursor, SqlDatabase, SqlStatement};
use crate::error::{DbError, DbResult};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S%.f";

/// Declared-type keywords, most specific first
const DECLARED_TYPES: &[(&str, DataType)] = &[
    ("VARWCHAR", DataType::WVarChar),
    ("WCHAR", DataType::WChar),
    ("VARCHAR", DataType::VarChar),
    ("CHAR", DataType::Char),
    ("TINYINT", DataType::TinyInt),
    ("SMALLINT", DataType::SmallInt),
    ("INTEGER", DataType::Integer),
    ("BIGINT", DataType::BigInt),
    ("DECIMAL", DataType::Decimal),
    ("NUMERIC", DataType::Numeric),
    ("REAL", DataType::Real),
    ("DOUBLE", DataType::Double),
    ("FLOAT", DataType::Float),
    ("TIMESTAMP", DataType::Timestamp),
    ("DATETIME", DataType::Timestamp),
    ("DATE", DataType::Date),
    ("TIME", DataType::Time),
    ("BINARY", DataType::Blob),
    ("BLOB", DataType::Blob),
    ("TEXT", DataType::VarChar),
    ("CLOB", DataType::VarChar),
    ("INT", DataType::BigInt),
];

type SharedConnection = Arc<Mutex<Connection>>;

pub struct SqliteDatabase {
    conn: Option<SharedConnection>,
}

impl SqliteDatabase {
    pub fn new() -> Self {
        Self { conn: None }
    }

    fn connection(&self) -> DbResult<&SharedConnection> {
        self.conn
            .as_ref()
            .ok_or_else(|| DbError::DatabaseError("Database is not open".to_string()))
    }
}

impl Default for SqliteDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl SqlDatabase for SqliteDatabase {
    fn open(&mut self, target: &OpenTarget<'_>, password: Option<&str>) -> DbResult<()> {
        if password.is_some() {
            tracing::debug!("SQLite ignores the password for '{}'", target.user);
        }
        let conn = if target.dbname == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(target.dbname)?
        };
        self.conn = Some(Arc::new(Mutex::new(conn)));
        Ok(())
    }

    fn close(&mut self) -> DbResult<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        // Statements still holding the connection close it when dropped
        if let Ok(conn) = Arc::try_unwrap(conn) {
            conn.into_inner().close().map_err(|(_, e)| e)?;
        }
        Ok(())
    }

    fn prepare(&mut self, text: &str) -> DbResult<Box<dyn SqlStatement>> {
        let conn = self.connection()?.clone();
        let names = {
            let guard = conn.lock();
            let stmt = guard.prepare(text)?;
            let names: Vec<String> = (1..=stmt.parameter_count())
                .map(|i| {
                    stmt.parameter_name(i)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("?{}", i))
                })
                .collect();
            names
        };
        let params = vec![Value::Null; names.len()];
        Ok(Box::new(SqliteStatement {
            conn,
            text: text.to_string(),
            names,
            params,
        }))
    }

    fn execute(&mut self, text: &str) -> DbResult<()> {
        self.connection()?.lock().execute_batch(text)?;
        Ok(())
    }
}

pub struct SqliteStatement {
    conn: SharedConnection,
    text: String,
    names: Vec<String>,
    params: Vec<Value>,
}

impl SqlStatement for SqliteStatement {
    fn parameter_count(&self) -> usize {
        self.names.len()
    }

    fn parameter_name(&self, idx: usize) -> DbResult<String> {
        self.names
            .get(idx)
            .cloned()
            .ok_or(DbError::ParameterOutOfRange(idx as u32))
    }

    fn bind(&mut self, idx: usize, value: &Value) -> DbResult<()> {
        let slot = self
            .params
            .get_mut(idx)
            .ok_or(DbError::ParameterOutOfRange(idx as u32))?;
        *slot = value.clone();
        Ok(())
    }

    fn execute(&mut self, flags: u32) -> DbResult<Option<Box<dyn SqlCursor>>> {
        let guard = self.conn.lock();
        let mut stmt = guard.prepare(&self.text)?;
        for (i, value) in self.params.iter().enumerate() {
            stmt.raw_bind_parameter(i + 1, to_sqlite(value))?;
        }

        if flags == 0 {
            stmt.raw_execute()?;
            return Ok(None);
        }

        let (headers, types): (Vec<String>, Vec<ColType>) = stmt
            .columns()
            .iter()
            .map(|c| (c.name().to_string(), column_type(c.decl_type())))
            .unzip();

        let mut data = Vec::new();
        let mut rows = 0i64;
        let mut result = stmt.raw_query();
        while let Some(row) = result.next()? {
            for (col, ty) in types.iter().enumerate() {
                data.push(from_sqlite(row.get_ref(col)?, ty.data_type));
            }
            rows += 1;
        }

        Ok(Some(Box::new(SqliteCursor {
            headers: Arc::new(headers),
            types: Arc::new(types),
            data: Arc::new(data),
            rows,
            at: 0,
        })))
    }
}

pub struct SqliteCursor {
    headers: Arc<Vec<String>>,
    types: Arc<Vec<ColType>>,
    data: Arc<Vec<Value>>,
    rows: i64,
    at: i64,
}

impl SqliteCursor {
    fn check_column(&self, col: u32) -> DbResult<usize> {
        if (col as usize) < self.headers.len() {
            Ok(col as usize)
        } else {
            Err(DbError::ColumnOutOfRange(col))
        }
    }
}

impl SqlCursor for SqliteCursor {
    fn flags(&self) -> u32 {
        cursor_flags::IS_STATIC
    }

    fn columns(&self) -> u32 {
        self.headers.len() as u32
    }

    fn rows(&self) -> i64 {
        self.rows
    }

    fn at(&self) -> i64 {
        self.at
    }

    fn seek(&mut self, row: i64) -> DbResult<bool> {
        self.at = row.clamp(0, self.rows);
        Ok(!self.at_end())
    }

    fn next(&mut self) -> DbResult<bool> {
        if self.at < self.rows {
            self.at += 1;
        }
        Ok(!self.at_end())
    }

    fn at_end(&self) -> bool {
        self.at >= self.rows
    }

    fn data(&self, col: u32) -> DbResult<Value> {
        let col = self.check_column(col)?;
        if self.at_end() {
            return Err(DbError::DatabaseError(format!(
                "Row {} is past the end",
                self.at
            )));
        }
        let idx = self.at as usize * self.headers.len() + col;
        self.data
            .get(idx)
            .cloned()
            .ok_or_else(|| DbError::InternalError(format!("Missing cell {}", idx)))
    }

    fn header(&self, col: u32) -> DbResult<String> {
        let col = self.check_column(col)?;
        Ok(self.headers[col].clone())
    }

    fn column_type(&self, col: u32) -> DbResult<ColType> {
        let col = self.check_column(col)?;
        Ok(self.types[col])
    }

    fn copy(&self) -> DbResult<Box<dyn SqlCursor>> {
        Ok(Box::new(SqliteCursor {
            headers: self.headers.clone(),
            types: self.types.clone(),
            data: self.data.clone(),
            rows: self.rows,
            at: self.at,
        }))
    }
}

/// Map a declared column type such as `VARCHAR(40)` onto a [`ColType`]
pub fn column_type(declared: Option<&str>) -> ColType {
    let declared = declared.unwrap_or("").to_ascii_uppercase();
    let data_type = DECLARED_TYPES
        .iter()
        .find(|(keyword, _)| declared.contains(keyword))
        .map(|(_, ty)| *ty)
        .unwrap_or(DataType::Null);

    let size = declared
        .split_once('(')
        .and_then(|(_, rest)| rest.split(|c| c == ')' || c == ',').next())
        .and_then(|n| n.trim().parse::<i32>().ok())
        .or_else(|| data_type.fixed_size().map(|n| n as i32))
        .unwrap_or(-1);

    ColType { data_type, size }
}

fn to_sqlite(value: &Value) -> SqliteValue {
    match value {
        Value::Null => SqliteValue::Null,
        Value::VarChar(s) | Value::Char(s) | Value::WVarChar(s) | Value::WChar(s) => {
            SqliteValue::Text(s.clone())
        }
        Value::Real(v) => SqliteValue::Real(*v as f64),
        Value::Double(v) | Value::Float(v) => SqliteValue::Real(*v),
        Value::Timestamp(v) => temporal_text(value, TIMESTAMP_FORMAT, *v),
        Value::Date(v) => temporal_text(value, DATE_FORMAT, *v),
        Value::Time(v) => match value.as_time() {
            Some(t) => SqliteValue::Text(t.format(TIME_FORMAT).to_string()),
            None => SqliteValue::Integer(*v),
        },
        Value::Blob(b) => SqliteValue::Blob(b.clone()),
        other => SqliteValue::Integer(other.as_i64().unwrap_or_default()),
    }
}

fn temporal_text(value: &Value, format: &str, raw: i64) -> SqliteValue {
    match value.as_datetime() {
        Some(dt) => SqliteValue::Text(dt.format(format).to_string()),
        None => SqliteValue::Integer(raw),
    }
}

fn from_sqlite(raw: ValueRef<'_>, declared: DataType) -> Value {
    match raw {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => match declared {
            DataType::TinyInt => i8::try_from(i).map(Value::TinyInt).unwrap_or(Value::BigInt(i)),
            DataType::SmallInt => {
                i16::try_from(i).map(Value::SmallInt).unwrap_or(Value::BigInt(i))
            }
            DataType::Integer => i32::try_from(i).map(Value::Integer).unwrap_or(Value::BigInt(i)),
            DataType::Decimal => Value::Decimal(i),
            DataType::Numeric => Value::Numeric(i),
            _ => Value::BigInt(i),
        },
        ValueRef::Real(f) => match declared {
            DataType::Real => Value::Real(f as f32),
            DataType::Float => Value::Float(f),
            _ => Value::Double(f),
        },
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes).into_owned();
            match declared {
                DataType::Char => Value::Char(text),
                DataType::WVarChar => Value::WVarChar(text),
                DataType::WChar => Value::WChar(text),
                DataType::Timestamp => NaiveDateTime::parse_from_str(&text, TIMESTAMP_FORMAT)
                    .map(|dt| Value::timestamp(dt.and_utc()))
                    .unwrap_or(Value::VarChar(text)),
                DataType::Date => NaiveDate::parse_from_str(&text, DATE_FORMAT)
                    .map(Value::date)
                    .unwrap_or(Value::VarChar(text)),
                DataType::Time => NaiveTime::parse_from_str(&text, TIME_FORMAT)
                    .map(Value::time)
                    .unwrap_or(Value::VarChar(text)),
                _ => Value::VarChar(text),
            }
        }
        ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
    }
}
