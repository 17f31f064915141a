//! sqlipc Rust Client
//!
//! Client driver for SQL databases served by a remote dispatcher over a
//! message channel. Requests are pipelined with an explicit ack mode per
//! call, and cursors prefetch result rows in batches ahead of the reader.
//!
//! # Example
//!
//! ```no_run
//! use sqlipc_client::{cursor_flags, AckMode, ConnectionBuilder, Value};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), sqlipc_client::DriverError> {
//!     let conn = ConnectionBuilder::new("sqlite:inventory.db")
//!         .user("reader")
//!         .connect("127.0.0.1:6750")
//!         .await?;
//!     conn.open(None, AckMode::Wait).await?;
//!
//!     let stmt = conn.prepare("SELECT name FROM items WHERE qty > ?", AckMode::Deferred).await?;
//!     stmt.bind(0, Value::Integer(5), AckMode::Forget).await?;
//!     let mut cursor = stmt.execute(cursor_flags::DEFAULT, AckMode::Deferred).await?;
//!
//!     while !cursor.at_end().await? {
//!         println!("{}", cursor.data(0).await?.value);
//!         cursor.forwards().await?;
//!     }
//!     conn.close().await
//! }
//! ```

pub mod client;
pub mod protocol;

pub use client::{AckMode, Column, Connection, ConnectionBuilder, Cursor, Prefetch, Statement};
pub use protocol::{
    column_flags, cursor_flags, Channel, ColType, ColumnData, DataType, DriverError, HandleKind,
    MessageCodec, Value,
};
