//! sqlipc server
//!
//! Serves SQL databases to remote clients over the sqlipc message protocol.
//! Each channel gets a [`DriverHandler`](driver::DriverHandler) that executes
//! requests against a local database driver and tracks the connections,
//! statements and cursors it hands out in a shared handle arena.

pub mod config;
pub mod driver;
pub mod error;
pub mod server;
pub mod sqldb;

pub use config::{PermitConfig, ServerConfig};
pub use driver::{DriverHandler, HandleTable};
pub use error::{DbError, DbResult};
pub use server::{serve, PermittedDatabase, SqlServer};
pub use sqldb::{DriverRegistry, SqlCursor, SqlDatabase, SqlStatement};
