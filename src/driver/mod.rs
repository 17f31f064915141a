//! Server side of the sqlipc driver protocol
//!
//! A [`DriverHandler`] serves one channel: it decodes each request, runs it
//! against the local database driver and answers with an acknowledgment
//! when the request carried a correlation id.
//!
//! # Protocol Overview
//!
//! - **Magic Header**: `sqlipc-drv-v1\0` (14 bytes, sent once on connection)
//! - **Frame**: `[length: 4 bytes BE][code: 4 bytes BE][msg_id: 4 bytes BE][msgpack body]`
//! - **Codes**: request of kind `k` is `chunk + 2k`, its ack `chunk + 2k + 1`

pub use sqlipc_client::protocol;

pub mod handlers;
pub mod handles;

pub use handlers::spawn_driver_handler;
pub use handlers::DriverHandler;
pub use handles::{Handle, HandleTable, SessionId};
