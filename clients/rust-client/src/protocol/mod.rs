//! Wire protocol definitions shared by the client driver and the server
//!
//! Message bodies use MessagePack; framing and codes live in [`codec`].

pub mod codec;
pub mod crypto;
pub mod error;
pub mod message;
pub mod transport;
pub mod types;
pub mod value;

pub use codec::{
    check_size, decode_message, encode_message, frame_len, MessageCodec, DEFAULT_CHUNK, DRIVER_MAGIC, MAX_MESSAGE_SIZE,
};
pub use crypto::SealedPassword;
pub use error::{DriverError, HandleKind};
pub use message::{
    Ack, BindParameter, Close, CloseCursor, ColHeadersAck, ColTypesAck, CopyCursorAck,
    CursorInfo, CursorRequest, Execute, ExecuteAck, Frame, KeyAck, Message, MessageKind, Open,
    OpenAck, PrepareStatement, PrepareStatementAck, Request, RequestRows, RequestRowsAck,
    UnprepareStatement,
};
pub use transport::Channel;
pub use types::{column_flags, cursor_flags, ColType, ColumnData, DataType};
pub use value::Value;
