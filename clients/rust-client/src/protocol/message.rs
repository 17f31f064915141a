//! Message catalog: request/ack pairs and their numeric codes.
//!
//! Codes are laid out from a configurable chunk base. Request kind `k` uses
//! `chunk + 2k` and its acknowledgment `chunk + 2k + 1`. One code after the
//! last pair carries a failed acknowledgment for any request.

use serde::{Deserialize, Serialize};

use super::crypto::SealedPassword;
use super::error::DriverError;
use super::types::{ColType, ColumnData};
use super::value::Value;

/// Number of request/ack pairs in the catalog
pub const KIND_COUNT: u32 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    RequestKey = 0,
    Open,
    Close,
    PrepareStatement,
    UnprepareStatement,
    BindParameter,
    Execute,
    CloseCursor,
    RequestRows,
    RequestColTypes,
    RequestColHeaders,
    CopyCursor,
}

impl MessageKind {
    pub const ALL: [MessageKind; KIND_COUNT as usize] = [
        MessageKind::RequestKey,
        MessageKind::Open,
        MessageKind::Close,
        MessageKind::PrepareStatement,
        MessageKind::UnprepareStatement,
        MessageKind::BindParameter,
        MessageKind::Execute,
        MessageKind::CloseCursor,
        MessageKind::RequestRows,
        MessageKind::RequestColTypes,
        MessageKind::RequestColHeaders,
        MessageKind::CopyCursor,
    ];

    pub fn index(self) -> u32 {
        self as u32
    }

    pub fn from_index(index: u32) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    pub fn request_code(self, chunk: u32) -> u32 {
        chunk + 2 * self.index()
    }

    pub fn ack_code(self, chunk: u32) -> u32 {
        self.request_code(chunk) + 1
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageKind::RequestKey => "RequestKey",
            MessageKind::Open => "Open",
            MessageKind::Close => "Close",
            MessageKind::PrepareStatement => "PrepareStatement",
            MessageKind::UnprepareStatement => "UnprepareStatement",
            MessageKind::BindParameter => "BindParameter",
            MessageKind::Execute => "Execute",
            MessageKind::CloseCursor => "CloseCursor",
            MessageKind::RequestRows => "RequestRows",
            MessageKind::RequestColTypes => "RequestColTypes",
            MessageKind::RequestColHeaders => "RequestColHeaders",
            MessageKind::CopyCursor => "CopyCursor",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Code of the failed acknowledgment
pub fn failed_code(chunk: u32) -> u32 {
    chunk + 2 * KIND_COUNT
}

// ==================== Requests ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Open {
    pub driver: String,
    pub dbname: String,
    pub user: String,
    pub password: Option<SealedPassword>,
    pub host: Option<String>,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Close {
    pub connh: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrepareStatement {
    pub connh: u32,
    pub text: String,
    /// Rows to return with the ack; zero means prepare only
    pub request: u32,
    /// Cursor flags for the immediate execution; zero means no cursor
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnprepareStatement {
    pub stmth: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindParameter {
    pub stmth: u32,
    pub index: u32,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execute {
    pub stmth: u32,
    pub request: u32,
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseCursor {
    pub cursh: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRows {
    pub cursh: u32,
    pub start: i64,
    pub request: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorRequest {
    pub cursh: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    RequestKey,
    Open(Open),
    Close(Close),
    PrepareStatement(PrepareStatement),
    UnprepareStatement(UnprepareStatement),
    BindParameter(BindParameter),
    Execute(Execute),
    CloseCursor(CloseCursor),
    RequestRows(RequestRows),
    RequestColTypes(CursorRequest),
    RequestColHeaders(CursorRequest),
    CopyCursor(CursorRequest),
}

impl Request {
    pub fn kind(&self) -> MessageKind {
        match self {
            Request::RequestKey => MessageKind::RequestKey,
            Request::Open(_) => MessageKind::Open,
            Request::Close(_) => MessageKind::Close,
            Request::PrepareStatement(_) => MessageKind::PrepareStatement,
            Request::UnprepareStatement(_) => MessageKind::UnprepareStatement,
            Request::BindParameter(_) => MessageKind::BindParameter,
            Request::Execute(_) => MessageKind::Execute,
            Request::CloseCursor(_) => MessageKind::CloseCursor,
            Request::RequestRows(_) => MessageKind::RequestRows,
            Request::RequestColTypes(_) => MessageKind::RequestColTypes,
            Request::RequestColHeaders(_) => MessageKind::RequestColHeaders,
            Request::CopyCursor(_) => MessageKind::CopyCursor,
        }
    }
}

// ==================== Acknowledgments ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyAck {
    /// X25519 public key used to seal passwords
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAck {
    pub connh: u32,
}

/// Everything a client needs to start reading a freshly executed cursor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorInfo {
    pub cursh: u32,
    pub flags: u32,
    pub columns: u32,
    /// Total row count, or -1 when unknown
    pub rows: i64,
    /// First batch, row-major
    pub data: Vec<ColumnData>,
    pub rows_to_go: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrepareStatementAck {
    pub stmth: u32,
    pub par_names: Vec<String>,
    pub cursor: Option<CursorInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteAck {
    pub cursor: Option<CursorInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRowsAck {
    pub data: Vec<ColumnData>,
    /// 0 at end of data, -1 when unknown, otherwise rows left after this batch
    pub rows_to_go: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColTypesAck {
    pub types: Vec<ColType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColHeadersAck {
    pub headers: Vec<ColumnData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyCursorAck {
    pub cursh: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Ack {
    RequestKey(KeyAck),
    Open(OpenAck),
    Close,
    PrepareStatement(PrepareStatementAck),
    UnprepareStatement,
    BindParameter,
    Execute(ExecuteAck),
    CloseCursor,
    RequestRows(RequestRowsAck),
    RequestColTypes(ColTypesAck),
    RequestColHeaders(ColHeadersAck),
    CopyCursor(CopyCursorAck),
    /// The request failed on the server
    Failed(DriverError),
}

impl Ack {
    /// Kind of request this acknowledges, `None` for a failure
    pub fn kind(&self) -> Option<MessageKind> {
        Some(match self {
            Ack::RequestKey(_) => MessageKind::RequestKey,
            Ack::Open(_) => MessageKind::Open,
            Ack::Close => MessageKind::Close,
            Ack::PrepareStatement(_) => MessageKind::PrepareStatement,
            Ack::UnprepareStatement => MessageKind::UnprepareStatement,
            Ack::BindParameter => MessageKind::BindParameter,
            Ack::Execute(_) => MessageKind::Execute,
            Ack::CloseCursor => MessageKind::CloseCursor,
            Ack::RequestRows(_) => MessageKind::RequestRows,
            Ack::RequestColTypes(_) => MessageKind::RequestColTypes,
            Ack::RequestColHeaders(_) => MessageKind::RequestColHeaders,
            Ack::CopyCursor(_) => MessageKind::CopyCursor,
            Ack::Failed(_) => return None,
        })
    }

    /// Turn a failed acknowledgment into an error
    pub fn into_result(self) -> Result<Ack, DriverError> {
        match self {
            Ack::Failed(err) => Err(err),
            ack => Ok(ack),
        }
    }
}

impl From<Result<Ack, DriverError>> for Ack {
    fn from(result: Result<Ack, DriverError>) -> Self {
        result.unwrap_or_else(Ack::Failed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Ack(Ack),
}

impl Message {
    /// Numeric wire code of this message under the given chunk base
    pub fn code(&self, chunk: u32) -> u32 {
        match self {
            Message::Request(req) => req.kind().request_code(chunk),
            Message::Ack(ack) => match ack.kind() {
                Some(kind) => kind.ack_code(chunk),
                None => failed_code(chunk),
            },
        }
    }
}

/// A message plus its correlation id
///
/// A zero `msg_id` marks a fire-and-forget request that wants no reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub msg_id: u32,
    pub message: Message,
}

impl Frame {
    pub fn request(msg_id: u32, request: Request) -> Self {
        Self {
            msg_id,
            message: Message::Request(request),
        }
    }

    pub fn ack(msg_id: u32, ack: Ack) -> Self {
        Self {
            msg_id,
            message: Message::Ack(ack),
        }
    }

    pub fn wants_ack(&self) -> bool {
        self.msg_id != 0 && matches!(self.message, Message::Request(_))
    }
}
