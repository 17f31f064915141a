use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::error::DriverError;
use super::message::{
    failed_code, Ack, Frame, Message, MessageKind, Request, KIND_COUNT,
};

pub const DRIVER_MAGIC: &[u8] = b"sqlipc-drv-v1\0";
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_CHUNK: u32 = 0x5100;

/// Bytes of code and correlation id that follow the length prefix
const FRAME_HEADER: usize = 8;

/// Frames messages as `[len u32 BE][code u32 BE][msg_id u32 BE][msgpack body]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageCodec {
    chunk: u32,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK)
    }
}

impl MessageCodec {
    pub fn new(chunk: u32) -> Self {
        Self { chunk }
    }

    pub fn chunk(&self) -> u32 {
        self.chunk
    }

    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>, DriverError> {
        let body = encode_body(&frame.message)?;
        let len = FRAME_HEADER + body.len();
        if len > MAX_MESSAGE_SIZE {
            return Err(DriverError::MessageTooLarge);
        }

        let mut buf = Vec::with_capacity(4 + len);
        buf.extend_from_slice(&(len as u32).to_be_bytes());
        buf.extend_from_slice(&frame.message.code(self.chunk).to_be_bytes());
        buf.extend_from_slice(&frame.msg_id.to_be_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Decode a frame from the bytes following its length prefix
    pub fn decode(&self, payload: &[u8]) -> Result<Frame, DriverError> {
        if payload.len() < FRAME_HEADER {
            return Err(DriverError::ProtocolError(format!(
                "Frame of {} bytes is too short",
                payload.len()
            )));
        }
        let code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let msg_id = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        let body = &payload[FRAME_HEADER..];

        let message = self.decode_body(code, body)?;
        Ok(Frame { msg_id, message })
    }

    fn decode_body(&self, code: u32, body: &[u8]) -> Result<Message, DriverError> {
        if code == failed_code(self.chunk) {
            return Ok(Message::Ack(Ack::Failed(decode_message(body)?)));
        }

        let offset = code
            .checked_sub(self.chunk)
            .filter(|offset| *offset < 2 * KIND_COUNT)
            .ok_or_else(|| DriverError::InvalidCommand(format!("Unknown message code {:#x}", code)))?;
        let kind = MessageKind::from_index(offset / 2)
            .ok_or_else(|| DriverError::InvalidCommand(format!("Unknown message code {:#x}", code)))?;

        if offset % 2 == 0 {
            decode_request(kind, body).map(Message::Request)
        } else {
            decode_ack(kind, body).map(Message::Ack)
        }
    }

    /// Read one frame, returning `None` on a clean end of stream
    pub async fn read_frame<R>(&self, reader: &mut R) -> Result<Option<Frame>, DriverError>
    where
        R: AsyncRead + Unpin,
    {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => {
                return Err(DriverError::ConnectionError(format!(
                    "Read length failed: {}",
                    e
                )))
            }
        }

        let msg_len = u32::from_be_bytes(len_buf) as usize;
        if msg_len > MAX_MESSAGE_SIZE {
            return Err(DriverError::MessageTooLarge);
        }

        let mut payload = vec![0u8; msg_len];
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| DriverError::ConnectionError(format!("Read payload failed: {}", e)))?;

        self.decode(&payload).map(Some)
    }

    pub async fn write_frame<W>(&self, writer: &mut W, frame: &Frame) -> Result<(), DriverError>
    where
        W: AsyncWrite + Unpin,
    {
        let data = self.encode(frame)?;
        writer
            .write_all(&data)
            .await
            .map_err(|e| DriverError::ConnectionError(format!("Write failed: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| DriverError::ConnectionError(format!("Flush failed: {}", e)))
    }
}

fn encode_body(message: &Message) -> Result<Vec<u8>, DriverError> {
    match message {
        Message::Request(req) => encode_request(req),
        Message::Ack(ack) => encode_ack(ack),
    }
}

/// Encoded size of `message` after the length prefix
///
/// The chunk base only changes the code, never the size, so no codec is
/// needed to measure a frame.
pub fn frame_len(message: &Message) -> Result<usize, DriverError> {
    Ok(FRAME_HEADER + encode_body(message)?.len())
}

/// Fail with `MessageTooLarge` if `message` cannot be framed
///
/// Channels encode in a detached writer task, so callers check here before
/// queuing a frame whose encoding would otherwise stop the writer.
pub fn check_size(message: &Message) -> Result<(), DriverError> {
    if frame_len(message)? > MAX_MESSAGE_SIZE {
        return Err(DriverError::MessageTooLarge);
    }
    Ok(())
}

pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, DriverError> {
    rmp_serde::to_vec_named(msg)
        .map_err(|e| DriverError::ProtocolError(format!("Serialization failed: {}", e)))
}

pub fn decode_message<T: DeserializeOwned>(data: &[u8]) -> Result<T, DriverError> {
    rmp_serde::from_slice(data)
        .map_err(|e| DriverError::ProtocolError(format!("Deserialization failed: {}", e)))
}

fn encode_request(req: &Request) -> Result<Vec<u8>, DriverError> {
    match req {
        Request::RequestKey => Ok(Vec::new()),
        Request::Open(m) => encode_message(m),
        Request::Close(m) => encode_message(m),
        Request::PrepareStatement(m) => encode_message(m),
        Request::UnprepareStatement(m) => encode_message(m),
        Request::BindParameter(m) => encode_message(m),
        Request::Execute(m) => encode_message(m),
        Request::CloseCursor(m) => encode_message(m),
        Request::RequestRows(m) => encode_message(m),
        Request::RequestColTypes(m) | Request::RequestColHeaders(m) | Request::CopyCursor(m) => {
            encode_message(m)
        }
    }
}

fn encode_ack(ack: &Ack) -> Result<Vec<u8>, DriverError> {
    match ack {
        Ack::Close | Ack::UnprepareStatement | Ack::BindParameter | Ack::CloseCursor => {
            Ok(Vec::new())
        }
        Ack::RequestKey(m) => encode_message(m),
        Ack::Open(m) => encode_message(m),
        Ack::PrepareStatement(m) => encode_message(m),
        Ack::Execute(m) => encode_message(m),
        Ack::RequestRows(m) => encode_message(m),
        Ack::RequestColTypes(m) => encode_message(m),
        Ack::RequestColHeaders(m) => encode_message(m),
        Ack::CopyCursor(m) => encode_message(m),
        Ack::Failed(err) => encode_message(err),
    }
}

fn decode_request(kind: MessageKind, body: &[u8]) -> Result<Request, DriverError> {
    Ok(match kind {
        MessageKind::RequestKey => Request::RequestKey,
        MessageKind::Open => Request::Open(decode_message(body)?),
        MessageKind::Close => Request::Close(decode_message(body)?),
        MessageKind::PrepareStatement => Request::PrepareStatement(decode_message(body)?),
        MessageKind::UnprepareStatement => Request::UnprepareStatement(decode_message(body)?),
        MessageKind::BindParameter => Request::BindParameter(decode_message(body)?),
        MessageKind::Execute => Request::Execute(decode_message(body)?),
        MessageKind::CloseCursor => Request::CloseCursor(decode_message(body)?),
        MessageKind::RequestRows => Request::RequestRows(decode_message(body)?),
        MessageKind::RequestColTypes => Request::RequestColTypes(decode_message(body)?),
        MessageKind::RequestColHeaders => Request::RequestColHeaders(decode_message(body)?),
        MessageKind::CopyCursor => Request::CopyCursor(decode_message(body)?),
    })
}

fn decode_ack(kind: MessageKind, body: &[u8]) -> Result<Ack, DriverError> {
    Ok(match kind {
        MessageKind::RequestKey => Ack::RequestKey(decode_message(body)?),
        MessageKind::Open => Ack::Open(decode_message(body)?),
        MessageKind::Close => Ack::Close,
        MessageKind::PrepareStatement => Ack::PrepareStatement(decode_message(body)?),
        MessageKind::UnprepareStatement => Ack::UnprepareStatement,
        MessageKind::BindParameter => Ack::BindParameter,
        MessageKind::Execute => Ack::Execute(decode_message(body)?),
        MessageKind::CloseCursor => Ack::CloseCursor,
        MessageKind::RequestRows => Ack::RequestRows(decode_message(body)?),
        MessageKind::RequestColTypes => Ack::RequestColTypes(decode_message(body)?),
        MessageKind::RequestColHeaders => Ack::RequestColHeaders(decode_message(body)?),
        MessageKind::CopyCursor => Ack::CopyCursor(decode_message(body)?),
    })
}
