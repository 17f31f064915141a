//! Connection handler for the sqlipc driver protocol
//!
//! Processes incoming requests and executes them against the local
//! database drivers.

use std::sync::Arc;
use tokio::net::TcpStream;

use crate::server::SqlServer;

use super::handles::SessionId;
use super::protocol::{codec, Ack, Channel, DriverError, Frame, Message, MessageCodec, Request};

pub mod connection;
pub mod cursor;
pub mod statement;

/// Handler for a single driver channel
pub struct DriverHandler {
    pub(crate) server: Arc<SqlServer>,
    /// Owner of every handle this channel creates
    pub(crate) session: SessionId,
}

impl DriverHandler {
    /// Create a new handler
    pub fn new(server: Arc<SqlServer>) -> Self {
        let session = server.new_session();
        Self { server, session }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Handle a TCP driver connection
    ///
    /// The magic header has already been consumed by the listener.
    pub async fn handle_connection(&mut self, stream: TcpStream, addr: String) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }
        let channel = Channel::from_stream(stream, MessageCodec::new(self.server.chunk()));
        self.handle_channel(channel, &addr).await;
    }

    /// Serve requests arriving on `channel` until the peer goes away
    pub async fn handle_channel(&mut self, mut channel: Channel, peer: &str) {
        tracing::info!("Driver connection from {}", peer);

        while let Some(frame) = channel.recv().await {
            let msg_id = frame.msg_id;
            let request = match frame.message {
                Message::Request(request) => request,
                Message::Ack(ack) => {
                    tracing::warn!("Unexpected acknowledgment {:?} from {}", ack.kind(), peer);
                    continue;
                }
            };

            let kind = request.kind();
            tracing::debug!("{} #{} from {}", kind.name(), msg_id, peer);
            let result = self.execute_request(request);

            if msg_id != 0 {
                let mut frame = Frame::ack(msg_id, Ack::from(result));
                if let Err(e) = codec::check_size(&frame.message) {
                    tracing::warn!("{} ack #{} for {} not sent: {}", kind.name(), msg_id, peer, e);
                    if let Message::Ack(ack) = &frame.message {
                        self.release_unsent(ack);
                    }
                    frame.message = Message::Ack(Ack::Failed(e));
                }
                if channel.send(frame).is_err() {
                    tracing::warn!("Failed to send acknowledgment to {}", peer);
                    break;
                }
            } else if let Err(e) = result {
                tracing::warn!("{} from {} failed without ack: {}", kind.name(), peer, e);
            }
        }

        tracing::debug!("Driver connection closed: {}", peer);
        self.cleanup();
    }

    /// Execute a request and return its acknowledgment
    pub fn execute_request(&mut self, request: Request) -> Result<Ack, DriverError> {
        match request {
            // ==================== Connections ====================
            Request::RequestKey => connection::handle_request_key(self),
            Request::Open(open) => connection::handle_open(self, open),
            Request::Close(close) => connection::handle_close(self, close.connh),

            // ==================== Statements ====================
            Request::PrepareStatement(prepare) => statement::handle_prepare(self, prepare),
            Request::UnprepareStatement(unprepare) => {
                statement::handle_unprepare(self, unprepare.stmth)
            }
            Request::BindParameter(bind) => statement::handle_bind(self, bind),
            Request::Execute(execute) => statement::handle_execute(self, execute),

            // ==================== Cursors ====================
            Request::CloseCursor(close) => cursor::handle_close_cursor(self, close.cursh),
            Request::RequestRows(rows) => cursor::handle_request_rows(self, rows),
            Request::RequestColTypes(req) => cursor::handle_col_types(self, req.cursh),
            Request::RequestColHeaders(req) => cursor::handle_col_headers(self, req.cursh),
            Request::CopyCursor(req) => cursor::handle_copy_cursor(self, req.cursh),
        }
    }

    /// Close every connection this channel opened
    /// Drop the handles only `ack` would have told the client about
    fn release_unsent(&self, ack: &Ack) {
        let result = match ack {
            Ack::PrepareStatement(prepared) => statement::handle_unprepare(self, prepared.stmth),
            Ack::Execute(executed) => match &executed.cursor {
                Some(info) => cursor::handle_close_cursor(self, info.cursh),
                None => return,
            },
            _ => return,
        };
        if let Err(e) = result {
            tracing::debug!("Could not release handles of unsent {:?}: {}", ack.kind(), e);
        }
    }

    fn cleanup(&mut self) {
        let connections = self.server.handles().connections_of(self.session);
        for connh in connections {
            tracing::debug!("Closing abandoned connection {:#010x}", connh);
            if let Err(e) = connection::handle_close(self, connh) {
                tracing::warn!("Failed to close connection {:#010x}: {}", connh, e);
            }
        }
    }
}

/// Spawn a handler task for each incoming driver connection
pub fn spawn_driver_handler(server: Arc<SqlServer>) -> tokio::sync::mpsc::Sender<(TcpStream, String)> {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<(TcpStream, String)>(100);

    tokio::spawn(async move {
        while let Some((stream, addr)) = rx.recv().await {
            let server = server.clone();
            tokio::spawn(async move {
                let mut handler = DriverHandler::new(server);
                handler.handle_connection(stream, addr).await;
            });
        }
    });

    tx
}
