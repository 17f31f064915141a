//! Pending-acknowledgment queue for one client connection.
//!
//! Requests that expect a reply push an entry onto a FIFO queue before they
//! are sent. Acks arrive in send order, so each one is matched against the
//! head of the queue and handed to the action recorded there.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::cursor::CursorState;
use super::statement::{self, StatementState};
use crate::protocol::{codec, Ack, Channel, DriverError, Frame, Message, MessageKind, Request};

pub(crate) type Shared<T> = Arc<Mutex<T>>;

/// How a request's acknowledgment is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Wait for the ack before returning
    #[default]
    Wait,
    /// Queue the ack and return; errors surface when it is consumed
    Deferred,
    /// Ask for no ack at all
    Forget,
}

impl AckMode {
    /// Requests that create a handle must be acknowledged
    pub(crate) fn creating(self) -> AckMode {
        match self {
            AckMode::Forget => AckMode::Deferred,
            mode => mode,
        }
    }
}

/// Rows fetched per batch and the low-water mark that triggers the next batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prefetch {
    pub batch: u32,
    pub ask_for_more: u32,
}

impl Default for Prefetch {
    fn default() -> Self {
        Self {
            batch: 20,
            ask_for_more: 15,
        }
    }
}

impl Prefetch {
    pub fn new(batch: u32, ask_for_more: u32) -> Self {
        Self {
            batch: batch.max(1),
            ask_for_more,
        }
    }
}

pub(crate) enum AckAction {
    Open,
    Close,
    Prepare {
        statement: Shared<StatementState>,
        cursor: Option<Shared<CursorState>>,
    },
    Execute(Shared<CursorState>),
    Rows {
        cursor: Shared<CursorState>,
        epoch: u64,
    },
    CopyCursor(Shared<CursorState>),
    Capture(Shared<Option<Result<Ack, DriverError>>>),
    Discard,
}

struct PendingAck {
    msg_id: u32,
    kind: MessageKind,
    action: AckAction,
}

#[derive(Debug, Default)]
pub(crate) struct ConnectionState {
    pub(crate) connh: u32,
    pub(crate) opening: bool,
}

pub(crate) struct Session {
    outbound: mpsc::UnboundedSender<Frame>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
    pending: Mutex<VecDeque<PendingAck>>,
    next_msg_id: AtomicU32,
    pub(crate) state: Mutex<ConnectionState>,
    prefetch: Mutex<Prefetch>,
}

impl Session {
    pub(crate) fn new(channel: Channel, prefetch: Prefetch) -> Self {
        let (outbound, inbound) = channel.into_parts();
        Self {
            outbound,
            inbound: tokio::sync::Mutex::new(inbound),
            pending: Mutex::new(VecDeque::new()),
            next_msg_id: AtomicU32::new(1),
            state: Mutex::new(ConnectionState::default()),
            prefetch: Mutex::new(prefetch),
        }
    }

    pub(crate) fn connh(&self) -> u32 {
        self.state.lock().connh
    }

    pub(crate) fn prefetch(&self) -> Prefetch {
        *self.prefetch.lock()
    }

    pub(crate) fn set_prefetch(&self, prefetch: Prefetch) {
        *self.prefetch.lock() = prefetch;
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn next_msg_id(&self) -> u32 {
        loop {
            let id = self.next_msg_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Send a request that wants no reply
    pub(crate) fn send_message(&self, request: Request) -> Result<(), DriverError> {
        tracing::trace!("-> {} (no ack)", request.kind());
        let frame = Frame::request(0, request);
        codec::check_size(&frame.message)?;
        self.outbound
            .send(frame)
            .map_err(|_| DriverError::ConnectionError("Channel closed".to_string()))
    }

    /// Fire-and-forget release of a server object; failures only get logged
    pub(crate) fn release(&self, request: Request) {
        let kind = request.kind();
        if let Err(e) = self.send_message(request) {
            tracing::debug!("Could not send {}: {}", kind, e);
        }
    }

    /// Send a request and queue `action` for its ack, returning the message id
    ///
    /// A request too large to frame fails here and is never queued.
    pub(crate) fn send_async(&self, request: Request, action: AckAction) -> Result<u32, DriverError> {
        let kind = request.kind();
        let mut frame = Frame::request(0, request);
        codec::check_size(&frame.message)?;

        let mut pending = self.pending.lock();
        let msg_id = self.next_msg_id();
        frame.msg_id = msg_id;
        tracing::trace!("-> {} #{}", kind, msg_id);
        self.outbound
            .send(frame)
            .map_err(|_| DriverError::ConnectionError("Channel closed".to_string()))?;
        pending.push_back(PendingAck {
            msg_id,
            kind,
            action,
        });
        Ok(msg_id)
    }

    pub(crate) async fn dispatch(
        &self,
        request: Request,
        action: AckAction,
        mode: AckMode,
    ) -> Result<(), DriverError> {
        match mode {
            AckMode::Forget => self.send_message(request),
            AckMode::Deferred => self.send_async(request, action).map(|_| ()),
            AckMode::Wait => {
                let msg_id = self.send_async(request, action)?;
                self.wait_for(msg_id).await
            }
        }
    }

    /// Send a request and wait for its ack
    pub(crate) async fn round_trip(&self, request: Request) -> Result<Ack, DriverError> {
        let slot = Arc::new(Mutex::new(None));
        let msg_id = self.send_async(request, AckAction::Capture(slot.clone()))?;
        self.wait_for(msg_id).await?;
        let result = slot.lock().take();
        result.unwrap_or_else(|| {
            Err(DriverError::ProtocolError(
                "Acknowledgment was never delivered".to_string(),
            ))
        })
    }

    fn is_pending(&self, msg_id: u32) -> bool {
        self.pending.lock().iter().any(|p| p.msg_id == msg_id)
    }

    /// Consume acks until the one for `msg_id` has been handled
    ///
    /// Errors of earlier deferred requests surface here as well.
    pub(crate) async fn wait_for(&self, msg_id: u32) -> Result<(), DriverError> {
        while self.is_pending(msg_id) {
            if !self.poll_ack(None).await? {
                break;
            }
        }
        Ok(())
    }

    /// Consume acks until `ready` holds or nothing is pending
    pub(crate) async fn resolve<F>(&self, ready: F) -> Result<(), DriverError>
    where
        F: Fn() -> bool,
    {
        while !ready() {
            if !self.poll_ack(None).await? {
                break;
            }
        }
        Ok(())
    }

    /// Drain the whole queue, returning the first error met
    pub(crate) async fn synchronise(&self) -> Result<(), DriverError> {
        let mut first = None;
        loop {
            match self.poll_ack(None).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) if e.is_fatal() => return Err(first.unwrap_or(e)),
                Err(e) => {
                    first.get_or_insert(e);
                }
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Handle the next ack, if any is pending
    ///
    /// With a timeout, returns `Ok(false)` when nothing arrived in time.
    pub(crate) async fn poll_ack(&self, timeout: Option<Duration>) -> Result<bool, DriverError> {
        let mut inbound = self.inbound.lock().await;
        if self.pending.lock().is_empty() {
            return Ok(false);
        }

        let frame = match timeout {
            None => inbound.recv().await,
            Some(t) => match tokio::time::timeout(t, inbound.recv()).await {
                Ok(frame) => frame,
                Err(_) => return Ok(false),
            },
        };
        let frame =
            frame.ok_or_else(|| DriverError::ConnectionError("Channel closed".to_string()))?;

        let entry = self.pending.lock().pop_front().ok_or_else(|| {
            DriverError::ProtocolError("Acknowledgment with nothing pending".to_string())
        })?;

        let ack = match frame.message {
            Message::Ack(ack) => ack,
            Message::Request(req) => {
                return Err(DriverError::ProtocolError(format!(
                    "Unexpected {} request from server",
                    req.kind()
                )))
            }
        };

        if frame.msg_id != entry.msg_id {
            return Err(DriverError::ProtocolError(format!(
                "Acknowledgment #{} arrived while #{} was expected",
                frame.msg_id, entry.msg_id
            )));
        }
        if let Some(kind) = ack.kind() {
            if kind != entry.kind {
                return Err(DriverError::ProtocolError(format!(
                    "{} acknowledgment for a {} request",
                    kind, entry.kind
                )));
            }
        }
        tracing::trace!("<- {} #{}", entry.kind, entry.msg_id);

        self.complete(entry.action, ack.into_result())?;
        Ok(true)
    }

    fn complete(&self, action: AckAction, result: Result<Ack, DriverError>) -> Result<(), DriverError> {
        if let AckAction::Capture(slot) = &action {
            *slot.lock() = Some(result);
            return Ok(());
        }

        let ack = match result {
            Ok(ack) => ack,
            Err(e) => {
                self.fail(action, &e);
                return Err(e);
            }
        };

        match (action, ack) {
            (AckAction::Discard, _) => {}
            (AckAction::Open, Ack::Open(ack)) => {
                let mut state = self.state.lock();
                state.opening = false;
                state.connh = ack.connh;
            }
            (AckAction::Close, Ack::Close) => self.state.lock().connh = 0,
            (AckAction::Prepare { statement, cursor }, Ack::PrepareStatement(ack)) => {
                for request in statement::prepared(&statement, cursor.as_ref(), ack) {
                    self.release(request);
                }
            }
            (AckAction::Execute(cursor), Ack::Execute(ack)) => {
                let mut state = cursor.lock();
                match ack.cursor {
                    Some(info) => {
                        if let Some(request) = state.configure(info) {
                            self.release(request);
                        }
                    }
                    None => state.fail(&DriverError::InvalidState(
                        "Statement produced no cursor".to_string(),
                    )),
                }
            }
            (AckAction::Rows { cursor, epoch }, Ack::RequestRows(ack)) => {
                cursor.lock().fill(epoch, ack);
            }
            (AckAction::CopyCursor(cursor), Ack::CopyCursor(ack)) => {
                if let Some(request) = cursor.lock().copied(ack.cursh) {
                    self.release(request);
                }
            }
            (action, ack) => {
                let e = DriverError::ProtocolError(format!(
                    "Unexpected acknowledgment {:?}",
                    ack.kind()
                ));
                self.fail(action, &e);
                return Err(e);
            }
        }
        Ok(())
    }

    fn fail(&self, action: AckAction, err: &DriverError) {
        match action {
            AckAction::Open => self.state.lock().opening = false,
            AckAction::Close => self.state.lock().connh = 0,
            AckAction::Prepare { statement, cursor } => {
                statement.lock().fail(err);
                if let Some(cursor) = cursor {
                    cursor.lock().fail(err);
                }
            }
            AckAction::Execute(cursor) | AckAction::CopyCursor(cursor) => cursor.lock().fail(err),
            AckAction::Rows { cursor, epoch } => cursor.lock().rows_failed(epoch, err),
            AckAction::Capture(_) | AckAction::Discard => {}
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let connh = self.state.get_mut().connh;
        if connh != 0 {
            self.release(Request::Close(crate::protocol::Close { connh }));
        }
    }
}
