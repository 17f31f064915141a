mod builder;
mod cursor;
mod session;
mod statement;

pub use builder::ConnectionBuilder;
pub use cursor::{Column, Cursor};
pub use session::{AckMode, Prefetch};
pub use statement::Statement;

use std::sync::Arc;
use std::time::Duration;

use session::{AckAction, Session};
use statement::ExecuteNow;

use crate::protocol::{crypto, Ack, Channel, DriverError, Open, Request};

/// Client connection to a database behind a server dispatcher
///
/// Requests are pipelined: each call takes an [`AckMode`] deciding whether
/// to wait for the server, defer the ack, or not ask for one. Deferred
/// errors are reported by whichever later call consumes the ack, or by
/// [`Connection::synchronise`].
pub struct Connection {
    session: Arc<Session>,
    driver: String,
    dbname: String,
    user: String,
    host: Option<String>,
    port: u16,
}

impl Connection {
    pub fn driver(&self) -> &str {
        &self.driver
    }

    pub fn dbname(&self) -> &str {
        &self.dbname
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn version(&self) -> &'static str {
        concat!("sqlipc-client ", env!("CARGO_PKG_VERSION"))
    }

    pub fn is_open(&self) -> bool {
        self.session.connh() != 0
    }

    /// Server connection handle, 0 while not open
    pub fn handle(&self) -> u32 {
        self.session.connh()
    }

    pub fn prefetching(&self) -> Prefetch {
        self.session.prefetch()
    }

    /// Rows per batch and the low-water mark; a batch of 0 is treated as 1
    pub fn set_prefetching(&self, batch: u32, ask_for_more: u32) {
        self.session.set_prefetch(Prefetch::new(batch, ask_for_more));
    }

    /// Number of acks not yet consumed
    pub fn pending_acks(&self) -> usize {
        self.session.pending_count()
    }

    /// Open the database; does nothing when open or already opening
    ///
    /// A password is sealed with the server's public key and never sent in
    /// clear text.
    pub async fn open(&self, password: Option<&str>, mode: AckMode) -> Result<(), DriverError> {
        {
            let mut state = self.session.state.lock();
            if state.connh != 0 || state.opening {
                return Ok(());
            }
            state.opening = true;
        }

        let queued = self.send_open(password).await;
        match queued {
            Ok(msg_id) if mode == AckMode::Wait => self.session.wait_for(msg_id).await,
            Ok(_) => Ok(()),
            Err(e) => {
                self.session.state.lock().opening = false;
                Err(e)
            }
        }
    }

    async fn send_open(&self, password: Option<&str>) -> Result<u32, DriverError> {
        let password = match password {
            Some(pw) => Some(self.seal(pw).await?),
            None => None,
        };
        tracing::debug!("Opening {}:{} as '{}'", self.driver, self.dbname, self.user);
        self.session.send_async(
            Request::Open(Open {
                driver: self.driver.clone(),
                dbname: self.dbname.clone(),
                user: self.user.clone(),
                password,
                host: self.host.clone(),
                port: self.port,
            }),
            AckAction::Open,
        )
    }

    async fn seal(&self, password: &str) -> Result<crypto::SealedPassword, DriverError> {
        match self.session.round_trip(Request::RequestKey).await? {
            Ack::RequestKey(key) => crypto::seal_password(&key.public_key, password),
            other => Err(DriverError::ProtocolError(format!(
                "Unexpected acknowledgment {:?}",
                other.kind()
            ))),
        }
    }

    /// Drain outstanding acks, then close the server connection
    pub async fn close(&self) -> Result<(), DriverError> {
        let drained = self.session.synchronise().await;
        let connh = self.session.connh();
        if connh == 0 {
            return drained;
        }
        let msg_id = self
            .session
            .send_async(Request::Close(crate::protocol::Close { connh }), AckAction::Close)?;
        self.session.wait_for(msg_id).await?;
        drained
    }

    async fn require_open(&self) -> Result<u32, DriverError> {
        let session = &self.session;
        session.resolve(|| !session.state.lock().opening).await?;
        match session.connh() {
            0 => Err(DriverError::InvalidState("Database is not open".to_string())),
            connh => Ok(connh),
        }
    }

    pub async fn prepare(&self, text: &str, mode: AckMode) -> Result<Statement, DriverError> {
        let connh = self.require_open().await?;
        let (statement, _) =
            Statement::prepare(&self.session, connh, text, ExecuteNow::No, mode).await?;
        Ok(statement)
    }

    /// Prepare and execute in one round trip; the first batch comes with the ack
    pub async fn execute(&self, text: &str, flags: u32, mode: AckMode) -> Result<Cursor, DriverError> {
        if flags == 0 {
            return Err(DriverError::InvalidCommand(
                "Cursor flags must not be zero, use immediate() instead".to_string(),
            ));
        }
        let connh = self.require_open().await?;
        let (_, cursor) =
            Statement::prepare(&self.session, connh, text, ExecuteNow::Cursor(flags), mode).await?;
        cursor.ok_or_else(|| DriverError::InvalidState("No cursor was created".to_string()))
    }

    /// Prepare and execute a statement that returns no rows
    pub async fn immediate(&self, text: &str, mode: AckMode) -> Result<(), DriverError> {
        let connh = self.require_open().await?;
        Statement::prepare(&self.session, connh, text, ExecuteNow::Immediate, mode).await?;
        Ok(())
    }

    /// Consume every pending ack, returning the first error among them
    pub async fn synchronise(&self) -> Result<(), DriverError> {
        self.session.synchronise().await
    }

    /// Consume acks that arrive within `timeout` each, returning how many were handled
    pub async fn poll_acks(&self, timeout: Duration) -> Result<usize, DriverError> {
        let mut handled = 0;
        while self.session.poll_ack(Some(timeout)).await? {
            handled += 1;
        }
        Ok(handled)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("driver", &self.driver)
            .field("dbname", &self.dbname)
            .field("user", &self.user)
            .field("connh", &self.session.connh())
            .finish()
    }
}

pub(crate) fn connection_from_parts(
    channel: Channel,
    prefetch: Prefetch,
    driver: String,
    dbname: String,
    user: String,
    host: Option<String>,
    port: u16,
) -> Connection {
    Connection {
        session: Arc::new(Session::new(channel, prefetch)),
        driver,
        dbname,
        user,
        host,
        port,
    }
}
