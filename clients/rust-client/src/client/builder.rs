use super::{connection_from_parts, Connection, Prefetch};
use crate::protocol::{Channel, DriverError, MessageCodec, DEFAULT_CHUNK};

/// Builds a [`Connection`] from a `driver:dbname` spec
///
/// ```no_run
/// use sqlipc_client::{AckMode, ConnectionBuilder};
///
/// # async fn run() -> Result<(), sqlipc_client::DriverError> {
/// let conn = ConnectionBuilder::new("sqlite:test.db")
///     .user("admin")
///     .prefetching(50, 30)
///     .connect("127.0.0.1:6750")
///     .await?;
/// conn.open(Some("secret"), AckMode::Wait).await?;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionBuilder {
    spec: String,
    user: String,
    host: Option<String>,
    port: u16,
    prefetch: Prefetch,
    chunk: u32,
}

impl ConnectionBuilder {
    pub fn new(spec: &str) -> Self {
        Self {
            spec: spec.to_string(),
            user: String::new(),
            host: None,
            port: 0,
            prefetch: Prefetch::default(),
            chunk: DEFAULT_CHUNK,
        }
    }

    pub fn user(mut self, user: &str) -> Self {
        self.user = user.to_string();
        self
    }

    /// Host the server-side driver should connect to
    pub fn host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn prefetching(mut self, batch: u32, ask_for_more: u32) -> Self {
        self.prefetch = Prefetch::new(batch, ask_for_more);
        self
    }

    /// First message code; must match the server's
    pub fn chunk(mut self, chunk: u32) -> Self {
        self.chunk = chunk;
        self
    }

    fn parse_spec(&self) -> Result<(String, String), DriverError> {
        match self.spec.split_once(':') {
            Some((driver, dbname)) if !driver.is_empty() && !dbname.is_empty() => {
                Ok((driver.to_string(), dbname.to_string()))
            }
            _ => Err(DriverError::InvalidCommand(format!(
                "Expected 'driver:dbname', got '{}'",
                self.spec
            ))),
        }
    }

    /// Build over an existing channel
    pub fn build(self, channel: Channel) -> Result<Connection, DriverError> {
        let (driver, dbname) = self.parse_spec()?;
        Ok(connection_from_parts(
            channel,
            self.prefetch,
            driver,
            dbname,
            self.user,
            self.host,
            self.port,
        ))
    }

    /// Connect to a server over TCP
    pub async fn connect(self, addr: &str) -> Result<Connection, DriverError> {
        self.parse_spec()?;
        let channel = Channel::connect(addr, MessageCodec::new(self.chunk)).await?;
        self.build(channel)
    }
}
