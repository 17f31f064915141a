//! Shared server state and the TCP listener
//!
//! One [`SqlServer`] is shared by every driver channel. It owns the
//! allow-list, the key used to unseal passwords, the local driver registry
//! and the handle arena.

pub mod permit;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, RwLock};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;
use x25519_dalek::StaticSecret;

use crate::config::ServerConfig;
use crate::driver::handles::{HandleTable, SessionId};
use crate::driver::protocol::{crypto, DriverError, Open, SealedPassword, DRIVER_MAGIC};
use crate::driver::spawn_driver_handler;
use crate::error::DbResult;
use crate::sqldb::DriverRegistry;

pub use permit::PermittedDatabase;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SqlServer {
    permitted: RwLock<Vec<PermittedDatabase>>,
    /// Generated on the first key request, kept for the server's lifetime
    secret: OnceLock<StaticSecret>,
    registry: DriverRegistry,
    handles: Mutex<HandleTable>,
    chunk: u32,
    next_session: AtomicU64,
}

impl SqlServer {
    /// Server with the built-in drivers and an empty allow-list
    pub fn new(chunk: u32) -> Self {
        Self::with_registry(chunk, DriverRegistry::new())
    }

    pub fn with_registry(chunk: u32, registry: DriverRegistry) -> Self {
        Self {
            permitted: RwLock::new(Vec::new()),
            secret: OnceLock::new(),
            registry,
            handles: Mutex::new(HandleTable::new()),
            chunk,
            next_session: AtomicU64::new(1),
        }
    }

    pub fn from_config(config: &ServerConfig) -> DbResult<Self> {
        let server = Self::new(config.chunk);
        for permit in &config.permits {
            server.add_database(PermittedDatabase::from_config(permit)?);
        }
        Ok(server)
    }

    pub fn chunk(&self) -> u32 {
        self.chunk
    }

    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    /// Allow Open requests matching `permit`
    pub fn add_database(&self, permit: PermittedDatabase) {
        let config = permit.config();
        tracing::info!(
            "Permitting {}:{} for user '{}'",
            config.driver,
            config.dbname,
            config.user
        );
        self.permitted.write().push(permit);
    }

    /// Withdraw entries added with exactly these patterns, host and port,
    /// returning whether any existed
    ///
    /// Connections already open stay open.
    pub fn remove_database(
        &self,
        driver: &str,
        dbname: &str,
        user: &str,
        host: Option<&str>,
        port: u16,
    ) -> bool {
        let mut permitted = self.permitted.write();
        let before = permitted.len();
        permitted.retain(|p| !p.is(driver, dbname, user, host, port));
        permitted.len() != before
    }

    pub fn is_permitted(&self, open: &Open) -> bool {
        self.permitted.read().iter().any(|p| p.matches(open))
    }

    fn secret(&self) -> &StaticSecret {
        self.secret.get_or_init(crypto::generate_secret)
    }

    /// X25519 public key clients seal passwords with
    pub fn public_key(&self) -> Vec<u8> {
        crypto::public_key_bytes(self.secret())
    }

    pub fn unseal(&self, sealed: &SealedPassword) -> Result<String, DriverError> {
        match self.secret.get() {
            Some(secret) => crypto::open_password(secret, sealed),
            None => Err(DriverError::AuthError(
                "Password sealed before any key was issued".to_string(),
            )),
        }
    }

    /// Number of live connection, statement and cursor handles
    pub fn handle_count(&self) -> usize {
        self.handles.lock().len()
    }

    pub(crate) fn handles(&self) -> MutexGuard<'_, HandleTable> {
        self.handles.lock()
    }

    pub(crate) fn new_session(&self) -> SessionId {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }
}

/// Check the magic header a driver sends first
async fn read_magic<R>(stream: &mut R) -> Result<(), DriverError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; DRIVER_MAGIC.len()];
    tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut header))
        .await
        .map_err(|_| DriverError::ConnectionError("Handshake timed out".to_string()))?
        .map_err(|e| DriverError::ConnectionError(e.to_string()))?;

    if header[..] != *DRIVER_MAGIC {
        return Err(DriverError::ProtocolError("Bad magic header".to_string()));
    }
    Ok(())
}

/// Accept driver connections until the listener fails
pub async fn serve(server: Arc<SqlServer>, listener: TcpListener) -> std::io::Result<()> {
    let handlers = spawn_driver_handler(server);

    loop {
        let (mut stream, addr) = listener.accept().await?;
        let handlers = handlers.clone();

        tokio::spawn(async move {
            if let Err(e) = read_magic(&mut stream).await {
                tracing::warn!("Rejected connection from {}: {}", addr, e);
                return;
            }
            if handlers.send((stream, addr.to_string())).await.is_err() {
                tracing::warn!("Driver handler is gone, dropping {}", addr);
            }
        });
    }
}
