//! Listener setup shared by both ports, and the one-shot data acceptor

use crate::error::RelayError;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

const BIND_ATTEMPTS: u32 = 3;
const BIND_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Bind `addr`, retrying while the port is still held (TIME_WAIT, or the
/// listener of the previous agent not yet dropped).
pub(crate) async fn bind_with_retry(addr: SocketAddr) -> Result<TcpListener, RelayError> {
    for attempt in 1..=BIND_ATTEMPTS {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                if attempt > 1 {
                    info!(
                        "Successfully bound to {} on attempt {}/{}",
                        addr, attempt, BIND_ATTEMPTS
                    );
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse && attempt < BIND_ATTEMPTS => {
                warn!(
                    "Port {} is in use (attempt {}/{}), retrying in {}s...",
                    addr.port(),
                    attempt,
                    BIND_ATTEMPTS,
                    BIND_RETRY_DELAY.as_secs()
                );
                tokio::time::sleep(BIND_RETRY_DELAY).await;
            }
            Err(e) => {
                return Err(RelayError::BindError {
                    address: addr.ip().to_string(),
                    port: addr.port(),
                    reason: e.to_string(),
                });
            }
        }
    }

    Err(RelayError::BindError {
        address: addr.ip().to_string(),
        port: addr.port(),
        reason: format!("Address in use after {} attempts", BIND_ATTEMPTS),
    })
}

/// Data-port listener owned by one supervisor.
///
/// It hands out a single user connection; the listener is released when the
/// acceptor is dropped, so a later agent can bind the same port again.
pub struct DataAcceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl DataAcceptor {
    pub async fn bind(addr: SocketAddr) -> Result<Self, RelayError> {
        let listener = bind_with_retry(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the user connection, consuming the acceptor.
    ///
    /// Accept errors are logged and the accept retried. The listener is
    /// closed as soon as this returns.
    pub async fn accept_one(self) -> (TcpStream, SocketAddr) {
        loop {
            match self.listener.accept().await {
                Ok(accepted) => return accepted,
                Err(e) => {
                    warn!("Failed to accept user connection on {}: {}", self.local_addr, e);
                }
            }
        }
    }
}
