//! Control and data links
//!
//! A link is spawned from an accepted stream: one task reads, one task writes,
//! and nothing else touches the stream. Teardown goes through
//! [`LinkHandle::close`], which may be called any number of times from any
//! task.

use crate::error::LinkError;
use crate::latch::ErrorLatch;
use crate::pump::{read_loop, write_loop, PumpConfig};
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;

/// Which side of the relay a link faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkKind {
    /// Agent that dialed in from behind NAT
    Control,
    /// End user reaching the agent's service
    Data,
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkKind::Control => write!(f, "control"),
            LinkKind::Data => write!(f, "data"),
        }
    }
}

/// Lifecycle of a link's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Active,
    Closing,
    Closed,
}

impl LinkState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LinkState::Active,
            1 => LinkState::Closing,
            _ => LinkState::Closed,
        }
    }
}

const ACTIVE: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

struct LinkShared {
    kind: LinkKind,
    peer_addr: SocketAddr,
    latch: ErrorLatch,
    state: AtomicU8,
    reader: AbortHandle,
    writer: AbortHandle,
}

impl Drop for LinkShared {
    fn drop(&mut self) {
        // Last handle gone: make sure the stream does not outlive it
        self.reader.abort();
        self.writer.abort();
    }
}

/// Shared, cloneable view of a link used for failure detection and teardown.
#[derive(Clone)]
pub struct LinkHandle {
    inner: Arc<LinkShared>,
}

impl LinkHandle {
    pub fn kind(&self) -> LinkKind {
        self.inner.kind
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// `Active` while the link is presumed alive. Once the read or write loop
    /// has failed the link reports `Closing` until [`close`](Self::close)
    /// releases the connection.
    pub fn state(&self) -> LinkState {
        match LinkState::from_u8(self.inner.state.load(Ordering::Acquire)) {
            LinkState::Active if self.inner.latch.is_raised() => LinkState::Closing,
            state => state,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state() == LinkState::Closed
    }

    /// The first error this link hit, if any.
    pub fn error(&self) -> Option<LinkError> {
        self.inner.latch.get()
    }

    /// Resolves with the first error raised by the read loop, the write loop,
    /// or [`close`](Self::close).
    pub async fn failed(&self) -> LinkError {
        self.inner.latch.wait().await
    }

    /// Close the connection and stop both pump tasks.
    ///
    /// Returns true if this call moved the link out of `Active`; later calls
    /// are no-ops.
    pub fn close(&self) -> bool {
        if self
            .inner
            .state
            .compare_exchange(ACTIVE, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.inner.latch.raise(LinkError::Closed);
        // Dropping the aborted tasks drops both stream halves, which closes the socket
        self.inner.reader.abort();
        self.inner.writer.abort();
        self.inner.state.store(CLOSED, Ordering::Release);

        debug!(
            kind = %self.inner.kind,
            peer = %self.inner.peer_addr,
            "Link closed"
        );
        true
    }
}

impl fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkHandle")
            .field("kind", &self.inner.kind)
            .field("peer_addr", &self.inner.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// An endpoint with its queues.
///
/// `inbound` yields chunks read from the wire; chunks sent on `outbound` are
/// written to it.
pub struct Link {
    handle: LinkHandle,
    inbound: mpsc::Receiver<Bytes>,
    outbound: mpsc::Sender<Bytes>,
}

impl Link {
    /// Spawn the pump for an accepted TCP connection.
    pub fn from_tcp(
        stream: TcpStream,
        peer_addr: SocketAddr,
        kind: LinkKind,
        config: PumpConfig,
    ) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer_addr, "Failed to set TCP_NODELAY: {}", e);
        }
        let (reader, writer) = stream.into_split();
        Self::spawn(reader, writer, peer_addr, kind, config)
    }

    /// Spawn the pump over any byte stream.
    pub fn from_stream<S>(
        stream: S,
        peer_addr: SocketAddr,
        kind: LinkKind,
        config: PumpConfig,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::spawn(reader, writer, peer_addr, kind, config)
    }

    fn spawn<R, W>(
        reader: R,
        writer: W,
        peer_addr: SocketAddr,
        kind: LinkKind,
        config: PumpConfig,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let depth = config.queue_depth.max(1);
        let (inbound_tx, inbound) = mpsc::channel(depth);
        let (outbound, outbound_rx) = mpsc::channel(depth);
        let latch = ErrorLatch::new();

        let replies = config.answer_heartbeats.then(|| outbound.clone());
        let reader = tokio::spawn(read_loop(
            reader,
            inbound_tx,
            replies,
            latch.clone(),
            config,
        ));
        let writer = tokio::spawn(write_loop(writer, outbound_rx, latch.clone()));

        let handle = LinkHandle {
            inner: Arc::new(LinkShared {
                kind,
                peer_addr,
                latch,
                state: AtomicU8::new(ACTIVE),
                reader: reader.abort_handle(),
                writer: writer.abort_handle(),
            }),
        };

        Self {
            handle,
            inbound,
            outbound,
        }
    }

    pub fn handle(&self) -> LinkHandle {
        self.handle.clone()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.handle.peer_addr()
    }

    /// Split into the handle, the inbound receiver and the outbound sender.
    pub fn into_parts(self) -> (LinkHandle, mpsc::Receiver<Bytes>, mpsc::Sender<Bytes>) {
        (self.handle, self.inbound, self.outbound)
    }
}
