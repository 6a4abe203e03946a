//! Byte pump: the read and write loops that sit between a stream and its queues

use crate::error::LinkError;
use crate::heartbeat::{is_heartbeat, HEARTBEAT_PROBE};
use crate::latch::ErrorLatch;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Tuning for one link's pump.
#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// Deadline for each individual read
    pub read_timeout: Duration,
    /// Size of the read buffer; one read never yields a larger chunk
    pub buffer_size: usize,
    /// Answer `pi` probes instead of delivering them
    pub answer_heartbeats: bool,
    /// Depth of the inbound and outbound queues
    pub queue_depth: usize,
}

impl PumpConfig {
    pub const DEFAULT_BUFFER_SIZE: usize = 10 * 1024;
    pub const DEFAULT_QUEUE_DEPTH: usize = 32;

    /// Pump settings for an agent-facing control link.
    pub fn control() -> Self {
        Self {
            read_timeout: Duration::from_secs(60),
            buffer_size: Self::DEFAULT_BUFFER_SIZE,
            answer_heartbeats: true,
            queue_depth: Self::DEFAULT_QUEUE_DEPTH,
        }
    }

    /// Pump settings for a user-facing data link.
    pub fn data() -> Self {
        Self {
            read_timeout: Duration::from_secs(200),
            buffer_size: Self::DEFAULT_BUFFER_SIZE,
            answer_heartbeats: false,
            queue_depth: Self::DEFAULT_QUEUE_DEPTH,
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }
}

/// Read chunks from `reader` into `inbound` until the first failure.
///
/// A clean end-of-stream counts as a failure ([`LinkError::PeerClosed`]) so
/// that a departed peer always tears the pairing down. When heartbeats are
/// enabled, probe chunks are answered through `replies`, which feeds the same
/// write loop as regular outbound traffic.
pub(crate) async fn read_loop<R>(
    mut reader: R,
    inbound: mpsc::Sender<Bytes>,
    replies: Option<mpsc::Sender<Bytes>>,
    latch: ErrorLatch,
    config: PumpConfig,
) where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; config.buffer_size.max(1)];

    let err = loop {
        let n = match tokio::time::timeout(config.read_timeout, reader.read(&mut buffer)).await {
            Err(_) => break LinkError::Timeout(config.read_timeout),
            Ok(Err(e)) => break LinkError::from(e),
            Ok(Ok(0)) => break LinkError::PeerClosed,
            Ok(Ok(n)) => n,
        };

        let chunk = &buffer[..n];

        if let Some(replies) = &replies {
            if is_heartbeat(chunk) {
                trace!("Heartbeat probe received, replying");
                if replies
                    .send(Bytes::from_static(HEARTBEAT_PROBE))
                    .await
                    .is_err()
                {
                    break LinkError::Closed;
                }
                continue;
            }
        }

        trace!(bytes = n, "Read chunk");
        if inbound.send(Bytes::copy_from_slice(chunk)).await.is_err() {
            // Nobody consumes this link any more
            break LinkError::Closed;
        }
    };

    debug!(error = %err, "Read loop stopped");
    latch.raise(err);
}

/// Write every queued chunk to `writer` verbatim until the first failure.
pub(crate) async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Bytes>,
    latch: ErrorLatch,
) where
    W: AsyncWrite + Unpin,
{
    let err = loop {
        let chunk = match outbound.recv().await {
            Some(chunk) => chunk,
            None => break LinkError::Closed,
        };

        if let Err(e) = writer.write_all(&chunk).await {
            break LinkError::from(e);
        }
        if let Err(e) = writer.flush().await {
            break LinkError::from(e);
        }
        trace!(bytes = chunk.len(), "Wrote chunk");
    };

    debug!(error = %err, "Write loop stopped");
    latch.raise(err);
}
