//! Pairing session: one control link coupled with one data link

use crate::events::{EventBus, RelayEvent};
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use tunnelgate_link::{Link, LinkError, LinkHandle, LinkKind};
use uuid::Uuid;

/// Why and after how much traffic a session ended.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEnd {
    /// Side whose failure ended the session
    pub failed: LinkKind,
    pub reason: LinkError,
    pub bytes_to_agent: u64,
    pub bytes_to_user: u64,
}

/// Relays chunks between an agent and a user until either link fails.
///
/// Chunks are forwarded one-for-one in read order. The first failure on
/// either side closes both connections; queued chunks are dropped.
pub struct PairingSession {
    id: Uuid,
    control: Link,
    data: Link,
    events: EventBus,
}

impl PairingSession {
    pub fn new(control: Link, data: Link, events: EventBus) -> Self {
        Self {
            id: Uuid::new_v4(),
            control,
            data,
            events,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn run(self) -> SessionEnd {
        let PairingSession {
            id,
            control,
            data,
            events,
        } = self;

        let (control_handle, mut from_agent, to_agent) = control.into_parts();
        let (data_handle, mut from_user, to_user) = data.into_parts();

        debug!(
            session = %id,
            agent = %control_handle.peer_addr(),
            user = %data_handle.peer_addr(),
            "Session started"
        );

        let mut bytes_to_agent = 0u64;
        let mut bytes_to_user = 0u64;

        let (failed, reason) = loop {
            tokio::select! {
                // Failures win over pending chunks: nothing is forwarded once one is seen
                biased;

                err = control_handle.failed() => break (LinkKind::Control, err),
                err = data_handle.failed() => break (LinkKind::Data, err),

                chunk = from_agent.recv() => match chunk {
                    Some(chunk) => {
                        let len = chunk.len() as u64;
                        if !forward(chunk, &to_user, &data_handle).await {
                            break (LinkKind::Data, failure_of(&data_handle));
                        }
                        bytes_to_user += len;
                        trace!(session = %id, bytes = len, "agent -> user");
                    }
                    None => break (LinkKind::Control, failure_of(&control_handle)),
                },

                chunk = from_user.recv() => match chunk {
                    Some(chunk) => {
                        let len = chunk.len() as u64;
                        if !forward(chunk, &to_agent, &control_handle).await {
                            break (LinkKind::Control, failure_of(&control_handle));
                        }
                        bytes_to_agent += len;
                        trace!(session = %id, bytes = len, "user -> agent");
                    }
                    None => break (LinkKind::Data, failure_of(&data_handle)),
                },
            }
        };

        control_handle.close();
        data_handle.close();

        events.emit(RelayEvent::SessionClosed {
            session: id,
            failed,
            reason: reason.clone(),
            bytes_to_agent,
            bytes_to_user,
        });

        SessionEnd {
            failed,
            reason,
            bytes_to_agent,
            bytes_to_user,
        }
    }
}

/// Queue `chunk` on the peer's outbound side, giving up if the peer fails
/// while the queue is full.
async fn forward(chunk: Bytes, to: &mpsc::Sender<Bytes>, peer: &LinkHandle) -> bool {
    tokio::select! {
        biased;
        _ = peer.failed() => false,
        sent = to.send(chunk) => sent.is_ok(),
    }
}

fn failure_of(handle: &LinkHandle) -> LinkError {
    handle.error().unwrap_or(LinkError::Closed)
}
