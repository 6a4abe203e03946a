//! Lifecycle events
//!
//! Every event is logged through `tracing` and broadcast to whoever
//! subscribed. Publishing never waits on subscribers.

use std::net::SocketAddr;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tunnelgate_link::{LinkError, LinkKind};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    WaitingForAgent {
        control_addr: SocketAddr,
    },
    AgentConnected {
        peer: SocketAddr,
    },
    AgentDisconnected {
        peer: SocketAddr,
        reason: LinkError,
    },
    WaitingForUser {
        data_addr: SocketAddr,
    },
    UserConnected {
        peer: SocketAddr,
        session: Uuid,
    },
    SessionClosed {
        session: Uuid,
        failed: LinkKind,
        reason: LinkError,
        bytes_to_agent: u64,
        bytes_to_user: u64,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RelayEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: RelayEvent) {
        match &event {
            RelayEvent::WaitingForAgent { control_addr } => {
                info!("Listening on {}, waiting for agent", control_addr);
            }
            RelayEvent::AgentConnected { peer } => {
                info!(peer = %peer, "Agent connected");
            }
            RelayEvent::AgentDisconnected { peer, reason } => {
                warn!(peer = %peer, "Agent link failed, waiting for a new agent: {}", reason);
            }
            RelayEvent::WaitingForUser { data_addr } => {
                info!("Listening on {}, waiting for user", data_addr);
            }
            RelayEvent::UserConnected { peer, session } => {
                info!(peer = %peer, session = %session, "User connected");
            }
            RelayEvent::SessionClosed {
                session,
                failed,
                reason,
                bytes_to_agent,
                bytes_to_user,
            } => {
                info!(
                    session = %session,
                    bytes_to_agent = bytes_to_agent,
                    bytes_to_user = bytes_to_user,
                    "Closing session after {} link error: {}",
                    failed,
                    reason
                );
            }
        }

        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}
