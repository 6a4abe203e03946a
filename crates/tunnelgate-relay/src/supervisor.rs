//! Session supervisor: everything that happens while one agent is connected

use crate::acceptor::DataAcceptor;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::events::{EventBus, RelayEvent};
use crate::session::{PairingSession, SessionEnd};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use tunnelgate_link::{Link, LinkError, LinkHandle, LinkKind};

/// How a supervisor finished.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorExit {
    /// The agent link failed; the relay should accept a new agent
    ControlFailed(LinkError),
    /// The relay is shutting down
    Shutdown,
}

struct ActiveSession {
    data: LinkHandle,
    task: JoinHandle<SessionEnd>,
}

/// Owns one control link, its data-port listener, and at most one pairing.
pub struct SessionSupervisor {
    config: Arc<RelayConfig>,
    events: EventBus,
    control: LinkHandle,
    /// Data-port listener and the control link waiting for a user
    pending: Option<(DataAcceptor, Link)>,
    active: Option<ActiveSession>,
}

impl SessionSupervisor {
    /// Bind the data port for `control`.
    ///
    /// A bind failure is fatal for the relay; the control link is closed
    /// before the error is returned.
    pub async fn start(
        control: Link,
        config: Arc<RelayConfig>,
        events: EventBus,
    ) -> Result<Self, RelayError> {
        let handle = control.handle();
        let acceptor = match DataAcceptor::bind(config.data_addr()).await {
            Ok(acceptor) => acceptor,
            Err(e) => {
                handle.close();
                return Err(e);
            }
        };

        events.emit(RelayEvent::WaitingForUser {
            data_addr: acceptor.local_addr(),
        });

        Ok(Self {
            config,
            events,
            control: handle,
            pending: Some((acceptor, control)),
            active: None,
        })
    }

    pub fn control(&self) -> &LinkHandle {
        &self.control
    }

    /// Whether a user has been paired with this agent.
    pub fn is_paired(&self) -> bool {
        self.active.is_some()
    }

    /// Address of the data-port listener while it is still open.
    pub fn data_addr(&self) -> Option<std::net::SocketAddr> {
        self.pending
            .as_ref()
            .map(|(acceptor, _)| acceptor.local_addr())
    }

    /// Run until the control link fails or `shutdown` turns true.
    ///
    /// The control link, the paired data link and the data-port listener are
    /// all released before this returns, whichever way it ends.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> SupervisorExit {
        let control = self.control.clone();
        let accept = accept_user(self.pending.take());
        tokio::pin!(accept);
        let mut accepting = true;

        let exit = loop {
            tokio::select! {
                biased;

                _ = stop_requested(&mut shutdown) => break SupervisorExit::Shutdown,

                err = control.failed() => {
                    self.events.emit(RelayEvent::AgentDisconnected {
                        peer: control.peer_addr(),
                        reason: err.clone(),
                    });
                    break SupervisorExit::ControlFailed(err);
                }

                (waiting, stream, peer) = &mut accept, if accepting => {
                    // The acceptor was consumed: no second user is ever served
                    accepting = false;
                    let data =
                        Link::from_tcp(stream, peer, LinkKind::Data, self.config.data_pump());
                    self.pair(waiting, data);
                }
            }
        };

        self.teardown();
        exit
    }

    fn pair(&mut self, control: Link, data: Link) {
        debug_assert!(self.active.is_none(), "agent paired twice");

        let data_handle = data.handle();
        let session = PairingSession::new(control, data, self.events.clone());
        self.events.emit(RelayEvent::UserConnected {
            peer: data_handle.peer_addr(),
            session: session.id(),
        });

        let task = tokio::spawn(session.run());
        self.active = Some(ActiveSession {
            data: data_handle,
            task,
        });
    }

    fn teardown(&mut self) {
        self.control.close();
        if let Some(active) = self.active.take() {
            active.data.close();
            // The session sees the closed links and finishes on its own
            drop(active.task);
        }
        debug!(agent = %self.control.peer_addr(), "Supervisor finished");
    }
}

/// Wait for the single user, handing the waiting control link back with it.
async fn accept_user(
    pending: Option<(DataAcceptor, Link)>,
) -> (Link, tokio::net::TcpStream, std::net::SocketAddr) {
    match pending {
        Some((acceptor, control)) => {
            let (stream, peer) = acceptor.accept_one().await;
            (control, stream, peer)
        }
        // `run` consumes the supervisor, so the pair is only ever taken once
        None => std::future::pending().await,
    }
}

/// Resolves once shutdown is requested or the relay loop is gone.
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
