//! Control acceptor: the relay's top-level loop

use crate::acceptor::bind_with_retry;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::events::{EventBus, RelayEvent};
use crate::supervisor::SessionSupervisor;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info};
use tunnelgate_link::{Link, LinkKind};

/// Accepts one agent at a time on the control port and supervises it.
///
/// States: waiting for an agent, then supervising it until its link fails,
/// then waiting again. Only binding a listener can fail the loop.
pub struct RelayServer {
    config: Arc<RelayConfig>,
    listener: TcpListener,
    control_addr: SocketAddr,
    events: EventBus,
}

impl RelayServer {
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        config.validate()?;

        let listener = bind_with_retry(config.control_addr()).await?;
        let control_addr = listener.local_addr()?;
        let events = EventBus::new(config.event_capacity);

        Ok(Self {
            config: Arc::new(config),
            listener,
            control_addr,
            events,
        })
    }

    /// Address agents connect to.
    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// Serve until a listener cannot be bound.
    pub async fn run(self) -> Result<(), RelayError> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves or a listener cannot be bound.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let (stop_tx, stop_rx) = watch::channel(false);

        loop {
            self.events.emit(RelayEvent::WaitingForAgent {
                control_addr: self.control_addr,
            });

            let (stream, peer) = loop {
                tokio::select! {
                    _ = &mut shutdown => {
                        info!("Relay shutting down");
                        return Ok(());
                    }
                    accepted = self.listener.accept() => match accepted {
                        Ok(accepted) => break accepted,
                        Err(e) => error!("Failed to accept agent connection: {}", e),
                    },
                }
            };

            let control =
                Link::from_tcp(stream, peer, LinkKind::Control, self.config.control_pump());
            self.events.emit(RelayEvent::AgentConnected { peer });

            // Binding the data port may retry for a while; stay responsive to shutdown
            let supervisor = tokio::select! {
                started = SessionSupervisor::start(
                    control,
                    self.config.clone(),
                    self.events.clone(),
                ) => started?,
                _ = &mut shutdown => {
                    info!("Relay shutting down");
                    return Ok(());
                }
            };
            let mut supervisor = tokio::spawn(supervisor.run(stop_rx.clone()));

            tokio::select! {
                finished = &mut supervisor => match finished {
                    Ok(exit) => debug!(agent = %peer, "Supervisor exited: {:?}", exit),
                    Err(e) => error!(agent = %peer, "Supervisor task failed: {}", e),
                },
                _ = &mut shutdown => {
                    info!("Relay shutting down");
                    let _ = stop_tx.send(true);
                    if let Ok(exit) = supervisor.await {
                        debug!(agent = %peer, "Supervisor exited: {:?}", exit);
                    }
                    return Ok(());
                }
            }
        }
    }
}
