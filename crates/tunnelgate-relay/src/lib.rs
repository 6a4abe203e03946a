//! Reverse-tunnel relay
//!
//! An agent behind NAT dials the control port. While it is connected the relay
//! opens the data port, pairs the first user that connects there with the
//! agent, and forwards bytes both ways until either side goes away. Losing the
//! agent sends the relay back to waiting for a new one.

mod acceptor;
mod config;
mod error;
mod events;
mod server;
mod session;
mod supervisor;

pub use acceptor::DataAcceptor;
pub use config::{ConfigError, RelayConfig};
pub use error::RelayError;
pub use events::{EventBus, RelayEvent};
pub use server::RelayServer;
pub use session::{PairingSession, SessionEnd};
pub use supervisor::{SessionSupervisor, SupervisorExit};

pub use tunnelgate_link::{LinkError, LinkKind};
