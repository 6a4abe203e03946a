//! Connection endpoints for the tunnelgate relay
//!
//! A [`Link`] owns one byte stream and pumps it through a pair of queues: chunks
//! read from the wire come out of the inbound queue exactly as they were read,
//! chunks pushed onto the outbound queue are written verbatim. The first
//! failure on either direction is latched and can be awaited through a
//! [`LinkHandle`].
//!
//! Control links additionally answer `pi` heartbeat probes on their own.

pub mod error;
pub mod heartbeat;
pub mod latch;
pub mod link;
pub mod pump;

pub use error::LinkError;
pub use heartbeat::{is_heartbeat, HEARTBEAT_PROBE};
pub use latch::ErrorLatch;
pub use link::{Link, LinkHandle, LinkKind, LinkState};
pub use pump::PumpConfig;
