//! Heartbeat probe on the control link
//!
//! Agents send the two ASCII bytes `pi` whenever they like; the relay answers
//! with the same two bytes and never forwards the probe.

/// Probe sent by the agent, and the reply written back.
pub const HEARTBEAT_PROBE: &[u8; 2] = b"pi";

/// Whether a received chunk is a heartbeat probe.
///
/// Only the first two bytes are inspected, so a chunk that starts with `pi`
/// is consumed whole. Chunks shorter than the probe are never probes.
pub fn is_heartbeat(chunk: &[u8]) -> bool {
    chunk.len() >= HEARTBEAT_PROBE.len() && chunk[..HEARTBEAT_PROBE.len()] == HEARTBEAT_PROBE[..]
}
