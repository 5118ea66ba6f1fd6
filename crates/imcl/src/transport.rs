//! Cross-processor packet transport.

use crate::error::{ImclError, ImclResult};
use imclproto::Packet;

/// Packet router between processor domains.
///
/// Sends are fire-and-forget: once `send` returns `Ok` the packet belongs to
/// the transport. A failed send drops (frees) the packet.
pub trait Transport: Send + Sync {
    /// Domain id of the processor this container runs on.
    fn host_domain(&self) -> u32;

    /// Largest packet the transport can allocate.
    fn max_packet_len(&self) -> usize {
        usize::MAX
    }

    fn send(&self, packet: Packet) -> ImclResult<()>;

    /// Acknowledge a received packet once it has been handled.
    fn release(&self, _packet: Packet, _result: &ImclResult<()>) {}
}

/// Transport for hosts without a second processor.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTransport;

impl Transport for NoTransport {
    fn host_domain(&self) -> u32 {
        0
    }

    fn send(&self, packet: Packet) -> ImclResult<()> {
        Err(ImclError::Transport(format!(
            "no route to domain {}",
            packet.dst.domain_id
        )))
    }
}
