//! Outgoing control message routing.
//!
//! | peer lives            | trigger                    | polling                      |
//! |-----------------------|----------------------------|------------------------------|
//! | same container        | own command queue          | shared intra-container queue |
//! | other container       | peer container's cmd queue | peer port's incoming queue   |
//! | other processor       | transport, `Trigger`       | transport, `Polling`         |
//!
//! The buffer goes back to its source exactly once on every path: forwarded
//! buffers are returned by the receiver, everything else is dropped here.

use crate::buffer::CtrlBuffer;
use crate::command::Command;
use crate::error::{ImclError, ImclResult};
use crate::ids::PortKey;
use crate::links::ControlLinks;
use crate::message::{CtrlMsg, IncomingCtrl, MsgKind, SendFlags};
use crate::port::{PeerLink, PortState};
use imclproto::{Address, ControlEnvelope, Opcode, Packet, PeerState, PeerStateUpdate, ENVELOPE_LEN};
use tracing::{debug, warn};

impl ControlLinks {
    /// Send (or, with `should_send == false`, return) a checked-out buffer.
    pub fn send(&mut self, mut buf: CtrlBuffer, flags: SendFlags) -> ImclResult<()> {
        buf.drop_vote();
        if !flags.should_send {
            return Ok(());
        }

        let src = buf.source();
        let port = self.ports.get(src)?;
        if port.state() != PortState::PeerConnected {
            debug!("{}: port {} not connected, returning buffer", self.log_id, src);
            return Err(ImclError::NotConnected(src));
        }
        let kind = if flags.is_trigger {
            MsgKind::Trigger
        } else {
            MsgKind::Polling
        };

        match port.link.clone() {
            PeerLink::Unlinked => Err(ImclError::NotConnected(src)),
            PeerLink::IntraContainer { peer } => {
                let msg = CtrlMsg {
                    kind,
                    src,
                    dst: peer,
                    intra_container: true,
                    buffer: buf,
                };
                match kind {
                    MsgKind::Trigger => self
                        .cmd_q
                        .push_back(Command::CtrlTrigger(msg))
                        .map_err(|_| ImclError::QueueFull(self.cmd_q.name().to_string())),
                    MsgKind::Polling => self
                        .intra_q
                        .push_back(msg)
                        .map_err(|_| ImclError::QueueFull(self.intra_q.name().to_string())),
                }
            }
            PeerLink::InterContainer { handle: None, .. } => {
                debug!("{}: port {} has no peer handle yet", self.log_id, src);
                Err(ImclError::NotConnected(src))
            }
            PeerLink::InterContainer {
                peer,
                handle: Some(handle),
            } => {
                let msg = CtrlMsg {
                    kind,
                    src,
                    dst: peer,
                    intra_container: false,
                    buffer: buf,
                };
                match kind {
                    MsgKind::Trigger => handle
                        .cmd_q
                        .push_back(Command::CtrlTrigger(msg))
                        .map_err(|_| ImclError::QueueFull(handle.cmd_q.name().to_string())),
                    MsgKind::Polling => handle
                        .data_q
                        .push_back(IncomingCtrl::Local(msg))
                        .map_err(|_| ImclError::QueueFull(handle.data_q.name().to_string())),
                }
            }
            PeerLink::InterProcessor { peer, peer_port } => {
                let opcode = match kind {
                    MsgKind::Trigger => Opcode::Trigger,
                    MsgKind::Polling => Opcode::Polling,
                };
                self.send_inter_processor(buf, src, peer, peer_port.0, opcode)
            }
        }
    }

    fn send_inter_processor(
        &self,
        buf: CtrlBuffer,
        src: PortKey,
        peer: Address,
        peer_port: u32,
        opcode: Opcode,
    ) -> ImclResult<()> {
        let needed = imclproto::PACKET_HEADER_LEN + ENVELOPE_LEN + buf.len();
        if needed > self.transport.max_packet_len() {
            return Err(ImclError::AllocationFailed(needed));
        }

        let payload = ControlEnvelope::new(peer_port).wrap(buf.payload());
        // the wire carries the low 32 bits of the port's token
        let token = buf.token() as u32;
        // the local buffer is done once its payload is copied
        drop(buf);

        let packet = Packet::new(
            opcode,
            Address::new(self.transport.host_domain(), src.module.0),
            peer,
            payload,
        )
        .with_token(token);
        self.transport.send(packet).map_err(|e| {
            warn!("{}: inter-processor send from {} failed: {}", self.log_id, src, e);
            e
        })
    }

    /// Tell the remote end of an inter-processor link that this side changed state.
    pub fn send_peer_state_update(&self, key: PortKey, state: PeerState) -> ImclResult<()> {
        let port = self.ports.get(key)?;
        let PeerLink::InterProcessor { peer, peer_port } = port.link else {
            return Ok(());
        };
        let update = PeerStateUpdate {
            ctrl_port_id: peer_port.0,
            state,
        };
        let packet = Packet::new(
            Opcode::PeerStateUpdate,
            Address::new(self.transport.host_domain(), key.module.0),
            peer,
            update.encode(),
        );
        debug!("{}: port {} announcing {:?} to {:?}", self.log_id, key, state, peer);
        self.transport.send(packet)
    }
}
