//! Control messages and the handles used to reach another container.

use crate::buffer::CtrlBuffer;
use crate::command::Command;
use crate::error::ImclResult;
use crate::ids::PortKey;
use crate::queue::MsgQueue;
use crate::transport::Transport;
use imclproto::Packet;
use std::sync::Arc;

/// Delivery path of a control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    /// Rides the destination's command queue and is handled ahead of data
    Trigger,
    /// Parked on a data-side queue until the destination polls
    Polling,
}

/// Flags a module passes with a buffer on send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendFlags {
    /// False returns the buffer without transmitting it.
    pub should_send: bool,
    pub is_trigger: bool,
}

impl SendFlags {
    pub const TRIGGER: SendFlags = SendFlags {
        should_send: true,
        is_trigger: true,
    };

    pub const POLLING: SendFlags = SendFlags {
        should_send: true,
        is_trigger: false,
    };

    pub const RETURN: SendFlags = SendFlags {
        should_send: false,
        is_trigger: false,
    };
}

/// A control buffer in flight between two ports of this process.
#[derive(Debug)]
pub struct CtrlMsg {
    pub kind: MsgKind,
    pub src: PortKey,
    pub dst: PortKey,
    pub intra_container: bool,
    pub buffer: CtrlBuffer,
}

impl CtrlMsg {
    pub fn id(&self) -> u64 {
        self.buffer.id()
    }

    /// Whether `port` sent or will receive this message.
    pub fn involves(&self, port: PortKey) -> bool {
        self.src == port || self.dst == port
    }
}

/// What an external port's incoming queue holds.
#[derive(Debug)]
pub enum IncomingCtrl {
    /// From another container of this process
    Local(CtrlMsg),
    /// From another processor, still in wire form
    Remote(Packet),
}

impl IncomingCtrl {
    /// Hand an undelivered message back to where it came from. Local buffers
    /// return to their pool on drop; remote packets are acknowledged with
    /// `result`.
    pub(crate) fn give_back(self, transport: &dyn Transport, result: &ImclResult<()>) {
        match self {
            IncomingCtrl::Local(msg) => drop(msg),
            IncomingCtrl::Remote(packet) => transport.release(packet, result),
        }
    }
}

/// Everything needed to deliver to an external port of another container.
#[derive(Clone, Debug)]
pub struct DestinationHandle {
    pub(crate) data_q: Arc<MsgQueue<IncomingCtrl>>,
    pub(crate) cmd_q: Arc<MsgQueue<Command>>,
}

impl DestinationHandle {
    /// Messages waiting on the destination port.
    pub fn pending(&self) -> usize {
        self.data_q.len()
    }
}
