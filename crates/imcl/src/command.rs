//! Items carried on a container's command queue.

use crate::error::ImclResult;
use crate::message::CtrlMsg;
use crossbeam_channel::Sender;
use imclproto::Packet;
use std::fmt;

/// Graph-management operations a container is asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphOpcode {
    Open,
    Prepare,
    Start,
    Stop,
    Suspend,
    Flush,
    Close,
    SetConfig,
}

impl GraphOpcode {
    /// Only these may run on a worker thread.
    pub fn is_offload_eligible(self) -> bool {
        matches!(
            self,
            GraphOpcode::Open | GraphOpcode::Close | GraphOpcode::Stop | GraphOpcode::Suspend
        )
    }
}

/// Outcome reported to whoever issued a graph command.
#[derive(Debug, Clone)]
pub struct CommandAck {
    pub token: u64,
    pub opcode: GraphOpcode,
    pub result: ImclResult<()>,
    /// Whether the command ran on a worker thread.
    pub offloaded: bool,
}

pub struct GraphCommand {
    pub opcode: GraphOpcode,
    pub token: u64,
    pub sub_graphs: Vec<u32>,
    pub reply: Option<Sender<CommandAck>>,
}

impl GraphCommand {
    pub fn new(opcode: GraphOpcode, token: u64) -> Self {
        Self {
            opcode,
            token,
            sub_graphs: Vec::new(),
            reply: None,
        }
    }

    pub fn with_reply(mut self, reply: Sender<CommandAck>) -> Self {
        self.reply = Some(reply);
        self
    }

    /// Send the acknowledgement, if anyone is listening.
    pub fn ack(&self, result: ImclResult<()>, offloaded: bool) {
        if let Some(reply) = &self.reply {
            let _ = reply.send(CommandAck {
                token: self.token,
                opcode: self.opcode,
                result,
                offloaded,
            });
        }
    }
}

impl fmt::Debug for GraphCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphCommand")
            .field("opcode", &self.opcode)
            .field("token", &self.token)
            .field("sub_graphs", &self.sub_graphs)
            .finish()
    }
}

/// Anything that wakes a container through its command queue.
#[derive(Debug)]
pub enum Command {
    /// Trigger control message from a local port
    CtrlTrigger(CtrlMsg),
    /// Packet from another processor
    Packet(Packet),
    Graph(GraphCommand),
    Shutdown,
}
