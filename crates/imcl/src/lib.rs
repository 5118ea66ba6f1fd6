//! imcl: inter-module control links
//!
//! Modules in an audio processing graph talk to each other over control
//! ports, independent of the data path. A control link connects two ports
//! that may live in the same container, in two containers of this process,
//! or on two different processors. This crate provides:
//!
//! - **Control buffers**: recurring per-port queues and one-time allocations,
//!   returned to their source when dropped
//! - **Routing**: trigger messages ride the destination's command queue,
//!   polling messages wait on a data-side queue
//! - **Port lifecycle**: open, peer connected/disconnected, close, with
//!   buffers reclaimed on close
//! - **Island voting**: buffers from non-island ports keep a low-power
//!   island container awake while they are out
//! - **Command offload**: slow graph commands run on a shared worker pool
//!   when the container thread is real-time sensitive
//!
//! A [`Container`] owns everything and is serviced from one thread with
//! [`Container::run`] (or [`Container::poll_once`] when driven externally).
//! Other threads reach it through a [`ContainerHandle`].

pub mod buffer;
pub mod channel;
pub mod command;
pub mod container;
pub mod drain;
pub mod error;
pub mod ids;
pub mod island;
pub mod links;
pub mod message;
pub mod offload;
pub mod port;
pub mod queue;
mod router;
pub mod telemetry;
pub mod transport;
pub mod worker_pool;

pub use buffer::{
    BufferBody, BufferManager, CtrlBuffer, GeneralBufferManager, IslandBufferPool,
    OneTimeAllocators, PoolStats,
};
pub use channel::PollChannel;
pub use command::{Command, CommandAck, GraphCommand, GraphOpcode};
pub use container::{
    Container, ContainerConfig, ContainerHandle, ContainerServices, ControlModule, ImclCtx,
    IncomingIntent, ServiceReport,
};
pub use drain::{drain_bounded, retrieve_mine, DrainReport};
pub use error::{ErrorKind, ImclError, ImclResult};
pub use ids::{ModuleInstanceId, PortId, PortKey, PowerDomain};
pub use island::{IslandVote, NoIsland, Topology};
pub use links::{CloseReport, ControlLinks};
pub use message::{CtrlMsg, DestinationHandle, IncomingCtrl, MsgKind, SendFlags};
pub use offload::{
    needs_offload, AsyncCmdHandle, AsyncState, CmdOutcome, CommandProcessor, Continuation,
};
pub use port::{ControlPort, ControlPortSpec, PeerLink, PortOperation, PortState, PortTable};
pub use queue::{MsgQueue, QueueFull};
pub use transport::{NoTransport, Transport};
pub use worker_pool::{Job, PoolRequest, WorkerPool, WorkerPoolRegistry};

pub use imclconf::{ImclConfig, LimitsConfig, OffloadConfig};
pub use imclproto::{Address, ControlEnvelope, Opcode, Packet, PeerState, PeerStateUpdate};
