//! Errors raised by the control plane.
//!
//! Every variant falls into one of four kinds (see [`ErrorKind`]). Callers
//! that only care about recovery policy match on [`ImclError::kind`] rather
//! than on individual variants.

use crate::ids::{ModuleInstanceId, PortKey};
use crate::offload::AsyncState;
use crate::port::{PortOperation, PortState};
use imclproto::WireError;

pub type ImclResult<T> = Result<T, ImclError>;

/// Recovery policy an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected synchronously; nothing was mutated
    Config,
    /// A queue, pool, bit or worker ran out; the operation degrades
    ResourceExhausted,
    /// Message or transition out of protocol; logged and aborted, state kept
    ProtocolViolation,
    /// A retry bound was exceeded
    LivelockGuard,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ImclError {
    #[error("Unknown control port {0}")]
    UnknownPort(PortKey),

    #[error("Unknown module {0}")]
    UnknownModule(ModuleInstanceId),

    #[error("Module {0} already registered")]
    DuplicateModule(ModuleInstanceId),

    #[error("Control port {0} already registered")]
    DuplicatePort(PortKey),

    #[error("Port {port} accepts {capacity} intents, {requested} requested")]
    TooManyIntents {
        port: PortKey,
        requested: usize,
        capacity: usize,
    },

    #[error("Intent {intent:#x} is not supported on port {port}")]
    UnsupportedIntent { port: PortKey, intent: u32 },

    #[error("Zero-size buffer requested on port {0}")]
    ZeroSize(PortKey),

    #[error("Payload of {len} bytes exceeds buffer capacity {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Malformed payload: {0}")]
    Malformed(#[from] WireError),

    #[error("Queue {0} is full")]
    QueueFull(String),

    #[error("Port {0} has no recurring buffer queue")]
    QueueAbsent(PortKey),

    #[error("No recurring buffer available on port {0}")]
    QueueEmpty(PortKey),

    #[error("Allocation of {0} bytes failed")]
    AllocationFailed(usize),

    #[error("No wakeup bit left in poll channel")]
    NoChannelBit,

    #[error("Worker pool is busy")]
    PoolBusy,

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(String),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Unexpected opcode {0:#x}")]
    UnexpectedOpcode(u32),

    #[error("Port {port}: {op:?} not allowed in state {state:?}")]
    InvalidTransition {
        port: PortKey,
        op: PortOperation,
        state: PortState,
    },

    #[error("Port {0} has no connected peer")]
    NotConnected(PortKey),

    #[error("Offload handle cannot accept work in state {0:?}")]
    OffloadState(AsyncState),

    #[error("Operation not supported by module")]
    Unsupported,

    #[error("Module rejected message: {0}")]
    Module(String),

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("Gave up after discarding {0} stale recurring buffers")]
    LivelockGuard(u32),
}

impl ImclError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ImclError::UnknownPort(_)
            | ImclError::UnknownModule(_)
            | ImclError::DuplicateModule(_)
            | ImclError::DuplicatePort(_)
            | ImclError::TooManyIntents { .. }
            | ImclError::UnsupportedIntent { .. }
            | ImclError::ZeroSize(_)
            | ImclError::PayloadTooLarge { .. }
            | ImclError::Logging(_) => ErrorKind::Config,

            ImclError::Malformed(WireError::InvalidOpcode(_)) => ErrorKind::ProtocolViolation,
            ImclError::Malformed(_) => ErrorKind::Config,

            ImclError::QueueFull(_)
            | ImclError::QueueAbsent(_)
            | ImclError::QueueEmpty(_)
            | ImclError::AllocationFailed(_)
            | ImclError::NoChannelBit
            | ImclError::PoolBusy
            | ImclError::Spawn(_)
            | ImclError::Transport(_) => ErrorKind::ResourceExhausted,

            ImclError::UnexpectedOpcode(_)
            | ImclError::InvalidTransition { .. }
            | ImclError::NotConnected(_)
            | ImclError::OffloadState(_)
            | ImclError::Unsupported
            | ImclError::Module(_) => ErrorKind::ProtocolViolation,

            ImclError::LivelockGuard(_) => ErrorKind::LivelockGuard,
        }
    }

    /// Resource exhaustion, including a tripped retry guard.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ResourceExhausted | ErrorKind::LivelockGuard
        )
    }

    pub fn is_protocol_violation(&self) -> bool {
        self.kind() == ErrorKind::ProtocolViolation
    }
}
