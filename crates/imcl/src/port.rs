//! Control port registry and lifecycle.
//!
//! ```text
//!   Closed ──open──▶ Open ──peer_connected──▶ PeerConnected
//!     ▲               │                          │    ▲
//!     │               │               peer_disconnected│
//!     └────close──────┴──────────────────────────▼    │ peer_connected
//!                                         PeerDisconnected
//! ```
//!
//! Every non-closed state may close. Ports are created `Closed` when the graph
//! layer registers them and stay in the table after closing, so a second close
//! is detected rather than silently ignored.

use crate::buffer::RecurringPool;
use crate::error::{ImclError, ImclResult};
use crate::ids::{ModuleInstanceId, PortId, PortKey, PowerDomain};
use crate::message::{DestinationHandle, IncomingCtrl};
use crate::queue::MsgQueue;
use imclproto::Address;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortState {
    Closed,
    Open,
    PeerConnected,
    PeerDisconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortOperation {
    Open,
    PeerConnected,
    PeerDisconnected,
    Close,
}

impl PortState {
    /// State reached by applying `op`, if the transition is legal.
    pub fn apply(self, op: PortOperation) -> Option<PortState> {
        use PortOperation as Op;
        use PortState as S;
        match (self, op) {
            (S::Closed, Op::Open) => Some(S::Open),
            (S::Open | S::PeerDisconnected, Op::PeerConnected) => Some(S::PeerConnected),
            (S::PeerConnected, Op::PeerDisconnected) => Some(S::PeerDisconnected),
            (S::Open | S::PeerConnected | S::PeerDisconnected, Op::Close) => Some(S::Closed),
            _ => None,
        }
    }
}

/// How a port reaches its peer.
#[derive(Clone, Debug, Default)]
pub enum PeerLink {
    #[default]
    Unlinked,
    /// Peer lives in the same container
    IntraContainer { peer: PortKey },
    /// Peer lives in another container of this process. The handle is
    /// attached once the peer port exists.
    InterContainer {
        peer: PortKey,
        handle: Option<DestinationHandle>,
    },
    /// Peer lives on another processor
    InterProcessor { peer: Address, peer_port: PortId },
}

impl PeerLink {
    /// External links get their own incoming queue and channel bit.
    pub fn is_external(&self) -> bool {
        matches!(
            self,
            PeerLink::InterContainer { .. } | PeerLink::InterProcessor { .. }
        )
    }

    pub fn is_inter_processor(&self) -> bool {
        matches!(self, PeerLink::InterProcessor { .. })
    }
}

/// Static metadata the graph layer registers a port with.
#[derive(Clone, Debug)]
pub struct ControlPortSpec {
    pub id: PortId,
    /// Maximum intents; `None` takes the configured default.
    pub intent_capacity: Option<usize>,
    /// Intents the module accepts; empty accepts any.
    pub supported_intents: Vec<u32>,
    pub operating_domain: PowerDomain,
    pub link: PeerLink,
}

impl ControlPortSpec {
    pub fn new(id: u32, link: PeerLink) -> Self {
        Self {
            id: PortId(id),
            intent_capacity: None,
            supported_intents: Vec::new(),
            operating_domain: PowerDomain::NonIsland,
            link,
        }
    }

    pub fn with_intent_capacity(mut self, capacity: usize) -> Self {
        self.intent_capacity = Some(capacity);
        self
    }

    pub fn with_supported_intents(mut self, intents: impl Into<Vec<u32>>) -> Self {
        self.supported_intents = intents.into();
        self
    }

    pub fn in_domain(mut self, domain: PowerDomain) -> Self {
        self.operating_domain = domain;
        self
    }
}

/// Incoming queue of an external port.
#[derive(Debug)]
pub(crate) struct ExternalQueue {
    pub queue: Arc<MsgQueue<IncomingCtrl>>,
    pub bit: u32,
}

#[derive(Debug)]
pub struct ControlPort {
    key: PortKey,
    state: PortState,
    intent_capacity: usize,
    supported_intents: Vec<u32>,
    intents: Vec<u32>,
    operating_domain: PowerDomain,
    pub(crate) link: PeerLink,
    peer: Option<PortKey>,
    pub(crate) recurring: RecurringPool,
    /// Size and count announced by the module, applied when possible.
    pub(crate) recurring_info: (usize, usize),
    outgoing_token: u64,
    pub(crate) external: Option<ExternalQueue>,
}

impl ControlPort {
    pub(crate) fn new(
        key: PortKey,
        spec: ControlPortSpec,
        default_capacity: usize,
        queue_depth: usize,
        external: Option<ExternalQueue>,
    ) -> Self {
        Self {
            key,
            state: PortState::Closed,
            intent_capacity: spec.intent_capacity.unwrap_or(default_capacity),
            supported_intents: spec.supported_intents,
            intents: Vec::new(),
            operating_domain: spec.operating_domain,
            link: spec.link,
            peer: None,
            recurring: RecurringPool::new(format!("recurring {}", key), queue_depth),
            recurring_info: (0, 0),
            outgoing_token: 0,
            external,
        }
    }

    pub fn key(&self) -> PortKey {
        self.key
    }

    pub fn state(&self) -> PortState {
        self.state
    }

    pub fn intents(&self) -> &[u32] {
        &self.intents
    }

    pub fn operating_domain(&self) -> PowerDomain {
        self.operating_domain
    }

    pub fn link(&self) -> &PeerLink {
        &self.link
    }

    /// Peer recorded at open.
    pub fn peer(&self) -> Option<PortKey> {
        self.peer
    }

    pub fn is_external(&self) -> bool {
        self.external.is_some()
    }

    pub fn recurring_buf_size(&self) -> usize {
        self.recurring.buf_size()
    }

    pub fn recurring_buf_count(&self) -> usize {
        self.recurring.num_bufs()
    }

    /// Checks `op` against the state machine without applying it.
    pub(crate) fn check(&self, op: PortOperation) -> ImclResult<PortState> {
        self.state
            .apply(op)
            .ok_or(ImclError::InvalidTransition {
                port: self.key,
                op,
                state: self.state,
            })
    }

    pub(crate) fn set_state(&mut self, state: PortState) {
        self.state = state;
    }

    /// Validate and record the intents and peer given at open.
    pub(crate) fn record_open(&mut self, peer: PortKey, intents: &[u32]) -> ImclResult<()> {
        if intents.len() > self.intent_capacity {
            return Err(ImclError::TooManyIntents {
                port: self.key,
                requested: intents.len(),
                capacity: self.intent_capacity,
            });
        }
        if !self.supported_intents.is_empty() {
            if let Some(&bad) = intents.iter().find(|i| !self.supported_intents.contains(i)) {
                return Err(ImclError::UnsupportedIntent {
                    port: self.key,
                    intent: bad,
                });
            }
        }
        self.intents = intents.to_vec();
        self.peer = Some(peer);
        Ok(())
    }

    pub(crate) fn clear_open_state(&mut self) {
        self.intents.clear();
        self.peer = None;
    }

    pub(crate) fn next_token(&mut self) -> u64 {
        self.outgoing_token += 1;
        self.outgoing_token
    }
}

/// Every control port in one container, keyed by `(module, port)`.
#[derive(Debug, Default)]
pub struct PortTable {
    ports: BTreeMap<PortKey, ControlPort>,
}

impl PortTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, port: ControlPort) -> ImclResult<()> {
        let key = port.key();
        if self.ports.contains_key(&key) {
            return Err(ImclError::DuplicatePort(key));
        }
        self.ports.insert(key, port);
        Ok(())
    }

    pub(crate) fn remove(&mut self, key: PortKey) -> Option<ControlPort> {
        self.ports.remove(&key)
    }

    pub fn get(&self, key: PortKey) -> ImclResult<&ControlPort> {
        self.ports.get(&key).ok_or(ImclError::UnknownPort(key))
    }

    pub(crate) fn get_mut(&mut self, key: PortKey) -> ImclResult<&mut ControlPort> {
        self.ports.get_mut(&key).ok_or(ImclError::UnknownPort(key))
    }

    pub fn find_control_port_by_id(
        &self,
        module: ModuleInstanceId,
        port: PortId,
    ) -> Option<&ControlPort> {
        self.ports.get(&PortKey { module, port })
    }

    pub fn state(&self, key: PortKey) -> Option<PortState> {
        self.ports.get(&key).map(ControlPort::state)
    }

    pub fn keys_of(&self, module: ModuleInstanceId) -> Vec<PortKey> {
        self.ports
            .keys()
            .filter(|k| k.module == module)
            .copied()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ControlPort> {
        self.ports.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut ControlPort> {
        self.ports.values_mut()
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}
