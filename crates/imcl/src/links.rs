//! Per-container control link state: the port table, buffer sources, the
//! shared intra-container queue and the island vote.
//!
//! [`ControlLinks`] is everything a module may touch while it handles a
//! control message, which is why it is split from the module table in
//! [`Container`](crate::container::Container).

use crate::buffer::{BufferHome, CtrlBuffer, OneTimeAllocators};
use crate::channel::PollChannel;
use crate::command::Command;
use crate::drain::retrieve_mine;
use crate::error::{ImclError, ImclResult};
use crate::ids::{ModuleInstanceId, PortKey};
use crate::island::{IslandVote, Topology};
use crate::message::{CtrlMsg, DestinationHandle, IncomingCtrl};
use crate::port::{
    ControlPort, ControlPortSpec, ExternalQueue, PeerLink, PortOperation, PortState, PortTable,
};
use crate::queue::MsgQueue;
use crate::transport::Transport;
use imclconf::LimitsConfig;
use std::sync::Arc;
use tracing::{debug, info};

/// Buffers reclaimed when a port closed or lost its peer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CloseReport {
    /// Pulled off the shared intra-container queue
    pub retrieved: usize,
    /// Discarded from the port's own incoming queue
    pub drained: usize,
    /// Recurring buffers still held elsewhere; freed when their holders drop them
    pub outstanding: usize,
}

pub struct ControlLinks {
    pub(crate) log_id: String,
    pub(crate) limits: LimitsConfig,
    pub(crate) ports: PortTable,
    pub(crate) allocators: OneTimeAllocators,
    pub(crate) intra_q: Arc<MsgQueue<CtrlMsg>>,
    pub(crate) cmd_q: Arc<MsgQueue<Command>>,
    pub(crate) channel: Arc<PollChannel>,
    pub(crate) island_vote: Arc<IslandVote>,
    pub(crate) topology: Arc<dyn Topology>,
    pub(crate) transport: Arc<dyn Transport>,
}

impl ControlLinks {
    pub fn ports(&self) -> &PortTable {
        &self.ports
    }

    pub fn port_state(&self, key: PortKey) -> Option<PortState> {
        self.ports.state(key)
    }

    /// Non-island buffers currently counted against the island.
    pub fn island_vote(&self) -> u32 {
        self.island_vote.count()
    }

    pub fn intra_pending(&self) -> usize {
        self.intra_q.len()
    }

    pub(crate) fn add_port(&mut self, module: ModuleInstanceId, spec: ControlPortSpec) -> ImclResult<()> {
        let key = PortKey {
            module,
            port: spec.id,
        };
        if self.ports.get(key).is_ok() {
            return Err(ImclError::DuplicatePort(key));
        }

        let external = if spec.link.is_external() {
            let bit = self.channel.allocate_bit()?;
            // polling starts once the peer connects
            self.channel.disable(bit);
            let queue = MsgQueue::with_signal(
                format!("{} ext {}", self.log_id, key),
                self.limits.queue_depth,
                Arc::clone(&self.channel),
                bit,
            );
            Some(ExternalQueue {
                queue: Arc::new(queue),
                bit,
            })
        } else {
            None
        };

        let port = ControlPort::new(
            key,
            spec,
            self.limits.intents_per_port,
            self.limits.queue_depth,
            external,
        );
        debug!("{}: registered control port {}", self.log_id, key);
        self.ports.insert(port)
    }

    pub(crate) fn remove_port(&mut self, key: PortKey) -> Option<ControlPort> {
        let mut port = self.ports.remove(key)?;
        if let Some(ext) = port.external.take() {
            return_incoming(self.transport.as_ref(), key, &ext.queue);
            self.channel.release_bit(ext.bit);
        }
        port.recurring.destroy(self.topology.as_ref());
        Some(port)
    }

    /// Handle other containers use to reach an external port of this one.
    pub fn external_handle(&self, key: PortKey) -> ImclResult<DestinationHandle> {
        let port = self.ports.get(key)?;
        let ext = port.external.as_ref().ok_or(ImclError::UnknownPort(key))?;
        Ok(DestinationHandle {
            data_q: Arc::clone(&ext.queue),
            cmd_q: Arc::clone(&self.cmd_q),
        })
    }

    /// Point an inter-container port at its peer's incoming queue.
    pub fn attach_peer_handle(&mut self, key: PortKey, handle: DestinationHandle) -> ImclResult<()> {
        let port = self.ports.get_mut(key)?;
        match &mut port.link {
            PeerLink::InterContainer { handle: slot, .. } => {
                *slot = Some(handle);
                debug!("{}: port {} attached to peer container", self.log_id, key);
                Ok(())
            }
            _ => Err(ImclError::UnknownPort(key)),
        }
    }

    /// Replace how a registered port reaches its peer. Only while closed.
    pub fn relink(&mut self, key: PortKey, link: PeerLink) -> ImclResult<()> {
        let port = self.ports.get_mut(key)?;
        if port.state() != PortState::Closed {
            return Err(ImclError::InvalidTransition {
                port: key,
                op: PortOperation::Open,
                state: port.state(),
            });
        }
        if link.is_external() != port.is_external() {
            return Err(ImclError::UnknownPort(key));
        }
        port.link = link;
        Ok(())
    }

    pub(crate) fn apply_open(&mut self, key: PortKey, peer: PortKey, intents: &[u32]) -> ImclResult<()> {
        let port = self.ports.get_mut(key)?;
        let next = port.check(PortOperation::Open)?;
        port.record_open(peer, intents)?;
        port.set_state(next);
        info!(
            "{}: port {} open to {} with {} intents",
            self.log_id,
            key,
            peer,
            intents.len()
        );
        Ok(())
    }

    pub(crate) fn apply_peer_connected(&mut self, key: PortKey) -> ImclResult<()> {
        let topology = Arc::clone(&self.topology);
        let port = self.ports.get_mut(key)?;
        let next = port.check(PortOperation::PeerConnected)?;

        let (size, count) = port.recurring_info;
        port.recurring.recreate(size, count, topology.as_ref())?;

        port.set_state(next);
        if let Some(ext) = &port.external {
            self.channel.enable(ext.bit);
        }
        info!("{}: port {} peer connected", self.log_id, key);
        Ok(())
    }

    /// Stop polling `key` and hand back whatever is still queued for it.
    /// Recurring buffers stay; the peer may come back.
    pub(crate) fn apply_peer_disconnected(&mut self, key: PortKey) -> ImclResult<CloseReport> {
        let port = self.ports.get_mut(key)?;
        let next = port.check(PortOperation::PeerDisconnected)?;
        port.set_state(next);

        let mut report = CloseReport::default();
        if matches!(port.link, PeerLink::IntraContainer { .. }) {
            report.retrieved = retrieve_mine(&self.intra_q, key);
        }
        if let Some(ext) = &port.external {
            self.channel.disable(ext.bit);
            report.drained = return_incoming(self.transport.as_ref(), key, &ext.queue);
        }
        info!(
            "{}: port {} peer disconnected (retrieved {}, drained {})",
            self.log_id, key, report.retrieved, report.drained
        );
        Ok(report)
    }

    /// Close `key`, reclaiming what it can synchronously.
    ///
    /// Anything still queued for an external port is discarded here; the
    /// container processes deliverable messages before calling this.
    pub(crate) fn apply_close(&mut self, key: PortKey) -> ImclResult<CloseReport> {
        let topology = Arc::clone(&self.topology);
        let port = self.ports.get_mut(key)?;
        port.check(PortOperation::Close)?;

        let mut report = CloseReport::default();
        if matches!(port.link, PeerLink::IntraContainer { .. }) {
            report.retrieved = retrieve_mine(&self.intra_q, key);
        }
        if let Some(ext) = &port.external {
            self.channel.disable(ext.bit);
            report.drained = return_incoming(self.transport.as_ref(), key, &ext.queue);
        }
        report.outstanding = port.recurring.destroy(topology.as_ref());
        port.clear_open_state();
        port.set_state(PortState::Closed);

        info!(
            "{}: port {} closed (retrieved {}, drained {}, outstanding {})",
            self.log_id, key, report.retrieved, report.drained, report.outstanding
        );
        Ok(report)
    }

    /// Record the recurring buffer needs a module announced, applying them
    /// right away if the port is live.
    pub fn set_recurring_buffer_info(&mut self, key: PortKey, size: usize, count: usize) -> ImclResult<()> {
        let topology = Arc::clone(&self.topology);
        let port = self.ports.get_mut(key)?;
        if port.state() != PortState::Closed {
            port.recurring.recreate(size, count, topology.as_ref())?;
        }
        port.recurring_info = (size, count);
        debug!(
            "{}: port {} recurring buffers {} x {}",
            self.log_id, key, count, size
        );
        Ok(())
    }

    /// Create recurring queues for every open port that announced its needs.
    pub(crate) fn prepare(&mut self) -> ImclResult<()> {
        let topology = Arc::clone(&self.topology);
        for port in self.ports.iter_mut() {
            if port.state() == PortState::Closed {
                continue;
            }
            let (size, count) = port.recurring_info;
            port.recurring.recreate(size, count, topology.as_ref())?;
        }
        Ok(())
    }

    /// Check out a buffer from the port's recurring queue.
    pub fn request_recurring_buffer(&mut self, key: PortKey) -> ImclResult<CtrlBuffer> {
        let retry_limit = self.limits.recurring_retry_limit;
        let topology = Arc::clone(&self.topology);
        let port = self.ports.get_mut(key)?;
        let (body, home) = port.recurring.checkout(key, retry_limit, topology.as_ref())?;
        let max_len = body.capacity();
        let token = port.next_token();
        let domain = port.operating_domain();

        let mut buf = CtrlBuffer::new(body, home, max_len, token, key);
        if IslandVote::applies(topology.is_island(), domain) {
            buf.hold_vote(Arc::clone(&self.island_vote));
        }
        Ok(buf)
    }

    /// Allocate a buffer of `size` payload bytes for a single send.
    pub fn request_one_time_buffer(&mut self, key: PortKey, size: usize) -> ImclResult<CtrlBuffer> {
        if size == 0 {
            return Err(ImclError::ZeroSize(key));
        }
        let in_island = self.topology.is_island();
        let port = self.ports.get_mut(key)?;
        let domain = port.operating_domain();
        let manager = Arc::clone(self.allocators.select(domain));
        if in_island && !domain.is_island() {
            self.topology.exit_island_temporarily();
        }

        let body = manager.alloc(size)?;
        let token = port.next_token();
        let mut buf = CtrlBuffer::new(body, BufferHome::OneTime(manager), size, token, key);
        if IslandVote::applies(in_island, domain) {
            buf.hold_vote(Arc::clone(&self.island_vote));
        }
        Ok(buf)
    }
}

/// Empty an external port's incoming queue back to the senders.
fn return_incoming(transport: &dyn Transport, key: PortKey, queue: &MsgQueue<IncomingCtrl>) -> usize {
    let items = queue.take_all();
    let count = items.len();
    if count > 0 {
        let result = Err(ImclError::NotConnected(key));
        for item in items {
            item.give_back(transport, &result);
        }
    }
    count
}
