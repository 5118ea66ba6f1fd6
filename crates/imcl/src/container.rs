//! A container: modules, their control links, and the single-threaded loop
//! that services them.
//!
//! Each service pass looks at the container's [`PollChannel`] and handles, in
//! order:
//!
//! 1. the offload completion signal,
//! 2. the command queue (graph commands, trigger messages, packets),
//! 3. the shared intra-container queue,
//! 4. every external port queue whose bit is raised,
//! 5. framework events (island vote re-evaluation).
//!
//! Queues are drained with a per-pass cap; anything left keeps its bit
//! raised and is picked up on the next pass.

use crate::buffer::{CtrlBuffer, GeneralBufferManager, IslandBufferPool, OneTimeAllocators};
use crate::channel::PollChannel;
use crate::command::{Command, GraphCommand, GraphOpcode};
use crate::drain::{drain_bounded, DrainReport};
use crate::error::{ImclError, ImclResult};
use crate::ids::{ModuleInstanceId, PortId, PortKey};
use crate::island::{IslandVote, NoIsland, Topology};
use crate::links::{CloseReport, ControlLinks};
use crate::message::{CtrlMsg, DestinationHandle, IncomingCtrl, SendFlags};
use crate::offload::{needs_offload, AsyncCmdHandle, AsyncState, CmdOutcome, CommandProcessor};
use crate::port::{ControlPort, ControlPortSpec, PeerLink, PortOperation, PortState};
use crate::queue::{MsgQueue, QueueFull};
use crate::transport::{NoTransport, Transport};
use crate::worker_pool::{PoolRequest, WorkerPoolRegistry};
use bytes::Bytes;
use imclconf::ImclConfig;
use imclproto::{ControlEnvelope, Opcode, Packet, PeerState, PeerStateUpdate, WireError};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// A control message as handed to a module.
#[derive(Debug, Clone, Copy)]
pub struct IncomingIntent<'a> {
    pub port_id: PortId,
    pub payload: &'a [u8],
    pub max_size: usize,
    pub actual_size: usize,
}

/// Module-side hooks of a control link.
pub trait ControlModule: Send {
    /// A control message arrived on `intent.port_id`. The buffer goes back to
    /// its sender when this returns.
    fn on_incoming(&mut self, ctx: &mut ImclCtx<'_>, intent: IncomingIntent<'_>) -> ImclResult<()>;

    /// A port changed state. Returning [`ImclError::Unsupported`] for
    /// peer-connected or peer-disconnected is tolerated.
    fn on_port_operation(
        &mut self,
        _ctx: &mut ImclCtx<'_>,
        _port_id: PortId,
        _op: PortOperation,
    ) -> ImclResult<()> {
        Ok(())
    }
}

/// What a module can do with its own control ports from inside a hook.
pub struct ImclCtx<'a> {
    links: &'a mut ControlLinks,
    module: ModuleInstanceId,
}

impl ImclCtx<'_> {
    pub fn module_id(&self) -> ModuleInstanceId {
        self.module
    }

    fn key(&self, port_id: PortId) -> PortKey {
        PortKey {
            module: self.module,
            port: port_id,
        }
    }

    pub fn port_state(&self, port_id: PortId) -> Option<PortState> {
        self.links.port_state(self.key(port_id))
    }

    pub fn request_recurring_buffer(&mut self, port_id: PortId) -> ImclResult<CtrlBuffer> {
        let key = self.key(port_id);
        self.links.request_recurring_buffer(key)
    }

    pub fn request_one_time_buffer(&mut self, port_id: PortId, size: usize) -> ImclResult<CtrlBuffer> {
        let key = self.key(port_id);
        self.links.request_one_time_buffer(key, size)
    }

    pub fn set_recurring_buffer_info(&mut self, port_id: PortId, size: usize, count: usize) -> ImclResult<()> {
        let key = self.key(port_id);
        self.links.set_recurring_buffer_info(key, size, count)
    }

    pub fn send(&mut self, buf: CtrlBuffer, flags: SendFlags) -> ImclResult<()> {
        self.links.send(buf, flags)
    }
}

/// Static parameters of one container.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub log_id: String,
    /// Stack size of the container thread.
    pub stack_size: usize,
    /// Processing frame period, once known.
    pub frame_len_us: Option<u64>,
    pub thread_priority: i32,
    pub imcl: ImclConfig,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            log_id: "cntr".to_string(),
            stack_size: 64 * 1024,
            frame_len_us: None,
            thread_priority: 0,
            imcl: ImclConfig::default(),
        }
    }
}

/// Collaborators a container calls out to.
#[derive(Clone)]
pub struct ContainerServices {
    pub processor: Arc<dyn CommandProcessor>,
    pub registry: Arc<WorkerPoolRegistry>,
    pub topology: Arc<dyn Topology>,
    pub transport: Arc<dyn Transport>,
    /// `None` builds pools from the configured limits.
    pub allocators: Option<OneTimeAllocators>,
}

impl ContainerServices {
    pub fn new(processor: Arc<dyn CommandProcessor>, registry: Arc<WorkerPoolRegistry>) -> Self {
        Self {
            processor,
            registry,
            topology: Arc::new(NoIsland),
            transport: Arc::new(NoTransport),
            allocators: None,
        }
    }

    pub fn with_topology(mut self, topology: Arc<dyn Topology>) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_allocators(mut self, allocators: OneTimeAllocators) -> Self {
        self.allocators = Some(allocators);
        self
    }
}

/// Cloneable way in from other threads.
#[derive(Clone, Debug)]
pub struct ContainerHandle {
    cmd_q: Arc<MsgQueue<Command>>,
}

impl ContainerHandle {
    pub fn push_graph_command(&self, cmd: GraphCommand) -> ImclResult<()> {
        self.push(Command::Graph(cmd))
    }

    /// Queue a decoded packet from another processor.
    pub fn deliver_packet(&self, packet: Packet) -> ImclResult<()> {
        self.push(Command::Packet(packet))
    }

    /// Decode and queue a packet from another processor.
    pub fn deliver_raw(&self, bytes: Bytes) -> ImclResult<()> {
        let packet = Packet::decode(bytes).map_err(|e| match e {
            WireError::InvalidOpcode(op) => ImclError::UnexpectedOpcode(op),
            other => ImclError::Malformed(other),
        })?;
        self.deliver_packet(packet)
    }

    pub fn shutdown(&self) -> ImclResult<()> {
        self.push(Command::Shutdown)
    }

    fn push(&self, cmd: Command) -> ImclResult<()> {
        self.cmd_q
            .push_back(cmd)
            .map_err(|_| ImclError::QueueFull(self.cmd_q.name().to_string()))
    }
}

/// What one service pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ServiceReport {
    pub completions: u32,
    pub commands: u32,
    pub intra: DrainReport,
    pub external: DrainReport,
    pub shutdown: bool,
}

struct ModuleSlot {
    module: Box<dyn ControlModule>,
    last_op: HashMap<PortId, PortOperation>,
}

pub struct Container {
    log_id: String,
    config: ContainerConfig,
    modules: BTreeMap<ModuleInstanceId, ModuleSlot>,
    links: ControlLinks,
    cmd_bit: u32,
    intra_bit: u32,
    processor: Arc<dyn CommandProcessor>,
    registry: Arc<WorkerPoolRegistry>,
    offload: Option<AsyncCmdHandle>,
}

impl Container {
    pub fn new(config: ContainerConfig, services: ContainerServices) -> ImclResult<Self> {
        let limits = config.imcl.limits.clone();
        let channel = Arc::new(PollChannel::new());

        let cmd_bit = channel.allocate_bit()?;
        let cmd_q = Arc::new(MsgQueue::with_signal(
            format!("{} cmd", config.log_id),
            limits.intra_queue_depth,
            Arc::clone(&channel),
            cmd_bit,
        ));
        let intra_bit = channel.allocate_bit()?;
        let intra_q = Arc::new(MsgQueue::with_signal(
            format!("{} intra", config.log_id),
            limits.intra_queue_depth,
            Arc::clone(&channel),
            intra_bit,
        ));

        let allocators = services.allocators.unwrap_or_else(|| OneTimeAllocators {
            general: Arc::new(GeneralBufferManager::new(limits.general_pool_bytes)),
            island: Arc::new(IslandBufferPool::new(
                limits.island_pool_nodes,
                limits.island_node_bytes,
            )),
        });

        let links = ControlLinks {
            log_id: config.log_id.clone(),
            limits,
            ports: Default::default(),
            allocators,
            intra_q,
            cmd_q,
            channel,
            island_vote: Arc::new(IslandVote::new()),
            topology: services.topology,
            transport: services.transport,
        };

        let mut container = Self {
            log_id: config.log_id.clone(),
            config,
            modules: BTreeMap::new(),
            links,
            cmd_bit,
            intra_bit,
            processor: services.processor,
            registry: services.registry,
            offload: None,
        };
        let (stack, frame, prio) = (
            container.config.stack_size,
            container.config.frame_len_us,
            container.config.thread_priority,
        );
        container.update_offload(stack, frame, prio)?;
        info!("Created container {}", container.log_id);
        Ok(container)
    }

    pub fn log_id(&self) -> &str {
        &self.log_id
    }

    pub fn handle(&self) -> ContainerHandle {
        ContainerHandle {
            cmd_q: Arc::clone(&self.links.cmd_q),
        }
    }

    pub fn links(&self) -> &ControlLinks {
        &self.links
    }

    pub fn channel(&self) -> &Arc<PollChannel> {
        &self.links.channel
    }

    pub fn command_bit(&self) -> u32 {
        self.cmd_bit
    }

    pub fn pending_commands(&self) -> usize {
        self.links.cmd_q.len()
    }

    // === Offload ===

    /// Create or resize the async command handle after the container's stack,
    /// frame period or priority changed.
    pub fn update_offload(
        &mut self,
        stack_size: usize,
        frame_len_us: Option<u64>,
        priority: i32,
    ) -> ImclResult<()> {
        self.config.stack_size = stack_size;
        self.config.frame_len_us = frame_len_us;
        self.config.thread_priority = priority;

        let offload_cfg = &self.config.imcl.offload;
        if !needs_offload(stack_size, frame_len_us, offload_cfg) {
            return Ok(());
        }

        let mut request = PoolRequest::from_config(offload_cfg, priority);
        request.island = self.links.topology.is_island();
        match &mut self.offload {
            Some(handle) => handle.update(request),
            None => {
                let handle = AsyncCmdHandle::init(
                    self.log_id.clone(),
                    Arc::clone(&self.registry),
                    request,
                    Arc::clone(&self.links.channel),
                    self.cmd_bit,
                )?;
                self.offload = Some(handle);
                Ok(())
            }
        }
    }

    pub fn offload_handle(&self) -> Option<&AsyncCmdHandle> {
        self.offload.as_ref()
    }

    pub fn offload_state(&self) -> AsyncState {
        self.offload
            .as_ref()
            .map(AsyncCmdHandle::state)
            .unwrap_or(AsyncState::Uninitialized)
    }

    // === Graph layer ===

    pub fn add_module(&mut self, id: ModuleInstanceId, module: Box<dyn ControlModule>) -> ImclResult<()> {
        if self.modules.contains_key(&id) {
            return Err(ImclError::DuplicateModule(id));
        }
        self.modules.insert(
            id,
            ModuleSlot {
                module,
                last_op: HashMap::new(),
            },
        );
        debug!("{}: added module {}", self.log_id, id);
        Ok(())
    }

    pub fn add_control_port(&mut self, module: ModuleInstanceId, spec: ControlPortSpec) -> ImclResult<()> {
        if !self.modules.contains_key(&module) {
            return Err(ImclError::UnknownModule(module));
        }
        self.links.add_port(module, spec)
    }

    /// Close every port of `id` and drop the module.
    pub fn remove_module(&mut self, id: ModuleInstanceId) -> ImclResult<()> {
        if !self.modules.contains_key(&id) {
            return Err(ImclError::UnknownModule(id));
        }
        for key in self.links.ports.keys_of(id) {
            if self.links.port_state(key) != Some(PortState::Closed) {
                if let Err(e) = self.close(key) {
                    warn!("{}: closing {} during removal failed: {}", self.log_id, key, e);
                }
            }
            self.links.remove_port(key);
        }
        self.modules.remove(&id);
        info!("{}: removed module {}", self.log_id, id);
        Ok(())
    }

    pub fn external_handle(&self, key: PortKey) -> ImclResult<DestinationHandle> {
        self.links.external_handle(key)
    }

    pub fn attach_peer_handle(&mut self, key: PortKey, handle: DestinationHandle) -> ImclResult<()> {
        self.links.attach_peer_handle(key, handle)
    }

    pub fn relink(&mut self, key: PortKey, link: PeerLink) -> ImclResult<()> {
        self.links.relink(key, link)
    }

    pub fn find_control_port_by_id(&self, module: ModuleInstanceId, port: PortId) -> Option<&ControlPort> {
        self.links.ports.find_control_port_by_id(module, port)
    }

    pub fn port_state(&self, key: PortKey) -> Option<PortState> {
        self.links.port_state(key)
    }

    /// Tell the remote peer of `key` about a local state change.
    pub fn announce_state(&self, key: PortKey, state: PeerState) -> ImclResult<()> {
        self.links.send_peer_state_update(key, state)
    }

    // === Control port operations ===

    pub fn open(&mut self, key: PortKey, peer: PortKey, intents: &[u32]) -> ImclResult<()> {
        self.links.apply_open(key, peer, intents)?;
        if let Err(e) = self.notify_module(key, PortOperation::Open) {
            warn!("{}: module rejected open of {}: {}", self.log_id, key, e);
            self.links.apply_close(key)?;
            return Err(e);
        }
        Ok(())
    }

    pub fn peer_connected(&mut self, key: PortKey) -> ImclResult<()> {
        self.links.apply_peer_connected(key)?;
        self.notify_module(key, PortOperation::PeerConnected)
    }

    /// Deliver what already arrived for `key`, then return the rest to the
    /// senders and stop polling until the peer is back.
    pub fn peer_disconnected(&mut self, key: PortKey) -> ImclResult<CloseReport> {
        self.links.ports.get(key)?.check(PortOperation::PeerDisconnected)?;
        self.flush_external(key);
        let report = self.links.apply_peer_disconnected(key)?;
        self.notify_module(key, PortOperation::PeerDisconnected)?;
        Ok(report)
    }

    /// Close `key`: deliver what is already queued for it, tell the module,
    /// then reclaim every buffer the port still owns.
    pub fn close(&mut self, key: PortKey) -> ImclResult<CloseReport> {
        self.links.ports.get(key)?.check(PortOperation::Close)?;
        self.flush_external(key);

        if let Err(e) = self.notify_module(key, PortOperation::Close) {
            warn!("{}: module failed close of {}: {}", self.log_id, key, e);
        }
        let report = self.links.apply_close(key)?;

        if self.links.ports.get(key)?.link().is_inter_processor() {
            if let Err(e) = self.links.send_peer_state_update(key, PeerState::Closed) {
                warn!("{}: could not announce close of {}: {}", self.log_id, key, e);
            }
        }
        Ok(report)
    }

    pub fn set_recurring_buffer_info(&mut self, key: PortKey, size: usize, count: usize) -> ImclResult<()> {
        self.links.set_recurring_buffer_info(key, size, count)
    }

    pub fn request_recurring_buffer(&mut self, key: PortKey) -> ImclResult<CtrlBuffer> {
        self.links.request_recurring_buffer(key)
    }

    pub fn request_one_time_buffer(&mut self, key: PortKey, size: usize) -> ImclResult<CtrlBuffer> {
        self.links.request_one_time_buffer(key, size)
    }

    pub fn send(&mut self, buf: CtrlBuffer, flags: SendFlags) -> ImclResult<()> {
        self.links.send(buf, flags)
    }

    fn notify_module(&mut self, key: PortKey, op: PortOperation) -> ImclResult<()> {
        let slot = self
            .modules
            .get_mut(&key.module)
            .ok_or(ImclError::UnknownModule(key.module))?;
        if slot.last_op.get(&key.port) == Some(&op) {
            return Ok(());
        }

        let mut ctx = ImclCtx {
            links: &mut self.links,
            module: key.module,
        };
        match slot.module.on_port_operation(&mut ctx, key.port, op) {
            Ok(()) => {}
            Err(ImclError::Unsupported)
                if matches!(op, PortOperation::PeerConnected | PortOperation::PeerDisconnected) =>
            {
                debug!("{}: module {} ignores {:?}", self.log_id, key.module, op);
            }
            Err(e) => return Err(e),
        }
        slot.last_op.insert(key.port, op);
        Ok(())
    }

    /// One bounded pass over the incoming queue of an external port.
    fn flush_external(&mut self, key: PortKey) {
        let Some(queue) = self.external_queue(key) else {
            return;
        };
        let limit = self.links.limits.drain_limit;
        let (modules, links) = (&mut self.modules, &mut self.links);
        let flushed = drain_bounded(&queue, limit, |item| Self::deliver_incoming(modules, links, item));
        if flushed.handled + flushed.failed > 0 {
            debug!(
                "{}: flushed {} messages from {} ({} failed)",
                self.log_id, flushed.handled, key, flushed.failed
            );
        }
    }

    fn external_queue(&self, key: PortKey) -> Option<Arc<MsgQueue<IncomingCtrl>>> {
        self.links
            .ports
            .get(key)
            .ok()
            .and_then(|p| p.external.as_ref())
            .map(|ext| Arc::clone(&ext.queue))
    }

    // === Service loop ===

    /// One non-blocking pass.
    pub fn poll_once(&mut self) -> ServiceReport {
        let ready = self.links.channel.poll();
        self.service(ready)
    }

    /// Wait up to `timeout` for work, then run one pass.
    pub fn wait_once(&mut self, timeout: Duration) -> ServiceReport {
        let ready = self.links.channel.wait_timeout(timeout);
        self.service(ready)
    }

    /// Service until a shutdown command arrives.
    pub fn run(&mut self) {
        info!("{}: service loop running", self.log_id);
        loop {
            let ready = self.links.channel.wait();
            if self.service(ready).shutdown {
                break;
            }
        }
        info!("{}: service loop stopped", self.log_id);
    }

    fn service(&mut self, ready: u32) -> ServiceReport {
        let mut report = ServiceReport::default();
        let limit = self.links.limits.drain_limit;

        if let Some(handle) = &self.offload {
            if ready & handle.completion_bit() != 0 {
                if let Err(e) = handle.handle_completion() {
                    warn!("{}: offloaded command failed: {}", self.log_id, e);
                }
                report.completions += 1;
            }
        }

        while report.commands < limit && self.links.channel.is_enabled(self.cmd_bit) {
            let Some(cmd) = self.links.cmd_q.pop_front() else {
                break;
            };
            report.commands += 1;
            if self.process_command(cmd) {
                report.shutdown = true;
                return report;
            }
        }

        if self.links.channel.poll_mask(self.intra_bit) != 0 {
            let queue = Arc::clone(&self.links.intra_q);
            let (modules, links) = (&mut self.modules, &mut self.links);
            report.intra = drain_bounded(&queue, limit, |msg| Self::deliver_local(modules, links, msg));
            if report.intra.limit_reached {
                debug!("{}: intra queue drain capped at {}", self.log_id, limit);
            }
        }

        let raised = self.links.channel.poll();
        let external: Vec<_> = self
            .links
            .ports
            .iter()
            .filter_map(|p| p.external.as_ref())
            .filter(|ext| raised & ext.bit != 0)
            .map(|ext| Arc::clone(&ext.queue))
            .collect();
        for queue in external {
            let (modules, links) = (&mut self.modules, &mut self.links);
            let drained = drain_bounded(&queue, limit, |item| Self::deliver_incoming(modules, links, item));
            if drained.limit_reached {
                debug!("{}: {} drain capped at {}", self.log_id, queue.name(), limit);
            }
            report.external.merge(drained);
        }

        if self.links.island_vote.take_reevaluate() {
            self.links
                .topology
                .reevaluate_island_vote(self.links.island_vote.count());
        }

        report
    }

    /// Returns true on shutdown.
    fn process_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::CtrlTrigger(msg) => {
                if let Err(e) = Self::deliver_local(&mut self.modules, &mut self.links, msg) {
                    warn!("{}: trigger delivery failed: {}", self.log_id, e);
                }
            }
            Command::Packet(packet) => {
                if let Err(e) = self.handle_packet(packet) {
                    warn!("{}: inter-processor packet dropped: {}", self.log_id, e);
                }
            }
            Command::Graph(cmd) => self.process_graph_command(cmd),
            Command::Shutdown => return true,
        }
        false
    }

    fn process_graph_command(&mut self, cmd: GraphCommand) {
        if cmd.opcode == GraphOpcode::Prepare {
            if let Err(e) = self.links.prepare() {
                error!("{}: preparing control links failed: {}", self.log_id, e);
                cmd.ack(Err(e), false);
                return;
            }
        }

        let cmd = match &self.offload {
            Some(handle) if cmd.opcode.is_offload_eligible() => {
                match handle.push(cmd, Arc::clone(&self.processor)) {
                    Ok(()) => return,
                    Err((cmd, e)) => {
                        warn!(
                            "{}: processing {:?} synchronously: {}",
                            self.log_id, cmd.opcode, e
                        );
                        cmd
                    }
                }
            }
            _ => cmd,
        };

        let result = match self.processor.process(&cmd) {
            CmdOutcome::Done(result) => result,
            CmdOutcome::Continue(continuation) => continuation(),
        };
        cmd.ack(result, false);
    }

    fn handle_packet(&mut self, packet: Packet) -> ImclResult<()> {
        match packet.opcode {
            Opcode::Trigger => Self::deliver_remote(&mut self.modules, &mut self.links, packet),
            Opcode::Polling => {
                let target = ControlEnvelope::split(&packet.payload)
                    .map_err(ImclError::from)
                    .and_then(|(envelope, _)| {
                        let key = PortKey::new(packet.dst.module_instance_id, envelope.port_id);
                        self.external_queue(key).ok_or(ImclError::UnknownPort(key))
                    });
                let transport = Arc::clone(&self.links.transport);
                match target {
                    Ok(queue) => {
                        let Err(QueueFull(item)) = queue.push_back(IncomingCtrl::Remote(packet)) else {
                            return Ok(());
                        };
                        let err = ImclError::QueueFull(queue.name().to_string());
                        item.give_back(transport.as_ref(), &Err(err.clone()));
                        Err(err)
                    }
                    Err(err) => {
                        let result = Err(err);
                        transport.release(packet, &result);
                        result
                    }
                }
            }
            Opcode::PeerStateUpdate => {
                let result = PeerStateUpdate::decode(&packet.payload)
                    .map_err(ImclError::from)
                    .and_then(|update| {
                        let key = PortKey::new(packet.dst.module_instance_id, update.ctrl_port_id);
                        self.apply_peer_state(key, update.state)
                    });
                self.links.transport.release(packet, &result);
                result
            }
        }
    }

    fn apply_peer_state(&mut self, key: PortKey, state: PeerState) -> ImclResult<()> {
        let current = self.links.port_state(key).ok_or(ImclError::UnknownPort(key))?;
        match (state.is_connected(), current) {
            (true, PortState::Open | PortState::PeerDisconnected) => self.peer_connected(key),
            (false, PortState::PeerConnected) => self.peer_disconnected(key).map(drop),
            _ => {
                debug!(
                    "{}: peer of {} now {:?}, port already {:?}",
                    self.log_id, key, state, current
                );
                Ok(())
            }
        }
    }

    // === Delivery ===

    fn dispatch(
        modules: &mut BTreeMap<ModuleInstanceId, ModuleSlot>,
        links: &mut ControlLinks,
        dst: PortKey,
        intent: IncomingIntent<'_>,
    ) -> ImclResult<()> {
        match links.port_state(dst) {
            None => return Err(ImclError::UnknownPort(dst)),
            Some(PortState::Closed) => return Err(ImclError::NotConnected(dst)),
            Some(_) => {}
        }
        let slot = modules
            .get_mut(&dst.module)
            .ok_or(ImclError::UnknownModule(dst.module))?;
        let mut ctx = ImclCtx {
            links,
            module: dst.module,
        };
        slot.module.on_incoming(&mut ctx, intent)
    }

    fn deliver_local(
        modules: &mut BTreeMap<ModuleInstanceId, ModuleSlot>,
        links: &mut ControlLinks,
        msg: CtrlMsg,
    ) -> ImclResult<()> {
        let intent = IncomingIntent {
            port_id: msg.dst.port,
            payload: msg.buffer.payload(),
            max_size: msg.buffer.max_len(),
            actual_size: msg.buffer.len(),
        };
        Self::dispatch(modules, links, msg.dst, intent)
    }

    fn deliver_remote(
        modules: &mut BTreeMap<ModuleInstanceId, ModuleSlot>,
        links: &mut ControlLinks,
        packet: Packet,
    ) -> ImclResult<()> {
        let result = ControlEnvelope::split(&packet.payload)
            .map_err(ImclError::from)
            .and_then(|(envelope, payload)| {
                let dst = PortKey::new(packet.dst.module_instance_id, envelope.port_id);
                let intent = IncomingIntent {
                    port_id: dst.port,
                    payload: &payload,
                    max_size: payload.len(),
                    actual_size: payload.len(),
                };
                Self::dispatch(modules, links, dst, intent)
            });
        let transport = Arc::clone(&links.transport);
        transport.release(packet, &result);
        result
    }

    fn deliver_incoming(
        modules: &mut BTreeMap<ModuleInstanceId, ModuleSlot>,
        links: &mut ControlLinks,
        item: IncomingCtrl,
    ) -> ImclResult<()> {
        match item {
            IncomingCtrl::Local(msg) => Self::deliver_local(modules, links, msg),
            IncomingCtrl::Remote(packet) => match packet.opcode {
                Opcode::Trigger | Opcode::Polling => Self::deliver_remote(modules, links, packet),
                other => {
                    let err = ImclError::UnexpectedOpcode(other.to_u32());
                    let result = Err(err.clone());
                    links.transport.release(packet, &result);
                    Err(err)
                }
            },
        }
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if let Some(handle) = self.offload.take() {
            handle.deinit();
        }
        debug!("{}: container dropped", self.log_id);
    }
}
