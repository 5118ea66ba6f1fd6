#![allow(dead_code)]

use imcl::{
    CmdOutcome, CommandProcessor, Container, ContainerConfig, ContainerServices, ControlModule,
    GraphCommand, ImclCtx, ImclError, ImclResult, IncomingIntent, OffloadConfig, Packet,
    PortId, PortOperation, Transport, WorkerPoolRegistry,
};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub port: u32,
    pub payload: Vec<u8>,
    pub max_size: usize,
    pub actual_size: usize,
}

/// Shared view into what a [`Recorder`] saw.
#[derive(Clone, Default)]
pub struct Inbox {
    pub messages: Arc<Mutex<Vec<Received>>>,
    pub ops: Arc<Mutex<Vec<(u32, PortOperation)>>>,
}

impl Inbox {
    pub fn messages(&self) -> Vec<Received> {
        self.messages.lock().unwrap().clone()
    }

    pub fn ops(&self) -> Vec<(u32, PortOperation)> {
        self.ops.lock().unwrap().clone()
    }
}

/// Module that records everything delivered to it.
pub struct Recorder {
    inbox: Inbox,
    ignore_peer_ops: bool,
}

impl Recorder {
    pub fn new() -> (Self, Inbox) {
        let inbox = Inbox::default();
        (
            Self {
                inbox: inbox.clone(),
                ignore_peer_ops: false,
            },
            inbox,
        )
    }

    /// Answers peer connect/disconnect with `Unsupported`.
    pub fn ignoring_peer_ops() -> (Self, Inbox) {
        let (mut recorder, inbox) = Self::new();
        recorder.ignore_peer_ops = true;
        (recorder, inbox)
    }
}

impl ControlModule for Recorder {
    fn on_incoming(&mut self, _ctx: &mut ImclCtx<'_>, intent: IncomingIntent<'_>) -> ImclResult<()> {
        self.inbox.messages.lock().unwrap().push(Received {
            port: intent.port_id.0,
            payload: intent.payload.to_vec(),
            max_size: intent.max_size,
            actual_size: intent.actual_size,
        });
        Ok(())
    }

    fn on_port_operation(
        &mut self,
        _ctx: &mut ImclCtx<'_>,
        port_id: PortId,
        op: PortOperation,
    ) -> ImclResult<()> {
        if self.ignore_peer_ops
            && matches!(op, PortOperation::PeerConnected | PortOperation::PeerDisconnected)
        {
            return Err(ImclError::Unsupported);
        }
        self.inbox.ops.lock().unwrap().push((port_id.0, op));
        Ok(())
    }
}

pub struct Immediate;

impl CommandProcessor for Immediate {
    fn process(&self, _cmd: &GraphCommand) -> CmdOutcome {
        CmdOutcome::Done(Ok(()))
    }
}

/// Transport that keeps every packet it is asked to send.
#[derive(Default)]
pub struct RecordingTransport {
    pub domain: u32,
    pub sent: Mutex<Vec<Packet>>,
    pub released: Mutex<Vec<(Packet, bool)>>,
}

impl RecordingTransport {
    pub fn new(domain: u32) -> Arc<Self> {
        Arc::new(Self {
            domain,
            ..Default::default()
        })
    }

    pub fn take_sent(&self) -> Vec<Packet> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

impl Transport for RecordingTransport {
    fn host_domain(&self) -> u32 {
        self.domain
    }

    fn send(&self, packet: Packet) -> ImclResult<()> {
        self.sent.lock().unwrap().push(packet);
        Ok(())
    }

    fn release(&self, packet: Packet, result: &ImclResult<()>) {
        self.released.lock().unwrap().push((packet, result.is_ok()));
    }
}

pub fn registry() -> Arc<WorkerPoolRegistry> {
    Arc::new(WorkerPoolRegistry::new(&OffloadConfig::default()))
}

/// Config of a container with a large stack and no known frame period, so
/// it never offloads.
pub fn sync_config(log_id: &str) -> ContainerConfig {
    ContainerConfig {
        log_id: log_id.to_string(),
        stack_size: 1024 * 1024,
        ..ContainerConfig::default()
    }
}

pub fn container(log_id: &str) -> Container {
    let services = ContainerServices::new(Arc::new(Immediate), registry());
    Container::new(sync_config(log_id), services).unwrap()
}
