//! Control links between modules of one container and of two containers.

mod common;

use common::{container, registry, sync_config, Immediate, Inbox, Received, Recorder};
use imcl::{
    BufferManager, Container, ContainerConfig, ContainerServices, ControlPortSpec, ErrorKind, GeneralBufferManager,
    ImclError, IslandBufferPool, ModuleInstanceId, OneTimeAllocators, PeerLink, PortKey,
    PortOperation, PortState, SendFlags, Topology,
};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

const A: u32 = 1;
const B: u32 = 2;

/// Two modules whose port 5 are linked inside `c`, both peer connected.
fn linked_pair(c: &mut Container) -> (PortKey, PortKey, Inbox, Inbox) {
    let ka = PortKey::new(A, 5);
    let kb = PortKey::new(B, 5);
    let (a, a_inbox) = Recorder::new();
    let (b, b_inbox) = Recorder::new();

    c.add_module(ModuleInstanceId(A), Box::new(a)).unwrap();
    c.add_module(ModuleInstanceId(B), Box::new(b)).unwrap();
    c.add_control_port(
        ModuleInstanceId(A),
        ControlPortSpec::new(5, PeerLink::IntraContainer { peer: kb }),
    )
    .unwrap();
    c.add_control_port(
        ModuleInstanceId(B),
        ControlPortSpec::new(5, PeerLink::IntraContainer { peer: ka }),
    )
    .unwrap();

    c.open(ka, kb, &[0x10]).unwrap();
    c.open(kb, ka, &[0x10]).unwrap();
    c.peer_connected(ka).unwrap();
    c.peer_connected(kb).unwrap();
    (ka, kb, a_inbox, b_inbox)
}

fn container_with_manager(log_id: &str) -> (Container, Arc<GeneralBufferManager>) {
    let general = Arc::new(GeneralBufferManager::new(64 * 1024));
    let allocators = OneTimeAllocators {
        general: general.clone(),
        island: Arc::new(IslandBufferPool::new(4, 256)),
    };
    let services =
        ContainerServices::new(Arc::new(Immediate), registry()).with_allocators(allocators);
    let c = Container::new(sync_config(log_id), services).unwrap();
    (c, general)
}

#[test]
fn test_trigger_within_container_is_delivered_on_next_pass() {
    let mut c = container("cntr-1");
    let (ka, _kb, _a_inbox, b_inbox) = linked_pair(&mut c);

    let mut buf = c.request_one_time_buffer(ka, 64).unwrap();
    buf.write(&[0x5a; 64]).unwrap();
    c.send(buf, SendFlags::TRIGGER).unwrap();

    // triggers ride the command queue, not the intra-container queue
    assert_eq!(c.pending_commands(), 1);
    assert_eq!(c.links().intra_pending(), 0);

    let report = c.poll_once();
    assert_eq!(report.commands, 1);
    assert_eq!(
        b_inbox.messages(),
        vec![Received {
            port: 5,
            payload: vec![0x5a; 64],
            max_size: 64,
            actual_size: 64,
        }]
    );
}

#[test]
fn test_polling_within_container_waits_on_shared_queue() {
    let mut c = container("cntr-1");
    let (ka, _kb, _a_inbox, b_inbox) = linked_pair(&mut c);

    let mut buf = c.request_one_time_buffer(ka, 8).unwrap();
    buf.write(b"volume").unwrap();
    c.send(buf, SendFlags::POLLING).unwrap();

    assert_eq!(c.pending_commands(), 0);
    assert_eq!(c.links().intra_pending(), 1);

    let report = c.poll_once();
    assert_eq!(report.intra.handled, 1);
    let got = b_inbox.messages();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].payload, b"volume".to_vec());
    assert_eq!(got[0].max_size, 8);
    assert_eq!(got[0].actual_size, 6);
}

#[test]
fn test_second_close_is_a_protocol_violation() {
    let mut c = container("cntr-1");
    let (ka, _kb, _, _) = linked_pair(&mut c);

    c.close(ka).unwrap();
    assert_eq!(c.port_state(ka), Some(PortState::Closed));

    let err = c.close(ka).unwrap_err();
    assert!(matches!(
        err,
        ImclError::InvalidTransition {
            op: PortOperation::Close,
            state: PortState::Closed,
            ..
        }
    ));
    assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    assert_eq!(c.port_state(ka), Some(PortState::Closed));
}

#[test]
fn test_return_without_send_frees_exactly_once() {
    let (mut c, general) = container_with_manager("cntr-1");
    let (ka, _kb, _, b_inbox) = linked_pair(&mut c);

    let buf = c.request_one_time_buffer(ka, 32).unwrap();
    assert_eq!(general.stats().outstanding(), 1);

    c.send(buf, SendFlags::RETURN).unwrap();
    assert_eq!(general.stats().released, 1);
    assert_eq!(general.stats().outstanding(), 0);

    c.poll_once();
    assert!(b_inbox.messages().is_empty());
}

#[test]
fn test_send_needs_connected_peer() {
    let (mut c, general) = container_with_manager("cntr-1");
    let ka = PortKey::new(A, 5);
    let kb = PortKey::new(B, 5);
    let (a, _) = Recorder::new();
    c.add_module(ModuleInstanceId(A), Box::new(a)).unwrap();
    c.add_control_port(
        ModuleInstanceId(A),
        ControlPortSpec::new(5, PeerLink::IntraContainer { peer: kb }),
    )
    .unwrap();
    c.open(ka, kb, &[]).unwrap();

    let buf = c.request_one_time_buffer(ka, 4).unwrap();
    let err = c.send(buf, SendFlags::TRIGGER).unwrap_err();
    assert!(matches!(err, ImclError::NotConnected(k) if k == ka));
    assert_eq!(general.stats().outstanding(), 0);
}

#[test]
fn test_zero_size_request_rejected() {
    let mut c = container("cntr-1");
    let (ka, _, _, _) = linked_pair(&mut c);

    let err = c.request_one_time_buffer(ka, 0).unwrap_err();
    assert!(matches!(err, ImclError::ZeroSize(_)));
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[test]
fn test_open_rejects_too_many_intents() {
    let mut c = container("cntr-1");
    let (a, _) = Recorder::new();
    c.add_module(ModuleInstanceId(A), Box::new(a)).unwrap();
    let key = PortKey::new(A, 1);
    c.add_control_port(
        ModuleInstanceId(A),
        ControlPortSpec::new(1, PeerLink::IntraContainer { peer: PortKey::new(B, 1) })
            .with_intent_capacity(1),
    )
    .unwrap();

    let err = c.open(key, PortKey::new(B, 1), &[1, 2]).unwrap_err();
    assert!(matches!(
        err,
        ImclError::TooManyIntents {
            requested: 2,
            capacity: 1,
            ..
        }
    ));
    assert_eq!(c.port_state(key), Some(PortState::Closed));
}

#[test]
fn test_close_retrieves_queued_messages_of_the_port() {
    let (mut c, general) = container_with_manager("cntr-1");
    let (ka, _kb, _, b_inbox) = linked_pair(&mut c);

    for _ in 0..2 {
        let mut buf = c.request_one_time_buffer(ka, 4).unwrap();
        buf.write(b"stop").unwrap();
        c.send(buf, SendFlags::POLLING).unwrap();
    }
    assert_eq!(c.links().intra_pending(), 2);

    let report = c.close(ka).unwrap();
    assert_eq!(report.retrieved, 2);
    assert_eq!(c.links().intra_pending(), 0);
    assert_eq!(general.stats().outstanding(), 0);

    c.poll_once();
    assert!(b_inbox.messages().is_empty());
}

#[test]
fn test_module_sees_each_operation_once() {
    let mut c = container("cntr-1");
    let (ka, _kb, a_inbox, _) = linked_pair(&mut c);

    c.peer_disconnected(ka).unwrap();
    c.peer_connected(ka).unwrap();
    c.close(ka).unwrap();

    assert_eq!(
        a_inbox.ops(),
        vec![
            (5, PortOperation::Open),
            (5, PortOperation::PeerConnected),
            (5, PortOperation::PeerDisconnected),
            (5, PortOperation::PeerConnected),
            (5, PortOperation::Close),
        ]
    );
}

#[test]
fn test_unsupported_peer_operations_are_tolerated() {
    let mut c = container("cntr-1");
    let ka = PortKey::new(A, 2);
    let (a, inbox) = Recorder::ignoring_peer_ops();
    c.add_module(ModuleInstanceId(A), Box::new(a)).unwrap();
    c.add_control_port(
        ModuleInstanceId(A),
        ControlPortSpec::new(2, PeerLink::IntraContainer { peer: PortKey::new(B, 2) }),
    )
    .unwrap();

    c.open(ka, PortKey::new(B, 2), &[]).unwrap();
    c.peer_connected(ka).unwrap();
    c.peer_disconnected(ka).unwrap();
    assert_eq!(c.port_state(ka), Some(PortState::PeerDisconnected));
    assert_eq!(inbox.ops(), vec![(2, PortOperation::Open)]);
}

#[test]
fn test_polling_between_containers() {
    let mut c1 = container("cntr-1");
    let mut c2 = container("cntr-2");
    let k1 = PortKey::new(A, 1);
    let k2 = PortKey::new(B, 1);
    let (m1, _) = Recorder::new();
    let (m2, inbox) = Recorder::new();

    c1.add_module(ModuleInstanceId(A), Box::new(m1)).unwrap();
    c2.add_module(ModuleInstanceId(B), Box::new(m2)).unwrap();
    c1.add_control_port(
        ModuleInstanceId(A),
        ControlPortSpec::new(1, PeerLink::InterContainer { peer: k2, handle: None }),
    )
    .unwrap();
    c2.add_control_port(
        ModuleInstanceId(B),
        ControlPortSpec::new(1, PeerLink::InterContainer { peer: k1, handle: None }),
    )
    .unwrap();
    c1.attach_peer_handle(k1, c2.external_handle(k2).unwrap()).unwrap();
    c2.attach_peer_handle(k2, c1.external_handle(k1).unwrap()).unwrap();

    for (c, key, peer) in [(&mut c1, k1, k2), (&mut c2, k2, k1)] {
        c.open(key, peer, &[]).unwrap();
        c.peer_connected(key).unwrap();
    }

    let mut buf = c1.request_one_time_buffer(k1, 16).unwrap();
    buf.write(b"tempo=120").unwrap();
    c1.send(buf, SendFlags::POLLING).unwrap();

    let handle = c2.external_handle(k2).unwrap();
    assert_eq!(handle.pending(), 1);
    assert_eq!(c2.pending_commands(), 0);

    let report = c2.poll_once();
    assert_eq!(report.external.handled, 1);
    assert_eq!(handle.pending(), 0);
    assert_eq!(inbox.messages()[0].payload, b"tempo=120".to_vec());
}

#[test]
fn test_trigger_between_containers_uses_peer_command_queue() {
    let mut c1 = container("cntr-1");
    let mut c2 = container("cntr-2");
    let k1 = PortKey::new(A, 1);
    let k2 = PortKey::new(B, 1);
    let (m1, _) = Recorder::new();
    let (m2, inbox) = Recorder::new();

    c1.add_module(ModuleInstanceId(A), Box::new(m1)).unwrap();
    c2.add_module(ModuleInstanceId(B), Box::new(m2)).unwrap();
    c1.add_control_port(
        ModuleInstanceId(A),
        ControlPortSpec::new(1, PeerLink::InterContainer { peer: k2, handle: None }),
    )
    .unwrap();
    c2.add_control_port(
        ModuleInstanceId(B),
        ControlPortSpec::new(1, PeerLink::InterContainer { peer: k1, handle: None }),
    )
    .unwrap();

    // no handle yet: nothing to send to
    c1.open(k1, k2, &[]).unwrap();
    c1.peer_connected(k1).unwrap();
    let buf = c1.request_one_time_buffer(k1, 4).unwrap();
    assert!(matches!(
        c1.send(buf, SendFlags::TRIGGER),
        Err(ImclError::NotConnected(_))
    ));

    c1.attach_peer_handle(k1, c2.external_handle(k2).unwrap()).unwrap();
    c2.open(k2, k1, &[]).unwrap();
    c2.peer_connected(k2).unwrap();

    let mut buf = c1.request_one_time_buffer(k1, 4).unwrap();
    buf.write(b"mute").unwrap();
    c1.send(buf, SendFlags::TRIGGER).unwrap();
    assert_eq!(c2.pending_commands(), 1);

    let report = c2.poll_once();
    assert_eq!(report.commands, 1);
    assert_eq!(inbox.messages()[0].payload, b"mute".to_vec());
}

/// `c1` port (A, 1) linked to `c2` port (B, 1), both peer connected. `c1`
/// allocates from the returned manager.
fn linked_containers(
    c2_config: ContainerConfig,
) -> (Container, Container, Arc<GeneralBufferManager>, Inbox) {
    let (mut c1, general) = container_with_manager("cntr-1");
    let services = ContainerServices::new(Arc::new(Immediate), registry());
    let mut c2 = Container::new(c2_config, services).unwrap();
    let k1 = PortKey::new(A, 1);
    let k2 = PortKey::new(B, 1);
    let (m1, _) = Recorder::new();
    let (m2, inbox) = Recorder::new();

    c1.add_module(ModuleInstanceId(A), Box::new(m1)).unwrap();
    c2.add_module(ModuleInstanceId(B), Box::new(m2)).unwrap();
    c1.add_control_port(
        ModuleInstanceId(A),
        ControlPortSpec::new(1, PeerLink::InterContainer { peer: k2, handle: None }),
    )
    .unwrap();
    c2.add_control_port(
        ModuleInstanceId(B),
        ControlPortSpec::new(1, PeerLink::InterContainer { peer: k1, handle: None }),
    )
    .unwrap();
    c1.attach_peer_handle(k1, c2.external_handle(k2).unwrap()).unwrap();
    c2.attach_peer_handle(k2, c1.external_handle(k1).unwrap()).unwrap();
    c1.open(k1, k2, &[]).unwrap();
    c1.peer_connected(k1).unwrap();
    c2.open(k2, k1, &[]).unwrap();
    c2.peer_connected(k2).unwrap();
    (c1, c2, general, inbox)
}

fn send_polling(c: &mut Container, key: PortKey, body: &[u8]) {
    let mut buf = c.request_one_time_buffer(key, body.len()).unwrap();
    buf.write(body).unwrap();
    c.send(buf, SendFlags::POLLING).unwrap();
}

#[test]
fn test_peer_disconnect_flushes_external_queue() {
    let (mut c1, mut c2, general, inbox) = linked_containers(sync_config("cntr-2"));
    let k1 = PortKey::new(A, 1);
    let k2 = PortKey::new(B, 1);

    send_polling(&mut c1, k1, b"seek");
    assert_eq!(general.stats().outstanding(), 1);

    let report = c2.peer_disconnected(k2).unwrap();
    assert_eq!(report.drained, 0);
    assert_eq!(inbox.messages().len(), 1);
    assert_eq!(general.stats().outstanding(), 0);

    for _ in 0..5 {
        assert_eq!(c2.poll_once().external.handled, 0);
    }
    assert_eq!(inbox.messages().len(), 1);
}

#[test]
fn test_peer_disconnect_returns_what_it_cannot_deliver() {
    let mut config = sync_config("cntr-2");
    config.imcl.limits.drain_limit = 1;
    let (mut c1, mut c2, general, inbox) = linked_containers(config);
    let k1 = PortKey::new(A, 1);
    let k2 = PortKey::new(B, 1);

    for body in [b"one", b"two", b"six"] {
        send_polling(&mut c1, k1, body);
    }
    assert_eq!(general.stats().outstanding(), 3);

    let report = c2.peer_disconnected(k2).unwrap();
    assert_eq!(report.drained, 2);
    assert_eq!(inbox.messages()[0].payload, b"one".to_vec());
    assert_eq!(c2.external_handle(k2).unwrap().pending(), 0);
    assert_eq!(general.stats().outstanding(), 0);

    c2.peer_connected(k2).unwrap();
    assert_eq!(c2.poll_once().external.handled, 0);
    assert_eq!(inbox.messages().len(), 1);
}

#[test]
fn test_peer_disconnect_retrieves_intra_messages() {
    let (mut c, general) = container_with_manager("cntr-1");
    let (ka, kb, _, b_inbox) = linked_pair(&mut c);

    send_polling(&mut c, ka, b"hold");
    send_polling(&mut c, ka, b"drop");
    assert_eq!(c.links().intra_pending(), 2);

    let report = c.peer_disconnected(kb).unwrap();
    assert_eq!(report.retrieved, 2);
    assert_eq!(c.links().intra_pending(), 0);
    assert_eq!(general.stats().outstanding(), 0);

    c.poll_once();
    assert!(b_inbox.messages().is_empty());
}

#[derive(Default)]
struct IslandTopology {
    exits: AtomicU32,
    votes: Mutex<Vec<u32>>,
}

impl Topology for IslandTopology {
    fn is_island(&self) -> bool {
        true
    }

    fn exit_island_temporarily(&self) {
        self.exits.fetch_add(1, Ordering::SeqCst);
    }

    fn reevaluate_island_vote(&self, active: u32) {
        self.votes.lock().unwrap().push(active);
    }
}

#[test]
fn test_island_vote_follows_non_island_buffers() {
    let topology = Arc::new(IslandTopology::default());
    let services = ContainerServices::new(Arc::new(Immediate), registry())
        .with_topology(topology.clone());
    let mut c = Container::new(sync_config("island"), services).unwrap();
    let (ka, _kb, _, b_inbox) = linked_pair(&mut c);

    let first = c.request_one_time_buffer(ka, 8).unwrap();
    let second = c.request_one_time_buffer(ka, 8).unwrap();
    assert_eq!(c.links().island_vote(), 2);
    assert_eq!(topology.exits.load(Ordering::SeqCst), 2);

    c.send(first, SendFlags::POLLING).unwrap();
    assert_eq!(c.links().island_vote(), 1);
    drop(second);
    assert_eq!(c.links().island_vote(), 0);

    c.poll_once();
    assert_eq!(b_inbox.messages().len(), 1);
    assert_eq!(*topology.votes.lock().unwrap(), vec![0]);

    // nothing changed since, nothing to report
    c.poll_once();
    assert_eq!(topology.votes.lock().unwrap().len(), 1);
}

#[test]
fn test_remove_module_closes_its_ports() {
    let (mut c, general) = container_with_manager("cntr-1");
    let (ka, kb, _, _) = linked_pair(&mut c);

    let mut buf = c.request_one_time_buffer(ka, 4).unwrap();
    buf.write(b"bye!").unwrap();
    c.send(buf, SendFlags::POLLING).unwrap();

    c.remove_module(ModuleInstanceId(A)).unwrap();
    assert_eq!(c.port_state(ka), None);
    assert_eq!(c.port_state(kb), Some(PortState::PeerConnected));
    assert_eq!(general.stats().outstanding(), 0);
    assert!(matches!(
        c.remove_module(ModuleInstanceId(A)),
        Err(ImclError::UnknownModule(_))
    ));
}
