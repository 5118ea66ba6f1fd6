//! Recurring buffer queues as seen through a container.

mod common;

use common::{registry, sync_config, Immediate, Recorder};
use imcl::{
    Container, ContainerServices, ControlPortSpec, ErrorKind, ImclError, ModuleInstanceId,
    PeerLink, PortKey, SendFlags,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn connected_port(c: &mut Container, size: usize, count: usize) -> PortKey {
    let key = PortKey::new(1, 3);
    let peer = PortKey::new(2, 3);
    let (m, _) = Recorder::new();
    let (p, _) = Recorder::new();
    c.add_module(ModuleInstanceId(1), Box::new(m)).unwrap();
    c.add_module(ModuleInstanceId(2), Box::new(p)).unwrap();
    c.add_control_port(
        ModuleInstanceId(1),
        ControlPortSpec::new(3, PeerLink::IntraContainer { peer }),
    )
    .unwrap();
    c.add_control_port(
        ModuleInstanceId(2),
        ControlPortSpec::new(3, PeerLink::IntraContainer { peer: key }),
    )
    .unwrap();

    c.set_recurring_buffer_info(key, size, count).unwrap();
    c.open(key, peer, &[]).unwrap();
    c.open(peer, key, &[]).unwrap();
    c.peer_connected(key).unwrap();
    c.peer_connected(peer).unwrap();
    key
}

fn container_with_retry_limit(limit: u32) -> Container {
    let mut config = sync_config("recurring");
    config.imcl.limits.recurring_retry_limit = limit;
    let services = ContainerServices::new(Arc::new(Immediate), registry());
    Container::new(config, services).unwrap()
}

#[test]
fn test_queue_created_on_peer_connect() {
    let mut c = common::container("recurring");
    let key = connected_port(&mut c, 100, 4);

    let port = c.find_control_port_by_id(ModuleInstanceId(1), imcl::PortId(3)).unwrap();
    assert_eq!(port.recurring_buf_size(), 100);
    assert_eq!(port.recurring_buf_count(), 4);

    let buf = c.request_recurring_buffer(key).unwrap();
    assert!(buf.is_recurring());
    assert_eq!(buf.max_len(), 100);
}

#[test]
fn test_resize_never_hands_out_old_size() {
    let mut c = common::container("recurring");
    let key = connected_port(&mut c, 100, 4);

    // two out in flight while the size changes
    let held: Vec<_> = (0..2).map(|_| c.request_recurring_buffer(key).unwrap()).collect();
    c.set_recurring_buffer_info(key, 150, 4).unwrap();
    drop(held);

    let sizes: Vec<usize> = (0..4)
        .map(|_| c.request_recurring_buffer(key).unwrap())
        .map(|buf| buf.max_len())
        .collect();
    // each buffer went back before the next checkout
    assert_eq!(sizes, vec![150; 4]);

    let held: Vec<_> = (0..4).map(|_| c.request_recurring_buffer(key).unwrap()).collect();
    assert!(held.iter().all(|b| b.max_len() == 150));
    assert!(matches!(
        c.request_recurring_buffer(key),
        Err(ImclError::QueueEmpty(_))
    ));
}

#[test]
fn test_sent_recurring_buffer_comes_back() {
    let mut c = common::container("recurring");
    let key = connected_port(&mut c, 32, 1);

    let mut buf = c.request_recurring_buffer(key).unwrap();
    buf.write(b"eq").unwrap();
    c.send(buf, SendFlags::POLLING).unwrap();
    assert!(c.request_recurring_buffer(key).is_err());

    c.poll_once();
    let again = c.request_recurring_buffer(key).unwrap();
    assert_eq!(again.max_len(), 32);
    assert!(again.is_empty());
}

#[test]
fn test_stale_buffers_trip_retry_guard() {
    let mut c = container_with_retry_limit(2);
    let key = connected_port(&mut c, 100, 4);

    let held: Vec<_> = (0..4).map(|_| c.request_recurring_buffer(key).unwrap()).collect();
    c.set_recurring_buffer_info(key, 150, 4).unwrap();
    drop(held);

    let err = c.request_recurring_buffer(key).unwrap_err();
    assert!(matches!(err, ImclError::LivelockGuard(3)));
    assert_eq!(err.kind(), ErrorKind::LivelockGuard);
    assert!(err.is_resource_exhausted());

    // the guard only bounds one call; later calls keep making progress
    let buf = c.request_recurring_buffer(key).unwrap();
    assert_eq!(buf.max_len(), 150);
}

#[test]
fn test_close_reports_outstanding_recurring_buffers() {
    let mut c = common::container("recurring");
    let key = connected_port(&mut c, 64, 2);

    let held = c.request_recurring_buffer(key).unwrap();
    let report = c.close(key).unwrap();
    assert_eq!(report.outstanding, 1);
    assert!(matches!(
        c.request_recurring_buffer(key),
        Err(ImclError::QueueAbsent(_))
    ));
    drop(held);
}

#[test]
fn test_recurring_info_rejects_more_than_queue_depth() {
    let mut c = common::container("recurring");
    let key = connected_port(&mut c, 64, 2);

    let depth = imcl::LimitsConfig::default().queue_depth;
    let err = c.set_recurring_buffer_info(key, 64, depth + 1).unwrap_err();
    assert!(err.is_resource_exhausted());
}
