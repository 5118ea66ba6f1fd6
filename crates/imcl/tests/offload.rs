//! Graph commands offloaded to worker pools.

mod common;

use common::{registry, sync_config, Immediate};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use imcl::{
    AsyncState, CmdOutcome, CommandProcessor, Container, ContainerConfig, ContainerServices,
    GraphCommand, GraphOpcode, WorkerPoolRegistry,
};
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn small_stack(log_id: &str) -> ContainerConfig {
    ContainerConfig {
        log_id: log_id.to_string(),
        stack_size: 8 * 1024,
        ..ContainerConfig::default()
    }
}

/// Holds `Stop` on the worker until the test lets it go.
struct GatedStop {
    started: Sender<()>,
    release: Receiver<()>,
}

impl CommandProcessor for GatedStop {
    fn process(&self, cmd: &GraphCommand) -> CmdOutcome {
        if cmd.opcode == GraphOpcode::Stop {
            self.started.send(()).unwrap();
            self.release.recv_timeout(WAIT).unwrap();
        }
        CmdOutcome::Done(Ok(()))
    }
}

/// Finishes `Close` on the container thread.
#[derive(Default)]
struct TwoPhaseClose {
    continued_on: Arc<Mutex<Option<ThreadId>>>,
}

impl CommandProcessor for TwoPhaseClose {
    fn process(&self, _cmd: &GraphCommand) -> CmdOutcome {
        let continued_on = Arc::clone(&self.continued_on);
        CmdOutcome::Continue(Box::new(move || {
            *continued_on.lock().unwrap() = Some(thread::current().id());
            Ok(())
        }))
    }
}

#[test]
fn test_stop_is_offloaded_and_signaling_restored_once() {
    let (started_tx, started_rx) = bounded(1);
    let (release_tx, release_rx) = bounded(1);
    let processor = GatedStop {
        started: started_tx,
        release: release_rx,
    };
    let services = ContainerServices::new(Arc::new(processor), registry());
    let mut c = Container::new(small_stack("rt-cntr"), services).unwrap();
    assert_eq!(c.offload_state(), AsyncState::Initialized);

    let (ack_tx, ack_rx) = unbounded();
    let handle = c.handle();
    handle
        .push_graph_command(GraphCommand::new(GraphOpcode::Stop, 7).with_reply(ack_tx.clone()))
        .unwrap();

    assert_eq!(c.poll_once().commands, 1);
    assert!(!c.channel().is_enabled(c.command_bit()));
    started_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(c.offload_state(), AsyncState::Active);

    // held back while the worker owns the stop
    handle
        .push_graph_command(GraphCommand::new(GraphOpcode::Start, 8).with_reply(ack_tx))
        .unwrap();
    assert_eq!(c.poll_once().commands, 0);
    assert_eq!(c.pending_commands(), 1);

    release_tx.send(()).unwrap();
    let ack = ack_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(ack.token, 7);
    assert!(ack.offloaded);
    assert!(ack.result.is_ok());

    let offload = c.offload_handle().unwrap();
    assert_eq!(offload.signaling_reenables(), 1);
    assert_eq!(offload.state(), AsyncState::Completed);
    assert!(c.channel().is_enabled(c.command_bit()));

    // start is not offload-eligible
    assert_eq!(c.poll_once().commands, 1);
    let ack = ack_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(ack.opcode, GraphOpcode::Start);
    assert!(!ack.offloaded);
    assert_eq!(c.offload_handle().unwrap().signaling_reenables(), 1);
}

#[test]
fn test_continuation_runs_on_container_thread() {
    let processor = TwoPhaseClose::default();
    let continued_on = Arc::clone(&processor.continued_on);
    let services = ContainerServices::new(Arc::new(processor), registry());
    let mut c = Container::new(small_stack("rt-cntr"), services).unwrap();

    let (ack_tx, ack_rx) = unbounded();
    c.handle()
        .push_graph_command(GraphCommand::new(GraphOpcode::Close, 1).with_reply(ack_tx))
        .unwrap();
    assert_eq!(c.poll_once().commands, 1);

    let mut completions = 0;
    for _ in 0..50 {
        completions += c.wait_once(Duration::from_millis(100)).completions;
        if completions > 0 {
            break;
        }
    }
    assert_eq!(completions, 1);
    assert_eq!(*continued_on.lock().unwrap(), Some(thread::current().id()));

    let ack = ack_rx.recv_timeout(WAIT).unwrap();
    assert!(ack.offloaded);
    assert_eq!(c.offload_state(), AsyncState::Completed);
    assert_eq!(c.offload_handle().unwrap().signaling_reenables(), 1);
    assert!(c.channel().is_enabled(c.command_bit()));
}

#[test]
fn test_large_stack_processes_synchronously() {
    let services = ContainerServices::new(Arc::new(Immediate), registry());
    let mut c = Container::new(sync_config("big-stack"), services).unwrap();
    assert!(c.offload_handle().is_none());

    let (ack_tx, ack_rx) = unbounded();
    c.handle()
        .push_graph_command(GraphCommand::new(GraphOpcode::Stop, 3).with_reply(ack_tx))
        .unwrap();
    c.poll_once();

    let ack = ack_rx.try_recv().unwrap();
    assert!(!ack.offloaded);
    assert_eq!(c.offload_state(), AsyncState::Uninitialized);
}

#[test]
fn test_short_frame_enables_offload_later() {
    let services = ContainerServices::new(Arc::new(Immediate), registry());
    let mut c = Container::new(sync_config("late"), services).unwrap();
    assert!(c.offload_handle().is_none());

    c.update_offload(1024 * 1024, Some(500), 0).unwrap();
    assert_eq!(c.offload_state(), AsyncState::Initialized);
}

#[test]
fn test_containers_share_a_pool() {
    let registry = Arc::new(WorkerPoolRegistry::new(&Default::default()));
    let build = |name: &str| {
        let services = ContainerServices::new(Arc::new(Immediate), Arc::clone(&registry));
        Container::new(small_stack(name), services).unwrap()
    };
    let c1 = build("rt-1");
    let c2 = build("rt-2");

    let p1 = c1.offload_handle().unwrap().pool().id();
    let p2 = c2.offload_handle().unwrap().pool().id();
    assert_eq!(p1, p2);
    assert_eq!(registry.live_pools(), 1);
}

#[test]
fn test_run_loop_until_shutdown() {
    let services = ContainerServices::new(Arc::new(Immediate), registry());
    let mut c = Container::new(small_stack("threaded"), services).unwrap();
    let handle = c.handle();

    let worker = thread::Builder::new()
        .name("cntr-threaded".into())
        .spawn(move || c.run())
        .unwrap();

    let (ack_tx, ack_rx) = unbounded();
    handle
        .push_graph_command(GraphCommand::new(GraphOpcode::Prepare, 1).with_reply(ack_tx.clone()))
        .unwrap();
    handle
        .push_graph_command(GraphCommand::new(GraphOpcode::Suspend, 2).with_reply(ack_tx))
        .unwrap();

    let first = ack_rx.recv_timeout(WAIT).unwrap();
    let second = ack_rx.recv_timeout(WAIT).unwrap();
    assert_eq!((first.token, first.offloaded), (1, false));
    assert_eq!((second.token, second.offloaded), (2, true));

    handle.shutdown().unwrap();
    worker.join().unwrap();
}
