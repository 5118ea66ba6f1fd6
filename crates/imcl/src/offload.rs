//! Async command handle: runs slow graph commands on a worker pool so a
//! real-time container thread keeps processing data.
//!
//! ```text
//!  Uninitialized ──init──▶ Initialized ──push──▶ Active ──done──▶ Completed
//!                               ▲                   │               │
//!                               │        continuation                │ push
//!                               │                   ▼               ▼
//!                               │        AwaitingContinuation     Active
//!                               │                   │ handle_completion
//!                               └───────────────────┴──▶ Completed
//! ```
//!
//! While a command is with the pool the container's command bit is disabled,
//! so the container cannot pick up another command until this one is done.
//! Exactly one of "command signaling enabled" and "pool owns a command"
//! holds at any time.

use crate::channel::PollChannel;
use crate::command::GraphCommand;
use crate::error::{ImclError, ImclResult};
use crate::worker_pool::{PoolRequest, WorkerPool, WorkerPoolRegistry};
use imclconf::OffloadConfig;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncState {
    Uninitialized,
    Initialized,
    /// Worker owns a command
    Active,
    /// Worker finished; continuation waits for the container thread
    AwaitingContinuation,
    Completed,
    Deinitialized,
}

/// Work left for the container thread after a worker finished its part.
pub type Continuation = Box<dyn FnOnce() -> ImclResult<()> + Send + 'static>;

pub enum CmdOutcome {
    Done(ImclResult<()>),
    Continue(Continuation),
}

/// Graph-management layer that actually executes graph commands.
pub trait CommandProcessor: Send + Sync {
    fn process(&self, cmd: &GraphCommand) -> CmdOutcome;
}

/// Whether a container with this stack and frame period should offload.
///
/// `frame_len_us` of `None` means the period is not known yet.
pub fn needs_offload(stack_size: usize, frame_len_us: Option<u64>, config: &OffloadConfig) -> bool {
    stack_size <= config.stack_threshold_bytes
        || frame_len_us.is_some_and(|us| us < config.frame_threshold_us)
}

struct Shared {
    state: Mutex<AsyncState>,
    settled: Condvar,
    job: Mutex<Option<(GraphCommand, Arc<dyn CommandProcessor>)>>,
    pending: Mutex<Option<(GraphCommand, Continuation)>>,
    reenables: AtomicU32,
}

impl Shared {
    fn set_state(&self, state: AsyncState) {
        *self.state.lock().expect("async state mutex poisoned") = state;
        self.settled.notify_all();
    }
}

pub struct AsyncCmdHandle {
    log_id: String,
    registry: Arc<WorkerPoolRegistry>,
    pool: Arc<WorkerPool>,
    channel: Arc<PollChannel>,
    cmd_bit: u32,
    completion_bit: u32,
    shared: Arc<Shared>,
}

impl AsyncCmdHandle {
    /// Acquire a pool and a completion bit on the container's channel.
    pub fn init(
        log_id: impl Into<String>,
        registry: Arc<WorkerPoolRegistry>,
        request: PoolRequest,
        channel: Arc<PollChannel>,
        cmd_bit: u32,
    ) -> ImclResult<Self> {
        let log_id = log_id.into();
        let pool = registry.get_instance(request)?;
        let completion_bit = channel.allocate_bit()?;
        info!("{}: async command handle on worker pool {}", log_id, pool.id());
        Ok(Self {
            log_id,
            registry,
            pool,
            channel,
            cmd_bit,
            completion_bit,
            shared: Arc::new(Shared {
                state: Mutex::new(AsyncState::Initialized),
                settled: Condvar::new(),
                job: Mutex::new(None),
                pending: Mutex::new(None),
                reenables: AtomicU32::new(0),
            }),
        })
    }

    pub fn state(&self) -> AsyncState {
        *self.shared.state.lock().expect("async state mutex poisoned")
    }

    pub fn completion_bit(&self) -> u32 {
        self.completion_bit
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Times command signaling was turned back on after an offloaded command.
    pub fn signaling_reenables(&self) -> u32 {
        self.shared.reenables.load(Ordering::Acquire)
    }

    /// Re-acquire a pool for new stack/worker requirements.
    pub fn update(&mut self, request: PoolRequest) -> ImclResult<()> {
        match self.state() {
            AsyncState::Initialized | AsyncState::Completed => {}
            other => return Err(ImclError::OffloadState(other)),
        }
        let pool = self.registry.update_instance(&self.pool, request)?;
        if pool.id() != self.pool.id() {
            info!("{}: moved to worker pool {}", self.log_id, pool.id());
        }
        self.pool = pool;
        Ok(())
    }

    /// Hand `cmd` to the pool.
    ///
    /// Command signaling is disabled first. If the pool rejects the job,
    /// signaling is restored and the command comes back for synchronous
    /// processing.
    pub fn push(
        &self,
        cmd: GraphCommand,
        processor: Arc<dyn CommandProcessor>,
    ) -> Result<(), (GraphCommand, ImclError)> {
        {
            let mut state = self.shared.state.lock().expect("async state mutex poisoned");
            match *state {
                AsyncState::Initialized | AsyncState::Completed => *state = AsyncState::Active,
                other => return Err((cmd, ImclError::OffloadState(other))),
            }
        }

        self.channel.disable(self.cmd_bit);
        let opcode = cmd.opcode;
        *self.shared.job.lock().expect("async job mutex poisoned") = Some((cmd, processor));

        let shared = Arc::clone(&self.shared);
        let channel = Arc::clone(&self.channel);
        let (cmd_bit, completion_bit) = (self.cmd_bit, self.completion_bit);
        let pushed = self.pool.try_push(Box::new(move || {
            run_on_worker(&shared, &channel, cmd_bit, completion_bit)
        }));

        match pushed {
            Ok(()) => {
                debug!("{}: offloaded {:?}", self.log_id, opcode);
                Ok(())
            }
            Err(e) => {
                let job = self.shared.job.lock().expect("async job mutex poisoned").take();
                self.channel.enable(self.cmd_bit);
                self.shared.set_state(AsyncState::Completed);
                warn!("{}: offload of {:?} failed: {}", self.log_id, opcode, e);
                match job {
                    Some((cmd, _)) => Err((cmd, e)),
                    None => Ok(()),
                }
            }
        }
    }

    /// Container-thread side of a completion signal: run the continuation,
    /// then turn command signaling back on.
    pub fn handle_completion(&self) -> ImclResult<()> {
        self.channel.lower(self.completion_bit);
        let pending = self.shared.pending.lock().expect("async pending mutex poisoned").take();
        let Some((cmd, continuation)) = pending else {
            return Ok(());
        };

        let result = continuation();
        self.shared.set_state(AsyncState::Completed);
        self.channel.enable(self.cmd_bit);
        self.shared.reenables.fetch_add(1, Ordering::AcqRel);
        debug!("{}: continuation of {:?} done", self.log_id, cmd.opcode);
        cmd.ack(result.clone(), true);
        result
    }

    /// Block until no worker owns a command.
    pub fn wait_idle(&self) {
        let state = self.shared.state.lock().expect("async state mutex poisoned");
        let _settled = self
            .shared
            .settled
            .wait_while(state, |s| *s == AsyncState::Active)
            .expect("async state mutex poisoned");
    }

    /// Wait for in-flight work, finish any continuation, release resources.
    pub fn deinit(self) {
        drop(self);
    }
}

impl Drop for AsyncCmdHandle {
    fn drop(&mut self) {
        self.wait_idle();
        if self.state() == AsyncState::AwaitingContinuation {
            if let Err(e) = self.handle_completion() {
                warn!("{}: continuation failed during teardown: {}", self.log_id, e);
            }
        }
        self.shared.set_state(AsyncState::Deinitialized);
        self.channel.release_bit(self.completion_bit);
        debug!("{}: async command handle released", self.log_id);
    }
}

fn run_on_worker(shared: &Shared, channel: &PollChannel, cmd_bit: u32, completion_bit: u32) {
    let job = shared.job.lock().expect("async job mutex poisoned").take();
    let Some((cmd, processor)) = job else {
        return;
    };

    match processor.process(&cmd) {
        CmdOutcome::Done(result) => {
            shared.set_state(AsyncState::Completed);
            channel.enable(cmd_bit);
            shared.reenables.fetch_add(1, Ordering::AcqRel);
            cmd.ack(result, true);
        }
        CmdOutcome::Continue(continuation) => {
            *shared.pending.lock().expect("async pending mutex poisoned") = Some((cmd, continuation));
            shared.set_state(AsyncState::AwaitingContinuation);
            channel.raise(completion_bit);
        }
    }
}
