//! Control buffer pools.
//!
//! Two kinds of outgoing buffer exist:
//!
//! - **Recurring**: drawn from a queue owned by the sending port. The queue is
//!   sized by `(buf_size, num_bufs)` and only ever resized by freeing resident
//!   buffers and allocating new ones; buffers that were checked out across a
//!   resize come back stale and are replaced the next time they are popped.
//! - **One-time**: allocated per request from a [`BufferManager`], either the
//!   general manager or the low-power-safe island pool.
//!
//! A checked-out buffer is a [`CtrlBuffer`]. Dropping it returns the storage to
//! wherever it came from, so every path (sent, rejected, failed) returns it
//! exactly once.

use crate::error::{ImclError, ImclResult};
use crate::ids::{PortKey, PowerDomain};
use crate::island::{IslandVote, Topology};
use crate::queue::MsgQueue;
use bytes::BytesMut;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Storage behind a control buffer.
pub struct BufferBody {
    id: u64,
    data: BytesMut,
}

impl BufferBody {
    pub fn new(capacity: usize) -> Self {
        Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            data: BytesMut::zeroed(capacity),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl fmt::Debug for BufferBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferBody")
            .field("id", &self.id)
            .field("capacity", &self.data.len())
            .finish()
    }
}

/// Allocation counters for a buffer manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub allocated: u64,
    pub released: u64,
}

impl PoolStats {
    pub fn outstanding(&self) -> u64 {
        self.allocated - self.released
    }
}

/// Source of one-time buffers.
pub trait BufferManager: Send + Sync {
    fn name(&self) -> &str;

    /// Allocate a body of at least `size` bytes. Never blocks.
    fn alloc(&self, size: usize) -> ImclResult<BufferBody>;

    fn release(&self, body: BufferBody);

    fn stats(&self) -> PoolStats;
}

/// Heap-backed manager for non-island memory, bounded by a byte budget.
#[derive(Debug)]
pub struct GeneralBufferManager {
    budget: usize,
    in_use: AtomicUsize,
    allocated: AtomicU64,
    released: AtomicU64,
}

impl GeneralBufferManager {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            in_use: AtomicUsize::new(0),
            allocated: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    pub fn bytes_in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }
}

impl BufferManager for GeneralBufferManager {
    fn name(&self) -> &str {
        "general"
    }

    fn alloc(&self, size: usize) -> ImclResult<BufferBody> {
        let budget = self.budget;
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|total| *total <= budget)
            })
            .map_err(|_| ImclError::AllocationFailed(size))?;
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Ok(BufferBody::new(size))
    }

    fn release(&self, body: BufferBody) {
        self.in_use.fetch_sub(body.capacity(), Ordering::AcqRel);
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
        }
    }
}

/// Fixed-node pool in island-safe memory. Nodes are allocated up front.
pub struct IslandBufferPool {
    node_size: usize,
    free: Mutex<Vec<BufferBody>>,
    allocated: AtomicU64,
    released: AtomicU64,
}

impl IslandBufferPool {
    pub fn new(nodes: usize, node_size: usize) -> Self {
        Self {
            node_size,
            free: Mutex::new((0..nodes).map(|_| BufferBody::new(node_size)).collect()),
            allocated: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    pub fn free_nodes(&self) -> usize {
        self.free.lock().expect("island pool mutex poisoned").len()
    }
}

impl BufferManager for IslandBufferPool {
    fn name(&self) -> &str {
        "island"
    }

    fn alloc(&self, size: usize) -> ImclResult<BufferBody> {
        if size > self.node_size {
            return Err(ImclError::AllocationFailed(size));
        }
        let body = self
            .free
            .lock()
            .expect("island pool mutex poisoned")
            .pop()
            .ok_or(ImclError::AllocationFailed(size))?;
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Ok(body)
    }

    fn release(&self, body: BufferBody) {
        self.released.fetch_add(1, Ordering::Relaxed);
        self.free.lock().expect("island pool mutex poisoned").push(body);
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for IslandBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IslandBufferPool")
            .field("node_size", &self.node_size)
            .field("free_nodes", &self.free_nodes())
            .finish()
    }
}

/// The two one-time buffer sources, picked by a port's operating domain.
#[derive(Clone)]
pub struct OneTimeAllocators {
    pub general: Arc<dyn BufferManager>,
    pub island: Arc<dyn BufferManager>,
}

impl OneTimeAllocators {
    pub fn select(&self, domain: PowerDomain) -> &Arc<dyn BufferManager> {
        match domain {
            PowerDomain::Island => &self.island,
            PowerDomain::NonIsland => &self.general,
        }
    }
}

/// Where a buffer goes back to.
#[derive(Clone)]
pub(crate) enum BufferHome {
    Recurring(Arc<MsgQueue<BufferBody>>),
    OneTime(Arc<dyn BufferManager>),
}

impl BufferHome {
    fn give_back(&self, body: BufferBody) {
        match self {
            BufferHome::Recurring(queue) => {
                if queue.push_back(body).is_err() {
                    warn!("recurring queue {} full on return, freeing buffer", queue.name());
                }
            }
            BufferHome::OneTime(manager) => manager.release(body),
        }
    }
}

/// A checked-out control buffer.
///
/// Holds the payload a module fills before sending. Dropping it, sent or not,
/// returns the storage to its origin.
pub struct CtrlBuffer {
    id: u64,
    body: Option<BufferBody>,
    home: BufferHome,
    max_len: usize,
    len: usize,
    token: u64,
    source: PortKey,
    vote: Option<Arc<IslandVote>>,
}

impl CtrlBuffer {
    pub(crate) fn new(
        body: BufferBody,
        home: BufferHome,
        max_len: usize,
        token: u64,
        source: PortKey,
    ) -> Self {
        Self {
            id: body.id(),
            body: Some(body),
            home,
            max_len,
            len: 0,
            token,
            source,
            vote: None,
        }
    }

    /// Count this buffer against the island vote until it is sent or dropped.
    pub(crate) fn hold_vote(&mut self, vote: Arc<IslandVote>) {
        vote.checkout();
        self.vote = Some(vote);
    }

    /// Release the island vote, if held.
    pub(crate) fn drop_vote(&mut self) {
        if let Some(vote) = self.vote.take() {
            vote.release();
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Per-port sequence number stamped at checkout.
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Port the buffer was checked out on.
    pub fn source(&self) -> PortKey {
        self.source
    }

    pub fn is_recurring(&self) -> bool {
        matches!(self.home, BufferHome::Recurring(_))
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Bytes of valid payload.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn payload(&self) -> &[u8] {
        match &self.body {
            Some(body) => &body.data[..self.len],
            None => &[],
        }
    }

    /// Whole writable region, `max_len` bytes.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let max = self.max_len;
        match &mut self.body {
            Some(body) => &mut body.data[..max],
            None => &mut [],
        }
    }

    pub fn set_len(&mut self, len: usize) -> ImclResult<()> {
        if len > self.max_len {
            return Err(ImclError::PayloadTooLarge {
                len,
                max: self.max_len,
            });
        }
        self.len = len;
        Ok(())
    }

    /// Copy `bytes` in and mark them as the payload.
    pub fn write(&mut self, bytes: &[u8]) -> ImclResult<()> {
        self.set_len(bytes.len())?;
        self.payload_mut()[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

impl Drop for CtrlBuffer {
    fn drop(&mut self) {
        self.drop_vote();
        if let Some(body) = self.body.take() {
            self.home.give_back(body);
        }
    }
}

impl fmt::Debug for CtrlBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CtrlBuffer")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("token", &self.token)
            .field("len", &self.len)
            .field("max_len", &self.max_len)
            .field("recurring", &self.is_recurring())
            .finish()
    }
}

/// A port's recurring buffer queue and its sizing.
#[derive(Debug)]
pub(crate) struct RecurringPool {
    name: String,
    queue_depth: usize,
    queue: Option<Arc<MsgQueue<BufferBody>>>,
    buf_size: usize,
    /// Live buffers, resident plus checked out.
    num_bufs: usize,
}

impl RecurringPool {
    pub fn new(name: impl Into<String>, queue_depth: usize) -> Self {
        Self {
            name: name.into(),
            queue_depth,
            queue: None,
            buf_size: 0,
            num_bufs: 0,
        }
    }

    pub fn exists(&self) -> bool {
        self.queue.is_some()
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn num_bufs(&self) -> usize {
        self.num_bufs
    }

    pub fn resident(&self) -> usize {
        self.queue.as_ref().map(|q| q.len()).unwrap_or(0)
    }

    /// Bring the pool to `new_count` buffers of `new_size` bytes.
    ///
    /// No-op when either value is zero or the size is 1 or less. Resident
    /// buffers of the old size are freed; checked-out ones are replaced when
    /// they come back.
    pub fn recreate(
        &mut self,
        new_size: usize,
        new_count: usize,
        topology: &dyn Topology,
    ) -> ImclResult<()> {
        if new_size <= 1 || new_count == 0 {
            return Ok(());
        }
        if new_count > self.queue_depth {
            return Err(ImclError::QueueFull(self.name.clone()));
        }

        let queue = Arc::clone(
            self.queue
                .get_or_insert_with(|| Arc::new(MsgQueue::new(self.name.clone(), self.queue_depth))),
        );

        if new_size != self.buf_size {
            let stale = queue.take_all();
            if !stale.is_empty() {
                topology.exit_island_temporarily();
            }
            self.num_bufs = self.num_bufs.saturating_sub(stale.len());
            debug!(
                "{}: resizing {} -> {} bytes, freed {} resident",
                self.name,
                self.buf_size,
                new_size,
                stale.len()
            );
            self.buf_size = new_size;
        }

        self.create_bufs(&queue, new_count)
    }

    fn create_bufs(&mut self, queue: &MsgQueue<BufferBody>, target: usize) -> ImclResult<()> {
        while self.num_bufs < target {
            queue
                .push_back(BufferBody::new(self.buf_size))
                .map_err(|_| ImclError::QueueFull(self.name.clone()))?;
            self.num_bufs += 1;
        }
        Ok(())
    }

    /// Pop a buffer of the current size, replacing stale ones on the way.
    pub fn checkout(
        &mut self,
        source: PortKey,
        retry_limit: u32,
        topology: &dyn Topology,
    ) -> ImclResult<(BufferBody, BufferHome)> {
        let queue = self.queue.clone().ok_or(ImclError::QueueAbsent(source))?;
        let mut discarded = 0u32;
        loop {
            let body = queue.pop_front().ok_or(ImclError::QueueEmpty(source))?;
            if body.capacity() == self.buf_size {
                return Ok((body, BufferHome::Recurring(queue)));
            }

            topology.exit_island_temporarily();
            debug!(
                "{}: discarding stale {}-byte buffer (want {})",
                self.name,
                body.capacity(),
                self.buf_size
            );
            drop(body);
            self.num_bufs = self.num_bufs.saturating_sub(1);
            if let Err(e) = self.create_bufs(&queue, self.num_bufs + 1) {
                warn!("{}: failed to replace stale buffer: {}", self.name, e);
            }

            discarded += 1;
            if discarded > retry_limit {
                return Err(ImclError::LivelockGuard(discarded));
            }
        }
    }

    /// Free resident buffers and detach the queue.
    ///
    /// Returns how many buffers were still checked out; they are freed when
    /// their holders drop them.
    pub fn destroy(&mut self, topology: &dyn Topology) -> usize {
        let Some(queue) = self.queue.take() else {
            return 0;
        };
        let resident = queue.take_all();
        if !resident.is_empty() {
            topology.exit_island_temporarily();
        }
        let outstanding = self.num_bufs.saturating_sub(resident.len());
        self.num_bufs = 0;
        self.buf_size = 0;
        outstanding
    }
}
