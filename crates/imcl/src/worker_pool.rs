//! Shared worker threads for offloaded graph commands.
//!
//! Pools are handed out by a [`WorkerPoolRegistry`], which the host creates
//! once and tears down at shutdown. Non-dedicated requests with the same
//! priority and power domain share a pool when that pool's threads already
//! meet the requested stack size and worker count; otherwise a new pool is
//! spawned. A pool's threads exit once the last holder drops it.

use crate::error::{ImclError, ImclResult};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use imclconf::OffloadConfig;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Unit of work run on a pool thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Requirements a client puts on a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolRequest {
    /// Scheduling priority of the workers; pools are only shared within one priority.
    pub priority: i32,
    /// Whether the pool serves island containers.
    pub island: bool,
    /// Never share this pool with another client.
    pub dedicated: bool,
    pub stack_size: usize,
    pub workers: usize,
}

impl PoolRequest {
    pub fn from_config(config: &OffloadConfig, priority: i32) -> Self {
        Self {
            priority,
            island: false,
            dedicated: false,
            stack_size: config.worker_stack_bytes,
            workers: config.worker_threads,
        }
    }

    fn max(self, other: PoolRequest) -> PoolRequest {
        PoolRequest {
            stack_size: self.stack_size.max(other.stack_size),
            workers: self.workers.max(other.workers),
            ..self
        }
    }
}

pub struct WorkerPool {
    id: u32,
    request: PoolRequest,
    jobs: Option<Sender<Job>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    fn spawn(id: u32, request: PoolRequest, queue_depth: usize) -> ImclResult<Self> {
        let (tx, rx) = crossbeam_channel::bounded::<Job>(queue_depth);
        let mut threads = Vec::with_capacity(request.workers);
        for n in 0..request.workers.max(1) {
            let rx: Receiver<Job> = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("imcl-tp{}-{}", id, n))
                .stack_size(request.stack_size)
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .map_err(|e| ImclError::Spawn(e.to_string()))?;
            threads.push(handle);
        }
        info!(
            "Worker pool {} started: {} threads, {} byte stacks, prio {}",
            id,
            threads.len(),
            request.stack_size,
            request.priority
        );
        Ok(Self {
            id,
            request,
            jobs: Some(tx),
            threads: Mutex::new(threads),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn request(&self) -> PoolRequest {
        self.request
    }

    /// Whether this pool can serve `req` without changes.
    pub fn satisfies(&self, req: &PoolRequest) -> bool {
        self.request.priority == req.priority
            && self.request.island == req.island
            && self.request.stack_size >= req.stack_size
            && self.request.workers >= req.workers
    }

    /// Queue a job. Fails fast when the queue is full.
    pub fn try_push(&self, job: Job) -> ImclResult<()> {
        let jobs = self.jobs.as_ref().ok_or(ImclError::PoolBusy)?;
        jobs.try_send(job).map_err(|e| match e {
            TrySendError::Full(_) => ImclError::PoolBusy,
            TrySendError::Disconnected(_) => ImclError::PoolBusy,
        })
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // closing the channel ends every worker loop
        self.jobs.take();
        let threads = std::mem::take(&mut *self.threads.lock().expect("worker pool mutex poisoned"));
        for handle in threads {
            if handle.thread().id() == thread::current().id() {
                continue;
            }
            if handle.join().is_err() {
                warn!("Worker pool {}: worker panicked", self.id);
            }
        }
        debug!("Worker pool {} joined", self.id);
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("id", &self.id)
            .field("request", &self.request)
            .finish()
    }
}

/// Process-wide directory of worker pools.
#[derive(Debug)]
pub struct WorkerPoolRegistry {
    pools: Mutex<Vec<Weak<WorkerPool>>>,
    next_id: AtomicU32,
    queue_depth: usize,
}

impl WorkerPoolRegistry {
    pub fn new(config: &OffloadConfig) -> Self {
        Self {
            pools: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(0),
            queue_depth: config.job_queue_depth.max(1),
        }
    }

    /// Hand out a pool meeting `req`, reusing a shared one when possible.
    pub fn get_instance(&self, req: PoolRequest) -> ImclResult<Arc<WorkerPool>> {
        let mut pools = self.pools.lock().expect("pool registry mutex poisoned");
        pools.retain(|p| p.strong_count() > 0);

        if !req.dedicated {
            let reusable = pools
                .iter()
                .filter_map(Weak::upgrade)
                .filter(|p| !p.request.dedicated && p.satisfies(&req))
                .min_by_key(|p| p.request.stack_size * p.request.workers);
            if let Some(pool) = reusable {
                debug!("Reusing worker pool {}", pool.id);
                return Ok(pool);
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pool = Arc::new(WorkerPool::spawn(id, req, self.queue_depth)?);
        pools.push(Arc::downgrade(&pool));
        Ok(pool)
    }

    /// Re-acquire a pool after a client's stack or worker needs changed.
    pub fn update_instance(
        &self,
        current: &Arc<WorkerPool>,
        req: PoolRequest,
    ) -> ImclResult<Arc<WorkerPool>> {
        if current.satisfies(&req) && current.request.dedicated == req.dedicated {
            return Ok(Arc::clone(current));
        }
        let merged = if current.request.priority == req.priority {
            current.request.max(req)
        } else {
            req
        };
        self.get_instance(merged)
    }

    pub fn live_pools(&self) -> usize {
        self.pools
            .lock()
            .expect("pool registry mutex poisoned")
            .iter()
            .filter(|p| p.strong_count() > 0)
            .count()
    }

    /// Forget every pool. Pools still held by clients keep running until dropped.
    pub fn shutdown(&self) {
        self.pools.lock().expect("pool registry mutex poisoned").clear();
    }
}
