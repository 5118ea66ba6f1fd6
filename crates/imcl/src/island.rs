//! Island (low-power) bookkeeping.
//!
//! A container running in the island must not keep buffers that live in
//! non-island memory checked out without the power scheduler knowing. Every
//! checkout of such a buffer bumps [`IslandVote`], every send or return drops
//! it, and each change raises a re-evaluation flag the container forwards to
//! [`Topology::reevaluate_island_vote`].

use crate::ids::PowerDomain;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::debug;

/// Graph/topology services the control plane calls back into.
pub trait Topology: Send + Sync {
    /// Whether the owning container currently executes in the island.
    fn is_island(&self) -> bool {
        false
    }

    /// Leave the island for the duration of a non-island memory access.
    fn exit_island_temporarily(&self) {}

    /// Power scheduler hook, called after the vote count changed.
    fn reevaluate_island_vote(&self, _active_non_island_buffers: u32) {}
}

/// Topology for containers that never enter the island.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIsland;

impl Topology for NoIsland {}

/// Non-island buffers currently held by an island container.
#[derive(Debug, Default)]
pub struct IslandVote {
    count: AtomicU32,
    reevaluate: AtomicBool,
}

impl IslandVote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a buffer event on a port in `port_domain` moves the vote.
    pub fn applies(container_in_island: bool, port_domain: PowerDomain) -> bool {
        container_in_island && !port_domain.is_island()
    }

    /// A non-island buffer was checked out.
    pub fn checkout(&self) {
        let now = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        self.reevaluate.store(true, Ordering::Release);
        debug!("island vote +1 -> {}", now);
    }

    /// A non-island buffer was sent or returned. Clamped at zero.
    pub fn release(&self) {
        let prev = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some(c.saturating_sub(1)))
            .unwrap_or(0);
        self.reevaluate.store(true, Ordering::Release);
        debug!("island vote -1 -> {}", prev.saturating_sub(1));
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Consume the re-evaluation flag.
    pub fn take_reevaluate(&self) -> bool {
        self.reevaluate.swap(false, Ordering::AcqRel)
    }
}
