//! Bounded draining and the "retrieve mine" sweep.

use crate::error::ImclResult;
use crate::ids::PortKey;
use crate::message::CtrlMsg;
use crate::queue::{MsgQueue, QueueFull};
use tracing::warn;

/// What one bounded drain did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub handled: u32,
    pub failed: u32,
    /// The cap was hit with messages still queued.
    pub limit_reached: bool,
}

impl DrainReport {
    pub fn merge(&mut self, other: DrainReport) {
        self.handled += other.handled;
        self.failed += other.failed;
        self.limit_reached |= other.limit_reached;
    }
}

/// Pop and handle up to `limit` items. A failing item is logged and counted;
/// the drain goes on.
pub fn drain_bounded<T>(
    queue: &MsgQueue<T>,
    limit: u32,
    mut handle: impl FnMut(T) -> ImclResult<()>,
) -> DrainReport {
    let mut report = DrainReport::default();
    while report.handled + report.failed < limit {
        let Some(item) = queue.pop_front() else {
            return report;
        };
        match handle(item) {
            Ok(()) => report.handled += 1,
            Err(e) => {
                warn!("{}: dropping message: {}", queue.name(), e);
                report.failed += 1;
            }
        }
    }
    report.limit_reached = !queue.is_empty();
    report
}

/// Return every message on `queue` sent by or addressed to `port`, keeping the
/// relative order of everything else.
///
/// Messages that stay are rotated to the back. The first of them marks where
/// the sweep began; when it reaches the head again every message has been
/// looked at exactly once.
pub fn retrieve_mine(queue: &MsgQueue<CtrlMsg>, port: PortKey) -> usize {
    let mut first_kept: Option<u64> = None;
    let mut returned = 0;

    while let Some(msg) = queue.pop_front() {
        if msg.involves(port) {
            drop(msg);
            returned += 1;
        } else {
            let id = msg.id();
            if let Err(QueueFull(msg)) = queue.push_back(msg) {
                warn!("{}: no room to requeue message {}, returning it", queue.name(), msg.id());
            } else {
                first_kept.get_or_insert(id);
            }
        }

        if let Some(sentinel) = first_kept {
            if queue.front_matches(|m| m.id() == sentinel) {
                break;
            }
        }
    }

    returned
}
