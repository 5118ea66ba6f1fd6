//! Bounded FIFO queue, optionally bound to a [`PollChannel`] bit.

use crate::channel::PollChannel;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Push rejected because the queue is at capacity. Carries the item back.
pub struct QueueFull<T>(pub T);

impl<T> fmt::Debug for QueueFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QueueFull(..)")
    }
}

/// Multi-producer FIFO with a fixed capacity.
///
/// When bound to a channel bit, the bit is raised while the queue holds
/// anything and lowered when it drains empty. Pops never block.
pub struct MsgQueue<T> {
    name: String,
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    signal: Option<(Arc<PollChannel>, u32)>,
}

impl<T> MsgQueue<T> {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            signal: None,
        }
    }

    pub fn with_signal(
        name: impl Into<String>,
        capacity: usize,
        channel: Arc<PollChannel>,
        bit: u32,
    ) -> Self {
        Self {
            signal: Some((channel, bit)),
            ..Self::new(name, capacity)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Channel bit this queue raises, or 0 when unbound.
    pub fn signal_bit(&self) -> u32 {
        self.signal.as_ref().map(|(_, bit)| *bit).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("queue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push_back(&self, item: T) -> Result<(), QueueFull<T>> {
        let mut items = self.items.lock().expect("queue mutex poisoned");
        if items.len() >= self.capacity {
            return Err(QueueFull(item));
        }
        items.push_back(item);
        if let Some((channel, bit)) = &self.signal {
            channel.raise(*bit);
        }
        Ok(())
    }

    pub fn pop_front(&self) -> Option<T> {
        let mut items = self.items.lock().expect("queue mutex poisoned");
        let item = items.pop_front();
        if items.is_empty() {
            if let Some((channel, bit)) = &self.signal {
                channel.lower(*bit);
            }
        }
        item
    }

    /// Evaluate `pred` against the head without removing it.
    pub fn front_matches(&self, pred: impl FnOnce(&T) -> bool) -> bool {
        let items = self.items.lock().expect("queue mutex poisoned");
        items.front().map(pred).unwrap_or(false)
    }

    /// Remove everything, in FIFO order.
    pub fn take_all(&self) -> Vec<T> {
        let mut items = self.items.lock().expect("queue mutex poisoned");
        if let Some((channel, bit)) = &self.signal {
            channel.lower(*bit);
        }
        items.drain(..).collect()
    }
}

impl<T> fmt::Debug for MsgQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgQueue")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("signal_bit", &self.signal_bit())
            .finish()
    }
}
