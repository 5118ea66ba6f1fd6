//! Multiplexed wakeup channel for a container thread.
//!
//! A container owns one [`PollChannel`]. Each wakeup source (command queue,
//! offload completion, the shared intra-container queue, every external port
//! queue) is assigned one bit. Producers raise their bit; the container either
//! polls without blocking or waits until an enabled bit is raised.
//!
//! Disabling a bit hides it from [`PollChannel::poll`] and [`PollChannel::wait`]
//! without losing it: once re-enabled, a bit raised in the meantime is seen.

use crate::error::{ImclError, ImclResult};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct ChannelState {
    allocated: u32,
    enabled: u32,
    raised: u32,
}

#[derive(Debug, Default)]
pub struct PollChannel {
    state: Mutex<ChannelState>,
    ready: Condvar,
}

impl PollChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the lowest free bit. The bit starts enabled and lowered.
    pub fn allocate_bit(&self) -> ImclResult<u32> {
        let mut state = self.state.lock().expect("poll channel mutex poisoned");
        let free = !state.allocated;
        if free == 0 {
            return Err(ImclError::NoChannelBit);
        }
        let bit = 1u32 << free.trailing_zeros();
        state.allocated |= bit;
        state.enabled |= bit;
        state.raised &= !bit;
        Ok(bit)
    }

    /// Return a bit to the free set.
    pub fn release_bit(&self, bit: u32) {
        let mut state = self.state.lock().expect("poll channel mutex poisoned");
        state.allocated &= !bit;
        state.enabled &= !bit;
        state.raised &= !bit;
    }

    pub fn allocated(&self) -> u32 {
        self.state.lock().expect("poll channel mutex poisoned").allocated
    }

    pub fn raise(&self, bits: u32) {
        let mut state = self.state.lock().expect("poll channel mutex poisoned");
        state.raised |= bits & state.allocated;
        if state.raised & state.enabled != 0 {
            self.ready.notify_all();
        }
    }

    pub fn lower(&self, bits: u32) {
        let mut state = self.state.lock().expect("poll channel mutex poisoned");
        state.raised &= !bits;
    }

    pub fn enable(&self, bits: u32) {
        let mut state = self.state.lock().expect("poll channel mutex poisoned");
        state.enabled |= bits & state.allocated;
        if state.raised & state.enabled != 0 {
            self.ready.notify_all();
        }
    }

    pub fn disable(&self, bits: u32) {
        let mut state = self.state.lock().expect("poll channel mutex poisoned");
        state.enabled &= !bits;
    }

    /// True when every bit in `bits` is enabled.
    pub fn is_enabled(&self, bits: u32) -> bool {
        let state = self.state.lock().expect("poll channel mutex poisoned");
        state.enabled & bits == bits
    }

    /// Raised and enabled bits. Never blocks.
    pub fn poll(&self) -> u32 {
        let state = self.state.lock().expect("poll channel mutex poisoned");
        state.raised & state.enabled
    }

    /// Raised bits within `mask`, regardless of enablement. Never blocks.
    pub fn poll_mask(&self, mask: u32) -> u32 {
        let state = self.state.lock().expect("poll channel mutex poisoned");
        state.raised & mask
    }

    /// Block until at least one enabled bit is raised.
    pub fn wait(&self) -> u32 {
        let mut state = self.state.lock().expect("poll channel mutex poisoned");
        while state.raised & state.enabled == 0 {
            state = self.ready.wait(state).expect("poll channel mutex poisoned");
        }
        state.raised & state.enabled
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`, returning 0.
    pub fn wait_timeout(&self, timeout: Duration) -> u32 {
        let state = self.state.lock().expect("poll channel mutex poisoned");
        let (state, _) = self
            .ready
            .wait_timeout_while(state, timeout, |s| s.raised & s.enabled == 0)
            .expect("poll channel mutex poisoned");
        state.raised & state.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_bits_allocated_lowest_first() {
        let channel = PollChannel::new();
        assert_eq!(channel.allocate_bit().unwrap(), 0b001);
        assert_eq!(channel.allocate_bit().unwrap(), 0b010);
        channel.release_bit(0b001);
        assert_eq!(channel.allocate_bit().unwrap(), 0b001);
    }

    #[test]
    fn test_exhausted_bits() {
        let channel = PollChannel::new();
        for _ in 0..32 {
            channel.allocate_bit().unwrap();
        }
        assert!(matches!(channel.allocate_bit(), Err(ImclError::NoChannelBit)));
    }

    #[test]
    fn test_disabled_bit_is_held_until_enabled() {
        let channel = PollChannel::new();
        let bit = channel.allocate_bit().unwrap();
        channel.disable(bit);
        channel.raise(bit);

        assert_eq!(channel.poll(), 0);
        assert_eq!(channel.poll_mask(bit), bit);

        channel.enable(bit);
        assert_eq!(channel.poll(), bit);
    }

    #[test]
    fn test_wait_wakes_on_raise_from_other_thread() {
        let channel = Arc::new(PollChannel::new());
        let bit = channel.allocate_bit().unwrap();

        let producer = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || channel.raise(bit))
        };

        assert_eq!(channel.wait(), bit);
        producer.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_returns_zero_when_idle() {
        let channel = PollChannel::new();
        channel.allocate_bit().unwrap();
        assert_eq!(channel.wait_timeout(Duration::from_millis(5)), 0);
    }
}
