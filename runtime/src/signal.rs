//! Component F — Signal bitfield (spec.md §3/§4.F), grounded on
//! `src/torrent/utils/signal_bitfield.{h,cc}`: a thread registers up to 32
//! closures ahead of time, any other thread flips a bit to request one run,
//! and the owning thread's poll loop drains the set bits between polls.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

/// Upper bound on slots a single `SignalBitfield` can hold, matching the
/// width of its backing atomic word.
pub const MAX_SIGNALS: usize = 32;

type Slot = Box<dyn Fn() + Send>;

/// Lock-free doorbell: any thread can call `signal(index)` to request that
/// the owning thread's next `work()` call run the slot registered at
/// `index`. Registration itself (`add_signal`) is expected to happen once,
/// up front, on the owning thread.
pub struct SignalBitfield {
    slots: Mutex<Vec<Slot>>,
    pending: AtomicU32,
}

impl SignalBitfield {
    pub fn new() -> SignalBitfield {
        SignalBitfield { slots: Mutex::new(Vec::new()), pending: AtomicU32::new(0) }
    }

    /// Register a slot, returning the bit index to `signal()` later. Panics
    /// past `MAX_SIGNALS` registrations, mirroring the original's fixed
    /// `m_slots[max_size]` array.
    pub fn add_signal(&self, slot: Slot) -> usize {
        let mut slots = self.slots.lock();
        assert!(slots.len() < MAX_SIGNALS, "signal bitfield is full");
        slots.push(slot);
        slots.len() - 1
    }

    pub fn has_signal(&self, index: usize) -> bool {
        self.pending.load(Ordering::Acquire) & (1 << index) != 0
    }

    /// Request that the slot at `index` run on the next `work()` call.
    /// Safe to call from any thread.
    pub fn signal(&self, index: usize) {
        self.pending.fetch_or(1 << index, Ordering::AcqRel);
    }

    /// Drain every pending bit, running each registered slot at most once.
    /// Called from the owning thread's poll loop.
    pub fn work(&self) {
        let pending = self.pending.swap(0, Ordering::AcqRel);
        if pending == 0 {
            return;
        }

        let slots = self.slots.lock();
        for (index, slot) in slots.iter().enumerate() {
            if pending & (1 << index) != 0 {
                slot();
            }
        }
    }
}

impl Default for SignalBitfield {
    fn default() -> SignalBitfield {
        SignalBitfield::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn positive_signal_then_work_runs_slot_once() {
        let bitfield = SignalBitfield::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let index = bitfield.add_signal(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        bitfield.signal(index);
        assert!(bitfield.has_signal(index));

        bitfield.work();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!bitfield.has_signal(index));

        bitfield.work();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn positive_work_with_nothing_pending_is_a_no_op() {
        let bitfield = SignalBitfield::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        bitfield.add_signal(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        bitfield.work();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    #[should_panic(expected = "signal bitfield is full")]
    fn negative_registering_past_capacity_panics() {
        let bitfield = SignalBitfield::new();
        for _ in 0..MAX_SIGNALS {
            bitfield.add_signal(Box::new(|| {}));
        }
        bitfield.add_signal(Box::new(|| {}));
    }
}
