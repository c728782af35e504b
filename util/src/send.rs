//! Non-blocking send abstraction, grounded on `bip_util::send`.
//!
//! The wire-protocol engine and the disk pipeline both need to hand work to
//! a queue that may refuse it (backpressure, §5) without blocking the
//! caller's thread. `TrySender` captures exactly that shape so the choke
//! scheduler, the per-peer upload queue and the hash-check queue can all be
//! driven through the same interface.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;

/// A sender that either accepts a message or hands it back.
pub trait TrySender<T> {
    /// Attempt to send `data`. Returns `None` on success, `Some(data)` if
    /// the channel is full or closed.
    fn try_send(&self, data: T) -> Option<T>;
}

impl<T> TrySender<T> for SyncSender<T> {
    fn try_send(&self, data: T) -> Option<T> {
        match SyncSender::try_send(self, data) {
            Ok(()) => None,
            Err(err) => Some(err.into_inner()),
        }
    }
}

/// Splits the capacity of a single underlying sender across two independent
/// handles, each with its own bound. Used to give a peer connection's
/// upload-request queue (§5 backpressure) a capacity independent of every
/// other peer sharing the same underlying channel.
pub struct SplitSender<S> {
    send: S,
    count: Arc<AtomicUsize>,
    capacity: usize,
}

impl<S> Clone for SplitSender<S>
where
    S: Clone,
{
    fn clone(&self) -> SplitSender<S> {
        SplitSender {
            send: self.send.clone(),
            count: self.count.clone(),
            capacity: self.capacity,
        }
    }
}

impl<S> SplitSender<S> {
    pub fn new(send: S, capacity: usize) -> SplitSender<S> {
        SplitSender {
            send,
            count: Arc::new(AtomicUsize::new(0)),
            capacity,
        }
    }

    /// Hand out a token that can later report a message as consumed,
    /// freeing a slot in this sender's capacity.
    pub fn sender_ack(&self) -> SplitSenderAck {
        SplitSenderAck { count: self.count.clone() }
    }

    pub fn in_flight(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    fn try_reserve(&self) -> bool {
        let prev = self.count.fetch_add(1, Ordering::SeqCst);
        if prev < self.capacity {
            true
        } else {
            self.count.fetch_sub(1, Ordering::SeqCst);
            false
        }
    }
}

impl<S, T> TrySender<T> for SplitSender<S>
where
    S: TrySender<T>,
{
    fn try_send(&self, data: T) -> Option<T> {
        if self.try_reserve() {
            self.send.try_send(data)
        } else {
            Some(data)
        }
    }
}

/// Returned to a `SplitSender` producer so the consumer side can report
/// messages as drained, freeing capacity for new ones.
pub struct SplitSenderAck {
    count: Arc<AtomicUsize>,
}

impl SplitSenderAck {
    pub fn ack(&self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn positive_send_zero_capacity() {
        let (send, recv) = mpsc::sync_channel(8);
        let split = SplitSender::new(send, 0);

        assert!(split.try_send(()).is_some());
        assert!(recv.try_recv().is_err());
    }

    #[test]
    fn positive_send_one_capacity_then_blocks() {
        let (send, recv) = mpsc::sync_channel(8);
        let split = SplitSender::new(send, 1);

        assert!(split.try_send(1).is_none());
        assert!(split.try_send(2).is_some());
        assert_eq!(recv.try_recv().unwrap(), 1);
    }

    #[test]
    fn positive_ack_frees_capacity() {
        let (send, recv) = mpsc::sync_channel(8);
        let split = SplitSender::new(send, 1);
        let ack = split.sender_ack();

        assert!(split.try_send(1).is_none());
        assert!(split.try_send(2).is_some());

        ack.ack();
        assert!(split.try_send(2).is_none());
        assert_eq!(recv.try_recv().unwrap(), 1);
        assert_eq!(recv.try_recv().unwrap(), 2);
    }
}
