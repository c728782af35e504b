//! Component G — Thread base / poll loop (spec.md §4.G), grounded on
//! `torrent::thread_base` and its `event_loop` free function. `mio::Poll`
//! stands in for the original's hand-rolled epoll/kqueue/select adapter
//! (`Poll`/`PollEPoll`/`PollKQueue`/`PollSelect`), and `mio::Waker` replaces
//! the SIGUSR1-based `interrupt()` — a signal handler has no idiomatic Rust
//! equivalent, while `Waker` gives the same "make a blocked `poll()` return
//! early" guarantee through an eventfd/pipe, portably (spec.md §9 decided
//! against hand-rolling the poller itself; the same reasoning extends to
//! the interrupt mechanism).

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Poll, Token, Waker};

use crate::global_lock;
use crate::signal::SignalBitfield;
use crate::timer::TimerQueue;

const FLAG_DO_SHUTDOWN: u32 = 0x1;
const FLAG_DID_SHUTDOWN: u32 = 0x2;
const FLAG_NO_TIMEOUT: u32 = 0x4;
const FLAG_POLLING: u32 = 0x8;
const FLAG_MAIN_THREAD: u32 = 0x10;

/// Reserved token the waker registers under; real I/O sources must use any
/// other token (the registry is otherwise the caller's to manage).
pub const WAKER_TOKEN: Token = Token(usize::MAX);

/// What a thread running the poll loop implements — the Rust analog of
/// `thread_base`'s pure-virtual `call_events`/`next_timeout_usec`.
pub trait ThreadBody: Send {
    fn name(&self) -> &str {
        "tcore-thread"
    }

    /// Run once per loop iteration, outside of holding any I/O readiness
    /// information — the original's `slot_do_work`.
    fn do_work(&mut self) {}

    /// React to readiness events from the last `poll()` call.
    fn call_events(&mut self, poll: &Poll, events: &Events, timers: &mut TimerQueue);

    /// Additional minimum delay to sleep for, folded in with the timer
    /// queue's own `next_timeout` via `min()`.
    fn next_timeout(&mut self) -> Option<Duration> {
        None
    }
}

/// A cross-thread handle used to wake a `Thread`'s blocked `poll()` call
/// and request that one of its registered signals run (spec.md §4.F/§4.G).
#[derive(Clone)]
pub struct ThreadHandle {
    waker: Arc<Waker>,
    flags: Arc<AtomicU32>,
    signal: Arc<SignalBitfield>,
}

impl ThreadHandle {
    pub fn signal_bitfield(&self) -> &SignalBitfield {
        &self.signal
    }

    /// Force the owning thread's next `poll()` to return immediately
    /// (`thread_base::interrupt`).
    pub fn interrupt(&self) {
        self.flags.fetch_or(FLAG_NO_TIMEOUT, Ordering::SeqCst);
        let _ = self.waker.wake();
    }

    /// Flip a signal bit and, by default, interrupt so it runs promptly
    /// (`thread_base::send_event_signal`).
    pub fn send_event_signal(&self, index: usize, interrupt: bool) {
        self.signal.signal(index);
        if interrupt {
            self.interrupt();
        }
    }

    pub fn is_polling(&self) -> bool {
        self.flags.load(Ordering::SeqCst) & FLAG_POLLING != 0
    }

    pub fn request_shutdown(&self) {
        self.flags.fetch_or(FLAG_DO_SHUTDOWN, Ordering::SeqCst);
        self.interrupt();
    }

    pub fn has_shut_down(&self) -> bool {
        self.flags.load(Ordering::SeqCst) & FLAG_DID_SHUTDOWN != 0
    }
}

/// A per-thread event loop: `mio::Poll` plus a timer queue and a signal
/// bitfield, with global-lock handshake hooks for the main thread (spec.md
/// §4.G).
pub struct Thread {
    poll: Poll,
    waker: Arc<Waker>,
    flags: Arc<AtomicU32>,
    signal: Arc<SignalBitfield>,
    timers: TimerQueue,
    name: String,
}

impl Thread {
    pub fn new(name: impl Into<String>, is_main_thread: bool) -> io::Result<Thread> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let flags = Arc::new(AtomicU32::new(if is_main_thread { FLAG_MAIN_THREAD } else { 0 }));

        Ok(Thread { poll, waker, flags, signal: Arc::new(SignalBitfield::new()), timers: TimerQueue::new(), name: name.into() })
    }

    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    pub fn timers(&mut self) -> &mut TimerQueue {
        &mut self.timers
    }

    pub fn handle(&self) -> ThreadHandle {
        ThreadHandle { waker: self.waker.clone(), flags: self.flags.clone(), signal: self.signal.clone() }
    }

    fn is_main_thread(&self) -> bool {
        self.flags.load(Ordering::SeqCst) & FLAG_MAIN_THREAD != 0
    }

    /// Run the event loop until `ThreadHandle::request_shutdown` is called.
    /// Mirrors `thread_base::event_loop`: work + events + signals are
    /// processed twice per iteration (once before computing the timeout,
    /// once after, so events raised while doing work aren't missed before
    /// sleeping), then `poll()` blocks for at most the shorter of the timer
    /// queue's next deadline and the body's own `next_timeout`.
    pub fn run(mut self, mut body: impl ThreadBody) -> io::Result<()> {
        log::info!("{}: starting thread", body.name());

        let mut events = Events::with_capacity(1024);

        loop {
            if self.flags.load(Ordering::SeqCst) & FLAG_DO_SHUTDOWN != 0 {
                break;
            }

            body.do_work();
            body.call_events(&self.poll, &events, &mut self.timers);
            self.signal.work();

            body.do_work();
            body.call_events(&self.poll, &events, &mut self.timers);
            self.signal.work();

            self.flags.fetch_or(FLAG_POLLING, Ordering::SeqCst);

            let no_timeout = self.flags.load(Ordering::SeqCst) & FLAG_NO_TIMEOUT != 0;
            let timeout = if no_timeout {
                Some(Duration::from_secs(0))
            } else {
                let from_queue = self.timers.next_timeout(Instant::now());
                let from_body = body.next_timeout();
                match (from_queue, from_body) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                }
            };

            if self.is_main_thread() {
                global_lock::entering_main_polling();
            }

            self.poll.poll(&mut events, timeout)?;

            if self.is_main_thread() {
                global_lock::leaving_main_polling();
            }

            self.flags.fetch_and(!(FLAG_POLLING | FLAG_NO_TIMEOUT), Ordering::SeqCst);
        }

        self.flags.fetch_or(FLAG_DID_SHUTDOWN, Ordering::SeqCst);
        log::info!("{}: thread shut down", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread as std_thread;

    struct CountingBody {
        iterations: Arc<AtomicUsize>,
    }

    impl ThreadBody for CountingBody {
        fn call_events(&mut self, _poll: &Poll, _events: &Events, _timers: &mut TimerQueue) {
            self.iterations.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn positive_interrupt_unblocks_a_waiting_poll() {
        let thread = Thread::new("test", false).unwrap();
        let handle = thread.handle();
        let iterations = Arc::new(AtomicUsize::new(0));
        let body = CountingBody { iterations: iterations.clone() };

        let worker = std_thread::spawn(move || thread.run(body));

        std_thread::sleep(Duration::from_millis(20));
        handle.interrupt();
        std_thread::sleep(Duration::from_millis(20));
        handle.request_shutdown();

        worker.join().unwrap().unwrap();
        assert!(iterations.load(Ordering::SeqCst) > 0);
        assert!(handle.has_shut_down());
    }

    #[test]
    fn positive_send_event_signal_runs_registered_slot() {
        let thread = Thread::new("test", false).unwrap();
        let handle = thread.handle();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let index = handle.signal_bitfield().add_signal(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let body = CountingBody { iterations: Arc::new(AtomicUsize::new(0)) };
        let worker = std_thread::spawn(move || thread.run(body));

        handle.send_event_signal(index, true);
        std_thread::sleep(Duration::from_millis(20));
        handle.request_shutdown();
        worker.join().unwrap().unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
