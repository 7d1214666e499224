//! # Scheduler Hook
//!
//! The subsystem never implements a scheduler of its own. Blocking goes
//! through [`Scheduler`], which the embedding kernel backs with its notion
//! of the current thread, `schedule()` and signal delivery.
//!
//! Sleeps may end spuriously. Every caller re-checks its condition in a
//! loop, so an implementation is free to return early.

use core::task::Waker;

// =============================================================================
// WAIT MODE
// =============================================================================

/// How a blocked caller reacts to pending signals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Return [`Error::Interrupted`](crate::Error::Interrupted) when a signal is pending
    Interruptible,
    /// Ignore signals until the condition holds
    Uninterruptible,
}

// =============================================================================
// SCHEDULER TRAIT
// =============================================================================

/// Blocking primitives of the host kernel
pub trait Scheduler: Send + Sync {
    /// Waker that makes the calling thread runnable again
    fn current(&self) -> Waker;

    /// Block the calling thread until woken
    ///
    /// A wake delivered between [`current`](Self::current) and `sleep` must
    /// not be lost.
    fn sleep(&self, mode: WaitMode);

    /// Whether the calling thread has a signal pending
    fn signal_pending(&self) -> bool;
}

// =============================================================================
// THREAD-BACKED SCHEDULER
// =============================================================================

#[cfg(any(test, feature = "std"))]
pub use self::thread::ThreadScheduler;

#[cfg(any(test, feature = "std"))]
mod thread {
    use alloc::sync::Arc;
    use core::task::Waker;
    use std::task::Wake;
    use std::thread::{self, Thread, ThreadId};

    use hashbrown::HashSet;
    use spin::Mutex;

    use super::{Scheduler, WaitMode};

    struct ThreadWaker(Thread);

    impl Wake for ThreadWaker {
        fn wake(self: Arc<Self>) {
            self.0.unpark();
        }

        fn wake_by_ref(self: &Arc<Self>) {
            self.0.unpark();
        }
    }

    /// Scheduler backed by `std::thread` park/unpark
    ///
    /// The park token makes a wake that races ahead of the sleep stick.
    /// Signals are simulated with [`interrupt`](Self::interrupt).
    #[derive(Debug, Default)]
    pub struct ThreadScheduler {
        signalled: Mutex<HashSet<ThreadId>>,
    }

    impl ThreadScheduler {
        /// Create a scheduler with no pending signals
        pub fn new() -> Self {
            Self::default()
        }

        /// Post a signal to `thread` and kick it out of any sleep
        pub fn interrupt(&self, thread: &Thread) {
            self.signalled.lock().insert(thread.id());
            thread.unpark();
        }
    }

    impl Scheduler for ThreadScheduler {
        fn current(&self) -> Waker {
            Waker::from(Arc::new(ThreadWaker(thread::current())))
        }

        fn sleep(&self, _mode: WaitMode) {
            thread::park();
        }

        fn signal_pending(&self) -> bool {
            self.signalled.lock().remove(&thread::current().id())
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_wake_before_sleep_is_not_lost() {
        let sched = ThreadScheduler::new();
        let waker = sched.current();
        waker.wake();
        // consumes the park token set above
        sched.sleep(WaitMode::Uninterruptible);
    }

    #[test]
    fn test_interrupt_is_consumed_once() {
        let sched = Arc::new(ThreadScheduler::new());
        assert!(!sched.signal_pending());

        sched.interrupt(&thread::current());
        assert!(sched.signal_pending());
        assert!(!sched.signal_pending());
    }

    #[test]
    fn test_cross_thread_wake() {
        let sched = Arc::new(ThreadScheduler::new());
        let waker = sched.current();
        let handle = thread::spawn(move || waker.wake());
        sched.sleep(WaitMode::Interruptible);
        handle.join().unwrap();
    }
}
