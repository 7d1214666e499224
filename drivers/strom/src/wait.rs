//! # Completion Wait
//!
//! Blocking until a task's outstanding transfers have finished.

use crate::error::{Error, Result};
use crate::sched::WaitMode;
use crate::task::{TaskRegistry, TaskSlot};
use crate::types::TaskId;

impl TaskRegistry {
    /// Wait for task `id` to finish
    ///
    /// Returns the task's first error, consuming its failure record, or
    /// `Ok` if the task is unknown (finished cleanly or already collected).
    /// An interruptible wait that sees a pending signal returns
    /// [`Error::Interrupted`] and leaves the task running.
    pub fn wait(&self, id: TaskId, mode: WaitMode) -> Result<()> {
        let key = id.id();
        let waker = self.scheduler.current();

        loop {
            let ticket = {
                let mut shard = self.shards.lock(key);
                let failure = match shard.slots.get(&key) {
                    Some(TaskSlot::Failed { status, .. }) => Some(*status),
                    Some(TaskSlot::Live { .. }) => None,
                    None => return Ok(()),
                };
                if let Some(status) = failure {
                    shard.slots.remove(&key);
                    return Err(status);
                }
                shard.waitq.prepare(waker.clone())
            };

            if mode == WaitMode::Interruptible && self.scheduler.signal_pending() {
                self.shards.lock(key).waitq.cancel(ticket);
                return Err(Error::Interrupted);
            }

            self.scheduler.sleep(mode);
            self.shards.lock(key).waitq.cancel(ticket);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::task::TaskState;
    use crate::testing::Harness;

    #[test]
    fn test_wait_unknown_task_succeeds() {
        let h = Harness::new();
        let id = TaskId::new(0xdead_0000);
        assert_eq!(h.tasks().wait(id, WaitMode::Interruptible), Ok(()));
    }

    #[test]
    fn test_failure_observed_once() {
        let h = Harness::new();
        let session = h.session();
        let task = h.tasks().create(h.mapping, h.file.clone(), &session).unwrap();
        let id = task.id();
        task.freeze();
        task.put(Some(Error::Io(7)));

        assert_eq!(h.tasks().wait(id, WaitMode::Uninterruptible), Err(Error::Io(7)));
        assert_eq!(h.tasks().wait(id, WaitMode::Uninterruptible), Ok(()));
        assert_eq!(h.tasks().lookup(id), TaskState::Absent);
    }

    #[test]
    fn test_wait_blocks_until_completion() {
        let h = Harness::new();
        let session = h.session();
        let task = h.tasks().create(h.mapping, h.file.clone(), &session).unwrap();
        let id = task.id();
        let transfer = task.get();
        task.freeze();
        task.put(None);

        let waiter = {
            let tasks = h.tasks().clone();
            thread::spawn(move || tasks.wait(id, WaitMode::Uninterruptible))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        transfer.put(Some(Error::Io(4)));
        assert_eq!(waiter.join().unwrap(), Err(Error::Io(4)));
        assert_eq!(h.tasks().counts(), (0, 0));
    }

    #[test]
    fn test_concurrent_waiters_see_error_once() {
        let h = Harness::new();
        let session = h.session();
        let task = h.tasks().create(h.mapping, h.file.clone(), &session).unwrap();
        let id = task.id();
        let transfer = task.get();
        task.freeze();
        task.put(None);

        let waiters: std::vec::Vec<_> = (0..4)
            .map(|_| {
                let tasks = h.tasks().clone();
                thread::spawn(move || tasks.wait(id, WaitMode::Uninterruptible))
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        transfer.put(Some(Error::Io(5)));

        let errors = waiters
            .into_iter()
            .map(|w| w.join().unwrap())
            .filter(|r| r.is_err())
            .count();
        assert_eq!(errors, 1);
    }

    #[test]
    fn test_interruptible_wait_returns_early() {
        let h = Harness::new();
        let session = h.session();
        let task = h.tasks().create(h.mapping, h.file.clone(), &session).unwrap();
        let id = task.id();
        let transfer = task.get();
        task.freeze();
        task.put(None);

        let waiter = {
            let tasks = h.tasks().clone();
            thread::spawn(move || tasks.wait(id, WaitMode::Interruptible))
        };
        thread::sleep(Duration::from_millis(20));
        h.scheduler.interrupt(waiter.thread());
        assert_eq!(waiter.join().unwrap(), Err(Error::Interrupted));

        // the task keeps running in the background
        assert_eq!(h.tasks().lookup(id), TaskState::Running);
        transfer.put(None);
        assert_eq!(h.tasks().wait(id, WaitMode::Interruptible), Ok(()));
    }
}
