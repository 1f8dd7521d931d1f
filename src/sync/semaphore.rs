use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use crate::error::Exception;
use crate::job::{Job, JobContext};
use crate::logging;

/// A counting semaphore for jobs.
///
/// The count goes negative while jobs wait: `-n` means `n` waiters.
#[derive(Debug)]
pub struct Semaphore {
    value: Cell<i64>,
    waiters: RefCell<VecDeque<Job>>,
}

impl Semaphore {
    pub fn new(value: i64) -> Self {
        Semaphore {
            value: Cell::new(value),
            waiters: RefCell::new(VecDeque::new()),
        }
    }

    pub fn value(&self) -> i64 {
        self.value.get()
    }

    /// Take one unit, suspending until one is released if none is left.
    ///
    /// If another exception wakes the job first, the unit it was waiting
    /// for is given back before the exception propagates.
    pub fn acquire(&self, cx: &mut JobContext<'_>) -> Result<(), Exception> {
        let value = self.value.get() - 1;
        self.value.set(value);
        if value >= 0 {
            return Ok(());
        }

        let job = cx.job().clone();
        self.waiters.borrow_mut().push_back(job.clone());
        tracing::trace!(target: logging::SYNC, job = %job, value, "semaphore wait");
        match cx.yield_until_terminated(&job) {
            Err(Exception::SemaphoreRelease) => Ok(()),
            Err(exception) => {
                if self.remove(&job) {
                    // Still queued: cancel the wait.
                    self.value.set(self.value.get() + 1);
                } else {
                    // Already handed a unit, which will never be used.
                    self.release();
                }
                Err(exception)
            }
            Ok(()) => unreachable!("job {} observed its own termination", job),
        }
    }

    /// Give one unit back, waking the oldest waiter if there is one.
    ///
    /// Waiters that already have a stop or termination pending stay queued
    /// and cancel their own wait when they unwind.
    pub fn release(&self) {
        self.value.set(self.value.get() + 1);
        let mut waiters = self.waiters.borrow_mut();
        let mut index = 0;
        while self.value.get() <= 0 && index < waiters.len() {
            let job = waiters[index].clone();
            if job.terminated() {
                // A killed waiter never got to cancel its wait.
                waiters.remove(index);
                self.value.set(self.value.get() + 1);
            } else if job.async_throw(Exception::SemaphoreRelease) {
                tracing::trace!(target: logging::SYNC, job = %job, "semaphore handoff");
                waiters.remove(index);
                return;
            } else {
                index += 1;
            }
        }
    }

    /// Run `body` holding one unit, released on every exit path.
    pub fn critical_section<T, F>(&self, cx: &mut JobContext<'_>, body: F) -> Result<T, Exception>
    where
        F: FnOnce(&mut JobContext<'_>) -> Result<T, Exception>,
    {
        self.acquire(cx)?;
        let _release = Release(self);
        body(cx)
    }

    /// Number of jobs waiting for a unit. Killed waiters are not counted.
    pub fn waiters(&self) -> usize {
        self.waiters
            .borrow()
            .iter()
            .filter(|job| !job.terminated())
            .count()
    }

    fn remove(&self, job: &Job) -> bool {
        let mut waiters = self.waiters.borrow_mut();
        let before = waiters.len();
        waiters.retain(|waiter| waiter != job);
        waiters.len() != before
    }
}

/// Releases on drop, so a unit held across a killed job's unwinding is not
/// lost.
struct Release<'a>(&'a Semaphore);

impl Drop for Release<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}
