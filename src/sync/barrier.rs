use std::cell::RefCell;
use std::collections::VecDeque;

use crate::error::Exception;
use crate::job::{Job, JobContext};
use crate::logging;
use crate::value::Value;

/// Jobs wait until signalled, receiving the signal's payload.
#[derive(Debug, Default)]
pub struct Barrier {
    waiters: RefCell<VecDeque<Job>>,
}

impl Barrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspend until [`signal`](Barrier::signal)led; returns the payload.
    pub fn wait(&self, cx: &mut JobContext<'_>) -> Result<Value, Exception> {
        let job = cx.job().clone();
        self.waiters.borrow_mut().push_back(job.clone());
        tracing::trace!(target: logging::SYNC, job = %job, "barrier wait");
        match cx.yield_until_terminated(&job) {
            Err(Exception::BarrierWake(payload)) => Ok(payload),
            Err(exception) => {
                self.remove(&job);
                Err(exception)
            }
            Ok(()) => unreachable!("job {} observed its own termination", job),
        }
    }

    /// Wake the oldest waiter. Returns the number of jobs woken.
    ///
    /// A waiter that already has a stop or termination pending is on its
    /// way out; it is dropped from the queue and the next one is tried.
    pub fn signal(&self, payload: Value) -> usize {
        while let Some(job) = self.pop_live_waiter() {
            if job.async_throw(Exception::BarrierWake(payload.clone())) {
                tracing::trace!(target: logging::SYNC, job = %job, %payload, "barrier signal");
                return 1;
            }
            tracing::trace!(target: logging::SYNC, job = %job, "barrier waiter already unwinding");
        }
        0
    }

    /// Wake every waiter. Returns the number of jobs woken.
    pub fn signal_all(&self, payload: Value) -> usize {
        let waiters = std::mem::take(&mut *self.waiters.borrow_mut());
        let woken = waiters
            .into_iter()
            .filter(|job| !job.terminated())
            .filter(|job| job.async_throw(Exception::BarrierWake(payload.clone())))
            .count();
        tracing::trace!(target: logging::SYNC, woken, %payload, "barrier signal_all");
        woken
    }

    /// Number of jobs currently waiting.
    pub fn waiters(&self) -> usize {
        self.waiters
            .borrow()
            .iter()
            .filter(|job| !job.terminated())
            .count()
    }

    /// Killed jobs never got to remove themselves; skip them.
    fn pop_live_waiter(&self) -> Option<Job> {
        let mut waiters = self.waiters.borrow_mut();
        while let Some(job) = waiters.pop_front() {
            if !job.terminated() {
                return Some(job);
            }
        }
        None
    }

    fn remove(&self, job: &Job) {
        self.waiters.borrow_mut().retain(|waiter| waiter != job);
    }
}
