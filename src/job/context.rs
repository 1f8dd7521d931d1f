//! The view a running job has of itself: suspension points, checkpoints,
//! tag scopes and job creation.
//!
//! Every suspension returns `Result<(), Exception>`. After the job is
//! switched back in, a pending asynchronous exception is raised first, then
//! a `Stop` if one of the held tags is blocked; the caller propagates either
//! with `?`.

use std::time::{Duration, Instant};

use super::{Job, JobState};
use crate::coroutine::Switcher;
use crate::error::{CoroutineError, Exception};
use crate::logging::{self, sched_trace};
use crate::scheduler::Scheduler;
use crate::tag::Tag;
use crate::value::Value;

/// Result of running code inside a tag scope.
#[derive(Debug, Clone, PartialEq)]
pub enum TagOutcome<T> {
    /// The body ran to completion.
    Completed(T),
    /// The tag was blocked or stopped; carries the payload.
    Stopped(Value),
}

impl<T> TagOutcome<T> {
    pub fn is_stopped(&self) -> bool {
        matches!(self, TagOutcome::Stopped(_))
    }

    pub fn completed(self) -> Option<T> {
        match self {
            TagOutcome::Completed(value) => Some(value),
            TagOutcome::Stopped(_) => None,
        }
    }
}

/// Pops a tag scope, including when the stack unwinds through it.
struct TagScope {
    job: Job,
    depth: usize,
}

impl Drop for TagScope {
    fn drop(&mut self) {
        self.job.truncate_tags(self.depth);
    }
}

pub struct JobContext<'a> {
    job: Job,
    switcher: &'a Switcher<'a>,
}

impl<'a> JobContext<'a> {
    pub(crate) fn new(job: Job, switcher: &'a Switcher<'a>) -> Self {
        JobContext { job, switcher }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    /// The scheduler running this job.
    pub fn scheduler(&self) -> Scheduler {
        self.job
            .scheduler()
            .expect("JobContext::scheduler: job is running without a live scheduler")
    }

    pub fn now(&self) -> Instant {
        self.scheduler().now()
    }

    /// Checks made before the entry runs.
    pub(crate) fn enter(&mut self) -> Result<(), Exception> {
        self.job.check_for_pending_exception()?;
        self.check_blocked()
    }

    fn switch_back(&mut self) -> Result<(), Exception> {
        sched_trace!("job {} suspends as {}", self.job, self.job.state());
        self.switcher.switch_back();
        self.job.set_state(JobState::Running);
        self.job.check_for_pending_exception()?;
        self.check_blocked()
    }

    // ── Suspension points ──────────────────────────────────────────

    /// Let every other eligible job run, resuming in the next cycle.
    ///
    /// Inside a non-interruptible section this does nothing, unless the job
    /// is frozen.
    pub fn yield_now(&mut self) -> Result<(), Exception> {
        if self.job.non_interruptible() && !self.job.frozen() {
            return Ok(());
        }
        self.job.set_state(JobState::Running);
        self.switch_back()
    }

    /// Sleep until `deadline` has passed on the scheduler's clock.
    pub fn yield_until(&mut self, deadline: Instant) -> Result<(), Exception> {
        if self.job.non_interruptible() {
            return Err(Exception::scheduling(
                "attempt to sleep in non-interruptible code",
            ));
        }
        self.job.sleep_until(deadline);
        let result = self.switch_back();
        self.job.clear_deadline();
        result
    }

    pub fn yield_for(&mut self, duration: Duration) -> Result<(), Exception> {
        let deadline = self.now() + duration;
        self.yield_until(deadline)
    }

    /// Suspend until `other` terminates.
    ///
    /// Joining oneself suspends until an exception is delivered, which is
    /// how barriers and semaphores park their waiters.
    pub fn yield_until_terminated(&mut self, other: &Job) -> Result<(), Exception> {
        let self_join = *other == self.job;
        if self.job.non_interruptible() && !self_join {
            return Err(Exception::scheduling(
                "dependency on another job in non-interruptible code",
            ));
        }
        if other.terminated() {
            return Ok(());
        }
        if !self_join {
            other.add_joiner(&self.job);
        }
        while !other.terminated() {
            self.job.set_state(JobState::Joining);
            if let Err(exception) = self.switch_back() {
                other.remove_joiner(&self.job);
                return Err(exception);
            }
        }
        Ok(())
    }

    /// Suspend until something may have changed: another job ran with side
    /// effects, started or terminated, or the embedder signalled a change.
    pub fn yield_until_things_changed(&mut self) -> Result<(), Exception> {
        if self.job.non_interruptible() && !self.job.frozen() {
            return Err(Exception::scheduling(
                "attempt to wait for a change in non-interruptible code",
            ));
        }
        self.job.set_state(JobState::Waiting);
        self.switch_back()
    }

    // ── Checkpoints ────────────────────────────────────────────────

    /// Raise whatever is due, then wait out any freeze.
    pub fn checkpoint(&mut self) -> Result<(), Exception> {
        self.job.check_for_pending_exception()?;
        self.check_stack_space()?;
        self.check_blocked()?;
        if self.job.frozen() {
            // A frozen job makes no progress, so it does not count as doing
            // work for the scheduler.
            let side_effect_free = self.job.side_effect_free();
            self.job.set_side_effect_free(true);
            let mut result = Ok(());
            while result.is_ok() && self.job.frozen() {
                result = self.yield_now();
            }
            self.job.set_side_effect_free(side_effect_free);
            result?;
        }
        Ok(())
    }

    /// `Stop` aimed at the outermost blocked tag, if any.
    pub fn check_blocked(&self) -> Result<(), Exception> {
        match self.job.blocked_position() {
            Some((depth, payload)) => Err(Exception::Stop {
                depth,
                payload,
                asynchronous: false,
            }),
            None => Ok(()),
        }
    }

    pub fn check_stack_space(&self) -> Result<(), Exception> {
        if self.switcher.stack_margin_low() {
            return Err(Exception::StackExhausted);
        }
        Ok(())
    }

    pub fn stack_margin_low(&self) -> bool {
        self.switcher.stack_margin_low()
    }

    /// Bytes of stack left below the current frame.
    pub fn stack_remaining(&self) -> usize {
        self.switcher.stack_remaining()
    }

    pub fn frozen(&self) -> bool {
        self.job.frozen()
    }

    pub fn blocked(&self) -> bool {
        self.job.blocked()
    }

    pub fn priority(&self) -> u8 {
        self.job.priority()
    }

    // ── Tag scopes ─────────────────────────────────────────────────

    /// Run `body` holding `tag`.
    ///
    /// If the tag is blocked or stopped while the body runs (or is already
    /// blocked on entry), the body unwinds and the scope evaluates to
    /// [`TagOutcome::Stopped`]. Stops aimed at enclosing scopes pass
    /// through.
    pub fn with_tag<T, F>(&mut self, tag: &Tag, body: F) -> Result<TagOutcome<T>, Exception>
    where
        F: FnOnce(&mut Self) -> Result<T, Exception>,
    {
        let depth = self.job.push_tag(tag.clone());
        let scope = TagScope {
            job: self.job.clone(),
            depth,
        };
        let result = self.checkpoint().and_then(|()| body(self));
        let late_stop = self.job.take_stop_at(depth);
        drop(scope);

        match result {
            Ok(value) => Ok(match late_stop {
                Some(payload) => TagOutcome::Stopped(payload),
                None => TagOutcome::Completed(value),
            }),
            Err(Exception::Stop { depth: d, payload, .. }) if d == depth => {
                tracing::debug!(target: logging::TAG, job = %self.job, %tag, "scope stopped");
                Ok(TagOutcome::Stopped(payload))
            }
            Err(exception) => Err(exception),
        }
    }

    /// Stop `tag` everywhere; if this job is affected it unwinds right away.
    pub fn stop(&mut self, tag: &Tag, payload: Value) -> Result<(), Exception> {
        tag.stop(&self.scheduler(), payload);
        self.job.check_for_pending_exception()
    }

    // ── Flags ──────────────────────────────────────────────────────

    pub fn set_non_interruptible(&mut self, non_interruptible: bool) {
        self.job.set_non_interruptible(non_interruptible);
    }

    pub fn set_side_effect_free(&mut self, side_effect_free: bool) {
        self.job.set_side_effect_free(side_effect_free);
    }

    /// Run `body` with `yield_now` disabled, restoring the previous setting
    /// afterwards.
    pub fn non_interruptible<T, F>(&mut self, body: F) -> Result<T, Exception>
    where
        F: FnOnce(&mut Self) -> Result<T, Exception>,
    {
        let previous = self.job.non_interruptible();
        self.job.set_non_interruptible(true);
        let result = body(self);
        self.job.set_non_interruptible(previous);
        result
    }

    // ── Job creation ───────────────────────────────────────────────

    /// Create and register a job inheriting this job's tags and sink.
    pub fn spawn<F>(&self, name: impl Into<String>, entry: F) -> Result<Job, CoroutineError>
    where
        F: FnOnce(&mut JobContext<'_>) -> Result<Value, Exception> + 'static,
    {
        let scheduler = self.scheduler();
        let job = self.job.derive(name).build(&scheduler, entry)?;
        scheduler.add_job(&job);
        Ok(job)
    }

    /// Like [`JobContext::spawn`], but the new job is terminated with this
    /// one and its uncaught errors are rethrown here.
    pub fn spawn_child<F>(&self, name: impl Into<String>, entry: F) -> Result<Job, CoroutineError>
    where
        F: FnOnce(&mut JobContext<'_>) -> Result<Value, Exception> + 'static,
    {
        let scheduler = self.scheduler();
        let job = self.job.derive(name).build(&scheduler, entry)?;
        self.job.adopt(&job);
        scheduler.add_job(&job);
        Ok(job)
    }

    /// Deliver a message through the job's sink.
    pub fn send_message(&self, channel: &str, message: &str) {
        match self.job.sink() {
            Some(sink) => sink.send_message(channel, message),
            None => tracing::info!(target: logging::JOB, job = %self.job, channel, message, "message"),
        }
    }
}
