//! The cooperative scheduler.
//!
//! One call to [`Scheduler::work`] is one cycle:
//! 1. Take the whole run queue as this cycle's pending set, leaving the run
//!    queue empty
//! 2. Take the list of jobs registered since the last cycle and start each
//!    one; those still alive are set aside to join the back of the run
//!    queue once the pass is over
//! 3. Pop pending jobs in order. Zombies are dropped. Eligible jobs are
//!    resumed; every survivor goes back on the run queue, so relative order
//!    is preserved whether or not a job ran
//! 4. Append the jobs started in step 2 and work out when the next cycle is
//!    needed
//!
//! Jobs registered during a cycle are started in the next one. Jobs killed
//! during a cycle are taken off every queue immediately, so a job killed
//! before its turn never runs.
//!
//! A job is eligible when it has a pending exception, holds a blocked tag,
//! is `Running`, is `Sleeping` past its deadline (pushed back by the time
//! it spent frozen), or is `Waiting` and something changed since the last
//! cycle.

mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Instant;

use rustc_hash::FxHashMap;

use crate::coroutine::Switch;
use crate::error::{CoroutineError, Exception};
use crate::job::{Job, JobContext, JobId, JobState};
use crate::logging::{self, sched_trace};
use crate::tag::Tag;
use crate::value::Value;

/// When the embedder should call [`Scheduler::work`] again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextWake {
    /// Some job can make progress right away.
    Now,
    /// Nothing to do before this instant.
    At(Instant),
    /// Nothing to do until something external happens.
    Idle,
}

pub(crate) struct SchedulerState {
    clock: Rc<dyn Clock>,
    to_start: RefCell<Vec<Job>>,
    jobs: RefCell<VecDeque<Job>>,
    /// This cycle's snapshot of the run queue, consumed front to back.
    pending: RefCell<VecDeque<Job>>,
    current: RefCell<Option<Job>>,
    live: RefCell<FxHashMap<JobId, Job>>,
    world_changed: Cell<bool>,
    cycle: Cell<u64>,
    next_id: Cell<u64>,
}

/// Cheap, clonable handle to a scheduler. The last handle dropped kills
/// every remaining job.
#[derive(Clone)]
pub struct Scheduler {
    state: Rc<SchedulerState>,
}

/// Clears the current job even when a resumption panics.
struct CurrentGuard<'a>(&'a RefCell<Option<Job>>);

impl Drop for CurrentGuard<'_> {
    fn drop(&mut self) {
        self.0.borrow_mut().take();
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_clock(Rc::new(SystemClock))
    }

    pub fn with_clock(clock: Rc<dyn Clock>) -> Self {
        Scheduler {
            state: Rc::new(SchedulerState {
                clock,
                to_start: RefCell::new(Vec::new()),
                jobs: RefCell::new(VecDeque::new()),
                pending: RefCell::new(VecDeque::new()),
                current: RefCell::new(None),
                live: RefCell::new(FxHashMap::default()),
                world_changed: Cell::new(false),
                cycle: Cell::new(0),
                next_id: Cell::new(1),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<SchedulerState> {
        Rc::downgrade(&self.state)
    }

    pub(crate) fn from_weak(weak: &Weak<SchedulerState>) -> Option<Scheduler> {
        weak.upgrade().map(|state| Scheduler { state })
    }

    pub(crate) fn next_job_id(&self) -> JobId {
        let id = self.state.next_id.get();
        self.state.next_id.set(id + 1);
        JobId(id)
    }

    pub fn now(&self) -> Instant {
        self.state.clock.now()
    }

    /// Number of cycles run so far.
    pub fn cycle(&self) -> u64 {
        self.state.cycle.get()
    }

    /// Jobs registered and not yet terminated.
    pub fn job_count(&self) -> usize {
        self.state.live.borrow().len()
    }

    pub fn find_job(&self, id: JobId) -> Option<Job> {
        self.state.live.borrow().get(&id).cloned()
    }

    /// All registered jobs, oldest first.
    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.state.live.borrow().values().cloned().collect();
        jobs.sort_by_key(Job::id);
        jobs
    }

    /// The job executing right now, if called from inside one.
    pub fn current_job(&self) -> Option<Job> {
        self.state.current.borrow().clone()
    }

    pub fn is_current(&self, job: &Job) -> bool {
        self.state.current.borrow().as_ref() == Some(job)
    }

    /// Wake jobs waiting in `yield_until_things_changed` at the next cycle.
    pub fn signal_world_change(&self) {
        self.state.world_changed.set(true);
    }

    // ── Registration ───────────────────────────────────────────────

    /// Queue `job` to be started at the next cycle.
    ///
    /// # Panics
    ///
    /// Panics if the job is already registered, was built for another
    /// scheduler, or has terminated.
    pub fn add_job(&self, job: &Job) {
        assert!(
            job.belongs_to(&self.downgrade()),
            "Scheduler::add_job: job {} was built for another scheduler",
            job
        );
        assert!(
            !job.terminated(),
            "Scheduler::add_job: job {} has already terminated",
            job
        );
        let previous = self.state.live.borrow_mut().insert(job.id(), job.clone());
        assert!(
            previous.is_none(),
            "Scheduler::add_job: job {} is already registered",
            job
        );
        tracing::debug!(target: logging::SCHEDULER, job = %job, "job registered");
        self.state.to_start.borrow_mut().push(job.clone());
    }

    /// Build a job with default settings and register it.
    pub fn spawn<F>(&self, name: impl Into<String>, entry: F) -> Result<Job, CoroutineError>
    where
        F: FnOnce(&mut JobContext<'_>) -> Result<Value, Exception> + 'static,
    {
        let job = Job::builder(name).build(self, entry)?;
        self.add_job(&job);
        Ok(job)
    }

    // ── The cycle ──────────────────────────────────────────────────

    /// Run one scheduling cycle.
    ///
    /// # Panics
    ///
    /// Called from inside a job, or when a job panics.
    pub fn work(&self) -> NextWake {
        let state = &*self.state;
        assert!(
            state.current.borrow().is_none(),
            "Scheduler::work: called from inside a job"
        );
        let cycle = state.cycle.get() + 1;
        state.cycle.set(cycle);
        let now = state.clock.now();
        let mut world_changed = state.world_changed.replace(false);

        // 1. Snapshot the run queue.
        {
            let mut jobs = state.jobs.borrow_mut();
            let mut pending = state.pending.borrow_mut();
            debug_assert!(pending.is_empty());
            std::mem::swap(&mut *jobs, &mut *pending);
        }

        // 2. Start new jobs. They run once now and are not visited again
        // before the next cycle.
        let to_start = std::mem::take(&mut *state.to_start.borrow_mut());
        sched_trace!(
            "cycle {}: {} to start, {} pending",
            cycle,
            to_start.len(),
            state.pending.borrow().len()
        );
        if !to_start.is_empty() {
            world_changed = true;
        }
        let mut started = Vec::with_capacity(to_start.len());
        for job in to_start {
            if !job.terminated() {
                self.resume(&job);
                if !job.terminated() && !job.side_effect_free() {
                    self.signal_world_change();
                }
            }
            if job.terminated() {
                self.forget(&job);
            } else {
                started.push(job);
            }
        }

        // 3. Resume eligible jobs in order.
        loop {
            let Some(job) = state.pending.borrow_mut().pop_front() else {
                break;
            };
            if !job.terminated() && self.eligible(&job, now, world_changed) {
                self.resume(&job);
                if !job.terminated()
                    && job.state() != JobState::Waiting
                    && !job.side_effect_free()
                {
                    self.signal_world_change();
                }
            }
            self.requeue(job);
        }

        // 4. New jobs queue behind the existing ones.
        for job in started {
            self.requeue(job);
        }
        let next = self.next_wake(now);
        sched_trace!("cycle {} done, next wake {:?}", cycle, next);
        next
    }

    fn eligible(&self, job: &Job, now: Instant, world_changed: bool) -> bool {
        if job.has_pending_exception() || job.blocked() {
            return true;
        }
        match job.state() {
            JobState::Running => true,
            JobState::Sleeping => {
                if job.frozen() {
                    job.notice_frozen(now);
                    false
                } else {
                    job.notice_not_frozen(now);
                    job.deadline().map_or(true, |deadline| deadline <= now)
                }
            }
            JobState::Waiting => world_changed,
            JobState::Joining | JobState::ToStart | JobState::Zombie => false,
        }
    }

    fn resume(&self, job: &Job) {
        let mut coroutine = job.take_coroutine();
        *self.state.current.borrow_mut() = Some(job.clone());
        let switch = {
            let _current = CurrentGuard(&self.state.current);
            if coroutine.started() {
                coroutine.switch_to()
            } else {
                coroutine.start()
            }
        };
        match switch {
            Switch::Suspended => job.put_coroutine(coroutine),
            Switch::Finished => debug_assert!(job.terminated()),
        }
    }

    fn forget(&self, job: &Job) {
        self.state.live.borrow_mut().remove(&job.id());
    }

    /// Survivors go to the back of the run queue; the dead are forgotten.
    fn requeue(&self, job: Job) {
        if job.terminated() {
            self.forget(&job);
        } else {
            self.state.jobs.borrow_mut().push_back(job);
        }
    }

    fn next_wake(&self, now: Instant) -> NextWake {
        let state = &*self.state;
        if !state.to_start.borrow().is_empty() {
            return NextWake::Now;
        }
        let world_changed = state.world_changed.get();
        let mut earliest: Option<Instant> = None;
        for job in state.jobs.borrow().iter() {
            if job.has_pending_exception() || job.blocked() {
                return NextWake::Now;
            }
            match job.state() {
                JobState::Running if world_changed || !job.side_effect_free() => {
                    return NextWake::Now
                }
                JobState::Waiting if world_changed => return NextWake::Now,
                JobState::Sleeping if !job.frozen() => {
                    if let Some(deadline) = job.deadline() {
                        earliest = Some(earliest.map_or(deadline, |e| e.min(deadline)));
                    }
                }
                _ => {}
            }
        }
        match earliest {
            Some(deadline) if deadline <= now => NextWake::Now,
            Some(deadline) => NextWake::At(deadline),
            None => NextWake::Idle,
        }
    }

    // ── Termination ────────────────────────────────────────────────

    /// Terminate `job` immediately, from outside it.
    ///
    /// The job's stack is unwound, its children are asked to terminate and
    /// its joiners are woken.
    ///
    /// # Panics
    ///
    /// Panics if the job is not registered here or is the one running.
    pub fn kill_job(&self, job: &Job) {
        assert!(
            self.state.live.borrow().contains_key(&job.id()),
            "Scheduler::kill_job: unknown job {}",
            job
        );
        assert!(
            !self.is_current(job),
            "Scheduler::kill_job: job {} cannot kill itself",
            job
        );
        self.unschedule(job);
        job.kill();
    }

    /// Kill every job except the one running.
    pub fn killall_jobs(&self) {
        tracing::debug!(target: logging::SCHEDULER, jobs = self.job_count(), "killing all jobs");
        for job in self.jobs() {
            if !self.is_current(&job) && !job.terminated() {
                self.kill_job(&job);
            }
        }
    }

    fn unschedule(&self, job: &Job) {
        let state = &*self.state;
        state.to_start.borrow_mut().retain(|j| j != job);
        state.jobs.borrow_mut().retain(|j| j != job);
        state.pending.borrow_mut().retain(|j| j != job);
        state.live.borrow_mut().remove(&job.id());
    }

    /// Deliver a stop of `tag` to every job this scheduler knows.
    pub(crate) fn signal_stop(&self, tag: &Tag, payload: &Value) {
        for job in self.jobs() {
            job.register_stopped_tag(tag, payload);
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("cycle", &self.cycle())
            .field("jobs", &self.job_count())
            .field("current", &self.current_job().map(|j| j.to_string()))
            .finish()
    }
}

impl Drop for SchedulerState {
    fn drop(&mut self) {
        let mut jobs: Vec<Job> = self.live.get_mut().drain().map(|(_, job)| job).collect();
        if jobs.is_empty() {
            return;
        }
        jobs.sort_by_key(Job::id);
        tracing::debug!(target: logging::SCHEDULER, jobs = jobs.len(), "scheduler dropped, killing jobs");
        self.to_start.get_mut().clear();
        self.jobs.get_mut().clear();
        self.pending.get_mut().clear();
        for job in jobs {
            job.kill();
        }
    }
}
