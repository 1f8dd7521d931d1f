//! Jobs: schedulable units of work, each on its own coroutine.
//!
//! A job's life is a small state machine:
//!
//! ```text
//!  ToStart ──start──▶ Running ◀──────────────┐
//!                       │  yield_now          │ wake-up (deadline, joinee
//!                       ├─ yield_until ─▶ Sleeping     termination, world
//!                       ├─ ..._terminated ▶ Joining    change, exception,
//!                       ├─ ..._things_changed ▶ Waiting  blocked tag)
//!                       ▼
//!                    Zombie  (completed, failed, stopped or killed)
//! ```
//!
//! The code running inside a job only ever sees a [`JobContext`]; everyone
//! else holds a [`Job`] handle. Asynchronous requests (termination, stops,
//! barrier and semaphore wake-ups) are parked in the job's pending slot and
//! raised when the job next resumes, before any of its own code runs.

mod context;

pub use context::{JobContext, TagOutcome};

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use smallvec::SmallVec;

use crate::config::{self, StackConfig};
use crate::coroutine::{Coroutine, Switcher};
use crate::error::{CoroutineError, Exception};
use crate::logging;
use crate::scheduler::{Scheduler, SchedulerState};
use crate::sink::JobSink;
use crate::tag::Tag;
use crate::value::Value;

pub(crate) type TagStack = SmallVec<[Tag; 4]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub(crate) u64);

impl JobId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Registered, coroutine not started yet.
    ToStart,
    /// Eligible to run at the next opportunity.
    Running,
    /// Waiting for a deadline.
    Sleeping,
    /// Waiting for any change in the world.
    Waiting,
    /// Waiting for another job to terminate.
    Joining,
    /// Terminated; will never run again.
    Zombie,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::ToStart => "to-start",
            JobState::Running => "running",
            JobState::Sleeping => "sleeping",
            JobState::Waiting => "waiting",
            JobState::Joining => "joining",
            JobState::Zombie => "zombie",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// The entry returned a value.
    Completed(Value),
    /// An inherited tag was blocked or stopped.
    Stopped(Value),
    /// Terminated cooperatively or killed by the scheduler.
    Killed,
    /// Died with an uncaught error.
    Failed(Exception),
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Completed(value) => write!(f, "completed: {}", value),
            JobOutcome::Stopped(payload) => write!(f, "stopped: {}", payload),
            JobOutcome::Killed => write!(f, "killed"),
            JobOutcome::Failed(error) => write!(f, "failed: {}", error),
        }
    }
}

struct JobInner {
    id: JobId,
    name: String,
    scheduler: Weak<SchedulerState>,
    state: Cell<JobState>,
    /// `None` while the job is executing, and once it is released.
    coroutine: RefCell<Option<Coroutine>>,
    stack_config: StackConfig,
    tags: RefCell<TagStack>,
    /// Tags received at creation; they sit below every scope the job opens.
    inherited_tags: usize,
    pending: RefCell<Option<Exception>>,
    deadline: Cell<Option<Instant>>,
    frozen_since: Cell<Option<Instant>>,
    time_shift: Cell<Duration>,
    side_effect_free: Cell<bool>,
    non_interruptible: Cell<bool>,
    to_wake_up: RefCell<Vec<Weak<JobInner>>>,
    parent: RefCell<Weak<JobInner>>,
    children: RefCell<Vec<Job>>,
    sink: Option<Rc<dyn JobSink>>,
    outcome: RefCell<Option<JobOutcome>>,
}

/// Shared handle to a job. Equality is identity.
#[derive(Clone)]
pub struct Job(Rc<JobInner>);

/// Configures and creates a [`Job`].
pub struct JobBuilder {
    name: String,
    stack_size: usize,
    stack_config: Option<StackConfig>,
    tags: TagStack,
    sink: Option<Rc<dyn JobSink>>,
    side_effect_free: bool,
}

impl JobBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        JobBuilder {
            name: name.into(),
            stack_size: 0,
            stack_config: None,
            tags: TagStack::new(),
            sink: None,
            side_effect_free: false,
        }
    }

    /// Stack size in bytes; 0 (the default) uses the configured default.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Use `config` instead of the process-wide stack configuration.
    pub fn stack_config(mut self, config: StackConfig) -> Self {
        self.stack_config = Some(config);
        self
    }

    /// Tags the job starts out holding, outermost first.
    pub fn tags(mut self, tags: impl IntoIterator<Item = Tag>) -> Self {
        self.tags.extend(tags);
        self
    }

    pub fn sink(mut self, sink: Rc<dyn JobSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn side_effect_free(mut self, side_effect_free: bool) -> Self {
        self.side_effect_free = side_effect_free;
        self
    }

    /// Create the job. It does not run until registered with
    /// [`Scheduler::add_job`].
    pub fn build<F>(self, scheduler: &Scheduler, entry: F) -> Result<Job, CoroutineError>
    where
        F: FnOnce(&mut JobContext<'_>) -> Result<Value, Exception> + 'static,
    {
        let stack_config = self.stack_config.unwrap_or_else(config::stack_config);
        let inherited_tags = self.tags.len();
        let job = Job(Rc::new(JobInner {
            id: scheduler.next_job_id(),
            name: self.name,
            scheduler: scheduler.downgrade(),
            state: Cell::new(JobState::ToStart),
            coroutine: RefCell::new(None),
            stack_config,
            tags: RefCell::new(self.tags),
            inherited_tags,
            pending: RefCell::new(None),
            deadline: Cell::new(None),
            frozen_since: Cell::new(None),
            time_shift: Cell::new(Duration::ZERO),
            side_effect_free: Cell::new(self.side_effect_free),
            non_interruptible: Cell::new(false),
            to_wake_up: RefCell::new(Vec::new()),
            parent: RefCell::new(Weak::new()),
            children: RefCell::new(Vec::new()),
            sink: self.sink,
            outcome: RefCell::new(None),
        }));

        // The coroutine only holds a weak reference until it starts.
        let weak = Rc::downgrade(&job.0);
        let coroutine = Coroutine::with_config(self.stack_size, stack_config, move |switcher| {
            if let Some(inner) = weak.upgrade() {
                Job(inner).run(switcher, entry);
            }
        })?;
        *job.0.coroutine.borrow_mut() = Some(coroutine);
        Ok(job)
    }
}

impl Job {
    pub fn builder(name: impl Into<String>) -> JobBuilder {
        JobBuilder::new(name)
    }

    /// A builder for a job created by this one: same tags, sink and stack
    /// configuration.
    pub(crate) fn derive(&self, name: impl Into<String>) -> JobBuilder {
        let mut builder = JobBuilder::new(name)
            .tags(self.tags())
            .stack_config(self.0.stack_config);
        builder.sink = self.0.sink.clone();
        builder
    }

    // ----------------------------------------------------------------
    // Accessors
    // ----------------------------------------------------------------

    pub fn id(&self) -> JobId {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn state(&self) -> JobState {
        self.0.state.get()
    }

    pub(crate) fn set_state(&self, state: JobState) {
        self.0.state.set(state);
    }

    pub fn terminated(&self) -> bool {
        self.state() == JobState::Zombie
    }

    /// How the job ended, once it has.
    pub fn outcome(&self) -> Option<JobOutcome> {
        self.0.outcome.borrow().clone()
    }

    pub fn scheduler(&self) -> Option<Scheduler> {
        Scheduler::from_weak(&self.0.scheduler)
    }

    pub(crate) fn belongs_to(&self, scheduler: &Weak<SchedulerState>) -> bool {
        Weak::ptr_eq(&self.0.scheduler, scheduler)
    }

    pub fn sink(&self) -> Option<Rc<dyn JobSink>> {
        self.0.sink.clone()
    }

    pub fn stack_config(&self) -> StackConfig {
        self.0.stack_config
    }

    pub fn side_effect_free(&self) -> bool {
        self.0.side_effect_free.get()
    }

    pub fn set_side_effect_free(&self, side_effect_free: bool) {
        self.0.side_effect_free.set(side_effect_free);
    }

    pub fn non_interruptible(&self) -> bool {
        self.0.non_interruptible.get()
    }

    pub fn set_non_interruptible(&self, non_interruptible: bool) {
        self.0.non_interruptible.set(non_interruptible);
    }

    pub fn has_pending_exception(&self) -> bool {
        self.0.pending.borrow().is_some()
    }

    pub fn parent(&self) -> Option<Job> {
        self.0.parent.borrow().upgrade().map(Job)
    }

    pub fn children(&self) -> Vec<Job> {
        self.0.children.borrow().clone()
    }

    // ----------------------------------------------------------------
    // Tags
    // ----------------------------------------------------------------

    /// Snapshot of the tag stack, outermost first.
    pub fn tags(&self) -> Vec<Tag> {
        self.0.tags.borrow().to_vec()
    }

    pub fn inherited_tag_count(&self) -> usize {
        self.0.inherited_tags
    }

    /// Any held tag frozen.
    pub fn frozen(&self) -> bool {
        self.0.tags.borrow().iter().any(Tag::frozen)
    }

    /// Any held tag blocked.
    pub fn blocked(&self) -> bool {
        self.0.tags.borrow().iter().any(Tag::blocked)
    }

    /// Highest priority among the held tags; [`Tag::PRIORITY_DEFAULT`] when
    /// the job holds none.
    pub fn priority(&self) -> u8 {
        let tags = self.0.tags.borrow();
        if tags.is_empty() {
            return Tag::PRIORITY_DEFAULT;
        }
        tags.iter()
            .map(Tag::priority)
            .fold(Tag::PRIORITY_MIN, u8::max)
    }

    /// Outermost blocked position and its payload.
    pub(crate) fn blocked_position(&self) -> Option<(usize, Value)> {
        let tags = self.0.tags.borrow();
        let depth = tags.iter().position(Tag::blocked)?;
        Some((depth, tags[depth].payload_get()))
    }

    /// Push `tag`, returning the depth it occupies.
    pub(crate) fn push_tag(&self, tag: Tag) -> usize {
        let mut tags = self.0.tags.borrow_mut();
        tags.push(tag);
        tags.len() - 1
    }

    pub(crate) fn truncate_tags(&self, depth: usize) {
        self.0.tags.borrow_mut().truncate(depth);
    }

    /// Consume a pending stop aimed at `depth` or deeper.
    pub(crate) fn take_stop_at(&self, depth: usize) -> Option<Value> {
        let mut pending = self.0.pending.borrow_mut();
        match pending.take() {
            Some(Exception::Stop { depth: d, payload, .. }) if d >= depth => Some(payload),
            other => {
                *pending = other;
                None
            }
        }
    }

    /// Called for every job when `tag` is stopped.
    ///
    /// A pending `Terminate` is never replaced, and a pending stop limits
    /// the search to the scopes enclosing it, so the outermost affected
    /// scope wins.
    pub(crate) fn register_stopped_tag(&self, tag: &Tag, payload: &Value) {
        if self.terminated() {
            return;
        }
        let limit = match &*self.0.pending.borrow() {
            Some(Exception::Terminate) => return,
            Some(Exception::Stop { depth, .. }) => *depth,
            _ => usize::MAX,
        };
        let position = self
            .0
            .tags
            .borrow()
            .iter()
            .take(limit)
            .position(|held| held.derives_from(tag));
        if let Some(depth) = position {
            tracing::debug!(target: logging::TAG, job = %self, %tag, depth, "stop delivered");
            self.async_throw(Exception::Stop {
                depth,
                payload: payload.clone(),
                asynchronous: true,
            });
        }
    }

    // ----------------------------------------------------------------
    // Asynchronous requests
    // ----------------------------------------------------------------

    /// Park `exception` to be raised when the job next resumes, and make it
    /// eligible to run.
    ///
    /// Returns `false`, leaving the job untouched, when the exception
    /// already pending outranks `exception`: a termination beats a stop,
    /// a stop beats an error, and an error beats a barrier or semaphore
    /// wake-up.
    pub fn async_throw(&self, exception: Exception) -> bool {
        {
            let mut pending = self.0.pending.borrow_mut();
            if let Some(current) = pending.as_ref() {
                if !exception.supersedes(current) {
                    tracing::trace!(
                        target: logging::JOB,
                        job = %self,
                        kind = %exception.kind(),
                        pending = %current.kind(),
                        "async exception refused"
                    );
                    return false;
                }
            }
            tracing::trace!(target: logging::JOB, job = %self, kind = %exception.kind(), "async exception");
            *pending = Some(exception);
        }
        self.0.side_effect_free.set(false);
        self.0.non_interruptible.set(false);
        match self.state() {
            JobState::ToStart | JobState::Zombie => {}
            _ => self.set_state(JobState::Running),
        }
        true
    }

    pub(crate) fn check_for_pending_exception(&self) -> Result<(), Exception> {
        match self.0.pending.take() {
            Some(exception) => Err(exception),
            None => Ok(()),
        }
    }

    /// Cooperative termination: children first, then this job, which
    /// unwinds at its next resumption.
    pub fn terminate_now(&self) {
        for child in self.0.children.take() {
            child.terminate_now();
        }
        if !self.terminated() {
            tracing::debug!(target: logging::JOB, job = %self, "terminate requested");
            self.async_throw(Exception::Terminate);
        }
    }

    // ----------------------------------------------------------------
    // Sleeping and joining
    // ----------------------------------------------------------------

    pub fn deadline(&self) -> Option<Instant> {
        self.0.deadline.get()
    }

    /// Total time this job's deadlines were pushed back while frozen.
    pub fn time_shift(&self) -> Duration {
        self.0.time_shift.get()
    }

    pub(crate) fn sleep_until(&self, deadline: Instant) {
        self.0.deadline.set(Some(deadline));
        self.0.frozen_since.set(None);
        self.set_state(JobState::Sleeping);
    }

    pub(crate) fn clear_deadline(&self) {
        self.0.deadline.set(None);
        self.0.frozen_since.set(None);
    }

    pub(crate) fn notice_frozen(&self, now: Instant) {
        if self.0.frozen_since.get().is_none() {
            self.0.frozen_since.set(Some(now));
        }
    }

    /// Push the deadline back by however long the job has been frozen.
    pub(crate) fn notice_not_frozen(&self, now: Instant) {
        if let Some(since) = self.0.frozen_since.take() {
            let shift = now.saturating_duration_since(since);
            self.0.time_shift.set(self.0.time_shift.get() + shift);
            if let Some(deadline) = self.0.deadline.get() {
                self.0.deadline.set(Some(deadline + shift));
            }
        }
    }

    pub(crate) fn add_joiner(&self, joiner: &Job) {
        self.0.to_wake_up.borrow_mut().push(Rc::downgrade(&joiner.0));
    }

    pub(crate) fn remove_joiner(&self, joiner: &Job) {
        self.0
            .to_wake_up
            .borrow_mut()
            .retain(|weak| !std::ptr::eq(weak.as_ptr(), Rc::as_ptr(&joiner.0)));
    }

    fn wake(&self) {
        if self.state() == JobState::Joining {
            self.set_state(JobState::Running);
        }
    }

    // ----------------------------------------------------------------
    // Parent / children
    // ----------------------------------------------------------------

    pub(crate) fn adopt(&self, child: &Job) {
        *child.0.parent.borrow_mut() = Rc::downgrade(&self.0);
        self.0.children.borrow_mut().push(child.clone());
    }

    fn detach_from_parent(&self) {
        let parent = self.0.parent.replace(Weak::new()).upgrade().map(Job);
        if let Some(parent) = parent {
            parent.0.children.borrow_mut().retain(|c| c != self);
        }
    }

    // ----------------------------------------------------------------
    // Coroutine hand-off
    // ----------------------------------------------------------------

    /// Take the coroutine out for a resumption.
    ///
    /// # Panics
    ///
    /// Panics if the job is already executing or has been released.
    pub(crate) fn take_coroutine(&self) -> Coroutine {
        let coroutine = self.0.coroutine.borrow_mut().take();
        match coroutine {
            Some(coroutine) => coroutine,
            None => panic!("Job::take_coroutine: job {} has no coroutine", self),
        }
    }

    pub(crate) fn put_coroutine(&self, coroutine: Coroutine) {
        let mut slot = self.0.coroutine.borrow_mut();
        assert!(slot.is_none(), "Job::put_coroutine: job {} already has a coroutine", self);
        *slot = Some(coroutine);
    }

    // ----------------------------------------------------------------
    // Running and termination
    // ----------------------------------------------------------------

    /// Coroutine body: run the entry, classify how it ended, clean up.
    fn run<F>(self, switcher: &Switcher<'_>, entry: F)
    where
        F: FnOnce(&mut JobContext<'_>) -> Result<Value, Exception>,
    {
        tracing::debug!(target: logging::JOB, job = %self, "started");
        self.set_state(JobState::Running);
        let mut cx = JobContext::new(self.clone(), switcher);
        let result = cx.enter().and_then(|()| entry(&mut cx));
        drop(cx);
        let outcome = self.classify(result);
        self.finish(outcome);
    }

    fn classify(&self, result: Result<Value, Exception>) -> JobOutcome {
        match result {
            Ok(value) => JobOutcome::Completed(value),
            Err(Exception::Terminate) => JobOutcome::Killed,
            Err(Exception::Stop { depth, payload, .. }) => {
                assert!(
                    depth < self.0.inherited_tags,
                    "job {}: stop aimed at tag depth {} escaped its scope",
                    self,
                    depth
                );
                JobOutcome::Stopped(payload)
            }
            Err(e @ (Exception::BarrierWake(_) | Exception::SemaphoreRelease)) => {
                panic!("job {}: `{}` escaped its suspension point", self, e)
            }
            Err(error) => JobOutcome::Failed(error),
        }
    }

    /// Forced termination from outside: release the coroutine, unwinding
    /// whatever was live on its stack.
    pub(crate) fn kill(&self) {
        if self.terminated() {
            return;
        }
        tracing::debug!(target: logging::JOB, job = %self, "killed");
        self.set_state(JobState::Zombie);
        let coroutine = self.0.coroutine.borrow_mut().take();
        drop(coroutine);
        self.finish(JobOutcome::Killed);
    }

    fn finish(&self, outcome: JobOutcome) {
        self.set_state(JobState::Zombie);
        self.0.pending.take();
        self.clear_deadline();
        match &outcome {
            JobOutcome::Failed(error) => self.report_failure(error),
            other => tracing::debug!(target: logging::JOB, job = %self, outcome = %other, "terminated"),
        }
        *self.0.outcome.borrow_mut() = Some(outcome.clone());

        for child in self.0.children.take() {
            child.0.parent.replace(Weak::new());
            child.terminate_now();
        }
        self.detach_from_parent();

        for joiner in self.0.to_wake_up.take() {
            if let Some(joiner) = joiner.upgrade() {
                Job(joiner).wake();
            }
        }
        if let Some(scheduler) = self.scheduler() {
            scheduler.signal_world_change();
        }
        if let Some(sink) = &self.0.sink {
            sink.on_terminate(self, &outcome);
        }
    }

    /// A child's error goes to its parent; anything else to the sink.
    fn report_failure(&self, error: &Exception) {
        if let Some(parent) = self.parent().filter(|p| !p.terminated()) {
            tracing::debug!(target: logging::JOB, job = %self, parent = %parent, %error, "rethrowing into parent");
            parent.async_throw(Exception::Child {
                job: self.name().to_string(),
                error: Box::new(error.clone()),
            });
            return;
        }
        match &self.0.sink {
            Some(sink) => sink.report_error(self, error),
            None if matches!(error, Exception::StackExhausted) => {
                tracing::error!(target: logging::JOB, job = %self, %error, "job died")
            }
            None => {
                tracing::warn!(target: logging::JOB, job = %self, %error, "uncaught error in job")
            }
        }
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Job {}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.0.name, self.0.id)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .field("state", &self.state())
            .field("tags", &self.0.tags.borrow().len())
            .field("pending", &self.0.pending.borrow().as_ref().map(Exception::kind))
            .finish()
    }
}
