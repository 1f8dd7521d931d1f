//! Shared test helpers for the strand test suite.
//!
//! Jobs built here use small stacks so that property tests creating many
//! schedulers stay cheap.

use std::cell::RefCell;
use std::rc::Rc;

use strand::{Exception, Job, JobContext, Scheduler, Tag, Value};

/// Stack size for test jobs.
pub const TEST_STACK: usize = 64 * 1024;

/// Shared, append-only event log.
pub type Log = Rc<RefCell<Vec<String>>>;

pub fn new_log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

pub fn push(log: &Log, entry: impl Into<String>) {
    log.borrow_mut().push(entry.into());
}

/// Take everything logged so far.
pub fn drain(log: &Log) -> Vec<String> {
    std::mem::take(&mut *log.borrow_mut())
}

/// Build a job with a small stack and register it.
pub fn spawn_small<F>(scheduler: &Scheduler, name: &str, entry: F) -> Job
where
    F: FnOnce(&mut JobContext<'_>) -> Result<Value, Exception> + 'static,
{
    let job = build_small(scheduler, name, entry);
    scheduler.add_job(&job);
    job
}

/// Build a job with a small stack without registering it.
pub fn build_small<F>(scheduler: &Scheduler, name: &str, entry: F) -> Job
where
    F: FnOnce(&mut JobContext<'_>) -> Result<Value, Exception> + 'static,
{
    Job::builder(name)
        .stack_size(TEST_STACK)
        .build(scheduler, entry)
        .expect("allocate test stack")
}

/// Like [`spawn_small`], with the job holding `tags` from the start.
pub fn spawn_tagged<F>(scheduler: &Scheduler, name: &str, tags: &[Tag], entry: F) -> Job
where
    F: FnOnce(&mut JobContext<'_>) -> Result<Value, Exception> + 'static,
{
    let job = Job::builder(name)
        .stack_size(TEST_STACK)
        .tags(tags.iter().cloned())
        .build(scheduler, entry)
        .expect("allocate test stack");
    scheduler.add_job(&job);
    job
}

/// A job body that logs `name` and yields, `steps` times, then returns.
pub fn stepper(
    log: &Log,
    name: &str,
    steps: usize,
) -> impl FnOnce(&mut JobContext<'_>) -> Result<Value, Exception> + 'static {
    let log = log.clone();
    let name = name.to_string();
    move |cx| {
        for _ in 0..steps {
            push(&log, name.clone());
            cx.yield_now()?;
        }
        Ok(Value::NIL)
    }
}

/// A job body that logs `name` and yields forever.
pub fn spinner(
    log: &Log,
    name: &str,
) -> impl FnOnce(&mut JobContext<'_>) -> Result<Value, Exception> + 'static {
    let log = log.clone();
    let name = name.to_string();
    move |cx| loop {
        push(&log, name.clone());
        cx.yield_now()?;
    }
}

/// Run cycles until no job is left. Panics after `max_cycles`.
pub fn run_until_idle(scheduler: &Scheduler, max_cycles: usize) -> usize {
    for cycle in 0..max_cycles {
        if scheduler.job_count() == 0 {
            return cycle;
        }
        scheduler.work();
    }
    assert_eq!(
        scheduler.job_count(),
        0,
        "jobs still alive after {} cycles",
        max_cycles
    );
    max_cycles
}
