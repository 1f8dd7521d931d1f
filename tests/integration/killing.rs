// Forced and cooperative termination.

use crate::common::{new_log, push, spawn_small, spinner, Log};
use std::cell::RefCell;
use std::rc::Rc;
use strand::{Exception, Job, JobOutcome, JobState, Scheduler, Value};

/// Logs when dropped, to observe stack unwinding.
struct Guard(Log, &'static str);

impl Drop for Guard {
    fn drop(&mut self) {
        push(&self.0, format!("drop {}", self.1));
    }
}

#[test]
fn test_killed_before_its_turn_never_runs() {
    let scheduler = Scheduler::new();
    let log = new_log();
    let victim: Rc<RefCell<Option<Job>>> = Rc::new(RefCell::new(None));

    let (l, v) = (log.clone(), victim.clone());
    spawn_small(&scheduler, "killer", move |cx| loop {
        push(&l, "killer");
        let target = v.borrow_mut().take();
        if let Some(target) = target {
            cx.scheduler().kill_job(&target);
        }
        cx.yield_now()?;
    });
    let b = spawn_small(&scheduler, "victim", spinner(&log, "victim"));
    scheduler.work();
    assert_eq!(*log.borrow(), vec!["killer", "victim"]);

    *victim.borrow_mut() = Some(b.clone());
    scheduler.work();
    assert_eq!(*log.borrow(), vec!["killer", "victim", "killer"]);
    assert_eq!(b.outcome(), Some(JobOutcome::Killed));
    assert_eq!(scheduler.job_count(), 1);
    scheduler.killall_jobs();
}

#[test]
fn test_kill_unwinds_the_stack() {
    let scheduler = Scheduler::new();
    let log = new_log();
    let l = log.clone();
    let job = spawn_small(&scheduler, "guarded", move |cx| {
        let _outer = Guard(l.clone(), "outer");
        let _inner = Guard(l.clone(), "inner");
        loop {
            cx.yield_now()?;
        }
    });
    scheduler.work();
    assert!(log.borrow().is_empty());

    scheduler.kill_job(&job);
    assert_eq!(*log.borrow(), vec!["drop inner", "drop outer"]);
    assert_eq!(job.state(), JobState::Zombie);
    assert_eq!(job.outcome(), Some(JobOutcome::Killed));
    assert!(scheduler.find_job(job.id()).is_none());
}

#[test]
fn test_kill_wakes_joiners() {
    let scheduler = Scheduler::new();
    let log = new_log();
    let target = spawn_small(&scheduler, "target", spinner(&log, "target"));
    let t = target.clone();
    let joiner = spawn_small(&scheduler, "joiner", move |cx| {
        cx.yield_until_terminated(&t)?;
        Ok(Value::string("done"))
    });
    scheduler.work();
    assert_eq!(joiner.state(), JobState::Joining);

    scheduler.kill_job(&target);
    assert_eq!(joiner.state(), JobState::Running);
    scheduler.work();
    assert_eq!(joiner.outcome(), Some(JobOutcome::Completed(Value::string("done"))));
}

#[test]
fn test_kill_before_start() {
    let scheduler = Scheduler::new();
    let log = new_log();
    let job = spawn_small(&scheduler, "never", spinner(&log, "never"));
    scheduler.kill_job(&job);
    scheduler.work();
    assert!(log.borrow().is_empty());
    assert_eq!(job.outcome(), Some(JobOutcome::Killed));
}

#[test]
fn test_killall_jobs() {
    let scheduler = Scheduler::new();
    let log = new_log();
    let jobs: Vec<Job> = (0..3)
        .map(|i| {
            let name = format!("s{}", i);
            spawn_small(&scheduler, &name, spinner(&log, &name))
        })
        .collect();
    scheduler.work();
    assert_eq!(scheduler.job_count(), 3);

    scheduler.killall_jobs();
    assert_eq!(scheduler.job_count(), 0);
    for job in &jobs {
        assert_eq!(job.outcome(), Some(JobOutcome::Killed));
    }
    assert_eq!(
        scheduler.work(),
        strand::NextWake::Idle
    );
}

#[test]
fn test_dropping_scheduler_kills_jobs() {
    let log = new_log();
    let job = {
        let scheduler = Scheduler::new();
        let l = log.clone();
        let job = spawn_small(&scheduler, "orphan", move |cx| {
            let _guard = Guard(l, "orphan");
            loop {
                cx.yield_now()?;
            }
        });
        scheduler.work();
        job
    };
    assert_eq!(*log.borrow(), vec!["drop orphan"]);
    assert_eq!(job.outcome(), Some(JobOutcome::Killed));
    assert!(job.scheduler().is_none());
}

#[test]
fn test_terminate_is_cooperative() {
    let scheduler = Scheduler::new();
    let log = new_log();
    let l = log.clone();
    let job = spawn_small(&scheduler, "polite", move |cx| loop {
        match cx.yield_now() {
            Ok(()) => push(&l, "tick"),
            Err(Exception::Terminate) => {
                push(&l, "cleanup");
                return Err(Exception::Terminate);
            }
            Err(other) => return Err(other),
        }
    });
    scheduler.work();
    scheduler.work();

    job.terminate_now();
    assert!(!job.terminated());
    assert!(job.has_pending_exception());
    scheduler.work();
    assert_eq!(*log.borrow(), vec!["tick", "cleanup"]);
    assert_eq!(job.outcome(), Some(JobOutcome::Killed));
}

#[test]
fn test_terminate_reaches_children_first() {
    let scheduler = Scheduler::new();
    let log = new_log();
    let child: Rc<RefCell<Option<Job>>> = Rc::new(RefCell::new(None));
    let (l, c) = (log.clone(), child.clone());
    let parent = spawn_small(&scheduler, "parent", move |cx| {
        let kid = cx.spawn_child("kid", spinner(&l, "kid")).map_err(Exception::from)?;
        *c.borrow_mut() = Some(kid);
        loop {
            cx.yield_now()?;
        }
    });
    scheduler.work();
    scheduler.work();
    let kid = child.borrow().clone().unwrap();
    assert_eq!(parent.children(), vec![kid.clone()]);
    assert_eq!(kid.parent(), Some(parent.clone()));

    parent.terminate_now();
    assert!(kid.has_pending_exception());
    scheduler.work();
    assert_eq!(parent.outcome(), Some(JobOutcome::Killed));
    assert_eq!(kid.outcome(), Some(JobOutcome::Killed));
    assert_eq!(scheduler.job_count(), 0);
}

#[test]
fn test_finished_parent_terminates_children() {
    let scheduler = Scheduler::new();
    let log = new_log();
    let child: Rc<RefCell<Option<Job>>> = Rc::new(RefCell::new(None));
    let (l, c) = (log.clone(), child.clone());
    let parent = spawn_small(&scheduler, "parent", move |cx| {
        let kid = cx.spawn_child("kid", spinner(&l, "kid")).map_err(Exception::from)?;
        *c.borrow_mut() = Some(kid);
        cx.yield_now()?;
        Ok(Value::NIL)
    });
    scheduler.work();
    scheduler.work();
    assert!(parent.terminated());
    let kid = child.borrow().clone().unwrap();
    assert!(kid.parent().is_none());
    scheduler.work();
    assert_eq!(kid.outcome(), Some(JobOutcome::Killed));
    assert_eq!(*log.borrow(), vec!["kid"]);
}

#[test]
#[should_panic(expected = "cannot kill itself")]
fn test_job_cannot_kill_itself() {
    let scheduler = Scheduler::new();
    spawn_small(&scheduler, "suicidal", |cx| {
        let me = cx.job().clone();
        cx.scheduler().kill_job(&me);
        Ok(Value::NIL)
    });
    scheduler.work();
}
