// Run-queue ordering and reaping.
//
// One work() call visits each ready job exactly once, in run-queue order,
// and that order survives from cycle to cycle.

use crate::common::{drain, new_log, spawn_small, spinner, stepper};
use strand::{JobState, Scheduler, Value};

#[test]
fn test_jobs_resume_in_insertion_order() {
    let scheduler = Scheduler::new();
    let log = new_log();
    let names: Vec<String> = (1..=5).map(|i| format!("j{}", i)).collect();
    for name in &names {
        spawn_small(&scheduler, name, spinner(&log, name));
    }

    for _ in 0..6 {
        scheduler.work();
        assert_eq!(drain(&log), names);
    }
    scheduler.killall_jobs();
}

#[test]
fn test_new_jobs_queue_behind_existing() {
    let scheduler = Scheduler::new();
    let log = new_log();
    spawn_small(&scheduler, "old", spinner(&log, "old"));
    scheduler.work();
    drain(&log);

    spawn_small(&scheduler, "new", spinner(&log, "new"));
    scheduler.work();
    // Started before the pass over the existing queue, and only once.
    assert_eq!(drain(&log), vec!["new", "old"]);

    scheduler.work();
    assert_eq!(drain(&log), vec!["old", "new"]);
    scheduler.killall_jobs();
}

#[test]
fn test_terminated_job_is_reaped() {
    let scheduler = Scheduler::new();
    let log = new_log();
    let short = spawn_small(&scheduler, "short", stepper(&log, "short", 1));
    let long = spawn_small(&scheduler, "long", spinner(&log, "long"));

    scheduler.work();
    assert_eq!(drain(&log), vec!["short", "long"]);
    assert_eq!(scheduler.job_count(), 2);

    scheduler.work();
    assert!(short.terminated());
    assert_eq!(short.state(), JobState::Zombie);
    assert_eq!(scheduler.job_count(), 1);
    assert_eq!(scheduler.jobs(), vec![long.clone()]);
    assert_eq!(drain(&log), vec!["long"]);

    scheduler.work();
    assert_eq!(drain(&log), vec!["long"]);
    scheduler.killall_jobs();
}

#[test]
fn test_job_finishing_at_start_never_enters_queue() {
    let scheduler = Scheduler::new();
    let job = spawn_small(&scheduler, "instant", |_| Ok(Value::int(1)));
    assert_eq!(job.state(), JobState::ToStart);
    scheduler.work();
    assert!(job.terminated());
    assert_eq!(scheduler.job_count(), 0);
    assert!(scheduler.find_job(job.id()).is_none());
}

#[test]
fn test_cycle_counter() {
    let scheduler = Scheduler::new();
    assert_eq!(scheduler.cycle(), 0);
    scheduler.work();
    scheduler.work();
    assert_eq!(scheduler.cycle(), 2);
}
