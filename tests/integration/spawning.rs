// Jobs creating jobs: deferred start, inheritance, parent/child links.

use crate::common::{drain, new_log, push, run_until_idle, spawn_small, spinner, TEST_STACK};
use std::cell::RefCell;
use std::rc::Rc;
use strand::{BufferSink, Exception, Job, JobOutcome, JobState, Scheduler, Tag, Value};

#[test]
fn test_spawned_job_starts_next_cycle() {
    let scheduler = Scheduler::new();
    let log = new_log();
    let child = Rc::new(RefCell::new(None));

    let (l, c) = (log.clone(), child.clone());
    spawn_small(&scheduler, "parent", move |cx| {
        push(&l, "parent");
        let job = cx.spawn("child", spinner(&l, "child"))?;
        *c.borrow_mut() = Some(job);
        loop {
            cx.yield_now()?;
            push(&l, "parent");
        }
    });

    scheduler.work();
    assert_eq!(drain(&log), vec!["parent"]);
    let child = child.borrow().clone().unwrap();
    assert_eq!(child.state(), JobState::ToStart);

    scheduler.work();
    assert_eq!(drain(&log), vec!["child", "parent"]);

    scheduler.work();
    assert_eq!(drain(&log), vec!["parent", "child"]);
    scheduler.killall_jobs();
}

#[test]
fn test_spawn_during_pass_is_deferred() {
    let scheduler = Scheduler::new();
    let log = new_log();

    let l = log.clone();
    spawn_small(&scheduler, "parent", move |cx| {
        cx.yield_now()?;
        cx.spawn("late", spinner(&l, "late"))?;
        push(&l, "spawned");
        loop {
            cx.yield_now()?;
        }
    });

    scheduler.work();
    scheduler.work();
    assert_eq!(drain(&log), vec!["spawned"]);
    scheduler.work();
    assert_eq!(drain(&log), vec!["late"]);
    scheduler.killall_jobs();
}

#[test]
fn test_spawned_job_inherits_tags_and_sink() {
    let scheduler = Scheduler::new();
    let sink = Rc::new(BufferSink::new());
    let tag = Tag::fresh("group");
    let seen = Rc::new(RefCell::new(None));

    let (t, s) = (tag.clone(), seen.clone());
    let parent = Job::builder("parent")
        .stack_size(TEST_STACK)
        .sink(sink.clone())
        .build(&scheduler, move |cx| {
            cx.with_tag(&t, |cx| {
                let child = cx.spawn("child", |cx| {
                    cx.send_message("out", "hello from child");
                    Ok(Value::NIL)
                })?;
                *s.borrow_mut() = Some(child);
                Ok(())
            })?;
            Ok(Value::NIL)
        })
        .unwrap();
    scheduler.add_job(&parent);

    scheduler.work();
    let child = seen.borrow().clone().unwrap();
    assert_eq!(child.tags(), vec![tag.clone()]);
    assert_eq!(child.inherited_tag_count(), 1);
    assert!(parent.tags().is_empty());

    run_until_idle(&scheduler, 5);
    assert_eq!(sink.channel("out"), vec!["hello from child"]);
}

#[test]
fn test_child_failure_is_rethrown_into_parent() {
    let scheduler = Scheduler::new();
    let sink = Rc::new(BufferSink::new());

    let parent = Job::builder("parent")
        .stack_size(TEST_STACK)
        .sink(sink.clone())
        .build(&scheduler, |cx| {
            cx.spawn_child("child", |_| Err(Exception::guest("boom")))?;
            loop {
                cx.yield_now()?;
            }
        })
        .unwrap();
    scheduler.add_job(&parent);

    run_until_idle(&scheduler, 5);
    match parent.outcome() {
        Some(JobOutcome::Failed(Exception::Child { job, error })) => {
            assert_eq!(job, "child");
            assert_eq!(*error, Exception::guest("boom"));
        }
        other => panic!("unexpected parent outcome {:?}", other),
    }
    // Only the parent reports; the child's error went to the parent.
    let errors = sink.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, "parent");
    assert!(errors[0].1.contains("child job `child` failed: boom"));
}

#[test]
fn test_parent_can_catch_child_failure() {
    let scheduler = Scheduler::new();
    let parent = spawn_small(&scheduler, "parent", |cx| {
        cx.spawn_child("child", |_| Err(Exception::guest("boom")))?;
        loop {
            match cx.yield_now() {
                Ok(()) => {}
                Err(Exception::Child { job, .. }) => return Ok(Value::string(job)),
                Err(other) => return Err(other),
            }
        }
    });
    run_until_idle(&scheduler, 5);
    assert_eq!(
        parent.outcome(),
        Some(JobOutcome::Completed(Value::string("child")))
    );
}

#[test]
fn test_terminating_parent_terminates_children() {
    let scheduler = Scheduler::new();
    let log = new_log();
    let children = Rc::new(RefCell::new(Vec::new()));

    let (l, c) = (log.clone(), children.clone());
    let parent = spawn_small(&scheduler, "parent", move |cx| {
        for i in 0..2 {
            let name = format!("child{}", i);
            let child = cx.spawn_child(name.clone(), spinner(&l, &name))?;
            c.borrow_mut().push(child);
        }
        loop {
            cx.yield_now()?;
        }
    });

    scheduler.work();
    scheduler.work();
    assert_eq!(parent.children().len(), 2);

    parent.terminate_now();
    scheduler.work();
    assert_eq!(parent.outcome(), Some(JobOutcome::Killed));
    for child in children.borrow().iter() {
        assert_eq!(child.outcome(), Some(JobOutcome::Killed));
        assert!(child.parent().is_none());
    }
    assert_eq!(scheduler.job_count(), 0);
}

#[test]
fn test_finished_child_detaches_from_parent() {
    let scheduler = Scheduler::new();
    let parent = spawn_small(&scheduler, "parent", |cx| {
        let child = cx.spawn_child("child", |_| Ok(Value::NIL))?;
        assert_eq!(child.parent().as_ref(), Some(cx.job()));
        cx.yield_until_terminated(&child)?;
        Ok(Value::int(cx.job().children().len() as i64))
    });
    run_until_idle(&scheduler, 5);
    assert_eq!(parent.outcome(), Some(JobOutcome::Completed(Value::int(0))));
}
