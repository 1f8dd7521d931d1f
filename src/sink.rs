//! Where jobs send their output and terminal errors.
//!
//! The scheduler knows nothing about channels or consoles. A job optionally
//! carries a [`JobSink`]; jobs spawned from it inherit the same sink.

use std::cell::RefCell;

use crate::error::Exception;
use crate::job::{Job, JobId, JobOutcome};

pub trait JobSink {
    /// Deliver `message` on `channel`.
    fn send_message(&self, channel: &str, message: &str);

    /// A job died with an error that nothing caught.
    fn report_error(&self, job: &Job, error: &Exception);

    /// Called once per job, after it reached its final state.
    fn on_terminate(&self, _job: &Job, _outcome: &JobOutcome) {}
}

/// In-memory sink, for embedders that poll and for tests.
#[derive(Debug, Default)]
pub struct BufferSink {
    messages: RefCell<Vec<(String, String)>>,
    errors: RefCell<Vec<(String, String)>>,
    terminated: RefCell<Vec<(JobId, String)>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(channel, message)` pairs in delivery order.
    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.borrow().clone()
    }

    /// Messages delivered on one channel.
    pub fn channel(&self, channel: &str) -> Vec<String> {
        self.messages
            .borrow()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// `(job name, error)` pairs.
    pub fn errors(&self) -> Vec<(String, String)> {
        self.errors.borrow().clone()
    }

    /// `(job id, outcome)` pairs in termination order.
    pub fn terminated(&self) -> Vec<(JobId, String)> {
        self.terminated.borrow().clone()
    }

    pub fn clear(&self) {
        self.messages.borrow_mut().clear();
        self.errors.borrow_mut().clear();
        self.terminated.borrow_mut().clear();
    }
}

impl JobSink for BufferSink {
    fn send_message(&self, channel: &str, message: &str) {
        self.messages
            .borrow_mut()
            .push((channel.to_string(), message.to_string()));
    }

    fn report_error(&self, job: &Job, error: &Exception) {
        let text = match error {
            Exception::Guest(guest) => guest.report(),
            other => other.to_string(),
        };
        self.errors
            .borrow_mut()
            .push((job.name().to_string(), text));
    }

    fn on_terminate(&self, job: &Job, outcome: &JobOutcome) {
        self.terminated
            .borrow_mut()
            .push((job.id(), outcome.to_string()));
    }
}
