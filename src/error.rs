//! Error and control-flow taxonomy.
//!
//! Everything a job can raise travels as an [`Exception`]. Guest-language
//! failures and the scheduler's own control-flow signals share one enum so
//! that a single `?` propagates both; [`Exception::is_scheduler_exception`]
//! tells them apart.

use std::fmt;

use thiserror::Error;

use crate::value::Value;

/// A failure raised by guest code running inside a job.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct GuestError {
    pub message: String,
    /// Innermost frame first.
    pub backtrace: Vec<String>,
}

impl GuestError {
    pub fn new(message: impl Into<String>) -> Self {
        GuestError {
            message: message.into(),
            backtrace: Vec::new(),
        }
    }

    pub fn with_frame(mut self, frame: impl Into<String>) -> Self {
        self.backtrace.push(frame.into());
        self
    }

    /// Misuse of the scheduling API, e.g. sleeping in a non-interruptible
    /// section.
    pub fn scheduling(message: impl Into<String>) -> Self {
        GuestError::new(format!("scheduling error: {}", message.into()))
    }

    /// Render the message followed by one line per frame.
    pub fn report(&self) -> String {
        let mut out = self.message.clone();
        for frame in &self.backtrace {
            out.push_str("\n    called from: ");
            out.push_str(frame);
        }
        out
    }
}

/// Everything that can unwind a job's stack.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Exception {
    #[error(transparent)]
    Guest(#[from] GuestError),

    #[error("stack space exhausted")]
    StackExhausted,

    /// Unwind to the tag scope at position `depth` of the job's tag stack.
    #[error("stopped at tag depth {depth} with {payload}")]
    Stop {
        depth: usize,
        payload: Value,
        asynchronous: bool,
    },

    #[error("job terminated")]
    Terminate,

    #[error("barrier signalled with {0}")]
    BarrierWake(Value),

    #[error("semaphore released")]
    SemaphoreRelease,

    /// A child job died with `error`.
    #[error("child job `{job}` failed: {error}")]
    Child { job: String, error: Box<Exception> },
}

impl Exception {
    pub fn guest(message: impl Into<String>) -> Self {
        Exception::Guest(GuestError::new(message))
    }

    pub fn scheduling(message: impl Into<String>) -> Self {
        Exception::Guest(GuestError::scheduling(message))
    }

    /// True for the scheduler's control-flow signals, which guest handlers
    /// must not swallow.
    pub fn is_scheduler_exception(&self) -> bool {
        matches!(
            self,
            Exception::Stop { .. }
                | Exception::Terminate
                | Exception::BarrierWake(_)
                | Exception::SemaphoreRelease
        )
    }

    /// Rank used when two asynchronous exceptions compete for a job's
    /// pending slot: termination, then stops, then errors, then wake-ups.
    fn delivery_rank(&self) -> u8 {
        match self {
            Exception::Terminate => 3,
            Exception::Stop { .. } => 2,
            Exception::Guest(_) | Exception::StackExhausted | Exception::Child { .. } => 1,
            Exception::BarrierWake(_) | Exception::SemaphoreRelease => 0,
        }
    }

    /// Whether `self` may replace `pending` in a job's pending slot.
    ///
    /// Between two stops the one aimed at the shallower scope wins, and the
    /// earlier one is kept on a tie.
    pub(crate) fn supersedes(&self, pending: &Exception) -> bool {
        match (self, pending) {
            (Exception::Stop { depth: new, .. }, Exception::Stop { depth: old, .. }) => new < old,
            _ => self.delivery_rank() >= pending.delivery_rank(),
        }
    }

    pub fn kind(&self) -> ExceptionKind {
        match self {
            Exception::Guest(_) => ExceptionKind::Guest,
            Exception::StackExhausted => ExceptionKind::StackExhausted,
            Exception::Stop { .. } => ExceptionKind::Stop,
            Exception::Terminate => ExceptionKind::Terminate,
            Exception::BarrierWake(_) => ExceptionKind::BarrierWake,
            Exception::SemaphoreRelease => ExceptionKind::SemaphoreRelease,
            Exception::Child { .. } => ExceptionKind::Child,
        }
    }
}

/// Payload-free discriminant of [`Exception`], for logging and matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    Guest,
    StackExhausted,
    Stop,
    Terminate,
    BarrierWake,
    SemaphoreRelease,
    Child,
}

impl ExceptionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExceptionKind::Guest => "guest",
            ExceptionKind::StackExhausted => "stack-exhausted",
            ExceptionKind::Stop => "stop",
            ExceptionKind::Terminate => "terminate",
            ExceptionKind::BarrierWake => "barrier-wake",
            ExceptionKind::SemaphoreRelease => "semaphore-release",
            ExceptionKind::Child => "child",
        }
    }
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure to set up a coroutine.
#[derive(Debug, Error)]
pub enum CoroutineError {
    #[error("cannot allocate a {size}-byte coroutine stack")]
    StackAllocation {
        size: usize,
        #[source]
        source: std::io::Error,
    },
}

impl From<CoroutineError> for Exception {
    fn from(err: CoroutineError) -> Self {
        Exception::guest(err.to_string())
    }
}
