//! Tracing targets and compile-time gated per-cycle tracing.
//!
//! Lifecycle events (job started, terminated, killed) are always emitted at
//! `debug` level. Per-cycle events fire on every scheduler cycle and go
//! through [`sched_trace!`], which compiles to nothing unless the
//! `sched_trace` Cargo feature is enabled.
//!
//! The library never installs a subscriber.

/// Scheduler cycle and queue events.
pub const SCHEDULER: &str = "strand::scheduler";
/// Job lifecycle and suspension events.
pub const JOB: &str = "strand::job";
/// Tag state changes.
pub const TAG: &str = "strand::tag";
/// Barrier and semaphore events.
pub const SYNC: &str = "strand::sync";

/// Emit a `trace`-level scheduler event only when the `sched_trace` Cargo
/// feature is enabled.
///
/// With the feature disabled (default), this macro compiles to a no-op while
/// still type-checking format arguments.
macro_rules! sched_trace {
    ($($arg:tt)*) => {{
        #[cfg(feature = "sched_trace")]
        {
            tracing::trace!(target: $crate::logging::SCHEDULER, $($arg)*);
        }
        #[cfg(not(feature = "sched_trace"))]
        {
            let _ = format_args!($($arg)*);
        }
    }};
}

pub(crate) use sched_trace;
