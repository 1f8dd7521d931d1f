//! Cooperative job scheduler with hierarchical tag flow control.
//!
//! Jobs are computations that each run on their own coroutine stack and
//! give control back only at explicit suspension points. The embedder owns
//! a [`Scheduler`] and calls [`Scheduler::work`] whenever something may
//! have happened; every call runs one cycle over the jobs that were ready
//! at its start, in a fixed order.
//!
//! Jobs can be grouped under [`Tag`]s, which can be frozen (holders stop
//! at their next checkpoint), blocked (holders unwind out of the tagged
//! scope) or stopped (a one-shot block). [`Barrier`] and [`Semaphore`] are
//! built on the same asynchronous exception delivery.
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use strand::{Scheduler, Value};
//!
//! let scheduler = Scheduler::new();
//! let log = Rc::new(RefCell::new(Vec::new()));
//!
//! for name in ["a", "b"] {
//!     let log = log.clone();
//!     scheduler
//!         .spawn(name, move |cx| {
//!             for step in 0..2 {
//!                 log.borrow_mut().push(format!("{}{}", name, step));
//!                 cx.yield_now()?;
//!             }
//!             Ok(Value::NIL)
//!         })
//!         .unwrap();
//! }
//!
//! while scheduler.job_count() > 0 {
//!     scheduler.work();
//! }
//! assert_eq!(*log.borrow(), ["a0", "b0", "a1", "b1"]);
//! ```

pub mod config;
pub mod coroutine;
pub mod error;
pub mod job;
pub mod logging;
pub mod scheduler;
pub mod sink;
pub mod sync;
pub mod tag;
pub mod value;

pub use config::{stack_config, set_stack_config, ConfigError, StackConfig};
pub use coroutine::{Coroutine, Switch, Switcher};
pub use error::{CoroutineError, Exception, ExceptionKind, GuestError};
pub use job::{Job, JobBuilder, JobContext, JobId, JobOutcome, JobState, TagOutcome};
pub use scheduler::{Clock, ManualClock, NextWake, Scheduler, SystemClock};
pub use sink::{BufferSink, JobSink};
pub use sync::{Barrier, Semaphore};
pub use tag::{Tag, TagId};
pub use value::Value;
