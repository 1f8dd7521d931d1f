//! Synchronization built on exception injection.
//!
//! Waiters park by joining themselves, which only ends when an exception is
//! delivered. Waking a waiter means taking it off the queue and injecting
//! the primitive's own wake-up exception; any other exception that reaches
//! a waiter first unwinds it as usual, after it has left the queue.

mod barrier;
mod semaphore;

pub use barrier::Barrier;
pub use semaphore::Semaphore;
