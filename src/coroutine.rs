//! Stack-switching execution contexts.
//!
//! A [`Coroutine`] owns a private, guard-paged stack. The scheduler side
//! drives it with [`Coroutine::start`] and [`Coroutine::switch_to`]; the
//! code running on the coroutine stack gets a [`Switcher`] and hands control
//! back with [`Switcher::switch_back`]. Returning from the entry closure is
//! the coroutine's final switch back.
//!
//! Dropping a coroutine that is suspended mid-execution unwinds its stack,
//! so destructors of everything live on it run before the memory is freed.

use corosensei::stack::{DefaultStack, Stack};
use corosensei::{CoroutineResult, Yielder};

use crate::config::{self, StackConfig};
use crate::error::CoroutineError;

/// How a transfer of control into a coroutine ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Switch {
    /// The coroutine called [`Switcher::switch_back`].
    Suspended,
    /// The entry closure returned.
    Finished,
}

#[derive(Debug, Clone, Copy)]
struct StackBounds {
    base: usize,
    limit: usize,
    minimum: usize,
}

impl StackBounds {
    /// Stacks grow down: the free space is what lies between the current
    /// stack pointer and the limit.
    fn margin_low(&self) -> bool {
        let sp = approximate_stack_pointer();
        if sp < self.limit || sp > self.base {
            return false;
        }
        sp - self.limit < self.minimum
    }

    fn remaining(&self) -> Option<usize> {
        let sp = approximate_stack_pointer();
        (self.limit..=self.base)
            .contains(&sp)
            .then(|| sp - self.limit)
    }
}

#[inline(never)]
fn approximate_stack_pointer() -> usize {
    let marker = 0u8;
    std::hint::black_box(&marker) as *const u8 as usize
}

/// The coroutine-side view: switch back to the scheduler, inspect the stack.
pub struct Switcher<'a> {
    yielder: &'a Yielder<(), ()>,
    bounds: StackBounds,
}

impl Switcher<'_> {
    /// Suspend this coroutine; returns when it is switched to again.
    pub fn switch_back(&self) {
        self.yielder.suspend(());
    }

    /// True when less than the configured minimum of stack remains.
    pub fn stack_margin_low(&self) -> bool {
        self.bounds.margin_low()
    }

    /// Bytes left between the current frame and the stack limit.
    pub fn stack_remaining(&self) -> usize {
        self.bounds.remaining().unwrap_or(0)
    }
}

pub struct Coroutine {
    inner: corosensei::Coroutine<(), (), (), DefaultStack>,
    stack_size: usize,
    bounds: StackBounds,
    started: bool,
}

impl Coroutine {
    /// Create a coroutine that will run `entry` once started.
    ///
    /// A `stack_size` of 0 selects the process-wide default.
    pub fn new<F>(stack_size: usize, entry: F) -> Result<Self, CoroutineError>
    where
        F: FnOnce(&Switcher<'_>) + 'static,
    {
        Self::with_config(stack_size, config::stack_config(), entry)
    }

    /// Like [`Coroutine::new`], with an explicit configuration instead of the
    /// process-wide one.
    pub fn with_config<F>(
        stack_size: usize,
        config: StackConfig,
        entry: F,
    ) -> Result<Self, CoroutineError>
    where
        F: FnOnce(&Switcher<'_>) + 'static,
    {
        let size = if stack_size == 0 {
            config.default_stack_size
        } else {
            stack_size
        };
        let stack = DefaultStack::new(size)
            .map_err(|source| CoroutineError::StackAllocation { size, source })?;
        let bounds = StackBounds {
            base: stack.base().get(),
            limit: stack.limit().get(),
            minimum: config.minimum_stack_size,
        };
        let inner = corosensei::Coroutine::with_stack(
            stack,
            move |yielder: &Yielder<(), ()>, ()| {
                let switcher = Switcher { yielder, bounds };
                entry(&switcher);
            },
        );
        Ok(Coroutine {
            inner,
            stack_size: size,
            bounds,
            started: false,
        })
    }

    /// First transfer of control into the coroutine.
    pub fn start(&mut self) -> Switch {
        assert!(!self.started, "Coroutine::start: coroutine already started");
        self.started = true;
        self.resume()
    }

    /// Resume a started coroutine where it last switched back.
    pub fn switch_to(&mut self) -> Switch {
        assert!(
            self.started,
            "Coroutine::switch_to: coroutine has not been started"
        );
        assert!(
            !self.inner.done(),
            "Coroutine::switch_to: coroutine already finished"
        );
        self.resume()
    }

    fn resume(&mut self) -> Switch {
        match self.inner.resume(()) {
            CoroutineResult::Yield(()) => Switch::Suspended,
            CoroutineResult::Return(()) => Switch::Finished,
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn finished(&self) -> bool {
        self.inner.done()
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Only meaningful when called from code running on this coroutine's
    /// stack; from any other stack it reports false.
    pub fn stack_margin_low(&self) -> bool {
        self.bounds.margin_low()
    }
}

impl std::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("stack_size", &self.stack_size)
            .field("started", &self.started)
            .field("finished", &self.inner.done())
            .finish()
    }
}
