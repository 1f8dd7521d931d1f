//! Process-wide coroutine stack tunables.
//!
//! Two values drive every coroutine the scheduler creates: the default stack
//! size handed to a job that does not ask for a specific one, and the
//! headroom below which [`stack_margin_low`](crate::coroutine::Switcher::stack_margin_low)
//! starts reporting that the stack is nearly exhausted.

use std::sync::{PoisonError, RwLock};

use thiserror::Error;

use crate::logging;

/// Stack configuration for job coroutines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackConfig {
    /// Stack size in bytes for jobs created without an explicit size.
    pub default_stack_size: usize,
    /// Remaining stack, in bytes, under which the margin is reported low.
    pub minimum_stack_size: usize,
}

impl StackConfig {
    /// 256 KiB stacks with an 8 KiB safety margin.
    pub const DEFAULT: StackConfig = StackConfig {
        default_stack_size: 256 * 1024,
        minimum_stack_size: 8 * 1024,
    };

    pub fn with_default_stack_size(mut self, bytes: usize) -> Self {
        self.default_stack_size = bytes;
        self
    }

    pub fn with_minimum_stack_size(mut self, bytes: usize) -> Self {
        self.minimum_stack_size = bytes;
        self
    }

    /// Check that the margin leaves room to run anything at all.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_stack_size == 0 {
            return Err(ConfigError::ZeroStackSize);
        }
        if self.minimum_stack_size >= self.default_stack_size {
            return Err(ConfigError::MarginTooLarge {
                minimum: self.minimum_stack_size,
                size: self.default_stack_size,
            });
        }
        Ok(())
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("default stack size must be non-zero")]
    ZeroStackSize,
    #[error("minimum stack size {minimum} must be smaller than the stack size {size}")]
    MarginTooLarge { minimum: usize, size: usize },
}

static STACK_CONFIG: RwLock<StackConfig> = RwLock::new(StackConfig::DEFAULT);

/// Current process-wide stack configuration.
pub fn stack_config() -> StackConfig {
    *STACK_CONFIG.read().unwrap_or_else(PoisonError::into_inner)
}

/// Replace the process-wide stack configuration.
///
/// Only coroutines created afterwards see the new values.
pub fn set_stack_config(config: StackConfig) -> Result<(), ConfigError> {
    config.validate()?;
    *STACK_CONFIG.write().unwrap_or_else(PoisonError::into_inner) = config;
    tracing::debug!(
        target: logging::SCHEDULER,
        default_stack_size = config.default_stack_size,
        minimum_stack_size = config.minimum_stack_size,
        "stack configuration updated"
    );
    Ok(())
}
