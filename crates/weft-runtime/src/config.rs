//! Runtime configuration
//!
//! Compile-time defaults with environment overrides.
//!
//! # Environment Variables
//!
//! - `WEFT_STACK_SIZE` - default fiber stack size in bytes
//! - `WEFT_GUARD_PAGES` - map a PROT_NONE guard page below each stack (0/1)

use weft_core::env::{env_get, env_get_bool};
use weft_core::error::{FiberError, FiberResult, StackError};

use crate::stack::MIN_STACK_SIZE;

/// Compile-time defaults
pub mod defaults {
    /// Default usable stack bytes per fiber
    pub const STACK_SIZE: usize = 128 * 1024;

    /// Guard pages on by default
    pub const GUARD_PAGES: bool = true;
}

/// Runtime configuration with builder-style overrides
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Usable stack bytes for fibers spawned without an explicit allocator
    pub stack_size: usize,

    /// Whether default stacks carry a PROT_NONE guard page
    pub guard_pages: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        RuntimeConfig {
            stack_size: env_get("WEFT_STACK_SIZE", defaults::STACK_SIZE),
            guard_pages: env_get_bool("WEFT_GUARD_PAGES", defaults::GUARD_PAGES),
        }
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn guard_pages(mut self, enabled: bool) -> Self {
        self.guard_pages = enabled;
        self
    }

    /// Reject configurations the stack layer cannot honor
    pub fn validate(&self) -> FiberResult<()> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err(FiberError::StackError(StackError::SizeTooSmall));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let cfg = RuntimeConfig::from_env();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_builder_and_validate() {
        let cfg = RuntimeConfig::from_env().stack_size(1024);
        assert!(cfg.validate().is_err());

        let cfg = RuntimeConfig::from_env()
            .stack_size(64 * 1024)
            .guard_pages(false);
        assert!(cfg.validate().is_ok());
        assert!(!cfg.guard_pages);
    }
}
