//! Configuration for nebula-alloc
//!
//! A process-wide [`AllocatorConfig`] is installed by [`crate::init`] and read
//! by the fatal surface and by debug allocators that are not given an
//! explicit [`DebugConfig`].

use parking_lot::RwLock;

use crate::error::{MemoryError, MemoryResult};
use crate::utils::METADATA_ALIGN;

#[cfg(feature = "logging")]
use tracing::debug;

static CURRENT: RwLock<AllocatorConfig> = parking_lot::const_rwlock(AllocatorConfig::DEFAULT);

/// What happens when a fatal condition is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalPolicy {
    /// Log and abort the process
    Abort,
    /// Log and panic; for test harnesses and tools that unwind
    Panic,
}

/// Global allocator configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Applied on exhaustion at the fatal surface
    pub fatal_policy: FatalPolicy,
    /// Defaults for debug allocators
    pub debug: DebugConfig,
}

impl AllocatorConfig {
    const DEFAULT: Self = Self {
        fatal_policy: FatalPolicy::Abort,
        debug: DebugConfig::DEFAULT,
    };

    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Production configuration: no fill patterns, smallest guards
    pub fn production() -> Self {
        Self {
            fatal_policy: FatalPolicy::Abort,
            debug: DebugConfig::production(),
        }
    }

    /// Debug configuration: fill and poison patterns, wider guards
    pub fn debug() -> Self {
        Self {
            fatal_policy: FatalPolicy::Panic,
            debug: DebugConfig::debug(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> MemoryResult<()> {
        self.debug
            .validate()
            .map_err(|e| MemoryError::invalid_config(format!("debug: {e}")))
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Configuration for debug (checked) allocators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugConfig {
    /// Guard bytes placed before and after every payload
    pub guard_size: usize,
    /// Value written into guards
    pub guard_byte: u8,
    /// Pattern written over fresh payloads
    pub fill_on_alloc: Option<u8>,
    /// Pattern written over payloads after the free callbacks ran
    pub poison_on_free: Option<u8>,
}

impl DebugConfig {
    const DEFAULT: Self = Self {
        guard_size: METADATA_ALIGN,
        guard_byte: 0xFD,
        fill_on_alloc: Some(0xCD),
        poison_on_free: Some(0xDD),
    };

    pub fn production() -> Self {
        Self {
            fill_on_alloc: None,
            poison_on_free: None,
            ..Self::DEFAULT
        }
    }

    pub fn debug() -> Self {
        Self {
            guard_size: 2 * METADATA_ALIGN,
            ..Self::DEFAULT
        }
    }

    pub fn validate(&self) -> MemoryResult<()> {
        if self.guard_size == 0 || self.guard_size % METADATA_ALIGN != 0 {
            return Err(MemoryError::invalid_config(format!(
                "guard_size must be a non-zero multiple of {METADATA_ALIGN}, got {}",
                self.guard_size
            )));
        }
        if self.fill_on_alloc == Some(self.guard_byte) {
            return Err(MemoryError::invalid_config(
                "fill_on_alloc must differ from guard_byte",
            ));
        }
        Ok(())
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Install `config` as the process-wide configuration
pub(crate) fn install(config: AllocatorConfig) -> MemoryResult<()> {
    config.validate()?;

    #[cfg(feature = "logging")]
    debug!(?config, "installing allocator configuration");

    *CURRENT.write() = config;
    Ok(())
}

/// Restore the default process-wide configuration
pub(crate) fn reset() {
    #[cfg(feature = "logging")]
    debug!("restoring default allocator configuration");

    *CURRENT.write() = AllocatorConfig::DEFAULT;
}

/// Snapshot of the process-wide configuration
pub fn current() -> AllocatorConfig {
    CURRENT.read().clone()
}
