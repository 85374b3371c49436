//! Standalone error types for nebula-alloc
//!
//! Uses thiserror for clean, idiomatic Rust error definitions.

use thiserror::Error;

use crate::location::SourceLocation;

#[cfg(feature = "logging")]
use tracing::warn;

// ============================================================================
// Main Error Types
// ============================================================================

/// Allocation errors
#[must_use = "errors should be handled"]
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    // --- Exhaustion ---
    #[error("Memory allocation failed: {size} bytes")]
    AllocationFailed { size: usize },

    #[error("Fixed pool '{pool}' exhausted (capacity: {capacity})")]
    PoolExhausted { pool: String, capacity: usize },

    // --- Request Errors ---
    #[error("Request of {size} bytes exceeds pool item size of {item_size} bytes")]
    ExceedsItemSize { size: usize, item_size: usize },

    #[error("Size overflow during operation: {operation}")]
    SizeOverflow { operation: String },

    // --- Configuration ---
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // --- Verification ---
    #[error(
        "Memory corruption detected in '{allocator}': {details} (allocated at {allocated_at}, detected at {detected_at})"
    )]
    Corruption {
        allocator: String,
        details: String,
        allocated_at: SourceLocation,
        detected_at: SourceLocation,
    },
}

impl MemoryError {
    /// Whether the error means the allocator ran out of memory or slots
    #[must_use]
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            Self::AllocationFailed { .. } | Self::PoolExhausted { .. }
        )
    }

    /// Get error code for categorization
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::AllocationFailed { .. } => "MEM:ALLOC:FAILED",
            Self::PoolExhausted { .. } => "MEM:POOL:EXHAUSTED",
            Self::ExceedsItemSize { .. } => "MEM:POOL:ITEM_SIZE",
            Self::SizeOverflow { .. } => "MEM:ALLOC:OVERFLOW",
            Self::InvalidConfig { .. } => "MEM:CONFIG:INVALID",
            Self::Corruption { .. } => "MEM:DEBUG:CORRUPTION",
        }
    }

    // ============================================================================
    // Convenience Constructors
    // ============================================================================

    /// Create allocation failed error
    pub fn allocation_failed(size: usize) -> Self {
        #[cfg(feature = "logging")]
        warn!(size, "memory allocation failed");

        Self::AllocationFailed { size }
    }

    /// Create pool exhausted error
    pub fn pool_exhausted(pool: &str, capacity: usize) -> Self {
        #[cfg(feature = "logging")]
        warn!(pool, capacity, "fixed pool exhausted");

        Self::PoolExhausted {
            pool: pool.to_string(),
            capacity,
        }
    }

    /// Create item size exceeded error
    pub fn exceeds_item_size(size: usize, item_size: usize) -> Self {
        #[cfg(feature = "logging")]
        warn!(size, item_size, "request exceeds fixed pool item size");

        Self::ExceedsItemSize { size, item_size }
    }

    /// Create size overflow error
    pub fn size_overflow(operation: &str) -> Self {
        Self::SizeOverflow {
            operation: operation.to_string(),
        }
    }

    /// Create invalid config error
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create memory corruption error
    pub fn corruption(
        allocator: &str,
        details: impl Into<String>,
        allocated_at: SourceLocation,
        detected_at: SourceLocation,
    ) -> Self {
        Self::Corruption {
            allocator: allocator.to_string(),
            details: details.into(),
            allocated_at,
            detected_at,
        }
    }
}

// ============================================================================
// Result Types
// ============================================================================

/// Result type for memory operations
pub type MemoryResult<T> = core::result::Result<T, MemoryError>;

/// Allocator-facing aliases
pub type AllocError = MemoryError;
pub type AllocResult<T> = MemoryResult<T>;

// ============================================================================
// Tests
// ============================================================================
