//! Terminal handling for conditions the process cannot continue past.

use crate::config::{self, FatalPolicy};
use crate::error::MemoryError;
use crate::location::SourceLocation;

#[cfg(feature = "logging")]
use tracing::error;

/// Report `err` raised at `location` and stop according to `policy`.
#[cold]
#[inline(never)]
pub fn raise(policy: FatalPolicy, err: &MemoryError, location: SourceLocation) -> ! {
    #[cfg(feature = "logging")]
    error!(code = err.code(), %location, "fatal allocator condition: {err}");

    match policy {
        FatalPolicy::Panic => panic!("{err} [{}] at {location}", err.code()),
        FatalPolicy::Abort => {
            eprintln!("fatal allocator condition at {location}: {err}");
            std::process::abort()
        }
    }
}

/// Exhaustion on the fatal surface, using the process-wide policy.
#[cold]
pub fn out_of_memory(err: &MemoryError, location: SourceLocation) -> ! {
    raise(config::current().fatal_policy, err, location)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "MEM:POOL:EXHAUSTED")]
    fn panic_policy_unwinds_with_code() {
        raise(
            FatalPolicy::Panic,
            &MemoryError::pool_exhausted("p", 1),
            SourceLocation::new("t.rs", 1),
        );
    }
}
