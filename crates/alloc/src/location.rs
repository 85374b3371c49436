//! Call-site diagnostics threaded through every allocator entry point.

use core::fmt;
use core::panic::Location;

/// File and line of the code that asked for (or released) memory.
///
/// Carries no semantic weight; it only ends up in failure and corruption
/// reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceLocation {
    file: &'static str,
    line: u32,
}

impl SourceLocation {
    /// Create a location from explicit parts
    pub const fn new(file: &'static str, line: u32) -> Self {
        Self { file, line }
    }

    /// Location of the caller, propagated through `#[track_caller]` frames
    #[track_caller]
    #[inline]
    pub fn caller() -> Self {
        let location = Location::caller();
        Self {
            file: location.file(),
            line: location.line(),
        }
    }

    /// Used when the allocator itself issues a request (construction,
    /// teardown) rather than a client.
    pub const fn internal() -> Self {
        Self::new("<allocator>", 0)
    }

    pub const fn file(&self) -> &'static str {
        self.file
    }

    pub const fn line(&self) -> u32 {
        self.line
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Expands to the [`SourceLocation`] of the macro invocation.
#[macro_export]
macro_rules! here {
    () => {
        $crate::SourceLocation::new(file!(), line!())
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_captures_this_file() {
        let loc = SourceLocation::caller();
        assert!(loc.file().ends_with("location.rs"));
        assert!(loc.line() > 0);
    }

    #[test]
    fn macro_matches_line() {
        let (loc, line) = (here!(), line!());
        assert_eq!(loc.line(), line);
    }

    #[test]
    fn display_is_file_colon_line() {
        assert_eq!(SourceLocation::new("a.rs", 7).to_string(), "a.rs:7");
    }
}
