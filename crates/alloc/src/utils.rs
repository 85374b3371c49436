//! Alignment helpers shared by the allocators

use crate::error::{MemoryError, MemoryResult};

/// Alignment every metadata block is padded to.
///
/// Headers sized to this keep the payload at the same alignment as the
/// block the parent handed out, which is what SIMD element types need.
pub const METADATA_ALIGN: usize = 16;

/// Aligns a value up to the nearest multiple of alignment
///
/// # Examples
/// ```
/// use nebula_alloc::utils::align_up;
///
/// assert_eq!(align_up(7, 8), 8);
/// assert_eq!(align_up(8, 8), 8);
/// assert_eq!(align_up(9, 8), 16);
/// ```
#[inline(always)]
pub const fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Checks if a value is aligned to the given alignment
#[inline(always)]
pub const fn is_aligned(value: usize, alignment: usize) -> bool {
    value & (alignment - 1) == 0
}

/// `size + extra`, reporting overflow as an error naming `operation`
#[inline]
pub(crate) fn padded_size(size: usize, extra: usize, operation: &str) -> MemoryResult<usize> {
    size.checked_add(extra)
        .ok_or_else(|| MemoryError::size_overflow(operation))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_metadata() {
        assert_eq!(align_up(1, METADATA_ALIGN), 16);
        assert_eq!(align_up(16, METADATA_ALIGN), 16);
        assert_eq!(align_up(17, METADATA_ALIGN), 32);
    }

    #[test]
    fn is_aligned_checks_low_bits() {
        assert!(is_aligned(32, METADATA_ALIGN));
        assert!(!is_aligned(40, METADATA_ALIGN));
    }

    #[test]
    fn padded_size_detects_overflow() {
        assert_eq!(padded_size(10, 16, "t").unwrap(), 26);
        let err = padded_size(usize::MAX, 16, "arena header").unwrap_err();
        assert!(err.to_string().contains("arena header"));
    }
}
