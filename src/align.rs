//! Alignment arithmetic shared by the allocators.
//!
//! All functions in this module require `align` to be a power of two. This is
//! checked in debug builds only; passing any other value yields an
//! unspecified result.

/// Rounds `value` up to the nearest multiple of `align`.
///
/// The result wraps if `value + align - 1` overflows a `usize`; use
/// [`checked_align_up`] when `value` is caller-controlled.
///
/// # Examples
///
/// ```
/// use carve_alloc::align::align_up;
///
/// assert_eq!(align_up(13, 8), 16);
/// assert_eq!(align_up(16, 8), 16);
/// assert_eq!(align_up(0, 8), 0);
/// ```
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());

    value.wrapping_add(align).wrapping_sub(1) & !align.wrapping_sub(1)
}

/// Rounds `value` up to the nearest multiple of `align`, returning `None` on
/// overflow.
#[inline]
pub const fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());

    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Returns `true` if `value` is a multiple of `align`.
///
/// # Examples
///
/// ```
/// use carve_alloc::align::is_aligned;
///
/// assert!(is_aligned(64, 16));
/// assert!(!is_aligned(72, 16));
/// ```
#[inline]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    debug_assert!(align.is_power_of_two());

    value & (align - 1) == 0
}
