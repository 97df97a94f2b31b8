//! This file contains all the helper functions for the pool.
//! These are functions that don't particularly belong to any concrete module of the crate.

/// Every chunk, block and context header is aligned to this many bytes.
pub const MAXIMUM_ALIGNOF: usize = 8;

/// It aligns `to_be_aligned` using `aligment`, which must be a power of two.
///
/// This is used to round block headers, context headers and large chunks up
/// to [`MAXIMUM_ALIGNOF`] so every address we hand out (or write a header to)
/// is correctly aligned for any primitive type.
pub const fn align(to_be_aligned: usize, aligment: usize) -> usize {
    (to_be_aligned + aligment - 1) & !(aligment - 1)
}

/// Shorthand for [`align`] with [`MAXIMUM_ALIGNOF`].
#[inline]
pub const fn maxalign(len: usize) -> usize {
    align(len, MAXIMUM_ALIGNOF)
}

/// Whether `len` is already a multiple of [`MAXIMUM_ALIGNOF`].
#[inline]
pub const fn is_maxaligned(len: usize) -> bool {
    len & (MAXIMUM_ALIGNOF - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_pointer_size() {
        let aligments = vec![(1..8, 8), (9..16, 16), (17..24, 24), (25..32, 32)];

        for (sizes, expected) in aligments {
            for size in sizes {
                assert_eq!(expected, maxalign(size));
            }
        }
    }

    #[test]
    fn align_to_kilobyte() {
        let aligments = vec![(1..1024, 1024), (1025..2048, 2048)];

        for (sizes, expected) in aligments {
            for size in sizes {
                assert_eq!(expected, align(size, 1024))
            }
        }
    }

    #[test]
    fn maxaligned_sizes() {
        assert!(is_maxaligned(0));
        assert!(is_maxaligned(1024));
        assert!(!is_maxaligned(1025));
        assert!(!is_maxaligned(4));
    }
}
