// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Aligns addresses and pointers to exact powers of two.
//!
//! The integer helpers are used to round sizes and addresses to page
//! boundaries. [`align_ptr_up`] finds the first aligned position inside
//! a buffer, which is how a thread stack's usable base is carved out of
//! a larger, unaligned allocation.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(deprecated_in_future)]
#![deny(keyword_idents)]
#![forbid(unsafe_code)]
#![deny(unused_crate_dependencies)]

/// An internal macro to implement alignment both up and
/// down for an unsigned integer type.
///
macro_rules! align_up_and_down {
    ($t:ty, $align_up:ident, $align_down:ident) => {
        /// Rounds `value` up to the nearest multiple of `align`.
        ///
        /// # Panics
        ///
        /// Panics if `align` is not a power of two, or if the
        /// rounded value does not fit in the type.
        ///
        pub const fn $align_up(value: $t, align: $t) -> $t {
            assert!(align.is_power_of_two(), "`align` must be a power of two");
            let mask = align - 1;
            if value & mask == 0 {
                value
            } else {
                (value | mask) + 1
            }
        }

        /// Rounds `value` down to the nearest multiple of `align`.
        ///
        /// # Panics
        ///
        /// Panics if `align` is not a power of two.
        ///
        pub const fn $align_down(value: $t, align: $t) -> $t {
            assert!(align.is_power_of_two(), "`align` must be a power of two");
            value & !(align - 1)
        }
    };
}

align_up_and_down! { usize, align_up_usize, align_down_usize }

/// Returns whether `value` is an exact multiple of `align`.
///
/// # Panics
///
/// Panics if `align` is not a power of two.
///
pub const fn is_aligned_usize(value: usize, align: usize) -> bool {
    align_down_usize(value, align) == value
}

/// Returns the first address at or after `ptr` that is a
/// multiple of `align`.
///
/// The result keeps `ptr`'s provenance, so it can be used to
/// access the buffer `ptr` points into, provided the buffer
/// extends at least `align - 1` bytes past `ptr`.
///
/// # Panics
///
/// Panics if `align` is not a power of two.
///
pub fn align_ptr_up(ptr: *mut u8, align: usize) -> *mut u8 {
    let addr = ptr as usize;
    let offset = align_up_usize(addr, align) - addr;
    ptr.wrapping_add(offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_integers() {
        // (value, align, up, down)
        let cases: [(usize, usize, usize, usize); 12] = [
            (0, 1, 0, 0),
            (1, 1, 1, 1),
            (3, 1, 3, 3),
            (1, 2, 2, 0),
            (3, 2, 4, 2),
            (4, 2, 4, 4),
            (5, 4, 8, 4),
            (2, 128, 128, 0),
            (512, 512, 512, 512),
            (513, 512, 1024, 512),
            (4095, 4096, 4096, 0),
            (0x1001, 0x1000, 0x2000, 0x1000),
        ];

        for (value, align, up, down) in cases.iter().copied() {
            assert_eq!(align_up_usize(value, align), up, "align_up({}, {})", value, align);
            assert_eq!(align_down_usize(value, align), down, "align_down({}, {})", value, align);
        }

        assert_eq!(align_up_usize(2, 0x8000_0000_0000), 0x8000_0000_0000);
        assert_eq!(align_down_usize(2, 0x8000_0000_0000), 0);
    }

    #[test]
    fn test_is_aligned() {
        assert!(is_aligned_usize(0, 4096));
        assert!(is_aligned_usize(8192, 4096));
        assert!(!is_aligned_usize(8193, 4096));
        assert!(is_aligned_usize(7, 1));
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn test_bad_alignment() {
        align_up_usize(5, 3);
    }

    #[test]
    fn test_align_ptr_up() {
        let mut buf = [0u8; 256];
        let base = buf.as_mut_ptr();

        for align in [1usize, 2, 8, 16, 64].iter().copied() {
            for start in 0..align {
                let ptr = base.wrapping_add(start);
                let aligned = align_ptr_up(ptr, align);
                assert_eq!(aligned as usize % align, 0);
                assert!(aligned >= ptr);
                assert!((aligned as usize) - (ptr as usize) < align);
            }
        }

        // An aligned pointer is returned unchanged.
        let aligned = align_ptr_up(base, 1);
        assert_eq!(aligned, base);
    }
}
