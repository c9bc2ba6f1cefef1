//!
//! @file scan.rs
//! @author Andrew Spaulding (Kasplat)
//! @brief Scalar and vectorized signature scanning over byte ranges.
//! @bug No known bugs.
//!
//! Two scanning backends are provided. The scalar backend compares one byte
//! at a time. The vectorized backend compares 16-byte windows with a packed
//! equal-with-mask test, and is eligible only for patterns of at most 16
//! bytes on hosts that report SSE4.2. The two backends return identical
//! results for every pattern and buffer; windows too close to the end of the
//! buffer for a full 16-byte load are finished by the scalar comparison so
//! that neither backend ever reads past the searched range.
//!

use crate::pattern::Pattern;

impl Pattern {
    ///
    /// Scans the given data for the first occurrence of this pattern.
    ///
    /// Returns the lowest offset whose bytes agree with the pattern at every
    /// non-wildcard position, or None if the range contains no match. A miss
    /// is an expected outcome, not an error.
    ///
    pub fn find(
        &self,
        data: &[u8]
    ) -> Option<usize> {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            if self.len() <= 16 && std::arch::is_x86_feature_detected!("sse4.2") {
                // SAFETY: SSE4.2 support was just confirmed on this host.
                return unsafe { sse::find(self, data) };
            }
        }

        self.find_scalar(data)
    }

    ///
    /// Scans with the scalar backend unconditionally.
    ///
    /// Exposed so callers can compare backends; find() should be preferred.
    ///
    pub fn find_scalar(
        &self,
        data: &[u8]
    ) -> Option<usize> {
        let len = self.len();
        if len > data.len() {
            return None;
        }

        (0..=(data.len() - len)).find(|i| self.matches_at(data, *i))
    }

    ///
    /// Scans a raw memory range for the first occurrence of this pattern.
    ///
    /// In order to use this function safely, the entire range denoted by
    /// base/len must be mapped and readable for the duration of the call.
    ///
    pub unsafe fn find_in(
        &self,
        base: *const u8,
        len: usize
    ) -> Option<usize> {
        assert!(!base.is_null());
        self.find(std::slice::from_raw_parts(base, len))
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
mod sse {
    use crate::pattern::Pattern;

    #[cfg(target_arch = "x86")]
    use std::arch::x86::*;
    #[cfg(target_arch = "x86_64")]
    use std::arch::x86_64::*;

    ///
    /// Finds the first match of a (<= 16 byte) pattern using SSE4.2.
    ///
    /// Each candidate window is compared byte-for-byte against the pattern in
    /// one packed operation, producing a bit per position. The required
    /// positions (the pattern mask) are then tested against that result; a
    /// window matches when no required position miscompared.
    ///
    #[target_feature(enable = "sse4.2")]
    pub (in crate) unsafe fn find(
        pat: &Pattern,
        data: &[u8]
    ) -> Option<usize> {
        let len = pat.len();
        assert!(len <= 16);

        if len > data.len() {
            return None;
        }

        // One bit per pattern position, set for positions that must compare.
        let mut need = [0u8; 16];
        for (c, m) in pat.mask().iter().enumerate() {
            need[c / 8] |= (*m as u8) << (c % 8);
        }

        let mut comparand = [0u8; 16];
        comparand.split_at_mut(len).0.copy_from_slice(pat.bytes());

        let need = _mm_loadu_si128(need.as_ptr().cast());
        let comparand = _mm_loadu_si128(comparand.as_ptr().cast());

        for i in 0..=(data.len() - len) {
            if i + 16 > data.len() {
                // A full window would read past the range; finish scalar.
                if pat.matches_at(data, i) {
                    return Some(i);
                }
                continue;
            }

            let window = _mm_loadu_si128(data.as_ptr().add(i).cast());
            let equal = _mm_cmpestrm::<{ _SIDD_UBYTE_OPS | _SIDD_CMP_EQUAL_EACH | _SIDD_BIT_MASK }>(
                window,
                16,
                comparand,
                len as i32
            );

            // Every required position must have compared equal.
            let hits = _mm_and_si128(need, equal);
            let misses = _mm_xor_si128(need, hits);
            if _mm_test_all_zeros(misses, misses) == 1 {
                return Some(i);
            }
        }

        None
    }
}
