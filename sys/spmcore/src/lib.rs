// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Portable address-range algorithms used by the SPM.
//!
//! Everything in here is independent of the SPM's own types so that it can be
//! exercised on the host without any of the architecture support. The SPM
//! (and the `abi` crate) implement the traits below for their own range and
//! region types.

// Allow std-y things to be used in test. Note that this attribute is a bit of a
// trap for the programmer, because rust-analyzer by default seems to build
// things with test set. This means it's easy to introduce code incompatible
// with no_std without your editor hassling you about it. Beware.
#![cfg_attr(not(test), no_std)]
#![forbid(clippy::wildcard_imports)]

/// Describes types that act as "slices" (base and length pairs) handed to the
/// SPM by a caller.
///
/// Taken by itself, a `UserSlice` doesn't let you access anything. It's an
/// allegation that a caller owns some memory.
///
/// # Invariants
///
/// `s.is_empty()` implies `s.base_addr() == s.end_addr()`, and vice versa.
///
/// `s.base_addr() <= s.end_addr()` must hold.
pub trait UserSlice {
    /// Checks whether the slice spans zero bytes.
    fn is_empty(&self) -> bool;

    /// The address of the first byte included in this slice.
    fn base_addr(&self) -> usize;

    /// The address of the first byte _not_ included in this slice.
    ///
    /// This prevents a slice from touching the very top of the address space,
    /// which the constructors in this crate refuse anyway.
    fn end_addr(&self) -> usize;
}

impl<T: UserSlice> UserSlice for &T {
    #[inline(always)]
    fn is_empty(&self) -> bool {
        (**self).is_empty()
    }

    #[inline(always)]
    fn base_addr(&self) -> usize {
        (**self).base_addr()
    }

    #[inline(always)]
    fn end_addr(&self) -> usize {
        (**self).end_addr()
    }
}

/// Describes a static memory region: a security region, an isolation
/// boundary, a partition's code, and so on.
///
/// # Invariants
///
/// `r.contains(x)` implies `r.base_addr() <= x < r.end_addr()` and vice versa.
pub trait MemoryRegion {
    fn contains(&self, addr: usize) -> bool;
    fn base_addr(&self) -> usize;
    fn end_addr(&self) -> usize;
}

impl<T: MemoryRegion> MemoryRegion for &T {
    #[inline(always)]
    fn contains(&self, addr: usize) -> bool {
        (**self).contains(addr)
    }

    #[inline(always)]
    fn base_addr(&self) -> usize {
        (**self).base_addr()
    }

    #[inline(always)]
    fn end_addr(&self) -> usize {
        (**self).end_addr()
    }
}

/// A raw `[base, base + size)` byte range that is known not to wrap.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ByteRange {
    base: usize,
    end: usize,
}

impl ByteRange {
    /// Builds a range from an untrusted base and size.
    ///
    /// Returns `None` if the range would run off the end of the address
    /// space, or if it has a null base and a nonzero size.
    pub fn new(base: usize, size: usize) -> Option<Self> {
        if base == 0 && size != 0 {
            return None;
        }
        let end = base.checked_add(size)?;
        Some(Self { base, end })
    }

    pub fn len(&self) -> usize {
        self.end - self.base
    }
}

impl UserSlice for ByteRange {
    fn is_empty(&self) -> bool {
        self.base == self.end
    }

    fn base_addr(&self) -> usize {
        self.base
    }

    fn end_addr(&self) -> usize {
        self.end
    }
}

/// Checks whether `region` wholly contains `slice`.
///
/// Empty slices are contained in nothing; the protocol layer treats them as
/// trivially accessible before it gets this far.
#[inline]
pub fn region_covers(region: &impl MemoryRegion, slice: &impl UserSlice) -> bool {
    if slice.is_empty() {
        return false;
    }
    // end_addr is exclusive for both, and base <= end holds for both, so
    // these two comparisons are sufficient.
    slice.base_addr() >= region.base_addr()
        && slice.end_addr() <= region.end_addr()
}

/// Finds the single region in `table` that wholly contains `slice`.
///
/// This returns `None` if no region contains the slice, if the slice straddles
/// a boundary, or if more than one region claims it. The last case means the
/// table itself is inconsistent, and we refuse to guess which entry wins.
pub fn sole_containing_region<'t, R>(
    slice: &impl UserSlice,
    table: &'t [R],
) -> Option<&'t R>
where
    R: MemoryRegion,
{
    let mut found = None;
    for region in table {
        if region_covers(region, slice) {
            if found.is_some() {
                return None;
            }
            found = Some(region);
        }
    }
    found
}

/// Checks whether two slices share at least one byte.
///
/// Empty slices overlap nothing, including themselves.
#[inline]
pub fn ranges_overlap(a: &impl UserSlice, b: &impl UserSlice) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a.base_addr() < b.end_addr() && b.base_addr() < a.end_addr()
}

/// Checks a list of slices for any pairwise overlap.
///
/// Returns the indices of the first overlapping pair found, in ascending
/// order.
pub fn first_overlap<S: UserSlice>(slices: &[S]) -> Option<(usize, usize)> {
    for (i, a) in slices.iter().enumerate() {
        for (j, b) in slices.iter().enumerate().skip(i + 1) {
            if ranges_overlap(a, b) {
                return Some((i, j));
            }
        }
    }
    None
}
