// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for safely interacting with caller memory.
//!
//! Callers are either partitions or the non-secure world. Neither is trusted,
//! and the non-secure world may be running on another core, changing memory
//! while we look at it. So the SPM never forms references into caller memory:
//! it copies what it needs in or out with volatile accesses, after checking
//! the caller's right to the whole range.

use core::marker::PhantomData;

use abi::{FaultInfo, PsaOutvec, UsageError};
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::hal::Hal;
use crate::memcheck::{Access, Accessor};
use crate::state::SpmState;

/// A (caller, untrusted) slice.
///
/// A `USlice` is an _allegation_ from a caller that a section of address
/// space holds some `T`s it's entitled to. Having one tells you:
///
/// - The base of the section is correctly aligned for type `T`.
/// - The section does not wrap around the end of the address space.
///
/// It does _not_ tell you the caller has access to that memory; that's what
/// `SpmState::copy_in` and `SpmState::copy_out` check.
pub struct USlice<T> {
    base_address: usize,
    length: usize,
    _marker: PhantomData<*mut [T]>,
}

impl<T> USlice<T> {
    /// Constructs a `USlice` given a base address and length passed from
    /// untrusted code.
    ///
    /// This will only succeed if such a slice would not overlap or touch the
    /// top of the address space, and if `base_address` is correctly aligned for
    /// `T`. Zero-sized `T` are rejected.
    pub fn from_raw(base_address: usize, length: usize) -> Result<Self, UsageError> {
        if core::mem::size_of::<T>() == 0 {
            return Err(UsageError::InvalidSlice);
        }
        if base_address % core::mem::align_of::<T>() != 0 {
            return Err(UsageError::InvalidSlice);
        }
        let size_in_bytes = length
            .checked_mul(core::mem::size_of::<T>())
            .ok_or(UsageError::InvalidSlice)?;
        // Can't underflow: anything can be subtracted from usize::MAX.
        let highest_possible_base = usize::MAX - size_in_bytes;
        if base_address <= highest_possible_base {
            Ok(Self {
                base_address,
                length,
                _marker: PhantomData,
            })
        } else {
            Err(UsageError::InvalidSlice)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Returns the number of `T`s in this slice.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn base_addr(&self) -> usize {
        self.base_address
    }

    /// Size of the slice in bytes. Checked not to overflow at construction.
    pub fn byte_len(&self) -> usize {
        self.length.wrapping_mul(core::mem::size_of::<T>())
    }

    pub fn end_addr(&self) -> usize {
        self.base_address.wrapping_add(self.byte_len())
    }
}

impl<T: FromBytes + Copy> USlice<T> {
    /// Copies the slice's contents into `out`, one element at a time.
    ///
    /// # Safety
    ///
    /// Unchecked: the caller must have established that the memory is
    /// readable, and `out` must be at least as long as the slice.
    pub unsafe fn read_into(&self, out: &mut [T]) {
        let src = self.base_address as *const T;
        for (i, slot) in out.iter_mut().take(self.length).enumerate() {
            // Safety: in range and aligned per construction; any bit pattern
            // is a valid T.
            *slot = unsafe { core::ptr::read_volatile(src.add(i)) };
        }
    }
}

impl<T: IntoBytes + Immutable + Copy> USlice<T> {
    /// Copies `data` into the slice, one element at a time.
    ///
    /// # Safety
    ///
    /// Unchecked: the caller must have established that the memory is
    /// writable.
    pub unsafe fn write_from(&self, data: &[T]) {
        let dst = self.base_address as *mut T;
        for (i, v) in data.iter().take(self.length).enumerate() {
            unsafe { core::ptr::write_volatile(dst.add(i), *v) };
        }
    }
}

impl<T> spmcore::UserSlice for USlice<T> {
    fn is_empty(&self) -> bool {
        self.length == 0
    }

    fn base_addr(&self) -> usize {
        self.base_address
    }

    fn end_addr(&self) -> usize {
        USlice::end_addr(self)
    }
}

/// Copies `len` bytes from `src` to `dst` with volatile byte accesses.
///
/// # Safety
///
/// Both ranges must have been checked for the relevant access, and must not
/// overlap.
pub unsafe fn copy_bytes(src: usize, dst: usize, len: usize) {
    let (src, dst) = (src as *const u8, dst as *mut u8);
    for i in 0..len {
        unsafe {
            core::ptr::write_volatile(dst.add(i), core::ptr::read_volatile(src.add(i)));
        }
    }
}

/// Stores `len` into the `len` field of entry `idx` of the caller's outvec
/// table at `table`, leaving `base` alone.
///
/// # Safety
///
/// The table must have been checked writable for its owner and have more
/// than `idx` entries.
pub unsafe fn store_outvec_len(table: usize, idx: usize, len: usize) {
    let entry = (table as *mut PsaOutvec).wrapping_add(idx);
    unsafe { core::ptr::addr_of_mut!((*entry).len).write_volatile(len) };
}

impl<H: Hal> SpmState<H> {
    /// Reads a caller's slice into SPM memory after checking that `who` may
    /// access it as `access`.
    ///
    /// Tables that the SPM will later write back into (outvec tables) are
    /// checked read-write here, even though this only reads them.
    pub fn copy_in<T: FromBytes + Copy>(
        &self,
        who: &Accessor,
        slice: &USlice<T>,
        access: Access,
        out: &mut [T],
    ) -> Result<(), FaultInfo> {
        if out.len() < slice.len() {
            return Err(FaultInfo::Integrity);
        }
        self.memory_check(who, slice.base_addr(), slice.byte_len(), access)?;
        // Safety: access checked just above; `out` is long enough.
        unsafe { slice.read_into(out) };
        Ok(())
    }

    /// Writes `data` into a caller's slice after checking that `who` may
    /// write it.
    pub fn copy_out<T: IntoBytes + Immutable + Copy>(
        &self,
        who: &Accessor,
        slice: &USlice<T>,
        data: &[T],
    ) -> Result<(), FaultInfo> {
        self.memory_check(who, slice.base_addr(), slice.byte_len(), Access::ReadWrite)?;
        // Safety: access checked just above.
        unsafe { slice.write_from(data) };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_raw_checks() {
        assert!(USlice::<u32>::from_raw(0x1002, 1).is_err());
        assert!(USlice::<u32>::from_raw(usize::MAX - 3, 1).is_err());
        assert!(USlice::<u32>::from_raw(usize::MAX - 7, 1).is_ok());
        assert!(USlice::<u64>::from_raw(0x1000, usize::MAX / 4).is_err());
        let s = USlice::<u32>::from_raw(0x1000, 4).unwrap();
        assert_eq!(s.byte_len(), 16);
        assert_eq!(s.end_addr(), 0x1010);
        assert!(USlice::<()>::from_raw(0x1000, 1).is_err());
    }

    #[test]
    fn volatile_copies() {
        let src = [1u32, 2, 3, 4];
        let mut dst = [0u32; 4];
        let s = USlice::<u32>::from_raw(src.as_ptr() as usize, 3).unwrap();
        let mut out = [0u32; 4];
        unsafe { s.read_into(&mut out) };
        assert_eq!(out, [1, 2, 3, 0]);

        let d = USlice::<u32>::from_raw(dst.as_mut_ptr() as usize, 2).unwrap();
        unsafe { d.write_from(&[9, 8, 7]) };
        assert_eq!(dst, [9, 8, 0, 0]);

        let bytes = *b"hello";
        let mut sink = [0u8; 5];
        unsafe { copy_bytes(bytes.as_ptr() as usize, sink.as_mut_ptr() as usize, 5) };
        assert_eq!(&sink, b"hello");
    }

    #[test]
    fn outvec_len_only() {
        let mut table = [PsaOutvec { base: 0x2000, len: 16 }; 2];
        unsafe { store_outvec_len(table.as_mut_ptr() as usize, 1, 5) };
        assert_eq!(table[0], PsaOutvec { base: 0x2000, len: 16 });
        assert_eq!(table[1], PsaOutvec { base: 0x2000, len: 5 });
    }
}
