// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Memory access checks.
//!
//! Before the SPM touches memory named by a caller, it asks two questions of
//! the platform: which side of the security boundary the range is on, and
//! what the isolation hardware would let the caller do there. Both answers
//! have to cover the whole range.
//!
//! [`MemoryMap`] gives the answers for a plain static memory map, and is what
//! platform `Hal`s (and the host one) delegate to.

use abi::{FaultInfo, IsolationLevel, MemRange, MemoryLayout, PartitionDesc};
use spmcore::{region_covers, sole_containing_region, ByteRange, MemoryRegion};

use crate::hal::{Hal, MemAttr, SecurityAttr};
use crate::state::SpmState;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Privilege {
    Privileged,
    Unprivileged,
}

impl From<bool> for Privilege {
    fn from(privileged: bool) -> Self {
        if privileged {
            Self::Privileged
        } else {
            Self::Unprivileged
        }
    }
}

/// Decides whether `attr` allows `access` at `privilege`.
pub fn check_access_attr(attr: &MemAttr, access: Access, privilege: Privilege) -> bool {
    if !attr.is_valid {
        return false;
    }
    if !attr.is_mpu_enabled {
        return true;
    }
    match (privilege, access) {
        (Privilege::Privileged, Access::ReadOnly) => attr.priv_rd,
        (Privilege::Privileged, Access::ReadWrite) => attr.priv_rd && attr.priv_wr,
        (Privilege::Unprivileged, Access::ReadOnly) => attr.unpriv_rd,
        (Privilege::Unprivileged, Access::ReadWrite) => {
            attr.unpriv_rd && attr.unpriv_wr
        }
    }
}

/// Decides whether a caller may access `[base, base + size)`.
///
/// `partition` is the secure partition on whose behalf the access happens;
/// it is only consulted for secure callers, and a secure caller without one
/// is refused.
pub fn has_access(
    hal: &impl Hal,
    partition: Option<&PartitionDesc>,
    base: usize,
    size: usize,
    ns_caller: bool,
    access: Access,
    privilege: Privilege,
) -> bool {
    if ByteRange::new(base, size).is_none() {
        return false;
    }

    let sec = hal.mem_security_attr(base, size);
    if !sec.is_valid {
        return false;
    }
    // Non-secure callers only get non-secure memory, and vice versa.
    if ns_caller == sec.is_secure {
        return false;
    }

    let attr = if ns_caller {
        hal.ns_access_attr(base, size)
    } else {
        match partition {
            Some(p) => hal.secure_access_attr(base, size, p),
            None => return false,
        }
    };
    check_access_attr(&attr, access, privilege)
}

/// A region of the memory map, tagged with what it means.
#[derive(Copy, Clone, Debug)]
struct Tagged<T> {
    range: MemRange,
    tag: T,
}

impl<T> MemoryRegion for Tagged<T> {
    fn contains(&self, addr: usize) -> bool {
        self.range.contains(addr)
    }

    fn base_addr(&self) -> usize {
        self.range.base
    }

    fn end_addr(&self) -> usize {
        self.range.limit
    }
}

/// Attribute lookups over a static memory map.
#[derive(Clone, Debug)]
pub struct MemoryMap {
    layout: MemoryLayout,
    isolation: IsolationLevel,
}

impl MemoryMap {
    pub fn new(layout: MemoryLayout, isolation: IsolationLevel) -> Self {
        Self { layout, isolation }
    }

    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    /// Isolation is only enforced inside the secure world above level 1.
    fn mpu_enabled(&self) -> bool {
        self.isolation >= IsolationLevel::Level2
    }

    pub fn security_attr(&self, base: usize, size: usize) -> SecurityAttr {
        let Some(range) = ByteRange::new(base, size) else {
            return SecurityAttr::default();
        };
        let l = &self.layout;
        let table = [
            Tagged { range: l.s_data, tag: true },
            Tagged { range: l.s_code, tag: true },
            Tagged { range: l.ns_data, tag: false },
            Tagged { range: l.ns_code, tag: false },
        ];
        match sole_containing_region(&range, &table) {
            Some(r) => SecurityAttr {
                is_valid: true,
                is_secure: r.tag,
            },
            None => SecurityAttr::default(),
        }
    }

    pub fn secure_access_attr(
        &self,
        base: usize,
        size: usize,
        partition: &PartitionDesc,
    ) -> MemAttr {
        let Some(range) = ByteRange::new(base, size) else {
            return MemAttr::INVALID;
        };
        let l = &self.layout;
        let mpu = self.mpu_enabled();

        // Searched in order; the first region holding the whole range wins.
        // The partition's own regions sit inside the secure ones, so they
        // have to come first.
        let isolated = [
            Tagged { range: l.spm_unpriv_code, tag: MemAttr::code(true) },
            Tagged { range: l.spm_unpriv_data, tag: MemAttr::data(true) },
            Tagged { range: partition.code, tag: MemAttr::code(true) },
            Tagged { range: partition.data, tag: MemAttr::data(true) },
            Tagged {
                range: l.s_data,
                tag: MemAttr::data(true).privileged_only(),
            },
            Tagged {
                range: l.s_code,
                tag: MemAttr::code(true).privileged_only(),
            },
        ];
        let flat = [
            Tagged { range: l.s_data, tag: MemAttr::data(false) },
            Tagged { range: l.s_code, tag: MemAttr::code(false) },
        ];
        let table: &[Tagged<MemAttr>] = if mpu { &isolated } else { &flat };
        table
            .iter()
            .find(|r| region_covers(*r, &range))
            .map_or(MemAttr::INVALID, |r| r.tag)
    }

    pub fn ns_access_attr(&self, base: usize, size: usize) -> MemAttr {
        let Some(range) = ByteRange::new(base, size) else {
            return MemAttr::INVALID;
        };
        let l = &self.layout;
        let mpu = self.mpu_enabled();
        if region_covers(&l.ns_data, &range) {
            MemAttr::data(mpu)
        } else if region_covers(&l.ns_code, &range) {
            MemAttr::code(mpu)
        } else {
            MemAttr::INVALID
        }
    }
}

/// Who an access is being made for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Accessor {
    /// Partition whose view of secure memory applies. `None` for requests
    /// from a non-secure core that has no partition here.
    pub partition: Option<usize>,
    pub ns: bool,
    pub privileged: bool,
}

impl<H: Hal> SpmState<H> {
    /// Checks that `who` may access `[base, base + size)`.
    ///
    /// Empty ranges are always accessible. Anything else that fails is a
    /// memory access fault, which is fatal.
    pub fn memory_check(
        &self,
        who: &Accessor,
        base: usize,
        size: usize,
        access: Access,
    ) -> Result<(), FaultInfo> {
        if size == 0 {
            return Ok(());
        }
        let desc = match who.partition {
            Some(p) => Some(self.partition(p).ok_or(FaultInfo::Integrity)?.desc()),
            None => None,
        };
        if has_access(
            &self.hal,
            desc,
            base,
            size,
            who.ns,
            access,
            who.privileged.into(),
        ) {
            Ok(())
        } else {
            Err(FaultInfo::MemoryAccess {
                address: base,
                size,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::host::HostHal;
    use abi::PartitionFlags;

    fn layout() -> MemoryLayout {
        MemoryLayout {
            s_code: MemRange::new(0x1000_0000, 0x1008_0000),
            s_data: MemRange::new(0x3000_0000, 0x3002_0000),
            ns_code: MemRange::new(0x0010_0000, 0x0020_0000),
            ns_data: MemRange::new(0x2000_0000, 0x2002_0000),
            spm_unpriv_code: MemRange::new(0x1007_0000, 0x1008_0000),
            spm_unpriv_data: MemRange::new(0x3001_f000, 0x3002_0000),
        }
    }

    fn app_partition() -> PartitionDesc {
        PartitionDesc {
            id: 0x100,
            flags: PartitionFlags::APP_ROT | PartitionFlags::IPC,
            priority: 1,
            entry: 0x1001_0001,
            code: MemRange::new(0x1001_0000, 0x1002_0000),
            data: MemRange::new(0x3000_4000, 0x3000_8000),
            stack: MemRange::new(0x3000_7000, 0x3000_8000),
            dependencies: &[],
            irqs: &[],
        }
    }

    #[test]
    fn attr_checks() {
        let ro = MemAttr::code(true);
        assert!(check_access_attr(&ro, Access::ReadOnly, Privilege::Unprivileged));
        assert!(!check_access_attr(&ro, Access::ReadWrite, Privilege::Privileged));
        let priv_rw = MemAttr::data(true).privileged_only();
        assert!(check_access_attr(&priv_rw, Access::ReadWrite, Privilege::Privileged));
        assert!(!check_access_attr(&priv_rw, Access::ReadOnly, Privilege::Unprivileged));
        // With isolation off, validity is all that matters.
        assert!(check_access_attr(
            &MemAttr::code(false),
            Access::ReadWrite,
            Privilege::Unprivileged
        ));
        assert!(!check_access_attr(&MemAttr::INVALID, Access::ReadOnly, Privilege::Privileged));
    }

    #[test]
    fn security_attribution() {
        let map = MemoryMap::new(layout(), IsolationLevel::Level2);
        assert_eq!(
            map.security_attr(0x3000_0000, 16),
            SecurityAttr { is_valid: true, is_secure: true }
        );
        assert_eq!(
            map.security_attr(0x2000_0100, 16),
            SecurityAttr { is_valid: true, is_secure: false }
        );
        assert!(!map.security_attr(0x3001_fff8, 16).is_valid);
        assert!(!map.security_attr(0x4000_0000, 4).is_valid);
        assert!(!map.security_attr(usize::MAX - 2, 8).is_valid);
    }

    #[test]
    fn level2_keeps_app_rot_in_its_lane() {
        let hal = HostHal::new(layout(), IsolationLevel::Level2);
        let p = app_partition();
        let check = |base, size, access| {
            has_access(&hal, Some(&p), base, size, false, access, Privilege::Unprivileged)
        };
        // Own data and code.
        assert!(check(0x3000_4000, 0x100, Access::ReadWrite));
        assert!(check(0x1001_0000, 0x100, Access::ReadOnly));
        assert!(!check(0x1001_0000, 0x100, Access::ReadWrite));
        // SPM data outside the partition.
        assert!(!check(0x3000_0000, 0x100, Access::ReadOnly));
        // Shared SPM regions.
        assert!(check(0x3001_f000, 0x10, Access::ReadWrite));
        assert!(check(0x1007_0000, 0x10, Access::ReadOnly));
        // Non-secure memory is off limits to a secure caller.
        assert!(!check(0x2000_0000, 0x10, Access::ReadOnly));
    }

    #[test]
    fn level1_only_checks_attribution() {
        let hal = HostHal::new(layout(), IsolationLevel::Level1);
        let p = app_partition();
        assert!(has_access(
            &hal,
            Some(&p),
            0x3000_0000,
            0x100,
            false,
            Access::ReadWrite,
            Privilege::Unprivileged
        ));
        assert!(!has_access(
            &hal,
            Some(&p),
            0x2000_0000,
            0x100,
            false,
            Access::ReadOnly,
            Privilege::Privileged
        ));
    }

    #[test]
    fn ns_callers_stay_non_secure() {
        let hal = HostHal::new(layout(), IsolationLevel::Level2);
        let ns = |base, size, access| {
            has_access(&hal, None, base, size, true, access, Privilege::Unprivileged)
        };
        assert!(ns(0x2000_0000, 0x100, Access::ReadWrite));
        assert!(ns(0x0010_0000, 0x100, Access::ReadOnly));
        assert!(!ns(0x0010_0000, 0x100, Access::ReadWrite));
        assert!(!ns(0x3000_0000, 0x100, Access::ReadOnly));
        assert!(!ns(0, 4, Access::ReadOnly));
    }
}
