// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Platform interface.
//!
//! Everything the SPM needs from the chip it runs on, other than the CPU
//! itself, goes through [`Hal`]: security attribution, memory permission
//! lookups, interrupt control, isolation switching, the inter-core mailbox
//! plumbing, and reset.

use abi::PartitionDesc;

#[cfg(not(target_os = "none"))]
pub mod host;

/// Security attribution of a memory range.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SecurityAttr {
    /// The whole range has a single attribution.
    pub is_valid: bool,
    pub is_secure: bool,
}

/// Access permissions of a memory range, as the isolation hardware would
/// enforce them.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MemAttr {
    /// The whole range falls inside one region with these permissions.
    pub is_valid: bool,
    /// Isolation is being enforced. When false, only `is_valid` matters.
    pub is_mpu_enabled: bool,
    pub is_xn: bool,
    pub priv_rd: bool,
    pub priv_wr: bool,
    pub unpriv_rd: bool,
    pub unpriv_wr: bool,
}

impl MemAttr {
    pub const INVALID: Self = Self {
        is_valid: false,
        is_mpu_enabled: false,
        is_xn: true,
        priv_rd: false,
        priv_wr: false,
        unpriv_rd: false,
        unpriv_wr: false,
    };

    /// Readable by both privilege levels, and executable.
    pub const fn code(mpu: bool) -> Self {
        Self {
            is_valid: true,
            is_mpu_enabled: mpu,
            is_xn: false,
            priv_rd: true,
            priv_wr: false,
            unpriv_rd: true,
            unpriv_wr: false,
        }
    }

    /// Readable and writable by both privilege levels.
    pub const fn data(mpu: bool) -> Self {
        Self {
            is_valid: true,
            is_mpu_enabled: mpu,
            is_xn: true,
            priv_rd: true,
            priv_wr: true,
            unpriv_rd: true,
            unpriv_wr: true,
        }
    }

    /// Accessible to privileged code only.
    pub const fn privileged_only(self) -> Self {
        Self {
            unpriv_rd: false,
            unpriv_wr: false,
            ..self
        }
    }
}

pub trait Hal {
    /// Works out whether `[base, base + size)` is secure or non-secure.
    fn mem_security_attr(&self, base: usize, size: usize) -> SecurityAttr;

    /// Permissions on a secure range, as seen while `partition` runs.
    fn secure_access_attr(
        &self,
        base: usize,
        size: usize,
        partition: &PartitionDesc,
    ) -> MemAttr;

    /// Permissions on a non-secure range.
    fn ns_access_attr(&self, base: usize, size: usize) -> MemAttr;

    fn enable_irq(&mut self, line: u32);
    fn disable_irq(&mut self, line: u32);
    fn clear_pending_irq(&mut self, line: u32);

    /// Reconfigures isolation so that `partition` can run, at the given
    /// privilege.
    fn activate_partition(&mut self, partition: &PartitionDesc, privileged: bool);

    /// Takes the lock shared with the non-secure core over the mailbox
    /// status words.
    fn mailbox_enter_critical(&mut self);
    fn mailbox_exit_critical(&mut self);
    /// Tells the non-secure core that replies are ready.
    fn mailbox_notify_peer(&mut self);

    fn system_reset(&mut self) -> !;
}
