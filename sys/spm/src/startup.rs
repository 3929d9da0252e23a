// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SPM startup, and how exception handlers find the SPM afterwards.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::hal::Hal;
use crate::state::SpmState;

/// What the exception handlers need from the SPM, without knowing its `Hal`.
pub trait SpmEntry {
    fn svc_entry(&mut self);
    fn pendsv(&mut self);
    fn irq_entry(&mut self, line: u32);
}

impl<H: Hal> SpmEntry for SpmState<H> {
    fn svc_entry(&mut self) {
        SpmState::svc_entry(self)
    }

    fn pendsv(&mut self) {
        SpmState::pendsv(self)
    }

    fn irq_entry(&mut self, line: u32) {
        SpmState::irq_entry(self, line)
    }
}

/// Tracks when a mutable reference to the SPM is floating around, to prevent
/// production of a second one.
///
/// Starts out `true`, which keeps `with_spm` from being used before
/// `start_spm` has installed the state.
static SPM_IN_USE: AtomicBool = AtomicBool::new(true);

static mut SPM: Option<&'static mut dyn SpmEntry> = None;

/// Installs `spm` as the system's SPM, starts its partitions and runs the
/// first one.
///
/// # Safety
///
/// Must be called once, from the main stack in privileged Handler or Thread
/// mode, before any exception that reaches the SPM is enabled.
pub unsafe fn start_spm<H: Hal + 'static>(spm: &'static mut SpmState<H>) -> ! {
    if let Err(fault) = spm.start() {
        spm.panic(fault);
    }
    // Safety: nothing else can see `SPM` until the flag below is cleared.
    unsafe {
        *core::ptr::addr_of_mut!(SPM) = Some(spm);
    }
    SPM_IN_USE.store(false, Ordering::Release);
    crate::arch::start_first_thread()
}

/// Runs `body` with the SPM.
///
/// Exception handlers at the same priority can't preempt each other, so
/// finding the SPM already in use means something has gone badly wrong, and
/// that's a panic.
pub fn with_spm<R>(body: impl FnOnce(&mut dyn SpmEntry) -> R) -> R {
    if SPM_IN_USE.swap(true, Ordering::Acquire) {
        panic!("recursive use of SPM");
    }
    // Safety: the flag guarantees this is the only reference for now.
    let spm = unsafe { (*core::ptr::addr_of_mut!(SPM)).as_deref_mut() };
    let Some(spm) = spm else {
        panic!("SPM not installed");
    };
    let r = body(spm);
    SPM_IN_USE.store(false, Ordering::Release);
    r
}
