// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Leaving a note for tooling before the system resets.
//!
//! Debuggers find two symbols:
//!
//! - `SPM_HAS_FAILED` is a `bool`, zero until the SPM heads for reset through
//!   `SpmState::panic` or a Rust panic, one after.
//! - `SPM_EPITAPH` holds up to `EPITAPH_LEN` bytes of UTF-8 describing why,
//!   padded with NULs.

use core::fmt::{Debug, Display, Write};
use core::sync::atomic::Ordering;

use abi::FaultInfo;

#[used]
static mut SPM_HAS_FAILED: bool = false;

const EPITAPH_LEN: usize = 128;

#[used]
static mut SPM_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

fn begin_epitaph() -> &'static mut [u8; EPITAPH_LEN] {
    // Safety: only reached with interrupts masked on the way to reset.
    let previous_fail =
        unsafe { core::ptr::replace(core::ptr::addr_of_mut!(SPM_HAS_FAILED), true) };
    if previous_fail {
        // Failed while failing. Don't make it worse.
        loop {
            core::sync::atomic::fence(Ordering::SeqCst);
        }
    }
    // Safety: only the first caller gets past the flag.
    unsafe { &mut *core::ptr::addr_of_mut!(SPM_EPITAPH) }
}

struct Eulogist {
    dest: &'static mut [u8],
}

impl Write for Eulogist {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = core::mem::take(&mut self.dest).split_at_mut(n);
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}

/// Records `fault` in the epitaph.
pub fn record(fault: &FaultInfo) {
    write_epitaph(fault as &dyn Debug);
}

#[inline(never)]
fn write_epitaph(what: &dyn Debug) {
    let mut writer = Eulogist {
        dest: begin_epitaph(),
    };
    write!(writer, "{what:?}").ok();
}

#[inline(never)]
fn write_panic(msg: &dyn Display) {
    let mut writer = Eulogist {
        dest: begin_epitaph(),
    };
    write!(writer, "{msg}").ok();
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    write_panic(info);
    crate::arch::reset()
}
