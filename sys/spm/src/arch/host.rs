// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host stand-in for the architecture layer.
//!
//! There is no exception return on the host: whoever drives the SPM (the
//! tests, in practice) plays the part of the hardware. It loads a supervisor
//! call into a thread's saved registers, calls `SpmState::svc_entry`, and
//! calls `SpmState::pendsv` whenever `SpmState::switch_pending` says the SPM
//! asked for one. The register file below is shaped like the ARMv8-M one so
//! that the portable code sees the same argument and return slots.

use abi::MemRange;

macro_rules! uassert {
    ($cond:expr) => {
        assert!($cond)
    };
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SavedState {
    /// r4 through r11. Supervisor call arguments arrive in r4-r7 and the
    /// call number in r11.
    regs: [usize; 8],
    /// r0 through r3 of the exception frame built by `enter_function`.
    frame: [usize; 4],
    psp: usize,
    psplim: usize,
    pc: usize,
    privileged: bool,
}

impl crate::thread::ArchState for SavedState {
    fn stack_pointer(&self) -> usize {
        self.psp
    }

    fn arg0(&self) -> usize {
        self.regs[0]
    }
    fn arg1(&self) -> usize {
        self.regs[1]
    }
    fn arg2(&self) -> usize {
        self.regs[2]
    }
    fn arg3(&self) -> usize {
        self.regs[3]
    }

    fn syscall_descriptor(&self) -> u32 {
        self.regs[7] as u32
    }

    fn ret0(&mut self, x: usize) {
        self.regs[0] = x;
    }
}

impl SavedState {
    /// Loads registers as a thread would before issuing `svc`.
    pub fn load_syscall(&mut self, nr: u32, args: [usize; 4]) {
        self.regs[..4].copy_from_slice(&args);
        self.regs[7] = nr as usize;
    }

    /// Value the thread will find in its first return register.
    pub fn return_value(&self) -> usize {
        self.regs[0]
    }

    /// Arguments the thread will find on entry to its current function.
    pub fn entry_args(&self) -> [usize; 4] {
        self.frame
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    pub fn stack_limit(&self) -> usize {
        self.psplim
    }
}

/// Prepares `save` to start a thread at `entry` with `param` as its only
/// argument.
pub fn init_thread_context(
    save: &mut SavedState,
    entry: usize,
    param: usize,
    stack: &MemRange,
    privileged: bool,
) {
    enter_function(save, entry, [param, 0, 0, 0], stack, privileged);
}

/// Prepares `save` so that the next return to it calls `entry(args...)` on a
/// fresh frame at the top of `stack`.
pub fn enter_function(
    save: &mut SavedState,
    entry: usize,
    args: [usize; 4],
    stack: &MemRange,
    privileged: bool,
) {
    uassert!(!stack.is_empty());
    *save = SavedState {
        frame: args,
        psp: stack.limit & !0x7,
        psplim: stack.base,
        pc: entry,
        privileged,
        ..SavedState::default()
    };
}

/// Records `save` as the register file to restore on exception return.
///
/// # Safety
///
/// Nothing to uphold on the host; the signature matches the target, where
/// the pointer escapes.
pub unsafe fn set_current_save(_save: &SavedState) {}

/// On the host the driver polls `SpmState::switch_pending` instead.
pub fn pend_context_switch() {}

pub fn reset() -> ! {
    panic!("SYSTEM RESET");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ArchState;

    #[test]
    fn entry_builds_aligned_frame() {
        let mut save = SavedState::default();
        save.load_syscall(0x43, [1, 2, 3, 4]);
        enter_function(
            &mut save,
            0x1000_0101,
            [9, 8, 7, 6],
            &MemRange::new(0x3000_0000, 0x3000_0ffd),
            false,
        );
        assert_eq!(save.stack_pointer(), 0x3000_0ff8);
        assert_eq!(save.stack_limit(), 0x3000_0000);
        assert_eq!(save.entry_args(), [9, 8, 7, 6]);
        assert_eq!(save.syscall_descriptor(), 0);
        assert!(!save.is_privileged());
    }

    #[test]
    fn syscall_slots() {
        let mut save = SavedState::default();
        save.load_syscall(0x45, [0xF0, 0x8000_0000, 0, 0]);
        assert_eq!(save.syscall_descriptor(), 0x45);
        assert_eq!(save.arg1(), 0x8000_0000);
        save.ret0(5);
        assert_eq!(save.return_value(), 5);
        assert_eq!(save.arg0(), 5);
    }
}
