// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for the secure side of ARMv8-M.
//!
//! Partitions run in secure Thread mode on the process stack; the SPM runs in
//! Handler mode on the main stack. There are three ways in:
//!
//! - `SVCall`, for supervisor calls made by the running partition.
//! - `PendSV`, which the SPM pends on itself whenever the set of runnable
//!   threads changes, and which performs the actual context switch.
//! - `DefaultHandler`, for interrupts routed to partitions.
//!
//! `SVCall` and `PendSV` share a strategy: save the callee-saved registers,
//! the process stack pointer and its limit, `CONTROL`, and `EXC_RETURN` into
//! the `SavedState` named by `CURRENT_SAVE_PTR`, call into Rust, then restore
//! whatever `CURRENT_SAVE_PTR` names afterwards, which may belong to a
//! different thread.
//!
//! The rest of the register file (r0-r3, r12, LR, PC, xPSR) lives in the
//! exception frame on the thread's own stack. That's also how a thread, or a
//! secure function in the library model, is started: by manufacturing an
//! exception frame and returning into it.
//!
//! Floating point state isn't saved; partitions are built without FP.

use core::arch::{self, global_asm};
use core::sync::atomic::{AtomicPtr, Ordering};

use abi::MemRange;

macro_rules! uassert {
    ($cond : expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}

/// Register file of the thread the next exception return will resume. We
/// have no scratch register to keep it in.
#[no_mangle]
static CURRENT_SAVE_PTR: AtomicPtr<SavedState> =
    AtomicPtr::new(core::ptr::null_mut());

/// `EXC_RETURN` for secure Thread mode on the process stack, standard frame,
/// no FP.
const EXC_RETURN_CONST: u32 = 0xFFFF_FFFD;

/// xPSR with only the Thumb bit set.
const INITIAL_PSR: u32 = 1 << 24;

/// Return address planted in fresh frames. Returning from a thread entry
/// point, or from a secure function without `SFN_RETURN`, faults here.
const INITIAL_LR: u32 = 0xFFFF_FFFF;

/// ARMv8-M registers that must be saved across context switches.
#[repr(C)]
#[derive(Clone, Debug, Default)]
pub struct SavedState {
    // NOTE: the following fields must be kept contiguous and in this order;
    // the assembly below depends on it.
    r4: u32,
    r5: u32,
    r6: u32,
    r7: u32,
    r8: u32,
    r9: u32,
    r10: u32,
    r11: u32,
    psp: u32,
    exc_return: u32,
    psplim: u32,
    control: u32,
}

/// Map the callee-saved registers to syscall argument and return slots.
impl crate::thread::ArchState for SavedState {
    fn stack_pointer(&self) -> usize {
        self.psp as usize
    }

    fn arg0(&self) -> usize {
        self.r4 as usize
    }
    fn arg1(&self) -> usize {
        self.r5 as usize
    }
    fn arg2(&self) -> usize {
        self.r6 as usize
    }
    fn arg3(&self) -> usize {
        self.r7 as usize
    }

    fn syscall_descriptor(&self) -> u32 {
        self.r11
    }

    fn ret0(&mut self, x: usize) {
        self.r4 = x as u32;
    }
}

/// Stuff placed on the stack at exception entry whether or not the FPU is
/// in use.
#[derive(Debug, Default)]
#[repr(C)]
struct BaseExceptionFrame {
    r0: u32,
    r1: u32,
    r2: u32,
    r3: u32,
    r12: u32,
    lr: u32,
    pc: u32,
    xpsr: u32,
}

/// Prepares `save` to start a thread at `entry` with `param` in r0.
pub fn init_thread_context(
    save: &mut SavedState,
    entry: usize,
    param: usize,
    stack: &MemRange,
    privileged: bool,
) {
    enter_function(save, entry, [param, 0, 0, 0], stack, privileged);
}

/// Prepares `save` so that the next exception return into it calls
/// `entry(args...)` on a fresh frame at the top of `stack`.
pub fn enter_function(
    save: &mut SavedState,
    entry: usize,
    args: [usize; 4],
    stack: &MemRange,
    privileged: bool,
) {
    let top = stack.limit & !0x7;
    let frame_size = core::mem::size_of::<BaseExceptionFrame>();
    uassert!(top >= stack.base + frame_size);
    let frame_addr = top - frame_size;

    let frame = BaseExceptionFrame {
        r0: args[0] as u32,
        r1: args[1] as u32,
        r2: args[2] as u32,
        r3: args[3] as u32,
        r12: 0,
        lr: INITIAL_LR,
        // Thumb bit must be set in the PC we return to.
        pc: entry as u32 | 1,
        xpsr: INITIAL_PSR,
    };
    // Safety: the stack was validated against the partition's data region
    // when the image was loaded, and the SPM is privileged.
    unsafe {
        core::ptr::write_volatile(frame_addr as *mut BaseExceptionFrame, frame);
    }

    *save = SavedState {
        psp: frame_addr as u32,
        psplim: stack.base as u32,
        exc_return: EXC_RETURN_CONST,
        control: if privileged { 0 } else { 1 },
        ..SavedState::default()
    };
}

/// Records `save` as the register file to restore on exception return.
///
/// # Safety
///
/// This leaks a pointer aliasing `save`. As long as `save` lives in the
/// thread arena and isn't touched again until the next entry into the SPM,
/// you'll be okay.
pub unsafe fn set_current_save(save: &SavedState) {
    CURRENT_SAVE_PTR.store(save as *const _ as *mut _, Ordering::Relaxed);
}

pub fn pend_context_switch() {
    // PendSV runs once the current handler (and anything chained behind it)
    // returns, and performs the switch there.
    cortex_m::peripheral::SCB::set_pendsv();
}

pub fn reset() -> ! {
    cortex_m::peripheral::SCB::sys_reset()
}

/// Sets exception priorities and jumps into the thread named by
/// `CURRENT_SAVE_PTR`. Does not return.
pub fn start_first_thread() -> ! {
    // Safety: we're only lowering priorities from their defaults, which can't
    // cause surprise preemption, but the register API is unsafe.
    unsafe {
        let scb = &*cortex_m::peripheral::SCB::PTR;
        // MEMFAULT, BUSFAULT, USGFAULT, SECUREFAULT on.
        scb.shcsr.modify(|x| x | 0b1111 << 16);
        // Faults at the highest configurable priority.
        scb.shpr[0].write(0x00);
        scb.shpr[1].write(0x00);
        scb.shpr[2].write(0x00);
        // SVCall and PendSV at the lowest, so the SPM is never preempted by
        // its own entry points.
        scb.shpr[7].write(0xFF);
        scb.shpr[10].write(0xFF);

        let nvic = &*cortex_m::peripheral::NVIC::PTR;
        let icb = &*cortex_m::peripheral::ICB::PTR;
        let irq_count = ((icb.ictr.read() as usize & 0xF) + 1) * 32;
        for i in 0..irq_count {
            nvic.ipr[i].write(0xFFu8);
        }
    }

    uassert!(!CURRENT_SAVE_PTR.load(Ordering::Relaxed).is_null());

    // Safety: SVC from the main stack is recognized by the handler below as
    // the request to start the first thread.
    unsafe {
        arch::asm!("svc #0xFF", options(noreturn));
    }
}

global_asm! {"
    .section .text.SVCall
    .globl SVCall
    .type SVCall,function
    SVCall:
        @ Inspect LR to figure out the caller's mode.
        mov r0, lr
        mov r1, #0xFFFFFFF3
        bic r0, r1
        @ Is the call coming from thread mode + main stack, i.e.
        @ from the SPM startup routine?
        cmp r0, #0x8
        beq 1f

        @ store volatile state.
        movw r0, #:lower16:CURRENT_SAVE_PTR
        movt r0, #:upper16:CURRENT_SAVE_PTR
        ldr r1, [r0]
        @ fetching PSP into r12 means the order in the stm below is right.
        mrs r12, PSP
        stm r1!, {{r4-r12, lr}}
        mrs r2, PSPLIM
        mrs r3, CONTROL
        stm r1, {{r2, r3}}

        bl syscall_entry

    1:  @ restore whichever thread is current now, which at startup is the
        @ first one.
        movw r0, #:lower16:CURRENT_SAVE_PTR
        movt r0, #:upper16:CURRENT_SAVE_PTR
        ldr r0, [r0]
        ldm r0!, {{r4-r12, lr}}
        ldm r0, {{r2, r3}}
        msr PSPLIM, r2
        msr CONTROL, r3
        msr PSP, r12

        @ resume; exception return serves as the barrier for CONTROL.
        bx lr
    ",
}

global_asm! {"
    .section .text.PendSV
    .globl PendSV
    .type PendSV,function
    PendSV:
        movw r0, #:lower16:CURRENT_SAVE_PTR
        movt r0, #:upper16:CURRENT_SAVE_PTR
        ldr r1, [r0]
        mrs r12, PSP
        stm r1!, {{r4-r12, lr}}
        mrs r2, PSPLIM
        mrs r3, CONTROL
        stm r1, {{r2, r3}}

        bl pendsv_entry

        movw r0, #:lower16:CURRENT_SAVE_PTR
        movt r0, #:upper16:CURRENT_SAVE_PTR
        ldr r0, [r0]
        ldm r0!, {{r4-r12, lr}}
        ldm r0, {{r2, r3}}
        msr PSPLIM, r2
        msr CONTROL, r3
        msr PSP, r12

        bx lr
    ",
}

/// The Rust side of the SVCall handler, after all volatile registers have
/// been saved somewhere predictable.
#[no_mangle]
unsafe extern "C" fn syscall_entry() {
    crate::startup::with_spm(|spm| spm.svc_entry());
}

/// The Rust side of the PendSV handler.
#[no_mangle]
unsafe extern "C" fn pendsv_entry() {
    crate::startup::with_spm(|spm| spm.pendsv());
}

#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn DefaultHandler() {
    // Safety: we're just reading the PSR.
    let exception_num = unsafe {
        let mut ipsr: u32;
        arch::asm!(
            "mrs {}, IPSR",
            out(reg) ipsr,
            options(pure, nomem, preserves_flags, nostack),
        );
        ipsr & 0x1FF
    };

    // The first 16 exceptions are architecturally defined; vendor hardware
    // interrupts start at 16.
    match exception_num {
        2 => panic!("NMI"),
        12 => panic!("DebugMon"),
        x if x >= 16 => {
            crate::startup::with_spm(|spm| spm.irq_entry(x - 16));
        }
        _ => panic!("unknown exception {exception_num}"),
    }
}

pub fn disable_irq(n: u32) {
    // Safety: writes to the clear-enable register have no memory safety
    // implications.
    let nvic = unsafe { &*cortex_m::peripheral::NVIC::PTR };
    if let Some(reg) = nvic.icer.get((n / 32) as usize) {
        unsafe { reg.write(1 << (n % 32)) }
    }
}

pub fn enable_irq(n: u32) {
    let nvic = unsafe { &*cortex_m::peripheral::NVIC::PTR };
    if let Some(reg) = nvic.iser.get((n / 32) as usize) {
        unsafe { reg.write(1 << (n % 32)) }
    }
}

pub fn clear_pending_irq(n: u32) {
    let nvic = unsafe { &*cortex_m::peripheral::NVIC::PTR };
    if let Some(reg) = nvic.icpr.get((n / 32) as usize) {
        unsafe { reg.write(1 << (n % 32)) }
    }
}
