//! Abstraction over userspace context switching.
//!
//! Provides an implementation for every CPU architecture.

use std::arch::global_asm;
use std::ffi;

/// Stack pointer alignment required by the calling convention at a call boundary.
pub(crate) const STACK_ALIGNMENT: usize = 16;

#[cfg(target_arch = "x86_64")]
const CONTEXT_WORDS: usize = 9;

#[cfg(target_arch = "aarch64")]
const CONTEXT_WORDS: usize = 22;

/// Saved machine state sufficient to resume at the exact suspension point.
///
/// Holds the return address, the stack pointer, the callee-saved registers, and the floating point control state.
/// The layout is owned by the assembly in `assembly/`.
#[repr(C)]
#[derive(Debug, Clone)]
pub(crate) struct ExecutionContext([u64; CONTEXT_WORDS]);

impl ExecutionContext {
    /// Context that was never saved into, never restore it.
    pub(crate) const fn empty() -> Self {
        ExecutionContext([0; CONTEXT_WORDS])
    }

    /// Address execution continues at once restored.
    pub(crate) fn instruction_pointer(&self) -> usize {
        self.0[0] as usize
    }

    /// Stack pointer once restored.
    pub(crate) fn stack_pointer(&self) -> usize {
        self.0[1] as usize
    }
}

/// Function started on a fresh stack by [invoke_on_stack], must never return.
pub(crate) type Entry = unsafe extern "C" fn(payload: *mut ffi::c_void) -> !;

extern "C" {
    fn spindle_switch(save: *mut ExecutionContext, restore: *const ExecutionContext, signal: usize) -> usize;

    fn spindle_restore(restore: *const ExecutionContext, signal: usize) -> !;

    fn spindle_invoke_on_stack(
        save: *mut ExecutionContext,
        top: *mut u8,
        entry: Entry,
        payload: *mut ffi::c_void,
    ) -> usize;
}

/// Executes a context switch.
///
/// Spills registers into [save], then restores [restore] handing it [signal].
/// Returns once another switch or restore targets [save], with the signal it was given.
///
/// # Safety
/// [restore] must have been saved into by a switch that hasn't been resumed since, and its stack must still be alive.
#[inline]
pub(crate) unsafe fn switch(save: *mut ExecutionContext, restore: *const ExecutionContext, signal: usize) -> usize {
    spindle_switch(save, restore, signal)
}

/// Restores [restore] handing it [signal], discarding the current state.
///
/// # Safety
/// Same as [switch]. Nothing left on the current stack gets dropped.
#[inline]
pub(crate) unsafe fn restore(restore: *const ExecutionContext, signal: usize) -> ! {
    spindle_restore(restore, signal)
}

/// Spills registers into [save], moves the stack pointer to [top], and calls [entry] with [payload].
/// Returns once a switch or restore targets [save], with the signal it was given.
///
/// # Safety
/// [top] must be the upper end of a writable region large enough for everything [entry] does.
pub(crate) unsafe fn invoke_on_stack(
    save: *mut ExecutionContext,
    top: *mut u8,
    entry: Entry,
    payload: *mut ffi::c_void,
) -> usize {
    debug_assert_eq!(top as usize % STACK_ALIGNMENT, 0, "new stack pointer not {STACK_ALIGNMENT}-byte aligned");
    spindle_invoke_on_stack(save, top, entry, payload)
}

#[cfg(not(target_os = "linux"))]
compile_error!("spindle only supports Linux");

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("spindle only supports x86_64 and aarch64");

#[cfg(target_arch = "x86_64")]
global_asm!(include_str!("assembly/x86_64.s"));

#[cfg(target_arch = "aarch64")]
global_asm!(include_str!("assembly/aarch64.s"));

#[cfg(all(test, target_arch = "x86_64"))]
global_asm!(include_str!("assembly/x86_64_round_trip.s"));

#[cfg(all(test, target_arch = "aarch64"))]
global_asm!(include_str!("assembly/aarch64_round_trip.s"));
