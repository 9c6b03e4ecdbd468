//! x86_64 context switching
//!
//! Voluntary switches only: the System V callee-saved registers plus
//! rsp/rip are enough because every switch happens at a call boundary.

use std::arch::naked_asm;

/// Callee-saved register block of a suspended fiber
///
/// Field order is fixed; the asm below addresses these by byte offset.
#[repr(C)]
pub struct SavedRegs {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

impl SavedRegs {
    pub const fn zeroed() -> Self {
        SavedRegs {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Prepare a fresh context so that switching to it enters
/// `entry_fn(entry_arg)` on the given stack
///
/// # Safety
///
/// `regs` must point to writable `SavedRegs` storage and `stack_top` must
/// be the highest address of a mapped stack region.
pub unsafe fn init_context(
    regs: *mut SavedRegs,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    // 16-byte aligned at the trampoline; the trampoline's `call` then
    // produces the ABI-mandated rsp % 16 == 8 at entry_fn's first insn
    let sp = (stack_top as usize) & !0xF;

    let regs = &mut *regs;
    regs.rsp = sp as u64;
    regs.rip = fiber_trampoline as usize as u64;
    regs.rbx = 0;
    regs.rbp = 0;
    regs.r12 = entry_fn as u64;
    regs.r13 = entry_arg as u64;
    regs.r14 = 0;
    regs.r15 = 0;
}

/// First code a fresh fiber executes: calls `entry_fn` (r12) with
/// `entry_arg` (r13). The entry function never returns.
#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "ud2",
    );
}

/// Switch from the current context to another
///
/// Saves the callee-saved state into `save` and restores `restore`.
/// Returns when some other fiber switches back into `save`.
///
/// # Safety
///
/// Both register blocks must be valid; `restore` must describe a live
/// suspended context or one prepared by `init_context`.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_save: *mut SavedRegs, _restore: *const SavedRegs) {
    naked_asm!(
        // save callee-saved registers into `save` (rdi)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // restore from `restore` (rsi)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // resume point for the saved context
        "1:",
        "ret",
    );
}
