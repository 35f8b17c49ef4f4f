//! x86_64 (System V) register frame and switch routines.
//!
//! Only the callee-saved set is stored: rsp, the resume address, rbx, rbp,
//! r12–r15. XMM registers are caller-saved in the System V ABI and need no
//! slot.

use core::arch::global_asm;

/// Callee-saved register frame. Field order is ABI-visible: the offsets
/// below are hard-coded in the assembly.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Regs {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

impl Regs {
    pub const fn zeroed() -> Self {
        Self {
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

    /// Build the initial frame for a fresh thread: when first jumped to, it
    /// begins executing `entry` at the top of `stack`.
    ///
    /// rsp must be ≡ 8 (mod 16) at function entry, as if a `call` had just
    /// pushed a return address; the slot at the fake return address holds 0
    /// so backtraces terminate.
    pub fn with_entry(stack: &mut [u8], entry: extern "C" fn()) -> Self {
        let top = stack.as_mut_ptr() as usize + stack.len();
        let sp = (top & !0xF) - 8;
        unsafe { (sp as *mut u64).write(0) };
        let mut regs = Self::zeroed();
        regs.rsp = sp as u64;
        regs.rip = entry as usize as u64;
        regs
    }

    pub fn stack_pointer(&self) -> usize {
        self.rsp as usize
    }
}

global_asm!(
    r#"
    .globl filament_ctx_switch
filament_ctx_switch:
    mov rax, [rsp]            // resume point: our own return address
    lea rcx, [rsp + 8]        // rsp as the caller will see it again
    mov [rdi + 0x00], rcx
    mov [rdi + 0x08], rax
    mov [rdi + 0x10], rbx
    mov [rdi + 0x18], rbp
    mov [rdi + 0x20], r12
    mov [rdi + 0x28], r13
    mov [rdi + 0x30], r14
    mov [rdi + 0x38], r15
    mov rsp, [rsi + 0x00]
    mov rbx, [rsi + 0x10]
    mov rbp, [rsi + 0x18]
    mov r12, [rsi + 0x20]
    mov r13, [rsi + 0x28]
    mov r14, [rsi + 0x30]
    mov r15, [rsi + 0x38]
    jmp qword ptr [rsi + 0x08]
"#
);

global_asm!(
    r#"
    .globl filament_ctx_jump
filament_ctx_jump:
    mov rsp, [rdi + 0x00]
    mov rbx, [rdi + 0x10]
    mov rbp, [rdi + 0x18]
    mov r12, [rdi + 0x20]
    mov r13, [rdi + 0x28]
    mov r14, [rdi + 0x30]
    mov r15, [rdi + 0x38]
    jmp qword ptr [rdi + 0x08]
"#
);

extern "C" {
    fn filament_ctx_switch(from: *mut Regs, to: *const Regs);
    fn filament_ctx_jump(to: *const Regs) -> !;
}

/// Store the current execution point into `from` and resume `to`. Returns
/// when another thread switches back into `from`.
///
/// # Safety
///
/// `from` must stay valid (and unmoved) until it is resumed or discarded;
/// `to` must hold a frame produced by [`switch`] or [`Regs::with_entry`]
/// whose stack is still alive.
pub unsafe fn switch(from: *mut Regs, to: *const Regs) {
    filament_ctx_switch(from, to);
}

/// Resume `to`, abandoning the current stack. The current execution point
/// is lost.
///
/// # Safety
///
/// Same requirements on `to` as [`switch`]. Nothing on the abandoned stack
/// is unwound; the caller must not rely on any `Drop` below this frame.
pub unsafe fn jump(to: *const Regs) -> ! {
    filament_ctx_jump(to)
}
