//! Saved CPU state of a task and the register-swap trampoline.

use core::arch::global_asm;

/// RFLAGS bit 9, interrupt enable.
const RFLAGS_IF: u64 = 1 << 9;
/// RFLAGS bit 1, architecturally always set.
const RFLAGS_RESERVED: u64 = 1 << 1;

/// RFLAGS every fresh task starts with: interrupts on, nothing else.
pub const DEFAULT_RFLAGS: u64 = RFLAGS_IF | RFLAGS_RESERVED;

/// Complete register state of a suspended task.
///
/// Field order is part of the [`switch_context`] contract; the trampoline
/// addresses fields by their byte offsets (rax at 0x00 through rflags at
/// 0x88). The segment selectors are only touched by the interrupt-frame
/// path; the trampoline never reloads segments since every task runs in
/// the same flat kernel segments.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TaskContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
}

impl TaskContext {
    pub const fn zeroed() -> Self {
        TaskContext {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            rbp: 0,
            rsp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
            rflags: 0,
            cs: 0,
            ss: 0,
            ds: 0,
            es: 0,
            fs: 0,
            gs: 0,
        }
    }
}

impl Default for TaskContext {
    fn default() -> Self {
        Self::zeroed()
    }
}

// Contract: saves the caller's registers into `old` such that resuming
// from `old` continues right after the call, then loads `new` and jumps
// into it. Interrupt state transfers through the saved RFLAGS; it is
// applied just before the final jump, when the new context is complete.
global_asm!(
    r#"
.section .text
.global switch_context
switch_context:
    mov [rdi + 0x00], rax
    mov [rdi + 0x08], rbx
    mov [rdi + 0x10], rcx
    mov [rdi + 0x18], rdx
    mov [rdi + 0x20], rsi
    mov [rdi + 0x28], rdi
    mov [rdi + 0x30], rbp
    lea rax, [rsp + 8]
    mov [rdi + 0x38], rax
    mov [rdi + 0x40], r8
    mov [rdi + 0x48], r9
    mov [rdi + 0x50], r10
    mov [rdi + 0x58], r11
    mov [rdi + 0x60], r12
    mov [rdi + 0x68], r13
    mov [rdi + 0x70], r14
    mov [rdi + 0x78], r15
    mov rax, [rsp]
    mov [rdi + 0x80], rax
    pushfq
    pop rax
    mov [rdi + 0x88], rax

    mov rsp, [rsi + 0x38]
    mov rax, [rsi + 0x80]
    push rax
    mov rax, [rsi + 0x88]
    push rax
    mov rbx, [rsi + 0x08]
    mov rcx, [rsi + 0x10]
    mov rdx, [rsi + 0x18]
    mov rbp, [rsi + 0x30]
    mov r8,  [rsi + 0x40]
    mov r9,  [rsi + 0x48]
    mov r10, [rsi + 0x50]
    mov r11, [rsi + 0x58]
    mov r12, [rsi + 0x60]
    mov r13, [rsi + 0x68]
    mov r14, [rsi + 0x70]
    mov r15, [rsi + 0x78]
    mov rdi, [rsi + 0x28]
    mov rax, [rsi + 0x00]
    mov rsi, [rsi + 0x20]
    popfq
    ret
"#
);

extern "C" {
    /// Register-swap context switch; see the contract above.
    pub fn switch_context(old: *mut TaskContext, new: *const TaskContext);
}
