//! Per-vector interrupt entry stubs and the common dispatch trampoline.
//!
//! Contract: the stub for vector V pushes a zero error code when the CPU
//! does not supply one (every vector except 8, 10-14, 17, 21, 29, 30),
//! then pushes V and jumps to the common trampoline. The trampoline saves
//! the general-purpose registers so that the stack now holds a complete
//! [`InterruptFrame`](crate::interrupts::idt::InterruptFrame), calls the
//! dispatcher with a pointer to it, restores the registers from the
//! (possibly rewritten) frame, drops the vector and error slots and
//! returns with `iretq`.

use core::arch::global_asm;

global_asm!(r#"
.section .text
.align 16
interrupt_common:
    push rax
    push rbx
    push rcx
    push rdx
    push rbp
    push rsi
    push rdi
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15
    cld
    mov rdi, rsp
    call {dispatch}
    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rdi
    pop rsi
    pop rbp
    pop rdx
    pop rcx
    pop rbx
    pop rax
    add rsp, 16
    iretq

.altmacro
.macro isr_stub n
    .align 16
isr_stub_\n:
    .if (\n == 8) || (\n == 10) || (\n == 11) || (\n == 12) || (\n == 13) || (\n == 14) || (\n == 17) || (\n == 21) || (\n == 29) || (\n == 30)
    .else
    push 0
    .endif
    push \n
    jmp interrupt_common
.endm

.set i, 0
.rept 256
    isr_stub %i
    .set i, i+1
.endr

.macro isr_addr n
    .quad isr_stub_\n
.endm

.section .rodata
.align 8
.global ISR_STUB_TABLE
ISR_STUB_TABLE:
.set i, 0
.rept 256
    isr_addr %i
    .set i, i+1
.endr

.section .text
"#, dispatch = sym crate::interrupts::idt::handle_interrupt);

extern "C" {
    /// Entry addresses of the 256 vector stubs, indexed by vector number.
    pub static ISR_STUB_TABLE: [u64; 256];
}
