//! Interrupt descriptor table and dispatch.
//!
//! All 256 vectors point at the entry stubs from [`super::stubs`], which
//! funnel into [`handle_interrupt`]. Kernel code routes individual vectors
//! by registering a callback; anything unrouted is reported, with CPU
//! exceptions treated as fatal.

use crate::constants::idt::{EXTERNAL_VECTOR_END, EXTERNAL_VECTOR_START};
use crate::interrupts::stubs::ISR_STUB_TABLE;
use crate::interrupts::{gdt, lapic};
use crate::serial_println;
use lazy_static::lazy_static;
use log::{error, warn};
use spin::Mutex;
use x86_64::instructions::interrupts;
use x86_64::instructions::tables::lidt;
use x86_64::registers::control::Cr2;
use x86_64::structures::DescriptorTablePointer;
use x86_64::VirtAddr;

/// General-purpose registers as pushed by the common trampoline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct SavedRegisters {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
}

/// The complete stack image an interrupt handler sees: saved registers,
/// the stub-pushed vector and error code, then the CPU-pushed frame.
/// Writing through this rewrites the state `iretq` returns to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct InterruptFrame {
    pub regs: SavedRegisters,
    pub vector: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Gate type 0x8E: present, DPL 0, 64-bit interrupt gate.
const GATE_INTERRUPT: u8 = 0x8E;

#[derive(Clone, Copy)]
#[repr(C, packed)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    ist: u8,
    type_attr: u8,
    offset_mid: u16,
    offset_high: u32,
    reserved: u32,
}

impl IdtEntry {
    const fn missing() -> Self {
        IdtEntry {
            offset_low: 0,
            selector: 0,
            ist: 0,
            type_attr: 0,
            offset_mid: 0,
            offset_high: 0,
            reserved: 0,
        }
    }

    fn new(handler: u64, selector: u16, type_attr: u8) -> Self {
        IdtEntry {
            offset_low: handler as u16,
            selector,
            ist: 0,
            type_attr,
            offset_mid: (handler >> 16) as u16,
            offset_high: (handler >> 32) as u32,
            reserved: 0,
        }
    }
}

#[repr(C, align(16))]
struct InterruptTable {
    entries: [IdtEntry; 256],
}

impl InterruptTable {
    fn new() -> Self {
        let mut table = InterruptTable {
            entries: [IdtEntry::missing(); 256],
        };
        let selector = gdt::kernel_code_selector().0;
        for (vector, entry) in table.entries.iter_mut().enumerate() {
            let stub = unsafe { ISR_STUB_TABLE[vector] };
            *entry = IdtEntry::new(stub, selector, GATE_INTERRUPT);
        }
        table
    }

    fn load(&'static self) {
        let pointer = DescriptorTablePointer {
            limit: (core::mem::size_of::<Self>() - 1) as u16,
            base: VirtAddr::from_ptr(self),
        };
        unsafe {
            lidt(&pointer);
        }
    }
}

lazy_static! {
    static ref IDT: InterruptTable = InterruptTable::new();
}

/// A routed interrupt handler. May rewrite the frame to redirect the
/// return path, which is how the scheduler switches tasks.
pub type IrqHandler = fn(&mut InterruptFrame);

/// Per-vector routing table. Written during bring-up, before interrupts
/// are enabled; the dispatcher only ever reads it.
static CALLBACKS: Mutex<[Option<IrqHandler>; 256]> = Mutex::new([None; 256]);

/// Textual names of the CPU exception vectors.
static EXCEPTION_NAMES: [&str; 32] = [
    "Divide by 0",
    "Reserved",
    "Non-maskable Interrupt",
    "Breakpoint",
    "Overflow",
    "Bounds range exceeded",
    "Invalid Opcode",
    "Device not available",
    "Double fault",
    "Coprocessor segment overrun",
    "Invalid TSS",
    "Segment not present",
    "Stack-segment fault",
    "General protection fault",
    "Page fault",
    "Reserved",
    "x87 FPU error",
    "Alignment check",
    "Machine check",
    "SIMD Floating Point Exception",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
];

/// Builds and loads the IDT.
pub fn init() {
    IDT.load();
}

pub fn enable() {
    interrupts::enable();
}

pub fn disable() {
    interrupts::disable();
}

pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    interrupts::without_interrupts(f)
}

/// Routes `vector` to `handler`. Claiming an already routed vector logs a
/// warning and overwrites. For external vectors the matching LAPIC LVT
/// line is unmasked; only the timer has one in v1.
pub fn register_irq_handler(vector: u8, handler: IrqHandler) {
    let mut callbacks = CALLBACKS.lock();
    if callbacks[vector as usize].is_some() {
        warn!("vector {:#x} is already claimed, overwriting", vector);
    }
    callbacks[vector as usize] = Some(handler);
    drop(callbacks);

    if (EXTERNAL_VECTOR_START..=EXTERNAL_VECTOR_END).contains(&vector) {
        lapic::unmask_vector(vector);
    }
}

/// C-level dispatcher the common trampoline calls for every vector.
pub(crate) extern "C" fn handle_interrupt(frame: *mut InterruptFrame) {
    let frame = unsafe { &mut *frame };
    let vector = frame.vector as usize;

    let handler = CALLBACKS.lock()[vector];
    if let Some(handler) = handler {
        handler(frame);
        return;
    }

    let cr2 = Cr2::read_raw();
    if vector < 32 {
        error!(
            "Interrupt {}: {} | error code {:#x} | CR2: {:#x}",
            vector, EXCEPTION_NAMES[vector], frame.error_code, cr2
        );
        backtrace(frame.rip, frame.regs.rbp);
        crate::halt();
    }

    warn!("Interrupt {}: IRQ without handler", vector);
    // Acknowledge so lower-priority interrupts keep flowing.
    lapic::eoi();
}

/// Prints the return-address chain reachable through saved RBP frames.
fn backtrace(rip: u64, mut rbp: u64) {
    serial_println!("stack trace:");
    serial_println!("  #0 {:#018x}", rip);
    for depth in 1..16 {
        if rbp == 0 || rbp % 8 != 0 {
            break;
        }
        let return_addr = unsafe { *((rbp + 8) as *const u64) };
        if return_addr == 0 {
            break;
        }
        serial_println!("  #{} {:#018x}", depth, return_addr);
        rbp = unsafe { *(rbp as *const u64) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU64, Ordering};

    static SOFTWARE_HITS: AtomicU64 = AtomicU64::new(0);
    static SOFTWARE_CS: AtomicU64 = AtomicU64::new(0);
    static SOFTWARE_VECTOR: AtomicU64 = AtomicU64::new(0);

    fn software_handler(frame: &mut InterruptFrame) {
        SOFTWARE_HITS.fetch_add(1, Ordering::SeqCst);
        SOFTWARE_CS.store(frame.cs, Ordering::SeqCst);
        SOFTWARE_VECTOR.store(frame.vector, Ordering::SeqCst);
    }

    /// A software interrupt reaches its registered handler with a frame
    /// describing the interrupted code.
    #[test_case]
    fn int_0x80_reaches_handler() {
        register_irq_handler(0x80, software_handler);
        unsafe {
            core::arch::asm!("int 0x80");
        }
        assert_eq!(SOFTWARE_HITS.load(Ordering::SeqCst), 1);
        assert_eq!(SOFTWARE_VECTOR.load(Ordering::SeqCst), 0x80);
        assert_eq!(
            SOFTWARE_CS.load(Ordering::SeqCst),
            u64::from(gdt::kernel_code_selector().0)
        );
    }

    /// Re-registering a vector replaces the previous handler.
    #[test_case]
    fn reregistration_overwrites() {
        register_irq_handler(0x81, software_handler);
        register_irq_handler(0x81, software_handler);
        let hits = SOFTWARE_HITS.load(Ordering::SeqCst);
        unsafe {
            core::arch::asm!("int 0x81");
        }
        assert_eq!(SOFTWARE_HITS.load(Ordering::SeqCst), hits + 1);
    }
}
