//! CPU interrupt and exception handling subsystem.
//!
//! Covers the descriptor tables, the 256-entry IDT with its dispatch path,
//! and the local APIC. The LAPIC is brought up separately by the boot glue
//! because it must follow memory initialization.

pub mod gdt;
pub mod idt;
pub mod lapic;
mod stubs;

/// Loads the descriptor tables and the IDT for one CPU.
pub fn init(cpu_id: u32) {
    gdt::init(cpu_id);
    idt::init();
}
