//! Local APIC bring-up, periodic timer, and interrupt acknowledgment.
//!
//! The legacy 8259 PICs are remapped out of the exception range and fully
//! masked; the xAPIC is then enabled at its default MMIO base and drives
//! everything. The timer fires vector 0x20 periodically and invokes the
//! scheduler.

use crate::constants::idt::{ERROR_VECTOR, SPURIOUS_VECTOR, TIMER_VECTOR};
use crate::constants::lapic::{LAPIC_DEFAULT_BASE, TIMER_DIVIDE_BY_16, TIMER_INITIAL_COUNT};
use crate::constants::ports::{IO_WAIT_PORT, PIC1_COMMAND, PIC1_DATA, PIC2_COMMAND, PIC2_DATA};
use crate::interrupts::idt::{self, InterruptFrame};
use crate::memory::phys_to_ptr;
use crate::sched;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, Ordering};
use log::{debug, info, warn};
use spin::Once;
use x86_64::instructions::port::Port;
use x86_64::registers::model_specific::Msr;
use x86_64::PhysAddr;

const IA32_APIC_BASE_MSR: u32 = 0x1B;
const APIC_GLOBAL_ENABLE: u64 = 1 << 11;
const APIC_BASE_MASK: u64 = 0xF_FFFF_F000;

// Register offsets into the 4 KiB MMIO window.
const LAPIC_ID: u32 = 0x020;
const LAPIC_EOI: u32 = 0x0B0;
const LAPIC_SVR: u32 = 0x0F0;
const LAPIC_ESR: u32 = 0x280;
const LAPIC_LVT_TIMER: u32 = 0x320;
const LAPIC_LVT_LINT0: u32 = 0x350;
const LAPIC_LVT_LINT1: u32 = 0x360;
const LAPIC_LVT_ERROR: u32 = 0x370;
const LAPIC_TIMER_INIT_COUNT: u32 = 0x380;
const LAPIC_TIMER_DIVIDE: u32 = 0x3E0;

/// Software-enable bit in the spurious interrupt vector register.
const SVR_APIC_ENABLE: u32 = 0x100;

// PIC initialization command words.
const ICW1_INIT: u8 = 0x10;
const ICW1_ICW4: u8 = 0x01;
const ICW4_8086: u8 = 0x01;

bitflags! {
    /// Control bits of a local vector table entry. The low byte holds the
    /// target vector.
    #[derive(Debug, Clone, Copy)]
    pub struct LvtFlags: u32 {
        const MASKED = 1 << 16;
        const TIMER_PERIODIC = 1 << 17;
        const TIMER_TSC_DEADLINE = 1 << 18;
    }
}

/// Handle on the memory-mapped xAPIC of the executing CPU.
struct LocalApic {
    base: PhysAddr,
}

impl LocalApic {
    fn register_ptr(&self, reg: u32) -> *mut u32 {
        unsafe { phys_to_ptr(self.base).add(reg as usize).cast() }
    }

    fn write(&self, reg: u32, value: u32) {
        unsafe {
            self.register_ptr(reg).write_volatile(value);
        }
    }

    fn read(&self, reg: u32) -> u32 {
        unsafe { self.register_ptr(reg).read_volatile() }
    }

    fn id(&self) -> u32 {
        self.read(LAPIC_ID) >> 24
    }
}

static LAPIC: Once<LocalApic> = Once::new();

/// Timer interrupts serviced since boot.
static TICKS: AtomicU64 = AtomicU64::new(0);

fn io_wait() {
    let mut port: Port<u8> = Port::new(IO_WAIT_PORT);
    unsafe {
        port.write(0);
    }
}

/// Remaps both 8259 PICs away from the exception vectors, then masks every
/// line. They stay masked; all delivery goes through the LAPIC.
fn disable_pic() {
    let mut pic1_cmd: Port<u8> = Port::new(PIC1_COMMAND);
    let mut pic1_data: Port<u8> = Port::new(PIC1_DATA);
    let mut pic2_cmd: Port<u8> = Port::new(PIC2_COMMAND);
    let mut pic2_data: Port<u8> = Port::new(PIC2_DATA);

    unsafe {
        pic1_cmd.write(ICW1_INIT | ICW1_ICW4);
        io_wait();
        pic2_cmd.write(ICW1_INIT | ICW1_ICW4);
        io_wait();

        // Remap to 0x20-0x2F, clear of the exception range.
        pic1_data.write(0x20);
        io_wait();
        pic2_data.write(0x28);
        io_wait();

        // Master has a slave on IRQ2; slave gets its cascade identity.
        pic1_data.write(0x04);
        io_wait();
        pic2_data.write(0x02);
        io_wait();

        pic1_data.write(ICW4_8086);
        io_wait();
        pic2_data.write(ICW4_8086);
        io_wait();

        pic1_data.write(0xFF);
        pic2_data.write(0xFF);
    }
}

/// Full LAPIC bring-up: PIC masking, global enable, spurious vector, ESR
/// clear, periodic timer at [`TIMER_VECTOR`], LINT masking and the error
/// vector. Runs with interrupts still disabled.
pub fn init() {
    disable_pic();

    let mut apic_base = Msr::new(IA32_APIC_BASE_MSR);
    unsafe {
        let mut value = apic_base.read();
        value |= APIC_GLOBAL_ENABLE;
        value = (value & !APIC_BASE_MASK) | LAPIC_DEFAULT_BASE;
        apic_base.write(value);
    }

    let apic = LAPIC.call_once(|| LocalApic {
        base: PhysAddr::new(LAPIC_DEFAULT_BASE),
    });

    apic.write(LAPIC_SVR, SVR_APIC_ENABLE | u32::from(SPURIOUS_VECTOR));

    // Clear the error status register; it latches until written twice.
    apic.write(LAPIC_ESR, 0);
    apic.read(LAPIC_ESR);
    apic.write(LAPIC_ESR, 0);
    apic.read(LAPIC_ESR);

    apic.write(LAPIC_TIMER_DIVIDE, TIMER_DIVIDE_BY_16);
    apic.write(
        LAPIC_LVT_TIMER,
        LvtFlags::TIMER_PERIODIC.bits() | u32::from(TIMER_VECTOR),
    );
    apic.write(LAPIC_TIMER_INIT_COUNT, TIMER_INITIAL_COUNT);

    apic.write(LAPIC_LVT_LINT0, LvtFlags::MASKED.bits());
    apic.write(LAPIC_LVT_LINT1, LvtFlags::MASKED.bits());
    apic.write(LAPIC_LVT_ERROR, u32::from(ERROR_VECTOR));

    idt::register_irq_handler(TIMER_VECTOR, timer_handler);

    info!("local APIC {} enabled at {:#x}", apic.id(), apic.base);
}

/// Signals end-of-interrupt. The register takes a literal zero.
pub fn eoi() {
    if let Some(apic) = LAPIC.get() {
        apic.write(LAPIC_EOI, 0);
    }
}

/// Clears the mask bit on the LVT line feeding `vector`. Only the timer
/// line exists in v1; other external vectors have nowhere to be unmasked.
pub fn unmask_vector(vector: u8) {
    let Some(apic) = LAPIC.get() else {
        return;
    };
    if vector == TIMER_VECTOR {
        let lvt = apic.read(LAPIC_LVT_TIMER);
        apic.write(LAPIC_LVT_TIMER, lvt & !LvtFlags::MASKED.bits());
    } else {
        warn!("no LVT route for external vector {:#x}", vector);
    }
}

/// Timer interrupts serviced since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Periodic timer entry: account the tick, give the scheduler a chance to
/// switch tasks through the frame, acknowledge.
fn timer_handler(frame: &mut InterruptFrame) {
    let count = TICKS.fetch_add(1, Ordering::Relaxed) + 1;
    if count % 1000 == 0 {
        debug!("timer tick {}", count);
    }
    sched::schedule_from_interrupt(frame);
    eoi();
}
