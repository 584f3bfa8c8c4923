//! Ordered bring-up of the kernel subsystems.
//!
//! The dependency chain is strict: descriptor tables and the IDT first so
//! faults are reportable, then the boot information (which feeds the frame
//! allocator), then paging and the heap, then the LAPIC, and finally the
//! scheduler. Interrupts stay disabled throughout; the caller decides when
//! to open them.

use crate::boot::{self, BootInfo};
use crate::{interrupts, logging, memory, sched};
use log::info;

/// Brings the kernel up on the BSP and returns the boot-info digest.
///
/// Panics when `magic` is not the Multiboot2 handshake value.
pub fn init(magic: u32, mbi_addr: u64) -> BootInfo {
    logging::init();
    info!(
        "kernel started with magic {:#x}, boot info at {:#x}",
        magic, mbi_addr
    );
    assert_eq!(
        magic,
        boot::BOOTLOADER_MAGIC,
        "not started by a Multiboot2 loader"
    );

    interrupts::init(0);

    let boot_info = unsafe { boot::multiboot::parse(mbi_addr) };
    memory::init(boot_info.memory_map());
    memory::frame_allocator::log_stats();

    interrupts::lapic::init();
    sched::init_kernel_task();

    boot_info
}
