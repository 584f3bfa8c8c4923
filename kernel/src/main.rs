#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(feos::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use alloc::vec;
use feos::interrupts::idt;
use feos::memory::heap::{kfree, kmalloc};
use feos::memory::paging::AddressSpace;
use feos::{init, sched, serial_println};
use log::info;
use raw_cpuid::CpuId;
use x86_64::VirtAddr;

const TASK_STACK_SIZE: usize = 4096;

extern "C" fn task_one() -> ! {
    serial_println!("[TASK1] Task1 started!");
    loop {
        serial_println!("Task1");
        sched::yield_now();
    }
}

extern "C" fn task_two() -> ! {
    serial_println!("[TASK2] Task2 started!");
    loop {
        serial_println!("Task2");
        sched::yield_now();
    }
}

/// Whether this CPU is the bootstrap processor, judged by its initial
/// local APIC id.
fn is_bsp() -> bool {
    CpuId::new()
        .get_feature_info()
        .is_none_or(|f| f.initial_local_apic_id() == 0)
}

fn spawn_demo_tasks() {
    let stack1 = vec![0u8; TASK_STACK_SIZE].leak();
    sched::create_task(task_one, VirtAddr::from_ptr(stack1.as_ptr()), TASK_STACK_SIZE);
    let stack2 = vec![0u8; TASK_STACK_SIZE].leak();
    sched::create_task(task_two, VirtAddr::from_ptr(stack2.as_ptr()), TASK_STACK_SIZE);
}

/// Probes a few translations through the inherited page tables, mostly to
/// prove the walk works before anything depends on it.
fn translation_self_check() {
    let space = AddressSpace::current();
    for addr in [0x10_0000u64, 0x20_1000, 0xFFF_F100_0000] {
        match space.translate(VirtAddr::new(addr)) {
            Ok(phys) => info!("virt {:#x} -> phys {:#x}", addr, phys.as_u64()),
            Err(_) => info!("virt {:#x} -> not mapped", addr),
        }
    }
}

/// Exercises the allocator the same way every boot: two allocations, two
/// frees, then a reallocation that lands back on the first address.
fn heap_self_check() {
    let a1 = kmalloc(16);
    let a2 = kmalloc(32);
    kfree(a1);
    kfree(a2);
    let a3 = kmalloc(16);
    info!("kmalloc a1={:p} | a2={:p} | a3={:p}", a1, a2, a3);
    kfree(a3);
}

#[no_mangle]
extern "C" fn kmain(magic: u32, mbi_addr: u64) -> ! {
    if !is_bsp() {
        feos::halt();
    }

    #[cfg(test)]
    {
        init::init(magic, mbi_addr);
        test_main();
        feos::halt();
    }

    #[cfg(not(test))]
    {
        let boot_info = init::init(magic, mbi_addr);
        info!(
            "retained {} memory map entries",
            boot_info.memory_map().len()
        );

        translation_self_check();
        spawn_demo_tasks();
        sched::start_scheduler();
        idt::enable();

        heap_self_check();

        info!(
            "boot complete after {} timer ticks, entering idle loop",
            feos::interrupts::lapic::ticks()
        );
        feos::idle_loop();
    }
}

/// ELF entry point; the loader arrives here in 64-bit mode with the
/// Multiboot2 handshake in the SysV argument registers.
#[no_mangle]
extern "C" fn _start(magic: u32, mbi_addr: u64) -> ! {
    kmain(magic, mbi_addr)
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    serial_println!("KERNEL PANIC: {}", info);
    feos::halt();
}

#[cfg(test)]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    feos::test_panic_handler(info)
}
