//! Memory management: physical frames, paging, kernel heap.

pub mod frame_allocator;
pub mod heap;
pub mod paging;

use crate::boot::MemoryRegion;
use crate::constants::memory::INITIAL_HEAP_PAGES;
use x86_64::PhysAddr;

/// Turns a physical address into a dereferenceable pointer.
///
/// The loader identity-maps low physical memory before entering the kernel,
/// and v1 never leaves that address space, so the mapping is the identity.
/// This is the only place that assumption lives.
pub fn phys_to_ptr(addr: PhysAddr) -> *mut u8 {
    addr.as_u64() as *mut u8
}

/// Brings up the memory subsystems in dependency order: the frame allocator
/// feeds the paging manager, which backs the kernel heap.
pub fn init(memory_map: &[MemoryRegion]) {
    frame_allocator::init(memory_map);
    heap::init_kmalloc(INITIAL_HEAP_PAGES);
}
