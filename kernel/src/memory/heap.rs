//! The kernel heap.
//!
//! A first-fit allocator over a doubly-linked list of blocks in address
//! order. Each block is a header followed by its payload; freeing coalesces
//! with both neighbors so no two adjacent free blocks survive a release.
//! When no block fits, the heap grows by whole pages through the paging
//! manager. The same allocator backs `kmalloc`/`kfree` and the global
//! allocator behind `alloc`.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use crate::constants::memory::{HEAP_GRANULARITY, PAGE_SIZE};
use crate::memory::paging;
use log::{debug, info};
use spin::Mutex;

const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();

/// Block header. `length` is the payload size in bytes, always a multiple
/// of [`HEAP_GRANULARITY`]; `next`/`prev` link all blocks in address order.
#[repr(C)]
struct BlockHeader {
    length: usize,
    next: *mut BlockHeader,
    prev: *mut BlockHeader,
    is_free: bool,
}

impl BlockHeader {
    fn payload(&self) -> usize {
        self as *const BlockHeader as usize + HEADER_SIZE
    }

    /// Address one past the payload.
    fn end(&self) -> usize {
        self.payload() + self.length
    }
}

struct KernelHeap {
    head: *mut BlockHeader,
    last: *mut BlockHeader,
}

// Raw pointers reference heap pages owned by this structure; all access is
// serialized by the allocator mutex.
unsafe impl Send for KernelHeap {}

const fn round_up(value: usize, to: usize) -> usize {
    (value + to - 1) & !(to - 1)
}

impl KernelHeap {
    const fn empty() -> Self {
        KernelHeap {
            head: ptr::null_mut(),
            last: ptr::null_mut(),
        }
    }

    /// Maps `pages` heap pages and installs a single free block over them.
    unsafe fn init(&mut self, pages: usize) {
        let base = paging::heap_request_page();
        for _ in 1..pages {
            paging::heap_request_page();
        }

        let length = pages * PAGE_SIZE;
        let header = base.as_mut_ptr::<BlockHeader>();
        (*header).length = length - HEADER_SIZE;
        (*header).next = ptr::null_mut();
        (*header).prev = ptr::null_mut();
        (*header).is_free = true;

        self.head = header;
        self.last = header;
        info!("kernel heap at {:#x}, {} bytes", base.as_u64(), length);
    }

    /// Splits `block` so its payload shrinks to `front_len`; the remainder
    /// becomes a new free block linked right after it.
    unsafe fn split_block(&mut self, block: *mut BlockHeader, front_len: usize) {
        let remainder = (*block).length - front_len - HEADER_SIZE;
        let new_block = ((*block).payload() + front_len) as *mut BlockHeader;

        (*new_block).length = remainder;
        (*new_block).is_free = true;
        (*new_block).next = (*block).next;
        (*new_block).prev = block;
        if !(*block).next.is_null() {
            (*(*block).next).prev = new_block;
        }
        (*block).next = new_block;
        (*block).length = front_len;

        if self.last == block {
            self.last = new_block;
        }
    }

    /// Tries to serve `(size, align)` from the free block `block`.
    ///
    /// An aligned allocation whose payload does not fall on the block start
    /// is carved out by first splitting off the leading slack as its own
    /// free block, so the header always sits directly below the payload.
    unsafe fn try_carve(
        &mut self,
        mut block: *mut BlockHeader,
        size: usize,
        align: usize,
    ) -> Option<*mut u8> {
        let payload = (*block).payload();
        let mut aligned = round_up(payload, align);
        if aligned != payload && aligned - payload < HEADER_SIZE + HEAP_GRANULARITY {
            // The leading slack must fit a header and a minimal payload;
            // take the next alignment boundary instead.
            aligned += align;
        }
        if aligned != payload {
            let gap = aligned - payload;
            if (*block).length < gap + size {
                return None;
            }
            self.split_block(block, gap - HEADER_SIZE);
            block = (*block).next;
        }

        if (*block).length < size {
            return None;
        }
        if (*block).length > size + HEADER_SIZE + HEAP_GRANULARITY {
            self.split_block(block, size);
        }
        (*block).is_free = false;
        Some((*block).payload() as *mut u8)
    }

    /// First-fit allocation; grows the heap and retries when nothing fits.
    unsafe fn allocate(&mut self, size: usize, align: usize) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }
        if self.head.is_null() {
            panic!("kernel heap used before init");
        }

        let size = round_up(size, HEAP_GRANULARITY);
        let align = align.max(HEAP_GRANULARITY);

        loop {
            let mut block = self.head;
            while !block.is_null() {
                if (*block).is_free {
                    if let Some(payload) = self.try_carve(block, size, align) {
                        return payload;
                    }
                }
                block = (*block).next;
            }
            self.grow(size + align + HEADER_SIZE);
        }
    }

    /// Maps enough new pages for `bytes`, appends them as a free block at
    /// the tail and coalesces backward.
    unsafe fn grow(&mut self, bytes: usize) {
        let bytes = round_up(bytes, PAGE_SIZE);
        let pages = bytes / PAGE_SIZE;

        let base = paging::heap_request_page();
        for _ in 1..pages {
            paging::heap_request_page();
        }
        debug!("heap grown by {} pages at {:#x}", pages, base.as_u64());

        let header = base.as_mut_ptr::<BlockHeader>();
        (*header).length = bytes - HEADER_SIZE;
        (*header).is_free = true;
        (*header).next = ptr::null_mut();
        (*header).prev = self.last;
        (*self.last).next = header;
        self.last = header;

        let prev = (*header).prev;
        if !prev.is_null() && (*prev).is_free {
            self.coalesce_forward(prev);
        }
    }

    /// Absorbs `block.next` into `block` when both are free and physically
    /// adjacent (heap growth can leave holes in the virtual region).
    unsafe fn coalesce_forward(&mut self, block: *mut BlockHeader) {
        let next = (*block).next;
        if next.is_null() || !(*next).is_free || (*block).end() != next as usize {
            return;
        }
        if self.last == next {
            self.last = block;
        }
        (*block).length += HEADER_SIZE + (*next).length;
        (*block).next = (*next).next;
        if !(*block).next.is_null() {
            (*(*block).next).prev = block;
        }
    }

    /// Releases the block owning `ptr` and restores the coalescing
    /// invariant in both directions.
    unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let block = (ptr as usize - HEADER_SIZE) as *mut BlockHeader;
        (*block).is_free = true;

        self.coalesce_forward(block);
        let prev = (*block).prev;
        if !prev.is_null() && (*prev).is_free {
            self.coalesce_forward(prev);
        }
    }

    /// Number of free blocks and total free payload, for diagnostics.
    fn free_stats(&self) -> (usize, usize) {
        let mut blocks = 0;
        let mut bytes = 0;
        let mut cursor = self.head;
        while !cursor.is_null() {
            unsafe {
                if (*cursor).is_free {
                    blocks += 1;
                    bytes += (*cursor).length;
                }
                cursor = (*cursor).next;
            }
        }
        (blocks, bytes)
    }
}

struct LockedHeap(Mutex<KernelHeap>);

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap(Mutex::new(KernelHeap::empty()));

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.0.lock().allocate(layout.size(), layout.align())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.0.lock().free(ptr);
    }
}

/// Creates the heap over `pages` fresh pages. Must run after the frame
/// allocator and before the first allocation.
pub fn init_kmalloc(pages: usize) {
    unsafe {
        ALLOCATOR.0.lock().init(pages);
    }
}

/// Allocates `size` bytes, aligned to the heap granularity. Returns null
/// for `size == 0`.
pub fn kmalloc(size: usize) -> *mut u8 {
    unsafe { ALLOCATOR.0.lock().allocate(size, HEAP_GRANULARITY) }
}

/// Releases an allocation returned by [`kmalloc`]. Null is ignored.
pub fn kfree(ptr: *mut u8) {
    unsafe {
        ALLOCATOR.0.lock().free(ptr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::{boxed::Box, string::String, vec, vec::Vec};

    fn free_stats() -> (usize, usize) {
        ALLOCATOR.0.lock().free_stats()
    }

    /// Walks the whole list checking the doubly-linked invariant and that
    /// no two adjacent free blocks exist.
    fn check_invariants() {
        let heap = ALLOCATOR.0.lock();
        let mut cursor = heap.head;
        unsafe {
            while !cursor.is_null() {
                let next = (*cursor).next;
                if !next.is_null() {
                    assert_eq!((*next).prev, cursor, "list link broken");
                    let adjacent = (*cursor).end() == next as usize;
                    assert!(
                        !(adjacent && (*cursor).is_free && (*next).is_free),
                        "adjacent free blocks left behind"
                    );
                }
                assert_eq!((*cursor).length % HEAP_GRANULARITY, 0);
                cursor = next;
            }
        }
    }

    #[test_case]
    fn kmalloc_zero_returns_null() {
        assert!(kmalloc(0).is_null());
    }

    #[test_case]
    fn kmalloc_aligns_payloads() {
        let ptr = kmalloc(24);
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % HEAP_GRANULARITY, 0);
        kfree(ptr);
    }

    /// Two live allocations are disjoint; the second sits past the first
    /// payload plus a header.
    #[test_case]
    fn sequential_allocations_are_disjoint() {
        let first = kmalloc(16);
        let second = kmalloc(32);
        assert!(!first.is_null() && !second.is_null());
        assert!(second as usize >= first as usize + 16 + HEADER_SIZE);
        kfree(first);
        kfree(second);
        check_invariants();
    }

    /// Freeing everything and allocating again hands back the first slot.
    #[test_case]
    fn free_then_alloc_reuses_first_block() {
        let first = kmalloc(16);
        let second = kmalloc(32);
        kfree(first);
        kfree(second);
        let third = kmalloc(16);
        assert_eq!(third, first);
        kfree(third);
    }

    /// A fully released heap collapses back to its pre-test free shape.
    #[test_case]
    fn full_release_restores_free_list() {
        let before = free_stats();
        let mut ptrs = [ptr::null_mut(); 8];
        for (i, slot) in ptrs.iter_mut().enumerate() {
            *slot = kmalloc(16 * (i + 1));
        }
        // Free in mixed order to exercise both coalescing directions.
        for &i in &[3usize, 0, 7, 1, 5, 2, 6, 4] {
            kfree(ptrs[i]);
            check_invariants();
        }
        assert_eq!(free_stats(), before);
    }

    /// Layouts with alignment above the granularity still come back
    /// correctly aligned and freeable.
    #[test_case]
    fn over_aligned_layouts() {
        #[repr(align(64))]
        struct Aligned([u8; 64]);

        let boxed = Box::new(Aligned([7; 64]));
        assert_eq!(&*boxed as *const Aligned as usize % 64, 0);
        drop(boxed);
        check_invariants();
    }

    #[test_case]
    fn box_roundtrip() {
        let value = Box::new(42);
        assert_eq!(*value, 42);
    }

    #[test_case]
    fn vec_accumulates() {
        let mut values = Vec::new();
        for i in 0..100 {
            values.push(i);
        }
        let expected: usize = (0..100).sum();
        assert_eq!(values.iter().sum::<usize>(), expected);
    }

    #[test_case]
    fn string_allocation() {
        let s = String::from("kernel heap says hi");
        assert_eq!(s, "kernel heap says hi");
    }

    /// Half a megabyte forces the heap through several growth steps.
    #[test_case]
    fn large_allocation_grows_heap() {
        let size = 512 * 1024;
        let buf: Vec<u8> = vec![1; size];
        assert_eq!(buf.len(), size);
        assert!(buf.iter().all(|&b| b == 1));
        drop(buf);
        check_invariants();
    }
}
