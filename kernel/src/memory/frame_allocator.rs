//! Bitmap physical frame allocator.
//!
//! One bit per 4 KiB frame, 1 = in use. The bitmap itself lives at a fixed
//! offset inside the largest available range of the loader's memory map and
//! its frames stay permanently marked used. Frames below [`ALLOC_FLOOR`]
//! are never handed out; the kernel image and boot data live there.

use crate::boot::{MemoryRegion, RegionKind};
use crate::constants::memory::{ALLOC_FLOOR, BITMAP_OFFSET, FRAME_SIZE};
use crate::memory::phys_to_ptr;
use log::info;
use spin::Mutex;
use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB},
    PhysAddr,
};

/// Global allocator instance, populated by [`init`].
pub static FRAME_ALLOCATOR: Mutex<Option<BitmapFrameAllocator>> = Mutex::new(None);

pub struct BitmapFrameAllocator {
    // Bitmap storage, identity-mapped inside the working pool.
    bitmap: *mut u8,
    bitmap_size: usize,
    // Frames addressable by the bitmap, counted from physical zero.
    total_frames: usize,
    free_frames: usize,
    // Lifetime counters for diagnostics.
    allocate_count: usize,
    free_count: usize,
}

// The raw bitmap pointer refers to memory owned exclusively by this
// allocator; access is serialized by the FRAME_ALLOCATOR mutex.
unsafe impl Send for BitmapFrameAllocator {}

impl BitmapFrameAllocator {
    /// Builds the allocator from the loader's memory map.
    ///
    /// The largest available range becomes the working pool. The bitmap is
    /// placed [`BITMAP_OFFSET`] bytes into that range, fully marked used,
    /// and then the remainder of the range above [`ALLOC_FLOOR`] is freed.
    ///
    /// # Safety
    ///
    /// The memory map must describe RAM that is identity-mapped and not in
    /// use by anything the map does not account for.
    pub unsafe fn init(memory_map: &[MemoryRegion]) -> Self {
        let mut available: u64 = 0;
        let mut pool: Option<&MemoryRegion> = None;
        for region in memory_map {
            if region.kind == RegionKind::Available {
                available += region.length;
                if pool.is_none_or(|best| region.length > best.length) {
                    pool = Some(region);
                }
            }
        }
        let pool = match pool {
            Some(region) => region,
            None => panic!("no available memory in the boot memory map"),
        };
        info!("total available memory: {} MB", available / 1024 / 1024);

        let pool_end = pool.base + pool.length;
        let total_frames = (pool_end as usize).div_ceil(FRAME_SIZE);
        let bitmap_size = total_frames.div_ceil(8);
        let bitmap = (pool.base + BITMAP_OFFSET) as *mut u8;
        info!(
            "physical memory bitmap at {:#x}, size {} bytes",
            bitmap as u64, bitmap_size
        );

        // Everything starts out used, including the bitmap's own frames.
        core::ptr::write_bytes(bitmap, 0xFF, bitmap_size);

        let mut allocator = Self {
            bitmap,
            bitmap_size,
            total_frames,
            free_frames: 0,
            allocate_count: 0,
            free_count: 0,
        };

        let mut pool_start = pool.base + BITMAP_OFFSET + bitmap_size as u64;
        if pool_start < ALLOC_FLOOR {
            pool_start = ALLOC_FLOOR;
        }
        pool_start = (pool_start + FRAME_SIZE as u64 - 1) & !(FRAME_SIZE as u64 - 1);
        allocator.free_range(pool_start, pool_end - pool_start);
        info!(
            "frame pool {:#x}-{:#x}, {} frames free",
            pool_start, pool_end, allocator.free_frames
        );

        allocator
    }

    fn set_bit(&mut self, frame_index: usize) {
        assert!(frame_index < self.total_frames);
        let mask = 1u8 << (frame_index % 8);
        unsafe {
            let byte = self.bitmap.add(frame_index / 8);
            *byte |= mask;
        }
        self.free_frames -= 1;
    }

    fn clear_bit(&mut self, frame_index: usize) {
        assert!(frame_index < self.total_frames);
        let mask = 1u8 << (frame_index % 8);
        unsafe {
            let byte = self.bitmap.add(frame_index / 8);
            *byte &= !mask;
        }
        self.free_frames += 1;
    }

    fn is_bit_set(&self, frame_index: usize) -> bool {
        assert!(frame_index < self.total_frames);
        let mask = 1u8 << (frame_index % 8);
        unsafe { *self.bitmap.add(frame_index / 8) & mask != 0 }
    }

    /// Whether the frame holding `addr` is currently marked used.
    pub fn is_frame_used(&self, addr: PhysAddr) -> bool {
        self.is_bit_set(addr.as_u64() as usize / FRAME_SIZE)
    }

    /// Finds, marks and returns the first free frame, or `None` when the
    /// bitmap has no clear bit left.
    fn find_free_frame(&mut self) -> Option<usize> {
        for byte_index in 0..self.bitmap_size {
            let byte = unsafe { *self.bitmap.add(byte_index) };
            if byte == 0xFF {
                continue;
            }
            for bit in 0..8 {
                let frame_index = byte_index * 8 + bit;
                if frame_index >= self.total_frames {
                    break;
                }
                if byte & (1 << bit) == 0 {
                    return Some(frame_index);
                }
            }
        }
        None
    }

    /// Allocates one frame, optionally zeroing it.
    ///
    /// Exhaustion of physical memory is unrecoverable and panics.
    pub fn alloc_page(&mut self, zero: bool) -> PhysAddr {
        let frame_index = match self.find_free_frame() {
            Some(index) => index,
            None => panic!("out of physical memory"),
        };
        self.set_bit(frame_index);
        self.allocate_count += 1;

        let addr = PhysAddr::new((frame_index * FRAME_SIZE) as u64);
        if zero {
            unsafe {
                core::ptr::write_bytes(phys_to_ptr(addr), 0, FRAME_SIZE);
            }
        }
        addr
    }

    /// Returns the frame holding `addr` to the pool. Freeing an already
    /// free frame is a no-op; double frees are not detected.
    pub fn free_page(&mut self, addr: PhysAddr) {
        let frame_index = addr.as_u64() as usize / FRAME_SIZE;
        if self.is_bit_set(frame_index) {
            self.clear_bit(frame_index);
            self.free_count += 1;
        }
    }

    /// Clears the bits covering `[base, base + length)`.
    pub fn free_range(&mut self, base: u64, length: u64) {
        let start_frame = base as usize / FRAME_SIZE;
        let end_frame = (base + length) as usize / FRAME_SIZE;
        for frame_index in start_frame..end_frame {
            self.clear_bit(frame_index);
        }
    }

    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    pub fn allocate_count(&self) -> usize {
        self.allocate_count
    }

    pub fn free_count(&self) -> usize {
        self.free_count
    }
}

unsafe impl FrameAllocator<Size4KiB> for BitmapFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        let frame_index = self.find_free_frame()?;
        self.set_bit(frame_index);
        self.allocate_count += 1;
        Some(PhysFrame::containing_address(PhysAddr::new(
            (frame_index * FRAME_SIZE) as u64,
        )))
    }
}

impl FrameDeallocator<Size4KiB> for BitmapFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        self.free_page(frame.start_address());
    }
}

/// Initializes the global allocator from the loader memory map.
pub fn init(memory_map: &[MemoryRegion]) {
    let allocator = unsafe { BitmapFrameAllocator::init(memory_map) };
    *FRAME_ALLOCATOR.lock() = Some(allocator);
}

fn with_allocator<R>(f: impl FnOnce(&mut BitmapFrameAllocator) -> R) -> R {
    let mut guard = FRAME_ALLOCATOR.lock();
    match guard.as_mut() {
        Some(allocator) => f(allocator),
        None => panic!("frame allocator used before init"),
    }
}

/// Allocates one physical frame through the global allocator.
pub fn alloc_page(zero: bool) -> PhysAddr {
    with_allocator(|allocator| allocator.alloc_page(zero))
}

/// Frees one physical frame through the global allocator.
pub fn free_page(addr: PhysAddr) {
    with_allocator(|allocator| allocator.free_page(addr));
}

/// Logs the allocator counters.
pub fn log_stats() {
    with_allocator(|allocator| {
        info!(
            "frame allocator: {} free, {} allocated, {} freed",
            allocator.free_frames(),
            allocator.allocate_count(),
            allocator.free_count()
        );
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Allocated frames sit above the floor, are frame-aligned, distinct,
    /// and marked used in the bitmap.
    #[test_case]
    fn alloc_respects_floor_and_alignment() {
        let first = alloc_page(true);
        let second = alloc_page(false);

        assert!(first.as_u64() >= ALLOC_FLOOR);
        assert!(second.as_u64() >= ALLOC_FLOOR);
        assert_eq!(first.as_u64() % FRAME_SIZE as u64, 0);
        assert_ne!(first, second);
        with_allocator(|allocator| {
            assert!(allocator.is_frame_used(first));
            assert!(allocator.is_frame_used(second));
        });

        free_page(first);
        free_page(second);
    }

    /// A zeroed allocation reads back as zero through the identity map.
    #[test_case]
    fn alloc_zeroed_frame_is_zero() {
        let addr = alloc_page(true);
        let frame = unsafe {
            core::slice::from_raw_parts(crate::memory::phys_to_ptr(addr), FRAME_SIZE)
        };
        assert!(frame.iter().all(|&b| b == 0));
        free_page(addr);
    }

    /// The scan starts at the bitmap head, so alloc/free/alloc returns the
    /// same frame.
    #[test_case]
    fn alloc_free_alloc_reuses_frame() {
        let first = alloc_page(false);
        free_page(first);
        let second = alloc_page(false);
        assert_eq!(first, second);
        free_page(second);
    }

    /// The `x86_64` allocator traits front the same bitmap.
    #[test_case]
    fn frame_trait_surface() {
        use x86_64::structures::paging::{FrameAllocator, FrameDeallocator};
        with_allocator(|allocator| {
            let frame = allocator.allocate_frame().unwrap();
            assert_eq!(frame.start_address().as_u64() % FRAME_SIZE as u64, 0);
            assert!(allocator.is_frame_used(frame.start_address()));
            unsafe { allocator.deallocate_frame(frame) };
        });
    }

    /// Freeing an already free frame leaves the counters balanced.
    #[test_case]
    fn double_free_is_noop() {
        let addr = alloc_page(false);
        free_page(addr);
        let free_before = with_allocator(|a| a.free_frames());
        free_page(addr);
        assert_eq!(with_allocator(|a| a.free_frames()), free_before);
    }
}
