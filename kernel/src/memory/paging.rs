//! 4-level paging: translation, mapping, unmapping, and the heap's
//! page-at-a-time virtual region.
//!
//! An [`AddressSpace`] is a handle on the physical frame of a P4 table.
//! v1 runs entirely in the address space inherited from the loader, so the
//! only handle ever constructed wraps the live CR3 value. Intermediate
//! tables are allocated lazily on map and never reclaimed on unmap.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::constants::memory::{HEAP_VIRT_BASE, PAGE_SIZE};
use crate::memory::{frame_allocator, phys_to_ptr};
use x86_64::registers::control::Cr3;
use x86_64::structures::paging::page_table::PageTableEntry;
use x86_64::structures::paging::{PageTable, PageTableFlags};
use x86_64::{PhysAddr, VirtAddr};

/// Mask selecting the flag bits a leaf entry may carry.
const LEAF_FLAG_MASK: u64 = 0xFFF;

/// A virtual address with no translation at some level of the walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotMapped;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The walk hit a 2 MiB leaf where an intermediate table was expected.
    HugeParent,
}

/// Owning handle to a P4 table, identified by its physical address.
pub struct AddressSpace {
    p4_frame: PhysAddr,
}

impl AddressSpace {
    /// Handle on the address space the CPU is executing in.
    pub fn current() -> Self {
        let (frame, _) = Cr3::read();
        AddressSpace {
            p4_frame: frame.start_address(),
        }
    }

    pub fn p4_addr(&self) -> PhysAddr {
        self.p4_frame
    }

    fn table_at(addr: PhysAddr) -> &'static mut PageTable {
        unsafe { &mut *(phys_to_ptr(addr) as *mut PageTable) }
    }

    /// Walks the tables for `virt` and returns the backing physical
    /// address, honoring 2 MiB leaves at P2.
    pub fn translate(&self, virt: VirtAddr) -> Result<PhysAddr, NotMapped> {
        let v = virt.as_u64();

        let p4 = Self::table_at(self.p4_frame);
        let p4e = &p4[virt.p4_index()];
        if !p4e.flags().contains(PageTableFlags::PRESENT) {
            return Err(NotMapped);
        }

        let p3 = Self::table_at(p4e.addr());
        let p3e = &p3[virt.p3_index()];
        if !p3e.flags().contains(PageTableFlags::PRESENT) {
            return Err(NotMapped);
        }

        let p2 = Self::table_at(p3e.addr());
        let p2e = &p2[virt.p2_index()];
        if !p2e.flags().contains(PageTableFlags::PRESENT) {
            return Err(NotMapped);
        }
        if p2e.flags().contains(PageTableFlags::HUGE_PAGE) {
            let base = p2e.addr().as_u64() & !0x1F_FFFF;
            return Ok(PhysAddr::new(base | (v & 0x1F_FFFF)));
        }

        let p1 = Self::table_at(p2e.addr());
        let p1e = &p1[virt.p1_index()];
        if !p1e.flags().contains(PageTableFlags::PRESENT) {
            return Err(NotMapped);
        }
        Ok(PhysAddr::new(p1e.addr().as_u64() | (v & 0xFFF)))
    }

    /// Returns the table an intermediate entry points to, creating and
    /// zeroing it first when the entry is not present. New intermediates
    /// are writable and mirror only the user bit from `flags`.
    fn next_table_or_create(
        entry: &mut PageTableEntry,
        flags: PageTableFlags,
    ) -> Result<&'static mut PageTable, MapError> {
        if entry.flags().contains(PageTableFlags::HUGE_PAGE) {
            return Err(MapError::HugeParent);
        }
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            let table_frame = frame_allocator::alloc_page(true);
            let mut table_flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
            if flags.contains(PageTableFlags::USER_ACCESSIBLE) {
                table_flags |= PageTableFlags::USER_ACCESSIBLE;
            }
            entry.set_addr(table_frame, table_flags);
        }
        Ok(Self::table_at(entry.addr()))
    }

    /// Maps the page at `virt` to the frame at `phys`, creating missing
    /// intermediate tables. Fresh mappings are not flushed from the TLB.
    pub fn map_page(
        &self,
        phys: PhysAddr,
        virt: VirtAddr,
        flags: PageTableFlags,
    ) -> Result<(), MapError> {
        let p4 = Self::table_at(self.p4_frame);
        let p3 = Self::next_table_or_create(&mut p4[virt.p4_index()], flags)?;
        let p2 = Self::next_table_or_create(&mut p3[virt.p3_index()], flags)?;
        let p1 = Self::next_table_or_create(&mut p2[virt.p2_index()], flags)?;

        let leaf_flags = PageTableFlags::from_bits_truncate(flags.bits() & LEAF_FLAG_MASK);
        p1[virt.p1_index()].set_addr(PhysAddr::new(phys.as_u64() & !0xFFF), leaf_flags);
        Ok(())
    }

    /// Removes the translation for `virt`. Missing intermediates make this
    /// a silent no-op; intermediate tables are kept even when they empty
    /// out. A 2 MiB leaf at P2 is cleared whole.
    pub fn unmap_page(&self, virt: VirtAddr) {
        let p4 = Self::table_at(self.p4_frame);
        let p4e = &mut p4[virt.p4_index()];
        if !p4e.flags().contains(PageTableFlags::PRESENT) {
            return;
        }

        let p3 = Self::table_at(p4e.addr());
        let p3e = &mut p3[virt.p3_index()];
        if !p3e.flags().contains(PageTableFlags::PRESENT) {
            return;
        }

        let p2 = Self::table_at(p3e.addr());
        let p2e = &mut p2[virt.p2_index()];
        if !p2e.flags().contains(PageTableFlags::PRESENT) {
            return;
        }
        if p2e.flags().contains(PageTableFlags::HUGE_PAGE) {
            p2e.set_flags(p2e.flags() - PageTableFlags::PRESENT);
            x86_64::instructions::tlb::flush(virt);
            return;
        }

        let p1 = Self::table_at(p2e.addr());
        let p1e = &mut p1[virt.p1_index()];
        if !p1e.flags().contains(PageTableFlags::PRESENT) {
            return;
        }
        p1e.set_flags(p1e.flags() - PageTableFlags::PRESENT);
        x86_64::instructions::tlb::flush(virt);
    }
}

/// Next unclaimed page of the heap's virtual region.
static NEXT_HEAP_PAGE: AtomicU64 = AtomicU64::new(HEAP_VIRT_BASE);

/// Reserves the next virtual page of the heap region, backs it with a
/// zeroed frame mapped read/write for the kernel, and returns its address.
/// The region grows monotonically; pages are never handed out twice.
pub fn heap_request_page() -> VirtAddr {
    let virt = VirtAddr::new(NEXT_HEAP_PAGE.fetch_add(PAGE_SIZE as u64, Ordering::SeqCst));
    let phys = frame_allocator::alloc_page(true);
    if let Err(err) = AddressSpace::current().map_page(
        phys,
        virt,
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
    ) {
        panic!("mapping heap page {:?} failed: {:?}", virt, err);
    }
    virt
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scratch virtual region far away from the identity map and the heap.
    const SCRATCH_BASE: u64 = 0x4000_0000_0000;

    /// Mapping, translating, remapping and unmapping a page behaves per the
    /// table-walk contract, and writes land in the mapped frame.
    #[test_case]
    fn map_translate_unmap_roundtrip() {
        let space = AddressSpace::current();
        let virt = VirtAddr::new(SCRATCH_BASE);
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;

        let first = frame_allocator::alloc_page(true);
        space.map_page(first, virt, flags).unwrap();
        assert_eq!(space.translate(virt), Ok(first));

        let probe = virt.as_mut_ptr::<u64>();
        unsafe {
            probe.write_volatile(0xDEAD_CAFE_BABE);
            assert_eq!(probe.read_volatile(), 0xDEAD_CAFE_BABE);
        }

        space.unmap_page(virt);
        assert_eq!(space.translate(virt), Err(NotMapped));

        let second = frame_allocator::alloc_page(true);
        space.map_page(second, virt, flags).unwrap();
        assert_eq!(space.translate(virt), Ok(second));

        space.unmap_page(virt);
        frame_allocator::free_page(first);
        frame_allocator::free_page(second);
    }

    /// Translation offsets within a page are preserved.
    #[test_case]
    fn translate_keeps_page_offset() {
        let space = AddressSpace::current();
        let virt = VirtAddr::new(SCRATCH_BASE + 0x1000);
        let frame = frame_allocator::alloc_page(true);
        space
            .map_page(frame, virt, PageTableFlags::PRESENT | PageTableFlags::WRITABLE)
            .unwrap();

        let translated = space.translate(VirtAddr::new(virt.as_u64() + 0x123)).unwrap();
        assert_eq!(translated.as_u64(), frame.as_u64() + 0x123);

        space.unmap_page(virt);
        frame_allocator::free_page(frame);
    }

    /// Unmapping a hole and translating an unmapped address are benign.
    #[test_case]
    fn unmapped_address_reports_not_mapped() {
        let space = AddressSpace::current();
        let virt = VirtAddr::new(0xFFFF_A000_0000_0000u64);
        space.unmap_page(virt);
        assert_eq!(space.translate(virt), Err(NotMapped));
    }

    /// Successive heap pages come out adjacent and zeroed.
    #[test_case]
    fn heap_pages_grow_monotonically() {
        let first = heap_request_page();
        let second = heap_request_page();
        assert_eq!(second.as_u64(), first.as_u64() + PAGE_SIZE as u64);
        let page = unsafe { core::slice::from_raw_parts(first.as_ptr::<u8>(), PAGE_SIZE) };
        assert!(page.iter().all(|&b| b == 0));
    }
}
