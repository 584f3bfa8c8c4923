//! Global descriptor table and task state segments.
//!
//! Flat 64-bit layout: null, kernel code/data, user code/data, then one
//! TSS descriptor pair per potential CPU. Only the BSP loads its TSS in
//! v1, and no IST stacks are assigned (all vectors run on the interrupted
//! stack).

use crate::constants::MAX_CPUS;
use lazy_static::lazy_static;
use x86_64::instructions::segmentation::{Segment, CS, DS, ES, FS, GS, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::PrivilegeLevel;

const BASE_ENTRIES: usize = 5; // null + kernel code/data + user code/data
const TSS_ENTRIES_PER_CPU: usize = 2; // a TSS descriptor spans two slots
const GDT_ENTRIES: usize = BASE_ENTRIES + TSS_ENTRIES_PER_CPU * MAX_CPUS;

lazy_static! {
    static ref TSS: [TaskStateSegment; MAX_CPUS] = [TaskStateSegment::new(); MAX_CPUS];

    static ref GDT: (GlobalDescriptorTable<GDT_ENTRIES>, Selectors) = {
        let mut gdt = GlobalDescriptorTable::<GDT_ENTRIES>::empty();

        let code_selector = gdt.append(Descriptor::kernel_code_segment());
        let data_selector = gdt.append(Descriptor::kernel_data_segment());
        let user_code_selector = gdt.append(Descriptor::user_code_segment());
        let user_data_selector = gdt.append(Descriptor::user_data_segment());

        let mut tss_selectors = [SegmentSelector::new(0, PrivilegeLevel::Ring0); MAX_CPUS];
        for (i, selector) in tss_selectors.iter_mut().enumerate() {
            *selector = gdt.append(Descriptor::tss_segment(&TSS[i]));
        }

        (gdt, Selectors {
            code_selector,
            data_selector,
            user_code_selector,
            user_data_selector,
            tss_selectors,
        })
    };
}

#[derive(Debug)]
struct Selectors {
    code_selector: SegmentSelector,
    data_selector: SegmentSelector,
    #[allow(dead_code)]
    user_code_selector: SegmentSelector,
    #[allow(dead_code)]
    user_data_selector: SegmentSelector,
    tss_selectors: [SegmentSelector; MAX_CPUS],
}

/// Selector task contexts and the IDT use for kernel code.
pub fn kernel_code_selector() -> SegmentSelector {
    GDT.1.code_selector
}

/// Selector task contexts use for kernel data and stack segments.
pub fn kernel_data_selector() -> SegmentSelector {
    GDT.1.data_selector
}

/// Loads the GDT, reloads every segment register and loads this CPU's
/// task register.
pub fn init(cpu_id: u32) {
    assert!((cpu_id as usize) < MAX_CPUS, "CPU id exceeds MAX_CPUS");

    GDT.0.load();

    unsafe {
        CS::set_reg(GDT.1.code_selector);

        DS::set_reg(GDT.1.data_selector);
        ES::set_reg(GDT.1.data_selector);
        FS::set_reg(GDT.1.data_selector);
        GS::set_reg(GDT.1.data_selector);
        SS::set_reg(GDT.1.data_selector);

        load_tss(GDT.1.tss_selectors[cpu_id as usize]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The flat-model selector values the rest of the kernel hard-wires
    /// into task contexts.
    #[test_case]
    fn selector_layout() {
        assert_eq!(kernel_code_selector().0, 0x08);
        assert_eq!(kernel_data_selector().0, 0x10);
    }

    /// CS actually holds the kernel code selector after init.
    #[test_case]
    fn cs_matches_kernel_code() {
        assert_eq!(CS::get_reg(), kernel_code_selector());
    }
}
