// Wire-format structs keep their full layout even where only some fields
// are consumed.
#![allow(dead_code)]

//! Multiboot2 boot information parsing.
//!
//! The loader hands the kernel a magic value and the physical address of the
//! boot information structure: a `total_size` header followed by a sequence
//! of 8-byte-aligned tags. Every tag the loader is known to emit is decoded
//! and logged; the memory map and the optional debug-symbols module are kept
//! for the rest of the kernel.

use core::ffi::CStr;
use log::{info, warn};

/// Value the loader passes in the first argument register.
pub const BOOTLOADER_MAGIC: u32 = 0x36D7_6289;

const TAG_END: u32 = 0;
const TAG_CMDLINE: u32 = 1;
const TAG_BOOT_LOADER_NAME: u32 = 2;
const TAG_MODULE: u32 = 3;
const TAG_MMAP: u32 = 6;
const TAG_FRAMEBUFFER: u32 = 8;
const TAG_EFI64: u32 = 12;
const TAG_SMBIOS: u32 = 13;
const TAG_ACPI_OLD: u32 = 14;
const TAG_ACPI_NEW: u32 = 15;
const TAG_EFI64_IH: u32 = 20;
const TAG_EDID: u32 = 256;
const TAG_SMP: u32 = 257;
const TAG_PARTUUID: u32 = 258;

/// Name of the module carrying debug symbols for the backtrace path.
const DEBUG_MODULE_NAME: &[u8] = b"kernel.dbg";

#[repr(C)]
struct InfoHeader {
    total_size: u32,
    reserved: u32,
}

/// Common prefix of every tag.
#[repr(C)]
struct Tag {
    kind: u32,
    size: u32,
}

#[repr(C)]
struct ModuleTag {
    kind: u32,
    size: u32,
    mod_start: u32,
    mod_end: u32,
    // NUL-terminated command line follows.
}

#[repr(C)]
struct MmapTag {
    kind: u32,
    size: u32,
    entry_size: u32,
    entry_version: u32,
    // `MmapEntry` records follow.
}

#[repr(C)]
#[derive(Clone, Copy)]
struct MmapEntry {
    base_addr: u64,
    length: u64,
    kind: u32,
    reserved: u32,
}

#[repr(C)]
struct FramebufferTag {
    kind: u32,
    size: u32,
    addr: u64,
    pitch: u32,
    width: u32,
    height: u32,
    bpp: u8,
    fb_type: u8,
    reserved: u16,
    red_field_pos: u8,
    red_mask_size: u8,
    green_field_pos: u8,
    green_mask_size: u8,
    blue_field_pos: u8,
    blue_mask_size: u8,
}

#[repr(C)]
struct PointerTag {
    kind: u32,
    size: u32,
    pointer: u64,
}

#[repr(C)]
struct SmbiosTag {
    kind: u32,
    size: u32,
    major: u8,
    minor: u8,
    reserved: [u8; 6],
}

#[repr(C)]
struct SmpTag {
    kind: u32,
    size: u32,
    num_cores: u32,
    running_cores: u32,
    bspid: u32,
}

/// Classification of a memory-map range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Available,
    Reserved,
    AcpiReclaimable,
    Nvs,
    BadRam,
    Unknown(u32),
}

impl RegionKind {
    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => RegionKind::Available,
            2 => RegionKind::Reserved,
            3 => RegionKind::AcpiReclaimable,
            4 => RegionKind::Nvs,
            5 => RegionKind::BadRam,
            other => RegionKind::Unknown(other),
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            RegionKind::Available => "free",
            RegionKind::AcpiReclaimable => "ACPI",
            RegionKind::Nvs => "ACPI NVS",
            _ => "used",
        }
    }
}

/// One range from the loader's memory map.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: RegionKind,
}

/// Upper bound on memory-map entries retained from the loader.
pub const MAX_MEMORY_REGIONS: usize = 64;

/// Everything the rest of the kernel needs out of the boot information.
///
/// Collected into fixed-size storage because the parser runs before the
/// heap exists.
pub struct BootInfo {
    regions: [MemoryRegion; MAX_MEMORY_REGIONS],
    region_count: usize,
    /// Physical range of the `kernel.dbg` module, when the loader provided
    /// one.
    pub debug_module: Option<(u64, u64)>,
}

impl BootInfo {
    const fn empty() -> Self {
        BootInfo {
            regions: [MemoryRegion {
                base: 0,
                length: 0,
                kind: RegionKind::Reserved,
            }; MAX_MEMORY_REGIONS],
            region_count: 0,
            debug_module: None,
        }
    }

    /// The retained memory map, in loader order.
    pub fn memory_map(&self) -> &[MemoryRegion] {
        &self.regions[..self.region_count]
    }

    fn push_region(&mut self, region: MemoryRegion) {
        if self.region_count < MAX_MEMORY_REGIONS {
            self.regions[self.region_count] = region;
            self.region_count += 1;
        } else {
            warn!("memory map has more than {} entries, dropping one", MAX_MEMORY_REGIONS);
        }
    }
}

/// Reads the NUL-terminated string that trails a tag header.
///
/// # Safety
///
/// `ptr` must point at a NUL-terminated byte string inside the boot info.
unsafe fn trailing_str(ptr: *const u8) -> &'static [u8] {
    CStr::from_ptr(ptr.cast()).to_bytes()
}

fn bytes_as_str(bytes: &[u8]) -> &str {
    core::str::from_utf8(bytes).unwrap_or("<non-utf8>")
}

/// Walks the boot information at `mbi_addr` and returns the digest.
///
/// Tag iteration advances by `(tag.size + 7) & !7`; an END tag or running
/// past `total_size` terminates the walk. Unknown tags are logged and
/// skipped.
///
/// # Safety
///
/// `mbi_addr` must be the address of a well-formed Multiboot2 information
/// structure that stays mapped for the duration of the call.
pub unsafe fn parse(mbi_addr: u64) -> BootInfo {
    let header = &*(mbi_addr as *const InfoHeader);
    info!("boot info at {:#x}, announced size {:#x}", mbi_addr, header.total_size);

    let mut boot_info = BootInfo::empty();

    let mut tag_addr = mbi_addr + core::mem::size_of::<InfoHeader>() as u64;
    let end_addr = mbi_addr + u64::from(header.total_size);

    while tag_addr < end_addr {
        let tag = &*(tag_addr as *const Tag);
        if tag.kind == TAG_END {
            break;
        }
        handle_tag(tag_addr, tag, &mut boot_info);
        tag_addr += u64::from((tag.size + 7) & !7);
    }

    boot_info
}

unsafe fn handle_tag(tag_addr: u64, tag: &Tag, boot_info: &mut BootInfo) {
    match tag.kind {
        TAG_CMDLINE => {
            let s = trailing_str((tag_addr as *const u8).add(core::mem::size_of::<Tag>()));
            info!("command line = {}", bytes_as_str(s));
        }
        TAG_BOOT_LOADER_NAME => {
            let s = trailing_str((tag_addr as *const u8).add(core::mem::size_of::<Tag>()));
            info!("boot loader name = {}", bytes_as_str(s));
        }
        TAG_MODULE => {
            let module = &*(tag_addr as *const ModuleTag);
            let cmdline =
                trailing_str((tag_addr as *const u8).add(core::mem::size_of::<ModuleTag>()));
            let start = u64::from(module.mod_start);
            let end = u64::from(module.mod_end);
            if cmdline == DEBUG_MODULE_NAME {
                boot_info.debug_module = Some((start, end));
                info!("debugging enabled, dbg module at {:#x}-{:#x}", start, end);
            } else {
                info!(
                    "module at {:#x}-{:#x}, command line {}",
                    start,
                    end,
                    bytes_as_str(cmdline)
                );
            }
        }
        TAG_MMAP => {
            let mmap = &*(tag_addr as *const MmapTag);
            info!("memory map:");
            let mut entry_addr = tag_addr + core::mem::size_of::<MmapTag>() as u64;
            let tag_end = tag_addr + u64::from(tag.size);
            while entry_addr + core::mem::size_of::<MmapEntry>() as u64 <= tag_end {
                let entry = &*(entry_addr as *const MmapEntry);
                let kind = RegionKind::from_raw(entry.kind);
                info!(
                    "  base = {:#010x}, length = {:#010x}, type = {:#x} {}",
                    entry.base_addr,
                    entry.length,
                    entry.kind,
                    kind.describe()
                );
                boot_info.push_region(MemoryRegion {
                    base: entry.base_addr,
                    length: entry.length,
                    kind,
                });
                entry_addr += u64::from(mmap.entry_size);
            }
        }
        TAG_FRAMEBUFFER => {
            let fb = &*(tag_addr as *const FramebufferTag);
            info!("framebuffer:");
            info!("  address {:#x} pitch {}", fb.addr, fb.pitch);
            info!("  width {} height {} depth {} bpp", fb.width, fb.height, fb.bpp);
            info!("  red channel:   at {}, {} bits", fb.red_field_pos, fb.red_mask_size);
            info!("  green channel: at {}, {} bits", fb.green_field_pos, fb.green_mask_size);
            info!("  blue channel:  at {}, {} bits", fb.blue_field_pos, fb.blue_mask_size);
        }
        TAG_EFI64 => {
            let efi = &*(tag_addr as *const PointerTag);
            info!("EFI system table {:#x}", efi.pointer);
        }
        TAG_EFI64_IH => {
            let efi = &*(tag_addr as *const PointerTag);
            info!("EFI image handle {:#x}", efi.pointer);
        }
        TAG_SMBIOS => {
            let smbios = &*(tag_addr as *const SmbiosTag);
            info!("SMBIOS table major {} minor {}", smbios.major, smbios.minor);
        }
        TAG_ACPI_OLD => {
            info!("ACPI table (1.0, old RSDP)");
        }
        TAG_ACPI_NEW => {
            info!("ACPI table (2.0, new RSDP)");
        }
        TAG_EDID => {
            let edid = core::slice::from_raw_parts(
                (tag_addr as *const u8).add(core::mem::size_of::<Tag>()),
                tag.size as usize - core::mem::size_of::<Tag>(),
            );
            if edid.len() >= 23 {
                info!("EDID info");
                info!("  manufacturer ID {:02x}{:02x}", edid[8], edid[9]);
                info!(
                    "  EDID ID {:02x}{:02x} Version {} Rev {}",
                    edid[10], edid[11], edid[18], edid[19]
                );
                info!(
                    "  monitor type {:02x} size {} cm x {} cm",
                    edid[20], edid[21], edid[22]
                );
            }
        }
        TAG_SMP => {
            let smp = &*(tag_addr as *const SmpTag);
            info!("SMP supported");
            info!("  {} core(s)", smp.num_cores);
            info!("  {} running", smp.running_cores);
            info!("  {:02x} bsp id", smp.bspid);
        }
        TAG_PARTUUID => {
            info!("partition UUIDs ({} bytes)", tag.size);
        }
        other => {
            warn!("unknown boot tag type {} ({} bytes), skipping", other, tag.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Backing store for a hand-built boot information structure.
    #[repr(C, align(8))]
    struct MbiBuffer([u8; 512]);

    fn put_u32(buf: &mut [u8], off: usize, value: u32) {
        buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u64(buf: &mut [u8], off: usize, value: u64) {
        buf[off..off + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Builds an MBI with a command line, a module, a two-entry memory map
    /// and an END tag, then checks the digest.
    #[test_case]
    fn parse_synthetic_boot_info() {
        static mut BUF: MbiBuffer = MbiBuffer([0; 512]);
        let buf = unsafe { &mut *core::ptr::addr_of_mut!(BUF) }.0.as_mut_slice();

        let mut off = 8; // info header, patched at the end

        // CMDLINE tag: 8-byte header + "test\0" -> size 13, padded to 16.
        put_u32(buf, off, TAG_CMDLINE);
        put_u32(buf, off + 4, 13);
        buf[off + 8..off + 13].copy_from_slice(b"test\0");
        off += 16;

        // MODULE tag: header + start/end + "kernel.dbg\0" -> size 27.
        put_u32(buf, off, TAG_MODULE);
        put_u32(buf, off + 4, 27);
        put_u32(buf, off + 8, 0x80_0000);
        put_u32(buf, off + 12, 0x90_0000);
        buf[off + 16..off + 27].copy_from_slice(b"kernel.dbg\0");
        off += 32;

        // MMAP tag: header + entry_size/version + two 24-byte entries.
        put_u32(buf, off, TAG_MMAP);
        put_u32(buf, off + 4, 16 + 2 * 24);
        put_u32(buf, off + 8, 24);
        put_u32(buf, off + 12, 0);
        put_u64(buf, off + 16, 0);
        put_u64(buf, off + 24, 640 * 1024);
        put_u32(buf, off + 32, 2); // reserved
        put_u64(buf, off + 40, 0x10_0000);
        put_u64(buf, off + 48, 128 * 1024 * 1024);
        put_u32(buf, off + 56, 1); // available
        off += 64;

        // END tag.
        put_u32(buf, off, TAG_END);
        put_u32(buf, off + 4, 8);
        off += 8;

        put_u32(buf, 0, off as u32);

        let info = unsafe { parse(buf.as_ptr() as u64) };

        assert_eq!(info.memory_map().len(), 2);
        assert_eq!(info.memory_map()[0].kind, RegionKind::Reserved);
        assert_eq!(info.memory_map()[1].base, 0x10_0000);
        assert_eq!(info.memory_map()[1].length, 128 * 1024 * 1024);
        assert_eq!(info.memory_map()[1].kind, RegionKind::Available);
        assert_eq!(info.debug_module, Some((0x80_0000, 0x90_0000)));
    }

    /// Unknown region types survive the round trip as `Unknown`.
    #[test_case]
    fn region_kind_raw_values() {
        assert_eq!(RegionKind::from_raw(1), RegionKind::Available);
        assert_eq!(RegionKind::from_raw(5), RegionKind::BadRam);
        assert_eq!(RegionKind::from_raw(9), RegionKind::Unknown(9));
    }
}
