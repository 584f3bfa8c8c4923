//! Boot-protocol glue: parsing of the loader-provided information.

pub mod multiboot;

pub use multiboot::{BootInfo, MemoryRegion, RegionKind, BOOTLOADER_MAGIC};
