//! Local APIC configuration.

/// Default physical base of the xAPIC MMIO window.
pub const LAPIC_DEFAULT_BASE: u64 = 0xFEE0_0000;

/// Initial count loaded into the timer; with the /16 divider this gives a
/// tick rate in the low hundreds of hertz on common emulated hardware.
pub const TIMER_INITIAL_COUNT: u32 = 10_000_000;

/// Divide-configuration encoding for divide-by-16.
pub const TIMER_DIVIDE_BY_16: u32 = 0x3;
