//! Interrupt vector assignments.

/// Vector the LAPIC timer fires on.
pub const TIMER_VECTOR: u8 = 0x20;

/// First and last vectors reachable by external interrupt sources.
pub const EXTERNAL_VECTOR_START: u8 = 0x20;
pub const EXTERNAL_VECTOR_END: u8 = 0x2F;

/// Vector the LAPIC reports internal errors on.
pub const ERROR_VECTOR: u8 = 0xFE;

/// Spurious-interrupt vector programmed into the SVR.
pub const SPURIOUS_VECTOR: u8 = 0xFF;
