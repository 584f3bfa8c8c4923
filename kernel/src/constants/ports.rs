//! I/O port definitions.

/// Base I/O port address for the first serial port (COM1).
pub const SERIAL_PORT: u16 = 0x3F8;

/// Legacy 8259 PIC command/data ports.
pub const PIC1_COMMAND: u16 = 0x20;
pub const PIC1_DATA: u16 = 0x21;
pub const PIC2_COMMAND: u16 = 0xA0;
pub const PIC2_DATA: u16 = 0xA1;

/// Conventionally unused port written for a short I/O delay.
pub const IO_WAIT_PORT: u16 = 0x80;

/// QEMU isa-debug-exit device, used by the test harness only.
pub const QEMU_EXIT_PORT: u16 = 0xF4;
