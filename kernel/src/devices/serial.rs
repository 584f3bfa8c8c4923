//! COM1 serial output.
//!
//! All diagnostic output goes through this sink; there is no serial input.

use crate::constants::ports::SERIAL_PORT;
use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

lazy_static! {
    /// The first serial port, initialized on first use.
    pub static ref SERIAL1: Mutex<SerialPort> = {
        let mut port = unsafe { SerialPort::new(SERIAL_PORT) };
        port.init();
        Mutex::new(port)
    };
}

#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    use core::fmt::Write;
    // Interrupt handlers print too; masking while the lock is held keeps
    // them from spinning on a lock their own CPU owns.
    x86_64::instructions::interrupts::without_interrupts(|| {
        SERIAL1
            .lock()
            .write_fmt(args)
            .expect("serial write failed");
    });
}

/// Prints formatted text to COM1.
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::devices::serial::_print(format_args!($($arg)*))
    };
}

/// Prints formatted text to COM1, followed by a newline.
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}
