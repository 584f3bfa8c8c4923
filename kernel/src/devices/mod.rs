//! Hardware device drivers. Only the serial console exists in v1.

pub mod serial;
