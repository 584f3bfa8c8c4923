/// Number of CPUs the descriptor tables are sized for. Only the BSP is
/// brought up, but the GDT carries one TSS slot pair per potential core.
pub const MAX_CPUS: usize = 64;

pub mod idt;
pub mod lapic;
pub mod memory;
pub mod ports;
