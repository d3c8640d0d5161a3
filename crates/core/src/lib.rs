pub mod bus;
pub mod cpu;
pub mod state;
pub mod vector;

pub use bus::{
    Bus, FlatBus, InterruptController, Memory, MemoryController, PendingIrq, PortIo, Timer,
};
pub use cpu::{Cpu, CpuConfig, CpuVariant, FlagMutation};
pub use state::{CpuState, Flags, Reg16, Reg8, SegmentRegister};
pub use vector::Exception;

use thiserror::Error;

/// Errors that reach the host. CPU faults are never reported here: they are
/// delivered to the guest as interrupts.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Segment {0:#x} is outside of the 16-bit segment range")]
    SegmentOutOfRange(u32),
    #[error("Program image is empty")]
    EmptyProgram,
    #[error("Program of {len} bytes at @{start:#07x} does not fit into the address space")]
    ProgramTooLarge { start: u32, len: usize },
    #[error("Interrupt vector {0:#04x} points to 0000:0000 (no handler installed)")]
    MissingInterruptHandler(u8),
    #[error("Failed to (de)serialize cpu state: {0}")]
    Snapshot(#[from] bincode::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuStats {
    pub cycles: u64,
    pub instructions: u64,
    pub timer_ticks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Run,           // Run until the cpu halts with interrupts disabled
    RunFor(usize), // Run for a specific number of instructions
    Step,          // Execute exactly one instruction
}
