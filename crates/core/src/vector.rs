use num_derive::FromPrimitive;
use strum::{Display, EnumIter};

/// Interrupt vectors the processor raises on its own.
#[derive(Debug, Display, PartialEq, Copy, Clone, Hash, Eq, FromPrimitive, EnumIter)]
#[repr(u8)]
pub enum Exception {
    DivideError = 0,
    SingleStep = 1,
    Nmi = 2,
    Breakpoint = 3,
    Overflow = 4,
    BoundRange = 5,
    InvalidOpcode = 6,
    CoprocessorUnavailable = 7,
}

impl Exception {
    pub fn vector(self) -> u8 {
        self as u8
    }

    /// Physical address of the vector table slot.
    pub fn table_address(vector: u8) -> u32 {
        vector as u32 * 4
    }
}
