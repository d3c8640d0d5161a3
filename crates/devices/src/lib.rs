pub mod machine;
pub mod pic;
pub mod pit;

pub use machine::{Machine, PcBus};
pub use pic::{IrqLine, Pic8259};
pub use pit::Pit8253;

use emu86_core::ExecutionError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Port {port:#06x} is already claimed by {owner}")]
    PortConflict { port: u16, owner: &'static str },
    #[error("BIOS image of {0} bytes does not fit into the address space")]
    BiosTooLarge(usize),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

/// A peripheral reachable through IN/OUT.
pub trait PortDevice {
    fn name(&self) -> &'static str;
    fn port_numbers(&self) -> Vec<u16>;

    fn get_byte(&mut self, port: u16) -> u8;
    fn set_byte(&mut self, port: u16, value: u8);

    /// Devices with native 16-bit ports override this together with
    /// `get_word`/`set_word`.
    fn supports_word(&self) -> bool {
        false
    }

    fn get_word(&mut self, port: u16) -> u16 {
        let lo = self.get_byte(port) as u16;
        let hi = self.get_byte(port.wrapping_add(1)) as u16;
        lo | hi << 8
    }

    fn set_word(&mut self, port: u16, value: u16) {
        self.set_byte(port, value as u8);
        self.set_byte(port.wrapping_add(1), (value >> 8) as u8);
    }
}
