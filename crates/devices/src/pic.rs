use emu86_core::PendingIrq;
use num_derive::FromPrimitive;
use strum::{Display, EnumIter};
use tracing::{debug, trace};

use crate::PortDevice;

pub const COMMAND_PORT: u16 = 0x20;
pub const DATA_PORT: u16 = 0x21;

/// Request lines of the primary controller on a PC.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, FromPrimitive, EnumIter)]
#[repr(u8)]
pub enum IrqLine {
    Timer = 0,
    Keyboard,
    Cascade,
    Com2,
    Com1,
    Lpt2,
    Floppy,
    Lpt1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum InitStage {
    #[default]
    Ready,
    Icw2,
    Icw3,
    Icw4,
}

/// 8259 programmable interrupt controller, single chip, fully nested mode.
/// Line 0 has the highest priority.
#[derive(Debug, Clone)]
pub struct Pic8259 {
    request: u8,
    in_service: u8,
    mask: u8,
    vector_offset: u8,
    stage: InitStage,
    icw4_needed: bool,
    single: bool,
    read_in_service: bool,
}

impl Default for Pic8259 {
    fn default() -> Self {
        Self {
            request: 0,
            in_service: 0,
            mask: 0,
            vector_offset: 8,
            stage: InitStage::Ready,
            icw4_needed: false,
            single: true,
            read_in_service: false,
        }
    }
}

impl Pic8259 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latches a request. Masked lines stay latched until unmasked.
    pub fn raise(&mut self, line: IrqLine) {
        trace!(%line, "irq raised");
        self.request |= 1 << line as u8;
    }

    pub fn vector_offset(&self) -> u8 {
        self.vector_offset
    }

    pub fn request_register(&self) -> u8 {
        self.request
    }

    pub fn in_service_register(&self) -> u8 {
        self.in_service
    }

    /// Delivers the highest priority unmasked request unless a line of equal
    /// or higher priority is still in service.
    pub fn acknowledge(&mut self) -> Option<PendingIrq> {
        for line in 0..8u8 {
            let bit = 1 << line;
            if self.in_service & bit != 0 {
                return None;
            }
            if self.request & bit != 0 && self.mask & bit == 0 {
                self.request &= !bit;
                self.in_service |= bit;
                return Some(PendingIrq {
                    vector: self.vector_offset.wrapping_add(line),
                    line,
                });
            }
        }
        None
    }

    pub fn end_of_interrupt(&mut self, line: u8) {
        self.in_service &= !(1 << (line & 0x7));
    }

    fn non_specific_eoi(&mut self) {
        // clears the highest priority line in service
        self.in_service &= self.in_service.wrapping_sub(1);
    }

    fn write_command(&mut self, value: u8) {
        if value & 0x10 != 0 {
            self.icw4_needed = value & 0x01 != 0;
            self.single = value & 0x02 != 0;
            self.stage = InitStage::Icw2;
            self.mask = 0;
            self.in_service = 0;
            self.read_in_service = false;
            debug!(icw1 = value, "pic initialisation started");
        } else if value & 0x18 == 0 {
            match value >> 5 {
                0b001 => self.non_specific_eoi(),
                0b011 => self.end_of_interrupt(value & 0x7),
                command => trace!(command, "unsupported OCW2 command ignored"),
            }
        } else if value & 0x98 == 0x08 && value & 0x02 != 0 {
            self.read_in_service = value & 0x01 != 0;
        }
    }

    fn write_data(&mut self, value: u8) {
        self.stage = match self.stage {
            InitStage::Icw2 => {
                self.vector_offset = value & 0xF8;
                debug!(offset = self.vector_offset, "pic vector offset set");
                if !self.single {
                    InitStage::Icw3
                } else if self.icw4_needed {
                    InitStage::Icw4
                } else {
                    InitStage::Ready
                }
            }
            InitStage::Icw3 if self.icw4_needed => InitStage::Icw4,
            InitStage::Icw3 | InitStage::Icw4 => InitStage::Ready,
            InitStage::Ready => {
                self.mask = value;
                InitStage::Ready
            }
        };
    }
}

impl PortDevice for Pic8259 {
    fn name(&self) -> &'static str {
        "8259 PIC"
    }

    fn port_numbers(&self) -> Vec<u16> {
        vec![COMMAND_PORT, DATA_PORT]
    }

    fn get_byte(&mut self, port: u16) -> u8 {
        match port {
            COMMAND_PORT if self.read_in_service => self.in_service,
            COMMAND_PORT => self.request,
            _ => self.mask,
        }
    }

    fn set_byte(&mut self, port: u16, value: u8) {
        match port {
            COMMAND_PORT => self.write_command(value),
            _ => self.write_data(value),
        }
    }
}
