use std::{
    fmt,
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
};

use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

use crate::ExecutionError;

/// 16-bit general purpose registers in ModRM encoding order.
#[derive(Debug, Display, PartialEq, Copy, Clone, Hash, Eq, FromPrimitive, EnumIter)]
#[repr(u8)]
pub enum Reg16 {
    AX = 0,
    CX = 1,
    DX = 2,
    BX = 3,
    SP = 4,
    BP = 5,
    SI = 6,
    DI = 7,
}

/// 8-bit register views. Indices 0..=3 are the low halves of AX..BX,
/// 4..=7 the high halves.
#[derive(Debug, Display, PartialEq, Copy, Clone, Hash, Eq, FromPrimitive, EnumIter)]
#[repr(u8)]
pub enum Reg8 {
    AL = 0,
    CL = 1,
    DL = 2,
    BL = 3,
    AH = 4,
    CH = 5,
    DH = 6,
    BH = 7,
}

#[derive(Debug, Display, PartialEq, Copy, Clone, Hash, Eq, FromPrimitive, EnumIter)]
#[repr(u8)]
pub enum SegmentRegister {
    ES = 0,
    CS = 1,
    SS = 2,
    DS = 3,
}

pub const FLAG_CARRY: u16 = 0x0001;
pub const FLAG_PARITY: u16 = 0x0004;
pub const FLAG_AUX_CARRY: u16 = 0x0010;
pub const FLAG_ZERO: u16 = 0x0040;
pub const FLAG_SIGN: u16 = 0x0080;
pub const FLAG_TRAP: u16 = 0x0100;
pub const FLAG_INTERRUPT: u16 = 0x0200;
pub const FLAG_DIRECTION: u16 = 0x0400;
pub const FLAG_OVERFLOW: u16 = 0x0800;

/// Bits an 8086 always reports as set in the packed flag word.
pub const FLAG_RESERVED: u16 = 0xF002;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flags {
    pub carry: bool,
    pub parity: bool,
    pub aux_carry: bool,
    pub zero: bool,
    pub sign: bool,
    pub trap: bool,
    pub interrupt: bool,
    pub direction: bool,
    pub overflow: bool,
}

impl Flags {
    pub fn to_word(&self) -> u16 {
        let mut word = FLAG_RESERVED;
        for (set, bit) in [
            (self.carry, FLAG_CARRY),
            (self.parity, FLAG_PARITY),
            (self.aux_carry, FLAG_AUX_CARRY),
            (self.zero, FLAG_ZERO),
            (self.sign, FLAG_SIGN),
            (self.trap, FLAG_TRAP),
            (self.interrupt, FLAG_INTERRUPT),
            (self.direction, FLAG_DIRECTION),
            (self.overflow, FLAG_OVERFLOW),
        ] {
            if set {
                word |= bit;
            }
        }
        word
    }

    /// Restores only the arithmetic flags held in the low byte (SAHF).
    pub fn load_low_byte(&mut self, value: u8) {
        let value = value as u16;
        self.carry = value & FLAG_CARRY != 0;
        self.parity = value & FLAG_PARITY != 0;
        self.aux_carry = value & FLAG_AUX_CARRY != 0;
        self.zero = value & FLAG_ZERO != 0;
        self.sign = value & FLAG_SIGN != 0;
    }

    /// Restores every flag (POPF, IRET).
    pub fn load_word(&mut self, value: u16) {
        self.load_low_byte(value as u8);
        self.trap = value & FLAG_TRAP != 0;
        self.interrupt = value & FLAG_INTERRUPT != 0;
        self.direction = value & FLAG_DIRECTION != 0;
        self.overflow = value & FLAG_OVERFLOW != 0;
    }

    pub fn from_word(value: u16) -> Self {
        let mut flags = Self::default();
        flags.load_word(value);
        flags
    }

    /// Evaluates the condition encoded in the low nibble of a Jcc opcode.
    pub fn condition(&self, code: u8) -> bool {
        let taken = match code >> 1 & 0x7 {
            0 => self.overflow,
            1 => self.carry,
            2 => self.zero,
            3 => self.carry || self.zero,
            4 => self.sign,
            5 => self.parity,
            6 => self.sign != self.overflow,
            _ => self.zero || self.sign != self.overflow,
        };
        // Odd codes are the negated form.
        taken != (code & 1 == 1)
    }

    pub fn mask_interrupts(&mut self) {
        self.interrupt = false;
        self.trap = false;
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letters = [
            (self.overflow, 'O'),
            (self.direction, 'D'),
            (self.interrupt, 'I'),
            (self.trap, 'T'),
            (self.sign, 'S'),
            (self.zero, 'Z'),
            (self.aux_carry, 'A'),
            (self.parity, 'P'),
            (self.carry, 'C'),
        ];
        for (set, letter) in letters {
            write!(f, "{}", if set { letter } else { '-' })?;
        }
        Ok(())
    }
}

/// Architectural register file of the processor.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuState {
    pub regs: [u16; 8],
    pub segs: [u16; 4],
    pub ip: u16,
    pub flags: Flags,
}

macro_rules! reg16_accessors {
    ($($get:ident, $set:ident => $reg:ident;)*) => {
        $(
            #[inline]
            pub fn $get(&self) -> u16 {
                self.regs[Reg16::$reg as usize]
            }

            #[inline]
            pub fn $set(&mut self, value: u16) {
                self.regs[Reg16::$reg as usize] = value;
            }
        )*
    };
}

macro_rules! seg_accessors {
    ($($get:ident, $set:ident => $seg:ident;)*) => {
        $(
            #[inline]
            pub fn $get(&self) -> u16 {
                self.segs[SegmentRegister::$seg as usize]
            }

            #[inline]
            pub fn $set(&mut self, value: u16) {
                self.segs[SegmentRegister::$seg as usize] = value;
            }
        )*
    };
}

impl CpuState {
    /// Power-on state: everything cleared, CS:IP at the boot vector.
    pub fn power_on() -> Self {
        let mut state = Self::default();
        state.set_cs(0xFFFF);
        state
    }

    #[inline]
    pub fn reg(&self, index: u8) -> u16 {
        self.regs[(index & 0x7) as usize]
    }

    #[inline]
    pub fn set_reg(&mut self, index: u8, value: u16) {
        self.regs[(index & 0x7) as usize] = value;
    }

    #[inline]
    pub fn reg8(&self, index: u8) -> u8 {
        let word = self.regs[(index & 0x3) as usize];
        if index & 0x4 == 0 {
            word as u8
        } else {
            (word >> 8) as u8
        }
    }

    #[inline]
    pub fn set_reg8(&mut self, index: u8, value: u8) {
        let word = &mut self.regs[(index & 0x3) as usize];
        if index & 0x4 == 0 {
            *word = (*word & 0xFF00) | value as u16;
        } else {
            *word = (*word & 0x00FF) | ((value as u16) << 8);
        }
    }

    #[inline]
    pub fn get(&self, reg: Reg16) -> u16 {
        self.reg(reg as u8)
    }

    #[inline]
    pub fn set(&mut self, reg: Reg16, value: u16) {
        self.set_reg(reg as u8, value);
    }

    #[inline]
    pub fn get8(&self, reg: Reg8) -> u8 {
        self.reg8(reg as u8)
    }

    #[inline]
    pub fn set8(&mut self, reg: Reg8, value: u8) {
        self.set_reg8(reg as u8, value);
    }

    #[inline]
    pub fn seg(&self, seg: SegmentRegister) -> u16 {
        self.segs[seg as usize]
    }

    #[inline]
    pub fn set_seg(&mut self, seg: SegmentRegister, value: u16) {
        self.segs[seg as usize] = value;
    }

    reg16_accessors! {
        ax, set_ax => AX;
        cx, set_cx => CX;
        dx, set_dx => DX;
        bx, set_bx => BX;
        sp, set_sp => SP;
        bp, set_bp => BP;
        si, set_si => SI;
        di, set_di => DI;
    }

    seg_accessors! {
        es, set_es => ES;
        cs, set_cs => CS;
        ss, set_ss => SS;
        ds, set_ds => DS;
    }

    #[inline]
    pub fn al(&self) -> u8 {
        self.reg8(Reg8::AL as u8)
    }

    #[inline]
    pub fn set_al(&mut self, value: u8) {
        self.set_reg8(Reg8::AL as u8, value);
    }

    #[inline]
    pub fn ah(&self) -> u8 {
        self.reg8(Reg8::AH as u8)
    }

    #[inline]
    pub fn set_ah(&mut self, value: u8) {
        self.set_reg8(Reg8::AH as u8, value);
    }

    /// Physical address of the next instruction byte.
    pub fn code_address(&self) -> u32 {
        ((self.cs() as u32) << 4).wrapping_add(self.ip as u32) & 0xF_FFFF
    }

    pub fn load<P: AsRef<Path>>(p: P) -> Result<Self, ExecutionError> {
        let reader = BufReader::new(File::open(p.as_ref())?);
        Ok(bincode::deserialize_from(reader)?)
    }

    pub fn save<P: AsRef<Path>>(&self, p: P) -> Result<(), ExecutionError> {
        let writer = BufWriter::new(File::create(p.as_ref())?);
        Ok(bincode::serialize_into(writer, self)?)
    }
}

impl fmt::Display for CpuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AX={:04X} BX={:04X} CX={:04X} DX={:04X} SP={:04X} BP={:04X} SI={:04X} DI={:04X} \
             ES={:04X} CS={:04X} SS={:04X} DS={:04X} IP={:04X} {}",
            self.ax(),
            self.bx(),
            self.cx(),
            self.dx(),
            self.sp(),
            self.bp(),
            self.si(),
            self.di(),
            self.es(),
            self.cs(),
            self.ss(),
            self.ds(),
            self.ip,
            self.flags
        )
    }
}
