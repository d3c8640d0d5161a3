/// Bytes snapshotted per fetch. Covers opcode, ModRM, a 16-bit displacement
/// and a 16-bit immediate.
pub const FETCH_WINDOW: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Word,
}

impl Width {
    /// Operand width selected by bit 0 of most ALU and move opcodes.
    #[inline]
    pub fn of(opcode: u8) -> Self {
        if opcode & 1 == 0 {
            Width::Byte
        } else {
            Width::Word
        }
    }

    #[inline]
    pub fn mask(self) -> u32 {
        match self {
            Width::Byte => 0xFF,
            Width::Word => 0xFFFF,
        }
    }

    #[inline]
    pub fn msb(self) -> u32 {
        match self {
            Width::Byte => 0x80,
            Width::Word => 0x8000,
        }
    }

    #[inline]
    pub fn bytes(self) -> u16 {
        match self {
            Width::Byte => 1,
            Width::Word => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModRm {
    pub mode: u8,
    pub reg: u8,
    pub rm: u8,
}

impl ModRm {
    #[inline]
    pub fn from_byte(byte: u8) -> Self {
        Self {
            mode: byte >> 6,
            reg: (byte >> 3) & 0x7,
            rm: byte & 0x7,
        }
    }

    #[inline]
    pub fn is_register(&self) -> bool {
        self.mode == 0b11
    }

    pub fn to_byte(self) -> u8 {
        self.mode << 6 | self.reg << 3 | self.rm
    }
}

/// Scratch state of the instruction currently being executed. Rebuilt on
/// every fetch.
#[derive(Debug, Clone, Default)]
pub struct Decode {
    pub window: [u8; FETCH_WINDOW],
    pub cursor: usize,
    pub opcode: u8,
    pub start_ip: u16,
    pub effective_address: Option<u32>,
}

impl Decode {
    pub fn begin(&mut self, window: [u8; FETCH_WINDOW], ip: u16) {
        self.window = window;
        self.cursor = 0;
        self.opcode = 0;
        self.start_ip = ip;
        self.effective_address = None;
    }

    /// Next byte of the snapshot, if the instruction has not outrun it.
    #[inline]
    pub fn next(&mut self) -> Option<u8> {
        let byte = self.window.get(self.cursor).copied();
        self.cursor += 1;
        byte
    }

    /// Raw bytes consumed so far, for trace output.
    pub fn consumed(&self) -> &[u8] {
        &self.window[..self.cursor.min(FETCH_WINDOW)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_width_from_opcode() {
        assert_eq!(Width::of(0x00), Width::Byte);
        assert_eq!(Width::of(0x01), Width::Word);
        assert_eq!(Width::of(0xA5), Width::Word);
        assert_eq!(Width::Word.msb(), 0x8000);
        assert_eq!(Width::Byte.mask(), 0xFF);
    }

    #[test]
    fn test_modrm_fields() {
        let modrm = ModRm::from_byte(0b10_011_110);
        assert_eq!(modrm.mode, 0b10);
        assert_eq!(modrm.reg, 0b011);
        assert_eq!(modrm.rm, 0b110);
        assert!(!modrm.is_register());
        assert_eq!(modrm.to_byte(), 0b10_011_110);
    }

    #[test]
    fn test_cursor_past_window() {
        let mut decode = Decode::default();
        decode.begin([1, 2, 3, 4, 5, 6], 0x100);
        for expected in 1..=6 {
            assert_eq!(decode.next(), Some(expected));
        }
        assert_eq!(decode.next(), None);
        assert_eq!(decode.consumed(), &[1, 2, 3, 4, 5, 6]);
    }
}
