use super::{
    decode::{ModRm, Width},
    Cpu,
};
use crate::{bus::ADDRESS_MASK, state::SegmentRegister, Bus};

#[inline]
pub(crate) fn physical(segment: u16, offset: u16) -> u32 {
    (((segment as u32) << 4) + offset as u32) & ADDRESS_MASK
}

impl<B: Bus> Cpu<B> {
    /// Decodes the memory operand of `modrm`, consuming any displacement.
    ///
    /// With `with_segment` the result is a physical address and is cached for
    /// the rest of the instruction; without it the bare 16-bit offset is
    /// returned (LEA).
    pub(crate) fn effective_address(&mut self, modrm: ModRm, with_segment: bool) -> u32 {
        let displacement = match modrm.mode {
            0b01 => {
                self.clock += 4;
                self.fetch_byte() as i8 as u16
            }
            0b10 => {
                self.clock += 4;
                self.fetch_word()
            }
            _ => 0,
        };

        let s = &self.state;
        let (base, stack, cost) = match modrm.rm {
            0b000 => (s.bx().wrapping_add(s.si()), false, 7),
            0b001 => (s.bx().wrapping_add(s.di()), false, 8),
            0b010 => (s.bp().wrapping_add(s.si()), true, 8),
            0b011 => (s.bp().wrapping_add(s.di()), true, 7),
            0b100 => (s.si(), false, 5),
            0b101 => (s.di(), false, 5),
            0b110 if modrm.mode == 0b00 => (0, false, 6),
            0b110 => (s.bp(), true, 5),
            _ => (s.bx(), false, 5),
        };
        self.clock += cost;

        let offset = if modrm.mode == 0b00 && modrm.rm == 0b110 {
            self.fetch_word()
        } else {
            base.wrapping_add(displacement)
        };

        if !with_segment {
            return offset as u32;
        }

        let segment = match self.prefix.segment {
            Some(segment) => self.state.seg(segment),
            None if stack => self.state.ss(),
            None => self.state.ds(),
        };
        let address = physical(segment, offset);
        self.decode.effective_address = Some(address);
        address
    }

    /// Physical address of the current memory operand, decoding it once.
    #[inline]
    pub(crate) fn operand_address(&mut self, modrm: ModRm) -> u32 {
        match self.decode.effective_address {
            Some(address) => address,
            None => self.effective_address(modrm, true),
        }
    }

    #[inline]
    pub(crate) fn reg_value(&self, width: Width, index: u8) -> u16 {
        match width {
            Width::Byte => self.state.reg8(index) as u16,
            Width::Word => self.state.reg(index),
        }
    }

    #[inline]
    pub(crate) fn set_reg_value(&mut self, width: Width, index: u8, value: u16) {
        match width {
            Width::Byte => self.state.set_reg8(index, value as u8),
            Width::Word => self.state.set_reg(index, value),
        }
    }

    #[inline]
    pub(crate) fn read_mem(&self, width: Width, address: u32) -> u16 {
        match width {
            Width::Byte => self.bus.read_byte(address) as u16,
            Width::Word => self.bus.read_word(address),
        }
    }

    #[inline]
    pub(crate) fn write_mem(&mut self, width: Width, address: u32, value: u16) {
        match width {
            Width::Byte => self.bus.write_byte(address, value as u8),
            Width::Word => self.bus.write_word(address, value),
        }
    }

    pub(crate) fn read_rm(&mut self, width: Width, modrm: ModRm) -> u16 {
        if modrm.is_register() {
            return self.reg_value(width, modrm.rm);
        }
        let address = self.operand_address(modrm);
        self.read_mem(width, address)
    }

    pub(crate) fn write_rm(&mut self, width: Width, modrm: ModRm, value: u16) {
        if modrm.is_register() {
            self.set_reg_value(width, modrm.rm, value);
            return;
        }
        let address = self.operand_address(modrm);
        self.write_mem(width, address, value);
    }

    /// DS, or the segment named by an override prefix.
    #[inline]
    pub(crate) fn data_segment(&self) -> u16 {
        self.state.seg(self.prefix.segment.unwrap_or(SegmentRegister::DS))
    }

    #[inline]
    pub(crate) fn data_address(&self, offset: u16) -> u32 {
        physical(self.data_segment(), offset)
    }

    /// String destinations always live in ES.
    #[inline]
    pub(crate) fn extra_address(&self, offset: u16) -> u32 {
        physical(self.state.es(), offset)
    }

    pub(crate) fn push(&mut self, value: u16) {
        let sp = self.state.sp().wrapping_sub(2);
        self.state.set_sp(sp);
        self.bus.write_word(physical(self.state.ss(), sp), value);
    }

    pub(crate) fn pop(&mut self) -> u16 {
        let sp = self.state.sp();
        let value = self.bus.read_word(physical(self.state.ss(), sp));
        self.state.set_sp(sp.wrapping_add(2));
        value
    }

    /// Signed step applied to SI/DI by string instructions.
    #[inline]
    pub(crate) fn string_delta(&self, width: Width) -> u16 {
        if self.state.flags.direction {
            width.bytes().wrapping_neg()
        } else {
            width.bytes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bus::FlatBus,
        cpu::{tests::cpu_with, CpuVariant, FETCH_WINDOW},
        Memory,
    };
    use proptest::prelude::*;

    fn begin_fetch(cpu: &mut Cpu<FlatBus>) {
        let mut window = [0; FETCH_WINDOW];
        cpu.bus.read_block(cpu.state.code_address(), &mut window);
        cpu.decode.begin(window, cpu.state.ip);
    }

    fn prepared(modrm: u8, displacement: &[u8]) -> Cpu<FlatBus> {
        let mut program = vec![modrm];
        program.extend_from_slice(displacement);
        let mut cpu = cpu_with(CpuVariant::I8086, &program);
        cpu.state.set_bx(0x1000);
        cpu.state.set_bp(0x2000);
        cpu.state.set_si(0x0030);
        cpu.state.set_di(0x0004);
        cpu.state.set_ds(0x3000);
        cpu.state.set_ss(0x4000);
        cpu.state.set_es(0x5000);
        begin_fetch(&mut cpu);
        cpu
    }

    fn address_of(modrm: u8, displacement: &[u8]) -> (u32, u64) {
        let mut cpu = prepared(modrm, displacement);
        let modrm = cpu.fetch_modrm();
        let address = cpu.effective_address(modrm, true);
        (address, cpu.clock)
    }

    #[test]
    fn test_rm_table() {
        assert_eq!(address_of(0b00_000_000, &[]), (0x31030, 7));
        assert_eq!(address_of(0b00_000_001, &[]), (0x31004, 8));
        assert_eq!(address_of(0b00_000_010, &[]), (0x42030, 8));
        assert_eq!(address_of(0b00_000_011, &[]), (0x42004, 7));
        assert_eq!(address_of(0b00_000_100, &[]), (0x30030, 5));
        assert_eq!(address_of(0b00_000_101, &[]), (0x30004, 5));
        assert_eq!(address_of(0b00_000_110, &[0x34, 0x12]), (0x31234, 6));
        assert_eq!(address_of(0b00_000_111, &[]), (0x31000, 5));
    }

    #[test]
    fn test_displacements() {
        // disp8 is sign extended
        assert_eq!(address_of(0b01_000_111, &[0xFF]), (0x30FFF, 9));
        assert_eq!(address_of(0b01_000_110, &[0x10]), (0x42010, 9));
        assert_eq!(address_of(0b10_000_111, &[0x00, 0x80]), (0x39000, 9));
    }

    #[test]
    fn test_override_beats_stack_default() {
        let mut cpu = prepared(0b01_000_110, &[0x00]);
        cpu.prefix.segment = Some(SegmentRegister::ES);
        let modrm = cpu.fetch_modrm();
        assert_eq!(cpu.effective_address(modrm, true), 0x52000);

        let mut cpu = prepared(0b00_000_111, &[]);
        cpu.prefix.segment = Some(SegmentRegister::SS);
        let modrm = cpu.fetch_modrm();
        assert_eq!(cpu.effective_address(modrm, true), 0x41000);
    }

    #[test]
    fn test_lea_offset_and_wrap() {
        let mut cpu = prepared(0b10_000_000, &[0xFF, 0xFF]);
        cpu.state.set_bx(0xFFFF);
        let modrm = cpu.fetch_modrm();
        // BX + SI + 0xFFFF wraps within 16 bits
        assert_eq!(cpu.effective_address(modrm, false), 0x002E);
        assert_eq!(cpu.decode.effective_address, None);
    }

    #[test]
    fn test_stack_push_pop() {
        let mut cpu = cpu_with(CpuVariant::I8086, &[0x90]);
        cpu.push(0x1234);
        cpu.push(0x5678);
        assert_eq!(cpu.state.sp(), 0x0FFC);
        assert_eq!(cpu.bus.read_word(physical(0x0800, 0x0FFC)), 0x5678);
        assert_eq!(cpu.pop(), 0x5678);
        assert_eq!(cpu.pop(), 0x1234);
        assert_eq!(cpu.state.sp(), 0x1000);
    }

    proptest! {
        #[test]
        fn prop_operand_round_trip(
            mode in 0u8..4,
            rm in 0u8..8,
            word in any::<bool>(),
            displacement in any::<u16>(),
            value in any::<u16>(),
        ) {
            let width = if word { Width::Word } else { Width::Byte };
            let [lo, hi] = displacement.to_le_bytes();
            let disp: Vec<u8> = match (mode, rm) {
                (0b00, 0b110) | (0b10, _) => vec![lo, hi],
                (0b01, _) => vec![lo],
                _ => vec![],
            };

            let mut cpu = prepared(mode << 6 | rm, &disp);
            let modrm = cpu.fetch_modrm();
            cpu.write_rm(width, modrm, value);

            // Decode the same operand again from scratch.
            cpu.state.ip = 0;
            begin_fetch(&mut cpu);
            let modrm = cpu.fetch_modrm();
            prop_assert_eq!(cpu.read_rm(width, modrm), value & width.mask() as u16);
        }
    }
}
