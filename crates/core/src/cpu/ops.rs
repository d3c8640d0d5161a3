use tracing::warn;

use super::{
    alu::{self, AluOp, ShiftOp},
    decode::{ModRm, Width},
    prefix::StringKind,
    Cpu, CpuVariant,
};
use crate::{
    state::{Reg16, Reg8, SegmentRegister},
    vector::Exception,
    Bus, ExecutionError,
};

type OpResult = Result<(), ExecutionError>;

#[inline]
pub(crate) fn segment_from_index(index: u8) -> SegmentRegister {
    match index & 0x3 {
        0 => SegmentRegister::ES,
        1 => SegmentRegister::CS,
        2 => SegmentRegister::SS,
        _ => SegmentRegister::DS,
    }
}

impl<B: Bus> Cpu<B> {
    /// Logs an opcode this processor has no meaning for. The 80186 also
    /// raises the invalid opcode exception.
    pub(crate) fn unknown_opcode(&mut self, modrm: Option<ModRm>) -> OpResult {
        match modrm {
            Some(modrm) => warn!(
                "opcode {:02X} {:02X} not supported at {:04X}:{:04X}",
                self.decode.opcode,
                modrm.to_byte(),
                self.state.cs(),
                self.decode.start_ip
            ),
            None => warn!(
                "opcode {:02X} not supported at {:04X}:{:04X}",
                self.decode.opcode,
                self.state.cs(),
                self.decode.start_ip
            ),
        }
        if self.config.variant == CpuVariant::I80186 {
            self.raise_exception(Exception::InvalidOpcode, None)?;
        }
        Ok(())
    }

    pub(crate) fn op_invalid(&mut self) -> OpResult {
        self.unknown_opcode(None)
    }

    // ---- arithmetic and logic ----

    /// 00..=3D: the eight ALU operations in their r/m and accumulator forms.
    pub(crate) fn op_alu(&mut self) -> OpResult {
        let opcode = self.decode.opcode;
        let op = AluOp::from_index(opcode >> 3);
        let width = Width::of(opcode);

        if opcode & 0x4 != 0 {
            let imm = self.fetch_imm(width);
            let acc = self.reg_value(width, 0);
            if let Some(result) = self.state.flags.alu(op, width, acc, imm) {
                self.set_reg_value(width, 0, result);
            }
            self.clock += 4;
            return Ok(());
        }

        let modrm = self.fetch_modrm();
        let to_register = opcode & 0x2 != 0;
        let rm = self.read_rm(width, modrm);
        let reg = self.reg_value(width, modrm.reg);
        let (dst, src) = if to_register { (reg, rm) } else { (rm, reg) };

        let result = self.state.flags.alu(op, width, dst, src);
        match result {
            Some(value) if to_register => self.set_reg_value(width, modrm.reg, value),
            Some(value) => self.write_rm(width, modrm, value),
            None => {}
        }

        self.clock += match (modrm.is_register(), result.is_some() && !to_register) {
            (true, _) => 3,
            (false, true) => 16,
            (false, false) => 9,
        };
        Ok(())
    }

    /// 80..=83: ALU operation with an immediate operand.
    pub(crate) fn op_group1(&mut self) -> OpResult {
        let opcode = self.decode.opcode;
        let width = Width::of(opcode);
        let modrm = self.fetch_modrm();
        let dst = self.read_rm(width, modrm);
        let src = if opcode == 0x81 {
            self.fetch_word()
        } else if opcode == 0x83 {
            self.fetch_byte() as i8 as u16
        } else {
            self.fetch_byte() as u16
        };

        let op = AluOp::from_index(modrm.reg);
        if let Some(result) = self.state.flags.alu(op, width, dst, src) {
            self.write_rm(width, modrm, result);
        }
        self.clock += if modrm.is_register() { 4 } else { 17 };
        Ok(())
    }

    /// 84, 85
    pub(crate) fn op_test_rm(&mut self) -> OpResult {
        let width = Width::of(self.decode.opcode);
        let modrm = self.fetch_modrm();
        let a = self.read_rm(width, modrm);
        let b = self.reg_value(width, modrm.reg);
        self.state.flags.logical(width, (a & b) as u32);
        self.clock += if modrm.is_register() { 3 } else { 9 };
        Ok(())
    }

    /// A8, A9
    pub(crate) fn op_test_acc(&mut self) -> OpResult {
        let width = Width::of(self.decode.opcode);
        let imm = self.fetch_imm(width);
        let acc = self.reg_value(width, 0);
        self.state.flags.logical(width, (acc & imm) as u32);
        self.clock += 4;
        Ok(())
    }

    /// 40..=4F: INC/DEC of a word register. Carry is untouched.
    pub(crate) fn op_inc_dec_reg(&mut self) -> OpResult {
        let index = self.decode.opcode & 0x7;
        let value = self.state.reg(index);
        let carry = self.state.flags.carry;
        let result = if self.decode.opcode & 0x8 == 0 {
            self.state.flags.add(Width::Word, value, 1, false)
        } else {
            self.state.flags.sub(Width::Word, value, 1, false)
        };
        self.state.flags.carry = carry;
        self.state.set_reg(index, result);
        self.clock += 2;
        Ok(())
    }

    pub(crate) fn op_daa(&mut self) -> OpResult {
        let al = self.state.flags.daa(self.state.al());
        self.state.set_al(al);
        self.clock += 4;
        Ok(())
    }

    pub(crate) fn op_das(&mut self) -> OpResult {
        let al = self.state.flags.das(self.state.al());
        self.state.set_al(al);
        self.clock += 4;
        Ok(())
    }

    pub(crate) fn op_aaa(&mut self) -> OpResult {
        let ax = self.state.flags.aaa(self.state.ax());
        self.state.set_ax(ax);
        self.clock += 4;
        Ok(())
    }

    pub(crate) fn op_aas(&mut self) -> OpResult {
        let ax = self.state.flags.aas(self.state.ax());
        self.state.set_ax(ax);
        self.clock += 4;
        Ok(())
    }

    pub(crate) fn op_aam(&mut self) -> OpResult {
        let base = self.fetch_byte();
        self.clock += 83;
        match self.state.flags.aam(self.state.al(), base) {
            Some(ax) => self.state.set_ax(ax),
            None => self.raise_exception(Exception::DivideError, None)?,
        }
        Ok(())
    }

    pub(crate) fn op_aad(&mut self) -> OpResult {
        let base = self.fetch_byte();
        let ax = self.state.flags.aad(self.state.ax(), base);
        self.state.set_ax(ax);
        self.clock += 60;
        Ok(())
    }

    pub(crate) fn op_cbw(&mut self) -> OpResult {
        self.state.set_ax(self.state.al() as i8 as u16);
        self.clock += 2;
        Ok(())
    }

    pub(crate) fn op_cwd(&mut self) -> OpResult {
        let dx = if self.state.ax() & 0x8000 != 0 { 0xFFFF } else { 0 };
        self.state.set_dx(dx);
        self.clock += 5;
        Ok(())
    }

    /// D6, undocumented: AL = CF ? FF : 00
    pub(crate) fn op_salc(&mut self) -> OpResult {
        self.state
            .set_al(if self.state.flags.carry { 0xFF } else { 0x00 });
        self.clock += 4;
        Ok(())
    }

    /// D0..=D3: rotate/shift by one or by CL.
    pub(crate) fn op_group2(&mut self) -> OpResult {
        let opcode = self.decode.opcode;
        let width = Width::of(opcode);
        let modrm = self.fetch_modrm();
        let by_cl = opcode & 0x2 != 0;
        let count = if by_cl { self.state.get8(Reg8::CL) } else { 1 };

        let value = self.read_rm(width, modrm);
        // only the shift sees the masked count, the clocks use the raw one
        let result = self.state.flags.shift(
            ShiftOp::from_index(modrm.reg),
            width,
            value,
            count & 0x1F,
        );
        self.write_rm(width, modrm, result);

        self.clock += match (by_cl, modrm.is_register()) {
            (false, true) => 2,
            (false, false) => 15,
            (true, true) => 8 + 4 * count as u64,
            (true, false) => 20 + 4 * count as u64,
        };
        Ok(())
    }

    /// F6, F7
    pub(crate) fn op_group3(&mut self) -> OpResult {
        let width = Width::of(self.decode.opcode);
        let modrm = self.fetch_modrm();
        let src = self.read_rm(width, modrm);
        let register = modrm.is_register();

        match modrm.reg {
            // 1 is an undocumented alias of TEST
            0 | 1 => {
                let imm = self.fetch_imm(width);
                self.state.flags.logical(width, (src & imm) as u32);
                self.clock += if register { 5 } else { 11 };
            }
            2 => {
                self.write_rm(width, modrm, !src & width.mask() as u16);
                self.clock += if register { 3 } else { 16 };
            }
            3 => {
                let result = self.state.flags.sub(width, 0, src, false);
                self.write_rm(width, modrm, result);
                self.state.flags.carry = src & width.mask() as u16 != 0;
                self.clock += if register { 3 } else { 16 };
            }
            4 | 5 => {
                let signed = modrm.reg == 5;
                let acc = self.reg_value(width, 0);
                let (lo, hi, wide) = if signed {
                    alu::multiply_signed(width, acc, src)
                } else {
                    alu::multiply(width, acc, src)
                };
                self.state.set_ax(lo);
                if width == Width::Word {
                    self.state.set_dx(hi);
                }
                self.state.flags.carry = wide;
                self.state.flags.overflow = wide;
                self.clock += match (signed, width, register) {
                    (false, Width::Byte, true) => 73,
                    (false, Width::Byte, false) => 79,
                    (false, Width::Word, true) => 125,
                    (false, Width::Word, false) => 131,
                    (true, Width::Byte, true) => 89,
                    (true, Width::Byte, false) => 95,
                    (true, Width::Word, true) => 141,
                    (true, Width::Word, false) => 147,
                };
            }
            _ => {
                let signed = modrm.reg == 7;
                let dividend = match width {
                    Width::Byte => self.state.ax() as u32,
                    Width::Word => (self.state.dx() as u32) << 16 | self.state.ax() as u32,
                };
                let outcome = if signed {
                    alu::divide_signed(width, dividend, src)
                } else {
                    alu::divide(width, dividend, src)
                };
                self.clock += match (signed, width, register) {
                    (false, Width::Byte, true) => 85,
                    (false, Width::Byte, false) => 91,
                    (false, Width::Word, true) => 153,
                    (false, Width::Word, false) => 159,
                    (true, Width::Byte, true) => 106,
                    (true, Width::Byte, false) => 112,
                    (true, Width::Word, true) => 174,
                    (true, Width::Word, false) => 180,
                };
                match (outcome, width) {
                    (None, _) => self.raise_exception(Exception::DivideError, None)?,
                    (Some((quotient, remainder)), Width::Byte) => {
                        self.state.set_al(quotient as u8);
                        self.state.set_ah(remainder as u8);
                    }
                    (Some((quotient, remainder)), Width::Word) => {
                        self.state.set_ax(quotient);
                        self.state.set_dx(remainder);
                    }
                }
            }
        }
        Ok(())
    }

    /// FE: INC/DEC r/m8
    pub(crate) fn op_group4(&mut self) -> OpResult {
        let modrm = self.fetch_modrm();
        if modrm.reg > 1 {
            return self.unknown_opcode(Some(modrm));
        }
        self.inc_dec_rm(Width::Byte, modrm);
        Ok(())
    }

    fn inc_dec_rm(&mut self, width: Width, modrm: ModRm) {
        let value = self.read_rm(width, modrm);
        let carry = self.state.flags.carry;
        let result = if modrm.reg == 0 {
            self.state.flags.add(width, value, 1, false)
        } else {
            self.state.flags.sub(width, value, 1, false)
        };
        self.state.flags.carry = carry;
        self.write_rm(width, modrm, result);
        self.clock += if modrm.is_register() { 3 } else { 15 };
    }

    /// FF: INC/DEC/CALL/JMP/PUSH on a word operand.
    pub(crate) fn op_group5(&mut self) -> OpResult {
        let modrm = self.fetch_modrm();
        let register = modrm.is_register();
        match modrm.reg {
            0 | 1 => self.inc_dec_rm(Width::Word, modrm),
            2 => {
                let target = self.read_rm(Width::Word, modrm);
                self.push(self.state.ip);
                self.state.ip = target;
                self.clock += if register { 16 } else { 21 };
            }
            3 | 5 if register => return self.unknown_opcode(Some(modrm)),
            3 => {
                let address = self.operand_address(modrm);
                let offset = self.bus.read_word(address);
                let segment = self.bus.read_word(address.wrapping_add(2));
                self.far_call(segment, offset);
                self.clock += 37;
            }
            4 => {
                self.state.ip = self.read_rm(Width::Word, modrm);
                self.clock += if register { 11 } else { 18 };
            }
            5 => {
                let address = self.operand_address(modrm);
                self.state.ip = self.bus.read_word(address);
                let segment = self.bus.read_word(address.wrapping_add(2));
                self.state.set_cs(segment);
                self.clock += 24;
            }
            6 => {
                let value = self.read_rm(Width::Word, modrm);
                self.push(value);
                self.clock += if register { 11 } else { 16 };
            }
            _ => return self.unknown_opcode(Some(modrm)),
        }
        Ok(())
    }

    // ---- data movement ----

    /// 88..=8B
    pub(crate) fn op_mov_rm(&mut self) -> OpResult {
        let opcode = self.decode.opcode;
        let width = Width::of(opcode);
        let modrm = self.fetch_modrm();
        if opcode & 0x2 == 0 {
            let value = self.reg_value(width, modrm.reg);
            self.write_rm(width, modrm, value);
            self.clock += if modrm.is_register() { 2 } else { 9 };
        } else {
            let value = self.read_rm(width, modrm);
            self.set_reg_value(width, modrm.reg, value);
            self.clock += if modrm.is_register() { 2 } else { 8 };
        }
        Ok(())
    }

    /// 8C: MOV r/m16, sreg
    pub(crate) fn op_mov_rm_sreg(&mut self) -> OpResult {
        let modrm = self.fetch_modrm();
        let value = self.state.seg(segment_from_index(modrm.reg));
        self.write_rm(Width::Word, modrm, value);
        self.clock += if modrm.is_register() { 2 } else { 9 };
        Ok(())
    }

    /// 8E: MOV sreg, r/m16. Loading CS only works on the 8086.
    pub(crate) fn op_mov_sreg_rm(&mut self) -> OpResult {
        let modrm = self.fetch_modrm();
        let segment = segment_from_index(modrm.reg);
        if segment == SegmentRegister::CS && self.config.variant == CpuVariant::I80186 {
            return self.unknown_opcode(Some(modrm));
        }
        let value = self.read_rm(Width::Word, modrm);
        self.state.set_seg(segment, value);
        self.clock += if modrm.is_register() { 2 } else { 8 };
        Ok(())
    }

    pub(crate) fn op_lea(&mut self) -> OpResult {
        let modrm = self.fetch_modrm();
        if modrm.is_register() {
            return self.unknown_opcode(Some(modrm));
        }
        let offset = self.effective_address(modrm, false);
        self.state.set_reg(modrm.reg, offset as u16);
        self.clock += 2;
        Ok(())
    }

    /// C4 LES, C5 LDS
    pub(crate) fn op_load_far_pointer(&mut self) -> OpResult {
        let modrm = self.fetch_modrm();
        if modrm.is_register() {
            return self.unknown_opcode(Some(modrm));
        }
        let address = self.operand_address(modrm);
        let offset = self.bus.read_word(address);
        let segment = self.bus.read_word(address.wrapping_add(2));
        self.state.set_reg(modrm.reg, offset);
        if self.decode.opcode == 0xC4 {
            self.state.set_es(segment);
        } else {
            self.state.set_ds(segment);
        }
        self.clock += 16;
        Ok(())
    }

    /// C6, C7: MOV r/m, imm
    pub(crate) fn op_mov_rm_imm(&mut self) -> OpResult {
        let width = Width::of(self.decode.opcode);
        let modrm = self.fetch_modrm();
        if modrm.reg != 0 {
            return self.unknown_opcode(Some(modrm));
        }
        if !modrm.is_register() {
            // displacement comes before the immediate
            self.operand_address(modrm);
        }
        let imm = self.fetch_imm(width);
        self.write_rm(width, modrm, imm);
        self.clock += if modrm.is_register() { 4 } else { 10 };
        Ok(())
    }

    /// B0..=BF
    pub(crate) fn op_mov_reg_imm(&mut self) -> OpResult {
        let opcode = self.decode.opcode;
        let width = if opcode & 0x8 == 0 {
            Width::Byte
        } else {
            Width::Word
        };
        let imm = self.fetch_imm(width);
        self.set_reg_value(width, opcode & 0x7, imm);
        self.clock += 4;
        Ok(())
    }

    /// A0..=A3: MOV between the accumulator and a direct address.
    pub(crate) fn op_mov_acc_moffs(&mut self) -> OpResult {
        let opcode = self.decode.opcode;
        let width = Width::of(opcode);
        let offset = self.fetch_word();
        let address = self.data_address(offset);
        if opcode & 0x2 == 0 {
            let value = self.read_mem(width, address);
            self.set_reg_value(width, 0, value);
        } else {
            let value = self.reg_value(width, 0);
            self.write_mem(width, address, value);
        }
        self.clock += 10;
        Ok(())
    }

    /// 86, 87
    pub(crate) fn op_xchg_rm(&mut self) -> OpResult {
        let width = Width::of(self.decode.opcode);
        let modrm = self.fetch_modrm();
        let rm = self.read_rm(width, modrm);
        let reg = self.reg_value(width, modrm.reg);
        self.set_reg_value(width, modrm.reg, rm);
        self.write_rm(width, modrm, reg);
        self.clock += if modrm.is_register() { 4 } else { 17 };
        Ok(())
    }

    /// 91..=97
    pub(crate) fn op_xchg_ax(&mut self) -> OpResult {
        let index = self.decode.opcode & 0x7;
        let ax = self.state.ax();
        self.state.set_ax(self.state.reg(index));
        self.state.set_reg(index, ax);
        self.clock += 3;
        Ok(())
    }

    pub(crate) fn op_nop(&mut self) -> OpResult {
        self.clock += 3;
        Ok(())
    }

    pub(crate) fn op_xlat(&mut self) -> OpResult {
        let offset = self.state.bx().wrapping_add(self.state.al() as u16);
        let address = self.data_address(offset);
        self.state.set_al(self.bus.read_byte(address));
        self.clock += 11;
        Ok(())
    }

    pub(crate) fn op_lahf(&mut self) -> OpResult {
        self.state.set_ah(self.state.flags.to_word() as u8);
        self.clock += 4;
        Ok(())
    }

    pub(crate) fn op_sahf(&mut self) -> OpResult {
        self.state.flags.load_low_byte(self.state.ah());
        self.clock += 4;
        Ok(())
    }

    // ---- stack ----

    /// 50..=57. The 8086 pushes the already decremented SP for PUSH SP.
    pub(crate) fn op_push_reg(&mut self) -> OpResult {
        let index = self.decode.opcode & 0x7;
        let value = if index == Reg16::SP as u8 {
            self.state.sp().wrapping_sub(2)
        } else {
            self.state.reg(index)
        };
        self.push(value);
        self.clock += 11;
        Ok(())
    }

    /// 58..=5F
    pub(crate) fn op_pop_reg(&mut self) -> OpResult {
        let value = self.pop();
        self.state.set_reg(self.decode.opcode & 0x7, value);
        self.clock += 8;
        Ok(())
    }

    /// 06, 0E, 16, 1E
    pub(crate) fn op_push_seg(&mut self) -> OpResult {
        let value = self.state.seg(segment_from_index(self.decode.opcode >> 3));
        self.push(value);
        self.clock += 10;
        Ok(())
    }

    /// 07, 0F (8086 only), 17, 1F
    pub(crate) fn op_pop_seg(&mut self) -> OpResult {
        let value = self.pop();
        self.state
            .set_seg(segment_from_index(self.decode.opcode >> 3), value);
        self.clock += 8;
        Ok(())
    }

    /// 8F: POP r/m16
    pub(crate) fn op_pop_rm(&mut self) -> OpResult {
        let modrm = self.fetch_modrm();
        if modrm.reg != 0 {
            return self.unknown_opcode(Some(modrm));
        }
        let value = self.pop();
        self.write_rm(Width::Word, modrm, value);
        self.clock += if modrm.is_register() { 8 } else { 17 };
        Ok(())
    }

    pub(crate) fn op_pushf(&mut self) -> OpResult {
        self.push(self.state.flags.to_word());
        self.clock += 10;
        Ok(())
    }

    pub(crate) fn op_popf(&mut self) -> OpResult {
        let word = self.pop();
        self.state.flags.load_word(word);
        self.clock += 8;
        Ok(())
    }

    // ---- control transfer ----

    /// 60..=6F on the 8086 and 70..=7F: short conditional jumps.
    pub(crate) fn op_jcc(&mut self) -> OpResult {
        let displacement = self.fetch_byte() as i8 as u16;
        if self.state.flags.condition(self.decode.opcode & 0xF) {
            self.state.ip = self.state.ip.wrapping_add(displacement);
            self.clock += 16;
        } else {
            self.clock += 4;
        }
        Ok(())
    }

    pub(crate) fn op_jcxz(&mut self) -> OpResult {
        let displacement = self.fetch_byte() as i8 as u16;
        if self.state.cx() == 0 {
            self.state.ip = self.state.ip.wrapping_add(displacement);
            self.clock += 16;
        } else {
            self.clock += 4;
        }
        self.clock += 2;
        Ok(())
    }

    /// E0 LOOPNE, E1 LOOPE, E2 LOOP
    pub(crate) fn op_loop(&mut self) -> OpResult {
        let displacement = self.fetch_byte() as i8;
        let cx = self.state.cx().wrapping_sub(1);
        self.state.set_cx(cx);

        let zero = self.state.flags.zero;
        let (taken, taken_cost, fallthrough_cost) = match self.decode.opcode {
            0xE0 => (cx != 0 && !zero, 19, 5),
            0xE1 => (cx != 0 && zero, 18, 6),
            _ => (cx != 0, 17, 5),
        };

        if taken {
            let from = self.state.ip;
            let to = from.wrapping_add(displacement as u16);
            self.state.ip = to;
            self.loop_bounds = Some(if displacement > 0 { (from, to) } else { (to, from) });
            self.clock += taken_cost;
        } else {
            self.loop_bounds = None;
            self.clock += fallthrough_cost;
        }
        Ok(())
    }

    pub(crate) fn op_jmp_short(&mut self) -> OpResult {
        let displacement = self.fetch_byte() as i8 as u16;
        self.state.ip = self.state.ip.wrapping_add(displacement);
        self.clock += 15;
        Ok(())
    }

    pub(crate) fn op_jmp_near(&mut self) -> OpResult {
        let displacement = self.fetch_word();
        self.state.ip = self.state.ip.wrapping_add(displacement);
        self.clock += 15;
        Ok(())
    }

    pub(crate) fn op_jmp_far(&mut self) -> OpResult {
        let offset = self.fetch_word();
        let segment = self.fetch_word();
        self.state.set_cs(segment);
        self.state.ip = offset;
        self.clock += 15;
        Ok(())
    }

    pub(crate) fn op_call_near(&mut self) -> OpResult {
        let displacement = self.fetch_word();
        self.push(self.state.ip);
        self.state.ip = self.state.ip.wrapping_add(displacement);
        self.clock += 19;
        Ok(())
    }

    pub(crate) fn op_call_far(&mut self) -> OpResult {
        let offset = self.fetch_word();
        let segment = self.fetch_word();
        self.far_call(segment, offset);
        self.clock += 28;
        Ok(())
    }

    /// C2, C3, and on the 8086 the aliases C0, C1.
    pub(crate) fn op_ret_near(&mut self) -> OpResult {
        let release = if self.decode.opcode & 1 == 0 {
            Some(self.fetch_word())
        } else {
            None
        };
        self.state.ip = self.pop();
        match release {
            Some(bytes) => {
                self.state.set_sp(self.state.sp().wrapping_add(bytes));
                self.clock += 12;
            }
            None => self.clock += 8,
        }
        Ok(())
    }

    /// CA, CB, and on the 8086 the aliases C8, C9.
    pub(crate) fn op_ret_far(&mut self) -> OpResult {
        let release = if self.decode.opcode & 1 == 0 {
            Some(self.fetch_word())
        } else {
            None
        };
        self.state.ip = self.pop();
        let cs = self.pop();
        self.state.set_cs(cs);
        match release {
            Some(bytes) => {
                self.state.set_sp(self.state.sp().wrapping_add(bytes));
                self.clock += 17;
            }
            None => self.clock += 18,
        }
        Ok(())
    }

    // ---- strings ----

    pub(crate) fn op_movs(&mut self) -> OpResult {
        let repeated = self.prefix.repeat.is_some();
        self.repeat_string(StringKind::Transfer, Self::movs_once)?;
        self.clock += if repeated { 17 } else { 18 };
        Ok(())
    }

    fn movs_once(&mut self) -> OpResult {
        let width = Width::of(self.decode.opcode);
        let value = self.read_mem(width, self.data_address(self.state.si()));
        self.write_mem(width, self.extra_address(self.state.di()), value);
        self.advance_si(width);
        self.advance_di(width);
        Ok(())
    }

    pub(crate) fn op_cmps(&mut self) -> OpResult {
        self.repeat_string(StringKind::Compare, Self::cmps_once)?;
        self.clock += 22;
        Ok(())
    }

    fn cmps_once(&mut self) -> OpResult {
        let width = Width::of(self.decode.opcode);
        let src = self.read_mem(width, self.data_address(self.state.si()));
        let dst = self.read_mem(width, self.extra_address(self.state.di()));
        self.state.flags.sub(width, src, dst, false);
        self.advance_si(width);
        self.advance_di(width);
        Ok(())
    }

    pub(crate) fn op_scas(&mut self) -> OpResult {
        self.repeat_string(StringKind::Compare, Self::scas_once)?;
        self.clock += 15;
        Ok(())
    }

    fn scas_once(&mut self) -> OpResult {
        let width = Width::of(self.decode.opcode);
        let acc = self.reg_value(width, 0);
        let dst = self.read_mem(width, self.extra_address(self.state.di()));
        self.state.flags.sub(width, acc, dst, false);
        self.advance_di(width);
        Ok(())
    }

    pub(crate) fn op_lods(&mut self) -> OpResult {
        let repeated = self.prefix.repeat.is_some();
        self.repeat_string(StringKind::Transfer, Self::lods_once)?;
        self.clock += if repeated { 13 } else { 12 };
        Ok(())
    }

    fn lods_once(&mut self) -> OpResult {
        let width = Width::of(self.decode.opcode);
        let value = self.read_mem(width, self.data_address(self.state.si()));
        self.set_reg_value(width, 0, value);
        self.advance_si(width);
        Ok(())
    }

    pub(crate) fn op_stos(&mut self) -> OpResult {
        let repeated = self.prefix.repeat.is_some();
        self.repeat_string(StringKind::Transfer, Self::stos_once)?;
        self.clock += if repeated { 10 } else { 11 };
        Ok(())
    }

    fn stos_once(&mut self) -> OpResult {
        let width = Width::of(self.decode.opcode);
        let value = self.reg_value(width, 0);
        self.write_mem(width, self.extra_address(self.state.di()), value);
        self.advance_di(width);
        Ok(())
    }

    pub(crate) fn advance_si(&mut self, width: Width) {
        let si = self.state.si().wrapping_add(self.string_delta(width));
        self.state.set_si(si);
    }

    pub(crate) fn advance_di(&mut self, width: Width) {
        let di = self.state.di().wrapping_add(self.string_delta(width));
        self.state.set_di(di);
    }

    // ---- ports ----

    pub(crate) fn port_in(&mut self, width: Width, port: u16) -> u16 {
        match width {
            Width::Byte => self.bus.read_port(port) as u16,
            Width::Word => self.bus.read_port_word(port),
        }
    }

    pub(crate) fn port_out(&mut self, width: Width, port: u16, value: u16) {
        match width {
            Width::Byte => self.bus.write_port(port, value as u8),
            Width::Word => self.bus.write_port_word(port, value),
        }
    }

    /// E4..=E7 use an immediate port, EC..=EF use DX.
    pub(crate) fn op_in_out(&mut self) -> OpResult {
        let opcode = self.decode.opcode;
        let width = Width::of(opcode);
        let (port, cost) = if opcode & 0x8 == 0 {
            (self.fetch_byte() as u16, 10)
        } else {
            (self.state.dx(), 8)
        };
        if opcode & 0x2 == 0 {
            let value = self.port_in(width, port);
            self.set_reg_value(width, 0, value);
        } else {
            let value = self.reg_value(width, 0);
            self.port_out(width, port, value);
        }
        self.clock += cost;
        Ok(())
    }

    // ---- processor control ----

    pub(crate) fn op_hlt(&mut self) -> OpResult {
        self.loop_bounds = None;
        self.halted = true;
        self.clock += 2;
        Ok(())
    }

    pub(crate) fn op_wait(&mut self) -> OpResult {
        self.clock += 3;
        Ok(())
    }

    /// D8..=DF: coprocessor escape. The operand is decoded and ignored.
    pub(crate) fn op_esc(&mut self) -> OpResult {
        let modrm = self.fetch_modrm();
        if !modrm.is_register() {
            self.effective_address(modrm, true);
        }
        self.clock += if modrm.is_register() { 2 } else { 8 };
        if self.config.variant == CpuVariant::I80186 {
            self.raise_exception(Exception::CoprocessorUnavailable, None)?;
        }
        Ok(())
    }

    /// F5, F8..=FD
    pub(crate) fn op_flag(&mut self) -> OpResult {
        let flags = &mut self.state.flags;
        match self.decode.opcode {
            0xF5 => flags.carry = !flags.carry,
            0xF8 => flags.carry = false,
            0xF9 => flags.carry = true,
            0xFA => flags.interrupt = false,
            0xFB => flags.interrupt = true,
            0xFC => flags.direction = false,
            _ => flags.direction = true,
        }
        self.clock += 2;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bus::FlatBus,
        cpu::{
            addressing::physical,
            tests::{cpu_with, install_handler, run_program, HANDLER_SEGMENT, STACK_SEGMENT},
        },
        Memory, RunMode,
    };

    fn with_strings(program: &[u8], source: &[u8], destination: &[u8]) -> Cpu<FlatBus> {
        let mut cpu = cpu_with(CpuVariant::I8086, program);
        cpu.bus.load_block(0x200, source);
        cpu.bus.load_block(0x300, destination);
        cpu.state.set_si(0x200);
        cpu.state.set_di(0x300);
        cpu
    }

    #[test]
    fn test_alu_forms() {
        // MOV AL,10 / ADD AL,20 / MOV BL,5 / SUB AL,BL / CMP AL,2B / HLT
        let cpu = run_program(&[
            0xB0, 0x10, 0x04, 0x20, 0xB3, 0x05, 0x28, 0xD8, 0x3C, 0x2B, 0xF4,
        ]);
        assert_eq!(cpu.state.al(), 0x2B);
        assert!(cpu.state.flags.zero);
        assert!(!cpu.state.flags.carry);
    }

    #[test]
    fn test_alu_clock_costs() {
        // ADD AX,BX / ADD [BX],AX / CMP AX,[BX] / HLT
        let mut cpu = cpu_with(CpuVariant::I8086, &[0x01, 0xD8, 0x01, 0x07, 0x3B, 0x07, 0xF4]);
        cpu.execute(RunMode::Step).unwrap();
        assert_eq!(cpu.clock(), 3);
        cpu.execute(RunMode::Step).unwrap();
        assert_eq!(cpu.clock(), 3 + 16 + 5);
        cpu.execute(RunMode::Step).unwrap();
        assert_eq!(cpu.clock(), 3 + 16 + 5 + 9 + 5);
    }

    #[test]
    fn test_inc_preserves_carry() {
        // STC / MOV AX,FFFF / INC AX / HLT
        let cpu = run_program(&[0xF9, 0xB8, 0xFF, 0xFF, 0x40, 0xF4]);
        assert_eq!(cpu.state.ax(), 0);
        assert!(cpu.state.flags.zero);
        assert!(cpu.state.flags.carry);
    }

    #[test]
    fn test_rep_movsb() {
        // MOV CX,3 / CLD / REP MOVSB / HLT
        let mut cpu = with_strings(
            &[0xB9, 0x03, 0x00, 0xFC, 0xF3, 0xA4, 0xF4],
            &[1, 2, 3, 4],
            &[0; 4],
        );
        cpu.execute(RunMode::Run).unwrap();

        let mut copied = [0; 4];
        cpu.bus.read_block(0x300, &mut copied);
        assert_eq!(copied, [1, 2, 3, 0]);
        assert_eq!(cpu.state.cx(), 0);
        assert_eq!(cpu.state.si(), 0x203);
        assert_eq!(cpu.state.di(), 0x303);
        assert!(!cpu.prefix().is_pending());
    }

    #[test]
    fn test_movsw_backwards() {
        // STD / MOVSW / HLT
        let mut cpu = with_strings(&[0xFD, 0xA5, 0xF4], &[0x34, 0x12], &[0, 0]);
        cpu.execute(RunMode::Run).unwrap();
        assert_eq!(cpu.bus.read_word(0x300), 0x1234);
        assert_eq!(cpu.state.si(), 0x1FE);
        assert_eq!(cpu.state.di(), 0x2FE);
    }

    #[test]
    fn test_repe_cmpsb_stops_on_mismatch() {
        // MOV CX,3 / REPE CMPSB / HLT
        let mut cpu = with_strings(
            &[0xB9, 0x03, 0x00, 0xF3, 0xA6, 0xF4],
            &[0x41, 0x42, 0x43],
            &[0x41, 0x58, 0x43],
        );
        cpu.execute(RunMode::Run).unwrap();
        // two compares ran, both counted
        assert_eq!(cpu.state.cx(), 1);
        assert!(!cpu.state.flags.zero);
        assert_eq!(cpu.state.si(), 0x202);
        assert_eq!(cpu.state.di(), 0x302);
    }

    #[test]
    fn test_repne_scasb_finds_terminator() {
        // MOV CX,10 / MOV AL,0 / REPNE SCASB / HLT
        let mut cpu = with_strings(
            &[0xB9, 0x0A, 0x00, 0xB0, 0x00, 0xF2, 0xAE, 0xF4],
            &[],
            &[1, 2, 0, 4],
        );
        cpu.execute(RunMode::Run).unwrap();
        assert!(cpu.state.flags.zero);
        assert_eq!(cpu.state.cx(), 7);
        assert_eq!(cpu.state.di(), 0x303);
    }

    #[test]
    fn test_rep_with_zero_count_does_nothing() {
        // MOV CX,0 / MOV AL,FF / REP STOSB / HLT
        let mut cpu = with_strings(&[0xB9, 0x00, 0x00, 0xB0, 0xFF, 0xF3, 0xAA, 0xF4], &[], &[0]);
        cpu.execute(RunMode::Run).unwrap();
        assert_eq!(cpu.bus.read_byte(0x300), 0);
        assert_eq!(cpu.state.di(), 0x300);
    }

    #[test]
    fn test_lodsb_honours_override() {
        // MOV AX,2000 / MOV ES,AX / ES: LODSB / HLT
        let mut cpu = cpu_with(
            CpuVariant::I8086,
            &[0xB8, 0x00, 0x20, 0x8E, 0xC0, 0x26, 0xAC, 0xF4],
        );
        cpu.bus.write_byte(0x20010, 0x77);
        cpu.state.set_si(0x10);
        cpu.execute(RunMode::Run).unwrap();
        assert_eq!(cpu.state.al(), 0x77);
        assert_eq!(cpu.state.si(), 0x11);
    }

    #[test]
    fn test_segment_override_lasts_one_instruction() {
        // MOV AX,2000 / MOV ES,AX / MOV AL,11 / ES: MOV [10],AL / MOV AL,22 / MOV [10],AL / HLT
        let cpu = run_program(&[
            0xB8, 0x00, 0x20, 0x8E, 0xC0, 0xB0, 0x11, 0x26, 0xA2, 0x10, 0x00, 0xB0, 0x22, 0xA2,
            0x10, 0x00, 0xF4,
        ]);
        assert_eq!(cpu.bus.read_byte(0x20010), 0x11);
        assert_eq!(cpu.bus.read_byte(0x00010), 0x22);
    }

    #[test]
    fn test_divide_by_zero_leaves_registers() {
        // MOV AX,1234 / MOV BL,0 / DIV BL / HLT
        let mut cpu = cpu_with(CpuVariant::I8086, &[0xB8, 0x34, 0x12, 0xB3, 0x00, 0xF6, 0xF3, 0xF4]);
        install_handler(&mut cpu, 0, &[0xF4]);
        cpu.execute(RunMode::Run).unwrap();

        assert_eq!(cpu.state.cs(), HANDLER_SEGMENT);
        assert_eq!(cpu.state.ax(), 0x1234);
        // return address is the instruction after DIV
        assert_eq!(cpu.bus.read_word(physical(STACK_SEGMENT, 0x0FFA)), 7);
    }

    #[test]
    fn test_divide_overflow_raises() {
        // MOV AX,FFFF / MOV BL,1 / DIV BL / HLT
        let mut cpu = cpu_with(CpuVariant::I8086, &[0xB8, 0xFF, 0xFF, 0xB3, 0x01, 0xF6, 0xF3, 0xF4]);
        install_handler(&mut cpu, 0, &[0xF4]);
        cpu.execute(RunMode::Run).unwrap();
        assert_eq!(cpu.state.cs(), HANDLER_SEGMENT);
        assert_eq!(cpu.state.ax(), 0xFFFF);
    }

    #[test]
    fn test_word_divide_faults_leave_dx_ax() {
        // DIV BX, first by zero, then with a quotient above FFFF
        for divisor in [0x0000, 0x0010] {
            let mut cpu = cpu_with(CpuVariant::I8086, &[0xF7, 0xF3]);
            install_handler(&mut cpu, 0, &[0xF4]);
            cpu.state.set_ax(0x5678);
            cpu.state.set_dx(0x1234);
            cpu.state.set_bx(divisor);
            cpu.execute(RunMode::Step).unwrap();

            assert_eq!(cpu.state.cs(), HANDLER_SEGMENT);
            assert_eq!(cpu.state.ax(), 0x5678);
            assert_eq!(cpu.state.dx(), 0x1234);
            assert_eq!(cpu.bus.read_word(physical(STACK_SEGMENT, 0x0FFA)), 2);
        }
    }

    #[test]
    fn test_signed_divide_truncates() {
        // MOV AX,-7 / MOV BL,2 / IDIV BL / HLT
        let cpu = run_program(&[0xB8, 0xF9, 0xFF, 0xB3, 0x02, 0xF6, 0xFB, 0xF4]);
        assert_eq!(cpu.state.al(), 0xFD);
        assert_eq!(cpu.state.ah(), 0xFF);
    }

    #[test]
    fn test_word_multiply() {
        // MOV AX,1234 / MOV CX,100 / MUL CX / HLT
        let cpu = run_program(&[0xB8, 0x34, 0x12, 0xB9, 0x00, 0x01, 0xF7, 0xE1, 0xF4]);
        assert_eq!(cpu.state.ax(), 0x3400);
        assert_eq!(cpu.state.dx(), 0x0012);
        assert!(cpu.state.flags.carry);
        assert!(cpu.state.flags.overflow);
        assert_eq!(cpu.clock(), 4 + 4 + 125 + 2);
    }

    #[test]
    fn test_neg_sets_carry_for_nonzero() {
        // MOV AL,1 / NEG AL / MOV BL,0 / NEG BL / HLT
        let cpu = run_program(&[0xB0, 0x01, 0xF6, 0xD8, 0xB3, 0x00, 0xF6, 0xDB, 0xF4]);
        assert_eq!(cpu.state.al(), 0xFF);
        assert_eq!(cpu.state.reg8(3), 0);
        assert!(!cpu.state.flags.carry);
        assert!(cpu.state.flags.zero);
    }

    #[test]
    fn test_shift_clock_costs() {
        // MOV AL,81 / ROL AL,1 / MOV CL,3 / SHL BX,CL / HLT
        let mut cpu = cpu_with(
            CpuVariant::I8086,
            &[0xB0, 0x81, 0xD0, 0xC0, 0xB1, 0x03, 0xD3, 0xE3, 0xF4],
        );
        cpu.state.set_bx(1);
        cpu.execute(RunMode::RunFor(2)).unwrap();
        assert_eq!(cpu.state.al(), 0x03);
        assert!(cpu.state.flags.carry);
        assert_eq!(cpu.clock(), 4 + 2);

        cpu.execute(RunMode::Run).unwrap();
        assert_eq!(cpu.state.bx(), 8);
        assert_eq!(cpu.clock(), 4 + 2 + 4 + 8 + 12 + 2);
    }

    #[test]
    fn test_shift_by_cl_clocks_use_raw_count() {
        // MOV CL,21 / SHL AX,CL
        let mut cpu = cpu_with(CpuVariant::I8086, &[0xB1, 0x21, 0xD3, 0xE0]);
        cpu.state.set_ax(1);
        cpu.execute(RunMode::RunFor(2)).unwrap();
        assert_eq!(cpu.state.ax(), 2);
        assert_eq!(cpu.clock(), 4 + 8 + 4 * 0x21);
    }

    #[test]
    fn test_loop_tracks_bounds() {
        // MOV CX,3 / INC AX / LOOP -3 / HLT
        let program = [0xB9, 0x03, 0x00, 0x40, 0xE2, 0xFD, 0xF4];
        let mut cpu = cpu_with(CpuVariant::I8086, &program);
        cpu.execute(RunMode::RunFor(3)).unwrap();
        assert_eq!(cpu.loop_bounds(), Some((3, 6)));

        cpu.execute(RunMode::Run).unwrap();
        assert_eq!(cpu.state.ax(), 3);
        assert_eq!(cpu.state.cx(), 0);
        assert_eq!(cpu.loop_bounds(), None);
    }

    #[test]
    fn test_call_and_return() {
        // CALL +4 / MOV BL,1 / HLT / NOP / MOV AL,9 / RET
        let cpu = run_program(&[
            0xE8, 0x04, 0x00, 0xB3, 0x01, 0xF4, 0x90, 0xB0, 0x09, 0xC3,
        ]);
        assert_eq!(cpu.state.al(), 9);
        assert_eq!(cpu.state.reg8(3), 1);
        assert_eq!(cpu.state.sp(), 0x1000);
    }

    #[test]
    fn test_push_sp_pushes_decremented_value() {
        // PUSH SP / POP AX / HLT
        let cpu = run_program(&[0x54, 0x58, 0xF4]);
        assert_eq!(cpu.state.ax(), 0x0FFE);
    }

    #[test]
    fn test_load_far_pointer() {
        // LES DI,[20] / HLT
        let mut cpu = cpu_with(CpuVariant::I8086, &[0xC4, 0x3E, 0x20, 0x00, 0xF4]);
        cpu.bus.write_word(0x20, 0x5678);
        cpu.bus.write_word(0x22, 0x1234);
        cpu.execute(RunMode::Run).unwrap();
        assert_eq!(cpu.state.di(), 0x5678);
        assert_eq!(cpu.state.es(), 0x1234);
    }

    #[test]
    fn test_ports() {
        // MOV AL,5A / OUT 42,AL / MOV DX,60 / IN AL,DX / HLT
        let mut cpu = cpu_with(
            CpuVariant::I8086,
            &[0xB0, 0x5A, 0xE6, 0x42, 0xBA, 0x60, 0x00, 0xEC, 0xF4],
        );
        cpu.bus.ports.insert(0x60, 0x99);
        cpu.execute(RunMode::Run).unwrap();
        assert_eq!(cpu.bus.port_writes, vec![(0x42, 0x5A)]);
        assert_eq!(cpu.state.al(), 0x99);
    }

    #[test]
    fn test_undocumented_aliases() {
        // XOR AX,AX / 64=JZ +2 / MOV AL,1 / 82 ADD AL,5 / STC / SALC / MOV BL,AL / HLT
        let cpu = run_program(&[
            0x31, 0xC0, 0x64, 0x02, 0xB0, 0x01, 0x82, 0xC0, 0x05, 0xF9, 0xD6, 0x88, 0xC3, 0xF4,
        ]);
        assert_eq!(cpu.state.reg8(3), 0xFF);
        assert_eq!(cpu.state.al(), 0xFF);
    }

    #[test]
    fn test_pop_cs_on_8086() {
        // PUSH 0 via AX / POP CS lands at 0000:0003
        let mut cpu = cpu_with(CpuVariant::I8086, &[0xB8, 0x00, 0x00, 0x50, 0x0F]);
        cpu.execute(RunMode::RunFor(3)).unwrap();
        assert_eq!(cpu.state.cs(), 0);
        assert_eq!(cpu.state.ip, 5);
    }

    #[test]
    fn test_esc_consumes_operand() {
        // ESC [1234] / HLT
        let mut cpu = cpu_with(CpuVariant::I8086, &[0xD8, 0x06, 0x34, 0x12, 0xF4]);
        cpu.execute(RunMode::Step).unwrap();
        assert_eq!(cpu.state.ip, 4);
        assert_eq!(cpu.clock(), 8 + 6);
    }

    #[test]
    fn test_unknown_form_is_skipped_on_8086() {
        // FE /7 has no meaning; execution continues
        let cpu = run_program(&[0xFE, 0xF8, 0x40, 0xF4]);
        assert_eq!(cpu.state.ax(), 1);
    }

    #[test]
    fn test_xlat() {
        // MOV BX,100 / MOV AL,2 / XLAT / HLT
        let mut cpu = cpu_with(CpuVariant::I8086, &[0xBB, 0x00, 0x01, 0xB0, 0x02, 0xD7, 0xF4]);
        cpu.bus.load_block(0x100, &[10, 11, 12, 13]);
        cpu.execute(RunMode::Run).unwrap();
        assert_eq!(cpu.state.al(), 12);
    }

    #[test]
    fn test_mov_sreg_and_back() {
        // MOV AX,1234 / MOV DS,AX / MOV BX,DS / HLT
        let cpu = run_program(&[0xB8, 0x34, 0x12, 0x8E, 0xD8, 0x8C, 0xDB, 0xF4]);
        assert_eq!(cpu.state.ds(), 0x1234);
        assert_eq!(cpu.state.bx(), 0x1234);
    }
}
