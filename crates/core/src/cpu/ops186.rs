//! Instructions added by the 80186.

use super::{
    addressing::physical,
    alu::{self, ShiftOp},
    decode::Width,
    prefix::StringKind,
    Cpu,
};
use crate::{state::Reg16, vector::Exception, Bus, ExecutionError};

type OpResult = Result<(), ExecutionError>;

impl<B: Bus> Cpu<B> {
    pub(crate) fn op_pusha(&mut self) -> OpResult {
        let sp = self.state.sp();
        for reg in [Reg16::AX, Reg16::CX, Reg16::DX, Reg16::BX] {
            self.push(self.state.get(reg));
        }
        self.push(sp);
        for reg in [Reg16::BP, Reg16::SI, Reg16::DI] {
            self.push(self.state.get(reg));
        }
        self.clock += 19;
        Ok(())
    }

    /// The saved SP is discarded.
    pub(crate) fn op_popa(&mut self) -> OpResult {
        for reg in [Reg16::DI, Reg16::SI, Reg16::BP] {
            let value = self.pop();
            self.state.set(reg, value);
        }
        self.pop();
        for reg in [Reg16::BX, Reg16::DX, Reg16::CX, Reg16::AX] {
            let value = self.pop();
            self.state.set(reg, value);
        }
        self.clock += 19;
        Ok(())
    }

    /// 62: BOUND r16, m16&16. Both bounds are signed and inclusive.
    pub(crate) fn op_bound(&mut self) -> OpResult {
        let modrm = self.fetch_modrm();
        if modrm.is_register() {
            return self.unknown_opcode(Some(modrm));
        }
        let address = self.operand_address(modrm);
        let lower = self.bus.read_word(address) as i16;
        let upper = self.bus.read_word(address.wrapping_add(2)) as i16;
        let index = self.state.reg(modrm.reg) as i16;

        self.clock += 13;
        if index < lower || index > upper {
            self.raise_exception(Exception::BoundRange, None)?;
        }
        Ok(())
    }

    /// 68 pushes a word, 6A a sign-extended byte.
    pub(crate) fn op_push_imm(&mut self) -> OpResult {
        let value = if self.decode.opcode == 0x68 {
            self.fetch_word()
        } else {
            self.fetch_byte() as i8 as u16
        };
        self.push(value);
        self.clock += 3;
        Ok(())
    }

    /// 69, 6B: IMUL r16, r/m16, imm
    pub(crate) fn op_imul_imm(&mut self) -> OpResult {
        let modrm = self.fetch_modrm();
        let src = self.read_rm(Width::Word, modrm);
        let imm = if self.decode.opcode == 0x69 {
            self.fetch_word()
        } else {
            self.fetch_byte() as i8 as u16
        };
        let (lo, _, wide) = alu::multiply_signed(Width::Word, src, imm);
        self.state.set_reg(modrm.reg, lo);
        self.state.flags.carry = wide;
        self.state.flags.overflow = wide;
        self.clock += 21;
        Ok(())
    }

    pub(crate) fn op_ins(&mut self) -> OpResult {
        self.repeat_string(StringKind::Transfer, Self::ins_once)?;
        self.clock += 14;
        Ok(())
    }

    fn ins_once(&mut self) -> OpResult {
        let width = Width::of(self.decode.opcode);
        let value = self.port_in(width, self.state.dx());
        self.write_mem(width, self.extra_address(self.state.di()), value);
        self.advance_di(width);
        Ok(())
    }

    pub(crate) fn op_outs(&mut self) -> OpResult {
        self.repeat_string(StringKind::Transfer, Self::outs_once)?;
        self.clock += 14;
        Ok(())
    }

    fn outs_once(&mut self) -> OpResult {
        let width = Width::of(self.decode.opcode);
        let value = self.read_mem(width, self.data_address(self.state.si()));
        self.port_out(width, self.state.dx(), value);
        self.advance_si(width);
        Ok(())
    }

    /// C0, C1: rotate/shift by an immediate count.
    pub(crate) fn op_shift_imm(&mut self) -> OpResult {
        let width = Width::of(self.decode.opcode);
        let modrm = self.fetch_modrm();
        let value = self.read_rm(width, modrm);
        let count = self.fetch_byte();
        let result = self.state.flags.shift(
            ShiftOp::from_index(modrm.reg),
            width,
            value,
            count & 0x1F,
        );
        self.write_rm(width, modrm, result);
        self.clock += (if modrm.is_register() { 5 } else { 8 }) + count as u64;
        Ok(())
    }

    /// C8: ENTER alloc, level
    pub(crate) fn op_enter(&mut self) -> OpResult {
        let alloc = self.fetch_word();
        let level = self.fetch_byte() & 0x1F;

        self.push(self.state.bp());
        let frame = self.state.sp();
        if level > 0 {
            for _ in 1..level {
                let bp = self.state.bp().wrapping_sub(2);
                self.state.set_bp(bp);
                let outer = self.bus.read_word(physical(self.state.ss(), bp));
                self.push(outer);
            }
            self.push(frame);
        }
        self.state.set_bp(frame);
        self.state.set_sp(self.state.sp().wrapping_sub(alloc));

        self.clock += match level {
            0 => 11,
            1 => 15,
            _ => 12 + 4 + (level as u64 - 1),
        };
        Ok(())
    }

    pub(crate) fn op_leave(&mut self) -> OpResult {
        self.state.set_sp(self.state.bp());
        let bp = self.pop();
        self.state.set_bp(bp);
        self.clock += 5;
        Ok(())
    }
}
