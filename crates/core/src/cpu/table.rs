use super::{Cpu, CpuVariant, Handler};
use crate::Bus;

impl<B: Bus> Cpu<B> {
    /// Builds the 256-entry dispatch table for `variant`. The 8086 map fills
    /// every slot, including undocumented aliases; the 80186 overlays its own
    /// instructions and turns the aliases into invalid opcodes.
    pub(crate) fn opcode_table(variant: CpuVariant) -> [Handler<B>; 256] {
        let mut table = [Self::op_invalid as Handler<B>; 256];

        for base in (0x00..0x40).step_by(8) {
            for opcode in base..base + 6 {
                table[opcode] = Self::op_alu;
            }
        }
        for opcode in [0x06, 0x0E, 0x16, 0x1E] {
            table[opcode] = Self::op_push_seg;
        }
        for opcode in [0x07, 0x0F, 0x17, 0x1F] {
            table[opcode] = Self::op_pop_seg;
        }
        for opcode in [0x26, 0x2E, 0x36, 0x3E] {
            table[opcode] = Self::op_segment_prefix;
        }
        table[0x27] = Self::op_daa;
        table[0x2F] = Self::op_das;
        table[0x37] = Self::op_aaa;
        table[0x3F] = Self::op_aas;

        for opcode in 0x40..0x50 {
            table[opcode] = Self::op_inc_dec_reg;
        }
        for opcode in 0x50..0x58 {
            table[opcode] = Self::op_push_reg;
        }
        for opcode in 0x58..0x60 {
            table[opcode] = Self::op_pop_reg;
        }
        // 60..=6F mirror the conditional jumps
        for opcode in 0x60..0x80 {
            table[opcode] = Self::op_jcc;
        }

        for opcode in 0x80..0x84 {
            table[opcode] = Self::op_group1;
        }
        table[0x84] = Self::op_test_rm;
        table[0x85] = Self::op_test_rm;
        table[0x86] = Self::op_xchg_rm;
        table[0x87] = Self::op_xchg_rm;
        for opcode in 0x88..0x8C {
            table[opcode] = Self::op_mov_rm;
        }
        table[0x8C] = Self::op_mov_rm_sreg;
        table[0x8D] = Self::op_lea;
        table[0x8E] = Self::op_mov_sreg_rm;
        table[0x8F] = Self::op_pop_rm;

        table[0x90] = Self::op_nop;
        for opcode in 0x91..0x98 {
            table[opcode] = Self::op_xchg_ax;
        }
        table[0x98] = Self::op_cbw;
        table[0x99] = Self::op_cwd;
        table[0x9A] = Self::op_call_far;
        table[0x9B] = Self::op_wait;
        table[0x9C] = Self::op_pushf;
        table[0x9D] = Self::op_popf;
        table[0x9E] = Self::op_sahf;
        table[0x9F] = Self::op_lahf;

        for opcode in 0xA0..0xA4 {
            table[opcode] = Self::op_mov_acc_moffs;
        }
        table[0xA4] = Self::op_movs;
        table[0xA5] = Self::op_movs;
        table[0xA6] = Self::op_cmps;
        table[0xA7] = Self::op_cmps;
        table[0xA8] = Self::op_test_acc;
        table[0xA9] = Self::op_test_acc;
        table[0xAA] = Self::op_stos;
        table[0xAB] = Self::op_stos;
        table[0xAC] = Self::op_lods;
        table[0xAD] = Self::op_lods;
        table[0xAE] = Self::op_scas;
        table[0xAF] = Self::op_scas;

        for opcode in 0xB0..0xC0 {
            table[opcode] = Self::op_mov_reg_imm;
        }

        for opcode in 0xC0..0xC4 {
            table[opcode] = Self::op_ret_near;
        }
        table[0xC4] = Self::op_load_far_pointer;
        table[0xC5] = Self::op_load_far_pointer;
        table[0xC6] = Self::op_mov_rm_imm;
        table[0xC7] = Self::op_mov_rm_imm;
        for opcode in 0xC8..0xCC {
            table[opcode] = Self::op_ret_far;
        }
        table[0xCC] = Self::op_int3;
        table[0xCD] = Self::op_int;
        table[0xCE] = Self::op_into;
        table[0xCF] = Self::op_iret;

        for opcode in 0xD0..0xD4 {
            table[opcode] = Self::op_group2;
        }
        table[0xD4] = Self::op_aam;
        table[0xD5] = Self::op_aad;
        table[0xD6] = Self::op_salc;
        table[0xD7] = Self::op_xlat;
        for opcode in 0xD8..0xE0 {
            table[opcode] = Self::op_esc;
        }

        for opcode in 0xE0..0xE3 {
            table[opcode] = Self::op_loop;
        }
        table[0xE3] = Self::op_jcxz;
        for opcode in [0xE4, 0xE5, 0xE6, 0xE7, 0xEC, 0xED, 0xEE, 0xEF] {
            table[opcode] = Self::op_in_out;
        }
        table[0xE8] = Self::op_call_near;
        table[0xE9] = Self::op_jmp_near;
        table[0xEA] = Self::op_jmp_far;
        table[0xEB] = Self::op_jmp_short;

        table[0xF0] = Self::op_lock;
        table[0xF1] = Self::op_lock;
        table[0xF2] = Self::op_repeat_prefix;
        table[0xF3] = Self::op_repeat_prefix;
        table[0xF4] = Self::op_hlt;
        for opcode in [0xF5, 0xF8, 0xF9, 0xFA, 0xFB, 0xFC, 0xFD] {
            table[opcode] = Self::op_flag;
        }
        table[0xF6] = Self::op_group3;
        table[0xF7] = Self::op_group3;
        table[0xFE] = Self::op_group4;
        table[0xFF] = Self::op_group5;

        if variant == CpuVariant::I80186 {
            for opcode in [0x0F, 0x63, 0x64, 0x65, 0x66, 0x67, 0xF1] {
                table[opcode] = Self::op_invalid;
            }
            table[0x60] = Self::op_pusha;
            table[0x61] = Self::op_popa;
            table[0x62] = Self::op_bound;
            table[0x68] = Self::op_push_imm;
            table[0x69] = Self::op_imul_imm;
            table[0x6A] = Self::op_push_imm;
            table[0x6B] = Self::op_imul_imm;
            table[0x6C] = Self::op_ins;
            table[0x6D] = Self::op_ins;
            table[0x6E] = Self::op_outs;
            table[0x6F] = Self::op_outs;
            table[0xC0] = Self::op_shift_imm;
            table[0xC1] = Self::op_shift_imm;
            table[0xC8] = Self::op_enter;
            table[0xC9] = Self::op_leave;
        }

        table
    }
}
