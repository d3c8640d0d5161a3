use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use once_cell::sync::Lazy;
use strum::{Display, EnumIter};

use super::decode::Width;
use crate::state::Flags;

/// Even parity of every byte value.
pub static PARITY: Lazy<[bool; 256]> = Lazy::new(|| {
    let mut table = [false; 256];
    for (value, even) in table.iter_mut().enumerate() {
        *even = value.count_ones() % 2 == 0;
    }
    table
});

/// The eight two-operand operations in opcode order (`opcode >> 3 & 7`, or
/// the reg field of the immediate group).
#[derive(Debug, Display, PartialEq, Copy, Clone, Eq, FromPrimitive, EnumIter)]
#[repr(u8)]
pub enum AluOp {
    Add = 0,
    Or = 1,
    Adc = 2,
    Sbb = 3,
    And = 4,
    Sub = 5,
    Xor = 6,
    Cmp = 7,
}

impl AluOp {
    #[inline]
    pub fn from_index(index: u8) -> Self {
        Self::from_u8(index & 0x7).unwrap_or(AluOp::Cmp)
    }
}

/// Rotate and shift group in reg-field order. `Sal` is the undocumented
/// encoding 6 and behaves exactly like `Shl`.
#[derive(Debug, Display, PartialEq, Copy, Clone, Eq, FromPrimitive, EnumIter)]
#[repr(u8)]
pub enum ShiftOp {
    Rol = 0,
    Ror = 1,
    Rcl = 2,
    Rcr = 3,
    Shl = 4,
    Shr = 5,
    Sal = 6,
    Sar = 7,
}

impl ShiftOp {
    #[inline]
    pub fn from_index(index: u8) -> Self {
        Self::from_u8(index & 0x7).unwrap_or(ShiftOp::Sar)
    }
}

impl Flags {
    /// Zero, sign and parity from a result.
    #[inline]
    pub fn set_szp(&mut self, width: Width, result: u32) {
        self.zero = result & width.mask() == 0;
        self.sign = result & width.msb() != 0;
        self.parity = PARITY[(result & 0xFF) as usize];
    }

    #[inline]
    pub fn logical(&mut self, width: Width, result: u32) -> u16 {
        self.carry = false;
        self.overflow = false;
        self.set_szp(width, result);
        (result & width.mask()) as u16
    }

    pub fn add(&mut self, width: Width, a: u16, b: u16, carry_in: bool) -> u16 {
        let (a, b) = (a as u32 & width.mask(), b as u32 & width.mask());
        let t = a + b + carry_in as u32;
        self.carry = t & !width.mask() != 0;
        self.overflow = (t ^ a) & (t ^ b) & width.msb() != 0;
        self.aux_carry = (a ^ b ^ t) & 0x10 != 0;
        self.set_szp(width, t);
        (t & width.mask()) as u16
    }

    pub fn sub(&mut self, width: Width, a: u16, b: u16, borrow_in: bool) -> u16 {
        let (a, b) = (a as u32 & width.mask(), b as u32 & width.mask());
        let t = a.wrapping_sub(b).wrapping_sub(borrow_in as u32);
        self.carry = t & !width.mask() != 0;
        self.overflow = (t ^ a) & (a ^ b) & width.msb() != 0;
        self.aux_carry = (a ^ b ^ t) & 0x10 != 0;
        self.set_szp(width, t);
        (t & width.mask()) as u16
    }

    /// Applies `op` to `a` and `b`. Returns `None` for CMP, which only
    /// updates the flags.
    pub fn alu(&mut self, op: AluOp, width: Width, a: u16, b: u16) -> Option<u16> {
        let carry = self.carry;
        let result = match op {
            AluOp::Add => self.add(width, a, b, false),
            AluOp::Adc => self.add(width, a, b, carry),
            AluOp::Sub => self.sub(width, a, b, false),
            AluOp::Sbb => self.sub(width, a, b, carry),
            AluOp::Or => self.logical(width, (a | b) as u32),
            AluOp::And => self.logical(width, (a & b) as u32),
            AluOp::Xor => self.logical(width, (a ^ b) as u32),
            AluOp::Cmp => {
                self.sub(width, a, b, false);
                return None;
            }
        };
        Some(result)
    }

    /// Rotates or shifts `value` by `count` (already masked to 5 bits).
    ///
    /// Works one bit per iteration. Overflow is recomputed from the sign bit
    /// before and after, which only matches the documented definition for a
    /// single bit.
    pub fn shift(&mut self, op: ShiftOp, width: Width, value: u16, count: u8) -> u16 {
        if count == 0 {
            return value;
        }
        let msb = width.msb();
        let mask = width.mask();
        let original = value as u32 & mask;
        let mut dst = original;

        for _ in 0..count {
            match op {
                ShiftOp::Rol => {
                    let out = dst & msb != 0;
                    dst = (dst << 1 | out as u32) & mask;
                    self.carry = out;
                }
                ShiftOp::Ror => {
                    let out = dst & 1 != 0;
                    dst = dst >> 1 | if out { msb } else { 0 };
                    self.carry = out;
                }
                ShiftOp::Rcl => {
                    let carry_in = self.carry;
                    self.carry = dst & msb != 0;
                    dst = (dst << 1 | carry_in as u32) & mask;
                }
                ShiftOp::Rcr => {
                    let carry_in = self.carry;
                    self.carry = dst & 1 != 0;
                    dst = dst >> 1 | if carry_in { msb } else { 0 };
                }
                ShiftOp::Shl | ShiftOp::Sal => {
                    let out = dst & msb != 0;
                    dst = (dst << 1) & mask;
                    self.logical(width, dst);
                    self.carry = out;
                }
                ShiftOp::Shr => {
                    let out = dst & 1 != 0;
                    dst >>= 1;
                    self.logical(width, dst);
                    self.carry = out;
                }
                ShiftOp::Sar => {
                    let out = dst & 1 != 0;
                    dst = dst >> 1 | (dst & msb);
                    self.logical(width, dst);
                    self.carry = out;
                }
            }
        }

        self.overflow = (original & msb) != (dst & msb);
        dst as u16
    }

    /// DAA, Intel pseudo-code.
    pub fn daa(&mut self, al: u8) -> u8 {
        let (old_al, old_carry) = (al, self.carry);
        let mut al = al;
        if al & 0x0F > 9 || self.aux_carry {
            al = al.wrapping_add(6);
            self.aux_carry = true;
        } else {
            self.aux_carry = false;
        }
        if old_al > 0x99 || old_carry {
            al = al.wrapping_add(0x60);
            self.carry = true;
        } else {
            self.carry = false;
        }
        self.set_szp(Width::Byte, al as u32);
        al
    }

    /// DAS, Intel pseudo-code.
    pub fn das(&mut self, al: u8) -> u8 {
        let (old_al, old_carry) = (al, self.carry);
        let mut al = al;
        self.carry = false;
        if al & 0x0F > 9 || self.aux_carry {
            self.carry = old_carry || al < 6;
            al = al.wrapping_sub(6);
            self.aux_carry = true;
        } else {
            self.aux_carry = false;
        }
        if old_al > 0x99 || old_carry {
            al = al.wrapping_sub(0x60);
            self.carry = true;
        }
        self.set_szp(Width::Byte, al as u32);
        al
    }

    /// AAA on the 8086: AL and AH are adjusted separately.
    pub fn aaa(&mut self, ax: u16) -> u16 {
        let [mut al, mut ah] = ax.to_le_bytes();
        if al & 0x0F > 9 || self.aux_carry {
            al = al.wrapping_add(6);
            ah = ah.wrapping_add(1);
            self.aux_carry = true;
            self.carry = true;
        } else {
            self.aux_carry = false;
            self.carry = false;
        }
        u16::from_le_bytes([al & 0x0F, ah])
    }

    pub fn aas(&mut self, ax: u16) -> u16 {
        let [mut al, mut ah] = ax.to_le_bytes();
        if al & 0x0F > 9 || self.aux_carry {
            al = al.wrapping_sub(6);
            ah = ah.wrapping_sub(1);
            self.aux_carry = true;
            self.carry = true;
        } else {
            self.aux_carry = false;
            self.carry = false;
        }
        u16::from_le_bytes([al & 0x0F, ah])
    }

    /// AAM with an arbitrary base. `None` when the base is zero.
    pub fn aam(&mut self, al: u8, base: u8) -> Option<u16> {
        if base == 0 {
            return None;
        }
        let (ah, al) = (al / base, al % base);
        self.set_szp(Width::Byte, al as u32);
        Some(u16::from_le_bytes([al, ah]))
    }

    /// AAD with an arbitrary base. AH is cleared.
    pub fn aad(&mut self, ax: u16, base: u8) -> u16 {
        let [al, ah] = ax.to_le_bytes();
        let al = ah.wrapping_mul(base).wrapping_add(al);
        self.set_szp(Width::Byte, al as u32);
        al as u16
    }
}

/// Unsigned multiply of the accumulator. Returns (low, high, upper half used).
pub fn multiply(width: Width, acc: u16, src: u16) -> (u16, u16, bool) {
    match width {
        Width::Byte => {
            let product = (acc & 0xFF) * (src & 0xFF);
            (product, 0, product > 0xFF)
        }
        Width::Word => {
            let product = acc as u32 * src as u32;
            (product as u16, (product >> 16) as u16, product > 0xFFFF)
        }
    }
}

/// Signed multiply. Returns (low, high, result does not fit the low half).
pub fn multiply_signed(width: Width, acc: u16, src: u16) -> (u16, u16, bool) {
    match width {
        Width::Byte => {
            let product = (acc as u8 as i8 as i16) * (src as u8 as i8 as i16);
            (product as u16, 0, product != product as i8 as i16)
        }
        Width::Word => {
            let product = (acc as i16 as i32) * (src as i16 as i32);
            (
                product as u16,
                (product >> 16) as u16,
                product != product as i16 as i32,
            )
        }
    }
}

/// Unsigned divide of AX (byte) or DX:AX (word). Returns (quotient,
/// remainder), or `None` for a divide error.
pub fn divide(width: Width, dividend: u32, divisor: u16) -> Option<(u16, u16)> {
    let divisor = divisor as u32 & width.mask();
    if divisor == 0 {
        return None;
    }
    let quotient = dividend / divisor;
    if quotient > width.mask() {
        return None;
    }
    Some((quotient as u16, (dividend % divisor) as u16))
}

/// Signed divide, truncating toward zero. The remainder takes the sign of
/// the dividend.
pub fn divide_signed(width: Width, dividend: u32, divisor: u16) -> Option<(u16, u16)> {
    let (dividend, divisor, range) = match width {
        Width::Byte => (
            dividend as u16 as i16 as i64,
            divisor as u8 as i8 as i64,
            i8::MIN as i64..=i8::MAX as i64,
        ),
        Width::Word => (
            dividend as i32 as i64,
            divisor as i16 as i64,
            i16::MIN as i64..=i16::MAX as i64,
        ),
    };
    if divisor == 0 {
        return None;
    }
    let quotient = dividend / divisor;
    if !range.contains(&quotient) {
        return None;
    }
    let remainder = dividend % divisor;
    Some((
        (quotient as u16) & width.mask() as u16,
        (remainder as u16) & width.mask() as u16,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn reference_add(width: Width, a: u32, b: u32, c: u32) -> Flags {
        let bits = if width == Width::Byte { 8 } else { 16 };
        let signed = |v: u32| ((v << (32 - bits)) as i32 >> (32 - bits)) as i64;
        let sum = a + b + c;
        let result = sum & width.mask();
        let signed_sum = signed(a) + signed(b) + c as i64;
        Flags {
            carry: sum > width.mask(),
            overflow: signed_sum != signed(result),
            aux_carry: (a & 0xF) + (b & 0xF) + c > 0xF,
            zero: result == 0,
            sign: result & width.msb() != 0,
            parity: (result & 0xFF).count_ones() % 2 == 0,
            ..Default::default()
        }
    }

    fn reference_sub(width: Width, a: u32, b: u32, c: u32) -> Flags {
        let bits = if width == Width::Byte { 8 } else { 16 };
        let signed = |v: u32| ((v << (32 - bits)) as i32 >> (32 - bits)) as i64;
        let result = a.wrapping_sub(b).wrapping_sub(c) & width.mask();
        let signed_diff = signed(a) - signed(b) - c as i64;
        Flags {
            carry: a < b + c,
            overflow: signed_diff != signed(result),
            aux_carry: (a & 0xF) < (b & 0xF) + c,
            zero: result == 0,
            sign: result & width.msb() != 0,
            parity: (result & 0xFF).count_ones() % 2 == 0,
            ..Default::default()
        }
    }

    fn check(width: Width, a: u16, b: u16, carry: bool) {
        let c = carry as u32;

        let mut flags = Flags::default();
        let sum = flags.add(width, a, b, carry);
        assert_eq!(sum as u32, (a as u32 + b as u32 + c) & width.mask());
        assert_eq!(flags, reference_add(width, a as u32, b as u32, c), "{a:#x}+{b:#x}+{c}");

        let mut flags = Flags::default();
        let diff = flags.sub(width, a, b, carry);
        assert_eq!(diff as u32, (a as u32).wrapping_sub(b as u32 + c) & width.mask());
        assert_eq!(flags, reference_sub(width, a as u32, b as u32, c), "{a:#x}-{b:#x}-{c}");
    }

    #[test]
    fn test_parity_table() {
        assert!(PARITY[0x00]);
        assert!(!PARITY[0x01]);
        assert!(PARITY[0x03]);
        assert!(!PARITY[0x08]);
        assert!(PARITY[0xFF]);
    }

    #[test]
    fn test_byte_flags_exhaustive() {
        for a in 0..=0xFFu16 {
            for b in 0..=0xFFu16 {
                check(Width::Byte, a, b, false);
                check(Width::Byte, a, b, true);
            }
        }
    }

    #[test]
    fn test_boundary_pairs() {
        let mut flags = Flags::default();
        assert_eq!(flags.add(Width::Byte, 0, 0, false), 0);
        assert!(flags.zero && flags.parity && !flags.carry && !flags.overflow);

        assert_eq!(flags.add(Width::Byte, 0x7F, 1, false), 0x80);
        assert!(flags.overflow && flags.sign && !flags.carry && flags.aux_carry);

        assert_eq!(flags.add(Width::Byte, 0xFF, 1, false), 0);
        assert!(flags.carry && flags.zero && !flags.overflow);

        assert_eq!(flags.add(Width::Byte, 0x0F, 1, false), 0x10);
        assert!(flags.aux_carry && !flags.carry);

        assert_eq!(flags.sub(Width::Word, 0x8000, 1, false), 0x7FFF);
        assert!(flags.overflow && !flags.carry && !flags.sign);

        assert_eq!(flags.sub(Width::Word, 0, 1, false), 0xFFFF);
        assert!(flags.carry && flags.sign);
    }

    #[test]
    fn test_alu_ops() {
        let mut flags = Flags {
            carry: true,
            overflow: true,
            ..Default::default()
        };
        assert_eq!(flags.alu(AluOp::Xor, Width::Word, 0x1234, 0x1234), Some(0));
        assert!(flags.zero && !flags.carry && !flags.overflow);

        flags.carry = true;
        assert_eq!(flags.alu(AluOp::Adc, Width::Byte, 1, 1), Some(3));
        assert_eq!(flags.alu(AluOp::Cmp, Width::Byte, 1, 2), None);
        assert!(flags.carry && flags.sign);
        assert_eq!(AluOp::from_index(5), AluOp::Sub);
    }

    #[test]
    fn test_operations_follow_encoding_order() {
        use strum::IntoEnumIterator;

        for (index, op) in AluOp::iter().enumerate() {
            assert_eq!(AluOp::from_index(index as u8), op);
        }
        for (index, op) in ShiftOp::iter().enumerate() {
            assert_eq!(ShiftOp::from_index(index as u8 | 0x8), op);
        }
    }

    #[test]
    fn test_shifts() {
        let mut flags = Flags::default();
        assert_eq!(flags.shift(ShiftOp::Shl, Width::Byte, 0x81, 1), 0x02);
        assert!(flags.carry && flags.overflow);

        assert_eq!(flags.shift(ShiftOp::Shr, Width::Byte, 0x81, 1), 0x40);
        assert!(flags.carry && flags.overflow);

        assert_eq!(flags.shift(ShiftOp::Sar, Width::Byte, 0x81, 1), 0xC0);
        assert!(flags.carry && !flags.overflow && flags.sign);

        assert_eq!(flags.shift(ShiftOp::Rol, Width::Word, 0x8001, 4), 0x0018);
        assert!(!flags.carry);

        assert_eq!(flags.shift(ShiftOp::Ror, Width::Byte, 0x01, 1), 0x80);
        assert!(flags.carry && flags.overflow);

        flags.carry = true;
        assert_eq!(flags.shift(ShiftOp::Rcl, Width::Byte, 0x80, 1), 0x01);
        assert!(flags.carry);

        flags.carry = false;
        assert_eq!(flags.shift(ShiftOp::Rcr, Width::Byte, 0x01, 1), 0x00);
        assert!(flags.carry);
    }

    #[test]
    fn test_shift_by_zero_keeps_flags() {
        let mut flags = Flags {
            carry: true,
            overflow: true,
            ..Default::default()
        };
        let before = flags;
        assert_eq!(flags.shift(ShiftOp::Shl, Width::Word, 0x1234, 0), 0x1234);
        assert_eq!(flags, before);
    }

    #[test]
    fn test_shift_multi_bit_overflow_uses_sign_change() {
        let mut flags = Flags::default();
        // 0x40 << 2 = 0x00: sign went 0 -> 0
        assert_eq!(flags.shift(ShiftOp::Shl, Width::Byte, 0x40, 2), 0x00);
        assert!(!flags.overflow);
        assert!(flags.carry);
        assert!(flags.zero);
    }

    #[test]
    fn test_multiply() {
        assert_eq!(multiply(Width::Byte, 0x10, 0x10), (0x0100, 0, true));
        assert_eq!(multiply(Width::Byte, 0x0F, 0x02), (0x001E, 0, false));
        assert_eq!(multiply(Width::Word, 0xFFFF, 0xFFFF), (0x0001, 0xFFFE, true));

        assert_eq!(multiply_signed(Width::Byte, 0xFF, 0x02), (0xFFFE, 0, false));
        assert_eq!(multiply_signed(Width::Byte, 0x40, 0x02), (0x0080, 0, true));
        assert_eq!(multiply_signed(Width::Word, 0xFFFF, 0xFFFF), (1, 0, false));
        assert_eq!(multiply_signed(Width::Word, 0x4000, 0x0004), (0, 1, true));
    }

    #[test]
    fn test_divide() {
        assert_eq!(divide(Width::Byte, 0x0107, 0x10), Some((0x10, 0x07)));
        assert_eq!(divide(Width::Byte, 0x1000, 0x10), None);
        assert_eq!(divide(Width::Word, 0x0001_0000, 2), Some((0x8000, 0)));
        assert_eq!(divide(Width::Word, 5, 0), None);

        // -7 / 2 = -3 rest -1
        assert_eq!(divide_signed(Width::Byte, 0xFFF9, 0x02), Some((0xFD, 0xFF)));
        assert_eq!(divide_signed(Width::Byte, 0x0100, 0x01), None);
        // -100000 / 7 = -14285 rest -5
        let dividend = (-100_000i32) as u32;
        assert_eq!(
            divide_signed(Width::Word, dividend, 7),
            Some(((-14285i16) as u16, (-5i16) as u16))
        );
        assert_eq!(divide_signed(Width::Word, 1, 0), None);
    }

    #[test]
    fn test_decimal_adjust() {
        let mut flags = Flags::default();
        // 0x19 + 0x28 = 0x41 with AF set -> 47
        flags.add(Width::Byte, 0x19, 0x28, false);
        assert_eq!(flags.daa(0x41), 0x47);
        assert!(!flags.carry);

        flags.add(Width::Byte, 0x99, 0x01, false);
        assert_eq!(flags.daa(0x9A), 0x00);
        assert!(flags.carry && flags.zero);

        flags.sub(Width::Byte, 0x10, 0x01, false);
        assert_eq!(flags.das(0x0F), 0x09);
        assert!(!flags.carry);

        let mut flags = Flags::default();
        assert_eq!(flags.aaa(0x000B), 0x0101);
        assert!(flags.carry && flags.aux_carry);

        let mut flags = Flags::default();
        assert_eq!(flags.aas(0x0205), 0x0205);
        assert!(!flags.carry);

        assert_eq!(flags.aam(63, 10), Some(0x0603));
        assert_eq!(flags.aam(63, 0), None);
        assert_eq!(flags.aad(0x0603, 10), 63);
    }

    proptest! {
        #[test]
        fn prop_word_flags(a in any::<u16>(), b in any::<u16>(), carry in any::<bool>()) {
            check(Width::Word, a, b, carry);
        }

        #[test]
        fn prop_rotate_round_trip(value in any::<u16>(), count in 1u8..32) {
            let mut flags = Flags::default();
            let rotated = flags.shift(ShiftOp::Rol, Width::Word, value, count);
            prop_assert_eq!(rotated, value.rotate_left(count as u32));
            let back = flags.shift(ShiftOp::Ror, Width::Word, rotated, count);
            prop_assert_eq!(back, value);
        }
    }
}
