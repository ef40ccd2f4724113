//! Representation of CADR microinstructions.
//!
//! A microinstruction is 48 bits wide, held here in the low bits of a
//! `u64`.  The common fields are:
//!
//! ```text
//! bits 44-43   instruction class (0 ALU, 1 JUMP, 2 DISPATCH, 3 BYTE)
//! bit  42      POPJ (pop the return stack after this instruction)
//! bits 41-32   A-memory source address
//! bits 31-26   M source; with bit 31 set, bits 30-26 select a
//!              functional source instead of an M-memory address
//! bits 11-10   miscellaneous function
//! ```
//!
//! The remaining fields depend on the class:
//!
//! ```text
//! ALU:      bits 25-14 destination, 13-12 output selector,
//!           8-3 ALU function, 2 carry-in, 1-0 Q control
//! JUMP:     bits 25-12 target, 9 R, 8 P, 7 N, 6 invert,
//!           5 condition-table select, 3-0 condition code,
//!           4-0 rotate count (bit-test form)
//! DISPATCH: bits 41-32 dispatch constant, 25 N+1, 24 advance-LC,
//!           22-12 dispatch memory base, 9-8 map-bit select,
//!           7-5 field width, 4-0 position
//! BYTE:     bits 25-14 destination, 13-12 byte function,
//!           9-5 width-1, 4-0 position
//! ```
//!
//! This module is the only place that knows the field layout; the
//! emulator works through the named accessors.

use std::fmt::{self, Debug, Formatter, Octal};

use serde::{Deserialize, Serialize};

/// A microword which is zero outside this mask executes as a no-op.
pub const NOP_MASK: u64 = 0o3777777777767777;

/// The four microinstruction classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionClass {
    Alu,
    Jump,
    Dispatch,
    Byte,
}

/// One 48-bit microinstruction.
#[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Microword(u64);

impl Microword {
    pub const fn from_bits(bits: u64) -> Microword {
        Microword(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    /// OR extra bits into the word (used by the next-instruction
    /// modify mechanism).
    pub const fn merged_with(self, extra: u64) -> Microword {
        Microword(self.0 | extra)
    }

    pub fn is_nop(self) -> bool {
        self.0 & NOP_MASK == 0
    }

    pub fn class(self) -> InstructionClass {
        match (self.0 >> 43) & 3 {
            0 => InstructionClass::Alu,
            1 => InstructionClass::Jump,
            2 => InstructionClass::Dispatch,
            _ => InstructionClass::Byte,
        }
    }

    pub fn popj(self) -> bool {
        (self.0 >> 42) & 1 != 0
    }

    pub fn a_src(self) -> usize {
        ((self.0 >> 32) & 0o1777) as usize
    }

    pub fn m_src(self) -> u32 {
        ((self.0 >> 26) & 0o77) as u32
    }

    /// Destination field of ALU and BYTE instructions.  Bit 11 set
    /// means a direct A-memory write of the low 10 bits.
    pub fn dest(self) -> u32 {
        ((self.0 >> 14) & 0o7777) as u32
    }

    /// Miscellaneous function field.  On JUMP, 1 halts the machine;
    /// on DISPATCH, 2 writes dispatch memory and 3 modifies the
    /// position field from LC; on BYTE, 3 does the same.
    pub fn misc(self) -> u32 {
        ((self.0 >> 10) & 3) as u32
    }

    // --- ALU class ---

    pub fn output_selector(self) -> u32 {
        ((self.0 >> 12) & 3) as u32
    }

    pub fn alu_op(self) -> u32 {
        ((self.0 >> 3) & 0o77) as u32
    }

    pub fn carry_in(self) -> bool {
        (self.0 >> 2) & 1 != 0
    }

    pub fn q_control(self) -> u32 {
        (self.0 & 3) as u32
    }

    // --- JUMP class ---

    pub fn jump_target(self) -> u32 {
        ((self.0 >> 12) & 0o37777) as u32
    }

    pub fn r_bit(self) -> bool {
        (self.0 >> 9) & 1 != 0
    }

    pub fn p_bit(self) -> bool {
        (self.0 >> 8) & 1 != 0
    }

    pub fn n_bit(self) -> bool {
        (self.0 >> 7) & 1 != 0
    }

    pub fn invert_sense(self) -> bool {
        (self.0 >> 6) & 1 != 0
    }

    /// True when the jump condition comes from the condition table;
    /// false selects the rotated-bit test.
    pub fn condition_from_table(self) -> bool {
        (self.0 >> 5) & 1 != 0
    }

    pub fn condition_code(self) -> u32 {
        (self.0 & 0o17) as u32
    }

    /// Rotate count / byte position, low five bits.
    pub fn position(self) -> u32 {
        (self.0 & 0o37) as u32
    }

    /// Instruction register bit `n`, used by the LC-dependent
    /// position modification.
    pub fn ir_bit(self, n: u32) -> u32 {
        ((self.0 >> n) & 1) as u32
    }

    // --- DISPATCH class ---

    pub fn dispatch_constant(self) -> u32 {
        ((self.0 >> 32) & 0o1777) as u32
    }

    pub fn dispatch_n_plus1(self) -> bool {
        (self.0 >> 25) & 1 != 0
    }

    /// "Enable instruction stream hardware": advance LC as part of
    /// the dispatch.
    pub fn dispatch_advance_lc(self) -> bool {
        (self.0 >> 24) & 1 != 0
    }

    pub fn dispatch_base(self) -> u32 {
        ((self.0 >> 12) & 0o3777) as u32
    }

    pub fn dispatch_map_select(self) -> u32 {
        ((self.0 >> 8) & 3) as u32
    }

    pub fn dispatch_width(self) -> u32 {
        ((self.0 >> 5) & 7) as u32
    }

    // --- BYTE class ---

    pub fn byte_function(self) -> u32 {
        ((self.0 >> 12) & 3) as u32
    }

    pub fn byte_width_m1(self) -> u32 {
        ((self.0 >> 5) & 0o37) as u32
    }
}

impl Debug for Microword {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "Microword({:016o})", self.0)
    }
}

impl Octal for Microword {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        Octal::fmt(&self.0, f)
    }
}

impl From<u64> for Microword {
    fn from(bits: u64) -> Microword {
        Microword(bits)
    }
}

/// One dispatch memory entry: a 14-bit micro-PC target plus the N, P
/// and R control bits.
#[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DispatchEntry(u32);

impl DispatchEntry {
    pub const fn from_bits(bits: u32) -> DispatchEntry {
        DispatchEntry(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn target(self) -> u32 {
        self.0 & 0o37777
    }

    pub fn n_bit(self) -> bool {
        (self.0 >> 14) & 1 != 0
    }

    pub fn p_bit(self) -> bool {
        (self.0 >> 15) & 1 != 0
    }

    pub fn r_bit(self) -> bool {
        (self.0 >> 16) & 1 != 0
    }
}

impl Debug for DispatchEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "DispatchEntry({:06o})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_fields() {
        // JUMP class, POPJ set, A source 0o1234, M source 0o56.
        let w = Microword::from_bits(
            (1 << 43) | (1 << 42) | (0o1234 << 32) | (0o56 << 26),
        );
        assert_eq!(w.class(), InstructionClass::Jump);
        assert!(w.popj());
        assert_eq!(w.a_src(), 0o1234);
        assert_eq!(w.m_src(), 0o56);
    }

    #[test]
    fn alu_fields() {
        let w = Microword::from_bits(
            (0o4321 << 14) | (1 << 12) | (0o31 << 3) | (1 << 2) | 3,
        );
        assert_eq!(w.class(), InstructionClass::Alu);
        assert_eq!(w.dest(), 0o4321);
        assert_eq!(w.output_selector(), 1);
        assert_eq!(w.alu_op(), 0o31);
        assert!(w.carry_in());
        assert_eq!(w.q_control(), 3);
    }

    #[test]
    fn jump_fields() {
        let w = Microword::from_bits(
            (1 << 43) | (0o12345 << 12) | (1 << 9) | (1 << 8) | (1 << 7) | (1 << 6) | (1 << 5) | 0o3,
        );
        assert_eq!(w.jump_target(), 0o12345);
        assert!(w.r_bit());
        assert!(w.p_bit());
        assert!(w.n_bit());
        assert!(w.invert_sense());
        assert!(w.condition_from_table());
        assert_eq!(w.condition_code(), 3);
    }

    #[test]
    fn dispatch_fields() {
        let w = Microword::from_bits(
            (2 << 43) | (0o765 << 32) | (1 << 25) | (1 << 24) | (0o2345 << 12) | (2 << 8) | (5 << 5) | 0o17,
        );
        assert_eq!(w.class(), InstructionClass::Dispatch);
        assert_eq!(w.dispatch_constant(), 0o765);
        assert!(w.dispatch_n_plus1());
        assert!(w.dispatch_advance_lc());
        assert_eq!(w.dispatch_base(), 0o2345);
        assert_eq!(w.dispatch_map_select(), 2);
        assert_eq!(w.dispatch_width(), 5);
        assert_eq!(w.position(), 0o17);
    }

    #[test]
    fn nop_mask() {
        assert!(Microword::from_bits(0).is_nop());
        // Bits outside the mask alone still make a no-op.
        assert!(Microword::from_bits(0o10000).is_nop());
        assert!(!Microword::from_bits(1 << 43).is_nop());
    }

    #[test]
    fn dispatch_entry_bits() {
        let e = DispatchEntry::from_bits((1 << 16) | (1 << 15) | (1 << 14) | 0o4567);
        assert_eq!(e.target(), 0o4567);
        assert!(e.n_bit());
        assert!(e.p_bit());
        assert!(e.r_bit());
        let plain = DispatchEntry::from_bits(0o123);
        assert!(!plain.n_bit() && !plain.p_bit() && !plain.r_bit());
    }
}
