//! Exact-width arithmetic helpers for the CADR arithmetic unit.
//!
//! The ALU data path is 32 bits wide with an explicit carry-in and
//! carry-out.  We compute additions in 64 bits and take bit 32 as the
//! carry, so that carry-out is 1 exactly when the true sum is >= 2^32.

/// 32-bit addition with carry-in, returning (sum, carry-out).
pub fn add32(a: u32, b: u32, carry_in: bool) -> (u32, bool) {
    let wide = u64::from(a) + u64::from(b) + u64::from(carry_in);
    (wide as u32, (wide >> 32) != 0)
}

/// 32-bit subtraction.  A set carry-in means "no borrow", matching
/// the hardware convention: M-A-1 is computed when carry-in is clear.
/// Carry-out is set when no borrow occurred.
pub fn sub32(a: u32, b: u32, carry_in: bool) -> (u32, bool) {
    let out = a
        .wrapping_sub(b)
        .wrapping_sub(if carry_in { 0 } else { 1 });
    (out, out < a)
}

/// Rotate `value` left by `n` bit positions.  The shifter only has 5
/// bits of count, so `n` is taken modulo 32.
pub fn rotate_left(value: u32, n: u32) -> u32 {
    value.rotate_left(n & 0o37)
}
