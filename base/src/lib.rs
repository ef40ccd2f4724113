//! The `base` crate defines the CADR-related things which are useful
//! in both a simulator and other associated tools.  The idea is that
//! if you want to write a microcode assembler, it would depend on the
//! base crate but would not need to depend on the simulator library
//! itself.

mod arith;
mod microword;

pub mod prelude;

pub use crate::arith::{add32, rotate_left, sub32};
pub use crate::microword::{DispatchEntry, InstructionClass, Microword, NOP_MASK};
