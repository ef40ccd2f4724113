//! The prelude exports the structs which are useful in representing
//! things to do with the CADR processor.  Providing this prelude is
//! the main purpose of the base crate.
pub use super::arith::{add32, rotate_left, sub32};
pub use super::microword::{DispatchEntry, InstructionClass, Microword, NOP_MASK};
