//! Guest x86 instruction decoding for the dynamic recompiler.
//!
//! `iced-x86` does the byte-level decoding. This crate narrows its operand model down to the
//! instruction forms the translator lowers into host code ([`InstKind`]); every other valid
//! instruction decodes to [`InstKind::Other`] so the caller can close the block and let the
//! interpreter replay it.

mod decode;
mod inst;

pub use decode::{decode, DecodeError, MAX_INST_LEN};
pub use inst::{
    Address, AluOp, Cond, GuestInst, Gpr, Imm, InstKind, Operand, Reg, Seg, UnaryOp, Width,
};
