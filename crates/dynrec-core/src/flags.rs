//! Software evaluation of guest arithmetic and its status flags.
//!
//! Used by the portable backend; the native backend lets the host ALU compute the same flags.
//! Flags that the architecture leaves undefined (AF after logic ops) are cleared.

use dynrec_x86::{AluOp, UnaryOp, Width};

use crate::state::{FLAGS_OSZAPC, FLAG_AF, FLAG_CF, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_ZF};

fn parity_even(value: u32) -> bool {
    (value as u8).count_ones() % 2 == 0
}

fn result_flags(width: Width, result: u32) -> u32 {
    let mut flags = 0;
    if result & width.mask() == 0 {
        flags |= FLAG_ZF;
    }
    if result & width.sign_bit() != 0 {
        flags |= FLAG_SF;
    }
    if parity_even(result) {
        flags |= FLAG_PF;
    }
    flags
}

fn add_flags(width: Width, a: u32, b: u32, carry: u32) -> (u32, u32) {
    let mask = width.mask();
    let (a, b) = (a & mask, b & mask);
    let wide = u64::from(a) + u64::from(b) + u64::from(carry);
    let result = wide as u32 & mask;
    let mut flags = result_flags(width, result);
    if wide > u64::from(mask) {
        flags |= FLAG_CF;
    }
    if (a ^ b ^ result) & 0x10 != 0 {
        flags |= FLAG_AF;
    }
    if (a ^ result) & (b ^ result) & width.sign_bit() != 0 {
        flags |= FLAG_OF;
    }
    (result, flags)
}

fn sub_flags(width: Width, a: u32, b: u32, borrow: u32) -> (u32, u32) {
    let mask = width.mask();
    let (a, b) = (a & mask, b & mask);
    let result = a.wrapping_sub(b).wrapping_sub(borrow) & mask;
    let mut flags = result_flags(width, result);
    if u64::from(a) < u64::from(b) + u64::from(borrow) {
        flags |= FLAG_CF;
    }
    if (a ^ b ^ result) & 0x10 != 0 {
        flags |= FLAG_AF;
    }
    if (a ^ b) & (a ^ result) & width.sign_bit() != 0 {
        flags |= FLAG_OF;
    }
    (result, flags)
}

/// Evaluates `a op b` at `width`, returning the result (zero-extended) and the new EFLAGS.
///
/// For `CMP`/`TEST` the result is what the instruction computes but does not store.
pub fn alu(op: AluOp, width: Width, a: u32, b: u32, eflags: u32) -> (u32, u32) {
    let carry = eflags & FLAG_CF;
    let (result, status) = match op {
        AluOp::Add => add_flags(width, a, b, 0),
        AluOp::Adc => add_flags(width, a, b, carry),
        AluOp::Sub | AluOp::Cmp => sub_flags(width, a, b, 0),
        AluOp::Sbb => sub_flags(width, a, b, carry),
        AluOp::And | AluOp::Test => {
            let r = a & b & width.mask();
            (r, result_flags(width, r))
        }
        AluOp::Or => {
            let r = (a | b) & width.mask();
            (r, result_flags(width, r))
        }
        AluOp::Xor => {
            let r = (a ^ b) & width.mask();
            (r, result_flags(width, r))
        }
    };
    (result, (eflags & !FLAGS_OSZAPC) | status)
}

/// Evaluates a one-operand instruction. `INC`/`DEC` keep CF; `NOT` touches no flags.
pub fn unary(op: UnaryOp, width: Width, a: u32, eflags: u32) -> (u32, u32) {
    match op {
        UnaryOp::Inc => {
            let (r, status) = add_flags(width, a, 1, 0);
            (r, (eflags & !(FLAGS_OSZAPC & !FLAG_CF)) | (status & !FLAG_CF))
        }
        UnaryOp::Dec => {
            let (r, status) = sub_flags(width, a, 1, 0);
            (r, (eflags & !(FLAGS_OSZAPC & !FLAG_CF)) | (status & !FLAG_CF))
        }
        UnaryOp::Neg => {
            let (r, status) = sub_flags(width, 0, a, 0);
            (r, (eflags & !FLAGS_OSZAPC) | status)
        }
        UnaryOp::Not => (!a & width.mask(), eflags),
    }
}
