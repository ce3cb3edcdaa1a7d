use iced_x86::{
    Decoder, DecoderError, DecoderOptions, Instruction, MemorySize, Mnemonic, OpKind, Register,
};
use thiserror::Error;

use crate::inst::{
    Address, AluOp, Cond, GuestInst, Gpr, Imm, InstKind, Operand, Reg, Seg, UnaryOp, Width,
};

/// Architectural upper bound on the length of one instruction.
pub const MAX_INST_LEN: usize = 15;

const CALLBACK_OPCODE: [u8; 2] = [0xFE, 0x38];
const CALLBACK_LEN: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("instruction buffer is empty")]
    Empty,
    #[error("instruction at {ip:#x} continues past the available bytes")]
    Truncated { ip: u32 },
}

#[derive(Debug, Default, Clone, Copy)]
struct Prefixes {
    opsize: bool,
    addrsize: bool,
}

fn scan_prefixes(bytes: &[u8]) -> Prefixes {
    let mut prefixes = Prefixes::default();
    for &b in bytes.iter().take(MAX_INST_LEN) {
        match b {
            0x66 => prefixes.opsize = true,
            0x67 => prefixes.addrsize = true,
            0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 | 0xF0 | 0xF2 | 0xF3 => {}
            _ => break,
        }
    }
    prefixes
}

fn first_opcode_byte(bytes: &[u8]) -> Option<u8> {
    bytes.iter().copied().find(|b| {
        !matches!(
            b,
            0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 | 0x66 | 0x67 | 0xF0 | 0xF2 | 0xF3
        )
    })
}

/// Decodes one guest instruction starting at `bytes[0]`, located at (E)IP `ip`.
///
/// `code32` selects the default operand/address size of the code segment. Returns
/// [`DecodeError::Truncated`] when `bytes` ends before the instruction does, which the translator
/// uses to stop at a page it cannot fetch from.
pub fn decode(bytes: &[u8], ip: u32, code32: bool) -> Result<GuestInst, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }

    if bytes.starts_with(&CALLBACK_OPCODE) {
        if bytes.len() < usize::from(CALLBACK_LEN) {
            return Err(DecodeError::Truncated { ip });
        }
        return Ok(GuestInst {
            ip,
            len: CALLBACK_LEN,
            width: Width::W16,
            kind: InstKind::Callback {
                index: u16::from_le_bytes([bytes[2], bytes[3]]),
            },
        });
    }

    let bitness = if code32 { 32 } else { 16 };
    let window = &bytes[..bytes.len().min(MAX_INST_LEN)];
    let mut decoder = Decoder::with_ip(bitness, window, u64::from(ip), DecoderOptions::NONE);
    let mut instr = Instruction::default();
    decoder.decode_out(&mut instr);

    if instr.is_invalid() {
        return match decoder.last_error() {
            DecoderError::NoMoreBytes => Err(DecodeError::Truncated { ip }),
            _ => Ok(GuestInst {
                ip,
                len: instr.len().max(1) as u8,
                width: Width::W8,
                kind: InstKind::Invalid,
            }),
        };
    }

    let prefixes = scan_prefixes(window);
    let op32 = code32 ^ prefixes.opsize;
    let addr32 = code32 ^ prefixes.addrsize;
    let stack_width = if op32 { Width::W32 } else { Width::W16 };
    let imm_location = {
        let offsets = decoder.get_constant_offsets(&instr);
        let (at, len) = (offsets.immediate_offset(), offsets.immediate_size());
        offsets.has_immediate().then_some((at as u8, len as u8))
    };

    let lowered = if instr.has_lock_prefix() {
        None
    } else if matches!(first_opcode_byte(window), Some(0xD8..=0xDF)) {
        Some((InstKind::Fpu, stack_width))
    } else {
        lower(&instr, addr32, stack_width, imm_location)
    };
    let (kind, width) = lowered.unwrap_or((InstKind::Other, stack_width));

    Ok(GuestInst {
        ip,
        len: instr.len() as u8,
        width,
        kind,
    })
}

fn lower(
    instr: &Instruction,
    addr32: bool,
    stack_width: Width,
    imm_location: Option<(u8, u8)>,
) -> Option<(InstKind, Width)> {
    let operand = |i: u32| operand(instr, i, addr32, imm_location);

    match instr.mnemonic() {
        Mnemonic::Mov => {
            let (dst, src) = (operand(0)?, operand(1)?);
            let width = data_width(instr, &[dst, src])?;
            Some((InstKind::Mov { dst, src }, width))
        }
        m @ (Mnemonic::Add
        | Mnemonic::Or
        | Mnemonic::Adc
        | Mnemonic::Sbb
        | Mnemonic::And
        | Mnemonic::Sub
        | Mnemonic::Xor
        | Mnemonic::Cmp
        | Mnemonic::Test) => {
            let op = match m {
                Mnemonic::Add => AluOp::Add,
                Mnemonic::Or => AluOp::Or,
                Mnemonic::Adc => AluOp::Adc,
                Mnemonic::Sbb => AluOp::Sbb,
                Mnemonic::And => AluOp::And,
                Mnemonic::Sub => AluOp::Sub,
                Mnemonic::Xor => AluOp::Xor,
                Mnemonic::Cmp => AluOp::Cmp,
                _ => AluOp::Test,
            };
            let (dst, src) = (operand(0)?, operand(1)?);
            if matches!(dst, Operand::Imm(_)) {
                return None;
            }
            let width = data_width(instr, &[dst, src])?;
            Some((InstKind::Alu { op, dst, src }, width))
        }
        m @ (Mnemonic::Inc | Mnemonic::Dec | Mnemonic::Neg | Mnemonic::Not) => {
            let op = match m {
                Mnemonic::Inc => UnaryOp::Inc,
                Mnemonic::Dec => UnaryOp::Dec,
                Mnemonic::Neg => UnaryOp::Neg,
                _ => UnaryOp::Not,
            };
            let dst = operand(0)?;
            let width = data_width(instr, &[dst])?;
            Some((InstKind::Unary { op, dst }, width))
        }
        Mnemonic::Lea => match (operand(0)?, operand(1)?) {
            (Operand::Reg(dst), Operand::Mem(addr)) if dst.width != Width::W8 => {
                Some((InstKind::Lea { dst, addr }, dst.width))
            }
            _ => None,
        },
        Mnemonic::Push => match operand(0)? {
            src @ Operand::Reg(r) => Some((InstKind::Push { src }, r.width)),
            src @ Operand::Imm(_) => Some((InstKind::Push { src }, stack_width)),
            Operand::Mem(_) => None,
        },
        Mnemonic::Pop => match operand(0)? {
            Operand::Reg(dst) => Some((InstKind::Pop { dst }, dst.width)),
            _ => None,
        },
        Mnemonic::Jmp => {
            near_target(instr).map(|target| (InstKind::Jmp { target }, stack_width))
        }
        Mnemonic::Call => {
            near_target(instr).map(|target| (InstKind::Call { target }, stack_width))
        }
        Mnemonic::Ret => {
            let pop = if instr.op_count() == 1 {
                instr.immediate16()
            } else {
                0
            };
            Some((InstKind::Ret { pop }, stack_width))
        }
        Mnemonic::Div | Mnemonic::Idiv => {
            let src = operand(0)?;
            if matches!(src, Operand::Imm(_)) {
                return None;
            }
            let width = data_width(instr, &[src])?;
            let signed = instr.mnemonic() == Mnemonic::Idiv;
            Some((InstKind::Div { signed, src }, width))
        }
        Mnemonic::Iret => Some((InstKind::Iret, Width::W16)),
        Mnemonic::Iretd => Some((InstKind::Iret, Width::W32)),
        Mnemonic::Nop => Some((InstKind::Nop, stack_width)),
        m => {
            let cond = jcc_cond(m)?;
            near_target(instr).map(|target| (InstKind::Jcc { cond, target }, stack_width))
        }
    }
}

fn jcc_cond(mnemonic: Mnemonic) -> Option<Cond> {
    Some(match mnemonic {
        Mnemonic::Jo => Cond::O,
        Mnemonic::Jno => Cond::No,
        Mnemonic::Jb => Cond::B,
        Mnemonic::Jae => Cond::Ae,
        Mnemonic::Je => Cond::E,
        Mnemonic::Jne => Cond::Ne,
        Mnemonic::Jbe => Cond::Be,
        Mnemonic::Ja => Cond::A,
        Mnemonic::Js => Cond::S,
        Mnemonic::Jns => Cond::Ns,
        Mnemonic::Jp => Cond::P,
        Mnemonic::Jnp => Cond::Np,
        Mnemonic::Jl => Cond::L,
        Mnemonic::Jge => Cond::Ge,
        Mnemonic::Jle => Cond::Le,
        Mnemonic::Jg => Cond::G,
        _ => return None,
    })
}

fn near_target(instr: &Instruction) -> Option<u32> {
    match instr.op0_kind() {
        OpKind::NearBranch16 | OpKind::NearBranch32 => Some(instr.near_branch_target() as u32),
        _ => None,
    }
}

fn operand(
    instr: &Instruction,
    i: u32,
    addr32: bool,
    imm_location: Option<(u8, u8)>,
) -> Option<Operand> {
    match instr.op_kind(i) {
        OpKind::Register => reg(instr.op_register(i)).map(Operand::Reg),
        OpKind::Memory => address(instr, addr32).map(Operand::Mem),
        OpKind::Immediate8
        | OpKind::Immediate16
        | OpKind::Immediate32
        | OpKind::Immediate8to16
        | OpKind::Immediate8to32 => {
            let (offset, size) = imm_location?;
            Some(Operand::Imm(Imm {
                value: instr.immediate(i) as u32,
                offset,
                size,
            }))
        }
        _ => None,
    }
}

/// Operation width: the first register operand decides, then the memory operand size.
fn data_width(instr: &Instruction, operands: &[Operand]) -> Option<Width> {
    operands
        .iter()
        .find_map(|op| match op {
            Operand::Reg(r) => Some(r.width),
            _ => None,
        })
        .or_else(|| memory_width(instr.memory_size()))
}

fn memory_width(size: MemorySize) -> Option<Width> {
    match size {
        MemorySize::UInt8 | MemorySize::Int8 => Some(Width::W8),
        MemorySize::UInt16 | MemorySize::Int16 => Some(Width::W16),
        MemorySize::UInt32 | MemorySize::Int32 => Some(Width::W32),
        _ => None,
    }
}

fn address(instr: &Instruction, addr32: bool) -> Option<Address> {
    let seg = seg(instr.memory_segment())?;
    let base = match instr.memory_base() {
        Register::None => None,
        r => Some(reg(r)?),
    };
    let index = match instr.memory_index() {
        Register::None => None,
        r => Some(reg(r)?),
    };

    let addr16 = match base.or(index) {
        Some(r) => match r.width {
            Width::W16 => true,
            Width::W32 => false,
            Width::W8 => return None,
        },
        None => !addr32,
    };

    Some(Address {
        seg,
        base: base.map(|r| r.gpr),
        index: index.map(|r| r.gpr),
        scale: instr.memory_index_scale() as u8,
        disp: instr.memory_displacement32(),
        addr16,
    })
}

fn seg(reg: Register) -> Option<Seg> {
    Some(match reg {
        Register::ES => Seg::Es,
        Register::CS => Seg::Cs,
        Register::SS => Seg::Ss,
        Register::DS => Seg::Ds,
        Register::FS => Seg::Fs,
        Register::GS => Seg::Gs,
        _ => return None,
    })
}

fn reg(reg: Register) -> Option<Reg> {
    use Gpr::*;

    Some(match reg {
        Register::AL => Reg::new(Eax, Width::W8),
        Register::CL => Reg::new(Ecx, Width::W8),
        Register::DL => Reg::new(Edx, Width::W8),
        Register::BL => Reg::new(Ebx, Width::W8),
        Register::AH => Reg::high8(Eax),
        Register::CH => Reg::high8(Ecx),
        Register::DH => Reg::high8(Edx),
        Register::BH => Reg::high8(Ebx),
        Register::AX => Reg::new(Eax, Width::W16),
        Register::CX => Reg::new(Ecx, Width::W16),
        Register::DX => Reg::new(Edx, Width::W16),
        Register::BX => Reg::new(Ebx, Width::W16),
        Register::SP => Reg::new(Esp, Width::W16),
        Register::BP => Reg::new(Ebp, Width::W16),
        Register::SI => Reg::new(Esi, Width::W16),
        Register::DI => Reg::new(Edi, Width::W16),
        Register::EAX => Reg::new(Eax, Width::W32),
        Register::ECX => Reg::new(Ecx, Width::W32),
        Register::EDX => Reg::new(Edx, Width::W32),
        Register::EBX => Reg::new(Ebx, Width::W32),
        Register::ESP => Reg::new(Esp, Width::W32),
        Register::EBP => Reg::new(Ebp, Width::W32),
        Register::ESI => Reg::new(Esi, Width::W32),
        Register::EDI => Reg::new(Edi, Width::W32),
        _ => return None,
    })
}
