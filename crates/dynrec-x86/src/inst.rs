/// Operand width of a guest operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    W8,
    W16,
    W32,
}

impl Width {
    pub const fn bytes(self) -> u32 {
        match self {
            Width::W8 => 1,
            Width::W16 => 2,
            Width::W32 => 4,
        }
    }

    pub const fn bits(self) -> u32 {
        self.bytes() * 8
    }

    pub const fn mask(self) -> u32 {
        match self {
            Width::W8 => 0xFF,
            Width::W16 => 0xFFFF,
            Width::W32 => 0xFFFF_FFFF,
        }
    }

    pub const fn sign_bit(self) -> u32 {
        1 << (self.bits() - 1)
    }

    /// Sign-extends the low `self.bits()` bits of `value` to 32 bits.
    pub const fn sign_extend(self, value: u32) -> u32 {
        match self {
            Width::W8 => value as u8 as i8 as i32 as u32,
            Width::W16 => value as u16 as i16 as i32 as u32,
            Width::W32 => value,
        }
    }

    pub const fn from_bytes(bytes: u32) -> Option<Width> {
        match bytes {
            1 => Some(Width::W8),
            2 => Some(Width::W16),
            4 => Some(Width::W32),
            _ => None,
        }
    }
}

/// 32-bit general purpose registers in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gpr {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

impl Gpr {
    pub const ALL: [Gpr; 8] = [
        Gpr::Eax,
        Gpr::Ecx,
        Gpr::Edx,
        Gpr::Ebx,
        Gpr::Esp,
        Gpr::Ebp,
        Gpr::Esi,
        Gpr::Edi,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }
}

/// A (possibly partial) view of a general purpose register.
///
/// `high8` selects `AH`/`CH`/`DH`/`BH`, bits 8..16 of the first four registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg {
    pub gpr: Gpr,
    pub width: Width,
    pub high8: bool,
}

impl Reg {
    pub const fn new(gpr: Gpr, width: Width) -> Self {
        Self {
            gpr,
            width,
            high8: false,
        }
    }

    pub const fn high8(gpr: Gpr) -> Self {
        Self {
            gpr,
            width: Width::W8,
            high8: true,
        }
    }
}

/// Segment registers in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Seg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl Seg {
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// A ModRM/SIB (or `moffs`) memory reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub seg: Seg,
    pub base: Option<Gpr>,
    pub index: Option<Gpr>,
    /// 1, 2, 4 or 8.
    pub scale: u8,
    pub disp: u32,
    /// 16-bit address size: the offset wraps at 64 KiB.
    pub addr16: bool,
}

/// An immediate operand together with its location inside the instruction bytes.
///
/// The translator needs the location so an immediate that keeps getting rewritten can be read
/// from guest memory when the block runs instead of being baked into host code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Imm {
    /// Value already extended to the operation width.
    pub value: u32,
    /// Byte offset of the encoded immediate from the start of the instruction.
    pub offset: u8,
    /// Encoded size in bytes (1 for the sign-extended `imm8` forms).
    pub size: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Reg(Reg),
    Mem(Address),
    Imm(Imm),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
    Test,
}

impl AluOp {
    /// `CMP` and `TEST` only update flags.
    pub const fn writes_result(self) -> bool {
        !matches!(self, AluOp::Cmp | AluOp::Test)
    }

    /// Whether the operation consumes the incoming carry flag.
    pub const fn reads_carry(self) -> bool {
        matches!(self, AluOp::Adc | AluOp::Sbb)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Inc,
    Dec,
    Neg,
    Not,
}

/// Condition codes in `Jcc` encoding order (`0x70 + cc`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cond {
    O = 0,
    No = 1,
    B = 2,
    Ae = 3,
    E = 4,
    Ne = 5,
    Be = 6,
    A = 7,
    S = 8,
    Ns = 9,
    P = 10,
    Np = 11,
    L = 12,
    Ge = 13,
    Le = 14,
    G = 15,
}

impl Cond {
    const CF: u32 = 1 << 0;
    const PF: u32 = 1 << 2;
    const ZF: u32 = 1 << 6;
    const SF: u32 = 1 << 7;
    const OF: u32 = 1 << 11;

    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn from_code(code: u8) -> Option<Cond> {
        Some(match code {
            0 => Cond::O,
            1 => Cond::No,
            2 => Cond::B,
            3 => Cond::Ae,
            4 => Cond::E,
            5 => Cond::Ne,
            6 => Cond::Be,
            7 => Cond::A,
            8 => Cond::S,
            9 => Cond::Ns,
            10 => Cond::P,
            11 => Cond::Np,
            12 => Cond::L,
            13 => Cond::Ge,
            14 => Cond::Le,
            15 => Cond::G,
            _ => return None,
        })
    }

    /// Evaluates the condition against an EFLAGS image.
    pub fn holds(self, eflags: u32) -> bool {
        let cf = eflags & Self::CF != 0;
        let pf = eflags & Self::PF != 0;
        let zf = eflags & Self::ZF != 0;
        let sf = eflags & Self::SF != 0;
        let of = eflags & Self::OF != 0;
        // Odd codes negate the preceding even one.
        let base = match self.code() & !1 {
            0 => of,
            2 => cf,
            4 => zf,
            6 => cf || zf,
            8 => sf,
            10 => pf,
            12 => sf != of,
            _ => zf || sf != of,
        };
        base ^ (self.code() & 1 != 0)
    }
}

/// The translatable shape of a decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstKind {
    Mov { dst: Operand, src: Operand },
    Alu {
        op: AluOp,
        dst: Operand,
        src: Operand,
    },
    Unary { op: UnaryOp, dst: Operand },
    Lea { dst: Reg, addr: Address },
    Push { src: Operand },
    Pop { dst: Reg },
    /// Direct near jump; `target` is the new (E)IP.
    Jmp { target: u32 },
    Jcc { cond: Cond, target: u32 },
    Call { target: u32 },
    /// Near return, releasing `pop` extra stack bytes.
    Ret { pop: u16 },
    /// Unsigned or signed divide of the accumulator pair by `src`.
    Div { signed: bool, src: Operand },
    Iret,
    Nop,
    /// x87 escape (`D8`..`DF`).
    Fpu,
    /// Emulator callback trap `FE 38 iw`.
    Callback { index: u16 },
    /// Valid instruction without a native lowering.
    Other,
    /// Undefined encoding.
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestInst {
    /// (E)IP of the first byte.
    pub ip: u32,
    pub len: u8,
    /// Width of the operation: the operand width for data operations, the operand-size
    /// attribute for stack and control transfers.
    pub width: Width,
    pub kind: InstKind,
}

impl GuestInst {
    pub fn next_ip(&self, code32: bool) -> u32 {
        let next = self.ip.wrapping_add(u32::from(self.len));
        if code32 {
            next
        } else {
            next & 0xFFFF
        }
    }

    /// Whether the instruction ends translation of the block it appears in.
    pub fn ends_block(&self) -> bool {
        matches!(
            self.kind,
            InstKind::Jmp { .. }
                | InstKind::Jcc { .. }
                | InstKind::Call { .. }
                | InstKind::Ret { .. }
                | InstKind::Iret
                | InstKind::Callback { .. }
                | InstKind::Other
                | InstKind::Invalid
        )
    }
}
