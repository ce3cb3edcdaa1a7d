//! The micro-operation catalog translated blocks are built from.
//!
//! The translator lowers guest instructions into a flat list of [`MicroOp`]s over three
//! temporaries; a [`crate::backend::HostEmitter`] turns that list into host code. Temporaries are
//! 32 bits wide. Operations narrower than 32 bits only define the low `width` bits of their
//! destination; consumers read temporaries at the same width they were produced.

use std::fmt;

use dynrec_x86::{Address, AluOp, Cond, Reg, Seg, UnaryOp, Width};

use crate::cache::BlockId;
use crate::error::DynrecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tmp {
    T0,
    T1,
    T2,
}

impl Tmp {
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// A jump target inside one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub(crate) u32);

impl Label {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Why a translated block handed control back to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BlockReturn {
    /// Continue at `CS:EIP`.
    Normal = 0,
    /// Cycle budget exhausted.
    Cycles = 1,
    /// Unlinked exit through link slot 0 (fall-through or unconditional target).
    Link1 = 2,
    /// Unlinked exit through link slot 1 (taken branch).
    Link2 = 3,
    /// Next instruction must be run by the interpreter.
    Opcode = 4,
    /// Like `Opcode`, with the interpreter's full decoder.
    OpcodeFull = 5,
    /// Returned from an interrupt; pending interrupts and the trap flag need a look.
    Iret = 6,
    /// Platform callback requested; its number is in the frame.
    Callback = 7,
    /// A store hit the running block. The store was not performed.
    SmcBlock = 8,
}

impl BlockReturn {
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => BlockReturn::Normal,
            1 => BlockReturn::Cycles,
            2 => BlockReturn::Link1,
            3 => BlockReturn::Link2,
            4 => BlockReturn::Opcode,
            5 => BlockReturn::OpcodeFull,
            6 => BlockReturn::Iret,
            7 => BlockReturn::Callback,
            8 => BlockReturn::SmcBlock,
            _ => return None,
        })
    }

    /// Decodes a block's exit code; anything unknown means the generated code is broken.
    pub fn decode(raw: u32) -> Result<Self, DynrecError> {
        Self::from_raw(raw).ok_or(DynrecError::InvalidReturn(raw))
    }

    pub const fn raw(self) -> u32 {
        self as u32
    }

    /// Exit code of link slot `slot`'s stub.
    pub const fn for_link_slot(slot: usize) -> Self {
        if slot == 0 {
            BlockReturn::Link1
        } else {
            BlockReturn::Link2
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicroOp {
    /// Block prologue: publish `block` as the running block, leave with `Cycles` if the budget
    /// is used up.
    Enter { block: BlockId },
    LoadImm { dst: Tmp, value: u32 },
    /// Reads an immediate from guest physical memory when the block runs.
    LoadPhys {
        dst: Tmp,
        paddr: u32,
        width: Width,
        sign_extend: bool,
    },
    /// Zero-extending register read.
    LoadReg { dst: Tmp, reg: Reg },
    StoreReg { reg: Reg, src: Tmp },
    Mov { dst: Tmp, src: Tmp },
    /// 32-bit wrapping add, no flags.
    AddImm { dst: Tmp, value: u32 },
    AndImm { dst: Tmp, value: u32 },
    /// Effective address (offset only) of `addr`.
    Lea { dst: Tmp, addr: Address },
    AddSegBase { dst: Tmp, seg: Seg },
    /// `dst = dst op src` with guest flags updated; `CMP`/`TEST` leave `dst` alone.
    Alu {
        op: AluOp,
        width: Width,
        dst: Tmp,
        src: Tmp,
    },
    Unary { op: UnaryOp, width: Width, dst: Tmp },
    /// Guest linear load.
    Load { dst: Tmp, addr: Tmp, width: Width },
    /// Guest linear store, checked against the code page monitors.
    Store { addr: Tmp, src: Tmp, width: Width },
    CallDiv {
        width: Width,
        signed: bool,
        divisor: Tmp,
    },
    /// Runs the instruction at the current EIP in the interpreter; the block goes on at
    /// `next_eip` if the interpreter ends up there.
    CallInterpret { next_eip: u32 },
    /// Real-mode `IRET`.
    CallIret { width: Width },
    SubCycles(u32),
    SetEip(u32),
    StoreEip { src: Tmp },
    SetCallback(u32),
    JumpIf { cond: Cond, label: Label },
    Bind(Label),
    Exit(BlockReturn),
    /// Leave through link slot `slot`; `entry` is the address of the block's link table entry.
    Link { slot: usize, entry: usize },
}

impl MicroOp {
    /// Whether the op may call into the runtime and therefore needs an up-to-date EIP.
    pub fn calls_helper(&self) -> bool {
        matches!(
            self,
            MicroOp::LoadPhys { .. }
                | MicroOp::Load { .. }
                | MicroOp::Store { .. }
                | MicroOp::CallDiv { .. }
                | MicroOp::CallInterpret { .. }
                | MicroOp::CallIret { .. }
        )
    }
}

/// Micro-ops of one block in emission order.
#[derive(Debug, Default, Clone)]
pub struct BlockIr {
    ops: Vec<MicroOp>,
    labels: u32,
}

impl BlockIr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn label(&mut self) -> Label {
        let label = Label(self.labels);
        self.labels += 1;
        label
    }

    pub fn push(&mut self, op: MicroOp) {
        self.ops.push(op);
    }

    pub fn ops(&self) -> &[MicroOp] {
        &self.ops
    }

    pub fn label_count(&self) -> usize {
        self.labels as usize
    }
}

impl fmt::Display for BlockIr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for op in &self.ops {
            writeln!(f, "{op:?}")?;
        }
        Ok(())
    }
}
