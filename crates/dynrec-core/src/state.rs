//! Architectural CPU state shared between the dispatcher, translated code and the interpreter.
//!
//! [`CpuState`] is `#[repr(C)]`: native blocks address its fields through the `CPU_*_OFF`
//! constants below, relative to a pinned base register.

use core::mem::{offset_of, size_of};

use dynrec_x86::{Gpr, Reg, Seg, Width};

pub const FLAG_CF: u32 = 1 << 0;
pub const FLAG_PF: u32 = 1 << 2;
pub const FLAG_AF: u32 = 1 << 4;
pub const FLAG_ZF: u32 = 1 << 6;
pub const FLAG_SF: u32 = 1 << 7;
pub const FLAG_TF: u32 = 1 << 8;
pub const FLAG_IF: u32 = 1 << 9;
pub const FLAG_DF: u32 = 1 << 10;
pub const FLAG_OF: u32 = 1 << 11;

/// Bit 1 of EFLAGS always reads as one.
pub const FLAG_RESERVED1: u32 = 1 << 1;

/// Status flags written by arithmetic.
pub const FLAGS_OSZAPC: u32 = FLAG_OF | FLAG_SF | FLAG_ZF | FLAG_AF | FLAG_PF | FLAG_CF;

/// Flags `IRET` may load in real mode, per operand size.
pub const IRET_MASK_16: u32 = 0x7FD5;
pub const IRET_MASK_32: u32 = 0x0025_7FD5;

pub const VECTOR_DIVIDE_ERROR: u8 = 0;
pub const VECTOR_DEBUG: u8 = 1;
pub const VECTOR_PAGE_FAULT: u8 = 14;

#[derive(Debug, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct CpuState {
    /// EAX..EDI in encoding order.
    pub regs: [u32; 8],
    pub eip: u32,
    pub eflags: u32,
    pub seg_base: [u32; 6],
    pub seg_sel: [u16; 6],
    /// Remaining cycle budget of the current scheduler slice. Translated code checks it on block
    /// entry and subtracts executed instructions at each exit.
    pub cycles: i32,
    /// Cycles parked while a single instruction is forced through the interpreter.
    pub cycle_left: i32,
    /// 32-bit code segment.
    pub code_big: bool,
    /// 32-bit stack segment.
    pub stack_big: bool,
    pub protected_mode: bool,
    /// Set by the interpreter when the single step it just took must not raise `#DB`.
    pub trap_skip: bool,
}

pub const CPU_REG_OFF: [usize; 8] = {
    let base = offset_of!(CpuState, regs);
    let mut out = [0usize; 8];
    let mut i = 0;
    while i < 8 {
        out[i] = base + i * 4;
        i += 1;
    }
    out
};
pub const CPU_EIP_OFF: usize = offset_of!(CpuState, eip);
pub const CPU_EFLAGS_OFF: usize = offset_of!(CpuState, eflags);
pub const CPU_SEG_BASE_OFF: [usize; 6] = {
    let base = offset_of!(CpuState, seg_base);
    let mut out = [0usize; 6];
    let mut i = 0;
    while i < 6 {
        out[i] = base + i * 4;
        i += 1;
    }
    out
};
pub const CPU_CYCLES_OFF: usize = offset_of!(CpuState, cycles);
pub const CPU_STATE_SIZE: usize = size_of::<CpuState>();

// Native code addresses fields with 32-bit displacements.
const _: () = assert!(CPU_STATE_SIZE < i32::MAX as usize);

impl Default for CpuState {
    fn default() -> Self {
        Self::new_real_mode()
    }
}

impl CpuState {
    /// 16-bit real mode, all segments at zero.
    pub fn new_real_mode() -> Self {
        Self {
            regs: [0; 8],
            eip: 0,
            eflags: FLAG_RESERVED1,
            seg_base: [0; 6],
            seg_sel: [0; 6],
            cycles: 0,
            cycle_left: 0,
            code_big: false,
            stack_big: false,
            protected_mode: false,
            trap_skip: false,
        }
    }

    /// Flat 32-bit protected mode (zero-based 4 GiB segments).
    pub fn new_flat32() -> Self {
        Self {
            code_big: true,
            stack_big: true,
            protected_mode: true,
            ..Self::new_real_mode()
        }
    }

    pub fn reg(&self, reg: Reg) -> u32 {
        let full = self.regs[reg.gpr.index()];
        match (reg.width, reg.high8) {
            (Width::W8, true) => (full >> 8) & 0xFF,
            (width, _) => full & width.mask(),
        }
    }

    pub fn set_reg(&mut self, reg: Reg, value: u32) {
        let slot = &mut self.regs[reg.gpr.index()];
        *slot = match (reg.width, reg.high8) {
            (Width::W8, true) => (*slot & !0xFF00) | ((value & 0xFF) << 8),
            (width, _) => (*slot & !width.mask()) | (value & width.mask()),
        };
    }

    pub fn gpr(&self, gpr: Gpr) -> u32 {
        self.regs[gpr.index()]
    }

    pub fn set_gpr(&mut self, gpr: Gpr, value: u32) {
        self.regs[gpr.index()] = value;
    }

    pub fn get_flag(&self, mask: u32) -> bool {
        self.eflags & mask != 0
    }

    pub fn set_flag(&mut self, mask: u32, on: bool) {
        if on {
            self.eflags |= mask;
        } else {
            self.eflags &= !mask;
        }
    }

    /// Loads a segment register with real-mode semantics (`base = selector << 4`).
    pub fn load_real_segment(&mut self, seg: Seg, selector: u16) {
        self.seg_sel[seg.index()] = selector;
        self.seg_base[seg.index()] = u32::from(selector) << 4;
    }

    /// Linear address of CS:EIP.
    pub fn ip_linear(&self) -> u32 {
        self.seg_base[Seg::Cs.index()].wrapping_add(self.eip)
    }

    pub fn ip_mask(&self) -> u32 {
        if self.code_big {
            u32::MAX
        } else {
            0xFFFF
        }
    }

    pub fn stack_width(&self) -> Width {
        if self.stack_big {
            Width::W32
        } else {
            Width::W16
        }
    }
}
