//! Host-independent backend.
//!
//! Blocks are stored in the arena as a byte encoding of their micro-ops (one opcode byte plus
//! little-endian operands) and run by [`PortableEmitter::execute`]. Control flow uses absolute
//! host addresses exactly like native code does, so block linking, exit stubs and the cache
//! allocator behave the same for both backends.

use std::sync::atomic::{AtomicUsize, Ordering};

use dynrec_x86::{Address, AluOp, Cond, Gpr, Reg, Seg, UnaryOp, Width};

use super::{
    helper_div, helper_interpret, helper_iret, helper_load, helper_load_phys, helper_store,
    width_flag_arg, CodeWriter, EmitError, HostEmitter, JitFrame, RuntimeLayout, HELPER_ABORT,
};
use crate::arena::ExecArena;
use crate::cache::BlockId;
use crate::config::BackendKind;
use crate::flags;
use crate::ir::{BlockReturn, Label, Tmp};
use crate::state::CpuState;

mod opc {
    pub const ENTER: u8 = 1;
    pub const LOAD_IMM: u8 = 2;
    pub const LOAD_PHYS: u8 = 3;
    pub const LOAD_REG: u8 = 4;
    pub const STORE_REG: u8 = 5;
    pub const MOV: u8 = 6;
    pub const ADD_IMM: u8 = 7;
    pub const AND_IMM: u8 = 8;
    pub const LEA: u8 = 9;
    pub const ADD_SEG_BASE: u8 = 10;
    pub const ALU: u8 = 11;
    pub const UNARY: u8 = 12;
    pub const LOAD: u8 = 13;
    pub const STORE: u8 = 14;
    pub const DIV: u8 = 15;
    pub const INTERPRET: u8 = 16;
    pub const IRET: u8 = 17;
    pub const SUB_CYCLES: u8 = 18;
    pub const SET_EIP: u8 = 19;
    pub const STORE_EIP: u8 = 20;
    pub const SET_CALLBACK: u8 = 21;
    pub const JUMP_IF: u8 = 22;
    pub const EXIT: u8 = 23;
    pub const LINK: u8 = 24;
}

const NO_REG: u8 = 0xFF;

const ALU_OPS: [AluOp; 9] = [
    AluOp::Add,
    AluOp::Or,
    AluOp::Adc,
    AluOp::Sbb,
    AluOp::And,
    AluOp::Sub,
    AluOp::Xor,
    AluOp::Cmp,
    AluOp::Test,
];
const UNARY_OPS: [UnaryOp; 4] = [UnaryOp::Inc, UnaryOp::Dec, UnaryOp::Neg, UnaryOp::Not];
const SEGS: [Seg; 6] = [Seg::Es, Seg::Cs, Seg::Ss, Seg::Ds, Seg::Fs, Seg::Gs];
const TMPS: [Tmp; 3] = [Tmp::T0, Tmp::T1, Tmp::T2];

fn encode_reg(w: &mut CodeWriter<'_>, reg: Reg) {
    w.emit(&[reg.gpr as u8, reg.width.bytes() as u8, u8::from(reg.high8)]);
}

#[derive(Debug, Default)]
pub struct PortableEmitter {
    labels: Vec<Option<usize>>,
    /// `(u64 position, label)` pairs awaiting their label.
    fixups: Vec<(usize, Label)>,
}

impl PortableEmitter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostEmitter for PortableEmitter {
    fn kind(&self) -> BackendKind {
        BackendKind::Portable
    }

    fn emit_runtime(&mut self, w: &mut CodeWriter<'_>) -> Result<RuntimeLayout, EmitError> {
        let mut exit_stubs = [0; 2];
        for (slot, stub) in exit_stubs.iter_mut().enumerate() {
            *stub = w.addr();
            self.exit(w, BlockReturn::for_link_slot(slot));
        }
        if w.overflowed() {
            return Err(EmitError::StubAreaTooSmall {
                needed: w.pos(),
                available: w.capacity(),
            });
        }
        // Blocks are entered and left directly by the interpreter loop.
        Ok(RuntimeLayout {
            trampoline: 0,
            epilogue: 0,
            exit_stubs,
        })
    }

    fn begin_block(&mut self, _w: &mut CodeWriter<'_>, labels: usize) {
        self.labels.clear();
        self.labels.resize(labels, None);
        self.fixups.clear();
    }

    fn finish_block(&mut self, w: &mut CodeWriter<'_>) -> Result<(), EmitError> {
        for (at, label) in self.fixups.drain(..) {
            let target = self.labels[label.index()].ok_or(EmitError::UnboundLabel(label.0))?;
            let addr = (w.base() + target) as u64;
            w.patch(at, &addr.to_le_bytes());
        }
        Ok(())
    }

    fn enter(&mut self, w: &mut CodeWriter<'_>, block: BlockId) {
        w.u8(opc::ENTER);
        w.u32(block.raw());
    }

    fn load_imm(&mut self, w: &mut CodeWriter<'_>, dst: Tmp, value: u32) {
        w.emit(&[opc::LOAD_IMM, dst as u8]);
        w.u32(value);
    }

    fn load_phys(
        &mut self,
        w: &mut CodeWriter<'_>,
        dst: Tmp,
        paddr: u32,
        width: Width,
        sign_extend: bool,
    ) {
        w.emit(&[opc::LOAD_PHYS, dst as u8]);
        w.u32(paddr);
        w.u16(width_flag_arg(width, sign_extend) as u16);
    }

    fn load_reg(&mut self, w: &mut CodeWriter<'_>, dst: Tmp, reg: Reg) {
        w.emit(&[opc::LOAD_REG, dst as u8]);
        encode_reg(w, reg);
    }

    fn store_reg(&mut self, w: &mut CodeWriter<'_>, reg: Reg, src: Tmp) {
        w.emit(&[opc::STORE_REG, src as u8]);
        encode_reg(w, reg);
    }

    fn mov(&mut self, w: &mut CodeWriter<'_>, dst: Tmp, src: Tmp) {
        w.emit(&[opc::MOV, dst as u8, src as u8]);
    }

    fn add_imm(&mut self, w: &mut CodeWriter<'_>, dst: Tmp, value: u32) {
        w.emit(&[opc::ADD_IMM, dst as u8]);
        w.u32(value);
    }

    fn and_imm(&mut self, w: &mut CodeWriter<'_>, dst: Tmp, value: u32) {
        w.emit(&[opc::AND_IMM, dst as u8]);
        w.u32(value);
    }

    fn lea(&mut self, w: &mut CodeWriter<'_>, dst: Tmp, addr: &Address) {
        w.emit(&[
            opc::LEA,
            dst as u8,
            addr.base.map_or(NO_REG, |g| g as u8),
            addr.index.map_or(NO_REG, |g| g as u8),
            addr.scale,
            u8::from(addr.addr16),
        ]);
        w.u32(addr.disp);
    }

    fn add_seg_base(&mut self, w: &mut CodeWriter<'_>, dst: Tmp, seg: Seg) {
        w.emit(&[opc::ADD_SEG_BASE, dst as u8, seg as u8]);
    }

    fn alu(&mut self, w: &mut CodeWriter<'_>, op: AluOp, width: Width, dst: Tmp, src: Tmp) {
        let index = ALU_OPS.iter().position(|&o| o == op).unwrap_or_default() as u8;
        w.emit(&[opc::ALU, index, width.bytes() as u8, dst as u8, src as u8]);
    }

    fn unary(&mut self, w: &mut CodeWriter<'_>, op: UnaryOp, width: Width, dst: Tmp) {
        let index = UNARY_OPS.iter().position(|&o| o == op).unwrap_or_default() as u8;
        w.emit(&[opc::UNARY, index, width.bytes() as u8, dst as u8]);
    }

    fn load(&mut self, w: &mut CodeWriter<'_>, dst: Tmp, addr: Tmp, width: Width) {
        w.emit(&[opc::LOAD, dst as u8, addr as u8, width.bytes() as u8]);
    }

    fn store(&mut self, w: &mut CodeWriter<'_>, addr: Tmp, src: Tmp, width: Width) {
        w.emit(&[opc::STORE, addr as u8, src as u8, width.bytes() as u8]);
    }

    fn call_div(&mut self, w: &mut CodeWriter<'_>, width: Width, signed: bool, divisor: Tmp) {
        w.emit(&[opc::DIV, divisor as u8]);
        w.u16(width_flag_arg(width, signed) as u16);
    }

    fn call_interpret(&mut self, w: &mut CodeWriter<'_>, next_eip: u32) {
        w.u8(opc::INTERPRET);
        w.u32(next_eip);
    }

    fn call_iret(&mut self, w: &mut CodeWriter<'_>, width: Width) {
        w.emit(&[opc::IRET, width.bytes() as u8]);
    }

    fn sub_cycles(&mut self, w: &mut CodeWriter<'_>, n: u32) {
        w.u8(opc::SUB_CYCLES);
        w.u32(n);
    }

    fn set_eip(&mut self, w: &mut CodeWriter<'_>, eip: u32) {
        w.u8(opc::SET_EIP);
        w.u32(eip);
    }

    fn store_eip(&mut self, w: &mut CodeWriter<'_>, src: Tmp) {
        w.emit(&[opc::STORE_EIP, src as u8]);
    }

    fn set_callback(&mut self, w: &mut CodeWriter<'_>, n: u32) {
        w.u8(opc::SET_CALLBACK);
        w.u32(n);
    }

    fn jump_if(&mut self, w: &mut CodeWriter<'_>, cond: Cond, label: Label) {
        w.emit(&[opc::JUMP_IF, cond.code()]);
        self.fixups.push((w.pos(), label));
        w.u64(0);
    }

    fn bind(&mut self, w: &mut CodeWriter<'_>, label: Label) {
        self.labels[label.index()] = Some(w.pos());
    }

    fn exit(&mut self, w: &mut CodeWriter<'_>, code: BlockReturn) {
        w.u8(opc::EXIT);
        w.u32(code.raw());
    }

    fn link(&mut self, w: &mut CodeWriter<'_>, slot: usize, entry: usize) {
        w.emit(&[opc::LINK, slot as u8]);
        w.u64(entry as u64);
    }

    unsafe fn execute(
        &self,
        arena: &ExecArena,
        _layout: &RuntimeLayout,
        entry: usize,
        cpu: *mut CpuState,
        frame: *mut JitFrame<'_>,
    ) -> u32 {
        let code = arena.code();
        let base = arena.base_addr();
        let Some(pc) = entry.checked_sub(base) else {
            return u32::MAX;
        };
        // Malformed code surfaces as an exit code the dispatcher rejects.
        run(code, base, pc, cpu, frame).unwrap_or(u32::MAX)
    }
}

struct Reader<'a> {
    code: &'a [u8],
    pc: usize,
}

impl Reader<'_> {
    fn bytes<const N: usize>(&mut self) -> Option<[u8; N]> {
        let out = self.code.get(self.pc..self.pc + N)?.try_into().ok()?;
        self.pc += N;
        Some(out)
    }

    fn u8(&mut self) -> Option<u8> {
        self.bytes::<1>().map(|[b]| b)
    }

    fn u16(&mut self) -> Option<u16> {
        self.bytes().map(u16::from_le_bytes)
    }

    fn u32(&mut self) -> Option<u32> {
        self.bytes().map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> Option<u64> {
        self.bytes().map(u64::from_le_bytes)
    }

    fn tmp(&mut self) -> Option<usize> {
        let t = *TMPS.get(usize::from(self.u8()?))?;
        Some(t.index())
    }

    fn width(&mut self) -> Option<Width> {
        Width::from_bytes(u32::from(self.u8()?))
    }

    fn gpr(&mut self) -> Option<Gpr> {
        Gpr::ALL.get(usize::from(self.u8()?)).copied()
    }

    fn opt_gpr(&mut self) -> Option<Option<Gpr>> {
        match self.u8()? {
            NO_REG => Some(None),
            g => Gpr::ALL.get(usize::from(g)).copied().map(Some),
        }
    }

    fn reg(&mut self) -> Option<Reg> {
        let gpr = self.gpr()?;
        let width = self.width()?;
        let high8 = self.u8()? != 0;
        Some(Reg { gpr, width, high8 })
    }

    fn addr(&mut self) -> Option<usize> {
        self.u64().map(|a| a as usize)
    }
}

/// Converts a helper's return value into the block's next step.
fn helper_result(ret: u64, frame: *mut JitFrame<'_>) -> Result<u32, u32> {
    if ret & HELPER_ABORT != 0 {
        // SAFETY: `frame` is valid for the whole run (see `execute`).
        Err(unsafe { (*frame).pending_exit })
    } else {
        Ok(ret as u32)
    }
}

/// Interprets from arena offset `pc` until the block exits.
///
/// # Safety
///
/// Same contract as [`HostEmitter::execute`]. `cpu` is only accessed through short-lived place
/// expressions because the helpers reach the same state through the frame's environment.
unsafe fn run(
    code: &[u8],
    base: usize,
    pc: usize,
    cpu: *mut CpuState,
    frame: *mut JitFrame<'_>,
) -> Option<u32> {
    let mut r = Reader { code, pc };
    let mut t = [0u32; 3];
    let fp = frame.cast();

    macro_rules! call {
        ($e:expr) => {
            match helper_result($e, frame) {
                Ok(v) => v,
                Err(code) => return Some(code),
            }
        };
    }

    loop {
        match r.u8()? {
            opc::ENTER => {
                (*frame).running = r.u32()?;
                if (*cpu).cycles <= 0 {
                    return Some(BlockReturn::Cycles.raw());
                }
            }
            opc::LOAD_IMM => {
                let dst = r.tmp()?;
                t[dst] = r.u32()?;
            }
            opc::LOAD_PHYS => {
                let dst = r.tmp()?;
                let paddr = r.u32()?;
                let arg = u32::from(r.u16()?);
                t[dst] = helper_load_phys(fp, paddr, arg) as u32;
            }
            opc::LOAD_REG => {
                let dst = r.tmp()?;
                let reg = r.reg()?;
                t[dst] = (*cpu).reg(reg);
            }
            opc::STORE_REG => {
                let src = r.tmp()?;
                let reg = r.reg()?;
                (*cpu).set_reg(reg, t[src]);
            }
            opc::MOV => {
                let dst = r.tmp()?;
                t[dst] = t[r.tmp()?];
            }
            opc::ADD_IMM => {
                let dst = r.tmp()?;
                t[dst] = t[dst].wrapping_add(r.u32()?);
            }
            opc::AND_IMM => {
                let dst = r.tmp()?;
                t[dst] &= r.u32()?;
            }
            opc::LEA => {
                let dst = r.tmp()?;
                let base_reg = r.opt_gpr()?;
                let index = r.opt_gpr()?;
                let scale = u32::from(r.u8()?);
                let addr16 = r.u8()? != 0;
                let mut ea = r.u32()?;
                if let Some(g) = base_reg {
                    ea = ea.wrapping_add((*cpu).gpr(g));
                }
                if let Some(g) = index {
                    ea = ea.wrapping_add((*cpu).gpr(g).wrapping_mul(scale));
                }
                if addr16 {
                    ea &= 0xFFFF;
                }
                t[dst] = ea;
            }
            opc::ADD_SEG_BASE => {
                let dst = r.tmp()?;
                let seg = *SEGS.get(usize::from(r.u8()?))?;
                t[dst] = t[dst].wrapping_add((*cpu).seg_base[seg.index()]);
            }
            opc::ALU => {
                let op = *ALU_OPS.get(usize::from(r.u8()?))?;
                let width = r.width()?;
                let dst = r.tmp()?;
                let src = r.tmp()?;
                let (result, eflags) = flags::alu(op, width, t[dst], t[src], (*cpu).eflags);
                if op.writes_result() {
                    t[dst] = result;
                }
                (*cpu).eflags = eflags;
            }
            opc::UNARY => {
                let op = *UNARY_OPS.get(usize::from(r.u8()?))?;
                let width = r.width()?;
                let dst = r.tmp()?;
                let (result, eflags) = flags::unary(op, width, t[dst], (*cpu).eflags);
                t[dst] = result;
                (*cpu).eflags = eflags;
            }
            opc::LOAD => {
                let dst = r.tmp()?;
                let addr = r.tmp()?;
                let width = r.width()?;
                t[dst] = call!(helper_load(fp, t[addr], width.bytes()));
            }
            opc::STORE => {
                let addr = r.tmp()?;
                let src = r.tmp()?;
                let width = r.width()?;
                call!(helper_store(fp, t[addr], t[src], width.bytes()));
            }
            opc::DIV => {
                let divisor = r.tmp()?;
                let arg = u32::from(r.u16()?);
                call!(helper_div(fp, t[divisor], arg));
            }
            opc::INTERPRET => {
                let next = r.u32()?;
                call!(helper_interpret(fp, next));
            }
            opc::IRET => {
                let width = u32::from(r.u8()?);
                call!(helper_iret(fp, width));
            }
            opc::SUB_CYCLES => {
                let n = r.u32()?;
                (*cpu).cycles = (*cpu).cycles.wrapping_sub(n as i32);
            }
            opc::SET_EIP => (*cpu).eip = r.u32()?,
            opc::STORE_EIP => (*cpu).eip = t[r.tmp()?],
            opc::SET_CALLBACK => (*frame).callback = r.u32()?,
            opc::JUMP_IF => {
                let cond = Cond::from_code(r.u8()?)?;
                let target = r.addr()?;
                if cond.holds((*cpu).eflags) {
                    r.pc = target.checked_sub(base)?;
                }
            }
            opc::EXIT => return r.u32(),
            opc::LINK => {
                let _slot = r.u8()?;
                let entry = r.addr()?;
                // SAFETY: link table entries outlive every block that references them.
                let target = (*(entry as *const AtomicUsize)).load(Ordering::Relaxed);
                r.pc = target.checked_sub(base)?;
            }
            _ => return None,
        }
    }
}
