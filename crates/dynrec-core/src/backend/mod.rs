//! Host code generation.
//!
//! A [`HostEmitter`] turns the micro-ops of a block into bytes in the code cache arena and knows
//! how to run them. Two backends exist:
//!
//! - [`x64`]: native x86-64 machine code (x86-64 unix hosts).
//! - [`portable`]: a compact threaded encoding of the same micro-ops, run by a small interpreter.
//!   Works on every host and is what most tests drive.
//!
//! Both share the runtime ABI defined here: a [`JitFrame`] per block run and a set of
//! `extern "C"` helpers generated code calls for memory accesses and slow paths.

use std::ffi::c_void;

use dynrec_x86::{Address, AluOp, Cond, Reg, Seg, UnaryOp, Width};
use thiserror::Error;

use crate::arena::ExecArena;
use crate::cache::BlockId;
use crate::config::BackendKind;
use crate::ir::{BlockIr, BlockReturn, Label, MicroOp, Tmp};
use crate::state::CpuState;

pub mod portable;
#[cfg(all(target_arch = "x86_64", unix))]
pub mod x64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EmitError {
    #[error("label {0} used but never bound")]
    UnboundLabel(u32),
    #[error("branch displacement out of range")]
    BranchRange,
    #[error("runtime stubs need {needed} bytes, stub area holds {available}")]
    StubAreaTooSmall { needed: usize, available: usize },
}

/// Append-only cursor over a writable arena range.
///
/// Writing past the end is recorded rather than rejected: the position keeps advancing so the
/// caller can report how far the block overran.
pub struct CodeWriter<'a> {
    buf: &'a mut [u8],
    base: usize,
    pos: usize,
}

impl<'a> CodeWriter<'a> {
    /// `base` is the host address of `buf[0]`.
    pub fn new(buf: &'a mut [u8], base: usize) -> Self {
        Self { buf, base, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Host address of the next byte.
    pub fn addr(&self) -> usize {
        self.base + self.pos
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn overflowed(&self) -> bool {
        self.pos > self.buf.len()
    }

    pub fn emit(&mut self, bytes: &[u8]) {
        let end = self.pos + bytes.len();
        if end <= self.buf.len() {
            self.buf[self.pos..end].copy_from_slice(bytes);
        }
        self.pos = end;
    }

    pub fn u8(&mut self, v: u8) {
        self.emit(&[v]);
    }

    pub fn u16(&mut self, v: u16) {
        self.emit(&v.to_le_bytes());
    }

    pub fn u32(&mut self, v: u32) {
        self.emit(&v.to_le_bytes());
    }

    pub fn u64(&mut self, v: u64) {
        self.emit(&v.to_le_bytes());
    }

    /// Overwrites bytes at `at`; ignored if that part of the buffer was never written.
    pub fn patch(&mut self, at: usize, bytes: &[u8]) {
        if let Some(dst) = self.buf.get_mut(at..at + bytes.len()) {
            dst.copy_from_slice(bytes);
        }
    }
}

/// Host addresses of the shared runtime code in the arena's stub area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeLayout {
    /// Entry from Rust into a block.
    pub trampoline: usize,
    /// Return path from a block back to Rust.
    pub epilogue: usize,
    /// Stubs returning `Link1`/`Link2`; unlinked link table entries point here.
    pub exit_stubs: [usize; 2],
}

/// A host code generator and executor.
///
/// Emission methods append the host form of one micro-op. Forward label uses are resolved in
/// [`HostEmitter::finish_block`].
pub trait HostEmitter {
    fn kind(&self) -> BackendKind;

    /// Writes the trampoline, epilogue and link exit stubs.
    fn emit_runtime(&mut self, w: &mut CodeWriter<'_>) -> Result<RuntimeLayout, EmitError>;

    fn begin_block(&mut self, w: &mut CodeWriter<'_>, labels: usize);
    fn finish_block(&mut self, w: &mut CodeWriter<'_>) -> Result<(), EmitError>;

    fn enter(&mut self, w: &mut CodeWriter<'_>, block: BlockId);
    fn load_imm(&mut self, w: &mut CodeWriter<'_>, dst: Tmp, value: u32);
    fn load_phys(
        &mut self,
        w: &mut CodeWriter<'_>,
        dst: Tmp,
        paddr: u32,
        width: Width,
        sign_extend: bool,
    );
    fn load_reg(&mut self, w: &mut CodeWriter<'_>, dst: Tmp, reg: Reg);
    fn store_reg(&mut self, w: &mut CodeWriter<'_>, reg: Reg, src: Tmp);
    fn mov(&mut self, w: &mut CodeWriter<'_>, dst: Tmp, src: Tmp);
    fn add_imm(&mut self, w: &mut CodeWriter<'_>, dst: Tmp, value: u32);
    fn and_imm(&mut self, w: &mut CodeWriter<'_>, dst: Tmp, value: u32);
    fn lea(&mut self, w: &mut CodeWriter<'_>, dst: Tmp, addr: &Address);
    fn add_seg_base(&mut self, w: &mut CodeWriter<'_>, dst: Tmp, seg: Seg);
    fn alu(&mut self, w: &mut CodeWriter<'_>, op: AluOp, width: Width, dst: Tmp, src: Tmp);
    fn unary(&mut self, w: &mut CodeWriter<'_>, op: UnaryOp, width: Width, dst: Tmp);
    fn load(&mut self, w: &mut CodeWriter<'_>, dst: Tmp, addr: Tmp, width: Width);
    fn store(&mut self, w: &mut CodeWriter<'_>, addr: Tmp, src: Tmp, width: Width);
    fn call_div(&mut self, w: &mut CodeWriter<'_>, width: Width, signed: bool, divisor: Tmp);
    fn call_interpret(&mut self, w: &mut CodeWriter<'_>, next_eip: u32);
    fn call_iret(&mut self, w: &mut CodeWriter<'_>, width: Width);
    fn sub_cycles(&mut self, w: &mut CodeWriter<'_>, n: u32);
    fn set_eip(&mut self, w: &mut CodeWriter<'_>, eip: u32);
    fn store_eip(&mut self, w: &mut CodeWriter<'_>, src: Tmp);
    fn set_callback(&mut self, w: &mut CodeWriter<'_>, n: u32);
    fn jump_if(&mut self, w: &mut CodeWriter<'_>, cond: Cond, label: Label);
    fn bind(&mut self, w: &mut CodeWriter<'_>, label: Label);
    fn exit(&mut self, w: &mut CodeWriter<'_>, code: BlockReturn);
    fn link(&mut self, w: &mut CodeWriter<'_>, slot: usize, entry: usize);

    /// Runs generated code starting at `entry` until it leaves; returns the raw exit code.
    ///
    /// # Safety
    ///
    /// `entry` must be the start of a block emitted by this backend into `arena`, and `layout`
    /// the runtime this backend emitted there. `cpu` and `frame` must be valid for the duration
    /// of the call, and `frame.env` must point at a live [`HelperEnv`].
    unsafe fn execute(
        &self,
        arena: &ExecArena,
        layout: &RuntimeLayout,
        entry: usize,
        cpu: *mut CpuState,
        frame: *mut JitFrame<'_>,
    ) -> u32;
}

/// Emits every micro-op of `ir` through `emitter`.
pub fn lower_block(
    ir: &BlockIr,
    emitter: &mut dyn HostEmitter,
    w: &mut CodeWriter<'_>,
) -> Result<(), EmitError> {
    emitter.begin_block(w, ir.label_count());
    for op in ir.ops() {
        match *op {
            MicroOp::Enter { block } => emitter.enter(w, block),
            MicroOp::LoadImm { dst, value } => emitter.load_imm(w, dst, value),
            MicroOp::LoadPhys {
                dst,
                paddr,
                width,
                sign_extend,
            } => emitter.load_phys(w, dst, paddr, width, sign_extend),
            MicroOp::LoadReg { dst, reg } => emitter.load_reg(w, dst, reg),
            MicroOp::StoreReg { reg, src } => emitter.store_reg(w, reg, src),
            MicroOp::Mov { dst, src } => emitter.mov(w, dst, src),
            MicroOp::AddImm { dst, value } => emitter.add_imm(w, dst, value),
            MicroOp::AndImm { dst, value } => emitter.and_imm(w, dst, value),
            MicroOp::Lea { dst, ref addr } => emitter.lea(w, dst, addr),
            MicroOp::AddSegBase { dst, seg } => emitter.add_seg_base(w, dst, seg),
            MicroOp::Alu {
                op,
                width,
                dst,
                src,
            } => emitter.alu(w, op, width, dst, src),
            MicroOp::Unary { op, width, dst } => emitter.unary(w, op, width, dst),
            MicroOp::Load { dst, addr, width } => emitter.load(w, dst, addr, width),
            MicroOp::Store { addr, src, width } => emitter.store(w, addr, src, width),
            MicroOp::CallDiv {
                width,
                signed,
                divisor,
            } => emitter.call_div(w, width, signed, divisor),
            MicroOp::CallInterpret { next_eip } => emitter.call_interpret(w, next_eip),
            MicroOp::CallIret { width } => emitter.call_iret(w, width),
            MicroOp::SubCycles(n) => emitter.sub_cycles(w, n),
            MicroOp::SetEip(eip) => emitter.set_eip(w, eip),
            MicroOp::StoreEip { src } => emitter.store_eip(w, src),
            MicroOp::SetCallback(n) => emitter.set_callback(w, n),
            MicroOp::JumpIf { cond, label } => emitter.jump_if(w, cond, label),
            MicroOp::Bind(label) => emitter.bind(w, label),
            MicroOp::Exit(code) => emitter.exit(w, code),
            MicroOp::Link { slot, entry } => emitter.link(w, slot, entry),
        }
    }
    emitter.finish_block(w)
}

/// Builds the emitter for `kind`.
pub fn new_emitter(kind: BackendKind) -> Box<dyn HostEmitter> {
    match kind {
        #[cfg(all(target_arch = "x86_64", unix))]
        BackendKind::Native => Box::new(x64::X64Emitter::new()),
        #[cfg(not(all(target_arch = "x86_64", unix)))]
        BackendKind::Native => {
            tracing::warn!("native backend unavailable on this host, using the portable one");
            Box::new(portable::PortableEmitter::new())
        }
        BackendKind::Portable => Box::new(portable::PortableEmitter::new()),
    }
}

/// Per-run scratch area shared between generated code and the helpers.
///
/// Native code addresses the first three fields through the `*_OFFSET` constants; `env` is only
/// touched from Rust.
#[repr(C)]
pub struct JitFrame<'a> {
    /// Raw [`BlockId`] of the block currently executing, `u32::MAX` before the first one.
    pub running: u32,
    /// Exit code a helper wants the block to leave with when it reports an abort.
    pub pending_exit: u32,
    /// Callback number for [`BlockReturn::Callback`].
    pub callback: u32,
    _pad: u32,
    pub(crate) env: *mut (dyn HelperEnv + 'a),
}

impl<'a> JitFrame<'a> {
    pub const RUNNING_OFFSET: u32 = 0;
    pub const PENDING_EXIT_OFFSET: u32 = 4;
    pub const CALLBACK_OFFSET: u32 = 8;

    pub(crate) fn new(env: *mut (dyn HelperEnv + 'a)) -> Self {
        Self {
            running: u32::MAX,
            pending_exit: BlockReturn::Normal.raw(),
            callback: 0,
            _pad: 0,
            env,
        }
    }

    pub fn running_block(&self) -> Option<BlockId> {
        BlockId::from_raw(self.running)
    }
}

/// What the helpers need from the dispatcher while a block runs.
///
/// Errors carry the exit code the block must leave with; the guest-visible side (exception
/// delivery, statistics) has already happened when they are returned.
pub(crate) trait HelperEnv {
    fn load(&mut self, linear: u32, width: Width) -> Result<u32, BlockReturn>;
    fn store(
        &mut self,
        linear: u32,
        width: Width,
        value: u32,
        running: Option<BlockId>,
    ) -> Result<(), BlockReturn>;
    fn load_phys(&mut self, paddr: u32, width: Width) -> u32;
    fn divide(&mut self, width: Width, signed: bool, divisor: u32) -> Result<(), BlockReturn>;
    fn interpret(&mut self, next_eip: u32, running: Option<BlockId>) -> Result<(), BlockReturn>;
    fn iret(&mut self, width: Width) -> Result<(), BlockReturn>;
}

/// Set in a helper's return value when the block must leave with `frame.pending_exit`.
pub const HELPER_ABORT: u64 = 1 << 32;

fn width_arg(raw: u32) -> Width {
    match raw & 0xFF {
        1 => Width::W8,
        2 => Width::W16,
        _ => Width::W32,
    }
}

/// Packs a width and a flag into one helper argument.
pub(crate) const fn width_flag_arg(width: Width, flag: bool) -> u32 {
    width.bytes() | ((flag as u32) << 8)
}

/// # Safety
///
/// `frame` must point at a live [`JitFrame`] whose `env` is valid.
unsafe fn with_env<R>(
    frame: *mut c_void,
    f: impl FnOnce(&mut dyn HelperEnv, Option<BlockId>) -> R,
) -> R {
    let frame = &mut *frame.cast::<JitFrame<'_>>();
    let running = frame.running_block();
    f(&mut *frame.env, running)
}

fn finish(frame: *mut c_void, result: Result<u32, BlockReturn>) -> u64 {
    match result {
        Ok(value) => u64::from(value),
        Err(code) => {
            // SAFETY: only called from the helpers below with their (valid) frame argument.
            unsafe { (*frame.cast::<JitFrame<'_>>()).pending_exit = code.raw() };
            HELPER_ABORT
        }
    }
}

pub(crate) unsafe extern "C" fn helper_load(frame: *mut c_void, addr: u32, width: u32) -> u64 {
    let result = with_env(frame, |env, _| env.load(addr, width_arg(width)));
    finish(frame, result)
}

pub(crate) unsafe extern "C" fn helper_store(
    frame: *mut c_void,
    addr: u32,
    value: u32,
    width: u32,
) -> u64 {
    let result = with_env(frame, |env, running| {
        env.store(addr, width_arg(width), value, running)
    });
    finish(frame, result.map(|()| 0))
}

/// `arg` is [`width_flag_arg`] with the sign-extend flag.
pub(crate) unsafe extern "C" fn helper_load_phys(frame: *mut c_void, paddr: u32, arg: u32) -> u64 {
    let width = width_arg(arg);
    let value = with_env(frame, |env, _| env.load_phys(paddr, width));
    let value = if arg >> 8 != 0 {
        width.sign_extend(value)
    } else {
        value
    };
    u64::from(value)
}

/// `arg` is [`width_flag_arg`] with the signed flag.
pub(crate) unsafe extern "C" fn helper_div(frame: *mut c_void, divisor: u32, arg: u32) -> u64 {
    let result = with_env(frame, |env, _| {
        env.divide(width_arg(arg), arg >> 8 != 0, divisor)
    });
    finish(frame, result.map(|()| 0))
}

pub(crate) unsafe extern "C" fn helper_interpret(frame: *mut c_void, next_eip: u32) -> u64 {
    let result = with_env(frame, |env, running| env.interpret(next_eip, running));
    finish(frame, result.map(|()| 0))
}

pub(crate) unsafe extern "C" fn helper_iret(frame: *mut c_void, width: u32) -> u64 {
    let result = with_env(frame, |env, _| env.iret(width_arg(width)));
    finish(frame, result.map(|()| 0))
}
