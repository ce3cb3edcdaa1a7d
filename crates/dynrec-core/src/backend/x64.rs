//! Native x86-64 backend.
//!
//! Register assignment inside generated code:
//!
//! | host    | use                         |
//! |---------|-----------------------------|
//! | `r15`   | `&mut CpuState`             |
//! | `r14`   | `&mut JitFrame`             |
//! | `rbx`   | `T0`                        |
//! | `r12`   | `T1`                        |
//! | `r13`   | `T2`                        |
//! | `rax`, `rcx`, `rdx`, `rsi`, `rdi` | scratch and helper arguments |
//!
//! All of these except the scratch registers are callee-saved in the System V ABI, so the
//! helpers leave them alone. The trampoline saves them, aligns the stack for helper calls and
//! jumps to the block; every exit path loads its code into `eax` and jumps to the shared
//! epilogue.

use std::ffi::c_void;

use dynrec_x86::{Address, AluOp, Cond, Reg, Seg, UnaryOp, Width};

use super::{
    helper_div, helper_interpret, helper_iret, helper_load, helper_load_phys, helper_store,
    width_flag_arg, CodeWriter, EmitError, HostEmitter, JitFrame, RuntimeLayout,
};
use crate::arena::ExecArena;
use crate::cache::BlockId;
use crate::config::BackendKind;
use crate::ir::{BlockReturn, Label, Tmp};
use crate::state::{
    CpuState, CPU_CYCLES_OFF, CPU_EFLAGS_OFF, CPU_EIP_OFF, CPU_REG_OFF, CPU_SEG_BASE_OFF,
    FLAGS_OSZAPC, FLAG_AF, FLAG_CF,
};

const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RSI: u8 = 6;
const R15: u8 = 15;

const fn tmp_reg(t: Tmp) -> u8 {
    match t {
        Tmp::T0 => 3,
        Tmp::T1 => 12,
        Tmp::T2 => 13,
    }
}

const fn rex(w: bool, r: u8, b: u8) -> u8 {
    0x40 | ((w as u8) << 3) | (((r >> 3) & 1) << 2) | ((b >> 3) & 1)
}

const fn modrm(md: u8, reg: u8, rm: u8) -> u8 {
    (md << 6) | ((reg & 7) << 3) | (rm & 7)
}

type Trampoline = unsafe extern "C" fn(usize, *mut CpuState, *mut c_void) -> u32;

#[derive(Debug, Default)]
pub struct X64Emitter {
    epilogue: usize,
    /// Bound positions of the current block's labels.
    labels: Vec<Option<usize>>,
    /// `(rel32 position, label)` pairs awaiting their label.
    fixups: Vec<(usize, Label)>,
}

impl X64Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// `rel32` from the end of a 4-byte field at the current position to `target`.
    fn rel32_to(w: &CodeWriter<'_>, target: usize) -> u32 {
        (target as i64 - (w.addr() as i64 + 4)) as i32 as u32
    }

    fn jmp_epilogue(&self, w: &mut CodeWriter<'_>) {
        w.u8(0xE9);
        let rel = Self::rel32_to(w, self.epilogue);
        w.u32(rel);
    }

    /// `opcode reg, [r15 + disp32]`.
    fn cpu_field(w: &mut CodeWriter<'_>, opcode: &[u8], reg: u8, disp: usize) {
        w.u8(rex(false, reg, R15));
        w.emit(opcode);
        w.u8(modrm(0b10, reg, R15));
        w.u32(disp as u32);
    }

    fn mov_r32_imm(w: &mut CodeWriter<'_>, reg: u8, value: u32) {
        if reg >= 8 {
            w.u8(rex(false, 0, reg));
        }
        w.u8(0xB8 + (reg & 7));
        w.u32(value);
    }

    /// `mov dst32, src32`.
    fn mov_rr(w: &mut CodeWriter<'_>, dst: u8, src: u8) {
        w.u8(rex(false, src, dst));
        w.u8(0x89);
        w.u8(modrm(0b11, src, dst));
    }

    /// Calls `helper(frame, ...)`; arguments must already be in `esi`/`edx`/`ecx`.
    fn call_helper(&self, w: &mut CodeWriter<'_>, helper: usize, check_abort: bool) {
        // mov rdi, r14
        w.emit(&[0x4C, 0x89, 0xF7]);
        // mov rax, imm64; call rax
        w.emit(&[0x48, 0xB8]);
        w.u64(helper as u64);
        w.emit(&[0xFF, 0xD0]);
        if check_abort {
            // bt rax, 32; jnc over the exit
            w.emit(&[0x48, 0x0F, 0xBA, 0xE0, 0x20]);
            w.emit(&[0x73, 0x09]);
            // mov eax, [r14 + pending_exit]
            w.emit(&[0x41, 0x8B, 0x46, JitFrame::PENDING_EXIT_OFFSET as u8]);
            self.jmp_epilogue(w);
        }
    }

    /// Merges the host status flags in `mask` into the guest EFLAGS, clearing `clear` first.
    fn capture_flags(w: &mut CodeWriter<'_>, mask: u32, clear: u32) {
        // pushfq; pop rax; and eax, mask
        w.emit(&[0x9C, 0x58, 0x25]);
        w.u32(mask);
        // mov ecx, [r15 + eflags]
        Self::cpu_field(w, &[0x8B], RCX, CPU_EFLAGS_OFF);
        // and ecx, !clear; or ecx, eax
        w.emit(&[0x81, 0xE1]);
        w.u32(!clear);
        w.emit(&[0x09, 0xC1]);
        // mov [r15 + eflags], ecx
        Self::cpu_field(w, &[0x89], RCX, CPU_EFLAGS_OFF);
    }

    fn width_prefix(w: &mut CodeWriter<'_>, width: Width) {
        if width == Width::W16 {
            w.u8(0x66);
        }
    }

    fn reg_disp(reg: Reg) -> usize {
        CPU_REG_OFF[reg.gpr.index()] + usize::from(reg.high8)
    }
}

impl HostEmitter for X64Emitter {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn emit_runtime(&mut self, w: &mut CodeWriter<'_>) -> Result<RuntimeLayout, EmitError> {
        let trampoline = w.addr();
        // push rbx, rbp, r12, r13, r14, r15
        w.emit(&[0x53, 0x55, 0x41, 0x54, 0x41, 0x55, 0x41, 0x56, 0x41, 0x57]);
        // sub rsp, 8 (16-byte alignment at helper calls)
        w.emit(&[0x48, 0x83, 0xEC, 0x08]);
        // mov r15, rsi; mov r14, rdx; jmp rdi
        w.emit(&[0x49, 0x89, 0xF7, 0x49, 0x89, 0xD6, 0xFF, 0xE7]);

        let epilogue = w.addr();
        self.epilogue = epilogue;
        w.emit(&[0x48, 0x83, 0xC4, 0x08]);
        // pop r15, r14, r13, r12
        w.emit(&[0x41, 0x5F, 0x41, 0x5E, 0x41, 0x5D, 0x41, 0x5C]);
        // pop rbp, rbx; ret
        w.emit(&[0x5D, 0x5B, 0xC3]);

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
        Ok(RuntimeLayout {
            trampoline,
            epilogue,
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
            let rel = i32::try_from(target as i64 - (at as i64 + 4))
                .map_err(|_| EmitError::BranchRange)?;
            w.patch(at, &rel.to_le_bytes());
        }
        Ok(())
    }

    fn enter(&mut self, w: &mut CodeWriter<'_>, block: BlockId) {
        // mov dword [r14 + running], id
        w.emit(&[0x41, 0xC7, 0x86]);
        w.u32(JitFrame::RUNNING_OFFSET);
        w.u32(block.raw());
        // cmp dword [r15 + cycles], 0
        w.emit(&[0x41, 0x83, 0xBF]);
        w.u32(CPU_CYCLES_OFF as u32);
        w.u8(0);
        // jg past the exit
        w.emit(&[0x7F, 0x0A]);
        self.exit(w, BlockReturn::Cycles);
    }

    fn load_imm(&mut self, w: &mut CodeWriter<'_>, dst: Tmp, value: u32) {
        Self::mov_r32_imm(w, tmp_reg(dst), value);
    }

    fn load_phys(
        &mut self,
        w: &mut CodeWriter<'_>,
        dst: Tmp,
        paddr: u32,
        width: Width,
        sign_extend: bool,
    ) {
        Self::mov_r32_imm(w, RSI, paddr);
        Self::mov_r32_imm(w, RDX, width_flag_arg(width, sign_extend));
        self.call_helper(w, helper_load_phys as *const () as usize, false);
        Self::mov_rr(w, tmp_reg(dst), RAX);
    }

    fn load_reg(&mut self, w: &mut CodeWriter<'_>, dst: Tmp, reg: Reg) {
        let opcode: &[u8] = match reg.width {
            Width::W8 => &[0x0F, 0xB6],
            Width::W16 => &[0x0F, 0xB7],
            Width::W32 => &[0x8B],
        };
        Self::cpu_field(w, opcode, tmp_reg(dst), Self::reg_disp(reg));
    }

    fn store_reg(&mut self, w: &mut CodeWriter<'_>, reg: Reg, src: Tmp) {
        Self::width_prefix(w, reg.width);
        let opcode = if reg.width == Width::W8 { 0x88 } else { 0x89 };
        Self::cpu_field(w, &[opcode], tmp_reg(src), Self::reg_disp(reg));
    }

    fn mov(&mut self, w: &mut CodeWriter<'_>, dst: Tmp, src: Tmp) {
        Self::mov_rr(w, tmp_reg(dst), tmp_reg(src));
    }

    fn add_imm(&mut self, w: &mut CodeWriter<'_>, dst: Tmp, value: u32) {
        let r = tmp_reg(dst);
        w.emit(&[rex(false, 0, r), 0x81, modrm(0b11, 0, r)]);
        w.u32(value);
    }

    fn and_imm(&mut self, w: &mut CodeWriter<'_>, dst: Tmp, value: u32) {
        let r = tmp_reg(dst);
        w.emit(&[rex(false, 0, r), 0x81, modrm(0b11, 4, r)]);
        w.u32(value);
    }

    fn lea(&mut self, w: &mut CodeWriter<'_>, dst: Tmp, addr: &Address) {
        let r = tmp_reg(dst);
        Self::mov_r32_imm(w, r, addr.disp);
        if let Some(base) = addr.base {
            // add dst, [r15 + base]
            Self::cpu_field(w, &[0x03], r, CPU_REG_OFF[base.index()]);
        }
        if let Some(index) = addr.index {
            // mov eax, [r15 + index]
            Self::cpu_field(w, &[0x8B], RAX, CPU_REG_OFF[index.index()]);
            let shift = addr.scale.trailing_zeros() as u8;
            if shift != 0 {
                // shl eax, shift
                w.emit(&[0xC1, modrm(0b11, 4, RAX), shift]);
            }
            // add dst, eax
            w.emit(&[rex(false, RAX, r), 0x01, modrm(0b11, RAX, r)]);
        }
        if addr.addr16 {
            self.and_imm(w, dst, 0xFFFF);
        }
    }

    fn add_seg_base(&mut self, w: &mut CodeWriter<'_>, dst: Tmp, seg: Seg) {
        Self::cpu_field(w, &[0x03], tmp_reg(dst), CPU_SEG_BASE_OFF[seg.index()]);
    }

    fn alu(&mut self, w: &mut CodeWriter<'_>, op: AluOp, width: Width, dst: Tmp, src: Tmp) {
        if op.reads_carry() {
            // bt dword [r15 + eflags], 0
            Self::cpu_field(w, &[0x0F, 0xBA], 4, CPU_EFLAGS_OFF);
            w.u8(0);
        }
        let base = match op {
            AluOp::Add => 0x01,
            AluOp::Or => 0x09,
            AluOp::Adc => 0x11,
            AluOp::Sbb => 0x19,
            AluOp::And => 0x21,
            AluOp::Sub => 0x29,
            AluOp::Xor => 0x31,
            AluOp::Cmp => 0x39,
            AluOp::Test => 0x85,
        };
        let opcode = if width == Width::W8 { base - 1 } else { base };
        let (d, s) = (tmp_reg(dst), tmp_reg(src));
        Self::width_prefix(w, width);
        w.emit(&[rex(false, s, d), opcode, modrm(0b11, s, d)]);

        // AF is undefined after logic ops and reported as clear.
        let logic = matches!(op, AluOp::And | AluOp::Or | AluOp::Xor | AluOp::Test);
        let mask = if logic { FLAGS_OSZAPC & !FLAG_AF } else { FLAGS_OSZAPC };
        Self::capture_flags(w, mask, FLAGS_OSZAPC);
    }

    fn unary(&mut self, w: &mut CodeWriter<'_>, op: UnaryOp, width: Width, dst: Tmp) {
        let (group, ext) = match op {
            UnaryOp::Inc => (0xFF, 0),
            UnaryOp::Dec => (0xFF, 1),
            UnaryOp::Not => (0xF7, 2),
            UnaryOp::Neg => (0xF7, 3),
        };
        let opcode = if width == Width::W8 { group - 1 } else { group };
        let d = tmp_reg(dst);
        Self::width_prefix(w, width);
        w.emit(&[rex(false, 0, d), opcode, modrm(0b11, ext, d)]);
        match op {
            UnaryOp::Inc | UnaryOp::Dec => {
                let keep_cf = FLAGS_OSZAPC & !FLAG_CF;
                Self::capture_flags(w, keep_cf, keep_cf);
            }
            UnaryOp::Neg => Self::capture_flags(w, FLAGS_OSZAPC, FLAGS_OSZAPC),
            UnaryOp::Not => {}
        }
    }

    fn load(&mut self, w: &mut CodeWriter<'_>, dst: Tmp, addr: Tmp, width: Width) {
        Self::mov_rr(w, RSI, tmp_reg(addr));
        Self::mov_r32_imm(w, RDX, width.bytes());
        self.call_helper(w, helper_load as *const () as usize, true);
        Self::mov_rr(w, tmp_reg(dst), RAX);
    }

    fn store(&mut self, w: &mut CodeWriter<'_>, addr: Tmp, src: Tmp, width: Width) {
        Self::mov_rr(w, RSI, tmp_reg(addr));
        Self::mov_rr(w, RDX, tmp_reg(src));
        Self::mov_r32_imm(w, RCX, width.bytes());
        self.call_helper(w, helper_store as *const () as usize, true);
    }

    fn call_div(&mut self, w: &mut CodeWriter<'_>, width: Width, signed: bool, divisor: Tmp) {
        Self::mov_rr(w, RSI, tmp_reg(divisor));
        Self::mov_r32_imm(w, RDX, width_flag_arg(width, signed));
        self.call_helper(w, helper_div as *const () as usize, true);
    }

    fn call_interpret(&mut self, w: &mut CodeWriter<'_>, next_eip: u32) {
        Self::mov_r32_imm(w, RSI, next_eip);
        self.call_helper(w, helper_interpret as *const () as usize, true);
    }

    fn call_iret(&mut self, w: &mut CodeWriter<'_>, width: Width) {
        Self::mov_r32_imm(w, RSI, width.bytes());
        self.call_helper(w, helper_iret as *const () as usize, true);
    }

    fn sub_cycles(&mut self, w: &mut CodeWriter<'_>, n: u32) {
        // sub dword [r15 + cycles], n
        Self::cpu_field(w, &[0x81], 5, CPU_CYCLES_OFF);
        w.u32(n);
    }

    fn set_eip(&mut self, w: &mut CodeWriter<'_>, eip: u32) {
        // mov dword [r15 + eip], imm32
        Self::cpu_field(w, &[0xC7], 0, CPU_EIP_OFF);
        w.u32(eip);
    }

    fn store_eip(&mut self, w: &mut CodeWriter<'_>, src: Tmp) {
        Self::cpu_field(w, &[0x89], tmp_reg(src), CPU_EIP_OFF);
    }

    fn set_callback(&mut self, w: &mut CodeWriter<'_>, n: u32) {
        // mov dword [r14 + callback], imm32
        w.emit(&[0x41, 0xC7, 0x86]);
        w.u32(JitFrame::CALLBACK_OFFSET);
        w.u32(n);
    }

    fn jump_if(&mut self, w: &mut CodeWriter<'_>, cond: Cond, label: Label) {
        // Load the guest status flags into the host flags register.
        Self::cpu_field(w, &[0x8B], RAX, CPU_EFLAGS_OFF);
        w.u8(0x25);
        w.u32(FLAGS_OSZAPC);
        // push rax; popfq
        w.emit(&[0x50, 0x9D]);
        w.emit(&[0x0F, 0x80 + cond.code()]);
        self.fixups.push((w.pos(), label));
        w.u32(0);
    }

    fn bind(&mut self, w: &mut CodeWriter<'_>, label: Label) {
        self.labels[label.index()] = Some(w.pos());
    }

    fn exit(&mut self, w: &mut CodeWriter<'_>, code: BlockReturn) {
        Self::mov_r32_imm(w, RAX, code.raw());
        self.jmp_epilogue(w);
    }

    fn link(&mut self, w: &mut CodeWriter<'_>, _slot: usize, entry: usize) {
        // mov rax, &entry; jmp [rax]
        w.emit(&[0x48, 0xB8]);
        w.u64(entry as u64);
        w.emit(&[0xFF, 0x20]);
    }

    unsafe fn execute(
        &self,
        _arena: &ExecArena,
        layout: &RuntimeLayout,
        entry: usize,
        cpu: *mut CpuState,
        frame: *mut JitFrame<'_>,
    ) -> u32 {
        let trampoline: Trampoline = std::mem::transmute::<usize, Trampoline>(layout.trampoline);
        trampoline(entry, cpu, frame.cast())
    }
}
