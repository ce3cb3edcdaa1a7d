//! Guest code to micro-ops.
//!
//! A block starts at the current `CS:EIP` and runs until a control transfer, an instruction
//! without a native lowering, or the instruction limit. While decoding, every guest byte the block
//! depends on is counted in its page's write map so later stores can find the block again. A
//! block may continue onto the following page once; that part is owned by a cross-page companion
//! block registered with the second page's monitor.

use dynrec_x86::{
    decode, Address, DecodeError, GuestInst, Gpr, Imm, InstKind, Operand, Reg, Seg, Width,
    MAX_INST_LEN,
};

use crate::arena::ExecArena;
use crate::backend::{lower_block, CodeWriter, HostEmitter};
use crate::cache::{BlockId, CodeCache, PageId};
use crate::error::DynrecError;
use crate::ir::{BlockIr, BlockReturn, MicroOp, Tmp};
use crate::mem::GuestMemory;
use crate::state::CpuState;
use crate::{PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};

/// Translates the block starting at `cpu`'s `CS:EIP`, whose page is monitored by `page`, and
/// emits it into the arena.
pub(crate) fn create_block<M: GuestMemory + ?Sized>(
    cache: &mut CodeCache,
    emitter: &mut dyn HostEmitter,
    arena: &mut ExecArena,
    mem: &mut M,
    cpu: &CpuState,
    page: PageId,
) -> Result<BlockId, DynrecError> {
    let id = cache.open_block();
    let start = (cpu.ip_linear() & PAGE_MASK) as u16;
    {
        let block = cache.block_mut(id);
        block.page_start = start;
        block.page_end = start;
    }
    cache.add_cache_block(page, id);

    let ir = match Translator::new(cache, mem, cpu, page, id).run() {
        Ok(ir) => ir,
        Err(err) => {
            cache.abandon_block();
            return Err(err);
        }
    };

    let written = match emit(cache, emitter, arena, id, &ir) {
        Ok(written) => written,
        Err(err) => {
            cache.abandon_block();
            return Err(err);
        }
    };
    if let Err(err) = cache.close_block(written) {
        cache.clear_block(id);
        return Err(err);
    }

    tracing::trace!(
        block = ?id,
        eip = format_args!("{:#x}", cpu.eip),
        ops = ir.ops().len(),
        bytes = written,
        "translated block"
    );
    Ok(id)
}

fn emit(
    cache: &CodeCache,
    emitter: &mut dyn HostEmitter,
    arena: &mut ExecArena,
    id: BlockId,
    ir: &BlockIr,
) -> Result<usize, DynrecError> {
    let (start, _) = cache.block(id).code_span();
    let capacity = cache.block_capacity(id);
    let mut guard = arena.begin_write(start..start + capacity)?;
    let base = guard.addr();
    let written = {
        let mut w = CodeWriter::new(guard.bytes_mut(), base);
        lower_block(ir, emitter, &mut w)?;
        w.pos()
    };
    guard.finish()?;
    Ok(written)
}

/// Copies up to `out.len()` bytes of physical page `phys_page` from offset `offset`.
fn fetch<M: GuestMemory + ?Sized>(mem: &M, phys_page: u32, offset: usize, out: &mut [u8]) -> usize {
    let len = out.len().min(PAGE_SIZE - offset);
    match mem.host_page(phys_page) {
        Some(bytes) => out[..len].copy_from_slice(&bytes[offset..offset + len]),
        None => {
            let base = phys_page << PAGE_SHIFT;
            for (i, b) in out[..len].iter_mut().enumerate() {
                *b = mem.read_u8(base + (offset + i) as u32);
            }
        }
    }
    len
}

#[derive(Debug, Clone, Copy)]
struct CrossPage {
    page: PageId,
    phys_page: u32,
    block: BlockId,
}

struct Translator<'a, M: GuestMemory + ?Sized> {
    cache: &'a mut CodeCache,
    mem: &'a mut M,
    cpu: &'a CpuState,
    block: BlockId,
    page: PageId,
    phys_page: u32,
    lin_page: u32,
    cross: Option<CrossPage>,
    ir: BlockIr,
    /// Instructions translated so far; each is charged one cycle.
    count: u32,
    /// EIP of the current instruction has been stored since it started.
    eip_synced: bool,
    /// Physical address and size of the current instruction's immediate when it is read at run
    /// time.
    runtime_imm: Option<(u32, u8)>,
}

impl<'a, M: GuestMemory + ?Sized> Translator<'a, M> {
    fn new(
        cache: &'a mut CodeCache,
        mem: &'a mut M,
        cpu: &'a CpuState,
        page: PageId,
        block: BlockId,
    ) -> Self {
        let phys_page = cache.page(page).phys_page();
        Self {
            cache,
            mem,
            cpu,
            block,
            page,
            phys_page,
            lin_page: cpu.ip_linear() >> PAGE_SHIFT,
            cross: None,
            ir: BlockIr::new(),
            count: 0,
            eip_synced: false,
            runtime_imm: None,
        }
    }

    fn code32(&self) -> bool {
        self.cpu.code_big
    }

    fn push(&mut self, op: MicroOp) {
        self.ir.push(op);
    }

    /// Pushes `op`, publishing the instruction's EIP first if `op` may call into the runtime.
    fn push_at(&mut self, ip: u32, op: MicroOp) {
        if op.calls_helper() && !self.eip_synced {
            self.push(MicroOp::SetEip(ip));
            self.eip_synced = true;
        }
        self.push(op);
    }

    fn sub_cycles(&mut self, n: u32) {
        if n != 0 {
            self.push(MicroOp::SubCycles(n));
        }
    }

    fn link(&mut self, slot: usize) {
        let entry = self.cache.link_entry_addr(self.block, slot);
        self.push(MicroOp::Link { slot, entry });
    }

    fn run(mut self) -> Result<BlockIr, DynrecError> {
        self.push(MicroOp::Enter { block: self.block });
        let max = self.cache.config().max_instructions as u32;
        let mut ip = self.cpu.eip;

        loop {
            let Some(inst) = self.fetch_decode(ip)? else {
                if self.count == 0 {
                    // Let the interpreter run into the fault.
                    self.push(MicroOp::SetEip(ip));
                    self.push(MicroOp::Exit(BlockReturn::Opcode));
                } else {
                    self.sub_cycles(self.count);
                    self.push(MicroOp::SetEip(ip));
                    self.link(0);
                }
                break;
            };

            self.eip_synced = false;
            let next = inst.next_ip(self.code32());
            if self.lower(&inst, next) {
                break;
            }
            self.count += 1;
            ip = next;
            if self.count >= max {
                self.sub_cycles(self.count);
                self.push(MicroOp::SetEip(ip));
                self.link(0);
                break;
            }
        }
        Ok(self.ir)
    }

    /// The cross-page companion on the following page, created on first use. `None` if that
    /// page cannot hold code.
    fn cross_page(&mut self) -> Result<Option<CrossPage>, DynrecError> {
        if self.cross.is_some() {
            return Ok(self.cross);
        }
        let linear = self.lin_page.wrapping_add(1) << PAGE_SHIFT;
        let code32 = self.code32();
        let page = match self.cache.make_code_page(
            &mut *self.mem,
            linear,
            code32,
            Some(self.page),
        ) {
            Ok(Some(page)) => page,
            Ok(None) | Err(_) => return Ok(None),
        };
        let block = self.cache.get_free_block()?;
        self.cache.add_cross_block(page, block);
        self.cache.block_mut(block).cross = Some(self.block);
        self.cache.block_mut(self.block).cross = Some(block);
        self.cross = Some(CrossPage {
            page,
            phys_page: self.cache.page(page).phys_page(),
            block,
        });
        Ok(self.cross)
    }

    /// Fetches and decodes the instruction at `ip` and counts its bytes. `None` when it cannot be
    /// fetched from this block's pages.
    fn fetch_decode(&mut self, ip: u32) -> Result<Option<GuestInst>, DynrecError> {
        let linear = self.cpu.seg_base[Seg::Cs.index()].wrapping_add(ip);
        let offset = (linear & PAGE_MASK) as usize;
        let code32 = self.code32();
        let mut buf = [0u8; MAX_INST_LEN];

        let inst = if linear >> PAGE_SHIFT == self.lin_page {
            let len = fetch(&*self.mem, self.phys_page, offset, &mut buf);
            match decode(&buf[..len], ip, code32) {
                Ok(inst) => inst,
                Err(DecodeError::Truncated { .. } | DecodeError::Empty) => {
                    let Some(cross) = self.cross_page()? else {
                        return Ok(None);
                    };
                    let more = fetch(&*self.mem, cross.phys_page, 0, &mut buf[len..]);
                    match decode(&buf[..len + more], ip, code32) {
                        Ok(inst) => inst,
                        Err(_) => return Ok(None),
                    }
                }
            }
        } else if linear >> PAGE_SHIFT == self.lin_page.wrapping_add(1) {
            let Some(cross) = self.cross_page()? else {
                return Ok(None);
            };
            let len = fetch(&*self.mem, cross.phys_page, offset, &mut buf);
            match decode(&buf[..len], ip, code32) {
                Ok(inst) => inst,
                // Would cross into a third page.
                Err(_) => return Ok(None),
            }
        } else {
            return Ok(None);
        };

        self.runtime_imm = self.hot_imm(&inst, linear);
        self.cover(linear, u32::from(inst.len));
        Ok(Some(inst))
    }

    /// Physical address of `inst`'s immediate if it lies on the first page and keeps being
    /// rewritten; such an immediate is read when the block runs instead of being baked in.
    fn hot_imm(&self, inst: &GuestInst, linear: u32) -> Option<(u32, u8)> {
        let imm = match inst.kind {
            InstKind::Mov {
                src: Operand::Imm(imm),
                ..
            }
            | InstKind::Alu {
                src: Operand::Imm(imm),
                ..
            }
            | InstKind::Push {
                src: Operand::Imm(imm),
            } => imm,
            _ => return None,
        };
        let start = linear.wrapping_add(u32::from(imm.offset));
        let last = start.wrapping_add(u32::from(imm.size) - 1);
        if start >> PAGE_SHIFT != self.lin_page || last >> PAGE_SHIFT != self.lin_page {
            return None;
        }
        let first = (start & PAGE_MASK) as usize;
        (first..first + usize::from(imm.size))
            .any(|off| self.cache.is_heavily_rewritten(self.page, off))
            .then_some(((self.phys_page << PAGE_SHIFT) | first as u32, imm.size))
    }

    /// Counts the instruction's bytes in the write maps. Bytes of a runtime-read immediate go
    /// into the block's write mask instead.
    fn cover(&mut self, linear: u32, len: u32) {
        let masked = self.runtime_imm.map(|(paddr, size)| {
            let start = (paddr & PAGE_MASK) as u16;
            start..start + u16::from(size)
        });
        for i in 0..len {
            let byte = linear.wrapping_add(i);
            let offset = (byte & PAGE_MASK) as u16;
            if byte >> PAGE_SHIFT == self.lin_page {
                if masked.as_ref().is_some_and(|m| m.contains(&offset)) {
                    self.cache.mask_byte(self.block, offset);
                } else {
                    self.cache.cover_byte(self.page, usize::from(offset));
                }
                let block = self.cache.block_mut(self.block);
                block.page_end = block.page_end.max(offset);
            } else if let Some(cross) = self.cross {
                self.cache.cover_byte(cross.page, usize::from(offset));
                let block = self.cache.block_mut(cross.block);
                block.page_end = block.page_end.max(offset);
            }
        }
    }

    fn operand_addr(&mut self, ip: u32, addr: &Address, dst: Tmp) {
        self.push_at(ip, MicroOp::Lea { dst, addr: *addr });
        self.push_at(ip, MicroOp::AddSegBase { dst, seg: addr.seg });
    }

    fn load_imm(&mut self, ip: u32, imm: Imm, width: Width, dst: Tmp) {
        match self.runtime_imm {
            Some((paddr, _)) => {
                let size = Width::from_bytes(u32::from(imm.size)).unwrap_or(width);
                self.push_at(
                    ip,
                    MicroOp::LoadPhys {
                        dst,
                        paddr,
                        width: size,
                        sign_extend: size.bytes() < width.bytes(),
                    },
                );
            }
            None => self.push(MicroOp::LoadImm {
                dst,
                value: imm.value & width.mask(),
            }),
        }
    }

    /// Reads `op` into `dst`; a memory operand's linear address is left in `addr_tmp`.
    fn read_operand(&mut self, ip: u32, op: Operand, width: Width, dst: Tmp, addr_tmp: Tmp) {
        match op {
            Operand::Reg(reg) => self.push(MicroOp::LoadReg { dst, reg }),
            Operand::Imm(imm) => self.load_imm(ip, imm, width, dst),
            Operand::Mem(addr) => {
                self.operand_addr(ip, &addr, addr_tmp);
                self.push_at(
                    ip,
                    MicroOp::Load {
                        dst,
                        addr: addr_tmp,
                        width,
                    },
                );
            }
        }
    }

    /// Writes `src` to `op`; a memory operand's address must already be in `addr_tmp`.
    fn write_operand(&mut self, ip: u32, op: Operand, width: Width, src: Tmp, addr_tmp: Tmp) {
        match op {
            Operand::Reg(reg) => self.push(MicroOp::StoreReg { reg, src }),
            Operand::Mem(_) => self.push_at(
                ip,
                MicroOp::Store {
                    addr: addr_tmp,
                    src,
                    width,
                },
            ),
            Operand::Imm(_) => unreachable!("immediate destination"),
        }
    }

    fn stack_reg(&self) -> Reg {
        Reg::new(Gpr::Esp, self.cpu.stack_width())
    }

    fn wrap_sp(&mut self, dst: Tmp) {
        if !self.cpu.stack_big {
            self.push(MicroOp::AndImm { dst, value: 0xFFFF });
        }
    }

    /// Pushes `T0`. SP is only updated after the store went through.
    fn push_t0(&mut self, ip: u32, width: Width) {
        let sp = self.stack_reg();
        self.push(MicroOp::LoadReg {
            dst: Tmp::T2,
            reg: sp,
        });
        self.push(MicroOp::AddImm {
            dst: Tmp::T2,
            value: width.bytes().wrapping_neg(),
        });
        self.wrap_sp(Tmp::T2);
        self.push(MicroOp::Mov {
            dst: Tmp::T1,
            src: Tmp::T2,
        });
        self.push(MicroOp::AddSegBase {
            dst: Tmp::T1,
            seg: Seg::Ss,
        });
        self.push_at(
            ip,
            MicroOp::Store {
                addr: Tmp::T1,
                src: Tmp::T0,
                width,
            },
        );
        self.push(MicroOp::StoreReg {
            reg: sp,
            src: Tmp::T2,
        });
    }

    /// Pops into `T0`, releasing `extra` further bytes.
    fn pop_t0(&mut self, ip: u32, width: Width, extra: u32) {
        let sp = self.stack_reg();
        self.push(MicroOp::LoadReg {
            dst: Tmp::T2,
            reg: sp,
        });
        self.push(MicroOp::Mov {
            dst: Tmp::T1,
            src: Tmp::T2,
        });
        self.push(MicroOp::AddSegBase {
            dst: Tmp::T1,
            seg: Seg::Ss,
        });
        self.push_at(
            ip,
            MicroOp::Load {
                dst: Tmp::T0,
                addr: Tmp::T1,
                width,
            },
        );
        self.push(MicroOp::AddImm {
            dst: Tmp::T2,
            value: width.bytes() + extra,
        });
        self.wrap_sp(Tmp::T2);
        self.push(MicroOp::StoreReg {
            reg: sp,
            src: Tmp::T2,
        });
    }

    /// Leaves for the interpreter at this instruction, charging the ones before it.
    fn bail(&mut self, ip: u32, code: BlockReturn) {
        self.sub_cycles(self.count);
        self.push(MicroOp::SetEip(ip));
        self.push(MicroOp::Exit(code));
    }

    /// Lowers one instruction. Returns `true` if it ended the block.
    fn lower(&mut self, inst: &GuestInst, next: u32) -> bool {
        let ip = inst.ip;
        let width = inst.width;
        let ip_mask = self.cpu.ip_mask();
        // Cycles charged by exits that complete this instruction.
        let done = self.count + 1;

        match inst.kind {
            InstKind::Mov { dst, src } => {
                if let Operand::Mem(addr) = dst {
                    self.operand_addr(ip, &addr, Tmp::T2);
                }
                self.read_operand(ip, src, width, Tmp::T0, Tmp::T2);
                self.write_operand(ip, dst, width, Tmp::T0, Tmp::T2);
            }
            InstKind::Alu { op, dst, src } => {
                self.read_operand(ip, dst, width, Tmp::T0, Tmp::T2);
                self.read_operand(ip, src, width, Tmp::T1, Tmp::T2);
                self.push(MicroOp::Alu {
                    op,
                    width,
                    dst: Tmp::T0,
                    src: Tmp::T1,
                });
                if op.writes_result() {
                    self.write_operand(ip, dst, width, Tmp::T0, Tmp::T2);
                }
            }
            InstKind::Unary { op, dst } => {
                self.read_operand(ip, dst, width, Tmp::T0, Tmp::T2);
                self.push(MicroOp::Unary {
                    op,
                    width,
                    dst: Tmp::T0,
                });
                self.write_operand(ip, dst, width, Tmp::T0, Tmp::T2);
            }
            InstKind::Lea { dst, addr } => {
                self.push(MicroOp::Lea { dst: Tmp::T0, addr });
                self.push(MicroOp::StoreReg {
                    reg: dst,
                    src: Tmp::T0,
                });
            }
            InstKind::Push { src } => {
                self.read_operand(ip, src, width, Tmp::T0, Tmp::T2);
                self.push_t0(ip, width);
            }
            InstKind::Pop { dst } => {
                self.pop_t0(ip, width, 0);
                self.push(MicroOp::StoreReg {
                    reg: dst,
                    src: Tmp::T0,
                });
            }
            InstKind::Jmp { target } => {
                self.sub_cycles(done);
                self.push(MicroOp::SetEip(target & ip_mask));
                self.link(0);
                return true;
            }
            InstKind::Jcc { cond, target } => {
                let taken = self.ir.label();
                self.sub_cycles(done);
                self.push(MicroOp::JumpIf { cond, label: taken });
                self.push(MicroOp::SetEip(next));
                self.link(0);
                self.push(MicroOp::Bind(taken));
                self.push(MicroOp::SetEip(target & ip_mask));
                self.link(1);
                return true;
            }
            InstKind::Call { target } => {
                self.push(MicroOp::LoadImm {
                    dst: Tmp::T0,
                    value: next,
                });
                self.push_t0(ip, width);
                self.sub_cycles(done);
                self.push(MicroOp::SetEip(target & ip_mask));
                self.link(0);
                return true;
            }
            InstKind::Ret { pop } => {
                self.pop_t0(ip, width, u32::from(pop));
                self.push(MicroOp::StoreEip { src: Tmp::T0 });
                self.sub_cycles(done);
                self.push(MicroOp::Exit(BlockReturn::Normal));
                return true;
            }
            InstKind::Div { signed, src } => {
                self.read_operand(ip, src, width, Tmp::T0, Tmp::T2);
                self.push_at(
                    ip,
                    MicroOp::CallDiv {
                        width,
                        signed,
                        divisor: Tmp::T0,
                    },
                );
            }
            InstKind::Iret if !self.cpu.protected_mode => {
                self.push_at(ip, MicroOp::CallIret { width });
                self.sub_cycles(done);
                self.push(MicroOp::Exit(BlockReturn::Iret));
                return true;
            }
            InstKind::Nop => {}
            InstKind::Fpu => {
                self.push_at(ip, MicroOp::CallInterpret { next_eip: next });
            }
            InstKind::Callback { index } => {
                self.sub_cycles(done);
                self.push(MicroOp::SetEip(next));
                self.push(MicroOp::SetCallback(u32::from(index)));
                self.push(MicroOp::Exit(BlockReturn::Callback));
                return true;
            }
            InstKind::Iret | InstKind::Other => {
                self.bail(ip, BlockReturn::Opcode);
                return true;
            }
            InstKind::Invalid => {
                self.bail(ip, BlockReturn::OpcodeFull);
                return true;
            }
        }
        false
    }
}
