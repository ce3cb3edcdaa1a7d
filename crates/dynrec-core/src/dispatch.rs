//! The dispatch loop: finds or translates the block at `CS:EIP`, runs it and acts on the way it
//! exits.

use dynrec_x86::{Gpr, Reg, Seg, Width};

use crate::arena::ExecArena;
use crate::backend::{new_emitter, CodeWriter, HelperEnv, HostEmitter, JitFrame, RuntimeLayout};
use crate::bus::CodeBus;
use crate::cache::{BlockId, CodeCache, LinkTarget, PageId};
use crate::config::{BackendKind, DynrecConfig};
use crate::error::DynrecError;
use crate::ir::BlockReturn;
use crate::mem::{read_phys, GuestBus, GuestMemory, PageFault};
use crate::platform::{CoreExit, Platform};
use crate::state::{
    CpuState, FLAG_IF, FLAG_RESERVED1, FLAG_TF, IRET_MASK_16, IRET_MASK_32, VECTOR_DEBUG,
    VECTOR_DIVIDE_ERROR,
};
use crate::translate::create_block;
use crate::{PAGE_MASK, PAGE_SHIFT};

/// Counters kept by the dispatcher.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub lookups: u64,
    pub translations: u64,
    /// Blocks entered from the dispatcher; linked successors are not counted.
    pub block_runs: u64,
    pub links: u64,
    /// Slices handed wholesale to the interpreter (code-less pages, disabled core).
    pub interpreter_runs: u64,
    /// Single instructions run by the interpreter on behalf of a block.
    pub interpreter_steps: u64,
    pub smc_exits: u64,
    pub page_faults: u64,
    pub divide_errors: u64,
    pub callbacks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchState {
    Lookup,
    CreateBlock(PageId),
    RunBlock(BlockId),
    HandleReturn {
        ret: BlockReturn,
        running: Option<BlockId>,
        callback: u32,
    },
    Exit(CoreExit),
}

/// Everything that exists only while the core is initialised.
struct Runtime {
    cache: CodeCache,
    emitter: Box<dyn HostEmitter>,
    layout: RuntimeLayout,
    arena: ExecArena,
}

/// The dynamic recompiler: one per emulated CPU, driven from the emulation thread.
pub struct Dynrec {
    config: DynrecConfig,
    runtime: Option<Runtime>,
    /// The last block returned with TF set; the next slice single-steps.
    trap: bool,
    stats: DispatchStats,
}

impl std::fmt::Debug for Dynrec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dynrec")
            .field("config", &self.config)
            .field("enabled", &self.runtime.is_some())
            .field("trap", &self.trap)
            .field("stats", &self.stats)
            .finish()
    }
}

impl Dynrec {
    pub fn new(config: DynrecConfig) -> Self {
        Self {
            config,
            runtime: None,
            trap: false,
            stats: DispatchStats::default(),
        }
    }

    pub fn config(&self) -> &DynrecConfig {
        &self.config
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    pub fn is_enabled(&self) -> bool {
        self.runtime.is_some()
    }

    pub fn cache(&self) -> Option<&CodeCache> {
        self.runtime.as_ref().map(|rt| &rt.cache)
    }

    /// Linear view of `mem` for device and debugger accesses. Stores through it invalidate any
    /// translated code they overwrite.
    pub fn bus<'a, M: GuestMemory + ?Sized>(&'a mut self, mem: &'a mut M) -> CodeBus<'a, M> {
        match self.runtime.as_mut() {
            Some(rt) => CodeBus::new(mem, &mut rt.cache),
            None => CodeBus::unmonitored(mem),
        }
    }

    /// Maps the arena and builds the block and page pools. With `enable == false` nothing is
    /// allocated and [`Self::run`] hands every slice to the interpreter. Calling it again while
    /// initialised does nothing.
    pub fn initialize(&mut self, enable: bool) -> Result<(), DynrecError> {
        if self.runtime.is_some() {
            return Ok(());
        }
        if !enable {
            tracing::info!("dynamic core disabled");
            return Ok(());
        }
        self.config.validate()?;
        let config = self.config;

        let mut arena =
            ExecArena::allocate(config.cache_size, config.max_block_size, config.protection)?;
        let kind = if config.backend == BackendKind::Native && !arena.is_executable() {
            tracing::warn!("arena is not executable, using the portable backend");
            BackendKind::Portable
        } else {
            config.backend
        };
        let mut emitter = new_emitter(kind);

        let layout = {
            let mut guard = arena.begin_write(arena.stub_range())?;
            let base = guard.addr();
            let layout = {
                let mut w = CodeWriter::new(guard.bytes_mut(), base);
                emitter.emit_runtime(&mut w)?
            };
            guard.finish()?;
            layout
        };

        let cache = CodeCache::new(
            &config,
            arena.base_addr(),
            arena.blocks_start(),
            layout.exit_stubs,
        );
        tracing::info!(
            backend = ?emitter.kind(),
            cache_size = config.cache_size,
            blocks = config.block_count,
            code_pages = config.code_pages,
            "dynamic core initialised"
        );
        self.runtime = Some(Runtime {
            cache,
            emitter,
            layout,
            arena,
        });
        Ok(())
    }

    /// Clears every cached block and unmaps the arena.
    pub fn shutdown(&mut self) {
        let Some(mut rt) = self.runtime.take() else {
            return;
        };
        rt.cache.clear_all();
        self.trap = false;
        tracing::info!(stats = ?self.stats, cache = ?rt.cache.stats(), "dynamic core shut down");
    }

    /// Runs guest code until the cycle budget in `cpu.cycles` is spent or the platform needs to
    /// act.
    ///
    /// After an instruction was forced through the interpreter, the rest of the slice is parked
    /// in `cpu.cycle_left` for the scheduler to hand back.
    pub fn run<M, P>(
        &mut self,
        cpu: &mut CpuState,
        mem: &mut M,
        platform: &mut P,
    ) -> Result<CoreExit, DynrecError>
    where
        M: GuestMemory + ?Sized,
        P: Platform + ?Sized,
    {
        if self.trap {
            self.trap = false;
            return Ok(self.trap_run(cpu, mem, platform));
        }
        let Some(rt) = self.runtime.as_mut() else {
            self.stats.interpreter_runs += 1;
            return Ok(platform.run_normal(cpu, &mut CodeBus::unmonitored(mem)));
        };
        let stats = &mut self.stats;

        let mut state = DispatchState::Lookup;
        loop {
            state = match state {
                DispatchState::Lookup => {
                    stats.lookups += 1;
                    let linear = cpu.ip_linear();
                    match rt.cache.make_code_page(mem, linear, cpu.code_big, None) {
                        Err(fault) => {
                            stats.page_faults += 1;
                            let mut bus = CodeBus::new(mem, &mut rt.cache);
                            platform.page_fault(cpu, &mut bus, fault);
                            DispatchState::Lookup
                        }
                        Ok(None) => {
                            stats.interpreter_runs += 1;
                            let mut bus = CodeBus::new(mem, &mut rt.cache);
                            DispatchState::Exit(platform.run_normal(cpu, &mut bus))
                        }
                        Ok(Some(page)) => {
                            match rt.cache.find_cache_block(page, (linear & PAGE_MASK) as u16) {
                                Some(id) => DispatchState::RunBlock(id),
                                None => DispatchState::CreateBlock(page),
                            }
                        }
                    }
                }

                DispatchState::CreateBlock(page) => {
                    let offset = (cpu.ip_linear() & PAGE_MASK) as usize;
                    if rt.cache.is_heavily_rewritten(page, offset) {
                        // Translating would only be invalidated again.
                        stats.interpreter_steps += 1;
                        let old = cpu.cycles;
                        cpu.cycles = 1;
                        let exit = platform.run_normal(cpu, &mut CodeBus::new(mem, &mut rt.cache));
                        match exit {
                            CoreExit::Continue => {
                                cpu.cycles = old - 1;
                                if cpu.cycles <= 0 {
                                    DispatchState::Exit(CoreExit::Continue)
                                } else {
                                    DispatchState::Lookup
                                }
                            }
                            CoreExit::Callback(_) => {
                                cpu.cycle_left += old;
                                DispatchState::Exit(exit)
                            }
                        }
                    } else {
                        stats.translations += 1;
                        let id = create_block(
                            &mut rt.cache,
                            rt.emitter.as_mut(),
                            &mut rt.arena,
                            mem,
                            cpu,
                            page,
                        )?;
                        DispatchState::RunBlock(id)
                    }
                }

                DispatchState::RunBlock(id) => {
                    stats.block_runs += 1;
                    let (ret, running, callback) = execute(rt, cpu, mem, platform, stats, id)?;
                    DispatchState::HandleReturn {
                        ret,
                        running,
                        callback,
                    }
                }

                DispatchState::HandleReturn {
                    ret,
                    running,
                    callback,
                } => match ret {
                    BlockReturn::Normal => DispatchState::Lookup,
                    BlockReturn::Cycles => DispatchState::Exit(CoreExit::Continue),
                    BlockReturn::Link1 | BlockReturn::Link2 => {
                        let slot = usize::from(ret == BlockReturn::Link2);
                        match link_target(&rt.cache, cpu, mem, running, slot) {
                            Some((from, to)) => {
                                rt.cache.link(from, slot, to);
                                stats.links += 1;
                                DispatchState::RunBlock(to)
                            }
                            None => DispatchState::Lookup,
                        }
                    }
                    BlockReturn::Opcode | BlockReturn::OpcodeFull | BlockReturn::SmcBlock => {
                        stats.interpreter_steps += 1;
                        cpu.cycle_left += cpu.cycles;
                        cpu.cycles = 1;
                        let mut bus = CodeBus::new(mem, &mut rt.cache);
                        let exit = if ret == BlockReturn::OpcodeFull {
                            platform.run_full(cpu, &mut bus)
                        } else {
                            platform.run_normal(cpu, &mut bus)
                        };
                        DispatchState::Exit(exit)
                    }
                    BlockReturn::Callback => {
                        stats.callbacks += 1;
                        DispatchState::Exit(CoreExit::Callback(callback))
                    }
                    BlockReturn::Iret => {
                        if cpu.get_flag(FLAG_TF) {
                            self.trap = true;
                            DispatchState::Exit(CoreExit::Continue)
                        } else if cpu.get_flag(FLAG_IF) && platform.irq_pending(cpu) {
                            DispatchState::Exit(CoreExit::Continue)
                        } else {
                            DispatchState::Lookup
                        }
                    }
                },

                DispatchState::Exit(exit) => return Ok(exit),
            };
        }
    }

    /// The block starting at `CS:EIP`, translated if it does not exist yet. `None` when the page
    /// is not present, cannot hold code, or keeps being rewritten there.
    pub fn prepare_block<M: GuestMemory + ?Sized>(
        &mut self,
        cpu: &CpuState,
        mem: &mut M,
    ) -> Result<Option<BlockId>, DynrecError> {
        let Some(rt) = self.runtime.as_mut() else {
            return Ok(None);
        };
        let linear = cpu.ip_linear();
        let Ok(Some(page)) = rt.cache.make_code_page(mem, linear, cpu.code_big, None) else {
            return Ok(None);
        };
        let offset = linear & PAGE_MASK;
        if let Some(id) = rt.cache.find_cache_block(page, offset as u16) {
            return Ok(Some(id));
        }
        if rt.cache.is_heavily_rewritten(page, offset as usize) {
            return Ok(None);
        }
        self.stats.translations += 1;
        create_block(
            &mut rt.cache,
            rt.emitter.as_mut(),
            &mut rt.arena,
            mem,
            cpu,
            page,
        )
        .map(Some)
    }

    /// Runs block `id` (and whatever it is linked to) once, without acting on its exit.
    pub fn execute_block<M, P>(
        &mut self,
        id: BlockId,
        cpu: &mut CpuState,
        mem: &mut M,
        platform: &mut P,
    ) -> Result<BlockReturn, DynrecError>
    where
        M: GuestMemory + ?Sized,
        P: Platform + ?Sized,
    {
        let Some(rt) = self.runtime.as_mut() else {
            return Ok(BlockReturn::Opcode);
        };
        self.stats.block_runs += 1;
        execute(rt, cpu, mem, platform, &mut self.stats, id).map(|(ret, ..)| ret)
    }

    /// Executes one instruction in the interpreter and raises `#DB` after it unless the
    /// interpreter asked to skip it.
    fn trap_run<M, P>(&mut self, cpu: &mut CpuState, mem: &mut M, platform: &mut P) -> CoreExit
    where
        M: GuestMemory + ?Sized,
        P: Platform + ?Sized,
    {
        self.stats.interpreter_steps += 1;
        let mut bus = match self.runtime.as_mut() {
            Some(rt) => CodeBus::new(mem, &mut rt.cache),
            None => CodeBus::unmonitored(mem),
        };
        let old = cpu.cycles;
        cpu.cycles = 1;
        cpu.trap_skip = false;
        let exit = platform.run_normal(cpu, &mut bus);
        if !cpu.trap_skip {
            platform.raise_exception(cpu, &mut bus, VECTOR_DEBUG, None);
        }
        cpu.cycles = old - 1;
        exit
    }
}

/// Resolves an unlinked exit of `running` through `slot`: the block at the new `CS:EIP`, if one
/// exists for the current code size.
fn link_target<M: GuestMemory + ?Sized>(
    cache: &CodeCache,
    cpu: &CpuState,
    mem: &mut M,
    running: Option<BlockId>,
    slot: usize,
) -> Option<(BlockId, BlockId)> {
    let from = running?;
    let block = cache.block(from);
    if !block.is_live() || block.is_cross() || block.link_target(slot) != LinkTarget::Exit {
        return None;
    }
    let linear = cpu.ip_linear();
    let phys = mem.translate(linear, false).ok()?;
    let page = cache.page_for_phys(phys >> PAGE_SHIFT)?;
    if cache.page(page).code_big() != cpu.code_big {
        return None;
    }
    let to = cache.find_cache_block(page, (linear & PAGE_MASK) as u16)?;
    Some((from, to))
}

fn execute<M, P>(
    rt: &mut Runtime,
    cpu: &mut CpuState,
    mem: &mut M,
    platform: &mut P,
    stats: &mut DispatchStats,
    id: BlockId,
) -> Result<(BlockReturn, Option<BlockId>, u32), DynrecError>
where
    M: GuestMemory + ?Sized,
    P: Platform + ?Sized,
{
    let entry = rt.cache.code_addr(id);
    let cpu: *mut CpuState = cpu;
    let mut env = BlockEnv {
        cache: &mut rt.cache,
        mem,
        platform,
        cpu,
        stats,
    };
    let env: *mut (dyn HelperEnv + '_) = &mut env;
    let mut frame = JitFrame::new(env);
    // SAFETY: `entry` is a block this runtime emitted into its own arena with the runtime in
    // `layout`. `cpu` and `frame` outlive the call and `frame.env` points at `env`, which lives
    // until after it returns.
    let raw = unsafe {
        rt.emitter
            .execute(&rt.arena, &rt.layout, entry, cpu, &mut frame)
    };
    let ret = BlockReturn::decode(raw)?;
    Ok((ret, frame.running_block(), frame.callback))
}

/// The dispatcher side of the helper calls made by a running block.
struct BlockEnv<'a, M: ?Sized, P: ?Sized> {
    cache: &'a mut CodeCache,
    mem: &'a mut M,
    platform: &'a mut P,
    /// Shared with the generated code, which holds no references into it across helper calls.
    cpu: *mut CpuState,
    stats: &'a mut DispatchStats,
}

impl<M: GuestMemory + ?Sized, P: Platform + ?Sized> BlockEnv<'_, M, P> {
    fn cpu(&mut self) -> &mut CpuState {
        // SAFETY: see `cpu`; the reference does not outlive the helper call.
        unsafe { &mut *self.cpu }
    }

    /// Delivers `#PF` and makes the block leave; the faulting instruction restarts after the
    /// handler.
    fn page_fault(&mut self, fault: PageFault) -> BlockReturn {
        self.stats.page_faults += 1;
        // SAFETY: as in `cpu()`.
        let cpu = unsafe { &mut *self.cpu };
        let mut bus = CodeBus::new(&mut *self.mem, &mut *self.cache);
        self.platform.page_fault(cpu, &mut bus, fault);
        BlockReturn::Normal
    }

    fn raise(&mut self, vector: u8) -> BlockReturn {
        // SAFETY: as in `cpu()`.
        let cpu = unsafe { &mut *self.cpu };
        let mut bus = CodeBus::new(&mut *self.mem, &mut *self.cache);
        self.platform.raise_exception(cpu, &mut bus, vector, None);
        BlockReturn::Normal
    }

    fn pop(&mut self, sp: &mut u32, width: Width) -> Result<u32, BlockReturn> {
        let cpu = self.cpu();
        let stack_mask = cpu.stack_width().mask();
        let linear = cpu.seg_base[Seg::Ss.index()].wrapping_add(*sp & stack_mask);
        let read = CodeBus::new(&mut *self.mem, &mut *self.cache).read(linear, width);
        let value = read.map_err(|fault| self.page_fault(fault))?;
        *sp = sp.wrapping_add(width.bytes()) & stack_mask;
        Ok(value)
    }
}

impl<M: GuestMemory + ?Sized, P: Platform + ?Sized> HelperEnv for BlockEnv<'_, M, P> {
    fn load(&mut self, linear: u32, width: Width) -> Result<u32, BlockReturn> {
        let read = CodeBus::new(&mut *self.mem, &mut *self.cache).read(linear, width);
        read.map_err(|fault| self.page_fault(fault))
    }

    fn store(
        &mut self,
        linear: u32,
        width: Width,
        value: u32,
        running: Option<BlockId>,
    ) -> Result<(), BlockReturn> {
        let last = linear.wrapping_add(width.bytes() - 1);
        let paddr = self
            .mem
            .translate(linear, true)
            .map_err(|fault| self.page_fault(fault))?;
        let hit = if (linear ^ last) >> PAGE_SHIFT == 0 {
            self.cache
                .write_checked(&mut *self.mem, paddr, width, value, running)
        } else {
            // Both pages must be present before anything is written.
            self.mem
                .translate(last, true)
                .map_err(|fault| self.page_fault(fault))?;
            let mut hit = false;
            let bytes = value.to_le_bytes();
            for (i, byte) in bytes.into_iter().take(width.bytes() as usize).enumerate() {
                let paddr = self
                    .mem
                    .translate(linear.wrapping_add(i as u32), true)
                    .map_err(|fault| self.page_fault(fault))?;
                if self.cache.write_checked(
                    &mut *self.mem,
                    paddr,
                    Width::W8,
                    u32::from(byte),
                    running,
                ) {
                    hit = true;
                    break;
                }
            }
            hit
        };
        if hit {
            self.stats.smc_exits += 1;
            return Err(BlockReturn::SmcBlock);
        }
        Ok(())
    }

    fn load_phys(&mut self, paddr: u32, width: Width) -> u32 {
        read_phys(&*self.mem, paddr, width)
    }

    fn divide(&mut self, width: Width, signed: bool, divisor: u32) -> Result<(), BlockReturn> {
        let cpu = self.cpu();
        let (lo, hi) = match width {
            Width::W8 => (Reg::new(Gpr::Eax, Width::W8), Reg::high8(Gpr::Eax)),
            Width::W16 => (Reg::new(Gpr::Eax, Width::W16), Reg::new(Gpr::Edx, Width::W16)),
            Width::W32 => (Reg::new(Gpr::Eax, Width::W32), Reg::new(Gpr::Edx, Width::W32)),
        };
        let bits = width.bits();
        // AX holds the whole 16-bit dividend for byte division.
        let dividend = (u64::from(cpu.reg(hi)) << bits) | u64::from(cpu.reg(lo));
        let divisor = divisor & width.mask();

        let result = if signed {
            let dividend = ((dividend << (64 - 2 * bits)) as i64) >> (64 - 2 * bits);
            let divisor = i64::from(width.sign_extend(divisor) as i32);
            let limit = 1i64 << (bits - 1);
            dividend
                .checked_div(divisor)
                .zip(dividend.checked_rem(divisor))
                .filter(|&(q, _)| (-limit..limit).contains(&q))
                .map(|(q, r)| (q as u32, r as u32))
        } else {
            let divisor = u64::from(divisor);
            dividend
                .checked_div(divisor)
                .filter(|&q| q <= u64::from(width.mask()))
                .map(|q| (q as u32, (dividend % divisor) as u32))
        };

        match result {
            Some((quotient, remainder)) => {
                cpu.set_reg(lo, quotient);
                cpu.set_reg(hi, remainder);
                Ok(())
            }
            None => {
                self.stats.divide_errors += 1;
                Err(self.raise(VECTOR_DIVIDE_ERROR))
            }
        }
    }

    fn interpret(&mut self, next_eip: u32, running: Option<BlockId>) -> Result<(), BlockReturn> {
        self.stats.interpreter_steps += 1;
        // SAFETY: as in `cpu()`.
        let cpu = unsafe { &mut *self.cpu };
        let old = cpu.cycles;
        cpu.cycles = 1;
        let exit = self
            .platform
            .run_normal(cpu, &mut CodeBus::new(&mut *self.mem, &mut *self.cache));
        cpu.cycles = old;
        let stale = running.is_some_and(|id| !self.cache.block(id).is_live());
        if stale || exit != CoreExit::Continue || cpu.eip != next_eip {
            return Err(BlockReturn::Normal);
        }
        Ok(())
    }

    fn iret(&mut self, width: Width) -> Result<(), BlockReturn> {
        let sp_reg = Reg::new(Gpr::Esp, self.cpu().stack_width());
        let mut sp = self.cpu().reg(sp_reg);
        let ip = self.pop(&mut sp, width)?;
        let cs = self.pop(&mut sp, width)?;
        let flags = self.pop(&mut sp, width)?;

        let cpu = self.cpu();
        let mask = match width {
            Width::W32 => IRET_MASK_32,
            _ => IRET_MASK_16,
        };
        cpu.eip = ip & width.mask();
        cpu.load_real_segment(Seg::Cs, cs as u16);
        cpu.eflags = (cpu.eflags & !mask) | (flags & mask) | FLAG_RESERVED1;
        cpu.set_reg(sp_reg, sp);
        Ok(())
    }
}
