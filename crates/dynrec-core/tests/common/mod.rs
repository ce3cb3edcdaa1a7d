// Shared test helpers (integration tests compile as separate crates, so put
// common code in a submodule to avoid it becoming its own test target).
#![allow(dead_code)]

use dynrec_core::flags;
use dynrec_core::state::{
    FLAG_CF, FLAG_IF, FLAG_RESERVED1, IRET_MASK_16, IRET_MASK_32, VECTOR_DIVIDE_ERROR,
};
use dynrec_core::{
    BackendKind, CodeBus, CodeCache, CoreExit, CpuState, Dynrec, DynrecConfig, ExceptionSink,
    FlatMemory, GuestBus, Interpreter, PageFault,
};
use dynrec_x86::{decode, Address, Gpr, InstKind, Operand, Reg, Seg, Width, MAX_INST_LEN};

pub const RAM_SIZE: usize = 0x20000;
/// Every exception vector lands here; a `HLT` sits at this address.
pub const HANDLER: u32 = 0x0F00;
pub const STACK_TOP: u32 = 0x8000;
pub const SLICE: i32 = 1000;

const VECTOR_INVALID_OPCODE: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Raised {
    pub vector: u8,
    pub error_code: Option<u32>,
    /// EIP when the exception was raised.
    pub eip: u32,
}

/// Outcome of one interpreted instruction.
enum Step {
    Next,
    Callback(u32),
    Halt,
}

enum Fault {
    Page(PageFault),
    Vector(u8),
}

impl From<PageFault> for Fault {
    fn from(fault: PageFault) -> Self {
        Fault::Page(fault)
    }
}

/// Reference interpreter for the instruction subset the tests use.
///
/// Exceptions are recorded and "delivered" by jumping to [`HANDLER`].
#[derive(Debug, Default)]
pub struct TestPlatform {
    pub exceptions: Vec<Raised>,
    /// Instructions executed.
    pub steps: u64,
    pub full_runs: u64,
    pub halted: bool,
    pub irq: bool,
}

impl TestPlatform {
    fn step(&mut self, cpu: &mut CpuState, bus: &mut dyn GuestBus) -> Step {
        let mut buf = [0u8; MAX_INST_LEN];
        let mut len = 0;
        let mut fetch_fault = None;
        for (i, b) in buf.iter_mut().enumerate() {
            let ip = cpu.eip.wrapping_add(i as u32) & cpu.ip_mask();
            match bus.read_u8(cpu.seg_base[Seg::Cs.index()].wrapping_add(ip)) {
                Ok(v) => {
                    *b = v;
                    len += 1;
                }
                Err(fault) => {
                    fetch_fault = Some(fault);
                    break;
                }
            }
        }
        let inst = match decode(&buf[..len], cpu.eip, cpu.code_big) {
            Ok(inst) => inst,
            Err(err) => match fetch_fault {
                Some(fault) => {
                    self.page_fault(cpu, bus, fault);
                    return Step::Next;
                }
                None => panic!("undecodable instruction at {:#x}: {err}", cpu.eip),
            },
        };

        self.steps += 1;
        let next = inst.next_ip(cpu.code_big);
        let ip_mask = cpu.ip_mask();
        let width = inst.width;
        let result = (|| -> Result<Step, Fault> {
            match inst.kind {
                InstKind::Mov { dst, src } => {
                    let v = read(cpu, bus, src, width)?;
                    write(cpu, bus, dst, width, v)?;
                }
                InstKind::Alu { op, dst, src } => {
                    let a = read(cpu, bus, dst, width)?;
                    let b = read(cpu, bus, src, width)?;
                    let (r, eflags) = flags::alu(op, width, a, b, cpu.eflags);
                    if op.writes_result() {
                        write(cpu, bus, dst, width, r)?;
                    }
                    cpu.eflags = eflags;
                }
                InstKind::Unary { op, dst } => {
                    let a = read(cpu, bus, dst, width)?;
                    let (r, eflags) = flags::unary(op, width, a, cpu.eflags);
                    write(cpu, bus, dst, width, r)?;
                    cpu.eflags = eflags;
                }
                InstKind::Lea { dst, addr } => cpu.set_reg(dst, offset(cpu, &addr)),
                InstKind::Push { src } => {
                    let v = read(cpu, bus, src, width)?;
                    push(cpu, bus, width, v)?;
                }
                InstKind::Pop { dst } => {
                    let mut sp = sp(cpu);
                    let v = pop(cpu, bus, &mut sp, width)?;
                    set_sp(cpu, sp);
                    cpu.set_reg(dst, v);
                }
                InstKind::Jmp { target } => {
                    cpu.eip = target & ip_mask;
                    return Ok(Step::Next);
                }
                InstKind::Jcc { cond, target } => {
                    cpu.eip = if cond.holds(cpu.eflags) {
                        target & ip_mask
                    } else {
                        next
                    };
                    return Ok(Step::Next);
                }
                InstKind::Call { target } => {
                    push(cpu, bus, width, next)?;
                    cpu.eip = target & ip_mask;
                    return Ok(Step::Next);
                }
                InstKind::Ret { pop: extra } => {
                    let mut sp = sp(cpu);
                    let ip = pop(cpu, bus, &mut sp, width)?;
                    set_sp(cpu, sp.wrapping_add(u32::from(extra)));
                    cpu.eip = ip;
                    return Ok(Step::Next);
                }
                InstKind::Div { signed, src } => {
                    let divisor = read(cpu, bus, src, width)?;
                    if !divide(cpu, width, signed, divisor) {
                        return Err(Fault::Vector(VECTOR_DIVIDE_ERROR));
                    }
                }
                InstKind::Iret => {
                    let mut sp = sp(cpu);
                    let ip = pop(cpu, bus, &mut sp, width)?;
                    let cs = pop(cpu, bus, &mut sp, width)?;
                    let fl = pop(cpu, bus, &mut sp, width)?;
                    let mask = if width == Width::W32 {
                        IRET_MASK_32
                    } else {
                        IRET_MASK_16
                    };
                    set_sp(cpu, sp);
                    cpu.load_real_segment(Seg::Cs, cs as u16);
                    cpu.eflags = (cpu.eflags & !mask) | (fl & mask) | FLAG_RESERVED1;
                    cpu.eip = ip & width.mask();
                    return Ok(Step::Next);
                }
                InstKind::Nop | InstKind::Fpu => {}
                InstKind::Callback { index } => {
                    cpu.eip = next;
                    return Ok(Step::Callback(u32::from(index)));
                }
                InstKind::Other => match buf[0] {
                    0xF4 => {
                        cpu.eip = next;
                        return Ok(Step::Halt);
                    }
                    0xF8 => cpu.set_flag(FLAG_CF, false),
                    0xF9 => cpu.set_flag(FLAG_CF, true),
                    0xFA => cpu.set_flag(FLAG_IF, false),
                    0xFB => cpu.set_flag(FLAG_IF, true),
                    b => panic!("cannot interpret {b:#04x} at {:#x}", cpu.eip),
                },
                InstKind::Invalid => return Err(Fault::Vector(VECTOR_INVALID_OPCODE)),
            }
            cpu.eip = next;
            Ok(Step::Next)
        })();

        match result {
            Ok(step) => step,
            Err(Fault::Vector(vector)) => {
                self.raise_exception(cpu, bus, vector, None);
                Step::Next
            }
            Err(Fault::Page(fault)) => {
                self.page_fault(cpu, bus, fault);
                Step::Next
            }
        }
    }
}

impl Interpreter for TestPlatform {
    fn run_normal(&mut self, cpu: &mut CpuState, bus: &mut dyn GuestBus) -> CoreExit {
        while cpu.cycles > 0 {
            cpu.cycles -= 1;
            match self.step(cpu, bus) {
                Step::Next => {}
                Step::Callback(n) => return CoreExit::Callback(n),
                Step::Halt => {
                    self.halted = true;
                    cpu.cycles = 0;
                }
            }
        }
        CoreExit::Continue
    }

    fn run_full(&mut self, cpu: &mut CpuState, bus: &mut dyn GuestBus) -> CoreExit {
        self.full_runs += 1;
        self.run_normal(cpu, bus)
    }
}

impl ExceptionSink for TestPlatform {
    fn raise_exception(
        &mut self,
        cpu: &mut CpuState,
        _bus: &mut dyn GuestBus,
        vector: u8,
        error_code: Option<u32>,
    ) {
        self.exceptions.push(Raised {
            vector,
            error_code,
            eip: cpu.eip,
        });
        cpu.eip = HANDLER;
    }

    fn irq_pending(&self, _cpu: &CpuState) -> bool {
        self.irq
    }
}

fn offset(cpu: &CpuState, addr: &Address) -> u32 {
    let mut ea = addr.disp;
    if let Some(base) = addr.base {
        ea = ea.wrapping_add(cpu.gpr(base));
    }
    if let Some(index) = addr.index {
        ea = ea.wrapping_add(cpu.gpr(index).wrapping_mul(u32::from(addr.scale)));
    }
    if addr.addr16 {
        ea &= 0xFFFF;
    }
    ea
}

fn linear(cpu: &CpuState, addr: &Address) -> u32 {
    cpu.seg_base[addr.seg.index()].wrapping_add(offset(cpu, addr))
}

fn read(
    cpu: &CpuState,
    bus: &mut dyn GuestBus,
    op: Operand,
    width: Width,
) -> Result<u32, PageFault> {
    match op {
        Operand::Reg(reg) => Ok(cpu.reg(reg)),
        Operand::Imm(imm) => Ok(imm.value & width.mask()),
        Operand::Mem(addr) => bus.read(linear(cpu, &addr), width),
    }
}

fn write(
    cpu: &mut CpuState,
    bus: &mut dyn GuestBus,
    op: Operand,
    width: Width,
    value: u32,
) -> Result<(), PageFault> {
    match op {
        Operand::Reg(reg) => {
            cpu.set_reg(reg, value);
            Ok(())
        }
        Operand::Mem(addr) => bus.write(linear(cpu, &addr), width, value),
        Operand::Imm(_) => panic!("immediate destination"),
    }
}

fn sp_reg(cpu: &CpuState) -> Reg {
    Reg::new(Gpr::Esp, cpu.stack_width())
}

fn sp(cpu: &CpuState) -> u32 {
    cpu.reg(sp_reg(cpu))
}

fn set_sp(cpu: &mut CpuState, value: u32) {
    let reg = sp_reg(cpu);
    cpu.set_reg(reg, value);
}

fn push(
    cpu: &mut CpuState,
    bus: &mut dyn GuestBus,
    width: Width,
    value: u32,
) -> Result<(), PageFault> {
    let sp = sp(cpu).wrapping_sub(width.bytes()) & cpu.stack_width().mask();
    bus.write(cpu.seg_base[Seg::Ss.index()].wrapping_add(sp), width, value)?;
    set_sp(cpu, sp);
    Ok(())
}

fn pop(
    cpu: &CpuState,
    bus: &mut dyn GuestBus,
    sp: &mut u32,
    width: Width,
) -> Result<u32, PageFault> {
    let value = bus.read(cpu.seg_base[Seg::Ss.index()].wrapping_add(*sp), width)?;
    *sp = sp.wrapping_add(width.bytes()) & cpu.stack_width().mask();
    Ok(value)
}

fn divide(cpu: &mut CpuState, width: Width, signed: bool, divisor: u32) -> bool {
    let (lo, hi) = match width {
        Width::W8 => (Reg::new(Gpr::Eax, Width::W8), Reg::high8(Gpr::Eax)),
        Width::W16 => (Reg::new(Gpr::Eax, Width::W16), Reg::new(Gpr::Edx, Width::W16)),
        Width::W32 => (Reg::new(Gpr::Eax, Width::W32), Reg::new(Gpr::Edx, Width::W32)),
    };
    let bits = width.bits();
    let dividend = (u64::from(cpu.reg(hi)) << bits) | u64::from(cpu.reg(lo));
    let divisor = divisor & width.mask();
    if divisor == 0 {
        return false;
    }
    let (q, r) = if signed {
        let n = ((dividend << (64 - 2 * bits)) as i64) >> (64 - 2 * bits);
        let d = i64::from(width.sign_extend(divisor) as i32);
        let (Some(q), Some(r)) = (n.checked_div(d), n.checked_rem(d)) else {
            return false;
        };
        let limit = 1i64 << (bits - 1);
        if q < -limit || q >= limit {
            return false;
        }
        (q as u32, r as u32)
    } else {
        let q = dividend / u64::from(divisor);
        if q > u64::from(width.mask()) {
            return false;
        }
        (q as u32, (dividend % u64::from(divisor)) as u32)
    };
    cpu.set_reg(lo, q);
    cpu.set_reg(hi, r);
    true
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn portable_config() -> DynrecConfig {
    DynrecConfig {
        backend: BackendKind::Portable,
        ..DynrecConfig::small()
    }
}

/// A real-mode machine: 128 KiB of RAM, all segments at zero, SP at [`STACK_TOP`] and a `HLT`
/// at [`HANDLER`].
pub struct Machine {
    pub core: Dynrec,
    pub cpu: CpuState,
    pub mem: FlatMemory,
    pub platform: TestPlatform,
}

impl Machine {
    pub fn new() -> Self {
        Self::with_config(portable_config(), true)
    }

    pub fn with_config(config: DynrecConfig, enable: bool) -> Self {
        init_tracing();
        let mut core = Dynrec::new(config);
        core.initialize(enable).expect("initialize dynamic core");
        let mut mem = FlatMemory::new(RAM_SIZE);
        mem.load(HANDLER, &[0xF4]);
        let mut cpu = CpuState::new_real_mode();
        cpu.set_gpr(Gpr::Esp, STACK_TOP);
        Self {
            core,
            cpu,
            mem,
            platform: TestPlatform::default(),
        }
    }

    pub fn load(&mut self, addr: u32, bytes: &[u8]) {
        self.mem.load(addr, bytes);
    }

    /// Stores through the code page monitors, like a device would.
    pub fn poke(&mut self, addr: u32, width: Width, value: u32) {
        self.bus().write(addr, width, value).expect("poke");
    }

    pub fn bus(&mut self) -> CodeBus<'_, FlatMemory> {
        self.core.bus(&mut self.mem)
    }

    pub fn cache(&self) -> &CodeCache {
        self.core.cache().expect("dynamic core is enabled")
    }

    pub fn ax(&self) -> u32 {
        self.cpu.reg(Reg::new(Gpr::Eax, Width::W16))
    }

    /// One scheduler slice: refills the budget (plus whatever the core parked) and runs.
    pub fn slice(&mut self) -> CoreExit {
        self.cpu.cycles = SLICE + std::mem::take(&mut self.cpu.cycle_left);
        self.core
            .run(&mut self.cpu, &mut self.mem, &mut self.platform)
            .expect("dynamic core run")
    }

    pub fn run_until_halt(&mut self, max_slices: usize) -> Vec<CoreExit> {
        let mut exits = Vec::new();
        for _ in 0..max_slices {
            if self.platform.halted {
                break;
            }
            exits.push(self.slice());
        }
        assert!(self.platform.halted, "guest did not halt");
        exits
    }

    /// Sets EIP and clears the halt latch for another run.
    pub fn restart_at(&mut self, eip: u32) {
        self.cpu.eip = eip;
        self.platform.halted = false;
    }
}
