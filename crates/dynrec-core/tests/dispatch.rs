mod common;

use common::{Machine, Raised, HANDLER, STACK_TOP};
use dynrec_core::state::{FLAG_IF, FLAG_RESERVED1, FLAG_TF, VECTOR_DEBUG, VECTOR_DIVIDE_ERROR};
use dynrec_core::{
    BackendKind, BlockReturn, ConfigError, CoreExit, Dynrec, DynrecConfig, DynrecError, LinkTarget,
    PageFault,
};
use dynrec_x86::Gpr;

#[test]
fn store_into_running_block_exits_and_replays() {
    let mut m = Machine::new();
    m.load(
        0x100,
        &[
            0xC6, 0x06, 0x06, 0x01, 0x90, // mov byte [0x106], 0x90
            0x40, // inc ax
            0x40, // inc ax (becomes nop)
            0xF4, // hlt
        ],
    );
    m.cpu.eip = 0x100;

    let first = m.slice();
    assert_eq!(first, CoreExit::Continue);
    let stats = m.core.stats();
    assert_eq!(stats.smc_exits, 1);
    assert_eq!(stats.interpreter_steps, 1);
    // The interpreter performed the store and moved past it.
    assert_eq!(m.mem.bytes(0x106, 1), &[0x90]);
    assert_eq!(m.cpu.eip, 0x105);
    assert!(m.cpu.cycle_left > 0);

    m.run_until_halt(4);
    assert_eq!(m.ax(), 1);
}

#[test]
fn store_into_own_cross_page_half_exits_and_replays() {
    let mut m = Machine::new();
    m.load(
        0x0FF9,
        &[
            0xC6, 0x06, 0x00, 0x10, 0x02, // mov byte [0x1000], 0x02
            0xB8, 0x01, 0x00, // mov ax, 1 (straddles into the next page)
            0xF4, // hlt
        ],
    );
    m.cpu.eip = 0x0FF9;
    let id = m
        .core
        .prepare_block(&m.cpu, &mut m.mem)
        .expect("translate")
        .expect("block");
    let cross = m.cache().block(id).cross_block().expect("cross block");

    assert_eq!(m.slice(), CoreExit::Continue);
    assert_eq!(m.core.stats().smc_exits, 1);
    assert!(!m.cache().block(id).is_live());
    assert!(!m.cache().block(cross).is_live());
    assert_eq!(m.mem.bytes(0x1000, 1), &[0x02]);
    assert_eq!(m.cpu.eip, 0x0FFE);

    m.run_until_halt(4);
    assert_eq!(m.ax(), 0x0201);
    assert_eq!(m.core.stats().smc_exits, 1);
}

#[test]
fn callback_opcode_exits_with_its_number() {
    let mut m = Machine::new();
    // inc ax; callback 7; inc ax; hlt
    m.load(0x100, &[0x40, 0xFE, 0x38, 0x07, 0x00, 0x40, 0xF4]);
    m.cpu.eip = 0x100;

    assert_eq!(m.slice(), CoreExit::Callback(7));
    assert_eq!(m.cpu.eip, 0x105);
    assert_eq!(m.ax(), 1);
    assert_eq!(m.core.stats().callbacks, 1);
    assert_eq!(m.cpu.cycles, common::SLICE - 2);

    m.run_until_halt(4);
    assert_eq!(m.ax(), 2);
}

#[test]
fn exhausted_budget_leaves_before_the_first_instruction() {
    let mut m = Machine::new();
    m.load(0x100, &[0x40, 0xF4]);
    m.cpu.eip = 0x100;
    m.cpu.cycles = 0;

    let exit = m
        .core
        .run(&mut m.cpu, &mut m.mem, &mut m.platform)
        .expect("run");
    assert_eq!(exit, CoreExit::Continue);
    assert_eq!(m.cpu.eip, 0x100);
    assert_eq!(m.ax(), 0);
}

#[test]
fn self_loop_links_and_spends_the_budget() {
    let mut m = Machine::new();
    // top: inc ax; jmp top
    m.load(0x100, &[0x40, 0xEB, 0xFD]);
    m.cpu.eip = 0x100;
    m.cpu.cycles = 100;

    let exit = m
        .core
        .run(&mut m.cpu, &mut m.mem, &mut m.platform)
        .expect("run");
    assert_eq!(exit, CoreExit::Continue);
    assert_eq!(m.ax(), 50);
    assert_eq!(m.cpu.cycles, 0);
    assert_eq!(m.cpu.eip, 0x100);

    let stats = m.core.stats();
    assert_eq!(stats.translations, 1);
    assert_eq!(stats.links, 1);

    let cache = m.cache();
    let page = cache.page_for_phys(0).expect("page");
    let id = cache.find_cache_block(page, 0x100).expect("block");
    assert_eq!(cache.block(id).link_target(0), LinkTarget::Block(id));
    assert_eq!(cache.link_entry(id, 0), cache.code_addr(id));
}

#[test]
fn conditional_branch_takes_slot_two() {
    let mut m = Machine::new();
    m.load(
        0x100,
        &[
            0x48, // top: dec ax
            0x75, 0xFD, // jnz top
            0xF4, // hlt
        ],
    );
    m.cpu.eip = 0x100;
    m.cpu.set_gpr(Gpr::Eax, 5);

    m.run_until_halt(4);
    assert_eq!(m.ax(), 0);

    let cache = m.cache();
    let page = cache.page_for_phys(0).expect("page");
    let id = cache.find_cache_block(page, 0x100).expect("block");
    // Taken branch back to itself is linked; the fall-through block starts at the HLT.
    assert_eq!(cache.block(id).link_target(1), LinkTarget::Block(id));
}

#[test]
fn divide_by_zero_raises_de_at_the_instruction() {
    let mut m = Machine::new();
    // inc ax; div bx; hlt
    m.load(0x100, &[0x40, 0xF7, 0xF3, 0xF4]);
    m.cpu.eip = 0x100;

    m.run_until_halt(4);
    assert_eq!(
        m.platform.exceptions,
        [Raised {
            vector: VECTOR_DIVIDE_ERROR,
            error_code: None,
            eip: 0x101,
        }]
    );
    assert_eq!(m.core.stats().divide_errors, 1);
    assert_eq!(m.cpu.eip, HANDLER + 1);
}

#[test]
fn divide_writes_quotient_and_remainder() {
    let mut m = Machine::new();
    // div bx; idiv cl; hlt
    m.load(0x100, &[0xF7, 0xF3, 0xF6, 0xF9, 0xF4]);
    m.cpu.eip = 0x100;
    m.cpu.set_gpr(Gpr::Eax, 100);
    m.cpu.set_gpr(Gpr::Ebx, 7);
    m.cpu.set_gpr(Gpr::Ecx, 0xFD); // -3

    m.run_until_halt(4);
    // 100 / 7 = 14 r 2, then AX = 14: 14 / -3 = -4 r 2
    assert_eq!(m.cpu.gpr(Gpr::Edx) & 0xFFFF, 2);
    assert_eq!(m.ax() & 0xFF, 0xFC);
    assert_eq!(m.ax() >> 8, 2);
    assert!(m.platform.exceptions.is_empty());
}

#[test]
fn page_fault_on_store_restarts_the_instruction() {
    let mut m = Machine::new();
    // inc ax; push ax; hlt
    m.load(0x100, &[0x40, 0x50, 0xF4]);
    m.cpu.eip = 0x100;
    m.mem.set_present((STACK_TOP - 2) >> 12, false);

    m.run_until_halt(4);
    assert_eq!(
        m.platform.exceptions,
        [Raised {
            vector: 14,
            error_code: Some(PageFault::ERR_WRITE),
            eip: 0x101,
        }]
    );
    // The push did not happen.
    assert_eq!(m.cpu.gpr(Gpr::Esp), STACK_TOP);
    assert_eq!(m.ax(), 1);
    assert_eq!(m.core.stats().page_faults, 1);
}

#[test]
fn page_fault_on_fetch_is_delivered_before_translation() {
    let mut m = Machine::new();
    m.cpu.eip = 0x1000;
    m.mem.set_present(1, false);

    m.run_until_halt(4);
    assert_eq!(
        m.platform.exceptions,
        [Raised {
            vector: 14,
            error_code: Some(0),
            eip: 0x1000,
        }]
    );
    assert_eq!(m.cache().page_for_phys(1), None);
}

#[test]
fn iret_with_trap_flag_single_steps_next_instruction() {
    let mut m = Machine::new();
    m.load(0x100, &[0xCF]); // iret
    m.load(0x200, &[0x40, 0xF4]); // inc ax; hlt
    let frame = [0x200u16, 0x0000, (FLAG_TF | FLAG_RESERVED1) as u16];
    let bytes: Vec<u8> = frame.iter().flat_map(|w| w.to_le_bytes()).collect();
    m.load(STACK_TOP, &bytes);
    m.cpu.eip = 0x100;

    assert_eq!(m.slice(), CoreExit::Continue);
    assert_eq!(m.cpu.eip, 0x200);
    assert!(m.cpu.get_flag(FLAG_TF));
    assert_eq!(m.cpu.gpr(Gpr::Esp), STACK_TOP + 6);

    // Next slice runs exactly one instruction, then raises #DB.
    m.slice();
    assert_eq!(m.ax(), 1);
    assert_eq!(
        m.platform.exceptions,
        [Raised {
            vector: VECTOR_DEBUG,
            error_code: None,
            eip: 0x201,
        }]
    );
}

#[test]
fn iret_with_pending_interrupt_returns_to_scheduler() {
    let mut m = Machine::new();
    m.load(0x100, &[0xCF]);
    m.load(0x200, &[0x40, 0xF4]);
    let frame = [0x200u16, 0x0000, (FLAG_IF | FLAG_RESERVED1) as u16];
    let bytes: Vec<u8> = frame.iter().flat_map(|w| w.to_le_bytes()).collect();
    m.load(STACK_TOP, &bytes);
    m.cpu.eip = 0x100;
    m.platform.irq = true;

    assert_eq!(m.slice(), CoreExit::Continue);
    assert_eq!(m.cpu.eip, 0x200);
    assert_eq!(m.ax(), 0);

    m.platform.irq = false;
    m.run_until_halt(4);
    assert_eq!(m.ax(), 1);
}

#[test]
fn unsupported_instruction_goes_to_interpreter() {
    let mut m = Machine::new();
    // inc ax; stc; inc ax; hlt
    m.load(0x100, &[0x40, 0xF9, 0x40, 0xF4]);
    m.cpu.eip = 0x100;

    let first = m.slice();
    assert_eq!(first, CoreExit::Continue);
    // The block stopped at STC, which ran alone in the interpreter.
    assert_eq!(m.cpu.eip, 0x102);
    assert!(m.cpu.get_flag(dynrec_core::state::FLAG_CF));
    assert_eq!(m.cpu.cycles, 0);
    assert_eq!(m.cpu.cycle_left, common::SLICE - 1);

    m.run_until_halt(4);
    assert_eq!(m.ax(), 2);
}

#[test]
fn fpu_escape_runs_inline_through_the_interpreter() {
    let mut m = Machine::new();
    // inc ax; fld st(0); inc ax; hlt
    m.load(0x100, &[0x40, 0xD9, 0xC0, 0x40, 0xF4]);
    m.cpu.eip = 0x100;

    m.run_until_halt(4);
    assert_eq!(m.ax(), 2);
    // One block covers everything; it ends by handing the HLT to the interpreter.
    assert_eq!(m.core.stats().translations, 1);
    assert_eq!(m.core.stats().interpreter_steps, 2);
}

#[test]
fn execute_block_reports_raw_exit() {
    let mut m = Machine::new();
    m.load(0x100, &[0x40, 0xF4]);
    m.cpu.eip = 0x100;
    m.cpu.cycles = 10;
    let id = m
        .core
        .prepare_block(&m.cpu, &mut m.mem)
        .expect("translate")
        .expect("block");

    let ret = m
        .core
        .execute_block(id, &mut m.cpu, &mut m.mem, &mut m.platform)
        .expect("execute");
    assert_eq!(ret, BlockReturn::Opcode);
    assert_eq!(m.cpu.eip, 0x101);
    assert_eq!(m.cpu.cycles, 9);
}

#[test]
fn disabled_core_interprets_everything() {
    let mut m = Machine::with_config(common::portable_config(), false);
    m.load(0x100, &[0x40, 0x40, 0xF4]);
    m.cpu.eip = 0x100;

    assert!(!m.core.is_enabled());
    assert!(m.core.cache().is_none());
    let lookup = m.core.prepare_block(&m.cpu, &mut m.mem).expect("lookup");
    assert_eq!(lookup, None);

    m.run_until_halt(2);
    assert_eq!(m.ax(), 2);
    assert_eq!(m.core.stats().interpreter_runs, 1);
    assert_eq!(m.core.stats().translations, 0);
}

#[test]
fn initialize_is_idempotent_and_shutdown_clears() {
    let mut m = Machine::new();
    m.load(0x100, &[0x40, 0xF4]);
    m.cpu.eip = 0x100;
    m.run_until_halt(4);
    assert!(m.cache().page_for_phys(0).is_some());

    m.core.initialize(true).expect("second initialize");
    assert!(m.cache().page_for_phys(0).is_some());

    m.core.shutdown();
    assert!(!m.core.is_enabled());

    m.core.initialize(true).expect("re-initialize");
    assert_eq!(m.cache().page_for_phys(0), None);
    m.restart_at(0x100);
    m.run_until_halt(4);
    assert_eq!(m.ax(), 2);
}

#[test]
fn invalid_config_is_rejected() {
    let mut core = Dynrec::new(DynrecConfig {
        max_block_size: 1000,
        backend: BackendKind::Portable,
        ..DynrecConfig::small()
    });
    let err = core.initialize(true).expect_err("bad config");
    assert!(matches!(
        err,
        DynrecError::Config(ConfigError::NotPowerOfTwo {
            field: "max_block_size",
            value: 1000,
        })
    ));
    assert!(!core.is_enabled());
}
