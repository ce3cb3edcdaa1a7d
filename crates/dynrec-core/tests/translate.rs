mod common;

use common::Machine;
use dynrec_core::{BlockReturn, DynrecConfig, PageFlags};
use dynrec_x86::Width;

#[test]
fn instruction_straddling_pages_gets_a_cross_block() {
    let mut m = Machine::new();
    // mov ax, 1 split over the page boundary; hlt on the second page
    m.load(0x0FFE, &[0xB8, 0x01, 0x00, 0xF4]);
    m.cpu.eip = 0x0FFE;
    let id = m
        .core
        .prepare_block(&m.cpu, &mut m.mem)
        .expect("translate")
        .expect("block");

    let cache = m.cache();
    let first = cache.page_for_phys(0).expect("first page");
    let second = cache.page_for_phys(1).expect("second page");
    let cross = cache.block(id).cross_block().expect("cross block");

    assert!(!cache.block(id).is_cross());
    assert!(cache.block(cross).is_cross());
    assert_eq!(cache.block(cross).cross_block(), Some(id));
    assert_eq!(cache.block(id).owner(), Some(first));
    assert_eq!(cache.block(cross).owner(), Some(second));
    assert_eq!(cache.block(id).page_range(), (0xFFE, 0xFFF));
    assert_eq!(cache.block(cross).page_range(), (0, 1));
    assert_eq!(cache.page(first).write_map()[0xFFE], 1);
    assert_eq!(cache.page(first).write_map()[0xFFF], 1);
    assert_eq!(cache.page(second).write_map()[0], 1);
    assert_eq!(cache.page(second).write_map()[1], 1);
    assert_eq!(cache.page(second).write_map()[2], 0);
    // Cross blocks are never looked up by address.
    assert_eq!(cache.find_cache_block(second, 0), None);

    m.cpu.cycles = 10;
    let ret = m
        .core
        .execute_block(id, &mut m.cpu, &mut m.mem, &mut m.platform)
        .expect("execute");
    assert_eq!(ret, BlockReturn::Opcode);
    assert_eq!(m.ax(), 1);
    assert_eq!(m.cpu.eip, 0x1001);
}

#[test]
fn write_to_second_page_clears_both_halves() {
    let mut m = Machine::new();
    m.load(0x0FFE, &[0xB8, 0x01, 0x00, 0xF4]);
    m.cpu.eip = 0x0FFE;
    let id = m
        .core
        .prepare_block(&m.cpu, &mut m.mem)
        .expect("translate")
        .expect("block");
    let cross = m.cache().block(id).cross_block().expect("cross block");

    m.poke(0x1000, Width::W8, 0x02);

    let cache = m.cache();
    assert!(!cache.block(id).is_live());
    assert!(!cache.block(cross).is_live());
    let first = cache.page_for_phys(0).expect("first page");
    let second = cache.page_for_phys(1).expect("second page");
    assert_eq!(cache.page(first).active_blocks(), 0);
    assert_eq!(cache.page(second).active_blocks(), 0);
    assert!(cache.page(first).write_map().iter().all(|&c| c == 0));
    assert!(cache.page(second).write_map().iter().all(|&c| c == 0));
}

#[test]
fn no_code_second_page_ends_block_early() {
    let mut m = Machine::new();
    m.mem.set_page_flags(1, PageFlags::RAM | PageFlags::NO_CODE);
    // inc ax; mov ax, 1 straddling into the no-code page
    m.load(0x0FFD, &[0x40, 0xB8, 0x01, 0x00, 0xF4]);
    m.cpu.eip = 0x0FFD;
    let id = m
        .core
        .prepare_block(&m.cpu, &mut m.mem)
        .expect("translate")
        .expect("block");

    assert_eq!(m.cache().block(id).cross_block(), None);
    assert_eq!(m.cache().block(id).page_range(), (0xFFD, 0xFFD));

    m.cpu.cycles = 10;
    let ret = m
        .core
        .execute_block(id, &mut m.cpu, &mut m.mem, &mut m.platform)
        .expect("execute");
    // Leaves through the fall-through link with EIP at the straddling instruction.
    assert_eq!(ret, BlockReturn::Link1);
    assert_eq!(m.cpu.eip, 0x0FFE);
    assert_eq!(m.ax(), 1);
}

#[test]
fn rewritten_immediate_is_read_at_run_time() {
    let mut m = Machine::new();
    // mov ax, 0x1234; hlt
    m.load(0x100, &[0xB8, 0x34, 0x12, 0xF4]);
    m.cpu.eip = 0x100;
    let threshold = m.core.config().heavy_rewrite_threshold;

    for value in 0..u32::from(threshold) {
        m.core
            .prepare_block(&m.cpu, &mut m.mem)
            .expect("translate")
            .expect("block");
        m.poke(0x101, Width::W8, 0x50 + value);
    }

    let id = m
        .core
        .prepare_block(&m.cpu, &mut m.mem)
        .expect("translate")
        .expect("block");
    let cache = m.cache();
    let page = cache.page_for_phys(0).expect("page");
    assert!(cache.block(id).is_masked(0x101));
    assert!(cache.block(id).is_masked(0x102));
    assert!(!cache.block(id).is_masked(0x100));
    assert_eq!(cache.page(page).write_map()[0x100], 1);
    assert_eq!(cache.page(page).write_map()[0x101], 0);
    assert_eq!(cache.page(page).write_map()[0x102], 0);

    // Rewriting the immediate no longer costs the block.
    m.poke(0x101, Width::W16, 0xBEEF);
    assert!(m.cache().block(id).is_live());
    assert_eq!(m.cache().find_cache_block(page, 0x100), Some(id));

    m.cpu.cycles = 10;
    let ret = m
        .core
        .execute_block(id, &mut m.cpu, &mut m.mem, &mut m.platform)
        .expect("execute");
    assert_eq!(ret, BlockReturn::Opcode);
    assert_eq!(m.ax(), 0xBEEF);
}

#[test]
fn write_mask_grows_for_immediates_past_its_end() {
    let mut m = Machine::with_config(
        DynrecConfig {
            mask_initial_len: 4,
            mask_growth: 2,
            ..common::portable_config()
        },
        true,
    );
    // 5 x inc ax; mov ax, 0x1234; hlt
    m.load(0x100, &[0x40; 5]);
    m.load(0x105, &[0xB8, 0x34, 0x12, 0xF4]);
    m.cpu.eip = 0x100;
    let threshold = m.core.config().heavy_rewrite_threshold;

    for value in 0..u32::from(threshold) {
        m.core
            .prepare_block(&m.cpu, &mut m.mem)
            .expect("translate")
            .expect("block");
        m.poke(0x106, Width::W8, 0x50 + value);
    }
    let id = m
        .core
        .prepare_block(&m.cpu, &mut m.mem)
        .expect("translate")
        .expect("block");

    let block = m.cache().block(id);
    assert!(block.is_masked(0x106));
    assert!(block.is_masked(0x107));
    assert!(!block.is_masked(0x105));
    assert_eq!(block.mask_len(), 8);

    m.poke(0x106, Width::W16, 0xBEEF);
    assert!(m.cache().block(id).is_live());

    m.cpu.cycles = 20;
    let ret = m
        .core
        .execute_block(id, &mut m.cpu, &mut m.mem, &mut m.platform)
        .expect("execute");
    assert_eq!(ret, BlockReturn::Opcode);
    assert_eq!(m.ax(), 0xBEEF);
}

#[test]
fn sign_extended_runtime_immediate() {
    let mut m = Machine::new();
    // add ax, imm8 (sign-extended); hlt
    m.load(0x100, &[0x83, 0xC0, 0x01, 0xF4]);
    m.cpu.eip = 0x100;
    let threshold = m.core.config().heavy_rewrite_threshold;

    for value in 0..u32::from(threshold) {
        m.core
            .prepare_block(&m.cpu, &mut m.mem)
            .expect("translate")
            .expect("block");
        m.poke(0x102, Width::W8, 0x10 + value);
    }
    let id = m
        .core
        .prepare_block(&m.cpu, &mut m.mem)
        .expect("translate")
        .expect("block");
    assert!(m.cache().block(id).is_masked(0x102));

    m.poke(0x102, Width::W8, 0xFE); // -2
    m.cpu.set_gpr(dynrec_x86::Gpr::Eax, 5);
    m.cpu.cycles = 10;
    m.core
        .execute_block(id, &mut m.cpu, &mut m.mem, &mut m.platform)
        .expect("execute");
    assert_eq!(m.ax(), 3);
}

#[test]
fn heavily_rewritten_entry_is_interpreted() {
    let mut m = Machine::new();
    // inc ax; hlt
    m.load(0x100, &[0x40, 0xF4]);
    m.cpu.eip = 0x100;
    let threshold = m.core.config().heavy_rewrite_threshold;

    for i in 0..threshold {
        m.core
            .prepare_block(&m.cpu, &mut m.mem)
            .expect("translate")
            .expect("block");
        // Alternate between dec ax and inc ax.
        m.poke(0x100, Width::W8, if i % 2 == 0 { 0x48 } else { 0x40 });
    }
    let lookup = m.core.prepare_block(&m.cpu, &mut m.mem).expect("lookup");
    assert_eq!(lookup, None);
    let translations = m.core.stats().translations;

    m.run_until_halt(4);
    let expected_ax = if threshold % 2 == 0 { 1 } else { 0xFFFF };
    assert_eq!(m.ax(), expected_ax);
    // Only the HLT after the entry was translated.
    assert_eq!(m.core.stats().translations, translations + 1);
    assert!(m.core.stats().interpreter_steps >= 2);
}

#[test]
fn block_length_is_capped() {
    let mut m = Machine::with_config(
        DynrecConfig {
            max_instructions: 4,
            ..common::portable_config()
        },
        true,
    );
    let mut code = vec![0x40; 10];
    code.push(0xF4);
    m.load(0x100, &code);
    m.cpu.eip = 0x100;
    let id = m
        .core
        .prepare_block(&m.cpu, &mut m.mem)
        .expect("translate")
        .expect("block");
    assert_eq!(m.cache().block(id).page_range(), (0x100, 0x103));

    m.cpu.cycles = 100;
    let ret = m
        .core
        .execute_block(id, &mut m.cpu, &mut m.mem, &mut m.platform)
        .expect("execute");
    assert_eq!(ret, BlockReturn::Link1);
    assert_eq!(m.ax(), 4);
    assert_eq!(m.cpu.eip, 0x104);
    assert_eq!(m.cpu.cycles, 96);

    m.run_until_halt(4);
    assert_eq!(m.ax(), 10);
}

#[test]
fn unsupported_opcode_leaves_for_interpreter() {
    let mut m = Machine::new();
    // inc ax; ud0
    m.load(0x100, &[0x40, 0x0F, 0xFF]);
    m.cpu.eip = 0x100;
    let id = m
        .core
        .prepare_block(&m.cpu, &mut m.mem)
        .expect("translate")
        .expect("block");

    m.cpu.cycles = 10;
    let ret = m
        .core
        .execute_block(id, &mut m.cpu, &mut m.mem, &mut m.platform)
        .expect("execute");
    assert!(matches!(ret, BlockReturn::OpcodeFull | BlockReturn::Opcode));
    assert_eq!(m.cpu.eip, 0x101);
    assert_eq!(m.ax(), 1);
}
