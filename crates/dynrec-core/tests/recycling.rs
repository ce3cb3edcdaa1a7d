mod common;

use common::Machine;
use dynrec_core::{CodeCache, DynrecConfig, PageId, PAGE_SIZE};

fn with(config: DynrecConfig) -> Machine {
    Machine::with_config(config, true)
}

/// Write map of `page` as rebuilt from the blocks `find_cache_block` still returns.
fn live_coverage(cache: &CodeCache, page: PageId) -> (usize, Vec<u16>) {
    let mut live = 0;
    let mut coverage = vec![0u16; PAGE_SIZE];
    for start in 0..PAGE_SIZE as u16 {
        let Some(id) = cache.find_cache_block(page, start) else {
            continue;
        };
        live += 1;
        let (first, last) = cache.block(id).page_range();
        for off in first..=last {
            if !cache.block(id).is_masked(off) {
                coverage[usize::from(off)] += 1;
            }
        }
    }
    (live, coverage)
}

#[test]
fn wrapping_cursor_evicts_the_oldest_blocks() {
    let mut m = with(DynrecConfig {
        cache_size: 0x1000,
        max_block_size: 0x200,
        ..common::portable_config()
    });
    let mut code = vec![0x40; 64];
    code.push(0xF4);
    m.load(0x100, &code);

    let mut translated = 0u32;
    while m.cache().stats().wraps == 0 {
        assert!(translated < 64, "cursor never wrapped");
        m.cpu.eip = 0x100 + translated;
        m.core
            .prepare_block(&m.cpu, &mut m.mem)
            .expect("translate")
            .expect("block");
        translated += 1;
    }
    // The first translation after the wrap reuses the span of the oldest block.
    m.cpu.eip = 0x100 + translated;
    m.core
        .prepare_block(&m.cpu, &mut m.mem)
        .expect("translate")
        .expect("block");
    translated += 1;

    let cache = m.cache();
    let page = cache.page_for_phys(0).expect("page");
    assert_eq!(cache.find_cache_block(page, 0x100), None);
    let newest = (0x100 + translated - 1) as u16;
    assert!(cache.find_cache_block(page, newest).is_some());

    let (live, coverage) = live_coverage(cache, page);
    assert!(live < translated as usize, "{live} blocks survived");
    assert_eq!(cache.page(page).active_blocks() as usize, live);
    assert_eq!(cache.page(page).write_map()[..], coverage[..]);
    assert_eq!(cache.stats().anomalies, 0);
}

#[test]
fn full_page_pool_recycles_the_oldest_page() {
    let mut m = with(DynrecConfig {
        code_pages: 2,
        ..common::portable_config()
    });
    let mut blocks = Vec::new();
    for base in [0x0100, 0x1100, 0x2100] {
        // inc ax; hlt
        m.load(base, &[0x40, 0xF4]);
        m.cpu.eip = base;
        let id = m
            .core
            .prepare_block(&m.cpu, &mut m.mem)
            .expect("translate")
            .expect("block");
        blocks.push(id);
    }

    let cache = m.cache();
    assert_eq!(cache.page_for_phys(0), None);
    assert!(!cache.block(blocks[0]).is_live());
    assert!(cache.block(blocks[1]).is_live());
    assert!(cache.block(blocks[2]).is_live());
    let third = cache.page_for_phys(2).expect("third page");
    assert_eq!(cache.find_cache_block(third, 0x100), Some(blocks[2]));
    assert_eq!(cache.used_pages().count(), 2);
    assert_eq!(cache.stats().pages_released, 1);
}

#[test]
fn code_size_change_reinstalls_the_page() {
    let mut m = Machine::new();
    m.load(0x100, &[0x40, 0xF4]);
    m.cpu.eip = 0x100;
    let small = m
        .core
        .prepare_block(&m.cpu, &mut m.mem)
        .expect("translate")
        .expect("block");
    let page = m.cache().page_for_phys(0).expect("page");
    assert!(!m.cache().page(page).code_big());

    m.cpu.code_big = true;
    let big = m
        .core
        .prepare_block(&m.cpu, &mut m.mem)
        .expect("translate")
        .expect("block");

    let cache = m.cache();
    assert_ne!(small, big);
    assert!(!cache.block(small).is_live());
    assert!(cache.block(big).is_live());
    let page = cache.page_for_phys(0).expect("page");
    assert!(cache.page(page).code_big());
    assert_eq!(cache.page(page).active_blocks(), 1);
    assert_eq!(m.core.stats().translations, 2);
}
