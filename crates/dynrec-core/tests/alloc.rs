use dynrec_core::{CodeCache, DynrecConfig, DynrecError, LinkTarget};

const ARENA_BASE: usize = 0x10000;
const BLOCKS_START: usize = 0x1000;
const STUBS: [usize; 2] = [0x10, 0x20];

fn config() -> DynrecConfig {
    DynrecConfig {
        cache_size: 0x1000,
        max_block_size: 0x100,
        block_count: 64,
        align: 16,
        ..DynrecConfig::small()
    }
}

fn cache() -> CodeCache {
    CodeCache::new(&config(), ARENA_BASE, BLOCKS_START, STUBS)
}

#[test]
fn close_splits_off_the_unused_tail() {
    let mut cache = cache();
    let id = cache.open_block();
    assert_eq!(cache.block(id).code_span(), (BLOCKS_START, 0x1000));

    let id = cache.close_block(40).expect("close");
    assert_eq!(cache.block(id).code_span(), (BLOCKS_START, 48));
    let rest = cache.block(id).arena_next().expect("rest span");
    assert_eq!(
        cache.block(rest).code_span(),
        (BLOCKS_START + 48, 0x1000 - 48)
    );
    assert_eq!(cache.active_cursor(), rest);
    assert_eq!(cache.code_addr(id), ARENA_BASE + BLOCKS_START);
}

#[test]
fn small_waste_is_not_split() {
    let mut cache = cache();
    cache.open_block();
    let id = cache.close_block(0x1000 - 16).expect("close");
    assert_eq!(cache.block(id).code_span(), (BLOCKS_START, 0x1000));
    assert_eq!(cache.block(id).arena_next(), None);
    // The only span ends past the wrap point.
    assert_eq!(cache.stats().wraps, 1);
    assert_eq!(cache.active_cursor(), id);
}

#[test]
fn overrun_is_reported() {
    let mut cache = cache();
    cache.open_block();
    // The last span may use the slack after the arena, but no more.
    match cache.close_block(0x1000 + 0x100 + 1) {
        Err(DynrecError::Overrun { written, capacity }) => {
            assert_eq!(written, 0x1101);
            assert_eq!(capacity, 0x1100);
        }
        other => panic!("expected overrun, got {other:?}"),
    }
}

#[test]
fn cursor_wraps_near_the_end_of_the_arena() {
    let mut cache = cache();
    // 240-byte blocks: the 17th starts past `cache_size - max_block_size`.
    for _ in 0..16 {
        cache.open_block();
        cache.close_block(240).expect("close");
        assert_eq!(cache.stats().wraps, 0);
    }
    cache.open_block();
    cache.close_block(240).expect("close");
    assert_eq!(cache.stats().wraps, 1);
    let first = cache.spans().next().expect("first span");
    assert_eq!(cache.active_cursor(), first);

    let spans: Vec<_> = cache.spans().collect();
    assert_eq!(spans.len(), 17);
    let total: usize = spans.iter().map(|&b| cache.block(b).code_span().1).sum();
    assert_eq!(total, 0x1000);
    for pair in spans.windows(2) {
        let (start, size) = cache.block(pair[0]).code_span();
        assert_eq!(cache.block(pair[1]).code_span().0, start + size);
    }
}

#[test]
fn reopening_after_wrap_merges_small_spans() {
    let mut cache = cache();
    for _ in 0..17 {
        cache.open_block();
        cache.close_block(240).expect("close");
    }
    let before = cache.spans().count();

    let id = cache.open_block();
    // Two 240-byte spans are needed to reach max_block_size.
    assert_eq!(cache.block(id).code_span(), (BLOCKS_START, 480));
    assert_eq!(cache.spans().count(), before - 1);
    assert!(cache.block_capacity(id) >= config().max_block_size);

    cache.close_block(40).expect("close");
    let rest = cache.block(id).arena_next().expect("rest");
    assert_eq!(cache.block(rest).code_span(), (BLOCKS_START + 48, 432));
}

#[test]
fn link_table_tracks_links() {
    let mut cache = cache();
    cache.open_block();
    let a = cache.close_block(48).expect("close a");
    cache.open_block();
    let b = cache.close_block(48).expect("close b");

    assert_eq!(cache.link_entry(a, 0), STUBS[0]);
    assert_eq!(cache.link_entry(a, 1), STUBS[1]);

    cache.link(a, 1, b);
    cache.link(b, 0, b);
    assert_eq!(cache.link_entry(a, 1), cache.code_addr(b));
    assert_eq!(cache.link_sources(b, 1), vec![a]);
    assert_eq!(cache.link_sources(b, 0), vec![b]);
    assert_eq!(cache.stats().links_made, 2);

    cache.clear_block(b);
    assert_eq!(cache.block(a).link_target(1), LinkTarget::Exit);
    assert_eq!(cache.link_entry(a, 1), STUBS[1]);
    assert_eq!(cache.link_entry(b, 0), STUBS[0]);
    assert!(cache.link_sources(b, 0).is_empty());
    assert!(cache.link_sources(b, 1).is_empty());
    assert_eq!(cache.stats().anomalies, 0);
}
