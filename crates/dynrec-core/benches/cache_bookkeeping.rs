#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
use std::time::Duration;

#[cfg(not(target_arch = "wasm32"))]
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
#[cfg(not(target_arch = "wasm32"))]
use dynrec_core::{
    BackendKind, CodeCache, CpuState, Dynrec, DynrecConfig, FlatMemory, GuestBus,
};
#[cfg(not(target_arch = "wasm32"))]
use dynrec_x86::Width;

#[cfg(not(target_arch = "wasm32"))]
fn criterion_config() -> Criterion {
    match std::env::var("DYNREC_BENCH_PROFILE").as_deref() {
        Ok("ci") => Criterion::default()
            .warm_up_time(Duration::from_millis(150))
            .measurement_time(Duration::from_millis(400))
            .sample_size(10)
            .noise_threshold(0.05),
        _ => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(50)
            .noise_threshold(0.03),
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_allocator(c: &mut Criterion) {
    let config = DynrecConfig {
        cache_size: 0x10_0000,
        max_block_size: 0x1000,
        // Enough descriptors for the smallest spans to fill the arena.
        block_count: 32 * 1024,
        ..DynrecConfig::small()
    };
    let mut group = c.benchmark_group("allocator");
    for written in [48usize, 256, 2048] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::new("open_close", written),
            &written,
            |b, &written| {
                let mut cache = CodeCache::new(&config, 0, 0x1000, [0x10, 0x20]);
                b.iter(|| {
                    cache.open_block();
                    black_box(cache.close_block(written).expect("close"));
                });
            },
        );
    }
    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
fn machine() -> (Dynrec, CpuState, FlatMemory) {
    let mut core = Dynrec::new(DynrecConfig {
        backend: BackendKind::Portable,
        ..DynrecConfig::small()
    });
    core.initialize(true).expect("initialize");
    let mut mem = FlatMemory::new(0x10000);
    // 24 x inc ax, then hlt
    let mut code = vec![0x40u8; 24];
    code.push(0xF4);
    mem.load(0x100, &code);
    let mut cpu = CpuState::new_real_mode();
    cpu.eip = 0x100;
    (core, cpu, mem)
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_invalidation(c: &mut Criterion) {
    let mut group = c.benchmark_group("invalidation");
    group.throughput(Throughput::Elements(1));

    group.bench_function("translate_then_invalidate", |b| {
        let (mut core, cpu, mut mem) = machine();
        let mut value = 0x40u32;
        b.iter(|| {
            black_box(core.prepare_block(&cpu, &mut mem).expect("translate"));
            // Flip an inc/dec inside the block so the next lookup translates again.
            value ^= 0x08;
            core.bus(&mut mem)
                .write(0x110, Width::W8, value)
                .expect("write");
        });
    });

    group.bench_function("store_next_to_code", |b| {
        let (mut core, cpu, mut mem) = machine();
        core.prepare_block(&cpu, &mut mem).expect("translate");
        let mut value = 0u32;
        b.iter(|| {
            value = value.wrapping_add(1);
            core.bus(&mut mem)
                .write(0x400, Width::W32, black_box(value))
                .expect("write");
        });
    });

    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_allocator, bench_invalidation
}
#[cfg(not(target_arch = "wasm32"))]
criterion_main!(benches);
