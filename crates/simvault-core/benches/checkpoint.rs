//! Benchmarks for checkpoint create/load operations.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use parking_lot::Mutex;
use simvault_core::{Checkpointer, CheckpointerConfig, RamContainer, SharedContainer};

const LINE_SIZE: u32 = 64;
const LINE_COUNT: u64 = 1024;

fn setup() -> (Arc<Mutex<RamContainer>>, Checkpointer) {
    let ram = Arc::new(Mutex::new(
        RamContainer::new("bench.region", LINE_SIZE, LINE_COUNT).unwrap(),
    ));
    let shared: SharedContainer = ram.clone();
    let cp = Checkpointer::in_memory(
        vec![shared],
        CheckpointerConfig::new().with_snapshot_threshold(20),
    )
    .unwrap();
    (ram, cp)
}

fn bench_delta_creation(c: &mut Criterion) {
    let (ram, mut cp) = setup();
    cp.create_head(0).unwrap();

    let mut tick = 0u64;
    c.bench_function("delta_creation_16_dirty_lines", |b| {
        b.iter(|| {
            tick += 1;
            for line in 0..16u64 {
                ram.lock().write(line * u64::from(LINE_SIZE), &[tick as u8]);
            }
            black_box(cp.create_checkpoint(tick).unwrap());
        });
    });
}

fn bench_checkpoint_load(c: &mut Criterion) {
    let (ram, mut cp) = setup();
    cp.create_head(0).unwrap();

    // A chain of deltas to replay through.
    for tick in 1..=10u64 {
        for line in 0..16u64 {
            ram.lock().write(line * u64::from(LINE_SIZE), &[tick as u8]);
        }
        cp.create_checkpoint(tick).unwrap();
    }
    let target = *cp.list().unwrap().last().unwrap();

    c.bench_function("load_10_delta_chain", |b| {
        b.iter(|| {
            cp.load_checkpoint(black_box(target)).unwrap();
        });
    });
}

criterion_group!(benches, bench_delta_creation, bench_checkpoint_load);
criterion_main!(benches);
