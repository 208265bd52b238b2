#![allow(missing_docs)]
//! Benchmarks for chunk level propagation.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use steel_chunk::chunk::chunk_tracker::{ChunkTracker, MAX_LEVEL};
use steel_chunk::chunk::section_tracker::SectionTracker;
use steel_utils::{ChunkPos, SectionPos};

fn bench_single_ticket(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_ticket");

    for level in [33u8, 31, 22] {
        group.bench_with_input(BenchmarkId::new("add_remove", level), &level, |b, &level| {
            b.iter(|| {
                let mut tracker = ChunkTracker::new(MAX_LEVEL);
                tracker.set_source(ChunkPos::new(0, 0), Some(black_box(level)));
                tracker.run_all_updates();
                tracker.set_source(ChunkPos::new(0, 0), None);
                tracker.run_all_updates();
                black_box(tracker.take_changes().len());
            });
        });
    }
    group.finish();
}

fn bench_moving_players(c: &mut Criterion) {
    // Ten view distance 10 players walking diagonally, one chunk per step.
    c.bench_function("moving_tickets", |b| {
        let mut tracker = ChunkTracker::new(MAX_LEVEL);
        let mut step = 0;
        b.iter(|| {
            for player in 0..10 {
                let old = ChunkPos::new(player * 40 + step, step);
                let new = old.offset(1, 1);
                tracker.set_source(old, None);
                tracker.set_source(new, Some(21));
            }
            tracker.run_all_updates();
            black_box(tracker.take_changes().len());
            step += 1;
        });
    });
}

fn bench_budgeted(c: &mut Criterion) {
    c.bench_function("budgeted_1024", |b| {
        b.iter(|| {
            let mut tracker = ChunkTracker::new(MAX_LEVEL);
            tracker.set_source(ChunkPos::new(0, 0), Some(22));
            let mut rounds = 0;
            while tracker.has_work() {
                tracker.run_updates(black_box(1024));
                rounds += 1;
            }
            black_box(rounds);
        });
    });
}

fn bench_sections(c: &mut Criterion) {
    c.bench_function("section_source", |b| {
        b.iter(|| {
            let mut tracker = SectionTracker::new(33);
            tracker.set_source(SectionPos::new(0, 4, 0), Some(black_box(24)));
            tracker.run_all_updates();
            black_box(tracker.len());
        });
    });
}

criterion_group!(
    benches,
    bench_single_ticket,
    bench_moving_players,
    bench_budgeted,
    bench_sections
);
criterion_main!(benches);
