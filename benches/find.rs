//! Query-kernel benchmarks using Divan.
//!
//! Run with: `cargo bench --bench find`

use divan::{black_box, Bencher};
use packarray::{
    ActionKind, Array, Condition, NodeType, QueryState, SlabAlloc, NOT_FOUND,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn main() {
    divan::main();
}

const N: usize = 8192;

fn build_payload(alloc: &SlabAlloc, bound: i64) -> Array<'_, SlabAlloc> {
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let mut arr = Array::new(alloc);
    arr.create(NodeType::Normal).unwrap();
    for _ in 0..N {
        arr.add(rng.gen_range(0..bound)).unwrap();
    }
    arr
}

// =============================================================================
// find_first
// =============================================================================

#[divan::bench_group]
mod find_first {
    use super::*;

    #[divan::bench(args = [3, 15, 100, 20_000, 1_000_000])]
    fn absent_value(bencher: Bencher, bound: i64) {
        let alloc = SlabAlloc::new();
        let arr = build_payload(&alloc, bound);
        // Never present: scans the whole node.
        bencher.bench_local(|| black_box(&arr).find_first(black_box(bound), 0, N));
    }

    #[divan::bench(args = [3, 15, 100, 20_000])]
    fn present_value(bencher: Bencher, bound: i64) {
        let alloc = SlabAlloc::new();
        let arr = build_payload(&alloc, bound);
        bencher.bench_local(|| black_box(&arr).find_first(black_box(bound / 2), 0, N));
    }
}

// =============================================================================
// Aggregates
// =============================================================================

#[divan::bench_group]
mod aggregates {
    use super::*;

    #[divan::bench(args = [3, 15, 100, 20_000, 1_000_000])]
    fn count_equal(bencher: Bencher, bound: i64) {
        let alloc = SlabAlloc::new();
        let arr = build_payload(&alloc, bound);
        bencher.bench_local(|| black_box(&arr).count(black_box(1)));
    }

    #[divan::bench(args = [3, 15, 100, 20_000, 1_000_000])]
    fn sum_less_than(bencher: Bencher, bound: i64) {
        let alloc = SlabAlloc::new();
        let arr = build_payload(&alloc, bound);
        bencher.bench_local(|| {
            let mut state = QueryState::new(ActionKind::Sum, usize::MAX);
            black_box(&arr).find(
                Condition::Less,
                ActionKind::Sum,
                black_box(bound / 2),
                0,
                N,
                0,
                &mut state,
            );
            state.state
        });
    }

    #[divan::bench(args = [3, 15, 100, 20_000, 1_000_000])]
    fn whole_node_sum(bencher: Bencher, bound: i64) {
        let alloc = SlabAlloc::new();
        let arr = build_payload(&alloc, bound);
        bencher.bench_local(|| black_box(&arr).sum(0, NOT_FOUND));
    }
}

// =============================================================================
// find_all
// =============================================================================

#[divan::bench_group]
mod find_all {
    use super::*;

    #[divan::bench(args = [3, 15, 100, 20_000])]
    fn dense_matches(bencher: Bencher, bound: i64) {
        let alloc = SlabAlloc::new();
        let arr = build_payload(&alloc, bound);
        bencher.bench_local(|| {
            let mut found = Vec::with_capacity(N);
            arr.find_all(&mut found, black_box(1), 0, 0, NOT_FOUND);
            found.len()
        });
    }
}

// =============================================================================
// Mutation
// =============================================================================

#[divan::bench_group]
mod mutation {
    use super::*;

    #[divan::bench]
    fn append_then_widen(bencher: Bencher) {
        bencher.bench_local(|| {
            let alloc = SlabAlloc::new();
            let mut arr = Array::new(&alloc);
            arr.create(NodeType::Normal).unwrap();
            for i in 0..512i64 {
                arr.add(black_box(i % 16)).unwrap();
            }
            arr.set(100, black_box(1 << 30)).unwrap();
            arr.destroy();
        });
    }

    #[divan::bench]
    fn lower_bound_sorted(bencher: Bencher) {
        let alloc = SlabAlloc::new();
        let mut arr = Array::new(&alloc);
        arr.create(NodeType::Normal).unwrap();
        for i in 0..N as i64 {
            arr.add(i * 3).unwrap();
        }
        bencher.bench_local(|| black_box(&arr).lower_bound_int(black_box(9000)));
    }
}
