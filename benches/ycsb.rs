//! YCSB-style macro-benchmarks for xapian-btree-core's `Shard`.
//!
//! Measures sustained throughput and latency distributions under
//! realistic mixed workloads inspired by the Yahoo Cloud Serving
//! Benchmark (YCSB), adapted from key-value access patterns to
//! docid-addressed document access.
//!
//! # Workloads
//!
//! | Name | Mix | Description |
//! |------|-----|-------------|
//! | **A** | 50% read, 50% update | Session store — heavy read/write |
//! | **B** | 95% read, 5% update | Photo tagging — read-mostly |
//! | **C** | 100% read | User profile cache — read-only |
//! | **D** | 95% read, 5% insert | Read-latest — new documents added |
//! | **E** | 95% short-range read, 5% insert | Threaded conversations |
//! | **F** | 50% read, 50% read-modify-write | User database — RMW |
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench ycsb               # all workloads
//! cargo bench --bench ycsb -- "load"      # load phase only
//! cargo bench --bench ycsb -- "A"         # workload A only
//! ```

use criterion::{BatchSize, BenchmarkId, Criterion, criterion_group, criterion_main};

use rand::Rng;
use std::hint::black_box;
use tempfile::TempDir;
use xapian_btree_core::config::Config;
use xapian_btree_core::shard::{NewDocument, Posting, Shard};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Number of documents loaded before running workloads.
const RECORD_COUNT: u64 = 10_000;

/// Number of operations per workload run.
const OPS_PER_RUN: u64 = 5_000;

/// Document body size in bytes.
const VALUE_SIZE: usize = 256;

/// Range length (in docids) for workload E's short-range reads.
const SCAN_LENGTH: u64 = 50;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

fn make_value(rng: &mut impl Rng) -> Vec<u8> {
    let mut buf = vec![0u8; VALUE_SIZE];
    rng.fill(&mut buf[..]);
    buf
}

fn make_document(rng: &mut impl Rng, seq: u64) -> NewDocument {
    NewDocument {
        data: make_value(rng),
        doclen: 1,
        postings: vec![Posting {
            term: format!("user{seq:012}"),
            wdf: 1,
            positions: vec![0],
        }],
    }
}

/// Load phase: insert [`RECORD_COUNT`] sequential documents and commit.
///
/// **Scenario:** Indexes 10,000 documents (256 B bodies, one term each)
/// and commits once at the end, simulating the initial bulk-load of a
/// dataset.
///
/// **What it measures:** Sustained sequential indexing throughput plus a
/// single large commit's block-write cost.
fn load_shard(shard: &mut Shard) {
    let mut rng = rand::rng();
    for i in 0..RECORD_COUNT {
        shard.add_document(make_document(&mut rng, i)).unwrap();
    }
    shard.commit().unwrap();
}

// ------------------------------------------------------------------------------------------------
// Workloads
// ------------------------------------------------------------------------------------------------

/// Workload A — 50% read, 50% update.
///
/// **Real-world analogy:** Session store. A web server reads and updates
/// session data equally — checking state and refreshing it.
///
/// **What it measures:** Performance under a balanced read/replace mix
/// with uniform random docid access. A replace deindexes the document's
/// old postings before reindexing the new ones.
fn run_workload_a(shard: &mut Shard) {
    let mut rng = rand::rng();
    for _ in 0..OPS_PER_RUN {
        let docid = rng.random_range(1..=RECORD_COUNT) as u32;

        if rng.random_bool(0.5) {
            let _ = black_box(shard.open_document(docid).unwrap());
        } else {
            let doc = make_document(&mut rng, docid as u64);
            shard.replace_document(docid, doc).unwrap();
        }
    }
}

/// Workload B — 95% read, 5% update.
///
/// **Real-world analogy:** Photo tagging or social-media metadata. Most
/// accesses are reads, with occasional writes.
///
/// **What it measures:** Read-dominated throughput with light write
/// pressure, verifying infrequent writes don't disproportionately affect
/// read latency.
fn run_workload_b(shard: &mut Shard) {
    let mut rng = rand::rng();
    for _ in 0..OPS_PER_RUN {
        let docid = rng.random_range(1..=RECORD_COUNT) as u32;

        if rng.random_bool(0.95) {
            let _ = black_box(shard.open_document(docid).unwrap());
        } else {
            let doc = make_document(&mut rng, docid as u64);
            shard.replace_document(docid, doc).unwrap();
        }
    }
}

/// Workload C — 100% read.
///
/// **Real-world analogy:** User profile cache, read with no modifications
/// during the measured window.
///
/// **What it measures:** Peak `open_document` throughput with zero write
/// contention.
fn run_workload_c(shard: &Shard) {
    let mut rng = rand::rng();
    for _ in 0..OPS_PER_RUN {
        let docid = rng.random_range(1..=RECORD_COUNT) as u32;
        let _ = black_box(shard.open_document(docid).unwrap());
    }
}

/// Workload D — 95% read, 5% insert (new docids beyond the loaded range).
///
/// **Real-world analogy:** Status/timeline feed. Most operations read
/// recent posts, a small fraction inserts new ones.
///
/// **What it measures:** The engine's ability to grow the docid range
/// while under read load, via `add_document`'s auto-allocated docid.
fn run_workload_d(shard: &mut Shard, inserted: &mut u64) {
    let mut rng = rand::rng();
    for _ in 0..OPS_PER_RUN {
        if rng.random_bool(0.95) {
            let docid = rng.random_range(1..=(RECORD_COUNT + *inserted)) as u32;
            let _ = black_box(shard.open_document(docid).unwrap());
        } else {
            let doc = make_document(&mut rng, RECORD_COUNT + *inserted);
            shard.add_document(doc).unwrap();
            *inserted += 1;
        }
    }
}

/// Workload E — 95% short-range read, 5% insert.
///
/// **Real-world analogy:** Threaded conversations. Reading a thread means
/// reading [`SCAN_LENGTH`] consecutive recent documents; posting adds one.
///
/// **What it measures:** Short-range sequential `open_document` cost
/// under light write pressure — consecutive docids land in nearby
/// docdata blocks, so this approximates the locality a cursor-driven
/// range scan over the same span would see.
fn run_workload_e(shard: &mut Shard, inserted: &mut u64) {
    let mut rng = rand::rng();
    for _ in 0..OPS_PER_RUN {
        if rng.random_bool(0.95) {
            let start = rng.random_range(1..=RECORD_COUNT.saturating_sub(SCAN_LENGTH)) as u32;
            for docid in start..start + SCAN_LENGTH as u32 {
                let _ = black_box(shard.open_document(docid).unwrap());
            }
        } else {
            let doc = make_document(&mut rng, RECORD_COUNT + *inserted);
            shard.add_document(doc).unwrap();
            *inserted += 1;
        }
    }
}

/// Workload F — 50% read, 50% read-modify-write (RMW).
///
/// **Real-world analogy:** User database with counters — half the
/// operations read a record, the other half read then write it back.
///
/// **What it measures:** RMW pattern cost: each RMW is an `open_document`
/// followed by a `replace_document`.
fn run_workload_f(shard: &mut Shard) {
    let mut rng = rand::rng();
    for _ in 0..OPS_PER_RUN {
        let docid = rng.random_range(1..=RECORD_COUNT) as u32;

        if rng.random_bool(0.5) {
            let _ = black_box(shard.open_document(docid).unwrap());
        } else {
            let _ = shard.open_document(docid).unwrap();
            let doc = make_document(&mut rng, docid as u64);
            shard.replace_document(docid, doc).unwrap();
        }
    }
}

// ================================================================================================
// Criterion benchmark functions
// ================================================================================================

/// Criterion registration for the load phase.
///
/// Measures the time to index and commit [`RECORD_COUNT`] documents into
/// a fresh shard. Sample size is reduced to 10 because each iteration
/// builds an entire shard from scratch.
fn bench_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("ycsb/load");
    group.sample_size(10);
    group.bench_function(BenchmarkId::new("sequential", RECORD_COUNT), |b| {
        b.iter_batched(
            || {
                let dir = TempDir::new().unwrap();
                let shard = Shard::create(dir.path(), Config::default()).unwrap();
                (dir, shard)
            },
            |(_dir, mut shard)| {
                load_shard(&mut shard);
            },
            BatchSize::PerIteration,
        );
    });
    group.finish();
}

fn setup_loaded_shard() -> (TempDir, Shard) {
    let dir = TempDir::new().unwrap();
    let mut shard = Shard::create(dir.path(), Config::default()).unwrap();
    load_shard(&mut shard);
    (dir, shard)
}

/// Criterion registration for Workload A (50% read / 50% update).
fn bench_workload_a(c: &mut Criterion) {
    let mut group = c.benchmark_group("ycsb/workload");
    group.sample_size(10);
    group.bench_function("A_50read_50update", |b| {
        b.iter_batched(
            setup_loaded_shard,
            |(_dir, mut shard)| run_workload_a(&mut shard),
            BatchSize::PerIteration,
        );
    });
    group.finish();
}

/// Criterion registration for Workload B (95% read / 5% update).
fn bench_workload_b(c: &mut Criterion) {
    let mut group = c.benchmark_group("ycsb/workload");
    group.sample_size(10);
    group.bench_function("B_95read_5update", |b| {
        b.iter_batched(
            setup_loaded_shard,
            |(_dir, mut shard)| run_workload_b(&mut shard),
            BatchSize::PerIteration,
        );
    });
    group.finish();
}

/// Criterion registration for Workload C (100% read).
fn bench_workload_c(c: &mut Criterion) {
    let mut group = c.benchmark_group("ycsb/workload");
    group.sample_size(10);
    group.bench_function("C_100read", |b| {
        b.iter_batched(
            setup_loaded_shard,
            |(_dir, shard)| run_workload_c(&shard),
            BatchSize::PerIteration,
        );
    });
    group.finish();
}

/// Criterion registration for Workload D (95% read / 5% insert).
fn bench_workload_d(c: &mut Criterion) {
    let mut group = c.benchmark_group("ycsb/workload");
    group.sample_size(10);
    group.bench_function("D_95read_5insert", |b| {
        b.iter_batched(
            || {
                let (dir, shard) = setup_loaded_shard();
                (dir, shard, 0u64)
            },
            |(_dir, mut shard, mut inserted)| run_workload_d(&mut shard, &mut inserted),
            BatchSize::PerIteration,
        );
    });
    group.finish();
}

/// Criterion registration for Workload E (95% short-range read / 5% insert).
fn bench_workload_e(c: &mut Criterion) {
    let mut group = c.benchmark_group("ycsb/workload");
    group.sample_size(10);
    group.bench_function("E_95scan_5insert", |b| {
        b.iter_batched(
            || {
                let (dir, shard) = setup_loaded_shard();
                (dir, shard, 0u64)
            },
            |(_dir, mut shard, mut inserted)| run_workload_e(&mut shard, &mut inserted),
            BatchSize::PerIteration,
        );
    });
    group.finish();
}

/// Criterion registration for Workload F (50% read / 50% RMW).
fn bench_workload_f(c: &mut Criterion) {
    let mut group = c.benchmark_group("ycsb/workload");
    group.sample_size(10);
    group.bench_function("F_50read_50rmw", |b| {
        b.iter_batched(
            setup_loaded_shard,
            |(_dir, mut shard)| run_workload_f(&mut shard),
            BatchSize::PerIteration,
        );
    });
    group.finish();
}

// ================================================================================================
// Group registration
// ================================================================================================

criterion_group!(
    benches,
    bench_load,
    bench_workload_a,
    bench_workload_b,
    bench_workload_c,
    bench_workload_d,
    bench_workload_e,
    bench_workload_f,
);

criterion_main!(benches);
