//! Micro-benchmarks for xapian-btree-core's shard operations.
//!
//! Uses Criterion for statistically rigorous measurement with regression
//! detection and HTML reports.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench micro              # run all micro-benchmarks
//! cargo bench --bench micro -- add       # filter by name
//! ```
//!
//! Reports are generated in `target/criterion/report/index.html`.

use criterion::{
    BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main,
};

use std::sync::Arc;
use tempfile::TempDir;
use xapian_btree_core::compactor::Compactor;
use xapian_btree_core::config::Config;
use xapian_btree_core::shard::{NewDocument, Posting, Shard};

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Default document body (128 bytes).
const DATA_128B: &[u8; 128] = &[0xAB; 128];

/// Larger document body (1 KiB).
const DATA_1K: &[u8; 1024] = &[0xCD; 1024];

/// Build a document with `term_count` distinct single-occurrence terms,
/// each carrying one position.
fn make_document(data: &[u8], seq: u64, term_count: usize) -> NewDocument {
    let postings: Vec<Posting> = (0..term_count)
        .map(|i| Posting {
            term: format!("term-{seq:08}-{i:03}"),
            wdf: 1,
            positions: vec![i as u32],
        })
        .collect();
    NewDocument {
        data: data.to_vec(),
        doclen: term_count as u32,
        postings,
    }
}

/// Pre-populate a fresh shard with `count` documents, each carrying
/// `term_count` terms, and commit it.
fn prepopulate(dir: &std::path::Path, count: u64, term_count: usize) -> Shard {
    let mut shard = Shard::create(dir, Config::default()).unwrap();
    for i in 0..count {
        shard
            .add_document(make_document(DATA_128B, i, term_count))
            .unwrap();
    }
    shard.commit().unwrap();
    shard
}

// ================================================================================================
// Write benchmarks
// ================================================================================================

/// Benchmark group for `add_document`.
///
/// # Sub-benchmarks
///
/// ## `uncommitted/128B` and `uncommitted/1K`
///
/// **Scenario:** Indexes a single document (5 terms) into a freshly created
/// shard without ever calling `commit`, so every mutation stays in the
/// in-memory dirty-block cache.
///
/// **What it measures:** The cost of updating the postlist/termlist/
/// position/docdata B-trees in memory, with no block I/O. Two document
/// sizes (128 B and 1 KiB) show how much the docdata write itself costs
/// relative to the postlist/termlist updates, which don't scale with body
/// size.
///
/// **Expected behaviour:** Low-microsecond; 1 KiB bodies should be only
/// marginally slower since the B-tree work dominates over the memcpy.
///
/// ## `with_periodic_commit`
///
/// **Scenario:** Indexes documents continuously, committing every 64
/// documents so dirty blocks are regularly flushed to disk.
///
/// **What it measures:** Sustained indexing throughput including the
/// amortised cost of periodic commits (fsync of touched blocks, the
/// version file, and the freelist).
fn bench_add_document(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_document");

    for &(label, data) in &[("128B", DATA_128B.as_slice()), ("1K", DATA_1K.as_slice())] {
        group.bench_function(BenchmarkId::new("uncommitted", label), |b| {
            b.iter_batched(
                || TempDir::new().unwrap(),
                |dir| {
                    let mut shard = Shard::create(dir.path(), Config::default()).unwrap();
                    let doc = NewDocument {
                        data: data.to_vec(),
                        doclen: 5,
                        postings: (0..5)
                            .map(|i| Posting {
                                term: format!("term-{i}"),
                                wdf: 1,
                                positions: vec![i as u32],
                            })
                            .collect(),
                    };
                    black_box(shard.add_document(black_box(doc)).unwrap());
                },
                BatchSize::PerIteration,
            );
        });
    }

    group.bench_function("with_periodic_commit", |b| {
        let dir = TempDir::new().unwrap();
        let mut shard = Shard::create(dir.path(), Config::default()).unwrap();
        let mut seq = 0u64;

        b.iter(|| {
            shard
                .add_document(black_box(make_document(DATA_128B, seq, 5)))
                .unwrap();
            if seq % 64 == 0 {
                shard.commit().unwrap();
            }
            seq += 1;
        });
    });

    group.finish();
}

// ================================================================================================
// Read benchmarks
// ================================================================================================

/// Benchmark group for point reads.
///
/// # Sub-benchmarks
///
/// ## `open_document_hit` / `open_document_miss`
///
/// **Scenario:** 5,000 documents are committed to a shard; `hit` reads
/// randomly among them, `miss` queries docids above that range.
///
/// **What it measures:** `docdata` B-tree lookup latency, including block
/// decompression.
///
/// ## `open_post_list`
///
/// **Scenario:** Reads the full posting list for a term that occurs in
/// every one of 5,000 committed documents (one occurrence per doc).
///
/// **What it measures:** Cursor-driven sequential scan cost across a
/// postlist entry's chained continuation blocks.
fn bench_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("read");

    let dir = TempDir::new().unwrap();
    let n = 5_000u64;
    let mut shard = Shard::create(dir.path(), Config::default()).unwrap();
    for i in 0..n {
        shard
            .add_document(NewDocument {
                data: DATA_128B.to_vec(),
                doclen: 1,
                postings: vec![Posting {
                    term: "shared".into(),
                    wdf: 1,
                    positions: vec![0],
                }],
            })
            .unwrap();
    }
    shard.commit().unwrap();

    group.bench_function("open_document_hit", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let docid = (i % n) as u32 + 1;
            let _ = black_box(shard.open_document(black_box(docid)).unwrap());
            i += 1;
        });
    });

    group.bench_function("open_document_miss", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let docid = (n + i) as u32 + 1;
            let _ = black_box(shard.open_document(black_box(docid)).unwrap());
            i += 1;
        });
    });

    group.throughput(Throughput::Elements(n));
    group.bench_function("open_post_list", |b| {
        b.iter(|| {
            let _ = black_box(shard.open_post_list(black_box("shared")).unwrap());
        });
    });

    group.finish();
}

// ================================================================================================
// Delete benchmarks
// ================================================================================================

/// Benchmark group for delete operations.
///
/// # Sub-benchmarks
///
/// ## `by_docid`
///
/// **Scenario:** Deletes a unique, never-reused docid per iteration from a
/// shard pre-loaded with 20,000 documents.
///
/// **What it measures:** The cost of deindexing a document — removing its
/// postlist/position entries for every term, its termlist entry, and its
/// docdata entry.
fn bench_delete(c: &mut Criterion) {
    let mut group = c.benchmark_group("delete");

    group.bench_function("by_docid", |b| {
        b.iter_batched(
            || {
                let dir = TempDir::new().unwrap();
                let shard = prepopulate(dir.path(), 20_000, 5);
                (dir, shard)
            },
            |(_dir, mut shard)| {
                for docid in 1..=20_000u32 {
                    black_box(shard.delete_document(black_box(docid)).unwrap());
                }
            },
            BatchSize::PerIteration,
        );
    });

    group.finish();
}

// ================================================================================================
// Commit / recovery benchmarks
// ================================================================================================

/// Benchmark group for commit latency.
///
/// # Sub-benchmarks
///
/// ## `commit/1000` and `commit/5000`
///
/// **Scenario:** Indexes N uncommitted documents into a fresh shard, then
/// measures a single `commit()` call in isolation.
///
/// **What it measures:** End-to-end commit cost — writing every dirty
/// block across the six tables, the version file, and (if enabled) the
/// changes log.
fn bench_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit");
    group.sample_size(10);

    for &count in &[1_000u64, 5_000] {
        group.bench_function(BenchmarkId::new("commit", count), |b| {
            b.iter_batched(
                || {
                    let dir = TempDir::new().unwrap();
                    let mut shard = Shard::create(dir.path(), Config::default()).unwrap();
                    for i in 0..count {
                        shard.add_document(make_document(DATA_128B, i, 5)).unwrap();
                    }
                    (dir, shard)
                },
                |(_dir, mut shard)| {
                    black_box(shard.commit().unwrap());
                },
                BatchSize::PerIteration,
            );
        });
    }

    group.finish();
}

/// Benchmark group for reopening a committed shard (read-only).
///
/// # Sub-benchmarks
///
/// ## `open_existing/1000` and `open_existing/10000`
///
/// **Scenario:** A shard is prepopulated with N documents and committed.
/// Each iteration opens a fresh read-only handle on that directory.
///
/// **What it measures:** Cold-open latency — reading the version file and
/// every table's root block. This should be close to constant regardless
/// of document count, since open doesn't scan table contents.
fn bench_recovery(c: &mut Criterion) {
    let mut group = c.benchmark_group("recovery");
    group.sample_size(10);

    for &count in &[1_000u64, 10_000] {
        group.bench_function(BenchmarkId::new("open_existing", count), |b| {
            let dir = TempDir::new().unwrap();
            prepopulate(dir.path(), count, 5);

            b.iter(|| {
                let shard = Shard::open(dir.path(), Config::default(), false).unwrap();
                black_box(&shard);
            });
        });
    }

    group.finish();
}

// ================================================================================================
// Compaction benchmarks
// ================================================================================================

/// Benchmark group for compaction.
///
/// # Sub-benchmarks
///
/// ## `renumber/1000` and `renumber/5000`
///
/// **Scenario:** Two shards, each with N documents, are merged by
/// [`Compactor`] in `Renumber` mode into a fresh output directory.
///
/// **What it measures:** End-to-end compaction latency — reconstructing
/// every source document and re-inserting it under its renumbered docid,
/// then committing the output shard once.
fn bench_compaction(c: &mut Criterion) {
    let mut group = c.benchmark_group("compaction");
    group.sample_size(10);

    for &count in &[1_000u64, 5_000] {
        group.bench_function(BenchmarkId::new("renumber", count), |b| {
            b.iter_batched(
                || {
                    let dir_a = TempDir::new().unwrap();
                    let dir_b = TempDir::new().unwrap();
                    let dest = TempDir::new().unwrap();
                    std::fs::remove_dir(dest.path()).unwrap();
                    let a = prepopulate(dir_a.path(), count, 5);
                    let b = prepopulate(dir_b.path(), count, 5);
                    (dir_a, dir_b, dest, a, b)
                },
                |(_dir_a, _dir_b, dest, a, b)| {
                    let mut compactor = Compactor::new(Config::default());
                    black_box(compactor.compact(&[a, b], dest.path()).unwrap());
                },
                BatchSize::PerIteration,
            );
        });
    }

    group.finish();
}

// ================================================================================================
// Document-size scaling
// ================================================================================================

/// Benchmark group for document-body-size scaling.
///
/// # Sub-benchmarks
///
/// ## `add_document/{64B,256B,1K,4K}`
///
/// **Scenario:** Indexes a single document with a body of the given size
/// and 5 terms, uncommitted.
///
/// **What it measures:** How indexing latency and throughput scale with
/// document body size. Isolates the docdata write cost from the
/// postlist/termlist/position work, which is identical across sizes.
fn bench_document_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("document_size");

    let sizes: &[(&str, usize)] = &[("64B", 64), ("256B", 256), ("1K", 1024), ("4K", 4096)];

    for &(label, size) in sizes {
        let data = vec![0xEF_u8; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(BenchmarkId::new("add_document", label), |b| {
            let dir = TempDir::new().unwrap();
            let mut shard = Shard::create(dir.path(), Config::default()).unwrap();
            let mut seq = 0u64;
            b.iter(|| {
                shard
                    .add_document(black_box(make_document(&data, seq, 5)))
                    .unwrap();
                seq += 1;
            });
        });
    }

    group.finish();
}

// ================================================================================================
// Concurrent read benchmarks
// ================================================================================================

/// Benchmark group for concurrent read-only access.
///
/// Every reader thread opens its own read-only [`Shard`] handle on the
/// same directory (the advisory lock only guards writers), matching how
/// independent reader processes would use the engine.
///
/// # Sub-benchmarks
///
/// ## `readers/{1,2,4}`
///
/// **Scenario:** N threads perform random `open_document` lookups against
/// 10,000 committed documents. Each thread performs 1,000 reads.
///
/// **What it measures:** Read throughput scaling under contention. Reads
/// never block each other (no shared writer state), so throughput should
/// scale close to linearly with thread count.
fn bench_concurrent_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent");
    group.sample_size(10);

    let reads_per_thread = 1_000u64;
    let n = 10_000u64;

    for &num_readers in &[1u32, 2, 4] {
        group.bench_function(BenchmarkId::new("readers", num_readers), |b| {
            b.iter_batched(
                || {
                    let dir = TempDir::new().unwrap();
                    prepopulate(dir.path(), n, 5);
                    Arc::new(dir)
                },
                |dir| {
                    let mut handles = Vec::new();
                    for t in 0..num_readers {
                        let dir = Arc::clone(&dir);
                        handles.push(std::thread::spawn(move || {
                            let shard = Shard::open(dir.path(), Config::default(), false).unwrap();
                            for i in 0..reads_per_thread {
                                let docid = ((i + t as u64 * 1000) % n) as u32 + 1;
                                let _ = black_box(shard.open_document(docid).unwrap());
                            }
                        }));
                    }
                    for h in handles {
                        h.join().unwrap();
                    }
                },
                BatchSize::PerIteration,
            );
        });
    }

    group.finish();
}

// ================================================================================================
// Dataset scaling benchmarks
// ================================================================================================

/// Benchmark group for dataset-size scaling.
///
/// # Sub-benchmarks
///
/// ## `open_document/{1K,10K,50K,100K}`
///
/// **Scenario:** Prepopulates N documents into a committed shard and
/// measures random point-read latency.
///
/// **What it measures:** How read latency scales as the table grows —
/// the B-tree's depth grows logarithmically with document count, so
/// per-read cost should grow sub-linearly.
fn bench_dataset_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("dataset_scaling");
    group.sample_size(10);

    for &count in &[1_000u64, 10_000, 50_000, 100_000] {
        let label = match count {
            1_000 => "1K",
            10_000 => "10K",
            50_000 => "50K",
            100_000 => "100K",
            _ => unreachable!(),
        };

        group.bench_function(BenchmarkId::new("open_document", label), |b| {
            let dir = TempDir::new().unwrap();
            let shard = prepopulate(dir.path(), count, 5);
            let mut i = 0u64;
            b.iter(|| {
                let docid = (i % count) as u32 + 1;
                let _ = black_box(shard.open_document(black_box(docid)).unwrap());
                i += 1;
            });
        });
    }

    group.finish();
}

// ================================================================================================
// Overwrite (replace_document) benchmarks
// ================================================================================================

/// Benchmark group for overwriting existing documents.
///
/// # Sub-benchmarks
///
/// ## `replace_document`
///
/// **Scenario:** Prepopulates 5,000 documents and commits, then repeatedly
/// replaces random existing docids with a new body and term set.
///
/// **What it measures:** Cost of a replace, which is implemented as
/// deindex-then-reindex: the old postlist/termlist/position entries are
/// removed before the new ones are written.
fn bench_overwrite(c: &mut Criterion) {
    let mut group = c.benchmark_group("overwrite");

    group.bench_function("replace_document", |b| {
        let dir = TempDir::new().unwrap();
        let mut shard = prepopulate(dir.path(), 5_000, 5);
        let mut seq = 0u64;
        b.iter(|| {
            let docid = (seq % 5_000) as u32 + 1;
            shard
                .replace_document(black_box(docid), black_box(make_document(DATA_128B, seq, 5)))
                .unwrap();
            seq += 1;
        });
    });

    group.finish();
}

// ================================================================================================
// Group registration
// ================================================================================================

criterion_group!(
    benches,
    bench_add_document,
    bench_read,
    bench_delete,
    bench_commit,
    bench_recovery,
    bench_compaction,
    bench_document_sizes,
    bench_concurrent_reads,
    bench_dataset_scaling,
    bench_overwrite,
);

criterion_main!(benches);
