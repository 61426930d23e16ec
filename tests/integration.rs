//! End-to-end scenarios exercising the public `Shard`/`BTree`/`MultiDatabase`/
//! `Compactor` surface together, rather than any one module in isolation.
//!
//! ## Coverage areas
//! - Sequential insert, commit, reopen, and forward/backward cursor walks
//! - Oversized-key rejection without poisoning a subsequent commit
//! - Large, highly compressible tags round-tripping through compression
//! - Deletion reclaiming space via the freelist across a commit cycle
//! - A crash-like interruption before commit leaving the prior revision intact
//! - Multi-shard compaction with docid renumbering
//! - Basic `Shard` CRUD, the single-writer lock, and a `MultiDatabase` overlay
//!
//! ## See also
//! - [`btree::tests`] and [`shard::tests`] — module-internal unit tests
//! - `integration_coverage.rs` — extra paths not covered here
//! - `integration_hardening.rs` — boundary values and the P1-P10 properties

use std::fs;

use tempfile::TempDir;
use xapian_btree_core::btree::BTree;
use xapian_btree_core::compactor::Compactor;
use xapian_btree_core::config::{Config, TableConfig};
use xapian_btree_core::error::Error;
use xapian_btree_core::multi::MultiDatabase;
use xapian_btree_core::shard::{NewDocument, Posting, Shard};

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Create a fresh table at a fixed path inside a (leaked) temp directory, so
/// the same path can be reused to reopen it later in the same test.
fn fresh_table(block_size: u32) -> (std::path::PathBuf, BTree) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("t.db");
    std::mem::forget(dir);
    let config = TableConfig {
        block_size,
        ..TableConfig::default()
    };
    (path.clone(), BTree::create(&path, config).unwrap())
}

fn one_term_doc(data: &[u8], term: &str) -> NewDocument {
    NewDocument {
        data: data.to_vec(),
        doclen: 1,
        postings: vec![Posting {
            term: term.into(),
            wdf: 1,
            positions: vec![0],
        }],
    }
}

// ================================================================================================
// Scenario 1 — sequential insert and reopen
// ================================================================================================

#[test]
fn scenario_1_sequential_insert_and_reopen() {
    let (path, mut t) = fresh_table(TableConfig::DEFAULT_BLOCK_SIZE);
    for i in 0..10_000u32 {
        let key = format!("k{i:010}").into_bytes();
        let value = i.to_string().into_bytes();
        t.add(&key, &value, false).unwrap();
    }
    let root = t.commit().unwrap();

    let config = TableConfig::default();
    let t = BTree::open(&path, config, root).unwrap();

    let mut cursor = t.open_cursor();
    let mut forward = Vec::new();
    loop {
        cursor.next().unwrap();
        let Some(key) = cursor.key() else { break };
        let tag = cursor.read_tag().unwrap().unwrap();
        forward.push((key, tag));
    }
    assert_eq!(forward.len(), 10_000);
    for (i, (key, tag)) in forward.iter().enumerate() {
        assert_eq!(*key, format!("k{i:010}").into_bytes());
        assert_eq!(*tag, i.to_string().into_bytes());
    }
    assert!(forward.windows(2).all(|w| w[0].0 < w[1].0));

    cursor.to_end();
    let mut backward = Vec::new();
    loop {
        cursor.prev().unwrap();
        let Some(key) = cursor.key() else { break };
        backward.push(key);
    }
    backward.reverse();
    assert_eq!(backward, forward.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>());
}

// ================================================================================================
// Scenario 2 — oversized key does not poison a subsequent commit
// ================================================================================================

#[test]
fn scenario_2_oversized_key_does_not_poison_commit() {
    let (_path, mut t) = fresh_table(TableConfig::DEFAULT_BLOCK_SIZE);

    let oversized = vec![b'k'; xapian_btree_core::btree::MAX_KEY + 1];
    let err = t.add(&oversized, b"x", false).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    // The rejected add must not leave any pending state behind that would
    // corrupt or skip the next commit.
    t.add(b"ok", b"v", false).unwrap();
    t.commit().unwrap();
    assert_eq!(t.get_exact_entry(b"ok").unwrap(), Some(b"v".to_vec()));
}

// ================================================================================================
// Scenario 3 — large, highly compressible tag round-trips through compression
// ================================================================================================

#[test]
fn scenario_3_large_compressible_tag_round_trips() {
    let (path, mut t) = fresh_table(TableConfig::DEFAULT_BLOCK_SIZE);
    let value = vec![b'x'; 200_000];
    t.add(b"big", &value, false).unwrap();
    let root = t.commit().unwrap();

    let size_on_disk = fs::metadata(&path).unwrap().len();
    // A 200,000-byte run of one byte compresses to a tiny fraction of its
    // length; the table file as a whole should be much smaller than the
    // raw value, proving the tag was actually stored compressed rather
    // than verbatim.
    assert!(size_on_disk < 50_000, "file size {size_on_disk} suggests no compression occurred");

    let reopened = BTree::open(&path, TableConfig::default(), root).unwrap();
    assert_eq!(reopened.get_exact_entry(b"big").unwrap(), Some(value));
}

// ================================================================================================
// Scenario 4 — deletion reclaims space via the freelist
// ================================================================================================

#[test]
fn scenario_4_deletion_reclaims_space_via_freelist() {
    let (path, mut t) = fresh_table(2048);
    for i in 0..1_000u32 {
        let key = format!("key-{i:06}").into_bytes();
        t.add(&key, b"some-value", false).unwrap();
    }
    t.commit().unwrap();
    let size_after_first_load = fs::metadata(&path).unwrap().len();

    for i in 0..1_000u32 {
        let key = format!("key-{i:06}").into_bytes();
        assert!(t.del(&key).unwrap());
    }
    t.commit().unwrap();

    for i in 0..1_000u32 {
        // Reuse the same keys, so this is a pure block-recycling exercise.
        let key = format!("key-{i:06}").into_bytes();
        t.add(&key, b"some-value", false).unwrap();
    }
    t.commit().unwrap();
    let size_after_second_load = fs::metadata(&path).unwrap().len();

    // Allow one block of slack: the freelist reuses blocks starting with
    // the commit that frees them, so a handful of blocks touched only
    // during the delete pass may not yet be recyclable by the reload.
    let slack = 2048 * 2;
    assert!(
        size_after_second_load <= size_after_first_load + slack,
        "file grew from {size_after_first_load} to {size_after_second_load}, freelist reuse did not happen"
    );
}

// ================================================================================================
// Scenario 5 — an interruption before commit leaves the prior revision intact
// ================================================================================================

#[test]
fn scenario_5_uncommitted_work_is_absent_after_reopen() {
    let dir = TempDir::new().unwrap();
    let mut shard = Shard::create(dir.path(), Config::default()).unwrap();
    shard.add_document(one_term_doc(b"first", "alpha")).unwrap();
    shard.commit().unwrap();
    assert_eq!(shard.get_doccount(), 1);

    // Simulate a crash between indexing and commit: further adds are made
    // but the handle is dropped without calling commit(). This crate has no
    // fault-injection hook into the version file's rename step, so the
    // closest black-box equivalent is exercised here: an uncommitted write
    // must vanish, and the previously committed state must survive, exactly
    // as it would if the process had died mid-commit before the rename.
    shard.add_document(one_term_doc(b"second", "beta")).unwrap();
    drop(shard);

    let reopened = Shard::open(dir.path(), Config::default(), true).unwrap();
    assert_eq!(reopened.get_doccount(), 1);
    assert_eq!(reopened.open_document(1).unwrap().unwrap(), b"first");
    assert_eq!(reopened.open_post_list("beta").unwrap(), Vec::new());
}

// ================================================================================================
// Scenario 6 — compaction with renumbering
// ================================================================================================

#[test]
fn scenario_6_compaction_with_renumber() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    fs::remove_dir(dest.path()).unwrap();

    let mut a = Shard::create(dir_a.path(), Config::default()).unwrap();
    for i in 0..100u64 {
        a.add_document(one_term_doc(format!("a{i}").as_bytes(), "common")).unwrap();
    }
    a.commit().unwrap();

    let mut b = Shard::create(dir_b.path(), Config::default()).unwrap();
    for i in 0..100u64 {
        b.add_document(one_term_doc(format!("b{i}").as_bytes(), "common")).unwrap();
    }
    b.commit().unwrap();

    let mut compactor = Compactor::new(Config::default());
    let output = compactor.compact(&[a, b], dest.path()).unwrap();

    assert_eq!(output.get_doccount(), 200);
    assert_eq!(output.get_used_docid_range().unwrap(), Some((1, 200)));
    assert_eq!(output.open_document(101).unwrap().unwrap(), b"b0");
}

// ================================================================================================
// Shard CRUD and lifecycle
// ================================================================================================

#[test]
fn shard_crud_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut shard = Shard::create(dir.path(), Config::default()).unwrap();

    let docid = shard.add_document(one_term_doc(b"hello world", "hello")).unwrap();
    assert_eq!(shard.open_document(docid).unwrap().unwrap(), b"hello world");
    assert_eq!(shard.open_post_list("hello").unwrap(), vec![(docid, 1)]);

    shard
        .replace_document(docid, one_term_doc(b"goodbye world", "goodbye"))
        .unwrap();
    assert_eq!(shard.open_document(docid).unwrap().unwrap(), b"goodbye world");
    assert_eq!(shard.open_post_list("hello").unwrap(), Vec::new());

    assert!(shard.delete_document(docid).unwrap());
    assert_eq!(shard.open_document(docid).unwrap(), None);
    assert!(!shard.delete_document(docid).unwrap());

    shard.commit().unwrap();
}

#[test]
fn single_writer_lock_is_enforced() {
    let dir = TempDir::new().unwrap();
    let _writer = Shard::create(dir.path(), Config::default()).unwrap();

    let err = Shard::open(dir.path(), Config::default(), true).unwrap_err();
    assert!(matches!(err, Error::DatabaseLock));

    // A read-only handle is unaffected by the writer's lock.
    let reader = Shard::open(dir.path(), Config::default(), false).unwrap();
    assert_eq!(reader.get_doccount(), 0);
}

// ================================================================================================
// MultiDatabase overlay
// ================================================================================================

#[test]
fn multi_database_reads_through_the_docid_mapping() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let dir_c = TempDir::new().unwrap();

    let mut a = Shard::create(dir_a.path(), Config::default()).unwrap();
    let mut b = Shard::create(dir_b.path(), Config::default()).unwrap();
    let mut c = Shard::create(dir_c.path(), Config::default()).unwrap();
    a.add_document(one_term_doc(b"a0", "word")).unwrap();
    b.add_document(one_term_doc(b"b0", "word")).unwrap();
    c.add_document(one_term_doc(b"c0", "word")).unwrap();
    a.commit().unwrap();
    b.commit().unwrap();
    c.commit().unwrap();

    let multi = MultiDatabase::new(vec![a, b, c]);
    assert_eq!(multi.get_doccount(), 3);
    assert_eq!(multi.open_document(1).unwrap().unwrap(), b"a0");
    assert_eq!(multi.open_document(2).unwrap().unwrap(), b"b0");
    assert_eq!(multi.open_document(3).unwrap().unwrap(), b"c0");

    let merged: Vec<_> = multi.iter_all_terms().collect::<xapian_btree_core::error::Result<Vec<_>>>().unwrap();
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].collection_frequency, 3);
}
