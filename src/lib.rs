//! # xapian-btree-core
//!
//! A transactional, block-structured B-tree table storage engine, with a
//! multi-shard overlay and an offline compactor layered on top. Modeled on
//! Xapian's on-disk `Btree`/`BtreeTable` storage, stripped of the query
//! engine, text analysis, document extractors, and network protocol that
//! sit above it in the original system.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                      MultiDatabase                         │
//! │   docid interleaving (split_docid/join_docid) across       │
//! │   an ordered sequence of shards, merged term iteration     │
//! └───────────────────────┬───────────────────────────────────┘
//!                         │
//! ┌───────────────────────▼───────────────────────────────────┐
//! │                         Shard                              │
//! │  postlist · termlist · position · docdata · spelling ·    │
//! │  synonym tables, each a BTree; advisory single-writer lock │
//! └──────┬──────────────────────────────────┬──────────────────┘
//!        │                                  │
//! ┌──────▼──────────┐              ┌────────▼─────────┐
//! │      BTree       │              │      changes      │
//! │ blocks, freelist, │              │  per-revision log │
//! │ cursor, version    │              │  of applied diffs │
//! └──────┬────────────┘              └───────────────────┘
//!        │
//! ┌──────▼──────────┐
//! │  block / compression │
//! │  fixed-size pages,    │
//! │  optional zlib tags   │
//! └───────────────────────┘
//!
//! Compactor streams one or more Shards into a single freshly revisioned
//! output Shard, either renumbering docids densely or preserving them
//! verbatim when source ranges are disjoint.
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`block`] | Fixed-size on-disk block layout: header, directory, items packed from the high end |
//! | [`btree`] | The B-tree itself: node split/merge, lookups, and the [`btree::Cursor`] traversal API |
//! | [`freelist`] | Tracks reusable block numbers freed by prior revisions |
//! | [`compression`] | Optional zlib compression of tag data within a block |
//! | [`version`] | Per-table `RootInfo` and database-wide revision bookkeeping |
//! | [`changes`] | Append-only log of block diffs applied by a commit, for replication/recovery |
//! | [`shard`] | One Xapian-style database: the fixed set of postlist/termlist/position/docdata/spelling/synonym tables |
//! | [`multi`] | Presents an ordered sequence of shards as one logical database via docid interleaving |
//! | [`compactor`] | Merges shards into one densely packed or docid-preserving output shard |
//! | [`config`] | Table, changes-retention, and compaction-mode configuration |
//! | [`error`] | The crate's [`error::Error`] and [`error::Result`] types |
//! | [`encoding`] | Shared binary `Encode`/`Decode` traits and the `VarU64` varint type |
//!
//! ## Key Features
//!
//! - **Crash-safe commits** — a commit only becomes visible once every
//!   table's root block and the version file are written; an interrupted
//!   commit leaves the prior revision intact.
//! - **Copy-on-write blocks** — a table never overwrites a block still
//!   referenced by the last committed revision, so readers of the old
//!   revision are unaffected by in-progress writes.
//! - **Single-writer enforcement** — an advisory lock file prevents two
//!   writable handles from being opened on the same shard at once.
//! - **Multi-shard overlay** — [`multi::MultiDatabase`] spreads documents
//!   evenly across shards and merges their postlists on read.
//! - **Offline compaction** — [`compactor::Compactor`] rebuilds a set of
//!   shards into one, either renumbering docids to close gaps left by
//!   deletions or preserving them when source ranges don't overlap.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use xapian_btree_core::config::Config;
//! use xapian_btree_core::shard::{NewDocument, Posting, Shard};
//!
//! let mut shard = Shard::create("/tmp/my_shard", Config::default()).unwrap();
//!
//! let docid = shard
//!     .add_document(NewDocument {
//!         data: b"hello world".to_vec(),
//!         doclen: 2,
//!         postings: vec![
//!             Posting { term: "hello".into(), wdf: 1, positions: vec![0] },
//!             Posting { term: "world".into(), wdf: 1, positions: vec![1] },
//!         ],
//!     })
//!     .unwrap();
//!
//! shard.commit().unwrap();
//!
//! assert_eq!(shard.open_document(docid).unwrap().unwrap(), b"hello world");
//! assert_eq!(shard.open_post_list("hello").unwrap(), vec![(docid, 1)]);
//! ```

#![allow(dead_code)]

pub mod block;
pub mod btree;
pub mod compression;
pub mod changes;
pub mod compactor;
pub mod config;
pub mod encoding;
pub mod error;
pub mod freelist;
pub mod multi;
pub mod shard;
pub mod version;

pub use compactor::Compactor;
pub use config::Config;
pub use error::{Error, Result};
pub use multi::MultiDatabase;
pub use shard::Shard;
