//! Compactor (§4.7): streams one or more source shards into a single,
//! densely packed output shard at a single revision.
//!
//! Grounded on `api/compactor.cc`'s `Database::compact_` for the algorithm —
//! offset computation for renumbering (including its "prune the gap before
//! the first used docid" and deliberately-unsigned-wraparound `tot_off`
//! trick), `CmpByFirstUsed`-style disjoint-range sort and check for
//! preserve-docids mode, and the "empty databases might still have
//! spelling/synonym data" note that keeps every source in play even when
//! its doccount is zero. Output writing style (merge into fresh tables,
//! discard partial output on failure) follows `compaction/mod.rs`'s
//! `finalize_compaction`/build-then-publish shape, generalized from
//! SSTable building to shard-document copying.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{CompactionMode, Config};
use crate::error::{Error, Result};
use crate::shard::{MetadataTable, Shard};

/// Default `resolve_duplicate_metadata`: keep the first source's tag,
/// matching `Compactor::resolve_duplicate_metadata`'s C++ default.
fn keep_first(_key: &[u8], tags: &[Vec<u8>]) -> Vec<u8> {
    tags[0].clone()
}

/// Streams one or more source [`Shard`]s into a single output shard.
///
/// `set_status` is called periodically with `(table, status)` as each
/// table finishes; the default is a no-op, matching `Compactor::set_status`.
/// `resolve_duplicate_metadata` resolves a spelling/synonym key that more
/// than one source defines; the default keeps the first source's tag.
pub struct Compactor {
    mode: CompactionMode,
    config: Config,
    set_status: Box<dyn FnMut(&str, &str)>,
    resolve_duplicate_metadata: Box<dyn Fn(&[u8], &[Vec<u8>]) -> Vec<u8>>,
}

impl Compactor {
    pub fn new(config: Config) -> Self {
        Compactor {
            mode: CompactionMode::default(),
            config,
            set_status: Box::new(|_, _| {}),
            resolve_duplicate_metadata: Box::new(keep_first),
        }
    }

    pub fn with_mode(mut self, mode: CompactionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn set_status_hook(&mut self, hook: impl FnMut(&str, &str) + 'static) {
        self.set_status = Box::new(hook);
    }

    pub fn set_metadata_resolver(
        &mut self,
        resolver: impl Fn(&[u8], &[Vec<u8>]) -> Vec<u8> + 'static,
    ) {
        self.resolve_duplicate_metadata = Box::new(resolver);
    }

    /// Compact `sources` into a fresh shard at `dest_dir`, which must not
    /// already exist and must not coincide with any source's directory.
    /// On any error the partially written output directory is removed
    /// before the error is returned (§4.7 failure semantics).
    pub fn compact(&mut self, sources: &[Shard], dest_dir: impl Into<PathBuf>) -> Result<Shard> {
        let dest_dir = dest_dir.into();
        self.validate_destination(sources, &dest_dir)?;

        match self.try_compact(sources, &dest_dir) {
            Ok(shard) => Ok(shard),
            Err(e) => {
                let _ = fs::remove_dir_all(&dest_dir);
                Err(e)
            }
        }
    }

    fn validate_destination(&self, sources: &[Shard], dest_dir: &Path) -> Result<()> {
        if sources.is_empty() {
            return Err(Error::InvalidArgument(
                "compaction requires at least one source".into(),
            ));
        }
        for source in sources {
            if same_path(source.dir(), dest_dir) {
                return Err(Error::InvalidArgument(
                    "destination may not be the same as any source database".into(),
                ));
            }
        }
        Ok(())
    }

    fn try_compact(&mut self, sources: &[Shard], dest_dir: &Path) -> Result<Shard> {
        let plan = self.plan(sources)?;

        let mut dest_config = self.config.clone();
        dest_config.changes_retention = crate::config::ChangesRetention::Disabled;
        let mut dest = Shard::create(dest_dir, dest_config)?;
        dest.set_full_compaction(true);

        for source in plan.order.iter().copied() {
            let shard = &sources[source];
            let offset = plan.offsets[source];
            for docid in shard.iter_docids()? {
                let doc = shard
                    .full_document(docid)?
                    .ok_or_else(|| Error::DatabaseCorrupt("docid listed but document missing".into()))?;
                let mapped = (u64::from(docid) + offset) as u32;
                dest.replace_document(mapped, doc)?;
            }
            (self.set_status)("docdata", &format!("source {source} merged"));
        }
        dest.bump_lastdocid(plan.last_docid);

        for table in [MetadataTable::Spelling, MetadataTable::Synonym] {
            self.merge_metadata(sources, table, &mut dest)?;
            (self.set_status)(
                match table {
                    MetadataTable::Spelling => "spelling",
                    MetadataTable::Synonym => "synonym",
                },
                "merged",
            );
        }

        dest.commit()?;
        Ok(dest)
    }

    fn merge_metadata(&self, sources: &[Shard], table: MetadataTable, dest: &mut Shard) -> Result<()> {
        let mut merged: Vec<(Vec<u8>, Vec<Vec<u8>>)> = Vec::new();
        for source in sources {
            for (key, tag) in source.iter_metadata_table(table)? {
                match merged.iter_mut().find(|(k, _)| *k == key) {
                    Some((_, tags)) => tags.push(tag),
                    None => merged.push((key, vec![tag])),
                }
            }
        }
        for (key, tags) in merged {
            let resolved = if tags.len() == 1 {
                tags.into_iter().next().unwrap()
            } else {
                (self.resolve_duplicate_metadata)(&key, &tags)
            };
            dest.put_metadata(table, &key, &resolved)?;
        }
        Ok(())
    }

    /// Determine per-source docid offsets (or identity for preserve mode)
    /// and the processing order, validating ranges up front for preserve
    /// mode (§9 redesign: validated before streaming, not mid-merge).
    fn plan(&self, sources: &[Shard]) -> Result<CompactionPlan> {
        let ranges: Vec<Option<(u32, u32)>> = sources
            .iter()
            .map(Shard::get_used_docid_range)
            .collect::<Result<Vec<_>>>()?;

        match self.mode {
            CompactionMode::Renumber => {
                let mut tot_off: u64 = 0;
                let mut offsets = Vec::with_capacity(sources.len());
                for range in &ranges {
                    if let Some((first, _)) = range {
                        if *first > 0 {
                            tot_off = tot_off.wrapping_sub(u64::from(*first - 1));
                        }
                    }
                    offsets.push(tot_off);
                    if let Some((_, last)) = range {
                        tot_off = tot_off.wrapping_add(u64::from(*last));
                    }
                }
                Ok(CompactionPlan {
                    order: (0..sources.len()).collect(),
                    offsets,
                    last_docid: tot_off,
                })
            }
            CompactionMode::PreserveDocids => {
                let mut order: Vec<usize> = (0..sources.len()).collect();
                order.sort_by_key(|&i| ranges[i].map_or(0, |(first, _)| first));

                let mut last_end: u32 = 0;
                for &i in &order {
                    let Some((first, last)) = ranges[i] else {
                        continue;
                    };
                    if first <= last_end {
                        return Err(Error::InvalidOperation(
                            "preserve-docids compaction requires disjoint used-docid ranges".into(),
                        ));
                    }
                    last_end = last;
                }

                let last_docid = sources.iter().map(Shard::get_lastdocid).max().unwrap_or(0);
                Ok(CompactionPlan {
                    offsets: vec![0; sources.len()],
                    order,
                    last_docid,
                })
            }
        }
    }
}

struct CompactionPlan {
    /// Source indices in the order they should be streamed.
    order: Vec<usize>,
    /// Per-source-index (not per-order-position) docid offset to add to a
    /// local docid to get its output docid.
    offsets: Vec<u64>,
    last_docid: u64,
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
