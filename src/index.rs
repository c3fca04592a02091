//! The `.gori` side index: a text file of `chrom pos offset` entries that
//! seeds seeks into a block file.
//!
//! Each entry pairs the key of a block's last row with the file offset just
//! past that block's line, so a reader positioned at the offset starts on
//! the first block that can contain anything after the key. The index is
//! advisory; seeking works without it, just with more probing.

use std::fs::File;
use std::io::{BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::{Error, FormatError, Result};
use crate::key::{ChromOrder, GenomicKey, KeySchema};

/// Version tag carried in the index header line.
pub const INDEX_VERSION: &str = "GORIv1";
/// Extension appended to a block file's path to name its index.
pub const INDEX_EXTENSION: &str = "gori";

const INDEX_HEADER_PREFIX: &str = "## fileformat=";

/// How densely the index samples the block file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IndexKind {
    /// One entry per block
    #[default]
    Full,
    /// Only the last block of each chromosome; far smaller, still enough to
    /// confine a seek to one chromosome's byte range
    ChromLast,
}

/// Streaming writer for an index file. Entries must arrive in key order;
/// duplicates and zero offsets are dropped silently.
pub struct IndexWriter<W: Write> {
    out: W,
    kind: IndexKind,
    pending: Option<(GenomicKey, u64)>,
}

impl<W: Write> IndexWriter<W> {
    pub fn new(mut out: W, kind: IndexKind) -> Result<Self> {
        writeln!(out, "{INDEX_HEADER_PREFIX}{INDEX_VERSION}")?;
        Ok(Self {
            out,
            kind,
            pending: None,
        })
    }

    /// Records that the block ending with `key` ends at byte `offset`.
    ///
    /// Offset zero marks a block that was cached rather than written and
    /// carries no position information, so it is skipped.
    pub fn add(&mut self, key: &GenomicKey, offset: u64) -> Result<()> {
        if offset == 0 {
            return Ok(());
        }
        match self.kind {
            IndexKind::Full => {
                if self.pending.as_ref().is_none_or(|(last, _)| last != key) {
                    self.write_entry(key, offset)?;
                }
                self.pending = Some((key.clone(), offset));
            }
            IndexKind::ChromLast => {
                // Hold each entry back until the chromosome changes so only
                // the last block per chromosome lands in the file.
                if let Some((last, last_offset)) = self.pending.take() {
                    if last.chrom != key.chrom {
                        self.write_entry(&last, last_offset)?;
                    }
                }
                self.pending = Some((key.clone(), offset));
            }
        }
        Ok(())
    }

    /// Writes any held-back entry and flushes the output.
    pub fn finish(&mut self) -> Result<()> {
        if self.kind == IndexKind::ChromLast {
            if let Some((last, offset)) = self.pending.take() {
                self.write_entry(&last, offset)?;
            }
        }
        self.out.flush()?;
        Ok(())
    }

    fn write_entry(&mut self, key: &GenomicKey, offset: u64) -> Result<()> {
        writeln!(self.out, "{}\t{}\t{}", key.chrom, key.pos, offset)?;
        Ok(())
    }
}

/// Parses an index file into `(key, offset)` entries in file order.
pub fn read_index<R: BufRead>(reader: R) -> Result<Vec<(GenomicKey, u64)>> {
    let mut entries = Vec::new();
    let mut lines = reader.lines();
    match lines.next().transpose()? {
        Some(header) if header.strip_prefix(INDEX_HEADER_PREFIX) == Some(INDEX_VERSION) => {}
        other => {
            return Err(FormatError::InvalidIndexVersion {
                expected: INDEX_VERSION.to_string(),
                found: other.unwrap_or_default(),
            }
            .into())
        }
    }
    for line in lines {
        let line = line?;
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split('\t');
        let entry = match (fields.next(), fields.next(), fields.next()) {
            (Some(chrom), Some(pos), Some(offset)) => pos
                .parse::<i64>()
                .ok()
                .zip(offset.parse::<u64>().ok())
                .map(|(pos, offset)| (GenomicKey::new(chrom, pos), offset)),
            _ => None,
        };
        match entry {
            Some(entry) => entries.push(entry),
            None => return Err(FormatError::MalformedIndexEntry(line).into()),
        }
    }
    Ok(entries)
}

/// Path of the index belonging to `block_path` (`foo.gorz` -> `foo.gorz.gori`).
#[must_use]
pub fn index_path_for(block_path: &Path) -> PathBuf {
    let mut path = block_path.as_os_str().to_owned();
    path.push(".");
    path.push(INDEX_EXTENSION);
    PathBuf::from(path)
}

/// Builds the index for an existing block file by scanning its block lines,
/// writing it next to the file. Returns the index path.
///
/// Block lines open with the key of their last row, so each line yields its
/// entry without expanding any payload.
pub fn write_for_block_file(block_path: &Path, kind: IndexKind) -> Result<PathBuf> {
    let display = block_path.display().to_string();
    let file = File::open(block_path).map_err(|e| Error::from_read(&display, e))?;
    let map = unsafe { Mmap::map(&file) }.map_err(|e| Error::from_read(&display, e))?;

    let index_path = index_path_for(block_path);
    let mut writer = IndexWriter::new(BufWriter::new(File::create(&index_path)?), kind)?;
    let schema = KeySchema::default();
    let mut pos = 0usize;
    let mut first = true;
    while pos < map.len() {
        let end = match memchr::memchr(b'\n', &map[pos..]) {
            Some(k) => pos + k + 1,
            None => map.len(),
        };
        if map[pos] != b'#' {
            match schema.parse(&map, pos, end) {
                Ok(key) => writer.add(&key, end as u64)?,
                // The first line may be the file's column header.
                Err(e) if first => {
                    log::debug!("skipping header line of {display}: {e}");
                }
                Err(e) => return Err(e),
            }
        }
        first = false;
        pos = end;
    }
    writer.finish()?;
    log::debug!("wrote {kind:?} index for {display}");
    Ok(index_path)
}

/// Bounded, sorted cache of known `(key, offset)` pairs in one block file.
///
/// Seeded from the side index and fed every key discovered while seeking, it
/// narrows the byte range of later seeks. When full, the entry whose removal
/// costs the least seek precision is dropped: interior entries with the
/// smallest product of neighbouring offset gaps go first, chromosome
/// boundary entries are kept.
#[derive(Debug)]
pub struct PositionCache {
    entries: Vec<(GenomicKey, u64)>,
    order: ChromOrder,
    capacity: usize,
}

/// Default bound on cached positions per reader.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

impl PositionCache {
    #[must_use]
    pub fn new(order: ChromOrder, capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            order,
            capacity: capacity.max(2),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts a key/offset pair; a key already present is left untouched.
    pub fn put(&mut self, key: &GenomicKey, offset: u64) {
        match self.search(key) {
            Ok(_) => {}
            Err(at) => {
                self.entries.insert(at, (key.clone(), offset));
                if self.entries.len() > self.capacity {
                    self.evict_one();
                }
            }
        }
    }

    /// Greatest cached entry with key strictly `< key`. Index offsets point
    /// just past the block ending with their key, so a seek for exactly that
    /// key must start from the previous entry.
    #[must_use]
    pub fn lower_bound(&self, key: &GenomicKey) -> Option<&(GenomicKey, u64)> {
        match self.search(key) {
            Ok(0) | Err(0) => None,
            Ok(at) | Err(at) => Some(&self.entries[at - 1]),
        }
    }

    /// Greatest cached entry with key `<= key`.
    #[must_use]
    pub fn floor(&self, key: &GenomicKey) -> Option<&(GenomicKey, u64)> {
        match self.search(key) {
            Ok(at) => Some(&self.entries[at]),
            Err(0) => None,
            Err(at) => Some(&self.entries[at - 1]),
        }
    }

    /// Smallest cached entry with key `>= key`.
    #[must_use]
    pub fn ceiling(&self, key: &GenomicKey) -> Option<&(GenomicKey, u64)> {
        match self.search(key) {
            Ok(at) | Err(at) => self.entries.get(at),
        }
    }

    fn search(&self, key: &GenomicKey) -> std::result::Result<usize, usize> {
        self.entries
            .binary_search_by(|(k, _)| self.order.compare(k, key))
    }

    fn evict_one(&mut self) {
        let mut victim: Option<(usize, u128)> = None;
        for i in 1..self.entries.len() - 1 {
            let (prev_key, prev_off) = &self.entries[i - 1];
            let (key, _) = &self.entries[i];
            let (next_key, next_off) = &self.entries[i + 1];
            if prev_key.chrom != key.chrom || key.chrom != next_key.chrom {
                continue;
            }
            let gap = u128::from(self.entries[i].1.saturating_sub(*prev_off))
                * u128::from(next_off.saturating_sub(self.entries[i].1));
            if victim.is_none_or(|(_, g)| gap < g) {
                victim = Some((i, gap));
            }
        }
        match victim {
            Some((i, _)) => {
                self.entries.remove(i);
            }
            // Nothing but boundaries left; give up the middle one.
            None => {
                let mid = self.entries.len() / 2;
                self.entries.remove(mid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn entry(chrom: &str, pos: i64, offset: u64) -> (GenomicKey, u64) {
        (GenomicKey::new(chrom, pos), offset)
    }

    fn write_entries(kind: IndexKind, entries: &[(GenomicKey, u64)]) -> String {
        let mut out = Vec::new();
        let mut w = IndexWriter::new(&mut out, kind).unwrap();
        for (key, offset) in entries {
            w.add(key, *offset).unwrap();
        }
        w.finish().unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn full_index_round_trips() {
        let entries = vec![
            entry("chr1", 100, 512),
            entry("chr1", 900, 1024),
            entry("chr2", 50, 2048),
        ];
        let text = write_entries(IndexKind::Full, &entries);
        assert!(text.starts_with("## fileformat=GORIv1\n"));
        let read = read_index(Cursor::new(text)).unwrap();
        assert_eq!(read, entries);
    }

    #[test]
    fn full_index_suppresses_duplicates_and_zero_offsets() {
        let text = write_entries(
            IndexKind::Full,
            &[
                entry("chr1", 100, 0), // cached block, no offset yet
                entry("chr1", 100, 512),
                entry("chr1", 100, 768), // same key again
                entry("chr1", 200, 1024),
            ],
        );
        let read = read_index(Cursor::new(text)).unwrap();
        assert_eq!(read, vec![entry("chr1", 100, 512), entry("chr1", 200, 1024)]);
    }

    #[test]
    fn chrom_index_keeps_only_last_entry_per_chromosome() {
        let text = write_entries(
            IndexKind::ChromLast,
            &[
                entry("chr1", 100, 512),
                entry("chr1", 900, 1024),
                entry("chr2", 50, 2048),
                entry("chr2", 80, 3072),
            ],
        );
        let read = read_index(Cursor::new(text)).unwrap();
        assert_eq!(read, vec![entry("chr1", 900, 1024), entry("chr2", 80, 3072)]);
    }

    #[test]
    fn version_mismatch_is_fatal() {
        let err = read_index(Cursor::new("## fileformat=GORIv2\nchr1\t1\t10\n")).unwrap_err();
        assert!(matches!(
            err,
            Error::FormatError(FormatError::InvalidIndexVersion { .. })
        ));
    }

    #[test]
    fn malformed_entry_is_rejected() {
        let err =
            read_index(Cursor::new("## fileformat=GORIv1\nchr1\toops\t10\n")).unwrap_err();
        assert!(matches!(
            err,
            Error::FormatError(FormatError::MalformedIndexEntry(_))
        ));
    }

    #[test]
    fn cache_floor_and_ceiling() {
        let mut cache = PositionCache::new(ChromOrder::Lexical, 16);
        cache.put(&GenomicKey::new("chr1", 100), 10);
        cache.put(&GenomicKey::new("chr1", 500), 50);
        cache.put(&GenomicKey::new("chr2", 100), 90);

        let target = GenomicKey::new("chr1", 300);
        assert_eq!(cache.floor(&target), Some(&entry("chr1", 100, 10)));
        assert_eq!(cache.ceiling(&target), Some(&entry("chr1", 500, 50)));

        assert_eq!(cache.floor(&GenomicKey::new("chr1", 1)), None);
        assert_eq!(cache.ceiling(&GenomicKey::new("chr3", 1)), None);
        // Exact hit serves both sides.
        let exact = GenomicKey::new("chr1", 500);
        assert_eq!(cache.floor(&exact), cache.ceiling(&exact));
    }

    #[test]
    fn cache_put_is_idempotent_and_bounded() {
        let mut cache = PositionCache::new(ChromOrder::Lexical, 8);
        for _ in 0..3 {
            cache.put(&GenomicKey::new("chr1", 42), 7);
        }
        assert_eq!(cache.len(), 1);

        for pos in 0..100 {
            cache.put(&GenomicKey::new("chr1", pos * 10), pos as u64 * 100);
        }
        assert!(cache.len() <= 8);
    }

    #[test]
    fn eviction_prefers_interior_entries_over_chromosome_boundaries() {
        let mut cache = PositionCache::new(ChromOrder::Lexical, 4);
        cache.put(&GenomicKey::new("chr1", 100), 100);
        cache.put(&GenomicKey::new("chr1", 200), 200);
        cache.put(&GenomicKey::new("chr1", 300), 300);
        cache.put(&GenomicKey::new("chr2", 100), 400);
        // Forces one eviction; the chr1/chr2 boundary entries must survive.
        cache.put(&GenomicKey::new("chr2", 200), 500);
        assert!(cache.floor(&GenomicKey::new("chr1", 999)).is_some());
        assert!(cache.ceiling(&GenomicKey::new("chr2", 1)).is_some());
        assert_eq!(cache.len(), 4);
    }
}
