//! Seekable readers: a windowed line reader with interpolation seeks, and
//! the block reader built on top of it.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::compress::BlockUnzipper;
use crate::error::{Error, FormatError, Result, UsageError};
use crate::index::{self, PositionCache, DEFAULT_CACHE_CAPACITY};
use crate::key::{GenomicKey, KeySchema};
use crate::row::Row;
use crate::rowbuf::RowBuffer;
use crate::scan::LineWindow;
use crate::DEFAULT_CHUNK_SIZE;

/// Sliding-window line reader over a sorted, line-framed source.
///
/// Sequential reading slides a fixed window forward; `seek` narrows a byte
/// range around the target with a [`PositionCache`] and interpolation
/// probes: each probe reads one window, compares its first/last keys to the
/// target and halves the uncertainty, landing in O(log n) reads without any
/// index. Keys discovered along the way are fed back into the cache so
/// nearby seeks get cheaper.
pub struct SeekableLineReader<R: Read + Seek> {
    source: R,
    path: String,
    file_len: u64,
    schema: KeySchema,
    window: LineWindow,
    window_offset: u64,
    loaded: bool,
    buf: Vec<u8>,
    chunk: usize,
    start_offset: u64,
    cache: PositionCache,
}

impl<R: Read + Seek> SeekableLineReader<R> {
    /// `path` is used for error context only; the reader itself is source
    /// agnostic.
    pub fn new(mut source: R, path: impl Into<String>, schema: KeySchema) -> Result<Self> {
        let path = path.into();
        let file_len = source
            .seek(SeekFrom::End(0))
            .map_err(|e| Error::from_read(&path, e))?;
        Ok(Self {
            source,
            path,
            file_len,
            schema,
            window: LineWindow::new(schema),
            window_offset: 0,
            loaded: false,
            buf: Vec::new(),
            chunk: DEFAULT_CHUNK_SIZE,
            start_offset: 0,
            cache: PositionCache::new(schema.order, DEFAULT_CACHE_CAPACITY),
        })
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.file_len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.file_len == 0
    }

    /// Marks everything before `offset` as preamble (header lines without
    /// keys); seeks never rewind into it.
    pub fn set_start_offset(&mut self, offset: u64) {
        self.start_offset = offset;
    }

    /// The key/offset cache backing seeks, for pre-seeding from an index.
    pub fn cache_mut(&mut self) -> &mut PositionCache {
        &mut self.cache
    }

    /// Whether the cursor has passed the last complete line.
    #[must_use]
    pub fn at_end(&self) -> bool {
        !self.window.has_next() && self.next_offset() >= self.file_len
    }

    /// Appends the next line (terminator excluded) to `out`; `false` at the
    /// end of the source.
    pub fn read_line(&mut self, out: &mut Vec<u8>) -> Result<bool> {
        if !self.window.has_next() && !self.advance()? {
            return Ok(false);
        }
        self.window.write_next(out);
        Ok(true)
    }

    /// Positions the cursor on the first line whose key is `>= key`.
    pub fn seek(&mut self, key: &GenomicKey) -> Result<()> {
        // A window already covering the key avoids any I/O.
        if self.loaded {
            if let (Ok(first), Ok(last)) = (self.window.first_key(), self.window.last_key()) {
                if self.schema.compare(key, &first) != Ordering::Less
                    && self.schema.compare(key, &last) != Ordering::Greater
                {
                    return self.window.seek(key);
                }
            }
        }

        let (mut low_key, mut low_off) = match self.cache.lower_bound(key) {
            Some((k, o)) => (k.clone(), (*o).max(self.start_offset)),
            None => (GenomicKey::default(), self.start_offset),
        };
        let (mut high_key, mut high_off) = match self.cache.ceiling(key) {
            Some((k, o)) => (k.clone(), *o),
            None => (GenomicKey::default(), self.file_len),
        };

        loop {
            let span = high_off.saturating_sub(low_off);
            if span <= self.chunk as u64 {
                self.slide_to(low_off, true)?;
                return self.window.seek(key);
            }
            let frac = key.estimate_fraction(&low_key, &high_key);
            let mid = low_off + (frac * span as f32) as u64;
            self.slide_to(mid, false)?;
            if !self.window.has_next() {
                // Ran into the tail without a complete line.
                high_off = mid.max(low_off + 1);
                continue;
            }
            let first = self.window.first_key()?;
            let last = self.window.last_key()?;
            let w_start = self.window_offset + self.window.lower_bound() as u64;
            let w_end = self.window_offset + self.window.upper_bound() as u64;
            self.cache.put(&last, w_end);
            if self.schema.compare(key, &first) == Ordering::Less {
                if w_start > low_off && w_start < high_off {
                    high_off = w_start;
                    high_key = first;
                } else {
                    // The probe window did not split the range; widen it so
                    // the direct read kicks in.
                    self.chunk *= 2;
                }
            } else if self.schema.compare(key, &last) == Ordering::Greater {
                if w_end > low_off && w_end < high_off {
                    low_off = w_end;
                    low_key = last;
                } else {
                    self.chunk *= 2;
                }
            } else {
                return self.window.seek(key);
            }
        }
    }

    /// File offset the next sequential slide starts at.
    fn next_offset(&self) -> u64 {
        if self.loaded {
            self.window_offset + self.window.upper_bound() as u64
        } else {
            0
        }
    }

    fn advance(&mut self) -> Result<bool> {
        let next = self.next_offset();
        if next >= self.file_len {
            return Ok(false);
        }
        self.slide_to(next, true)?;
        Ok(self.window.has_next())
    }

    /// Loads a window at `offset`, doubling the read size until it holds at
    /// least one complete line (or the file ends).
    fn slide_to(&mut self, offset: u64, aligned: bool) -> Result<()> {
        loop {
            let want = self.chunk.min((self.file_len - offset.min(self.file_len)) as usize);
            let got = self.read_at(offset, want)?;
            let at_eof = offset + got as u64 >= self.file_len;
            self.window
                .update(&self.buf, 0, got, aligned || offset == 0, at_eof);
            self.window_offset = offset;
            self.loaded = true;
            if self.window.has_next() || at_eof {
                return Ok(());
            }
            self.chunk *= 2;
        }
    }

    fn read_at(&mut self, offset: u64, len: usize) -> Result<usize> {
        self.source
            .seek(SeekFrom::Start(offset))
            .map_err(|e| Error::from_read(&self.path, e))?;
        self.buf.resize(len, 0);
        let mut filled = 0;
        while filled < len {
            match self.source.read(&mut self.buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::from_read(&self.path, e)),
            }
        }
        self.buf.truncate(filled);
        Ok(filled)
    }
}

/// Reader for a compressed block file: expands blocks on demand, buffers
/// their rows and serves ordered iteration with random-access seeks.
///
/// ```no_run
/// # fn main() -> anyhow::Result<()> {
/// let mut reader = gorz::BlockReader::open("variants.gorz")?;
/// reader.seek("chr2", 5_000_000)?;
/// while let Some(row) = reader.next_row()? {
///     if row.chrom != "chr2" {
///         break;
///     }
///     println!("{row}");
/// }
/// # Ok(())
/// # }
/// ```
pub struct BlockReader<R: Read + Seek> {
    lines: Option<SeekableLineReader<R>>,
    unzipper: BlockUnzipper,
    rows: RowBuffer,
    header: Option<String>,
    schema: KeySchema,
    path: String,
    index_path: Option<PathBuf>,
    index_loaded: bool,
    line_buf: Vec<u8>,
    block_buf: Vec<u8>,
}

impl BlockReader<BufReader<File>> {
    /// Opens a block file from disk with the default key schema. The `.gori`
    /// index next to it, if any, is loaded lazily on the first seek.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let file = File::open(path).map_err(|e| Error::from_read(&display, e))?;
        let index_path = Some(index::index_path_for(path));
        let mut reader = Self::new(BufReader::new(file), display, KeySchema::default())?;
        reader.index_path = index_path;
        Ok(reader)
    }
}

impl<R: Read + Seek> BlockReader<R> {
    /// Wraps an arbitrary source. The first line is read immediately and
    /// taken as the column header; a NUL in it separates the header text
    /// from the file's packed external lookup tables.
    pub fn new(source: R, path: impl Into<String>, schema: KeySchema) -> Result<Self> {
        let path = path.into();
        let mut lines = SeekableLineReader::new(source, path.clone(), schema)?;
        let mut first = Vec::new();
        let mut header = None;
        let mut unzipper = BlockUnzipper::default();
        if lines.read_line(&mut first)? {
            let (text, tables) = match memchr::memchr(0, &first) {
                Some(nul) => (&first[..nul], Some(first[nul + 1..].to_vec())),
                None => (&first[..], None),
            };
            header = Some(String::from_utf8_lossy(text).into_owned());
            unzipper = BlockUnzipper::new(tables);
            // Block lines start right after the header; seeks must never
            // rewind into it.
            let start = lines.window_offset + lines.window.cursor() as u64;
            lines.set_start_offset(start);
        }
        Ok(Self {
            lines: Some(lines),
            unzipper,
            rows: RowBuffer::new(schema),
            header,
            schema,
            path,
            index_path: None,
            index_loaded: false,
            line_buf: Vec::new(),
            block_buf: Vec::new(),
        })
    }

    /// The file's column header line, without the packed table section.
    #[must_use]
    pub fn header(&self) -> Option<&str> {
        self.header.as_deref()
    }

    /// Ordered column names from the header.
    #[must_use]
    pub fn columns(&self) -> Vec<&str> {
        self.header
            .as_deref()
            .map(|h| h.split('\t').collect())
            .unwrap_or_default()
    }

    /// Positions the iteration at the first row with key `>= (chrom, pos)`.
    ///
    /// When the buffered rows already cover the key this is a cursor move;
    /// otherwise the side index (first time only) and position cache narrow
    /// the file range, the landing block is expanded and the buffer
    /// binary-searched.
    pub fn seek(&mut self, chrom: &str, pos: i64) -> Result<()> {
        let key = GenomicKey::new(chrom, pos);
        let order = self.schema.order;
        if let (Some(first), Some(last)) = (self.rows.first(), self.rows.last()) {
            if first.compare_to(&key, order) != Ordering::Greater
                && last.compare_to(&key, order) != Ordering::Less
            {
                self.rows.seek(&key);
                return Ok(());
            }
        }
        self.load_index_once()?;
        self.lines_mut()?.seek(&key)?;
        self.rows.clear();
        self.fill_buffer()?;
        self.rows.seek(&key);
        Ok(())
    }

    /// The next row in key order, or `None` past the last one.
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        loop {
            if let Some(row) = self.rows.next() {
                return Ok(Some(row.clone()));
            }
            if !self.fill_buffer()? {
                return Ok(None);
            }
        }
    }

    /// Whether another row is available without consuming it.
    pub fn has_next(&mut self) -> Result<bool> {
        Ok(self.rows.available() || !self.lines_mut()?.at_end())
    }

    /// Releases the underlying source. Every later call on this reader
    /// fails with a usage error.
    pub fn close(&mut self) {
        self.lines = None;
        self.rows.clear();
    }

    fn lines_mut(&mut self) -> Result<&mut SeekableLineReader<R>> {
        self.lines
            .as_mut()
            .ok_or_else(|| UsageError::ReaderClosed.into())
    }

    /// Seeds the position cache from the side index, once. A missing index
    /// file is fine; seeks then rely on interpolation alone.
    fn load_index_once(&mut self) -> Result<()> {
        if self.index_loaded {
            return Ok(());
        }
        self.index_loaded = true;
        let Some(index_path) = self.index_path.clone() else {
            return Ok(());
        };
        if !index_path.exists() {
            return Ok(());
        }
        let file = File::open(&index_path)
            .map_err(|e| Error::from_read(&index_path.display().to_string(), e))?;
        let entries = index::read_index(BufReader::new(file))?;
        log::debug!(
            "loaded {} index entries for {}",
            entries.len(),
            self.path
        );
        let cache = self.lines_mut()?.cache_mut();
        for (key, offset) in &entries {
            cache.put(key, *offset);
        }
        Ok(())
    }

    /// Refills the row buffer from consecutive block lines at the current
    /// position. Returns whether any rows are now available.
    fn fill_buffer(&mut self) -> Result<bool> {
        let lines = self.lines.as_mut().ok_or(UsageError::ReaderClosed)?;
        self.rows.clear();
        while !self.rows.is_full() {
            self.line_buf.clear();
            if !lines.read_line(&mut self.line_buf)? {
                break;
            }
            let Some(at) = payload_start(&self.line_buf) else {
                return Err(FormatError::MissingBlockPayload {
                    path: self.path.clone(),
                    len: self.line_buf.len(),
                }
                .into());
            };
            self.block_buf.clear();
            if let Err(e) = self.unzipper.unzip(&self.line_buf[at..], &mut self.block_buf) {
                return Err(corrupt(&self.path, e));
            }
            self.rows.append(&self.block_buf)?;
        }
        if self.rows.is_full() {
            self.rows.enlarge();
        }
        Ok(self.rows.available())
    }
}

/// Decode failures below the format layer mean the file content itself is
/// damaged; report them against the path.
fn corrupt(path: &str, e: Error) -> Error {
    match e {
        Error::FormatError(_) => e,
        other => crate::error::ResourceError::CorruptFile {
            path: path.to_string(),
            reason: other.to_string(),
        }
        .into(),
    }
}

/// Start of a block line's payload field: the byte after the second tab.
fn payload_start(line: &[u8]) -> Option<usize> {
    let mut tabs = memchr::memchr_iter(b'\t', line);
    tabs.next()?;
    let second = tabs.next()?;
    (second + 1 < line.len()).then_some(second + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn plain_source(text: &str) -> SeekableLineReader<Cursor<Vec<u8>>> {
        SeekableLineReader::new(
            Cursor::new(text.as_bytes().to_vec()),
            "test",
            KeySchema::default(),
        )
        .unwrap()
    }

    fn sorted_lines(n: usize) -> String {
        let mut text = String::new();
        for i in 0..n {
            text.push_str(&format!("chr1\t{}\tvalue-{i}\n", (i + 1) * 10));
        }
        text
    }

    #[test]
    fn reads_lines_sequentially() {
        let mut r = plain_source("chr1\t10\ta\nchr1\t20\tb\nchr1\t30\tc\n");
        let mut line = Vec::new();
        assert!(r.read_line(&mut line).unwrap());
        assert_eq!(line, b"chr1\t10\ta");
        line.clear();
        assert!(r.read_line(&mut line).unwrap());
        line.clear();
        assert!(r.read_line(&mut line).unwrap());
        assert_eq!(line, b"chr1\t30\tc");
        assert!(!r.read_line(&mut line).unwrap());
        assert!(r.at_end());
    }

    #[test]
    fn seek_lands_across_window_boundaries() {
        // Far more data than one 32 KiB window.
        let text = sorted_lines(20_000);
        let mut r = plain_source(&text);
        let mut line = Vec::new();

        r.seek(&GenomicKey::new("chr1", 150_005)).unwrap();
        assert!(r.read_line(&mut line).unwrap());
        assert_eq!(line, b"chr1\t150010\tvalue-15000");

        // Backwards seek after reading forward.
        line.clear();
        r.seek(&GenomicKey::new("chr1", 10)).unwrap();
        assert!(r.read_line(&mut line).unwrap());
        assert_eq!(line, b"chr1\t10\tvalue-0");

        // Past the end.
        r.seek(&GenomicKey::new("chr2", 1)).unwrap();
        line.clear();
        assert!(!r.read_line(&mut line).unwrap());
    }

    #[test]
    fn seek_discovers_and_reuses_cache_entries() {
        let text = sorted_lines(20_000);
        let mut r = plain_source(&text);
        r.seek(&GenomicKey::new("chr1", 100_000)).unwrap();
        assert!(!r.cache_mut().is_empty());
        // A second nearby seek must still land correctly.
        r.seek(&GenomicKey::new("chr1", 100_500)).unwrap();
        let mut line = Vec::new();
        assert!(r.read_line(&mut line).unwrap());
        assert_eq!(line, b"chr1\t100500\tvalue-10049");
    }

    #[test]
    fn empty_source_is_exhausted() {
        let mut r = plain_source("");
        assert!(r.at_end());
        r.seek(&GenomicKey::new("chr1", 1)).unwrap();
        let mut line = Vec::new();
        assert!(!r.read_line(&mut line).unwrap());
    }
}
