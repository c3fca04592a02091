//! Block file writer: chunks sorted rows into compressed block lines.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::codec::{self, ExternalTableSet, MAX_BLOCK_ROWS};
use crate::compress::{compress, CompressionType, COLUMN_FLAG};
use crate::error::{CapacityError, Result, UsageError};
use crate::index::{index_path_for, IndexKind, IndexWriter};
use crate::key::{GenomicKey, KeySchema};
use crate::util::{pack_base128, push_i64};
use crate::DEFAULT_CHUNK_SIZE;

/// Blocks held back before the header is forced out. While blocks are
/// cached the external lookup tables may still grow; once the header (which
/// carries the tables) is on disk they are frozen.
const MAX_CACHED_BLOCKS: usize = 16;

/// Configuration for a [`BlockWriter`].
///
/// ```no_run
/// # fn main() -> anyhow::Result<()> {
/// let mut writer = gorz::BlockWriterBuilder::default()
///     .index(gorz::IndexKind::Full)
///     .create("variants.gorz")?;
/// writer.set_header("Chrom\tPos\tRef\tAlt")?;
/// writer.add_row("chr1\t12345\tA\tG")?;
/// writer.finish()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct BlockWriterBuilder {
    compression: CompressionType,
    column_encode: bool,
    chunk_size: usize,
    schema: KeySchema,
    index: Option<IndexKind>,
}

impl Default for BlockWriterBuilder {
    fn default() -> Self {
        Self {
            compression: CompressionType::Zstd,
            column_encode: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
            schema: KeySchema::default(),
            index: None,
        }
    }
}

impl BlockWriterBuilder {
    #[must_use]
    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Disables column encoding; blocks then hold compressed raw row text.
    #[must_use]
    pub fn raw_rows(mut self) -> Self {
        self.column_encode = false;
        self
    }

    #[must_use]
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(64);
        self
    }

    #[must_use]
    pub fn schema(mut self, schema: KeySchema) -> Self {
        self.schema = schema;
        self
    }

    /// Also writes a side index of the given kind.
    #[must_use]
    pub fn index(mut self, kind: IndexKind) -> Self {
        self.index = Some(kind);
        self
    }

    /// Builds a writer over any sink, without a side index.
    #[must_use]
    pub fn build<W: Write>(self, out: W) -> BlockWriter<W> {
        self.assemble(out, None)
    }

    /// Builds a writer whose index entries go to `index_sink`.
    pub fn build_with_index<W: Write, I: Write + 'static>(
        self,
        out: W,
        index_sink: I,
    ) -> Result<BlockWriter<W>> {
        let kind = self.index.unwrap_or_default();
        let index = IndexWriter::new(Box::new(index_sink) as Box<dyn Write>, kind)?;
        Ok(self.assemble(out, Some(index)))
    }

    /// Creates `path` (and `path.gori` when an index kind is configured).
    pub fn create(self, path: impl AsRef<Path>) -> Result<BlockWriter<BufWriter<File>>> {
        let path = path.as_ref();
        let out = BufWriter::new(File::create(path)?);
        if self.index.is_some() {
            let sink = BufWriter::new(File::create(index_path_for(path))?);
            self.build_with_index(out, sink)
        } else {
            Ok(self.build(out))
        }
    }

    fn assemble<W: Write>(
        self,
        out: W,
        index: Option<IndexWriter<Box<dyn Write>>>,
    ) -> BlockWriter<W> {
        BlockWriter {
            out,
            compression: self.compression,
            column_encode: self.column_encode,
            schema: self.schema,
            chunk_size: self.chunk_size,
            chunk: Vec::with_capacity(self.chunk_size),
            chunk_rows: 0,
            chunk_key: None,
            header: None,
            header_written: false,
            cached: Vec::new(),
            tables: ExternalTableSet::default(),
            bytes_written: 0,
            index,
        }
    }
}

/// Writes rows (which must arrive in key order) as a compressed block file.
///
/// Rows accumulate into ~chunk-size blocks; a chromosome change forces a
/// block boundary so no block spans two chromosomes. Early blocks are held
/// in memory until either [`MAX_CACHED_BLOCKS`] are pending or the writer
/// finishes, at which point the header line — with the settled external
/// lookup tables packed after a NUL — is written first, followed by the
/// cached blocks. Dropping the writer without calling
/// [`finish`](BlockWriter::finish) loses the held-back data.
pub struct BlockWriter<W: Write> {
    out: W,
    compression: CompressionType,
    column_encode: bool,
    schema: KeySchema,
    chunk_size: usize,
    chunk: Vec<u8>,
    chunk_rows: usize,
    chunk_key: Option<GenomicKey>,
    header: Option<String>,
    header_written: bool,
    cached: Vec<(GenomicKey, Vec<u8>)>,
    tables: ExternalTableSet,
    bytes_written: u64,
    index: Option<IndexWriter<Box<dyn Write>>>,
}

impl<W: Write> BlockWriter<W> {
    /// Sets the column header line. Must precede the first header flush;
    /// once the header is on disk it cannot change.
    pub fn set_header(&mut self, header: &str) -> Result<()> {
        if self.header_written {
            return Err(
                UsageError::HeaderAlreadyWritten(header.chars().take(64).collect()).into(),
            );
        }
        self.header = Some(header.trim_end_matches(['\r', '\n']).to_string());
        Ok(())
    }

    /// Appends one row. `line` is the tab-delimited row text; a trailing
    /// newline is tolerated and ignored.
    pub fn add_row(&mut self, line: &str) -> Result<()> {
        let trimmed = line.trim_end_matches(['\r', '\n']).as_bytes();
        let key = self.schema.parse(trimmed, 0, trimmed.len())?;
        if let Some(last) = &self.chunk_key {
            if last.chrom != key.chrom {
                self.flush_block()?;
            }
        }
        self.chunk.extend_from_slice(trimmed);
        self.chunk.push(b'\n');
        self.chunk_rows += 1;
        self.chunk_key = Some(key);
        if self.chunk.len() >= self.chunk_size || self.chunk_rows >= MAX_BLOCK_ROWS {
            self.flush_block()?;
        }
        Ok(())
    }

    /// Flushes pending rows and the header, finishes the index and returns
    /// the sink.
    pub fn finish(mut self) -> Result<W> {
        self.flush_block()?;
        self.write_header_and_cached()?;
        if let Some(index) = &mut self.index {
            index.finish()?;
        }
        self.out.flush()?;
        Ok(self.out)
    }

    fn flush_block(&mut self) -> Result<()> {
        let Some(key) = self.chunk_key.take() else {
            return Ok(());
        };
        let mut flag = self.compression.flag_bits();
        let payload = if self.column_encode {
            flag |= COLUMN_FLAG;
            let budget = self.table_budget();
            let mut block = Vec::new();
            codec::encode(
                &self.chunk,
                &mut self.tables,
                !self.header_written,
                budget,
                &mut block,
            )?;
            compress(self.compression, &block)?
        } else {
            compress(self.compression, &self.chunk)?
        };

        let mut line = Vec::with_capacity(key.chrom.len() + payload.len() * 8 / 7 + 16);
        line.extend_from_slice(key.chrom.as_bytes());
        line.push(b'\t');
        push_i64(&mut line, key.pos);
        line.push(b'\t');
        line.push(flag);
        line.extend_from_slice(&pack_base128(&payload));
        line.push(b'\n');

        self.chunk.clear();
        self.chunk_rows = 0;

        if self.header_written {
            self.write_block_line(&key, &line)
        } else {
            self.cached.push((key, line));
            if self.cached.len() >= MAX_CACHED_BLOCKS {
                self.write_header_and_cached()?;
            }
            Ok(())
        }
    }

    /// Emits the header line (always present, even when empty) with the
    /// packed external tables, then drains the cached blocks in order.
    fn write_header_and_cached(&mut self) -> Result<()> {
        if self.header_written {
            return Ok(());
        }
        let mut line = Vec::new();
        line.extend_from_slice(self.header.as_deref().unwrap_or("").as_bytes());
        let tables = self.tables.to_bytes()?;
        // Two bytes mean zero tables; nothing worth carrying.
        if tables.len() > 2 {
            line.push(0);
            line.extend_from_slice(&pack_base128(&compress(self.compression, &tables)?));
        }
        line.push(b'\n');
        if line.len() > self.chunk_size {
            return Err(CapacityError::HeaderTooLarge {
                size: line.len(),
                limit: self.chunk_size,
            }
            .into());
        }
        self.header_written = true;
        self.out.write_all(&line)?;
        self.bytes_written += line.len() as u64;
        log::debug!(
            "header written after {} cached blocks, {} table bytes",
            self.cached.len(),
            tables.len()
        );
        let cached = std::mem::take(&mut self.cached);
        for (key, block_line) in &cached {
            self.write_block_line(key, block_line)?;
        }
        Ok(())
    }

    fn write_block_line(&mut self, key: &GenomicKey, line: &[u8]) -> Result<()> {
        self.out.write_all(line)?;
        self.bytes_written += line.len() as u64;
        if let Some(index) = &mut self.index {
            index.add(key, self.bytes_written)?;
        }
        Ok(())
    }

    /// Bytes the external tables may occupy: the header's chunk must hold
    /// the header text, a NUL and the tables.
    fn table_budget(&self) -> usize {
        let header_len = self.header.as_ref().map_or(0, String::len);
        self.chunk_size.saturating_sub(header_len + 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Write sink with shared ownership, so tests can inspect index bytes
    /// after the writer consumed the sink.
    #[derive(Clone, Default)]
    struct SharedSink(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn block_lines(bytes: &[u8]) -> Vec<&[u8]> {
        // Lines after the header.
        bytes.split(|&b| b == b'\n').skip(1).filter(|l| !l.is_empty()).collect()
    }

    #[test]
    fn header_line_comes_first_even_when_empty() {
        let mut writer = BlockWriterBuilder::default().build(Vec::new());
        writer.add_row("chr1\t100\tA").unwrap();
        let bytes = writer.finish().unwrap();
        // No header set, no tables worth keeping: an empty header line.
        let first = bytes.split(|&b| b == b'\n').next().unwrap();
        assert!(first.is_empty());
        assert_eq!(block_lines(&bytes).len(), 1);
    }

    #[test]
    fn block_lines_open_with_their_last_row_key() {
        let mut writer = BlockWriterBuilder::default().build(Vec::new());
        writer.set_header("Chrom\tPos\tRef").unwrap();
        writer.add_row("chr1\t100\tA").unwrap();
        writer.add_row("chr1\t250\tC").unwrap();
        let bytes = writer.finish().unwrap();
        let lines = block_lines(&bytes);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with(b"chr1\t250\t"));
    }

    #[test]
    fn chromosome_change_forces_a_block_boundary() {
        let mut writer = BlockWriterBuilder::default().build(Vec::new());
        writer.add_row("chr1\t100\tA").unwrap();
        writer.add_row("chr1\t200\tC").unwrap();
        writer.add_row("chr2\t50\tG").unwrap();
        let bytes = writer.finish().unwrap();
        let lines = block_lines(&bytes);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with(b"chr1\t200\t"));
        assert!(lines[1].starts_with(b"chr2\t50\t"));
    }

    #[test]
    fn header_flushes_after_enough_cached_blocks() {
        // A tiny chunk size turns every row into its own block.
        let mut writer = BlockWriterBuilder::default().chunk_size(64).build(Vec::new());
        for i in 0..MAX_CACHED_BLOCKS {
            let filler = "x".repeat(64);
            writer
                .add_row(&format!("chr1\t{}\t{filler}", (i + 1) * 10))
                .unwrap();
        }
        // Header is now on disk; changing it is a usage error.
        let err = writer.set_header("Chrom\tPos\tData").unwrap_err();
        assert!(matches!(
            err,
            crate::Error::UsageError(UsageError::HeaderAlreadyWritten(_))
        ));
        writer.finish().unwrap();
    }

    #[test]
    fn index_entries_follow_written_blocks() {
        let index = SharedSink::default();
        let builder = BlockWriterBuilder::default()
            .chunk_size(64)
            .index(IndexKind::Full);
        let mut writer = builder
            .build_with_index(Vec::new(), index.clone())
            .unwrap();
        let filler = "y".repeat(64);
        for i in 0..5 {
            writer
                .add_row(&format!("chr1\t{}\t{filler}", (i + 1) * 100))
                .unwrap();
        }
        writer.finish().unwrap();
        let bytes = index.0.borrow().clone();
        let entries = crate::index::read_index(std::io::Cursor::new(bytes)).unwrap();
        assert_eq!(entries.len(), 5);
        // Offsets strictly increase with keys.
        for pair in entries.windows(2) {
            assert!(pair[0].0.pos < pair[1].0.pos);
            assert!(pair[0].1 < pair[1].1);
        }
    }

    #[test]
    fn oversized_header_is_rejected() {
        let mut writer = BlockWriterBuilder::default().chunk_size(64).build(Vec::new());
        writer.set_header(&"c".repeat(200)).unwrap();
        writer.add_row("chr1\t1\tA").unwrap();
        assert!(matches!(
            writer.finish().unwrap_err(),
            crate::Error::CapacityError(CapacityError::HeaderTooLarge { .. })
        ));
    }
}
