//! # gorz
//!
//! Compressed, seekable, columnar storage for position-sorted genomic rows.
//!
//! A block file packs tab-delimited rows (chromosome and position in the
//! first two columns) into compressed blocks of up to 65 535 rows. Each
//! block is transposed into columns and every column gets the cheapest of a
//! family of encodings: arithmetic progressions, fixed-width offsets and
//! deltas for numbers; constant, in-block lookup, file-wide external lookup
//! tables, or plain text for strings. Blocks are compressed (zstd or zlib)
//! and base-128 packed so the file stays a sorted sequence of text lines:
//!
//! ```text
//! header \0 packed(external tables)
//! last_chrom \t last_pos \t flag + packed(compressed(block))
//! ...
//! ```
//!
//! Because every block line opens with the key of its last row, the file
//! supports binary-search seeks with no index at all; an optional `.gori`
//! side index and an adaptive position cache cut the probe count further.
//!
//! ## Example
//!
//! ```
//! # fn main() -> anyhow::Result<()> {
//! let dir = tempfile::tempdir()?;
//! let path = dir.path().join("sample.gorz");
//!
//! let mut writer = gorz::BlockWriterBuilder::default()
//!     .index(gorz::IndexKind::Full)
//!     .create(&path)?;
//! writer.set_header("Chrom\tPos\tRef\tAlt")?;
//! writer.add_row("chr1\t10\tA\tC")?;
//! writer.add_row("chr1\t850\tG\tT")?;
//! writer.finish()?;
//!
//! let mut reader = gorz::BlockReader::open(&path)?;
//! reader.seek("chr1", 100)?;
//! let row = reader.next_row()?.expect("row at or after chr1:100");
//! assert_eq!(row.pos, 850);
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod compress;
pub mod error;
pub mod index;
pub mod key;
pub mod reader;
pub mod row;
pub mod rowbuf;
pub mod scan;
pub mod util;
pub mod writer;

pub use compress::CompressionType;
pub use error::{Error, Result};
pub use index::{write_for_block_file, IndexKind};
pub use key::{ChromOrder, GenomicKey, KeySchema};
pub use reader::{BlockReader, SeekableLineReader};
pub use row::Row;
pub use writer::{BlockWriter, BlockWriterBuilder};

/// Uncompressed bytes gathered per block, and the window granularity used
/// when reading.
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use std::cmp::Ordering;
    use std::path::Path;

    /// Sorted sample rows over two chromosomes with a low-cardinality
    /// genotype column, so blocks exercise the external lookup tables.
    fn sample_rows(n: usize, seed: u64) -> Vec<String> {
        let mut rng = SmallRng::seed_from_u64(seed);
        let genotypes = ["hom", "het", "unknown", "ref"];
        let bases = ["A", "C", "G", "T"];
        let mut rows = Vec::with_capacity(n);
        for chrom in ["chr1", "chr2"] {
            let mut pos = 0i64;
            for _ in 0..n / 2 {
                pos += rng.random_range(1..2000);
                rows.push(format!(
                    "{chrom}\t{pos}\t{}\t{}\t{}",
                    bases[rng.random_range(0..4)],
                    genotypes[rng.random_range(0..4)],
                    rng.random_range(0..10_000),
                ));
            }
        }
        rows
    }

    fn write_file(path: &Path, rows: &[String], builder: BlockWriterBuilder) -> Result<()> {
        let mut writer = builder.create(path)?;
        writer.set_header("Chrom\tPos\tRef\tGenotype\tDepth")?;
        for row in rows {
            writer.add_row(row)?;
        }
        writer.finish()?;
        Ok(())
    }

    fn read_all(reader: &mut BlockReader<std::io::BufReader<std::fs::File>>) -> Result<Vec<String>> {
        let mut out = Vec::new();
        while let Some(row) = reader.next_row()? {
            out.push(row.line);
        }
        Ok(out)
    }

    /// Rows at or after `(chrom, pos)` in plain lexical key order.
    fn expected_from(rows: &[String], chrom: &str, pos: i64) -> Vec<String> {
        let key = GenomicKey::new(chrom, pos);
        let schema = KeySchema::default();
        rows.iter()
            .filter(|line| {
                let k = schema.parse(line.as_bytes(), 0, line.len()).unwrap();
                schema.compare(&k, &key) != Ordering::Less
            })
            .cloned()
            .collect()
    }

    #[test]
    fn file_round_trips_sequentially() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("roundtrip.gorz");
        let rows = sample_rows(4000, 1);
        write_file(&path, &rows, BlockWriterBuilder::default())?;

        let mut reader = BlockReader::open(&path)?;
        assert_eq!(reader.header(), Some("Chrom\tPos\tRef\tGenotype\tDepth"));
        assert_eq!(
            reader.columns(),
            vec!["Chrom", "Pos", "Ref", "Genotype", "Depth"]
        );
        assert_eq!(read_all(&mut reader)?, rows);
        Ok(())
    }

    #[test]
    fn seek_matches_linear_scan() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("seek.gorz");
        let rows = sample_rows(4000, 2);
        write_file(
            &path,
            &rows,
            BlockWriterBuilder::default().index(IndexKind::Full),
        )?;

        let mut reader = BlockReader::open(&path)?;
        let schema = KeySchema::default();
        let mid_line = &rows[rows.len() / 2];
        let mid = schema.parse(mid_line.as_bytes(), 0, mid_line.len())?;

        // Exact position present in the data.
        reader.seek(&mid.chrom, mid.pos)?;
        assert_eq!(read_all(&mut reader)?, expected_from(&rows, &mid.chrom, mid.pos));

        // Position between two rows.
        reader.seek("chr1", 1_000_001)?;
        assert_eq!(read_all(&mut reader)?, expected_from(&rows, "chr1", 1_000_001));

        // Before the first row: everything.
        reader.seek("chr1", 0)?;
        assert_eq!(read_all(&mut reader)?, rows);

        // Past the last row: nothing.
        reader.seek("chr9", 1)?;
        assert!(reader.next_row()?.is_none());
        Ok(())
    }

    #[test]
    fn seek_works_without_an_index() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("noindex.gorz");
        let rows = sample_rows(4000, 3);
        write_file(&path, &rows, BlockWriterBuilder::default())?;

        let mut reader = BlockReader::open(&path)?;
        reader.seek("chr2", 500_000)?;
        assert_eq!(read_all(&mut reader)?, expected_from(&rows, "chr2", 500_000));

        // Backwards after draining.
        reader.seek("chr1", 500_000)?;
        assert_eq!(read_all(&mut reader)?, expected_from(&rows, "chr1", 500_000));
        Ok(())
    }

    #[test]
    fn many_small_blocks_freeze_tables_midway() -> Result<()> {
        // A tiny chunk forces dozens of blocks, so the header (and the
        // external tables) hit the disk long before the last block.
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("small.gorz");
        let rows = sample_rows(600, 4);
        write_file(&path, &rows, BlockWriterBuilder::default().chunk_size(512))?;

        let mut reader = BlockReader::open(&path)?;
        assert_eq!(read_all(&mut reader)?, rows);
        reader.seek("chr2", 1)?;
        assert_eq!(read_all(&mut reader)?, expected_from(&rows, "chr2", 1));
        Ok(())
    }

    #[test]
    fn raw_mode_round_trips() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("raw.gorz");
        let rows = sample_rows(1000, 5);
        write_file(
            &path,
            &rows,
            BlockWriterBuilder::default()
                .raw_rows()
                .compression(CompressionType::Zlib),
        )?;

        let mut reader = BlockReader::open(&path)?;
        assert_eq!(read_all(&mut reader)?, rows);
        Ok(())
    }

    #[test]
    fn closed_reader_reports_usage_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("closed.gorz");
        write_file(&path, &sample_rows(100, 6), BlockWriterBuilder::default())?;

        let mut reader = BlockReader::open(&path)?;
        reader.close();
        assert!(matches!(
            reader.next_row().unwrap_err(),
            Error::UsageError(error::UsageError::ReaderClosed)
        ));
        assert!(matches!(
            reader.seek("chr1", 1).unwrap_err(),
            Error::UsageError(error::UsageError::ReaderClosed)
        ));
        Ok(())
    }

    #[test]
    fn index_can_be_rebuilt_for_an_existing_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("rebuild.gorz");
        let rows = sample_rows(2000, 7);
        write_file(&path, &rows, BlockWriterBuilder::default())?;

        let index_path = write_for_block_file(&path, IndexKind::ChromLast)?;
        assert!(index_path.exists());
        let entries = index::read_index(std::io::BufReader::new(std::fs::File::open(
            &index_path,
        )?))?;
        // One entry per chromosome, keys and offsets strictly increasing.
        assert_eq!(entries.len(), 2);
        assert!(entries[0].0.chrom == "chr1" && entries[1].0.chrom == "chr2");
        assert!(entries[0].1 < entries[1].1);

        let mut reader = BlockReader::open(&path)?;
        reader.seek("chr2", 100_000)?;
        assert_eq!(read_all(&mut reader)?, expected_from(&rows, "chr2", 100_000));
        Ok(())
    }
}
