//! A single decoded row with its parsed key.

use std::cmp::Ordering;
use std::fmt;

use crate::error::Result;
use crate::key::{ChromOrder, GenomicKey, KeySchema};

/// One tab-delimited row with its key columns parsed out. `line` holds the
/// complete row text, key columns included, without a terminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Row {
    pub chrom: String,
    pub pos: i64,
    pub line: String,
}

impl Row {
    /// Parses one row from its text under the given key schema.
    pub fn parse(line: &[u8], schema: &KeySchema) -> Result<Self> {
        let key = schema.parse(line, 0, line.len())?;
        Ok(Self {
            chrom: key.chrom,
            pos: key.pos,
            line: String::from_utf8_lossy(line).into_owned(),
        })
    }

    #[must_use]
    pub fn key(&self) -> GenomicKey {
        GenomicKey::new(self.chrom.clone(), self.pos)
    }

    /// Orders this row against a key without materializing one.
    #[must_use]
    pub fn compare_to(&self, key: &GenomicKey, order: ChromOrder) -> Ordering {
        order.compare_parts(&self.chrom, self.pos, &key.chrom, key.pos)
    }

    /// Value of the zero-based column `idx`, if the row has one.
    #[must_use]
    pub fn column(&self, idx: usize) -> Option<&str> {
        self.line.split('\t').nth(idx)
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_exposes_key_and_columns() {
        let row = Row::parse(b"chr4\t5500\tA\tT\t0.93", &KeySchema::default()).unwrap();
        assert_eq!(row.chrom, "chr4");
        assert_eq!(row.pos, 5500);
        assert_eq!(row.key(), GenomicKey::new("chr4", 5500));
        assert_eq!(row.column(3), Some("T"));
        assert_eq!(row.column(9), None);
        assert_eq!(row.to_string(), "chr4\t5500\tA\tT\t0.93");
    }

    #[test]
    fn rows_order_by_chrom_then_pos() {
        let schema = KeySchema::default();
        let a = Row::parse(b"chr1\t5\tx", &schema).unwrap();
        let b = Row::parse(b"chr1\t9\tx", &schema).unwrap();
        let c = Row::parse(b"chr2\t1\tx", &schema).unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn compare_to_respects_genome_order() {
        let row = Row::parse(b"chrM\t100\tx", &KeySchema::default()).unwrap();
        let key = GenomicKey::new("chr1", 1);
        assert_eq!(row.compare_to(&key, ChromOrder::Lexical), Ordering::Greater);
        assert_eq!(
            row.compare_to(&key, ChromOrder::GenomeOrdinal),
            Ordering::Less
        );
    }
}
