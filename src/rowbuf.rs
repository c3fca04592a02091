//! Buffer of decoded rows between block expansion and iteration.

use std::cmp::Ordering;

use crate::error::Result;
use crate::key::{GenomicKey, KeySchema};
use crate::row::Row;

/// Rows buffered before capacity adapts to observed line sizes.
const INITIAL_CAPACITY: usize = 1000;
/// Rows sampled for the running average line size.
const SAMPLE_ROWS: usize = 100;
/// Default ceiling on buffered bytes.
const DEFAULT_BYTE_BUDGET: u64 = 1 << 30;

/// Sorted rows from one or more consecutive blocks, with a read cursor.
///
/// Capacity starts small and doubles on demand, bounded by a byte budget
/// estimated from the average line size of the first rows seen. The buffer
/// never re-sorts; callers feed it rows in file order.
#[derive(Debug)]
pub struct RowBuffer {
    rows: Vec<Row>,
    at: usize,
    capacity: usize,
    byte_budget: u64,
    sampled_bytes: u64,
    sampled_rows: usize,
    schema: KeySchema,
}

impl RowBuffer {
    #[must_use]
    pub fn new(schema: KeySchema) -> Self {
        Self::with_byte_budget(schema, DEFAULT_BYTE_BUDGET)
    }

    #[must_use]
    pub fn with_byte_budget(schema: KeySchema, byte_budget: u64) -> Self {
        Self {
            rows: Vec::new(),
            at: 0,
            capacity: INITIAL_CAPACITY,
            byte_budget,
            sampled_bytes: 0,
            sampled_rows: 0,
            schema,
        }
    }

    /// Whether a read cursor advance would yield a row.
    #[must_use]
    pub fn available(&self) -> bool {
        self.at < self.rows.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Next row in cursor order, or `None` when drained.
    pub fn next(&mut self) -> Option<&Row> {
        let row = self.rows.get(self.at);
        if row.is_some() {
            self.at += 1;
        }
        row
    }

    #[must_use]
    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    #[must_use]
    pub fn last(&self) -> Option<&Row> {
        self.rows.last()
    }

    /// Appends a row, feeding the line-size sample while it is still open.
    pub fn add(&mut self, row: Row) {
        if self.sampled_rows < SAMPLE_ROWS {
            self.sampled_bytes += row.line.len() as u64;
            self.sampled_rows += 1;
        }
        self.rows.push(row);
    }

    /// Replaces the contents with the rows parsed from `text` (decoded block
    /// output, LF-terminated lines) and rewinds the cursor.
    pub fn update(&mut self, text: &[u8]) -> Result<()> {
        self.clear();
        self.append(text)
    }

    /// Parses `text` and appends its rows, keeping existing rows and cursor.
    pub fn append(&mut self, text: &[u8]) -> Result<()> {
        for line in text.split(|&b| b == b'\n') {
            if line.is_empty() {
                continue;
            }
            let row = Row::parse(line, &self.schema)?;
            self.add(row);
        }
        Ok(())
    }

    /// Moves the cursor to the first row with key `>= key`; rows before the
    /// cursor stay in the buffer so a later rewinding seek still finds them.
    pub fn seek(&mut self, key: &GenomicKey) {
        let order = self.schema.order;
        self.at = self
            .rows
            .partition_point(|row| row.compare_to(key, order) == Ordering::Less);
    }

    /// Whether the buffer should stop taking rows: the row-count capacity or
    /// the byte ceiling, whichever binds first.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.rows.len() >= self.capacity || self.estimated_bytes() >= self.byte_budget
    }

    /// Doubles capacity, up to the row count the byte budget admits.
    pub fn enlarge(&mut self) {
        let limit = self.budget_rows();
        if self.capacity < limit {
            self.capacity = (self.capacity * 2).min(limit);
        }
    }

    /// Halves capacity, flooring at one row.
    pub fn reduce(&mut self) {
        self.capacity = (self.capacity / 2).max(1);
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.at = 0;
    }

    /// Bytes the buffered rows are estimated to hold, from the sampled
    /// average line size.
    fn estimated_bytes(&self) -> u64 {
        if self.sampled_rows == 0 {
            return 0;
        }
        let avg = (self.sampled_bytes / self.sampled_rows as u64).max(1);
        avg * self.rows.len() as u64
    }

    /// Row count the byte budget allows under the sampled average line size.
    fn budget_rows(&self) -> usize {
        if self.sampled_rows == 0 {
            return usize::MAX;
        }
        let avg = (self.sampled_bytes / self.sampled_rows as u64).max(1);
        usize::try_from(self.byte_budget / avg).unwrap_or(usize::MAX).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_with(text: &[u8]) -> RowBuffer {
        let mut buf = RowBuffer::new(KeySchema::default());
        buf.update(text).unwrap();
        buf
    }

    #[test]
    fn update_parses_and_iterates_in_order() {
        let mut buf = buffer_with(b"chr1\t10\ta\nchr1\t20\tb\nchr2\t5\tc\n");
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.next().unwrap().pos, 10);
        assert_eq!(buf.next().unwrap().pos, 20);
        assert!(buf.available());
        assert_eq!(buf.next().unwrap().chrom, "chr2");
        assert!(buf.next().is_none());
        assert!(!buf.available());
    }

    #[test]
    fn seek_moves_cursor_both_directions() {
        let mut buf = buffer_with(b"chr1\t10\ta\nchr1\t20\tb\nchr1\t30\tc\n");
        buf.seek(&GenomicKey::new("chr1", 25));
        assert_eq!(buf.next().unwrap().pos, 30);
        // Rewind: earlier rows are still there.
        buf.seek(&GenomicKey::new("chr1", 5));
        assert_eq!(buf.next().unwrap().pos, 10);
        // Past the end: drained.
        buf.seek(&GenomicKey::new("chr9", 1));
        assert!(!buf.available());
    }

    #[test]
    fn capacity_doubles_until_byte_budget_binds() {
        // Budget of 60 bytes over 11-byte lines admits five rows.
        let mut buf = RowBuffer::with_byte_budget(KeySchema::default(), 60);
        buf.update(b"chr1\t1\tabcd\nchr1\t2\tabcd\n").unwrap();
        assert_eq!(buf.budget_rows(), 5);
        while buf.capacity > 1 {
            buf.reduce();
        }
        for _ in 0..10 {
            buf.enlarge();
        }
        assert_eq!(buf.capacity, 5);
        // Without samples the budget does not bind.
        let unsampled = RowBuffer::with_byte_budget(KeySchema::default(), 60);
        assert_eq!(unsampled.budget_rows(), usize::MAX);
    }

    #[test]
    fn byte_ceiling_binds_is_full_before_row_capacity() {
        // ~12-byte lines against a 100-byte budget: full long before the
        // 1000-row capacity.
        let mut buf = RowBuffer::with_byte_budget(KeySchema::default(), 100);
        let mut text = Vec::new();
        for i in 0..20 {
            text.extend_from_slice(format!("chr1\t{}\tabcd\n", i + 1).as_bytes());
        }
        buf.update(&text).unwrap();
        assert!(buf.len() < INITIAL_CAPACITY);
        assert!(buf.is_full());

        // Two rows stay under the budget.
        buf.update(b"chr1\t1\tabcd\nchr1\t2\tabcd\n").unwrap();
        assert!(!buf.is_full());
    }

    #[test]
    fn reduce_floors_at_one() {
        let mut buf = RowBuffer::new(KeySchema::default());
        for _ in 0..32 {
            buf.reduce();
        }
        assert_eq!(buf.capacity, 1);
        buf.enlarge();
        assert_eq!(buf.capacity, 2);
    }
}
