//! Cross-block external lookup tables.
//!
//! An external table interns the distinct text values of one column across
//! every block in a file, so repeated values compress to small integer ids in
//! the block payloads. The tables themselves ride along in the file header as
//! a separate compressed section.

use std::collections::{BTreeMap, HashMap};

use byteorder::{BigEndian, ByteOrder};

use crate::error::{CapacityError, FormatError, Result};
use crate::util::{push_terminated, terminated_len};

/// Hard cap on ids per column; ids are persisted as u16.
pub const MAX_TABLE_ENTRIES: usize = 64 * 1024;

/// String-interning table for one column. Ids are assigned in first-seen
/// order and are stable for the lifetime of the table.
#[derive(Debug, Default)]
pub struct ExternalTable {
    ids: HashMap<String, usize>,
    order: Vec<String>,
}

impl ExternalTable {
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    #[must_use]
    pub fn id_of(&self, value: &str) -> Option<usize> {
        self.ids.get(value).copied()
    }

    /// Interns `value`, returning its id. Re-inserting a known value is a
    /// no-op and returns the original id.
    pub fn insert(&mut self, value: &str) -> Result<usize> {
        if let Some(&id) = self.ids.get(value) {
            return Ok(id);
        }
        if self.order.len() >= MAX_TABLE_ENTRIES {
            return Err(CapacityError::ExternalTableOverflow(self.order.len() + 1).into());
        }
        let id = self.order.len();
        self.ids.insert(value.to_string(), id);
        self.order.push(value.to_string());
        Ok(id)
    }

    /// Serialized footprint of the table's strings (text plus terminators).
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.order.iter().map(|k| k.len() + 1).sum()
    }
}

/// The per-column external tables of one output file, keyed by column index.
#[derive(Debug, Default)]
pub struct ExternalTableSet {
    tables: BTreeMap<usize, ExternalTable>,
}

impl ExternalTableSet {
    /// Registers `col` as a candidate for externalization (idempotent).
    pub fn ensure_column(&mut self, col: usize) {
        self.tables.entry(col).or_default();
    }

    #[must_use]
    pub fn get_mut(&mut self, col: usize) -> Option<&mut ExternalTable> {
        self.tables.get_mut(&col)
    }

    /// Bytes the serialized set occupies today: three bytes of bookkeeping
    /// per registered column (index delta and entry count) plus each interned
    /// string with its terminator. Used to budget table growth during
    /// encoding.
    #[must_use]
    pub fn serialized_size(&self) -> usize {
        self.tables
            .values()
            .map(|t| 3 + t.byte_size())
            .sum()
    }

    /// Serializes every non-empty table as
    /// `u16 col_count { u8 col_idx_delta, u16 len, zero-terminated strings }`.
    ///
    /// Column indices are delta-coded against the previously written column;
    /// a gap wider than 255 or a table at the u16 id limit cannot be
    /// represented and fails with a [`CapacityError`].
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; 2];
        let mut last_col = 0usize;
        let mut count = 0usize;
        for (&col, table) in &self.tables {
            if table.is_empty() {
                continue;
            }
            let delta = col - last_col;
            if delta > 255 {
                return Err(CapacityError::ColumnIndexGap(delta).into());
            }
            if table.len() >= MAX_TABLE_ENTRIES {
                return Err(CapacityError::ExternalTableOverflow(table.len()).into());
            }
            last_col = col;
            out.push(delta as u8);
            let at = out.len();
            out.extend_from_slice(&[0, 0]);
            BigEndian::write_u16(&mut out[at..], table.len() as u16);
            for key in &table.order {
                push_terminated(&mut out, key);
            }
            count += 1;
        }
        // Written last: empty tables were skipped above.
        BigEndian::write_u16(&mut out[0..2], count as u16);
        Ok(out)
    }
}

/// Decode-side view of the external tables: column index to id-ordered values.
pub type DecodedTables = HashMap<usize, Vec<Vec<u8>>>;

/// Parses a serialized table section produced by [`ExternalTableSet::to_bytes`].
pub fn decoded_tables_from_bytes(bytes: &[u8]) -> Result<DecodedTables> {
    if bytes.len() < 2 {
        return Err(FormatError::InconsistentBlock(
            "external table section shorter than its header".to_string(),
        )
        .into());
    }
    let col_count = BigEndian::read_u16(&bytes[0..2]) as usize;
    let mut tables = DecodedTables::new();
    let mut pos = 2;
    let mut col = 0usize;
    for _ in 0..col_count {
        if pos + 3 > bytes.len() {
            return Err(FormatError::InconsistentBlock(
                "truncated external table entry".to_string(),
            )
            .into());
        }
        col += bytes[pos] as usize;
        let len = BigEndian::read_u16(&bytes[pos + 1..pos + 3]) as usize;
        pos += 3;
        let mut values = Vec::with_capacity(len);
        for _ in 0..len {
            let text_len = terminated_len(bytes, pos);
            values.push(bytes[pos..pos + text_len].to_vec());
            pos += text_len + 1;
        }
        tables.insert(col, values);
    }
    Ok(tables)
}
