//! Columnar block codec.
//!
//! A block holds up to 65535 tab-delimited rows. [`encode`] transposes the
//! rows into columns, picks the cheapest representation for each column and
//! serializes the block as
//!
//! ```text
//! u16 row_count | type id per column, zero terminated | column payloads
//! ```
//!
//! All multi-byte integers are big-endian. [`decode`] reverses the process,
//! re-interleaving the columns into rows.
//!
//! Numeric columns use one of three families: a constant-increment stub, a
//! min-offset table, or row-to-row deltas in byte/short/int widths. Text
//! columns with few distinct values become lookup columns, either carrying
//! their value table in the block or referencing a file-wide
//! [`lookup::ExternalTable`]. Everything else falls back to plain
//! zero-terminated text.

mod decode;
pub mod lookup;

use std::collections::HashMap;

use byteorder::{BigEndian, ByteOrder};

use crate::error::Result;
use crate::util::push_terminated;

pub use decode::decode;
pub use lookup::{decoded_tables_from_bytes, DecodedTables, ExternalTableSet};

/// Rows per block are stored as a u16.
pub const MAX_BLOCK_ROWS: usize = u16::MAX as usize;

/// Columns with more distinct values than this are never lookup-encoded.
const MAX_DISTINCT: usize = 1000;

/// First column eligible for an external lookup table; the two key columns
/// are numeric and never benefit.
const FIRST_EXTERNAL_COL: usize = 2;

/// Largest value an int-width offset or unsigned delta can represent.
const MAX_UNSIGNED_INT: i64 = (1 << 32) - 1;

/// Wire ids of the column representations.
pub(crate) mod type_id {
    pub const INT_OFFSET: u8 = 3;
    pub const SHORT_OFFSET: u8 = 4;
    pub const BYTE_OFFSET: u8 = 5;
    pub const INCREMENT: u8 = 7;
    pub const UBYTE_DELTA: u8 = 9;
    pub const USHORT_DELTA: u8 = 10;
    pub const UINT_DELTA: u8 = 11;
    pub const SBYTE_DELTA: u8 = 12;
    pub const SSHORT_DELTA: u8 = 13;
    pub const EMPTY: u8 = 19;
    pub const VARCHAR: u8 = 21;
    pub const LOOKUP: u8 = 22;
    pub const CONSTANT: u8 = 23;
    pub const EXT_LOOKUP: u8 = 24;
    pub const EXT_LOOKUP_BYTE: u8 = 25;
    pub const LOOKUP_DELTA: u8 = 28;
    pub const EXT_LOOKUP_SHORT: u8 = 29;
}

/// Encodes the row text in `src` (tab-delimited, newline-terminated rows)
/// as one column-oriented block appended to `out`.
///
/// `tables` carries the file's external lookup tables. While `allow_growth`
/// is set, text columns may intern new values into their table as long as
/// the serialized tables stay under `table_budget` bytes; afterwards the
/// tables are frozen and only columns whose values are already fully
/// interned keep their external encoding.
pub fn encode(
    src: &[u8],
    tables: &mut ExternalTableSet,
    allow_growth: bool,
    table_budget: usize,
    out: &mut Vec<u8>,
) -> Result<()> {
    let (row_count, matrix) = parse_matrix(src);
    debug_assert!(row_count <= MAX_BLOCK_ROWS);
    let at = out.len();
    out.extend_from_slice(&[0, 0]);
    BigEndian::write_u16(&mut out[at..], row_count as u16);

    let mut plans = Vec::with_capacity(matrix.len());
    for (idx, col) in matrix.iter().enumerate() {
        let free = table_budget.saturating_sub(tables.serialized_size());
        let plan = match classify(col) {
            ColumnClass::Empty => ColumnEncoding::Empty,
            ColumnClass::Numeric(values) => choose_numeric(values),
            ColumnClass::Varchar => ColumnEncoding::Varchar,
            ColumnClass::Text => choose_text(col, idx, tables, allow_growth, free)?,
        };
        out.push(plan.type_id());
        plans.push(plan);
    }
    out.push(0);
    for (plan, col) in plans.iter().zip(&matrix) {
        plan.write_payload(col, out);
    }
    log::trace!("encoded block: {} rows, {} columns", row_count, matrix.len());
    Ok(())
}

/// Transposes row text into per-column value vectors. Empty fields become
/// `None`; short rows are padded with `None` on the right.
fn parse_matrix(src: &[u8]) -> (usize, Vec<Vec<Option<String>>>) {
    let mut cols: Vec<Vec<Option<String>>> = Vec::new();
    let mut rows = 0usize;
    let mut col = 0usize;
    let mut start = 0usize;
    let mut i = 0usize;

    let mut push_field = |cols: &mut Vec<Vec<Option<String>>>, col: usize, rows, field: &[u8]| {
        if col == cols.len() {
            cols.push(vec![None; rows]);
        }
        let value = if field.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(field).into_owned())
        };
        cols[col].push(value);
    };

    while i < src.len() {
        let b = src[i];
        if b == b'\t' || b == b'\n' {
            let mut end = i;
            if b == b'\n' && end > start && src[end - 1] == b'\r' {
                end -= 1;
            }
            push_field(&mut cols, col, rows, &src[start..end]);
            col += 1;
            if b == b'\n' {
                for c in cols.iter_mut().skip(col) {
                    c.push(None);
                }
                rows += 1;
                col = 0;
            }
            start = i + 1;
        }
        i += 1;
    }
    if start < src.len() || col > 0 {
        push_field(&mut cols, col, rows, &src[start..]);
        col += 1;
        for c in cols.iter_mut().skip(col) {
            c.push(None);
        }
        rows += 1;
    }
    (rows, cols)
}

enum ColumnClass {
    /// Every value missing
    Empty,
    /// Integer throughout, no missing values; carries the parsed values
    Numeric(Vec<i64>),
    /// Numeric but floating point or with missing values; stored as text
    Varchar,
    Text,
}

fn classify(col: &[Option<String>]) -> ColumnClass {
    let mut all_null = true;
    let mut has_null = false;
    let mut numeric = true;
    let mut floating = false;
    let mut values = Vec::with_capacity(col.len());
    for v in col {
        match v {
            None => has_null = true,
            Some(s) => {
                all_null = false;
                if numeric && !floating {
                    if let Ok(n) = s.parse::<i64>() {
                        values.push(n);
                        continue;
                    }
                }
                if numeric {
                    if s.parse::<f64>().is_ok() {
                        floating = true;
                    } else {
                        numeric = false;
                    }
                }
            }
        }
    }
    if all_null {
        ColumnClass::Empty
    } else if numeric && !floating && !has_null {
        ColumnClass::Numeric(values)
    } else if numeric {
        ColumnClass::Varchar
    } else {
        ColumnClass::Text
    }
}

/// One column's chosen representation, ready to serialize.
enum ColumnEncoding {
    Empty,
    /// Arithmetic progression: base and step only
    Increment { base: i64, step: i32 },
    /// Minimum plus a fixed-width unsigned offset per row
    Offset { min: i64, width: usize, values: Vec<i64> },
    /// First value plus fixed-width unsigned row-to-row deltas
    UnsignedDelta { width: usize, values: Vec<i64> },
    /// First value plus fixed-width signed row-to-row deltas
    SignedDelta { width: usize, values: Vec<i64> },
    /// Single distinct value for the whole column
    Constant(String),
    /// Value table carried in the block, plus one id per row
    BlockLookup {
        keys: Vec<String>,
        refs: Vec<u8>,
        delta: bool,
    },
    /// Ids into the column's external table, delta-coded by row
    ExtLookup { refs: Vec<usize>, wide: bool },
    /// Zero-terminated text per row
    Varchar,
}

impl ColumnEncoding {
    fn type_id(&self) -> u8 {
        match self {
            ColumnEncoding::Empty => type_id::EMPTY,
            ColumnEncoding::Increment { .. } => type_id::INCREMENT,
            ColumnEncoding::Offset { width: 1, .. } => type_id::BYTE_OFFSET,
            ColumnEncoding::Offset { width: 2, .. } => type_id::SHORT_OFFSET,
            ColumnEncoding::Offset { .. } => type_id::INT_OFFSET,
            ColumnEncoding::UnsignedDelta { width: 1, .. } => type_id::UBYTE_DELTA,
            ColumnEncoding::UnsignedDelta { width: 2, .. } => type_id::USHORT_DELTA,
            ColumnEncoding::UnsignedDelta { .. } => type_id::UINT_DELTA,
            ColumnEncoding::SignedDelta { width: 1, .. } => type_id::SBYTE_DELTA,
            ColumnEncoding::SignedDelta { .. } => type_id::SSHORT_DELTA,
            ColumnEncoding::Constant(_) => type_id::CONSTANT,
            ColumnEncoding::BlockLookup { delta: true, .. } => type_id::LOOKUP_DELTA,
            ColumnEncoding::BlockLookup { .. } => type_id::LOOKUP,
            ColumnEncoding::ExtLookup { wide: false, .. } => type_id::EXT_LOOKUP_BYTE,
            ColumnEncoding::ExtLookup { .. } => type_id::EXT_LOOKUP_SHORT,
            ColumnEncoding::Varchar => type_id::VARCHAR,
        }
    }

    fn write_payload(&self, col: &[Option<String>], out: &mut Vec<u8>) {
        match self {
            ColumnEncoding::Empty => {}
            ColumnEncoding::Increment { base, step } => {
                push_int(out, *base, 8);
                push_int(out, i64::from(*step), 4);
            }
            ColumnEncoding::Offset { min, width, values } => {
                push_int(out, *min, 8);
                for &v in values {
                    push_uint(out, (v - min) as u64, *width);
                }
            }
            ColumnEncoding::UnsignedDelta { width, values } => {
                push_int(out, values[0], 8);
                let mut last = values[0];
                // The first delta entry is always zero.
                for &v in values {
                    push_uint(out, (v - last) as u64, *width);
                    last = v;
                }
            }
            ColumnEncoding::SignedDelta { width, values } => {
                push_int(out, values[0], 8);
                let mut last = values[0];
                for &v in values {
                    push_int(out, v - last, *width);
                    last = v;
                }
            }
            ColumnEncoding::Constant(value) => {
                push_terminated(out, value);
            }
            ColumnEncoding::BlockLookup { keys, refs, delta } => {
                out.push(keys.len() as u8);
                for key in keys {
                    push_terminated(out, key);
                }
                if *delta {
                    let mut last = 0u8;
                    for &r in refs {
                        out.push(r.wrapping_sub(last));
                        last = r;
                    }
                } else {
                    out.extend_from_slice(refs);
                }
            }
            ColumnEncoding::ExtLookup { refs, wide } => {
                let mut last = 0i64;
                for &r in refs {
                    let diff = r as i64 - last;
                    if *wide {
                        push_int(out, diff, 2);
                    } else {
                        out.push(diff as u8);
                    }
                    last = r as i64;
                }
            }
            ColumnEncoding::Varchar => {
                let at = out.len();
                out.extend_from_slice(&[0; 4]);
                for v in col {
                    push_terminated(out, v.as_deref().unwrap_or(""));
                }
                let total = (out.len() - at - 4) as u32;
                BigEndian::write_u32(&mut out[at..], total);
            }
        }
    }
}

/// Picks the numeric representation: a pure arithmetic progression wins
/// outright, then delta and offset families alternate from byte width up,
/// preferring deltas at equal width. Columns too wide for any of them are
/// stored as text.
fn choose_numeric(values: Vec<i64>) -> ColumnEncoding {
    if values.len() > 2 {
        let step = values[1].wrapping_sub(values[0]);
        if values.windows(2).all(|w| w[1].wrapping_sub(w[0]) == step) {
            if let Ok(step) = i32::try_from(step) {
                return ColumnEncoding::Increment {
                    base: values[0].wrapping_sub(i64::from(step)),
                    step,
                };
            }
        }
    }

    let mut min = values[0];
    let mut max = values[0];
    let mut max_neg = 0i64;
    let mut max_pos = 0i64;
    let mut small_diffs = true;
    for w in values.windows(2) {
        let diff = i128::from(w[1]) - i128::from(w[0]);
        if diff < i128::from(i32::MIN) || diff > i128::from(i32::MAX) {
            small_diffs = false;
        } else {
            max_neg = max_neg.min(diff as i64);
            max_pos = max_pos.max(diff as i64);
        }
        min = min.min(w[1]);
        max = max.max(w[1]);
    }
    let range = i128::from(max) - i128::from(min);

    if small_diffs {
        if max_neg >= 0 && max_pos < 256 {
            return ColumnEncoding::UnsignedDelta { width: 1, values };
        }
        if max_neg >= -128 && max_pos < 128 {
            return ColumnEncoding::SignedDelta { width: 1, values };
        }
    }
    if range < 256 {
        return ColumnEncoding::Offset { min, width: 1, values };
    }
    if small_diffs {
        if max_neg >= 0 && max_pos < 65536 {
            return ColumnEncoding::UnsignedDelta { width: 2, values };
        }
        if max_neg >= -32768 && max_pos < 32768 {
            return ColumnEncoding::SignedDelta { width: 2, values };
        }
    }
    if range < 65536 {
        return ColumnEncoding::Offset { min, width: 2, values };
    }
    if small_diffs && max_neg >= 0 && max_pos <= MAX_UNSIGNED_INT {
        return ColumnEncoding::UnsignedDelta { width: 4, values };
    }
    if range <= i128::from(MAX_UNSIGNED_INT) {
        return ColumnEncoding::Offset { min, width: 4, values };
    }
    ColumnEncoding::Varchar
}

/// Picks the text representation. Lookup encodings only pay off when the
/// raw data outweighs the distinct-value table; the external table is
/// preferred when this column has one and its new values fit the remaining
/// budget, otherwise the table travels inside the block.
fn choose_text(
    col: &[Option<String>],
    col_idx: usize,
    tables: &mut ExternalTableSet,
    allow_growth: bool,
    free_space: usize,
) -> Result<ColumnEncoding> {
    let mut ids: HashMap<&str, usize> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();
    let mut table_size = 0usize;
    let mut data_size = 0usize;
    for value in col {
        let value = value.as_deref().unwrap_or("");
        if !ids.contains_key(value) {
            if order.len() == MAX_DISTINCT {
                break;
            }
            ids.insert(value, order.len());
            order.push(value);
            table_size += value.len() + 1;
        }
        data_size += value.len();
    }

    if order.len() < MAX_DISTINCT {
        if order.len() == 1 {
            return Ok(ColumnEncoding::Constant(order[0].to_string()));
        }
        if data_size > table_size {
            if col_idx >= FIRST_EXTERNAL_COL && allow_growth {
                tables.ensure_column(col_idx);
            }
            let table = if col_idx >= FIRST_EXTERNAL_COL {
                tables.get_mut(col_idx)
            } else {
                None
            };
            if let Some(table) = table {
                let growth: usize = order
                    .iter()
                    .filter(|k| table.id_of(k).is_none())
                    .map(|k| k.len() + 1)
                    .sum();
                if growth == 0 || (allow_growth && growth < free_space) {
                    let mut mapped = Vec::with_capacity(order.len());
                    for key in &order {
                        mapped.push(table.insert(key)?);
                    }
                    let wide = table.len() >= 128;
                    let refs = col
                        .iter()
                        .map(|v| mapped[ids[v.as_deref().unwrap_or("")]])
                        .collect();
                    return Ok(ColumnEncoding::ExtLookup { refs, wide });
                }
            }
            if order.len() < 256 {
                let delta = order.len() < 128;
                let refs = col
                    .iter()
                    .map(|v| ids[v.as_deref().unwrap_or("")] as u8)
                    .collect();
                let keys = order.iter().map(|k| (*k).to_string()).collect();
                return Ok(ColumnEncoding::BlockLookup { keys, refs, delta });
            }
        }
    }
    Ok(ColumnEncoding::Varchar)
}

fn push_uint(out: &mut Vec<u8>, value: u64, width: usize) {
    let at = out.len();
    out.resize(at + width, 0);
    BigEndian::write_uint(&mut out[at..], value, width);
}

fn push_int(out: &mut Vec<u8>, value: i64, width: usize) {
    let at = out.len();
    out.resize(at + width, 0);
    BigEndian::write_int(&mut out[at..], value, width);
}
