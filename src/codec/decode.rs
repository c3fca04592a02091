//! Block decoding: per-type column readers and row re-interleaving.

use byteorder::{BigEndian, ByteOrder};

use super::lookup::DecodedTables;
use super::type_id;
use crate::error::{FormatError, Result};
use crate::util::{push_i64, terminated_len};

/// Decodes the column-oriented block at `offset` in `src`, appending the
/// reconstructed tab-delimited rows to `out`. Returns the number of bytes
/// appended.
///
/// `tables` must hold the external lookup tables of the file the block came
/// from; a referenced id with no table entry decodes as an empty field
/// rather than failing the block.
pub fn decode(src: &[u8], offset: usize, tables: &DecodedTables, out: &mut Vec<u8>) -> Result<usize> {
    if offset + 2 > src.len() {
        return Err(inconsistent("block shorter than its row count"));
    }
    let row_count = BigEndian::read_u16(&src[offset..]) as usize;
    let mut pos = offset + 2;
    let mut ids = Vec::new();
    loop {
        if pos >= src.len() {
            return Err(inconsistent("unterminated column type list"));
        }
        let b = src[pos];
        pos += 1;
        if b == 0 {
            break;
        }
        ids.push(b);
    }
    log::trace!("decoding block: {} rows, {} columns", row_count, ids.len());
    if ids.is_empty() {
        return Ok(0);
    }

    let mut columns = Vec::with_capacity(ids.len());
    for (idx, &tid) in ids.iter().enumerate() {
        let (decoder, len) = ColumnDecoder::new(src, pos, tid, row_count)?;
        if pos + len > src.len() {
            return Err(inconsistent(format!(
                "column {idx} payload extends past the block"
            )));
        }
        columns.push((decoder, tables.get(&idx)));
        pos += len;
    }

    let start = out.len();
    for _ in 0..row_count {
        for (idx, (decoder, table)) in columns.iter_mut().enumerate() {
            if idx > 0 {
                out.push(b'\t');
            }
            decoder.next(src, table.map(Vec::as_slice), out)?;
        }
        out.push(b'\n');
    }
    Ok(out.len() - start)
}

/// Streaming reader for one column's payload. Construction resolves the
/// payload length so the per-column cursors can be laid out up front; `next`
/// then emits one value per call in row order.
enum ColumnDecoder {
    Empty,
    Increment {
        next: i64,
        step: i64,
    },
    Offset {
        base: i64,
        width: usize,
        at: usize,
    },
    UnsignedDelta {
        last: i64,
        width: usize,
        at: usize,
    },
    SignedDelta {
        last: i64,
        width: usize,
        at: usize,
    },
    Constant {
        begin: usize,
        len: usize,
    },
    Varchar {
        at: usize,
    },
    BlockLookup {
        spans: Vec<(usize, usize)>,
        at: usize,
        last: i64,
        delta: bool,
    },
    /// One absolute byte id per row (decode-only legacy form)
    ExtAbsolute {
        at: usize,
    },
    ExtByteDelta {
        at: usize,
        last: i64,
    },
    ExtShortDelta {
        at: usize,
        last: i64,
    },
}

impl ColumnDecoder {
    /// Builds the decoder for a column of type `tid` starting at `pos`,
    /// returning it with the column's total payload length.
    fn new(src: &[u8], pos: usize, tid: u8, row_count: usize) -> Result<(Self, usize)> {
        if pos > src.len() {
            return Err(inconsistent("column payload starts past the block"));
        }
        let d = match tid {
            type_id::INT_OFFSET => (
                ColumnDecoder::Offset {
                    base: read_i64(src, pos)?,
                    width: 4,
                    at: pos + 8,
                },
                8 + 4 * row_count,
            ),
            type_id::SHORT_OFFSET => (
                ColumnDecoder::Offset {
                    base: read_i64(src, pos)?,
                    width: 2,
                    at: pos + 8,
                },
                8 + 2 * row_count,
            ),
            type_id::BYTE_OFFSET => (
                ColumnDecoder::Offset {
                    base: read_i64(src, pos)?,
                    width: 1,
                    at: pos + 8,
                },
                8 + row_count,
            ),
            type_id::INCREMENT => {
                let base = read_i64(src, pos)?;
                if pos + 12 > src.len() {
                    return Err(inconsistent("truncated increment column"));
                }
                let step = i64::from(BigEndian::read_i32(&src[pos + 8..]));
                (ColumnDecoder::Increment { next: base, step }, 12)
            }
            type_id::UBYTE_DELTA => (
                ColumnDecoder::UnsignedDelta {
                    last: read_i64(src, pos)?,
                    width: 1,
                    at: pos + 8,
                },
                8 + row_count,
            ),
            type_id::USHORT_DELTA => (
                ColumnDecoder::UnsignedDelta {
                    last: read_i64(src, pos)?,
                    width: 2,
                    at: pos + 8,
                },
                8 + 2 * row_count,
            ),
            type_id::UINT_DELTA => (
                ColumnDecoder::UnsignedDelta {
                    last: read_i64(src, pos)?,
                    width: 4,
                    at: pos + 8,
                },
                8 + 4 * row_count,
            ),
            type_id::SBYTE_DELTA => (
                ColumnDecoder::SignedDelta {
                    last: read_i64(src, pos)?,
                    width: 1,
                    at: pos + 8,
                },
                8 + row_count,
            ),
            type_id::SSHORT_DELTA => (
                ColumnDecoder::SignedDelta {
                    last: read_i64(src, pos)?,
                    width: 2,
                    at: pos + 8,
                },
                8 + 2 * row_count,
            ),
            type_id::EMPTY => (ColumnDecoder::Empty, 0),
            type_id::VARCHAR => {
                if pos + 4 > src.len() {
                    return Err(inconsistent("truncated text column length"));
                }
                let total = BigEndian::read_u32(&src[pos..]) as usize;
                (ColumnDecoder::Varchar { at: pos + 4 }, 4 + total)
            }
            type_id::CONSTANT => {
                let len = terminated_len(src, pos);
                (ColumnDecoder::Constant { begin: pos, len }, len + 1)
            }
            type_id::LOOKUP | type_id::LOOKUP_DELTA => {
                let count = *src
                    .get(pos)
                    .ok_or_else(|| inconsistent("truncated lookup column"))?
                    as usize;
                let mut at = pos + 1;
                let mut spans = Vec::with_capacity(count);
                for _ in 0..count {
                    if at >= src.len() {
                        return Err(inconsistent("truncated lookup value table"));
                    }
                    let len = terminated_len(src, at);
                    spans.push((at, len));
                    at += len + 1;
                }
                let table_len = at - pos;
                (
                    ColumnDecoder::BlockLookup {
                        spans,
                        at,
                        last: 0,
                        delta: tid == type_id::LOOKUP_DELTA,
                    },
                    table_len + row_count,
                )
            }
            type_id::EXT_LOOKUP => (ColumnDecoder::ExtAbsolute { at: pos }, row_count),
            type_id::EXT_LOOKUP_BYTE => (
                ColumnDecoder::ExtByteDelta { at: pos, last: 0 },
                row_count,
            ),
            type_id::EXT_LOOKUP_SHORT => (
                ColumnDecoder::ExtShortDelta { at: pos, last: 0 },
                2 * row_count,
            ),
            other => return Err(FormatError::UnknownTypeId(other).into()),
        };
        Ok(d)
    }

    fn next(&mut self, src: &[u8], table: Option<&[Vec<u8>]>, out: &mut Vec<u8>) -> Result<()> {
        match self {
            ColumnDecoder::Empty => {}
            ColumnDecoder::Increment { next, step } => {
                *next += *step;
                push_i64(out, *next);
            }
            ColumnDecoder::Offset { base, width, at } => {
                let v = BigEndian::read_uint(&src[*at..*at + *width], *width) as i64;
                push_i64(out, *base + v);
                *at += *width;
            }
            ColumnDecoder::UnsignedDelta { last, width, at } => {
                *last += BigEndian::read_uint(&src[*at..*at + *width], *width) as i64;
                push_i64(out, *last);
                *at += *width;
            }
            ColumnDecoder::SignedDelta { last, width, at } => {
                *last += BigEndian::read_int(&src[*at..*at + *width], *width);
                push_i64(out, *last);
                *at += *width;
            }
            ColumnDecoder::Constant { begin, len } => {
                out.extend_from_slice(&src[*begin..*begin + *len]);
            }
            ColumnDecoder::Varchar { at } => {
                if *at < src.len() {
                    let len = terminated_len(src, *at);
                    out.extend_from_slice(&src[*at..*at + len]);
                    *at += len + 1;
                }
            }
            ColumnDecoder::BlockLookup {
                spans,
                at,
                last,
                delta,
            } => {
                let id = if *delta {
                    // First reference is absolute, the rest are signed diffs.
                    *last += i64::from(src[*at] as i8);
                    usize::try_from(*last).ok()
                } else {
                    Some(src[*at] as usize)
                };
                *at += 1;
                let (begin, len) = *id
                    .and_then(|id| spans.get(id))
                    .ok_or_else(|| inconsistent("lookup id outside the value table"))?;
                out.extend_from_slice(&src[begin..begin + len]);
            }
            ColumnDecoder::ExtAbsolute { at } => {
                let id = src[*at] as usize;
                *at += 1;
                emit_external(table, Some(id), out);
            }
            ColumnDecoder::ExtByteDelta { at, last } => {
                *last += i64::from(src[*at] as i8);
                *at += 1;
                emit_external(table, usize::try_from(*last).ok(), out);
            }
            ColumnDecoder::ExtShortDelta { at, last } => {
                *last += i64::from(BigEndian::read_i16(&src[*at..*at + 2]));
                *at += 2;
                emit_external(table, usize::try_from(*last).ok(), out);
            }
        }
        Ok(())
    }
}

/// An id with no table entry decodes as an empty field. This keeps a file
/// readable when its lookup tables were written by a newer encoder than the
/// blocks in hand.
fn emit_external(table: Option<&[Vec<u8>]>, id: Option<usize>, out: &mut Vec<u8>) {
    if let Some(value) = id.and_then(|id| table.and_then(|t| t.get(id))) {
        out.extend_from_slice(value);
    }
}

fn read_i64(src: &[u8], pos: usize) -> Result<i64> {
    if pos + 8 > src.len() {
        return Err(inconsistent("truncated column base value"));
    }
    Ok(BigEndian::read_i64(&src[pos..]))
}

fn inconsistent(msg: impl Into<String>) -> crate::Error {
    FormatError::InconsistentBlock(msg.into()).into()
}
