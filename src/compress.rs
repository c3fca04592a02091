//! Block payload compression and the reader-side unzipper.
//!
//! A block line carries `flag byte + base-128 packed compressed payload`.
//! Bit 0 of the flag marks a column-encoded payload, bit 1 selects zstd over
//! zlib. The packing keeps every payload byte clear of the tab/newline
//! framing, so a block file stays line-structured end to end.

use std::cell::OnceCell;
use std::io::{Read, Write};

use crate::codec::{self, decoded_tables_from_bytes, DecodedTables};
use crate::error::{FormatError, Result};
use crate::util::unpack_base128;

/// Flag bit: payload is column-encoded rather than raw row text.
pub const COLUMN_FLAG: u8 = 0x01;
/// Flag bit: payload is zstd-compressed; clear means zlib.
pub const ZSTD_FLAG: u8 = 0x02;

/// Compression level used for zstd payloads.
const ZSTD_LEVEL: i32 = 3;

/// The two supported payload compressors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompressionType {
    #[default]
    Zlib,
    Zstd,
}

impl CompressionType {
    #[must_use]
    pub fn from_flag(flag: u8) -> Self {
        if flag & ZSTD_FLAG != 0 {
            CompressionType::Zstd
        } else {
            CompressionType::Zlib
        }
    }

    #[must_use]
    pub fn flag_bits(self) -> u8 {
        match self {
            CompressionType::Zlib => 0,
            CompressionType::Zstd => ZSTD_FLAG,
        }
    }
}

pub fn compress(kind: CompressionType, src: &[u8]) -> Result<Vec<u8>> {
    match kind {
        CompressionType::Zlib => {
            let mut enc =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(src)?;
            Ok(enc.finish()?)
        }
        CompressionType::Zstd => Ok(zstd::stream::encode_all(src, ZSTD_LEVEL)?),
    }
}

pub fn decompress(kind: CompressionType, src: &[u8]) -> Result<Vec<u8>> {
    match kind {
        CompressionType::Zlib => {
            let mut out = Vec::new();
            flate2::read::ZlibDecoder::new(src).read_to_end(&mut out)?;
            Ok(out)
        }
        CompressionType::Zstd => Ok(zstd::stream::decode_all(src)?),
    }
}

/// Reader-side payload expander for one block file.
///
/// Holds the compressed external-table section from the file header; the
/// tables are parsed on the first column-encoded block and reused for every
/// block after that. Files without column encoding never pay for the parse.
#[derive(Debug, Default)]
pub struct BlockUnzipper {
    packed_tables: Option<Vec<u8>>,
    tables: OnceCell<DecodedTables>,
}

impl BlockUnzipper {
    /// `packed_tables` is the base-128 packed, compressed external-table
    /// section found after the NUL in the header line, if any.
    #[must_use]
    pub fn new(packed_tables: Option<Vec<u8>>) -> Self {
        Self {
            packed_tables,
            tables: OnceCell::new(),
        }
    }

    /// Expands one block payload (flag byte included) into row text appended
    /// to `out`, returning the number of bytes appended.
    pub fn unzip(&self, payload: &[u8], out: &mut Vec<u8>) -> Result<usize> {
        let Some((&flag, packed)) = payload.split_first() else {
            return Err(FormatError::InconsistentBlock("empty block payload".to_string()).into());
        };
        let kind = CompressionType::from_flag(flag);
        let raw = decompress(kind, &unpack_base128(packed))?;
        if flag & COLUMN_FLAG != 0 {
            codec::decode(&raw, 0, self.tables(kind)?, out)
        } else {
            out.extend_from_slice(&raw);
            Ok(raw.len())
        }
    }

    /// The file's external lookup tables, parsed once on first use. The
    /// table section shares the block compressor, so the first block's flag
    /// determines how it expands.
    fn tables(&self, kind: CompressionType) -> Result<&DecodedTables> {
        if let Some(tables) = self.tables.get() {
            return Ok(tables);
        }
        let parsed = match &self.packed_tables {
            Some(packed) => decoded_tables_from_bytes(&decompress(kind, &unpack_base128(packed))?)?,
            None => DecodedTables::new(),
        };
        Ok(self.tables.get_or_init(|| parsed))
    }
}
