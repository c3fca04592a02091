//! The ordered (chromosome, position) key used for sorting and seeking.

use std::cmp::Ordering;

use crate::error::{FormatError, Result};

/// Position value used for keys parsed from an empty line.
pub const NO_POSITION: i64 = -1;

/// A genomic coordinate: chromosome name plus 1-based base-pair position.
///
/// Keys are ordered by a [`ChromOrder`] strategy; two keys are equal exactly
/// when the comparator returns [`Ordering::Equal`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenomicKey {
    pub chrom: String,
    pub pos: i64,
}

impl GenomicKey {
    #[must_use]
    pub fn new(chrom: impl Into<String>, pos: i64) -> Self {
        Self {
            chrom: chrom.into(),
            pos,
        }
    }

    /// Estimates where `self` falls between `left` and `right` as a fraction
    /// in `[0, 1]`, for seeding interpolation seeks.
    ///
    /// On a single chromosome the relative distance in coordinate space is
    /// assumed to mirror relative distance in the file. The estimate is kept
    /// off the extreme edges (clamped to `[0.1, 0.9]`) since regressing from
    /// an edge estimate converges very slowly. Across chromosomes there is no
    /// usable signal and `0.5` is returned. Callers must always verify the
    /// landing point by key comparison; this is advisory only.
    #[must_use]
    pub fn estimate_fraction(&self, left: &GenomicKey, right: &GenomicKey) -> f32 {
        if left.chrom == right.chrom {
            let span = (right.pos - left.pos) as f32;
            ((self.pos - left.pos) as f32 / span).max(0.1).min(0.9)
        } else {
            0.5
        }
    }
}

/// Total-order strategy for chromosome names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChromOrder {
    /// Plain lexicographic ordering of the chromosome string
    #[default]
    Lexical,
    /// Human-genome ordinal ordering with chrM ranked first; chromosomes
    /// without a known ordinal sort before those with one
    GenomeOrdinal,
}

impl ChromOrder {
    /// Compares two keys under this ordering strategy.
    #[must_use]
    pub fn compare(&self, left: &GenomicKey, right: &GenomicKey) -> Ordering {
        self.compare_parts(&left.chrom, left.pos, &right.chrom, right.pos)
    }

    /// Key comparison on borrowed parts, for callers that hold the fields
    /// separately and should not build a key per probe.
    #[must_use]
    pub fn compare_parts(
        &self,
        left_chrom: &str,
        left_pos: i64,
        right_chrom: &str,
        right_pos: i64,
    ) -> Ordering {
        if left_chrom == right_chrom {
            return left_pos.cmp(&right_pos);
        }
        match self {
            ChromOrder::Lexical => left_chrom.cmp(right_chrom),
            ChromOrder::GenomeOrdinal => {
                match (chrom_ordinal(left_chrom), chrom_ordinal(right_chrom)) {
                    (None, _) => Ordering::Less,
                    (_, None) => Ordering::Greater,
                    (Some(l), Some(r)) => l.cmp(&r).then_with(|| left_pos.cmp(&right_pos)),
                }
            }
        }
    }
}

/// Maps a chromosome name to its ordinal in genome order, chrM first.
/// Accepts names with or without the `chr` prefix; returns `None` for
/// contigs outside the canonical set.
#[must_use]
pub fn chrom_ordinal(name: &str) -> Option<u32> {
    let bare = name.strip_prefix("chr").unwrap_or(name);
    match bare {
        "M" | "MT" => Some(0),
        "X" => Some(23),
        "Y" => Some(24),
        _ => match bare.parse::<u32>() {
            Ok(n) if (1..=22).contains(&n) => Some(n),
            _ => None,
        },
    }
}

/// Describes where the key columns live in a tab-delimited row and how keys
/// compare. Cheap to copy; every component holding buffered rows carries one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySchema {
    pub chrom_col: usize,
    pub pos_col: usize,
    pub order: ChromOrder,
}

impl Default for KeySchema {
    /// Chromosome in the first column, position in the second, lexical order.
    fn default() -> Self {
        Self {
            chrom_col: 0,
            pos_col: 1,
            order: ChromOrder::default(),
        }
    }
}

impl KeySchema {
    #[must_use]
    pub fn new(chrom_col: usize, pos_col: usize, order: ChromOrder) -> Self {
        Self {
            chrom_col,
            pos_col,
            order,
        }
    }

    #[must_use]
    pub fn compare(&self, left: &GenomicKey, right: &GenomicKey) -> Ordering {
        self.order.compare(left, right)
    }

    /// Extracts the key from the line starting at `offset` in `buffer`,
    /// scanning tab-delimited columns up to `up_to` (exclusive). Columns other
    /// than the configured chromosome and position columns are skipped by
    /// counting tabs. An empty range yields the sentinel key `("", -1)`.
    pub fn parse(&self, buffer: &[u8], offset: usize, up_to: usize) -> Result<GenomicKey> {
        if offset >= up_to {
            return Ok(GenomicKey::new("", NO_POSITION));
        }
        let mut chrom = String::new();
        let mut pos: i64 = NO_POSITION;
        let mut idx = offset;
        let max_col = self.chrom_col.max(self.pos_col);
        for col in 0..=max_col {
            if col == self.chrom_col {
                let begin = idx;
                while idx < up_to && buffer[idx] != b'\t' {
                    idx += 1;
                }
                chrom = String::from_utf8_lossy(&buffer[begin..idx]).into_owned();
                idx += 1;
            } else if col == self.pos_col {
                pos = 0;
                while idx < up_to {
                    let b = buffer[idx];
                    idx += 1;
                    if b == b'\t' || b == b'\n' || b == b'\r' {
                        break;
                    }
                    if !b.is_ascii_digit() {
                        let end = up_to.min(offset + 100);
                        return Err(FormatError::MalformedKey(
                            String::from_utf8_lossy(&buffer[offset..end]).into_owned(),
                        )
                        .into());
                    }
                    pos = 10 * pos + i64::from(b - b'0');
                }
            } else {
                while idx < up_to && buffer[idx] != b'\t' {
                    idx += 1;
                }
                idx += 1;
            }
        }
        Ok(GenomicKey { chrom, pos })
    }
}
