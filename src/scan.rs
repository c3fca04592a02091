//! Line-oriented scanning over a byte window aligned on row boundaries.
//!
//! [`LineWindow`] is the in-memory half of seeking: it holds one window of a
//! row-sorted file (or one decompressed block), exposes sequential line
//! iteration, and binary-searches the window for the first row at or after a
//! target key. Windows are CRLF-tolerant; a `\r` before the terminating `\n`
//! is excluded from row content.

use std::cmp::Ordering;

use crate::error::Result;
use crate::key::{GenomicKey, KeySchema};

/// A window `[lower, upper)` of line-framed bytes with a cursor, cached
/// first/last keys, and key-based positioning.
#[derive(Debug)]
pub struct LineWindow {
    buf: Vec<u8>,
    lower: usize,
    upper: usize,
    cursor: usize,
    has_next: bool,
    first_key: Option<GenomicKey>,
    last_key: Option<GenomicKey>,
    schema: KeySchema,
}

impl LineWindow {
    #[must_use]
    pub fn new(schema: KeySchema) -> Self {
        Self {
            buf: Vec::new(),
            lower: 0,
            upper: 0,
            cursor: 0,
            has_next: false,
            first_key: None,
            last_key: None,
            schema,
        }
    }

    /// Loads `src[offset..up_to]` as the new window. When the edges are not
    /// known to fall on line boundaries the bounds are realigned inward to the
    /// first line start and the last line end inside the range; a window that
    /// contains no complete line comes up empty.
    pub fn update(
        &mut self,
        src: &[u8],
        offset: usize,
        up_to: usize,
        first_is_line_start: bool,
        last_is_line_end: bool,
    ) {
        self.first_key = None;
        self.last_key = None;
        if offset >= up_to {
            self.clear();
            return;
        }
        let lower = if first_is_line_start {
            offset
        } else {
            match memchr::memchr(b'\n', &src[offset..up_to]) {
                Some(k) => offset + k + 1,
                None => up_to,
            }
        };
        let upper = if last_is_line_end {
            up_to
        } else {
            match memchr::memrchr(b'\n', &src[offset..up_to]) {
                Some(k) => offset + k + 1,
                None => offset,
            }
        };
        if lower < upper {
            self.buf.clear();
            self.buf.extend_from_slice(&src[..up_to]);
            self.lower = lower;
            self.upper = upper;
            self.cursor = lower;
            self.has_next = true;
        } else {
            self.clear();
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.lower = 0;
        self.upper = 0;
        self.cursor = 0;
        self.has_next = false;
        self.first_key = None;
        self.last_key = None;
    }

    #[must_use]
    pub fn has_next(&self) -> bool {
        self.has_next
    }

    /// Start of the first complete line, relative to the loaded buffer.
    #[must_use]
    pub fn lower_bound(&self) -> usize {
        self.lower
    }

    /// End of the last complete line (exclusive), relative to the buffer.
    #[must_use]
    pub fn upper_bound(&self) -> usize {
        self.upper
    }

    #[must_use]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Position just past the first line's terminator.
    #[must_use]
    pub fn first_line_end(&self) -> usize {
        match memchr::memchr(b'\n', &self.buf[self.lower..self.upper]) {
            Some(k) => self.lower + k + 1,
            None => self.upper,
        }
    }

    /// Returns the current line (CR trimmed) and advances the cursor.
    pub fn next_line(&mut self) -> &[u8] {
        let (begin, content_end, next) = self.line_span(self.cursor);
        self.cursor = next;
        self.has_next = self.cursor < self.upper;
        &self.buf[begin..content_end]
    }

    /// Appends the current line to `out` and advances the cursor.
    pub fn write_next(&mut self, out: &mut Vec<u8>) {
        let (begin, content_end, next) = self.line_span(self.cursor);
        out.extend_from_slice(&self.buf[begin..content_end]);
        self.cursor = next;
        self.has_next = self.cursor < self.upper;
    }

    /// Key of the first line in the window, computed once per window.
    pub fn first_key(&mut self) -> Result<GenomicKey> {
        if self.first_key.is_none() {
            let key = self.schema.parse(&self.buf, self.lower, self.upper)?;
            self.first_key = Some(key);
        }
        Ok(self.first_key.clone().unwrap_or_default())
    }

    /// Key of the last line in the window, computed once per window.
    pub fn last_key(&mut self) -> Result<GenomicKey> {
        if self.last_key.is_none() {
            let begin = self.start_of_last_line();
            let key = self.schema.parse(&self.buf, begin, self.upper)?;
            self.last_key = Some(key);
        }
        Ok(self.last_key.clone().unwrap_or_default())
    }

    /// Positions the cursor on the first line whose key is `>= key`.
    ///
    /// The window's cached first/last keys short-circuit the common cases: a
    /// target past the window exhausts it and a target at or before the first
    /// line rewinds to the start, so sequential scans interrupted by an
    /// occasional seek skip the binary search entirely.
    pub fn seek(&mut self, key: &GenomicKey) -> Result<()> {
        // A drained cursor must still honor seeks; only a window with no
        // complete line at all has nothing to offer.
        if self.lower < self.upper {
            let schema = self.schema;
            self.cursor = if schema.compare(key, &self.last_key()?) == Ordering::Greater {
                self.upper
            } else if schema.compare(key, &self.first_key()?) == Ordering::Greater {
                self.find_in_window(key)?
            } else {
                self.lower
            };
            self.has_next = self.cursor < self.upper;
        }
        Ok(())
    }

    /// Binary search over `[first_line_end, upper)` for the start of the first
    /// line with key `>= key`. Each probe bisects the byte range, realigns to
    /// the enclosing line, and compares its key: O(log n) comparisons, each
    /// costing one key extraction.
    fn find_in_window(&self, key: &GenomicKey) -> Result<usize> {
        let offset = self.first_line_end();
        let mut lo = offset;
        let mut hi = self.upper;
        while lo != hi {
            let pos = (lo + hi) / 2;
            let mut begin = pos;
            while begin > offset && self.buf[begin - 1] != b'\n' {
                begin -= 1;
            }
            let end = match memchr::memchr(b'\n', &self.buf[pos..self.upper]) {
                Some(k) => pos + k + 1,
                None => self.upper,
            };
            let probe = self.schema.parse(&self.buf, begin, end)?;
            if self.schema.compare(&probe, key) == Ordering::Less {
                lo = end;
            } else {
                hi = begin;
            }
        }
        Ok(lo)
    }

    fn start_of_last_line(&self) -> usize {
        if self.upper <= self.lower + 1 {
            return self.lower;
        }
        match memchr::memrchr(b'\n', &self.buf[self.lower..self.upper - 1]) {
            Some(k) => self.lower + k + 1,
            None => self.lower,
        }
    }

    /// `(content_start, content_end, next_line_start)` for the line at `at`,
    /// trimming a trailing CR from the content.
    fn line_span(&self, at: usize) -> (usize, usize, usize) {
        let (mut content_end, next) = match memchr::memchr(b'\n', &self.buf[at..self.upper]) {
            Some(k) => (at + k, at + k + 1),
            None => (self.upper, self.upper),
        };
        if content_end > at && self.buf[content_end - 1] == b'\r' {
            content_end -= 1;
        }
        (at, content_end, next)
    }
}
