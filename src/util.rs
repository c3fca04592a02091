//! Small byte-level helpers shared by the codec and the block framing.

/// Offset added to every packed byte so the output never collides with the
/// tab/newline framing of block lines (all packed bytes land in `33..=160`).
const PACK_OFFSET: u8 = 33;

/// Packs arbitrary bytes into a base-128 representation, 7 payload bits per
/// output byte (LSB first), each offset by 33 to stay clear of control
/// characters. Output length is `ceil(len * 8 / 7)`.
#[must_use]
pub fn pack_base128(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity((src.len() * 8).div_ceil(7));
    let mut acc: u32 = 0;
    let mut nbits = 0u32;
    for &b in src {
        acc |= u32::from(b) << nbits;
        nbits += 8;
        while nbits >= 7 {
            out.push((acc & 0x7f) as u8 + PACK_OFFSET);
            acc >>= 7;
            nbits -= 7;
        }
    }
    if nbits > 0 {
        out.push((acc & 0x7f) as u8 + PACK_OFFSET);
    }
    out
}

/// Restores base-128 packed bytes to their original form. Output length is
/// `floor(len * 7 / 8)`; the final partial group is padding by construction.
#[must_use]
pub fn unpack_base128(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() * 7 / 8);
    let mut acc: u32 = 0;
    let mut nbits = 0u32;
    for &b in src {
        acc |= u32::from(b.wrapping_sub(PACK_OFFSET) & 0x7f) << nbits;
        nbits += 7;
        if nbits >= 8 {
            out.push((acc & 0xff) as u8);
            acc >>= 8;
            nbits -= 8;
        }
    }
    out
}

/// Number of bytes `pack_base128` produces for `len` input bytes.
#[must_use]
pub fn packed_len(len: usize) -> usize {
    (len * 8).div_ceil(7)
}

/// Appends the decimal text form of `value` to `out`, returning the number of
/// bytes written.
pub fn push_i64(out: &mut Vec<u8>, value: i64) -> usize {
    let mut fmt = itoa::Buffer::new();
    let text = fmt.format(value);
    out.extend_from_slice(text.as_bytes());
    text.len()
}

/// Appends `text` followed by a zero terminator, stripping any embedded NUL
/// bytes (NUL is the field terminator and may not occur in values). Returns
/// the number of bytes written including the terminator.
pub fn push_terminated(out: &mut Vec<u8>, text: &str) -> usize {
    let start = out.len();
    out.extend(text.bytes().filter(|&b| b != 0));
    out.push(0);
    out.len() - start
}

/// Length of the zero-terminated run starting at `pos`, excluding the
/// terminator itself.
#[must_use]
pub fn terminated_len(src: &[u8], pos: usize) -> usize {
    memchr::memchr(0, &src[pos..]).unwrap_or(src.len() - pos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_round_trips() {
        let cases: [&[u8]; 6] = [
            b"",
            b"a",
            b"1234567",
            b"12345678",
            &[0u8, 255, 128, 7, 9, 10],
            b"the quick brown fox jumps over the lazy dog",
        ];
        for case in cases {
            let packed = pack_base128(case);
            assert_eq!(packed.len(), packed_len(case.len()));
            assert!(packed.iter().all(|&b| b >= 33));
            assert_eq!(unpack_base128(&packed), case);
        }
    }

    #[test]
    fn packed_bytes_avoid_framing() {
        // No packed byte may collide with '\t' or '\n'.
        let packed = pack_base128(&(0u8..=255).collect::<Vec<_>>());
        assert!(packed.iter().all(|&b| b != b'\t' && b != b'\n'));
    }

    #[test]
    fn terminated_strings() {
        let mut out = Vec::new();
        assert_eq!(push_terminated(&mut out, "abc"), 4);
        assert_eq!(push_terminated(&mut out, "a\0b"), 3);
        assert_eq!(out, b"abc\0ab\0");
        assert_eq!(terminated_len(&out, 0), 3);
        assert_eq!(terminated_len(&out, 4), 2);
    }
}
