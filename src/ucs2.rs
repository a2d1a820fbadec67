//! UTF-8 <-> UCS-2 conversion for FAT long names. Only the BMP is
//! representable: 4-byte UTF-8 sequences are rejected rather than mapped to
//! surrogate pairs.

use crate::errors::{FsError, FsResult};

/// Decode UTF-8 into UCS-2 code units. 1-, 2- and 3-byte sequences only.
pub fn utf8_to_ucs2(input: &[u8]) -> FsResult<Vec<u16>> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;

    while i < input.len() {
        let b = input[i];
        if b <= 0x7F {
            out.push(b as u16);
            i += 1;
        } else if (b & 0xE0) == 0xC0 {
            if input.len() < i + 2 || (input[i + 1] & 0xC0) != 0x80 {
                return Err(FsError::IllegalSeq);
            }
            out.push((((b & 0x1F) as u16) << 6) | (input[i + 1] & 0x3F) as u16);
            i += 2;
        } else if (b & 0xF0) == 0xE0 {
            if input.len() < i + 3
                || (input[i + 1] & 0xC0) != 0x80
                || (input[i + 2] & 0xC0) != 0x80
            {
                return Err(FsError::IllegalSeq);
            }
            out.push(
                (((b & 0x0F) as u16) << 12)
                    | (((input[i + 1] & 0x3F) as u16) << 6)
                    | (input[i + 2] & 0x3F) as u16,
            );
            i += 3;
        } else {
            // 4-byte sequences cannot be encoded as UCS-2.
            return Err(FsError::IllegalSeq);
        }
    }

    Ok(out)
}

/// Encode UCS-2 code units back into UTF-8.
pub fn ucs2_to_utf8(input: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() * 3);

    for &cp in input {
        if cp <= 0x007F {
            out.push(cp as u8);
        } else if cp <= 0x07FF {
            out.push(0xC0 | ((cp >> 6) & 0x1F) as u8);
            out.push(0x80 | (cp & 0x3F) as u8);
        } else {
            out.push(0xE0 | ((cp >> 12) & 0x0F) as u8);
            out.push(0x80 | ((cp >> 6) & 0x3F) as u8);
            out.push(0x80 | (cp & 0x3F) as u8);
        }
    }

    out
}

/// Length up to the first NUL, the way the on-disk padded buffers are
/// measured.
pub fn strlen_ucs2(input: &[u16]) -> usize {
    input.iter().position(|&c| c == 0).unwrap_or(input.len())
}

/// ASCII-range case folding, applied in place. Matches the original's
/// no-wctype variant: code points at 0x100 and above compare as-is.
pub fn ucs2_tolower(buf: &mut [u16]) {
    for c in buf.iter_mut() {
        if *c < 0x100 {
            *c = (*c as u8).to_ascii_lowercase() as u16;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_round_trip() -> FsResult<()> {
        let ucs = utf8_to_ucs2(b"Hello.TXT")?;
        assert_eq!(ucs, b"Hello.TXT".iter().map(|&b| b as u16).collect::<Vec<_>>());
        assert_eq!(ucs2_to_utf8(&ucs), b"Hello.TXT");
        Ok(())
    }

    #[test]
    fn two_and_three_byte_sequences() -> FsResult<()> {
        // U+00E9 (é), U+20AC (€)
        let ucs = utf8_to_ucs2("é€".as_bytes())?;
        assert_eq!(ucs, vec![0x00E9, 0x20AC]);
        assert_eq!(ucs2_to_utf8(&ucs), "é€".as_bytes());
        Ok(())
    }

    #[test]
    fn four_byte_sequence_rejected() {
        // U+1F600 needs a surrogate pair in UTF-16; UCS-2 cannot hold it.
        assert_eq!(utf8_to_ucs2("😀".as_bytes()), Err(FsError::IllegalSeq));
    }

    #[test]
    fn truncated_sequence_rejected() {
        assert_eq!(utf8_to_ucs2(&[0xE2, 0x82]), Err(FsError::IllegalSeq));
        assert_eq!(utf8_to_ucs2(&[0xC3]), Err(FsError::IllegalSeq));
    }

    #[test]
    fn lowercase_folds_ascii_only() {
        let mut buf = vec!['A' as u16, 'z' as u16, 0x00C9, 0x0409];
        ucs2_tolower(&mut buf);
        // Only A-Z folds; Latin-1 and beyond compare as-is.
        assert_eq!(buf, vec!['a' as u16, 'z' as u16, 0x00C9, 0x0409]);
    }

    #[test]
    fn strlen_stops_at_nul() {
        assert_eq!(strlen_ucs2(&[0x41, 0x42, 0, 0xFFFF]), 2);
        assert_eq!(strlen_ucs2(&[0x41, 0x42]), 2);
    }
}
