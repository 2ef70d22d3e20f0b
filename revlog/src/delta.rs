/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Binary deltas: a sequence of `(start, end, data)` hunks against a base
//! text.
//!
//! On the wire each hunk is three big-endian u32 values (start, end, data
//! length) followed by the replacement bytes. Hunk positions refer to the
//! base text and must be sorted and non-overlapping; applying a delta is a
//! single merge pass over the base.

use byteorder::BigEndian;
use byteorder::ByteOrder;

use crate::errors::corrupt;
use crate::errors::Result;

const HUNK_HEADER_SIZE: usize = 12;

#[derive(Clone, Debug, PartialEq)]
pub struct Hunk {
    /// Replace `base[start..end]` ...
    pub start: u32,
    pub end: u32,
    /// ... with these bytes.
    pub data: Vec<u8>,
}

pub fn parse(chunk: &[u8]) -> Result<Vec<Hunk>> {
    let mut hunks = Vec::new();
    let mut pos = 0usize;
    while pos < chunk.len() {
        if pos + HUNK_HEADER_SIZE > chunk.len() {
            return Err(corrupt("truncated delta hunk header"));
        }
        let start = BigEndian::read_u32(&chunk[pos..pos + 4]);
        let end = BigEndian::read_u32(&chunk[pos + 4..pos + 8]);
        let len = BigEndian::read_u32(&chunk[pos + 8..pos + 12]) as usize;
        pos += HUNK_HEADER_SIZE;
        if pos + len > chunk.len() {
            return Err(corrupt("truncated delta hunk data"));
        }
        if end < start {
            return Err(corrupt(format!("delta hunk ends before it starts: {}..{}", start, end)));
        }
        hunks.push(Hunk {
            start,
            end,
            data: chunk[pos..pos + len].to_vec(),
        });
        pos += len;
    }
    Ok(hunks)
}

pub fn encode(hunks: &[Hunk]) -> Vec<u8> {
    let size = hunks
        .iter()
        .map(|h| HUNK_HEADER_SIZE + h.data.len())
        .sum();
    let mut out = vec![0u8; size];
    let mut pos = 0;
    for hunk in hunks {
        BigEndian::write_u32(&mut out[pos..pos + 4], hunk.start);
        BigEndian::write_u32(&mut out[pos + 4..pos + 8], hunk.end);
        BigEndian::write_u32(&mut out[pos + 8..pos + 12], hunk.data.len() as u32);
        pos += HUNK_HEADER_SIZE;
        out[pos..pos + hunk.data.len()].copy_from_slice(&hunk.data);
        pos += hunk.data.len();
    }
    out
}

/// Apply `hunks` to `base` in one forward pass.
pub fn apply(base: &[u8], hunks: &[Hunk]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(base.len());
    let mut last = 0usize;
    for hunk in hunks {
        let start = hunk.start as usize;
        let end = hunk.end as usize;
        if start < last || end < start || end > base.len() {
            return Err(corrupt(format!(
                "delta hunk {}..{} outside base of length {}",
                start,
                end,
                base.len()
            )));
        }
        out.extend_from_slice(&base[last..start]);
        out.extend_from_slice(&hunk.data);
        last = end;
    }
    out.extend_from_slice(&base[last..]);
    Ok(out)
}

/// Compute a delta turning `old` into `new`: the bytes between the common
/// prefix and the common suffix as a single replacement hunk.
pub fn diff(old: &[u8], new: &[u8]) -> Vec<Hunk> {
    if old == new {
        return Vec::new();
    }
    let shorter = old.len().min(new.len());
    let mut prefix = 0usize;
    while prefix < shorter && old[prefix] == new[prefix] {
        prefix += 1;
    }
    let mut suffix = 0usize;
    while suffix < shorter - prefix
        && old[old.len() - 1 - suffix] == new[new.len() - 1 - suffix]
    {
        suffix += 1;
    }
    vec![Hunk {
        start: prefix as u32,
        end: (old.len() - suffix) as u32,
        data: new[prefix..new.len() - suffix].to_vec(),
    }]
}

#[cfg(test)]
mod tests {
    use quickcheck::quickcheck;

    use super::*;

    #[test]
    fn test_header_layout() {
        let hunks = vec![Hunk {
            start: 0x2a,
            end: 0x2b,
            data: b"zz".to_vec(),
        }];
        let encoded = encode(&hunks);
        assert_eq!(
            &encoded[..12],
            b"\x00\x00\x00\x2a\x00\x00\x00\x2b\x00\x00\x00\x02"
        );
        assert_eq!(parse(&encoded).unwrap(), hunks);
    }

    #[test]
    fn test_apply_multiple_hunks() {
        let base = b"the quick brown fox";
        let hunks = vec![
            Hunk {
                start: 4,
                end: 9,
                data: b"slow".to_vec(),
            },
            Hunk {
                start: 16,
                end: 19,
                data: b"dog".to_vec(),
            },
        ];
        assert_eq!(apply(base, &hunks).unwrap(), b"the slow brown dog");
    }

    #[test]
    fn test_apply_rejects_bad_hunks() {
        let unsorted = vec![
            Hunk {
                start: 2,
                end: 3,
                data: Vec::new(),
            },
            Hunk {
                start: 0,
                end: 1,
                data: Vec::new(),
            },
        ];
        assert!(apply(b"abc", &unsorted).is_err());
        let out_of_range = vec![Hunk {
            start: 2,
            end: 9,
            data: Vec::new(),
        }];
        assert!(apply(b"abc", &out_of_range).is_err());
    }

    #[test]
    fn test_parse_rejects_truncation() {
        let encoded = encode(&[Hunk {
            start: 0,
            end: 0,
            data: b"xyz".to_vec(),
        }]);
        assert!(parse(&encoded[..encoded.len() - 1]).is_err());
        assert!(parse(&encoded[..5]).is_err());
    }

    #[test]
    fn test_diff_of_equal_texts_is_empty() {
        assert!(diff(b"same", b"same").is_empty());
    }

    #[test]
    fn test_diff_append() {
        let hunks = diff(b"ab", b"abc");
        assert_eq!(
            hunks,
            vec![Hunk {
                start: 2,
                end: 2,
                data: b"c".to_vec()
            }]
        );
    }

    quickcheck! {
        fn test_diff_apply_roundtrip(old: Vec<u8>, new: Vec<u8>) -> bool {
            let hunks = diff(&old, &new);
            apply(&old, &hunks).map_or(false, |applied| applied == new)
        }

        fn test_encode_parse_roundtrip(start: u32, len: u8, data: Vec<u8>) -> bool {
            let start = start & 0x00ff_ffff;
            let hunks = vec![Hunk { start, end: start + len as u32, data }];
            parse(&encode(&hunks)).map_or(false, |parsed| parsed == hunks)
        }
    }
}
