//! Git delta encoding.
//!
//! A delta is `<source size varint><target size varint>` followed by
//! instructions. `1xxxxxxx` copies a range out of the base, the low seven
//! bits selecting which offset (4) and size (3) bytes follow; a size of 0
//! means 0x10000. `0xxxxxxx` inserts the next 1..=127 literal bytes.

use crate::{GitError, Result};
use std::collections::HashMap;

/// Width of the blocks indexed in the base when encoding.
const BLOCK: usize = 16;

/// Largest copy a single instruction carries.
const MAX_COPY: usize = 0x10000;

/// Largest literal run a single instruction carries.
const MAX_INSERT: usize = 0x7f;

fn corrupt(msg: impl Into<String>) -> GitError {
    GitError::CorruptPack(msg.into())
}

fn read_varint(delta: &[u8], pos: &mut usize) -> Result<usize> {
    let mut value = 0usize;
    let mut shift = 0u32;
    loop {
        let byte = *delta
            .get(*pos)
            .ok_or_else(|| corrupt("truncated delta header"))?;
        *pos += 1;
        if shift > 56 {
            return Err(corrupt("delta size varint overflow"));
        }
        value |= ((byte & 0x7f) as usize) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
}

fn write_varint(out: &mut Vec<u8>, mut value: usize) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Returns the `(source, target)` sizes declared by a delta.
pub fn delta_sizes(delta: &[u8]) -> Result<(usize, usize)> {
    let mut pos = 0;
    let source = read_varint(delta, &mut pos)?;
    let target = read_varint(delta, &mut pos)?;
    Ok((source, target))
}

/// Applies `delta` to `base`.
///
/// Fails with [`GitError::CorruptPack`] if the declared source size does not
/// match the base, if a copy reaches outside the base, or if the output
/// size differs from the declared target size.
pub fn apply_delta(base: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let mut pos = 0;
    let source_size = read_varint(delta, &mut pos)?;
    let target_size = read_varint(delta, &mut pos)?;

    if source_size != base.len() {
        return Err(corrupt(format!(
            "delta base size mismatch: expected {}, have {}",
            source_size,
            base.len()
        )));
    }

    let mut out = Vec::with_capacity(target_size);
    while pos < delta.len() {
        let cmd = delta[pos];
        pos += 1;

        if cmd & 0x80 != 0 {
            let mut offset = 0usize;
            for i in 0..4 {
                if cmd & (1 << i) != 0 {
                    let byte = *delta.get(pos).ok_or_else(|| corrupt("truncated copy"))?;
                    pos += 1;
                    offset |= (byte as usize) << (8 * i);
                }
            }
            let mut size = 0usize;
            for i in 0..3 {
                if cmd & (0x10 << i) != 0 {
                    let byte = *delta.get(pos).ok_or_else(|| corrupt("truncated copy"))?;
                    pos += 1;
                    size |= (byte as usize) << (8 * i);
                }
            }
            if size == 0 {
                size = MAX_COPY;
            }

            let end = offset
                .checked_add(size)
                .filter(|&end| end <= base.len())
                .ok_or_else(|| corrupt("delta copy out of bounds"))?;
            if out.len() + size > target_size {
                return Err(corrupt("delta overflows target size"));
            }
            out.extend_from_slice(&base[offset..end]);
        } else if cmd != 0 {
            let size = cmd as usize;
            let literal = delta
                .get(pos..pos + size)
                .ok_or_else(|| corrupt("truncated delta insert"))?;
            if out.len() + size > target_size {
                return Err(corrupt("delta overflows target size"));
            }
            out.extend_from_slice(literal);
            pos += size;
        } else {
            return Err(corrupt("reserved delta opcode 0"));
        }
    }

    if out.len() != target_size {
        return Err(corrupt(format!(
            "delta produced {} bytes, expected {}",
            out.len(),
            target_size
        )));
    }
    Ok(out)
}

fn flush_insert(out: &mut Vec<u8>, pending: &mut Vec<u8>) {
    for chunk in pending.chunks(MAX_INSERT) {
        out.push(chunk.len() as u8);
        out.extend_from_slice(chunk);
    }
    pending.clear();
}

fn push_copy(out: &mut Vec<u8>, mut offset: usize, mut len: usize) {
    while len > 0 {
        let size = len.min(MAX_COPY);
        let mut cmd = 0x80u8;
        let mut args = Vec::with_capacity(7);
        for i in 0..4 {
            let byte = ((offset >> (8 * i)) & 0xff) as u8;
            if byte != 0 {
                cmd |= 1 << i;
                args.push(byte);
            }
        }
        if size != MAX_COPY {
            for i in 0..3 {
                let byte = ((size >> (8 * i)) & 0xff) as u8;
                if byte != 0 {
                    cmd |= 0x10 << i;
                    args.push(byte);
                }
            }
        }
        out.push(cmd);
        out.extend_from_slice(&args);
        offset += size;
        len -= size;
    }
}

/// Encodes `target` as a delta against `base`.
///
/// Matches are found through an index of the base's aligned 16-byte
/// blocks and extended forward byte by byte.
pub fn encode_delta(base: &[u8], target: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(target.len() / 2 + 16);
    write_varint(&mut out, base.len());
    write_varint(&mut out, target.len());

    let mut index: HashMap<&[u8], usize> = HashMap::new();
    for offset in (0..base.len().saturating_sub(BLOCK - 1)).step_by(BLOCK) {
        index.entry(&base[offset..offset + BLOCK]).or_insert(offset);
    }

    let mut pending = Vec::new();
    let mut pos = 0;
    while pos < target.len() {
        let hit = target
            .get(pos..pos + BLOCK)
            .and_then(|block| index.get(block).copied());

        match hit {
            Some(base_offset) => {
                let len = base[base_offset..]
                    .iter()
                    .zip(&target[pos..])
                    .take_while(|(a, b)| a == b)
                    .count();
                flush_insert(&mut out, &mut pending);
                push_copy(&mut out, base_offset, len);
                pos += len;
            }
            None => {
                pending.push(target[pos]);
                pos += 1;
            }
        }
    }
    flush_insert(&mut out, &mut pending);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_apply_insert_only() {
        // source 0, target 5, insert "hello"
        let delta = [0x00, 0x05, 0x05, b'h', b'e', b'l', b'l', b'o'];
        assert_eq!(apply_delta(b"", &delta).unwrap(), b"hello");
    }

    #[test]
    fn test_apply_copy_and_insert() {
        let base = b"the quick brown fox";
        // copy offset 4 len 5 ("quick"), insert " cat"
        let delta = [
            base.len() as u8,
            9,
            0x80 | 0x01 | 0x10,
            4,
            5,
            0x04,
            b' ',
            b'c',
            b'a',
            b't',
        ];
        assert_eq!(apply_delta(base, &delta).unwrap(), b"quick cat");
    }

    #[test]
    fn test_copy_size_zero_means_64k() {
        let base = vec![9u8; MAX_COPY];
        let mut delta = Vec::new();
        write_varint(&mut delta, base.len());
        write_varint(&mut delta, base.len());
        delta.push(0x80);
        assert_eq!(apply_delta(&base, &delta).unwrap(), base);
    }

    #[test]
    fn test_base_size_mismatch() {
        let delta = [0x03, 0x01, 0x01, b'x'];
        assert!(matches!(
            apply_delta(b"ab", &delta),
            Err(GitError::CorruptPack(_))
        ));
    }

    #[test]
    fn test_copy_out_of_bounds() {
        let base = b"abcd";
        let delta = [0x04, 0x04, 0x80 | 0x01 | 0x10, 2, 4];
        assert!(apply_delta(base, &delta).is_err());
    }

    #[test]
    fn test_target_size_mismatch() {
        let delta = [0x00, 0x07, 0x02, b'h', b'i'];
        assert!(apply_delta(b"", &delta).is_err());
        let delta = [0x00, 0x01, 0x02, b'h', b'i'];
        assert!(apply_delta(b"", &delta).is_err());
    }

    #[test]
    fn test_truncated_and_reserved() {
        assert!(apply_delta(b"", &[]).is_err());
        assert!(apply_delta(b"", &[0x80]).is_err());
        assert!(apply_delta(b"", &[0x00, 0x03, 0x05, b'a']).is_err());
        assert!(apply_delta(b"", &[0x00, 0x00, 0x00]).is_err());
    }

    #[test]
    fn test_encode_uses_copies() {
        let base: Vec<u8> = (0..4096u32).map(|i| (i * 7 % 251) as u8).collect();
        let mut target = base.clone();
        target[2000] ^= 0xff;
        target.extend_from_slice(b"appended tail");

        let delta = encode_delta(&base, &target);
        assert!(delta.len() < target.len() / 10);
        assert_eq!(apply_delta(&base, &delta).unwrap(), target);
        assert_eq!(delta_sizes(&delta).unwrap(), (base.len(), target.len()));
    }

    #[test]
    fn test_encode_large_copy_split() {
        let base: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();
        let delta = encode_delta(&base, &base);
        assert_eq!(apply_delta(&base, &delta).unwrap(), base);
    }

    proptest! {
        #[test]
        fn prop_encode_apply(
            base in prop::collection::vec(any::<u8>(), 0..2048),
            edits in prop::collection::vec((any::<u16>(), any::<u8>()), 0..16),
            tail in prop::collection::vec(any::<u8>(), 0..64),
        ) {
            let mut target = base.clone();
            for (at, byte) in edits {
                if !target.is_empty() {
                    let idx = at as usize % target.len();
                    target[idx] = byte;
                }
            }
            target.extend_from_slice(&tail);

            let delta = encode_delta(&base, &target);
            prop_assert_eq!(apply_delta(&base, &delta).unwrap(), target);
        }

        #[test]
        fn prop_apply_never_panics(
            base in prop::collection::vec(any::<u8>(), 0..64),
            delta in prop::collection::vec(any::<u8>(), 0..128),
        ) {
            let _ = apply_delta(&base, &delta);
        }
    }
}
