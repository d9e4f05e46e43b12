// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

//! Integer encodings shared by the table layouts, the mark index and the
//! dictionary.
//!
//! Fixed-width values are little-endian and truncated to `nbytes`. `vlong`
//! is a LEB128 style varint (low groups first). `vlong2` writes the groups
//! most significant first, which lets a writer reserve a fixed number of
//! bytes and backfill the value later with [`encode_vlong2_fixed_len`].

use bytes::{
    Buf,
    BufMut,
    BytesMut,
};

use crate::errs::{
    Result,
    TridentError,
};

pub const MAX_VLONG_LEN: usize = 10;

/// Writes the low `nbytes` bytes of `value` at `buf[offset..]`.
#[inline]
pub fn encode_fixed(buf: &mut [u8], offset: usize, nbytes: usize, value: u64) {
    let bytes = value.to_le_bytes();
    buf[offset..offset + nbytes].copy_from_slice(&bytes[..nbytes]);
}

#[inline]
pub fn put_fixed(buf: &mut BytesMut, nbytes: usize, value: u64) {
    buf.put_uint_le(value & mask(nbytes), nbytes);
}

/// Inverse of [`encode_fixed`]; reads `nbytes` bytes from the start of `buf`.
#[inline]
pub fn decode_fixed(buf: &[u8], nbytes: usize) -> u64 {
    let mut out = [0u8; 8];
    out[..nbytes].copy_from_slice(&buf[..nbytes]);
    u64::from_le_bytes(out)
}

#[inline]
pub fn mask(nbytes: usize) -> u64 {
    if nbytes >= 8 {
        u64::MAX
    } else {
        (1u64 << (nbytes * 8)) - 1
    }
}

/// Smallest number of bytes able to hold `value`, never less than one.
#[inline]
pub fn num_bytes(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(8).max(1)
}

pub fn vlong_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

pub fn put_vlong(buf: &mut BytesMut, mut value: u64) -> usize {
    let mut count = 1;
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
        count += 1;
    }
    buf.put_u8(value as u8);
    count
}

pub fn get_vlong(buf: &mut &[u8]) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0;
    for _ in 0..MAX_VLONG_LEN {
        if buf.is_empty() {
            return Err(TridentError::corrupt("truncated vlong"));
        }
        let byte = buf.get_u8();
        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
    Err(TridentError::corrupt("vlong longer than ten bytes"))
}

/// Decodes a vlong at `*pos` and moves `pos` past it.
pub fn decode_vlong(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut slice = buf
        .get(*pos..)
        .ok_or_else(|| TridentError::corrupt("vlong offset out of range"))?;
    let before = slice.len();
    let v = get_vlong(&mut slice)?;
    *pos += before - slice.len();
    Ok(v)
}

pub fn vlong2_len(value: u64) -> usize {
    vlong_len(value)
}

pub fn put_vlong2(buf: &mut BytesMut, value: u64) -> usize {
    let len = vlong2_len(value);
    let mut tmp = [0u8; MAX_VLONG_LEN];
    encode_vlong2_fixed_len(&mut tmp, value, len);
    buf.put_slice(&tmp[..len]);
    len
}

/// Encodes `value` using exactly `len` bytes. `len` must be at least
/// [`vlong2_len`] of the value; leading groups are zero padded.
pub fn encode_vlong2_fixed_len(buf: &mut [u8], value: u64, len: usize) {
    for i in 0..len {
        let shift = 7 * (len - 1 - i);
        let group = if shift >= 64 { 0 } else { (value >> shift) & 0x7F } as u8;
        buf[i] = if i + 1 < len { group | 0x80 } else { group };
    }
}

pub fn get_vlong2(buf: &mut &[u8]) -> Result<u64> {
    let mut result = 0u64;
    for _ in 0..MAX_VLONG_LEN {
        if buf.is_empty() {
            return Err(TridentError::corrupt("truncated vlong2"));
        }
        let byte = buf.get_u8();
        result = (result << 7) | (byte & 0x7F) as u64;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
    }
    Err(TridentError::corrupt("vlong2 longer than ten bytes"))
}

pub fn decode_vlong2(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut slice = buf
        .get(*pos..)
        .ok_or_else(|| TridentError::corrupt("vlong2 offset out of range"))?;
    let before = slice.len();
    let v = get_vlong2(&mut slice)?;
    *pos += before - slice.len();
    Ok(v)
}

/// Length-prefixed byte string.
pub fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    put_vlong(buf, data.len() as u64);
    buf.put_slice(data);
}

pub fn get_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8]> {
    let len = get_vlong(buf)? as usize;
    if buf.len() < len {
        return Err(TridentError::corrupt("truncated byte string"));
    }
    let (data, rest) = buf.split_at(len);
    *buf = rest;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_num_bytes() {
        assert_eq!(num_bytes(0), 1);
        assert_eq!(num_bytes(255), 1);
        assert_eq!(num_bytes(256), 2);
        assert_eq!(num_bytes((1 << 40) - 1), 5);
        assert_eq!(num_bytes(u64::MAX), 8);
    }

    #[test]
    fn test_fixed_five_bytes() {
        let mut buf = [0u8; 7];
        encode_fixed(&mut buf, 2, 5, 0xAB_CDEF_0123);
        assert_eq!(buf[0], 0);
        assert_eq!(decode_fixed(&buf[2..], 5), 0xAB_CDEF_0123);
    }

    #[test]
    fn test_vlong2_fixed_len_backfill() {
        let mut buf = BytesMut::new();
        buf.put_slice(&[0u8; 4]);
        buf.put_u8(0xEE);
        encode_vlong2_fixed_len(&mut buf[..4], 300, 4);
        let mut slice: &[u8] = &buf;
        assert_eq!(get_vlong2(&mut slice).unwrap(), 300);
        assert_eq!(slice, &[0xEE]);
    }

    #[test]
    fn test_truncated_vlong_is_corrupt() {
        let mut slice: &[u8] = &[0x80, 0x80];
        assert!(matches!(
            get_vlong(&mut slice),
            Err(TridentError::CorruptData(_))
        ));
    }

    proptest! {
        #[test]
        fn test_fixed_roundtrip(value in any::<u64>(), width in 1usize..=8) {
            let value = value & mask(width);
            let mut buf = BytesMut::new();
            put_fixed(&mut buf, width, value);
            prop_assert_eq!(buf.len(), width);
            prop_assert_eq!(decode_fixed(&buf, width), value);
            prop_assert!(num_bytes(value) <= width);
        }

        #[test]
        fn test_vlong_roundtrip(values in proptest::collection::vec(any::<u64>(), 1..32)) {
            let mut buf = BytesMut::new();
            for v in values.iter() {
                let n = put_vlong(&mut buf, *v);
                prop_assert_eq!(n, vlong_len(*v));
                put_vlong2(&mut buf, *v);
            }
            let mut pos = 0;
            for v in values.iter() {
                prop_assert_eq!(decode_vlong(&buf, &mut pos).unwrap(), *v);
                prop_assert_eq!(decode_vlong2(&buf, &mut pos).unwrap(), *v);
            }
            prop_assert_eq!(pos, buf.len());
        }
    }
}
