//! Bit-stream helpers.
//!
//! All bit positions are LSB-first: bit `n` of a byte slice is bit `n % 8` of byte `n / 8`. This
//! is the order in which the ECC engine consumes a page, so every layout computation in this
//! crate uses it.

use std::ops::Range;

/// Read a single bit
pub fn get_bit(buf: &[u8], bit: usize) -> bool {
    buf[bit / 8] & (1 << (bit % 8)) != 0
}

/// Write a single bit
pub fn set_bit(buf: &mut [u8], bit: usize, value: bool) {
    let mask = 1 << (bit % 8);
    if value {
        buf[bit / 8] |= mask;
    } else {
        buf[bit / 8] &= !mask;
    }
}

pub fn flip_bit(buf: &mut [u8], bit: usize) {
    buf[bit / 8] ^= 1 << (bit % 8);
}

/// Copy `len` bits from `src` (starting at `src_bit`) to `dst` (starting at `dst_bit`).
///
/// Bits of `dst` outside the destination range are left untouched.
pub fn copy_bits(src: &[u8], src_bit: usize, dst: &mut [u8], dst_bit: usize, len: usize) {
    if src_bit % 8 == 0 && dst_bit % 8 == 0 && len % 8 == 0 {
        let (s, d, n) = (src_bit / 8, dst_bit / 8, len / 8);
        dst[d..d + n].copy_from_slice(&src[s..s + n]);
        return;
    }

    for i in 0..len {
        set_bit(dst, dst_bit + i, get_bit(src, src_bit + i));
    }
}

/// Count the zero bits within `bits`
pub fn count_zero_bits(buf: &[u8], bits: Range<usize>) -> u32 {
    let mut zeros = 0;
    let mut bit = bits.start;

    // Unaligned head
    while bit < bits.end && bit % 8 != 0 {
        zeros += u32::from(!get_bit(buf, bit));
        bit += 1;
    }

    // Whole bytes
    while bit + 8 <= bits.end {
        zeros += buf[bit / 8].count_zeros();
        bit += 8;
    }

    // Tail
    while bit < bits.end {
        zeros += u32::from(!get_bit(buf, bit));
        bit += 1;
    }

    zeros
}

/// Count the bit positions within `bits` where `a` and `b` differ
pub fn count_differences(a: &[u8], b: &[u8], bits: Range<usize>) -> u32 {
    bits.filter(|&bit| get_bit(a, bit) != get_bit(b, bit))
        .count() as u32
}

#[test]
fn test_copy_bits() {
    let src = [0b1010_1100u8, 0b0000_1111];
    let mut dst = [0xFFu8; 2];

    copy_bits(&src, 2, &mut dst, 4, 8);
    // Bits 2..10 of src are 1,1,0,1,0,1,1,1 (LSB-first)
    assert_eq!(dst, [0b1011_1111, 0b1111_1110]);

    let mut aligned = [0u8; 2];
    copy_bits(&src, 0, &mut aligned, 0, 16);
    assert_eq!(aligned, src);
}

#[test]
fn test_count_zero_bits() {
    let buf = [0x0Fu8, 0xFF, 0x00, 0xFE];
    assert_eq!(count_zero_bits(&buf, 0..32), 4 + 0 + 8 + 1);
    assert_eq!(count_zero_bits(&buf, 2..6), 2);
    assert_eq!(count_zero_bits(&buf, 20..25), 4 + 1);
    assert_eq!(count_zero_bits(&buf, 8..8), 0);
}

#[test]
fn test_count_differences() {
    let a = [0xF0u8, 0x00];
    let b = [0x0Fu8, 0x01];
    assert_eq!(count_differences(&a, &b, 0..16), 9);
    assert_eq!(count_differences(&a, &b, 4..8), 4);
}
