//! Bad-block marker relocation.
//!
//! Factory bad-block markers live in the first byte of the physical spare area. With the BCH
//! layout, that byte lands somewhere inside the data the ECC engine hands back (see
//! [crate::geometry]), not at OOB offset 0 where the upper layers look for it. Before every
//! full-page write the byte at that position is exchanged with metadata byte 0, and after every
//! full-page read the exchange is undone, so the marker stays on the array where a raw check
//! expects it.
//!
//! Bit positions follow the LSB-first convention of [crate::bits]: the relocated byte consists of
//! the high `8 - s` bits of data byte `n` followed by the low `s` bits of byte `n + 1`, where
//! `n = offset / 8` and `s = offset % 8`.

use crate::geometry::FlashGeometry;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BlockMarkCodec {
    byte_offset: usize,
    bit_shift: u32,
    marker_offset: usize,
}

impl BlockMarkCodec {
    pub fn new(geometry: &FlashGeometry) -> Self {
        Self {
            byte_offset: geometry.block_mark_byte_offset(),
            bit_shift: geometry.block_mark_bit_offset % 8,
            marker_offset: geometry.marker_offset(),
        }
    }

    /// Exchange the data byte overlaying the physical marker with the conventional marker byte.
    ///
    /// `buffer` holds the page data immediately followed by the metadata. Applying this twice
    /// restores the original buffer.
    pub fn swap(&self, buffer: &mut [u8]) {
        let n = self.byte_offset;
        let shift = self.bit_shift;

        let window = u16::from(buffer[n]) | u16::from(buffer[n + 1]) << 8;
        let relocated = (window >> shift) as u8;
        let marker = buffer[self.marker_offset];

        let mask = 0xFFu16 << shift;
        let window = (window & !mask) | u16::from(marker) << shift;

        buffer[n] = window as u8;
        buffer[n + 1] = (window >> 8) as u8;
        buffer[self.marker_offset] = relocated;
    }
}

#[cfg(test)]
fn test_pattern(len: usize, seed: usize) -> Vec<u8> {
    (0..len)
        .map(|i| ((i + seed).wrapping_mul(0x9E37_79B9) >> 11) as u8)
        .collect()
}

#[test]
fn test_swap_involution() -> anyhow::Result<()> {
    for entry in crate::geometry::LAYOUT_TABLE {
        let geo = FlashGeometry::plan(entry.page_size, entry.oob_size, entry.strength)?;
        let codec = BlockMarkCodec::new(&geo);

        for seed in 0..4 {
            let original = test_pattern(geo.page_size + geo.metadata_size, seed);
            let mut buf = original.clone();

            codec.swap(&mut buf);
            codec.swap(&mut buf);
            assert_eq!(buf, original, "{entry:?}");
        }
    }
    Ok(())
}

#[test]
fn test_swap_unaligned() -> anyhow::Result<()> {
    // 2 KiB page at strength 2: the marker overlays bits 2..10 of data bytes 2022-2023
    let geo = FlashGeometry::plan(2048, 64, 2)?;
    let codec = BlockMarkCodec::new(&geo);

    let mut buf = vec![0u8; geo.page_size + geo.metadata_size];
    buf[geo.marker_offset()] = 0xFF;
    buf[2022] = 0b0000_0001;
    buf[2023] = 0b1000_0000;

    codec.swap(&mut buf);
    assert_eq!(buf[geo.marker_offset()], 0x00);
    assert_eq!(buf[2022], 0b1111_1101);
    assert_eq!(buf[2023], 0b1000_0011);

    // Nothing else moved
    assert!(buf[..2022].iter().all(|&x| x == 0));
    assert!(buf[2024..geo.marker_offset()].iter().all(|&x| x == 0));

    codec.swap(&mut buf);
    assert_eq!(buf[geo.marker_offset()], 0xFF);
    assert_eq!(buf[2022], 0b0000_0001);
    assert_eq!(buf[2023], 0b1000_0000);
    Ok(())
}

#[test]
fn test_swap_aligned() -> anyhow::Result<()> {
    let geo = FlashGeometry::plan(2048, 64, 8)?;
    let codec = BlockMarkCodec::new(&geo);

    let mut buf = vec![0x11u8; geo.page_size + geo.metadata_size];
    buf[1999] = 0xA5;
    buf[geo.marker_offset()] = 0xFF;

    codec.swap(&mut buf);
    assert_eq!(buf[1999], 0xFF);
    assert_eq!(buf[2000], 0x11);
    assert_eq!(buf[geo.marker_offset()], 0xA5);
    Ok(())
}
