//! Page, ECC and OOB layout planning.
//!
//! The BCH engine splits each page into 512-byte chunks and protects each one with `13 * t` bits
//! of parity, where `t` is the number of correctable bits per chunk. On the array, a page is a
//! single bit stream (LSB-first, see [crate::bits]):
//!
//! ```text
//! +----------+---------+----------+---------+----------+     +-----------+----------+--------+
//! | metadata | chunk 0 | parity 0 | chunk 1 | parity 1 | ... | chunk N-1 | parity N-1 | unused |
//! +----------+---------+----------+---------+----------+     +-----------+----------+--------+
//! ```
//!
//! Chunk 0's correction domain also covers the metadata. Software above the driver sees a
//! different, "logical" arrangement: `page_size` bytes of data followed by `oob_size` bytes of
//! OOB, where the OOB holds the metadata, then each chunk's parity rounded up to whole bytes.
//!
//! Because parity bits are interleaved with the data, the byte that sits at the start of the
//! physical spare area (where factory bad-block markers live) is, from the ECC engine's point of
//! view, somewhere inside the last chunks' data. [FlashGeometry::block_mark_bit_offset] locates
//! it.

use std::ops::Range;

use crate::bits;
use crate::error::GeometryError;

/// Size of a data chunk protected by one BCH codeword
pub const CHUNK_SIZE: usize = 512;

/// Parity bits needed per correctable bit, i.e. the order of the Galois field
pub const GF_BITS: usize = 13;

/// Offset of the bad-block marker within the metadata (and thus the logical OOB)
pub const MARKER_OFFSET: usize = 0;

/// One row of the documented layout table
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct LayoutEntry {
    pub page_size: usize,
    pub oob_size: usize,
    pub strength: u32,
    pub ecc_bytes_per_chunk: usize,
    pub metadata_size: usize,
    pub oob_free_offset: usize,
    pub oob_free_length: usize,
}

const fn entry(
    page_size: usize,
    oob_size: usize,
    strength: u32,
    ecc_bytes_per_chunk: usize,
    metadata_size: usize,
) -> LayoutEntry {
    LayoutEntry {
        page_size,
        oob_size,
        strength,
        ecc_bytes_per_chunk,
        metadata_size,
        oob_free_offset: MARKER_OFFSET + 1,
        oob_free_length: metadata_size - MARKER_OFFSET - 1,
    }
}

/// Every (page size, OOB size, strength) combination the controller family supports.
pub const LAYOUT_TABLE: [LayoutEntry; 8] = [
    entry(2048, 64, 2, 4, 16),
    entry(2048, 64, 4, 7, 16),
    entry(2048, 64, 8, 13, 10),
    entry(4096, 224, 12, 20, 32),
    entry(4096, 224, 16, 26, 10),
    entry(8192, 640, 24, 39, 10),
    entry(8192, 1216, 32, 52, 32),
    entry(8192, 1216, 40, 65, 32),
];

/// The complete layout of one page, computed once when the device is probed
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FlashGeometry {
    pub page_size: usize,
    pub oob_size: usize,
    pub chunk_size: usize,
    pub chunk_count: usize,
    pub ecc_strength: u32,
    pub ecc_bits_per_chunk: usize,
    pub ecc_bytes_per_chunk: usize,
    pub metadata_size: usize,
    /// Bit offset (within the data area, as the ECC engine sees it) of the physical marker byte
    pub block_mark_bit_offset: u32,
    pub oob_free_offset: usize,
    pub oob_free_length: usize,
}

/// Compute the bit offset of the physical bad-block marker within the data area.
///
/// Returns `None` if the marker byte does not fall entirely within some chunk's data region.
pub fn mark_bit_offset(page_size: usize, metadata_size: usize, strength: u32) -> Option<u32> {
    let chunk_data_bits = CHUNK_SIZE * 8;
    let chunk_ecc_bits = GF_BITS * strength as usize;
    let chunk_total_bits = chunk_data_bits + chunk_ecc_bits;

    // Where the marker lives in the physical page, minus the metadata that precedes the chunks
    let offset = (page_size * 8).checked_sub(metadata_size * 8)?;

    let chunk = offset / chunk_total_bits;
    let chunk_bit_offset = offset - chunk * chunk_total_bits;
    if chunk_bit_offset + 8 > chunk_data_bits {
        return None;
    }

    // Drop the parity of all preceding chunks, which the ECC engine strips from the data view
    (offset - chunk * chunk_ecc_bits).try_into().ok()
}

impl FlashGeometry {
    /// Plan the layout for the given device parameters and ECC strength
    pub fn plan(page_size: usize, oob_size: usize, strength: u32) -> Result<Self, GeometryError> {
        let unsupported = GeometryError::Unsupported {
            page_size,
            oob_size,
            strength,
        };

        let entry = LAYOUT_TABLE
            .iter()
            .find(|x| (x.page_size, x.oob_size, x.strength) == (page_size, oob_size, strength))
            .ok_or(unsupported)?;

        let block_mark_bit_offset = mark_bit_offset(page_size, entry.metadata_size, strength)
            .ok_or(unsupported)?;

        Ok(Self {
            page_size,
            oob_size,
            chunk_size: CHUNK_SIZE,
            chunk_count: page_size / CHUNK_SIZE,
            ecc_strength: strength,
            ecc_bits_per_chunk: GF_BITS * strength as usize,
            ecc_bytes_per_chunk: entry.ecc_bytes_per_chunk,
            metadata_size: entry.metadata_size,
            block_mark_bit_offset,
            oob_free_offset: entry.oob_free_offset,
            oob_free_length: entry.oob_free_length,
        })
    }

    /// Plan the layout using the strongest ECC the table offers for this page/OOB size
    pub fn plan_strongest(page_size: usize, oob_size: usize) -> Result<Self, GeometryError> {
        let strength = LAYOUT_TABLE
            .iter()
            .filter(|x| (x.page_size, x.oob_size) == (page_size, oob_size))
            .map(|x| x.strength)
            .max()
            .ok_or(GeometryError::Unsupported {
                page_size,
                oob_size,
                strength: 0,
            })?;

        Self::plan(page_size, oob_size, strength)
    }

    /// Size of the whole page as stored on the array
    pub fn raw_page_size(&self) -> usize {
        self.page_size + self.oob_size
    }

    /// Byte offset of the marker byte in a buffer holding data followed by OOB/metadata
    pub fn marker_offset(&self) -> usize {
        self.page_size + MARKER_OFFSET
    }

    /// Byte offset of the marker within the data area, as the ECC engine sees it
    pub fn block_mark_byte_offset(&self) -> usize {
        (self.block_mark_bit_offset / 8) as usize
    }

    fn chunk_stride_bits(&self) -> usize {
        self.chunk_size * 8 + self.ecc_bits_per_chunk
    }

    /// Bits of the raw page occupied by the metadata
    pub fn metadata_bits(&self) -> Range<usize> {
        0..self.metadata_size * 8
    }

    /// Bits of the raw page occupied by the data of chunk `chunk`
    pub fn chunk_data_bits(&self, chunk: usize) -> Range<usize> {
        let start = self.metadata_size * 8 + chunk * self.chunk_stride_bits();
        start..start + self.chunk_size * 8
    }

    /// Bits of the raw page occupied by the parity of chunk `chunk`
    pub fn chunk_ecc_bits(&self, chunk: usize) -> Range<usize> {
        let start = self.chunk_data_bits(chunk).end;
        start..start + self.ecc_bits_per_chunk
    }

    /// Bytes of the logical OOB holding ECC parity
    pub fn oob_ecc_range(&self) -> Range<usize> {
        self.metadata_size..self.metadata_size + self.chunk_count * self.ecc_bytes_per_chunk
    }

    /// Bytes of the logical OOB the upper layers may use
    pub fn oob_free_range(&self) -> Range<usize> {
        self.oob_free_offset..self.oob_free_offset + self.oob_free_length
    }

    /// Build the raw page image from data and logical OOB.
    ///
    /// Bits not covered by the layout are set to one.
    pub fn interleave(&self, data: &[u8], oob: &[u8], raw: &mut [u8]) {
        raw.fill(0xFF);
        bits::copy_bits(oob, 0, raw, 0, self.metadata_size * 8);

        for chunk in 0..self.chunk_count {
            let data_bits = self.chunk_data_bits(chunk);
            bits::copy_bits(
                data,
                chunk * self.chunk_size * 8,
                raw,
                data_bits.start,
                data_bits.len(),
            );

            let ecc_bits = self.chunk_ecc_bits(chunk);
            let parity_byte = self.metadata_size + chunk * self.ecc_bytes_per_chunk;
            bits::copy_bits(oob, parity_byte * 8, raw, ecc_bits.start, ecc_bits.len());
        }
    }

    /// Split a raw page image into data and logical OOB
    pub fn deinterleave(&self, raw: &[u8], data: &mut [u8], oob: &mut [u8]) {
        oob.fill(0xFF);
        bits::copy_bits(raw, 0, oob, 0, self.metadata_size * 8);

        for chunk in 0..self.chunk_count {
            let data_bits = self.chunk_data_bits(chunk);
            bits::copy_bits(
                raw,
                data_bits.start,
                data,
                chunk * self.chunk_size * 8,
                data_bits.len(),
            );

            let ecc_bits = self.chunk_ecc_bits(chunk);
            let parity_byte = self.metadata_size + chunk * self.ecc_bytes_per_chunk;
            bits::copy_bits(raw, ecc_bits.start, oob, parity_byte * 8, ecc_bits.len());
        }
    }
}

#[test]
fn test_table_consistency() -> anyhow::Result<()> {
    for entry in LAYOUT_TABLE {
        let geo = FlashGeometry::plan(entry.page_size, entry.oob_size, entry.strength)?;

        assert_eq!(geo.chunk_count * geo.chunk_size, geo.page_size);
        assert_eq!(
            geo.ecc_bytes_per_chunk,
            (geo.ecc_bits_per_chunk + 7) / 8,
            "{entry:?}"
        );

        // Everything must fit, both on the array and in the logical OOB
        let last = geo.chunk_ecc_bits(geo.chunk_count - 1);
        assert!(last.end <= geo.raw_page_size() * 8, "{entry:?}");
        assert!(geo.oob_ecc_range().end <= geo.oob_size, "{entry:?}");
        assert!(geo.oob_free_range().end <= geo.metadata_size, "{entry:?}");
    }
    Ok(())
}

#[test]
fn test_2k_page_8bit() -> anyhow::Result<()> {
    let geo = FlashGeometry::plan(2048, 64, 8)?;
    assert_eq!(geo.chunk_count, 4);
    assert_eq!(geo.ecc_bytes_per_chunk, 13);
    assert_eq!(geo.oob_free_range(), 1..10);
    assert_eq!(geo.block_mark_bit_offset, 15992);
    assert_eq!(geo.block_mark_byte_offset(), 1999);
    Ok(())
}

#[test]
fn test_unaligned_mark() -> anyhow::Result<()> {
    let geo = FlashGeometry::plan(2048, 64, 2)?;
    assert_eq!(geo.block_mark_bit_offset, 16178);
    assert_eq!(geo.block_mark_bit_offset % 8, 2);

    let geo = FlashGeometry::plan(4096, 224, 12)?;
    assert_eq!(geo.block_mark_bit_offset, 31420);
    Ok(())
}

#[test]
fn test_unsupported() {
    assert_eq!(
        FlashGeometry::plan(2048, 64, 16),
        Err(GeometryError::Unsupported {
            page_size: 2048,
            oob_size: 64,
            strength: 16
        })
    );
    assert!(FlashGeometry::plan(512, 16, 4).is_err());
    assert!(FlashGeometry::plan_strongest(2048, 128).is_err());

    // A codeword so large the marker lands in chunk 0's parity
    assert_eq!(mark_bit_offset(1024, 10, 310), None);
}

#[test]
fn test_plan_strongest() -> anyhow::Result<()> {
    assert_eq!(FlashGeometry::plan_strongest(2048, 64)?.ecc_strength, 8);
    assert_eq!(FlashGeometry::plan_strongest(8192, 1216)?.ecc_strength, 40);
    Ok(())
}

#[test]
fn test_interleave() -> anyhow::Result<()> {
    let geo = FlashGeometry::plan(2048, 64, 2)?;

    let data: Vec<u8> = (0..geo.page_size).map(|i| (i * 7) as u8).collect();
    let mut oob = vec![0xFFu8; geo.oob_size];
    for (i, byte) in oob[..geo.oob_ecc_range().end].iter_mut().enumerate() {
        *byte = (i * 13) as u8;
    }
    // Parity slots are 26 bits wide; the pad bits of the last byte in each slot read back as 1
    for chunk in 0..geo.chunk_count {
        let last = geo.metadata_size + (chunk + 1) * geo.ecc_bytes_per_chunk - 1;
        oob[last] |= 0xFC;
    }

    let mut raw = vec![0u8; geo.raw_page_size()];
    geo.interleave(&data, &oob, &mut raw);

    // The first chunk's data starts right after the metadata
    assert_eq!(&raw[geo.metadata_size..][..16], &data[..16]);

    let mut data_out = vec![0u8; geo.page_size];
    let mut oob_out = vec![0u8; geo.oob_size];
    geo.deinterleave(&raw, &mut data_out, &mut oob_out);
    assert_eq!(data_out, data);
    assert_eq!(oob_out, oob);
    Ok(())
}
