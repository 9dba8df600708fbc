//! The ONFI parameter page, which describes the organization of a chip.

use crc::{Algorithm, Crc, CRC_16_UMTS};
use deku::prelude::*;

use crate::error::NandError;
use crate::nand::NandLayout;

pub const PARAM_PAGE_SIZE: usize = 256;

pub const ONFI_SIGNATURE: [u8; 4] = *b"ONFI";

/// CRC-16 with polynomial 0x8005, seeded with "ON"
const CRC_16_ONFI: Algorithm<u16> = Algorithm {
    init: 0x4F4E,
    ..CRC_16_UMTS
};
pub const ONFI_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_ONFI);

/// Bytes covered by the CRC
const CRC_COVERAGE: usize = PARAM_PAGE_SIZE - std::mem::size_of::<u16>();

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct ParamPage {
    pub signature: [u8; 4],
    pub revision: u16,
    pub features: u16,
    pub optional_commands: u16,
    reserved0: [u8; 22],

    pub manufacturer: [u8; 12],
    pub model: [u8; 20],
    pub jedec_id: u8,
    pub date_code: u16,
    reserved1: [u8; 13],

    pub bytes_per_page: u32,
    pub spare_bytes_per_page: u16,
    pub bytes_per_partial_page: u32,
    pub spare_bytes_per_partial_page: u16,
    pub pages_per_block: u32,
    pub blocks_per_lun: u32,
    pub lun_count: u8,
    pub address_cycles: u8,
    pub bits_per_cell: u8,
    pub max_bad_blocks_per_lun: u16,
    pub block_endurance: u16,
    pub guaranteed_good_blocks: u8,
    pub guaranteed_block_endurance: u16,
    pub programs_per_page: u8,
    pub partial_program_attributes: u8,
    pub ecc_bits: u8,
    pub interleaved_address_bits: u8,
    pub interleaved_attributes: u8,
    reserved2: [u8; 13],

    pub io_pin_capacitance: u8,
    pub async_timing_mode: u16,
    pub program_cache_timing_mode: u16,
    /// Maximum page program time, microseconds
    pub t_prog: u16,
    /// Maximum block erase time, microseconds
    pub t_bers: u16,
    /// Maximum page read time, microseconds
    pub t_r: u16,
    pub t_ccs: u16,
    reserved3: [u8; 113],

    pub crc: u16,
}

impl ParamPage {
    /// Describe a single-LUN SLC chip
    pub fn new(model: &str, layout: NandLayout, oob_size: u16, ecc_bits: u8) -> Self {
        let mut model_field = [b' '; 20];
        let len = model.len().min(model_field.len());
        model_field[..len].copy_from_slice(&model.as_bytes()[..len]);

        let mut page = Self {
            signature: ONFI_SIGNATURE,
            revision: 1 << 1,
            features: 0,
            optional_commands: 0,
            reserved0: [0; 22],
            manufacturer: *b"SIMULATED   ",
            model: model_field,
            jedec_id: 0x2C,
            date_code: 0,
            reserved1: [0; 13],
            bytes_per_page: layout.bytes_per_page as u32,
            spare_bytes_per_page: oob_size,
            bytes_per_partial_page: layout.bytes_per_page as u32 / 4,
            spare_bytes_per_partial_page: oob_size / 4,
            pages_per_block: layout.pages_per_block,
            blocks_per_lun: layout.blocks,
            lun_count: 1,
            address_cycles: 0x23,
            bits_per_cell: 1,
            max_bad_blocks_per_lun: (layout.blocks / 50) as u16,
            block_endurance: 0x0501,
            guaranteed_good_blocks: 1,
            guaranteed_block_endurance: 0,
            programs_per_page: 4,
            partial_program_attributes: 0,
            ecc_bits,
            interleaved_address_bits: 0,
            interleaved_attributes: 0,
            reserved2: [0; 13],
            io_pin_capacitance: 10,
            async_timing_mode: 0x3F,
            program_cache_timing_mode: 0,
            t_prog: 600,
            t_bers: 3000,
            t_r: 25,
            t_ccs: 100,
            reserved3: [0; 113],
            crc: 0,
        };
        page.crc = page.compute_crc();
        page
    }

    /// Parse and validate a parameter page read from a chip
    pub fn parse(buf: &[u8]) -> Result<Self, NandError> {
        if buf.len() < PARAM_PAGE_SIZE {
            return Err(NandError::InvalidBuffer {
                what: "parameter page",
                expected: PARAM_PAGE_SIZE,
                actual: buf.len(),
            });
        }

        let (_, page) = Self::from_bytes((buf, 0))
            .map_err(|e| NandError::Probe(format!("malformed parameter page: {e}")))?;

        if page.signature != ONFI_SIGNATURE {
            return Err(NandError::Probe("no ONFI signature".into()));
        }

        let expected = ONFI_CRC.checksum(&buf[..CRC_COVERAGE]);
        if page.crc != expected {
            return Err(NandError::Probe(format!(
                "parameter page CRC {:#06x}, expected {expected:#06x}",
                page.crc
            )));
        }

        Ok(page)
    }

    pub fn compute_crc(&self) -> u16 {
        let bytes = self.to_bytes().unwrap_or_default();
        ONFI_CRC.checksum(&bytes[..CRC_COVERAGE.min(bytes.len())])
    }

    /// The block-level organization of one chip
    pub fn layout(&self) -> NandLayout {
        NandLayout {
            blocks: self.blocks_per_lun * u32::from(self.lun_count),
            pages_per_block: self.pages_per_block,
            bytes_per_page: self.bytes_per_page as usize,
        }
    }

    pub fn oob_size(&self) -> usize {
        self.spare_bytes_per_page.into()
    }

    pub fn model(&self) -> String {
        String::from_utf8_lossy(&self.model).trim_end().to_string()
    }
}

#[cfg(test)]
const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 1024,
    pages_per_block: 64,
    bytes_per_page: 2048,
};

#[test]
fn test_param_page() -> anyhow::Result<()> {
    let page = ParamPage::new("MT29F2G08", TEST_LAYOUT, 64, 8);
    let bytes = page.to_bytes()?;
    assert_eq!(bytes.len(), PARAM_PAGE_SIZE);
    assert_eq!(&bytes[..4], b"ONFI");
    assert_eq!(u32::from_le_bytes(bytes[80..84].try_into()?), 2048);
    assert_eq!(u32::from_le_bytes(bytes[92..96].try_into()?), 64);
    assert_eq!(bytes[112], 8);

    let parsed = ParamPage::parse(&bytes)?;
    assert_eq!(parsed, page);
    assert_eq!(parsed.model(), "MT29F2G08");
    assert_eq!(parsed.oob_size(), 64);
    assert_eq!(parsed.layout().blocks, 1024);
    Ok(())
}

#[test]
fn test_param_page_corrupt() -> anyhow::Result<()> {
    let page = ParamPage::new("MT29F2G08", TEST_LAYOUT, 64, 8);
    let mut bytes = page.to_bytes()?;

    bytes[100] ^= 0x04;
    assert!(matches!(ParamPage::parse(&bytes), Err(NandError::Probe(_))));

    bytes[100] ^= 0x04;
    bytes[0] = b'X';
    assert!(matches!(ParamPage::parse(&bytes), Err(NandError::Probe(_))));

    assert!(matches!(
        ParamPage::parse(&bytes[..128]),
        Err(NandError::InvalidBuffer { .. })
    ));
    Ok(())
}
