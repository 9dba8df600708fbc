//! Bad-block markers and the refresh tag.
//!
//! A block is bad when the first byte of the physical spare area of its first page is anything
//! but `0xFF`. Marking and checking go straight to that byte with raw, single-byte transfers: the
//! [BlockMarkCodec](crate::block_mark::BlockMarkCodec) is only for full pages.
//!
//! With the refresh tag enabled, the last four bytes of each page's free OOB hold the number of
//! the block the page was copied from (little-endian, all ones for none). The driver only stores
//! and returns it; deciding when to relocate is up to the caller.

use std::ops::Range;

use log::{info, warn};

use crate::command::{Payload, PendingSetup};
use crate::controller::Controller;
use crate::error::{NandError, Result};
use crate::geometry::FlashGeometry;
use crate::hw::NandHardware;

pub const REFRESH_TAG_LEN: usize = 4;

const NO_ORIGIN: u32 = u32::MAX;

/// What is known about one block
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum BlockState {
    #[default]
    Unknown,
    Good,
    Bad,
}

/// Metadata bytes holding the refresh tag
pub fn refresh_tag_range(geometry: &FlashGeometry) -> Range<usize> {
    let free = geometry.oob_free_range();
    free.end - REFRESH_TAG_LEN..free.end
}

/// Metadata bytes available to callers
pub fn user_oob_range(geometry: &FlashGeometry, refresh_tag: bool) -> Range<usize> {
    let free = geometry.oob_free_range();
    if refresh_tag {
        free.start..free.end - REFRESH_TAG_LEN
    } else {
        free
    }
}

/// Store `origin` in the refresh tag of a page's metadata
pub fn encode_refresh_tag(geometry: &FlashGeometry, metadata: &mut [u8], origin: Option<u32>) {
    let tag = origin.unwrap_or(NO_ORIGIN);
    metadata[refresh_tag_range(geometry)].copy_from_slice(&tag.to_le_bytes());
}

pub fn decode_refresh_tag(geometry: &FlashGeometry, metadata: &[u8]) -> Option<u32> {
    let bytes = metadata[refresh_tag_range(geometry)].try_into().ok()?;
    Some(u32::from_le_bytes(bytes)).filter(|&x| x != NO_ORIGIN)
}

impl<H: NandHardware> Controller<H> {
    /// Mark a block bad by clearing its marker byte.
    ///
    /// The block is recorded as bad even if the chip reports the program as failed.
    pub fn mark_bad(&mut self, block: u32) -> Result<()> {
        self.check_block(block)?;
        warn!("marking block {block} bad");
        self.bbt[block as usize] = BlockState::Bad;

        let ps = self.geometry.page_size;
        let page = block * self.chip_layout.pages_per_block;
        self.with_chip(page, |ctrl, row| {
            ctrl.ecc.enable_for_raw(&mut ctrl.hw);
            ctrl.scratch[ps] = 0x00;
            ctrl.sequencer.setup_program(
                &mut ctrl.hw,
                &mut ctrl.scratch,
                PendingSetup::SeqIn {
                    column: ps as u16,
                    row,
                },
                Payload::spare(ps..ps + 1),
            )?;
            ctrl.sequencer.trigger_program(&mut ctrl.hw, &mut ctrl.scratch)
        })
    }

    /// Check a block's marker, consulting the bad-block table first
    pub fn is_bad(&mut self, block: u32) -> Result<bool> {
        self.check_block(block)?;
        match self.bbt[block as usize] {
            BlockState::Good => return Ok(false),
            BlockState::Bad => return Ok(true),
            BlockState::Unknown => (),
        }

        let ps = self.geometry.page_size;
        let page = block * self.chip_layout.pages_per_block;
        let marker = self.with_chip(page, |ctrl, row| {
            ctrl.ecc.enable_for_raw(&mut ctrl.hw);
            ctrl.sequencer.read(
                &mut ctrl.hw,
                &mut ctrl.scratch,
                ps as u16,
                row,
                &Payload::spare(ps..ps + 1),
            )?;
            Ok(ctrl.scratch[ps])
        })?;

        let bad = marker != 0xFF;
        if bad {
            info!("block {block} is marked bad ({marker:#04x})");
        }
        self.bbt[block as usize] = if bad {
            BlockState::Bad
        } else {
            BlockState::Good
        };
        Ok(bad)
    }

    /// Check the marker of every block, returning the bad ones
    pub fn scan_bad_blocks(&mut self) -> Result<Vec<u32>> {
        let blocks = self.layout().blocks;
        let rpt = howudoin::new()
            .label("Scanning for bad blocks")
            .set_len(u64::from(blocks));

        let mut bad = Vec::new();
        for block in 0..blocks {
            if self.is_bad(block)? {
                bad.push(block);
            }
            rpt.inc();
        }

        rpt.close();
        Ok(bad)
    }

    /// Forget all cached marker checks
    pub fn forget_bad_blocks(&mut self) {
        self.bbt.fill(BlockState::Unknown);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::command::opcode;
    use crate::controller::test::{test_controller, test_data};
    use crate::controller::PageData;
    use crate::nand::sim::BusEvent;

    #[test]
    fn test_refresh_tag_layout() -> anyhow::Result<()> {
        let geo = FlashGeometry::plan(2048, 64, 8)?;
        assert_eq!(refresh_tag_range(&geo), 6..10);
        assert_eq!(user_oob_range(&geo, true), 1..6);
        assert_eq!(user_oob_range(&geo, false), 1..10);

        let mut metadata = [0xFFu8; 10];
        encode_refresh_tag(&geo, &mut metadata, Some(0x0102));
        assert_eq!(metadata[6..], [0x02, 0x01, 0x00, 0x00]);
        assert_eq!(decode_refresh_tag(&geo, &metadata), Some(0x0102));

        encode_refresh_tag(&geo, &mut metadata, None);
        assert_eq!(metadata, [0xFF; 10]);
        assert_eq!(decode_refresh_tag(&geo, &metadata), None);
        Ok(())
    }

    #[test]
    fn test_mark_bad() -> anyhow::Result<()> {
        let mut ctrl = test_controller(Default::default())?;
        let ps = ctrl.geometry().page_size;
        let first_page = 2 * ctrl.layout().pages_per_block;

        ctrl.write_page(first_page, PageData::new(&test_data(0)))?;
        let before = ctrl.hardware().cells(0, first_page).unwrap().to_vec();
        ctrl.hardware_mut().take_trace();

        ctrl.mark_bad(2)?;
        ctrl.mark_bad(2)?;

        // Only the marker byte changed; no full-page transfer took place
        let after = ctrl.hardware().cells(0, first_page).unwrap();
        assert_eq!(after[ps], 0x00);
        assert_eq!(after[..ps], before[..ps]);
        assert_eq!(after[ps + 1..], before[ps + 1..]);

        let trace = ctrl.hardware_mut().take_trace();
        assert!(trace.contains(&BusEvent::Column(ps as u16)));
        assert!(trace
            .iter()
            .all(|x| !matches!(x, BusEvent::DataOut { len, .. } if *len != 1)));
        assert!(!trace.contains(&BusEvent::Command(opcode::ERASE1)));

        assert!(ctrl.is_bad(2)?);
        assert!(matches!(
            ctrl.erase_block(2),
            Err(NandError::BadBlockMarked(2))
        ));
        Ok(())
    }

    #[test]
    fn test_is_bad() -> anyhow::Result<()> {
        let mut ctrl = test_controller(Default::default())?;
        ctrl.hardware_mut().factory_bad(0, 5)?;

        // A written block is not bad: the marker position holds the marker, not data
        ctrl.write_page(0, PageData::new(&vec![0x00; ctrl.geometry().page_size]))?;
        assert!(!ctrl.is_bad(0)?);
        assert!(ctrl.is_bad(5)?);

        // The answer is cached
        ctrl.hardware_mut().take_trace();
        assert!(ctrl.is_bad(5)?);
        assert!(ctrl.hardware_mut().take_trace().is_empty());

        ctrl.forget_bad_blocks();
        assert!(ctrl.is_bad(5)?);
        Ok(())
    }

    #[test]
    fn test_scan() -> anyhow::Result<()> {
        let mut ctrl = test_controller(Default::default())?;
        ctrl.hardware_mut().factory_bad(0, 3)?;
        ctrl.hardware_mut().factory_bad(0, 11)?;
        ctrl.mark_bad(7)?;

        assert_eq!(ctrl.scan_bad_blocks()?, [3, 7, 11]);
        Ok(())
    }
}
