//! Raw blobs spread over consecutive good blocks.
//!
//! Blocks that come back bad are skipped, so an image occupies its length rounded up to whole
//! blocks plus however many bad blocks it had to step over. Writing is idempotent: a block that
//! already holds its share of the image is left alone, and one that was partially programmed is
//! resumed where it left off.

use std::io::{Read, Write};

use log::{debug, warn};

use crate::nand::{Nand, NandBlock, PageUtil};

/// How many times a block is erased and rewritten before it is retired
const WRITE_ATTEMPTS: usize = 5;

/// Scan a block to confirm that its contents match the provided slice.
///
/// The provided slice should be no longer than the block contents. If it is shorter, the remaining
/// bytes are "don't care."
///
/// The return value is the number of pages of the block that match (and therefore the index of the
/// page where write can start), or None if there is no partial match and the block must be erased.
fn check_raw_block<B: NandBlock>(block: &mut B, mut data: &[u8]) -> Option<u32> {
    // Pages read per request
    const PAGE_CHUNKS: u32 = 8;

    let page_size = block.page_size();
    let page_count = block.page_count();
    let mut buf = vec![0; page_size * PAGE_CHUNKS as usize];
    let mut filled = 0;
    let mut offset = 0;

    let mut page: u32 = 0;
    let mut data_correct_upto: Option<u32> = None;
    loop {
        if data_correct_upto.is_none() && data.is_empty() {
            // No mismatch and nothing left to compare
            break Some(page);
        }

        if offset == filled {
            let pages = PAGE_CHUNKS.min(page_count - page);
            if pages == 0 {
                break data_correct_upto;
            }

            filled = page_size * pages as usize;
            offset = 0;
            if block.read(page, &mut buf[..filled]).is_err() {
                // Unreadable means it needs an erase
                break None;
            }
        }

        let page_content = &buf[offset..offset + page_size];
        offset += page_size;

        if data_correct_upto.is_none() {
            let cmp_len = page_content.len().min(data.len());
            if page_content[..cmp_len] == data[..cmp_len] {
                data = &data[cmp_len..];
            } else {
                // From here on every page must be erased for the write to resume
                data_correct_upto = Some(page);
            }
        }

        if data_correct_upto.is_some() && !page_content.is_erased() {
            break None;
        }

        page += 1;
    }
}

/// Bring a block's contents up to date, resuming from a partial write if possible.
///
/// Returns whether anything had to be written.
fn update_raw_block<B: NandBlock>(block: &mut B, data: &[u8]) -> anyhow::Result<bool> {
    let start_page = match check_raw_block(block, data) {
        None => {
            block.erase()?;
            0
        }
        Some(x) => x,
    };

    let page_size = block.page_size();
    let start = (start_page as usize * page_size).min(data.len());
    if start == data.len() {
        return Ok(false);
    }

    // Pad the tail to whole pages
    let mut tail = data[start..].to_vec();
    let padded = (tail.len() + page_size - 1) / page_size * page_size;
    tail.resize(padded, 0xFF);

    block.program(start_page, &tail)?;
    Ok(true)
}

/// Write a raw blob to good blocks starting at `start_block`.
///
/// A block that keeps failing to take its data is marked bad and the data moves on to the next
/// good block. Returns the index of the first block after the image.
pub fn write_skip_bad<N: Nand, R: Read>(
    nand: &mut N,
    image: &mut R,
    start_block: u32,
) -> anyhow::Result<u32> {
    let block_size = nand.get_layout().block_size();
    let rpt = howudoin::new().label("Writing image");

    let mut data = Vec::with_capacity(block_size);
    let mut block_index = start_block;
    loop {
        data.clear();
        image.by_ref().take(block_size as u64).read_to_end(&mut data)?;
        if data.is_empty() {
            break;
        }

        'find_block_and_write: loop {
            let index = block_index;
            block_index += 1;

            let Some(mut block) = nand.block(index)? else {
                rpt.add_info(format!("Skipping bad block {index}"));
                continue;
            };

            for attempt in 1..=WRITE_ATTEMPTS {
                let err = match update_raw_block(&mut block, &data) {
                    Ok(written) => {
                        debug!("block {index}: {}", if written { "written" } else { "up to date" });
                        break 'find_block_and_write;
                    }
                    Err(e) => e,
                };

                warn!("block {index}: write attempt {attempt} failed: {err:#}");
                if let Err(e) = block.erase() {
                    warn!("block {index}: erase failed: {e:#}");
                    break;
                }
            }

            rpt.add_info(format!("Retiring block {index}"));
            if let Err(e) = block.mark_bad() {
                // Already recorded as bad; only the marker byte may not have stuck
                warn!("block {index}: marking bad failed: {e:#}");
            }
        }

        rpt.inc();
    }

    rpt.close();
    Ok(block_index)
}

/// Read `len` bytes of a blob written by [write_skip_bad] into `out`.
///
/// Returns the index of the first block after the blob.
pub fn read_skip_bad<N: Nand, W: Write>(
    nand: &mut N,
    start_block: u32,
    len: usize,
    out: &mut W,
) -> anyhow::Result<u32> {
    let block_size = nand.get_layout().block_size();
    let mut buf = vec![0u8; block_size];
    let mut remaining = len;
    let mut block_index = start_block;

    while remaining > 0 {
        let index = block_index;
        block_index += 1;

        let Some(mut block) = nand.block(index)? else {
            debug!("skipping bad block {index}");
            continue;
        };

        block.read(0, &mut buf)?;
        let take = remaining.min(block_size);
        out.write_all(&buf[..take])?;
        remaining -= take;
    }

    Ok(block_index)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::command::opcode;
    use crate::controller::test::test_controller;
    use crate::nand::sim::BusEvent;

    fn test_image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 23 + i / 2048) as u8).collect()
    }

    #[test]
    fn test_check_raw_block() -> anyhow::Result<()> {
        let mut nand = test_controller(Default::default())?;
        let page_size = nand.get_layout().bytes_per_page;
        let mut block = nand.block(0)?.unwrap();

        assert_eq!(check_raw_block(&mut block, &[]), Some(0));
        assert_eq!(check_raw_block(&mut block, &[0xFF, 0xFF]), Some(1));
        assert_eq!(check_raw_block(&mut block, &[0xFF, 0x7F]), Some(0));

        // 2 pages of data, 2 erased, 2 more of data
        let mut data: Vec<u8> = (0..page_size * 6)
            .map(|i| match i / page_size {
                0 | 1 => (i * 23) as u8,
                4 | 5 => (i * 11) as u8,
                _ => 0xFF,
            })
            .collect();

        // Program only the first 5 pages
        block.program(0, &data[..page_size * 5])?;

        assert_eq!(check_raw_block(&mut block, &data[..page_size]), Some(1));
        assert_eq!(check_raw_block(&mut block, &data[..page_size * 3]), Some(3));
        assert_eq!(check_raw_block(&mut block, &data), Some(5));

        data[page_size * 3] = 0x00;
        assert_eq!(check_raw_block(&mut block, &data), None);
        Ok(())
    }

    #[test]
    fn test_update_raw_block() -> anyhow::Result<()> {
        let mut nand = test_controller(Default::default())?;
        let mut block = nand.block(0)?.unwrap();

        assert!(!update_raw_block(&mut block, &[])?);
        assert!(update_raw_block(&mut block, &[0xAA])?);
        assert!(!update_raw_block(&mut block, &[0xAA])?);

        // A mismatch forces an erase and a full rewrite
        assert!(update_raw_block(&mut block, &[0x55])?);
        let mut page = vec![0; block.page_size()];
        block.read(0, &mut page)?;
        assert_eq!(page[0], 0x55);
        assert!(page[1..].is_erased());
        Ok(())
    }

    #[test]
    fn test_skip_bad() -> anyhow::Result<()> {
        let mut nand = test_controller(Default::default())?;
        let block_size = nand.get_layout().block_size();
        nand.hardware_mut().factory_bad(0, 3)?;

        // Two and a half blocks, starting at block 2
        let image = test_image(block_size * 5 / 2);
        assert_eq!(write_skip_bad(&mut nand, &mut &image[..], 2)?, 6);

        let mut out = Vec::new();
        assert_eq!(read_skip_bad(&mut nand, 2, image.len(), &mut out)?, 6);
        assert_eq!(out, image);

        // Block 3 was never touched
        let layout = nand.get_layout();
        let cells = nand.hardware().cells(0, 3 * layout.pages_per_block).unwrap();
        assert!(cells[..layout.bytes_per_page].is_erased());
        assert_eq!(cells[layout.bytes_per_page], 0x00);

        // Writing again is a no-op
        nand.hardware_mut().take_trace();
        write_skip_bad(&mut nand, &mut &image[..], 2)?;
        let trace = nand.hardware_mut().take_trace();
        assert!(!trace.contains(&BusEvent::Command(opcode::ERASE1)));
        assert!(!trace.contains(&BusEvent::Command(opcode::SEQIN)));
        Ok(())
    }

    #[test]
    fn test_retire_failing_block() -> anyhow::Result<()> {
        let mut nand = test_controller(Default::default())?;
        let block_size = nand.get_layout().block_size();
        nand.hardware_mut().fail_block(0, 1);

        let image = test_image(block_size * 2);
        assert_eq!(write_skip_bad(&mut nand, &mut &image[..], 0)?, 3);
        assert!(nand.is_bad(1)?);

        let mut out = Vec::new();
        read_skip_bad(&mut nand, 0, image.len(), &mut out)?;
        assert_eq!(out, image);
        Ok(())
    }

    #[test]
    fn test_read_past_end() -> anyhow::Result<()> {
        let mut nand = test_controller(Default::default())?;
        let layout = nand.get_layout();
        let mut out = Vec::new();
        assert!(read_skip_bad(&mut nand, layout.blocks - 1, layout.block_size() * 2, &mut out)
            .is_err());
        Ok(())
    }
}
