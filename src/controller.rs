//! The page I/O engine proper.
//!
//! A [Controller] owns everything a page operation needs: the hardware handle, the scratch buffer
//! that every transfer goes through, and the descriptor pool (inside its
//! [CommandSequencer]). All operations take `&mut self`, so at most one page buffer and one
//! descriptor chain are ever in use.
//!
//! Pages are addressed linearly across all chip-selects: page `n` lives on chip
//! `n / pages_per_chip` at row `n % pages_per_chip`.

use log::{debug, info, warn};

use crate::bbm::{self, BlockState};
use crate::block_mark::BlockMarkCodec;
use crate::command::{CommandSequencer, Payload, PendingSetup};
use crate::config::NandConfig;
use crate::ecc::{EccEngineAdapter, EccReport, EccStats};
use crate::error::{NandError, Result};
use crate::geometry::FlashGeometry;
use crate::hw::NandHardware;
use crate::nand::NandLayout;
use crate::onfi::{ParamPage, PARAM_PAGE_SIZE};

/// Bytes of READ ID response kept as the chip's identity
pub const ID_LEN: usize = 5;

/// Caller-supplied destination of one page read
#[derive(Debug)]
pub struct PageBuffer<'a> {
    /// Exactly one page of main data
    pub data: &'a mut [u8],

    /// Up to [Controller::user_oob_len] bytes of the free OOB region
    pub oob: &'a mut [u8],
}

/// Caller-supplied contents of one page write
#[derive(Debug, Clone, Copy)]
pub struct PageData<'a> {
    pub data: &'a [u8],
    pub oob: &'a [u8],

    /// Block this page's contents were copied from, stored when the refresh tag is enabled
    pub origin_block: Option<u32>,
}

impl<'a> PageData<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            oob: &[],
            origin_block: None,
        }
    }
}

/// What a successful page read found
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PageRead {
    pub ecc: EccReport,
    pub origin_block: Option<u32>,
}

pub struct Controller<H> {
    pub(crate) hw: H,
    pub(crate) config: NandConfig,
    pub(crate) geometry: FlashGeometry,
    pub(crate) chip_layout: NandLayout,
    pub(crate) chips: usize,
    id: Vec<u8>,

    /// Raw page image, as it crosses the bus
    pub(crate) scratch: Vec<u8>,

    /// Logical (deinterleaved) page image for raw access: data, then OOB
    logical: Vec<u8>,

    pub(crate) sequencer: CommandSequencer,
    pub(crate) ecc: EccEngineAdapter,
    codec: BlockMarkCodec,
    pub(crate) bbt: Vec<BlockState>,
}

fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(NandError::InvalidBuffer {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}

impl<H: NandHardware> Controller<H> {
    /// Set up a controller for `chips` identical chips of the given layout and geometry
    pub fn new(
        hw: H,
        config: NandConfig,
        geometry: FlashGeometry,
        layout: NandLayout,
        chips: usize,
    ) -> Result<Self> {
        check_len("layout page", geometry.page_size, layout.bytes_per_page)?;
        if chips == 0 {
            return Err(NandError::Probe("no chips".into()));
        }
        if layout.blocks == 0 || layout.pages_per_block == 0 {
            return Err(NandError::Probe(format!("empty layout {layout:?}")));
        }

        let threshold = config.bitflip_threshold.unwrap_or(geometry.ecc_strength);
        let blocks = layout.blocks as usize * chips;
        debug!(
            "{chips} chip(s) of {layout:?}, ECC strength {} (erased-page threshold {threshold})",
            geometry.ecc_strength
        );

        Ok(Self {
            sequencer: CommandSequencer::new(config.timeouts, config.poll_interval),
            ecc: EccEngineAdapter::new(&geometry, threshold),
            codec: BlockMarkCodec::new(&geometry),
            scratch: vec![0xFF; geometry.raw_page_size()],
            logical: vec![0xFF; geometry.raw_page_size()],
            bbt: vec![BlockState::Unknown; blocks],
            id: Vec::new(),
            hw,
            config,
            geometry,
            chip_layout: layout,
            chips,
        })
    }

    /// Identify the attached chips from their ONFI parameter page and set up a controller
    pub fn probe(mut hw: H, config: NandConfig) -> Result<Self> {
        let mut sequencer = CommandSequencer::new(config.timeouts, config.poll_interval);
        let mut scratch = vec![0u8; PARAM_PAGE_SIZE];

        hw.select_chip(Some(0));
        let first = Self::probe_chip(&mut hw, &mut sequencer, &mut scratch)
            .and_then(|(id, params)| Ok((id, ParamPage::parse(&params)?)));
        let (id, params) = match first {
            Ok(x) => x,
            Err(e) => {
                hw.select_chip(None);
                return Err(e);
            }
        };

        let mut chips = 1;
        while chips < config.max_chips {
            hw.select_chip(Some(chips));
            match Self::probe_chip(&mut hw, &mut sequencer, &mut scratch) {
                Ok((other, _)) if other == id => chips += 1,
                _ => break,
            }
        }
        hw.select_chip(None);

        info!(
            "found {chips} x {} (ID {id:02x?}): {}+{} byte pages, {} pages/block, {} blocks",
            params.model(),
            params.bytes_per_page,
            params.spare_bytes_per_page,
            params.pages_per_block,
            params.layout().blocks
        );

        let page_size = params.bytes_per_page as usize;
        let geometry = match config.ecc_strength {
            Some(strength) => FlashGeometry::plan(page_size, params.oob_size(), strength)?,
            None => FlashGeometry::plan_strongest(page_size, params.oob_size())?,
        };
        if geometry.ecc_strength < params.ecc_bits.into() {
            warn!(
                "ECC strength {} is below the {} bits the chip requires",
                geometry.ecc_strength, params.ecc_bits
            );
        }

        let mut controller = Self::new(hw, config, geometry, params.layout(), chips)?;
        controller.id = id;
        Ok(controller)
    }

    fn probe_chip(
        hw: &mut H,
        sequencer: &mut CommandSequencer,
        scratch: &mut [u8],
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        sequencer.reset(hw)?;
        let id = sequencer.read_id(hw, scratch, ID_LEN)?;
        let params = sequencer.read_param_page(hw, scratch, PARAM_PAGE_SIZE)?;
        Ok((id, params))
    }

    pub fn geometry(&self) -> &FlashGeometry {
        &self.geometry
    }

    /// The block-level layout across all chips
    pub fn layout(&self) -> NandLayout {
        NandLayout {
            blocks: self.chip_layout.blocks * self.chips as u32,
            ..self.chip_layout
        }
    }

    pub fn chips(&self) -> usize {
        self.chips
    }

    /// READ ID bytes of the first chip; empty if the controller was not probed
    pub fn identify(&self) -> &[u8] {
        &self.id
    }

    pub fn ecc_stats(&self) -> EccStats {
        self.ecc.stats()
    }

    pub fn config(&self) -> &NandConfig {
        &self.config
    }

    pub fn hardware(&self) -> &H {
        &self.hw
    }

    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    pub fn into_hardware(self) -> H {
        self.hw
    }

    /// Bytes of free OOB available to callers of [Controller::read_page]/[Controller::write_page]
    pub fn user_oob_len(&self) -> usize {
        bbm::user_oob_range(&self.geometry, self.config.refresh_tag).len()
    }

    /// Map a linear page number to (chip, row)
    pub(crate) fn locate(&self, page: u32) -> Result<(usize, u32)> {
        let pages_per_chip = self.chip_layout.pages();
        let chip = (page / pages_per_chip) as usize;
        if chip >= self.chips {
            return Err(NandError::OutOfRange {
                what: "page",
                index: page,
            });
        }
        Ok((chip, page % pages_per_chip))
    }

    pub(crate) fn check_block(&self, block: u32) -> Result<()> {
        if block as usize >= self.bbt.len() {
            return Err(NandError::OutOfRange {
                what: "block",
                index: block,
            });
        }
        Ok(())
    }

    /// Run `op` with the chip holding `page` selected
    pub(crate) fn with_chip<T>(
        &mut self,
        page: u32,
        op: impl FnOnce(&mut Self, u32) -> Result<T>,
    ) -> Result<T> {
        let (chip, row) = self.locate(page)?;
        self.hw.select_chip(Some(chip));
        let result = op(self, row);
        self.hw.select_chip(None);
        result
    }

    /// Read one page through the ECC engine.
    ///
    /// A page that fails correction is checked for being an erased page with a few stuck bits;
    /// if so, it reads as all ones.
    pub fn read_page(&mut self, page: u32, buf: PageBuffer) -> Result<PageRead> {
        check_len("page data", self.geometry.page_size, buf.data.len())?;
        if buf.oob.len() > self.user_oob_len() {
            return Err(NandError::InvalidBuffer {
                what: "page OOB",
                expected: self.user_oob_len(),
                actual: buf.oob.len(),
            });
        }

        let report = self.with_chip(page, |ctrl, row| ctrl.read_page_selected(page, row))?;

        let ps = self.geometry.page_size;
        let metadata = &self.scratch[ps..ps + self.geometry.metadata_size];
        let user = bbm::user_oob_range(&self.geometry, self.config.refresh_tag);
        let oob_len = buf.oob.len();
        buf.data.copy_from_slice(&self.scratch[..ps]);
        buf.oob.copy_from_slice(&metadata[user][..oob_len]);

        let origin_block = if self.config.refresh_tag {
            bbm::decode_refresh_tag(&self.geometry, metadata)
        } else {
            None
        };

        Ok(PageRead {
            ecc: report,
            origin_block,
        })
    }

    fn read_page_selected(&mut self, page: u32, row: u32) -> Result<EccReport> {
        let ps = self.geometry.page_size;
        let meta_end = ps + self.geometry.metadata_size;

        self.ecc.enable_for_read(&mut self.hw);
        self.sequencer.read(
            &mut self.hw,
            &mut self.scratch,
            0,
            row,
            &Payload::split(0..ps, ps..meta_end).with_ecc(),
        )?;
        let mut report = self.ecc.collect(&mut self.hw);

        let failed = report.uncorrectable_chunks();
        if failed == 0 {
            self.codec.swap(&mut self.scratch[..meta_end]);
        } else {
            debug!("page {page}: {failed} uncorrectable chunk(s), checking for erased page");
            match self.check_erased(row)? {
                Some(zeros) => {
                    self.ecc.mark_erased(&mut report, zeros);
                    self.scratch[..meta_end].fill(0xFF);
                }
                None => {
                    self.ecc.record(&report);
                    return Err(NandError::EccUncorrectable {
                        page,
                        chunks: failed,
                    });
                }
            }
        }

        self.ecc.record(&report);
        Ok(report)
    }

    fn check_erased(&mut self, row: u32) -> Result<Option<u32>> {
        self.read_raw_selected(row)?;
        let (data, oob) = self.logical.split_at(self.geometry.page_size);
        Ok(self.ecc.check_erased(&self.geometry, data, oob))
    }

    /// Read the raw page into `scratch` and deinterleave it into `logical`, without the codec
    fn read_raw_selected(&mut self, row: u32) -> Result<()> {
        let ps = self.geometry.page_size;
        let raw_size = self.geometry.raw_page_size();

        self.ecc.enable_for_raw(&mut self.hw);
        self.sequencer.read(
            &mut self.hw,
            &mut self.scratch,
            0,
            row,
            &Payload::split(0..ps, ps..raw_size),
        )?;

        let (data, oob) = self.logical.split_at_mut(ps);
        self.geometry.deinterleave(&self.scratch, data, oob);
        Ok(())
    }

    /// Write one page through the ECC engine
    pub fn write_page(&mut self, page: u32, contents: PageData) -> Result<()> {
        let ps = self.geometry.page_size;
        let meta_end = ps + self.geometry.metadata_size;
        let user = bbm::user_oob_range(&self.geometry, self.config.refresh_tag);

        check_len("page data", ps, contents.data.len())?;
        if contents.oob.len() > user.len() {
            return Err(NandError::InvalidBuffer {
                what: "page OOB",
                expected: user.len(),
                actual: contents.oob.len(),
            });
        }
        self.locate(page)?;

        self.scratch[..ps].copy_from_slice(contents.data);
        let metadata = &mut self.scratch[ps..meta_end];
        metadata.fill(0xFF);
        metadata[user][..contents.oob.len()].copy_from_slice(contents.oob);
        if self.config.refresh_tag {
            bbm::encode_refresh_tag(&self.geometry, metadata, contents.origin_block);
        }
        self.codec.swap(&mut self.scratch[..meta_end]);

        self.with_chip(page, |ctrl, row| {
            ctrl.ecc.enable_for_write(&mut ctrl.hw);
            ctrl.sequencer.setup_program(
                &mut ctrl.hw,
                &mut ctrl.scratch,
                PendingSetup::SeqIn { column: 0, row },
                Payload::split(0..ps, ps..meta_end).with_ecc(),
            )?;
            ctrl.sequencer.trigger_program(&mut ctrl.hw, &mut ctrl.scratch)
        })
    }

    /// Read a whole page with the ECC engine bypassed.
    ///
    /// `data` receives the main data and `oob` the logical OOB (metadata, then parity), both as
    /// the ECC engine would see them. Nothing is corrected.
    pub fn read_page_raw(&mut self, page: u32, data: &mut [u8], oob: &mut [u8]) -> Result<()> {
        let ps = self.geometry.page_size;
        check_len("page data", ps, data.len())?;
        check_len("page OOB", self.geometry.oob_size, oob.len())?;

        self.with_chip(page, |ctrl, row| ctrl.read_raw_selected(row))?;
        self.codec
            .swap(&mut self.logical[..ps + self.geometry.metadata_size]);

        data.copy_from_slice(&self.logical[..ps]);
        oob.copy_from_slice(&self.logical[ps..]);
        Ok(())
    }

    /// Write a whole page with the ECC engine bypassed; the inverse of [Controller::read_page_raw]
    pub fn write_page_raw(&mut self, page: u32, data: &[u8], oob: &[u8]) -> Result<()> {
        let ps = self.geometry.page_size;
        let raw_size = self.geometry.raw_page_size();
        check_len("page data", ps, data.len())?;
        check_len("page OOB", self.geometry.oob_size, oob.len())?;
        self.locate(page)?;

        self.logical[..ps].copy_from_slice(data);
        self.logical[ps..].copy_from_slice(oob);
        self.codec
            .swap(&mut self.logical[..ps + self.geometry.metadata_size]);
        let (data, oob) = self.logical.split_at(ps);
        self.geometry.interleave(data, oob, &mut self.scratch);

        // Main area first, then the spare area through a column change
        self.with_chip(page, |ctrl, row| {
            ctrl.ecc.enable_for_raw(&mut ctrl.hw);
            ctrl.sequencer.setup_program(
                &mut ctrl.hw,
                &mut ctrl.scratch,
                PendingSetup::SeqIn { column: 0, row },
                Payload::main(0..ps),
            )?;
            ctrl.sequencer.setup_program(
                &mut ctrl.hw,
                &mut ctrl.scratch,
                PendingSetup::RandIn { column: ps as u16 },
                Payload::spare(ps..raw_size),
            )?;
            ctrl.sequencer.trigger_program(&mut ctrl.hw, &mut ctrl.scratch)
        })
    }

    /// Erase one block. Blocks known to be bad are refused.
    pub fn erase_block(&mut self, block: u32) -> Result<()> {
        self.check_block(block)?;
        if self.bbt[block as usize] == BlockState::Bad {
            return Err(NandError::BadBlockMarked(block));
        }

        let page = block * self.chip_layout.pages_per_block;
        self.with_chip(page, |ctrl, row| {
            ctrl.sequencer
                .erase(&mut ctrl.hw, &mut ctrl.scratch, row)
        })
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::ecc::EccChunkStatus;
    use crate::nand::sim::{SimNand, SIM_ID, TEST_LAYOUT};
    use crate::nand::PageUtil;

    pub(crate) fn test_controller(config: NandConfig) -> anyhow::Result<Controller<SimNand>> {
        let sim = SimNand::new(TEST_LAYOUT, 64);
        Ok(Controller::probe(sim, config)?)
    }

    pub(crate) fn test_data(seed: usize) -> Vec<u8> {
        (0..TEST_LAYOUT.bytes_per_page)
            .map(|i| ((i + seed) * 31 / 7) as u8)
            .collect()
    }

    fn read(ctrl: &mut Controller<SimNand>, page: u32) -> crate::error::Result<(Vec<u8>, PageRead)> {
        let mut data = vec![0u8; ctrl.geometry().page_size];
        let read = ctrl.read_page(
            page,
            PageBuffer {
                data: &mut data,
                oob: &mut [],
            },
        )?;
        Ok((data, read))
    }

    #[test]
    fn test_probe() -> anyhow::Result<()> {
        let ctrl = test_controller(Default::default())?;
        assert_eq!(ctrl.identify(), SIM_ID);
        assert_eq!(ctrl.chips(), 1);
        assert_eq!(ctrl.geometry().ecc_strength, 8);
        assert_eq!(ctrl.layout(), TEST_LAYOUT);

        let sim = SimNand::new(TEST_LAYOUT, 64).with_chips(3);
        let ctrl = Controller::probe(sim, NandConfig::default().max_chips(4).ecc_strength(4))?;
        assert_eq!(ctrl.chips(), 3);
        assert_eq!(ctrl.layout().blocks, TEST_LAYOUT.blocks * 3);
        assert_eq!(ctrl.geometry().ecc_strength, 4);
        Ok(())
    }

    #[test]
    fn test_probe_bad_param_page() {
        let sim = SimNand::new(TEST_LAYOUT, 64).with_param_page(vec![0xFF; 256]);
        assert!(matches!(
            Controller::probe(sim, Default::default()),
            Err(NandError::Probe(_))
        ));

        let sim = SimNand::new(TEST_LAYOUT, 128);
        assert!(matches!(
            Controller::probe(sim, Default::default()),
            Err(NandError::Geometry(_))
        ));
    }

    #[test]
    fn test_write_read() -> anyhow::Result<()> {
        let mut ctrl = test_controller(Default::default())?;
        let data = test_data(0);
        let oob = [1, 2, 3, 4, 5, 6, 7, 8, 9];

        ctrl.write_page(
            3,
            PageData {
                data: &data,
                oob: &oob,
                origin_block: None,
            },
        )?;

        let mut data_out = vec![0u8; data.len()];
        let mut oob_out = [0u8; 9];
        let read = ctrl.read_page(
            3,
            PageBuffer {
                data: &mut data_out,
                oob: &mut oob_out,
            },
        )?;
        assert_eq!(data_out, data);
        assert_eq!(oob_out, oob);
        assert_eq!(read.ecc.chunks, [EccChunkStatus::Clean; 4]);
        assert_eq!(read.origin_block, None);

        // The physical marker position holds the marker, not data
        let cells = ctrl.hardware().cells(0, 3).unwrap();
        assert_eq!(cells[ctrl.geometry().page_size], 0xFF);
        Ok(())
    }

    #[test]
    fn test_erased_page() -> anyhow::Result<()> {
        let mut ctrl = test_controller(Default::default())?;

        let (data, read) = read(&mut ctrl, 5)?;
        assert!(data.is_erased());
        assert!(!read.ecc.erased_page);
        assert_eq!(ctrl.ecc_stats(), Default::default());
        Ok(())
    }

    #[test]
    fn test_erased_page_bitflips() -> anyhow::Result<()> {
        let mut ctrl = test_controller(Default::default())?;
        let geo = *ctrl.geometry();
        let threshold = geo.ecc_strength as usize;

        // Stuck bits split between data and parity, up to the threshold
        let mut flips: Vec<usize> = (0..threshold / 2)
            .map(|i| geo.chunk_data_bits(i % geo.chunk_count).start + 17 * i)
            .collect();
        flips.extend((0..threshold - flips.len()).map(|i| geo.chunk_ecc_bits(1).start + i));
        for &bit in &flips {
            ctrl.hardware_mut().flip_bit(0, 6, bit)?;
        }

        let (data, page_read) = read(&mut ctrl, 6)?;
        assert!(data.is_erased());
        assert!(page_read.ecc.erased_page);
        assert_eq!(page_read.ecc.corrected, threshold as u32);
        assert_eq!(ctrl.ecc_stats().failed, 0);

        // Each region is held to the threshold on its own: 6 + 6 still reads as erased
        let parity = geo.chunk_ecc_bits(1).start;
        let data_bit = geo.chunk_data_bits(3).start + 1000;
        for bit in [parity + 4, parity + 5, data_bit, data_bit + 1] {
            ctrl.hardware_mut().flip_bit(0, 6, bit)?;
        }
        let (data, page_read) = read(&mut ctrl, 6)?;
        assert!(data.is_erased());
        assert_eq!(page_read.ecc.corrected, 12);

        // 9 in the data is too many
        for bit in data_bit + 2..data_bit + 5 {
            ctrl.hardware_mut().flip_bit(0, 6, bit)?;
        }
        assert!(matches!(
            read(&mut ctrl, 6),
            Err(NandError::EccUncorrectable { page: 6, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_correctable() -> anyhow::Result<()> {
        let mut ctrl = test_controller(Default::default())?;
        let geo = *ctrl.geometry();
        let data = test_data(1);
        ctrl.write_page(9, PageData::new(&data))?;

        let injected = geo.ecc_strength as usize - 1;
        for i in 0..injected {
            let bit = geo.chunk_data_bits(2).start + 101 * i;
            ctrl.hardware_mut().flip_bit(0, 9, bit)?;
        }

        let (data_out, read) = read(&mut ctrl, 9)?;
        assert_eq!(data_out, data);
        assert_eq!(read.ecc.chunks[2], EccChunkStatus::Corrected(injected as u32));
        assert_eq!(read.ecc.corrected, injected as u32);
        assert_eq!(ctrl.ecc_stats().corrected, injected as u64);
        Ok(())
    }

    #[test]
    fn test_uncorrectable() -> anyhow::Result<()> {
        let mut ctrl = test_controller(Default::default())?;
        let geo = *ctrl.geometry();
        ctrl.write_page(12, PageData::new(&test_data(2)))?;

        for i in 0..=geo.ecc_strength as usize {
            let bit = geo.chunk_data_bits(1).start + 3 * i;
            ctrl.hardware_mut().flip_bit(0, 12, bit)?;
        }

        assert!(matches!(
            read(&mut ctrl, 12),
            Err(NandError::EccUncorrectable {
                page: 12,
                chunks: 1
            })
        ));
        assert_eq!(ctrl.ecc_stats().failed, 1);
        assert_eq!(ctrl.ecc_stats().corrected, 0);

        // Two failing chunks in one page still count as one failed read
        ctrl.write_page(13, PageData::new(&test_data(3)))?;
        for chunk in [1, 2] {
            for i in 0..=geo.ecc_strength as usize {
                let bit = geo.chunk_data_bits(chunk).start + 5 * i;
                ctrl.hardware_mut().flip_bit(0, 13, bit)?;
            }
        }
        assert!(matches!(
            read(&mut ctrl, 13),
            Err(NandError::EccUncorrectable {
                page: 13,
                chunks: 2
            })
        ));
        assert_eq!(ctrl.ecc_stats().failed, 2);
        Ok(())
    }

    #[test]
    fn test_refresh_tag() -> anyhow::Result<()> {
        let mut ctrl = test_controller(NandConfig::default().refresh_tag())?;
        assert_eq!(ctrl.user_oob_len(), 5);

        let data = test_data(3);
        ctrl.write_page(
            20,
            PageData {
                data: &data,
                oob: &[0xAB; 5],
                origin_block: Some(7),
            },
        )?;
        ctrl.write_page(21, PageData::new(&data))?;

        let mut oob = [0u8; 5];
        let mut data_out = vec![0u8; data.len()];
        let page_read = ctrl.read_page(
            20,
            PageBuffer {
                data: &mut data_out,
                oob: &mut oob,
            },
        )?;
        assert_eq!(page_read.origin_block, Some(7));
        assert_eq!(oob, [0xAB; 5]);

        let (_, page_read) = read(&mut ctrl, 21)?;
        assert_eq!(page_read.origin_block, None);

        // Too much OOB for the shrunken user region
        assert!(matches!(
            ctrl.write_page(
                22,
                PageData {
                    data: &data,
                    oob: &[0; 6],
                    origin_block: None
                }
            ),
            Err(NandError::InvalidBuffer { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_raw_access() -> anyhow::Result<()> {
        let mut ctrl = test_controller(Default::default())?;
        let geo = *ctrl.geometry();
        let data = test_data(4);
        let oob = vec![0x3Cu8; 9];
        ctrl.write_page(
            30,
            PageData {
                data: &data,
                oob: &oob,
                origin_block: None,
            },
        )?;

        let mut raw_data = vec![0u8; geo.page_size];
        let mut raw_oob = vec![0u8; geo.oob_size];
        ctrl.read_page_raw(30, &mut raw_data, &mut raw_oob)?;
        assert_eq!(raw_data, data);
        assert_eq!(raw_oob[0], 0xFF);
        assert_eq!(&raw_oob[geo.oob_free_range()], &oob[..]);

        // A raw copy to another page decodes cleanly
        ctrl.write_page_raw(31, &raw_data, &raw_oob)?;
        assert_eq!(ctrl.hardware().cells(0, 31), ctrl.hardware().cells(0, 30));
        let (data_out, read) = read(&mut ctrl, 31)?;
        assert_eq!(data_out, data);
        assert_eq!(read.ecc.corrected, 0);
        Ok(())
    }

    #[test]
    fn test_raw_spare_lane() -> anyhow::Result<()> {
        let mut ctrl = test_controller(Default::default())?;
        let geo = *ctrl.geometry();

        let data = vec![0xFFu8; geo.page_size];
        let mut oob = vec![0xFFu8; geo.oob_size];
        oob[geo.metadata_size + 3 * geo.ecc_bytes_per_chunk] = 0x01;
        ctrl.write_page_raw(40, &data, &oob)?;

        // The last chunk's parity starts on a byte boundary, past the main area
        let bit = geo.chunk_ecc_bits(3).start;
        assert_eq!(bit % 8, 0);
        assert!(bit / 8 >= geo.page_size);
        let cells = ctrl.hardware().cells(0, 40).unwrap();
        assert_eq!(cells[bit / 8], 0x01);
        Ok(())
    }

    #[test]
    fn test_empty_layout() -> anyhow::Result<()> {
        let geometry = FlashGeometry::plan(2048, 64, 8)?;
        for layout in [
            NandLayout { blocks: 0, ..TEST_LAYOUT },
            NandLayout { pages_per_block: 0, ..TEST_LAYOUT },
        ] {
            let sim = SimNand::new(TEST_LAYOUT, 64);
            assert!(matches!(
                Controller::new(sim, Default::default(), geometry, layout, 1),
                Err(NandError::Probe(_))
            ));
        }
        Ok(())
    }

    #[test]
    fn test_bounds() -> anyhow::Result<()> {
        let mut ctrl = test_controller(Default::default())?;
        let data = test_data(5);

        assert!(matches!(
            ctrl.write_page(TEST_LAYOUT.pages(), PageData::new(&data)),
            Err(NandError::OutOfRange { what: "page", .. })
        ));
        assert!(matches!(
            ctrl.write_page(0, PageData::new(&data[..100])),
            Err(NandError::InvalidBuffer { .. })
        ));
        assert!(matches!(
            ctrl.erase_block(TEST_LAYOUT.blocks),
            Err(NandError::OutOfRange { what: "block", .. })
        ));
        Ok(())
    }

    #[test]
    fn test_erase() -> anyhow::Result<()> {
        let mut ctrl = test_controller(Default::default())?;
        ctrl.write_page(8, PageData::new(&test_data(6)))?;
        ctrl.erase_block(1)?;

        let (data, _) = read(&mut ctrl, 8)?;
        assert!(data.is_erased());

        ctrl.hardware_mut().fail_block(0, 2);
        assert!(matches!(
            ctrl.erase_block(2),
            Err(NandError::OperationFailed { op: "erase", .. })
        ));
        Ok(())
    }
}
