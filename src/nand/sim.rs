//! A simulated controller with attached chips, for testing purposes.
//!
//! [SimNand] implements all of the [crate::hw] traits the way the real controller behaves, down to
//! the bit layout on the array: pages are stored as raw images in the interleaved layout of
//! [crate::geometry], the spare-area lane mirrors every byte crossing it, and the ECC accelerator
//! protects each chunk with 13 × t bits of parity. The parity is not a real BCH code; instead the
//! simulator remembers what each page held when it was last programmed through the accelerator
//! and corrects against that, reporting exactly how many bits it had to fix.
//!
//! Every bus cycle is recorded as a [BusEvent], so tests can check the exact command sequence.

use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::ops::Range;
use std::time::Duration;

use anyhow::ensure;
use bytes::{Buf, BufMut, BytesMut};
use crc::{Crc, CRC_32_ISCSI};
use deku::DekuContainerWrite;

use crate::bits;
use crate::ecc::{STATUS_CLEAN, STATUS_ERASED, STATUS_UNCORRECTABLE};
use crate::geometry::FlashGeometry;
use crate::hw::{
    ChainToken, CommandPort, Direction, EccAccelerator, EccMode, HwError, Step, TransferEngine,
};
use crate::nand::{NandLayout, PageUtil};
use crate::onfi::ParamPage;
use crate::transfer::swap_lanes;

/// READ ID response: Micron, 2 Gbit x8, 2 KiB pages
pub const SIM_ID: [u8; 5] = [0x2C, 0xDA, 0x90, 0x95, 0x06];

const STATUS_FAIL: u8 = 0x01;
const STATUS_READY: u8 = 0x60;
const STATUS_NOT_PROTECTED: u8 = 0x80;

const IMAGE_MAGIC: &[u8; 4] = b"NSIM";
const IMAGE_VERSION: u32 = 1;

const PAGE_HAS_CELLS: u8 = 1 << 0;
const PAGE_HAS_PRISTINE: u8 = 1 << 1;

const PARITY_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// One cycle on the simulated bus
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum BusEvent {
    Select(Option<usize>),
    Command(u8),
    Column(u16),
    Row(u32),
    WaitReady,
    DataIn { len: usize, ecc: bool },
    DataOut { len: usize, ecc: bool },
}

#[derive(Debug, Clone, Default)]
struct SimPage {
    /// Raw array contents; `None` when erased
    cells: Option<Box<[u8]>>,

    /// Contents as last programmed through the accelerator, used to correct bit errors
    pristine: Option<Box<[u8]>>,
}

#[derive(Debug, Clone)]
enum Output {
    Register,
    Status,
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct SimNand {
    layout: NandLayout,
    oob_size: usize,
    chips: Vec<Vec<SimPage>>,
    param_page: Vec<u8>,

    selected: Option<usize>,
    register: Vec<u8>,
    register_pristine: Option<Box<[u8]>>,
    register_encoded: bool,
    column: usize,
    row: u32,
    output: Output,
    status: u8,

    ecc_mode: EccMode,
    ecc_geometry: Option<FlashGeometry>,
    ecc_status: Vec<u8>,

    next_token: u64,
    completion: Option<(ChainToken, Result<(), HwError>)>,

    stuck_busy: bool,
    failing: BTreeSet<(usize, u32)>,
    trace: Vec<BusEvent>,
}

/// Stand-in for the BCH parity of one codeword: a CRC stream `bits` long, pad bits set
fn pseudo_parity(message: &[u8], bits: usize) -> Vec<u8> {
    let mut parity = vec![0xFFu8; (bits + 7) / 8];
    let mut word = PARITY_CRC.checksum(message);
    for (i, out) in parity.chunks_mut(4).enumerate() {
        let bytes = word.to_le_bytes();
        out.copy_from_slice(&bytes[..out.len()]);

        let mut digest = PARITY_CRC.digest();
        digest.update(&bytes);
        digest.update(&(i as u32).to_le_bytes());
        word = digest.finalize();
    }

    if bits % 8 != 0 {
        if let Some(last) = parity.last_mut() {
            *last |= 0xFF << (bits % 8);
        }
    }
    parity
}

/// The bytes protected by the codeword of chunk `chunk`
fn codeword(geo: &FlashGeometry, chunk: usize, data: &[u8], metadata: &[u8]) -> Vec<u8> {
    let chunk_data = &data[chunk * geo.chunk_size..][..geo.chunk_size];
    if chunk == 0 {
        [metadata, chunk_data].concat()
    } else {
        chunk_data.to_vec()
    }
}

/// Bit ranges of the raw page belonging to the codeword of chunk `chunk`
fn codeword_bits(geo: &FlashGeometry, chunk: usize) -> Vec<Range<usize>> {
    let mut ranges = vec![geo.chunk_data_bits(chunk), geo.chunk_ecc_bits(chunk)];
    if chunk == 0 {
        ranges.push(geo.metadata_bits());
    }
    ranges
}

fn encode(geo: &FlashGeometry, data: &[u8], metadata: &[u8]) -> Vec<u8> {
    let mut oob = vec![0xFFu8; geo.oob_size];
    oob[..geo.metadata_size].copy_from_slice(metadata);
    for chunk in 0..geo.chunk_count {
        let parity = pseudo_parity(
            &codeword(geo, chunk, data, metadata),
            geo.ecc_bits_per_chunk,
        );
        oob[geo.metadata_size + chunk * geo.ecc_bytes_per_chunk..][..parity.len()]
            .copy_from_slice(&parity);
    }

    let mut raw = vec![0xFFu8; geo.raw_page_size()];
    geo.interleave(data, &oob, &mut raw);
    raw
}

/// Decode a raw page in place, returning one status code per chunk
fn decode(geo: &FlashGeometry, raw: &mut [u8], pristine: Option<&[u8]>) -> Vec<u8> {
    let mut data = vec![0u8; geo.page_size];
    let mut oob = vec![0u8; geo.oob_size];
    geo.deinterleave(raw, &mut data, &mut oob);

    let mut status = Vec::with_capacity(geo.chunk_count);
    for chunk in 0..geo.chunk_count {
        let ranges = codeword_bits(geo, chunk);

        let code = if ranges
            .iter()
            .all(|r| bits::count_zero_bits(raw, r.clone()) == 0)
        {
            STATUS_ERASED
        } else if let Some(pristine) = pristine {
            let errors: u32 = ranges
                .iter()
                .map(|r| bits::count_differences(raw, pristine, r.clone()))
                .sum();
            if errors > geo.ecc_strength {
                STATUS_UNCORRECTABLE
            } else {
                for r in &ranges {
                    bits::copy_bits(pristine, r.start, raw, r.start, r.len());
                }
                errors as u8
            }
        } else {
            let parity = pseudo_parity(
                &codeword(geo, chunk, &data, &oob[..geo.metadata_size]),
                geo.ecc_bits_per_chunk,
            );
            let stored = &oob[geo.metadata_size + chunk * geo.ecc_bytes_per_chunk..]
                [..geo.ecc_bytes_per_chunk];
            if parity == stored {
                STATUS_CLEAN
            } else {
                STATUS_UNCORRECTABLE
            }
        };
        status.push(code);
    }
    status
}

impl SimNand {
    /// Create a single-chip SimNand with every page erased
    pub fn new(layout: NandLayout, oob_size: usize) -> Self {
        let param_page = ParamPage::new("SIMNAND", layout, oob_size as u16, 8)
            .to_bytes()
            .unwrap_or_default();

        Self {
            layout,
            oob_size,
            chips: vec![Self::blank_chip(layout)],
            param_page,
            selected: None,
            register: vec![0xFF; layout.bytes_per_page + oob_size],
            register_pristine: None,
            register_encoded: false,
            column: 0,
            row: 0,
            output: Output::Register,
            status: STATUS_READY | STATUS_NOT_PROTECTED,
            ecc_mode: EccMode::Bypass,
            ecc_geometry: None,
            ecc_status: Vec::new(),
            next_token: 0,
            completion: None,
            stuck_busy: false,
            failing: BTreeSet::new(),
            trace: Vec::new(),
        }
    }

    /// Populate `count` identical chip-selects
    pub fn with_chips(mut self, count: usize) -> Self {
        self.chips = vec![Self::blank_chip(self.layout); count];
        self
    }

    /// Answer parameter page reads with `bytes` instead of a valid page
    pub fn with_param_page(mut self, bytes: Vec<u8>) -> Self {
        self.param_page = bytes;
        self
    }

    fn blank_chip(layout: NandLayout) -> Vec<SimPage> {
        vec![SimPage::default(); (layout.blocks * layout.pages_per_block) as usize]
    }

    pub fn layout(&self) -> NandLayout {
        self.layout
    }

    pub fn oob_size(&self) -> usize {
        self.oob_size
    }

    pub fn chip_count(&self) -> usize {
        self.chips.len()
    }

    fn raw_page_size(&self) -> usize {
        self.layout.bytes_per_page + self.oob_size
    }

    /// Raw contents of a page, or `None` if it is erased
    pub fn cells(&self, chip: usize, page: u32) -> Option<&[u8]> {
        self.chips.get(chip)?.get(page as usize)?.cells.as_deref()
    }

    /// Invert one bit of a page on the array, as a disturb or retention error would
    pub fn flip_bit(&mut self, chip: usize, page: u32, bit: usize) -> anyhow::Result<()> {
        let raw_size = self.raw_page_size();
        ensure!(bit < raw_size * 8, "bit {bit} out of range");
        let page = self
            .chips
            .get_mut(chip)
            .and_then(|x| x.get_mut(page as usize))
            .ok_or(anyhow::anyhow!("page {page} of chip {chip} out of range"))?;

        let cells = page
            .cells
            .get_or_insert_with(|| vec![0xFF; raw_size].into_boxed_slice());
        bits::flip_bit(cells, bit);
        Ok(())
    }

    /// Write a factory bad-block marker into the first page of a block
    pub fn factory_bad(&mut self, chip: usize, block: u32) -> anyhow::Result<()> {
        let marker = self.layout.bytes_per_page;
        let page = block * self.layout.pages_per_block;
        for bit in 0..8 {
            self.flip_bit(chip, page, marker * 8 + bit)?;
        }
        Ok(())
    }

    /// Make every program and erase in a block report failure
    pub fn fail_block(&mut self, chip: usize, block: u32) {
        self.failing.insert((chip, block));
    }

    /// Stop deasserting busy, so that every wait times out
    pub fn set_stuck_busy(&mut self, stuck: bool) {
        self.stuck_busy = stuck;
    }

    /// Take the bus cycles recorded so far
    pub fn take_trace(&mut self) -> Vec<BusEvent> {
        std::mem::take(&mut self.trace)
    }

    fn selected_page(&mut self) -> Option<&mut SimPage> {
        let chip = self.chips.get_mut(self.selected?)?;
        chip.get_mut(self.row as usize)
    }

    fn is_failing(&self) -> bool {
        self.selected.map_or(false, |chip| {
            self.failing
                .contains(&(chip, self.row / self.layout.pages_per_block))
        })
    }

    fn load_register(&mut self) {
        let (cells, pristine) = match self.selected_page() {
            Some(page) => (page.cells.clone(), page.pristine.clone()),
            None => (None, None),
        };

        match cells {
            Some(cells) => self.register.copy_from_slice(&cells),
            None => self.register.fill(0xFF),
        }
        self.register_pristine = pristine;
        self.output = Output::Register;
    }

    fn program(&mut self) {
        if self.is_failing() {
            self.status |= STATUS_FAIL;
            return;
        }

        let register = std::mem::take(&mut self.register);
        let encoded = self.register_encoded;
        if let Some(page) = self.selected_page() {
            if page.cells.is_some() || !register.is_erased() {
                let cells = page
                    .cells
                    .get_or_insert_with(|| register.clone().into_boxed_slice());
                for (cell, &bit) in cells.iter_mut().zip(&register) {
                    *cell &= bit;
                }
                if encoded {
                    page.pristine = Some(cells.clone());
                }
            }
        } else {
            self.status |= STATUS_FAIL;
        }
        self.register = register;
    }

    fn erase(&mut self) {
        if self.is_failing() {
            self.status |= STATUS_FAIL;
            return;
        }

        let ppb = self.layout.pages_per_block as usize;
        let first = (self.row as usize / ppb) * ppb;
        match self.selected.and_then(|x| self.chips.get_mut(x)) {
            Some(chip) if first < chip.len() => {
                chip[first..first + ppb].fill(SimPage::default());
            }
            _ => self.status |= STATUS_FAIL,
        }
    }

    fn transfer(
        &mut self,
        direction: Direction,
        main: Range<usize>,
        spare: Range<usize>,
        buffer: &mut [u8],
        ecc: bool,
    ) -> Result<(), HwError> {
        if main.end > buffer.len() || spare.end > buffer.len() {
            return Err(HwError::Fault("data step outside buffer".into()));
        }

        let len = main.len() + spare.len();
        self.trace.push(match direction {
            Direction::In => BusEvent::DataIn { len, ecc },
            Direction::Out => BusEvent::DataOut { len, ecc },
        });

        match (direction, ecc) {
            (Direction::In, false) => {
                let mut bytes = vec![0xFFu8; len];
                match &self.output {
                    _ if self.selected.map_or(true, |x| x >= self.chips.len()) => (),
                    Output::Status => bytes.fill(self.status),
                    Output::Register => copy_from(&mut bytes, &self.register, self.column),
                    Output::Bytes(source) => copy_from(&mut bytes, source, self.column),
                }
                self.column += len;

                let (to_main, to_spare) = bytes.split_at(main.len());
                buffer[main].copy_from_slice(to_main);
                buffer[spare.clone()].copy_from_slice(to_spare);
                swap_lanes(&mut buffer[spare]);
            }

            (Direction::Out, false) => {
                let end = self.column + len;
                if end > self.register.len() {
                    return Err(HwError::Fault("write past page register".into()));
                }
                let (main_reg, spare_reg) =
                    self.register[self.column..end].split_at_mut(main.len());
                main_reg.copy_from_slice(&buffer[main]);
                spare_reg.copy_from_slice(&buffer[spare]);
                swap_lanes(spare_reg);
                self.column = end;
            }

            (Direction::In, true) => {
                let geo = self.ecc_layout(EccMode::Decode, &main, &spare)?;
                let mut raw = self.register.clone();
                self.ecc_status = decode(&geo, &mut raw, self.register_pristine.as_deref());

                let mut oob = vec![0u8; geo.oob_size];
                geo.deinterleave(&raw, &mut buffer[main], &mut oob);
                buffer[spare.clone()].copy_from_slice(&oob[..geo.metadata_size]);
                swap_lanes(&mut buffer[spare]);
            }

            (Direction::Out, true) => {
                let geo = self.ecc_layout(EccMode::Encode, &main, &spare)?;
                let mut metadata = buffer[spare].to_vec();
                swap_lanes(&mut metadata);
                self.register = encode(&geo, &buffer[main], &metadata);
                self.register_encoded = true;
            }
        }
        Ok(())
    }

    /// The layout the accelerator was configured for, checked against a data step
    fn ecc_layout(
        &self,
        mode: EccMode,
        main: &Range<usize>,
        spare: &Range<usize>,
    ) -> Result<FlashGeometry, HwError> {
        let geo = self
            .ecc_geometry
            .filter(|_| self.ecc_mode == mode)
            .ok_or(HwError::Fault(format!("ECC not configured for {mode:?}")))?;

        if main.len() != geo.page_size || spare.len() != geo.metadata_size {
            return Err(HwError::Fault("ECC transfer is not a whole page".into()));
        }
        Ok(geo)
    }

    fn run_chain(&mut self, steps: &[Step], buffer: &mut [u8]) -> Result<(), HwError> {
        let mut ecc = false;
        for step in steps {
            match step {
                Step::WaitReady => {
                    self.trace.push(BusEvent::WaitReady);
                    if self.stuck_busy {
                        return Err(HwError::Timeout);
                    }
                }
                Step::Command(command) => self.issue_command(*command),
                Step::EnableEcc => ecc = self.ecc_mode != EccMode::Bypass,
                Step::Data {
                    direction,
                    main,
                    spare,
                } => self.transfer(*direction, main.clone(), spare.clone(), buffer, ecc)?,
            }
        }
        Ok(())
    }

    /// Write the whole array out to a writable stream (such as a File)
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        let mut header = BytesMut::with_capacity(32);
        header.put_slice(IMAGE_MAGIC);
        header.put_u32_le(IMAGE_VERSION);
        header.put_u32_le(self.chips.len() as u32);
        header.put_u32_le(self.layout.blocks);
        header.put_u32_le(self.layout.pages_per_block);
        header.put_u32_le(self.layout.bytes_per_page as u32);
        header.put_u32_le(self.oob_size as u32);
        write.write_all(&header)?;

        let mut buf = BytesMut::new();
        for page in self.chips.iter().flatten() {
            let mut flags = 0;
            if page.cells.is_some() {
                flags |= PAGE_HAS_CELLS;
            }
            if page.pristine.is_some() {
                flags |= PAGE_HAS_PRISTINE;
            }

            buf.put_u8(flags);
            for contents in [&page.cells, &page.pristine].into_iter().flatten() {
                buf.put_slice(contents);
            }

            if buf.len() >= 1 << 20 {
                write.write_all(&buf)?;
                buf.clear();
            }
        }
        write.write_all(&buf)?;

        Ok(())
    }

    /// Restore a SimNand written by [SimNand::save]
    pub fn load<R: Read>(read: &mut R) -> anyhow::Result<Self> {
        let mut image = Vec::new();
        read.read_to_end(&mut image)?;
        let mut buf = &image[..];

        ensure!(buf.remaining() >= 28, "truncated image header");
        ensure!(&buf[..4] == IMAGE_MAGIC, "not a SimNand image");
        buf.advance(4);
        let version = buf.get_u32_le();
        ensure!(version == IMAGE_VERSION, "unsupported image version {version}");

        let chips = buf.get_u32_le() as usize;
        let layout = NandLayout {
            blocks: buf.get_u32_le(),
            pages_per_block: buf.get_u32_le(),
            bytes_per_page: buf.get_u32_le() as usize,
        };
        let oob_size = buf.get_u32_le() as usize;

        let mut nand = Self::new(layout, oob_size).with_chips(chips);
        let raw_size = nand.raw_page_size();
        for page in nand.chips.iter_mut().flatten() {
            ensure!(buf.has_remaining(), "truncated image");
            let flags = buf.get_u8();

            for (flag, slot) in [
                (PAGE_HAS_CELLS, &mut page.cells),
                (PAGE_HAS_PRISTINE, &mut page.pristine),
            ] {
                if flags & flag != 0 {
                    ensure!(buf.remaining() >= raw_size, "truncated image");
                    let mut contents = vec![0u8; raw_size];
                    buf.copy_to_slice(&mut contents);
                    *slot = Some(contents.into_boxed_slice());
                }
            }
        }
        ensure!(!buf.has_remaining(), "trailing data in image");

        Ok(nand)
    }
}

/// Fill `dst` from `src` starting at `offset`, leaving bytes past the end of `src` alone
fn copy_from(dst: &mut [u8], src: &[u8], offset: usize) {
    let available = src.get(offset..).unwrap_or_default();
    let len = dst.len().min(available.len());
    dst[..len].copy_from_slice(&available[..len]);
}

impl CommandPort for SimNand {
    fn select_chip(&mut self, chip: Option<usize>) {
        self.trace.push(BusEvent::Select(chip));
        self.selected = chip;
    }

    fn issue_command(&mut self, command: u8) {
        use crate::command::opcode::*;

        self.trace.push(BusEvent::Command(command));
        match command {
            READSTART => self.load_register(),
            SEQIN => {
                self.register.fill(0xFF);
                self.register_encoded = false;
                self.output = Output::Register;
            }
            PAGEPROG => {
                self.status &= !STATUS_FAIL;
                self.program();
            }
            ERASE2 => {
                self.status &= !STATUS_FAIL;
                self.erase();
            }
            STATUS => self.output = Output::Status,
            READID => self.output = Output::Bytes(SIM_ID.to_vec()),
            PARAM => self.output = Output::Bytes(self.param_page.clone()),
            RESET => {
                self.register.fill(0xFF);
                self.register_encoded = false;
                self.register_pristine = None;
                self.column = 0;
                self.output = Output::Register;
                self.status = STATUS_READY | STATUS_NOT_PROTECTED;
            }
            _ => (),
        }
    }

    fn set_column_address(&mut self, column: u16) {
        self.trace.push(BusEvent::Column(column));
        self.column = column.into();
    }

    fn set_row_address(&mut self, row: u32) {
        self.trace.push(BusEvent::Row(row));
        self.row = row;
    }

    fn poll_ready(&mut self) -> bool {
        !self.stuck_busy
    }
}

impl TransferEngine for SimNand {
    fn submit_chain(&mut self, steps: &[Step], buffer: &mut [u8]) -> Result<ChainToken, HwError> {
        self.next_token += 1;
        let token = ChainToken(self.next_token);

        let result = self.run_chain(steps, buffer);
        self.ecc_mode = EccMode::Bypass;
        self.completion = Some((token, result));
        Ok(token)
    }

    fn wait_completion(&mut self, token: ChainToken, _timeout: Duration) -> Result<(), HwError> {
        match self.completion.take() {
            Some((t, result)) if t == token => result,
            _ => Err(HwError::Fault(format!("no chain {token:?} in flight"))),
        }
    }
}

impl EccAccelerator for SimNand {
    fn configure(&mut self, chunk_count: usize, strength: u32, mode: EccMode) {
        self.ecc_mode = mode;
        self.ecc_geometry = FlashGeometry::plan(self.layout.bytes_per_page, self.oob_size, strength)
            .ok()
            .filter(|x| x.chunk_count == chunk_count);
    }

    fn read_status(&mut self, status: &mut [u8]) {
        status.fill(STATUS_CLEAN);
        let len = status.len().min(self.ecc_status.len());
        status[..len].copy_from_slice(&self.ecc_status[..len]);
    }
}

#[cfg(test)]
pub(crate) const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 16,
    pages_per_block: 8,
    bytes_per_page: 2048,
};

#[test]
fn test_pseudo_parity() {
    let parity = pseudo_parity(b"hello", 13 * 8);
    assert_eq!(parity.len(), 13);
    assert_eq!(parity, pseudo_parity(b"hello", 13 * 8));
    assert_ne!(parity, pseudo_parity(b"hellp", 13 * 8));

    // 26 bits: the top 6 bits of the last byte are padding
    let parity = pseudo_parity(b"hello", 26);
    assert_eq!(parity.len(), 4);
    assert_eq!(parity[3] & 0xFC, 0xFC);
}

#[test]
fn test_encode_decode() -> anyhow::Result<()> {
    let geo = FlashGeometry::plan(2048, 64, 8)?;
    let data: Vec<u8> = (0..geo.page_size).map(|i| (i * 3) as u8).collect();
    let metadata = [0xFF, 1, 2, 3, 4, 5, 6, 7, 8, 9];

    let pristine = encode(&geo, &data, &metadata);

    // Without a history, the parity alone says the page is intact
    let mut raw = pristine.clone();
    assert_eq!(decode(&geo, &mut raw, None), [STATUS_CLEAN; 4]);

    // Correctable errors in chunk 0's metadata and chunk 2's data
    bits::set_bit(&mut raw, 3, false);
    let bit = geo.chunk_data_bits(2).start + 100;
    bits::flip_bit(&mut raw, bit);
    bits::flip_bit(&mut raw, bit + 1);
    assert_eq!(decode(&geo, &mut raw, Some(&pristine)), [1, 0, 2, 0]);
    assert_eq!(raw, pristine);

    // An erased page decodes as erased
    let mut raw = vec![0xFFu8; geo.raw_page_size()];
    assert_eq!(decode(&geo, &mut raw, None), [STATUS_ERASED; 4]);

    // Too many errors in chunk 1
    let mut raw = pristine.clone();
    for bit in geo.chunk_ecc_bits(1).take(9) {
        bits::flip_bit(&mut raw, bit);
    }
    assert_eq!(
        decode(&geo, &mut raw, Some(&pristine)),
        [0, STATUS_UNCORRECTABLE, 0, 0]
    );
    Ok(())
}

#[test]
fn test_save_load() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT, 64).with_chips(2);
    nand.flip_bit(1, 9, 77)?;
    nand.factory_bad(0, 3)?;

    let mut image = Vec::new();
    nand.save(&mut image)?;
    let loaded = SimNand::load(&mut &image[..])?;

    assert_eq!(loaded.chip_count(), 2);
    assert_eq!(loaded.layout().blocks, TEST_LAYOUT.blocks);
    assert_eq!(loaded.cells(1, 9), nand.cells(1, 9));
    assert_eq!(loaded.cells(0, 3 * 8).map(|x| x[2048]), Some(0x00));
    assert_eq!(loaded.cells(0, 0), None);

    assert!(SimNand::load(&mut &image[..image.len() - 1]).is_err());
    assert!(SimNand::load(&mut &b"NSIQ"[..]).is_err());
    Ok(())
}
