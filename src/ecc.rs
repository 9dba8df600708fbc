//! Driving the BCH accelerator and making sense of what it reports.

use log::{debug, warn};

use crate::bits;
use crate::geometry::FlashGeometry;
use crate::hw::{EccAccelerator, EccMode};

/// Status code of a chunk that decoded without errors
pub const STATUS_CLEAN: u8 = 0x00;

/// Status code of a chunk the accelerator found entirely erased
pub const STATUS_ERASED: u8 = 0xFF;

/// Status code of a chunk with more errors than the code can correct
pub const STATUS_UNCORRECTABLE: u8 = 0xFE;

/// Outcome of decoding one chunk
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EccChunkStatus {
    Clean,
    Corrected(u32),
    Uncorrectable,
}

impl EccChunkStatus {
    pub fn from_code(code: u8) -> Self {
        match code {
            STATUS_CLEAN | STATUS_ERASED => Self::Clean,
            STATUS_UNCORRECTABLE => Self::Uncorrectable,
            n => Self::Corrected(n.into()),
        }
    }
}

/// Device-wide correction counters
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct EccStats {
    /// Bits corrected across all successful reads
    pub corrected: u64,

    /// Reads that failed correction, one per failed page read
    pub failed: u64,
}

/// What happened while decoding one page
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct EccReport {
    pub chunks: Vec<EccChunkStatus>,

    /// Total corrected bits; for a page recognised as erased, the zero bits that were tolerated
    pub corrected: u32,

    pub max_bitflips: u32,

    /// The page failed decoding but was recognised as an erased page with a few stuck bits
    pub erased_page: bool,
}

impl EccReport {
    pub fn uncorrectable_chunks(&self) -> u32 {
        self.chunks
            .iter()
            .filter(|&&x| x == EccChunkStatus::Uncorrectable)
            .count() as u32
    }
}

#[derive(Debug)]
pub struct EccEngineAdapter {
    chunk_count: usize,
    strength: u32,
    threshold: u32,
    stats: EccStats,
    status: Vec<u8>,
}

impl EccEngineAdapter {
    pub fn new(geometry: &FlashGeometry, threshold: u32) -> Self {
        Self {
            chunk_count: geometry.chunk_count,
            strength: geometry.ecc_strength,
            threshold,
            stats: Default::default(),
            status: vec![STATUS_CLEAN; geometry.chunk_count],
        }
    }

    pub fn enable_for_read<A: EccAccelerator + ?Sized>(&self, hw: &mut A) {
        hw.configure(self.chunk_count, self.strength, EccMode::Decode);
    }

    pub fn enable_for_write<A: EccAccelerator + ?Sized>(&self, hw: &mut A) {
        hw.configure(self.chunk_count, self.strength, EccMode::Encode);
    }

    pub fn enable_for_raw<A: EccAccelerator + ?Sized>(&self, hw: &mut A) {
        hw.configure(self.chunk_count, self.strength, EccMode::Bypass);
    }

    /// Classify the per-chunk status bytes of one decode
    pub fn interpret_status(&self, codes: &[u8]) -> EccReport {
        let mut report = EccReport::default();
        for &code in codes {
            let status = EccChunkStatus::from_code(code);
            if let EccChunkStatus::Corrected(n) = status {
                report.corrected += n;
                report.max_bitflips = report.max_bitflips.max(n);
            }
            report.chunks.push(status);
        }
        report
    }

    /// Fetch and classify the status of the last decode
    pub fn collect<A: EccAccelerator + ?Sized>(&mut self, hw: &mut A) -> EccReport {
        self.status.fill(STATUS_CLEAN);
        hw.read_status(&mut self.status);
        let report = self.interpret_status(&self.status);
        debug!("ecc status {:02x?}", self.status);
        report
    }

    /// Decide whether a page that failed decoding is really an erased page.
    ///
    /// `data` and `oob` are the page as read with the accelerator bypassed, in the logical layout.
    /// The parity and the data are each held to the threshold on their own. Returns the number of
    /// zero bits tolerated across both, or `None` if the page holds data.
    pub fn check_erased(&self, geometry: &FlashGeometry, data: &[u8], oob: &[u8]) -> Option<u32> {
        let ecc_bytes = geometry.oob_ecc_range();
        let ecc_zeros = bits::count_zero_bits(oob, ecc_bytes.start * 8..ecc_bytes.end * 8);
        if ecc_zeros > self.threshold {
            return None;
        }

        let data_zeros = bits::count_zero_bits(data, 0..data.len() * 8);
        (data_zeros <= self.threshold).then_some(ecc_zeros + data_zeros)
    }

    /// Turn a failed report into an erased-page report, tolerating `zeros` stuck bits
    pub fn mark_erased(&self, report: &mut EccReport, zeros: u32) {
        warn!("treating page with {zeros} zero bit(s) as erased");
        report.chunks.fill(EccChunkStatus::Clean);
        report.corrected = zeros;
        report.max_bitflips = zeros;
        report.erased_page = true;
    }

    /// Count the outcome of a finished read in the device-wide statistics.
    ///
    /// A failed read counts once, however many of its chunks failed.
    pub fn record(&mut self, report: &EccReport) {
        match report.uncorrectable_chunks() {
            0 => self.stats.corrected += u64::from(report.corrected),
            _ => self.stats.failed += 1,
        }
    }

    pub fn stats(&self) -> EccStats {
        self.stats
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

#[cfg(test)]
fn test_adapter() -> anyhow::Result<(FlashGeometry, EccEngineAdapter)> {
    let geo = FlashGeometry::plan(2048, 64, 8)?;
    let adapter = EccEngineAdapter::new(&geo, geo.ecc_strength);
    Ok((geo, adapter))
}

#[test]
fn test_interpret_status() -> anyhow::Result<()> {
    let (_, adapter) = test_adapter()?;

    let report = adapter.interpret_status(&[0x00, 0xFF, 0x03, 0x01]);
    assert_eq!(
        report.chunks,
        [
            EccChunkStatus::Clean,
            EccChunkStatus::Clean,
            EccChunkStatus::Corrected(3),
            EccChunkStatus::Corrected(1)
        ]
    );
    assert_eq!(report.corrected, 4);
    assert_eq!(report.max_bitflips, 3);
    assert_eq!(report.uncorrectable_chunks(), 0);

    let report = adapter.interpret_status(&[0xFE, 0x02, 0xFE, 0x00]);
    assert_eq!(report.uncorrectable_chunks(), 2);
    Ok(())
}

#[test]
fn test_record() -> anyhow::Result<()> {
    let (_, mut adapter) = test_adapter()?;

    adapter.record(&adapter.interpret_status(&[0x02, 0x00, 0x01, 0x00]));
    adapter.record(&adapter.interpret_status(&[0xFE, 0x05, 0x00, 0xFE]));
    assert_eq!(
        adapter.stats(),
        EccStats {
            corrected: 3,
            failed: 1
        }
    );
    Ok(())
}

#[test]
fn test_check_erased() -> anyhow::Result<()> {
    let (geo, adapter) = test_adapter()?;

    let mut data = vec![0xFFu8; geo.page_size];
    let mut oob = vec![0xFFu8; geo.oob_size];
    assert_eq!(adapter.check_erased(&geo, &data, &oob), Some(0));

    // Zeros split between data and parity are reported together
    data[100] = 0b1110_1110;
    oob[geo.oob_ecc_range().start] = 0b0111_1110;
    assert_eq!(adapter.check_erased(&geo, &data, &oob), Some(4));

    // Metadata is not inspected
    oob[3] = 0x00;
    assert_eq!(adapter.check_erased(&geo, &data, &oob), Some(4));

    // Each region within the threshold (8), 12 in total
    data[200] = 0b1111_0000;
    oob[geo.oob_ecc_range().start + 1] = 0b1111_0000;
    assert_eq!(adapter.check_erased(&geo, &data, &oob), Some(12));

    // Over the threshold in the data alone
    data[201] = 0b1111_1000;
    assert_eq!(adapter.check_erased(&geo, &data, &oob), None);

    // Over the threshold in the parity alone
    let data = vec![0xFFu8; geo.page_size];
    let mut oob = vec![0xFFu8; geo.oob_size];
    oob[geo.oob_ecc_range().start..][..2].fill(0x00);
    assert_eq!(adapter.check_erased(&geo, &data, &oob), None);
    Ok(())
}
