//! The command/address/data protocol spoken to the chip.
//!
//! Reads are simple: the setup (READ0 + address) is latched immediately and the trigger
//! (READSTART) starts a chain that waits for the array and fetches the data. Programs are split:
//! [CommandSequencer::setup_program] only records the setup and the payload to send with it, and
//! nothing reaches the bus until the payload is flushed, either by a following setup (which
//! flushes without programming) or by [CommandSequencer::trigger_program]. This lets a page be
//! assembled from several column ranges before a single PAGEPROG.

use std::ops::Range;
use std::time::Duration;

use log::{debug, error, trace, warn};

use crate::config::Timeouts;
use crate::error::{NandError, Result};
use crate::hw::{Direction, HwError, NandHardware, OperationClass, Step};
use crate::transfer::TransferOrchestrator;

pub mod opcode {
    pub const READ0: u8 = 0x00;
    pub const READSTART: u8 = 0x30;
    pub const RNDOUT: u8 = 0x05;
    pub const RNDOUTSTART: u8 = 0xE0;
    pub const SEQIN: u8 = 0x80;
    pub const RNDIN: u8 = 0x85;
    pub const PAGEPROG: u8 = 0x10;
    pub const ERASE1: u8 = 0x60;
    pub const ERASE2: u8 = 0xD0;
    pub const STATUS: u8 = 0x70;
    pub const READID: u8 = 0x90;
    pub const PARAM: u8 = 0xEC;
    pub const RESET: u8 = 0xFF;
}

use opcode::*;

/// Status register: the last program or erase failed
pub const STATUS_FAIL: u8 = 0x01;

/// A program setup that has been requested but not yet put on the bus
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum PendingSetup {
    #[default]
    None,

    /// Start a new program at `column` of page `row`
    SeqIn { column: u16, row: u32 },

    /// Move the column pointer of the open program
    RandIn { column: u16 },
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum SequencerState {
    #[default]
    Idle,
    SetupQueued,
    DataPhase,
    WaitReady,
}

/// Bytes of the scratch buffer moved by one data phase
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct Payload {
    /// Crosses the main-area lane
    pub main: Range<usize>,

    /// Crosses the spare-area lane, after `main`
    pub spare: Range<usize>,

    /// Route through the ECC accelerator (which must already be configured)
    pub ecc: bool,
}

impl Payload {
    pub fn main(main: Range<usize>) -> Self {
        Self {
            spare: main.end..main.end,
            main,
            ecc: false,
        }
    }

    pub fn spare(spare: Range<usize>) -> Self {
        Self {
            main: spare.start..spare.start,
            spare,
            ecc: false,
        }
    }

    pub fn split(main: Range<usize>, spare: Range<usize>) -> Self {
        Self {
            main,
            spare,
            ecc: false,
        }
    }

    pub fn with_ecc(mut self) -> Self {
        self.ecc = true;
        self
    }

    /// The steps moving this payload, appended to `steps`
    fn steps(&self, direction: Direction, steps: &mut Vec<Step>) {
        if self.ecc {
            steps.push(Step::EnableEcc);
        }
        steps.push(Step::Data {
            direction,
            main: self.main.clone(),
            spare: self.spare.clone(),
        });
    }
}

#[derive(Debug)]
pub struct CommandSequencer {
    transfer: TransferOrchestrator,
    timeouts: Timeouts,
    poll_interval: Duration,

    state: SequencerState,
    pending: PendingSetup,
    payload: Payload,

    /// Row of the program opened by the last SEQIN, until it is triggered
    program_row: Option<u32>,
}

impl CommandSequencer {
    pub fn new(timeouts: Timeouts, poll_interval: Duration) -> Self {
        Self {
            transfer: TransferOrchestrator::new(),
            timeouts,
            poll_interval,
            state: Default::default(),
            pending: Default::default(),
            payload: Default::default(),
            program_row: None,
        }
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    pub fn pending(&self) -> PendingSetup {
        self.pending
    }

    pub fn transfer(&self) -> &TransferOrchestrator {
        &self.transfer
    }

    /// Drop whatever a previous, failed or abandoned program left behind
    fn discard_stale(&mut self) {
        if self.pending != PendingSetup::None || self.program_row.is_some() {
            warn!(
                "discarding stale program setup {:?} (row {:?})",
                self.pending, self.program_row
            );
        }
        self.pending = PendingSetup::None;
        self.payload = Default::default();
        self.program_row = None;
        self.state = SequencerState::Idle;
    }

    fn run<H: NandHardware>(
        &mut self,
        hw: &mut H,
        buffer: &mut [u8],
        steps: &[Step],
        class: OperationClass,
    ) -> Result<()> {
        let result = self
            .transfer
            .run(hw, buffer, steps, class, &self.timeouts);
        if result.is_err() {
            self.state = SequencerState::Idle;
        }
        result
    }

    /// Read `payload` from page `row`, starting at `column`
    pub fn read<H: NandHardware>(
        &mut self,
        hw: &mut H,
        buffer: &mut [u8],
        column: u16,
        row: u32,
        payload: &Payload,
    ) -> Result<()> {
        self.discard_stale();
        trace!("read row {row:#x} column {column:#x}");

        hw.issue_command(READ0);
        hw.set_column_address(column);
        hw.set_row_address(row);
        self.state = SequencerState::SetupQueued;

        let mut steps = vec![Step::Command(READSTART), Step::WaitReady];
        payload.steps(Direction::In, &mut steps);
        self.state = SequencerState::DataPhase;
        self.run(hw, buffer, &steps, OperationClass::Read)?;

        self.state = SequencerState::Idle;
        Ok(())
    }

    /// Queue a program setup along with the payload to send after it.
    ///
    /// A setup already pending is flushed first, without programming.
    pub fn setup_program<H: NandHardware>(
        &mut self,
        hw: &mut H,
        buffer: &mut [u8],
        setup: PendingSetup,
        payload: Payload,
    ) -> Result<()> {
        match setup {
            PendingSetup::None => return Err(self.violation("empty program setup")),
            PendingSetup::RandIn { .. }
                if self.program_row.is_none() && self.pending == PendingSetup::None =>
            {
                return Err(self.violation("RNDIN without an open program"));
            }
            _ => (),
        }

        if self.pending != PendingSetup::None {
            self.flush(hw, buffer)?;
        }

        self.pending = setup;
        self.payload = payload;
        self.state = SequencerState::SetupQueued;
        Ok(())
    }

    /// Put the pending setup and its payload on the bus
    fn flush<H: NandHardware>(&mut self, hw: &mut H, buffer: &mut [u8]) -> Result<()> {
        let payload = std::mem::take(&mut self.payload);
        match std::mem::take(&mut self.pending) {
            PendingSetup::None => return Ok(()),
            PendingSetup::SeqIn { column, row } => {
                trace!("program row {row:#x} column {column:#x}");
                hw.issue_command(SEQIN);
                hw.set_column_address(column);
                hw.set_row_address(row);
                self.program_row = Some(row);
            }
            PendingSetup::RandIn { column } => {
                trace!("program column {column:#x}");
                hw.issue_command(RNDIN);
                hw.set_column_address(column);
            }
        }

        let mut steps = Vec::with_capacity(2);
        payload.steps(Direction::Out, &mut steps);
        self.state = SequencerState::DataPhase;
        self.run(hw, buffer, &steps, OperationClass::Program)
    }

    /// Flush the pending setup and program the page
    pub fn trigger_program<H: NandHardware>(&mut self, hw: &mut H, buffer: &mut [u8]) -> Result<()> {
        if self.pending == PendingSetup::None {
            return Err(self.violation("PAGEPROG without a pending setup"));
        }

        self.flush(hw, buffer)?;
        let row = self.program_row.take().unwrap_or_default();

        self.state = SequencerState::WaitReady;
        self.run(
            hw,
            buffer,
            &[Step::Command(PAGEPROG), Step::WaitReady],
            OperationClass::Program,
        )?;
        self.state = SequencerState::Idle;

        self.check_status(hw, buffer, "program", row)
    }

    /// Erase the block containing page `row`
    pub fn erase<H: NandHardware>(&mut self, hw: &mut H, buffer: &mut [u8], row: u32) -> Result<()> {
        self.discard_stale();
        debug!("erase row {row:#x}");

        hw.issue_command(ERASE1);
        hw.set_row_address(row);
        self.state = SequencerState::WaitReady;
        self.run(
            hw,
            buffer,
            &[Step::Command(ERASE2), Step::WaitReady],
            OperationClass::Erase,
        )?;
        self.state = SequencerState::Idle;

        self.check_status(hw, buffer, "erase", row)
    }

    fn check_status<H: NandHardware>(
        &mut self,
        hw: &mut H,
        buffer: &mut [u8],
        op: &'static str,
        row: u32,
    ) -> Result<()> {
        let status = self.read_status(hw, buffer)?;
        if status & STATUS_FAIL != 0 {
            warn!("{op} failed at row {row:#x}, status {status:#04x}");
            return Err(NandError::OperationFailed { op, row, status });
        }
        Ok(())
    }

    /// Read the status register. Uses the first byte of `buffer`.
    pub fn read_status<H: NandHardware>(&mut self, hw: &mut H, buffer: &mut [u8]) -> Result<u8> {
        hw.issue_command(STATUS);
        self.state = SequencerState::DataPhase;
        self.run(
            hw,
            buffer,
            &[Step::Data {
                direction: Direction::In,
                main: 0..1,
                spare: 1..1,
            }],
            OperationClass::Status,
        )?;
        self.state = SequencerState::Idle;
        Ok(buffer[0])
    }

    /// Issue a command answered with a block of data, and fetch `len` bytes of it
    fn one_shot<H: NandHardware>(
        &mut self,
        hw: &mut H,
        buffer: &mut [u8],
        command: u8,
        len: usize,
    ) -> Result<Vec<u8>> {
        self.discard_stale();
        if len > buffer.len() {
            return Err(NandError::InvalidBuffer {
                what: "scratch",
                expected: len,
                actual: buffer.len(),
            });
        }

        hw.issue_command(command);
        hw.set_column_address(0);
        self.state = SequencerState::DataPhase;
        self.run(
            hw,
            buffer,
            &[
                Step::WaitReady,
                Step::Data {
                    direction: Direction::In,
                    main: 0..len,
                    spare: len..len,
                },
            ],
            OperationClass::Read,
        )?;
        self.state = SequencerState::Idle;
        Ok(buffer[..len].to_vec())
    }

    pub fn read_id<H: NandHardware>(
        &mut self,
        hw: &mut H,
        buffer: &mut [u8],
        len: usize,
    ) -> Result<Vec<u8>> {
        self.one_shot(hw, buffer, READID, len)
    }

    pub fn read_param_page<H: NandHardware>(
        &mut self,
        hw: &mut H,
        buffer: &mut [u8],
        len: usize,
    ) -> Result<Vec<u8>> {
        self.one_shot(hw, buffer, PARAM, len)
    }

    /// Reset the selected chip and wait for it to come back
    pub fn reset<H: NandHardware>(&mut self, hw: &mut H) -> Result<()> {
        self.discard_stale();
        hw.issue_command(RESET);

        self.state = SequencerState::WaitReady;
        let result = hw.wait_ready(self.timeouts.erase, self.poll_interval);
        self.state = SequencerState::Idle;
        result.map_err(|e| match e {
            HwError::Timeout => NandError::Timeout(OperationClass::Erase),
            e => NandError::Hardware(e),
        })
    }

    fn violation(&self, what: &'static str) -> NandError {
        error!("protocol violation: {what}");
        NandError::ProtocolViolation(what)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hw::{CommandPort, EccAccelerator, EccMode};
    use crate::nand::sim::{BusEvent, SimNand, SIM_ID, TEST_LAYOUT};

    fn setup() -> (SimNand, CommandSequencer, Vec<u8>) {
        let mut sim = SimNand::new(TEST_LAYOUT, 64);
        sim.select_chip(Some(0));
        sim.take_trace();

        let timeouts = Timeouts {
            status: Duration::from_millis(2),
            read: Duration::from_millis(2),
            program: Duration::from_millis(2),
            erase: Duration::from_millis(5),
        };
        let seq = CommandSequencer::new(timeouts, Duration::from_millis(1));
        (sim, seq, vec![0u8; 2048 + 64])
    }

    #[test]
    fn test_read_sequence() -> anyhow::Result<()> {
        let (mut sim, mut seq, mut buf) = setup();

        seq.read(&mut sim, &mut buf, 0, 5, &Payload::split(0..2048, 2048..2112))?;
        assert_eq!(
            sim.take_trace(),
            [
                BusEvent::Command(READ0),
                BusEvent::Column(0),
                BusEvent::Row(5),
                BusEvent::Command(READSTART),
                BusEvent::WaitReady,
                BusEvent::DataIn {
                    len: 2112,
                    ecc: false
                },
            ]
        );
        assert!(buf.iter().all(|&x| x == 0xFF));
        assert_eq!(seq.state(), SequencerState::Idle);
        Ok(())
    }

    #[test]
    fn test_program_deferred() -> anyhow::Result<()> {
        let (mut sim, mut seq, mut buf) = setup();
        buf[..4].copy_from_slice(&[1, 2, 3, 4]);

        seq.setup_program(
            &mut sim,
            &mut buf,
            PendingSetup::SeqIn { column: 0, row: 9 },
            Payload::main(0..4),
        )?;
        assert!(sim.take_trace().is_empty());
        assert_eq!(seq.state(), SequencerState::SetupQueued);

        seq.trigger_program(&mut sim, &mut buf)?;
        assert_eq!(
            sim.take_trace(),
            [
                BusEvent::Command(SEQIN),
                BusEvent::Column(0),
                BusEvent::Row(9),
                BusEvent::DataOut { len: 4, ecc: false },
                BusEvent::Command(PAGEPROG),
                BusEvent::WaitReady,
                BusEvent::Command(STATUS),
                BusEvent::DataIn { len: 1, ecc: false },
            ]
        );
        assert_eq!(sim.cells(0, 9).map(|x| x[..5].to_vec()), Some(vec![1, 2, 3, 4, 0xFF]));
        Ok(())
    }

    #[test]
    fn test_setup_flushes_pending() -> anyhow::Result<()> {
        let (mut sim, mut seq, mut buf) = setup();
        buf[2048] = 0x12;

        seq.setup_program(
            &mut sim,
            &mut buf,
            PendingSetup::SeqIn { column: 0, row: 3 },
            Payload::main(0..16),
        )?;
        seq.setup_program(
            &mut sim,
            &mut buf,
            PendingSetup::RandIn { column: 2048 },
            Payload::spare(2048..2049),
        )?;

        // The first setup went out with its data, but no PAGEPROG
        assert_eq!(
            sim.take_trace(),
            [
                BusEvent::Command(SEQIN),
                BusEvent::Column(0),
                BusEvent::Row(3),
                BusEvent::DataOut { len: 16, ecc: false },
            ]
        );

        seq.trigger_program(&mut sim, &mut buf)?;
        let trace = sim.take_trace();
        assert_eq!(trace[..3], [
            BusEvent::Command(RNDIN),
            BusEvent::Column(2048),
            BusEvent::DataOut { len: 1, ecc: false },
        ]);
        assert_eq!(trace[3], BusEvent::Command(PAGEPROG));
        assert_eq!(sim.cells(0, 3).map(|x| x[2048]), Some(0x12));
        Ok(())
    }

    #[test]
    fn test_consecutive_column_changes() -> anyhow::Result<()> {
        let (mut sim, mut seq, mut buf) = setup();
        buf[..16].fill(0x11);
        buf[100..104].fill(0x22);
        buf[2048..2050].fill(0x34);

        seq.setup_program(
            &mut sim,
            &mut buf,
            PendingSetup::SeqIn { column: 0, row: 4 },
            Payload::main(0..16),
        )?;
        seq.setup_program(
            &mut sim,
            &mut buf,
            PendingSetup::RandIn { column: 100 },
            Payload::main(100..104),
        )?;
        seq.setup_program(
            &mut sim,
            &mut buf,
            PendingSetup::RandIn { column: 2048 },
            Payload::spare(2048..2050),
        )?;

        // Each column change went out with its data before the next one, none programmed
        assert_eq!(
            sim.take_trace(),
            [
                BusEvent::Command(SEQIN),
                BusEvent::Column(0),
                BusEvent::Row(4),
                BusEvent::DataOut { len: 16, ecc: false },
                BusEvent::Command(RNDIN),
                BusEvent::Column(100),
                BusEvent::DataOut { len: 4, ecc: false },
            ]
        );
        assert_eq!(sim.cells(0, 4), None);

        seq.trigger_program(&mut sim, &mut buf)?;
        let trace = sim.take_trace();
        assert_eq!(trace[..3], [
            BusEvent::Command(RNDIN),
            BusEvent::Column(2048),
            BusEvent::DataOut { len: 2, ecc: false },
        ]);
        let programs = trace
            .iter()
            .filter(|&x| *x == BusEvent::Command(PAGEPROG))
            .count();
        assert_eq!(programs, 1);

        let cells = sim.cells(0, 4).unwrap();
        assert_eq!(cells[..16], [0x11; 16]);
        assert_eq!(cells[16..100], [0xFF; 84]);
        assert_eq!(cells[100..104], [0x22; 4]);
        assert_eq!(cells[2048..2050], [0x34; 2]);
        assert_eq!(seq.pending(), PendingSetup::None);
        Ok(())
    }

    #[test]
    fn test_protocol_violations() {
        let (mut sim, mut seq, mut buf) = setup();

        assert!(matches!(
            seq.trigger_program(&mut sim, &mut buf),
            Err(NandError::ProtocolViolation(_))
        ));
        assert!(matches!(
            seq.setup_program(
                &mut sim,
                &mut buf,
                PendingSetup::RandIn { column: 0 },
                Payload::main(0..1)
            ),
            Err(NandError::ProtocolViolation(_))
        ));
        assert!(matches!(
            seq.setup_program(&mut sim, &mut buf, PendingSetup::None, Payload::main(0..1)),
            Err(NandError::ProtocolViolation(_))
        ));

        // Nothing reached the device
        assert!(sim.take_trace().is_empty());
        assert_eq!(sim.cells(0, 0), None);
    }

    #[test]
    fn test_stale_setup_discarded() -> anyhow::Result<()> {
        let (mut sim, mut seq, mut buf) = setup();

        seq.setup_program(
            &mut sim,
            &mut buf,
            PendingSetup::SeqIn { column: 0, row: 1 },
            Payload::main(0..16),
        )?;
        seq.read(&mut sim, &mut buf, 0, 2, &Payload::main(0..16))?;
        assert_eq!(seq.pending(), PendingSetup::None);

        assert!(matches!(
            seq.trigger_program(&mut sim, &mut buf),
            Err(NandError::ProtocolViolation(_))
        ));
        assert!(!sim
            .take_trace()
            .iter()
            .any(|x| matches!(x, BusEvent::Command(SEQIN | PAGEPROG))));
        Ok(())
    }

    #[test]
    fn test_erase_failure() -> anyhow::Result<()> {
        let (mut sim, mut seq, mut buf) = setup();

        sim.flip_bit(0, 8, 0)?;
        seq.erase(&mut sim, &mut buf, 8)?;
        assert_eq!(sim.cells(0, 8), None);
        assert_eq!(
            sim.take_trace(),
            [
                BusEvent::Command(ERASE1),
                BusEvent::Row(8),
                BusEvent::Command(ERASE2),
                BusEvent::WaitReady,
                BusEvent::Command(STATUS),
                BusEvent::DataIn { len: 1, ecc: false },
            ]
        );

        sim.fail_block(0, 2);
        assert!(matches!(
            seq.erase(&mut sim, &mut buf, 16),
            Err(NandError::OperationFailed {
                op: "erase",
                row: 16,
                ..
            })
        ));
        Ok(())
    }

    #[test]
    fn test_ecc_program_chain() -> anyhow::Result<()> {
        let (mut sim, mut seq, mut buf) = setup();
        sim.configure(4, 8, EccMode::Encode);

        seq.setup_program(
            &mut sim,
            &mut buf,
            PendingSetup::SeqIn { column: 0, row: 0 },
            Payload::split(0..2048, 2048..2058).with_ecc(),
        )?;
        seq.trigger_program(&mut sim, &mut buf)?;
        assert!(sim.take_trace().contains(&BusEvent::DataOut {
            len: 2058,
            ecc: true
        }));
        assert!(sim.cells(0, 0).is_some());
        Ok(())
    }

    #[test]
    fn test_timeouts() {
        let (mut sim, mut seq, mut buf) = setup();
        sim.set_stuck_busy(true);

        assert!(matches!(
            seq.read(&mut sim, &mut buf, 0, 0, &Payload::main(0..16)),
            Err(NandError::Timeout(OperationClass::Read))
        ));
        assert!(matches!(
            seq.erase(&mut sim, &mut buf, 0),
            Err(NandError::Timeout(OperationClass::Erase))
        ));
        assert!(matches!(
            seq.reset(&mut sim),
            Err(NandError::Timeout(OperationClass::Erase))
        ));
        assert_eq!(seq.state(), SequencerState::Idle);
        assert_eq!(seq.transfer().available(), crate::transfer::DESCRIPTOR_COUNT);
    }

    #[test]
    fn test_read_id() -> anyhow::Result<()> {
        let (mut sim, mut seq, mut buf) = setup();

        seq.reset(&mut sim)?;
        assert_eq!(seq.read_id(&mut sim, &mut buf, 2)?, SIM_ID[..2]);
        assert_eq!(seq.read_param_page(&mut sim, &mut buf, 4)?, b"ONFI");
        assert_eq!(
            sim.take_trace()[..4],
            [
                BusEvent::Command(RESET),
                BusEvent::Command(READID),
                BusEvent::Column(0),
                BusEvent::WaitReady,
            ]
        );
        Ok(())
    }
}
