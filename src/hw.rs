//! The interface to the controller hardware.
//!
//! The driver never touches registers itself; a board crate (or [crate::nand::sim::SimNand])
//! implements these traits on top of the GPMI block, its DMA engine and the BCH accelerator.

use std::ops::Range;
use std::time::Duration;

use retry::{delay::Fixed, retry};
use thiserror::Error;

/// Failures reported by a hardware backend
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum HwError {
    #[error("hardware did not complete in time")]
    Timeout,

    #[error("hardware fault: {0}")]
    Fault(String),
}

/// Operation classes, each with its own completion budget
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OperationClass {
    Status,
    Read,
    Program,
    Erase,
}

/// What the ECC accelerator does to data crossing it
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum EccMode {
    /// Data crosses untouched (raw access)
    #[default]
    Bypass,

    /// Parity is generated while writing
    Encode,

    /// Data is checked and corrected while reading
    Decode,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Direction {
    /// From the chip into memory
    In,

    /// From memory to the chip
    Out,
}

/// One step of a transfer chain.
///
/// Ranges refer to the buffer passed alongside the chain to [TransferEngine::submit_chain].
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub enum Step {
    /// Block until the chip deasserts busy
    #[default]
    WaitReady,

    /// Clock a command byte onto the bus
    Command(u8),

    /// Route the next data step through the ECC accelerator, in the mode it was configured for.
    ///
    /// The accelerator falls back to bypass at the end of every chain.
    EnableEcc,

    /// Move data. `main` crosses the main-area lane, then `spare` crosses the spare-area lane.
    ///
    /// The spare lane of this controller family has its data lines mirrored (D0 on D7 and so on),
    /// so each byte arrives with its bit order reversed unless the host compensates.
    Data {
        direction: Direction,
        main: Range<usize>,
        spare: Range<usize>,
    },
}

/// Identifies a submitted chain
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ChainToken(pub u64);

/// The command/address side of the NAND bus
pub trait CommandPort {
    /// Assert the chip-select of chip `chip`, or deassert all of them
    fn select_chip(&mut self, chip: Option<usize>);

    /// Latch a command byte (CLE cycle)
    fn issue_command(&mut self, command: u8);

    /// Latch a column address (two ALE cycles)
    fn set_column_address(&mut self, column: u16);

    /// Latch a row address (three ALE cycles)
    fn set_row_address(&mut self, row: u32);

    /// Sample the ready/busy line
    fn poll_ready(&mut self) -> bool;

    /// Wait until the chip is ready, giving up after `timeout`.
    ///
    /// The provided implementation busy-polls [CommandPort::poll_ready] every `interval`;
    /// interrupt-driven backends should override it.
    fn wait_ready(&mut self, timeout: Duration, interval: Duration) -> Result<(), HwError> {
        let interval_us = interval.as_micros().max(1);
        let attempts = (timeout.as_micros() / interval_us).max(1) as usize;

        retry(Fixed::from_millis(interval.as_millis() as u64).take(attempts), || {
            if self.poll_ready() {
                Ok(())
            } else {
                Err(())
            }
        })
        .map_err(|_| HwError::Timeout)
    }
}

/// The DMA engine that executes transfer chains
pub trait TransferEngine {
    /// Start executing `steps` in order against `buffer`
    fn submit_chain(&mut self, steps: &[Step], buffer: &mut [u8]) -> Result<ChainToken, HwError>;

    /// Block until the chain behind `token` completes, fails, or `timeout` passes
    fn wait_completion(&mut self, token: ChainToken, timeout: Duration) -> Result<(), HwError>;
}

/// The BCH accelerator
pub trait EccAccelerator {
    /// Program the chunk count, correction strength and mode for the next transfer
    fn configure(&mut self, chunk_count: usize, strength: u32, mode: EccMode);

    /// Fetch the per-chunk status bytes of the last decode, one per chunk
    fn read_status(&mut self, status: &mut [u8]);
}

/// Everything the driver needs from a controller
pub trait NandHardware: CommandPort + TransferEngine + EccAccelerator {}

impl<T: CommandPort + TransferEngine + EccAccelerator> NandHardware for T {}
