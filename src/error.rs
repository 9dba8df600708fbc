//! Error types of the page I/O engine.

use thiserror::Error;

use crate::hw::{HwError, OperationClass};

/// The device parameters do not describe a layout this controller family supports.
///
/// This is only ever produced while planning the geometry, which happens at probe time.
#[derive(Error, Debug, Clone, Copy, Eq, PartialEq)]
pub enum GeometryError {
    #[error("unsupported layout: {page_size}+{oob_size} byte page at ECC strength {strength}")]
    Unsupported {
        page_size: usize,
        oob_size: usize,
        strength: u32,
    },
}

#[derive(Error, Debug)]
pub enum NandError {
    #[error(transparent)]
    Geometry(#[from] GeometryError),

    /// A command was issued out of sequence; only the offending call fails.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// A chain needed more descriptors than the pool holds. This is a bug in the caller.
    #[error("descriptor pool exhausted: {requested} steps requested, {capacity} available")]
    DescriptorExhausted { requested: usize, capacity: usize },

    /// The hardware did not complete in time. The target buffer is undefined.
    #[error("timed out waiting for {0:?} operation")]
    Timeout(OperationClass),

    /// The page failed both hardware correction and erased-page detection.
    #[error("uncorrectable ECC error in page {page} ({chunks} chunk(s) failed)")]
    EccUncorrectable { page: u32, chunks: u32 },

    /// The block carries a bad-block marker; the caller decides whether to skip it.
    #[error("block {0} is marked bad")]
    BadBlockMarked(u32),

    /// The chip reported a failed program or erase in its status register.
    #[error("{op} failed at row {row:#x} (status {status:#04x})")]
    OperationFailed {
        op: &'static str,
        row: u32,
        status: u8,
    },

    #[error("{what} {index} out of range")]
    OutOfRange { what: &'static str, index: u32 },

    #[error("{what} buffer is {actual} bytes, expected {expected}")]
    InvalidBuffer {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("probe failed: {0}")]
    Probe(String),

    #[error(transparent)]
    Hardware(HwError),
}

pub type Result<T, E = NandError> = std::result::Result<T, E>;
