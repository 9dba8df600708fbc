//! Page I/O engine for NAND flash behind a GPMI-style controller with a BCH ECC accelerator.
//!
//! The [Controller](controller::Controller) owns the hardware handle, the scratch buffer and the
//! transfer descriptor pool, and exposes page-level reads, writes, erases and bad-block handling.
//! Everything below it is split by concern:
//!
//! - [geometry]: page/ECC/OOB layout planning and the raw bit-stream layout
//! - [block_mark]: relocation of the bad-block marker around the ECC engine's view of the page
//! - [transfer]: descriptor chains and the spare-lane byte handling
//! - [ecc]: accelerator configuration, status interpretation and erased-page detection
//! - [command]: the command/address/data protocol state machine
//! - [bbm]: bad-block marking, checking and the refresh tag
//!
//! [nand::sim] contains a software model of the whole controller, used by the tests and by the
//! `nandsim` tool.

pub mod bbm;
pub mod bits;
pub mod block_mark;
pub mod command;
pub mod config;
pub mod controller;
pub mod ecc;
pub mod error;
pub mod geometry;
pub mod hw;
pub mod logger;
pub mod nand;
pub mod onfi;
pub mod skip_bad;
pub mod transfer;

pub use config::NandConfig;
pub use controller::{Controller, PageBuffer, PageData, PageRead};
pub use error::{GeometryError, NandError};
pub use geometry::FlashGeometry;
