//! Drive the page I/O engine against a simulated NAND array kept in an image file.
//!
//! Each invocation loads the image, probes it like real hardware, runs one command and writes the
//! image back if the command changed it.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

use bch_nand::{
    config::Timeouts,
    logger::StderrLogger,
    nand::{sim::SimNand, NandLayout},
    skip_bad::{read_skip_bad, write_skip_bad},
    Controller, NandConfig, NandError, PageBuffer, PageData,
};

#[derive(Args, Debug)]
struct SimOptions {
    /// Path to the simulated NAND image
    #[clap(long)]
    image: PathBuf,

    /// Create a blank image with this layout (BLOCKSxPAGESxBYTES) instead of loading one
    #[clap(long)]
    create: Option<NandLayout>,

    /// Spare bytes per page of a created image
    #[clap(long, default_value_t = 64, requires = "create")]
    oob_size: usize,

    /// Chip-selects of a created image
    #[clap(long, default_value_t = 1, requires = "create")]
    chips: usize,
}

impl SimOptions {
    fn open(&self) -> Result<SimNand> {
        match self.create {
            Some(layout) => Ok(SimNand::new(layout, self.oob_size).with_chips(self.chips)),
            None => SimNand::load(&mut File::open(&self.image)?),
        }
    }

    fn save(&self, sim: &SimNand) -> Result<()> {
        sim.save(&mut File::create(&self.image)?)
    }
}

#[derive(Args, Debug)]
struct DriverOptions {
    /// Correctable bits per 512-byte chunk (default: strongest the OOB allows)
    #[clap(long)]
    ecc_strength: Option<u32>,

    /// Zero bits tolerated in a page still treated as erased (default: the ECC strength)
    #[clap(long)]
    bitflip_threshold: Option<u32>,

    /// Reserve 4 bytes of the free OOB for the origin-block tag
    #[clap(long)]
    refresh_tag: bool,

    /// Operation budgets in milliseconds, as STATUSxREADxPROGRAMxERASE
    #[clap(long)]
    timeouts: Option<Timeouts>,

    /// How many chip-selects to probe
    #[clap(long, default_value_t = 1)]
    max_chips: usize,
}

impl From<&DriverOptions> for NandConfig {
    fn from(options: &DriverOptions) -> Self {
        let mut config = NandConfig::default().max_chips(options.max_chips);
        if let Some(strength) = options.ecc_strength {
            config = config.ecc_strength(strength);
        }
        if let Some(threshold) = options.bitflip_threshold {
            config = config.bitflip_threshold(threshold);
        }
        if options.refresh_tag {
            config = config.refresh_tag();
        }
        if let Some(timeouts) = options.timeouts {
            config = config.timeouts(timeouts);
        }
        config
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the chip identity and the planned page layout
    Geometry,

    /// Read one page, writing its main data to a file or stdout
    Read {
        page: u32,

        /// Bypass ECC and dump data followed by the whole OOB
        #[clap(long)]
        raw: bool,

        #[clap(long)]
        out: Option<PathBuf>,
    },

    /// Program one page from a file
    Write {
        page: u32,
        path: PathBuf,

        /// Bypass ECC; the file holds data followed by the whole OOB
        #[clap(long)]
        raw: bool,

        /// Block number to store in the refresh tag
        #[clap(long)]
        origin: Option<u32>,
    },

    /// Erase one block
    Erase { block: u32 },

    /// Mark one block bad
    MarkBad { block: u32 },

    /// List blocks whose marker says they are bad
    Scan,

    /// Flip one bit of the stored array, as seen from the bus
    Flip { page: u32, bit: usize },

    /// Write a raw image over consecutive good blocks
    WriteImage {
        path: PathBuf,

        #[clap(long, default_value_t = 0)]
        start_block: u32,

        /// Read the image back and compare it after writing
        #[clap(long)]
        verify: bool,
    },

    /// Read every page and report ECC statistics
    Stats,
}

impl Command {
    fn modifies(&self) -> bool {
        !matches!(
            self,
            Command::Geometry | Command::Read { .. } | Command::Scan | Command::Stats
        )
    }

    fn execute(self, ctrl: &mut Controller<SimNand>) -> Result<()> {
        let geo = *ctrl.geometry();
        let layout = ctrl.layout();

        match self {
            Command::Geometry => {
                println!("ID:        {:02x?}", ctrl.identify());
                println!("Chips:     {}", ctrl.chips());
                println!(
                    "Layout:    {} blocks x {} pages x {} bytes",
                    layout.blocks, layout.pages_per_block, layout.bytes_per_page
                );
                println!("OOB:       {} bytes", geo.oob_size);
                println!(
                    "ECC:       {} x {} bytes, t={} ({} bytes parity per chunk)",
                    geo.chunk_count, geo.chunk_size, geo.ecc_strength, geo.ecc_bytes_per_chunk
                );
                println!("Metadata:  {} bytes", geo.metadata_size);
                println!("User OOB:  {} bytes", ctrl.user_oob_len());
                println!(
                    "Marker:    data byte {} (bit offset {})",
                    geo.block_mark_byte_offset(),
                    geo.block_mark_bit_offset
                );
            }

            Command::Read { page, raw, out } => {
                let mut data = vec![0u8; geo.page_size];
                let contents = if raw {
                    let mut oob = vec![0u8; geo.oob_size];
                    ctrl.read_page_raw(page, &mut data, &mut oob)?;
                    data.extend(oob);
                    data
                } else {
                    let mut oob = vec![0u8; ctrl.user_oob_len()];
                    let read = ctrl.read_page(
                        page,
                        PageBuffer {
                            data: &mut data,
                            oob: &mut oob,
                        },
                    )?;
                    eprintln!("ECC: {:?}", read.ecc);
                    if let Some(origin) = read.origin_block {
                        eprintln!("Origin block: {origin}");
                    }
                    data
                };

                match out {
                    Some(path) => File::create(path)?.write_all(&contents)?,
                    None => io::stdout().lock().write_all(&contents)?,
                }
            }

            Command::Write {
                page,
                path,
                raw,
                origin,
            } => {
                anyhow::ensure!(
                    origin.is_none() || ctrl.config().refresh_tag,
                    "--origin needs --refresh-tag"
                );

                let mut contents = std::fs::read(path)?;
                if raw {
                    contents.resize(geo.page_size + geo.oob_size, 0xFF);
                    let (data, oob) = contents.split_at(geo.page_size);
                    ctrl.write_page_raw(page, data, oob)?;
                } else {
                    contents.resize(geo.page_size, 0xFF);
                    ctrl.write_page(
                        page,
                        PageData {
                            origin_block: origin,
                            ..PageData::new(&contents)
                        },
                    )?;
                }
            }

            Command::Erase { block } => ctrl.erase_block(block)?,

            Command::MarkBad { block } => ctrl.mark_bad(block)?,

            Command::Scan => {
                for block in ctrl.scan_bad_blocks()? {
                    println!("{block}");
                }
            }

            Command::Flip { page, bit } => {
                let pages_per_chip = layout.pages() / ctrl.chips() as u32;
                let chip = (page / pages_per_chip) as usize;
                ctrl.hardware_mut()
                    .flip_bit(chip, page % pages_per_chip, bit)?;
            }

            Command::WriteImage {
                path,
                start_block,
                verify,
            } => {
                let image = std::fs::read(path)?;
                let end = write_skip_bad(ctrl, &mut &image[..], start_block)?;
                println!("Blocks {start_block}..{end}");

                if verify {
                    let mut readback = Vec::with_capacity(image.len());
                    read_skip_bad(ctrl, start_block, image.len(), &mut readback)?;
                    anyhow::ensure!(readback == image, "verification failed");
                    println!("Verified");
                }
            }

            Command::Stats => {
                let mut data = vec![0u8; geo.page_size];
                let mut uncorrectable = Vec::new();
                for page in 0..layout.pages() {
                    let buf = PageBuffer {
                        data: &mut data,
                        oob: &mut [],
                    };
                    match ctrl.read_page(page, buf) {
                        Ok(_) => (),
                        Err(NandError::EccUncorrectable { .. }) => uncorrectable.push(page),
                        Err(e) => return Err(e.into()),
                    }
                }

                let stats = ctrl.ecc_stats();
                println!("Corrected bits:       {}", stats.corrected);
                println!("Failed reads:         {}", stats.failed);
                if !uncorrectable.is_empty() {
                    println!("Uncorrectable pages:  {uncorrectable:?}");
                }
            }
        };

        Ok(())
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// Raise the log level (repeatable)
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[clap(flatten)]
    sim: SimOptions,

    #[clap(flatten)]
    driver: DriverOptions,

    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    StderrLogger::new(StderrLogger::level_for(args.verbose)).init()?;
    howudoin::init(howudoin::consumers::TermLine::default());

    let sim = args.sim.open()?;
    let mut ctrl = Controller::probe(sim, (&args.driver).into())?;

    let modifies = args.cmd.modifies();
    args.cmd.execute(&mut ctrl)?;

    if modifies || args.sim.create.is_some() {
        args.sim.save(ctrl.hardware())?;
    }
    Ok(())
}
