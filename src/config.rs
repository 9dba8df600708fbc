//! Driver configuration

use std::str::FromStr;
use std::time::Duration;

use crate::hw::OperationClass;

/// Completion budgets for each class of operation
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Timeouts {
    pub status: Duration,
    pub read: Duration,
    pub program: Duration,
    pub erase: Duration,
}

impl Timeouts {
    pub fn for_class(&self, class: OperationClass) -> Duration {
        match class {
            OperationClass::Status => self.status,
            OperationClass::Read => self.read,
            OperationClass::Program => self.program,
            OperationClass::Erase => self.erase,
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            status: Duration::from_millis(10),
            read: Duration::from_millis(10),
            program: Duration::from_millis(100),
            erase: Duration::from_millis(400),
        }
    }
}

/// Parse strings like "STATUSxREADxPROGRAMxERASE", in milliseconds
impl FromStr for Timeouts {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [status, read, program, erase]: [&str; 4] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#x#"))?;

        Ok(Timeouts {
            status: Duration::from_millis(status.parse()?),
            read: Duration::from_millis(read.parse()?),
            program: Duration::from_millis(program.parse()?),
            erase: Duration::from_millis(erase.parse()?),
        })
    }
}

/// Everything about the driver's behavior that a board may want to tune
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NandConfig {
    /// Correctable bits per chunk; `None` picks the strongest layout the page/OOB size allows
    pub ecc_strength: Option<u32>,

    /// Zero bits tolerated in a page still considered erased; `None` means the ECC strength
    pub bitflip_threshold: Option<u32>,

    /// Reserve 4 bytes of each page's free OOB for the origin-block tag
    pub refresh_tag: bool,

    pub timeouts: Timeouts,

    /// How often to sample ready/busy when no interrupt is available
    pub poll_interval: Duration,

    /// How many chip-selects to probe
    pub max_chips: usize,
}

impl Default for NandConfig {
    fn default() -> Self {
        Self {
            ecc_strength: None,
            bitflip_threshold: None,
            refresh_tag: false,
            timeouts: Default::default(),
            poll_interval: Duration::from_millis(1),
            max_chips: 1,
        }
    }
}

impl NandConfig {
    pub fn ecc_strength(mut self, strength: u32) -> Self {
        self.ecc_strength = Some(strength);
        self
    }

    pub fn bitflip_threshold(mut self, threshold: u32) -> Self {
        self.bitflip_threshold = Some(threshold);
        self
    }

    pub fn refresh_tag(mut self) -> Self {
        self.refresh_tag = true;
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn max_chips(mut self, chips: usize) -> Self {
        self.max_chips = chips;
        self
    }
}

#[test]
fn test_parse_timeouts() -> anyhow::Result<()> {
    let timeouts: Timeouts = "5x10x200x1000".parse()?;
    assert_eq!(timeouts.for_class(OperationClass::Status), Duration::from_millis(5));
    assert_eq!(timeouts.for_class(OperationClass::Erase), Duration::from_secs(1));

    assert!("5x10x200".parse::<Timeouts>().is_err());
    assert!("5x10xfoox1000".parse::<Timeouts>().is_err());
    Ok(())
}

#[test]
fn test_default_ordering() {
    // Status and read are the shortest budgets, erase the longest
    let t = Timeouts::default();
    assert!(t.status <= t.program && t.read <= t.program);
    assert!(t.program < t.erase);
}
