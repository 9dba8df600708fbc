//! Transfer chains built from a fixed pool of reusable descriptors.
//!
//! Every hardware interaction that moves data is expressed as a short chain of [Step]s submitted
//! as one unit, so ordering is guaranteed and a single completion reports success or failure for
//! the whole chain. The descriptors the steps are written into come from a pool of
//! [DESCRIPTOR_COUNT] slots owned by the [TransferOrchestrator]; a chain checks out exactly the
//! slots it needs and gives all of them back when it is done, however it ends.

use log::trace;

use crate::config::Timeouts;
use crate::error::{NandError, Result};
use crate::hw::{Direction, HwError, OperationClass, Step, TransferEngine};

/// Number of descriptor slots available to a chain
pub const DESCRIPTOR_COUNT: usize = 4;

/// Mirror the bit order of every byte, matching the wiring of the spare-area lane
pub fn swap_lanes(bytes: &mut [u8]) {
    for byte in bytes {
        *byte = byte.reverse_bits();
    }
}

#[derive(Debug, Default)]
pub struct DescriptorPool {
    slots: [Step; DESCRIPTOR_COUNT],
    checked_out: usize,
}

/// Descriptors checked out of a [DescriptorPool]; returned in full when dropped
struct Lease<'a> {
    pool: &'a mut DescriptorPool,
    first: usize,
    count: usize,
}

impl DescriptorPool {
    pub fn available(&self) -> usize {
        DESCRIPTOR_COUNT - self.checked_out
    }

    fn checkout(&mut self, count: usize) -> Result<Lease<'_>> {
        if count > self.available() {
            return Err(NandError::DescriptorExhausted {
                requested: count,
                capacity: self.available(),
            });
        }

        let first = self.checked_out;
        self.checked_out += count;
        Ok(Lease {
            pool: self,
            first,
            count,
        })
    }
}

impl Lease<'_> {
    fn slots(&self) -> &[Step] {
        &self.pool.slots[self.first..self.first + self.count]
    }

    fn fill(&mut self, steps: &[Step]) {
        self.pool.slots[self.first..self.first + self.count].clone_from_slice(steps);
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        for slot in &mut self.pool.slots[self.first..self.first + self.count] {
            *slot = Step::default();
        }
        self.pool.checked_out -= self.count;
    }
}

/// Apply the lane compensation to the spare ranges of all data steps going in `direction`
fn compensate_spare(steps: &[Step], direction: Direction, buffer: &mut [u8]) {
    for step in steps {
        if let Step::Data {
            direction: d,
            spare,
            ..
        } = step
        {
            if *d == direction {
                swap_lanes(&mut buffer[spare.clone()]);
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct TransferOrchestrator {
    pool: DescriptorPool,
    chains: u64,
}

impl TransferOrchestrator {
    pub fn new() -> Self {
        Default::default()
    }

    /// Descriptor slots currently free
    pub fn available(&self) -> usize {
        self.pool.available()
    }

    /// Number of chains submitted so far
    pub fn chains_submitted(&self) -> u64 {
        self.chains
    }

    /// Submit `steps` as one chain and wait for it under the budget of `class`.
    ///
    /// Outgoing spare-lane bytes are restored in `buffer` afterwards, whatever the outcome. On
    /// failure, incoming ranges are undefined.
    pub fn run<E: TransferEngine>(
        &mut self,
        engine: &mut E,
        buffer: &mut [u8],
        steps: &[Step],
        class: OperationClass,
        timeouts: &Timeouts,
    ) -> Result<()> {
        self.chains += 1;
        trace!("chain {} ({class:?}): {steps:?}", self.chains);

        let mut lease = self.pool.checkout(steps.len())?;
        lease.fill(steps);

        compensate_spare(lease.slots(), Direction::Out, buffer);
        let result = engine
            .submit_chain(lease.slots(), buffer)
            .and_then(|token| engine.wait_completion(token, timeouts.for_class(class)));
        compensate_spare(lease.slots(), Direction::Out, buffer);

        match result {
            Ok(()) => {
                compensate_spare(lease.slots(), Direction::In, buffer);
                Ok(())
            }
            Err(HwError::Timeout) => Err(NandError::Timeout(class)),
            Err(e) => Err(NandError::Hardware(e)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hw::ChainToken;
    use std::time::Duration;

    /// Records what crosses the engine, and answers incoming data with 0x01 bytes
    #[derive(Default)]
    struct RecordingEngine {
        seen: Vec<Vec<Step>>,
        outgoing: Vec<u8>,
        time_out: bool,
    }

    impl TransferEngine for RecordingEngine {
        fn submit_chain(&mut self, steps: &[Step], buffer: &mut [u8]) -> Result<ChainToken, HwError> {
            self.seen.push(steps.to_vec());
            for step in steps {
                if let Step::Data {
                    direction,
                    main,
                    spare,
                } = step
                {
                    match direction {
                        Direction::Out => {
                            self.outgoing.extend_from_slice(&buffer[main.clone()]);
                            self.outgoing.extend_from_slice(&buffer[spare.clone()]);
                        }
                        Direction::In => {
                            buffer[main.clone()].fill(0x01);
                            buffer[spare.clone()].fill(0x01);
                        }
                    }
                }
            }
            Ok(ChainToken(self.seen.len() as u64))
        }

        fn wait_completion(&mut self, _: ChainToken, _: Duration) -> Result<(), HwError> {
            if self.time_out {
                Err(HwError::Timeout)
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_exhausted() {
        let mut engine = RecordingEngine::default();
        let mut xfer = TransferOrchestrator::new();
        let mut buf = [0u8; 4];

        let steps = vec![Step::WaitReady; DESCRIPTOR_COUNT + 1];
        let result = xfer.run(
            &mut engine,
            &mut buf,
            &steps,
            OperationClass::Read,
            &Default::default(),
        );
        assert!(matches!(
            result,
            Err(NandError::DescriptorExhausted {
                requested: 5,
                capacity: 4
            })
        ));
        assert!(engine.seen.is_empty());
        assert_eq!(xfer.available(), DESCRIPTOR_COUNT);
    }

    #[test]
    fn test_pool_returned_on_timeout() {
        let mut engine = RecordingEngine {
            time_out: true,
            ..Default::default()
        };
        let mut xfer = TransferOrchestrator::new();
        let mut buf = [0u8; 4];

        let steps = [Step::Command(0x30), Step::WaitReady];
        let result = xfer.run(
            &mut engine,
            &mut buf,
            &steps,
            OperationClass::Erase,
            &Default::default(),
        );
        assert!(matches!(result, Err(NandError::Timeout(OperationClass::Erase))));
        assert_eq!(xfer.available(), DESCRIPTOR_COUNT);

        // The pool is fully usable again
        engine.time_out = false;
        let steps = vec![Step::WaitReady; DESCRIPTOR_COUNT];
        xfer.run(
            &mut engine,
            &mut buf,
            &steps,
            OperationClass::Read,
            &Default::default(),
        )
        .unwrap();
        assert_eq!(engine.seen.last().unwrap().len(), DESCRIPTOR_COUNT);
    }

    #[test]
    fn test_spare_lane() {
        let mut engine = RecordingEngine::default();
        let mut xfer = TransferOrchestrator::new();
        let mut buf = [0x01u8, 0x01, 0x01, 0x01];

        let out = [Step::Data {
            direction: Direction::Out,
            main: 0..2,
            spare: 2..4,
        }];
        xfer.run(
            &mut engine,
            &mut buf,
            &out,
            OperationClass::Program,
            &Default::default(),
        )
        .unwrap();

        // Main bytes cross untouched, spare bytes mirrored; the host copy is unchanged
        assert_eq!(engine.outgoing, [0x01, 0x01, 0x80, 0x80]);
        assert_eq!(buf, [0x01; 4]);

        let into = [Step::Data {
            direction: Direction::In,
            main: 0..2,
            spare: 2..4,
        }];
        xfer.run(
            &mut engine,
            &mut buf,
            &into,
            OperationClass::Read,
            &Default::default(),
        )
        .unwrap();
        assert_eq!(buf, [0x01, 0x01, 0x80, 0x80]);
    }
}
