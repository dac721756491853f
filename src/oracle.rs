//! Good-block decisions, and demoting blocks that fail in use

use log::{debug, warn};

use crate::config::RUNTIME_BAD_OFFSET;
use crate::device::Device;
use crate::nand::NandDriver;

/// What is known about one physical block
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct BlockStatus {
    pub factory_good: bool,

    /// Not marked bad by this layer after a failure in use
    pub runtime_good: bool,

    /// Both factory and run-time good
    pub good: bool,

    pub locked: bool,
}

/// Ask the driver about a block directly. A block whose status cannot be read is not good.
pub fn query_driver<D: NandDriver>(driver: &mut D, chip: u32, block: u32) -> BlockStatus {
    match driver.block_info(chip, block) {
        Ok(info) => {
            let runtime_good = info
                .spare
                .get(RUNTIME_BAD_OFFSET)
                .is_some_and(|&x| x == 0xFF);
            BlockStatus {
                factory_good: info.factory_good,
                runtime_good,
                good: info.factory_good && runtime_good,
                locked: info.locked,
            }
        }
        Err(e) => {
            debug!("chip {chip} block {block}: status unreadable ({e:#}), treating as bad");
            BlockStatus::default()
        }
    }
}

impl<D: NandDriver> Device<'_, D> {
    /// The hardware's view of a block, through the open region if there is one
    pub fn block_status(&mut self, chip: u32, block: u32) -> BlockStatus {
        match self.region.as_deref_mut() {
            Some(region) => region
                .block_status(self.driver, chip, block)
                .unwrap_or_else(|e| {
                    debug!("chip {chip} block {block}: region status failed ({e:#})");
                    BlockStatus::default()
                }),
            None => query_driver(self.driver, chip, block),
        }
    }

    /// Can this block hold data? Blocks forced bad for testing never can.
    pub fn is_good(&mut self, chip: u32, block: u32) -> bool {
        !self.state.fake_bad.contains(&(chip, block)) && self.block_status(chip, block).good
    }

    /// Demote a block to run-time bad. Failing to do so is logged and otherwise ignored, so that
    /// the error which led here is the one the caller sees.
    pub fn mark_bad(&mut self, chip: u32, block: u32) {
        let geometry = self.geometry();
        warn!("Marking chip {chip} block {block} bad");

        let sentinel = vec![0u8; geometry.spare_bytes - RUNTIME_BAD_OFFSET];
        let page = block * geometry.pages_per_block;
        if let Err(e) = self
            .driver
            .write_spare(chip, page, RUNTIME_BAD_OFFSET, &sentinel)
        {
            warn!("Could not mark chip {chip} block {block} bad: {e:#}");
        }

        self.state.anchor = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::test_util::sim;

    #[test]
    fn test_block_status() -> anyhow::Result<()> {
        let (mut nand, mut state) = sim();
        nand.set_factory_bad(0, 3)?;
        nand.fail_block_info(1, 7);

        let mut dev = Device::new(&mut nand, &mut state);
        let status = dev.block_status(0, 2);
        assert!(status.factory_good && status.runtime_good && status.good);
        assert!(!status.locked);

        let status = dev.block_status(0, 3);
        assert!(!status.factory_good && status.runtime_good && !status.good);

        assert_eq!(dev.block_status(1, 7), BlockStatus::default());
        Ok(())
    }

    #[test]
    fn test_mark_bad() -> anyhow::Result<()> {
        let (mut nand, mut state) = sim();
        let mut dev = Device::new(&mut nand, &mut state);

        dev.mark_bad(1, 9);
        let status = dev.block_status(1, 9);
        assert!(status.factory_good && !status.runtime_good && !status.good);
        assert!(dev.is_good(1, 10));

        // Failure to mark is swallowed
        dev.driver.fail_write(1, 11);
        dev.mark_bad(1, 11);
        assert!(dev.is_good(1, 11));
        Ok(())
    }

    #[test]
    fn test_fake_bad_override() {
        let (mut nand, mut state) = sim();
        state.fake_bad.insert((0, 5));

        let mut dev = Device::new(&mut nand, &mut state);
        assert!(!dev.is_good(0, 5));
        assert!(dev.block_status(0, 5).good);
        assert!(dev.is_good(0, 6));
    }
}
