//! State shared by every open partition of one physical flash array

use std::collections::HashSet;

use crate::config::{log2, BlockDevConfig};
use crate::error::{Error, Result, Site};
use crate::ftl::Region;
use crate::lock::LockApertures;
use crate::nand::bank::BankMap;
use crate::nand::{NandDriver, NandGeometry};
use crate::raw::EraseType;
use crate::region::store::TailAnchor;
use crate::region::RegionTable;

/// Device-wide state, created when the first partition of an array is opened and dropped when the
/// last one closes
#[derive(Debug)]
pub struct DeviceState {
    pub(crate) config: BlockDevConfig,
    pub(crate) geometry: NandGeometry,

    /// The region table; its `interleave` is the device-wide interleave factor
    pub(crate) table: RegionTable,

    /// Next logical super-block handed out by relative allocation
    pub(crate) logical_cursor: u32,

    /// First physical super-block not yet claimed by any allocation
    pub(crate) physical_cursor: u32,

    pub(crate) locks: LockApertures,

    /// Where the newest region-table copy lives; forgotten whenever a block goes bad
    pub(crate) anchor: Option<TailAnchor>,

    /// Encoded bytes of the table last saved or loaded
    pub(crate) golden: Option<Vec<u8>>,

    /// Blocks forced to read as bad, on top of what the hardware says
    pub(crate) fake_bad: HashSet<(u32, u32)>,

    pub(crate) erase_type: EraseType,

    pub(crate) open_count: u32,
    pub(crate) power_count: u32,
}

impl DeviceState {
    pub fn new(config: BlockDevConfig, geometry: NandGeometry) -> Result<Self> {
        let bad = |reason| Error::BadParameter {
            site: Site::Open,
            reason,
        };

        if geometry.chips == 0 || geometry.chips > config.max_chips {
            return Err(bad("unsupported chip count"));
        }
        if !geometry.blocks_per_chip.is_power_of_two()
            || !geometry.pages_per_block.is_power_of_two()
            || !geometry.bytes_per_page.is_power_of_two()
        {
            return Err(bad("geometry is not a power of two"));
        }
        if geometry.tag_offset + 4 > geometry.spare_bytes {
            return Err(bad("spare area too small for block tags"));
        }

        Ok(Self {
            locks: LockApertures::new(config.lock_apertures),
            config,
            geometry,
            table: RegionTable {
                entries: vec![],
                interleave: 1,
            },
            logical_cursor: 0,
            physical_cursor: 0,
            anchor: None,
            golden: None,
            fake_bad: HashSet::new(),
            erase_type: EraseType::default(),
            open_count: 0,
            power_count: 0,
        })
    }

    pub fn geometry(&self) -> &NandGeometry {
        &self.geometry
    }

    pub fn table(&self) -> &RegionTable {
        &self.table
    }

    pub fn interleave(&self) -> u32 {
        self.table.interleave
    }

    pub(crate) fn log2_interleave(&self) -> u32 {
        log2(self.table.interleave)
    }

    pub(crate) fn log2_pages_per_block(&self) -> u32 {
        log2(self.geometry.pages_per_block)
    }

    pub(crate) fn banks(&self) -> BankMap {
        BankMap::new(&self.geometry, self.table.interleave)
    }

    /// Forget the partitioning in progress
    pub(crate) fn reset_partitioning(&mut self) {
        self.table.entries.clear();
        self.table.interleave = 1;
        self.golden = None;
        self.logical_cursor = 0;
        self.physical_cursor = 0;
    }
}

/// A locked view of one flash array: its driver, its device-wide state, and (for managed
/// partitions) the translation-layer region through which block status is queried.
///
/// Every block-layer operation is an `impl` on this type, spread across the modules that own the
/// behaviour.
pub struct Device<'a, D: NandDriver> {
    pub(crate) driver: &'a mut D,
    pub(crate) state: &'a mut DeviceState,
    pub(crate) region: Option<&'a mut dyn Region<D>>,
}

impl<'a, D: NandDriver> Device<'a, D> {
    pub fn new(driver: &'a mut D, state: &'a mut DeviceState) -> Self {
        Self {
            driver,
            state,
            region: None,
        }
    }

    pub fn with_region(mut self, region: &'a mut dyn Region<D>) -> Self {
        self.region = Some(region);
        self
    }

    pub(crate) fn geometry(&self) -> NandGeometry {
        self.state.geometry
    }

    pub(crate) fn config(&self) -> BlockDevConfig {
        self.state.config
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::nand::{SimNand, TEST_LAYOUT};

    /// A fresh simulated array with device state to go with it
    pub fn sim() -> (SimNand, DeviceState) {
        let nand = SimNand::new(TEST_LAYOUT);
        let state = DeviceState::new(BlockDevConfig::default(), nand.geometry())
            .expect("test geometry is valid");
        (nand, state)
    }
}

#[test]
fn test_state_rejects_bad_geometry() {
    use crate::nand::TEST_LAYOUT;

    let config = BlockDevConfig::default();
    let mut geometry = TEST_LAYOUT.geometry();
    geometry.chips = 9;
    assert!(DeviceState::new(config, geometry).is_err());

    let mut geometry = TEST_LAYOUT.geometry();
    geometry.pages_per_block = 24;
    assert!(DeviceState::new(config, geometry).is_err());

    let state = DeviceState::new(config, TEST_LAYOUT.geometry()).unwrap();
    assert_eq!(state.interleave(), 1);
    assert_eq!(state.log2_pages_per_block(), 4);
}
