//! Hardware write protection of partition contents

use std::collections::BTreeMap;

use log::{debug, info};

use crate::device::Device;
use crate::error::{DriverContext, Error, Result, Site};
use crate::nand::{LockAperture, NandDriver};

/// The bounded set of page ranges waiting to be (or already) write-protected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockApertures {
    apertures: Vec<LockAperture>,
    capacity: usize,
    locked: bool,
}

impl LockApertures {
    pub fn new(capacity: usize) -> Self {
        Self {
            apertures: Vec::with_capacity(capacity),
            capacity,
            locked: false,
        }
    }

    pub fn apertures(&self) -> &[LockAperture] {
        &self.apertures
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Add the pages `start_page..=end_page` of `chip`.
    ///
    /// A range that overlaps an aperture on the same chip, or lies within one block of it, widens
    /// that aperture instead of taking a new one. Fails once the apertures are committed.
    pub fn add_range(
        &mut self,
        chip: u32,
        start_page: u32,
        end_page: u32,
        pages_per_block: u32,
    ) -> Result<()> {
        if self.locked {
            return Err(Error::AlreadyLocked {
                site: Site::LockRegion,
            });
        }
        let first = start_page / pages_per_block;
        let last = end_page / pages_per_block;

        let mergeable = self.apertures.iter_mut().find(|x| {
            x.chip == chip
                && first <= x.end_page / pages_per_block + 1
                && x.start_page / pages_per_block <= last + 1
        });
        if let Some(aperture) = mergeable {
            aperture.start_page = aperture.start_page.min(start_page);
            aperture.end_page = aperture.end_page.max(end_page);
            return Ok(());
        }

        if self.apertures.len() >= self.capacity {
            return Err(Error::ApertureFull {
                site: Site::LockRegion,
                capacity: self.capacity,
            });
        }
        self.apertures.push(LockAperture {
            chip,
            start_page,
            end_page,
        });
        Ok(())
    }

    /// Program every aperture into the hardware. This can only happen once.
    pub fn commit<D: NandDriver>(&mut self, driver: &mut D) -> Result<()> {
        if self.locked {
            return Err(Error::AlreadyLocked {
                site: Site::CommitLocks,
            });
        }
        for aperture in &self.apertures {
            driver.set_lock(aperture).at(Site::CommitLocks)?;
        }
        self.locked = true;
        info!("Locked {} flash aperture(s)", self.apertures.len());
        Ok(())
    }
}

impl<D: NandDriver> Device<'_, D> {
    /// Queue the blocks holding logical sectors `sector..sector + count` for write protection,
    /// committing every queued aperture if `commit` is set.
    ///
    /// `sector` is in device-interleave units. Blocks are found by their logical tags within the
    /// partition that contains `sector`.
    pub fn lock_region(&mut self, sector: u32, count: u32, commit: bool) -> Result<()> {
        let site = Site::LockRegion;
        if count == 0 {
            return Err(Error::BadParameter {
                site,
                reason: "empty lock range",
            });
        }

        let geometry = self.geometry();
        let ppb = geometry.pages_per_block;
        let shift = self.state.log2_pages_per_block() + self.state.log2_interleave();
        let entry = self
            .state
            .table
            .entries
            .iter()
            .find(|x| {
                let start = u64::from(x.start_logical_block) << shift;
                let end = u64::from(x.logical_end()) << shift;
                (start..end).contains(&u64::from(sector))
            })
            .copied()
            .ok_or(Error::InvalidAddress {
                site,
                address: sector,
            })?;

        let first = sector >> shift;
        let last = sector.saturating_add(count - 1) >> shift;
        let wanted = last - first + 1;

        let banks = self.state.banks();
        let mut spans: BTreeMap<u32, (u32, u32)> = BTreeMap::new();
        for bank in 0..entry.interleave {
            let mut found = 0;
            for super_block in entry.start_physical_block..entry.physical_end() {
                let Some((chip, block)) = banks.translate(bank, super_block) else {
                    break;
                };
                if !self.is_good(chip, block) {
                    continue;
                }
                let info = self.driver.block_info(chip, block).at(site)?;
                let Some(tag) = info.tag(geometry.tag_offset) else {
                    continue;
                };
                if !(first..=last).contains(&tag) {
                    continue;
                }

                debug!("Lock: logical block {tag} is chip {chip} block {block}");
                spans
                    .entry(chip)
                    .and_modify(|(lo, hi)| {
                        *lo = (*lo).min(block);
                        *hi = (*hi).max(block);
                    })
                    .or_insert((block, block));
                found += 1;
                if found == wanted {
                    break;
                }
            }
        }

        for (chip, (lo, hi)) in spans {
            self.state
                .locks
                .add_range(chip, lo * ppb, hi * ppb + ppb - 1, ppb)?;
        }

        if commit {
            self.state.locks.commit(self.driver)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::test_util::sim;
    use crate::nand::TEST_LAYOUT;
    use crate::region::RegionEntry;

    const PPB: u32 = TEST_LAYOUT.pages_per_block;

    fn aperture(chip: u32, start_page: u32, end_page: u32) -> LockAperture {
        LockAperture {
            chip,
            start_page,
            end_page,
        }
    }

    #[test]
    fn test_merge() -> anyhow::Result<()> {
        let mut locks = LockApertures::new(2);
        locks.add_range(0, 4 * PPB, 6 * PPB - 1, PPB)?;

        // Same range again
        locks.add_range(0, 4 * PPB, 6 * PPB - 1, PPB)?;
        assert_eq!(locks.apertures(), [aperture(0, 4 * PPB, 6 * PPB - 1)]);

        // Adjacent above and below
        locks.add_range(0, 6 * PPB, 7 * PPB - 1, PPB)?;
        locks.add_range(0, 3 * PPB, 4 * PPB - 1, PPB)?;
        assert_eq!(locks.apertures(), [aperture(0, 3 * PPB, 7 * PPB - 1)]);

        // A gap, and another chip, each take a new aperture
        locks.add_range(1, 3 * PPB, 4 * PPB - 1, PPB)?;
        let err = locks.add_range(0, 9 * PPB, 10 * PPB - 1, PPB).unwrap_err();
        assert!(matches!(err, Error::ApertureFull { capacity: 2, .. }));
        assert_eq!(locks.apertures().len(), 2);
        Ok(())
    }

    #[test]
    fn test_commit_once() -> anyhow::Result<()> {
        let (mut nand, _) = sim();
        let mut locks = LockApertures::new(8);
        locks.add_range(1, 0, PPB - 1, PPB)?;
        locks.add_range(0, 8 * PPB, 9 * PPB - 1, PPB)?;

        locks.commit(&mut nand)?;
        assert!(locks.is_locked());
        assert_eq!(nand.locks(), locks.apertures());

        let err = locks.commit(&mut nand).unwrap_err();
        assert!(matches!(err, Error::AlreadyLocked { .. }));
        assert_eq!(nand.locks().len(), 2);

        // Committed apertures no longer change
        let err = locks.add_range(0, 20 * PPB, 21 * PPB - 1, PPB).unwrap_err();
        assert!(matches!(err, Error::AlreadyLocked { .. }));
        assert_eq!(locks.apertures().len(), 2);
        assert_eq!(nand.locks(), locks.apertures());
        Ok(())
    }

    #[test]
    fn test_lock_region() -> anyhow::Result<()> {
        let (mut nand, mut state) = sim();
        state.table.interleave = 1;
        state.table.entries.push(RegionEntry {
            partition_id: 1,
            start_logical_block: 0,
            total_logical_blocks: 10,
            start_physical_block: 2,
            total_physical_blocks: 12,
            interleave: 1,
            ..Default::default()
        });
        for (block, tag) in [(2, 0), (3, 1), (4, 2), (6, 3)] {
            nand.set_tag(0, block, tag)?;
        }
        nand.set_factory_bad(0, 5)?;

        let mut dev = Device::new(&mut nand, &mut state);
        dev.lock_region(PPB, 3 * PPB, false)?;
        assert_eq!(
            dev.state.locks.apertures(),
            [aperture(0, 3 * PPB, 7 * PPB - 1)]
        );
        assert!(!dev.block_status(0, 3).locked);

        // Logical block 0 sits in the block just below: merged on commit
        dev.lock_region(0, 1, true)?;
        assert!(dev.block_status(0, 2).locked);
        assert!(dev.block_status(0, 6).locked);
        assert!(!dev.block_status(0, 7).locked);

        let err = dev.lock_region(0, 1, true).unwrap_err();
        assert!(matches!(err, Error::AlreadyLocked { .. }));

        // Outside every partition
        let err = dev.lock_region(10 * PPB, 1, false).unwrap_err();
        assert!(matches!(err, Error::InvalidAddress { .. }));
        assert_eq!(nand.locks(), [aperture(0, 2 * PPB, 7 * PPB - 1)]);
        Ok(())
    }
}
