//! Direct access to physical sectors and blocks, for the unmanaged partition.
//!
//! Sector numbers here are physical page numbers in sequential block order, translated through
//! bank 0 of the device interleave. Nothing on this path skips bad blocks: a bad block in the way
//! is an error, and a block that fails a transfer is marked bad before the error is returned.

use anyhow::ensure;
use log::{debug, info, warn};

use crate::config::log2;
use crate::device::Device;
use crate::error::{DriverContext, Error, Result, Site};
use crate::nand::NandDriver;
use crate::oracle::BlockStatus;
use crate::region::RegionEntry;

/// Which blocks a format or partition erase touches
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum EraseType {
    /// Only blocks that are neither factory nor run-time bad
    GoodBlocks,

    /// Every block the manufacturer did not mark bad, clearing run-time bad marks
    #[default]
    NonFactoryBadBlocks,

    /// Like [EraseType::NonFactoryBadBlocks], but each block is test-programmed first and marked
    /// bad if it does not hold the pattern
    VerifiedGoodBlocks,
}

/// What a format did
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct FormatReport {
    pub erased: u32,
    pub skipped: u32,
    pub marked_bad: u32,
}

/// A run of sectors within one block
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct Run {
    block: u32,
    offset: u32,
    sectors: u32,
}

/// Split `sectors` sectors from `start` into per-block runs
fn runs(start: u32, sectors: u32, pages_per_block: u32) -> Vec<Run> {
    let mut out = vec![];
    let mut sector = start;
    let mut remaining = sectors;
    while remaining > 0 {
        let offset = sector % pages_per_block;
        let count = remaining.min(pages_per_block - offset);
        out.push(Run {
            block: sector / pages_per_block,
            offset,
            sectors: count,
        });
        sector += count;
        remaining -= count;
    }
    out
}

const TEST_PATTERN: u8 = 0xA5;

impl<D: NandDriver> Device<'_, D> {
    fn sectors_in(&self, bytes: usize, site: Site) -> Result<u32> {
        let page_size = self.geometry().bytes_per_page;
        if bytes % page_size != 0 {
            return Err(Error::BadParameter {
                site,
                reason: "buffer is not a whole number of sectors",
            });
        }
        Ok((bytes / page_size) as u32)
    }

    /// Translate a sequential physical block and make sure it is usable
    fn raw_block(&mut self, block: u32, site: Site) -> Result<(u32, u32)> {
        let (chip, chip_block) =
            self.state
                .banks()
                .translate(0, block)
                .ok_or(Error::InvalidAddress {
                    site,
                    address: block,
                })?;
        if !self.is_good(chip, chip_block) {
            return Err(Error::BadBlock {
                site,
                chip,
                block: chip_block,
            });
        }
        Ok((chip, chip_block))
    }

    /// Read whole physical sectors starting at `sector`
    pub fn read_physical(&mut self, sector: u32, buf: &mut [u8]) -> Result<()> {
        let site = Site::ReadPhysical;
        let geometry = self.geometry();
        let sectors = self.sectors_in(buf.len(), site)?;

        let mut rest = buf;
        for run in runs(sector, sectors, geometry.pages_per_block) {
            let (chip, block) = self.raw_block(run.block, site)?;
            let (chunk, tail) = rest.split_at_mut(run.sectors as usize * geometry.bytes_per_page);
            let page = block * geometry.pages_per_block + run.offset;

            let read = self.driver.read(chip, page, chunk).at(site);
            let result = read.and_then(|actual| match actual == run.sectors {
                true => Ok(()),
                false => Err(Error::ShortTransfer {
                    site,
                    chip,
                    block,
                    requested: run.sectors,
                    actual,
                }),
            });
            if let Err(e) = result {
                self.mark_bad(chip, block);
                return Err(e);
            }
            rest = tail;
        }
        Ok(())
    }

    /// Write whole physical sectors starting at `sector`, erasing each block touched first.
    ///
    /// With `verify`, every run is read back and compared after programming.
    pub fn write_physical(&mut self, sector: u32, data: &[u8], verify: bool) -> Result<()> {
        let site = Site::WritePhysical;
        let geometry = self.geometry();
        let sectors = self.sectors_in(data.len(), site)?;

        let mut rest = data;
        for run in runs(sector, sectors, geometry.pages_per_block) {
            let (chip, block) = self.raw_block(run.block, site)?;
            let (chunk, tail) = rest.split_at(run.sectors as usize * geometry.bytes_per_page);
            let page = block * geometry.pages_per_block + run.offset;

            if let Err(e) = self.program_run(chip, block, page, chunk, run.sectors, verify) {
                self.mark_bad(chip, block);
                return Err(e);
            }
            rest = tail;
        }
        Ok(())
    }

    fn program_run(
        &mut self,
        chip: u32,
        block: u32,
        page: u32,
        chunk: &[u8],
        sectors: u32,
        verify: bool,
    ) -> Result<()> {
        let site = Site::WritePhysical;
        self.driver.erase(chip, block).at(site)?;

        let actual = self.driver.write(chip, page, chunk).at(site)?;
        if actual != sectors {
            return Err(Error::ShortTransfer {
                site,
                chip,
                block,
                requested: sectors,
                actual,
            });
        }

        if verify {
            let mut readback = vec![0; chunk.len()];
            let actual = self.driver.read(chip, page, &mut readback).at(site)?;
            let result: anyhow::Result<()> = (|| {
                ensure!(actual == sectors, "read back {actual} of {sectors} sectors");
                ensure!(readback == chunk, "read back differs from data written");
                Ok(())
            })();
            result.at(site)?;
        }
        Ok(())
    }

    /// Erase `count` blocks starting at super-block `start`, cycling through the interleave banks
    pub fn erase_physical(&mut self, start: u32, count: u32) -> Result<()> {
        let site = Site::ErasePhysical;
        let banks = self.state.banks();
        let interleave = banks.interleave();

        let mut super_block = start;
        let mut bank = 0;
        for _ in 0..count {
            let (chip, block) =
                banks
                    .translate(bank, super_block)
                    .ok_or(Error::InvalidAddress {
                        site,
                        address: super_block,
                    })?;

            if self.is_good(chip, block) {
                if let Err(e) = self.driver.erase(chip, block) {
                    self.mark_bad(chip, block);
                    return Err(Error::Driver { site, source: e });
                }
            } else {
                debug!("Not erasing bad chip {chip} block {block}");
            }

            bank += 1;
            if bank == interleave {
                bank = 0;
                super_block += 1;
            }
        }
        Ok(())
    }

    /// Find the physical sector holding `logical_sector` of the unmanaged partition, by scanning
    /// the logical block tags of the good blocks in order
    pub fn logical_to_physical(&mut self, logical_sector: u32) -> Result<u32> {
        let site = Site::LogicalToPhysical;
        let geometry = self.geometry();
        let log2_ppb = log2(geometry.pages_per_block);
        let target = logical_sector >> log2_ppb;
        let offset = logical_sector & (geometry.pages_per_block - 1);

        let banks = self.state.banks();
        let max = geometry.total_blocks() >> self.state.log2_interleave();
        let not_found = Error::TagSearchFailure {
            site,
            logical_block: target,
        };

        for current in self.config().first_physical_block..max {
            let (chip, block) = banks.translate(0, current).ok_or(Error::InvalidAddress {
                site,
                address: current,
            })?;
            if !self.is_good(chip, block) {
                continue;
            }

            let info = self.driver.block_info(chip, block).at(site)?;
            let Some(tag) = info.tag(geometry.tag_offset) else {
                continue;
            };

            if tag == target {
                return Ok((current << log2_ppb) + offset);
            }
            // Tags are written in ascending order; once past the target it will not turn up
            if tag > target && current + 1 > target {
                return Err(not_found);
            }
        }

        Err(not_found)
    }

    /// Status of a block given by its sequential index across all chips
    pub fn query_block_status(&mut self, block: u32) -> Result<BlockStatus> {
        let geometry = self.geometry();
        let chip = block / geometry.blocks_per_chip;
        if chip >= geometry.chips {
            return Err(Error::InvalidAddress {
                site: Site::QueryBlockStatus,
                address: block,
            });
        }
        let chip_block = block % geometry.blocks_per_chip;

        let mut status = self.block_status(chip, chip_block);
        if self.state.fake_bad.contains(&(chip, chip_block)) {
            status.good = false;
        }
        Ok(status)
    }

    /// Erase a block, program every page with a pattern, read it back and erase it again
    fn erase_and_test(&mut self, chip: u32, block: u32) -> anyhow::Result<()> {
        let geometry = self.geometry();
        let ppb = geometry.pages_per_block;
        let pattern = vec![TEST_PATTERN; geometry.block_bytes()];

        self.driver.erase(chip, block)?;
        let written = self.driver.write(chip, block * ppb, &pattern)?;
        ensure!(written == ppb, "test pattern: wrote {written} of {ppb} pages");

        let mut readback = vec![0; pattern.len()];
        let read = self.driver.read(chip, block * ppb, &mut readback)?;
        ensure!(read == ppb, "test pattern: read {read} of {ppb} pages");
        ensure!(readback == pattern, "test pattern did not read back");

        self.driver.erase(chip, block)
    }

    /// Erase the whole device. Failures never stop the format; failing blocks are marked bad.
    pub fn format(&mut self, erase_type: EraseType) -> FormatReport {
        let geometry = self.geometry();
        let rpt = howudoin::new()
            .label("Formatting")
            .set_len(u64::from(geometry.total_blocks()));

        let mut report = FormatReport::default();
        for chip in 0..geometry.chips {
            for block in 0..geometry.blocks_per_chip {
                rpt.inc();

                let status = self.block_status(chip, block);
                let forced_bad = self.state.fake_bad.contains(&(chip, block));
                let eligible = match erase_type {
                    EraseType::GoodBlocks => status.good,
                    _ => status.factory_good,
                };
                if !eligible || forced_bad {
                    report.skipped += 1;
                    continue;
                }

                let result = match erase_type {
                    EraseType::VerifiedGoodBlocks => self.erase_and_test(chip, block),
                    _ => self.driver.erase(chip, block),
                };
                match result {
                    Ok(()) => report.erased += 1,
                    Err(e) => {
                        warn!("Format: chip {chip} block {block} failed: {e:#}");
                        self.mark_bad(chip, block);
                        report.marked_bad += 1;
                    }
                }
            }
        }
        rpt.close();

        self.state.erase_type = erase_type;
        self.state.anchor = None;
        info!(
            "Formatted device ({erase_type:?}): {} erased, {} skipped, {} marked bad",
            report.erased, report.skipped, report.marked_bad
        );
        report
    }

    /// Erase the good blocks of a partition's extent, in every bank it uses
    pub fn erase_partition(&mut self, entry: &RegionEntry) {
        let banks = self.state.banks();
        let interleave = entry.interleave;
        let blocks = entry.total_physical_blocks * interleave;
        let rpt = howudoin::new()
            .label(format!("Erasing partition {}", entry.partition_id))
            .set_len(u64::from(blocks));

        for index in 0..blocks {
            let bank = index % interleave;
            let super_block = entry.start_physical_block + index / interleave;
            let Some((chip, block)) = banks.translate(bank, super_block) else {
                break;
            };
            rpt.inc();

            let status = self.block_status(chip, block);
            let good = match self.state.erase_type {
                EraseType::GoodBlocks => status.good,
                _ => status.factory_good,
            };
            if !good || self.state.fake_bad.contains(&(chip, block)) {
                continue;
            }
            if let Err(e) = self.driver.erase(chip, block) {
                warn!("Erase of chip {chip} block {block} failed: {e:#}");
                self.mark_bad(chip, block);
            }
        }
        rpt.close();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::test_util::sim;
    use crate::nand::{PageUtil, TEST_LAYOUT};

    const PPB: u32 = TEST_LAYOUT.pages_per_block;
    const PAGE: usize = TEST_LAYOUT.bytes_per_page;

    #[test]
    fn test_runs() {
        assert_eq!(
            runs(14, 20, 16),
            vec![
                Run {
                    block: 0,
                    offset: 14,
                    sectors: 2
                },
                Run {
                    block: 1,
                    offset: 0,
                    sectors: 16
                },
                Run {
                    block: 2,
                    offset: 0,
                    sectors: 2
                },
            ]
        );
        assert!(runs(3, 0, 16).is_empty());
    }

    #[test]
    fn test_physical_round_trip() -> anyhow::Result<()> {
        let (mut nand, mut state) = sim();
        let mut dev = Device::new(&mut nand, &mut state);

        // Crosses from chip 0 into chip 1
        let start = 63 * PPB + 8;
        let data: Vec<u8> = (0..12 * PAGE).map(|x| (x % 251) as u8).collect();
        dev.write_physical(start, &data, true)?;

        let mut out = vec![0; data.len()];
        dev.read_physical(start, &mut out)?;
        assert_eq!(out, data);

        let mut page = vec![0; PAGE];
        nand.read(1, 3, &mut page)?;
        assert_eq!(page, data[11 * PAGE..]);
        Ok(())
    }

    #[test]
    fn test_bad_block_in_the_way() -> anyhow::Result<()> {
        let (mut nand, mut state) = sim();
        nand.set_factory_bad(0, 4)?;
        let mut dev = Device::new(&mut nand, &mut state);

        let mut buf = vec![0; PAGE * 2];
        let err = dev.read_physical(4 * PPB, &mut buf).unwrap_err();
        assert!(matches!(err, Error::BadBlock { chip: 0, block: 4, .. }));

        assert!(matches!(
            dev.read_physical(0, &mut buf[1..]),
            Err(Error::BadParameter { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_short_write_marks_bad() -> anyhow::Result<()> {
        let (mut nand, mut state) = sim();
        nand.short_write(0, 6);

        let mut dev = Device::new(&mut nand, &mut state);
        let data = vec![0x5A; PAGE * 4];
        let err = dev.write_physical(6 * PPB, &data, false).unwrap_err();
        assert!(matches!(
            err,
            Error::ShortTransfer {
                site: Site::WritePhysical,
                chip: 0,
                block: 6,
                requested: 4,
                actual: 3,
            }
        ));
        assert_eq!(err.kind(), crate::error::ErrorKind::ShortTransfer);

        let status = dev.block_status(0, 6);
        assert!(status.factory_good && !status.runtime_good);
        Ok(())
    }

    #[test]
    fn test_short_read_marks_bad() -> anyhow::Result<()> {
        let (mut nand, mut state) = sim();
        nand.short_read(1, 2);

        let mut dev = Device::new(&mut nand, &mut state);
        let mut buf = vec![0; PAGE * 2];
        let err = dev.read_physical(66 * PPB, &mut buf).unwrap_err();
        assert!(matches!(err, Error::ShortTransfer { actual: 1, .. }));
        assert!(!dev.is_good(1, 2));
        Ok(())
    }

    #[test]
    fn test_erase_physical() -> anyhow::Result<()> {
        let (mut nand, mut state) = sim();
        let data = vec![0x11; PAGE];
        for block in 0..4 {
            nand.write(0, block * PPB, &data)?;
        }
        nand.fail_erase(0, 2);

        let mut dev = Device::new(&mut nand, &mut state);
        dev.erase_physical(0, 2)?;
        let err = dev.erase_physical(2, 2).unwrap_err();
        assert!(matches!(
            err,
            Error::Driver {
                site: Site::ErasePhysical,
                ..
            }
        ));
        assert!(!dev.is_good(0, 2));

        let mut page = vec![0; PAGE];
        for (block, erased) in [(0, true), (1, true), (3, false)] {
            nand.read(0, block * PPB, &mut page)?;
            assert_eq!(page.is_erased(), erased, "block {block}");
        }
        Ok(())
    }

    #[test]
    fn test_logical_to_physical() -> anyhow::Result<()> {
        let (mut nand, mut state) = sim();
        // Block 1 tagged 0, block 2 bad, block 3 untagged, block 4 tagged 1, block 5 tagged 3
        nand.set_tag(0, 1, 0)?;
        nand.set_factory_bad(0, 2)?;
        nand.set_tag(0, 4, 1)?;
        nand.set_tag(0, 5, 3)?;

        let mut dev = Device::new(&mut nand, &mut state);
        assert_eq!(dev.logical_to_physical(5)?, PPB + 5);
        assert_eq!(dev.logical_to_physical(PPB + 2)?, 4 * PPB + 2);

        // Logical block 2 was never written: tag 3 at block 5 ends the search
        let err = dev.logical_to_physical(2 * PPB).unwrap_err();
        assert!(matches!(
            err,
            Error::TagSearchFailure {
                logical_block: 2,
                ..
            }
        ));

        // Past every tag on the device
        assert!(matches!(
            dev.logical_to_physical(40 * PPB),
            Err(Error::TagSearchFailure { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_query_block_status() -> anyhow::Result<()> {
        let (mut nand, mut state) = sim();
        nand.set_factory_bad(1, 1)?;
        state.fake_bad.insert((0, 9));

        let mut dev = Device::new(&mut nand, &mut state);
        assert!(dev.query_block_status(8)?.good);
        assert!(!dev.query_block_status(9)?.good);
        assert!(!dev.query_block_status(65)?.factory_good);
        assert!(dev.query_block_status(128).is_err());
        Ok(())
    }

    #[test]
    fn test_format() -> anyhow::Result<()> {
        let (mut nand, mut state) = sim();
        nand.set_factory_bad(0, 3)?;
        let data = vec![0x22; PAGE];
        nand.write(0, 5 * PPB, &data)?;

        let mut dev = Device::new(&mut nand, &mut state);
        dev.mark_bad(0, 7);

        // Good-blocks format leaves run-time bad blocks alone
        let report = dev.format(EraseType::GoodBlocks);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.erased, 126);
        assert!(!dev.is_good(0, 7));

        // The default format clears run-time bad marks
        let report = dev.format(EraseType::NonFactoryBadBlocks);
        assert_eq!(report.skipped, 1);
        assert!(dev.is_good(0, 7));
        assert_eq!(dev.state.erase_type, EraseType::NonFactoryBadBlocks);

        let mut page = vec![0; PAGE];
        nand.read(0, 5 * PPB, &mut page)?;
        assert!(page.is_erased());
        Ok(())
    }

    #[test]
    fn test_verified_format() -> anyhow::Result<()> {
        let (mut nand, mut state) = sim();
        nand.short_write(1, 10);
        nand.fail_erase(1, 11);

        let mut dev = Device::new(&mut nand, &mut state);
        let report = dev.format(EraseType::VerifiedGoodBlocks);
        assert_eq!(report.marked_bad, 2);
        assert_eq!(report.erased, 126);
        assert!(!dev.is_good(1, 10));

        // Tested blocks are left erased
        let mut page = vec![0; PAGE];
        dev.driver.read(1, 12 * PPB, &mut page)?;
        assert!(page.is_erased());
        Ok(())
    }

    #[test]
    fn test_erase_partition() -> anyhow::Result<()> {
        let (mut nand, mut state) = sim();
        let data = vec![0x33; PAGE];
        for block in 10..14 {
            nand.write(0, block * PPB, &data)?;
        }
        state.fake_bad.insert((0, 12));

        let entry = RegionEntry {
            partition_id: 4,
            start_physical_block: 10,
            total_physical_blocks: 3,
            interleave: 1,
            ..Default::default()
        };
        Device::new(&mut nand, &mut state).erase_partition(&entry);

        let mut page = vec![0; PAGE];
        for (block, erased) in [(10, true), (11, true), (12, false), (13, false)] {
            nand.read(0, block * PPB, &mut page)?;
            assert_eq!(page.is_erased(), erased, "block {block}");
        }
        Ok(())
    }
}
