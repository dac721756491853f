//! Persistence of the region table in redundant copies at the tail of the last chip.
//!
//! The newest copy lives in the last good block of the last chip (the "tail anchor"); older copies
//! follow in the next good blocks below it. Every copy is a single page at the start of its block.

use log::{debug, info, warn};

use super::codec;
use crate::config::log2;
use crate::device::Device;
use crate::error::{DriverContext, Error, Result, Site};
use crate::nand::NandDriver;

/// The block holding the newest region-table copy
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TailAnchor {
    pub chip: u32,
    pub block: u32,
}

impl<D: NandDriver> Device<'_, D> {
    /// Find (or recall) the last good block of the last chip
    pub fn tail_anchor(&mut self) -> Result<TailAnchor> {
        if let Some(anchor) = self.state.anchor {
            return Ok(anchor);
        }

        let geometry = self.geometry();
        let chip = geometry.chips - 1;
        for block in (0..geometry.blocks_per_chip).rev() {
            if chip == 0 && block == 0 {
                break;
            }
            // Only real hardware state decides where the table lives
            if self.block_status(chip, block).good {
                let anchor = TailAnchor { chip, block };
                debug!("Region table anchor at chip {chip} block {block}");
                self.state.anchor = Some(anchor);
                return Ok(anchor);
            }
        }

        Err(Error::BadBlocksExhausted {
            site: Site::TailAnchor,
        })
    }

    /// Lowest block of `chip` that may hold a table copy
    fn table_floor(&self, chip: u32) -> u32 {
        match chip {
            0 => self.config().first_physical_block,
            _ => 0,
        }
    }

    /// Step down from `block` (inclusive) to the next good block on the anchor chip
    fn good_block_at_or_below(&mut self, chip: u32, mut block: u32) -> Option<u32> {
        let floor = self.table_floor(chip);
        loop {
            if block < floor {
                return None;
            }
            if self.is_good(chip, block) {
                return Some(block);
            }
            debug!("Skipping bad chip {chip} block {block} below region table anchor");
            block = block.checked_sub(1)?;
        }
    }

    /// The block the oldest redundant copy lands on, counting down over good blocks from the
    /// anchor. Partitions must end below it.
    pub(crate) fn oldest_table_copy(&mut self) -> Result<TailAnchor> {
        let anchor = self.tail_anchor()?;
        let mut block = anchor.block;
        let mut cursor = Some(anchor.block);
        for _ in 0..self.config().redundant_copies {
            block = cursor
                .and_then(|x| self.good_block_at_or_below(anchor.chip, x))
                .ok_or(Error::BadBlocksExhausted {
                    site: Site::TailAnchor,
                })?;
            cursor = block.checked_sub(1);
        }
        Ok(TailAnchor {
            chip: anchor.chip,
            block,
        })
    }

    /// Write the in-memory region table to every redundant copy, replacing bad blocks on the way
    pub fn save_table(&mut self) -> Result<()> {
        let geometry = self.geometry();
        let encoded = codec::encode(&self.state.table, geometry.bytes_per_page).map_err(
            |e| match e {
                Error::TableTooLarge {
                    bytes, sector_size, ..
                } => Error::TableTooLarge {
                    site: Site::SaveRegionTable,
                    bytes,
                    sector_size,
                },
                e => e,
            },
        )?;
        let mut page = encoded.clone();
        page.resize(geometry.bytes_per_page, 0xFF);

        let anchor = self.tail_anchor()?;
        let chip = anchor.chip;
        let exhausted = || Error::BadBlocksExhausted {
            site: Site::SaveRegionTable,
        };

        let mut cursor = Some(anchor.block);
        for copy in 0..self.config().redundant_copies {
            loop {
                let block = cursor
                    .and_then(|x| self.good_block_at_or_below(chip, x))
                    .ok_or_else(exhausted)?;
                cursor = block.checked_sub(1);

                match self.write_table_copy(chip, block, &page) {
                    Ok(()) => {
                        info!("Saved region table copy {copy} to chip {chip} block {block}");
                        break;
                    }
                    Err(e) => {
                        warn!("Region table copy {copy} failed on chip {chip} block {block}: {e}");
                        self.mark_bad(chip, block);
                    }
                }
            }
        }

        self.state.golden = Some(encoded);
        Ok(())
    }

    fn write_table_copy(&mut self, chip: u32, block: u32, page: &[u8]) -> Result<()> {
        let site = Site::SaveRegionTable;
        let first_page = block * self.geometry().pages_per_block;

        self.driver.erase(chip, block).at(site)?;
        let written = self.driver.write(chip, first_page, page).at(site)?;
        if written != 1 {
            return Err(Error::ShortTransfer {
                site,
                chip,
                block,
                requested: 1,
                actual: written,
            });
        }

        // Dummy read of another page before reading the copy back
        let mut readback = vec![0; page.len()];
        self.driver.read(chip, 0, &mut readback).at(site)?;

        self.read_table_page(chip, block, &mut readback, site)?;
        if readback != page {
            return Err(Error::TableCorrupt { site });
        }
        Ok(())
    }

    fn read_table_page(&mut self, chip: u32, block: u32, buf: &mut [u8], site: Site) -> Result<()> {
        let first_page = block * self.geometry().pages_per_block;
        let read = self.driver.read(chip, first_page, buf).at(site)?;
        if read != 1 {
            return Err(Error::ShortTransfer {
                site,
                chip,
                block,
                requested: 1,
                actual: read,
            });
        }
        Ok(())
    }

    /// Replace the in-memory region table with the newest copy on flash that decodes
    pub fn load_table(&mut self) -> Result<()> {
        let site = Site::LoadRegionTable;
        let anchor = self.tail_anchor()?;
        let chip = anchor.chip;
        let mut buf = vec![0; self.geometry().bytes_per_page];

        let mut candidate = Some(anchor.block);
        for copy in 0..self.config().redundant_copies {
            let Some(block) = candidate.and_then(|x| self.good_block_at_or_below(chip, x)) else {
                break;
            };
            candidate = block.checked_sub(1);

            let decoded = self
                .read_table_page(chip, block, &mut buf, site)
                .and_then(|()| codec::decode(&buf));
            match decoded {
                Ok((table, len)) => {
                    info!(
                        "Loaded region table ({} entries) from copy {copy} at chip {chip} block {block}",
                        table.entries.len()
                    );
                    self.state.table = table;
                    self.state.golden = Some(buf[..len].to_vec());
                    return self.refresh_unbounded();
                }
                Err(e) => warn!("Region table copy {copy} at chip {chip} block {block}: {e}"),
            }
        }

        Err(Error::TableCorrupt { site })
    }

    /// Check that every redundant copy on flash matches the table last saved or loaded
    pub fn verify_table(&mut self) -> Result<()> {
        let site = Site::VerifyRegionTable;
        let golden = self
            .state
            .golden
            .clone()
            .ok_or(Error::TableCorrupt { site })?;

        let anchor = self.tail_anchor()?;
        let chip = anchor.chip;
        let mut buf = vec![0; self.geometry().bytes_per_page];

        let mut cursor = Some(anchor.block);
        for copy in 0..self.config().redundant_copies {
            let block = cursor
                .and_then(|x| self.good_block_at_or_below(chip, x))
                .ok_or(Error::BadBlocksExhausted { site })?;
            cursor = block.checked_sub(1);

            self.read_table_page(chip, block, &mut buf, site)?;
            if buf[..golden.len()] != golden[..] {
                warn!("Region table copy {copy} at chip {chip} block {block} does not match");
                return Err(Error::TableCorrupt { site });
            }
        }

        Ok(())
    }

    /// How many physical super-blocks an unbounded partition starting at `start_physical` has,
    /// given the current bad blocks around the region table copies.
    ///
    /// Bad blocks inside the partition body are not subtracted; only those among the table copies
    /// shift the end of the usable area.
    pub fn unbounded_extent(&mut self, start_physical: u32) -> Result<u32> {
        let interleave = self.state.interleave();
        self.tail_extent(start_physical, interleave)
    }

    /// [Self::unbounded_extent] for a given device interleave factor
    pub(crate) fn tail_extent(&mut self, start_physical: u32, interleave: u32) -> Result<u32> {
        let site = Site::UnboundedExtent;
        let geometry = self.geometry();
        let copies = self.config().redundant_copies;
        let bpc = geometry.blocks_per_chip;

        let anchor = self.tail_anchor()?;
        let floor = self.table_floor(anchor.chip);

        // Walk the blocks the older copies occupy, counting the bad ones in between
        let mut bad = 0;
        let mut found = 1;
        let mut block = anchor.block;
        while found < copies {
            block = match block.checked_sub(1) {
                Some(block) if block >= floor => block,
                _ => return Err(Error::BadBlocksExhausted { site }),
            };
            if self.is_good(anchor.chip, block) {
                found += 1;
            } else {
                bad += 1;
            }
        }

        let log2_il = log2(interleave);

        let last_good = anchor.chip * bpc + anchor.block;
        let unused = ((bpc - anchor.block) + copies - 1 + bad) * (interleave - 1);

        let needed = start_physical << log2_il;
        let count = last_good
            .checked_sub(copies + bad)
            .and_then(|last_end| last_end.checked_add(1))
            .and_then(|end| end.checked_sub(needed))
            .and_then(|x| x.checked_sub(unused))
            .map(|x| x >> log2_il)
            .ok_or(Error::InsufficientSpace {
                site,
                needed,
                available: last_good,
            })?;

        debug!("Unbounded extent from super-block {start_physical}: {count} super-blocks");
        Ok(count)
    }

    /// Recompute the physical extent of every unbounded entry from the live bad-block population
    pub fn refresh_unbounded(&mut self) -> Result<()> {
        for index in 0..self.state.table.entries.len() {
            let entry = self.state.table.entries[index];
            if entry.unbounded {
                let total = self.unbounded_extent(entry.start_physical_block)?;
                self.state.table.entries[index].total_physical_blocks = total;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::test_util::sim;
    use crate::nand::TEST_LAYOUT;
    use crate::region::{MgmtPolicy, RegionEntry, RegionTable};

    fn sample() -> RegionTable {
        RegionTable {
            entries: vec![RegionEntry {
                partition_id: 5,
                start_logical_block: 0,
                total_logical_blocks: 20,
                start_physical_block: 1,
                total_physical_blocks: 26,
                interleave: 1,
                policy: MgmtPolicy::FtlLite,
                ..Default::default()
            }],
            interleave: 1,
        }
    }

    #[test]
    fn test_tail_anchor() -> anyhow::Result<()> {
        let (mut nand, mut state) = sim();
        nand.set_factory_bad(1, 63)?;
        nand.set_factory_bad(1, 62)?;

        let mut dev = Device::new(&mut nand, &mut state);
        assert_eq!(dev.tail_anchor()?, TailAnchor { chip: 1, block: 61 });

        // Forced-bad blocks do not move the anchor, but marking bad does
        dev.state.anchor = None;
        dev.state.fake_bad.insert((1, 61));
        assert_eq!(dev.tail_anchor()?.block, 61);
        dev.mark_bad(1, 61);
        assert_eq!(dev.state.anchor, None);
        assert_eq!(dev.tail_anchor()?.block, 60);
        Ok(())
    }

    #[test]
    fn test_save_load() -> anyhow::Result<()> {
        let (mut nand, mut state) = sim();
        state.table = sample();

        let mut dev = Device::new(&mut nand, &mut state);
        dev.save_table()?;
        let golden = dev.state.golden.clone();
        assert_eq!(golden.as_ref().map(Vec::len), Some(codec::encoded_len(1)));

        dev.state.table = Default::default();
        dev.state.golden = None;
        dev.load_table()?;
        assert_eq!(dev.state.table, sample());
        assert_eq!(dev.state.golden, golden);
        dev.verify_table()?;

        // One page per copy, in the four blocks at the tail
        let ppb = TEST_LAYOUT.pages_per_block;
        let mut page = vec![0; TEST_LAYOUT.bytes_per_page];
        for block in 60..64 {
            nand.read(1, block * ppb, &mut page)?;
            assert_eq!(&page[..4], &[0xBE, 0xBA, 0xED, 0xFE]);
        }
        nand.read(1, 59 * ppb, &mut page)?;
        assert!(page.iter().all(|&x| x == 0xFF));
        Ok(())
    }

    #[test]
    fn test_load_falls_back_to_older_copy() -> anyhow::Result<()> {
        let (mut nand, mut state) = sim();
        state.table = sample();
        Device::new(&mut nand, &mut state).save_table()?;

        // Break the newest copy's start magic
        let ppb = TEST_LAYOUT.pages_per_block;
        nand.flip_byte(1, 63 * ppb, 0)?;

        state.table = Default::default();
        let mut dev = Device::new(&mut nand, &mut state);
        dev.load_table()?;
        assert_eq!(dev.state.table, sample());

        // ...but the flash no longer matches everywhere
        assert!(matches!(
            dev.verify_table(),
            Err(Error::TableCorrupt {
                site: Site::VerifyRegionTable
            })
        ));
        Ok(())
    }

    #[test]
    fn test_load_skips_forced_bad_anchor() -> anyhow::Result<()> {
        let (mut nand, mut state) = sim();
        state.table = sample();
        Device::new(&mut nand, &mut state).save_table()?;

        // The stale copy at block 63 stays on flash once the block is forced bad
        let mut newer = sample();
        newer.entries[0].partition_id = 6;
        state.fake_bad.insert((1, 63));
        state.anchor = None;
        state.table = newer.clone();
        Device::new(&mut nand, &mut state).save_table()?;

        state.table = Default::default();
        state.golden = None;
        let mut dev = Device::new(&mut nand, &mut state);
        dev.load_table()?;
        assert_eq!(dev.state.table, newer);
        dev.verify_table()?;
        Ok(())
    }

    #[test]
    fn test_load_all_copies_corrupt() -> anyhow::Result<()> {
        let (mut nand, mut state) = sim();
        state.table = sample();
        Device::new(&mut nand, &mut state).save_table()?;

        let ppb = TEST_LAYOUT.pages_per_block;
        for block in 60..64 {
            nand.flip_byte(1, block * ppb, 0)?;
        }

        let err = Device::new(&mut nand, &mut state).load_table().unwrap_err();
        assert!(matches!(
            err,
            Error::TableCorrupt {
                site: Site::LoadRegionTable
            }
        ));
        Ok(())
    }

    #[test]
    fn test_save_skips_failing_block() -> anyhow::Result<()> {
        let (mut nand, mut state) = sim();
        state.table = sample();
        nand.short_write(1, 62);
        nand.set_factory_bad(1, 60)?;

        Device::new(&mut nand, &mut state).save_table()?;
        nand.heal();

        // 62 failed and was marked bad, 60 was skipped; the copies went to 63, 61, 59, 58
        let mut dev = Device::new(&mut nand, &mut state);
        assert!(!dev.block_status(1, 62).runtime_good);
        for block in [63, 61, 59, 58] {
            assert!(dev.block_status(1, block).good);
        }
        dev.verify_table()?;

        dev.state.table = Default::default();
        dev.load_table()?;
        assert_eq!(dev.state.table, sample());
        Ok(())
    }

    #[test]
    fn test_save_too_large() {
        let (mut nand, mut state) = sim();
        state.table.entries = vec![sample().entries[0]; 8];

        let err = Device::new(&mut nand, &mut state).save_table().unwrap_err();
        assert!(matches!(
            err,
            Error::TableTooLarge {
                site: Site::SaveRegionTable,
                ..
            }
        ));
        assert!(state.golden.is_none());
    }

    #[test]
    fn test_verify_without_table() {
        let (mut nand, mut state) = sim();
        let err = Device::new(&mut nand, &mut state)
            .verify_table()
            .unwrap_err();
        assert!(matches!(err, Error::TableCorrupt { .. }));
    }

    #[test]
    fn test_unbounded_extent() -> anyhow::Result<()> {
        let (mut nand, mut state) = sim();
        let mut dev = Device::new(&mut nand, &mut state);

        // Anchor at chip 1 block 63 = global block 127; copies take 124..=127
        assert_eq!(dev.unbounded_extent(27)?, 124 - 27);
        assert!(matches!(
            dev.unbounded_extent(125),
            Err(Error::InsufficientSpace { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_unbounded_recompute_on_load() -> anyhow::Result<()> {
        let (mut nand, mut state) = sim();
        let mut table = sample();
        table.entries.push(RegionEntry {
            partition_id: 6,
            start_logical_block: 20,
            total_logical_blocks: 97,
            start_physical_block: 27,
            total_physical_blocks: 97,
            interleave: 1,
            unbounded: true,
            ..Default::default()
        });
        state.table = table;

        let mut dev = Device::new(&mut nand, &mut state);
        dev.save_table()?;
        dev.load_table()?;
        let before = dev.state.table.entries[1].total_physical_blocks;
        assert_eq!(before, 97);

        // A block lost among the table copies shrinks the extent by one
        dev.mark_bad(1, 62);
        dev.load_table()?;
        assert_eq!(dev.state.table.entries[1].total_physical_blocks, before - 1);

        // Known approximation: a bad block in the partition body is not subtracted
        dev.mark_bad(1, 10);
        dev.load_table()?;
        assert_eq!(dev.state.table.entries[1].total_physical_blocks, before - 1);
        Ok(())
    }
}
