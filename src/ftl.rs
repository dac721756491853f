//! The seam between the block layer and the translation layer that manages a partition.
//!
//! Every partition other than 0 is handed to a [TranslationLayer] when it is opened, which returns
//! a [Region] the block layer then forwards sector I/O, flushes and region-specific ioctls to. The
//! region never owns the driver: each call borrows it from the device for the duration of the
//! call, with the device lock held.
//!
//! [DirectLayer] is the simplest possible translation layer: partition blocks map straight onto
//! the good blocks of the partition's physical extent. It keeps no translation table and does no
//! wear levelling.

use anyhow::{bail, ensure};
use log::debug;

use crate::nand::bank::BankMap;
use crate::nand::{NandDriver, NandGeometry};
use crate::oracle::{query_driver, BlockStatus};
use crate::region::RegionEntry;

/// The shape of a partition as seen by its users
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub bytes_per_sector: usize,
    pub sectors_per_block: u32,
    pub total_blocks: u32,
}

/// Requests the block layer passes through to a region
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegionIoctl {
    /// Erase partition-relative sectors; `None` erases to the end of the partition
    EraseLogicalSectors { start_sector: u32, count: Option<u32> },

    /// Read back and compare everything written from now on
    WriteVerify(bool),

    DisableCache,
    ForceBlockRemap,
    QueryFirstBoot,
    IsGoodBlock { chip: u32, block: u32 },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegionReply {
    Done,
    FirstBoot(bool),
    GoodBlock(bool),
}

/// What a translation layer is told about the partition it opens
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RegionParams {
    pub entry: RegionEntry,
    pub geometry: NandGeometry,

    /// Translation for the device-wide interleave factor
    pub banks: BankMap,
}

/// Opens regions over partitions of a device
pub trait TranslationLayer<D: NandDriver> {
    fn open_region(
        &mut self,
        driver: &mut D,
        params: RegionParams,
    ) -> anyhow::Result<Box<dyn Region<D> + Send>>;
}

/// One open partition, addressed in partition-relative sectors
pub trait Region<D: NandDriver> {
    fn info(&self) -> DeviceInfo;

    fn read(&mut self, driver: &mut D, sector: u32, content: &mut [u8]) -> anyhow::Result<()>;

    fn write(&mut self, driver: &mut D, sector: u32, content: &[u8]) -> anyhow::Result<()>;

    fn flush(&mut self, driver: &mut D) -> anyhow::Result<()>;

    /// The region's view of a physical block's health
    fn block_status(
        &mut self,
        driver: &mut D,
        chip: u32,
        block: u32,
    ) -> anyhow::Result<BlockStatus>;

    fn ioctl(&mut self, driver: &mut D, request: RegionIoctl) -> anyhow::Result<RegionReply>;

    fn close(&mut self, _driver: &mut D) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A translation layer with a fixed mapping onto good blocks
#[derive(Debug, Default, Copy, Clone)]
pub struct DirectLayer;

impl<D: NandDriver> TranslationLayer<D> for DirectLayer {
    fn open_region(
        &mut self,
        _driver: &mut D,
        params: RegionParams,
    ) -> anyhow::Result<Box<dyn Region<D> + Send>> {
        ensure!(
            params.entry.interleave.is_power_of_two(),
            "partition {} has interleave {}",
            params.entry.partition_id,
            params.entry.interleave
        );
        debug!("Direct region over partition {}", params.entry.partition_id);
        Ok(Box::new(DirectRegion {
            params,
            read_verify: false,
        }))
    }
}

#[derive(Debug)]
pub struct DirectRegion {
    params: RegionParams,
    read_verify: bool,
}

impl DirectRegion {
    fn pages_per_block(&self) -> u32 {
        self.params.geometry.pages_per_block
    }

    /// Partition capacity in physical blocks
    fn capacity(&self) -> u32 {
        let entry = &self.params.entry;
        let super_blocks = match entry.total_logical_blocks {
            0 => entry.total_physical_blocks,
            n => n,
        };
        super_blocks * entry.interleave
    }

    /// Find the chip and block holding partition block `index`: the Nth good block of its bank
    fn locate<D: NandDriver>(&self, driver: &mut D, index: u32) -> anyhow::Result<(u32, u32)> {
        let entry = &self.params.entry;
        ensure!(
            index < self.capacity(),
            "block {index} is past the end of partition {}",
            entry.partition_id
        );

        let bank = index % entry.interleave;
        let mut column = index / entry.interleave;
        for super_block in entry.start_physical_block..entry.physical_end() {
            let Some((chip, block)) = self.params.banks.translate(bank, super_block) else {
                break;
            };
            if !query_driver(driver, chip, block).good {
                continue;
            }
            if column == 0 {
                return Ok((chip, block));
            }
            column -= 1;
        }
        bail!(
            "partition {} has too few good blocks for block {index}",
            entry.partition_id
        )
    }

    /// Tag stored with partition block `index`, in device logical super-blocks
    fn tag_for(&self, index: u32) -> u32 {
        self.params.entry.start_logical_block + index / self.params.entry.interleave
    }

    /// Split a sector range into (block index, first page, page count) runs
    fn runs(&self, sector: u32, sectors: u32) -> Vec<(u32, u32, u32)> {
        let ppb = self.pages_per_block();
        let mut out = vec![];
        let mut sector = sector;
        let end = sector + sectors;
        while sector < end {
            let page = sector % ppb;
            let count = (ppb - page).min(end - sector);
            out.push((sector / ppb, page, count));
            sector += count;
        }
        out
    }

    fn sectors_in(&self, bytes: usize) -> anyhow::Result<u32> {
        let page_size = self.params.geometry.bytes_per_page;
        ensure!(bytes % page_size == 0, "buffer not multiple of sector size");
        Ok((bytes / page_size) as u32)
    }
}

impl<D: NandDriver> Region<D> for DirectRegion {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            bytes_per_sector: self.params.geometry.bytes_per_page,
            sectors_per_block: self.pages_per_block(),
            total_blocks: self.capacity(),
        }
    }

    fn read(&mut self, driver: &mut D, sector: u32, content: &mut [u8]) -> anyhow::Result<()> {
        let page_size = self.params.geometry.bytes_per_page;
        let sectors = self.sectors_in(content.len())?;

        let mut rest = content;
        for (index, page, count) in self.runs(sector, sectors) {
            let (chip, block) = self.locate(driver, index)?;
            let (chunk, tail) = rest.split_at_mut(count as usize * page_size);
            let first = block * self.pages_per_block() + page;
            let read = driver.read(chip, first, chunk)?;
            ensure!(read == count, "read {read} of {count} sectors");
            rest = tail;
        }
        Ok(())
    }

    fn write(&mut self, driver: &mut D, sector: u32, content: &[u8]) -> anyhow::Result<()> {
        let geometry = self.params.geometry;
        let sectors = self.sectors_in(content.len())?;

        let mut rest = content;
        for (index, page, count) in self.runs(sector, sectors) {
            let (chip, block) = self.locate(driver, index)?;
            let (chunk, tail) = rest.split_at(count as usize * geometry.bytes_per_page);
            let block_start = block * geometry.pages_per_block;

            if page == 0 {
                driver.erase(chip, block)?;
                let tag = self.tag_for(index).to_le_bytes();
                driver.write_spare(chip, block_start, geometry.tag_offset, &tag)?;
            }

            let written = driver.write(chip, block_start + page, chunk)?;
            ensure!(written == count, "wrote {written} of {count} sectors");

            if self.read_verify {
                let mut readback = vec![0; chunk.len()];
                driver.read(chip, block_start + page, &mut readback)?;
                ensure!(
                    readback == chunk,
                    "read-back mismatch on chip {chip} block {block}"
                );
            }
            rest = tail;
        }
        Ok(())
    }

    fn flush(&mut self, _driver: &mut D) -> anyhow::Result<()> {
        Ok(())
    }

    fn block_status(
        &mut self,
        driver: &mut D,
        chip: u32,
        block: u32,
    ) -> anyhow::Result<BlockStatus> {
        Ok(query_driver(driver, chip, block))
    }

    fn ioctl(&mut self, driver: &mut D, request: RegionIoctl) -> anyhow::Result<RegionReply> {
        match request {
            RegionIoctl::EraseLogicalSectors {
                start_sector,
                count,
            } => {
                let ppb = self.pages_per_block();
                let end = match count {
                    Some(count) => start_sector.saturating_add(count).div_ceil(ppb),
                    None => self.capacity(),
                };
                for index in start_sector / ppb..end.min(self.capacity()) {
                    let (chip, block) = self.locate(driver, index)?;
                    driver.erase(chip, block)?;
                }
            }
            RegionIoctl::WriteVerify(enable) => self.read_verify = enable,
            RegionIoctl::DisableCache | RegionIoctl::ForceBlockRemap => {}
            RegionIoctl::QueryFirstBoot => {
                let tag_offset = self.params.geometry.tag_offset;
                let entry = self.params.entry;
                for super_block in entry.start_physical_block..entry.physical_end() {
                    let Some((chip, block)) = self.params.banks.translate(0, super_block) else {
                        break;
                    };
                    if driver.block_info(chip, block)?.tag(tag_offset).is_some() {
                        return Ok(RegionReply::FirstBoot(false));
                    }
                }
                return Ok(RegionReply::FirstBoot(true));
            }
            RegionIoctl::IsGoodBlock { chip, block } => {
                return Ok(RegionReply::GoodBlock(query_driver(driver, chip, block).good));
            }
        }
        Ok(RegionReply::Done)
    }
}
