//! The block-device facade: partition handles over shared per-device state.
//!
//! A [BlockDevManager] owns every attached flash array. Opening a partition of an array creates the
//! array's [DeviceState] if no other partition has it open, and the last close drops it again.
//! Partition 0 is the unmanaged whole-device view served by raw sector I/O; every other partition
//! is an entry of the region table, served through a translation-layer [Region].
//!
//! Each array sits behind one mutex, held for the whole of every call on any of its partitions.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};

use crate::config::{log2, BlockDevConfig};
use crate::device::{Device, DeviceState};
use crate::error::{DriverContext, Error, Result, Site};
use crate::ftl::{DeviceInfo, Region, RegionIoctl, RegionParams, RegionReply, TranslationLayer};
use crate::nand::NandDriver;
use crate::oracle::BlockStatus;
use crate::raw::{EraseType, FormatReport};
use crate::region::alloc::{AllocateReply, AllocateRequest};
use crate::region::{RegionEntry, RegionTable};

/// Control requests accepted by a partition handle
#[derive(Debug)]
pub enum Ioctl<'b> {
    AllocatePartition(AllocateRequest),
    StartPartitioning,
    FinishPartitioning,
    ReadPhysicalSector { sector: u32, buf: &'b mut [u8] },
    WritePhysicalSector { sector: u32, data: &'b [u8] },
    ErasePhysicalBlock { block: u32, count: u32 },
    MapLogicalToPhysical { sector: u32 },
    LockRegion { sector: u32, count: u32, commit: bool },
    FormatDevice(EraseType),
    QueryPhysicalBlockStatus { block: u32 },

    /// Erase sectors of a managed partition; `None` erases to its end
    EraseLogicalSectors { sector: u32, count: Option<u32> },

    ErasePartition,

    /// Find the physical extent of the partition whose logical start sector is `logical_start`
    GetPartitionPhysicalSectors { logical_start: u32 },

    IsGoodBlock { chip: u32, block: u32 },

    /// Compare every region table copy on flash with the last one saved or loaded
    VerifyCriticalPartitions,

    WriteVerifyMode(bool),
    DisableCache,
    ForceBlockRemap,
    QueryFirstBoot,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoctlReply {
    Done,
    Allocated(AllocateReply),
    PhysicalSector(u32),
    BlockStatus(BlockStatus),
    Formatted(FormatReport),
    PhysicalSectors { start: u32, stop: u32 },
    GoodBlock(bool),
    FirstBoot(bool),
}

/// One attached flash array
struct Slot<D, L> {
    driver: D,
    layer: L,
    state: Option<DeviceState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn closed(site: Site) -> Error {
    Error::IllegalCall {
        site,
        reason: "device state is gone",
    }
}

/// A partition entry as it was opened
struct Opened<D: NandDriver> {
    entry: Option<RegionEntry>,
    region: Option<Box<dyn Region<D> + Send>>,
    interleave: u32,
}

fn open_partition<D: NandDriver, L: TranslationLayer<D>>(
    slot: &mut Slot<D, L>,
    partition_id: u32,
) -> Result<Opened<D>> {
    let site = Site::Open;
    let state = slot.state.as_mut().ok_or(closed(site))?;
    slot.driver.resume().at(site)?;

    if partition_id == 0 {
        return Ok(Opened {
            entry: None,
            region: None,
            interleave: state.interleave(),
        });
    }

    let mut dev = Device::new(&mut slot.driver, state);
    if dev.state.table.is_empty() {
        dev.load_table()?;
    } else {
        dev.refresh_unbounded()?;
    }
    let entry = dev
        .state
        .table
        .find(partition_id)
        .copied()
        .ok_or(Error::PartitionNotFound { site, partition_id })?;

    let params = RegionParams {
        entry,
        geometry: *state.geometry(),
        banks: state.banks(),
    };
    let mut region = slot.layer.open_region(&mut slot.driver, params).at(site)?;
    region
        .ioctl(&mut slot.driver, RegionIoctl::WriteVerify(false))
        .at(site)?;

    Ok(Opened {
        entry: Some(entry),
        region: Some(region),
        interleave: entry.interleave,
    })
}

/// Every attached flash array, by instance number
pub struct BlockDevManager<D, L> {
    config: BlockDevConfig,
    devices: Mutex<BTreeMap<u32, Arc<Mutex<Slot<D, L>>>>>,
}

impl<D: NandDriver, L: TranslationLayer<D>> BlockDevManager<D, L> {
    pub fn new(config: BlockDevConfig) -> Self {
        Self {
            config,
            devices: Default::default(),
        }
    }

    /// Make a flash array available as `instance`, with the translation layer for its managed
    /// partitions
    pub fn attach(&self, instance: u32, driver: D, layer: L) -> Result<()> {
        let mut devices = lock(&self.devices);
        if devices.contains_key(&instance) {
            return Err(Error::BadParameter {
                site: Site::Open,
                reason: "device instance already attached",
            });
        }
        let slot = Slot {
            driver,
            layer,
            state: None,
        };
        devices.insert(instance, Arc::new(Mutex::new(slot)));
        Ok(())
    }

    /// Take a flash array back. Every partition on it must be closed.
    pub fn detach(&self, instance: u32) -> Result<D> {
        let mut devices = lock(&self.devices);
        let slot = devices.remove(&instance).ok_or(Error::BadParameter {
            site: Site::Close,
            reason: "no such device instance",
        })?;
        match Arc::try_unwrap(slot) {
            Ok(slot) => Ok(slot
                .into_inner()
                .unwrap_or_else(PoisonError::into_inner)
                .driver),
            Err(slot) => {
                devices.insert(instance, slot);
                Err(Error::IllegalCall {
                    site: Site::Close,
                    reason: "partitions are still open",
                })
            }
        }
    }

    /// Open partition `partition_id` of array `instance`; 0 is the whole unmanaged device
    pub fn open(&self, instance: u32, partition_id: u32) -> Result<Partition<D, L>> {
        let slot = lock(&self.devices)
            .get(&instance)
            .cloned()
            .ok_or(Error::BadParameter {
                site: Site::Open,
                reason: "no such device instance",
            })?;

        let opened = {
            let mut guard = lock(&slot);
            let inner = &mut *guard;

            let created = inner.state.is_none();
            if created {
                inner.state = Some(DeviceState::new(self.config, inner.driver.geometry())?);
            }

            match open_partition(inner, partition_id) {
                Ok(opened) => {
                    if let Some(state) = inner.state.as_mut() {
                        state.open_count += 1;
                        state.power_count += 1;
                    }
                    opened
                }
                Err(e) => {
                    if created {
                        inner.state = None;
                    }
                    warn!("Opening partition {partition_id} of device {instance} failed: {e}");
                    return Err(e);
                }
            }
        };

        debug!("Opened partition {partition_id} of device {instance}");
        Ok(Partition {
            slot,
            partition_id,
            entry: opened.entry,
            region: opened.region,
            interleave: opened.interleave,
            powered: true,
            read_verify: false,
            open: true,
        })
    }
}

/// An open partition. Dropping the handle closes it; [Partition::close] does the same but reports
/// errors.
pub struct Partition<D: NandDriver, L> {
    slot: Arc<Mutex<Slot<D, L>>>,
    partition_id: u32,
    entry: Option<RegionEntry>,
    region: Option<Box<dyn Region<D> + Send>>,
    interleave: u32,
    powered: bool,
    read_verify: bool,
    open: bool,
}

impl<D: NandDriver, L> std::fmt::Debug for Partition<D, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("partition_id", &self.partition_id)
            .field("open", &self.open)
            .finish_non_exhaustive()
    }
}

impl<D: NandDriver, L> Partition<D, L> {
    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    /// The region table entry, for managed partitions
    pub fn entry(&self) -> Option<&RegionEntry> {
        self.entry.as_ref()
    }

    pub fn interleave(&self) -> u32 {
        self.interleave
    }

    pub fn is_powered(&self) -> bool {
        self.powered
    }

    pub fn read_verify(&self) -> bool {
        self.read_verify
    }

    /// Run `f` on the device with its lock held and its driver awake
    fn with_device<T>(
        &mut self,
        site: Site,
        f: impl FnOnce(&mut Device<'_, D>) -> Result<T>,
    ) -> Result<T> {
        let mut guard = lock(&self.slot);
        let slot = &mut *guard;
        let state = slot.state.as_mut().ok_or(closed(site))?;
        slot.driver.resume().at(site)?;

        let mut dev = Device::new(&mut slot.driver, state);
        if let Some(region) = self.region.as_deref_mut() {
            dev = dev.with_region(region);
        }
        f(&mut dev)
    }

    /// Run `f` on this partition's region, with the device lock held
    fn with_region<T>(
        &mut self,
        site: Site,
        f: impl FnOnce(&mut (dyn Region<D> + Send), &mut D) -> anyhow::Result<T>,
    ) -> Result<T> {
        let region = self
            .region
            .as_deref_mut()
            .ok_or(Error::NotSupported { site })?;
        let mut guard = lock(&self.slot);
        let slot = &mut *guard;
        if slot.state.is_none() {
            return Err(closed(site));
        }
        slot.driver.resume().at(site)?;
        f(region, &mut slot.driver).at(site)
    }

    fn unmanaged_only(&self, site: Site) -> Result<()> {
        match self.entry {
            Some(_) => Err(Error::IllegalCall {
                site,
                reason: "only valid on partition 0",
            }),
            None => Ok(()),
        }
    }

    fn managed_entry(&self, site: Site) -> Result<RegionEntry> {
        self.entry.ok_or(Error::IllegalCall {
            site,
            reason: "not valid on partition 0",
        })
    }

    /// Convert a device logical sector into one relative to this partition
    fn relative_sector(&self, sector: u32, site: Site) -> Result<u32> {
        let entry = self.managed_entry(site)?;
        let log2_ppb = lock(&self.slot)
            .state
            .as_ref()
            .ok_or(closed(site))?
            .log2_pages_per_block();
        let start = entry.start_logical_block << (log2_ppb + log2(entry.interleave));
        sector.checked_sub(start).ok_or(Error::InvalidAddress {
            site,
            address: sector,
        })
    }

    pub fn info(&mut self) -> Result<DeviceInfo> {
        if let Some(region) = &self.region {
            return Ok(region.info());
        }
        self.with_device(Site::GetInfo, |dev| {
            let geometry = dev.geometry();
            let anchor = dev.tail_anchor()?;
            Ok(DeviceInfo {
                bytes_per_sector: geometry.bytes_per_page,
                sectors_per_block: geometry.pages_per_block,
                total_blocks: geometry.total_blocks()
                    - (geometry.blocks_per_chip - anchor.block),
            })
        })
    }

    /// Read whole sectors. On partition 0, `sector` is located by its logical tag and the sectors
    /// that follow it physically are read.
    pub fn read_sector(&mut self, sector: u32, buf: &mut [u8]) -> Result<()> {
        let site = Site::ReadSector;
        if self.region.is_none() {
            return self.with_device(site, |dev| {
                let physical = dev.logical_to_physical(sector)?;
                dev.read_physical(physical, buf)
            });
        }
        let relative = self.relative_sector(sector, site)?;
        self.with_region(site, |region, driver| region.read(driver, relative, buf))
    }

    pub fn write_sector(&mut self, sector: u32, data: &[u8]) -> Result<()> {
        let site = Site::WriteSector;
        if self.region.is_none() {
            let verify = self.read_verify;
            return self.with_device(site, |dev| {
                let physical = dev.logical_to_physical(sector)?;
                dev.write_physical(physical, data, verify)
            });
        }
        let relative = self.relative_sector(sector, site)?;
        self.with_region(site, |region, driver| region.write(driver, relative, data))
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.region.is_none() {
            return Ok(());
        }
        self.with_region(Site::Flush, |region, driver| region.flush(driver))
    }

    pub fn power_up(&mut self) -> Result<()> {
        let site = Site::Power;
        let mut guard = lock(&self.slot);
        let slot = &mut *guard;
        let state = slot.state.as_mut().ok_or(closed(site))?;
        if !self.powered {
            self.powered = true;
            state.power_count += 1;
        }
        slot.driver.resume().at(site)
    }

    /// Flush, and suspend the driver once no partition of the device remains powered
    pub fn power_down(&mut self) -> Result<()> {
        let site = Site::Power;
        self.flush()?;

        let mut guard = lock(&self.slot);
        let slot = &mut *guard;
        let state = slot.state.as_mut().ok_or(closed(site))?;
        if self.powered {
            self.powered = false;
            state.power_count = state.power_count.saturating_sub(1);
        }
        if state.power_count == 0 {
            debug!("No powered partitions left, suspending");
            slot.driver.suspend().at(site)?;
        }
        Ok(())
    }

    /// Treat a block as bad regardless of what the flash says, for fault-injection testing
    pub fn force_bad(&mut self, chip: u32, block: u32) -> Result<()> {
        self.with_device(Site::BlockStatus, |dev| {
            dev.state.fake_bad.insert((chip, block));
            dev.state.anchor = None;
            Ok(())
        })
    }

    /// The in-memory region table, read from flash first if there is none
    pub fn region_table(&mut self) -> Result<RegionTable> {
        self.with_device(Site::LoadRegionTable, |dev| {
            if dev.state.table.is_empty() {
                dev.load_table()?;
            }
            Ok(dev.state.table.clone())
        })
    }

    pub fn ioctl(&mut self, request: Ioctl<'_>) -> Result<IoctlReply> {
        match request {
            Ioctl::AllocatePartition(request) => {
                let site = Site::AllocatePartition;
                self.unmanaged_only(site)?;
                self.with_device(site, |dev| dev.allocate(&request))
                    .map(IoctlReply::Allocated)
            }
            Ioctl::StartPartitioning => {
                let site = Site::PartitionOperation;
                self.unmanaged_only(site)?;
                self.with_device(site, |dev| {
                    dev.start_partitioning();
                    Ok(IoctlReply::Done)
                })
            }
            Ioctl::FinishPartitioning => {
                let site = Site::PartitionOperation;
                self.unmanaged_only(site)?;
                self.with_device(site, |dev| dev.finish_partitioning())?;
                Ok(IoctlReply::Done)
            }
            Ioctl::ReadPhysicalSector { sector, buf } => {
                let site = Site::ReadPhysical;
                self.unmanaged_only(site)?;
                self.with_device(site, |dev| dev.read_physical(sector, buf))?;
                Ok(IoctlReply::Done)
            }
            Ioctl::WritePhysicalSector { sector, data } => {
                let site = Site::WritePhysical;
                self.unmanaged_only(site)?;
                let verify = self.read_verify;
                self.with_device(site, |dev| dev.write_physical(sector, data, verify))?;
                Ok(IoctlReply::Done)
            }
            Ioctl::ErasePhysicalBlock { block, count } => {
                self.with_device(Site::ErasePhysical, |dev| dev.erase_physical(block, count))?;
                Ok(IoctlReply::Done)
            }
            Ioctl::MapLogicalToPhysical { sector } => {
                let site = Site::LogicalToPhysical;
                self.unmanaged_only(site)?;
                self.with_device(site, |dev| dev.logical_to_physical(sector))
                    .map(IoctlReply::PhysicalSector)
            }
            Ioctl::LockRegion {
                sector,
                count,
                commit,
            } => {
                self.with_device(Site::LockRegion, |dev| {
                    dev.lock_region(sector, count, commit)
                })?;
                Ok(IoctlReply::Done)
            }
            Ioctl::FormatDevice(erase_type) => self
                .with_device(Site::FormatDevice, |dev| Ok(dev.format(erase_type)))
                .map(IoctlReply::Formatted),
            Ioctl::QueryPhysicalBlockStatus { block } => self
                .with_device(Site::QueryBlockStatus, |dev| dev.query_block_status(block))
                .map(IoctlReply::BlockStatus),
            Ioctl::EraseLogicalSectors { sector, count } => {
                let site = Site::EraseLogicalSectors;
                let start_sector = self.relative_sector(sector, site)?;
                let info = self.info()?;
                let limit = info.total_blocks * info.sectors_per_block;
                if start_sector >= limit {
                    return Err(Error::InvalidAddress {
                        site,
                        address: sector,
                    });
                }
                let end = count.map(|count| start_sector.checked_add(count));
                if end.is_some_and(|end| end.map_or(true, |end| end > limit)) {
                    return Err(Error::BadParameter {
                        site,
                        reason: "erase extends past the partition",
                    });
                }
                self.forward(
                    site,
                    RegionIoctl::EraseLogicalSectors {
                        start_sector,
                        count,
                    },
                )?;
                Ok(IoctlReply::Done)
            }
            Ioctl::ErasePartition => {
                let site = Site::ErasePartition;
                let entry = self.managed_entry(site)?;
                self.with_device(site, |dev| {
                    dev.erase_partition(&entry);
                    Ok(IoctlReply::Done)
                })
            }
            Ioctl::GetPartitionPhysicalSectors { logical_start } => self
                .with_device(Site::PartitionPhysicalSectors, |dev| {
                    dev.partition_physical_sectors(logical_start)
                })
                .map(|(start, stop)| IoctlReply::PhysicalSectors { start, stop }),
            Ioctl::IsGoodBlock { chip, block } => {
                let site = Site::RegionIoctl;
                self.managed_entry(site)?;
                match self.forward(site, RegionIoctl::IsGoodBlock { chip, block })? {
                    RegionReply::GoodBlock(good) => Ok(IoctlReply::GoodBlock(good)),
                    _ => Ok(IoctlReply::Done),
                }
            }
            Ioctl::VerifyCriticalPartitions => {
                self.with_device(Site::VerifyRegionTable, |dev| {
                    // Nothing saved or loaded since the device state was created
                    if dev.state.golden.is_none() && dev.state.table.is_empty() {
                        dev.load_table()?;
                    }
                    dev.verify_table()
                })?;
                Ok(IoctlReply::Done)
            }
            Ioctl::WriteVerifyMode(enable) => {
                self.read_verify = enable;
                if self.region.is_some() {
                    self.forward(Site::RegionIoctl, RegionIoctl::WriteVerify(enable))?;
                }
                Ok(IoctlReply::Done)
            }
            Ioctl::DisableCache => self
                .forward(Site::RegionIoctl, RegionIoctl::DisableCache)
                .map(|_| IoctlReply::Done),
            Ioctl::ForceBlockRemap => self
                .forward(Site::RegionIoctl, RegionIoctl::ForceBlockRemap)
                .map(|_| IoctlReply::Done),
            Ioctl::QueryFirstBoot => {
                match self.forward(Site::RegionIoctl, RegionIoctl::QueryFirstBoot)? {
                    RegionReply::FirstBoot(first) => Ok(IoctlReply::FirstBoot(first)),
                    _ => Ok(IoctlReply::Done),
                }
            }
        }
    }

    fn forward(&mut self, site: Site, request: RegionIoctl) -> Result<RegionReply> {
        self.with_region(site, |region, driver| region.ioctl(driver, request))
    }

    /// Close the partition, dropping the device state if it was the last one open
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;

        let mut guard = lock(&self.slot);
        let slot = &mut *guard;
        let result = match self.region.take() {
            Some(mut region) => region.close(&mut slot.driver).at(Site::Close),
            None => Ok(()),
        };

        let last = match slot.state.as_mut() {
            Some(state) => {
                state.open_count = state.open_count.saturating_sub(1);
                if self.powered {
                    state.power_count = state.power_count.saturating_sub(1);
                }
                state.open_count == 0
            }
            None => false,
        };
        if last {
            info!("Last partition closed, releasing device state");
            slot.state = None;
            if let Err(e) = slot.driver.suspend() {
                warn!("Suspend after close failed: {e:#}");
            }
        }

        self.powered = false;
        self.read_verify = false;
        result
    }
}

impl<D: NandDriver, L> Drop for Partition<D, L> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Closing partition {} failed: {e}", self.partition_id);
        }
    }
}

impl<D: NandDriver> Device<'_, D> {
    /// Physical start and stop sectors, in device interleave units, of the partition whose
    /// logical start sector (in its own interleave units) is `logical_start`
    pub fn partition_physical_sectors(&mut self, logical_start: u32) -> Result<(u32, u32)> {
        let site = Site::PartitionPhysicalSectors;
        let log2_ppb = self.state.log2_pages_per_block();
        let index = self
            .state
            .table
            .entries
            .iter()
            .position(|x| x.start_logical_block << (log2_ppb + log2(x.interleave)) == logical_start)
            .ok_or(Error::BadParameter {
                site,
                reason: "no partition starts at that sector",
            })?;

        if self.state.table.entries[index].unbounded {
            self.refresh_unbounded()?;
        }
        let entry = self.state.table.entries[index];
        let shift = log2_ppb + self.state.log2_interleave();
        Ok((
            entry.start_physical_block << shift,
            entry.physical_end() << shift,
        ))
    }
}
