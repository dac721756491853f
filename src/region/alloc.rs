//! Carving new partitions out of the good blocks that remain

use log::{debug, info};

use super::{MgmtPolicy, RegionEntry};
use crate::config::log2;
use crate::device::Device;
use crate::error::{Error, Result, Site};
use crate::nand::bank::BankMap;
use crate::nand::NandDriver;

/// Where a new partition starts
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Right after the previous partition
    Relative,

    /// At a caller-chosen physical sector, which must be super-block aligned
    Absolute { start_sector: u32 },
}

/// How large a new partition is
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PartitionSize {
    /// At least this many logical sectors
    Fixed { sectors: u32 },

    /// Everything up to the region table at the end of the device
    Remainder,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AllocateRequest {
    pub partition_id: u32,
    pub placement: Placement,
    pub size: PartitionSize,
    pub policy: MgmtPolicy,

    /// Replacement headroom as a percentage of the partition's logical blocks
    pub percent_reserved: u32,

    /// Requested interleave factor (a power of two)
    pub interleave: u32,

    /// Whether the partition itself is accessed interleaved; if not, it uses one bank
    pub interleave_enabled: bool,

    pub sequenced_read: bool,
}

impl AllocateRequest {
    /// A relative, lite-FTL, non-interleaved request
    pub fn relative(partition_id: u32, size: PartitionSize) -> Self {
        Self {
            partition_id,
            placement: Placement::Relative,
            size,
            policy: MgmtPolicy::FtlLite,
            percent_reserved: 0,
            interleave: 1,
            interleave_enabled: false,
            sequenced_read: false,
        }
    }
}

/// Where the new partition landed, in sectors of its own interleave factor
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AllocateReply {
    pub start_logical_sector: u32,
    pub start_physical_sector: u32,
    pub logical_sectors: u32,
    pub physical_sectors: u32,
}

/// Result of walking forward through the good blocks of every interleave column in lock-step
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ColumnScan {
    /// Rows for which every column found a good block
    pub found: u32,

    /// Last accepted super-block in each column
    pub cursors: Vec<u32>,
}

impl<D: NandDriver> Device<'_, D> {
    /// Forget the in-memory table and start building a new one
    pub fn start_partitioning(&mut self) {
        info!("Starting new partition layout");
        self.state.reset_partitioning();
    }

    /// Persist the table built since [Self::start_partitioning]
    pub fn finish_partitioning(&mut self) -> Result<()> {
        self.save_table()?;
        info!(
            "Partition layout with {} entries saved",
            self.state.table.entries.len()
        );
        Ok(())
    }

    /// Super-blocks per column that allocation may use before reaching the region table copies
    fn max_super_block(&mut self, interleave: u32) -> Result<u32> {
        let geometry = self.geometry();
        let oldest = self.oldest_table_copy()?;
        let rows = geometry.chips / interleave;
        let reserved = geometry.blocks_per_chip - oldest.block;
        Ok((geometry.blocks_per_chip * rows).saturating_sub(reserved))
    }

    /// First good super-block at or after `block` in the given bank, below `max`
    fn next_good_in_bank(
        &mut self,
        banks: &BankMap,
        bank: u32,
        mut block: u32,
        max: u32,
    ) -> Option<u32> {
        while block < max {
            let (chip, chip_block) = banks.translate(bank, block)?;
            if self.is_good(chip, chip_block) {
                return Some(block);
            }
            debug!("Allocation skips bad chip {chip} block {chip_block}");
            block += 1;
        }
        None
    }

    /// Walk forward from `start` until `needed` rows of good blocks are found across `columns`
    /// banks, or the device runs out.
    ///
    /// If one column runs out part-way through a row, the columns before it give back the block
    /// they accepted in that row, so every column ends with the same number of good blocks.
    pub(crate) fn physical_end(
        &mut self,
        start: u32,
        needed: u32,
        columns: u32,
        interleave: u32,
    ) -> Result<ColumnScan> {
        let banks = BankMap::new(&self.geometry(), interleave);
        let max = self.max_super_block(interleave)?;

        let columns = columns as usize;
        let mut cursors = vec![start; columns];
        let mut previous = vec![None; columns];
        let mut found = 0;
        let mut row = 0;

        'scan: while found < needed {
            for column in 0..columns {
                // The first row takes the start block itself
                let candidate = match row {
                    0 => Some(cursors[column]),
                    _ => cursors[column].checked_add(1).filter(|&x| x < max),
                };
                let next =
                    candidate.and_then(|x| self.next_good_in_bank(&banks, column as u32, x, max));
                let Some(next) = next else {
                    debug!("Column {column} exhausted after {found} rows");
                    for k in 0..column {
                        if let Some(last) = previous[k] {
                            cursors[k] = last;
                        }
                    }
                    if column > 0 {
                        found -= 1;
                    }
                    break 'scan;
                };

                previous[column] = Some(cursors[column]);
                cursors[column] = next;
                if column == 0 {
                    found += 1;
                }
            }
            row += 1;
        }

        Ok(ColumnScan { found, cursors })
    }

    /// Minimum physical blocks a full-FTL partition needs for its own metadata
    fn ftl_full_minimum(&self, interleave: u32) -> u32 {
        let config = self.config();
        let chips = self.geometry().chips;
        let rows = |blocks: u32| blocks.div_ceil(interleave) * chips * interleave;
        rows(config.ftl_full_tat_blocks)
            + rows(config.ftl_full_tt_blocks)
            + 2
            + config.ftl_full_tracked_lbas
    }

    /// Add a partition to the in-memory region table.
    ///
    /// Nothing is written to flash; the table is persisted by [Self::finish_partitioning]. On
    /// error, the table and the allocation cursors are left untouched.
    pub fn allocate(&mut self, request: &AllocateRequest) -> Result<AllocateReply> {
        let site = Site::AllocatePartition;
        let geometry = self.geometry();
        let config = self.config();
        let log2_ppb = self.state.log2_pages_per_block();
        let bad = |reason| Error::BadParameter { site, reason };

        if self.state.table.find(request.partition_id).is_some() {
            return Err(bad("partition id already allocated"));
        }
        if !request.interleave.is_power_of_two() {
            return Err(bad("interleave factor must be a power of two"));
        }

        // Settle the device-wide and per-partition interleave factors
        let current = self.state.table.interleave;
        let mut factor = request.interleave;
        if factor != current && current > 1 && factor > 1 {
            return Err(Error::MultiInterleave {
                site,
                current,
                requested: factor,
            });
        }
        if factor > geometry.chips || factor > config.max_interleave {
            factor = config.max_interleave_for(geometry.chips);
        }
        let interleave = current.max(factor);
        let log2_il = log2(interleave);
        let part_il = match request.interleave_enabled {
            true => factor,
            false => 1,
        };

        let percent_reserved = match request.policy {
            MgmtPolicy::FtlFull if request.percent_reserved == 0 => {
                return Err(bad("full-FTL partitions must reserve blocks"));
            }
            MgmtPolicy::FtlFull => request.percent_reserved.min(config.max_percent_reserved),
            _ => request.percent_reserved,
        };

        let mut table = self.state.table.clone();
        table.interleave = interleave;
        let start_logical = self.state.logical_cursor;
        let mut physical_cursor = self.state.physical_cursor;

        let start_physical = match request.placement {
            Placement::Relative => {
                if physical_cursor == 0 || start_logical > physical_cursor << log2_il {
                    physical_cursor = start_logical.div_ceil(interleave);
                }
                physical_cursor
            }
            Placement::Absolute { start_sector } => {
                let shift = log2_ppb + log2_il;
                if start_sector & ((1 << shift) - 1) != 0 {
                    return Err(Error::InvalidAddress {
                        site,
                        address: start_sector,
                    });
                }
                let start = start_sector >> shift;
                let overlap = Error::Overlap {
                    site,
                    partition_id: request.partition_id,
                };

                // The previous partition now ends where this one starts
                if let Some(prev) = table.entries.last_mut() {
                    prev.total_physical_blocks = start
                        .checked_sub(prev.start_physical_block)
                        .ok_or(overlap)?;
                }
                if !table.is_clear(start_logical, start_logical + 1, start, start + 1) {
                    return Err(Error::Overlap {
                        site,
                        partition_id: request.partition_id,
                    });
                }
                physical_cursor = physical_cursor.max(start);
                start
            }
        };

        let (super_blocks, physical_blocks, unbounded) = match request.size {
            PartitionSize::Remainder => {
                // Bad blocks found since the anchor was cached may have moved it
                self.state.anchor = None;
                let total = self.tail_extent(start_physical, interleave)?;
                (total, total, true)
            }
            PartitionSize::Fixed { sectors: 0 } => return Err(bad("empty partition")),
            PartitionSize::Fixed { sectors } => {
                let blocks = sectors.div_ceil(geometry.pages_per_block);
                let super_blocks = blocks.div_ceil(part_il);

                let mut needed = super_blocks;
                if request.placement == Placement::Relative || request.policy == MgmtPolicy::FtlFull
                {
                    needed += config.replacement_blocks(super_blocks, percent_reserved);
                }

                let scan = self.physical_end(start_physical, needed, part_il, interleave)?;
                if scan.found < needed {
                    return Err(Error::InsufficientSpace {
                        site,
                        needed,
                        available: scan.found,
                    });
                }
                let end = scan.cursors.iter().copied().max().unwrap_or(start_physical);
                physical_cursor = physical_cursor.max(end + 1);
                (super_blocks, end + 1 - start_physical, false)
            }
        };

        if !table.is_clear(
            start_logical,
            start_logical + super_blocks,
            start_physical,
            start_physical + physical_blocks,
        ) {
            return Err(Error::Overlap {
                site,
                partition_id: request.partition_id,
            });
        }

        if request.policy == MgmtPolicy::FtlFull {
            let minimum = self.ftl_full_minimum(interleave);
            if physical_blocks <= minimum {
                return Err(Error::InsufficientSpace {
                    site,
                    needed: minimum + 1,
                    available: physical_blocks,
                });
            }
        }

        let entry = RegionEntry {
            partition_id: request.partition_id,
            start_logical_block: start_logical,
            total_logical_blocks: match request.policy {
                MgmtPolicy::FtlFull => 0,
                _ => super_blocks,
            },
            percent_reserved: match request.policy {
                MgmtPolicy::FtlFull => percent_reserved,
                _ => 0,
            },
            start_physical_block: start_physical,
            total_physical_blocks: physical_blocks,
            interleave: part_il,
            policy: request.policy,
            unbounded,
            sequenced_read: request.sequenced_read,
        };
        table.entries.push(entry);

        // Commit
        if interleave > current {
            info!("Device interleave raised from {current} to {interleave}");
        }
        self.state.table = table;
        self.state.physical_cursor = physical_cursor;
        if !unbounded {
            self.state.logical_cursor += super_blocks;
        }

        let shift = log2_ppb + log2(part_il);
        let reply = AllocateReply {
            start_logical_sector: start_logical << shift,
            start_physical_sector: start_physical << shift,
            logical_sectors: super_blocks << shift,
            physical_sectors: physical_blocks << shift,
        };
        info!(
            "Partition {}: logical blocks [{start_logical}, +{super_blocks}), physical blocks \
             [{start_physical}, +{physical_blocks}), interleave {part_il}{}",
            request.partition_id,
            if unbounded { ", unbounded" } else { "" }
        );
        Ok(reply)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::BlockDevConfig;
    use crate::device::test_util::sim;
    use crate::device::DeviceState;
    use crate::nand::{NandLayout, SimNand, TEST_LAYOUT};

    const PPB: u32 = TEST_LAYOUT.pages_per_block;

    fn fixed(partition_id: u32, blocks: u32) -> AllocateRequest {
        AllocateRequest::relative(partition_id, PartitionSize::Fixed { sectors: blocks * PPB })
    }

    #[test]
    fn test_relative_allocation() -> anyhow::Result<()> {
        let (mut nand, mut state) = sim();
        let mut dev = Device::new(&mut nand, &mut state);

        let mut request = fixed(2, 10);
        request.percent_reserved = 10;
        let reply = dev.allocate(&request)?;

        // 10 blocks, plus 1 for 10% and 4 for the floor
        assert_eq!(reply.start_logical_sector, 0);
        assert_eq!(reply.start_physical_sector, 0);
        assert_eq!(reply.logical_sectors, 10 * PPB);
        assert_eq!(reply.physical_sectors, 15 * PPB);

        let reply = dev.allocate(&fixed(3, 4))?;
        assert_eq!(reply.start_logical_sector, 10 * PPB);
        assert_eq!(reply.start_physical_sector, 15 * PPB);
        assert_eq!(reply.physical_sectors, 8 * PPB);

        let table = &dev.state.table;
        assert_eq!(table.entries.len(), 2);
        assert_eq!(table.entries[1].start_logical_block, 10);
        assert_eq!(table.entries[1].total_physical_blocks, 8);
        assert_eq!(dev.state.physical_cursor, 23);
        assert_eq!(dev.state.logical_cursor, 14);
        Ok(())
    }

    #[test]
    fn test_bad_blocks_extend_partition() -> anyhow::Result<()> {
        let (mut nand, mut state) = sim();
        nand.set_factory_bad(0, 2)?;
        state.fake_bad.insert((0, 5));

        let mut dev = Device::new(&mut nand, &mut state);
        let reply = dev.allocate(&fixed(1, 4))?;
        assert_eq!(reply.physical_sectors, 10 * PPB);
        Ok(())
    }

    #[test]
    fn test_partial_sectors_round_up() -> anyhow::Result<()> {
        let (mut nand, mut state) = sim();
        let mut dev = Device::new(&mut nand, &mut state);
        let reply = dev.allocate(&AllocateRequest::relative(
            1,
            PartitionSize::Fixed { sectors: PPB + 1 },
        ))?;
        assert_eq!(reply.logical_sectors, 2 * PPB);
        Ok(())
    }

    #[test]
    fn test_insufficient_space() -> anyhow::Result<()> {
        let (mut nand, mut state) = sim();
        let mut dev = Device::new(&mut nand, &mut state);
        dev.allocate(&fixed(1, 100))?;

        // 124 usable super-blocks below the table copies; 104 are taken
        let err = dev.allocate(&fixed(2, 20)).unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientSpace {
                needed: 24,
                available: 20,
                ..
            }
        ));
        assert_eq!(dev.state.table.entries.len(), 1);
        assert_eq!(dev.state.logical_cursor, 100);
        assert_eq!(dev.state.physical_cursor, 104);
        Ok(())
    }

    #[test]
    fn test_fixed_partitions_stop_below_table_copies() -> anyhow::Result<()> {
        let (mut nand, mut state) = sim();
        let mut dev = Device::new(&mut nand, &mut state);

        // 121 + 4 replacement blocks would reach chip 1 block 60, the oldest copy
        let err = dev.allocate(&fixed(1, 121)).unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientSpace {
                needed: 125,
                available: 124,
                ..
            }
        ));
        let reply = dev.allocate(&fixed(1, 120))?;
        assert_eq!(reply.physical_sectors, 124 * PPB);

        // A bad block among the copies pushes the oldest one further down
        dev.start_partitioning();
        dev.state.fake_bad.insert((1, 61));
        assert!(matches!(
            dev.allocate(&fixed(1, 120)),
            Err(Error::InsufficientSpace { available: 123, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_empty_partition_refused() -> anyhow::Result<()> {
        let (mut nand, mut state) = sim();
        let mut dev = Device::new(&mut nand, &mut state);

        let mut request = AllocateRequest::relative(1, PartitionSize::Fixed { sectors: 0 });
        request.placement = Placement::Absolute {
            start_sector: 20 * PPB,
        };
        let err = dev.allocate(&request).unwrap_err();
        assert!(matches!(err, Error::BadParameter { .. }));

        request.placement = Placement::Relative;
        assert!(matches!(
            dev.allocate(&request),
            Err(Error::BadParameter { .. })
        ));
        assert!(dev.state.table.entries.is_empty());
        Ok(())
    }

    #[test]
    fn test_absolute_allocation() -> anyhow::Result<()> {
        let (mut nand, mut state) = sim();
        let mut dev = Device::new(&mut nand, &mut state);

        let mut boot = fixed(1, 2);
        boot.placement = Placement::Absolute { start_sector: 0 };
        let reply = dev.allocate(&boot)?;
        assert_eq!(reply.physical_sectors, 2 * PPB);

        // Misaligned starts are refused
        let mut next = fixed(2, 4);
        next.placement = Placement::Absolute {
            start_sector: 8 * PPB + 1,
        };
        assert!(matches!(
            dev.allocate(&next),
            Err(Error::InvalidAddress { .. })
        ));

        // The previous partition is stretched up to the new start
        next.placement = Placement::Absolute {
            start_sector: 8 * PPB,
        };
        let reply = dev.allocate(&next)?;
        assert_eq!(reply.start_physical_sector, 8 * PPB);
        assert_eq!(dev.state.table.entries[0].total_physical_blocks, 8);
        assert_eq!(dev.state.table.entries[1].start_logical_block, 2);
        Ok(())
    }

    #[test]
    fn test_absolute_overlap() -> anyhow::Result<()> {
        let (mut nand, mut state) = sim();
        let mut dev = Device::new(&mut nand, &mut state);
        dev.allocate(&fixed(1, 10))?;
        dev.allocate(&fixed(2, 4))?;

        // Starts inside partition 1, before the partition it would follow
        let mut request = fixed(3, 2);
        request.placement = Placement::Absolute {
            start_sector: 4 * PPB,
        };
        let err = dev.allocate(&request).unwrap_err();
        assert!(matches!(err, Error::Overlap { partition_id: 3, .. }));

        // Nothing was committed, including the back-fill
        assert_eq!(dev.state.table.entries.len(), 2);
        assert_eq!(dev.state.table.entries[1].total_physical_blocks, 8);
        assert_eq!(dev.state.physical_cursor, 22);
        Ok(())
    }

    #[test]
    fn test_duplicate_partition_id() -> anyhow::Result<()> {
        let (mut nand, mut state) = sim();
        let mut dev = Device::new(&mut nand, &mut state);
        dev.allocate(&fixed(1, 2))?;
        assert!(matches!(
            dev.allocate(&fixed(1, 2)),
            Err(Error::BadParameter { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_unbounded_allocation() -> anyhow::Result<()> {
        let (mut nand, mut state) = sim();
        let mut dev = Device::new(&mut nand, &mut state);
        dev.allocate(&fixed(1, 10))?;

        let reply = dev.allocate(&AllocateRequest::relative(2, PartitionSize::Remainder))?;
        // Global blocks 124..=127 hold the table copies
        assert_eq!(reply.start_physical_sector, 14 * PPB);
        assert_eq!(reply.physical_sectors, (124 - 14) * PPB);
        assert_eq!(reply.logical_sectors, reply.physical_sectors);

        let entry = dev.state.table.entries[1];
        assert!(entry.unbounded);
        assert_eq!(entry.total_physical_blocks, 110);
        assert_eq!(dev.state.logical_cursor, 10);
        Ok(())
    }

    #[test]
    fn test_ftl_full() -> anyhow::Result<()> {
        let (mut nand, mut state) = sim();
        let mut dev = Device::new(&mut nand, &mut state);

        let mut request = fixed(1, 40);
        request.policy = MgmtPolicy::FtlFull;
        assert!(matches!(
            dev.allocate(&request),
            Err(Error::BadParameter { .. })
        ));

        request.percent_reserved = 80;
        dev.allocate(&request)?;
        let entry = dev.state.table.entries[0];
        assert_eq!(entry.percent_reserved, 50);
        assert_eq!(entry.total_logical_blocks, 0);
        // 40 + 20 reserved + 4 floor
        assert_eq!(entry.total_physical_blocks, 64);

        // Minimum is 8 TAT + 8 TT + 2 + 8 tracked on two chips
        let mut small = fixed(2, 2);
        small.policy = MgmtPolicy::FtlFull;
        small.percent_reserved = 10;
        assert!(matches!(
            dev.allocate(&small),
            Err(Error::InsufficientSpace { needed: 27, .. })
        ));
        assert_eq!(dev.state.table.entries.len(), 1);
        Ok(())
    }

    fn four_chips() -> (SimNand, DeviceState) {
        let layout = NandLayout {
            chips: 4,
            ..TEST_LAYOUT
        };
        let nand = SimNand::new(layout);
        let state = DeviceState::new(BlockDevConfig::default(), nand.geometry()).unwrap();
        (nand, state)
    }

    #[test]
    fn test_multi_interleave() -> anyhow::Result<()> {
        let (mut nand, mut state) = four_chips();
        let mut dev = Device::new(&mut nand, &mut state);

        let mut request = fixed(1, 8);
        request.interleave = 2;
        request.interleave_enabled = true;
        let reply = dev.allocate(&request)?;
        assert_eq!(dev.state.interleave(), 2);
        assert_eq!(dev.state.table.entries[0].interleave, 2);
        // 4 super-blocks of 2 columns, 32 sectors each
        assert_eq!(reply.logical_sectors, 8 * PPB);

        request.partition_id = 2;
        request.interleave = 4;
        assert!(matches!(
            dev.allocate(&request),
            Err(Error::MultiInterleave {
                current: 2,
                requested: 4,
                ..
            })
        ));

        // A non-interleaved partition is still allowed
        let reply = dev.allocate(&fixed(3, 2))?;
        assert_eq!(dev.state.table.entries[1].interleave, 1);
        assert_eq!(reply.logical_sectors, 2 * PPB);
        Ok(())
    }

    #[test]
    fn test_interleave_capped_to_chips() -> anyhow::Result<()> {
        let (mut nand, mut state) = sim();
        let mut dev = Device::new(&mut nand, &mut state);

        let mut request = fixed(1, 4);
        request.interleave = 8;
        request.interleave_enabled = true;
        dev.allocate(&request)?;
        assert_eq!(dev.state.interleave(), 2);
        assert_eq!(dev.state.table.entries[0].interleave, 2);
        Ok(())
    }

    #[test]
    fn test_interleaved_rollback() -> anyhow::Result<()> {
        let (mut nand, mut state) = four_chips();
        // Column 2 loses one block part-way up
        nand.set_factory_bad(2, 10)?;

        let mut dev = Device::new(&mut nand, &mut state);
        // Table copies take chip 3 blocks 60..=63, leaving super-blocks 0..60 in each column
        let scan = dev.physical_end(0, 100, 4, 4)?;
        assert_eq!(scan.found, 59);
        assert_eq!(scan.cursors, vec![58, 58, 59, 58]);

        // A request that fits does not need the rollback
        let scan = dev.physical_end(0, 20, 4, 4)?;
        assert_eq!(scan.found, 20);
        assert_eq!(scan.cursors, vec![19, 19, 20, 19]);
        Ok(())
    }

    #[test]
    fn test_scenario_layout() -> anyhow::Result<()> {
        let layout = NandLayout {
            chips: 2,
            blocks_per_chip: 1024,
            pages_per_block: 64,
            bytes_per_page: 2048,
        };
        let mut nand = SimNand::new(layout);
        let mut state = DeviceState::new(BlockDevConfig::default(), nand.geometry())?;
        let mut dev = Device::new(&mut nand, &mut state);

        let mut a = AllocateRequest::relative(
            1,
            PartitionSize::Fixed {
                sectors: 100 * layout.pages_per_block,
            },
        );
        a.percent_reserved = 10;
        let reply = dev.allocate(&a)?;
        assert!(reply.physical_sectors >= 114 * layout.pages_per_block);

        let reply = dev.allocate(&AllocateRequest::relative(2, PartitionSize::Remainder))?;
        assert_eq!(reply.start_physical_sector, 114 * layout.pages_per_block);
        assert_eq!(reply.physical_sectors, (2044 - 114) * layout.pages_per_block);
        Ok(())
    }
}
