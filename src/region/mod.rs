//! The region table: the list of partitions carved out of the flash array

pub mod alloc;
pub mod codec;
pub mod store;

/// How a partition's blocks are managed by the layer above
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum MgmtPolicy {
    /// Translation layer with lightweight bad-block replacement
    #[default]
    FtlLite,

    /// Full translation layer with wear levelling and its own metadata blocks
    FtlFull,

    /// Managed entirely outside this driver stack
    External,
}

impl From<MgmtPolicy> for u32 {
    fn from(value: MgmtPolicy) -> Self {
        match value {
            MgmtPolicy::FtlLite => 1,
            MgmtPolicy::FtlFull => 2,
            MgmtPolicy::External => 3,
        }
    }
}

impl TryFrom<u32> for MgmtPolicy {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::FtlLite),
            2 => Ok(Self::FtlFull),
            3 => Ok(Self::External),
            _ => Err(()),
        }
    }
}

/// One partition in the region table.
///
/// Logical and physical block numbers count super-blocks of the device-wide interleave factor.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct RegionEntry {
    /// Caller-chosen identifier, used to open the partition
    pub partition_id: u32,

    pub start_logical_block: u32,

    /// Logical super-blocks, or 0 for [MgmtPolicy::FtlFull] partitions (which size themselves
    /// from their physical extent)
    pub total_logical_blocks: u32,

    /// Replacement headroom requested by an [MgmtPolicy::FtlFull] partition
    pub percent_reserved: u32,

    pub start_physical_block: u32,

    /// Recomputed from the live bad-block population for unbounded entries
    pub total_physical_blocks: u32,

    /// Banks (chips) used in parallel by this partition
    pub interleave: u32,

    pub policy: MgmtPolicy,

    /// Extends to the end of the device
    pub unbounded: bool,

    /// Read by the boot ROM, which only reads blocks in ascending order
    pub sequenced_read: bool,
}

impl RegionEntry {
    pub fn logical_end(&self) -> u32 {
        self.start_logical_block + self.total_logical_blocks
    }

    pub fn physical_end(&self) -> u32 {
        self.start_physical_block + self.total_physical_blocks
    }

    /// Does this entry leave both the logical range `[logical_start, logical_end)` and the physical
    /// range `[physical_start, physical_end)` clear?
    pub fn is_clear_of(
        &self,
        logical_start: u32,
        logical_end: u32,
        physical_start: u32,
        physical_end: u32,
    ) -> bool {
        let logical_clear =
            logical_end <= self.start_logical_block || logical_start >= self.logical_end();
        let physical_clear =
            physical_end <= self.start_physical_block || physical_start >= self.physical_end();
        logical_clear && physical_clear
    }
}

/// An ordered set of partitions, plus the device interleave factor it was built for
#[derive(Debug, Default, Eq, PartialEq, Clone)]
pub struct RegionTable {
    pub entries: Vec<RegionEntry>,
    pub interleave: u32,
}

impl RegionTable {
    pub fn find(&self, partition_id: u32) -> Option<&RegionEntry> {
        self.entries.iter().find(|x| x.partition_id == partition_id)
    }

    pub fn find_mut(&mut self, partition_id: u32) -> Option<&mut RegionEntry> {
        self.entries
            .iter_mut()
            .find(|x| x.partition_id == partition_id)
    }

    /// Is the proposed extent clear of every entry on both axes?
    pub fn is_clear(
        &self,
        logical_start: u32,
        logical_end: u32,
        physical_start: u32,
        physical_end: u32,
    ) -> bool {
        self.entries
            .iter()
            .all(|x| x.is_clear_of(logical_start, logical_end, physical_start, physical_end))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(logical: (u32, u32), physical: (u32, u32)) -> RegionEntry {
        RegionEntry {
            start_logical_block: logical.0,
            total_logical_blocks: logical.1,
            start_physical_block: physical.0,
            total_physical_blocks: physical.1,
            interleave: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_policy_codes() {
        for policy in [MgmtPolicy::FtlLite, MgmtPolicy::FtlFull, MgmtPolicy::External] {
            assert_eq!(MgmtPolicy::try_from(u32::from(policy)), Ok(policy));
        }
        assert!(MgmtPolicy::try_from(0).is_err());
    }

    #[test]
    fn test_overlap_needs_both_axes_clear() {
        let table = RegionTable {
            entries: vec![entry((0, 10), (1, 14))],
            interleave: 1,
        };

        assert!(table.is_clear(10, 20, 15, 30));
        assert!(!table.is_clear(10, 20, 14, 30));
        assert!(!table.is_clear(9, 20, 15, 30));
        assert!(!table.is_clear(0, 1, 1, 2));
        assert!(table.is_clear(0, 0, 1, 1));
    }
}
