//! Tunables and on-flash constants.

/// First word of every region-table copy
pub const REGION_TABLE_START_MAGIC: u32 = 0xFEED_BABE;

/// Last word of every region-table copy
pub const REGION_TABLE_END_MAGIC: u32 = 0xBABE_EFED;

/// Page numbers, tags and block counts use all-ones for "none"
pub const ILLEGAL_ADDRESS: u32 = 0xFFFF_FFFF;

/// Spare-area byte that reads `0xFF` on a block that has not gone bad at run time
pub const RUNTIME_BAD_OFFSET: usize = 1;

/// Knobs that shape allocation, persistence and locking.
///
/// The defaults match the layout written by existing boot ROM tooling; changing
/// `redundant_copies` or `first_physical_block` on a device that already carries a region table
/// makes that table unreadable.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BlockDevConfig {
    /// How many copies of the region table are kept at the tail of the last chip
    pub redundant_copies: u32,

    /// Replacement blocks added to every fixed-size allocation regardless of percentage
    pub min_reserved_blocks: u32,

    /// Upper bound applied to a full-FTL partition's percent-reserved request
    pub max_percent_reserved: u32,

    /// Capacity of the lock-aperture table
    pub lock_apertures: usize,

    /// Largest interleave factor ever configured
    pub max_interleave: u32,

    /// Largest chip count a device may report
    pub max_chips: u32,

    /// Blocks the full FTL keeps for its translation-allocation table
    pub ftl_full_tat_blocks: u32,

    /// Blocks the full FTL keeps for its translation table
    pub ftl_full_tt_blocks: u32,

    /// Logical blocks the full FTL tracks in its write cache
    pub ftl_full_tracked_lbas: u32,

    /// First block the logical scanner looks at; block 0 carries the boot configuration table
    pub first_physical_block: u32,
}

impl Default for BlockDevConfig {
    fn default() -> Self {
        Self {
            redundant_copies: 4,
            min_reserved_blocks: 4,
            max_percent_reserved: 50,
            lock_apertures: 8,
            max_interleave: 4,
            max_chips: 8,
            ftl_full_tat_blocks: 4,
            ftl_full_tt_blocks: 4,
            ftl_full_tracked_lbas: 8,
            first_physical_block: 1,
        }
    }
}

impl BlockDevConfig {
    /// Largest power-of-two interleave factor that evenly divides `chips`
    pub fn max_interleave_for(&self, chips: u32) -> u32 {
        let mut interleave = 1;
        while chips % (interleave << 1) == 0 && (interleave << 1) <= self.max_interleave {
            interleave <<= 1;
        }
        interleave
    }

    /// Replacement blocks to add on top of `blocks` logical blocks
    pub fn replacement_blocks(&self, blocks: u32, percent_reserved: u32) -> u32 {
        let reserved = (u64::from(blocks) * u64::from(percent_reserved)).div_ceil(100);
        reserved as u32 + self.min_reserved_blocks
    }
}

/// `log2` of a power of two
pub(crate) fn log2(value: u32) -> u32 {
    debug_assert!(value.is_power_of_two());
    value.trailing_zeros()
}

#[test]
fn test_max_interleave_for() {
    let config = BlockDevConfig::default();
    assert_eq!(config.max_interleave_for(1), 1);
    assert_eq!(config.max_interleave_for(2), 2);
    assert_eq!(config.max_interleave_for(3), 1);
    assert_eq!(config.max_interleave_for(4), 4);
    assert_eq!(config.max_interleave_for(8), 4);
    assert_eq!(config.max_interleave_for(6), 2);
}

#[test]
fn test_replacement_blocks() {
    let config = BlockDevConfig::default();
    assert_eq!(config.replacement_blocks(100, 10), 14);
    assert_eq!(config.replacement_blocks(101, 10), 15);
    assert_eq!(config.replacement_blocks(1, 0), 4);
}
