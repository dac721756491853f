//! A block-device layer for raw NAND flash arrays.
//!
//! The flash is carved into partitions described by a region table, which is kept in redundant
//! copies at the tail of the last chip. Partition 0 is the whole device, addressed by physical
//! sector or by the logical tags programmed into each block's spare area; every other partition
//! is handed to a translation layer through the [ftl] seam.
//!
//! [BlockDevManager] is the entry point: attach a [nand::NandDriver], open partitions, and issue
//! reads, writes and [Ioctl]s against the returned [Partition] handles.

pub mod blockdev;
pub mod config;
pub mod device;
pub mod error;
pub mod ftl;
pub mod lock;
pub mod nand;
pub mod oracle;
pub mod raw;
pub mod region;

pub use blockdev::{BlockDevManager, Ioctl, IoctlReply, Partition};
pub use config::BlockDevConfig;
pub use error::{Error, ErrorKind, Result, Site};
pub use ftl::{DeviceInfo, DirectLayer, Region, TranslationLayer};
pub use oracle::BlockStatus;
pub use raw::{EraseType, FormatReport};
pub use region::alloc::{AllocateReply, AllocateRequest, PartitionSize, Placement};
pub use region::{MgmtPolicy, RegionEntry, RegionTable};
