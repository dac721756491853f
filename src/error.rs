//! The error type returned by every block-layer operation.
//!
//! Collaborators below and above this layer (the device driver and the translation layer) speak
//! `anyhow`; everything they return is wrapped into [Error::Driver] together with the [Site] that
//! issued the call, so callers only ever match on a small, stable set of variants.

use std::fmt;

use thiserror::Error;

/// The operation in which an error was raised
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Site {
    Open,
    Close,
    GetInfo,
    ReadSector,
    WriteSector,
    Flush,
    Power,
    BlockStatus,
    MarkBad,
    TailAnchor,
    EncodeRegionTable,
    DecodeRegionTable,
    SaveRegionTable,
    LoadRegionTable,
    VerifyRegionTable,
    UnboundedExtent,
    AllocatePartition,
    PartitionOperation,
    ReadPhysical,
    WritePhysical,
    ErasePhysical,
    LogicalToPhysical,
    LockRegion,
    CommitLocks,
    FormatDevice,
    ErasePartition,
    EraseLogicalSectors,
    PartitionPhysicalSectors,
    QueryBlockStatus,
    RegionIoctl,
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::Close => "close",
            Self::GetInfo => "get-info",
            Self::ReadSector => "read-sector",
            Self::WriteSector => "write-sector",
            Self::Flush => "flush",
            Self::Power => "power",
            Self::BlockStatus => "block-status",
            Self::MarkBad => "mark-bad",
            Self::TailAnchor => "tail-anchor",
            Self::EncodeRegionTable => "encode-region-table",
            Self::DecodeRegionTable => "decode-region-table",
            Self::SaveRegionTable => "save-region-table",
            Self::LoadRegionTable => "load-region-table",
            Self::VerifyRegionTable => "verify-region-table",
            Self::UnboundedExtent => "unbounded-extent",
            Self::AllocatePartition => "allocate-partition",
            Self::PartitionOperation => "partition-operation",
            Self::ReadPhysical => "read-physical",
            Self::WritePhysical => "write-physical",
            Self::ErasePhysical => "erase-physical",
            Self::LogicalToPhysical => "logical-to-physical",
            Self::LockRegion => "lock-region",
            Self::CommitLocks => "commit-locks",
            Self::FormatDevice => "format-device",
            Self::ErasePartition => "erase-partition",
            Self::EraseLogicalSectors => "erase-logical-sectors",
            Self::PartitionPhysicalSectors => "partition-physical-sectors",
            Self::QueryBlockStatus => "query-block-status",
            Self::RegionIoctl => "region-ioctl",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("{site}: chip {chip} block {block} is bad")]
    BadBlock { site: Site, chip: u32, block: u32 },

    #[error("{site}: ran out of good blocks")]
    BadBlocksExhausted { site: Site },

    #[error("{site}: short transfer on chip {chip} block {block}: {actual} of {requested} sectors")]
    ShortTransfer {
        site: Site,
        chip: u32,
        block: u32,
        requested: u32,
        actual: u32,
    },

    #[error("{site}: corrupt region table")]
    TableCorrupt { site: Site },

    #[error("{site}: region table of {bytes} bytes does not fit a {sector_size}-byte sector")]
    TableTooLarge {
        site: Site,
        bytes: usize,
        sector_size: usize,
    },

    #[error("{site}: partition {partition_id} overlaps an existing partition")]
    Overlap { site: Site, partition_id: u32 },

    #[error("{site}: insufficient space: need {needed} blocks, found {available}")]
    InsufficientSpace {
        site: Site,
        needed: u32,
        available: u32,
    },

    #[error("{site}: illegal call: {reason}")]
    IllegalCall { site: Site, reason: &'static str },

    #[error("{site}: invalid address {address:#x}")]
    InvalidAddress { site: Site, address: u32 },

    #[error("{site}: flash is already locked")]
    AlreadyLocked { site: Site },

    #[error("{site}: all {capacity} lock apertures are in use")]
    ApertureFull { site: Site, capacity: usize },

    #[error("{site}: interleave factor {requested} conflicts with device interleave {current}")]
    MultiInterleave {
        site: Site,
        current: u32,
        requested: u32,
    },

    #[error("{site}: bad parameter: {reason}")]
    BadParameter { site: Site, reason: &'static str },

    #[error("{site}: logical block {logical_block} was never written")]
    TagSearchFailure { site: Site, logical_block: u32 },

    #[error("{site}: no partition with id {partition_id}")]
    PartitionNotFound { site: Site, partition_id: u32 },

    #[error("{site}: not supported on this partition")]
    NotSupported { site: Site },

    #[error("{site}: {source:#}")]
    Driver {
        site: Site,
        #[source]
        source: anyhow::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// The coarse classes of failure that upper layers decide on
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    BadBlock,
    ShortTransfer,
    TableCorrupt,
    Overlap,
    InsufficientSpace,
    IllegalCall,
    InvalidArgument,
    ResourceExhausted,
    Hardware,
}

impl ErrorKind {
    /// Was this caused by how the layer was called, rather than by the flash?
    pub fn is_usage(self) -> bool {
        matches!(self, Self::IllegalCall | Self::InvalidArgument)
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BadBlock { .. } | Error::BadBlocksExhausted { .. } => ErrorKind::BadBlock,
            Error::ShortTransfer { .. } => ErrorKind::ShortTransfer,
            Error::TableCorrupt { .. } | Error::TableTooLarge { .. } => ErrorKind::TableCorrupt,
            Error::Overlap { .. } => ErrorKind::Overlap,
            Error::InsufficientSpace { .. } => ErrorKind::InsufficientSpace,
            Error::IllegalCall { .. } | Error::NotSupported { .. } => ErrorKind::IllegalCall,
            Error::InvalidAddress { .. }
            | Error::MultiInterleave { .. }
            | Error::BadParameter { .. }
            | Error::TagSearchFailure { .. }
            | Error::PartitionNotFound { .. } => ErrorKind::InvalidArgument,
            Error::AlreadyLocked { .. } | Error::ApertureFull { .. } => {
                ErrorKind::ResourceExhausted
            }
            Error::Driver { .. } => ErrorKind::Hardware,
        }
    }

    pub fn site(&self) -> Site {
        match self {
            Error::BadBlock { site, .. }
            | Error::BadBlocksExhausted { site }
            | Error::ShortTransfer { site, .. }
            | Error::TableCorrupt { site }
            | Error::TableTooLarge { site, .. }
            | Error::Overlap { site, .. }
            | Error::InsufficientSpace { site, .. }
            | Error::IllegalCall { site, .. }
            | Error::InvalidAddress { site, .. }
            | Error::AlreadyLocked { site }
            | Error::ApertureFull { site, .. }
            | Error::MultiInterleave { site, .. }
            | Error::BadParameter { site, .. }
            | Error::TagSearchFailure { site, .. }
            | Error::PartitionNotFound { site, .. }
            | Error::NotSupported { site }
            | Error::Driver { site, .. } => *site,
        }
    }
}

/// Attach a [Site] to results coming back from a collaborator
pub(crate) trait DriverContext<T> {
    fn at(self, site: Site) -> Result<T>;
}

impl<T> DriverContext<T> for anyhow::Result<T> {
    fn at(self, site: Site) -> Result<T> {
        self.map_err(|source| Error::Driver { site, source })
    }
}

#[test]
fn test_error_kinds() {
    let short = Error::ShortTransfer {
        site: Site::WritePhysical,
        chip: 0,
        block: 3,
        requested: 4,
        actual: 3,
    };
    assert_eq!(short.kind(), ErrorKind::ShortTransfer);
    assert_eq!(short.site(), Site::WritePhysical);
    assert!(!short.kind().is_usage());

    let illegal = Error::IllegalCall {
        site: Site::AllocatePartition,
        reason: "managed partition handle",
    };
    assert!(illegal.kind().is_usage());
    assert_eq!(
        illegal.to_string(),
        "allocate-partition: illegal call: managed partition handle"
    );

    let driver: anyhow::Result<()> = Err(anyhow::anyhow!("erase timeout"));
    let err = driver.at(Site::ErasePhysical).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Hardware);
    assert_eq!(err.to_string(), "erase-physical: erase timeout");
}
