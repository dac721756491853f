//! On-flash encoding of the region table.
//!
//! A copy occupies the start of one page:
//!
//! ```text
//! u32 start magic | u32 entry count | u32 interleave | count x record | u32 end magic
//! ```
//!
//! Each record is nine little-endian words. For full-FTL entries the logical block count word
//! carries the percent-reserved value instead, and unbounded entries store an all-ones physical
//! block count which is recomputed after loading.

use deku::prelude::*;

use super::{MgmtPolicy, RegionEntry, RegionTable};
use crate::config::{ILLEGAL_ADDRESS, REGION_TABLE_END_MAGIC, REGION_TABLE_START_MAGIC};
use crate::error::{Error, Site};

pub const HEADER_BYTES: usize = 12;
pub const RECORD_BYTES: usize = 36;
pub const FOOTER_BYTES: usize = 4;

#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct TableHeader {
    magic: u32,
    count: u32,
    interleave: u32,
}

#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct TableRecord {
    start_logical_block: u32,
    total_logical_blocks: u32,
    start_physical_block: u32,
    total_physical_blocks: u32,
    interleave_bank_count: u32,
    mgmt_policy: u32,
    is_unbounded: u32,
    is_sequenced_read_needed: u32,
    partition_id: u32,
}

#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct TableFooter {
    magic: u32,
}

impl From<&RegionEntry> for TableRecord {
    fn from(value: &RegionEntry) -> Self {
        let total_logical_blocks = match value.policy {
            MgmtPolicy::FtlFull => value.percent_reserved,
            _ => value.total_logical_blocks,
        };
        let total_physical_blocks = match value.unbounded {
            true => ILLEGAL_ADDRESS,
            false => value.total_physical_blocks,
        };

        Self {
            start_logical_block: value.start_logical_block,
            total_logical_blocks,
            start_physical_block: value.start_physical_block,
            total_physical_blocks,
            interleave_bank_count: value.interleave,
            mgmt_policy: value.policy.into(),
            is_unbounded: value.unbounded.into(),
            is_sequenced_read_needed: value.sequenced_read.into(),
            partition_id: value.partition_id,
        }
    }
}

impl TryFrom<TableRecord> for RegionEntry {
    type Error = ();

    fn try_from(value: TableRecord) -> std::result::Result<Self, Self::Error> {
        let TableRecord {
            start_logical_block,
            total_logical_blocks,
            start_physical_block,
            total_physical_blocks,
            interleave_bank_count,
            mgmt_policy,
            is_unbounded,
            is_sequenced_read_needed,
            partition_id,
        } = value;

        if !interleave_bank_count.is_power_of_two() {
            return Err(());
        }

        let policy = mgmt_policy.try_into()?;
        let unbounded = is_unbounded != 0;
        let (total_logical_blocks, percent_reserved) = match policy {
            MgmtPolicy::FtlFull => (0, total_logical_blocks),
            _ => (total_logical_blocks, 0),
        };
        let total_physical_blocks = match unbounded {
            true => 0,
            false => total_physical_blocks,
        };

        Ok(Self {
            partition_id,
            start_logical_block,
            total_logical_blocks,
            percent_reserved,
            start_physical_block,
            total_physical_blocks,
            interleave: interleave_bank_count,
            policy,
            unbounded,
            sequenced_read: is_sequenced_read_needed != 0,
        })
    }
}

/// Number of bytes a table with `count` entries encodes to
pub fn encoded_len(count: usize) -> usize {
    HEADER_BYTES + count * RECORD_BYTES + FOOTER_BYTES
}

/// Encode a table, failing if it would not fit in one `sector_size`-byte sector
pub fn encode(table: &RegionTable, sector_size: usize) -> crate::error::Result<Vec<u8>> {
    let bytes = encoded_len(table.entries.len());
    if bytes > sector_size {
        return Err(Error::TableTooLarge {
            site: Site::EncodeRegionTable,
            bytes,
            sector_size,
        });
    }

    let corrupt = |_| Error::TableCorrupt {
        site: Site::EncodeRegionTable,
    };

    let header = TableHeader {
        magic: REGION_TABLE_START_MAGIC,
        count: table.entries.len() as u32,
        interleave: table.interleave,
    };
    let mut out = header.to_bytes().map_err(corrupt)?;
    for entry in &table.entries {
        out.append(&mut TableRecord::from(entry).to_bytes().map_err(corrupt)?);
    }
    let footer = TableFooter {
        magic: REGION_TABLE_END_MAGIC,
    };
    out.append(&mut footer.to_bytes().map_err(corrupt)?);

    Ok(out)
}

/// Decode a table from the start of `buf`, returning it and how many bytes it occupied
pub fn decode(buf: &[u8]) -> crate::error::Result<(RegionTable, usize)> {
    let corrupt = || Error::TableCorrupt {
        site: Site::DecodeRegionTable,
    };

    let (mut rest, header) = TableHeader::from_bytes((buf, 0)).map_err(|_| corrupt())?;
    if header.magic != REGION_TABLE_START_MAGIC || !header.interleave.is_power_of_two() {
        return Err(corrupt());
    }

    // Check the count against the buffer before trusting it
    let count = header.count as usize;
    let len = count
        .checked_mul(RECORD_BYTES)
        .and_then(|x| x.checked_add(HEADER_BYTES + FOOTER_BYTES))
        .ok_or_else(corrupt)?;
    if len > buf.len() {
        return Err(corrupt());
    }

    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let (next, record) = TableRecord::from_bytes(rest).map_err(|_| corrupt())?;
        entries.push(RegionEntry::try_from(record).map_err(|_| corrupt())?);
        rest = next;
    }

    let (_, footer) = TableFooter::from_bytes(rest).map_err(|_| corrupt())?;
    if footer.magic != REGION_TABLE_END_MAGIC {
        return Err(corrupt());
    }

    let table = RegionTable {
        entries,
        interleave: header.interleave,
    };
    Ok((table, len))
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> RegionTable {
        RegionTable {
            entries: vec![
                RegionEntry {
                    partition_id: 2,
                    start_logical_block: 0,
                    total_logical_blocks: 100,
                    start_physical_block: 1,
                    total_physical_blocks: 115,
                    interleave: 1,
                    policy: MgmtPolicy::FtlLite,
                    sequenced_read: true,
                    ..Default::default()
                },
                RegionEntry {
                    partition_id: 3,
                    start_logical_block: 100,
                    percent_reserved: 10,
                    start_physical_block: 116,
                    total_physical_blocks: 200,
                    interleave: 1,
                    policy: MgmtPolicy::FtlFull,
                    ..Default::default()
                },
            ],
            interleave: 1,
        }
    }

    #[test]
    fn test_round_trip() -> anyhow::Result<()> {
        let table = sample();
        let bytes = encode(&table, 2048)?;
        assert_eq!(bytes.len(), encoded_len(2));

        let (decoded, len) = decode(&bytes)?;
        assert_eq!(decoded, table);
        assert_eq!(len, bytes.len());
        Ok(())
    }

    #[test]
    fn test_wire_layout() -> anyhow::Result<()> {
        let bytes = encode(&sample(), 2048)?;
        assert_eq!(&bytes[0..4], &[0xBE, 0xBA, 0xED, 0xFE]);
        assert_eq!(&bytes[4..8], &2u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &1u32.to_le_bytes());

        // Full-FTL record carries percent reserved in the logical block count word
        let second = HEADER_BYTES + RECORD_BYTES;
        assert_eq!(&bytes[second + 4..second + 8], &10u32.to_le_bytes());
        assert_eq!(&bytes[second + 20..second + 24], &2u32.to_le_bytes());
        assert_eq!(&bytes[second + 32..second + 36], &3u32.to_le_bytes());

        assert_eq!(&bytes[bytes.len() - 4..], &[0xED, 0xEF, 0xBE, 0xBA]);
        Ok(())
    }

    #[test]
    fn test_unbounded_extent_not_persisted() -> anyhow::Result<()> {
        let mut table = sample();
        table.entries[1].unbounded = true;

        let bytes = encode(&table, 2048)?;
        let second = HEADER_BYTES + RECORD_BYTES;
        assert_eq!(&bytes[second + 12..second + 16], &[0xFF; 4]);

        let (decoded, _) = decode(&bytes)?;
        assert!(decoded.entries[1].unbounded);
        assert_eq!(decoded.entries[1].total_physical_blocks, 0);
        Ok(())
    }

    #[test]
    fn test_too_large() {
        let mut table = sample();
        table.entries = vec![table.entries[0]; 10];
        let err = encode(&table, 256).unwrap_err();
        assert!(matches!(err, Error::TableTooLarge { bytes: 376, .. }));
        assert!(encode(&table, 512).is_ok());
    }

    #[test]
    fn test_corruption() -> anyhow::Result<()> {
        let bytes = encode(&sample(), 2048)?;

        for index in [0, 3, 4, 8, bytes.len() - 1] {
            let mut bad = bytes.clone();
            bad[index] ^= 0x40;
            assert!(decode(&bad).is_err(), "flip at {index} accepted");
        }

        // Truncated copies and a garbage count must not be trusted
        assert!(decode(&bytes[..bytes.len() - 1]).is_err());
        let mut huge = bytes.clone();
        huge[4..8].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(decode(&huge).is_err());
        assert!(decode(&[0xFF; 2048]).is_err());
        Ok(())
    }

    #[test]
    fn test_trailing_padding_ignored() -> anyhow::Result<()> {
        let mut bytes = encode(&sample(), 2048)?;
        let len = bytes.len();
        bytes.resize(2048, 0);
        let (decoded, used) = decode(&bytes)?;
        assert_eq!(decoded, sample());
        assert_eq!(used, len);
        Ok(())
    }
}
