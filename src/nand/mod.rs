//! Abstractions and code to access raw NAND flash arrays

use std::collections::HashSet;
use std::io::{Read, Write};
use std::str::FromStr;

use anyhow::{bail, ensure};

pub mod bank;
#[cfg(target_os = "linux")]
pub mod mtd;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// The shape of an array of identical NAND chips
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NandGeometry {
    pub chips: u32,
    pub blocks_per_chip: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,

    /// Size of the spare (out-of-band) area that accompanies every page
    pub spare_bytes: usize,

    /// Where, within the spare area of a block's first page, the logical block tag is kept
    pub tag_offset: usize,
}

impl NandGeometry {
    pub fn block_bytes(&self) -> usize {
        self.bytes_per_page * self.pages_per_block as usize
    }

    pub fn total_blocks(&self) -> u32 {
        self.blocks_per_chip * self.chips
    }
}

/// A pub-fields struct describing the data layout of a NAND flash array
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NandLayout {
    pub chips: u32,
    pub blocks_per_chip: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
}

impl NandLayout {
    /// Spare bytes per page that a real part of this page size would carry
    pub fn spare_bytes(&self) -> usize {
        (self.bytes_per_page / 32).max(16)
    }

    pub fn geometry(&self) -> NandGeometry {
        NandGeometry {
            chips: self.chips,
            blocks_per_chip: self.blocks_per_chip,
            pages_per_block: self.pages_per_block,
            bytes_per_page: self.bytes_per_page,
            spare_bytes: self.spare_bytes(),
            tag_offset: SIM_TAG_OFFSET,
        }
    }
}

/// Parse strings like "CHIPSxBLOCKSxPAGESxBYTES"
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [chips, blocks_per_chip, pages_per_block, bytes_per_page]: [&str; 4] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#x#"))?;
        let chips = chips.parse()?;
        let blocks_per_chip: u32 = blocks_per_chip.parse()?;
        let pages_per_block: u32 = pages_per_block.parse()?;
        let bytes_per_page: usize = bytes_per_page.parse()?;

        ensure!(
            blocks_per_chip.is_power_of_two()
                && pages_per_block.is_power_of_two()
                && bytes_per_page.is_power_of_two(),
            "blocks, pages and bytes must be powers of two"
        );

        Ok(NandLayout {
            chips,
            blocks_per_chip,
            pages_per_block,
            bytes_per_page,
        })
    }
}

/// What the driver knows about one physical block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    /// False if the manufacturer marked this block bad
    pub factory_good: bool,

    /// True if the block sits inside a committed lock aperture
    pub locked: bool,

    /// The spare area of the block's first page
    pub spare: Vec<u8>,
}

impl BlockInfo {
    /// The logical block tag stored at `offset` in the spare area, if one was ever programmed
    pub fn tag(&self, offset: usize) -> Option<u32> {
        let bytes: [u8; 4] = self.spare.get(offset..offset + 4)?.try_into().ok()?;
        match u32::from_le_bytes(bytes) {
            u32::MAX => None,
            tag => Some(tag),
        }
    }
}

/// A contiguous page range on one chip that is write-protected as a unit
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LockAperture {
    pub chip: u32,
    pub start_page: u32,
    pub end_page: u32,
}

/// The device driver beneath the block layer: raw page, spare and block operations on an array of
/// chips.
///
/// Page numbers are chip-relative. A single `read` or `write` never crosses a block boundary.
pub trait NandDriver {
    /// Get the shape of the array
    fn geometry(&self) -> NandGeometry;

    /// Read an integral number of pages starting at `page`, returning how many pages were actually
    /// transferred
    fn read(&mut self, chip: u32, page: u32, content: &mut [u8]) -> anyhow::Result<u32>;

    /// Program an integral number of pages starting at `page`, returning how many pages were
    /// actually transferred
    ///
    /// Pages within a block must be programmed in ascending order between erases.
    fn write(&mut self, chip: u32, page: u32, content: &[u8]) -> anyhow::Result<u32>;

    /// Erase a block, making all of its pages (and their spare areas) writable again
    fn erase(&mut self, chip: u32, block: u32) -> anyhow::Result<()>;

    fn block_info(&mut self, chip: u32, block: u32) -> anyhow::Result<BlockInfo>;

    fn read_spare(
        &mut self,
        chip: u32,
        page: u32,
        offset: usize,
        content: &mut [u8],
    ) -> anyhow::Result<()>;

    /// Program bytes of a page's spare area; bits may only be cleared
    fn write_spare(
        &mut self,
        chip: u32,
        page: u32,
        offset: usize,
        content: &[u8],
    ) -> anyhow::Result<()>;

    /// Write-protect one aperture
    fn set_lock(&mut self, aperture: &LockAperture) -> anyhow::Result<()>;

    fn suspend(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn resume(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Spare offset of the logical block tag on simulated parts
pub const SIM_TAG_OFFSET: usize = 4;

/// A simulated in-memory array of NAND chips, for testing purposes
#[derive(Debug, Clone)]
pub struct SimNand {
    blocks: Box<[SimBlock]>,
    layout: NandLayout,
    locks: Vec<LockAperture>,
    faults: SimFaults,
    suspended: bool,
}

/// Faults to inject, keyed by (chip, block)
#[derive(Debug, Clone, Default)]
struct SimFaults {
    erase: HashSet<(u32, u32)>,
    write: HashSet<(u32, u32)>,
    short_write: HashSet<(u32, u32)>,
    short_read: HashSet<(u32, u32)>,
    block_info: HashSet<(u32, u32)>,
}

/// A block of SimNand
#[derive(Debug, Clone)]
pub struct SimBlock {
    /// All bytes of all written pages (legally, can only append to this)
    data: Vec<u8>,

    /// Spare areas of every page, empty while the whole block is erased
    spare: Vec<u8>,

    /// How many pages in this block
    page_count: u32,

    /// How many bytes per page
    page_size: usize,

    /// How many spare bytes per page
    spare_size: usize,

    /// Was this block bad from the factory?
    factory_bad: bool,
}

impl SimNand {
    /// Create an empty SimNand with the specified layout
    pub fn new(layout: NandLayout) -> Self {
        let count = (layout.chips * layout.blocks_per_chip) as usize;
        let blocks = vec![SimBlock::new(layout); count];
        let blocks = blocks.into_boxed_slice();

        Self {
            blocks,
            layout,
            locks: vec![],
            faults: Default::default(),
            suspended: false,
        }
    }

    /// Initialize the NAND contents with content read from a type implementing `Read`.
    ///
    /// The stream holds every page of every block followed by its spare area, in chip order. A
    /// block whose first spare byte is not `0xFF` is factory bad.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let mut page = vec![0; self.layout.bytes_per_page];
        let mut spare = vec![0; self.layout.spare_bytes()];

        for block in self.blocks.iter_mut() {
            block.clear();
            for index in 0..block.page_count {
                read.read_exact(&mut page)?;
                read.read_exact(&mut spare)?;
                block.write_page(index, &page)?;
                block.and_spare(index, 0, &spare)?;
            }
            block.factory_bad = block.spare.first().is_some_and(|&x| x != 0xFF);
        }

        Ok(())
    }

    /// Write the contents of this simulated NAND out to a writable stream (such as a File)
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        let mut page = vec![0; self.layout.bytes_per_page];
        let mut spare = vec![0; self.layout.spare_bytes()];

        for block in self.blocks.iter() {
            for index in 0..block.page_count {
                block.read_page(index, &mut page)?;
                block.read_spare(index, 0, &mut spare)?;
                if block.factory_bad && index == 0 {
                    spare[0] = 0x00;
                }
                write.write_all(&page)?;
                write.write_all(&spare)?;
            }
        }

        Ok(())
    }

    pub fn layout(&self) -> NandLayout {
        self.layout
    }

    /// The apertures that have been locked so far
    pub fn locks(&self) -> &[LockAperture] {
        &self.locks
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn set_factory_bad(&mut self, chip: u32, block: u32) -> anyhow::Result<()> {
        self.block_mut(chip, block)?.factory_bad = true;
        Ok(())
    }

    pub fn fail_erase(&mut self, chip: u32, block: u32) {
        self.faults.erase.insert((chip, block));
    }

    pub fn fail_write(&mut self, chip: u32, block: u32) {
        self.faults.write.insert((chip, block));
    }

    /// Make programs on this block stop one page short of the request
    pub fn short_write(&mut self, chip: u32, block: u32) {
        self.faults.short_write.insert((chip, block));
    }

    /// Make reads on this block stop one page short of the request
    pub fn short_read(&mut self, chip: u32, block: u32) {
        self.faults.short_read.insert((chip, block));
    }

    pub fn fail_block_info(&mut self, chip: u32, block: u32) {
        self.faults.block_info.insert((chip, block));
    }

    /// Drop every injected fault
    pub fn heal(&mut self) {
        self.faults = Default::default();
    }

    /// Corrupt one already-programmed byte, as a bit-flip past ECC would
    pub fn flip_byte(&mut self, chip: u32, page: u32, offset: usize) -> anyhow::Result<()> {
        let ppb = self.layout.pages_per_block;
        let page_size = self.layout.bytes_per_page;
        let block = self.block_mut(chip, page / ppb)?;
        let index = (page % ppb) as usize * page_size + offset;
        match block.data.get_mut(index) {
            Some(byte) => *byte ^= 0xFF,
            None => bail!("chip {chip} page {page} is not programmed"),
        }
        Ok(())
    }

    /// Program a logical block tag into the first page of a block
    pub fn set_tag(&mut self, chip: u32, block: u32, logical: u32) -> anyhow::Result<()> {
        let page = block * self.layout.pages_per_block;
        self.write_spare(chip, page, SIM_TAG_OFFSET, &logical.to_le_bytes())
    }

    fn index(&self, chip: u32, block: u32) -> anyhow::Result<usize> {
        ensure!(chip < self.layout.chips, "chip {chip} out of range");
        ensure!(
            block < self.layout.blocks_per_chip,
            "block {block} out of range"
        );
        Ok((chip * self.layout.blocks_per_chip + block) as usize)
    }

    fn block_mut(&mut self, chip: u32, block: u32) -> anyhow::Result<&mut SimBlock> {
        let index = self.index(chip, block)?;
        Ok(&mut self.blocks[index])
    }

    fn block_ref(&self, chip: u32, block: u32) -> anyhow::Result<&SimBlock> {
        let index = self.index(chip, block)?;
        Ok(&self.blocks[index])
    }

    /// Split a chip-relative page into (block, page within block), checking the run fits
    fn locate(&self, page: u32, bytes: usize) -> anyhow::Result<(u32, u32, u32)> {
        let page_size = self.layout.bytes_per_page;
        ensure!(bytes % page_size == 0, "buffer not multiple of page size");

        let ppb = self.layout.pages_per_block;
        let count = (bytes / page_size) as u32;
        let (block, first) = (page / ppb, page % ppb);
        ensure!(
            first + count <= ppb,
            "page run {page}+{count} crosses a block boundary"
        );
        Ok((block, first, count))
    }
}

impl SimBlock {
    /// Construct an empty block within the given layout
    fn new(layout: NandLayout) -> Self {
        Self {
            data: Default::default(),
            spare: Default::default(),
            page_count: layout.pages_per_block,
            page_size: layout.bytes_per_page,
            spare_size: layout.spare_bytes(),
            factory_bad: false,
        }
    }

    fn clear(&mut self) {
        self.data.clear();
        self.spare.clear();
    }

    fn write_page(&mut self, index: u32, content: &[u8]) -> anyhow::Result<()> {
        ensure!(content.len() == self.page_size, "content not page-sized");
        ensure!(index < self.page_count, "page index out of bounds");

        let begin = index as usize * self.page_size;

        ensure!(begin >= self.data.len(), "write in already-written area");

        // Writing fully-erased content is a no-op.
        if !content.is_erased() {
            self.data.resize(begin, 0xFF);
            self.data.extend_from_slice(content);
        }

        Ok(())
    }

    fn read_page(&self, index: u32, content: &mut [u8]) -> anyhow::Result<()> {
        ensure!(content.len() == self.page_size, "content not page-sized");
        ensure!(index < self.page_count, "page index out of bounds");

        let begin = index as usize * self.page_size;
        let end = begin + self.page_size;

        if let Some(page) = self.data.get(begin..end) {
            content.copy_from_slice(page);
        } else {
            content.fill(0xFF);
        }

        Ok(())
    }

    fn spare_range(&self, index: u32, offset: usize, len: usize) -> anyhow::Result<usize> {
        ensure!(index < self.page_count, "page index out of bounds");
        ensure!(offset + len <= self.spare_size, "spare access out of bounds");
        Ok(index as usize * self.spare_size + offset)
    }

    fn read_spare(&self, index: u32, offset: usize, content: &mut [u8]) -> anyhow::Result<()> {
        let begin = self.spare_range(index, offset, content.len())?;
        match self.spare.get(begin..begin + content.len()) {
            Some(bytes) => content.copy_from_slice(bytes),
            None => content.fill(0xFF),
        }
        Ok(())
    }

    /// Program spare bytes; NAND can only clear bits
    fn and_spare(&mut self, index: u32, offset: usize, content: &[u8]) -> anyhow::Result<()> {
        let begin = self.spare_range(index, offset, content.len())?;
        if self.spare.is_empty() {
            if content.is_erased() {
                return Ok(());
            }
            self.spare = vec![0xFF; self.spare_size * self.page_count as usize];
        }
        for (byte, new) in self.spare[begin..].iter_mut().zip(content) {
            *byte &= new;
        }
        Ok(())
    }
}

impl NandDriver for SimNand {
    fn geometry(&self) -> NandGeometry {
        self.layout.geometry()
    }

    fn read(&mut self, chip: u32, page: u32, content: &mut [u8]) -> anyhow::Result<u32> {
        let (block, first, mut count) = self.locate(page, content.len())?;
        if self.faults.short_read.contains(&(chip, block)) {
            count = count.saturating_sub(1);
        }

        let page_size = self.layout.bytes_per_page;
        let sim = self.block_ref(chip, block)?;
        for (i, chunk) in content.chunks_mut(page_size).take(count as usize).enumerate() {
            sim.read_page(first + i as u32, chunk)?;
        }
        Ok(count)
    }

    fn write(&mut self, chip: u32, page: u32, content: &[u8]) -> anyhow::Result<u32> {
        let (block, first, mut count) = self.locate(page, content.len())?;
        if self.faults.write.contains(&(chip, block)) {
            bail!("program failure on chip {chip} block {block}");
        }
        if self.faults.short_write.contains(&(chip, block)) {
            count = count.saturating_sub(1);
        }

        let page_size = self.layout.bytes_per_page;
        let sim = self.block_mut(chip, block)?;
        for (i, chunk) in content.chunks(page_size).take(count as usize).enumerate() {
            sim.write_page(first + i as u32, chunk)?;
        }
        Ok(count)
    }

    fn erase(&mut self, chip: u32, block: u32) -> anyhow::Result<()> {
        if self.faults.erase.contains(&(chip, block)) {
            bail!("erase failure on chip {chip} block {block}");
        }
        self.block_mut(chip, block)?.clear();
        Ok(())
    }

    fn block_info(&mut self, chip: u32, block: u32) -> anyhow::Result<BlockInfo> {
        if self.faults.block_info.contains(&(chip, block)) {
            bail!("status read failure on chip {chip} block {block}");
        }

        let ppb = self.layout.pages_per_block;
        let locked = self.locks.iter().any(|lock| {
            lock.chip == chip
                && lock.start_page <= block * ppb
                && block * ppb + ppb - 1 <= lock.end_page
        });

        let sim = self.block_ref(chip, block)?;
        let mut spare = vec![0; sim.spare_size];
        sim.read_spare(0, 0, &mut spare)?;
        Ok(BlockInfo {
            factory_good: !sim.factory_bad,
            locked,
            spare,
        })
    }

    fn read_spare(
        &mut self,
        chip: u32,
        page: u32,
        offset: usize,
        content: &mut [u8],
    ) -> anyhow::Result<()> {
        let ppb = self.layout.pages_per_block;
        self.block_ref(chip, page / ppb)?
            .read_spare(page % ppb, offset, content)
    }

    fn write_spare(
        &mut self,
        chip: u32,
        page: u32,
        offset: usize,
        content: &[u8],
    ) -> anyhow::Result<()> {
        let ppb = self.layout.pages_per_block;
        let block = page / ppb;
        if self.faults.write.contains(&(chip, block)) {
            bail!("spare program failure on chip {chip} block {block}");
        }
        self.block_mut(chip, block)?
            .and_spare(page % ppb, offset, content)
    }

    fn set_lock(&mut self, aperture: &LockAperture) -> anyhow::Result<()> {
        ensure!(aperture.chip < self.layout.chips, "chip out of range");
        self.locks.push(*aperture);
        Ok(())
    }

    fn suspend(&mut self) -> anyhow::Result<()> {
        self.suspended = true;
        Ok(())
    }

    fn resume(&mut self) -> anyhow::Result<()> {
        self.suspended = false;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) const TEST_LAYOUT: NandLayout = NandLayout {
    chips: 2,
    blocks_per_chip: 64,
    pages_per_block: 16,
    bytes_per_page: 256,
};

#[test]
fn test_layout_parse() -> anyhow::Result<()> {
    let layout: NandLayout = "2x1024x64x2048".parse()?;
    assert_eq!(layout.chips, 2);
    assert_eq!(layout.blocks_per_chip, 1024);
    assert_eq!(layout.pages_per_block, 64);
    assert_eq!(layout.bytes_per_page, 2048);
    assert_eq!(layout.spare_bytes(), 64);

    assert!("2x1024x64".parse::<NandLayout>().is_err());
    assert!("2x1000x64x2048".parse::<NandLayout>().is_err());
    Ok(())
}

#[test]
fn test_sim_read_write() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);

    let data_in = vec![0xA5u8; TEST_LAYOUT.bytes_per_page];
    let mut data_out = data_in.clone();

    assert_eq!(nand.write(1, 2, &data_in)?, 1);
    assert!(nand.write(1, 1, &data_in).is_err());

    assert_eq!(nand.read(1, 1, &mut data_out)?, 1);
    assert!(data_out.is_erased());

    nand.read(1, 2, &mut data_out)?;
    assert_eq!(data_out, data_in);

    // Same page on the other chip is untouched
    nand.read(0, 2, &mut data_out)?;
    assert!(data_out.is_erased());

    nand.erase(1, 0)?;
    nand.read(1, 2, &mut data_out)?;
    assert!(data_out.is_erased());
    Ok(())
}

#[test]
fn test_sim_block_boundary() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let data = vec![0u8; TEST_LAYOUT.bytes_per_page * 2];
    assert!(nand.write(0, TEST_LAYOUT.pages_per_block - 1, &data).is_err());
    assert!(nand.write(2, 0, &data).is_err());
}

#[test]
fn test_sim_spare() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let ppb = TEST_LAYOUT.pages_per_block;

    assert!(nand.block_info(0, 3)?.spare.is_erased());

    nand.set_tag(0, 3, 0x1234)?;
    let info = nand.block_info(0, 3)?;
    assert!(info.factory_good);
    assert_eq!(
        &info.spare[SIM_TAG_OFFSET..SIM_TAG_OFFSET + 4],
        &0x1234u32.to_le_bytes()
    );

    // Spare programming only clears bits
    nand.write_spare(0, 3 * ppb, SIM_TAG_OFFSET, &[0xF0])?;
    let mut tag = [0u8; 1];
    nand.read_spare(0, 3 * ppb, SIM_TAG_OFFSET, &mut tag)?;
    assert_eq!(tag[0], 0x34 & 0xF0);

    nand.erase(0, 3)?;
    assert!(nand.block_info(0, 3)?.spare.is_erased());
    Ok(())
}

#[test]
fn test_sim_faults() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let ppb = TEST_LAYOUT.pages_per_block;
    let data = vec![0x11u8; TEST_LAYOUT.bytes_per_page * 4];

    nand.set_factory_bad(1, 5)?;
    assert!(!nand.block_info(1, 5)?.factory_good);

    nand.fail_erase(0, 1);
    assert!(nand.erase(0, 1).is_err());

    nand.short_write(0, 2);
    assert_eq!(nand.write(0, 2 * ppb, &data)?, 3);

    nand.short_read(0, 2);
    let mut out = data.clone();
    assert_eq!(nand.read(0, 2 * ppb, &mut out)?, 3);

    nand.heal();
    nand.write(0, 4 * ppb, &data)?;
    nand.flip_byte(0, 4 * ppb, 7)?;
    nand.read(0, 4 * ppb, &mut out)?;
    assert_eq!(out[7], 0xEE);
    assert!(nand.flip_byte(0, 6 * ppb, 0).is_err());
    Ok(())
}

#[test]
fn test_sim_save_load() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let data = vec![0x55u8; TEST_LAYOUT.bytes_per_page];
    nand.write(1, 17, &data)?;
    nand.set_tag(1, 1, 9)?;
    nand.set_factory_bad(0, 6)?;

    let mut image = vec![];
    nand.save(&mut image)?;

    let mut copy = SimNand::new(TEST_LAYOUT);
    copy.load(&mut image.as_slice())?;

    let mut out = vec![0u8; TEST_LAYOUT.bytes_per_page];
    copy.read(1, 17, &mut out)?;
    assert_eq!(out, data);
    assert_eq!(copy.block_info(1, 1)?, nand.block_info(1, 1)?);
    assert!(!copy.block_info(0, 6)?.factory_good);
    assert!(copy.block_info(0, 7)?.factory_good);
    Ok(())
}
