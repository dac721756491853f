//! NAND driver implementation over the Linux MTD subsystem

use super::{BlockInfo, LockAperture, NandDriver, NandGeometry};

use anyhow::{bail, ensure};

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

/// Offset of the logical block tag in the OOB area, past the bad-block marker bytes
const MTD_TAG_OFFSET: usize = 4;

/// A single-chip NAND array that wraps an open /dev/mtdX file
#[derive(Debug)]
pub struct MtdNand {
    file: File,
    geometry: NandGeometry,
}

impl MtdNand {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0")
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let geometry = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        }
        .try_into()?;

        Ok(Self { file, geometry })
    }

    /// Open an `mtd` device by its name, by searching `/proc/mtd`
    pub fn open_named(name: &str) -> anyhow::Result<Self> {
        // Put `name` in quotes
        let name = format!("\"{name}\"");

        let proc_mtd = File::open("/proc/mtd")?;
        let proc_mtd = BufReader::new(proc_mtd);
        for line in proc_mtd.lines() {
            let line = line?;
            if line.contains(&name) {
                if let Some(mtd_dev) = line.split(':').next() {
                    return Self::open(Path::new("/dev").join(mtd_dev));
                }
            }
        }

        bail!("MTD device {name} could not be found");
    }

    fn block_size(&self) -> u32 {
        self.geometry.pages_per_block * self.geometry.bytes_per_page as u32
    }

    /// Ensure that the chip and page run are valid, and compute the /dev/mtdX offset for the page
    fn offset_for(&self, chip: u32, page: u32, bytes: usize) -> anyhow::Result<u64> {
        ensure!(chip == 0, "MTD devices have a single chip");
        let page_size = self.geometry.bytes_per_page;
        ensure!(bytes % page_size == 0, "buffer not multiple of page size");

        let ppb = self.geometry.pages_per_block;
        let end_page = page % ppb + (bytes / page_size) as u32;
        ensure!(
            end_page <= ppb,
            "page run starting at {page} crosses a block boundary"
        );
        ensure!(
            page / ppb < self.geometry.blocks_per_chip,
            "page {page} out of range"
        );

        Ok(page as u64 * page_size as u64)
    }

    fn oob(
        &self,
        page: u32,
        offset: usize,
        len: usize,
        ptr: *mut u8,
    ) -> anyhow::Result<ioctl::mtd_oob_buf> {
        ensure!(
            offset + len <= self.geometry.spare_bytes,
            "spare access out of bounds"
        );
        Ok(ioctl::mtd_oob_buf {
            start: page * self.geometry.bytes_per_page as u32 + offset as u32,
            length: len as u32,
            ptr,
        })
    }
}

impl NandDriver for MtdNand {
    fn geometry(&self) -> NandGeometry {
        self.geometry
    }

    fn read(&mut self, chip: u32, page: u32, content: &mut [u8]) -> anyhow::Result<u32> {
        let offset = self.offset_for(chip, page, content.len())?;
        self.file.read_exact_at(content, offset)?;
        Ok((content.len() / self.geometry.bytes_per_page) as u32)
    }

    fn write(&mut self, chip: u32, page: u32, content: &[u8]) -> anyhow::Result<u32> {
        let offset = self.offset_for(chip, page, content.len())?;
        self.file.write_all_at(content, offset)?;
        Ok((content.len() / self.geometry.bytes_per_page) as u32)
    }

    fn erase(&mut self, chip: u32, block: u32) -> anyhow::Result<()> {
        self.offset_for(chip, block * self.geometry.pages_per_block, 0)?;
        let erase_info = ioctl::erase_info_user {
            start: self.block_size() * block,
            length: self.block_size(),
        };
        unsafe {
            ioctl::memerase(self.file.as_raw_fd(), &erase_info)?;
        }
        Ok(())
    }

    fn block_info(&mut self, chip: u32, block: u32) -> anyhow::Result<BlockInfo> {
        let page = block * self.geometry.pages_per_block;
        self.offset_for(chip, page, 0)?;

        let block_base: u64 = (self.block_size() * block) as u64;
        let bad = unsafe { ioctl::memgetbadblock(self.file.as_raw_fd(), &block_base)? };

        let mut region = ioctl::erase_info_user {
            start: self.block_size() * block,
            length: self.block_size(),
        };
        // Parts without lock support report EOPNOTSUPP; treat them as unlocked
        let locked = unsafe { ioctl::memislocked(self.file.as_raw_fd(), &mut region) }
            .map(|status| status > 0)
            .unwrap_or(false);

        let mut spare = vec![0xFF; self.geometry.spare_bytes];
        self.read_spare(chip, page, 0, &mut spare)?;

        Ok(BlockInfo {
            factory_good: bad == 0,
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
        self.offset_for(chip, page, 0)?;
        let mut oob = self.oob(page, offset, content.len(), content.as_mut_ptr())?;
        unsafe {
            ioctl::memreadoob(self.file.as_raw_fd(), &mut oob)?;
        }
        Ok(())
    }

    fn write_spare(
        &mut self,
        chip: u32,
        page: u32,
        offset: usize,
        content: &[u8],
    ) -> anyhow::Result<()> {
        self.offset_for(chip, page, 0)?;
        // The kernel only reads through this pointer for MEMWRITEOOB
        let mut oob = self.oob(page, offset, content.len(), content.as_ptr() as *mut u8)?;
        unsafe {
            ioctl::memwriteoob(self.file.as_raw_fd(), &mut oob)?;
        }
        Ok(())
    }

    fn set_lock(&mut self, aperture: &LockAperture) -> anyhow::Result<()> {
        self.offset_for(aperture.chip, aperture.end_page, 0)?;
        let page_size = self.geometry.bytes_per_page as u32;
        let region = ioctl::erase_info_user {
            start: aperture.start_page * page_size,
            length: (aperture.end_page + 1 - aperture.start_page) * page_size,
        };
        unsafe {
            ioctl::memlock(self.file.as_raw_fd(), &region)?;
        }
        Ok(())
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use super::{NandGeometry, MTD_TAG_OFFSET};

    use anyhow::ensure;
    use nix::{ioctl_read, ioctl_readwrite, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    impl TryInto<NandGeometry> for mtd_info_user {
        type Error = anyhow::Error;

        fn try_into(mut self) -> anyhow::Result<NandGeometry> {
            if self.writesize == 1 {
                // Hack for debugging on mtdram devices
                self.writesize = 64;
            }

            ensure!(
                self.size % self.erasesize == 0,
                "MTD size not multiple of erasesize"
            );
            ensure!(
                self.erasesize % self.writesize == 0,
                "MTD erasesize not multiple of writesize"
            );
            ensure!(
                self.oobsize as usize >= MTD_TAG_OFFSET + 4,
                "MTD OOB area too small for block tags"
            );

            Ok(NandGeometry {
                chips: 1,
                blocks_per_chip: self.size / self.erasesize,
                pages_per_block: self.erasesize / self.writesize,
                bytes_per_page: self.writesize as usize,
                spare_bytes: self.oobsize as usize,
                tag_offset: MTD_TAG_OFFSET,
            })
        }
    }

    #[repr(C)]
    pub struct erase_info_user {
        pub start: u32,
        pub length: u32,
    }
    ioctl_write_ptr!(memerase, MTD_IOC_MAGIC, 2, erase_info_user);

    #[repr(C)]
    pub struct mtd_oob_buf {
        pub start: u32,
        pub length: u32,
        pub ptr: *mut u8,
    }
    ioctl_readwrite!(memwriteoob, MTD_IOC_MAGIC, 3, mtd_oob_buf);
    ioctl_readwrite!(memreadoob, MTD_IOC_MAGIC, 4, mtd_oob_buf);

    ioctl_write_ptr!(memlock, MTD_IOC_MAGIC, 5, erase_info_user);
    ioctl_write_ptr!(memgetbadblock, MTD_IOC_MAGIC, 11, u64);
    ioctl_read!(memislocked, MTD_IOC_MAGIC, 23, erase_info_user);
}
