//! Inspect, partition and poke at a NAND flash array through the block-device layer.
//!
//! Runs against a real `/dev/mtdX` on Linux, or against a simulated array that can be loaded from
//! and saved back to an image file, which is handy for trying out partition layouts.

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use log::LevelFilter;

use std::fs::File;
use std::path::PathBuf;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

#[cfg(target_os = "linux")]
use nand_blockdev::nand::mtd::MtdNand;
use nand_blockdev::{
    nand::{NandDriver, NandLayout, SimNand},
    AllocateRequest, BlockDevConfig, BlockDevManager, DirectLayer, EraseType, Ioctl, IoctlReply,
    MgmtPolicy, PartitionSize, Placement,
};

#[derive(Args, Debug)]
#[group(required = true)]
struct NandOptions {
    /// Name of the MTD device or partition
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_name: Option<String>,

    /// Path to a `/dev/mtdX` device
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_dev: Option<PathBuf>,

    /// Path to the NAND image to use; a missing file starts out blank
    #[clap(long, group = "nand-options", requires = "sim_layout")]
    sim_path: Option<PathBuf>,

    /// Layout of the NAND to simulate
    #[clap(long)]
    sim_layout: Option<NandLayout>,

    /// Write back the NAND file when done
    #[clap(long, requires = "sim_path")]
    sim_write: bool,
}

impl NandOptions {
    fn open(&self) -> Result<NandImpl> {
        let nandimpl = if let Some(layout) = self.sim_layout {
            let mut sim = SimNand::new(layout);
            if let Some(path) = self.sim_path.as_ref().filter(|x| x.exists()) {
                sim.load(&mut File::open(path)?)
                    .with_context(|| format!("loading {}", path.display()))?;
            }

            NandImpl::Sim(sim)
        } else {
            #[cfg(target_os = "linux")]
            {
                let mtd = {
                    if let Some(name) = &self.mtd_name {
                        MtdNand::open_named(name)?
                    } else if let Some(dev) = &self.mtd_dev {
                        MtdNand::open(dev)?
                    } else {
                        unreachable!()
                    }
                };

                NandImpl::Mtd(mtd)
            }

            #[cfg(not(target_os = "linux"))]
            unreachable!()
        };

        Ok(nandimpl)
    }

    fn cleanup(&self, nand: NandImpl) -> Result<()> {
        if self.sim_write {
            if let Some(path) = &self.sim_path {
                if let NandImpl::Sim(sim_nand) = nand {
                    sim_nand.save(&mut File::create(path)?)?;
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
enum NandImpl {
    Sim(SimNand),

    #[cfg(target_os = "linux")]
    Mtd(MtdNand),
}

impl NandImpl {
    fn run(self, cmd: Command, config: BlockDevConfig) -> Result<Self> {
        let nand = match self {
            Self::Sim(nand) => Self::Sim(cmd.execute(nand, config)?),

            #[cfg(target_os = "linux")]
            Self::Mtd(nand) => Self::Mtd(cmd.execute(nand, config)?),
        };

        Ok(nand)
    }
}

/// One partition to allocate, written `ID:SIZE[@START][:PERCENT[:POLICY]]`.
///
/// SIZE is a count of logical sectors or `rest`; START places the partition at an absolute
/// physical sector; POLICY is `lite`, `full` or `external`.
#[derive(Debug, Clone, Copy)]
struct PartitionSpec(AllocateRequest);

impl FromStr for PartitionSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut fields = s.split(':');
        let (Some(id), Some(size)) = (fields.next(), fields.next()) else {
            bail!("expected ID:SIZE");
        };

        let (size, start) = match size.split_once('@') {
            Some((size, start)) => (size, Some(start.parse()?)),
            None => (size, None),
        };
        let size = match size {
            "rest" => PartitionSize::Remainder,
            sectors => PartitionSize::Fixed {
                sectors: sectors.parse()?,
            },
        };

        let mut request = AllocateRequest::relative(id.parse()?, size);
        if let Some(start_sector) = start {
            request.placement = Placement::Absolute { start_sector };
        }
        if let Some(percent) = fields.next() {
            request.percent_reserved = percent.parse()?;
        }
        if let Some(policy) = fields.next() {
            request.policy = match policy {
                "lite" => MgmtPolicy::FtlLite,
                "full" => MgmtPolicy::FtlFull,
                "external" => MgmtPolicy::External,
                _ => bail!("unknown management policy {policy:?}"),
            };
        }
        if fields.next().is_some() {
            bail!("too many fields in {s:?}");
        }

        Ok(Self(request))
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum EraseArg {
    /// Erase only blocks that are neither factory- nor run-time bad
    Good,

    /// Erase everything the factory did not mark bad, forgetting run-time bad marks
    NonFactoryBad,

    /// Like `non-factory-bad`, then write and check a test pattern in every block
    Verified,
}

impl From<EraseArg> for EraseType {
    fn from(value: EraseArg) -> Self {
        match value {
            EraseArg::Good => EraseType::GoodBlocks,
            EraseArg::NonFactoryBad => EraseType::NonFactoryBadBlocks,
            EraseArg::Verified => EraseType::VerifiedGoodBlocks,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the geometry of a partition (0 is the whole device)
    Info {
        #[clap(default_value_t = 0)]
        partition: u32,
    },

    /// Replace the region table with a new set of partitions
    Partition {
        /// Partitions to allocate, in order
        #[clap(required = true)]
        specs: Vec<PartitionSpec>,

        /// Interleave factor for every partition
        #[clap(long, default_value_t = 1)]
        interleave: u32,
    },

    /// Print the region table stored on the flash
    ShowTable,

    /// Check every stored copy of the region table against the newest one
    Verify,

    /// Erase the whole device
    Format {
        #[clap(long, value_enum, default_value = "non-factory-bad")]
        erase: EraseArg,
    },

    /// List bad and locked blocks
    BadBlocks,

    /// Dump physical sectors as hex, or into a file
    ReadPhysical {
        sector: u32,

        #[clap(long, default_value_t = 1)]
        count: u32,

        #[clap(long)]
        output: Option<PathBuf>,
    },

    /// Write a file to physical sectors, erasing the blocks first
    WritePhysical {
        sector: u32,

        input: PathBuf,

        /// Read every sector back after writing
        #[clap(long)]
        verify: bool,
    },
}

impl Command {
    fn execute<D: NandDriver>(self, nand: D, config: BlockDevConfig) -> Result<D> {
        let geometry = nand.geometry();
        let manager = BlockDevManager::new(config);
        manager.attach(0, nand, DirectLayer)?;

        let result = self.execute_on(&manager, geometry.total_blocks(), geometry.bytes_per_page);
        let nand = manager.detach(0)?;
        result.map(|()| nand)
    }

    fn execute_on<D: NandDriver>(
        self,
        manager: &BlockDevManager<D, DirectLayer>,
        total_blocks: u32,
        page_size: usize,
    ) -> Result<()> {
        match self {
            Command::Info { partition } => {
                let mut part = manager.open(0, partition)?;
                let info = part.info()?;
                println!("bytes per sector:  {}", info.bytes_per_sector);
                println!("sectors per block: {}", info.sectors_per_block);
                println!("total blocks:      {}", info.total_blocks);
                if let Some(entry) = part.entry() {
                    println!("{entry:#?}");
                }
                part.close()?;
            }

            Command::Partition { specs, interleave } => {
                let mut raw = manager.open(0, 0)?;
                raw.ioctl(Ioctl::StartPartitioning)?;
                for PartitionSpec(mut request) in specs {
                    if interleave > 1 {
                        request.interleave = interleave;
                        request.interleave_enabled = true;
                    }
                    let reply = raw.ioctl(Ioctl::AllocatePartition(request))?;
                    if let IoctlReply::Allocated(reply) = reply {
                        println!(
                            "partition {}: logical {}+{}, physical {}+{}",
                            request.partition_id,
                            reply.start_logical_sector,
                            reply.logical_sectors,
                            reply.start_physical_sector,
                            reply.physical_sectors
                        );
                    }
                }
                raw.ioctl(Ioctl::FinishPartitioning)?;
                raw.close()?;
            }

            Command::ShowTable => {
                let mut raw = manager.open(0, 0)?;
                let table = raw.region_table()?;
                println!("interleave {}", table.interleave);
                for entry in &table.entries {
                    println!(
                        "{:4} => logical {}+{}, physical {}+{}, x{}, {:?}{}{}",
                        entry.partition_id,
                        entry.start_logical_block,
                        entry.total_logical_blocks,
                        entry.start_physical_block,
                        entry.total_physical_blocks,
                        entry.interleave,
                        entry.policy,
                        if entry.unbounded { ", unbounded" } else { "" },
                        if entry.sequenced_read { ", sequenced" } else { "" },
                    );
                }
                raw.close()?;
            }

            Command::Verify => {
                let mut raw = manager.open(0, 0)?;
                raw.ioctl(Ioctl::VerifyCriticalPartitions)?;
                println!("All region table copies match");
                raw.close()?;
            }

            Command::Format { erase } => {
                let mut raw = manager.open(0, 0)?;
                let reply = raw.ioctl(Ioctl::FormatDevice(erase.into()))?;
                if let IoctlReply::Formatted(report) = reply {
                    println!(
                        "Erased {}, skipped {}, marked bad {}",
                        report.erased, report.skipped, report.marked_bad
                    );
                }
                raw.close()?;
            }

            Command::BadBlocks => {
                let mut raw = manager.open(0, 0)?;
                for block in 0..total_blocks {
                    let IoctlReply::BlockStatus(status) =
                        raw.ioctl(Ioctl::QueryPhysicalBlockStatus { block })?
                    else {
                        continue;
                    };
                    if !status.good || status.locked {
                        println!("{block:6} => {status:?}");
                    }
                }
                raw.close()?;
            }

            Command::ReadPhysical {
                sector,
                count,
                output,
            } => {
                let mut buf = vec![0; count as usize * page_size];
                let mut raw = manager.open(0, 0)?;
                raw.ioctl(Ioctl::ReadPhysicalSector {
                    sector,
                    buf: &mut buf,
                })?;
                raw.close()?;

                match output {
                    Some(path) => std::fs::write(path, &buf)?,
                    None => hexdump(sector, page_size, &buf),
                }
            }

            Command::WritePhysical {
                sector,
                input,
                verify,
            } => {
                let mut data = std::fs::read(&input)
                    .with_context(|| format!("reading {}", input.display()))?;
                data.resize(data.len().next_multiple_of(page_size), 0xFF);

                let mut raw = manager.open(0, 0)?;
                raw.ioctl(Ioctl::WriteVerifyMode(verify))?;
                raw.ioctl(Ioctl::WritePhysicalSector {
                    sector,
                    data: &data,
                })?;
                raw.close()?;
            }
        };

        Ok(())
    }
}

fn hexdump(first_sector: u32, page_size: usize, buf: &[u8]) {
    for (i, page) in buf.chunks(page_size).enumerate() {
        println!("sector {}:", first_sector as usize + i);
        for (j, row) in page.chunks(32).enumerate() {
            let hex: Vec<_> = row.iter().map(|x| format!("{x:02x}")).collect();
            println!("  {:04x}: {}", j * 32, hex.join(" "));
        }
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The NAND to use
    #[clap(flatten)]
    nand: NandOptions,

    /// More logging; repeat for more still
    #[clap(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// The command to run against this NAND
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).init();
    howudoin::init(howudoin::consumers::TermLine::default());

    let nand = args.nand.open()?;
    let result = nand.run(args.cmd, BlockDevConfig::default());

    howudoin::disable();
    thread::sleep(Duration::from_millis(10)); // Give howudoin time to shut down

    args.nand.cleanup(result?)?;
    Ok(())
}
