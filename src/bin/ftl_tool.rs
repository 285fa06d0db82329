//! A test program for the formatting and recovery functionality.
//!
//! This is meant to be used interactively, either against a simulated device backed by an image
//! file or against a real NOR flash exposed through Linux MTD.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use std::fs::File;
use std::path::PathBuf;

#[cfg(target_os = "linux")]
use nor_ftl::driver::mtd::MtdNor;
use nor_ftl::{
    driver::{FlashDriver, FlashGeometry, SimNor},
    ftl::{FlashBuilder, NorFlash},
};

#[derive(Args, Debug)]
#[group(required = true)]
struct DeviceOptions {
    /// Name of the MTD device or partition
    #[cfg(target_os = "linux")]
    #[clap(long, group = "device-options", requires = "sector_words")]
    mtd_name: Option<String>,

    /// Path to a `/dev/mtdX` device
    #[cfg(target_os = "linux")]
    #[clap(long, group = "device-options", requires = "sector_words")]
    mtd_dev: Option<PathBuf>,

    /// Sector size, in words, to use with an MTD device
    #[cfg(target_os = "linux")]
    #[clap(long)]
    sector_words: Option<u32>,

    /// Path to the flash image to use
    #[clap(long, group = "device-options", requires = "sim_layout")]
    sim_path: Option<PathBuf>,

    /// Geometry of the flash to simulate, as BLOCKSxWORDSxSECTOR
    #[clap(long)]
    sim_layout: Option<FlashGeometry>,

    /// Write back the flash image when done
    #[clap(long, requires = "sim_path")]
    sim_write: bool,

    /// Largest erase count to accept as plausible
    #[clap(long)]
    max_erase_count: Option<u32>,
}

impl DeviceOptions {
    fn open(&self) -> Result<DeviceImpl> {
        let device = if let Some(geometry) = self.sim_layout {
            let sim = match &self.sim_path {
                Some(path) if path.exists() => {
                    let sim = SimNor::load(&mut File::open(path)?)?;
                    anyhow::ensure!(
                        sim.geometry() == geometry,
                        "image holds {:?}, not {geometry:?}",
                        sim.geometry()
                    );
                    sim
                }
                _ => SimNor::new(geometry),
            };

            DeviceImpl::Sim(sim)
        } else {
            #[cfg(target_os = "linux")]
            {
                let sector_words = self.sector_words.unwrap_or_default();
                let mtd = {
                    if let Some(name) = &self.mtd_name {
                        MtdNor::open_named(name, sector_words)?
                    } else if let Some(dev) = &self.mtd_dev {
                        MtdNor::open(dev, sector_words)?
                    } else {
                        unreachable!()
                    }
                };

                DeviceImpl::Mtd(mtd)
            }

            #[cfg(not(target_os = "linux"))]
            unreachable!()
        };

        Ok(device)
    }

    fn builder<'a>(&self, device: &'a mut DeviceImpl) -> FlashBuilder<&'a mut dyn FlashDriver> {
        let builder = FlashBuilder::new("flash", device.driver());
        match self.max_erase_count {
            Some(max) => builder.max_erase_count(max),
            None => builder,
        }
    }

    fn cleanup(&self, device: DeviceImpl) -> Result<()> {
        if self.sim_write {
            if let Some(path) = &self.sim_path {
                if let DeviceImpl::Sim(sim) = device {
                    sim.save(&mut File::create(path)?)?;
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
enum DeviceImpl {
    Sim(SimNor),

    #[cfg(target_os = "linux")]
    Mtd(MtdNor),
}

impl DeviceImpl {
    fn driver(&mut self) -> &mut dyn FlashDriver {
        match self {
            Self::Sim(sim) => sim,

            #[cfg(target_os = "linux")]
            Self::Mtd(mtd) => mtd,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the state of each block; this is a read-only operation
    Overview,

    /// Bring every block to a formatted, erased state
    Format,

    /// Recover the device, repairing incoherent blocks, and print what was found
    Open,
}

impl Command {
    fn execute(self, mut flash: NorFlash<&mut dyn FlashDriver>) -> Result<()> {
        match self {
            Command::Overview => {
                let ebt = flash.scan()?;

                for (i, state) in ebt.iter().enumerate() {
                    println!("{i:4} => {state:?}");
                }
            }

            Command::Format => {
                flash.format()?;
            }

            Command::Open => {
                let stats = flash.open()?;
                println!("{stats:#?}");
            }
        };

        Ok(())
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The flash device to use
    #[clap(flatten)]
    device: DeviceOptions,

    /// The command to run against this device
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Cli::parse();
    howudoin::init(howudoin::consumers::TermLine::default());

    let mut device = args.device.open()?;
    let flash = args.device.builder(&mut device).configure()?;
    args.cmd.execute(flash)?;
    args.device.cleanup(device)?;
    Ok(())
}
