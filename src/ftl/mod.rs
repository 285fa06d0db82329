//! This module implements block-level formatting and coherence recovery for NOR flash.
//!
//! Every block starts with a header word holding its erase count and an "erased" flag, followed
//! by a free-sector bitmap and one mapping entry per sector (see [codec]). Flash can only clear
//! bits between erases, so each metadata update is a bit-clearing write, ordered such that a
//! power loss at any point leaves a state [NorFlash::open] can classify and repair:
//!
//! 1. Erasing a block sets every word to all-ones. The header now reads as "unprogrammed".
//! 2. Formatting writes the bitmap's trailing mask, then the header (count + erased flag).
//! 3. Sector logic clears the erased flag before the first allocation, then clears a bitmap bit,
//!    then writes the mapping entry.
//!
//! Interrupting (1) or (2) leaves an unprogrammed header; interrupting (3) leaves sectors that
//! are allocated but unmapped, which count as obsolete. Anything else is corruption, and the
//! block is re-formatted with its erase count carried forward where it is still known.

pub mod codec;
mod escalate;
mod format;
mod guard;
mod open;
mod scan;

pub use codec::{BitmapLayout, BlockHeader, BlockLayout, SectorEntry};
pub use escalate::{Escalation, Fault, LogEscalation, Operation};
pub use guard::{ExclusiveAccess, NoGuard};
pub use open::SectorStats;
pub use scan::{BlockState, Ebt, Incoherence, SectorUsage};

use crate::driver::{
    DriverInfo, DriverResult, DriverStatus, FlashDriver, FlashGeometry, VerifyShape,
};

use codec::ERASE_COUNT_MAX;
use thiserror::Error;

/// Erase counts above this are treated as corrupt unless [FlashBuilder::max_erase_count] says
/// otherwise; well past the endurance of common NOR parts
pub const DEFAULT_MAX_ERASE_COUNT: u32 = 1_000_000;

/// Ways formatting or opening a flash instance can fail
#[derive(Debug, Error)]
pub enum Error {
    #[error("driver supplied no staging buffer and cannot read flash directly")]
    NoMemory,

    #[error("driver initialization failed: {0}")]
    Initialize(DriverStatus),

    #[error("unusable flash geometry: {0}")]
    Geometry(String),

    #[error(transparent)]
    Driver(#[from] Fault),

    #[error("flash has never been formatted")]
    NotFormatted,

    #[error("flash holds no valid blocks")]
    Corrupted,

    #[error("flash {0} is already open")]
    AlreadyOpen(String),
}

/// The coarse outcome of an operation, for callers that only need to branch on success
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Status {
    Success,
    NoMemory,
    Error,
}

impl Error {
    pub fn status(&self) -> Status {
        match self {
            Self::NoMemory => Status::NoMemory,
            _ => Status::Error,
        }
    }
}

impl Status {
    pub fn of<T>(result: &Result<T, Error>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(e) => e.status(),
        }
    }
}

/// Everything known about a flash instance that doesn't change after configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashInfo {
    pub name: String,
    pub geometry: FlashGeometry,
    pub layout: BlockLayout,

    /// Erase counts above this are treated as corrupt
    pub max_erase_count: u32,
}

/// Calls `block_erased_verify` in whichever shape the driver asked for
#[derive(Debug, Copy, Clone)]
struct EraseVerifier(VerifyShape);

impl EraseVerifier {
    fn call<D: FlashDriver>(
        self,
        driver: &mut D,
        geometry: &FlashGeometry,
        block: u32,
    ) -> DriverResult<()> {
        let instance = match self.0 {
            VerifyShape::WithInstance => Some(geometry),
            VerifyShape::IndexOnly => None,
        };
        driver.block_erased_verify(instance, block)
    }
}

/// Collects what's needed to bring up a [NorFlash]
pub struct FlashBuilder<D, G = NoGuard, E = LogEscalation> {
    name: String,
    driver: D,
    guard: G,
    escalation: E,
    max_erase_count: u32,
}

impl<D: FlashDriver> FlashBuilder<D> {
    pub fn new(name: impl Into<String>, driver: D) -> Self {
        Self {
            name: name.into(),
            driver,
            guard: NoGuard,
            escalation: LogEscalation,
            max_erase_count: DEFAULT_MAX_ERASE_COUNT,
        }
    }
}

impl<D, G, E> FlashBuilder<D, G, E>
where
    D: FlashDriver,
    G: ExclusiveAccess,
    E: Escalation,
{
    /// Use `guard` around each block's physical write sequence
    pub fn guard<G2: ExclusiveAccess>(self, guard: G2) -> FlashBuilder<D, G2, E> {
        let Self {
            name,
            driver,
            escalation,
            max_erase_count,
            ..
        } = self;
        FlashBuilder {
            name,
            driver,
            guard,
            escalation,
            max_erase_count,
        }
    }

    /// Send unrecoverable driver failures to `escalation`
    pub fn escalation<E2: Escalation>(self, escalation: E2) -> FlashBuilder<D, G, E2> {
        let Self {
            name,
            driver,
            guard,
            max_erase_count,
            ..
        } = self;
        FlashBuilder {
            name,
            driver,
            guard,
            escalation,
            max_erase_count,
        }
    }

    /// Set the largest erase count considered plausible, up to [ERASE_COUNT_MAX].
    ///
    /// A header whose count is above this is classified as corrupt. A partially programmed header
    /// whose count happens to fall under it can't be told apart from a real one, so raising this
    /// far beyond the part's endurance weakens recovery.
    pub fn max_erase_count(mut self, max_erase_count: u32) -> Self {
        self.max_erase_count = max_erase_count.min(ERASE_COUNT_MAX);
        self
    }

    /// Initialize the driver and check that its geometry and buffers are usable
    pub fn configure(self) -> Result<NorFlash<D, G, E>, Error> {
        let Self {
            name,
            mut driver,
            guard,
            escalation,
            max_erase_count,
        } = self;

        let DriverInfo {
            geometry,
            direct_read,
            sector_buffer,
            verify_shape,
        } = driver.initialize().map_err(Error::Initialize)?;

        let layout = BlockLayout::new(&geometry)?;
        let metadata_words = layout.metadata_words() as usize;
        let staging = match sector_buffer {
            Some(buffer) if buffer.len() >= metadata_words => buffer,
            _ if !direct_read => return Err(Error::NoMemory),
            _ => vec![0; metadata_words].into_boxed_slice(),
        };

        log::info!(
            "{name}: {} blocks, {} sectors of {} words each",
            geometry.total_blocks,
            layout.sectors_per_block,
            geometry.sector_words
        );

        Ok(NorFlash {
            info: FlashInfo {
                name,
                geometry,
                layout,
                max_erase_count,
            },
            driver,
            guard,
            escalation,
            verifier: EraseVerifier(verify_shape),
            staging,
            ebt: None,
            stats: None,
        })
    }

    /// Configure, then bring every block to a formatted, erased state
    pub fn format(self) -> Result<NorFlash<D, G, E>, Error> {
        let mut flash = self.configure()?;
        flash.format()?;
        Ok(flash)
    }

    /// Configure, then recover the state of a previously formatted device
    pub fn open(self) -> Result<NorFlash<D, G, E>, Error> {
        let mut flash = self.configure()?;
        flash.open()?;
        Ok(flash)
    }
}

/// A configured flash device
pub struct NorFlash<D, G = NoGuard, E = LogEscalation> {
    info: FlashInfo,
    driver: D,
    guard: G,
    escalation: E,
    verifier: EraseVerifier,
    staging: Box<[u32]>,

    /// Populated by `open`; `stats` doubles as the "already open" marker
    ebt: Option<Ebt>,
    stats: Option<SectorStats>,
}

impl<D, G, E> NorFlash<D, G, E>
where
    D: FlashDriver,
    G: ExclusiveAccess,
    E: Escalation,
{
    pub fn info(&self) -> &FlashInfo {
        &self.info
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn is_open(&self) -> bool {
        self.stats.is_some()
    }

    /// Aggregates gathered by the last successful `open`
    pub fn stats(&self) -> Option<&SectorStats> {
        self.stats.as_ref()
    }

    /// Per-block state as of the last successful `open`, repairs included
    pub fn block_table(&self) -> Option<&[BlockState]> {
        self.ebt.as_deref()
    }

    /// Close the instance, handing the driver back
    pub fn close(self) -> D {
        log::debug!("{}: closed", self.info.name);
        self.driver
    }

    /// Borrow the pieces one block operation needs, separately from the guard
    fn split(&mut self) -> (FlashIo<'_, D, E>, &G) {
        let Self {
            info,
            driver,
            guard,
            escalation,
            verifier,
            staging,
            ..
        } = self;

        let io = FlashIo {
            info: &*info,
            driver,
            escalation,
            verifier: *verifier,
            staging: &mut staging[..],
        };
        (io, &*guard)
    }
}

/// Driver access for one operation; every failure is escalated before being returned
struct FlashIo<'a, D, E> {
    info: &'a FlashInfo,
    driver: &'a mut D,
    escalation: &'a mut E,
    verifier: EraseVerifier,
    staging: &'a mut [u32],
}

impl<D: FlashDriver, E: Escalation> FlashIo<'_, D, E> {
    fn fail(&mut self, operation: Operation, block: u32, status: DriverStatus) -> Error {
        let fault = Fault {
            operation,
            block,
            status,
        };
        self.escalation.escalate(self.info, &fault);
        fault.into()
    }

    fn block_address(&self, block: u32, offset: u32) -> u32 {
        self.info.geometry.block_address(block) + offset
    }

    /// Read the header, bitmap and mapping entries of `block` into the staging buffer
    fn read_metadata(&mut self, block: u32) -> Result<&[u32], Error> {
        let len = self.info.layout.metadata_words() as usize;
        let address = self.block_address(block, 0);
        if let Err(status) = self.driver.read(address, &mut self.staging[..len]) {
            return Err(self.fail(Operation::Read, block, status));
        }
        Ok(&self.staging[..len])
    }

    fn write_word(&mut self, block: u32, offset: u32, word: u32) -> Result<(), Error> {
        let address = self.block_address(block, offset);
        self.driver
            .write(address, &[word])
            .map_err(|status| self.fail(Operation::Write, block, status))
    }

    fn erase(&mut self, block: u32, erase_count_hint: u32) -> Result<(), Error> {
        self.driver
            .block_erase(block, erase_count_hint)
            .map_err(|status| self.fail(Operation::Erase, block, status))
    }

    /// Ask whether `block` is erased, taking any failure as "no". Only for callers that erase
    /// and verify again when the answer is negative.
    fn is_erased(&mut self, block: u32) -> bool {
        self.verifier
            .call(&mut *self.driver, &self.info.geometry, block)
            .is_ok()
    }

    /// Ask whether `block` is erased; a negative answer is not a failure, but anything else
    /// the driver reports is
    fn check_erased(&mut self, block: u32) -> Result<bool, Error> {
        match self
            .verifier
            .call(&mut *self.driver, &self.info.geometry, block)
        {
            Ok(()) => Ok(true),
            Err(DriverStatus::NOT_ERASED) => Ok(false),
            Err(status) => Err(self.fail(Operation::EraseVerify, block, status)),
        }
    }

    /// Require that `block` is erased
    fn verify_erased(&mut self, block: u32) -> Result<(), Error> {
        self.verifier
            .call(&mut *self.driver, &self.info.geometry, block)
            .map_err(|status| self.fail(Operation::EraseVerify, block, status))
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::driver::SimNor;

    /// 4 blocks of 64 words, 16-word sectors: 3 sectors per block
    pub const TEST_GEOMETRY: FlashGeometry = FlashGeometry {
        base_address: 0,
        total_blocks: 4,
        words_per_block: 64,
        sector_words: 16,
    };

    #[test]
    fn test_configure() -> anyhow::Result<()> {
        let mut sim = SimNor::new(TEST_GEOMETRY);
        let flash = FlashBuilder::new("nor0", &mut sim)
            .max_erase_count(1000)
            .configure()?;

        assert_eq!(flash.info().name, "nor0");
        assert_eq!(flash.info().layout.sectors_per_block, 3);
        assert_eq!(flash.info().max_erase_count, 1000);
        assert!(!flash.is_open());
        assert!(flash.stats().is_none());
        drop(flash);

        let flash = FlashBuilder::new("nor0", &mut sim).configure()?;
        assert_eq!(flash.info().max_erase_count, DEFAULT_MAX_ERASE_COUNT);
        drop(flash);

        let flash = FlashBuilder::new("nor0", &mut sim)
            .max_erase_count(u32::MAX)
            .configure()?;
        assert_eq!(flash.info().max_erase_count, ERASE_COUNT_MAX);

        Ok(())
    }

    #[test]
    fn test_no_memory() {
        let mut sim = SimNor::new(TEST_GEOMETRY)
            .without_direct_read()
            .without_sector_buffer();

        let result = FlashBuilder::new("nor0", &mut sim).format();
        assert!(matches!(result, Err(Error::NoMemory)));
        assert_eq!(Status::of(&result), Status::NoMemory);

        // Nothing was touched
        assert_eq!(sim.write_count(), 0);
        assert_eq!(sim.erase_count(), 0);
    }

    #[test]
    fn test_staging_buffer() -> anyhow::Result<()> {
        // Direct reads but no buffer: the instance allocates its own
        let mut sim = SimNor::new(TEST_GEOMETRY).without_sector_buffer();
        FlashBuilder::new("nor0", &mut sim).format()?;

        // Buffered reads through the driver's buffer
        let mut sim = SimNor::new(TEST_GEOMETRY).without_direct_read();
        let result = FlashBuilder::new("nor0", &mut sim).format();
        assert_eq!(Status::of(&result), Status::Success);

        Ok(())
    }

    #[test]
    fn test_bad_geometry() {
        let mut sim = SimNor::new(FlashGeometry {
            sector_words: 64,
            ..TEST_GEOMETRY
        });

        let result = FlashBuilder::new("nor0", &mut sim).configure();
        assert!(matches!(result, Err(Error::Geometry(_))));
        assert_eq!(Status::of(&result), Status::Error);
    }
}
