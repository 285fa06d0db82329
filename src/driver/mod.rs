//! Abstractions and code to access raw, word-addressable flash

use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::str::FromStr;

use thiserror::Error;

#[cfg(target_os = "linux")]
pub mod mtd;

/// The value of a word after its block has been erased
pub const ERASED_WORD: u32 = u32::MAX;

/// Convenience methods for operating on `[u32]`s that represent flash contents
pub trait WordsUtil {
    /// Does this region contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl WordsUtil for [u32] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == ERASED_WORD)
    }
}

/// A status code reported by a driver for an operation that did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[error("driver status {0:#06x}")]
pub struct DriverStatus(pub u32);

impl DriverStatus {
    /// `block_erased_verify` found programmed words
    pub const NOT_ERASED: Self = Self(0x01);
    pub const ERASE_FAILED: Self = Self(0x02);
    pub const WRITE_FAILED: Self = Self(0x03);
    pub const READ_FAILED: Self = Self(0x04);
    pub const OUT_OF_RANGE: Self = Self(0x05);
    /// The device lost power mid-operation (simulated)
    pub const POWER_LOSS: Self = Self(0x06);
}

pub type DriverResult<T> = Result<T, DriverStatus>;

/// A pub-fields struct describing the word layout of a flash device
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FlashGeometry {
    /// Word address of the first word of block 0
    pub base_address: u32,
    pub total_blocks: u32,
    pub words_per_block: u32,
    /// Size of one sector, in words
    pub sector_words: u32,
}

impl FlashGeometry {
    /// Word address of the first word of `block`
    pub fn block_address(&self, block: u32) -> u32 {
        self.base_address + block * self.words_per_block
    }

    pub fn total_words(&self) -> usize {
        self.total_blocks as usize * self.words_per_block as usize
    }

    /// One past the last word address, if the whole device is addressable
    pub fn end_address(&self) -> Option<u32> {
        self.total_blocks
            .checked_mul(self.words_per_block)?
            .checked_add(self.base_address)
    }
}

/// Parse strings like "BLOCKSxWORDSxSECTOR"
impl FromStr for FlashGeometry {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [total_blocks, words_per_block, sector_words]: [&str; 3] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#"))?;

        let geometry = FlashGeometry {
            base_address: 0,
            total_blocks: total_blocks.parse()?,
            words_per_block: words_per_block.parse()?,
            sector_words: sector_words.parse()?,
        };
        anyhow::ensure!(
            geometry.end_address().is_some(),
            "{s} is too large to be word-addressed"
        );

        Ok(geometry)
    }
}

/// The two ways a driver may want `block_erased_verify` to be called
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum VerifyShape {
    /// The driver receives the instance geometry along with the block index
    #[default]
    WithInstance,

    /// The driver receives only the block index
    IndexOnly,
}

/// What a driver reports about itself from [FlashDriver::initialize]
#[derive(Debug)]
pub struct DriverInfo {
    pub geometry: FlashGeometry,

    /// Can flash be read without going through a RAM staging buffer?
    pub direct_read: bool,

    /// Staging buffer for metadata reads; required when `direct_read` is false
    pub sector_buffer: Option<Box<[u32]>>,

    pub verify_shape: VerifyShape,
}

/// The raw operations a flash device must provide.
///
/// All addresses are absolute word addresses. Writes can only clear bits; only
/// [FlashDriver::block_erase] sets them back to 1.
pub trait FlashDriver {
    /// Bring up the device and describe it
    fn initialize(&mut self) -> DriverResult<DriverInfo>;

    fn read(&mut self, address: u32, words: &mut [u32]) -> DriverResult<()>;

    fn write(&mut self, address: u32, words: &[u32]) -> DriverResult<()>;

    /// Erase a whole block. `erase_count_hint` is the count the caller intends to record, which
    /// some drivers use for their own bookkeeping.
    fn block_erase(&mut self, block: u32, erase_count_hint: u32) -> DriverResult<()>;

    /// Confirm that every word of `block` is erased.
    ///
    /// `instance` is `Some` only for drivers that asked for [VerifyShape::WithInstance].
    fn block_erased_verify(
        &mut self,
        instance: Option<&FlashGeometry>,
        block: u32,
    ) -> DriverResult<()>;
}

impl<T: FlashDriver + ?Sized> FlashDriver for &mut T {
    fn initialize(&mut self) -> DriverResult<DriverInfo> {
        (**self).initialize()
    }
    fn read(&mut self, address: u32, words: &mut [u32]) -> DriverResult<()> {
        (**self).read(address, words)
    }
    fn write(&mut self, address: u32, words: &[u32]) -> DriverResult<()> {
        (**self).write(address, words)
    }
    fn block_erase(&mut self, block: u32, erase_count_hint: u32) -> DriverResult<()> {
        (**self).block_erase(block, erase_count_hint)
    }
    fn block_erased_verify(
        &mut self,
        instance: Option<&FlashGeometry>,
        block: u32,
    ) -> DriverResult<()> {
        (**self).block_erased_verify(instance, block)
    }
}

/// A simulated in-memory NOR flash, for testing purposes
#[derive(Debug, Clone)]
pub struct SimNor {
    geometry: FlashGeometry,
    words: Box<[u32]>,
    verify_shape: VerifyShape,
    direct_read: bool,
    sector_buffer: bool,

    failing_erases: BTreeSet<u32>,

    /// Number of writes left before simulated power loss, if armed
    power_budget: Option<usize>,

    writes: usize,
    erases: usize,
    last_erase_hint: Option<u32>,
}

impl SimNor {
    /// Create a fully-erased SimNor with the specified geometry
    pub fn new(geometry: FlashGeometry) -> Self {
        Self {
            geometry,
            words: vec![ERASED_WORD; geometry.total_words()].into_boxed_slice(),
            verify_shape: VerifyShape::default(),
            direct_read: true,
            sector_buffer: true,
            failing_erases: BTreeSet::new(),
            power_budget: None,
            writes: 0,
            erases: 0,
            last_erase_hint: None,
        }
    }

    /// Choose how this driver wants erase verification to be called
    pub fn verify_shape(mut self, shape: VerifyShape) -> Self {
        self.verify_shape = shape;
        self
    }

    /// Report that flash cannot be read directly, so a staging buffer is needed
    pub fn without_direct_read(mut self) -> Self {
        self.direct_read = false;
        self
    }

    /// Don't hand out a staging buffer from `initialize`
    pub fn without_sector_buffer(mut self) -> Self {
        self.sector_buffer = false;
        self
    }

    pub fn geometry(&self) -> FlashGeometry {
        self.geometry
    }

    /// The whole device content
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Make every erase of `block` fail
    pub fn fail_erase(&mut self, block: u32) {
        self.failing_erases.insert(block);
    }

    /// Let `writes` more writes succeed; everything after that fails with
    /// [DriverStatus::POWER_LOSS] until [SimNor::restore_power]
    pub fn cut_power_after(&mut self, writes: usize) {
        self.power_budget = Some(writes);
    }

    pub fn restore_power(&mut self) {
        self.power_budget = None;
    }

    pub fn write_count(&self) -> usize {
        self.writes
    }

    pub fn erase_count(&self) -> usize {
        self.erases
    }

    pub fn last_erase_hint(&self) -> Option<u32> {
        self.last_erase_hint
    }

    /// Initialize the device contents from a flash image
    pub fn load<R: Read>(read: &mut R) -> anyhow::Result<Self> {
        let (geometry, words) = crate::image::read_image(read)?;
        let mut sim = Self::new(geometry);
        sim.words = words.into_boxed_slice();
        Ok(sim)
    }

    /// Write the device contents out as a flash image
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        crate::image::write_image(write, self.geometry, &self.words)
    }

    /// Translate an absolute word range into an index range of `self.words`
    fn span(&self, address: u32, len: usize) -> DriverResult<std::ops::Range<usize>> {
        let begin = address
            .checked_sub(self.geometry.base_address)
            .ok_or(DriverStatus::OUT_OF_RANGE)? as usize;
        let end = begin + len;
        if end > self.words.len() {
            return Err(DriverStatus::OUT_OF_RANGE);
        }
        Ok(begin..end)
    }

    fn block_span(
        &self,
        geometry: &FlashGeometry,
        block: u32,
    ) -> DriverResult<std::ops::Range<usize>> {
        if block >= geometry.total_blocks {
            return Err(DriverStatus::OUT_OF_RANGE);
        }
        self.span(
            geometry.block_address(block),
            geometry.words_per_block as usize,
        )
    }

    fn spend_power(&mut self) -> DriverResult<()> {
        match &mut self.power_budget {
            Some(0) => Err(DriverStatus::POWER_LOSS),
            Some(left) => {
                *left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl FlashDriver for SimNor {
    fn initialize(&mut self) -> DriverResult<DriverInfo> {
        let sector_buffer = self
            .sector_buffer
            .then(|| vec![0; self.geometry.sector_words as usize].into_boxed_slice());

        Ok(DriverInfo {
            geometry: self.geometry,
            direct_read: self.direct_read,
            sector_buffer,
            verify_shape: self.verify_shape,
        })
    }

    fn read(&mut self, address: u32, words: &mut [u32]) -> DriverResult<()> {
        let span = self.span(address, words.len())?;
        words.copy_from_slice(&self.words[span]);
        Ok(())
    }

    fn write(&mut self, address: u32, words: &[u32]) -> DriverResult<()> {
        let span = self.span(address, words.len())?;
        self.spend_power()?;
        self.writes += 1;

        // Programming can only clear bits; a word that needed a 0 -> 1 transition reads back wrong
        let target = &mut self.words[span];
        for (cell, &word) in target.iter_mut().zip(words) {
            *cell &= word;
        }
        if target[..] != words[..] {
            return Err(DriverStatus::WRITE_FAILED);
        }
        Ok(())
    }

    fn block_erase(&mut self, block: u32, erase_count_hint: u32) -> DriverResult<()> {
        let span = self.block_span(&self.geometry, block)?;
        if self.power_budget == Some(0) {
            return Err(DriverStatus::POWER_LOSS);
        }
        if self.failing_erases.contains(&block) {
            return Err(DriverStatus::ERASE_FAILED);
        }

        self.erases += 1;
        self.last_erase_hint = Some(erase_count_hint);
        self.words[span].fill(ERASED_WORD);
        Ok(())
    }

    fn block_erased_verify(
        &mut self,
        instance: Option<&FlashGeometry>,
        block: u32,
    ) -> DriverResult<()> {
        let geometry = *instance.unwrap_or(&self.geometry);
        let span = self.block_span(&geometry, block)?;
        if self.words[span].is_erased() {
            Ok(())
        } else {
            Err(DriverStatus::NOT_ERASED)
        }
    }
}

#[cfg(test)]
const TEST_GEOMETRY: FlashGeometry = FlashGeometry {
    base_address: 0x100,
    total_blocks: 4,
    words_per_block: 64,
    sector_words: 16,
};

#[test]
fn test_parse_geometry() -> anyhow::Result<()> {
    let geometry: FlashGeometry = "8x256x32".parse()?;
    assert_eq!(
        geometry,
        FlashGeometry {
            base_address: 0,
            total_blocks: 8,
            words_per_block: 256,
            sector_words: 32,
        }
    );
    assert!("8x256".parse::<FlashGeometry>().is_err());
    assert!("65536x65536x16".parse::<FlashGeometry>().is_err());
    assert!("8xbadx32".parse::<FlashGeometry>().is_err());
    Ok(())
}

#[test]
fn test_sim_bounds() {
    let mut sim = SimNor::new(TEST_GEOMETRY);
    let mut buf = [0u32; 4];
    assert!(sim.read(TEST_GEOMETRY.base_address, &mut buf).is_ok());
    assert_eq!(sim.read(0, &mut buf), Err(DriverStatus::OUT_OF_RANGE));
    assert_eq!(
        sim.read(TEST_GEOMETRY.block_address(4) - 2, &mut buf),
        Err(DriverStatus::OUT_OF_RANGE)
    );
    assert_eq!(sim.block_erase(4, 0), Err(DriverStatus::OUT_OF_RANGE));
}

#[test]
fn test_sim_program_clears_bits_only() {
    let mut sim = SimNor::new(TEST_GEOMETRY);
    let address = TEST_GEOMETRY.block_address(1) + 3;

    sim.write(address, &[0x0000_FF0F]).unwrap();
    assert_eq!(sim.write(address, &[0x0000_0F0F]), Ok(()));
    assert_eq!(
        sim.write(address, &[0xFFFF_FFFF]),
        Err(DriverStatus::WRITE_FAILED)
    );

    let mut out = [0u32];
    sim.read(address, &mut out).unwrap();
    assert_eq!(out, [0x0000_0F0F]);

    assert_eq!(
        sim.block_erased_verify(None, 1),
        Err(DriverStatus::NOT_ERASED)
    );
    assert_eq!(sim.block_erased_verify(None, 0), Ok(()));

    sim.block_erase(1, 7).unwrap();
    assert_eq!(sim.block_erased_verify(Some(&TEST_GEOMETRY), 1), Ok(()));
    assert_eq!(sim.last_erase_hint(), Some(7));
}

#[test]
fn test_sim_power_cut() {
    let mut sim = SimNor::new(TEST_GEOMETRY);
    let address = TEST_GEOMETRY.base_address;

    sim.cut_power_after(1);
    assert_eq!(sim.write(address, &[0]), Ok(()));
    assert_eq!(sim.write(address + 1, &[0]), Err(DriverStatus::POWER_LOSS));
    assert_eq!(sim.block_erase(0, 0), Err(DriverStatus::POWER_LOSS));

    sim.restore_power();
    assert_eq!(sim.write(address + 1, &[0]), Ok(()));
    assert_eq!(sim.write_count(), 2);
}

#[test]
fn test_sim_failing_erase() {
    let mut sim = SimNor::new(TEST_GEOMETRY);
    sim.fail_erase(2);
    assert_eq!(sim.block_erase(1, 0), Ok(()));
    assert_eq!(sim.block_erase(2, 0), Err(DriverStatus::ERASE_FAILED));
    assert_eq!(sim.erase_count(), 1);
}

#[test]
fn test_sim_initialize() {
    let mut sim = SimNor::new(TEST_GEOMETRY).verify_shape(VerifyShape::IndexOnly);
    let info = sim.initialize().unwrap();
    assert_eq!(info.geometry, TEST_GEOMETRY);
    assert_eq!(info.verify_shape, VerifyShape::IndexOnly);
    assert_eq!(info.sector_buffer.map(|b| b.len()), Some(16));

    let mut sim = SimNor::new(TEST_GEOMETRY).without_sector_buffer();
    assert!(sim.initialize().unwrap().sector_buffer.is_none());
}
