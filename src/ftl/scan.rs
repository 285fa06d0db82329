//! This module contains code to read block metadata and determine each block's state.

use super::codec::{BitmapLayout, BlockHeader, BlockLayout, SectorEntry};
use super::{Error, Escalation, ExclusiveAccess, FlashIo, NorFlash};
use crate::driver::{FlashDriver, ERASED_WORD};

/// How the sectors of a coherent block are being used
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct SectorUsage {
    pub free: u32,
    pub mapped: u32,
    pub obsolete: u32,

    /// How many of the `mapped` sectors had a replacement copy started; see
    /// [SectorEntry::Superseding]
    pub superseding: u32,
}

/// Why a block's metadata can't be trusted
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Incoherence {
    /// The header word was never programmed: an erase or format was interrupted
    Unprogrammed,

    /// The erase count is beyond anything this device could have reached
    EraseCountOverflow(u32),

    /// Still flagged as freshly erased, yet sectors have been allocated
    StaleErasedFlag(u32),

    /// A mapping entry exists for a sector the bitmap still shows as free
    UnallocatedMapping { erase_count: u32, sector: u32 },
}

impl Incoherence {
    /// The erase count recorded in the header, if it can still be believed
    pub fn erase_count(&self) -> Option<u32> {
        match *self {
            Self::Unprogrammed | Self::EraseCountOverflow(_) => None,
            Self::StaleErasedFlag(erase_count) => Some(erase_count),
            Self::UnallocatedMapping { erase_count, .. } => Some(erase_count),
        }
    }
}

/// These are the states that a given block may be detected in
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum BlockState {
    /// Formatted and not yet used since its last erase; every sector is free
    Erased(u32),

    /// In normal use
    InUse {
        erase_count: u32,
        usage: SectorUsage,
    },

    /// Must be re-formatted before any of it can be used
    Incoherent(Incoherence),
}

impl BlockState {
    /// Classify a block from its metadata words (header, bitmap, mapping entries).
    pub fn classify(metadata: &[u32], layout: &BlockLayout, max_erase_count: u32) -> Self {
        let header_word = metadata[0];
        if header_word == ERASED_WORD {
            return Self::Incoherent(Incoherence::Unprogrammed);
        }

        let header = BlockHeader::decode(header_word);
        if header.erase_count > max_erase_count {
            return Self::Incoherent(Incoherence::EraseCountOverflow(header.erase_count));
        }

        let bitmap = &metadata[layout.bitmap_offset as usize..layout.mapping_offset as usize];
        let mapping = &metadata[layout.mapping_offset as usize..layout.metadata_words() as usize];

        let mut usage = SectorUsage::default();
        for (sector, &entry) in (0..layout.sectors_per_block).zip(mapping) {
            let entry = SectorEntry::decode(entry);
            match (BitmapLayout::is_free(bitmap, sector), entry) {
                (true, SectorEntry::Free) => usage.free += 1,

                // Sector logic allocates in the bitmap before writing the mapping entry, so this
                // can't be the product of an interruption
                (true, _) => {
                    return Self::Incoherent(Incoherence::UnallocatedMapping {
                        erase_count: header.erase_count,
                        sector,
                    })
                }

                (false, SectorEntry::Mapped(_)) => usage.mapped += 1,
                (false, SectorEntry::Superseding(_)) => {
                    usage.mapped += 1;
                    usage.superseding += 1;
                }

                // Allocated but never mapped means the write was interrupted; either way the
                // sector is only good for reclaiming
                (false, SectorEntry::Obsolete | SectorEntry::Free) => usage.obsolete += 1,
            }
        }

        match (header.erased, usage.free == layout.sectors_per_block) {
            (true, true) => Self::Erased(header.erase_count),
            (true, false) => Self::Incoherent(Incoherence::StaleErasedFlag(header.erase_count)),
            (false, _) => Self::InUse {
                erase_count: header.erase_count,
                usage,
            },
        }
    }

    pub fn is_coherent(&self) -> bool {
        !matches!(self, Self::Incoherent(_))
    }

    /// The erase count recorded for this block, if there's one to believe
    pub fn erase_count(&self) -> Option<u32> {
        match self {
            Self::Erased(erase_count) => Some(*erase_count),
            Self::InUse { erase_count, .. } => Some(*erase_count),
            Self::Incoherent(why) => why.erase_count(),
        }
    }

    /// Sector usage, counting only what is safe to use; incoherent blocks contribute nothing
    pub fn usage(&self, layout: &BlockLayout) -> SectorUsage {
        match self {
            Self::Erased(_) => SectorUsage {
                free: layout.sectors_per_block,
                ..Default::default()
            },
            Self::InUse { usage, .. } => *usage,
            Self::Incoherent(_) => SectorUsage::default(),
        }
    }
}

/// The (E)rase(b)lock (t)able: the state of every block, indexed by block number.
pub type Ebt = Box<[BlockState]>;

impl<D: FlashDriver, E: Escalation> FlashIo<'_, D, E> {
    /// Read a block's metadata and classify it
    pub(super) fn scan_block(&mut self, block: u32) -> Result<BlockState, Error> {
        let layout = self.info.layout;
        let max_erase_count = self.info.max_erase_count;
        let metadata = self.read_metadata(block)?;
        Ok(BlockState::classify(metadata, &layout, max_erase_count))
    }
}

impl<D, G, E> NorFlash<D, G, E>
where
    D: FlashDriver,
    G: ExclusiveAccess,
    E: Escalation,
{
    /// Read the metadata of every block and classify it, without writing anything.
    pub fn scan(&mut self) -> Result<Ebt, Error> {
        let block_count = self.info.geometry.total_blocks;
        let rpt = howudoin::new()
            .label("Scanning blocks")
            .set_len(u64::from(block_count));

        let (mut io, _) = self.split();

        // Grr, try_collect() isn't stable yet, so:
        let mut ebt = Vec::with_capacity(block_count as usize);
        for block in 0..block_count {
            ebt.push(io.scan_block(block)?);
            rpt.inc();
        }

        rpt.close();

        Ok(ebt.into())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::driver::{FlashDriver, FlashGeometry, SimNor};
    use crate::ftl::codec::{SectorEntry, BLOCK_ERASED};
    use crate::ftl::test::TEST_GEOMETRY;
    use crate::ftl::FlashBuilder;

    /// 40 sectors per block, so the bitmap spans two words
    const WIDE_GEOMETRY: FlashGeometry = FlashGeometry {
        base_address: 0,
        total_blocks: 2,
        words_per_block: 41 * 64,
        sector_words: 64,
    };

    fn layout(geometry: &FlashGeometry) -> BlockLayout {
        BlockLayout::new(geometry).unwrap()
    }

    /// Metadata of a freshly formatted block
    fn formatted(layout: &BlockLayout, erase_count: u32) -> Vec<u32> {
        let mut words = vec![ERASED_WORD; layout.metadata_words() as usize];
        words[layout.last_bitmap_offset() as usize] = layout.bitmap.last_word_mask;
        words[0] = BlockHeader::default()
            .erase_count(erase_count)
            .erased(true)
            .encode();
        words
    }

    /// Allocate `sector` the way sector logic does: clear the erased flag, the bitmap bit, and
    /// (optionally) write the mapping entry
    fn allocate(layout: &BlockLayout, words: &mut [u32], sector: u32, entry: Option<SectorEntry>) {
        words[0] &= !BLOCK_ERASED;
        words[(layout.bitmap_offset + sector / 32) as usize] &= !(1 << (sector % 32));
        if let Some(entry) = entry {
            words[(layout.mapping_offset + sector) as usize] &= entry.encode();
        }
    }

    #[test]
    fn test_classify_erased() {
        let layout = layout(&TEST_GEOMETRY);
        let words = formatted(&layout, 5);
        assert_eq!(
            BlockState::classify(&words, &layout, u32::MAX),
            BlockState::Erased(5)
        );
        assert_eq!(
            BlockState::Erased(5).usage(&layout),
            SectorUsage {
                free: 3,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_classify_in_use() {
        let layout = layout(&WIDE_GEOMETRY);
        let mut words = formatted(&layout, 9);

        allocate(&layout, &mut words, 0, Some(SectorEntry::Mapped(100)));
        allocate(&layout, &mut words, 1, Some(SectorEntry::Mapped(101)));
        allocate(&layout, &mut words, 33, Some(SectorEntry::Mapped(102)));
        allocate(&layout, &mut words, 2, Some(SectorEntry::Superseding(103)));
        allocate(&layout, &mut words, 1, Some(SectorEntry::Obsolete));
        // Interrupted between bitmap and mapping writes
        allocate(&layout, &mut words, 34, None);

        assert_eq!(
            BlockState::classify(&words, &layout, u32::MAX),
            BlockState::InUse {
                erase_count: 9,
                usage: SectorUsage {
                    free: 35,
                    mapped: 3,
                    obsolete: 2,
                    superseding: 1,
                },
            }
        );
    }

    #[test]
    fn test_classify_flag_cleared_before_first_allocation() {
        let layout = layout(&TEST_GEOMETRY);
        let mut words = formatted(&layout, 2);
        words[0] &= !BLOCK_ERASED;

        assert_eq!(
            BlockState::classify(&words, &layout, u32::MAX),
            BlockState::InUse {
                erase_count: 2,
                usage: SectorUsage {
                    free: 3,
                    ..Default::default()
                },
            }
        );
    }

    #[test]
    fn test_classify_incoherent() {
        use Incoherence::*;

        let layout = layout(&TEST_GEOMETRY);

        // Never programmed, even if the bitmap was
        let mut words = formatted(&layout, 0);
        words[0] = ERASED_WORD;
        assert_eq!(
            BlockState::classify(&words, &layout, u32::MAX),
            BlockState::Incoherent(Unprogrammed)
        );

        let words = formatted(&layout, 5000);
        assert_eq!(
            BlockState::classify(&words, &layout, 4999),
            BlockState::Incoherent(EraseCountOverflow(5000))
        );

        // A sector allocated without clearing the erased flag
        let mut words = formatted(&layout, 3);
        words[layout.bitmap_offset as usize] &= !1;
        assert_eq!(
            BlockState::classify(&words, &layout, u32::MAX),
            BlockState::Incoherent(StaleErasedFlag(3))
        );

        // A mapping entry with the bitmap still showing the sector free
        let mut words = formatted(&layout, 4);
        words[0] &= !BLOCK_ERASED;
        words[layout.mapping_offset as usize + 2] = SectorEntry::Mapped(1).encode();
        let state = BlockState::classify(&words, &layout, u32::MAX);
        assert_eq!(
            state,
            BlockState::Incoherent(UnallocatedMapping {
                erase_count: 4,
                sector: 2
            })
        );
        assert_eq!(state.erase_count(), Some(4));
        assert_eq!(state.usage(&layout), SectorUsage::default());
        assert!(!state.is_coherent());
    }

    #[test]
    fn test_scan() -> anyhow::Result<()> {
        let mut sim = SimNor::new(TEST_GEOMETRY);

        // On a blank device, every header is unprogrammed
        let mut flash = FlashBuilder::new("nor0", &mut sim).configure()?;
        let blocks = flash.scan()?;
        assert_eq!(blocks.len(), TEST_GEOMETRY.total_blocks as usize);
        assert!(blocks
            .iter()
            .all(|&x| x == BlockState::Incoherent(Incoherence::Unprogrammed)));
        drop(flash);

        // Hand-format block 1 and start using block 2
        let layout = layout(&TEST_GEOMETRY);
        let block1 = TEST_GEOMETRY.block_address(1);
        sim.write(block1 + 1, &[layout.bitmap.last_word_mask])?;
        sim.write(block1, &[BLOCK_ERASED | 6])?;

        let block2 = TEST_GEOMETRY.block_address(2);
        sim.write(block2 + 1, &[layout.bitmap.last_word_mask & !1])?;
        sim.write(block2 + 2, &[SectorEntry::Mapped(17).encode()])?;
        sim.write(block2, &[8])?;

        let mut flash = FlashBuilder::new("nor0", &mut sim).configure()?;
        let blocks = flash.scan()?;
        assert_eq!(blocks[0], BlockState::Incoherent(Incoherence::Unprogrammed));
        assert_eq!(blocks[1], BlockState::Erased(6));
        assert_eq!(
            blocks[2],
            BlockState::InUse {
                erase_count: 8,
                usage: SectorUsage {
                    free: 2,
                    mapped: 1,
                    ..Default::default()
                },
            }
        );

        // Scanning never writes
        assert_eq!(flash.driver().write_count(), 5);

        Ok(())
    }
}
