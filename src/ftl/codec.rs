//! This module contains the code necessary to read and write the per-block metadata words: the
//! block header, the free-sector bitmap, and the sector mapping entries.
//!
//! ```text
//! +--------+-------------+-----------------+---------------------+
//! | header | bitmap (B)  | mapping (S)     | (unused)            |   <- first `sector_words`
//! +--------+-------------+-----------------+---------------------+
//! | sector 0 ... sector S-1                                      |
//! +--------------------------------------------------------------+
//! ```

use super::Error;
use crate::driver::{FlashGeometry, ERASED_WORD};

/// Header bit that stays set until the block is first used after an erase
pub const BLOCK_ERASED: u32 = 0x8000_0000;

/// Header bits holding the erase count
pub const ERASE_COUNT_MASK: u32 = 0x7FFF_FFFF;

/// The largest erase count that can be recorded
pub const ERASE_COUNT_MAX: u32 = ERASE_COUNT_MASK;

/// Mapping entry bit; cleared when the sector becomes obsolete
pub const SECTOR_VALID: u32 = 0x8000_0000;

/// Mapping entry bit; cleared while a newer copy of the sector is being written
pub const SECTOR_SUPERSEDED: u32 = 0x4000_0000;

/// Mapping entry bit; cleared once the logical sector number has been written
pub const SECTOR_MAPPING_NOT_VALID: u32 = 0x2000_0000;

pub const LOGICAL_SECTOR_MASK: u32 = 0x1FFF_FFFF;

/// The decoded block header word
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct BlockHeader {
    pub erase_count: u32,
    pub erased: bool,
}

impl BlockHeader {
    /// Change the erase count of this header
    pub fn erase_count(mut self, erase_count: u32) -> Self {
        self.erase_count = erase_count;
        self
    }

    /// Change the erased flag of this header
    pub fn erased(mut self, erased: bool) -> Self {
        self.erased = erased;
        self
    }

    pub fn decode(word: u32) -> Self {
        Self {
            erase_count: word & ERASE_COUNT_MASK,
            erased: word & BLOCK_ERASED != 0,
        }
    }

    /// Counts beyond [ERASE_COUNT_MASK] roll over.
    pub fn encode(self) -> u32 {
        let flag = if self.erased { BLOCK_ERASED } else { 0 };
        (self.erase_count & ERASE_COUNT_MASK) | flag
    }
}

/// Size of the free-sector bitmap for a given number of sectors
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct BitmapLayout {
    pub words: u32,

    /// The value programmed into the last bitmap word: one bit per sector that word covers
    pub last_word_mask: u32,
}

impl BitmapLayout {
    pub fn for_sectors(sectors: u32) -> Self {
        let words = sectors.div_ceil(32);
        let last_word_mask = match sectors % 32 {
            0 => ERASED_WORD,
            n => (1 << n) - 1,
        };

        Self {
            words,
            last_word_mask,
        }
    }

    /// Is `sector` still marked free in `bitmap`?
    pub fn is_free(bitmap: &[u32], sector: u32) -> bool {
        bitmap[(sector / 32) as usize] & (1 << (sector % 32)) != 0
    }
}

/// State of a physical sector, as recorded by its mapping entry
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum SectorEntry {
    /// Never written since the last erase
    Free,

    /// Holds the current copy of a logical sector
    Mapped(u32),

    /// Holds a copy of a logical sector that a newer copy was being written to replace; it is
    /// current only if that newer copy never completed
    Superseding(u32),

    /// Superseded, or its mapping write never completed; reclaimable on the next erase
    Obsolete,
}

impl SectorEntry {
    pub fn decode(word: u32) -> Self {
        if word == ERASED_WORD {
            Self::Free
        } else if word & SECTOR_VALID == 0 || word & SECTOR_MAPPING_NOT_VALID != 0 {
            Self::Obsolete
        } else if word & SECTOR_SUPERSEDED == 0 {
            Self::Superseding(word & LOGICAL_SECTOR_MASK)
        } else {
            Self::Mapped(word & LOGICAL_SECTOR_MASK)
        }
    }

    pub fn encode(self) -> u32 {
        match self {
            Self::Free => ERASED_WORD,
            Self::Mapped(logical) => {
                SECTOR_VALID | SECTOR_SUPERSEDED | (logical & LOGICAL_SECTOR_MASK)
            }
            Self::Superseding(logical) => SECTOR_VALID | (logical & LOGICAL_SECTOR_MASK),
            Self::Obsolete => 0,
        }
    }
}

/// Where everything lives within a block, derived from the device geometry
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct BlockLayout {
    pub sectors_per_block: u32,
    pub bitmap: BitmapLayout,

    /// Word offsets from the start of the block
    pub bitmap_offset: u32,
    pub mapping_offset: u32,
    pub data_offset: u32,
}

impl BlockLayout {
    /// The first sector-sized region of each block is reserved for metadata
    pub fn new(geometry: &FlashGeometry) -> Result<Self, Error> {
        if geometry.total_blocks == 0 {
            return Err(Error::Geometry("no blocks".into()));
        }
        if geometry.end_address().is_none() {
            return Err(Error::Geometry(format!(
                "{} blocks of {} words don't fit in the word address space",
                geometry.total_blocks, geometry.words_per_block
            )));
        }
        if geometry.sector_words == 0 {
            return Err(Error::Geometry("zero-sized sectors".into()));
        }

        let sectors_per_block =
            (geometry.words_per_block / geometry.sector_words).saturating_sub(1);
        if sectors_per_block == 0 {
            return Err(Error::Geometry(format!(
                "{} words per block leaves no room for {}-word sectors",
                geometry.words_per_block, geometry.sector_words
            )));
        }

        let bitmap = BitmapLayout::for_sectors(sectors_per_block);
        let layout = Self {
            sectors_per_block,
            bitmap,
            bitmap_offset: 1,
            mapping_offset: 1 + bitmap.words,
            data_offset: geometry.sector_words,
        };

        if layout.metadata_words() > geometry.sector_words {
            return Err(Error::Geometry(format!(
                "metadata for {sectors_per_block} sectors needs {} words, only {} reserved",
                layout.metadata_words(),
                geometry.sector_words
            )));
        }

        Ok(layout)
    }

    /// Header, bitmap and mapping entries
    pub fn metadata_words(&self) -> u32 {
        self.mapping_offset + self.sectors_per_block
    }

    /// Word offset of the last bitmap word
    pub fn last_bitmap_offset(&self) -> u32 {
        self.bitmap_offset + self.bitmap.words - 1
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_header_word() {
        assert_eq!(BlockHeader::default().erased(true).encode(), BLOCK_ERASED);
        assert_eq!(BlockHeader::default().erase_count(1).erased(true).encode(), 0x8000_0001);
        assert_eq!(
            BlockHeader::decode(0x0000_002A),
            BlockHeader {
                erase_count: 42,
                erased: false
            }
        );

        // An unprogrammed header reads as the largest count with the flag set
        assert_eq!(
            BlockHeader::decode(ERASED_WORD),
            BlockHeader::default().erase_count(ERASE_COUNT_MAX).erased(true)
        );
    }

    #[test]
    fn test_header_rollover() {
        for erased in [false, true] {
            let at_max = BlockHeader::default().erase_count(ERASE_COUNT_MAX).erased(erased);
            assert_eq!(BlockHeader::decode(at_max.encode()), at_max);

            let past_max = at_max.erase_count(ERASE_COUNT_MAX + 1);
            assert_eq!(BlockHeader::decode(past_max.encode()), at_max.erase_count(0));
        }
    }

    proptest! {
        #[test]
        fn header_round_trip(erase_count in 0..=ERASE_COUNT_MAX, erased: bool) {
            let header = BlockHeader { erase_count, erased };
            prop_assert_eq!(BlockHeader::decode(header.encode()), header);
        }
    }

    #[test]
    fn test_bitmap_sizing() {
        for (sectors, words, last_word_mask) in [
            (1, 1, 0x0000_0001),
            (31, 1, 0x7FFF_FFFF),
            (32, 1, 0xFFFF_FFFF),
            (33, 2, 0x0000_0001),
            (63, 2, 0x7FFF_FFFF),
            (64, 2, 0xFFFF_FFFF),
        ] {
            assert_eq!(
                BitmapLayout::for_sectors(sectors),
                BitmapLayout {
                    words,
                    last_word_mask
                },
                "{sectors} sectors"
            );
        }
    }

    #[test]
    fn test_bitmap_bits() {
        let bitmap = [0xFFFF_FFFE, 0x0000_0002];
        assert!(!BitmapLayout::is_free(&bitmap, 0));
        assert!(BitmapLayout::is_free(&bitmap, 31));
        assert!(!BitmapLayout::is_free(&bitmap, 32));
        assert!(BitmapLayout::is_free(&bitmap, 33));
    }

    #[test]
    fn test_sector_entry() {
        assert_eq!(SectorEntry::decode(ERASED_WORD), SectorEntry::Free);
        assert_eq!(SectorEntry::decode(0), SectorEntry::Obsolete);
        assert_eq!(
            SectorEntry::decode(SectorEntry::Mapped(1234).encode()),
            SectorEntry::Mapped(1234)
        );

        // A newer copy being written doesn't invalidate this one by itself
        let superseding = SectorEntry::Mapped(7).encode() & !SECTOR_SUPERSEDED;
        assert_eq!(SectorEntry::decode(superseding), SectorEntry::Superseding(7));
        assert_eq!(SectorEntry::Superseding(7).encode(), superseding);

        // Only partially programmed: the logical sector number can't be trusted
        let torn = SECTOR_VALID | SECTOR_SUPERSEDED | SECTOR_MAPPING_NOT_VALID | 7;
        assert_eq!(SectorEntry::decode(torn), SectorEntry::Obsolete);

        let obsoleted = SectorEntry::Mapped(7).encode() & !SECTOR_VALID;
        assert_eq!(SectorEntry::decode(obsoleted), SectorEntry::Obsolete);
    }

    #[test]
    fn test_block_layout() -> anyhow::Result<()> {
        let geometry = FlashGeometry {
            base_address: 0,
            total_blocks: 4,
            words_per_block: 64,
            sector_words: 16,
        };
        let layout = BlockLayout::new(&geometry)?;
        assert_eq!(layout.sectors_per_block, 3);
        assert_eq!(layout.bitmap, BitmapLayout::for_sectors(3));
        assert_eq!(layout.mapping_offset, 2);
        assert_eq!(layout.metadata_words(), 5);
        assert_eq!(layout.last_bitmap_offset(), 1);
        assert_eq!(layout.data_offset, 16);

        // 512-byte sectors in a 32 KiB block
        let layout = BlockLayout::new(&FlashGeometry {
            words_per_block: 8192,
            sector_words: 128,
            ..geometry
        })?;
        assert_eq!(layout.sectors_per_block, 63);
        assert_eq!(layout.bitmap.words, 2);
        assert_eq!(layout.metadata_words(), 1 + 2 + 63);

        Ok(())
    }

    #[test]
    fn test_block_layout_rejects() {
        let geometry = FlashGeometry {
            base_address: 0,
            total_blocks: 4,
            words_per_block: 64,
            sector_words: 16,
        };

        for bad in [
            FlashGeometry {
                total_blocks: 0,
                ..geometry
            },
            FlashGeometry {
                sector_words: 0,
                ..geometry
            },
            FlashGeometry {
                sector_words: 32,
                words_per_block: 32,
                ..geometry
            },
            // 127 sectors need 1 + 4 + 127 metadata words, more than one 128-word sector
            FlashGeometry {
                words_per_block: 16384,
                sector_words: 128,
                ..geometry
            },
            // Ends past the last word address
            FlashGeometry {
                base_address: 0x100,
                total_blocks: 0x10000,
                words_per_block: 0x10000,
                ..geometry
            },
            // 7 sectors need 1 + 1 + 7 metadata words, more than one 8-word sector
            FlashGeometry {
                sector_words: 8,
                ..geometry
            },
        ] {
            assert!(
                matches!(BlockLayout::new(&bad), Err(Error::Geometry(_))),
                "{bad:?}"
            );
        }
    }
}
