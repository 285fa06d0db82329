//! Opening a formatted device: scan, repair, and tally.

use std::collections::BTreeSet;

use super::codec::SectorEntry;
use super::format::repair_action;
use super::scan::{BlockState, Ebt};
use super::{BlockLayout, Error, Escalation, ExclusiveAccess, NorFlash};
use crate::driver::FlashDriver;

/// Aggregates gathered while opening a device
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct SectorStats {
    pub free_sectors: u32,
    pub mapped_sectors: u32,
    pub obsolete_sectors: u32,

    /// Blocks formatted and not yet used since their last erase
    pub erased_blocks: u32,

    pub min_erase_count: u32,
    pub max_erase_count: u32,

    /// Incoherent blocks re-formatted by `open`
    pub repaired_blocks: u32,
}

impl SectorStats {
    /// Sum up the erase-block table; every entry is expected to be coherent by now
    fn tally(ebt: &[BlockState], layout: &BlockLayout) -> Self {
        let mut stats = Self {
            min_erase_count: u32::MAX,
            ..Default::default()
        };

        for state in ebt {
            let usage = state.usage(layout);
            stats.free_sectors += usage.free;
            stats.mapped_sectors += usage.mapped;
            stats.obsolete_sectors += usage.obsolete;

            if let BlockState::Erased(_) = state {
                stats.erased_blocks += 1;
            }
            if let Some(erase_count) = state.erase_count() {
                stats.min_erase_count = stats.min_erase_count.min(erase_count);
                stats.max_erase_count = stats.max_erase_count.max(erase_count);
            }
        }

        if stats.min_erase_count > stats.max_erase_count {
            stats.min_erase_count = 0;
        }

        stats
    }
}

impl<D, G, E> NorFlash<D, G, E>
where
    D: FlashDriver,
    G: ExclusiveAccess,
    E: Escalation,
{
    /// Recover the state of a previously formatted device.
    ///
    /// Every block is scanned; incoherent ones (from an interrupted erase, format or allocation,
    /// or from corruption) are re-formatted, carrying their erase count forward where it can be
    /// trusted. An old copy of a logical sector whose replacement was completed counts as
    /// obsolete. Fails with [Error::NotFormatted] or [Error::Corrupted] without writing anything
    /// if no block holds valid metadata.
    pub fn open(&mut self) -> Result<SectorStats, Error> {
        if self.is_open() {
            return Err(Error::AlreadyOpen(self.info.name.clone()));
        }

        let mut ebt = self.scan()?;
        if !ebt.iter().any(BlockState::is_coherent) {
            return Err(self.unformatted_reason()?);
        }

        let repaired_blocks = self.repair(&mut ebt)?;
        self.resolve_superseded(&mut ebt)?;

        let mut stats = SectorStats::tally(&ebt, &self.info.layout);
        stats.repaired_blocks = repaired_blocks;

        log::info!(
            "{}: opened; {} free, {} mapped, {} obsolete sectors; erase counts {}..={}",
            self.info.name,
            stats.free_sectors,
            stats.mapped_sectors,
            stats.obsolete_sectors,
            stats.min_erase_count,
            stats.max_erase_count
        );

        self.ebt = Some(ebt);
        self.stats = Some(stats);
        Ok(stats)
    }

    /// Tell a blank device apart from one holding something else entirely
    fn unformatted_reason(&mut self) -> Result<Error, Error> {
        let block_count = self.info.geometry.total_blocks;
        let (mut io, _) = self.split();
        for block in 0..block_count {
            if !io.check_erased(block)? {
                return Ok(Error::Corrupted);
            }
        }

        Ok(Error::NotFormatted)
    }

    /// Re-format every incoherent block in `ebt`, updating it; returns how many were repaired
    fn repair(&mut self, ebt: &mut Ebt) -> Result<u32, Error> {
        // Used when a block's own count is lost
        let fallback = ebt
            .iter()
            .filter_map(BlockState::erase_count)
            .max()
            .unwrap_or(0);

        let (mut io, guard) = self.split();
        let max_erase_count = io.info.max_erase_count;

        let mut repaired = 0;
        for (block, state) in (0..).zip(ebt.iter_mut()) {
            let BlockState::Incoherent(why) = *state else {
                continue;
            };

            let erase_count = why
                .erase_count()
                .map_or(fallback, |x| x.saturating_add(1).min(max_erase_count));
            log::warn!("{}: block {block} is {why:?}, repairing", io.info.name);

            let _held = guard.acquire();
            let action = repair_action(io.check_erased(block)?, erase_count);
            action.execute(&mut io, block)?;

            *state = BlockState::Erased(erase_count);
            repaired += 1;
        }

        Ok(repaired)
    }

    /// A rewrite interrupted after the new copy's mapping entry but before the old copy was
    /// obsoleted leaves two live copies. The old one is marked superseding; if a completed copy of
    /// the same logical sector exists anywhere, count the old one as obsolete in `ebt`.
    ///
    /// Returns how many copies were resolved this way.
    fn resolve_superseded(&mut self, ebt: &mut Ebt) -> Result<u32, Error> {
        let layout = self.info.layout;
        if ebt.iter().all(|x| x.usage(&layout).superseding == 0) {
            return Ok(0);
        }

        let (mut io, _) = self.split();
        let mut current = BTreeSet::new();
        let mut superseding = vec![];
        for (block, state) in (0..).zip(ebt.iter()) {
            if !matches!(state, BlockState::InUse { .. }) {
                continue;
            }

            // Coherent blocks only hold entries for allocated sectors
            let metadata = io.read_metadata(block)?;
            let mapping =
                &metadata[layout.mapping_offset as usize..layout.metadata_words() as usize];
            for &entry in mapping {
                match SectorEntry::decode(entry) {
                    SectorEntry::Mapped(logical) => {
                        current.insert(logical);
                    }
                    SectorEntry::Superseding(logical) => superseding.push((block, logical)),
                    SectorEntry::Free | SectorEntry::Obsolete => (),
                }
            }
        }

        let mut resolved = 0;
        for (block, logical) in superseding {
            if !current.contains(&logical) {
                // The replacement never completed; this is still the live copy
                continue;
            }

            if let BlockState::InUse { usage, .. } = &mut ebt[block as usize] {
                usage.mapped -= 1;
                usage.superseding -= 1;
                usage.obsolete += 1;
                resolved += 1;
            }
        }

        log::debug!("{}: {resolved} superseded sector copies", io.info.name);
        Ok(resolved)
    }
}
