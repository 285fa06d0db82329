//! This module implements the formatting logic, which is also used to repair single blocks.

use super::codec::BlockHeader;
use super::scan::BlockState;
use super::{Error, Escalation, ExclusiveAccess, FlashIo, NorFlash};
use crate::driver::FlashDriver;

/// These are the actions that may be taken on each block to bring it to a formatted, erased
/// state; this type implements the "command pattern"
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub(super) enum FormatAction {
    /// Do nothing
    Ignore,

    /// Write the bitmap mask and header; only valid for blocks that verify as erased
    Write(BlockHeader),

    /// Erase the block (passing `hint` to the driver), verify it, then write as above
    Erase { header: BlockHeader, hint: u32 },
}

impl FormatAction {
    /// Run the action on the specified block. The caller holds exclusive access.
    pub(super) fn execute<D, E>(self, io: &mut FlashIo<'_, D, E>, block: u32) -> Result<(), Error>
    where
        D: FlashDriver,
        E: Escalation,
    {
        let header = match self {
            Self::Ignore => return Ok(()),
            Self::Write(header) => header,
            Self::Erase { header, hint } => {
                io.erase(block, hint)?;

                // An erase that doesn't stick is as fatal as one that reports failure
                io.verify_erased(block)?;
                header
            }
        };

        log::debug!("{}: block {block}: {self:?}", io.info.name);

        // Bitmap first: until the header is written, the block reads as unprogrammed
        let layout = io.info.layout;
        io.write_word(block, layout.last_bitmap_offset(), layout.bitmap.last_word_mask)?;
        io.write_word(block, 0, header.erased(true).encode())
    }
}

/// Determine what formatting action needs to be taken on a block in a given state
fn format_action(state: BlockState, erased: impl FnOnce() -> bool) -> FormatAction {
    use FormatAction::*;

    if let BlockState::Erased(_) = state {
        // Already formatted and unused; keep its erase count
        Ignore
    } else if erased() {
        // Fully-erased blocks just need their metadata, no erase needed first
        Write(BlockHeader::default())
    } else {
        // The previous count isn't carried over when formatting
        Erase {
            header: BlockHeader::default().erase_count(1),
            hint: 0,
        }
    }
}

/// Determine how to re-format an incoherent block so it ends up with `erase_count`
pub(super) fn repair_action(erased: bool, erase_count: u32) -> FormatAction {
    let header = BlockHeader::default().erase_count(erase_count);
    if erased {
        FormatAction::Write(header)
    } else {
        FormatAction::Erase {
            header,
            hint: erase_count,
        }
    }
}

impl<D, G, E> NorFlash<D, G, E>
where
    D: FlashDriver,
    G: ExclusiveAccess,
    E: Escalation,
{
    /// Bring every block to a formatted, erased state.
    ///
    /// Blocks that are already formatted and unused are left alone. Any driver failure is
    /// escalated and ends the operation; blocks finished before it stay formatted. The instance
    /// is no longer open afterwards.
    pub fn format(&mut self) -> Result<(), Error> {
        self.ebt = None;
        self.stats = None;

        let block_count = self.info.geometry.total_blocks;
        let rpt = howudoin::new()
            .label("Formatting blocks")
            .set_len(u64::from(block_count));

        let (mut io, guard) = self.split();
        for block in 0..block_count {
            let _held = guard.acquire();

            let state = io.scan_block(block)?;
            let action = format_action(state, || io.is_erased(block));
            action.execute(&mut io, block)?;

            rpt.inc();
        }

        rpt.close();

        log::info!("{}: formatted {block_count} blocks", self.info.name);
        Ok(())
    }
}
