//! Extent chains: walking them block by block and writing them out.

pub use self::{
    iterator::AllocatedExtentIterator,
    populator::{NodePopulator, containers_needed},
};
use crate::{
    error::{FsError, IoDataIntegritySnafu},
    node::{Extent, NodeFinder},
};

mod iterator;
mod populator;

/// A contiguous piece of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRun {
    /// Offset of the run inside the file, in blocks.
    pub file_block: u64,
    /// Block-pool index of the first block; see
    /// [`Filesystem::data_block`](crate::Filesystem::data_block).
    pub dev_block: u64,
    pub block_count: u64,
}

/// Hands out the blocks of an extent chain in runs of bounded length.
pub struct BlockIterator<'a, F: ?Sized> {
    extents: AllocatedExtentIterator<'a, F>,
    current: Option<Extent>,
    offset: u64,
    file_block: u64,
}

impl<'a, F> BlockIterator<'a, F>
where
    F: NodeFinder + ?Sized,
{
    #[must_use]
    pub fn new(extents: AllocatedExtentIterator<'a, F>) -> Self {
        Self {
            extents,
            current: None,
            offset: 0,
            file_block: 0,
        }
    }

    /// `true` once every block has been handed out.
    #[must_use]
    pub fn done(&self) -> bool {
        let partial = self
            .current
            .is_some_and(|extent| self.offset < u64::from(extent.length()));
        !partial && self.extents.done()
    }

    /// Blocks handed out so far.
    #[must_use]
    pub fn block_index(&self) -> u64 {
        self.file_block
    }

    /// Returns the next run of at most `max_length` blocks, or `None` at the
    /// end of the chain.
    ///
    /// # Panics
    ///
    /// Panics if `max_length` is zero.
    pub fn next_run(&mut self, max_length: u64) -> Result<Option<BlockRun>, FsError> {
        assert!(max_length > 0, "run length must be positive");
        let extent = loop {
            match self.current {
                Some(extent) if self.offset < u64::from(extent.length()) => break extent,
                _ => match self.extents.next().transpose()? {
                    Some(extent) => {
                        self.current = Some(extent);
                        self.offset = 0;
                    }
                    None => return Ok(None),
                },
            }
        };
        let block_count = u64::min(u64::from(extent.length()) - self.offset, max_length);
        let run = BlockRun {
            file_block: self.file_block,
            dev_block: extent.start() + self.offset,
            block_count,
        };
        self.offset += block_count;
        self.file_block += block_count;
        Ok(Some(run))
    }
}

/// Feeds `block_count` blocks of the chain to `stream` as contiguous runs.
///
/// Fails with `IoDataIntegrity` if the chain holds fewer blocks.
pub fn stream_blocks<F, S>(
    iter: &mut BlockIterator<'_, F>,
    block_count: u64,
    mut stream: S,
) -> Result<(), FsError>
where
    F: NodeFinder + ?Sized,
    S: FnMut(BlockRun) -> Result<(), FsError>,
{
    let mut remaining = block_count;
    while remaining > 0 {
        let Some(run) = iter.next_run(remaining)? else {
            return IoDataIntegritySnafu {
                node: iter.extents.node_index(),
                reason: "extent chain ends early",
            }
            .fail();
        };
        stream(run)?;
        remaining -= run.block_count;
    }
    Ok(())
}
