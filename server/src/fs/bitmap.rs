//! In-memory cache of one on-disk allocation bitmap region.

use std::io;

use dataview::PodMethods as _;
use mfs_fs_types::{BITS_PER_BLOCK, BlockNo, BmapBlock};

use crate::image::DiskImage;

/// A bitmap region held resident. Mutations touch the cache; callers
/// persist with [`Bitmap::write_back`] before the reply goes out.
pub(crate) struct Bitmap {
    start: BlockNo,
    nbits: usize,
    blocks: Vec<BmapBlock>,
}

impl Bitmap {
    pub(crate) fn new_zeroed(start: BlockNo, len: usize, nbits: usize) -> Self {
        let blocks = (0..len).map(|_| BmapBlock::zeroed()).collect();
        Self {
            start,
            nbits,
            blocks,
        }
    }

    pub(crate) fn load(
        img: &mut DiskImage,
        start: BlockNo,
        len: usize,
        nbits: usize,
    ) -> io::Result<Self> {
        let mut bmap = Self::new_zeroed(start, len, nbits);
        for (i, block) in bmap.blocks.iter_mut().enumerate() {
            img.read_block(BlockNo::new(start.value() + i as u32), block)?;
        }
        Ok(bmap)
    }

    pub(crate) fn is_allocated(&self, n: usize) -> bool {
        assert!(n < self.nbits);
        self.blocks[n / BITS_PER_BLOCK].is_allocated(n % BITS_PER_BLOCK)
    }

    pub(crate) fn allocate(&mut self, n: usize) {
        assert!(n < self.nbits);
        self.blocks[n / BITS_PER_BLOCK].allocate(n % BITS_PER_BLOCK);
    }

    pub(crate) fn free(&mut self, n: usize) {
        assert!(self.is_allocated(n), "freeing free unit {n}");
        self.blocks[n / BITS_PER_BLOCK].free(n % BITS_PER_BLOCK);
    }

    /// Lowest clear bit, if any.
    pub(crate) fn first_free(&self) -> Option<usize> {
        (0..self.nbits).find(|&n| !self.is_allocated(n))
    }

    pub(crate) fn write_back(&self, img: &mut DiskImage) -> io::Result<()> {
        for (i, block) in self.blocks.iter().enumerate() {
            img.write_block(BlockNo::new(self.start.value() + i as u32), block)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn count_allocated(&self) -> usize {
        (0..self.nbits).filter(|&n| self.is_allocated(n)).count()
    }
}
