//! The file-system engine: bootstrap, allocation, and the request
//! operations.
//!
//! The superblock and inode table are small and hot, so both are kept
//! resident along with the allocation bitmaps; directory data blocks
//! are read from the image per operation. Mutating operations write
//! every block they touch before returning; the dispatcher issues the
//! single `sync` that makes the mutation durable before the reply
//! datagram leaves.

use std::{io, path::Path};

use dataview::PodMethods as _;
use mfs_fs_types::{
    BlockNo, DEFAULT_NUM_DATA, DEFAULT_NUM_INODES, DIR_ENTRY_PER_BLOCK, DirBlock, DirEntry,
    FS_BLOCK_SIZE, INODE_PER_BLOCK, Inode, InodeBlock, InodeNo, Layout, MAX_NAME_LEN,
    NUM_DIRECT_REFS, SuperBlock, T_DIR, T_FILE,
};

use self::bitmap::Bitmap;
use crate::{
    error::{FsError, ServerError},
    image::DiskImage,
};

mod bitmap;

/// What STAT reports about an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeStat {
    /// On-disk type code ([`T_DIR`] or [`T_FILE`]).
    pub ty: i32,
    pub size: u32,
    /// Raw first direct pointer, `-1` if unallocated.
    pub addr0: i32,
}

pub struct FileSystem {
    img: DiskImage,
    sb: SuperBlock,
    inodes: Vec<Inode>,
    inode_bmap: Bitmap,
    data_bmap: Bitmap,
}

impl FileSystem {
    /// Opens the image at `path`, creating a fresh file system with
    /// the default geometry if the backing file is empty or missing.
    pub fn open(path: &Path) -> Result<Self, ServerError> {
        let img = DiskImage::open(path)?;
        if img.is_empty()? {
            Self::initialize(
                img,
                Layout::new(DEFAULT_NUM_INODES as u32, DEFAULT_NUM_DATA as u32),
            )
        } else {
            Self::load(img)
        }
    }

    /// Creates a fresh file system at `path` with an explicit
    /// geometry, discarding whatever the file held before.
    pub fn format(path: &Path, num_inodes: u32, num_data: u32) -> Result<Self, ServerError> {
        assert!(num_inodes > 0 && num_data > 0);
        let img = DiskImage::create(path)?;
        Self::initialize(img, Layout::new(num_inodes, num_data))
    }

    fn initialize(mut img: DiskImage, layout: Layout) -> Result<Self, ServerError> {
        let zero = [0_u8; FS_BLOCK_SIZE];
        for bn in 0..layout.total_blocks() {
            img.write_block(BlockNo::new(bn), &zero)?;
        }

        let sb = SuperBlock::from_layout(&layout);
        let mut buf = [0_u8; FS_BLOCK_SIZE];
        buf[..size_of::<SuperBlock>()].copy_from_slice(sb.as_bytes());
        img.write_block(SuperBlock::SUPER_BLOCK_NO, &buf)?;

        // inode 0 and the root directory block are reserved
        let mut inode_bmap = Bitmap::new_zeroed(
            sb.inode_bmap_block(0),
            sb.inode_bmap_len() as usize,
            layout.num_inodes as usize,
        );
        inode_bmap.allocate(InodeNo::ROOT.as_index());
        let mut data_bmap = Bitmap::new_zeroed(
            sb.data_bmap_block(0),
            sb.data_bmap_len() as usize,
            layout.num_data as usize,
        );
        data_bmap.allocate(0);

        let mut inodes = vec![Inode::zeroed(); layout.num_inodes as usize];
        let root = &mut inodes[InodeNo::ROOT.as_index()];
        root.allocate(T_DIR);
        root.set_size((2 * size_of::<DirEntry>()) as u32);
        root.set_addr(0, Some(sb.data_block(0)));

        let mut fs = Self {
            img,
            sb,
            inodes,
            inode_bmap,
            data_bmap,
        };
        let root_block = fs.sb.data_block(0);
        fs.write_fresh_dir_block(root_block, InodeNo::ROOT, InodeNo::ROOT)?;
        fs.flush_inode_block(InodeNo::ROOT)?;
        fs.flush_bitmaps()?;
        fs.img.sync()?;
        Ok(fs)
    }

    fn load(mut img: DiskImage) -> Result<Self, ServerError> {
        let mut buf = [0_u8; FS_BLOCK_SIZE];
        img.read_block(SuperBlock::SUPER_BLOCK_NO, &mut buf)?;
        let mut sb = SuperBlock::zeroed();
        sb.as_bytes_mut()
            .copy_from_slice(&buf[..size_of::<SuperBlock>()]);
        if sb.magic() != SuperBlock::FS_MAGIC {
            return Err(ServerError::InvalidImage(sb.magic()));
        }

        let num_inodes = sb.num_inodes() as usize;
        let inode_start = sb.inode_block(InodeNo::ROOT);
        let mut inodes = Vec::with_capacity(num_inodes);
        for i in 0..sb.inode_region_len() {
            let mut blk = InodeBlock::zeroed();
            img.read_block(BlockNo::new(inode_start.value() + i), &mut blk)?;
            for inode in blk.inodes() {
                if inodes.len() < num_inodes {
                    inodes.push(*inode);
                }
            }
        }

        let inode_bmap = Bitmap::load(
            &mut img,
            sb.inode_bmap_block(0),
            sb.inode_bmap_len() as usize,
            num_inodes,
        )?;
        let data_bmap = Bitmap::load(
            &mut img,
            sb.data_bmap_block(0),
            sb.data_bmap_len() as usize,
            sb.num_data() as usize,
        )?;

        Ok(Self {
            img,
            sb,
            inodes,
            inode_bmap,
            data_bmap,
        })
    }

    #[must_use]
    pub fn superblock(&self) -> &SuperBlock {
        &self.sb
    }

    /// Flushes all written blocks to stable storage.
    pub fn sync(&mut self) -> io::Result<()> {
        self.img.sync()
    }

    /// Resolves `name` under the directory `pinum`.
    pub fn lookup(&mut self, pinum: i32, name: &str) -> Result<InodeNo, ServerError> {
        let dino = self.dir_inode(pinum)?;
        match self.dir_find(dino, name.as_bytes())? {
            Some((target, _, _)) => Ok(target),
            None => Err(FsError::EntryNotFound.into()),
        }
    }

    /// Reports type, size and first direct pointer of a live inode.
    pub fn stat(&self, inum: i32) -> Result<InodeStat, FsError> {
        let ino = self.inode_no(inum)?;
        let inode = self.live_inode(ino)?;
        Ok(InodeStat {
            ty: inode.ty(),
            size: inode.size(),
            addr0: inode.raw_addr0(),
        })
    }

    /// Creates a new entry `name` of type `ty` under `pinum`. Creating
    /// a name that already exists is a success and a no-op, so a
    /// retried CREAT cannot allocate twice.
    pub fn creat(&mut self, pinum: i32, ty: i32, name: &str) -> Result<(), ServerError> {
        let dino = self.dir_inode(pinum)?;
        if ty != T_DIR && ty != T_FILE {
            return Err(FsError::InvalidFileType(ty).into());
        }
        let name = name.as_bytes();
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(FsError::InvalidName.into());
        }

        if self.dir_find(dino, name)?.is_some() {
            return Ok(());
        }

        let child = self.alloc_inode(ty)?;
        if ty == T_DIR {
            let bn = match self.alloc_data_block() {
                Ok(bn) => bn,
                Err(err) => {
                    self.free_inode(child);
                    return Err(err);
                }
            };
            self.write_fresh_dir_block(bn, child, dino)?;
            let inode = self.inode_mut(child);
            inode.set_addr(0, Some(bn));
            inode.set_size((2 * size_of::<DirEntry>()) as u32);
        }

        if let Err(err) = self.dir_insert(dino, name, child) {
            self.release_inode_blocks(child);
            self.free_inode(child);
            return Err(err);
        }

        self.flush_inode_block(child)?;
        self.flush_inode_block(dino)?;
        self.flush_bitmaps()?;
        Ok(())
    }

    /// Removes the entry `name` under `pinum` and frees its inode and
    /// data blocks. Unlinking a name that does not exist is a success
    /// and a no-op. A directory must be empty to be unlinked.
    pub fn unlink(&mut self, pinum: i32, name: &str) -> Result<(), ServerError> {
        let dino = self.dir_inode(pinum)?;
        let Some((target, dslot, slot)) = self.dir_find(dino, name.as_bytes())? else {
            return Ok(());
        };
        if name == "." || name == ".." {
            return Err(FsError::UnlinkDots.into());
        }

        if self.inode(target).is_dir() && !self.dir_is_empty(target)? {
            return Err(FsError::DirectoryNotEmpty(target).into());
        }

        self.release_inode_blocks(target);
        self.free_inode(target);

        // free the entry slot; the name bytes may stay as debris
        let bn = self
            .inode(dino)
            .addr(dslot)
            .unwrap_or_else(|| unreachable!("entry found in unallocated block"));
        let mut blk = DirBlock::zeroed();
        self.img.read_block(bn, &mut blk)?;
        blk.entry_mut(slot).set_ino(None);
        self.img.write_block(bn, &blk)?;

        self.flush_inode_block(target)?;
        self.flush_bitmaps()?;
        Ok(())
    }

    /// Writes one whole block at index `block` of a regular file,
    /// allocating the slot on first touch. The size never shrinks:
    /// it becomes at least `(block + 1) * FS_BLOCK_SIZE`.
    pub fn write(
        &mut self,
        inum: i32,
        data: &[u8; FS_BLOCK_SIZE],
        block: i32,
    ) -> Result<(), ServerError> {
        let ino = self.inode_no(inum)?;
        if !self.live_inode(ino)?.is_file() {
            return Err(FsError::NotARegularFile(ino).into());
        }
        let bidx = Self::block_index(block)?;

        let bn = match self.inode(ino).addr(bidx) {
            Some(bn) => bn,
            None => {
                let bn = self.alloc_data_block()?;
                self.inode_mut(ino).set_addr(bidx, Some(bn));
                bn
            }
        };
        self.img.write_block(bn, data)?;

        let new_size = ((bidx + 1) * FS_BLOCK_SIZE) as u32;
        let inode = self.inode_mut(ino);
        if new_size > inode.size() {
            inode.set_size(new_size);
        }

        self.flush_inode_block(ino)?;
        self.flush_bitmaps()?;
        Ok(())
    }

    /// Reads one whole allocated block of a live inode. For a
    /// directory this returns the raw directory block, which is how
    /// clients enumerate entries.
    pub fn read(&mut self, inum: i32, block: i32) -> Result<Box<[u8; FS_BLOCK_SIZE]>, ServerError> {
        let ino = self.inode_no(inum)?;
        self.live_inode(ino)?;
        let bidx = Self::block_index(block)?;
        let bn = self
            .inode(ino)
            .addr(bidx)
            .ok_or(FsError::BlockNotAllocated(ino, bidx))?;
        let mut data = Box::new([0_u8; FS_BLOCK_SIZE]);
        self.img.read_block(bn, &mut *data)?;
        Ok(data)
    }

    fn inode(&self, ino: InodeNo) -> &Inode {
        &self.inodes[ino.as_index()]
    }

    fn inode_mut(&mut self, ino: InodeNo) -> &mut Inode {
        &mut self.inodes[ino.as_index()]
    }

    fn inode_no(&self, raw: i32) -> Result<InodeNo, FsError> {
        if raw < 0 || raw as u32 >= self.sb.num_inodes() {
            return Err(FsError::InodeOutOfRange(raw));
        }
        Ok(InodeNo::new(raw as u32))
    }

    fn live_inode(&self, ino: InodeNo) -> Result<&Inode, FsError> {
        let inode = self.inode(ino);
        if inode.is_free() {
            return Err(FsError::InodeFree(ino));
        }
        Ok(inode)
    }

    fn dir_inode(&self, raw: i32) -> Result<InodeNo, FsError> {
        let ino = self.inode_no(raw)?;
        if !self.live_inode(ino)?.is_dir() {
            return Err(FsError::NotADirectory(ino));
        }
        Ok(ino)
    }

    fn block_index(raw: i32) -> Result<usize, FsError> {
        if raw < 0 || raw as usize >= NUM_DIRECT_REFS {
            return Err(FsError::BlockOutOfRange(raw));
        }
        Ok(raw as usize)
    }

    /// Allocates the lowest free inode as type `ty`.
    fn alloc_inode(&mut self, ty: i32) -> Result<InodeNo, FsError> {
        let idx = self
            .inodes
            .iter()
            .position(Inode::is_free)
            .ok_or(FsError::OutOfInodes)?;
        self.inodes[idx].allocate(ty);
        self.inode_bmap.allocate(idx);
        Ok(InodeNo::new(idx as u32))
    }

    fn free_inode(&mut self, ino: InodeNo) {
        self.inode_mut(ino).clear();
        self.inode_bmap.free(ino.as_index());
    }

    /// Allocates the lowest free data block, zeroed on disk.
    fn alloc_data_block(&mut self) -> Result<BlockNo, ServerError> {
        let k = self
            .data_bmap
            .first_free()
            .ok_or(FsError::OutOfDataBlocks)?;
        self.data_bmap.allocate(k);
        let bn = self.sb.data_block(k);
        self.img.write_block(bn, &[0_u8; FS_BLOCK_SIZE])?;
        Ok(bn)
    }

    fn free_data_block(&mut self, bn: BlockNo) {
        let Some(k) = self.sb.data_index(bn) else {
            panic!("block {bn} outside the data region");
        };
        self.data_bmap.free(k);
    }

    /// Releases every allocated data block of `ino` (in memory; the
    /// bitmap is persisted by the caller).
    fn release_inode_blocks(&mut self, ino: InodeNo) {
        for i in 0..NUM_DIRECT_REFS {
            if let Some(bn) = self.inode(ino).addr(i) {
                self.free_data_block(bn);
                self.inode_mut(ino).set_addr(i, None);
            }
        }
    }

    /// Scans the directory for `name`. Returns the entry's target and
    /// its position as (direct slot, entry slot).
    fn dir_find(
        &mut self,
        dino: InodeNo,
        name: &[u8],
    ) -> Result<Option<(InodeNo, usize, usize)>, ServerError> {
        for dslot in 0..NUM_DIRECT_REFS {
            let Some(bn) = self.inode(dino).addr(dslot) else {
                continue;
            };
            let mut blk = DirBlock::zeroed();
            self.img.read_block(bn, &mut blk)?;
            for slot in 0..DIR_ENTRY_PER_BLOCK {
                let de = blk.entry(slot);
                if let Some(target) = de.ino() {
                    if de.is_same_name(name) {
                        return Ok(Some((target, dslot, slot)));
                    }
                }
            }
        }
        Ok(None)
    }

    /// True if the directory holds nothing but `.` and `..`.
    fn dir_is_empty(&mut self, dino: InodeNo) -> Result<bool, ServerError> {
        for dslot in 0..NUM_DIRECT_REFS {
            let Some(bn) = self.inode(dino).addr(dslot) else {
                continue;
            };
            let mut blk = DirBlock::zeroed();
            self.img.read_block(bn, &mut blk)?;
            for slot in 0..DIR_ENTRY_PER_BLOCK {
                let de = blk.entry(slot);
                if de.ino().is_some() && !de.is_same_name(b".") && !de.is_same_name(b"..") {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Inserts an entry into the first free slot of an allocated
    /// directory block, attaching a fresh block if every allocated one
    /// is full.
    fn dir_insert(&mut self, dino: InodeNo, name: &[u8], child: InodeNo) -> Result<(), ServerError> {
        for dslot in 0..NUM_DIRECT_REFS {
            let Some(bn) = self.inode(dino).addr(dslot) else {
                continue;
            };
            let mut blk = DirBlock::zeroed();
            self.img.read_block(bn, &mut blk)?;
            if let Some(slot) = (0..DIR_ENTRY_PER_BLOCK).find(|&s| blk.entry(s).ino().is_none()) {
                let de = blk.entry_mut(slot);
                de.set_ino(Some(child));
                de.set_name(name);
                self.img.write_block(bn, &blk)?;
                self.bump_dir_size(dino, dslot, slot);
                return Ok(());
            }
        }

        // every allocated block is full: attach one more
        let Some(dslot) = (0..NUM_DIRECT_REFS).find(|&d| self.inode(dino).addr(d).is_none()) else {
            return Err(FsError::DirectoryFull(dino).into());
        };
        let bn = self.alloc_data_block()?;
        let mut blk = Self::free_dir_block();
        let de = blk.entry_mut(0);
        de.set_ino(Some(child));
        de.set_name(name);
        self.img.write_block(bn, &blk)?;
        self.inode_mut(dino).set_addr(dslot, Some(bn));
        self.bump_dir_size(dino, dslot, 0);
        Ok(())
    }

    /// Grows the directory size to cover the slot just written.
    /// Directory blocks fill lowest direct slot first, so the direct
    /// slot index doubles as the block's position in the directory.
    fn bump_dir_size(&mut self, dino: InodeNo, dslot: usize, slot: usize) {
        let extent = (dslot * FS_BLOCK_SIZE + (slot + 1) * size_of::<DirEntry>()) as u32;
        let inode = self.inode_mut(dino);
        if extent > inode.size() {
            inode.set_size(extent);
        }
    }

    /// A directory block whose every slot is free.
    fn free_dir_block() -> DirBlock {
        let mut blk = DirBlock::zeroed();
        for slot in 0..DIR_ENTRY_PER_BLOCK {
            blk.entry_mut(slot).set_ino(None);
        }
        blk
    }

    /// Writes a new directory block containing `.` and `..`.
    fn write_fresh_dir_block(
        &mut self,
        bn: BlockNo,
        child: InodeNo,
        parent: InodeNo,
    ) -> io::Result<()> {
        let mut blk = Self::free_dir_block();
        let dot = blk.entry_mut(0);
        dot.set_ino(Some(child));
        dot.set_name(b".");
        let dotdot = blk.entry_mut(1);
        dotdot.set_ino(Some(parent));
        dotdot.set_name(b"..");
        self.img.write_block(bn, &blk)
    }

    /// Writes back the inode table block containing `ino` from the
    /// resident table.
    fn flush_inode_block(&mut self, ino: InodeNo) -> io::Result<()> {
        let bn = self.sb.inode_block(ino);
        let base = (ino.as_index() / INODE_PER_BLOCK) * INODE_PER_BLOCK;
        let end = usize::min(base + INODE_PER_BLOCK, self.inodes.len());
        let mut blk = InodeBlock::zeroed();
        for (slot, inode) in blk.inodes_mut().iter_mut().zip(&self.inodes[base..end]) {
            *slot = *inode;
        }
        self.img.write_block(bn, &blk)
    }

    fn flush_bitmaps(&mut self) -> io::Result<()> {
        self.inode_bmap.write_back(&mut self.img)?;
        self.data_bmap.write_back(&mut self.img)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, path::PathBuf};

    use rand::{Rng as _, SeedableRng as _, rngs::StdRng, seq::SliceRandom as _};
    use tempfile::TempDir;

    use super::*;

    const DIRENT_SIZE: u32 = size_of::<DirEntry>() as u32;

    fn scratch() -> (TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fs.img");
        (dir, path)
    }

    fn fresh() -> (TempDir, FileSystem) {
        let (dir, path) = scratch();
        let fs = FileSystem::open(&path).unwrap();
        (dir, fs)
    }

    /// Asserts the §3-style consistency between inode table, bitmaps
    /// and directory contents.
    fn check_invariants(fs: &mut FileSystem) {
        let num_inodes = fs.sb.num_inodes() as usize;
        let mut used_blocks = HashSet::new();

        for idx in 0..num_inodes {
            let ino = InodeNo::new(idx as u32);
            let inode = fs.inode(ino);
            assert_eq!(
                fs.inode_bmap.is_allocated(idx),
                !inode.is_free(),
                "inode bitmap out of sync at {idx}"
            );
            if inode.is_free() {
                continue;
            }

            let mut max_extent = 0_u32;
            for i in 0..NUM_DIRECT_REFS {
                let Some(bn) = inode.addr(i) else { continue };
                let k = fs
                    .sb
                    .data_index(bn)
                    .unwrap_or_else(|| panic!("inode {ino} points outside the data region"));
                assert!(
                    fs.data_bmap.is_allocated(k),
                    "data bitmap clear for live pointer {bn} of inode {ino}"
                );
                assert!(used_blocks.insert(bn), "block {bn} shared by two inodes");
                max_extent = max_extent.max(((i + 1) * FS_BLOCK_SIZE) as u32);
            }

            if inode.is_file() {
                assert_eq!(inode.size(), max_extent, "file size vs allocated blocks");
            }
        }

        // directory soundness
        for idx in 0..num_inodes {
            let ino = InodeNo::new(idx as u32);
            if !fs.inode(ino).is_dir() {
                continue;
            }
            let mut names = HashSet::new();
            let mut saw_dot = false;
            let mut saw_dotdot = false;
            for dslot in 0..NUM_DIRECT_REFS {
                let Some(bn) = fs.inode(ino).addr(dslot) else {
                    continue;
                };
                let mut blk = DirBlock::zeroed();
                fs.img.read_block(bn, &mut blk).unwrap();
                for slot in 0..DIR_ENTRY_PER_BLOCK {
                    let de = blk.entry(slot);
                    let Some(target) = de.ino() else { continue };
                    assert!(
                        !fs.inode(target).is_free(),
                        "directory {ino} references free inode {target}"
                    );
                    assert!(
                        names.insert(de.name().to_vec()),
                        "duplicate name in directory {ino}"
                    );
                    if de.is_same_name(b".") {
                        assert_eq!(target, ino, "`.` of {ino} does not point to itself");
                        saw_dot = true;
                    }
                    if de.is_same_name(b"..") {
                        saw_dotdot = true;
                    }
                }
            }
            assert!(saw_dot && saw_dotdot, "directory {ino} lost `.` or `..`");
            assert!(fs.inode(ino).size() >= 2 * DIRENT_SIZE);
        }
    }

    #[test]
    fn initialize_creates_root() {
        let (_dir, mut fs) = fresh();
        let stat = fs.stat(0).unwrap();
        assert_eq!(stat.ty, T_DIR);
        assert_eq!(stat.size, 2 * DIRENT_SIZE);
        assert_eq!(stat.addr0, fs.sb.data_start().value() as i32);
        assert_eq!(fs.inode_bmap.count_allocated(), 1);
        assert_eq!(fs.data_bmap.count_allocated(), 1);
        check_invariants(&mut fs);
    }

    #[test]
    fn lookup_creat_stat_on_fresh_image() {
        let (_dir, mut fs) = fresh();
        assert!(matches!(
            fs.lookup(0, "x"),
            Err(ServerError::Fs(FsError::EntryNotFound))
        ));
        fs.creat(0, T_DIR, "x").unwrap();
        let ino = fs.lookup(0, "x").unwrap();
        assert_eq!(ino, InodeNo::new(1));
        let stat = fs.stat(1).unwrap();
        assert_eq!(stat.ty, T_DIR);
        assert_eq!(stat.size, 2 * DIRENT_SIZE);
        // the second data block, right after the root directory's
        assert_eq!(stat.addr0, fs.sb.data_start().value() as i32 + 1);
        check_invariants(&mut fs);
    }

    #[test]
    fn write_read_round_trip() {
        let (_dir, mut fs) = fresh();
        fs.creat(0, T_FILE, "f").unwrap();
        let ino = fs.lookup(0, "f").unwrap();

        let mut buf = [0_u8; FS_BLOCK_SIZE];
        buf[..5].copy_from_slice(b"hello");
        fs.write(ino.value() as i32, &buf, 0).unwrap();

        let got = fs.read(ino.value() as i32, 0).unwrap();
        assert_eq!(&got[..], &buf[..]);
        assert_eq!(fs.stat(ino.value() as i32).unwrap().size, 4096);
        check_invariants(&mut fs);
    }

    #[test]
    fn write_size_is_monotone() {
        let (_dir, mut fs) = fresh();
        fs.creat(0, T_FILE, "f").unwrap();
        let ino = fs.lookup(0, "f").unwrap().value() as i32;

        let buf = [7_u8; FS_BLOCK_SIZE];
        fs.write(ino, &buf, 3).unwrap();
        assert_eq!(fs.stat(ino).unwrap().size, 4 * 4096);
        // writing an earlier block never shrinks the file
        fs.write(ino, &buf, 0).unwrap();
        assert_eq!(fs.stat(ino).unwrap().size, 4 * 4096);
        // rewriting the same block is idempotent
        fs.write(ino, &buf, 3).unwrap();
        assert_eq!(fs.stat(ino).unwrap().size, 4 * 4096);
        check_invariants(&mut fs);
    }

    #[test]
    fn unlink_refuses_nonempty_directory() {
        let (_dir, mut fs) = fresh();
        fs.creat(0, T_DIR, "d").unwrap();
        let d = fs.lookup(0, "d").unwrap().value() as i32;
        fs.creat(d, T_FILE, "g").unwrap();

        assert!(matches!(
            fs.unlink(0, "d"),
            Err(ServerError::Fs(FsError::DirectoryNotEmpty(_)))
        ));
        fs.unlink(d, "g").unwrap();
        fs.unlink(0, "d").unwrap();
        assert!(fs.lookup(0, "d").is_err());
        // everything is back to just the root
        assert_eq!(fs.inode_bmap.count_allocated(), 1);
        assert_eq!(fs.data_bmap.count_allocated(), 1);
        check_invariants(&mut fs);
    }

    #[test]
    fn unlink_missing_name_is_a_noop_success() {
        let (_dir, mut fs) = fresh();
        fs.unlink(0, "ghost").unwrap();
        fs.unlink(0, "ghost").unwrap();
        check_invariants(&mut fs);
    }

    #[test]
    fn unlink_dots_is_rejected() {
        let (_dir, mut fs) = fresh();
        assert!(matches!(
            fs.unlink(0, "."),
            Err(ServerError::Fs(FsError::UnlinkDots))
        ));
        assert!(matches!(
            fs.unlink(0, ".."),
            Err(ServerError::Fs(FsError::UnlinkDots))
        ));
        check_invariants(&mut fs);
    }

    #[test]
    fn creat_is_idempotent() {
        let (_dir, mut fs) = fresh();
        fs.creat(0, T_FILE, "h").unwrap();
        fs.creat(0, T_FILE, "h").unwrap();
        // only one inode was consumed
        assert_eq!(fs.inode_bmap.count_allocated(), 2);
        assert_eq!(fs.lookup(0, "h").unwrap(), InodeNo::new(1));
        check_invariants(&mut fs);
    }

    #[test]
    fn invalid_arguments_are_rejected() {
        let (_dir, mut fs) = fresh();
        fs.creat(0, T_FILE, "f").unwrap();
        let f = fs.lookup(0, "f").unwrap().value() as i32;
        let buf = [0_u8; FS_BLOCK_SIZE];

        // block index past the direct pointers
        assert!(matches!(
            fs.write(f, &buf, NUM_DIRECT_REFS as i32),
            Err(ServerError::Fs(FsError::BlockOutOfRange(_)))
        ));
        assert!(matches!(
            fs.write(f, &buf, -1),
            Err(ServerError::Fs(FsError::BlockOutOfRange(-1)))
        ));
        // inum out of range
        assert!(matches!(fs.stat(-1), Err(FsError::InodeOutOfRange(-1))));
        assert!(matches!(
            fs.stat(DEFAULT_NUM_INODES as i32),
            Err(FsError::InodeOutOfRange(_))
        ));
        // free inode
        assert!(matches!(fs.stat(9), Err(FsError::InodeFree(_))));
        // lookup under a non-directory
        assert!(matches!(
            fs.lookup(f, "x"),
            Err(ServerError::Fs(FsError::NotADirectory(_)))
        ));
        // write to a directory
        assert!(matches!(
            fs.write(0, &buf, 0),
            Err(ServerError::Fs(FsError::NotARegularFile(_)))
        ));
        // read of an unallocated block
        assert!(matches!(
            fs.read(f, 2),
            Err(ServerError::Fs(FsError::BlockNotAllocated(_, 2)))
        ));
        // creat with a bad type or name
        assert!(matches!(
            fs.creat(0, 9, "y"),
            Err(ServerError::Fs(FsError::InvalidFileType(9)))
        ));
        assert!(matches!(
            fs.creat(0, T_FILE, ""),
            Err(ServerError::Fs(FsError::InvalidName))
        ));
        let long = "n".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(
            fs.creat(0, T_FILE, &long),
            Err(ServerError::Fs(FsError::InvalidName))
        ));
        check_invariants(&mut fs);
    }

    #[test]
    fn inode_exhaustion_and_lowest_free_reuse() {
        let (_dir, mut fs) = fresh();
        for i in 0..DEFAULT_NUM_INODES - 1 {
            fs.creat(0, T_FILE, &format!("f{i}")).unwrap();
        }
        assert!(matches!(
            fs.creat(0, T_FILE, "straw"),
            Err(ServerError::Fs(FsError::OutOfInodes))
        ));

        // "f10" holds inode 11; freeing it makes 11 the lowest free
        fs.unlink(0, "f10").unwrap();
        fs.creat(0, T_FILE, "reborn").unwrap();
        assert_eq!(fs.lookup(0, "reborn").unwrap(), InodeNo::new(11));
        check_invariants(&mut fs);
    }

    #[test]
    fn data_exhaustion_rolls_back_creat() {
        let (_dir, mut fs) = fresh();
        let buf = [1_u8; FS_BLOCK_SIZE];

        // burn through the data region: root uses 1 of 32 blocks
        fs.creat(0, T_FILE, "a").unwrap();
        let a = fs.lookup(0, "a").unwrap().value() as i32;
        fs.creat(0, T_FILE, "b").unwrap();
        let b = fs.lookup(0, "b").unwrap().value() as i32;
        fs.creat(0, T_FILE, "c").unwrap();
        let c = fs.lookup(0, "c").unwrap().value() as i32;
        for blk in 0..NUM_DIRECT_REFS as i32 {
            fs.write(a, &buf, blk).unwrap();
            fs.write(b, &buf, blk).unwrap();
        }
        for blk in 0..(DEFAULT_NUM_DATA - 1 - 2 * NUM_DIRECT_REFS) as i32 {
            fs.write(c, &buf, blk).unwrap();
        }
        assert_eq!(fs.data_bmap.count_allocated(), DEFAULT_NUM_DATA);

        // no block left for the new directory's `.`/`..` block
        let before = fs.inode_bmap.count_allocated();
        assert!(matches!(
            fs.creat(0, T_DIR, "d"),
            Err(ServerError::Fs(FsError::OutOfDataBlocks))
        ));
        assert_eq!(fs.inode_bmap.count_allocated(), before);

        // a write to a fresh slot also fails, and a plain file still fits
        assert!(matches!(
            fs.write(c, &buf, (DEFAULT_NUM_DATA - 2 * NUM_DIRECT_REFS) as i32),
            Err(ServerError::Fs(FsError::OutOfDataBlocks))
        ));
        fs.creat(0, T_FILE, "empty").unwrap();
        check_invariants(&mut fs);
    }

    #[test]
    fn directory_grows_into_second_block() {
        let (_dir, path) = scratch();
        let mut fs = FileSystem::format(&path, 256, 64).unwrap();

        // fill the root's first block: 2 dot entries + 126 files
        for i in 0..126 {
            fs.creat(0, T_FILE, &format!("f{i}")).unwrap();
        }
        assert_eq!(fs.stat(0).unwrap().size, 128 * DIRENT_SIZE);

        // the next entry lands in a freshly attached block
        fs.creat(0, T_FILE, "spill").unwrap();
        assert_eq!(
            fs.stat(0).unwrap().size,
            FS_BLOCK_SIZE as u32 + DIRENT_SIZE
        );
        let spill = fs.lookup(0, "spill").unwrap();
        assert_eq!(fs.stat(spill.value() as i32).unwrap().ty, T_FILE);

        // a freed slot in the first block is reused before the extent
        fs.unlink(0, "f17").unwrap();
        fs.creat(0, T_FILE, "refill").unwrap();
        assert_eq!(
            fs.stat(0).unwrap().size,
            FS_BLOCK_SIZE as u32 + DIRENT_SIZE
        );
        check_invariants(&mut fs);
    }

    #[test]
    fn reopen_preserves_state() {
        let (_dir, path) = scratch();
        let mut buf = [0_u8; FS_BLOCK_SIZE];

        {
            let mut fs = FileSystem::open(&path).unwrap();
            fs.creat(0, T_DIR, "d").unwrap();
            let d = fs.lookup(0, "d").unwrap().value() as i32;
            fs.creat(d, T_FILE, "f").unwrap();
            let f = fs.lookup(d, "f").unwrap().value() as i32;
            buf[..7].copy_from_slice(b"durable");
            fs.write(f, &buf, 2).unwrap();
            fs.sync().unwrap();
        }

        let mut fs = FileSystem::open(&path).unwrap();
        let d = fs.lookup(0, "d").unwrap().value() as i32;
        let f = fs.lookup(d, "f").unwrap().value() as i32;
        assert_eq!(fs.stat(f).unwrap().size, 3 * 4096);
        assert_eq!(&fs.read(f, 2).unwrap()[..7], b"durable");
        assert!(matches!(
            fs.read(f, 0),
            Err(ServerError::Fs(FsError::BlockNotAllocated(_, 0)))
        ));
        check_invariants(&mut fs);
    }

    #[test]
    fn opening_garbage_fails() {
        let (_dir, path) = scratch();
        std::fs::write(&path, vec![0xab_u8; 3 * FS_BLOCK_SIZE]).unwrap();
        assert!(matches!(
            FileSystem::open(&path),
            Err(ServerError::InvalidImage(_))
        ));
    }

    #[test]
    fn random_operations_preserve_invariants() {
        let (_dir, mut fs) = fresh();
        let mut rng = StdRng::seed_from_u64(0x6d66_73);
        let names = ["a", "b", "c", "d", "e", "f", "g", "h"];
        let buf = [0x42_u8; FS_BLOCK_SIZE];

        for _ in 0..300 {
            // pick a parent: the root, or some directory under it
            let mut parent = 0;
            if rng.gen_bool(0.3) {
                for n in &names {
                    if let Ok(ino) = fs.lookup(0, n) {
                        let ino = ino.value() as i32;
                        if fs.stat(ino).unwrap().ty == T_DIR {
                            parent = ino;
                            break;
                        }
                    }
                }
            }
            let name = *names.choose(&mut rng).unwrap();

            match rng.gen_range(0..4) {
                0 => {
                    let ty = if rng.gen_bool(0.5) { T_DIR } else { T_FILE };
                    let _ = fs.creat(parent, ty, name);
                }
                1 => {
                    let _ = fs.unlink(parent, name);
                }
                2 => {
                    if let Ok(ino) = fs.lookup(parent, name) {
                        let block = rng.gen_range(0..NUM_DIRECT_REFS as i32);
                        let _ = fs.write(ino.value() as i32, &buf, block);
                    }
                }
                _ => {
                    if let Ok(ino) = fs.lookup(parent, name) {
                        let block = rng.gen_range(0..NUM_DIRECT_REFS as i32);
                        let _ = fs.read(ino.value() as i32, block);
                    }
                }
            }
            check_invariants(&mut fs);
        }
    }
}
