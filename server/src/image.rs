//! Positioned block I/O against the backing image file.
//!
//! Callers address whole blocks; any short or failed transfer is a
//! host I/O error and surfaces as such. Nothing here interprets block
//! contents.

use std::{
    fs::File,
    io::{self, Read as _, Seek as _, SeekFrom, Write as _},
    path::Path,
};

use dataview::{Pod, PodMethods as _};
use mfs_fs_types::{BlockNo, FS_BLOCK_SIZE};

pub struct DiskImage {
    file: File,
}

impl DiskImage {
    /// Opens (creating if missing) the backing file read-write. The
    /// handle is kept open for the server's lifetime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self { file })
    }

    /// Creates the backing file for a fresh image, discarding any
    /// previous contents.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self { file })
    }

    /// A zero-length backing file has no file system in it yet.
    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.file.metadata()?.len() == 0)
    }

    pub fn read_block<T>(&mut self, bn: BlockNo, data: &mut T) -> io::Result<()>
    where
        T: Pod + ?Sized,
    {
        let data = data.as_bytes_mut();
        assert_eq!(data.len(), FS_BLOCK_SIZE);
        self.file.seek(SeekFrom::Start(Self::offset(bn)))?;
        self.file.read_exact(data)?;
        Ok(())
    }

    pub fn write_block<T>(&mut self, bn: BlockNo, data: &T) -> io::Result<()>
    where
        T: Pod + ?Sized,
    {
        let data = data.as_bytes();
        assert_eq!(data.len(), FS_BLOCK_SIZE);
        self.file.seek(SeekFrom::Start(Self::offset(bn)))?;
        self.file.write_all(data)?;
        Ok(())
    }

    /// Flushes all written blocks to stable storage.
    pub fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn offset(bn: BlockNo) -> u64 {
        u64::from(bn.value()) * FS_BLOCK_SIZE as u64
    }
}
