use std::io;

use mfs_fs_types::InodeNo;

/// Non-fatal request failures. Every variant collapses to the wire
/// value `-1`; the distinction only reaches the server's stderr.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("inode number out of range: {0}")]
    InodeOutOfRange(i32),
    #[error("block index out of range: {0}")]
    BlockOutOfRange(i32),
    #[error("inode is free: {0}")]
    InodeFree(InodeNo),
    #[error("not a directory: {0}")]
    NotADirectory(InodeNo),
    #[error("not a regular file: {0}")]
    NotARegularFile(InodeNo),
    #[error("block not allocated: inode={0}, block={1}")]
    BlockNotAllocated(InodeNo, usize),
    #[error("file system entry not found")]
    EntryNotFound,
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(InodeNo),
    #[error("unlink of dot directories")]
    UnlinkDots,
    #[error("invalid entry name")]
    InvalidName,
    #[error("invalid file type: {0}")]
    InvalidFileType(i32),
    #[error("out of inodes")]
    OutOfInodes,
    #[error("out of data blocks")]
    OutOfDataBlocks,
    #[error("no free entry slot in directory: {0}")]
    DirectoryFull(InodeNo),
}

/// Engine-level failure: either a request error (reply `-1` and keep
/// serving) or a fatal host I/O error (abort rather than keep running
/// on possibly corrupt state).
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error("image I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("not an MFS image (magic {0:#010x})")]
    InvalidImage(u32),
}
