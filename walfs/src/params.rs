//! Filesystem-wide constants. These must match the layout written by
//! [`FileSystem::format`](crate::FileSystem::format) and the `mkfs` tool.

use core::mem::size_of;

use crate::dinode::DiskInode;

/// Magic number identifying this specific file system.
pub const FSMAGIC: u32 = 0x10203040;
/// Size of a disk block in bytes.
pub const BSIZE: usize = 1024;
/// Maximum number of blocks a single FS op may write.
pub const MAXOPBLOCKS: usize = 10;
/// Size of the buffer cache, in blocks.
pub const NBUF: usize = MAXOPBLOCKS * 3;
/// Size of the on-disk log region, in blocks (header included).
pub const LOGSIZE: usize = MAXOPBLOCKS * 3;

/// Maximum number of active inodes in the in-memory cache.
pub const NINODE: usize = 50;
/// Maximum major device number.
pub const NDEV: usize = 10;
/// Inode number of the root directory.
pub const ROOTINO: u32 = 1;

pub const NDIRECT: usize = 12;
pub const NINDIRECT: usize = BSIZE / size_of::<u32>();
/// Maximum file size in blocks.
pub const MAXFILE: usize = NDIRECT + NINDIRECT;

/// Width of a directory entry's name field in bytes.
pub const DIRSIZ: usize = 14;

/// Inodes per block.
pub const IPB: usize = BSIZE / size_of::<DiskInode>();

/// Bitmap bits per block.
pub const BPB: usize = BSIZE * 8;
