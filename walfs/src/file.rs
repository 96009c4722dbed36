//! Open files: a readable/writable view of an inode with a shared offset.

use alloc::sync::Arc;
use core::cmp::min;
use core::mem::ManuallyDrop;

use bitflags::bitflags;

use crate::error::{FsError, Result};
use crate::inode::Inode;
use crate::params::{BSIZE, MAXOPBLOCKS};
use crate::stat::FileStat;
use crate::SpinLock;

bitflags! {
    pub struct OpenFlags: u32 {
        const WRONLY = 0x001;
        const RDWR   = 0x002;
        const CREATE = 0x200;
    }
}

impl OpenFlags {
    /// Read-only is the absence of every other access flag.
    pub const RDONLY: OpenFlags = OpenFlags::empty();
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileKind {
    Regular,
    Device { major: u16 },
}

/// An open file. Reads and writes move the offset; clones of the handle
/// are not independent cursors, share through `Arc` instead.
pub struct File {
    kind: FileKind,
    readable: bool,
    writable: bool,
    /// Dropped by hand inside a transaction; see the `Drop` impl.
    inode: ManuallyDrop<Inode>,
    offset: SpinLock<u32>,
}

impl File {
    pub(crate) fn new(inode: Inode, kind: FileKind, readable: bool, writable: bool) -> Self {
        Self {
            kind,
            readable,
            writable,
            inode: ManuallyDrop::new(inode),
            offset: SpinLock::new(0),
        }
    }

    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    /// Read from the current offset, advancing it by the bytes read.
    pub fn read(&self, dst: &mut [u8]) -> Result<usize> {
        if !self.readable {
            return Err(FsError::PermissionDenied);
        }

        match self.kind {
            FileKind::Device { major } => self.inode.filesystem().device(major)?.read(dst),
            FileKind::Regular => {
                let mut offset = self.offset.lock();
                let mut idata = self.inode.lock();
                let n = idata.read(&self.inode, dst, *offset)?;
                drop(idata);
                *offset += n as u32;
                Ok(n)
            }
        }
    }

    /// Write at the current offset, advancing it. Regular-file writes are
    /// split into chunks so one chunk's blocks (inode, indirect block, two
    /// blocks of slop for the unaligned ends, plus data and bitmap blocks)
    /// fit a single log transaction.
    pub fn write(&self, src: &[u8]) -> Result<usize> {
        if !self.writable {
            return Err(FsError::PermissionDenied);
        }

        match self.kind {
            FileKind::Device { major } => self.inode.filesystem().device(major)?.write(src),
            FileKind::Regular => {
                let max = (MAXOPBLOCKS - 1 - 1 - 2) / 2 * BSIZE;
                let fs = self.inode.filesystem();
                let mut offset = self.offset.lock();
                let mut count = 0;
                while count < src.len() {
                    let n = min(src.len() - count, max);

                    fs.begin_op();
                    let mut idata = self.inode.lock();
                    let res = idata.write(&self.inode, &src[count..count + n], *offset);
                    drop(idata);
                    fs.end_op();

                    let written = res?;
                    *offset += written as u32;
                    count += written;
                }
                Ok(count)
            }
        }
    }

    /// Metadata of the underlying inode.
    pub fn stat(&self) -> FileStat {
        let idata = self.inode.lock();
        idata.stat(&self.inode)
    }
}

impl Drop for File {
    fn drop(&mut self) {
        // Releasing the inode may be the last reference to an unlinked
        // file, which frees its blocks; that must happen in a transaction.
        let fs = Arc::clone(self.inode.filesystem());
        fs.begin_op();
        unsafe { ManuallyDrop::drop(&mut self.inode) };
        fs.end_op();
    }
}
