//! Inode layer: the in-memory cache, allocation, content indexing and
//! directory content.
//!
//! An inode on disk is a [`DiskInode`](crate::dinode::DiskInode); in memory
//! it lives in a fixed cache of `NINODE` entries. Identity fields (`dev`,
//! `inum`, reference count) are guarded by one cache-wide spinlock, while
//! everything loaded from disk sits behind a per-entry sleep-lock. The two
//! are split so a long-term reference (an open file, a working directory)
//! never serialises unrelated cache traffic.
//!
//! [`Inode`] is the handle the cache hands out: cloning it bumps the
//! reference count, dropping it releases one reference and, for the last
//! reference to an unlinked inode, frees the on-disk inode and its blocks.
//! That drop path enlists writes, so any handle that may be the last one
//! must be dropped inside a transaction.

use alloc::sync::Arc;
use core::cmp::min;
use core::mem::size_of;
use core::ptr;

use array_macro::array;

use crate::dinode::{DirEntry, DiskInode, InodeType};
use crate::error::{FsError, Result};
use crate::fs::FileSystem;
use crate::params::{BSIZE, DIRSIZ, IPB, MAXFILE, NDIRECT, NINDIRECT, NINODE};
use crate::stat::FileStat;
use crate::{SleepLock, SleepLockGuard, SpinLock};

/// Offset of inode `inum` within its block of the inode region.
#[inline]
fn inode_offset(inum: u32) -> usize {
    inum as usize % IPB
}

pub(crate) struct InodeCache {
    meta: SpinLock<[InodeMeta; NINODE]>,
    data: [SleepLock<InodeData>; NINODE],
}

impl InodeCache {
    pub(crate) fn new() -> Self {
        Self {
            meta: SpinLock::new(array![_ => InodeMeta::new(); NINODE]),
            data: array![_ => SleepLock::new(InodeData::new()); NINODE],
        }
    }
}

struct InodeMeta {
    /// device number
    dev: u32,
    /// block number, calculated from inum
    blockno: u32,
    /// inode number
    inum: u32,
    /// reference count
    refs: usize,
}

impl InodeMeta {
    const fn new() -> Self {
        Self {
            dev: 0,
            blockno: 0,
            inum: 0,
            refs: 0,
        }
    }
}

impl FileSystem {
    /// Find the cache entry for (`dev`, `inum`), or claim a free one for
    /// it. Returns a referenced but unlocked handle; nothing is read from
    /// disk. Panics if the cache is full.
    pub(crate) fn iget(fs: &Arc<FileSystem>, dev: u32, inum: u32) -> Inode {
        let mut meta = fs.icache.meta.lock();

        let mut empty_i: Option<usize> = None;
        for i in 0..NINODE {
            if meta[i].refs > 0 && meta[i].dev == dev && meta[i].inum == inum {
                meta[i].refs += 1;
                return Inode {
                    fs: Arc::clone(fs),
                    dev,
                    blockno: meta[i].blockno,
                    inum,
                    index: i,
                };
            }
            if empty_i.is_none() && meta[i].refs == 0 {
                empty_i = Some(i);
            }
        }

        let empty_i = match empty_i {
            Some(i) => i,
            None => panic!("iget: inode cache is full"),
        };
        let blockno = fs.sb.locate_inode(inum);
        meta[empty_i].dev = dev;
        meta[empty_i].blockno = blockno;
        meta[empty_i].inum = inum;
        meta[empty_i].refs = 1;

        // The slot may still hold the previous occupant's loaded fields;
        // the next lock must reload from disk. refs was 0 and the entry is
        // not findable until the meta lock drops, so this cannot block.
        let mut data = fs.icache.data[empty_i].lock();
        data.valid = false;
        drop(data);

        Inode {
            fs: Arc::clone(fs),
            dev,
            blockno,
            inum,
            index: empty_i,
        }
    }

    /// Drop one reference. If this was the last reference to an inode with
    /// no links left, truncate it and free the on-disk inode, then recycle
    /// the cache entry. Must run inside a transaction for that reason.
    fn iput(&self, inode: &Inode) {
        let mut meta = self.icache.meta.lock();
        let i = inode.index;

        if meta[i].refs == 1 {
            // refs == 1 and we hold that reference, so nobody else can
            // hold or be waiting on this sleep-lock.
            let mut idata = self.icache.data[i].lock();
            if !idata.valid || idata.dinode.nlink > 0 {
                drop(idata);
                meta[i].refs -= 1;
            } else {
                drop(meta);
                idata.dinode.itype = InodeType::Empty;
                idata.truncate(inode);
                idata.valid = false;
                drop(idata);

                // Recycle only after the freed inode reached the log:
                // recycling earlier would let another iget claim the entry
                // while its previous contents were still in flight.
                let mut meta = self.icache.meta.lock();
                meta[i].refs -= 1;
                debug_assert_eq!(meta[i].refs, 0);
            }
        } else {
            meta[i].refs -= 1;
        }
    }

    /// Allocate an on-disk inode with the given type. Returns a referenced,
    /// unlocked handle. Panics if every on-disk inode is in use.
    pub(crate) fn ialloc(fs: &Arc<FileSystem>, dev: u32, itype: InodeType) -> Inode {
        for inum in 1..fs.sb.ninodes() {
            let mut buf = fs.bcache.bread(dev, fs.sb.locate_inode(inum));
            let dip = unsafe { (buf.raw_data_mut() as *mut DiskInode).add(inode_offset(inum)) };
            if unsafe { (*dip).itype } == InodeType::Empty {
                unsafe {
                    ptr::write(dip, DiskInode::new());
                    (*dip).itype = itype;
                }
                fs.log_write(buf);
                return FileSystem::iget(fs, dev, inum);
            }
            drop(buf);
        }
        panic!("ialloc: no free inodes");
    }
}

/// Handle to an inode cache entry, holding one reference.
pub struct Inode {
    fs: Arc<FileSystem>,
    dev: u32,
    blockno: u32,
    inum: u32,
    index: usize,
}

impl Inode {
    /// Acquire the inode's sleep-lock, loading the on-disk fields on first
    /// use. Panics if the on-disk inode is free: the caller held a handle
    /// to a dead inode.
    pub fn lock(&self) -> SleepLockGuard<'_, InodeData> {
        let mut guard = self.fs.icache.data[self.index].lock();

        if !guard.valid {
            let buf = self.fs.bcache.bread(self.dev, self.blockno);
            let dip = unsafe { (buf.raw_data() as *const DiskInode).add(inode_offset(self.inum)) };
            guard.dinode = unsafe { ptr::read(dip) };
            drop(buf);
            guard.valid = true;
            if guard.dinode.itype == InodeType::Empty {
                panic!("inode: lock of an inode with no type");
            }
        }
        guard
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn inum(&self) -> u32 {
        self.inum
    }

    pub(crate) fn filesystem(&self) -> &Arc<FileSystem> {
        &self.fs
    }
}

impl Clone for Inode {
    /// `idup`: one more reference to the same cache entry.
    fn clone(&self) -> Self {
        let mut meta = self.fs.icache.meta.lock();
        meta[self.index].refs += 1;
        Inode {
            fs: Arc::clone(&self.fs),
            dev: self.dev,
            blockno: self.blockno,
            inum: self.inum,
            index: self.index,
        }
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        let fs = Arc::clone(&self.fs);
        fs.iput(&*self);
    }
}

/// In-memory copy of an inode, guarded by the entry's sleep-lock.
pub struct InodeData {
    valid: bool,
    dinode: DiskInode,
}

impl InodeData {
    const fn new() -> Self {
        Self {
            valid: false,
            dinode: DiskInode::new(),
        }
    }

    pub fn itype(&self) -> InodeType {
        self.dinode.itype
    }

    pub fn size(&self) -> u32 {
        self.dinode.size
    }

    pub fn nlink(&self) -> u16 {
        self.dinode.nlink
    }

    pub fn major(&self) -> u16 {
        self.dinode.major
    }

    pub(crate) fn set_nlink(&mut self, nlink: u16) {
        self.dinode.nlink = nlink;
    }

    pub(crate) fn set_device(&mut self, major: u16, minor: u16) {
        self.dinode.major = major;
        self.dinode.minor = minor;
    }

    /// Write the in-memory copy back into its disk block, through the log.
    /// The cache is write-through: call this after every field change.
    pub(crate) fn update(&mut self, ip: &Inode) {
        let mut buf = ip.fs.bcache.bread(ip.dev, ip.blockno);
        let dip = unsafe { (buf.raw_data_mut() as *mut DiskInode).add(inode_offset(ip.inum)) };
        unsafe { ptr::write(dip, self.dinode) };
        ip.fs.log_write(buf);
    }

    /// Free every content block and zero the size. Only called once the
    /// inode has no links and no other references.
    pub(crate) fn truncate(&mut self, ip: &Inode) {
        for i in 0..NDIRECT {
            if self.dinode.addrs[i] > 0 {
                ip.fs.bfree(ip.dev, self.dinode.addrs[i]);
                self.dinode.addrs[i] = 0;
            }
        }

        if self.dinode.addrs[NDIRECT] > 0 {
            let buf = ip.fs.bcache.bread(ip.dev, self.dinode.addrs[NDIRECT]);
            let slots = buf.raw_data() as *const u32;
            for i in 0..NINDIRECT {
                let bn = unsafe { ptr::read(slots.add(i)) };
                if bn > 0 {
                    ip.fs.bfree(ip.dev, bn);
                }
            }
            drop(buf);
            ip.fs.bfree(ip.dev, self.dinode.addrs[NDIRECT]);
            self.dinode.addrs[NDIRECT] = 0;
        }

        self.dinode.size = 0;
        self.update(ip);
    }

    /// Metadata snapshot.
    pub fn stat(&self, ip: &Inode) -> FileStat {
        FileStat {
            dev: ip.dev,
            inum: ip.inum,
            itype: self.dinode.itype,
            nlink: self.dinode.nlink,
            size: self.dinode.size,
        }
    }

    /// Disk block backing file block `bn`, allocating it (and the indirect
    /// block) on first touch. Panics past `MAXFILE` blocks.
    fn bmap(&mut self, ip: &Inode, bn: usize) -> u32 {
        if bn < NDIRECT {
            let mut addr = self.dinode.addrs[bn];
            if addr == 0 {
                addr = ip.fs.balloc(ip.dev);
                self.dinode.addrs[bn] = addr;
            }
            return addr;
        }
        let bn = bn - NDIRECT;

        if bn < NINDIRECT {
            // Load the indirect block, allocating if necessary.
            let mut indirect = self.dinode.addrs[NDIRECT];
            if indirect == 0 {
                indirect = ip.fs.balloc(ip.dev);
                self.dinode.addrs[NDIRECT] = indirect;
            }
            let mut buf = ip.fs.bcache.bread(ip.dev, indirect);
            let slot = unsafe { (buf.raw_data_mut() as *mut u32).add(bn) };
            let addr = unsafe { ptr::read(slot) };
            if addr == 0 {
                let fresh = ip.fs.balloc(ip.dev);
                unsafe { ptr::write(slot, fresh) };
                ip.fs.log_write(buf);
                return fresh;
            }
            drop(buf);
            return addr;
        }

        panic!("bmap: file block {} out of range", bn + NDIRECT);
    }

    /// Read up to `dst.len()` bytes starting at byte offset `off`,
    /// clamped to the file size. Device inodes dispatch to the registered
    /// device instead.
    pub fn read(&mut self, ip: &Inode, dst: &mut [u8], off: u32) -> Result<usize> {
        if self.dinode.itype == InodeType::Device {
            return ip.fs.device(self.dinode.major)?.read(dst);
        }

        let mut n = dst.len() as u32;
        let end = off.checked_add(n).ok_or(FsError::BadOffset)?;
        if off > self.dinode.size {
            return Err(FsError::BadOffset);
        }
        if end > self.dinode.size {
            n = self.dinode.size - off;
        }

        let mut tot = 0usize;
        let mut off = off as usize;
        while tot < n as usize {
            let buf = ip.fs.bcache.bread(ip.dev, self.bmap(ip, off / BSIZE));
            let m = min(n as usize - tot, BSIZE - off % BSIZE);
            dst[tot..tot + m].copy_from_slice(&buf.bytes()[off % BSIZE..off % BSIZE + m]);
            drop(buf);
            tot += m;
            off += m;
        }
        Ok(tot)
    }

    /// Write `src` at byte offset `off`, growing the file as needed. The
    /// caller is responsible for keeping one call's blocks within the
    /// log's transaction capacity. Device inodes dispatch to the
    /// registered device instead.
    pub fn write(&mut self, ip: &Inode, src: &[u8], off: u32) -> Result<usize> {
        if self.dinode.itype == InodeType::Device {
            return ip.fs.device(self.dinode.major)?.write(src);
        }

        let n = src.len() as u32;
        let end = off.checked_add(n).ok_or(FsError::BadOffset)?;
        if off > self.dinode.size {
            return Err(FsError::BadOffset);
        }
        if end as usize > MAXFILE * BSIZE {
            return Err(FsError::FileTooLarge);
        }

        let mut tot = 0usize;
        let mut off = off as usize;
        while tot < n as usize {
            let mut buf = ip.fs.bcache.bread(ip.dev, self.bmap(ip, off / BSIZE));
            let m = min(n as usize - tot, BSIZE - off % BSIZE);
            buf.bytes_mut()[off % BSIZE..off % BSIZE + m].copy_from_slice(&src[tot..tot + m]);
            ip.fs.log_write(buf);
            tot += m;
            off += m;
        }

        if off as u32 > self.dinode.size {
            self.dinode.size = off as u32;
        }
        // bmap may have installed fresh block addresses even when the size
        // did not change.
        self.update(ip);
        Ok(tot)
    }

    /// Look up `name` in this directory. Returns the entry's inode and the
    /// byte offset of the entry. The caller holds this directory's lock.
    pub(crate) fn dirlookup(&mut self, ip: &Inode, name: &[u8; DIRSIZ]) -> Option<(Inode, u32)> {
        if self.dinode.itype != InodeType::Directory {
            panic!("dirlookup: not a directory");
        }

        let de_size = size_of::<DirEntry>() as u32;
        let mut de = DirEntry::empty();
        for off in (0..self.dinode.size).step_by(de_size as usize) {
            self.read(ip, de.as_bytes_mut(), off)
                .unwrap_or_else(|_| panic!("dirlookup: read"));
            if de.inum == 0 {
                continue;
            }
            if de.name == *name {
                return Some((FileSystem::iget(&ip.fs, ip.dev, de.inum as u32), off));
            }
        }
        None
    }

    /// Add the entry (`name`, `inum`) to this directory, reusing the first
    /// free slot or appending. Fails if the name is already present. Does
    /// not touch the target's link count; that accounting is the caller's.
    pub(crate) fn dirlink(&mut self, ip: &Inode, name: &[u8; DIRSIZ], inum: u32) -> Result<()> {
        if let Some((found, _)) = self.dirlookup(ip, name) {
            drop(found);
            return Err(FsError::AlreadyExists);
        }

        let de_size = size_of::<DirEntry>() as u32;
        let mut de = DirEntry::empty();
        let mut off = self.dinode.size;
        for o in (0..self.dinode.size).step_by(de_size as usize) {
            self.read(ip, de.as_bytes_mut(), o)
                .unwrap_or_else(|_| panic!("dirlink: read"));
            if de.inum == 0 {
                off = o;
                break;
            }
        }

        de.name = *name;
        de.inum = inum as u16;
        if self.write(ip, de.as_bytes(), off).is_err() {
            panic!("dirlink: writei");
        }
        Ok(())
    }

    /// Whether this directory holds nothing besides `.` and `..`.
    pub(crate) fn is_dir_empty(&mut self, ip: &Inode) -> bool {
        let de_size = size_of::<DirEntry>() as u32;
        let mut de = DirEntry::empty();
        for off in (2 * de_size..self.dinode.size).step_by(de_size as usize) {
            self.read(ip, de.as_bytes_mut(), off)
                .unwrap_or_else(|_| panic!("is_dir_empty: read"));
            if de.inum != 0 {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::LOGSIZE;
    use crate::ramdisk::RamDisk;
    use crate::ROOTINO;

    fn fresh_fs() -> Arc<FileSystem> {
        FileSystem::format(Arc::new(RamDisk::new(1000)), 1, 1000, 200, LOGSIZE as u32)
    }

    #[test]
    fn iget_is_unique_per_identity() {
        let fs = fresh_fs();
        let a = FileSystem::iget(&fs, 1, ROOTINO);
        let b = FileSystem::iget(&fs, 1, ROOTINO);
        assert_eq!(a.index, b.index);

        let c = a.clone();
        assert_eq!(c.index, a.index);
        drop(b);
        drop(c);

        // Still referenced: a fourth handle lands on the same entry.
        let d = FileSystem::iget(&fs, 1, ROOTINO);
        assert_eq!(d.index, a.index);
    }

    #[test]
    fn lock_loads_the_root_directory() {
        let fs = fresh_fs();
        let root = FileSystem::iget(&fs, 1, ROOTINO);
        let data = root.lock();
        assert_eq!(data.itype(), InodeType::Directory);
        assert_eq!(data.nlink(), 1);
        assert_eq!(data.size(), 2 * size_of::<DirEntry>() as u32);
    }

    #[test]
    fn root_directory_has_dot_entries() {
        let fs = fresh_fs();
        let root = FileSystem::iget(&fs, 1, ROOTINO);
        let mut data = root.lock();

        let mut dot = [0u8; DIRSIZ];
        dot[0] = b'.';
        let (found, off) = data.dirlookup(&root, &dot).expect("'.' missing");
        assert_eq!(found.inum(), ROOTINO);
        assert_eq!(off, 0);
        drop(found);

        dot[1] = b'.';
        let (found, off) = data.dirlookup(&root, &dot).expect("'..' missing");
        assert_eq!(found.inum(), ROOTINO);
        assert_eq!(off, size_of::<DirEntry>() as u32);
        drop(found);
    }

    #[test]
    fn recycled_slot_reloads_from_disk() {
        let fs = fresh_fs();
        let file = FileSystem::create(&fs, "/f", InodeType::File, 0, 0, None).unwrap();
        let file_inum = file.inum();
        fs.begin_op();
        drop(file);
        fs.end_op();

        // Load the root directory into a slot, then let the reference go:
        // the slot drops to refs == 0 with its fields still loaded.
        let root = FileSystem::iget(&fs, 1, ROOTINO);
        let root_slot = root.index;
        assert_eq!(root.lock().itype(), InodeType::Directory);
        drop(root);

        // Claiming that slot for a different inum must reload from disk,
        // not serve the stale directory fields.
        let file = FileSystem::iget(&fs, 1, file_inum);
        assert_eq!(file.index, root_slot);
        let data = file.lock();
        assert_eq!(data.itype(), InodeType::File);
        assert_eq!(data.nlink(), 1);
        assert_eq!(data.size(), 0);
    }
}
