//! The mounted filesystem: wiring of superblock, buffer cache, log, inode
//! cache and device table, plus the transactional namespace operations.

use alloc::sync::Arc;
use core::mem::size_of;
use core::ptr;
use core::slice;

use ::log::info;

use crate::bio::Bcache;
use crate::block_dev::BlockDevice;
use crate::devices::DeviceTable;
use crate::dinode::{DirEntry, DiskInode, InodeType};
use crate::error::{FsError, Result};
use crate::file::{File, FileKind, OpenFlags};
use crate::inode::{Inode, InodeCache};
use crate::log::Log;
use crate::params::{BPB, BSIZE, DIRSIZ, FSMAGIC, IPB, NDEV, ROOTINO};
use crate::superblock::{RawSuperBlock, SuperBlock};

/// A mounted filesystem over a single block device. Created once by
/// [`FileSystem::mount`] (or [`FileSystem::format`]) and shared as `Arc`;
/// every operation goes through the methods here or through the [`Inode`]
/// handles they return.
pub struct FileSystem {
    pub(crate) dev: u32,
    pub(crate) sb: SuperBlock,
    pub(crate) bcache: Bcache,
    pub(crate) log: Log,
    pub(crate) icache: InodeCache,
    pub(crate) devsw: DeviceTable,
}

fn raw_bytes<T>(value: &T) -> &[u8] {
    unsafe { slice::from_raw_parts(value as *const T as *const u8, size_of::<T>()) }
}

impl FileSystem {
    /// Mount an existing filesystem: read the superblock from block 1 and
    /// replay the log if the last shutdown left a committed transaction
    /// uninstalled. Panics on a bad magic number.
    pub fn mount(device: Arc<dyn BlockDevice>, dev: u32) -> Arc<FileSystem> {
        let bcache = Bcache::new(device);

        let raw = {
            let buf = bcache.bread(dev, 1);
            unsafe { ptr::read(buf.raw_data() as *const RawSuperBlock) }
        };
        let sb = SuperBlock::new(raw);

        let (logstart, nlog) = sb.log_region();
        let log = Log::new(dev, logstart, nlog);
        log.recover(&bcache);

        info!(
            "fs: mounted dev {} ({} blocks, {} inodes, {} log blocks)",
            dev,
            sb.size(),
            sb.ninodes(),
            nlog
        );

        Arc::new(FileSystem {
            dev,
            sb,
            bcache,
            log,
            icache: InodeCache::new(),
            devsw: DeviceTable::new(),
        })
    }

    /// Build a fresh filesystem on `device` and mount it. Layout, in
    /// blocks: boot, superblock, log, inode region, free bitmap, data.
    /// The root directory takes inode 1 and the first data block.
    pub fn format(
        device: Arc<dyn BlockDevice>,
        dev: u32,
        size: u32,
        ninodes: u32,
        nlog: u32,
    ) -> Arc<FileSystem> {
        let nbitmap = size as usize / BPB + 1;
        let ninodeblocks = ninodes as usize / IPB + 1;
        let nmeta = 2 + nlog as usize + ninodeblocks + nbitmap;
        if nmeta + 1 >= size as usize {
            panic!("format: {} blocks cannot hold {} meta blocks", size, nmeta);
        }

        let raw = RawSuperBlock {
            magic: FSMAGIC,
            size,
            nblocks: size - nmeta as u32,
            ninodes,
            nlog,
            logstart: 2,
            inodestart: 2 + nlog,
            bmapstart: 2 + nlog + ninodeblocks as u32,
        };

        let mut block = [0u8; BSIZE];
        for b in 0..size {
            device.write_block(b, &block);
        }

        block[..size_of::<RawSuperBlock>()].copy_from_slice(raw_bytes(&raw));
        device.write_block(1, &block);

        // Root directory: inode 1, one data block with "." and "..".
        let rootdata = nmeta as u32;
        let mut dinode = DiskInode::new();
        dinode.itype = InodeType::Directory;
        dinode.nlink = 1;
        dinode.size = (2 * size_of::<DirEntry>()) as u32;
        dinode.addrs[0] = rootdata;

        block.fill(0);
        let ioff = ROOTINO as usize % IPB * size_of::<DiskInode>();
        block[ioff..ioff + size_of::<DiskInode>()].copy_from_slice(raw_bytes(&dinode));
        device.write_block(raw.inodestart + ROOTINO / IPB as u32, &block);

        block.fill(0);
        let mut de = DirEntry::empty();
        de.inum = ROOTINO as u16;
        de.name[0] = b'.';
        block[..size_of::<DirEntry>()].copy_from_slice(de.as_bytes());
        de.name[1] = b'.';
        block[size_of::<DirEntry>()..2 * size_of::<DirEntry>()].copy_from_slice(de.as_bytes());
        device.write_block(rootdata, &block);

        // Mark the meta blocks and the root's data block allocated. They
        // all fall inside the first bitmap block.
        let used = nmeta + 1;
        debug_assert!(used <= BPB);
        block.fill(0);
        for b in 0..used {
            block[b / 8] |= 1 << (b % 8);
        }
        device.write_block(raw.bmapstart, &block);

        info!(
            "format: {} blocks ({} meta: 2 boot+super, {} log, {} inode, {} bitmap)",
            size, nmeta, nlog, ninodeblocks, nbitmap
        );

        Self::mount(device, dev)
    }

    /// Handle to the root directory.
    pub fn root(fs: &Arc<Self>) -> Inode {
        FileSystem::iget(fs, fs.dev, ROOTINO)
    }

    /// Create `path` as a new inode of the given type. Creating an
    /// existing regular file (or device) as a regular file returns the
    /// existing inode; any other collision is an error. New directories
    /// get `.` and `..`, and the parent picks up one link for the latter
    /// but none for `.`, which keeps the link counts acyclic.
    pub fn create(
        fs: &Arc<Self>,
        path: &str,
        itype: InodeType,
        major: u16,
        minor: u16,
        cwd: Option<&Inode>,
    ) -> Result<Inode> {
        fs.begin_op();
        let res = Self::create_inner(fs, path, itype, major, minor, cwd);
        fs.end_op();
        res
    }

    fn create_inner(
        fs: &Arc<Self>,
        path: &str,
        itype: InodeType,
        major: u16,
        minor: u16,
        cwd: Option<&Inode>,
    ) -> Result<Inode> {
        let mut name = [0u8; DIRSIZ];
        let dp = Self::nameiparent(fs, path, cwd, &mut name).ok_or(FsError::NotFound)?;
        let mut dpdata = dp.lock();

        if let Some((ip, _)) = dpdata.dirlookup(&dp, &name) {
            drop(dpdata);
            drop(dp);
            let idata = ip.lock();
            if itype == InodeType::File
                && matches!(idata.itype(), InodeType::File | InodeType::Device)
            {
                drop(idata);
                return Ok(ip);
            }
            drop(idata);
            drop(ip);
            return Err(FsError::AlreadyExists);
        }

        let ip = Self::ialloc(fs, dp.dev(), itype);
        let mut idata = ip.lock();
        idata.set_device(major, minor);
        idata.set_nlink(1);
        idata.update(&ip);

        if itype == InodeType::Directory {
            let mut dot = [0u8; DIRSIZ];
            dot[0] = b'.';
            if idata.dirlink(&ip, &dot, ip.inum()).is_err() {
                panic!("create: dirlink '.'");
            }
            dot[1] = b'.';
            if idata.dirlink(&ip, &dot, dp.inum()).is_err() {
                panic!("create: dirlink '..'");
            }
        }
        drop(idata);

        if dpdata.dirlink(&dp, &name, ip.inum()).is_err() {
            panic!("create: dirlink");
        }
        if itype == InodeType::Directory {
            // One more link to the parent, through the child's "..".
            let nlink = dpdata.nlink();
            dpdata.set_nlink(nlink + 1);
            dpdata.update(&dp);
        }
        drop(dpdata);
        drop(dp);

        Ok(ip)
    }

    /// Create `new` as another name for the inode behind `old`.
    /// Directories cannot be linked.
    pub fn link(fs: &Arc<Self>, old: &str, new: &str, cwd: Option<&Inode>) -> Result<()> {
        fs.begin_op();
        let res = Self::link_inner(fs, old, new, cwd);
        fs.end_op();
        res
    }

    fn link_inner(fs: &Arc<Self>, old: &str, new: &str, cwd: Option<&Inode>) -> Result<()> {
        let ip = Self::namei(fs, old, cwd).ok_or(FsError::NotFound)?;

        let mut idata = ip.lock();
        if idata.itype() == InodeType::Directory {
            drop(idata);
            return Err(FsError::IsADirectory);
        }
        let nlink = idata.nlink();
        idata.set_nlink(nlink + 1);
        idata.update(&ip);
        drop(idata);

        let mut name = [0u8; DIRSIZ];
        let err = match Self::nameiparent(fs, new, cwd, &mut name) {
            Some(dp) => {
                let mut dpdata = dp.lock();
                if dp.dev() != ip.dev() {
                    drop(dpdata);
                    Some(FsError::NotFound)
                } else if let Err(e) = dpdata.dirlink(&dp, &name, ip.inum()) {
                    drop(dpdata);
                    Some(e)
                } else {
                    drop(dpdata);
                    None
                }
            }
            None => Some(FsError::NotFound),
        };

        match err {
            None => Ok(()),
            Some(e) => {
                // Undo the speculative link count in the same transaction.
                let mut idata = ip.lock();
                let nlink = idata.nlink();
                idata.set_nlink(nlink - 1);
                idata.update(&ip);
                drop(idata);
                Err(e)
            }
        }
    }

    /// Remove the directory entry behind `path`. Refuses `.`/`..` and
    /// non-empty directories. The inode itself is freed once the last
    /// in-memory reference goes away.
    pub fn unlink(fs: &Arc<Self>, path: &str, cwd: Option<&Inode>) -> Result<()> {
        fs.begin_op();
        let res = Self::unlink_inner(fs, path, cwd);
        fs.end_op();
        res
    }

    fn unlink_inner(fs: &Arc<Self>, path: &str, cwd: Option<&Inode>) -> Result<()> {
        let mut name = [0u8; DIRSIZ];
        let dp = Self::nameiparent(fs, path, cwd, &mut name).ok_or(FsError::NotFound)?;

        let mut dot = [0u8; DIRSIZ];
        dot[0] = b'.';
        if name == dot {
            return Err(FsError::PermissionDenied);
        }
        dot[1] = b'.';
        if name == dot {
            return Err(FsError::PermissionDenied);
        }

        let mut dpdata = dp.lock();
        let (ip, off) = match dpdata.dirlookup(&dp, &name) {
            Some(found) => found,
            None => {
                drop(dpdata);
                return Err(FsError::NotFound);
            }
        };
        let mut idata = ip.lock();

        if idata.nlink() < 1 {
            panic!("unlink: nlink < 1");
        }
        if idata.itype() == InodeType::Directory && !idata.is_dir_empty(&ip) {
            drop(idata);
            drop(ip);
            drop(dpdata);
            return Err(FsError::DirectoryNotEmpty);
        }

        let de = DirEntry::empty();
        if dpdata.write(&dp, de.as_bytes(), off).is_err() {
            panic!("unlink: writei");
        }
        if idata.itype() == InodeType::Directory {
            // The victim's ".." no longer refers to the parent.
            let nlink = dpdata.nlink();
            dpdata.set_nlink(nlink - 1);
            dpdata.update(&dp);
        }
        drop(dpdata);
        drop(dp);

        let nlink = idata.nlink();
        idata.set_nlink(nlink - 1);
        idata.update(&ip);
        drop(idata);
        drop(ip);

        Ok(())
    }

    pub fn mkdir(fs: &Arc<Self>, path: &str, cwd: Option<&Inode>) -> Result<()> {
        fs.begin_op();
        let res = Self::create_inner(fs, path, InodeType::Directory, 0, 0, cwd).map(drop);
        fs.end_op();
        res
    }

    /// Create a device node dispatching to the device registered under
    /// `major`.
    pub fn mknod(
        fs: &Arc<Self>,
        path: &str,
        major: u16,
        minor: u16,
        cwd: Option<&Inode>,
    ) -> Result<()> {
        fs.begin_op();
        let res = Self::create_inner(fs, path, InodeType::Device, major, minor, cwd).map(drop);
        fs.end_op();
        res
    }

    /// Open `path`, creating it as a regular file first when `CREATE` is
    /// set. Directories can only be opened read-only.
    pub fn open(fs: &Arc<Self>, path: &str, flags: OpenFlags, cwd: Option<&Inode>) -> Result<File> {
        fs.begin_op();
        let res = Self::open_inner(fs, path, flags, cwd);
        fs.end_op();
        res
    }

    fn open_inner(
        fs: &Arc<Self>,
        path: &str,
        flags: OpenFlags,
        cwd: Option<&Inode>,
    ) -> Result<File> {
        let readable = !flags.contains(OpenFlags::WRONLY);
        let writable = flags.intersects(OpenFlags::WRONLY | OpenFlags::RDWR);

        let ip = if flags.contains(OpenFlags::CREATE) {
            Self::create_inner(fs, path, InodeType::File, 0, 0, cwd)?
        } else {
            Self::namei(fs, path, cwd).ok_or(FsError::NotFound)?
        };

        let idata = ip.lock();
        if idata.itype() == InodeType::Directory && writable {
            drop(idata);
            return Err(FsError::IsADirectory);
        }
        let kind = match idata.itype() {
            InodeType::Device => {
                let major = idata.major();
                if major as usize >= NDEV {
                    drop(idata);
                    return Err(FsError::NoDevice);
                }
                FileKind::Device { major }
            }
            _ => FileKind::Regular,
        };
        drop(idata);

        Ok(File::new(ip, kind, readable, writable))
    }

    /// Resolve `path` to a directory inode for use as a working
    /// directory. The caller owns swapping its old one; drop it inside a
    /// transaction.
    pub fn chdir(fs: &Arc<Self>, path: &str, cwd: Option<&Inode>) -> Result<Inode> {
        fs.begin_op();
        let res = (|| {
            let ip = Self::namei(fs, path, cwd).ok_or(FsError::NotFound)?;
            let idata = ip.lock();
            if idata.itype() != InodeType::Directory {
                drop(idata);
                return Err(FsError::NotADirectory);
            }
            drop(idata);
            Ok(ip)
        })();
        fs.end_op();
        res
    }
}
