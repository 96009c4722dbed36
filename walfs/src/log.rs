//! Write-ahead log providing crash atomicity for multi-block updates.
//!
//! Every mutating operation is bracketed by [`FileSystem::begin_op`] and
//! [`FileSystem::end_op`]. Dirty buffers are enlisted with `log_write`
//! instead of being written in place; when the last outstanding operation
//! ends, the enlisted blocks are copied to the log region, the header is
//! written (the commit point), and only then are the blocks installed at
//! their home locations. Recovery at mount replays a non-empty header, so
//! a crash at any instant yields either all of a transaction or none.

use core::hint::spin_loop;
use core::mem::size_of;
use core::ptr;

use ::log::{debug, info};
use static_assertions::const_assert;

use crate::bio::Bcache;
use crate::bio::Buf;
use crate::fs::FileSystem;
use crate::params::{BSIZE, LOGSIZE, MAXOPBLOCKS};
use crate::SpinLock;

/// On-disk log header, stored in the first block of the log region.
#[repr(C)]
#[derive(Clone, Copy)]
struct LogHeader {
    /// Number of enlisted blocks in the current (or replaying) transaction.
    len: u32,
    /// Home block numbers, in enlistment order. One block of the region is
    /// taken by this header, hence `LOGSIZE - 1`.
    blocknos: [u32; LOGSIZE - 1],
}

const_assert!(size_of::<LogHeader>() <= BSIZE);

impl LogHeader {
    const fn empty() -> Self {
        Self {
            len: 0,
            blocknos: [0; LOGSIZE - 1],
        }
    }
}

pub(crate) struct Log {
    /// First block of the log region.
    start: u32,
    /// Blocks available for the log, header included.
    size: u32,
    dev: u32,
    state: SpinLock<LogState>,
}

struct LogState {
    /// Operations inside `begin_op`/`end_op`.
    outstanding: u32,
    /// No operation may start or end while a commit is in flight.
    committing: bool,
    lh: LogHeader,
}

impl Log {
    pub(crate) fn new(dev: u32, start: u32, size: u32) -> Self {
        Self {
            start,
            size,
            dev,
            state: SpinLock::new(LogState {
                outstanding: 0,
                committing: false,
                lh: LogHeader::empty(),
            }),
        }
    }

    /// Replay a committed but uninstalled transaction, if the on-disk
    /// header records one. Called once at mount, before any operation.
    pub(crate) fn recover(&self, bcache: &Bcache) {
        let lh = self.read_head(bcache);
        if lh.len > 0 {
            info!("log: recovering {} blocks", lh.len);
            self.install_trans(bcache, &lh, true);
            self.write_head(bcache, &LogHeader::empty());
        } else {
            debug!("log: clean");
        }
    }

    fn read_head(&self, bcache: &Bcache) -> LogHeader {
        let buf = bcache.bread(self.dev, self.start);
        unsafe { ptr::read(buf.raw_data() as *const LogHeader) }
    }

    /// Write a header to disk. With a non-empty header this is the point
    /// at which the current transaction commits.
    fn write_head(&self, bcache: &Bcache, lh: &LogHeader) {
        let mut buf = bcache.bread(self.dev, self.start);
        unsafe { ptr::write(buf.raw_data_mut() as *mut LogHeader, *lh) };
        buf.bwrite();
    }

    /// Copy enlisted blocks from the cache into the log region.
    fn write_log(&self, bcache: &Bcache, lh: &LogHeader) {
        for i in 0..lh.len {
            let cache_buf = bcache.bread(self.dev, lh.blocknos[i as usize]);
            let mut log_buf = bcache.bread(self.dev, self.start + 1 + i);
            log_buf.bytes_mut().copy_from_slice(cache_buf.bytes());
            log_buf.bwrite();
        }
    }

    /// Copy committed blocks from the log region to their home locations.
    fn install_trans(&self, bcache: &Bcache, lh: &LogHeader, recovering: bool) {
        for i in 0..lh.len {
            let log_buf = bcache.bread(self.dev, self.start + 1 + i);
            let mut disk_buf = bcache.bread(self.dev, lh.blocknos[i as usize]);
            disk_buf.bytes_mut().copy_from_slice(log_buf.bytes());
            disk_buf.bwrite();
            if !recovering {
                bcache.unpin(disk_buf.index());
            }
        }
    }
}

impl FileSystem {
    /// Start a filesystem operation. Blocks while a commit is in progress
    /// or until the log has room for a full `MAXOPBLOCKS` worth of writes.
    pub fn begin_op(&self) {
        loop {
            let mut state = self.log.state.lock();
            if state.committing
                || 1 + state.lh.len as usize + (state.outstanding as usize + 1) * MAXOPBLOCKS
                    > LOGSIZE
            {
                drop(state);
                spin_loop();
            } else {
                state.outstanding += 1;
                return;
            }
        }
    }

    /// End a filesystem operation; commits if this was the last
    /// outstanding one.
    pub fn end_op(&self) {
        let mut do_commit = false;
        {
            let mut state = self.log.state.lock();
            if state.outstanding == 0 {
                panic!("log: end_op without a matching begin_op");
            }
            state.outstanding -= 1;
            if state.committing {
                panic!("log: end_op while committing");
            }
            if state.outstanding == 0 {
                state.committing = true;
                do_commit = true;
            }
        }

        if do_commit {
            // The committing flag keeps every other operation out of the
            // log, so the commit itself runs without the state lock.
            self.commit();
            let mut state = self.log.state.lock();
            state.committing = false;
        }
    }

    /// Enlist a dirty buffer in the current transaction in place of a
    /// direct write. Re-enlisting the same block is absorbed into the
    /// earlier entry; the buffer stays pinned in the cache until commit.
    pub(crate) fn log_write(&self, buf: Buf<'_>) {
        let mut state = self.log.state.lock();
        let len = state.lh.len as usize;
        if len >= LOGSIZE - 1 || len as u32 >= self.log.size - 1 {
            panic!("log: transaction too big");
        }
        if state.outstanding < 1 {
            panic!("log: write outside of a transaction");
        }

        for i in 0..len {
            if state.lh.blocknos[i] == buf.blockno() {
                // absorption
                return;
            }
        }
        state.lh.blocknos[len] = buf.blockno();
        state.lh.len += 1;
        drop(state);
        buf.pin();
    }

    fn commit(&self) {
        let lh = self.log.state.lock().lh;
        if lh.len > 0 {
            self.log.write_log(&self.bcache, &lh);
            self.log.write_head(&self.bcache, &lh);
            self.log.install_trans(&self.bcache, &lh, false);
            self.log.state.lock().lh.len = 0;
            self.log.write_head(&self.bcache, &LogHeader::empty());
        }
    }
}
