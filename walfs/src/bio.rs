//! Buffer cache: a fixed pool of in-memory copies of disk blocks.
//!
//! The cache guarantees at most one copy of each block and hands out
//! exclusive access to it: the control plane (identity, reference count,
//! LRU order) sits behind one spinlock, while each buffer's data sits
//! behind its own sleep-lock so it can be held across device I/O.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use array_macro::array;

use crate::block_dev::BlockDevice;
use crate::params::{BSIZE, NBUF};
use crate::{SleepLock, SleepLockGuard, SpinLock};

/// List terminator for the index-linked LRU chain.
const NIL: usize = NBUF;

pub(crate) struct Bcache {
    device: Arc<dyn BlockDevice>,
    ctrl: SpinLock<BufLru>,
    bufs: [BufInner; NBUF],
}

impl Bcache {
    pub(crate) fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self {
            device,
            ctrl: SpinLock::new(BufLru::new()),
            bufs: array![_ => BufInner::new(); NBUF],
        }
    }

    /// Look through the cache for a buffer holding (`dev`, `blockno`),
    /// recycling the least recently used free buffer on a miss. The
    /// returned buffer is locked but its data may not be loaded yet.
    fn bget(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let mut ctrl = self.ctrl.lock();

        let index = match ctrl.find_cached(dev, blockno) {
            Some(index) => index,
            None => {
                let index = ctrl
                    .recycle(dev, blockno)
                    .unwrap_or_else(|| panic!("bio: no usable buffer"));
                self.bufs[index].valid.store(false, Ordering::Relaxed);
                index
            }
        };
        drop(ctrl);

        Buf {
            cache: self,
            index,
            blockno,
            data: Some(self.bufs[index].data.lock()),
        }
    }

    /// Return a locked buffer with the contents of `blockno`.
    pub(crate) fn bread(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let mut buf = self.bget(dev, blockno);
        if !self.bufs[buf.index].valid.load(Ordering::Relaxed) {
            let data = buf.data.as_mut().unwrap();
            self.device.read_block(blockno, &mut data.0);
            self.bufs[buf.index].valid.store(true, Ordering::Relaxed);
        }
        buf
    }

    /// Release a buffer: once unreferenced it becomes the most recently
    /// used recycling candidate.
    fn brelse(&self, index: usize) {
        self.ctrl.lock().release(index);
    }

    /// Hold a buffer in the cache beyond its handle's lifetime. Paired
    /// with [`Bcache::unpin`] by the log once the block is installed.
    pub(crate) fn pin(&self, index: usize) {
        let mut ctrl = self.ctrl.lock();
        ctrl.entries[index].refcnt += 1;
    }

    pub(crate) fn unpin(&self, index: usize) {
        let mut ctrl = self.ctrl.lock();
        if ctrl.entries[index].refcnt <= 1 {
            panic!("bio: unpin without matching pin");
        }
        ctrl.entries[index].refcnt -= 1;
    }
}

/// Handle to a locked cache buffer. Dropping it releases the buffer.
pub struct Buf<'a> {
    cache: &'a Bcache,
    index: usize,
    blockno: u32,
    /// Always `Some` while the handle lives; taken in `drop` so the
    /// sleep-lock is released before the control plane is updated.
    data: Option<SleepLockGuard<'a, BufData>>,
}

impl<'a> Buf<'a> {
    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Write the buffer's contents through to the device.
    pub(crate) fn bwrite(&mut self) {
        let data = self.data.as_ref().unwrap();
        self.cache.device.write_block(self.blockno, &data.0);
    }

    pub fn raw_data(&self) -> *const BufData {
        let guard = self.data.as_ref().unwrap();
        &**guard
    }

    pub fn raw_data_mut(&mut self) -> *mut BufData {
        let guard = self.data.as_mut().unwrap();
        &mut **guard
    }

    pub(crate) fn bytes(&self) -> &[u8; BSIZE] {
        &self.data.as_ref().unwrap().0
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8; BSIZE] {
        &mut self.data.as_mut().unwrap().0
    }

    pub(crate) fn pin(&self) {
        self.cache.pin(self.index);
    }
}

impl<'a> Drop for Buf<'a> {
    fn drop(&mut self) {
        drop(self.data.take());
        self.cache.brelse(self.index);
    }
}

/// LRU control plane: identity and reference count of every buffer, linked
/// into a doubly linked list by array index. The head end is most recently
/// released; recycling scans from the tail.
struct BufLru {
    entries: [BufCtrl; NBUF],
    head: usize,
    tail: usize,
}

struct BufCtrl {
    dev: u32,
    blockno: u32,
    refcnt: usize,
    prev: usize,
    next: usize,
}

impl BufLru {
    fn new() -> Self {
        let mut lru = Self {
            entries: array![_ => BufCtrl {
                dev: 0,
                blockno: 0,
                refcnt: 0,
                prev: NIL,
                next: NIL,
            }; NBUF],
            head: 0,
            tail: NBUF - 1,
        };
        for i in 0..NBUF {
            lru.entries[i].prev = if i == 0 { NIL } else { i - 1 };
            lru.entries[i].next = if i == NBUF - 1 { NIL } else { i + 1 };
        }
        lru
    }

    fn find_cached(&mut self, dev: u32, blockno: u32) -> Option<usize> {
        let mut i = self.head;
        while i != NIL {
            let e = &mut self.entries[i];
            if e.dev == dev && e.blockno == blockno {
                e.refcnt += 1;
                return Some(i);
            }
            i = e.next;
        }
        None
    }

    fn recycle(&mut self, dev: u32, blockno: u32) -> Option<usize> {
        let mut i = self.tail;
        while i != NIL {
            let e = &mut self.entries[i];
            if e.refcnt == 0 {
                e.dev = dev;
                e.blockno = blockno;
                e.refcnt = 1;
                return Some(i);
            }
            i = e.prev;
        }
        None
    }

    fn release(&mut self, index: usize) {
        if self.entries[index].refcnt == 0 {
            panic!("bio: release of unreferenced buffer");
        }
        self.entries[index].refcnt -= 1;
        if self.entries[index].refcnt == 0 && self.head != index {
            self.detach(index);
            self.push_front(index);
        }
    }

    fn detach(&mut self, index: usize) {
        let (prev, next) = (self.entries[index].prev, self.entries[index].next);
        if prev != NIL {
            self.entries[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.entries[next].prev = prev;
        } else {
            self.tail = prev;
        }
    }

    fn push_front(&mut self, index: usize) {
        self.entries[index].prev = NIL;
        self.entries[index].next = self.head;
        if self.head != NIL {
            self.entries[self.head].prev = index;
        } else {
            self.tail = index;
        }
        self.head = index;
    }
}

struct BufInner {
    /// Whether the data has been read from the device since the buffer was
    /// last recycled. Written under the control-plane lock or the data
    /// sleep-lock.
    valid: AtomicBool,
    data: SleepLock<BufData>,
}

impl BufInner {
    fn new() -> Self {
        Self {
            valid: AtomicBool::new(false),
            data: SleepLock::new(BufData::new()),
        }
    }
}

/// One block of buffered data. The alignment is enough for every on-disk
/// structure this gets cast to.
#[repr(C, align(8))]
pub struct BufData(pub [u8; BSIZE]);

impl BufData {
    const fn new() -> Self {
        Self([0; BSIZE])
    }
}
