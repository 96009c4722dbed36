//! Block allocator over the on-disk free bitmap, one bit per block.
//!
//! Bitmap updates go through the log, so an allocation and the pointer
//! installed for it (in an inode or indirect block) commit atomically and
//! no block can leak across a crash.

use bit_field::BitField;

use crate::fs::FileSystem;
use crate::params::BPB;

impl FileSystem {
    /// Allocate a zeroed disk block. Panics if the disk is full.
    pub(crate) fn balloc(&self, dev: u32) -> u32 {
        let mut base = 0;
        while base < self.sb.size() {
            let mut buf = self.bcache.bread(dev, self.sb.bitmap_blockno(base));
            let mut bi = 0;
            while bi < BPB as u32 && base + bi < self.sb.size() {
                let index = (bi / 8) as usize;
                let bit = (bi % 8) as usize;
                if !buf.bytes()[index].get_bit(bit) {
                    buf.bytes_mut()[index].set_bit(bit, true);
                    self.log_write(buf);
                    self.bzero(dev, base + bi);
                    return base + bi;
                }
                bi += 1;
            }
            drop(buf);
            base += BPB as u32;
        }
        panic!("balloc: out of blocks");
    }

    /// Free a disk block. Panics if the block is already free.
    pub(crate) fn bfree(&self, dev: u32, blockno: u32) {
        let mut buf = self.bcache.bread(dev, self.sb.bitmap_blockno(blockno));
        let bi = blockno as usize % BPB;
        let index = bi / 8;
        let bit = bi % 8;
        if !buf.bytes()[index].get_bit(bit) {
            panic!("bfree: freeing a free block");
        }
        buf.bytes_mut()[index].set_bit(bit, false);
        self.log_write(buf);
    }

    /// Zero a block so stale contents never leak into a fresh allocation
    /// and indirect blocks start with every slot unallocated.
    fn bzero(&self, dev: u32, blockno: u32) {
        let mut buf = self.bcache.bread(dev, blockno);
        buf.bytes_mut().fill(0);
        self.log_write(buf);
    }
}
