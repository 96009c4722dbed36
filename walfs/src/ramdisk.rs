//! Memory-backed block device, mainly for tests and embedders without
//! real storage.

use alloc::vec;
use alloc::vec::Vec;

use crate::block_dev::BlockDevice;
use crate::params::BSIZE;
use crate::SpinLock;

pub struct RamDisk {
    blocks: SpinLock<Vec<u8>>,
}

impl RamDisk {
    /// A zero-filled disk of `nblocks` blocks.
    pub fn new(nblocks: usize) -> Self {
        Self {
            blocks: SpinLock::new(vec![0; nblocks * BSIZE]),
        }
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, blockno: u32, buf: &mut [u8]) {
        let off = blockno as usize * BSIZE;
        let blocks = self.blocks.lock();
        buf.copy_from_slice(&blocks[off..off + BSIZE]);
    }

    fn write_block(&self, blockno: u32, buf: &[u8]) {
        let off = blockno as usize * BSIZE;
        let mut blocks = self.blocks.lock();
        blocks[off..off + BSIZE].copy_from_slice(buf);
    }
}
