//! Character-device dispatch for device inodes.

use alloc::sync::Arc;

use crate::error::{FsError, Result};
use crate::fs::FileSystem;
use crate::params::NDEV;
use crate::SpinLock;

/// Read/write callbacks behind a device inode's major number.
pub trait CharDevice: Send + Sync {
    fn read(&self, dst: &mut [u8]) -> Result<usize>;
    fn write(&self, src: &[u8]) -> Result<usize>;
}

/// Major number to device mapping.
pub(crate) struct DeviceTable {
    devices: SpinLock<[Option<Arc<dyn CharDevice>>; NDEV]>,
}

const NONE_DEV: Option<Arc<dyn CharDevice>> = None;

impl DeviceTable {
    pub(crate) fn new() -> Self {
        Self {
            devices: SpinLock::new([NONE_DEV; NDEV]),
        }
    }

    fn get(&self, major: u16) -> Result<Arc<dyn CharDevice>> {
        self.devices
            .lock()
            .get(major as usize)
            .and_then(|d| d.clone())
            .ok_or(FsError::NoDevice)
    }
}

impl FileSystem {
    /// Register the device behind `major`; device inodes created with this
    /// major dispatch their reads and writes to it.
    pub fn register_device(&self, major: u16, device: Arc<dyn CharDevice>) {
        if major as usize >= NDEV {
            panic!("devices: major {} out of range", major);
        }
        self.devsw.devices.lock()[major as usize] = Some(device);
    }

    pub(crate) fn device(&self, major: u16) -> Result<Arc<dyn CharDevice>> {
        self.devsw.get(major)
    }
}
