use core::fmt;

/// User-recoverable failures. Resource exhaustion (no free block, no free
/// inode, no cache slot) and invariant violations are not represented here:
/// those panic, since they mean misconfiguration or corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    AlreadyExists,
    NotADirectory,
    IsADirectory,
    DirectoryNotEmpty,
    /// Offset past end of file, or offset + count overflows.
    BadOffset,
    /// Write would exceed `MAXFILE` blocks.
    FileTooLarge,
    /// Device inode with an unregistered or out-of-range major number.
    NoDevice,
    /// File not opened for this access.
    PermissionDenied,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FsError::NotFound => "no such file or directory",
            FsError::AlreadyExists => "file exists",
            FsError::NotADirectory => "not a directory",
            FsError::IsADirectory => "is a directory",
            FsError::DirectoryNotEmpty => "directory not empty",
            FsError::BadOffset => "offset out of range",
            FsError::FileTooLarge => "file too large",
            FsError::NoDevice => "no such device",
            FsError::PermissionDenied => "permission denied",
        };
        write!(f, "{}", msg)
    }
}

pub type Result<T> = core::result::Result<T, FsError>;
