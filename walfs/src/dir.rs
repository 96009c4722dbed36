//! Path resolution: `/`-separated component walking over directories.

use alloc::sync::Arc;

use crate::dinode::InodeType;
use crate::fs::FileSystem;
use crate::inode::Inode;
use crate::params::{DIRSIZ, ROOTINO};

/// Copy the next path element starting at `cur` into `name`, zero-padded
/// and truncated to `DIRSIZ` bytes (no terminator when it fills the
/// field). Returns the offset past the element and any trailing slashes,
/// or `None` when no element remains.
///
/// Examples:
///     skip_elem(b"a/bb/c", 0)  = Some(2), name = "a"
///     skip_elem(b"///a//bb", 0) = Some(6), name = "a"
///     skip_elem(b"a", 0)       = Some(1), name = "a"
///     skip_elem(b"", 0) = skip_elem(b"////", 0) = None
fn skip_elem(path: &[u8], mut cur: usize, name: &mut [u8; DIRSIZ]) -> Option<usize> {
    while cur < path.len() && path[cur] == b'/' {
        cur += 1;
    }
    if cur == path.len() {
        return None;
    }

    let start = cur;
    while cur < path.len() && path[cur] != b'/' {
        cur += 1;
    }
    let len = usize::min(cur - start, DIRSIZ);
    name.fill(0);
    name[..len].copy_from_slice(&path[start..start + len]);

    while cur < path.len() && path[cur] == b'/' {
        cur += 1;
    }
    Some(cur)
}

impl FileSystem {
    /// Walk `path` component by component. Absolute paths start at the
    /// root; relative paths start at `cwd` (or the root without one).
    ///
    /// Only one inode is locked at a time: the next component's inode is
    /// acquired by reference before the lock on the current directory is
    /// released, which keeps concurrent walks over overlapping paths from
    /// deadlocking while the reference count keeps the next inode alive.
    fn namex(
        fs: &Arc<FileSystem>,
        path: &str,
        cwd: Option<&Inode>,
        name: &mut [u8; DIRSIZ],
        parent: bool,
    ) -> Option<Inode> {
        let path = path.as_bytes();
        let mut ip = if path.first() == Some(&b'/') {
            FileSystem::iget(fs, fs.dev, ROOTINO)
        } else {
            match cwd {
                Some(cwd) => cwd.clone(),
                None => FileSystem::iget(fs, fs.dev, ROOTINO),
            }
        };

        let mut cur = 0;
        loop {
            cur = match skip_elem(path, cur, name) {
                Some(cur) => cur,
                None => break,
            };

            let mut data = ip.lock();
            if data.itype() != InodeType::Directory {
                drop(data);
                return None;
            }
            if parent && cur == path.len() {
                // Stop one level early, returning the parent unlocked.
                drop(data);
                return Some(ip);
            }
            match data.dirlookup(&ip, name) {
                Some((next, _)) => {
                    drop(data);
                    ip = next;
                }
                None => {
                    drop(data);
                    return None;
                }
            }
        }

        if parent {
            // The path had no final component to name (e.g. "/").
            None
        } else {
            Some(ip)
        }
    }

    /// Resolve `path` to its inode. Must be called inside a transaction:
    /// intermediate handles released on the way down may free inodes.
    pub fn namei(fs: &Arc<Self>, path: &str, cwd: Option<&Inode>) -> Option<Inode> {
        let mut name = [0u8; DIRSIZ];
        Self::namex(fs, path, cwd, &mut name, false)
    }

    /// Resolve `path` to the inode of its parent directory, leaving the
    /// final component in `name`. Same transaction requirement as
    /// [`FileSystem::namei`].
    pub fn nameiparent(
        fs: &Arc<Self>,
        path: &str,
        cwd: Option<&Inode>,
        name: &mut [u8; DIRSIZ],
    ) -> Option<Inode> {
        Self::namex(fs, path, cwd, name, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name_of(s: &str) -> [u8; DIRSIZ] {
        let mut name = [0u8; DIRSIZ];
        name[..s.len()].copy_from_slice(s.as_bytes());
        name
    }

    #[test]
    fn skip_elem_literals() {
        let mut name = [0u8; DIRSIZ];

        let cur = skip_elem(b"a/bb/c", 0, &mut name).unwrap();
        assert_eq!(&b"a/bb/c"[cur..], b"bb/c");
        assert_eq!(name, name_of("a"));

        let cur = skip_elem(b"///a//bb", 0, &mut name).unwrap();
        assert_eq!(&b"///a//bb"[cur..], b"bb");
        assert_eq!(name, name_of("a"));

        let cur = skip_elem(b"a", 0, &mut name).unwrap();
        assert_eq!(cur, 1);
        assert_eq!(name, name_of("a"));

        assert!(skip_elem(b"", 0, &mut name).is_none());
        assert!(skip_elem(b"////", 0, &mut name).is_none());
    }

    #[test]
    fn skip_elem_walks_every_component() {
        let path = b"/usr/share/doc";
        let mut name = [0u8; DIRSIZ];

        let cur = skip_elem(path, 0, &mut name).unwrap();
        assert_eq!(name, name_of("usr"));
        let cur = skip_elem(path, cur, &mut name).unwrap();
        assert_eq!(name, name_of("share"));
        let cur = skip_elem(path, cur, &mut name).unwrap();
        assert_eq!(name, name_of("doc"));
        assert_eq!(cur, path.len());
        assert!(skip_elem(path, cur, &mut name).is_none());
    }

    #[test]
    fn skip_elem_truncates_long_components() {
        // 17 bytes: only the first DIRSIZ survive, with no terminator.
        let mut name = [0u8; DIRSIZ];
        skip_elem(b"aaaaaaaaaaaaaaaaa", 0, &mut name).unwrap();
        assert_eq!(name, [b'a'; DIRSIZ]);
    }
}
