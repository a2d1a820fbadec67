//! The uniform filesystem interface both engines implement, plus the
//! process-wide mount registry that routes paths to engines by
//! longest-prefix match.

use crate::errors::{FsError, FsResult};
use lazy_static::lazy_static;
use log::info;
use std::sync::{Arc, Mutex};

/// Open flags, combinable except for the access mode in the low bits.
pub mod flags {
    pub const O_RDONLY: u32 = 0;
    pub const O_WRONLY: u32 = 1;
    pub const O_RDWR: u32 = 2;
    pub const O_MODE_MASK: u32 = 3;
    pub const O_APPEND: u32 = 0x0008;
    pub const O_CREAT: u32 = 0x0200;
    pub const O_TRUNC: u32 = 0x0400;
    pub const O_DIR: u32 = 0x1000;
}

/// Mount flags. Bit 0 selects read-write; all other bits are reserved.
pub mod mount_flags {
    pub const MNT_READ_ONLY: u32 = 0x0000_0000;
    pub const MNT_READ_WRITE: u32 = 0x0000_0001;
    pub const MNT_VALID_MASK: u32 = 0x0000_0001;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Dir,
    Symlink,
    CharDev,
    BlockDev,
    Fifo,
    Socket,
}

/// stat/fstat result. Times are UNIX seconds.
#[derive(Debug, Clone)]
pub struct Stat {
    pub ino: u64,
    pub kind: NodeKind,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub blksize: u32,
    pub blocks: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

/// One readdir result.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub size: u64,
    pub mtime: i64,
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Copy)]
pub enum FcntlCmd {
    GetFl,
    SetFl(u32),
    GetFd,
    SetFd(u32),
}

pub type FileDesc = usize;

/// The operation set a mounted engine exposes. Engines serialize
/// internally; all methods take `&self`.
pub trait FileSystem: Send + Sync {
    fn open(&self, path: &str, mode: u32) -> FsResult<FileDesc>;
    fn close(&self, fd: FileDesc) -> FsResult<()>;
    fn read(&self, fd: FileDesc, buf: &mut [u8]) -> FsResult<usize>;
    fn write(&self, fd: FileDesc, buf: &[u8]) -> FsResult<usize>;
    fn seek(&self, fd: FileDesc, offset: i64, whence: Whence) -> FsResult<u64>;
    fn tell(&self, fd: FileDesc) -> FsResult<u64>;
    fn total(&self, fd: FileDesc) -> FsResult<u64>;
    fn readdir(&self, fd: FileDesc) -> FsResult<Option<DirEntry>>;
    fn rewinddir(&self, fd: FileDesc) -> FsResult<()>;
    fn unlink(&self, path: &str) -> FsResult<()>;
    fn mkdir(&self, path: &str) -> FsResult<()>;
    fn rmdir(&self, path: &str) -> FsResult<()>;
    fn stat(&self, path: &str, follow_links: bool) -> FsResult<Stat>;
    fn fstat(&self, fd: FileDesc) -> FsResult<Stat>;
    fn fcntl(&self, fd: FileDesc, cmd: FcntlCmd) -> FsResult<u32>;
    fn sync(&self) -> FsResult<()>;

    /// Flush and release the backing device.
    fn shutdown(&self) -> FsResult<()>;

    fn rename(&self, _from: &str, _to: &str) -> FsResult<()> {
        Err(FsError::Unsupported)
    }

    fn link(&self, _target: &str, _path: &str) -> FsResult<()> {
        Err(FsError::Unsupported)
    }

    fn symlink(&self, _target: &str, _path: &str) -> FsResult<()> {
        Err(FsError::Unsupported)
    }

    fn readlink(&self, _path: &str) -> FsResult<String> {
        Err(FsError::Unsupported)
    }
}

struct Mount {
    prefix: String,
    fs: Arc<dyn FileSystem>,
}

/// Registry of mounted engines keyed by path prefix. Lookup returns the
/// longest prefix that matches on a component boundary.
#[derive(Default)]
pub struct MountTable {
    mounts: Vec<Mount>,
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mount(&mut self, prefix: &str, fs: Arc<dyn FileSystem>) -> FsResult<()> {
        let prefix = normalize_prefix(prefix);
        if self.mounts.iter().any(|m| m.prefix == prefix) {
            return Err(FsError::Exists);
        }
        info!("mounting filesystem at {}", prefix);
        self.mounts.push(Mount { prefix, fs });
        Ok(())
    }

    /// Remove a mount, flushing it. The engine may still be referenced by
    /// outstanding handles; that is the caller's problem, as it always was.
    pub fn unmount(&mut self, prefix: &str) -> FsResult<()> {
        let prefix = normalize_prefix(prefix);
        let pos = self
            .mounts
            .iter()
            .position(|m| m.prefix == prefix)
            .ok_or(FsError::NoEntry)?;
        let mount = self.mounts.remove(pos);
        info!("unmounting {}", prefix);
        mount.fs.shutdown()
    }

    pub fn sync(&self, prefix: &str) -> FsResult<()> {
        let prefix = normalize_prefix(prefix);
        let mount = self
            .mounts
            .iter()
            .find(|m| m.prefix == prefix)
            .ok_or(FsError::NoEntry)?;
        mount.fs.sync()
    }

    /// Longest-prefix lookup. Returns the engine and the path remainder
    /// (always beginning with `/`, or empty for the mount root).
    pub fn lookup<'p>(&self, path: &'p str) -> FsResult<(Arc<dyn FileSystem>, &'p str)> {
        let mut best: Option<(&Mount, &'p str)> = None;
        for mount in &self.mounts {
            let rest = if mount.prefix == "/" {
                Some(path)
            } else if let Some(rest) = path.strip_prefix(mount.prefix.as_str()) {
                // Must match at a component boundary.
                if rest.is_empty() || rest.starts_with('/') {
                    Some(rest)
                } else {
                    None
                }
            } else {
                None
            };
            if let Some(rest) = rest {
                let better = match &best {
                    Some((cur, _)) => mount.prefix.len() > cur.prefix.len(),
                    None => true,
                };
                if better {
                    best = Some((mount, rest));
                }
            }
        }
        best.map(|(m, rest)| (Arc::clone(&m.fs), rest))
            .ok_or(FsError::NoEntry)
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }
}

lazy_static! {
    /// Process-wide mount table used by the convenience functions below
    /// and by the CLI.
    pub static ref MOUNTS: Mutex<MountTable> = Mutex::new(MountTable::new());
}

pub fn mount(prefix: &str, fs: Arc<dyn FileSystem>) -> FsResult<()> {
    MOUNTS.lock().unwrap().mount(prefix, fs)
}

pub fn unmount(prefix: &str) -> FsResult<()> {
    MOUNTS.lock().unwrap().unmount(prefix)
}

pub fn sync(prefix: &str) -> FsResult<()> {
    MOUNTS.lock().unwrap().sync(prefix)
}

pub fn lookup(path: &str) -> FsResult<(Arc<dyn FileSystem>, String)> {
    let table = MOUNTS.lock().unwrap();
    let (fs, rest) = table.lookup(path)?;
    Ok((fs, rest.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullFs;

    impl FileSystem for NullFs {
        fn open(&self, _path: &str, _mode: u32) -> FsResult<FileDesc> {
            Err(FsError::NoEntry)
        }
        fn close(&self, _fd: FileDesc) -> FsResult<()> {
            Ok(())
        }
        fn read(&self, _fd: FileDesc, _buf: &mut [u8]) -> FsResult<usize> {
            Err(FsError::BadDescriptor)
        }
        fn write(&self, _fd: FileDesc, _buf: &[u8]) -> FsResult<usize> {
            Err(FsError::BadDescriptor)
        }
        fn seek(&self, _fd: FileDesc, _offset: i64, _whence: Whence) -> FsResult<u64> {
            Err(FsError::BadDescriptor)
        }
        fn tell(&self, _fd: FileDesc) -> FsResult<u64> {
            Err(FsError::BadDescriptor)
        }
        fn total(&self, _fd: FileDesc) -> FsResult<u64> {
            Err(FsError::BadDescriptor)
        }
        fn readdir(&self, _fd: FileDesc) -> FsResult<Option<DirEntry>> {
            Ok(None)
        }
        fn rewinddir(&self, _fd: FileDesc) -> FsResult<()> {
            Ok(())
        }
        fn unlink(&self, _path: &str) -> FsResult<()> {
            Err(FsError::ReadOnly)
        }
        fn mkdir(&self, _path: &str) -> FsResult<()> {
            Err(FsError::ReadOnly)
        }
        fn rmdir(&self, _path: &str) -> FsResult<()> {
            Err(FsError::ReadOnly)
        }
        fn stat(&self, _path: &str, _follow: bool) -> FsResult<Stat> {
            Err(FsError::NoEntry)
        }
        fn fstat(&self, _fd: FileDesc) -> FsResult<Stat> {
            Err(FsError::BadDescriptor)
        }
        fn fcntl(&self, _fd: FileDesc, _cmd: FcntlCmd) -> FsResult<u32> {
            Err(FsError::BadDescriptor)
        }
        fn sync(&self) -> FsResult<()> {
            Ok(())
        }
        fn shutdown(&self) -> FsResult<()> {
            Ok(())
        }
    }

    #[test]
    fn longest_prefix_wins() -> FsResult<()> {
        let mut table = MountTable::new();
        table.mount("/mnt", Arc::new(NullFs))?;
        table.mount("/mnt/inner", Arc::new(NullFs))?;
        let (_, rest) = table.lookup("/mnt/inner/file.txt")?;
        assert_eq!(rest, "/file.txt");
        let (_, rest) = table.lookup("/mnt/other")?;
        assert_eq!(rest, "/other");
        Ok(())
    }

    #[test]
    fn prefix_matches_whole_components_only() -> FsResult<()> {
        let mut table = MountTable::new();
        table.mount("/mnt", Arc::new(NullFs))?;
        assert!(matches!(table.lookup("/mntx/file"), Err(FsError::NoEntry)));
        let (_, rest) = table.lookup("/mnt")?;
        assert_eq!(rest, "");
        Ok(())
    }

    #[test]
    fn duplicate_mount_rejected() -> FsResult<()> {
        let mut table = MountTable::new();
        table.mount("/a", Arc::new(NullFs))?;
        assert_eq!(table.mount("/a/", Arc::new(NullFs)).unwrap_err(), FsError::Exists);
        table.unmount("/a")?;
        assert!(table.is_empty());
        Ok(())
    }
}
