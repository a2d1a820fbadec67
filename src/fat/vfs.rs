//! POSIX-shaped layer over the FAT engine: open-handle table, byte-stream
//! I/O following the cluster chain, and directory iteration with
//! long-name reassembly. One engine-wide mutex serializes everything.

use crate::errors::{FsError, FsResult};
use crate::fat::desc::*;
use crate::fat::dir::{self, DentryPos, DentryRef, DirWalker};
use crate::fat::fs::{FatFs, Loc};
use crate::fspath;
use crate::mount::flags::*;
use crate::mount::{DirEntry, FcntlCmd, FileDesc, FileSystem, NodeKind, Stat, Whence};
use crate::ucs2;
use block_dev::BlockDevice;
use log::debug;
use std::sync::{Mutex, MutexGuard};

pub const MAX_FAT_FILES: usize = 16;

struct FileHandle {
    dentry: FatDentry,
    /// None for the synthesized root directory.
    dentry_pos: Option<DentryPos>,
    long_pos: Option<DentryPos>,
    /// First record of the data, None for an empty file.
    start: Option<Loc>,
    mode: u32,
    ptr: u64,
    /// Current cluster cursor for file I/O; None at/after end of chain.
    cluster: Option<u32>,
    /// Index of the current cluster within the chain.
    cluster_order: u32,
    /// Set by seek; the next I/O restores the cursor first.
    seek_dirty: bool,
    /// Directory iteration cursor; None once exhausted.
    dir_walker: Option<DirWalker>,
}

struct FatState {
    fs: FatFs,
    fh: [Option<FileHandle>; MAX_FAT_FILES],
}

/// A mounted FAT volume.
pub struct FatVfs {
    state: Mutex<FatState>,
}

fn stat_of(fs: &FatFs, ent: &FatDentry) -> Stat {
    let cs = fs.cluster_size() as u64;
    let (kind, size, blocks) = if ent.is_dir() {
        (NodeKind::Dir, 0, 0)
    } else {
        let sz = ent.size.get() as u64;
        (NodeKind::File, sz, (sz + cs - 1) / cs)
    };
    let perm = if ent.attr & FAT_ATTR_READ_ONLY != 0 {
        0o555
    } else {
        0o777
    };
    Stat {
        ino: ent.first_cluster() as u64,
        kind,
        perm,
        nlink: 1,
        uid: 0,
        gid: 0,
        size,
        blksize: fs.cluster_size() as u32,
        blocks,
        atime: dos_time_to_unix(ent.adate.get(), 0),
        mtime: dos_time_to_unix(ent.mdate.get(), ent.mtime.get()),
        ctime: dos_time_to_unix(ent.cdate.get(), ent.ctime.get()),
    }
}

/// Move the handle's cluster cursor to chain position `order`, starting
/// over from the head when the cursor is past it. Writing extends the
/// chain (allocating the very first cluster if the file is empty);
/// reading reports end-of-chain as Ok(false).
fn advance_cluster(
    fs: &mut FatFs,
    h: &mut FileHandle,
    order: u32,
    write: bool,
) -> FsResult<bool> {
    let (mut cl, mut clo) = match h.cluster {
        Some(cl) if h.cluster_order <= order => (cl, h.cluster_order),
        _ => {
            // Rewind to the head of the chain.
            let head = h.dentry.first_cluster();
            if head < 2 {
                if !write {
                    return Ok(false);
                }
                let ncl = fs.allocate_cluster()?;
                if let Err(e) = fs.record_cleared(Loc::Cluster(ncl)).map(|_| ()) {
                    fs.write_fat(ncl, FAT_FREE_CLUSTER)?;
                    return Err(e);
                }
                h.dentry.set_first_cluster(ncl);
                h.start = Some(Loc::Cluster(ncl));
                if let Some(pos) = h.dentry_pos {
                    dir::update_dentry(fs, &h.dentry, pos)?;
                }
                (ncl, 0)
            } else {
                (head, 0)
            }
        }
    };

    while clo < order {
        match fs.next_cluster(cl)? {
            Some(next) => cl = next,
            None => {
                if !write {
                    h.cluster = None;
                    h.cluster_order = clo;
                    h.seek_dirty = false;
                    return Ok(false);
                }
                let ncl = fs.allocate_cluster()?;
                if let Err(e) = fs.record_cleared(Loc::Cluster(ncl)).map(|_| ()) {
                    fs.write_fat(ncl, FAT_FREE_CLUSTER)?;
                    return Err(e);
                }
                if let Err(e) = fs.write_chain_link(cl, ncl) {
                    fs.write_fat(ncl, FAT_FREE_CLUSTER)?;
                    return Err(e);
                }
                cl = ncl;
            }
        }
        clo += 1;
    }

    h.cluster = Some(cl);
    h.cluster_order = clo;
    h.seek_dirty = false;
    Ok(true)
}

impl FatState {
    fn handle(&mut self, fd: FileDesc) -> FsResult<&mut FileHandle> {
        self.fh
            .get_mut(fd)
            .and_then(|h| h.as_mut())
            .ok_or(FsError::BadDescriptor)
    }

    fn is_open(&self, pos: DentryPos) -> bool {
        self.fh
            .iter()
            .flatten()
            .any(|h| h.dentry_pos == Some(pos))
    }

    /// Create a file or directory entry under `path`. A directory gets a
    /// fresh zeroed cluster for its dot entries; a file starts empty,
    /// with no clusters at all. Returns the new entry, its first cluster
    /// (0 for a file), and the parent's first cluster (0 when the parent
    /// is the root).
    fn create_entry(&mut self, path: &str, attr: u8) -> FsResult<(DentryRef, u32, u32)> {
        let fs = &mut self.fs;
        let (parent, name) = fspath::split_parent(path).ok_or(FsError::Exists)?;

        let pref = dir::find_dentry(fs, parent)?;
        if !pref.dentry.is_dir() {
            return Err(FsError::NotDir);
        }
        let pstart = dir::dentry_start_loc(fs, &pref).ok_or(FsError::Corrupt)?;

        if dir::find_child(fs, name, pstart)?.is_some() {
            return Err(FsError::Exists);
        }

        let cl = if attr & FAT_ATTR_DIRECTORY != 0 {
            let cl = fs.allocate_cluster()?;
            if let Err(e) = fs.record_cleared(Loc::Cluster(cl)).map(|_| ()) {
                fs.write_fat(cl, FAT_FREE_CLUSTER)?;
                return Err(e);
            }
            cl
        } else {
            0
        };

        let (pos, long_pos) = match dir::add_dentry(fs, name, pstart, attr, cl) {
            Ok(v) => v,
            Err(e) => {
                if cl != 0 {
                    fs.erase_chain(cl)?;
                }
                return Err(e);
            }
        };
        let dentry = dir::get_dentry(fs, pos)?;
        let parent_cl = if pref.pos.is_none() {
            0
        } else {
            pref.dentry.first_cluster()
        };
        debug!("created {} at cluster {}", path, cl);
        Ok((
            DentryRef {
                dentry,
                pos: Some(pos),
                long_pos,
            },
            cl,
            parent_cl,
        ))
    }
}

impl FatVfs {
    /// Mount a FAT volume from a block device.
    pub fn mount(dev: Box<dyn BlockDevice>, flags: u32) -> FsResult<FatVfs> {
        let fs = FatFs::mount(dev, flags)?;
        Ok(FatVfs {
            state: Mutex::new(FatState {
                fs,
                fh: Default::default(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, FatState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run a closure against the raw engine; test support.
    pub fn with_fs<R>(&self, f: impl FnOnce(&mut FatFs) -> R) -> R {
        f(&mut self.lock().fs)
    }
}

impl FileSystem for FatVfs {
    fn open(&self, path: &str, mode: u32) -> FsResult<FileDesc> {
        let mut st = self.lock();

        if mode & (O_TRUNC | O_WRONLY | O_RDWR) != 0 && !st.fs.is_read_write() {
            return Err(FsError::ReadOnly);
        }

        let fd = st
            .fh
            .iter()
            .position(|h| h.is_none())
            .ok_or(FsError::TooManyFiles)?;

        let (r, created) = match dir::find_dentry(&mut st.fs, path) {
            Ok(r) => (r, false),
            Err(FsError::NoEntry) if mode & O_CREAT != 0 => {
                if !st.fs.is_read_write() {
                    return Err(FsError::ReadOnly);
                }
                let (r, _, _) = st.create_entry(path, FAT_ATTR_ARCHIVE)?;
                (r, true)
            }
            Err(e) => return Err(e),
        };
        let mut dentry = r.dentry;

        if !created {
            if dentry.is_dir() && (mode & O_WRONLY != 0 || mode & O_DIR == 0) {
                return Err(FsError::IsDir);
            }
            if mode & O_DIR != 0 && !dentry.is_dir() {
                return Err(FsError::NotDir);
            }
            if dentry.is_volume_label() {
                return Err(FsError::NoEntry);
            }
        }

        if !created && mode & (O_WRONLY | O_RDWR) != 0 && mode & O_TRUNC != 0 {
            // Drop the whole chain; an empty file owns no clusters.
            let cl = dentry.first_cluster();
            if cl >= 2 {
                st.fs.erase_chain(cl)?;
            }
            dentry.set_first_cluster(0);
            dentry.size.set(0);
            fill_mtime(&mut dentry);
            if let Some(pos) = r.pos {
                dir::update_dentry(&mut st.fs, &dentry, pos)?;
            }
        }

        let start = dir::dentry_start_loc(
            &st.fs,
            &DentryRef {
                dentry,
                pos: r.pos,
                long_pos: r.long_pos,
            },
        );
        let dir_walker = if mode & O_DIR != 0 {
            start.map(|s| DirWalker::new(&st.fs, s))
        } else {
            None
        };
        let cluster = match start {
            Some(Loc::Cluster(cl)) => Some(cl),
            _ => None,
        };

        st.fh[fd] = Some(FileHandle {
            dentry,
            dentry_pos: r.pos,
            long_pos: r.long_pos,
            start,
            mode,
            ptr: 0,
            cluster,
            cluster_order: 0,
            seek_dirty: false,
            dir_walker,
        });
        Ok(fd)
    }

    fn close(&self, fd: FileDesc) -> FsResult<()> {
        let mut st = self.lock();
        st.fh
            .get_mut(fd)
            .and_then(|h| h.take())
            .map(|_| ())
            .ok_or(FsError::BadDescriptor)
    }

    fn read(&self, fd: FileDesc, buf: &mut [u8]) -> FsResult<usize> {
        let mut st = self.lock();
        let FatState { fs, fh } = &mut *st;
        let handle = fh
            .get_mut(fd)
            .and_then(|h| h.as_mut())
            .ok_or(FsError::BadDescriptor)?;

        let mode = handle.mode & O_MODE_MASK;
        if mode != O_RDONLY && mode != O_RDWR {
            return Err(FsError::BadDescriptor);
        }
        if handle.mode & O_DIR != 0 {
            return Err(FsError::IsDir);
        }

        let size = handle.dentry.size.get() as u64;
        if handle.ptr >= size {
            return Ok(0);
        }
        let total = buf.len().min((size - handle.ptr) as usize);
        let bs = fs.cluster_size() as u64;

        if handle.seek_dirty || handle.cluster.is_none() {
            if !advance_cluster(fs, handle, (handle.ptr / bs) as u32, false)? {
                return Ok(0);
            }
        }

        let mut remaining = total;
        let mut out = 0usize;
        while remaining > 0 {
            let cl = handle.cluster.ok_or(FsError::Io)?;
            let bo = (handle.ptr % bs) as usize;
            let take = remaining.min(bs as usize - bo);

            let block = fs.record(Loc::Cluster(cl))?;
            buf[out..out + take].copy_from_slice(&block[bo..bo + take]);
            handle.ptr += take as u64;
            out += take;
            remaining -= take;

            if bo + take == bs as usize {
                // Follow the chain eagerly, like the cursor always has.
                handle.cluster = fs.next_cluster(cl)?;
                handle.cluster_order += 1;
            }
        }
        Ok(total)
    }

    fn write(&self, fd: FileDesc, buf: &[u8]) -> FsResult<usize> {
        let mut st = self.lock();
        let FatState { fs, fh } = &mut *st;
        let handle = fh
            .get_mut(fd)
            .and_then(|h| h.as_mut())
            .ok_or(FsError::BadDescriptor)?;

        let mode = handle.mode & O_MODE_MASK;
        if mode != O_WRONLY && mode != O_RDWR {
            return Err(FsError::BadDescriptor);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let bs = fs.cluster_size() as u64;
        if handle.mode & O_APPEND != 0 {
            handle.ptr = handle.dentry.size.get() as u64;
            handle.seek_dirty = true;
        }
        if handle.ptr + buf.len() as u64 > u32::MAX as u64 {
            return Err(FsError::FileTooLarge);
        }

        if handle.seek_dirty || handle.cluster.is_none() {
            advance_cluster(fs, handle, (handle.ptr / bs) as u32, true)?;
        }

        let mut remaining = buf.len();
        let mut consumed = 0usize;
        while remaining > 0 {
            let cl = handle.cluster.ok_or(FsError::Io)?;
            let bo = (handle.ptr % bs) as usize;
            let take = remaining.min(bs as usize - bo);

            let block = fs.record(Loc::Cluster(cl))?;
            block[bo..bo + take].copy_from_slice(&buf[consumed..consumed + take]);
            fs.mark_record_dirty(Loc::Cluster(cl))?;
            handle.ptr += take as u64;
            consumed += take;
            remaining -= take;

            if bo + take == bs as usize {
                if remaining > 0 {
                    advance_cluster(fs, handle, handle.cluster_order + 1, true)?;
                } else {
                    // Stopping exactly on a boundary: don't extend the
                    // chain for data that may never come.
                    handle.seek_dirty = true;
                }
            }
        }

        if handle.ptr > handle.dentry.size.get() as u64 {
            handle.dentry.size.set(handle.ptr as u32);
        }
        fill_mtime(&mut handle.dentry);
        if let Some(pos) = handle.dentry_pos {
            dir::update_dentry(fs, &handle.dentry, pos)?;
        }
        Ok(buf.len())
    }

    fn seek(&self, fd: FileDesc, offset: i64, whence: Whence) -> FsResult<u64> {
        let mut st = self.lock();
        let handle = st.handle(fd)?;
        if handle.mode & O_DIR != 0 {
            return Err(FsError::InvalidArg);
        }
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => handle.ptr as i64,
            Whence::End => handle.dentry.size.get() as i64,
        };
        let pos = base.checked_add(offset).ok_or(FsError::InvalidArg)?;
        if pos < 0 {
            return Err(FsError::InvalidArg);
        }
        handle.ptr = pos as u64;
        handle.seek_dirty = true;
        Ok(handle.ptr)
    }

    fn tell(&self, fd: FileDesc) -> FsResult<u64> {
        let mut st = self.lock();
        let handle = st.handle(fd)?;
        if handle.mode & O_DIR != 0 {
            return Err(FsError::InvalidArg);
        }
        Ok(handle.ptr)
    }

    fn total(&self, fd: FileDesc) -> FsResult<u64> {
        let mut st = self.lock();
        let handle = st.handle(fd)?;
        if handle.mode & O_DIR != 0 {
            return Err(FsError::InvalidArg);
        }
        Ok(handle.dentry.size.get() as u64)
    }

    fn readdir(&self, fd: FileDesc) -> FsResult<Option<DirEntry>> {
        let mut st = self.lock();
        let FatState { fs, fh } = &mut *st;
        let handle = fh
            .get_mut(fd)
            .and_then(|h| h.as_mut())
            .ok_or(FsError::BadDescriptor)?;
        if handle.mode & O_DIR == 0 {
            return Err(FsError::BadDescriptor);
        }

        let mut w = match handle.dir_walker.take() {
            Some(w) => w,
            None => return Ok(None),
        };

        // Long-name fragments accumulate here until the short entry that
        // closes the chain shows up.
        let mut namebuf = [0u16; 21 * FAT_LONGNAME_SEGMENT];
        let mut has_long = false;

        loop {
            let ent = w.read(fs)?;

            if ent.name[0] == FAT_ENTRY_EOD {
                return Ok(None);
            } else if ent.name[0] == FAT_ENTRY_FREE {
                has_long = false;
            } else if ent.is_long_name() {
                let lent = w.read_long(fs)?;
                let pos = lent.position() as usize;
                if lent.is_last() {
                    namebuf.fill(0);
                }
                if (1..=20).contains(&pos) {
                    namebuf[(pos - 1) * FAT_LONGNAME_SEGMENT..pos * FAT_LONGNAME_SEGMENT]
                        .copy_from_slice(&lent.segment());
                    has_long = true;
                }
            } else if ent.is_volume_label() {
                has_long = false;
            } else {
                let name = if has_long {
                    let len = ucs2::strlen_ucs2(&namebuf);
                    String::from_utf8_lossy(&ucs2::ucs2_to_utf8(&namebuf[..len])).into_owned()
                } else {
                    dir::copy_shortname(&ent)
                };
                if w.advance(fs)? {
                    handle.dir_walker = Some(w);
                }
                return Ok(Some(DirEntry {
                    name,
                    size: ent.size.get() as u64,
                    mtime: dos_time_to_unix(ent.mdate.get(), ent.mtime.get()),
                    kind: if ent.is_dir() {
                        NodeKind::Dir
                    } else {
                        NodeKind::File
                    },
                }));
            }

            if !w.advance(fs)? {
                return Ok(None);
            }
        }
    }

    fn rewinddir(&self, fd: FileDesc) -> FsResult<()> {
        let mut st = self.lock();
        let FatState { fs, fh } = &mut *st;
        let handle = fh
            .get_mut(fd)
            .and_then(|h| h.as_mut())
            .ok_or(FsError::BadDescriptor)?;
        if handle.mode & O_DIR == 0 {
            return Err(FsError::BadDescriptor);
        }
        handle.ptr = 0;
        handle.cluster_order = 0;
        handle.dir_walker = handle.start.map(|s| DirWalker::new(fs, s));
        Ok(())
    }

    fn unlink(&self, path: &str) -> FsResult<()> {
        let mut st = self.lock();
        if !st.fs.is_read_write() {
            return Err(FsError::ReadOnly);
        }

        let r = dir::find_dentry(&mut st.fs, path)?;
        if r.dentry.is_dir() {
            return Err(FsError::IsDir);
        }
        if r.dentry.is_volume_label() {
            return Err(FsError::NoEntry);
        }
        if let Some(pos) = r.pos {
            if st.is_open(pos) {
                return Err(FsError::Busy);
            }
        }

        st.fs.erase_chain(r.dentry.first_cluster())?;
        dir::erase_dentry(&mut st.fs, &r)
    }

    fn mkdir(&self, path: &str) -> FsResult<()> {
        let mut st = self.lock();
        if !st.fs.is_read_write() {
            return Err(FsError::ReadOnly);
        }

        let (_r, cl, parent_cl) = st.create_entry(path, FAT_ATTR_DIRECTORY)?;

        // `.` and `..` lead the fresh directory; `..` is zero when the
        // parent is the root.
        let dot = dir::make_raw_dentry(DOT_NAME, FAT_ATTR_DIRECTORY, cl);
        let dotdot = dir::make_raw_dentry(DOTDOT_NAME, FAT_ATTR_DIRECTORY, parent_cl);
        dir::update_dentry(
            &mut st.fs,
            &dot,
            DentryPos {
                loc: Loc::Cluster(cl),
                offset: 0,
            },
        )?;
        dir::update_dentry(
            &mut st.fs,
            &dotdot,
            DentryPos {
                loc: Loc::Cluster(cl),
                offset: FAT_DENTRY_SIZE as u32,
            },
        )
    }

    fn rmdir(&self, path: &str) -> FsResult<()> {
        let mut st = self.lock();
        if !st.fs.is_read_write() {
            return Err(FsError::ReadOnly);
        }

        let r = dir::find_dentry(&mut st.fs, path)?;
        if !r.dentry.is_dir() {
            return Err(FsError::NotDir);
        }
        let pos = match r.pos {
            Some(pos) => pos,
            // The root directory is not up for deletion.
            None => return Err(FsError::NoPermission),
        };
        if st.is_open(pos) {
            return Err(FsError::Busy);
        }

        let start = dir::dentry_start_loc(&st.fs, &r).ok_or(FsError::Corrupt)?;
        if !dir::is_dir_empty(&mut st.fs, start)? {
            return Err(FsError::NotEmpty);
        }

        st.fs.erase_chain(r.dentry.first_cluster())?;
        dir::erase_dentry(&mut st.fs, &r)
    }

    fn stat(&self, path: &str, _follow_links: bool) -> FsResult<Stat> {
        let mut st = self.lock();
        let r = dir::find_dentry(&mut st.fs, path)?;
        Ok(stat_of(&st.fs, &r.dentry))
    }

    fn fstat(&self, fd: FileDesc) -> FsResult<Stat> {
        let mut st = self.lock();
        let FatState { fs, fh } = &mut *st;
        let handle = fh
            .get_mut(fd)
            .and_then(|h| h.as_mut())
            .ok_or(FsError::BadDescriptor)?;
        Ok(stat_of(fs, &handle.dentry))
    }

    fn fcntl(&self, fd: FileDesc, cmd: FcntlCmd) -> FsResult<u32> {
        let mut st = self.lock();
        let handle = st.handle(fd)?;
        match cmd {
            FcntlCmd::GetFl => Ok(handle.mode),
            FcntlCmd::SetFl(_) | FcntlCmd::GetFd | FcntlCmd::SetFd(_) => Ok(0),
        }
    }

    fn sync(&self) -> FsResult<()> {
        self.lock().fs.sync()
    }

    fn shutdown(&self) -> FsResult<()> {
        self.lock().fs.shutdown()
    }
}
