//! POSIX-shaped layer over the ext2 engine: an open-handle table and the
//! path operations, all serialized by one engine-wide mutex.

use crate::errors::{FsError, FsResult};
use crate::ext2::desc::*;
use crate::ext2::dir;
use crate::ext2::fs::{now_epoch, Ext2Fs};
use crate::fspath;
use crate::mount::flags::*;
use crate::mount::{DirEntry, FcntlCmd, FileDesc, FileSystem, NodeKind, Stat, Whence};
use block_dev::BlockDevice;
use log::debug;
use std::sync::{Mutex, MutexGuard};
use zerocopy::AsBytes;

pub const MAX_EXT2_FILES: usize = 16;

struct FileHandle {
    ino: u32,
    inode: Ext2INode,
    inode_dirty: bool,
    mode: u32,
    ptr: u64,
}

struct Ext2State {
    fs: Ext2Fs,
    fh: [Option<FileHandle>; MAX_EXT2_FILES],
}

/// A mounted ext2 volume.
pub struct Ext2Vfs {
    state: Mutex<Ext2State>,
}

fn kind_of(mode: u16) -> NodeKind {
    match mode & EXT2_S_IFMT {
        EXT2_S_IFDIR => NodeKind::Dir,
        EXT2_S_IFLNK => NodeKind::Symlink,
        EXT2_S_IFCHR => NodeKind::CharDev,
        EXT2_S_IFBLK => NodeKind::BlockDev,
        EXT2_S_IFIFO => NodeKind::Fifo,
        EXT2_S_IFSOCK => NodeKind::Socket,
        _ => NodeKind::File,
    }
}

fn stat_of(ino: u32, inode: &Ext2INode) -> FsResult<Stat> {
    let size = match inode.file_type() {
        EXT2_S_IFREG => {
            let sz = inode.size();
            if sz > i64::MAX as u64 {
                return Err(FsError::Overflow);
            }
            sz
        }
        _ => inode.i_size.get() as u64,
    };
    Ok(Stat {
        ino: ino as u64,
        kind: kind_of(inode.i_mode.get()),
        perm: inode.i_mode.get() & 0x0FFF,
        nlink: inode.i_links_count.get() as u32,
        uid: inode.i_uid.get() as u32,
        gid: inode.i_gid.get() as u32,
        size,
        blksize: 512,
        blocks: inode.i_blocks.get() as u64,
        atime: inode.i_atime.get() as i64,
        mtime: inode.i_mtime.get() as i64,
        ctime: inode.i_ctime.get() as i64,
    })
}

impl Ext2State {
    fn handle(&mut self, fd: FileDesc) -> FsResult<&mut FileHandle> {
        self.fh
            .get_mut(fd)
            .and_then(|h| h.as_mut())
            .ok_or(FsError::BadDescriptor)
    }

    fn is_open(&self, ino: u32) -> bool {
        self.fh.iter().flatten().any(|h| h.ino == ino)
    }

    fn free_slot(&self) -> FsResult<FileDesc> {
        self.fh
            .iter()
            .position(|h| h.is_none())
            .ok_or(FsError::TooManyFiles)
    }

    /// Split a path, resolve the parent directory, and hand back
    /// (parent inode number, parent inode, basename).
    fn resolve_parent<'p>(&mut self, path: &'p str) -> FsResult<(u32, Ext2INode, &'p str)> {
        let (parent, name) = fspath::split_parent(path).ok_or(FsError::NoPermission)?;
        let (pino, pinode) = self.fs.inode_by_path(parent, true)?;
        if !pinode.is_dir() {
            return Err(FsError::NotDir);
        }
        Ok((pino, pinode, name))
    }

    /// Create an empty regular file under `path`, inheriting ownership
    /// from the parent directory.
    fn create_empty_file(&mut self, path: &str) -> FsResult<(u32, Ext2INode)> {
        let (pino, mut pinode, name) = self.resolve_parent(path)?;
        let now = now_epoch();

        let (nino, mut ninode) = self.fs.inode_alloc(pino, false)?;
        ninode
            .i_mode
            .set((pinode.i_mode.get() & !EXT2_S_IFMT) | EXT2_S_IFREG);
        ninode.i_uid = pinode.i_uid;
        ninode.i_gid = pinode.i_gid;
        ninode.i_atime.set(now);
        ninode.i_ctime.set(now);
        ninode.i_mtime.set(now);
        ninode.i_links_count.set(1);

        if let Err(e) = dir::dir_add_entry(
            &mut self.fs,
            &mut pinode,
            pino,
            name,
            nino,
            Ext2FileType::RegularFile,
        ) {
            // Give the fresh inode back before reporting.
            self.fs.inode_put(nino, &ninode)?;
            self.fs.inode_deref(nino, false)?;
            return Err(e);
        }
        self.fs.inode_put(nino, &ninode)?;

        pinode.i_mtime.set(now);
        pinode.i_ctime.set(now);
        self.fs.inode_put(pino, &pinode)?;

        debug!("created {} as inode {}", path, nino);
        Ok((nino, ninode))
    }

    /// Walk `..` upward from `start` and fail if `forbidden` shows up on
    /// the way to the root. Used by rename to refuse making a directory
    /// its own ancestor.
    fn check_not_ancestor(&mut self, start: u32, forbidden: u32) -> FsResult<()> {
        let mut cur = start;
        // A corrupt parent chain must not spin forever.
        for _ in 0..u16::MAX {
            if cur == forbidden {
                return Err(FsError::InvalidArg);
            }
            let inode = self.fs.inode_get(cur)?;
            let (up, _) = dir::dir_lookup(&mut self.fs, &inode, "..")?.ok_or(FsError::Corrupt)?;
            if up == cur {
                return Ok(());
            }
            cur = up;
        }
        Err(FsError::Corrupt)
    }

    fn touch_dir(&mut self, ino: u32) -> FsResult<()> {
        let mut inode = self.fs.inode_get(ino)?;
        let now = now_epoch();
        inode.i_mtime.set(now);
        inode.i_ctime.set(now);
        self.fs.inode_put(ino, &inode)
    }
}

impl Ext2Vfs {
    /// Mount an ext2 volume from a block device.
    pub fn mount(dev: Box<dyn BlockDevice>, flags: u32) -> FsResult<Ext2Vfs> {
        let fs = Ext2Fs::mount(dev, flags)?;
        Ok(Ext2Vfs {
            state: Mutex::new(Ext2State {
                fs,
                fh: Default::default(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Ext2State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run a closure against the raw engine; test support.
    pub fn with_fs<R>(&self, f: impl FnOnce(&mut Ext2Fs) -> R) -> R {
        f(&mut self.lock().fs)
    }
}

impl FileSystem for Ext2Vfs {
    fn open(&self, path: &str, mode: u32) -> FsResult<FileDesc> {
        let mut st = self.lock();

        if mode & (O_TRUNC | O_WRONLY | O_RDWR) != 0 && !st.fs.is_read_write() {
            return Err(FsError::ReadOnly);
        }

        let fd = st.free_slot()?;

        let (ino, mut inode, created) = match st.fs.inode_by_path(path, true) {
            Ok((ino, inode)) => (ino, inode, false),
            Err(FsError::NoEntry) if mode & O_CREAT != 0 => {
                let (ino, inode) = st.create_empty_file(path)?;
                (ino, inode, true)
            }
            Err(e) => return Err(e),
        };

        if !created {
            // No writing through a directory handle, and a directory open
            // requires asking for a directory.
            if inode.is_dir() && (mode & O_WRONLY != 0 || mode & O_DIR == 0) {
                return Err(FsError::IsDir);
            }
            if mode & O_DIR != 0 && !inode.is_dir() {
                return Err(FsError::NotDir);
            }
        }

        let mut inode_dirty = false;
        if mode & (O_WRONLY | O_RDWR) != 0 && mode & O_TRUNC != 0 {
            st.fs.inode_free_all(&mut inode, false)?;
            inode.set_size(0);
            inode.i_dtime.set(0);
            inode.i_mtime.set(now_epoch());
            inode_dirty = true;
        }

        st.fh[fd] = Some(FileHandle {
            ino,
            inode,
            inode_dirty,
            mode,
            ptr: 0,
        });
        Ok(fd)
    }

    fn close(&self, fd: FileDesc) -> FsResult<()> {
        let mut st = self.lock();
        let handle = st.fh.get_mut(fd).and_then(|h| h.take()).ok_or(FsError::BadDescriptor)?;
        if handle.inode_dirty {
            st.fs.inode_put(handle.ino, &handle.inode)?;
        }
        Ok(())
    }

    fn read(&self, fd: FileDesc, buf: &mut [u8]) -> FsResult<usize> {
        let mut st = self.lock();
        let Ext2State { fs, fh } = &mut *st;
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

        let size = handle.inode.size();
        if handle.ptr >= size {
            return Ok(0);
        }
        let mut remaining = buf.len().min((size - handle.ptr) as usize);
        let total = remaining;
        let bs = fs.block_size() as u64;
        let mut out = 0usize;

        while remaining > 0 {
            let lblk = (handle.ptr / bs) as u32;
            let bo = (handle.ptr % bs) as usize;
            let take = remaining.min(bs as usize - bo);
            let bn = fs.inode_block_index(&handle.inode, lblk)?;
            if bn == 0 {
                // Hole: reads as zeros.
                buf[out..out + take].fill(0);
            } else {
                let block = fs.block(bn)?;
                buf[out..out + take].copy_from_slice(&block[bo..bo + take]);
            }
            handle.ptr += take as u64;
            out += take;
            remaining -= take;
        }
        Ok(total)
    }

    fn write(&self, fd: FileDesc, buf: &[u8]) -> FsResult<usize> {
        let mut st = self.lock();
        let Ext2State { fs, fh } = &mut *st;
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

        let size = handle.inode.size();
        if handle.mode & O_APPEND != 0 {
            handle.ptr = size;
        }

        let bs = fs.block_size() as u64;
        let mut remaining = buf.len();
        let mut consumed = 0usize;

        while remaining > 0 {
            let lblk = (handle.ptr / bs) as u32;
            let bo = (handle.ptr % bs) as usize;
            let take = remaining.min(bs as usize - bo);

            let mut bn = fs.inode_block_index(&handle.inode, lblk)?;
            if bn == 0 {
                // Blocks between the old end and the cursor stay holes;
                // only the block actually written gets storage.
                bn = fs.inode_alloc_block(&mut handle.inode, handle.ino, lblk)?;
                handle.inode_dirty = true;
            }
            let block = fs.block(bn)?;
            block[bo..bo + take].copy_from_slice(&buf[consumed..consumed + take]);
            fs.mark_block_dirty(bn)?;

            handle.ptr += take as u64;
            consumed += take;
            remaining -= take;
        }

        if handle.ptr > size {
            handle.inode.set_size(handle.ptr);
            handle.inode_dirty = true;
        }
        handle.inode.i_mtime.set(now_epoch());
        handle.inode_dirty = true;
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
            Whence::End => handle.inode.size() as i64,
        };
        let pos = base.checked_add(offset).ok_or(FsError::InvalidArg)?;
        if pos < 0 {
            return Err(FsError::InvalidArg);
        }
        handle.ptr = pos as u64;
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
        Ok(handle.inode.size())
    }

    fn readdir(&self, fd: FileDesc) -> FsResult<Option<DirEntry>> {
        let mut st = self.lock();
        let Ext2State { fs, fh } = &mut *st;
        let handle = fh
            .get_mut(fd)
            .and_then(|h| h.as_mut())
            .ok_or(FsError::BadDescriptor)?;
        if handle.mode & O_DIR == 0 {
            return Err(FsError::BadDescriptor);
        }

        let slot = match dir::dir_next_entry(fs, &handle.inode, handle.ptr)? {
            Some(slot) => slot,
            None => return Ok(None),
        };
        handle.ptr = slot.pos + slot.rec_len as u64;

        let child = fs.inode_get(slot.ino)?;
        Ok(Some(DirEntry {
            name: String::from_utf8_lossy(&slot.name).into_owned(),
            size: child.size(),
            mtime: child.i_mtime.get() as i64,
            kind: kind_of(child.i_mode.get()),
        }))
    }

    fn rewinddir(&self, fd: FileDesc) -> FsResult<()> {
        let mut st = self.lock();
        let handle = st.handle(fd)?;
        if handle.mode & O_DIR == 0 {
            return Err(FsError::BadDescriptor);
        }
        handle.ptr = 0;
        Ok(())
    }

    fn unlink(&self, path: &str) -> FsResult<()> {
        let mut st = self.lock();
        if !st.fs.is_read_write() {
            return Err(FsError::ReadOnly);
        }

        let (pino, mut pinode, name) = st.resolve_parent(path)?;
        let (ino, _) = dir::dir_lookup(&mut st.fs, &pinode, name)?.ok_or(FsError::NoEntry)?;
        let inode = st.fs.inode_get(ino)?;

        if inode.is_dir() {
            // That is what rmdir is for.
            return Err(FsError::NoPermission);
        }
        // Refuse to free data a live handle still references.
        if inode.i_links_count.get() == 1 && st.is_open(ino) {
            return Err(FsError::Busy);
        }

        let freed = dir::dir_rm_entry(&mut st.fs, &pinode, name)?;
        let now = now_epoch();
        pinode.i_mtime.set(now);
        pinode.i_ctime.set(now);
        st.fs.inode_put(pino, &pinode)?;
        st.fs.inode_deref(freed, false)
    }

    fn mkdir(&self, path: &str) -> FsResult<()> {
        let mut st = self.lock();
        if !st.fs.is_read_write() {
            return Err(FsError::ReadOnly);
        }
        if fspath::split_parent(path).is_none() {
            // The root directory already exists.
            return Err(FsError::Exists);
        }

        let (pino, mut pinode, name) = st.resolve_parent(path)?;
        if dir::dir_lookup(&mut st.fs, &pinode, name)?.is_some() {
            return Err(FsError::Exists);
        }

        let now = now_epoch();
        let (nino, mut ninode) = st.fs.inode_alloc(pino, true)?;
        ninode.i_mode = pinode.i_mode;
        ninode.i_uid = pinode.i_uid;
        ninode.i_gid = pinode.i_gid;
        ninode.i_atime.set(now);
        ninode.i_ctime.set(now);
        ninode.i_mtime.set(now);

        // Lay the directory out first, then publish it; a failure in
        // either step writes the half-built inode back and releases it,
        // returning its block and bitmap bits.
        if let Err(e) = dir::dir_create_empty(&mut st.fs, &mut ninode, nino, pino) {
            st.fs.inode_put(nino, &ninode)?;
            st.fs.inode_deref(nino, true)?;
            return Err(e);
        }

        if let Err(e) = dir::dir_add_entry(
            &mut st.fs,
            &mut pinode,
            pino,
            name,
            nino,
            Ext2FileType::Dir,
        ) {
            st.fs.inode_put(nino, &ninode)?;
            st.fs.inode_deref(nino, true)?;
            return Err(e);
        }
        st.fs.inode_put(nino, &ninode)?;

        // `..` inside the new directory links the parent.
        pinode
            .i_links_count
            .set(pinode.i_links_count.get() + 1);
        pinode.i_mtime.set(now);
        pinode.i_ctime.set(now);
        st.fs.inode_put(pino, &pinode)
    }

    fn rmdir(&self, path: &str) -> FsResult<()> {
        let mut st = self.lock();
        if !st.fs.is_read_write() {
            return Err(FsError::ReadOnly);
        }

        let (pino, mut pinode, name) = st.resolve_parent(path)?;
        let (ino, _) = dir::dir_lookup(&mut st.fs, &pinode, name)?.ok_or(FsError::NoEntry)?;
        let inode = st.fs.inode_get(ino)?;
        if !inode.is_dir() {
            return Err(FsError::NotDir);
        }
        if st.is_open(ino) {
            return Err(FsError::Busy);
        }
        if !dir::dir_is_empty(&mut st.fs, &inode)? {
            return Err(FsError::NotEmpty);
        }

        dir::dir_rm_entry(&mut st.fs, &pinode, name)?;
        let now = now_epoch();
        pinode
            .i_links_count
            .set(pinode.i_links_count.get() - 1);
        pinode.i_mtime.set(now);
        pinode.i_ctime.set(now);
        st.fs.inode_put(pino, &pinode)?;
        st.fs.inode_deref(ino, true)
    }

    fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        let mut st = self.lock();
        if !st.fs.is_read_write() {
            return Err(FsError::ReadOnly);
        }
        if fspath::split_parent(from).is_none() {
            // The root directory stays where it is.
            return Err(FsError::InvalidArg);
        }

        let (pino, pinode, fname) = st.resolve_parent(from)?;
        let (fino, _) = dir::dir_lookup(&mut st.fs, &pinode, fname)?.ok_or(FsError::NoEntry)?;
        let finode = st.fs.inode_get(fino)?;
        let src_is_dir = finode.is_dir();

        let (dpino, dpinode, dname) = st.resolve_parent(to)?;
        if pino == dpino && fname == dname {
            return Ok(());
        }

        let dest = dir::dir_lookup(&mut st.fs, &dpinode, dname)?;
        if let Some((dino, _)) = dest {
            let dinode = st.fs.inode_get(dino)?;
            let dest_is_dir = dinode.is_dir();
            if dest_is_dir && !src_is_dir {
                return Err(FsError::IsDir);
            }
            if !dest_is_dir && src_is_dir {
                return Err(FsError::NotDir);
            }
            if dest_is_dir && !dir::dir_is_empty(&mut st.fs, &dinode)? {
                return Err(FsError::NotEmpty);
            }
            if st.is_open(dino) {
                return Err(FsError::Busy);
            }
        }

        // A directory must not become its own descendant.
        if src_is_dir && dpino != pino {
            st.check_not_ancestor(dpino, fino)?;
        }

        // Displace whatever sits at the destination.
        if let Some((dino, _)) = dest {
            let mut dp = st.fs.inode_get(dpino)?;
            dir::dir_rm_entry(&mut st.fs, &dp, dname)?;
            st.fs.inode_put(dpino, &dp)?;
            let was_dir = st.fs.inode_get(dino)?.is_dir();
            st.fs.inode_deref(dino, was_dir)?;
            if was_dir {
                let mut dp = st.fs.inode_get(dpino)?;
                dp.i_links_count.set(dp.i_links_count.get() - 1);
                st.fs.inode_put(dpino, &dp)?;
            }
        }

        // Publish under the new name, then retire the old one.
        let ftype = Ext2FileType::from_mode(finode.i_mode.get());
        let mut dp = st.fs.inode_get(dpino)?;
        dir::dir_add_entry(&mut st.fs, &mut dp, dpino, dname, fino, ftype)?;
        st.fs.inode_put(dpino, &dp)?;

        let p = st.fs.inode_get(pino)?;
        dir::dir_rm_entry(&mut st.fs, &p, fname)?;
        st.fs.inode_put(pino, &p)?;

        if src_is_dir {
            dir::dir_redir_entry(&mut st.fs, &finode, "..", dpino)?;
            let mut p = st.fs.inode_get(pino)?;
            p.i_links_count.set(p.i_links_count.get() - 1);
            st.fs.inode_put(pino, &p)?;
            let mut dp = st.fs.inode_get(dpino)?;
            dp.i_links_count.set(dp.i_links_count.get() + 1);
            st.fs.inode_put(dpino, &dp)?;
        }

        st.touch_dir(pino)?;
        if dpino != pino {
            st.touch_dir(dpino)?;
        }
        Ok(())
    }

    fn link(&self, target: &str, path: &str) -> FsResult<()> {
        let mut st = self.lock();
        if !st.fs.is_read_write() {
            return Err(FsError::ReadOnly);
        }

        // Hard links attach to the symlink itself, not what it points at.
        let (tino, mut tinode) = st.fs.inode_by_path(target, false)?;
        if tinode.is_dir() {
            return Err(FsError::NoPermission);
        }
        if tinode.i_links_count.get() >= EXT2_LINK_MAX {
            return Err(FsError::NoSpace);
        }

        let (pino, mut pinode, name) = st.resolve_parent(path)?;
        if dir::dir_lookup(&mut st.fs, &pinode, name)?.is_some() {
            return Err(FsError::Exists);
        }

        let ftype = Ext2FileType::from_mode(tinode.i_mode.get());
        dir::dir_add_entry(&mut st.fs, &mut pinode, pino, name, tino, ftype)?;

        let now = now_epoch();
        tinode.i_links_count.set(tinode.i_links_count.get() + 1);
        tinode.i_ctime.set(now);
        st.fs.inode_put(tino, &tinode)?;

        pinode.i_mtime.set(now);
        pinode.i_ctime.set(now);
        st.fs.inode_put(pino, &pinode)
    }

    fn symlink(&self, target: &str, path: &str) -> FsResult<()> {
        let mut st = self.lock();
        if !st.fs.is_read_write() {
            return Err(FsError::ReadOnly);
        }
        let bytes = target.as_bytes();
        // Linux caps symlink targets at a page; respect that here too.
        if bytes.len() >= 4096 {
            return Err(FsError::NameTooLong);
        }
        if bytes.is_empty() {
            return Err(FsError::InvalidArg);
        }

        let (pino, mut pinode, name) = st.resolve_parent(path)?;
        if dir::dir_lookup(&mut st.fs, &pinode, name)?.is_some() {
            return Err(FsError::Exists);
        }

        let now = now_epoch();
        let (nino, mut ninode) = st.fs.inode_alloc(pino, false)?;
        ninode
            .i_mode
            .set((pinode.i_mode.get() & !EXT2_S_IFMT) | EXT2_S_IFLNK);
        ninode.i_uid = pinode.i_uid;
        ninode.i_gid = pinode.i_gid;
        ninode.i_atime.set(now);
        ninode.i_ctime.set(now);
        ninode.i_mtime.set(now);
        ninode.i_links_count.set(1);

        if bytes.len() < EXT2_FAST_SYMLINK_MAX {
            // Fast symlink: the target rides in the i_block words.
            ninode.i_block.as_bytes_mut()[..bytes.len()].copy_from_slice(bytes);
            ninode.i_size.set(bytes.len() as u32);
        } else {
            let bs = st.fs.block_size();
            let mut written = 0usize;
            let mut lblk = 0u32;
            while written < bytes.len() {
                let bn = match st.fs.inode_alloc_block(&mut ninode, nino, lblk) {
                    Ok(bn) => bn,
                    Err(e) => {
                        st.fs.inode_put(nino, &ninode)?;
                        st.fs.inode_deref(nino, false)?;
                        return Err(e);
                    }
                };
                let take = bs.min(bytes.len() - written);
                let block = st.fs.block(bn)?;
                block[..take].copy_from_slice(&bytes[written..written + take]);
                st.fs.mark_block_dirty(bn)?;
                written += take;
                lblk += 1;
            }
            ninode.i_size.set(bytes.len() as u32);
        }

        if let Err(e) = dir::dir_add_entry(
            &mut st.fs,
            &mut pinode,
            pino,
            name,
            nino,
            Ext2FileType::Symlink,
        ) {
            st.fs.inode_put(nino, &ninode)?;
            st.fs.inode_deref(nino, false)?;
            return Err(e);
        }
        st.fs.inode_put(nino, &ninode)?;

        pinode.i_mtime.set(now);
        pinode.i_ctime.set(now);
        st.fs.inode_put(pino, &pinode)
    }

    fn readlink(&self, path: &str) -> FsResult<String> {
        let mut st = self.lock();
        let (_ino, inode) = st.fs.inode_by_path(path, false)?;
        let target = st.fs.read_symlink(&inode)?;
        String::from_utf8(target).map_err(|_| FsError::Corrupt)
    }

    fn stat(&self, path: &str, follow_links: bool) -> FsResult<Stat> {
        let mut st = self.lock();
        let (ino, inode) = st.fs.inode_by_path(path, follow_links)?;
        stat_of(ino, &inode)
    }

    fn fstat(&self, fd: FileDesc) -> FsResult<Stat> {
        let mut st = self.lock();
        let handle = st.handle(fd)?;
        let (ino, inode) = (handle.ino, handle.inode);
        stat_of(ino, &inode)
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
