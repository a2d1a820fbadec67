//! Directory entry management. Entries tile each directory block with no
//! gaps: every rec_len is 4-byte aligned and the last entry in a block
//! stretches to the block end. An entry with inode 0 is a tombstone that
//! traversal skips and insertion may reclaim.

use crate::errors::{FsError, FsResult};
use crate::ext2::desc::*;
use crate::ext2::fs::Ext2Fs;
use log::{debug, warn};
use zerocopy::{AsBytes, FromBytes};

/// A decoded directory entry.
#[derive(Debug, Clone)]
pub struct DirSlot {
    pub ino: u32,
    pub file_type: u8,
    pub name: Vec<u8>,
    /// Byte position of this entry within the directory.
    pub pos: u64,
    pub rec_len: usize,
}

fn check_name(name: &str) -> FsResult<()> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > EXT2_NAME_LEN {
        return Err(FsError::NameTooLong);
    }
    if bytes.iter().any(|&b| b == b'/' || b == 0) {
        return Err(FsError::InvalidArg);
    }
    Ok(())
}

/// Read and sanity-check the entry at `offset` of a block image.
fn entry_at(block: &[u8], offset: usize) -> FsResult<(Ext2DirEntryHead, usize)> {
    if offset + EXT2_DIR_ENTRY_HEADER_LEN > block.len() {
        return Err(FsError::Corrupt);
    }
    let head = Ext2DirEntryHead::read_from(&block[offset..offset + EXT2_DIR_ENTRY_HEADER_LEN])
        .ok_or(FsError::Corrupt)?;
    let rec_len = head.rec_len.get() as usize;
    if rec_len < EXT2_DIR_ENTRY_HEADER_LEN
        || rec_len % EXT2_DIR_PAD != 0
        || offset + rec_len > block.len()
        || head.name_len as usize + EXT2_DIR_ENTRY_HEADER_LEN > rec_len
    {
        warn!("bad directory entry at offset {}", offset);
        return Err(FsError::Corrupt);
    }
    Ok((head, rec_len))
}

fn dir_block_count(fs: &Ext2Fs, dir: &Ext2INode) -> u32 {
    (dir.i_size.get() as usize / fs.block_size()) as u32
}

fn dir_block(fs: &mut Ext2Fs, dir: &Ext2INode, lblk: u32) -> FsResult<u32> {
    let bn = fs.inode_block_index(dir, lblk)?;
    if bn == 0 {
        // Directories have no holes.
        return Err(FsError::Corrupt);
    }
    Ok(bn)
}

/// Find `name` in a directory. Returns (inode number, file type).
pub fn dir_lookup(
    fs: &mut Ext2Fs,
    dir: &Ext2INode,
    name: &str,
) -> FsResult<Option<(u32, u8)>> {
    let target = name.as_bytes();
    for lblk in 0..dir_block_count(fs, dir) {
        let bn = dir_block(fs, dir, lblk)?;
        let block = fs.block(bn)?.to_vec();
        let mut off = 0;
        while off < block.len() {
            let (head, rec_len) = entry_at(&block, off)?;
            let name_len = head.name_len as usize;
            if head.inode.get() != 0
                && name_len == target.len()
                && &block[off + EXT2_DIR_ENTRY_HEADER_LEN..off + EXT2_DIR_ENTRY_HEADER_LEN + name_len]
                    == target
            {
                return Ok(Some((head.inode.get(), head.file_type)));
            }
            off += rec_len;
        }
    }
    Ok(None)
}

fn write_entry(
    block: &mut [u8],
    offset: usize,
    ino: u32,
    rec_len: usize,
    name: &[u8],
    file_type: Ext2FileType,
) {
    let head = Ext2DirEntryHead {
        inode: Le32::new(ino),
        rec_len: Le16::new(rec_len as u16),
        name_len: name.len() as u8,
        file_type: file_type.into(),
    };
    block[offset..offset + EXT2_DIR_ENTRY_HEADER_LEN].copy_from_slice(head.as_bytes());
    block[offset + EXT2_DIR_ENTRY_HEADER_LEN..offset + EXT2_DIR_ENTRY_HEADER_LEN + name.len()]
        .copy_from_slice(name);
}

/// Insert an entry, reclaiming a tombstone, splitting an oversized entry,
/// or appending a fresh block. The caller updates the directory's times
/// and writes its inode back.
pub fn dir_add_entry(
    fs: &mut Ext2Fs,
    dir: &mut Ext2INode,
    dir_ino: u32,
    name: &str,
    child_ino: u32,
    file_type: Ext2FileType,
) -> FsResult<()> {
    check_name(name)?;
    let bytes = name.as_bytes();
    let needed = dirent_rec_len(bytes.len());
    let bs = fs.block_size();

    for lblk in 0..dir_block_count(fs, dir) {
        let bn = dir_block(fs, dir, lblk)?;
        let image = fs.block(bn)?.to_vec();
        let mut off = 0;
        while off < image.len() {
            let (head, rec_len) = entry_at(&image, off)?;

            if head.inode.get() == 0 && rec_len >= needed {
                // Reclaim the tombstone, keeping its rec_len.
                let buf = fs.block(bn)?;
                write_entry(buf, off, child_ino, rec_len, bytes, file_type);
                fs.mark_block_dirty(bn)?;
                return Ok(());
            }

            let used = dirent_rec_len(head.name_len as usize);
            if head.inode.get() != 0 && rec_len >= used + needed {
                // Split: shrink the occupant to its minimum and take the
                // remainder.
                let buf = fs.block(bn)?;
                let mut shrunk = head;
                shrunk.rec_len.set(used as u16);
                buf[off..off + EXT2_DIR_ENTRY_HEADER_LEN].copy_from_slice(shrunk.as_bytes());
                write_entry(buf, off + used, child_ino, rec_len - used, bytes, file_type);
                fs.mark_block_dirty(bn)?;
                return Ok(());
            }

            off += rec_len;
        }
    }

    // No room anywhere; append a block.
    let lblk = dir_block_count(fs, dir);
    let bn = fs.inode_alloc_block(dir, dir_ino, lblk)?;
    debug!("directory {} grows to block {}", dir_ino, lblk + 1);
    let buf = fs.block(bn)?;
    write_entry(buf, 0, child_ino, bs, bytes, file_type);
    fs.mark_block_dirty(bn)?;
    dir.i_size.set(dir.i_size.get() + bs as u32);
    Ok(())
}

/// Remove an entry by name. The freed slot merges into its predecessor,
/// or becomes a tombstone when it leads its block. Returns the inode
/// number the entry pointed at so the caller can release it.
pub fn dir_rm_entry(fs: &mut Ext2Fs, dir: &Ext2INode, name: &str) -> FsResult<u32> {
    check_name(name)?;
    let target = name.as_bytes();

    for lblk in 0..dir_block_count(fs, dir) {
        let bn = dir_block(fs, dir, lblk)?;
        let image = fs.block(bn)?.to_vec();
        let mut off = 0;
        let mut prev: Option<(usize, usize)> = None; // (offset, rec_len)
        while off < image.len() {
            let (head, rec_len) = entry_at(&image, off)?;
            let name_len = head.name_len as usize;
            let matched = head.inode.get() != 0
                && name_len == target.len()
                && &image[off + EXT2_DIR_ENTRY_HEADER_LEN
                    ..off + EXT2_DIR_ENTRY_HEADER_LEN + name_len]
                    == target;

            if matched {
                let ino = head.inode.get();
                let buf = fs.block(bn)?;
                match prev {
                    Some((poff, plen)) => {
                        let merged = (plen + rec_len) as u16;
                        buf[poff + 4..poff + 6].copy_from_slice(&merged.to_le_bytes());
                    }
                    None => {
                        buf[off..off + 4].copy_from_slice(&0u32.to_le_bytes());
                    }
                }
                fs.mark_block_dirty(bn)?;
                return Ok(ino);
            }

            prev = Some((off, rec_len));
            off += rec_len;
        }
    }
    Err(FsError::NoEntry)
}

/// Point an existing entry at a different inode (fixing `..` after a
/// directory moves). Returns the previous inode number.
pub fn dir_redir_entry(
    fs: &mut Ext2Fs,
    dir: &Ext2INode,
    name: &str,
    new_ino: u32,
) -> FsResult<u32> {
    check_name(name)?;
    let target = name.as_bytes();

    for lblk in 0..dir_block_count(fs, dir) {
        let bn = dir_block(fs, dir, lblk)?;
        let image = fs.block(bn)?.to_vec();
        let mut off = 0;
        while off < image.len() {
            let (head, rec_len) = entry_at(&image, off)?;
            let name_len = head.name_len as usize;
            if head.inode.get() != 0
                && name_len == target.len()
                && &image[off + EXT2_DIR_ENTRY_HEADER_LEN
                    ..off + EXT2_DIR_ENTRY_HEADER_LEN + name_len]
                    == target
            {
                let old = head.inode.get();
                let buf = fs.block(bn)?;
                buf[off..off + 4].copy_from_slice(&new_ino.to_le_bytes());
                fs.mark_block_dirty(bn)?;
                return Ok(old);
            }
            off += rec_len;
        }
    }
    Err(FsError::NoEntry)
}

/// True iff the directory holds nothing beyond `.` and `..`.
pub fn dir_is_empty(fs: &mut Ext2Fs, dir: &Ext2INode) -> FsResult<bool> {
    for lblk in 0..dir_block_count(fs, dir) {
        let bn = dir_block(fs, dir, lblk)?;
        let image = fs.block(bn)?.to_vec();
        let mut off = 0;
        while off < image.len() {
            let (head, rec_len) = entry_at(&image, off)?;
            let name_len = head.name_len as usize;
            if head.inode.get() != 0 {
                let name =
                    &image[off + EXT2_DIR_ENTRY_HEADER_LEN..off + EXT2_DIR_ENTRY_HEADER_LEN + name_len];
                if name != b"." && name != b".." {
                    return Ok(false);
                }
            }
            off += rec_len;
        }
    }
    Ok(true)
}

/// Lay out `.` and `..` in a fresh first block and set the new
/// directory's size and link count. The parent's link count is the
/// caller's to bump, exactly once.
pub fn dir_create_empty(
    fs: &mut Ext2Fs,
    dir: &mut Ext2INode,
    dir_ino: u32,
    parent_ino: u32,
) -> FsResult<()> {
    let bs = fs.block_size();
    let bn = fs.inode_alloc_block(dir, dir_ino, 0)?;
    let buf = fs.block(bn)?;
    let dot_len = dirent_rec_len(1);
    write_entry(buf, 0, dir_ino, dot_len, b".", Ext2FileType::Dir);
    write_entry(buf, dot_len, parent_ino, bs - dot_len, b"..", Ext2FileType::Dir);
    fs.mark_block_dirty(bn)?;
    dir.i_size.set(bs as u32);
    // One link for the parent's entry, one for `.`.
    dir.i_links_count.set(2);
    Ok(())
}

/// Read the live entry at or after byte position `pos`. Tombstones are
/// skipped. Returns None at end of directory.
pub fn dir_next_entry(
    fs: &mut Ext2Fs,
    dir: &Ext2INode,
    mut pos: u64,
) -> FsResult<Option<DirSlot>> {
    let bs = fs.block_size() as u64;
    let size = dir.i_size.get() as u64;

    while pos < size {
        let lblk = (pos / bs) as u32;
        let bn = dir_block(fs, dir, lblk)?;
        let image = fs.block(bn)?.to_vec();
        let off = (pos % bs) as usize;
        let (head, rec_len) = entry_at(&image, off)?;
        if head.inode.get() == 0 {
            pos += rec_len as u64;
            continue;
        }
        let name_len = head.name_len as usize;
        let name =
            image[off + EXT2_DIR_ENTRY_HEADER_LEN..off + EXT2_DIR_ENTRY_HEADER_LEN + name_len].to_vec();
        return Ok(Some(DirSlot {
            ino: head.inode.get(),
            file_type: head.file_type,
            name,
            pos,
            rec_len,
        }));
    }
    Ok(None)
}
