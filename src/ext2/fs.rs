use crate::cache::{Cache, CacheBackend};
use crate::errors::{FsError, FsResult};
use crate::ext2::desc::*;
use crate::ext2::dir;
use crate::fspath;
use crate::mount::mount_flags;
use block_dev::BlockDevice;
use log::{debug, error, info, warn};
use zerocopy::{AsBytes, FromBytes};

/// Default number of block-sized cache slots.
pub const EXT2_CACHE_BLOCKS: usize = 8;

/// Upper bound on symlink follows during one path resolution.
pub const EXT2_MAX_SYMLINKS: u32 = 16;

pub(crate) fn now_epoch() -> u32 {
    chrono::Utc::now().timestamp() as u32
}

/// Translates filesystem blocks to device blocks for the cache.
struct BlockIo<'a> {
    dev: &'a mut dyn BlockDevice,
    /// Device blocks per filesystem block.
    ratio: usize,
}

impl CacheBackend<u32> for BlockIo<'_> {
    fn read_record(&mut self, id: u32, buf: &mut [u8]) -> FsResult<()> {
        self.dev
            .read_blocks(id as u64 * self.ratio as u64, self.ratio, buf)
            .map_err(|e| {
                error!("block {} read failed: {}", id, e);
                FsError::Io
            })
    }

    fn write_record(&mut self, id: u32, buf: &[u8]) -> FsResult<()> {
        self.dev
            .write_blocks(id as u64 * self.ratio as u64, self.ratio, buf)
            .map_err(|e| {
                error!("block {} write failed: {}", id, e);
                FsError::Io
            })
    }
}

/// The ext2 engine: superblock, block-group table, block cache and the
/// allocation/indexing logic. One instance per mounted volume; the caller
/// (Ext2Vfs) serializes access.
pub struct Ext2Fs {
    dev: Box<dyn BlockDevice>,
    pub sb: Ext2SuperBlock,
    pub bg: Vec<Ext2GroupDesc>,
    bcache: Cache<u32>,
    block_size: usize,
    /// Device blocks per filesystem block.
    ratio: usize,
    sb_dirty: bool,
    rw: bool,
}

impl Ext2Fs {
    /// Read the superblock and block-group descriptors and set the engine
    /// up. An unclean volume or a read-only device downgrades a read-write
    /// request to read-only rather than failing the mount.
    pub fn mount(dev: Box<dyn BlockDevice>, flags: u32) -> FsResult<Ext2Fs> {
        Self::mount_ex(dev, flags, EXT2_CACHE_BLOCKS)
    }

    /// `mount` with an explicit cache slot count.
    pub fn mount_ex(dev: Box<dyn BlockDevice>, flags: u32, cache_slots: usize) -> FsResult<Ext2Fs> {
        let mut dev = dev;
        dev.init().map_err(|e| {
            error!("device init failed: {}", e);
            FsError::Io
        })?;

        let dev_bs = dev.block_size();
        // The superblock lives at byte offset 1024 regardless of device
        // block size; read whole device blocks covering bytes 1024..2048.
        let span = (EXT2_SUPERBLOCK_OFFSET + 1024 + dev_bs - 1) / dev_bs;
        let mut head = vec![0u8; span * dev_bs];
        dev.read_blocks(0, span, &mut head).map_err(|e| {
            error!("superblock read failed: {}", e);
            FsError::Io
        })?;
        let sb = Ext2SuperBlock::read_from(&head[EXT2_SUPERBLOCK_OFFSET..EXT2_SUPERBLOCK_OFFSET + 1024])
            .ok_or(FsError::Corrupt)?;

        if !sb.magic_matched() {
            warn!("no ext2 magic at superblock offset");
            return Err(FsError::InvalidArg);
        }

        let block_size = sb.block_size();
        if block_size < dev_bs {
            error!(
                "filesystem block size {} below device block size {}",
                block_size, dev_bs
            );
            return Err(FsError::InvalidArg);
        }
        let ratio = block_size / dev_bs;

        let mut rw = flags & mount_flags::MNT_READ_WRITE != 0;
        if rw && !dev.writable() {
            warn!("device is read-only; mounting read-only");
            rw = false;
        }
        if rw && !sb.is_clean() {
            warn!("filesystem not cleanly unmounted; mounting read-only");
            rw = false;
        }

        // The group descriptor table starts in the block right after the
        // superblock, in the primary group.
        let bg_count = sb.bg_count() as usize;
        let bg_block = sb.s_first_data_block.get() + 1;
        let bg_bytes = bg_count * EXT2_GROUP_DESC_SIZE;
        let bg_blocks = (bg_bytes + block_size - 1) / block_size;
        let mut bg_raw = vec![0u8; bg_blocks * block_size];
        dev.read_blocks(
            bg_block as u64 * ratio as u64,
            bg_blocks * ratio,
            &mut bg_raw,
        )
        .map_err(|e| {
            error!("group descriptor read failed: {}", e);
            FsError::Io
        })?;
        let bg: Vec<Ext2GroupDesc> = (0..bg_count)
            .map(|i| {
                Ext2GroupDesc::read_from(
                    &bg_raw[i * EXT2_GROUP_DESC_SIZE..(i + 1) * EXT2_GROUP_DESC_SIZE],
                )
                .unwrap()
            })
            .collect();

        info!(
            "ext2: {} blocks of {} bytes, {} groups, {} free blocks, {} free inodes{}",
            sb.s_blocks_count.get(),
            block_size,
            bg_count,
            sb.s_free_blocks_count.get(),
            sb.s_free_inodes_count.get(),
            if rw { "" } else { " (read-only)" }
        );

        Ok(Ext2Fs {
            dev,
            sb,
            bg,
            bcache: Cache::new(cache_slots, block_size),
            block_size,
            ratio,
            sb_dirty: false,
            rw,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn log_block_size(&self) -> u32 {
        self.block_size.trailing_zeros()
    }

    pub fn is_read_write(&self) -> bool {
        self.rw
    }

    fn ensure_rw(&self) -> FsResult<()> {
        if self.rw {
            Ok(())
        } else {
            Err(FsError::ReadOnly)
        }
    }

    /* Cache plumbing. */

    pub fn block(&mut self, block: u32) -> FsResult<&mut [u8]> {
        let Self { dev, bcache, ratio, .. } = self;
        bcache.get(&mut BlockIo { dev: dev.as_mut(), ratio: *ratio }, block)
    }

    pub fn block_cleared(&mut self, block: u32) -> FsResult<&mut [u8]> {
        let Self { dev, bcache, ratio, .. } = self;
        bcache.get_cleared(&mut BlockIo { dev: dev.as_mut(), ratio: *ratio }, block)
    }

    pub fn mark_block_dirty(&mut self, block: u32) -> FsResult<()> {
        self.bcache.mark_dirty(block)
    }

    /// Valid cache records and their flags, for consistency checks.
    pub fn cache_records(&self) -> Vec<(u32, u8)> {
        self.bcache.records().collect()
    }

    /// Flush in order: data/metadata block cache, then the superblock and
    /// group descriptors if dirty. Every stage is attempted even if an
    /// earlier one failed; the first error is reported.
    pub fn sync(&mut self) -> FsResult<()> {
        if !self.rw {
            return Ok(());
        }
        let Self { dev, bcache, ratio, .. } = self;
        let mut result = bcache.writeback_all(&mut BlockIo { dev: dev.as_mut(), ratio: *ratio });

        if self.sb_dirty {
            let r = self.write_superblock();
            if result.is_ok() {
                result = r;
            }
        }
        result
    }

    fn write_superblock(&mut self) -> FsResult<()> {
        self.sb.s_wtime.set(now_epoch());

        let dev_bs = self.dev.block_size();
        // Rewrite bytes 1024..2048 without clobbering their neighbors.
        let span = (EXT2_SUPERBLOCK_OFFSET + 1024 + dev_bs - 1) / dev_bs;
        let mut head = vec![0u8; span * dev_bs];
        self.dev.read_blocks(0, span, &mut head).map_err(|_| FsError::Io)?;
        head[EXT2_SUPERBLOCK_OFFSET..EXT2_SUPERBLOCK_OFFSET + 1024]
            .copy_from_slice(self.sb.as_bytes());
        self.dev.write_blocks(0, span, &head).map_err(|_| FsError::Io)?;

        // Group descriptor table, contiguous after the superblock.
        let bg_block = self.sb.s_first_data_block.get() + 1;
        let bg_bytes = self.bg.len() * EXT2_GROUP_DESC_SIZE;
        let bg_blocks = (bg_bytes + self.block_size - 1) / self.block_size;
        let mut raw = vec![0u8; bg_blocks * self.block_size];
        self.dev
            .read_blocks(bg_block as u64 * self.ratio as u64, bg_blocks * self.ratio, &mut raw)
            .map_err(|_| FsError::Io)?;
        for (i, desc) in self.bg.iter().enumerate() {
            raw[i * EXT2_GROUP_DESC_SIZE..(i + 1) * EXT2_GROUP_DESC_SIZE]
                .copy_from_slice(desc.as_bytes());
        }
        self.dev
            .write_blocks(bg_block as u64 * self.ratio as u64, bg_blocks * self.ratio, &raw)
            .map_err(|_| FsError::Io)?;

        self.sb_dirty = false;
        Ok(())
    }

    /// Flush everything and release the device.
    pub fn shutdown(&mut self) -> FsResult<()> {
        let result = self.sync();
        if let Err(e) = self.dev.shutdown() {
            error!("device shutdown failed: {}", e);
            return result.and(Err(FsError::Io));
        }
        result
    }

    /* Bitmap allocators. */

    fn bits_in_group(&self, group: u32, per_group: u32, total: u32, base: u32) -> u32 {
        let start = base + group * per_group;
        (total - start).min(per_group)
    }

    /// Scan one bitmap block for the first zero bit below `max_bits`, set
    /// it and return its index.
    fn bitmap_alloc(&mut self, bitmap_block: u32, max_bits: u32) -> FsResult<Option<u32>> {
        let found = {
            let buf = self.block(bitmap_block)?;
            let mut found = None;
            'scan: for (i, byte) in buf.iter().enumerate().take((max_bits as usize + 7) / 8) {
                if *byte == 0xFF {
                    continue;
                }
                for j in 0..8 {
                    let bit = i as u32 * 8 + j;
                    if bit >= max_bits {
                        break 'scan;
                    }
                    if *byte & (1 << j) == 0 {
                        found = Some(bit);
                        break 'scan;
                    }
                }
            }
            found
        };

        match found {
            Some(bit) => {
                let buf = self.block(bitmap_block)?;
                buf[bit as usize / 8] |= 1 << (bit % 8);
                self.mark_block_dirty(bitmap_block)?;
                Ok(Some(bit))
            }
            None => Ok(None),
        }
    }

    fn bitmap_clear(&mut self, bitmap_block: u32, bit: u32) -> FsResult<()> {
        let buf = self.block(bitmap_block)?;
        let byte = &mut buf[bit as usize / 8];
        if *byte & (1 << (bit % 8)) == 0 {
            warn!("freeing bit {} that is already clear", bit);
        }
        *byte &= !(1 << (bit % 8));
        self.mark_block_dirty(bitmap_block)
    }

    /// Allocate one data block, preferring `group`, walking the remaining
    /// groups in order otherwise.
    pub fn block_alloc(&mut self, group: u32) -> FsResult<u32> {
        self.ensure_rw()?;
        let bg_count = self.bg.len() as u32;
        let per_group = self.sb.s_blocks_per_group.get();
        let base = self.sb.s_first_data_block.get();
        let total = self.sb.s_blocks_count.get();

        for i in 0..bg_count {
            let g = (group + i) % bg_count;
            if self.bg[g as usize].bg_free_blocks_count.get() == 0 {
                continue;
            }
            let bitmap = self.bg[g as usize].bg_block_bitmap.get();
            let max_bits = self.bits_in_group(g, per_group, total, base);
            if let Some(bit) = self.bitmap_alloc(bitmap, max_bits)? {
                let desc = &mut self.bg[g as usize];
                desc.bg_free_blocks_count
                    .set(desc.bg_free_blocks_count.get() - 1);
                self.sb
                    .s_free_blocks_count
                    .set(self.sb.s_free_blocks_count.get() - 1);
                self.sb_dirty = true;
                let block = base + g * per_group + bit;
                debug!("allocated block {} in group {}", block, g);
                return Ok(block);
            }
        }
        Err(FsError::NoSpace)
    }

    pub fn block_free(&mut self, block: u32) -> FsResult<()> {
        self.ensure_rw()?;
        let base = self.sb.s_first_data_block.get();
        let per_group = self.sb.s_blocks_per_group.get();
        if block < base || block >= self.sb.s_blocks_count.get() {
            return Err(FsError::Corrupt);
        }
        let g = (block - base) / per_group;
        let bit = (block - base) % per_group;
        let bitmap = self.bg[g as usize].bg_block_bitmap.get();
        self.bitmap_clear(bitmap, bit)?;
        let desc = &mut self.bg[g as usize];
        desc.bg_free_blocks_count
            .set(desc.bg_free_blocks_count.get() + 1);
        self.sb
            .s_free_blocks_count
            .set(self.sb.s_free_blocks_count.get() + 1);
        self.sb_dirty = true;
        Ok(())
    }

    /* Inode table I/O. */

    fn inode_location(&self, ino: u32) -> FsResult<(u32, usize)> {
        if ino == 0 || ino > self.sb.s_inodes_count.get() {
            return Err(FsError::Corrupt);
        }
        let per_group = self.sb.s_inodes_per_group.get();
        let g = (ino - 1) / per_group;
        let index = ((ino - 1) % per_group) as usize;
        let isize = self.sb.inode_size();
        let byte = index * isize;
        let block = self.bg[g as usize].bg_inode_table.get() + (byte / self.block_size) as u32;
        Ok((block, byte % self.block_size))
    }

    /// Read an inode from its group's inode table.
    pub fn inode_get(&mut self, ino: u32) -> FsResult<Ext2INode> {
        let (block, offset) = self.inode_location(ino)?;
        let buf = self.block(block)?;
        Ext2INode::read_from(&buf[offset..offset + EXT2_INODE_SIZE]).ok_or(FsError::Corrupt)
    }

    /// Write an inode back to the inode table.
    pub fn inode_put(&mut self, ino: u32, inode: &Ext2INode) -> FsResult<()> {
        self.ensure_rw()?;
        let (block, offset) = self.inode_location(ino)?;
        let buf = self.block(block)?;
        buf[offset..offset + EXT2_INODE_SIZE].copy_from_slice(inode.as_bytes());
        self.mark_block_dirty(block)
    }

    /// Allocate a fresh inode, scanning from the parent's group. The
    /// returned inode is zeroed; mode and times are the caller's job.
    pub fn inode_alloc(&mut self, parent_ino: u32, is_dir: bool) -> FsResult<(u32, Ext2INode)> {
        self.ensure_rw()?;
        let per_group = self.sb.s_inodes_per_group.get();
        let bg_count = self.bg.len() as u32;
        let start = (parent_ino - 1) / per_group;

        for i in 0..bg_count {
            let g = (start + i) % bg_count;
            if self.bg[g as usize].bg_free_inodes_count.get() == 0 {
                continue;
            }
            let bitmap = self.bg[g as usize].bg_inode_bitmap.get();
            let max_bits = per_group.min(self.sb.s_inodes_count.get() - g * per_group);
            if let Some(bit) = self.bitmap_alloc(bitmap, max_bits)? {
                let desc = &mut self.bg[g as usize];
                desc.bg_free_inodes_count
                    .set(desc.bg_free_inodes_count.get() - 1);
                if is_dir {
                    desc.bg_used_dirs_count
                        .set(desc.bg_used_dirs_count.get() + 1);
                }
                self.sb
                    .s_free_inodes_count
                    .set(self.sb.s_free_inodes_count.get() - 1);
                self.sb_dirty = true;
                let ino = g * per_group + bit + 1;
                debug!("allocated inode {} in group {}", ino, g);
                return Ok((ino, Ext2INode::default()));
            }
        }
        Err(FsError::NoSpace)
    }

    /// Drop one persistent link. When the count hits zero the inode's data
    /// blocks and bitmap bits are released. A directory is only ever
    /// dereferenced when it is being removed outright (its `.` and the
    /// parent's entry go together), so it frees unconditionally.
    pub fn inode_deref(&mut self, ino: u32, is_dir: bool) -> FsResult<()> {
        self.ensure_rw()?;
        let mut inode = self.inode_get(ino)?;
        let links = inode.i_links_count.get();
        if !is_dir && links > 1 {
            inode.i_links_count.set(links - 1);
            return self.inode_put(ino, &inode);
        }

        self.inode_free_all(&mut inode, false)?;
        inode.i_links_count.set(0);
        inode.i_dtime.set(now_epoch());
        self.inode_put(ino, &inode)?;

        let per_group = self.sb.s_inodes_per_group.get();
        let g = (ino - 1) / per_group;
        let bit = (ino - 1) % per_group;
        let bitmap = self.bg[g as usize].bg_inode_bitmap.get();
        self.bitmap_clear(bitmap, bit)?;
        let desc = &mut self.bg[g as usize];
        desc.bg_free_inodes_count
            .set(desc.bg_free_inodes_count.get() + 1);
        if is_dir {
            desc.bg_used_dirs_count
                .set(desc.bg_used_dirs_count.get() - 1);
        }
        self.sb
            .s_free_inodes_count
            .set(self.sb.s_free_inodes_count.get() + 1);
        self.sb_dirty = true;
        Ok(())
    }

    /* Logical-to-physical block indexing. */

    fn ptrs_per_block(&self) -> usize {
        self.block_size / 4
    }

    fn read_ptr(&mut self, block: u32, index: usize) -> FsResult<u32> {
        let buf = self.block(block)?;
        let off = index * 4;
        Ok(u32::from_le_bytes(buf[off..off + 4].try_into().unwrap()))
    }

    fn write_ptr(&mut self, block: u32, index: usize, value: u32) -> FsResult<()> {
        let buf = self.block(block)?;
        let off = index * 4;
        buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
        self.mark_block_dirty(block)
    }

    /// Resolve a logical block index to a physical block number. Zero
    /// means a hole (reads as zeros).
    pub fn inode_block_index(&mut self, inode: &Ext2INode, lblk: u32) -> FsResult<u32> {
        let ppb = self.ptrs_per_block() as u64;
        let lblk = lblk as u64;

        if lblk < EXT2_NDIR_BLOCKS as u64 {
            return Ok(inode.i_block[lblk as usize].get());
        }

        let mut rest = lblk - EXT2_NDIR_BLOCKS as u64;
        if rest < ppb {
            let ind = inode.i_block[EXT2_IND_BLOCK].get();
            if ind == 0 {
                return Ok(0);
            }
            return self.read_ptr(ind, rest as usize);
        }

        rest -= ppb;
        if rest < ppb * ppb {
            let dind = inode.i_block[EXT2_DIND_BLOCK].get();
            if dind == 0 {
                return Ok(0);
            }
            let ind = self.read_ptr(dind, (rest / ppb) as usize)?;
            if ind == 0 {
                return Ok(0);
            }
            return self.read_ptr(ind, (rest % ppb) as usize);
        }

        rest -= ppb * ppb;
        if rest < ppb * ppb * ppb {
            let tind = inode.i_block[EXT2_TIND_BLOCK].get();
            if tind == 0 {
                return Ok(0);
            }
            let dind = self.read_ptr(tind, (rest / (ppb * ppb)) as usize)?;
            if dind == 0 {
                return Ok(0);
            }
            let ind = self.read_ptr(dind, ((rest / ppb) % ppb) as usize)?;
            if ind == 0 {
                return Ok(0);
            }
            return self.read_ptr(ind, (rest % ppb) as usize);
        }

        Err(FsError::FileTooLarge)
    }

    /// Blocks-per-inode accounting unit: i_blocks counts 512-byte sectors.
    fn sectors_per_block(&self) -> u32 {
        (self.block_size / 512) as u32
    }

    /// Allocate a zeroed indirect block and return its number.
    fn alloc_indirect(&mut self, group: u32, inode: &mut Ext2INode) -> FsResult<u32> {
        let block = self.block_alloc(group)?;
        self.block_cleared(block)?;
        inode.i_blocks.set(inode.i_blocks.get() + self.sectors_per_block());
        Ok(block)
    }

    /// Ensure a data block exists for `lblk`, allocating missing indirect
    /// blocks on the way down. Returns the (possibly fresh, zeroed)
    /// physical block.
    pub fn inode_alloc_block(
        &mut self,
        inode: &mut Ext2INode,
        ino: u32,
        lblk: u32,
    ) -> FsResult<u32> {
        self.ensure_rw()?;
        let group = (ino - 1) / self.sb.s_inodes_per_group.get();
        let ppb = self.ptrs_per_block() as u64;
        let l = lblk as u64;

        let alloc_data = |fs: &mut Self, inode: &mut Ext2INode| -> FsResult<u32> {
            let block = fs.block_alloc(group)?;
            fs.block_cleared(block)?;
            inode
                .i_blocks
                .set(inode.i_blocks.get() + fs.sectors_per_block());
            Ok(block)
        };

        if l < EXT2_NDIR_BLOCKS as u64 {
            let cur = inode.i_block[l as usize].get();
            if cur != 0 {
                return Ok(cur);
            }
            let block = alloc_data(self, inode)?;
            inode.i_block[l as usize].set(block);
            return Ok(block);
        }

        // Walk down the indirect tree, materializing each level.
        let mut rest = l - EXT2_NDIR_BLOCKS as u64;
        let (slot, mut level) = if rest < ppb {
            (EXT2_IND_BLOCK, 1)
        } else {
            rest -= ppb;
            if rest < ppb * ppb {
                (EXT2_DIND_BLOCK, 2)
            } else {
                rest -= ppb * ppb;
                if rest < ppb * ppb * ppb {
                    (EXT2_TIND_BLOCK, 3)
                } else {
                    return Err(FsError::FileTooLarge);
                }
            }
        };

        let mut table = inode.i_block[slot].get();
        if table == 0 {
            table = self.alloc_indirect(group, inode)?;
            inode.i_block[slot].set(table);
        }

        while level > 1 {
            let stride = ppb.pow(level - 1);
            let index = (rest / stride) as usize;
            rest %= stride;
            let mut next = self.read_ptr(table, index)?;
            if next == 0 {
                next = self.alloc_indirect(group, inode)?;
                self.write_ptr(table, index, next)?;
            }
            table = next;
            level -= 1;
        }

        let index = rest as usize;
        let cur = self.read_ptr(table, index)?;
        if cur != 0 {
            return Ok(cur);
        }
        let block = alloc_data(self, inode)?;
        self.write_ptr(table, index, block)?;
        Ok(block)
    }

    /// Free an indirect block's children at the given level, then the
    /// block itself.
    fn free_indirect(&mut self, block: u32, level: u32) -> FsResult<()> {
        if block == 0 {
            return Ok(());
        }
        let ppb = self.ptrs_per_block();
        for i in 0..ppb {
            let child = self.read_ptr(block, i)?;
            if child == 0 {
                continue;
            }
            if level > 1 {
                self.free_indirect(child, level - 1)?;
            } else {
                self.block_free(child)?;
            }
        }
        self.block_free(block)
    }

    /// Release every data and indirect block of an inode. `keep_first`
    /// preserves i_block[0] for callers that are about to rewrite block
    /// zero in place.
    pub fn inode_free_all(&mut self, inode: &mut Ext2INode, keep_first: bool) -> FsResult<()> {
        self.ensure_rw()?;
        // Fast symlinks store their target in i_block[]; nothing on disk.
        if inode.is_symlink() && inode.i_blocks.get() == 0 {
            if !keep_first {
                inode.i_block = Default::default();
            }
            return Ok(());
        }

        for i in 0..EXT2_NDIR_BLOCKS {
            if i == 0 && keep_first {
                continue;
            }
            let block = inode.i_block[i].get();
            if block != 0 {
                self.block_free(block)?;
                inode.i_block[i].set(0);
            }
        }
        for (slot, level) in [
            (EXT2_IND_BLOCK, 1u32),
            (EXT2_DIND_BLOCK, 2),
            (EXT2_TIND_BLOCK, 3),
        ] {
            let block = inode.i_block[slot].get();
            if block != 0 {
                self.free_indirect(block, level)?;
                inode.i_block[slot].set(0);
            }
        }
        let kept = if keep_first && inode.i_block[0].get() != 0 {
            self.sectors_per_block()
        } else {
            0
        };
        inode.i_blocks.set(kept);
        Ok(())
    }

    /* Symlinks. */

    /// Read a symlink target. i_blocks distinguishes the inline form from
    /// allocated blocks.
    pub fn read_symlink(&mut self, inode: &Ext2INode) -> FsResult<Vec<u8>> {
        if !inode.is_symlink() {
            return Err(FsError::InvalidArg);
        }
        let len = inode.i_size.get() as usize;
        if inode.i_blocks.get() == 0 {
            // Fast symlink: the target lives in the i_block area.
            let raw = inode.i_block.as_bytes();
            if len > raw.len() {
                return Err(FsError::Corrupt);
            }
            return Ok(raw[..len].to_vec());
        }

        let mut out = Vec::with_capacity(len);
        let bs = self.block_size;
        let mut lblk = 0u32;
        while out.len() < len {
            let bn = self.inode_block_index(inode, lblk)?;
            if bn == 0 {
                return Err(FsError::Corrupt);
            }
            let take = bs.min(len - out.len());
            let buf = self.block(bn)?;
            out.extend_from_slice(&buf[..take]);
            lblk += 1;
        }
        Ok(out)
    }

    /* Path resolution. */

    /// Resolve a path to (inode number, inode), following intermediate
    /// symlinks always and the trailing symlink only when asked. A
    /// resolution that follows more than EXT2_MAX_SYMLINKS links fails.
    pub fn inode_by_path(&mut self, path: &str, follow_trailing: bool) -> FsResult<(u32, Ext2INode)> {
        let mut follows_left = EXT2_MAX_SYMLINKS;
        let mut current = path.to_string();

        'restart: loop {
            let mut ino = EXT2_ROOT_INO;
            let mut inode = self.inode_get(ino)?;
            let comps: Vec<String> = fspath::components(&current).map(|s| s.to_string()).collect();

            for (idx, name) in comps.iter().enumerate() {
                if !inode.is_dir() {
                    return Err(FsError::NotDir);
                }
                let (child_ino, _ftype) =
                    dir::dir_lookup(self, &inode, name)?.ok_or(FsError::NoEntry)?;
                let child = self.inode_get(child_ino)?;
                let last = idx + 1 == comps.len();

                if child.is_symlink() && (!last || follow_trailing) {
                    if follows_left == 0 {
                        return Err(FsError::TooManyLinks);
                    }
                    follows_left -= 1;
                    let target = self.read_symlink(&child)?;
                    let target = String::from_utf8(target).map_err(|_| FsError::Corrupt)?;
                    let remainder = comps[idx + 1..].join("/");
                    current = if remainder.is_empty() {
                        target
                    } else {
                        format!("{}/{}", target.trim_end_matches('/'), remainder)
                    };
                    // Relative targets resolve from the symlink's parent.
                    if !current.starts_with('/') {
                        let parent = comps[..idx].join("/");
                        current = format!("/{}/{}", parent, current);
                    }
                    continue 'restart;
                }

                ino = child_ino;
                inode = child;
            }

            if fspath::names_directory(&current) && !inode.is_dir() {
                return Err(FsError::NotDir);
            }
            return Ok((ino, inode));
        }
    }
}
