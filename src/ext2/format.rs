//! mkfs for ext2: writes a revision-1 filesystem with 128-byte inodes,
//! one bitmap block per group, and a root directory. Every group leads
//! with a backup superblock and descriptor table, so the layout is
//! uniform across groups.

use crate::errors::{FsError, FsResult};
use crate::ext2::desc::*;
use crate::ext2::fs::now_epoch;
use block_dev::BlockDevice;
use log::{error, info};
use zerocopy::{AsBytes, FromBytes};

pub struct FormatOpts {
    pub block_size: usize,
    /// Inodes per group; rounded up to fill whole inode-table blocks.
    /// Defaults to one inode per four data blocks.
    pub inodes_per_group: Option<u32>,
    pub volume_label: [u8; 16],
}

impl Default for FormatOpts {
    fn default() -> Self {
        Self {
            block_size: 1024,
            inodes_per_group: None,
            volume_label: [0; 16],
        }
    }
}

struct Layout {
    block_size: usize,
    blocks_count: u32,
    first_data_block: u32,
    blocks_per_group: u32,
    inodes_per_group: u32,
    bg_count: u32,
    bgdt_blocks: u32,
    itable_blocks: u32,
}

impl Layout {
    fn group_base(&self, g: u32) -> u32 {
        self.first_data_block + g * self.blocks_per_group
    }

    fn block_bitmap(&self, g: u32) -> u32 {
        self.group_base(g) + 1 + self.bgdt_blocks
    }

    fn inode_bitmap(&self, g: u32) -> u32 {
        self.block_bitmap(g) + 1
    }

    fn inode_table(&self, g: u32) -> u32 {
        self.inode_bitmap(g) + 1
    }

    fn data_start(&self, g: u32) -> u32 {
        self.inode_table(g) + self.itable_blocks
    }

    /// Blocks actually present in group g (the last group may be short).
    fn blocks_in_group(&self, g: u32) -> u32 {
        (self.blocks_count - self.group_base(g)).min(self.blocks_per_group)
    }

    /// Metadata blocks at the head of each group.
    fn overhead(&self) -> u32 {
        1 + self.bgdt_blocks + 2 + self.itable_blocks
    }
}

fn write_fs_block(
    dev: &mut dyn BlockDevice,
    layout: &Layout,
    block: u32,
    data: &[u8],
) -> FsResult<()> {
    let ratio = layout.block_size / dev.block_size();
    dev.write_blocks(block as u64 * ratio as u64, ratio, data)
        .map_err(|e| {
            error!("format: write of block {} failed: {}", block, e);
            FsError::Io
        })
}

/// Write a fresh ext2 filesystem covering the whole device.
pub fn format(dev: &mut dyn BlockDevice, opts: &FormatOpts) -> FsResult<()> {
    dev.init().map_err(|_| FsError::Io)?;
    if !dev.writable() {
        return Err(FsError::ReadOnly);
    }

    let bs = opts.block_size;
    if !bs.is_power_of_two() || !(1024..=65536).contains(&bs) || bs < dev.block_size() {
        return Err(FsError::InvalidArg);
    }

    let total_bytes = dev.count_blocks() as u64 * dev.block_size() as u64;
    let blocks_count = (total_bytes / bs as u64) as u32;
    let first_data_block = if bs == 1024 { 1 } else { 0 };
    let blocks_per_group = (bs * 8) as u32;
    let bg_count = (blocks_count - first_data_block + blocks_per_group - 1) / blocks_per_group;

    // Round the inode count so the table fills whole blocks.
    let inodes_per_block = (bs / EXT2_INODE_SIZE) as u32;
    let default_ipg = (blocks_count / bg_count / 4).max(16);
    let mut inodes_per_group = opts.inodes_per_group.unwrap_or(default_ipg);
    inodes_per_group =
        ((inodes_per_group + inodes_per_block - 1) / inodes_per_block) * inodes_per_block;
    inodes_per_group = inodes_per_group.min((bs * 8) as u32);

    let bgdt_bytes = bg_count as usize * EXT2_GROUP_DESC_SIZE;
    let bgdt_blocks = ((bgdt_bytes + bs - 1) / bs) as u32;
    let itable_blocks = inodes_per_group / inodes_per_block;

    let layout = Layout {
        block_size: bs,
        blocks_count,
        first_data_block,
        blocks_per_group,
        inodes_per_group,
        bg_count,
        bgdt_blocks,
        itable_blocks,
    };

    if blocks_count < layout.overhead() * bg_count + 8 {
        return Err(FsError::NoSpace);
    }

    let root_block = layout.data_start(0);
    let now = now_epoch();

    // Group descriptors and free counts.
    let mut bg: Vec<Ext2GroupDesc> = Vec::with_capacity(bg_count as usize);
    let mut free_blocks = 0u32;
    for g in 0..bg_count {
        let in_group = layout.blocks_in_group(g);
        let mut free = in_group - layout.overhead();
        if g == 0 {
            free -= 1; // root directory block
        }
        free_blocks += free;
        let mut desc = Ext2GroupDesc::default();
        desc.bg_block_bitmap.set(layout.block_bitmap(g));
        desc.bg_inode_bitmap.set(layout.inode_bitmap(g));
        desc.bg_inode_table.set(layout.inode_table(g));
        desc.bg_free_blocks_count.set(free as u16);
        desc.bg_free_inodes_count.set(if g == 0 {
            (inodes_per_group - 10) as u16
        } else {
            inodes_per_group as u16
        });
        desc.bg_used_dirs_count.set(if g == 0 { 1 } else { 0 });
        bg.push(desc);
    }

    // Superblock.
    let mut sb = Ext2SuperBlock::read_from(&vec![0u8; 1024][..]).ok_or(FsError::Io)?;
    sb.s_inodes_count.set(inodes_per_group * bg_count);
    sb.s_blocks_count.set(blocks_count);
    sb.s_free_blocks_count.set(free_blocks);
    sb.s_free_inodes_count.set(inodes_per_group * bg_count - 10);
    sb.s_first_data_block.set(first_data_block);
    sb.s_log_block_size.set(bs.trailing_zeros() - 10);
    sb.s_log_frag_size.set(bs.trailing_zeros() - 10);
    sb.s_blocks_per_group.set(blocks_per_group);
    sb.s_frags_per_group.set(blocks_per_group);
    sb.s_inodes_per_group.set(inodes_per_group);
    sb.s_wtime.set(now);
    sb.s_max_mnt_count.set(0xFFFF);
    sb.s_magic.set(EXT2_SUPER_MAGIC);
    sb.s_state.set(EXT2_VALID_FS);
    sb.s_errors.set(1);
    sb.s_lastcheck.set(now);
    sb.s_rev_level.set(EXT2_DYNAMIC_REV);
    sb.s_first_ino.set(EXT2_GOOD_OLD_FIRST_INO);
    sb.s_inode_size.set(EXT2_INODE_SIZE as u16);
    sb.s_uuid = rand::random();
    sb.s_volume_name = opts.volume_label;

    let zero_block = vec![0u8; bs];

    // Descriptor table image, shared by all backup locations.
    let mut bgdt_raw = vec![0u8; bgdt_blocks as usize * bs];
    for (i, desc) in bg.iter().enumerate() {
        bgdt_raw[i * EXT2_GROUP_DESC_SIZE..(i + 1) * EXT2_GROUP_DESC_SIZE]
            .copy_from_slice(desc.as_bytes());
    }

    for g in 0..bg_count {
        let base = layout.group_base(g);

        // Superblock (primary in group 0, backups elsewhere).
        sb.s_block_group_nr.set(g as u16);
        let mut sb_block = zero_block.clone();
        if bs == 1024 {
            sb_block.copy_from_slice(sb.as_bytes());
        } else {
            sb_block[EXT2_SUPERBLOCK_OFFSET..EXT2_SUPERBLOCK_OFFSET + 1024]
                .copy_from_slice(sb.as_bytes());
        }
        write_fs_block(dev, &layout, base, &sb_block)?;

        for b in 0..bgdt_blocks {
            write_fs_block(
                dev,
                &layout,
                base + 1 + b,
                &bgdt_raw[b as usize * bs..(b as usize + 1) * bs],
            )?;
        }

        // Block bitmap: group metadata used, padding bits past the end of
        // the group forced to one.
        let mut bitmap = zero_block.clone();
        let used = layout.overhead() + if g == 0 { 1 } else { 0 };
        for bit in 0..used {
            bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
        }
        let in_group = layout.blocks_in_group(g);
        for bit in in_group..blocks_per_group {
            bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
        }
        write_fs_block(dev, &layout, layout.block_bitmap(g), &bitmap)?;

        // Inode bitmap: the ten reserved inodes in group 0, padding past
        // inodes_per_group forced to one.
        let mut bitmap = zero_block.clone();
        if g == 0 {
            for bit in 0..10 {
                bitmap[bit / 8] |= 1 << (bit % 8);
            }
        }
        for bit in inodes_per_group..(bs * 8) as u32 {
            bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
        }
        write_fs_block(dev, &layout, layout.inode_bitmap(g), &bitmap)?;

        // Zeroed inode table.
        for b in 0..itable_blocks {
            write_fs_block(dev, &layout, layout.inode_table(g) + b, &zero_block)?;
        }
    }

    // Root inode.
    let mut root = Ext2INode::default();
    root.i_mode.set(EXT2_S_IFDIR | 0o755);
    root.i_size.set(bs as u32);
    root.i_atime.set(now);
    root.i_ctime.set(now);
    root.i_mtime.set(now);
    root.i_links_count.set(2);
    root.i_blocks.set((bs / 512) as u32);
    root.i_block[0].set(root_block);

    let mut itable_first = zero_block.clone();
    let root_off = (EXT2_ROOT_INO as usize - 1) * EXT2_INODE_SIZE;
    itable_first[root_off..root_off + EXT2_INODE_SIZE].copy_from_slice(root.as_bytes());
    write_fs_block(dev, &layout, layout.inode_table(0), &itable_first)?;

    // Root directory data: `.` and `..`, both pointing at the root.
    let mut root_data = zero_block.clone();
    let dot = Ext2DirEntryHead {
        inode: Le32::new(EXT2_ROOT_INO),
        rec_len: Le16::new(dirent_rec_len(1) as u16),
        name_len: 1,
        file_type: Ext2FileType::Dir.into(),
    };
    root_data[..8].copy_from_slice(dot.as_bytes());
    root_data[8] = b'.';
    let dotdot = Ext2DirEntryHead {
        inode: Le32::new(EXT2_ROOT_INO),
        rec_len: Le16::new((bs - dirent_rec_len(1)) as u16),
        name_len: 2,
        file_type: Ext2FileType::Dir.into(),
    };
    let off = dirent_rec_len(1);
    root_data[off..off + 8].copy_from_slice(dotdot.as_bytes());
    root_data[off + 8] = b'.';
    root_data[off + 9] = b'.';
    write_fs_block(dev, &layout, root_block, &root_data)?;

    info!(
        "formatted ext2: {} blocks of {} bytes, {} groups, {} inodes",
        blocks_count,
        bs,
        bg_count,
        inodes_per_group * bg_count
    );
    Ok(())
}
