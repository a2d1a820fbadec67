// see: https://www.nongnu.org/ext2-doc/ext2.html

use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, Unaligned};

pub type Le16 = U16<LittleEndian>;
pub type Le32 = U32<LittleEndian>;

/*
 * Special inode numbers
 */
pub const EXT2_BAD_INO: u32 = 1; /* Bad blocks inode */
pub const EXT2_ROOT_INO: u32 = 2; /* Root inode */
pub const EXT2_GOOD_OLD_FIRST_INO: u32 = 11; /* First non-reserved inode */

pub const EXT2_SUPER_MAGIC: u16 = 0xEF53;
pub const EXT2_SUPERBLOCK_OFFSET: usize = 1024;

pub const EXT2_LINK_MAX: u16 = 65000;

/*
 * Constants relative to the data blocks
 */
pub const EXT2_NDIR_BLOCKS: usize = 12;
pub const EXT2_IND_BLOCK: usize = EXT2_NDIR_BLOCKS;
pub const EXT2_DIND_BLOCK: usize = EXT2_IND_BLOCK + 1;
pub const EXT2_TIND_BLOCK: usize = EXT2_DIND_BLOCK + 1;
pub const EXT2_N_BLOCKS: usize = EXT2_TIND_BLOCK + 1;

/*
 * File system states
 */
pub const EXT2_VALID_FS: u16 = 0x0001; /* Unmounted cleanly */
pub const EXT2_ERROR_FS: u16 = 0x0002; /* Errors detected */

/*
 * Revision levels
 */
pub const EXT2_GOOD_OLD_REV: u32 = 0;
pub const EXT2_DYNAMIC_REV: u32 = 1;
pub const EXT2_GOOD_OLD_INODE_SIZE: usize = 128;

/*
 * Mode bits (i_mode high nibble selects the file type)
 */
pub const EXT2_S_IFMT: u16 = 0xF000;
pub const EXT2_S_IFSOCK: u16 = 0xC000;
pub const EXT2_S_IFLNK: u16 = 0xA000;
pub const EXT2_S_IFREG: u16 = 0x8000;
pub const EXT2_S_IFBLK: u16 = 0x6000;
pub const EXT2_S_IFDIR: u16 = 0x4000;
pub const EXT2_S_IFCHR: u16 = 0x2000;
pub const EXT2_S_IFIFO: u16 = 0x1000;

/// Symlink targets shorter than this live inline in i_block[].
pub const EXT2_FAST_SYMLINK_MAX: usize = 60;

/*
 * Structure of the super block. 1024 bytes on disk, little-endian.
 */
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct Ext2SuperBlock {
    /*000*/ pub s_inodes_count: Le32, /* Inodes count */
    pub s_blocks_count: Le32,         /* Blocks count */
    pub s_r_blocks_count: Le32,       /* Reserved blocks count */
    pub s_free_blocks_count: Le32,    /* Free blocks count */
    /*010*/ pub s_free_inodes_count: Le32, /* Free inodes count */
    pub s_first_data_block: Le32,     /* First Data Block */
    pub s_log_block_size: Le32,       /* Block size */
    pub s_log_frag_size: Le32,        /* Fragment size */
    /*020*/ pub s_blocks_per_group: Le32, /* # Blocks per group */
    pub s_frags_per_group: Le32,      /* # Fragments per group */
    pub s_inodes_per_group: Le32,     /* # Inodes per group */
    pub s_mtime: Le32,                /* Mount time */
    /*030*/ pub s_wtime: Le32,        /* Write time */
    pub s_mnt_count: Le16,            /* Mount count */
    pub s_max_mnt_count: Le16,        /* Maximal mount count */
    pub s_magic: Le16,                /* Magic signature */
    pub s_state: Le16,                /* File system state */
    pub s_errors: Le16,               /* Behaviour when detecting errors */
    pub s_minor_rev_level: Le16,      /* minor revision level */
    /*040*/ pub s_lastcheck: Le32,    /* time of last check */
    pub s_checkinterval: Le32,        /* max. time between checks */
    pub s_creator_os: Le32,           /* OS */
    pub s_rev_level: Le32,            /* Revision level */
    /*050*/ pub s_def_resuid: Le16,   /* Default uid for reserved blocks */
    pub s_def_resgid: Le16,           /* Default gid for reserved blocks */
    /* These fields are for EXT2_DYNAMIC_REV superblocks only. */
    pub s_first_ino: Le32,            /* First non-reserved inode */
    pub s_inode_size: Le16,           /* size of inode structure */
    pub s_block_group_nr: Le16,       /* block group # of this superblock */
    pub s_feature_compat: Le32,       /* compatible feature set */
    /*060*/ pub s_feature_incompat: Le32, /* incompatible feature set */
    pub s_feature_ro_compat: Le32,    /* readonly-compatible feature set */
    /*068*/ pub s_uuid: [u8; 16],     /* 128-bit uuid for volume */
    /*078*/ pub s_volume_name: [u8; 16], /* volume name */
    /*088*/ pub s_last_mounted: [u8; 64], /* directory last mounted on */
    /*0c8*/ pub s_algorithm_usage_bitmap: Le32, /* For compression */
    pub s_prealloc_blocks: u8,        /* Nr of blocks to try to preallocate */
    pub s_prealloc_dir_blocks: u8,    /* Nr to preallocate for dirs */
    pub s_padding1: Le16,
    /*0d0*/ pub s_reserved: [Le32; 204], /* Padding to the end of the block */
}

impl Ext2SuperBlock {
    pub fn magic_matched(&self) -> bool {
        self.s_magic.get() == EXT2_SUPER_MAGIC
    }

    pub fn block_size(&self) -> usize {
        1024usize << self.s_log_block_size.get()
    }

    pub fn inode_size(&self) -> usize {
        if self.s_rev_level.get() >= EXT2_DYNAMIC_REV {
            self.s_inode_size.get() as usize
        } else {
            EXT2_GOOD_OLD_INODE_SIZE
        }
    }

    pub fn first_ino(&self) -> u32 {
        if self.s_rev_level.get() >= EXT2_DYNAMIC_REV {
            self.s_first_ino.get()
        } else {
            EXT2_GOOD_OLD_FIRST_INO
        }
    }

    /// Number of block groups on the volume.
    pub fn bg_count(&self) -> u32 {
        let blocks = self.s_blocks_count.get() - self.s_first_data_block.get();
        let per_group = self.s_blocks_per_group.get();
        (blocks + per_group - 1) / per_group
    }

    pub fn is_clean(&self) -> bool {
        self.s_state.get() & EXT2_ERROR_FS == 0 && self.s_state.get() & EXT2_VALID_FS != 0
    }
}

/*
 * Structure of a blocks group descriptor. 32 bytes on disk.
 */
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy, Default)]
#[repr(C)]
pub struct Ext2GroupDesc {
    pub bg_block_bitmap: Le32,      /* Blocks bitmap block */
    pub bg_inode_bitmap: Le32,      /* Inodes bitmap block */
    pub bg_inode_table: Le32,       /* Inodes table block */
    pub bg_free_blocks_count: Le16, /* Free blocks count */
    pub bg_free_inodes_count: Le16, /* Free inodes count */
    pub bg_used_dirs_count: Le16,   /* Directories count */
    pub bg_pad: Le16,
    pub bg_reserved: [u8; 12],
}

pub const EXT2_GROUP_DESC_SIZE: usize = 32;

/*
 * Structure of an inode on the disk. Classic 128-byte revision-0 layout;
 * larger on-disk inode sizes leave the tail unused.
 */
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct Ext2INode {
    /*00*/ pub i_mode: Le16, /* File mode */
    pub i_uid: Le16,         /* Low 16 bits of Owner Uid */
    pub i_size: Le32,        /* Size in bytes */
    pub i_atime: Le32,       /* Access time */
    pub i_ctime: Le32,       /* Inode change time */
    /*10*/ pub i_mtime: Le32, /* Modification time */
    pub i_dtime: Le32,       /* Deletion Time */
    pub i_gid: Le16,         /* Low 16 bits of Group Id */
    pub i_links_count: Le16, /* Links count */
    pub i_blocks: Le32,      /* Blocks count (512-byte units) */
    /*20*/ pub i_flags: Le32, /* File flags */
    pub i_osd1: Le32,
    /*28*/ pub i_block: [Le32; EXT2_N_BLOCKS], /* Pointers to blocks */
    /*64*/ pub i_generation: Le32, /* File version (for NFS) */
    pub i_file_acl: Le32,    /* File ACL */
    pub i_size_high: Le32,   /* High 32 bits of size (regular files, rev 1+) */
    /*70*/ pub i_faddr: Le32, /* Fragment address */
    pub i_osd2: [u8; 12],
}

pub const EXT2_INODE_SIZE: usize = 128;

impl Default for Ext2INode {
    fn default() -> Self {
        Self::read_from(&[0u8; EXT2_INODE_SIZE][..]).unwrap()
    }
}

impl Ext2INode {
    pub fn file_type(&self) -> u16 {
        self.i_mode.get() & EXT2_S_IFMT
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == EXT2_S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == EXT2_S_IFLNK
    }

    pub fn is_regular(&self) -> bool {
        self.file_type() == EXT2_S_IFREG
    }

    /// Full 64-bit size. The high half is only meaningful for regular
    /// files on revision-1 filesystems.
    pub fn size(&self) -> u64 {
        if self.is_regular() {
            self.i_size.get() as u64 | ((self.i_size_high.get() as u64) << 32)
        } else {
            self.i_size.get() as u64
        }
    }

    pub fn set_size(&mut self, size: u64) {
        self.i_size.set(size as u32);
        if self.is_regular() {
            self.i_size_high.set((size >> 32) as u32);
        }
    }
}

/*
 * Structure of a directory entry header; the name bytes follow it. Entries
 * tile each directory block, rec_len is 4-byte aligned and the last entry
 * in a block stretches to the block end.
 */
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy, Debug)]
#[repr(C)]
pub struct Ext2DirEntryHead {
    pub inode: Le32,   /* Inode number; 0 marks a tombstone */
    pub rec_len: Le16, /* Directory entry length */
    pub name_len: u8,  /* Name length */
    pub file_type: u8,
}

pub const EXT2_DIR_ENTRY_HEADER_LEN: usize = 8;
pub const EXT2_DIR_PAD: usize = 4;
pub const EXT2_NAME_LEN: usize = 255;

/// Minimal rec_len able to carry a name of `name_len` bytes.
pub fn dirent_rec_len(name_len: usize) -> usize {
    (EXT2_DIR_ENTRY_HEADER_LEN + name_len + EXT2_DIR_PAD - 1) & !(EXT2_DIR_PAD - 1)
}

/*
 * Ext2 directory file types. Only the low 3 bits are used.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Ext2FileType {
    Unknown = 0,
    RegularFile = 1,
    Dir = 2,
    CharDev = 3,
    BlockDev = 4,
    Fifo = 5,
    Socket = 6,
    Symlink = 7,
}

impl Ext2FileType {
    pub fn from_mode(mode: u16) -> Self {
        match mode & EXT2_S_IFMT {
            EXT2_S_IFREG => Ext2FileType::RegularFile,
            EXT2_S_IFDIR => Ext2FileType::Dir,
            EXT2_S_IFCHR => Ext2FileType::CharDev,
            EXT2_S_IFBLK => Ext2FileType::BlockDev,
            EXT2_S_IFIFO => Ext2FileType::Fifo,
            EXT2_S_IFSOCK => Ext2FileType::Socket,
            EXT2_S_IFLNK => Ext2FileType::Symlink,
            _ => Ext2FileType::Unknown,
        }
    }

    pub fn mode_bits(self) -> u16 {
        match self {
            Ext2FileType::RegularFile => EXT2_S_IFREG,
            Ext2FileType::Dir => EXT2_S_IFDIR,
            Ext2FileType::CharDev => EXT2_S_IFCHR,
            Ext2FileType::BlockDev => EXT2_S_IFBLK,
            Ext2FileType::Fifo => EXT2_S_IFIFO,
            Ext2FileType::Socket => EXT2_S_IFSOCK,
            Ext2FileType::Symlink => EXT2_S_IFLNK,
            Ext2FileType::Unknown => 0,
        }
    }
}
