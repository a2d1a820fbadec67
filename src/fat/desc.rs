//! FAT on-disk structures: BPB and extended BPBs, the FAT32 FSInfo
//! sector, short directory entries and VFAT long-name entries, plus the
//! MS-DOS timestamp encoding.
//!
//! Timestamps are converted through local time, like the original DOS
//! systems did; the choice is consistent across mount cycles.

use chrono::{Datelike, Local, TimeZone, Timelike};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, Unaligned};

pub type Le16 = U16<LittleEndian>;
pub type Le32 = U32<LittleEndian>;

pub const FAT_MAX_FAT12_CLUSTERS: u32 = 4084;
pub const FAT_MAX_FAT16_CLUSTERS: u32 = 65524;

pub const FAT_FREE_CLUSTER: u32 = 0;
pub const FAT_EOC_FAT12: u32 = 0x0FF8;
pub const FAT_EOC_FAT16: u32 = 0xFFF8;
pub const FAT_EOC_FAT32: u32 = 0x0FFFFFF8;

pub const FAT32_FSINFO_SIG1: u32 = 0x41615252;
pub const FAT32_FSINFO_SIG2: u32 = 0x61417272;
pub const FAT32_FSINFO_SIG3: u32 = 0xAA550000;

pub const FAT_ENTRY_EOD: u8 = 0x00;
pub const FAT_ENTRY_FREE: u8 = 0xE5;

pub const FAT_ATTR_READ_ONLY: u8 = 0x01;
pub const FAT_ATTR_HIDDEN: u8 = 0x02;
pub const FAT_ATTR_SYSTEM: u8 = 0x04;
pub const FAT_ATTR_VOLUME_ID: u8 = 0x08;
pub const FAT_ATTR_DIRECTORY: u8 = 0x10;
pub const FAT_ATTR_ARCHIVE: u8 = 0x20;
pub const FAT_ATTR_LONG_NAME: u8 = 0x0F;
pub const FAT_ATTR_LONG_NAME_MASK: u8 = 0x3F;

pub const FAT_ORDER_LAST: u8 = 0x40;

pub const FAT_DENTRY_SIZE: usize = 32;

pub const DOT_NAME: &[u8; 11] = b".          ";
pub const DOTDOT_NAME: &[u8; 11] = b"..         ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FatType {
    #[default]
    Fat12 = 0,
    Fat16 = 1,
    Fat32 = 2,
}

/*
 * The common BPB, bytes 0..36 of the boot sector.
 */
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct FatBpb {
    pub jmp: [u8; 3], /* 0xEB 0x?? 0x90 or 0xE9 0x?? 0x?? */
    pub oem_name: [u8; 8],
    pub bytes_per_sector: Le16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: Le16,
    pub num_fats: u8,
    pub root_dir_entries: Le16,
    pub num_sectors16: Le16,
    pub media_code: u8,
    pub fat_size16: Le16,
    pub sectors_per_track: Le16,
    pub num_heads: Le16,
    pub hidden_sector_count: Le32,
    pub num_sectors32: Le32,
}

#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct Fat16Ebpb {
    pub drive_number: u8,
    pub reserved: u8,
    pub ext_boot_sig: u8,
    pub volume_id: [u8; 4],
    pub volume_label: [u8; 11],
    pub fs_type: [u8; 8],
}

#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct Fat32Ebpb {
    pub fat_size32: Le32,
    pub flags: Le16,
    pub fs_version: [u8; 2],
    pub rootdir_cluster: Le32,
    pub fsinfo_sector: Le16,
    pub backup_bpb: Le16,
    pub reserved: [u8; 12],
    pub drive_number: u8,
    pub reserved2: u8,
    pub ext_boot_sig: u8,
    pub volume_id: [u8; 4],
    pub volume_label: [u8; 11],
    pub fs_type: [u8; 8],
}

/// Byte offset of the extended BPB within the boot sector.
pub const FAT_EBPB_OFFSET: usize = 36;
pub const FAT_BOOT_SIG_OFFSET: usize = 510;

#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct Fat32FsInfo {
    pub fsinfo_sig1: Le32,
    pub reserved: [u8; 480],
    pub fsinfo_sig2: Le32,
    pub free_clusters: Le32,
    pub last_alloc_cluster: Le32,
    pub reserved2: [u8; 12],
    pub fsinfo_sig3: Le32,
}

impl Fat32FsInfo {
    pub fn sigs_valid(&self) -> bool {
        self.fsinfo_sig1.get() == FAT32_FSINFO_SIG1
            && self.fsinfo_sig2.get() == FAT32_FSINFO_SIG2
            && self.fsinfo_sig3.get() == FAT32_FSINFO_SIG3
    }
}

/*
 * A short (8.3) directory entry, 32 bytes.
 */
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy, Debug)]
#[repr(C)]
pub struct FatDentry {
    pub name: [u8; 11],
    pub attr: u8,
    pub reserved: u8,
    pub ctenth: u8,
    pub ctime: Le16,
    pub cdate: Le16,
    pub adate: Le16,
    pub cluster_high: Le16,
    pub mtime: Le16,
    pub mdate: Le16,
    pub cluster_low: Le16,
    pub size: Le32,
}

impl Default for FatDentry {
    fn default() -> Self {
        Self::read_from(&[0u8; FAT_DENTRY_SIZE][..]).unwrap()
    }
}

impl FatDentry {
    pub fn is_long_name(&self) -> bool {
        self.attr & FAT_ATTR_LONG_NAME_MASK == FAT_ATTR_LONG_NAME
    }

    pub fn is_dir(&self) -> bool {
        self.attr & FAT_ATTR_DIRECTORY != 0
    }

    pub fn is_volume_label(&self) -> bool {
        !self.is_long_name() && self.attr & FAT_ATTR_VOLUME_ID != 0
    }

    pub fn first_cluster(&self) -> u32 {
        self.cluster_low.get() as u32 | ((self.cluster_high.get() as u32) << 16)
    }

    pub fn set_first_cluster(&mut self, cluster: u32) {
        self.cluster_low.set(cluster as u16);
        self.cluster_high.set((cluster >> 16) as u16);
    }
}

/*
 * A VFAT long-name entry: 13 UCS-2 units split over three name areas.
 * Chains are stored in reverse, the highest-order entry first, and every
 * entry carries the checksum of its short name.
 */
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy, Debug)]
#[repr(C)]
pub struct FatLongName {
    pub order: u8,
    pub name1: [u8; 10],
    pub attr: u8,
    pub ltype: u8,
    pub checksum: u8,
    pub name2: [u8; 12],
    pub cluster_low: Le16,
    pub name3: [u8; 4],
}

pub const FAT_LONGNAME_SEGMENT: usize = 13;

impl FatLongName {
    pub fn new(order: u8, checksum: u8, segment: &[u16; FAT_LONGNAME_SEGMENT]) -> Self {
        let mut ln = Self::read_from(&[0u8; FAT_DENTRY_SIZE][..]).unwrap();
        ln.order = order;
        ln.attr = FAT_ATTR_LONG_NAME;
        ln.checksum = checksum;
        for (i, &cp) in segment.iter().enumerate() {
            let bytes = cp.to_le_bytes();
            match i {
                0..=4 => ln.name1[i * 2..i * 2 + 2].copy_from_slice(&bytes),
                5..=10 => ln.name2[(i - 5) * 2..(i - 5) * 2 + 2].copy_from_slice(&bytes),
                _ => ln.name3[(i - 11) * 2..(i - 11) * 2 + 2].copy_from_slice(&bytes),
            }
        }
        ln
    }

    /// 1-based position of this entry in its chain.
    pub fn position(&self) -> u8 {
        self.order & 0x3F
    }

    pub fn is_last(&self) -> bool {
        self.order & FAT_ORDER_LAST != 0
    }

    /// The 13 UCS-2 units carried by this entry.
    pub fn segment(&self) -> [u16; FAT_LONGNAME_SEGMENT] {
        let mut out = [0u16; FAT_LONGNAME_SEGMENT];
        for (i, cp) in out.iter_mut().enumerate() {
            let bytes = match i {
                0..=4 => [self.name1[i * 2], self.name1[i * 2 + 1]],
                5..=10 => [self.name2[(i - 5) * 2], self.name2[(i - 5) * 2 + 1]],
                _ => [self.name3[(i - 11) * 2], self.name3[(i - 11) * 2 + 1]],
            };
            *cp = u16::from_le_bytes(bytes);
        }
        out
    }
}

/// Rotate-right-and-add hash over the 11-byte short name, stored in every
/// long-name entry of the chain.
pub fn shortname_checksum(name: &[u8; 11]) -> u8 {
    name.iter()
        .fold(0u8, |sum, &b| sum.rotate_right(1).wrapping_add(b))
}

/* MS-DOS timestamps: 1980 epoch, 2-second resolution. */

fn encode_parts(date: &mut u16, time: Option<&mut u16>, tenth: Option<&mut u8>) {
    let now = Local::now();
    let year = (now.year() - 1980).clamp(0, 127) as u16;
    *date = (year << 9) | ((now.month() as u16) << 5) | now.day() as u16;
    if let Some(time) = time {
        *time = ((now.hour() as u16) << 11)
            | ((now.minute() as u16) << 5)
            | (now.second() as u16 >> 1);
        if let Some(tenth) = tenth {
            *tenth = ((now.second() & 1) * 100) as u8;
        }
    }
}

/// Stamp creation, modification and access fields on a fresh entry.
pub fn fill_create_timestamps(ent: &mut FatDentry) {
    let mut date = 0u16;
    let mut time = 0u16;
    let mut tenth = 0u8;
    encode_parts(&mut date, Some(&mut time), Some(&mut tenth));
    ent.cdate.set(date);
    ent.ctime.set(time);
    ent.ctenth = tenth;
    ent.mdate.set(date);
    ent.mtime.set(time);
    ent.adate.set(date);
}

pub fn fill_mtime(ent: &mut FatDentry) {
    let mut date = 0u16;
    let mut time = 0u16;
    encode_parts(&mut date, Some(&mut time), None);
    ent.mdate.set(date);
    ent.mtime.set(time);
}

/// Decode a DOS date/time pair to UNIX seconds; zero dates decode to the
/// epoch.
pub fn dos_time_to_unix(date: u16, time: u16) -> i64 {
    if date == 0 {
        return 0;
    }
    let year = (date >> 9) as i32 + 1980;
    let month = ((date >> 5) & 0x0F) as u32;
    let day = (date & 0x1F) as u32;
    let hour = ((time >> 11) & 0x1F) as u32;
    let min = ((time >> 5) & 0x3F) as u32;
    let sec = ((time & 0x1F) << 1) as u32;
    Local
        .with_ymd_and_hms(year, month, day, hour, min, sec)
        .single()
        .map(|dt| dt.timestamp())
        .unwrap_or(0)
}
