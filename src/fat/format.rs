//! mkfs for FAT: writes a boot sector, empty FATs with their reserved
//! entries, and an empty root directory. The variant comes from the
//! resulting cluster count, exactly as mount will later re-derive it.

use crate::errors::{FsError, FsResult};
use crate::fat::desc::*;
use crate::fat::fs::write_sectors;
use block_dev::BlockDevice;
use log::{error, info};
use zerocopy::{AsBytes, FromBytes};

pub struct FormatOpts {
    pub sectors_per_cluster: u8,
    /// Root directory entries, FAT12/16 only.
    pub root_entries: u16,
    /// Force a variant; the cluster count must then land in its range.
    pub fat_type: Option<FatType>,
    pub num_fats: u8,
    pub volume_label: [u8; 11],
}

impl Default for FormatOpts {
    fn default() -> Self {
        Self {
            sectors_per_cluster: 1,
            root_entries: 512,
            fat_type: None,
            num_fats: 2,
            volume_label: *b"NO NAME    ",
        }
    }
}

const BPS: u32 = 512;

fn type_for_clusters(clusters: u32) -> FatType {
    if clusters <= FAT_MAX_FAT12_CLUSTERS {
        FatType::Fat12
    } else if clusters <= FAT_MAX_FAT16_CLUSTERS {
        FatType::Fat16
    } else {
        FatType::Fat32
    }
}

fn fat_bytes(fs_type: FatType, clusters: u32) -> u32 {
    let entries = clusters + 2;
    match fs_type {
        FatType::Fat12 => entries + (entries >> 1) + 1,
        FatType::Fat16 => entries * 2,
        FatType::Fat32 => entries * 4,
    }
}

/// Write a fresh FAT filesystem covering the whole device.
pub fn format(dev: &mut dyn BlockDevice, opts: &FormatOpts) -> FsResult<()> {
    dev.init().map_err(|_| FsError::Io)?;
    if !dev.writable() {
        return Err(FsError::ReadOnly);
    }
    if dev.block_size() < BPS as usize {
        return Err(FsError::InvalidArg);
    }

    let spc = opts.sectors_per_cluster as u32;
    if spc == 0 || !spc.is_power_of_two() || opts.num_fats == 0 {
        return Err(FsError::InvalidArg);
    }

    let total = dev.count_blocks() as u32;

    // First guess at the variant from the raw cluster count, then let
    // the FAT size converge.
    let mut fs_type = opts
        .fat_type
        .unwrap_or_else(|| type_for_clusters(total / spc));

    let (reserved, root_sectors) = loop {
        let reserved: u32 = if fs_type == FatType::Fat32 { 32 } else { 1 };
        let root_sectors = if fs_type == FatType::Fat32 {
            0
        } else {
            (opts.root_entries as u32 * 32 + BPS - 1) / BPS
        };

        let mut fat_size = 1u32;
        for _ in 0..8 {
            let meta = reserved + opts.num_fats as u32 * fat_size + root_sectors;
            if meta >= total {
                return Err(FsError::NoSpace);
            }
            let clusters = (total - meta) / spc;
            let needed = (fat_bytes(fs_type, clusters) + BPS - 1) / BPS;
            if needed == fat_size {
                break;
            }
            fat_size = needed;
        }

        let meta = reserved + opts.num_fats as u32 * fat_size + root_sectors;
        let clusters = (total - meta) / spc;
        let derived = type_for_clusters(clusters);
        if derived == fs_type {
            break (reserved, root_sectors);
        }
        if opts.fat_type.is_some() {
            // The device cannot hold the requested variant.
            error!(
                "{} clusters does not fit {:?}",
                clusters, fs_type
            );
            return Err(FsError::InvalidArg);
        }
        fs_type = derived;
    };

    // Converged geometry.
    let mut fat_size = 1u32;
    for _ in 0..8 {
        let meta = reserved + opts.num_fats as u32 * fat_size + root_sectors;
        let clusters = (total - meta) / spc;
        let needed = (fat_bytes(fs_type, clusters) + BPS - 1) / BPS;
        if needed == fat_size {
            break;
        }
        fat_size = needed;
    }
    let first_data = reserved + opts.num_fats as u32 * fat_size + root_sectors;
    let clusters = (total - first_data) / spc;

    /* Boot sector. */

    let mut boot = [0u8; 512];
    let mut bpb = FatBpb::read_from(&[0u8; 36][..]).unwrap();
    bpb.jmp = [0xEB, 0x3C, 0x90];
    bpb.oem_name = *b"RETROFS ";
    bpb.bytes_per_sector.set(BPS as u16);
    bpb.sectors_per_cluster = opts.sectors_per_cluster;
    bpb.reserved_sectors.set(reserved as u16);
    bpb.num_fats = opts.num_fats;
    bpb.media_code = 0xF8;
    bpb.sectors_per_track.set(32);
    bpb.num_heads.set(64);
    if fs_type == FatType::Fat32 {
        bpb.num_sectors32.set(total);
    } else {
        bpb.root_dir_entries.set(opts.root_entries);
        bpb.fat_size16.set(fat_size as u16);
        if total < 0x10000 {
            bpb.num_sectors16.set(total as u16);
        } else {
            bpb.num_sectors32.set(total);
        }
    }
    boot[..36].copy_from_slice(bpb.as_bytes());

    let volume_id: [u8; 4] = rand::random();
    if fs_type == FatType::Fat32 {
        let mut ebpb = Fat32Ebpb::read_from(&[0u8; 54][..]).unwrap();
        ebpb.fat_size32.set(fat_size);
        ebpb.rootdir_cluster.set(2);
        ebpb.fsinfo_sector.set(1);
        ebpb.backup_bpb.set(6);
        ebpb.drive_number = 0x80;
        ebpb.ext_boot_sig = 0x29;
        ebpb.volume_id = volume_id;
        ebpb.volume_label = opts.volume_label;
        ebpb.fs_type = *b"FAT32   ";
        boot[FAT_EBPB_OFFSET..FAT_EBPB_OFFSET + 54].copy_from_slice(ebpb.as_bytes());
    } else {
        let mut ebpb = Fat16Ebpb::read_from(&[0u8; 26][..]).unwrap();
        ebpb.drive_number = 0x80;
        ebpb.ext_boot_sig = 0x29;
        ebpb.volume_id = volume_id;
        ebpb.volume_label = opts.volume_label;
        ebpb.fs_type = if fs_type == FatType::Fat12 {
            *b"FAT12   "
        } else {
            *b"FAT16   "
        };
        boot[FAT_EBPB_OFFSET..FAT_EBPB_OFFSET + 26].copy_from_slice(ebpb.as_bytes());
    }
    boot[FAT_BOOT_SIG_OFFSET] = 0x55;
    boot[FAT_BOOT_SIG_OFFSET + 1] = 0xAA;

    let bps = BPS as usize;
    write_sectors(dev, bps, 0, 1, &boot)?;
    if fs_type == FatType::Fat32 {
        write_sectors(dev, bps, 6, 1, &boot)?;
    }

    /* FSInfo sector (FAT32). The root directory claims one cluster. */

    if fs_type == FatType::Fat32 {
        let mut raw = [0u8; 512];
        let mut fsinfo = Fat32FsInfo::read_from(&raw[..]).unwrap();
        fsinfo.fsinfo_sig1.set(FAT32_FSINFO_SIG1);
        fsinfo.fsinfo_sig2.set(FAT32_FSINFO_SIG2);
        fsinfo.fsinfo_sig3.set(FAT32_FSINFO_SIG3);
        fsinfo.free_clusters.set(clusters - 1);
        fsinfo.last_alloc_cluster.set(2);
        raw.copy_from_slice(fsinfo.as_bytes());
        write_sectors(dev, bps, 1, 1, &raw)?;
        write_sectors(dev, bps, 7, 1, &raw)?;
    }

    /* The FATs: zeroed, with the reserved head entries. */

    let zero = vec![0u8; bps];
    for copy in 0..opts.num_fats as u32 {
        let base = reserved + copy * fat_size;
        for s in 0..fat_size {
            write_sectors(dev, bps, base + s, 1, &zero)?;
        }
        let mut head = vec![0u8; bps];
        match fs_type {
            FatType::Fat12 => head[..3].copy_from_slice(&[0xF8, 0xFF, 0xFF]),
            FatType::Fat16 => head[..4].copy_from_slice(&[0xF8, 0xFF, 0xFF, 0xFF]),
            FatType::Fat32 => {
                // Entries 0 and 1 reserved, entry 2 ends the root chain.
                head[..12].copy_from_slice(&[
                    0xF8, 0xFF, 0xFF, 0x0F, 0xFF, 0xFF, 0xFF, 0x0F, 0xFF, 0xFF, 0xFF, 0x0F,
                ]);
            }
        }
        write_sectors(dev, bps, base, 1, &head)?;
    }

    /* Empty root directory. */

    if fs_type == FatType::Fat32 {
        for s in 0..spc {
            write_sectors(dev, bps, first_data + s, 1, &zero)?;
        }
    } else {
        let root_start = reserved + opts.num_fats as u32 * fat_size;
        for s in 0..root_sectors {
            write_sectors(dev, bps, root_start + s, 1, &zero)?;
        }
    }

    info!(
        "formatted {:?}: {} sectors, {} clusters of {} bytes",
        fs_type,
        total,
        clusters,
        spc * BPS
    );
    Ok(())
}
