use crate::cache::{Cache, CacheBackend};
use crate::errors::{FsError, FsResult};
use crate::fat::desc::*;
use crate::mount::mount_flags;
use block_dev::BlockDevice;
use log::{debug, error, info, warn};
use zerocopy::{AsBytes, FromBytes};

/// Default cluster-cache slots (data) and sector-cache slots (FAT). The
/// FAT cache needs at least two slots so a FAT12 entry straddling two
/// sectors can touch both in one operation.
pub const FAT_CACHE_BLOCKS: usize = 8;
pub const FAT_FCACHE_BLOCKS: usize = 8;

/// Where a directory record lives: a data cluster, or a raw sector for
/// the fixed FAT12/FAT16 root directory area that sits outside the
/// cluster address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loc {
    Cluster(u32),
    Sector(u32),
}

impl Default for Loc {
    fn default() -> Self {
        Loc::Cluster(0)
    }
}

/// Parsed superblock, derived from the BPB at mount time.
#[derive(Debug, Clone, Default)]
pub struct FatSuperBlock {
    pub num_sectors: u32,
    pub fat_size: u32,
    /// FAT32: first cluster of the root directory. FAT12/16: number of
    /// root directory entries.
    pub root_dir: u32,
    /// FAT12/16 only: first sector of the fixed root directory area.
    pub root_dir_sector: u32,
    pub num_clusters: u32,
    pub first_data_sector: u32,

    pub free_clusters: u32,
    pub last_alloc_cluster: u32,
    pub fsinfo_sector: u16,
    pub backup_bpb: u16,

    pub volume_id: [u8; 4],
    pub volume_label: [u8; 11],
    pub fs_type: FatType,

    pub bytes_per_sector: u16,
    pub reserved_sectors: u16,
    pub sectors_per_cluster: u8,
    pub num_fats: u8,
}

/* Sector-granular device I/O. The logical sector is the BPB's; the
   device block is either the same size or larger, in which case only the
   leading bytes of each device block are used. */

pub(crate) fn read_sectors(
    dev: &mut dyn BlockDevice,
    bps: usize,
    sector: u32,
    count: usize,
    buf: &mut [u8],
) -> FsResult<()> {
    let dev_bs = dev.block_size();
    if dev_bs == bps {
        return dev
            .read_blocks(sector as u64, count, buf)
            .map_err(|_| FsError::Io);
    }
    let mut scratch = vec![0u8; dev_bs];
    for i in 0..count {
        dev.read_blocks(sector as u64 + i as u64, 1, &mut scratch)
            .map_err(|_| FsError::Io)?;
        buf[i * bps..(i + 1) * bps].copy_from_slice(&scratch[..bps]);
    }
    Ok(())
}

pub(crate) fn write_sectors(
    dev: &mut dyn BlockDevice,
    bps: usize,
    sector: u32,
    count: usize,
    buf: &[u8],
) -> FsResult<()> {
    let dev_bs = dev.block_size();
    if dev_bs == bps {
        return dev
            .write_blocks(sector as u64, count, buf)
            .map_err(|_| FsError::Io);
    }
    // Preserve the trailing bytes of each oversized device block.
    let mut scratch = vec![0u8; dev_bs];
    for i in 0..count {
        dev.read_blocks(sector as u64 + i as u64, 1, &mut scratch)
            .map_err(|_| FsError::Io)?;
        scratch[..bps].copy_from_slice(&buf[i * bps..(i + 1) * bps]);
        dev.write_blocks(sector as u64 + i as u64, 1, &scratch)
            .map_err(|_| FsError::Io)?;
    }
    Ok(())
}

/// Backend of the data cache: cluster records, or single raw sectors for
/// the FAT12/16 root directory (the tail of the record stays zero).
struct DataIo<'a> {
    dev: &'a mut dyn BlockDevice,
    bps: usize,
    spc: usize,
    first_data_sector: u32,
    num_clusters: u32,
}

impl DataIo<'_> {
    fn cluster_sector(&self, cl: u32) -> FsResult<u32> {
        if !(2..self.num_clusters + 2).contains(&cl) {
            error!("cluster {} out of range", cl);
            return Err(FsError::Corrupt);
        }
        Ok((cl - 2) * self.spc as u32 + self.first_data_sector)
    }
}

impl CacheBackend<Loc> for DataIo<'_> {
    fn read_record(&mut self, id: Loc, buf: &mut [u8]) -> FsResult<()> {
        match id {
            Loc::Cluster(cl) => {
                let sector = self.cluster_sector(cl)?;
                read_sectors(self.dev, self.bps, sector, self.spc, buf)
            }
            Loc::Sector(s) => {
                buf[self.bps..].fill(0);
                read_sectors(self.dev, self.bps, s, 1, &mut buf[..self.bps])
            }
        }
    }

    fn write_record(&mut self, id: Loc, buf: &[u8]) -> FsResult<()> {
        match id {
            Loc::Cluster(cl) => {
                let sector = self.cluster_sector(cl)?;
                write_sectors(self.dev, self.bps, sector, self.spc, buf)
            }
            Loc::Sector(s) => write_sectors(self.dev, self.bps, s, 1, &buf[..self.bps]),
        }
    }
}

/// Backend of the FAT cache: one logical sector per record, bounded to
/// the first FAT.
struct FatIo<'a> {
    dev: &'a mut dyn BlockDevice,
    bps: usize,
    fat_start: u32,
    fat_end: u32,
}

impl FatIo<'_> {
    fn check(&self, sector: u32) -> FsResult<()> {
        if !(self.fat_start..self.fat_end).contains(&sector) {
            error!("FAT sector {} out of range", sector);
            return Err(FsError::Corrupt);
        }
        Ok(())
    }
}

impl CacheBackend<u32> for FatIo<'_> {
    fn read_record(&mut self, id: u32, buf: &mut [u8]) -> FsResult<()> {
        self.check(id)?;
        read_sectors(self.dev, self.bps, id, 1, buf)
    }

    fn write_record(&mut self, id: u32, buf: &[u8]) -> FsResult<()> {
        self.check(id)?;
        write_sectors(self.dev, self.bps, id, 1, buf)
    }
}

/// The FAT engine: superblock, the cluster-sized data cache and the
/// sector-sized FAT cache. One instance per mounted volume; FatVfs
/// serializes access.
pub struct FatFs {
    dev: Box<dyn BlockDevice>,
    pub sb: FatSuperBlock,
    bcache: Cache<Loc>,
    fcache: Cache<u32>,
    rw: bool,
}

impl FatFs {
    pub fn mount(dev: Box<dyn BlockDevice>, flags: u32) -> FsResult<FatFs> {
        Self::mount_ex(dev, flags, FAT_CACHE_BLOCKS, FAT_FCACHE_BLOCKS)
    }

    pub fn mount_ex(
        mut dev: Box<dyn BlockDevice>,
        flags: u32,
        cache_sz: usize,
        fcache_sz: usize,
    ) -> FsResult<FatFs> {
        dev.init().map_err(|e| {
            error!("device init failed: {}", e);
            FsError::Io
        })?;

        let mut rw = flags & mount_flags::MNT_READ_WRITE != 0;
        if flags & !mount_flags::MNT_VALID_MASK != 0 {
            warn!("unknown mount flags {:#010x}; mounting read-only", flags);
            rw = false;
        }
        if rw && !dev.writable() {
            warn!("device is read-only; mounting read-only");
            rw = false;
        }

        if dev.block_size() < 512 {
            error!("device blocks below 512 bytes are not supported");
            return Err(FsError::InvalidArg);
        }

        // Boot sector, always 512 bytes regardless of device block size.
        let mut boot = [0u8; 512];
        {
            let mut scratch = vec![0u8; dev.block_size()];
            dev.read_blocks(0, 1, &mut scratch).map_err(|_| FsError::Io)?;
            boot.copy_from_slice(&scratch[..512]);
        }

        if boot[FAT_BOOT_SIG_OFFSET] != 0x55 || boot[FAT_BOOT_SIG_OFFSET + 1] != 0xAA {
            warn!("missing 0x55AA boot signature");
            return Err(FsError::InvalidArg);
        }

        let sb = parse_boot(&boot)?;

        if sb.bytes_per_sector as usize > dev.block_size() {
            error!(
                "sector size {} exceeds device block size {}",
                sb.bytes_per_sector,
                dev.block_size()
            );
            return Err(FsError::InvalidArg);
        }

        let mut fs = FatFs {
            bcache: Cache::new(
                cache_sz,
                sb.bytes_per_sector as usize * sb.sectors_per_cluster as usize,
            ),
            fcache: Cache::new(fcache_sz.max(2), sb.bytes_per_sector as usize),
            dev,
            sb,
            rw,
        };

        // FSInfo, FAT32 only: trust its hints only with all three
        // signatures intact.
        if fs.sb.fs_type == FatType::Fat32 && fs.sb.fsinfo_sector != 0 {
            let mut raw = vec![0u8; fs.sb.bytes_per_sector as usize];
            let (bps, sector) = (fs.sb.bytes_per_sector as usize, fs.sb.fsinfo_sector as u32);
            read_sectors(fs.dev.as_mut(), bps, sector, 1, &mut raw)?;
            let fsinfo = Fat32FsInfo::read_from(&raw[..512]).ok_or(FsError::Corrupt)?;
            if fsinfo.sigs_valid()
                && fsinfo.free_clusters.get() <= fs.sb.num_clusters
                && (2..fs.sb.num_clusters + 2).contains(&fsinfo.last_alloc_cluster.get())
            {
                fs.sb.free_clusters = fsinfo.free_clusters.get();
                fs.sb.last_alloc_cluster = fsinfo.last_alloc_cluster.get();
            } else {
                warn!("FSInfo sector invalid; counting free clusters");
                fs.sb.last_alloc_cluster = 2;
                fs.sb.free_clusters = fs.count_free_clusters()?;
            }
        }

        info!(
            "FAT{}: {} sectors, {} clusters of {} bytes{}",
            match fs.sb.fs_type {
                FatType::Fat12 => 12,
                FatType::Fat16 => 16,
                FatType::Fat32 => 32,
            },
            fs.sb.num_sectors,
            fs.sb.num_clusters,
            fs.cluster_size(),
            if fs.rw { "" } else { " (read-only)" }
        );
        Ok(fs)
    }

    pub fn block_size(&self) -> usize {
        self.sb.bytes_per_sector as usize
    }

    pub fn cluster_size(&self) -> usize {
        self.sb.bytes_per_sector as usize * self.sb.sectors_per_cluster as usize
    }

    pub fn fs_type(&self) -> FatType {
        self.sb.fs_type
    }

    pub fn is_read_write(&self) -> bool {
        self.rw
    }

    pub(crate) fn ensure_rw(&self) -> FsResult<()> {
        if self.rw {
            Ok(())
        } else {
            Err(FsError::ReadOnly)
        }
    }

    /// Start of the root directory.
    pub fn root_loc(&self) -> Loc {
        if self.sb.fs_type == FatType::Fat32 {
            Loc::Cluster(self.sb.root_dir)
        } else {
            Loc::Sector(self.sb.root_dir_sector)
        }
    }

    /// Directory entries per record at this location: a full cluster, or
    /// a single sector in the FAT12/16 root area.
    pub fn dentries_per_record(&self, loc: Loc) -> u32 {
        match loc {
            Loc::Cluster(_) => (self.cluster_size() / FAT_DENTRY_SIZE) as u32,
            Loc::Sector(_) => (self.block_size() / FAT_DENTRY_SIZE) as u32,
        }
    }

    fn data_io(&mut self) -> (&mut Cache<Loc>, DataIo<'_>) {
        let Self { dev, sb, bcache, .. } = self;
        (
            bcache,
            DataIo {
                dev: dev.as_mut(),
                bps: sb.bytes_per_sector as usize,
                spc: sb.sectors_per_cluster as usize,
                first_data_sector: sb.first_data_sector,
                num_clusters: sb.num_clusters,
            },
        )
    }

    fn fat_io(&mut self) -> (&mut Cache<u32>, FatIo<'_>) {
        let Self { dev, sb, fcache, .. } = self;
        (
            fcache,
            FatIo {
                dev: dev.as_mut(),
                bps: sb.bytes_per_sector as usize,
                fat_start: sb.reserved_sectors as u32,
                fat_end: sb.reserved_sectors as u32 + sb.fat_size,
            },
        )
    }

    /* Data-cache access. */

    pub fn record(&mut self, loc: Loc) -> FsResult<&mut [u8]> {
        let (cache, mut io) = self.data_io();
        cache.get(&mut io, loc)
    }

    pub fn record_cleared(&mut self, loc: Loc) -> FsResult<&mut [u8]> {
        let (cache, mut io) = self.data_io();
        cache.get_cleared(&mut io, loc)
    }

    pub fn mark_record_dirty(&mut self, loc: Loc) -> FsResult<()> {
        self.bcache.mark_dirty(loc)
    }

    /* FAT-cache access. */

    pub(crate) fn fat_sector(&mut self, sector: u32) -> FsResult<&mut [u8]> {
        let (cache, mut io) = self.fat_io();
        cache.get(&mut io, sector)
    }

    pub(crate) fn mark_fat_dirty(&mut self, sector: u32) -> FsResult<()> {
        self.fcache.mark_dirty(sector)
    }

    /// Valid records of the data and FAT caches with their flags, for
    /// consistency checks.
    pub fn cache_records(&self) -> (Vec<(Loc, u8)>, Vec<(u32, u8)>) {
        (
            self.bcache.records().collect(),
            self.fcache.records().collect(),
        )
    }

    /// The record following `loc` in a directory: the next link of the
    /// FAT chain, or the next raw sector while the fixed root area has
    /// entries left. `scanned` counts entries already visited.
    pub fn next_dir_loc(&mut self, loc: Loc, scanned: u32) -> FsResult<Option<Loc>> {
        match loc {
            Loc::Cluster(cl) => match self.next_cluster(cl)? {
                Some(next) => Ok(Some(Loc::Cluster(next))),
                None => Ok(None),
            },
            Loc::Sector(s) => {
                if scanned >= self.sb.root_dir {
                    Ok(None)
                } else {
                    Ok(Some(Loc::Sector(s + 1)))
                }
            }
        }
    }

    /// Flush in order: data clusters, the FAT, then FSInfo. Later stages
    /// still run when an earlier one fails; the first error is returned.
    pub fn sync(&mut self) -> FsResult<()> {
        if !self.rw {
            return Ok(());
        }

        let mut result = {
            let (cache, mut io) = self.data_io();
            cache.writeback_all(&mut io)
        };

        let r = {
            let (cache, mut io) = self.fat_io();
            cache.writeback_all(&mut io)
        };
        if result.is_ok() {
            result = r;
        }

        let r = self.write_fsinfo();
        if result.is_ok() {
            result = r;
        }
        result
    }

    /// Write the FSInfo sector (and its backup) with the current free
    /// count and allocation hint. FAT32 only; a no-op elsewhere.
    pub fn write_fsinfo(&mut self) -> FsResult<()> {
        if self.sb.fs_type != FatType::Fat32 || self.sb.fsinfo_sector == 0 {
            return Ok(());
        }
        self.ensure_rw()?;

        let bps = self.sb.bytes_per_sector as usize;
        let mut raw = vec![0u8; bps];
        read_sectors(self.dev.as_mut(), bps, self.sb.fsinfo_sector as u32, 1, &mut raw)?;
        let mut fsinfo = Fat32FsInfo::read_from(&raw[..512]).ok_or(FsError::Corrupt)?;
        fsinfo.fsinfo_sig1.set(FAT32_FSINFO_SIG1);
        fsinfo.fsinfo_sig2.set(FAT32_FSINFO_SIG2);
        fsinfo.fsinfo_sig3.set(FAT32_FSINFO_SIG3);
        fsinfo.free_clusters.set(self.sb.free_clusters);
        fsinfo.last_alloc_cluster.set(self.sb.last_alloc_cluster);
        raw[..512].copy_from_slice(fsinfo.as_bytes());
        write_sectors(self.dev.as_mut(), bps, self.sb.fsinfo_sector as u32, 1, &raw)?;

        if self.sb.backup_bpb != 0 {
            write_sectors(
                self.dev.as_mut(),
                bps,
                self.sb.backup_bpb as u32 + 1,
                1,
                &raw,
            )?;
        }
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

    /// Scan the FAT counting free entries, for volumes whose FSInfo
    /// cannot be trusted.
    fn count_free_clusters(&mut self) -> FsResult<u32> {
        let mut free = 0;
        for cl in 2..self.sb.num_clusters + 2 {
            if self.read_fat(cl)? == FAT_FREE_CLUSTER {
                free += 1;
            }
        }
        debug!("counted {} free clusters", free);
        Ok(free)
    }
}

/// Parse the boot sector into a superblock, selecting FAT12/16/32 from
/// the cluster count.
fn parse_boot(boot: &[u8; 512]) -> FsResult<FatSuperBlock> {
    let bpb = FatBpb::read_from(&boot[..36]).ok_or(FsError::Corrupt)?;

    let bps = bpb.bytes_per_sector.get() as u32;
    if bps < 512 || !bps.is_power_of_two() {
        warn!("implausible bytes-per-sector {}", bps);
        return Err(FsError::InvalidArg);
    }
    if bpb.sectors_per_cluster == 0 || !bpb.sectors_per_cluster.is_power_of_two() {
        return Err(FsError::InvalidArg);
    }

    let rde = bpb.root_dir_entries.get() as u32;
    let root_dir_sectors = (rde * 32 + bps - 1) / bps;

    let ebpb32 = Fat32Ebpb::read_from(&boot[FAT_EBPB_OFFSET..FAT_EBPB_OFFSET + 54])
        .ok_or(FsError::Corrupt)?;
    let ebpb16 =
        Fat16Ebpb::read_from(&boot[FAT_EBPB_OFFSET..FAT_EBPB_OFFSET + 26]).ok_or(FsError::Corrupt)?;

    let mut fat_size = bpb.fat_size16.get() as u32;
    if fat_size == 0 {
        fat_size = ebpb32.fat_size32.get();
    }

    let mut total = bpb.num_sectors16.get() as u32;
    if total == 0 {
        total = bpb.num_sectors32.get();
    }

    let reserved = bpb.reserved_sectors.get() as u32;
    let first_data = reserved + bpb.num_fats as u32 * fat_size + root_dir_sectors;
    if first_data >= total || fat_size == 0 {
        return Err(FsError::Corrupt);
    }
    let num_clusters = (total - first_data) / bpb.sectors_per_cluster as u32;

    let fs_type = if num_clusters <= FAT_MAX_FAT12_CLUSTERS {
        FatType::Fat12
    } else if num_clusters <= FAT_MAX_FAT16_CLUSTERS {
        FatType::Fat16
    } else {
        FatType::Fat32
    };

    let mut sb = FatSuperBlock {
        num_sectors: total,
        fat_size,
        num_clusters,
        first_data_sector: first_data,
        bytes_per_sector: bps as u16,
        reserved_sectors: reserved as u16,
        sectors_per_cluster: bpb.sectors_per_cluster,
        num_fats: bpb.num_fats,
        fs_type,
        root_dir_sector: reserved + bpb.num_fats as u32 * fat_size,
        last_alloc_cluster: 2,
        ..Default::default()
    };

    if rde != 0 {
        sb.root_dir = rde;
    } else {
        sb.root_dir = ebpb32.rootdir_cluster.get();
    }

    if fs_type == FatType::Fat32 {
        if ebpb32.fs_version != [0, 0] {
            return Err(FsError::InvalidArg);
        }
        sb.fsinfo_sector = ebpb32.fsinfo_sector.get();
        sb.backup_bpb = ebpb32.backup_bpb.get();
        if ebpb32.ext_boot_sig == 0x28 || ebpb32.ext_boot_sig == 0x29 {
            sb.volume_id = ebpb32.volume_id;
        }
        if ebpb32.ext_boot_sig == 0x29 {
            sb.volume_label = ebpb32.volume_label;
        }
    } else {
        if ebpb16.ext_boot_sig == 0x28 || ebpb16.ext_boot_sig == 0x29 {
            sb.volume_id = ebpb16.volume_id;
        }
        if ebpb16.ext_boot_sig == 0x29 {
            sb.volume_label = ebpb16.volume_label;
        }
        if rde == 0 {
            return Err(FsError::Corrupt);
        }
    }

    Ok(sb)
}
