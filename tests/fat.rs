//! Integration tests for the FAT engine: FAT12 (including the straddling
//! FAT entry), FAT16, and FAT32 with VFAT long names.

mod common;

use common::SharedDisk;
use retrofs::errors::FsError;
use retrofs::fat::{self, FatType, FatVfs, Loc};
use retrofs::mount::flags::*;
use retrofs::mount::mount_flags::*;
use retrofs::{FileSystem, NodeKind, Whence};

fn format_disk(size: usize, opts: &fat::FormatOpts) -> SharedDisk {
    let disk = SharedDisk::new(size, 9);
    fat::format(&mut disk.handle(), opts).unwrap();
    disk
}

fn mount_rw(disk: &SharedDisk) -> FatVfs {
    FatVfs::mount(Box::new(disk.handle()), MNT_READ_WRITE).unwrap()
}

fn fat16_disk() -> SharedDisk {
    // 32 MiB at 4 sectors per cluster lands well inside FAT16 range.
    format_disk(
        32 * 1024 * 1024,
        &fat::FormatOpts {
            sectors_per_cluster: 4,
            ..Default::default()
        },
    )
}

/// Follow a file's chain, returning every cluster in order.
fn chain_of(vfs: &FatVfs, first: u32) -> Vec<u32> {
    vfs.with_fs(|fs| {
        let mut out = vec![];
        if first < 2 {
            return out;
        }
        let mut cl = first;
        loop {
            out.push(cl);
            match fs.next_cluster(cl).unwrap() {
                Some(next) => cl = next,
                None => break,
            }
        }
        out
    })
}

/// Raw dump of a cluster-based directory: every 32-byte record in order.
fn raw_dir_records(vfs: &FatVfs, first: u32) -> Vec<[u8; 32]> {
    vfs.with_fs(|fs| {
        let mut out = vec![];
        let per = fs.cluster_size() / 32;
        let mut cl = first;
        loop {
            let rec = fs.record(Loc::Cluster(cl)).unwrap().to_vec();
            for i in 0..per {
                out.push(rec[i * 32..(i + 1) * 32].try_into().unwrap());
            }
            match fs.next_cluster(cl).unwrap() {
                Some(next) => cl = next,
                None => break,
            }
        }
        out
    })
}

#[test]
fn fat32_long_name_create_and_lookup() {
    // Enough clusters to force FAT32 at 4 KiB clusters.
    let disk = format_disk(
        528_000 * 512,
        &fat::FormatOpts {
            sectors_per_cluster: 8,
            ..Default::default()
        },
    );
    let fs = mount_rw(&disk);
    assert_eq!(fs.with_fs(|f| f.fs_type()), FatType::Fat32);
    let cluster_size = fs.with_fs(|f| f.cluster_size());
    assert_eq!(cluster_size, 4096);

    let name = "/A very long filename.txt";
    let fd = fs.open(name, O_CREAT | O_RDWR).unwrap();
    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 241) as u8).collect();
    assert_eq!(fs.write(fd, &payload).unwrap(), 5000);
    fs.close(fd).unwrap();

    // readdir returns exactly one entry carrying the full long name.
    let fd = fs.open("/", O_RDONLY | O_DIR).unwrap();
    let mut entries = vec![];
    while let Some(ent) = fs.readdir(fd).unwrap() {
        entries.push(ent);
    }
    fs.close(fd).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "A very long filename.txt");
    assert_eq!(entries[0].size, 5000);
    assert_eq!(entries[0].kind, NodeKind::File);

    // The raw directory: a chain of long-name records, then the short
    // entry with the ~1 tail, checksums matching throughout.
    let root = fs.with_fs(|f| match f.root_loc() {
        Loc::Cluster(cl) => cl,
        Loc::Sector(_) => unreachable!(),
    });
    let records = raw_dir_records(&fs, root);
    let longs: Vec<&[u8; 32]> = records
        .iter()
        .take_while(|r| r[0] != 0)
        .filter(|r| r[11] & 0x3F == 0x0F)
        .collect();
    assert_eq!(longs.len(), 2, "24 UCS-2 units pack into two segments");

    let short = records
        .iter()
        .take_while(|r| r[0] != 0)
        .find(|r| r[11] & 0x3F != 0x0F)
        .expect("short entry present");
    assert_eq!(&short[..11], b"AVERYL~1TXT");

    let cs = {
        let mut sum: u8 = 0;
        for &b in &short[..11] {
            sum = sum.rotate_right(1).wrapping_add(b);
        }
        sum
    };
    for long in &longs {
        assert_eq!(long[13], cs, "checksum mismatch in long record");
    }
    // The first record on disk is the last of the chain (order 2 | 0x40).
    assert_eq!(longs[0][0], 0x42);
    assert_eq!(longs[1][0], 0x01);

    // 5000 bytes at 4 KiB clusters: a two-cluster chain ending in EOC.
    let first = u16::from_le_bytes(short[26..28].try_into().unwrap()) as u32
        | ((u16::from_le_bytes(short[20..22].try_into().unwrap()) as u32) << 16);
    assert_eq!(chain_of(&fs, first).len(), 2);

    // Lookup is case-insensitive on the long name.
    assert_eq!(
        fs.stat("/a VERY long FILENAME.txt", true).unwrap().size,
        5000
    );

    // Free-count bookkeeping: root + two data clusters are in use.
    let (free, clusters) = fs.with_fs(|f| (f.sb.free_clusters, f.sb.num_clusters));
    assert_eq!(free, clusters - 3);

    fs.sync().unwrap();
    fs.shutdown().unwrap();

    // Everything survives a remount, including the FSInfo hints.
    let fs = mount_rw(&disk);
    assert_eq!(fs.with_fs(|f| f.sb.free_clusters), clusters - 3);
    let fd = fs.open(name, O_RDONLY).unwrap();
    let mut back = vec![0u8; 6000];
    assert_eq!(fs.read(fd, &mut back).unwrap(), 5000);
    assert_eq!(&back[..5000], &payload[..]);
    fs.close(fd).unwrap();
    fs.shutdown().unwrap();
}

#[test]
fn fat12_entry_straddles_sectors() {
    // ~633 clusters at one sector each: the FAT spans two sectors and
    // entry 341 sits on the boundary byte.
    let disk = format_disk(
        640 * 512,
        &fat::FormatOpts {
            sectors_per_cluster: 1,
            root_entries: 32,
            fat_type: Some(FatType::Fat12),
            ..Default::default()
        },
    );
    let fs = mount_rw(&disk);
    assert_eq!(fs.with_fs(|f| f.fs_type()), FatType::Fat12);

    fs.with_fs(|f| {
        // 341 * 1.5 = 511.5: the entry's two bytes live in different
        // sectors. Write it and its even neighbor, then read both back.
        f.write_fat(340, 0xABC).unwrap();
        f.write_fat(341, 0x234).unwrap();
        f.write_fat(342, 0xDEF).unwrap();
        assert_eq!(f.read_fat(340).unwrap(), 0xABC);
        assert_eq!(f.read_fat(341).unwrap(), 0x234);
        assert_eq!(f.read_fat(342).unwrap(), 0xDEF);
        // Clean up for the allocator.
        f.write_fat(340, 0).unwrap();
        f.write_fat(341, 0).unwrap();
        f.write_fat(342, 0).unwrap();
    });

    // A 400-cluster file forces a live chain link across the boundary.
    let payload: Vec<u8> = (0..400 * 512u32).map(|i| (i % 253) as u8).collect();
    let fd = fs.open("/big.bin", O_CREAT | O_RDWR).unwrap();
    assert_eq!(fs.write(fd, &payload).unwrap(), payload.len());
    fs.close(fd).unwrap();

    let first = fs.stat("/big.bin", true).unwrap().ino as u32;
    let chain = chain_of(&fs, first);
    assert_eq!(chain.len(), 400);
    assert!(chain.contains(&341), "chain must cross the straddle entry");

    fs.sync().unwrap();
    fs.shutdown().unwrap();

    // The straddled link must survive the remount.
    let fs = mount_rw(&disk);
    let first = fs.stat("/big.bin", true).unwrap().ino as u32;
    assert_eq!(chain_of(&fs, first).len(), 400);
    let fd = fs.open("/big.bin", O_RDONLY).unwrap();
    let mut back = vec![0u8; payload.len()];
    assert_eq!(fs.read(fd, &mut back).unwrap(), payload.len());
    assert_eq!(back, payload);
    fs.close(fd).unwrap();
    fs.shutdown().unwrap();
}

#[test]
fn fat16_file_roundtrip_and_chain_invariant() {
    let disk = fat16_disk();
    let fs = mount_rw(&disk);
    assert_eq!(fs.with_fs(|f| f.fs_type()), FatType::Fat16);
    let cs = fs.with_fs(|f| f.cluster_size()) as u64;

    // A fresh file owns no clusters at all.
    let fd = fs.open("/data.bin", O_CREAT | O_RDWR).unwrap();
    assert_eq!(fs.stat("/data.bin", true).unwrap().size, 0);
    let st = fs.stat("/data.bin", true).unwrap();
    assert_eq!(st.blocks, 0);

    // Grow it; the chain tracks ceil(size / cluster).
    let payload: Vec<u8> = (0..3 * cs as u32 + 100).map(|i| (i % 249) as u8).collect();
    fs.write(fd, &payload).unwrap();
    fs.close(fd).unwrap();

    let st = fs.stat("/data.bin", true).unwrap();
    assert_eq!(st.size, payload.len() as u64);
    let first = st.ino as u32;
    assert_eq!(chain_of(&fs, first).len(), 4);

    // Seek back and overwrite a window in the middle.
    let fd = fs.open("/data.bin", O_RDWR).unwrap();
    fs.seek(fd, cs as i64 + 7, Whence::Set).unwrap();
    fs.write(fd, b"OVERWRITE").unwrap();
    fs.seek(fd, cs as i64, Whence::Set).unwrap();
    let mut buf = [0u8; 32];
    fs.read(fd, &mut buf).unwrap();
    assert_eq!(&buf[7..16], b"OVERWRITE");
    assert_eq!(buf[0], ((cs as u32) % 249) as u8);
    fs.close(fd).unwrap();

    // Truncation returns every cluster.
    let fd = fs.open("/data.bin", O_RDWR | O_TRUNC).unwrap();
    fs.close(fd).unwrap();
    let st = fs.stat("/data.bin", true).unwrap();
    assert_eq!((st.size, st.blocks), (0, 0));
    assert!(chain_of(&fs, st.ino as u32).is_empty());

    fs.unlink("/data.bin").unwrap();
    assert_eq!(fs.stat("/data.bin", true).unwrap_err(), FsError::NoEntry);
    fs.shutdown().unwrap();
}

#[test]
fn fat_no_cluster_in_two_chains() {
    let disk = fat16_disk();
    let fs = mount_rw(&disk);

    let mut firsts = vec![];
    for i in 0..6 {
        let name = format!("/file{}.bin", i);
        let fd = fs.open(&name, O_CREAT | O_RDWR).unwrap();
        fs.write(fd, &vec![i as u8; 5000]).unwrap();
        fs.close(fd).unwrap();
        firsts.push(fs.stat(&name, true).unwrap().ino as u32);
    }
    // Punch holes in the allocation pattern, then allocate again.
    fs.unlink("/file2.bin").unwrap();
    fs.unlink("/file4.bin").unwrap();
    let fd = fs.open("/file6.bin", O_CREAT | O_RDWR).unwrap();
    fs.write(fd, &vec![66u8; 9000]).unwrap();
    fs.close(fd).unwrap();
    firsts.remove(4);
    firsts.remove(2);
    firsts.push(fs.stat("/file6.bin", true).unwrap().ino as u32);

    let mut all = vec![];
    for &f in &firsts {
        all.extend(chain_of(&fs, f));
    }
    let before = all.len();
    all.sort_unstable();
    all.dedup();
    assert_eq!(before, all.len(), "a cluster appears in two chains");

    fs.shutdown().unwrap();
}

#[test]
fn shortname_tails_count_up() {
    let disk = fat16_disk();
    let fs = mount_rw(&disk);

    for name in ["/long file name one.txt", "/long file name two.txt"] {
        let fd = fs.open(name, O_CREAT | O_RDWR).unwrap();
        fs.close(fd).unwrap();
    }

    let root_sector = fs.with_fs(|f| match f.root_loc() {
        Loc::Sector(s) => s,
        Loc::Cluster(_) => unreachable!(),
    });
    // Scan the fixed root area for the generated short names.
    let shorts: Vec<[u8; 11]> = fs.with_fs(|f| {
        let mut out = vec![];
        for s in 0..4 {
            let rec = f.record(Loc::Sector(root_sector + s)).unwrap().to_vec();
            for i in 0..512 / 32 {
                let r = &rec[i * 32..i * 32 + 32];
                if r[0] == 0 || r[0] == 0xE5 || r[11] & 0x3F == 0x0F {
                    continue;
                }
                out.push(r[..11].try_into().unwrap());
            }
        }
        out
    });
    assert!(shorts.contains(b"LONGFI~1TXT"));
    assert!(shorts.contains(b"LONGFI~2TXT"));

    // Both resolve by their long names, in any case mix.
    assert!(fs.stat("/LONG FILE NAME ONE.txt", true).is_ok());
    assert!(fs.stat("/long file name two.TXT", true).is_ok());

    fs.shutdown().unwrap();
}

#[test]
fn directory_grows_across_clusters() {
    let disk = fat16_disk();
    let fs = mount_rw(&disk);

    fs.mkdir("/sub").unwrap();
    // 64 entries per 2 KiB cluster; 100 files force an extension.
    for i in 0..100 {
        let fd = fs
            .open(&format!("/sub/F{:03}", i), O_CREAT | O_RDWR)
            .unwrap();
        fs.close(fd).unwrap();
    }

    let first = fs.stat("/sub", true).unwrap().ino as u32;
    assert!(chain_of(&fs, first).len() >= 2, "directory did not grow");

    let fd = fs.open("/sub", O_RDONLY | O_DIR).unwrap();
    let mut names = vec![];
    while let Some(ent) = fs.readdir(fd).unwrap() {
        names.push(ent.name);
    }
    fs.close(fd).unwrap();
    assert_eq!(names.len(), 102); // . and .. included
    assert!(names.contains(&"F099".to_string()));

    assert_eq!(fs.rmdir("/sub").unwrap_err(), FsError::NotEmpty);
    for i in 0..100 {
        fs.unlink(&format!("/sub/F{:03}", i)).unwrap();
    }
    fs.rmdir("/sub").unwrap();
    assert_eq!(fs.stat("/sub", true).unwrap_err(), FsError::NoEntry);

    fs.shutdown().unwrap();
}

#[test]
fn fat12_root_directory_cannot_grow() {
    let disk = format_disk(
        640 * 512,
        &fat::FormatOpts {
            sectors_per_cluster: 1,
            root_entries: 16,
            fat_type: Some(FatType::Fat12),
            ..Default::default()
        },
    );
    let fs = mount_rw(&disk);

    for i in 0..16 {
        let fd = fs.open(&format!("/R{:02}", i), O_CREAT | O_RDWR).unwrap();
        fs.close(fd).unwrap();
    }
    assert_eq!(
        fs.open("/R16", O_CREAT | O_RDWR).unwrap_err(),
        FsError::NoSpace
    );

    // Freeing a slot makes room again.
    fs.unlink("/R07").unwrap();
    let fd = fs.open("/R16", O_CREAT | O_RDWR).unwrap();
    fs.close(fd).unwrap();

    fs.shutdown().unwrap();
}

#[test]
fn seek_past_end_zero_fills() {
    let disk = fat16_disk();
    let fs = mount_rw(&disk);

    let fd = fs.open("/gap.bin", O_CREAT | O_RDWR).unwrap();
    fs.seek(fd, 5000, Whence::Set).unwrap();
    fs.write(fd, &[0x5A; 100]).unwrap();
    assert_eq!(fs.total(fd).unwrap(), 5100);

    fs.seek(fd, 0, Whence::Set).unwrap();
    let mut buf = vec![0xFFu8; 5100];
    assert_eq!(fs.read(fd, &mut buf).unwrap(), 5100);
    assert!(buf[..5000].iter().all(|&b| b == 0));
    assert!(buf[5000..].iter().all(|&b| b == 0x5A));
    fs.close(fd).unwrap();

    // ceil(5100 / 2048) = 3 clusters.
    let st = fs.stat("/gap.bin", true).unwrap();
    assert_eq!(chain_of(&fs, st.ino as u32).len(), 3);

    fs.shutdown().unwrap();
}

#[test]
fn append_mode_and_tell() {
    let disk = fat16_disk();
    let fs = mount_rw(&disk);

    let fd = fs.open("/log", O_CREAT | O_WRONLY).unwrap();
    fs.write(fd, b"alpha").unwrap();
    fs.close(fd).unwrap();

    let fd = fs.open("/log", O_WRONLY | O_APPEND).unwrap();
    fs.write(fd, b"-beta").unwrap();
    assert_eq!(fs.tell(fd).unwrap(), 10);
    fs.close(fd).unwrap();

    let fd = fs.open("/log", O_RDONLY).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(fs.read(fd, &mut buf).unwrap(), 10);
    assert_eq!(&buf[..10], b"alpha-beta");
    fs.close(fd).unwrap();
    fs.shutdown().unwrap();
}

#[test]
fn read_only_mount_rejects_writes() {
    let disk = fat16_disk();
    {
        let fs = mount_rw(&disk);
        let fd = fs.open("/keep.txt", O_CREAT | O_RDWR).unwrap();
        fs.write(fd, b"frozen").unwrap();
        fs.close(fd).unwrap();
        fs.shutdown().unwrap();
    }

    disk.reset_write_count();
    let fs = FatVfs::mount(Box::new(disk.read_only_handle()), MNT_READ_WRITE).unwrap();

    assert_eq!(
        fs.open("/new", O_CREAT | O_RDWR).unwrap_err(),
        FsError::ReadOnly
    );
    assert_eq!(fs.mkdir("/d").unwrap_err(), FsError::ReadOnly);
    assert_eq!(fs.unlink("/keep.txt").unwrap_err(), FsError::ReadOnly);

    let fd = fs.open("/keep.txt", O_RDONLY).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(fs.read(fd, &mut buf).unwrap(), 6);
    assert_eq!(&buf[..6], b"frozen");
    fs.close(fd).unwrap();
    fs.shutdown().unwrap();

    assert_eq!(disk.write_count(), 0, "read-only mount touched the device");
}

#[test]
fn links_and_rename_are_unsupported() {
    let disk = fat16_disk();
    let fs = mount_rw(&disk);
    let fd = fs.open("/a", O_CREAT | O_RDWR).unwrap();
    fs.close(fd).unwrap();

    assert_eq!(fs.rename("/a", "/b").unwrap_err(), FsError::Unsupported);
    assert_eq!(fs.link("/a", "/b").unwrap_err(), FsError::Unsupported);
    assert_eq!(fs.symlink("/a", "/b").unwrap_err(), FsError::Unsupported);
    assert_eq!(fs.readlink("/a").unwrap_err(), FsError::Unsupported);
    fs.shutdown().unwrap();
}

#[test]
fn busy_handles_block_unlink_and_rmdir() {
    let disk = fat16_disk();
    let fs = mount_rw(&disk);

    let fd = fs.open("/busy", O_CREAT | O_RDWR).unwrap();
    assert_eq!(fs.unlink("/busy").unwrap_err(), FsError::Busy);
    fs.close(fd).unwrap();
    fs.unlink("/busy").unwrap();

    fs.mkdir("/held").unwrap();
    let fd = fs.open("/held", O_RDONLY | O_DIR).unwrap();
    assert_eq!(fs.rmdir("/held").unwrap_err(), FsError::Busy);
    fs.close(fd).unwrap();
    fs.rmdir("/held").unwrap();
    fs.shutdown().unwrap();
}

#[test]
fn dot_entries_in_new_directories() {
    let disk = fat16_disk();
    let fs = mount_rw(&disk);

    fs.mkdir("/parent").unwrap();
    fs.mkdir("/parent/child").unwrap();

    let parent_cl = fs.stat("/parent", true).unwrap().ino as u32;
    let child_cl = fs.stat("/parent/child", true).unwrap().ino as u32;

    let records = raw_dir_records(&fs, child_cl);
    assert_eq!(&records[0][..11], b".          ");
    assert_eq!(&records[1][..11], b"..         ");
    let dot_cl = u16::from_le_bytes(records[0][26..28].try_into().unwrap()) as u32;
    let dotdot_cl = u16::from_le_bytes(records[1][26..28].try_into().unwrap()) as u32;
    assert_eq!(dot_cl, child_cl);
    assert_eq!(dotdot_cl, parent_cl);

    // A directory directly under the root points `..` at cluster 0.
    let records = raw_dir_records(&fs, parent_cl);
    assert_eq!(&records[1][..11], b"..         ");
    assert_eq!(u16::from_le_bytes(records[1][26..28].try_into().unwrap()), 0);

    fs.shutdown().unwrap();
}

#[test]
fn cache_state_is_clean_after_sync() {
    let disk = fat16_disk();
    let fs = mount_rw(&disk);

    for i in 0..10 {
        let fd = fs.open(&format!("/c{}", i), O_CREAT | O_RDWR).unwrap();
        fs.write(fd, &vec![i as u8; 3000]).unwrap();
        fs.close(fd).unwrap();
    }
    fs.sync().unwrap();

    fs.with_fs(|f| {
        let (data, fatc) = f.cache_records();
        let mut ids: Vec<_> = data.iter().map(|&(id, _)| id).collect();
        ids.sort_by_key(|l| match *l {
            Loc::Cluster(c) => (0u8, c),
            Loc::Sector(s) => (1u8, s),
        });
        let n = ids.len();
        ids.dedup();
        assert_eq!(n, ids.len());
        for &(_, flags) in &data {
            assert_eq!(flags & 2, 0, "dirty data record after sync");
        }
        for &(_, flags) in &fatc {
            assert_eq!(flags & 2, 0, "dirty FAT record after sync");
        }
    });
    fs.shutdown().unwrap();
}
