//! Integration tests for the ext2 engine, driven through the uniform
//! filesystem interface over a RAM disk.

mod common;

use common::SharedDisk;
use retrofs::errors::FsError;
use retrofs::ext2::{self, Ext2Vfs};
use retrofs::mount::flags::*;
use retrofs::mount::mount_flags::*;
use retrofs::{FileSystem, NodeKind, Whence};

const IMAGE_SIZE: usize = 4 * 1024 * 1024;

fn format_disk() -> SharedDisk {
    let disk = SharedDisk::new(IMAGE_SIZE, 9);
    ext2::format(&mut disk.handle(), &ext2::FormatOpts::default()).unwrap();
    disk
}

fn mount_rw(disk: &SharedDisk) -> Ext2Vfs {
    Ext2Vfs::mount(Box::new(disk.handle()), MNT_READ_WRITE).unwrap()
}

/// Block-group free counts must equal the zero-bit population of their
/// bitmaps once everything is synced.
fn check_bitmap_counts(vfs: &Ext2Vfs) {
    vfs.with_fs(|fs| {
        let base = fs.sb.s_first_data_block.get();
        let bpg = fs.sb.s_blocks_per_group.get();
        let ipg = fs.sb.s_inodes_per_group.get();
        let blocks = fs.sb.s_blocks_count.get();
        let mut total_free_blocks = 0u32;
        let mut total_free_inodes = 0u32;

        for g in 0..fs.bg.len() {
            let desc = fs.bg[g];
            let in_group = (blocks - base - g as u32 * bpg).min(bpg);

            let bitmap = fs.block(desc.bg_block_bitmap.get()).unwrap().to_vec();
            let mut free = 0;
            for bit in 0..in_group {
                if bitmap[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
                    free += 1;
                }
            }
            assert_eq!(
                free,
                desc.bg_free_blocks_count.get() as u32,
                "block bitmap and descriptor disagree in group {}",
                g
            );
            total_free_blocks += free;

            let bitmap = fs.block(desc.bg_inode_bitmap.get()).unwrap().to_vec();
            let mut free = 0;
            for bit in 0..ipg {
                if bitmap[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
                    free += 1;
                }
            }
            assert_eq!(
                free,
                desc.bg_free_inodes_count.get() as u32,
                "inode bitmap and descriptor disagree in group {}",
                g
            );
            total_free_inodes += free;
        }

        assert_eq!(total_free_blocks, fs.sb.s_free_blocks_count.get());
        assert_eq!(total_free_inodes, fs.sb.s_free_inodes_count.get());
    });
}

/// Every directory block must tile exactly with 4-byte-aligned entries.
fn check_dir_tiling(vfs: &Ext2Vfs, ino: u32) {
    vfs.with_fs(|fs| {
        let bs = fs.block_size();
        let dir = fs.inode_get(ino).unwrap();
        assert_eq!(dir.i_size.get() as usize % bs, 0);
        for lblk in 0..dir.i_size.get() as usize / bs {
            let bn = fs.inode_block_index(&dir, lblk as u32).unwrap();
            assert_ne!(bn, 0, "directory hole");
            let block = fs.block(bn).unwrap().to_vec();
            let mut off = 0usize;
            while off < bs {
                let rec_len =
                    u16::from_le_bytes(block[off + 4..off + 6].try_into().unwrap()) as usize;
                assert!(rec_len >= 8, "rec_len too small at {}", off);
                assert_eq!(rec_len % 4, 0, "rec_len unaligned at {}", off);
                off += rec_len;
            }
            assert_eq!(off, bs, "entries do not tile the block");
        }
    });
}

/// No record id twice in the cache; Dirty implies Valid; nothing dirty
/// after a sync.
fn check_cache(vfs: &Ext2Vfs, after_sync: bool) {
    vfs.with_fs(|fs| {
        let records = fs.cache_records();
        let mut ids: Vec<u32> = records.iter().map(|&(id, _)| id).collect();
        ids.sort_unstable();
        let before = ids.len();
        ids.dedup();
        assert_eq!(before, ids.len(), "duplicate record in cache");
        for &(_, flags) in &records {
            if flags & 2 != 0 {
                assert!(flags & 1 != 0, "dirty but invalid record");
            }
            if after_sync {
                assert_eq!(flags & 2, 0, "dirty record after sync");
            }
        }
    });
}

#[test]
fn create_write_stat_and_remount() {
    let disk = format_disk();
    let fs = mount_rw(&disk);

    let fd = fs.open("/hello.txt", O_CREAT | O_RDWR).unwrap();
    assert_eq!(fs.write(fd, b"Hello, world!").unwrap(), 13);
    fs.close(fd).unwrap();

    let st = fs.stat("/hello.txt", true).unwrap();
    assert_eq!(st.size, 13);
    assert_eq!(st.kind, NodeKind::File);
    assert_eq!(st.nlink, 1);

    fs.sync().unwrap();
    check_cache(&fs, true);
    check_bitmap_counts(&fs);
    fs.shutdown().unwrap();

    // The file must survive a remount.
    let fs = mount_rw(&disk);
    let fd = fs.open("/hello.txt", O_RDONLY).unwrap();
    let mut buf = [0u8; 32];
    assert_eq!(fs.read(fd, &mut buf).unwrap(), 13);
    assert_eq!(&buf[..13], b"Hello, world!");
    assert_eq!(fs.total(fd).unwrap(), 13);
    fs.close(fd).unwrap();
    fs.shutdown().unwrap();
}

#[test]
fn mkdir_rmdir_not_empty() {
    let disk = format_disk();
    let fs = mount_rw(&disk);

    fs.mkdir("/a").unwrap();
    fs.mkdir("/a/b").unwrap();

    assert_eq!(fs.rmdir("/a").unwrap_err(), FsError::NotEmpty);
    fs.rmdir("/a/b").unwrap();
    fs.rmdir("/a").unwrap();
    assert_eq!(fs.stat("/a", true).unwrap_err(), FsError::NoEntry);

    fs.sync().unwrap();
    check_bitmap_counts(&fs);
    check_dir_tiling(&fs, 2);
    fs.shutdown().unwrap();
}

#[test]
fn rename_refuses_own_ancestor() {
    let disk = format_disk();
    let fs = mount_rw(&disk);

    fs.mkdir("/x").unwrap();
    fs.mkdir("/x/y").unwrap();
    fs.mkdir("/x/y/z").unwrap();

    assert_eq!(
        fs.rename("/x", "/x/y/z/w").unwrap_err(),
        FsError::InvalidArg
    );
    fs.shutdown().unwrap();
}

#[test]
fn rename_moves_and_fixes_dotdot() {
    let disk = format_disk();
    let fs = mount_rw(&disk);

    fs.mkdir("/src").unwrap();
    fs.mkdir("/dst").unwrap();
    fs.mkdir("/src/sub").unwrap();
    let fd = fs.open("/src/sub/file", O_CREAT | O_RDWR).unwrap();
    fs.write(fd, b"payload").unwrap();
    fs.close(fd).unwrap();

    fs.rename("/src/sub", "/dst/moved").unwrap();
    assert_eq!(fs.stat("/src/sub", true).unwrap_err(), FsError::NoEntry);
    assert_eq!(fs.stat("/dst/moved/file", true).unwrap().size, 7);

    // Link counts moved with the subtree: /src lost a child, /dst gained
    // one.
    assert_eq!(fs.stat("/src", true).unwrap().nlink, 2);
    assert_eq!(fs.stat("/dst", true).unwrap().nlink, 3);

    // Replacing an existing empty directory is allowed; a non-empty one
    // is not.
    fs.mkdir("/dst/empty").unwrap();
    fs.rename("/dst/moved", "/dst/empty").unwrap();
    assert_eq!(fs.stat("/dst/empty/file", true).unwrap().size, 7);

    fs.mkdir("/other").unwrap();
    assert_eq!(
        fs.rename("/other", "/dst/empty").unwrap_err(),
        FsError::NotEmpty
    );

    fs.sync().unwrap();
    check_bitmap_counts(&fs);
    fs.shutdown().unwrap();
}

#[test]
fn rename_file_over_file_and_busy() {
    let disk = format_disk();
    let fs = mount_rw(&disk);

    for (name, data) in [("/one", b"1111" as &[u8]), ("/two", b"22")] {
        let fd = fs.open(name, O_CREAT | O_RDWR).unwrap();
        fs.write(fd, data).unwrap();
        fs.close(fd).unwrap();
    }

    // Replacing an open destination is refused.
    let fd = fs.open("/two", O_RDONLY).unwrap();
    assert_eq!(fs.rename("/one", "/two").unwrap_err(), FsError::Busy);
    fs.close(fd).unwrap();

    fs.rename("/one", "/two").unwrap();
    assert_eq!(fs.stat("/one", true).unwrap_err(), FsError::NoEntry);
    assert_eq!(fs.stat("/two", true).unwrap().size, 4);

    fs.sync().unwrap();
    check_bitmap_counts(&fs);
    fs.shutdown().unwrap();
}

#[test]
fn symlink_inline_threshold() {
    let disk = format_disk();
    let fs = mount_rw(&disk);

    // 5-character target: inline, no data blocks.
    fs.symlink("short", "/s1").unwrap();
    let st = fs.stat("/s1", false).unwrap();
    assert_eq!(st.kind, NodeKind::Symlink);
    assert_eq!(st.size, 5);
    assert_eq!(st.blocks, 0);
    assert_eq!(fs.readlink("/s1").unwrap(), "short");

    // 59 characters still fit inline; 60 spill into a block.
    let target59: String = "a".repeat(59);
    fs.symlink(&target59, "/s59").unwrap();
    assert_eq!(fs.stat("/s59", false).unwrap().blocks, 0);
    assert_eq!(fs.readlink("/s59").unwrap(), target59);

    let target60: String = "b".repeat(60);
    fs.symlink(&target60, "/s60").unwrap();
    let st = fs.stat("/s60", false).unwrap();
    // One 1 KiB block, counted in 512-byte units.
    assert_eq!(st.blocks, 2);
    assert_eq!(fs.readlink("/s60").unwrap(), target60);

    // 100-character target: one data block, full round trip.
    let target100: String = "c".repeat(100);
    fs.symlink(&target100, "/s100").unwrap();
    let st = fs.stat("/s100", false).unwrap();
    assert_eq!(st.size, 100);
    assert_eq!(st.blocks, 2);
    assert_eq!(fs.readlink("/s100").unwrap(), target100);

    fs.sync().unwrap();
    check_bitmap_counts(&fs);
    fs.shutdown().unwrap();

    // Symlinks survive remount.
    let fs = mount_rw(&disk);
    assert_eq!(fs.readlink("/s100").unwrap(), target100);
    fs.shutdown().unwrap();
}

#[test]
fn symlinks_resolve_in_paths() {
    let disk = format_disk();
    let fs = mount_rw(&disk);

    fs.mkdir("/data").unwrap();
    let fd = fs.open("/data/file", O_CREAT | O_RDWR).unwrap();
    fs.write(fd, b"via link").unwrap();
    fs.close(fd).unwrap();

    fs.symlink("/data", "/link").unwrap();
    assert_eq!(fs.stat("/link/file", true).unwrap().size, 8);
    // Without following, the trailing symlink itself is statted.
    assert_eq!(fs.stat("/link", false).unwrap().kind, NodeKind::Symlink);
    assert_eq!(fs.stat("/link", true).unwrap().kind, NodeKind::Dir);

    // A symlink cycle runs out of follows.
    fs.symlink("/l2", "/l1").unwrap();
    fs.symlink("/l1", "/l2").unwrap();
    assert_eq!(fs.stat("/l1", true).unwrap_err(), FsError::TooManyLinks);

    fs.shutdown().unwrap();
}

#[test]
fn hard_links_share_data() {
    let disk = format_disk();
    let fs = mount_rw(&disk);

    let fd = fs.open("/orig", O_CREAT | O_RDWR).unwrap();
    fs.write(fd, b"shared bytes").unwrap();
    fs.close(fd).unwrap();

    fs.link("/orig", "/alias").unwrap();
    assert_eq!(fs.stat("/orig", true).unwrap().nlink, 2);
    assert_eq!(fs.stat("/alias", true).unwrap().nlink, 2);

    fs.unlink("/orig").unwrap();
    let st = fs.stat("/alias", true).unwrap();
    assert_eq!(st.nlink, 1);
    assert_eq!(st.size, 12);

    let fd = fs.open("/alias", O_RDONLY).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(fs.read(fd, &mut buf).unwrap(), 12);
    assert_eq!(&buf[..12], b"shared bytes");
    fs.close(fd).unwrap();

    // Directories cannot be hard-linked.
    fs.mkdir("/d").unwrap();
    assert_eq!(fs.link("/d", "/d2").unwrap_err(), FsError::NoPermission);

    fs.sync().unwrap();
    check_bitmap_counts(&fs);
    fs.shutdown().unwrap();
}

#[test]
fn sparse_write_reads_zeros() {
    let disk = format_disk();
    let fs = mount_rw(&disk);

    let fd = fs.open("/sparse", O_CREAT | O_RDWR).unwrap();
    assert_eq!(fs.seek(fd, 3000, Whence::Set).unwrap(), 3000);
    fs.write(fd, &[0xAA; 500]).unwrap();
    assert_eq!(fs.total(fd).unwrap(), 3500);

    assert_eq!(fs.seek(fd, 0, Whence::Set).unwrap(), 0);
    let mut buf = vec![0xFFu8; 3500];
    assert_eq!(fs.read(fd, &mut buf).unwrap(), 3500);
    assert!(buf[..3000].iter().all(|&b| b == 0));
    assert!(buf[3000..].iter().all(|&b| b == 0xAA));
    fs.close(fd).unwrap();

    let st = fs.stat("/sparse", true).unwrap();
    assert_eq!(st.size, 3500);

    fs.sync().unwrap();
    check_bitmap_counts(&fs);
    fs.shutdown().unwrap();
}

#[test]
fn large_file_uses_indirect_blocks() {
    let disk = format_disk();
    let fs = mount_rw(&disk);

    // 300 KiB at 1 KiB blocks: direct, single and double indirect.
    let chunk: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
    let fd = fs.open("/big", O_CREAT | O_RDWR).unwrap();
    for _ in 0..300 {
        assert_eq!(fs.write(fd, &chunk).unwrap(), 1024);
    }
    fs.close(fd).unwrap();
    fs.sync().unwrap();
    check_bitmap_counts(&fs);
    fs.shutdown().unwrap();

    let fs = mount_rw(&disk);
    let fd = fs.open("/big", O_RDONLY).unwrap();
    assert_eq!(fs.total(fd).unwrap(), 300 * 1024);
    // Spot-check an offset deep in the double-indirect range.
    assert_eq!(fs.seek(fd, 299 * 1024 + 17, Whence::Set).unwrap(), 299 * 1024 + 17);
    let mut buf = [0u8; 8];
    assert_eq!(fs.read(fd, &mut buf).unwrap(), 8);
    for (i, &b) in buf.iter().enumerate() {
        assert_eq!(b, ((17 + i as u32) % 251) as u8);
    }
    fs.close(fd).unwrap();

    // Deleting it returns every block to the bitmap.
    let free_before = fs.with_fs(|fs| fs.sb.s_free_blocks_count.get());
    fs.unlink("/big").unwrap();
    fs.sync().unwrap();
    let free_after = fs.with_fs(|fs| fs.sb.s_free_blocks_count.get());
    assert!(free_after > free_before + 300);
    check_bitmap_counts(&fs);
    fs.shutdown().unwrap();
}

#[test]
fn readdir_lists_everything_once() {
    let disk = format_disk();
    let fs = mount_rw(&disk);

    fs.mkdir("/dir").unwrap();
    for i in 0..40 {
        let name = format!("/dir/file-with-a-longer-name-{:02}", i);
        let fd = fs.open(&name, O_CREAT | O_RDWR).unwrap();
        fs.close(fd).unwrap();
    }

    let fd = fs.open("/dir", O_RDONLY | O_DIR).unwrap();
    let mut names = vec![];
    while let Some(ent) = fs.readdir(fd).unwrap() {
        names.push(ent.name);
    }
    assert_eq!(names.len(), 42); // . and .. included
    assert!(names.contains(&".".to_string()));
    assert!(names.contains(&"file-with-a-longer-name-39".to_string()));
    let mut dedup = names.clone();
    dedup.sort();
    dedup.dedup();
    assert_eq!(dedup.len(), names.len());

    // rewinddir starts over.
    fs.rewinddir(fd).unwrap();
    assert_eq!(fs.readdir(fd).unwrap().unwrap().name, ".");
    fs.close(fd).unwrap();

    check_dir_tiling(&fs, 2);
    fs.shutdown().unwrap();
}

#[test]
fn unlink_tombstones_keep_directory_walkable() {
    let disk = format_disk();
    let fs = mount_rw(&disk);

    for i in 0..20 {
        let fd = fs
            .open(&format!("/victim-{:02}", i), O_CREAT | O_RDWR)
            .unwrap();
        fs.close(fd).unwrap();
    }
    for i in (0..20).step_by(2) {
        fs.unlink(&format!("/victim-{:02}", i)).unwrap();
    }
    check_dir_tiling(&fs, 2);

    // Survivors all still resolve; deleted ones do not.
    for i in 0..20 {
        let r = fs.stat(&format!("/victim-{:02}", i), true);
        if i % 2 == 0 {
            assert_eq!(r.unwrap_err(), FsError::NoEntry);
        } else {
            assert!(r.is_ok());
        }
    }

    // Freed slots are reused.
    let fd = fs.open("/victim-00", O_CREAT | O_RDWR).unwrap();
    fs.close(fd).unwrap();
    check_dir_tiling(&fs, 2);

    fs.sync().unwrap();
    check_bitmap_counts(&fs);
    fs.shutdown().unwrap();
}

#[test]
fn busy_handles_block_unlink_and_rmdir() {
    let disk = format_disk();
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
fn read_only_mount_rejects_writes() {
    let disk = format_disk();
    {
        // Leave something to look at.
        let fs = mount_rw(&disk);
        let fd = fs.open("/readme", O_CREAT | O_RDWR).unwrap();
        fs.write(fd, b"look, don't touch").unwrap();
        fs.close(fd).unwrap();
        fs.shutdown().unwrap();
    }

    disk.reset_write_count();
    let fs = Ext2Vfs::mount(Box::new(disk.read_only_handle()), MNT_READ_WRITE).unwrap();

    assert_eq!(
        fs.open("/x", O_CREAT | O_RDWR).unwrap_err(),
        FsError::ReadOnly
    );
    assert_eq!(fs.mkdir("/d").unwrap_err(), FsError::ReadOnly);
    assert_eq!(fs.unlink("/readme").unwrap_err(), FsError::ReadOnly);
    assert_eq!(fs.rename("/readme", "/r2").unwrap_err(), FsError::ReadOnly);
    assert_eq!(fs.symlink("/readme", "/s").unwrap_err(), FsError::ReadOnly);
    assert_eq!(fs.link("/readme", "/l").unwrap_err(), FsError::ReadOnly);

    // Reading still works.
    let fd = fs.open("/readme", O_RDONLY).unwrap();
    let mut buf = [0u8; 32];
    assert_eq!(fs.read(fd, &mut buf).unwrap(), 17);
    fs.close(fd).unwrap();
    fs.shutdown().unwrap();

    assert_eq!(disk.write_count(), 0, "read-only mount touched the device");
}

#[test]
fn path_errors() {
    let disk = format_disk();
    let fs = mount_rw(&disk);

    let fd = fs.open("/plain", O_CREAT | O_RDWR).unwrap();
    fs.close(fd).unwrap();

    assert_eq!(fs.open("/nope", O_RDONLY).unwrap_err(), FsError::NoEntry);
    assert_eq!(
        fs.open("/plain/below", O_RDONLY).unwrap_err(),
        FsError::NotDir
    );
    assert_eq!(fs.open("/plain/", O_RDONLY).unwrap_err(), FsError::NotDir);
    // Opening a directory without asking for one.
    assert_eq!(fs.open("/", O_RDONLY).unwrap_err(), FsError::IsDir);
    assert_eq!(fs.rmdir("/plain").unwrap_err(), FsError::NotDir);
    assert_eq!(fs.unlink("/").unwrap_err(), FsError::NoPermission);
    assert_eq!(fs.mkdir("/plain").unwrap_err(), FsError::Exists);

    let long_name = "n".repeat(300);
    assert_eq!(
        fs.open(&format!("/{}", long_name), O_CREAT | O_RDWR)
            .unwrap_err(),
        FsError::NameTooLong
    );

    fs.shutdown().unwrap();
}

#[test]
fn handle_table_fills_up() {
    let disk = format_disk();
    let fs = mount_rw(&disk);

    let fd = fs.open("/f", O_CREAT | O_RDWR).unwrap();
    fs.close(fd).unwrap();

    let mut fds = vec![];
    for _ in 0..16 {
        fds.push(fs.open("/f", O_RDONLY).unwrap());
    }
    assert_eq!(fs.open("/f", O_RDONLY).unwrap_err(), FsError::TooManyFiles);
    for fd in fds {
        fs.close(fd).unwrap();
    }
    assert_eq!(fs.close(99).unwrap_err(), FsError::BadDescriptor);
    fs.shutdown().unwrap();
}

#[test]
fn append_and_truncate() {
    let disk = format_disk();
    let fs = mount_rw(&disk);

    let fd = fs.open("/log", O_CREAT | O_WRONLY).unwrap();
    fs.write(fd, b"first").unwrap();
    fs.close(fd).unwrap();

    let fd = fs.open("/log", O_WRONLY | O_APPEND).unwrap();
    fs.write(fd, b" second").unwrap();
    fs.close(fd).unwrap();
    assert_eq!(fs.stat("/log", true).unwrap().size, 12);

    let fd = fs.open("/log", O_RDWR | O_TRUNC).unwrap();
    assert_eq!(fs.total(fd).unwrap(), 0);
    fs.close(fd).unwrap();
    assert_eq!(fs.stat("/log", true).unwrap().size, 0);

    fs.sync().unwrap();
    check_bitmap_counts(&fs);
    fs.shutdown().unwrap();
}

#[test]
fn fcntl_reports_open_mode() {
    let disk = format_disk();
    let fs = mount_rw(&disk);
    let fd = fs.open("/f", O_CREAT | O_RDWR).unwrap();
    assert_eq!(
        fs.fcntl(fd, retrofs::FcntlCmd::GetFl).unwrap(),
        O_CREAT | O_RDWR
    );
    assert_eq!(fs.fcntl(fd, retrofs::FcntlCmd::GetFd).unwrap(), 0);
    fs.close(fd).unwrap();
    fs.shutdown().unwrap();
}
