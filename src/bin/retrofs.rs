use anyhow::{anyhow, Result};
use clap::{arg, command, ArgAction};
use log::info;
use retrofs::block_dev::{BlockDevice, FileBlockDevice};
use retrofs::mount::{flags, mount_flags};
use retrofs::{ext2, fat, init_logs, FileSystem, NodeKind};
use std::io::Write;
use std::sync::Arc;

fn open_device(image: &str, read_only: bool) -> Box<dyn BlockDevice> {
    Box::new(FileBlockDevice::new(image, 9, read_only))
}

fn mount_image(image: &str, fstype: &str, read_only: bool) -> Result<Arc<dyn FileSystem>> {
    let dev = open_device(image, read_only);
    let mflags = if read_only {
        mount_flags::MNT_READ_ONLY
    } else {
        mount_flags::MNT_READ_WRITE
    };
    let fs: Arc<dyn FileSystem> = match fstype {
        "ext2" => Arc::new(ext2::Ext2Vfs::mount(dev, mflags)?),
        "fat" => Arc::new(fat::FatVfs::mount(dev, mflags)?),
        other => return Err(anyhow!("unknown filesystem type {}", other)),
    };
    Ok(fs)
}

fn main() -> Result<()> {
    let matches = command!() // requires `cargo` feature
        .arg(arg!(<image> "Image file to operate on"))
        .arg(arg!(<command> "mkfs-ext2 | mkfs-fat | ls | stat | cat | readlink"))
        .arg(arg!([path] "Path within the image").default_value("/"))
        .arg(arg!(-t --fstype <TYPE> "Filesystem type: ext2 or fat")
            .required(false)
            .default_value("ext2"))
        .arg(arg!(-c --cluster <SECTORS> "Sectors per cluster for mkfs-fat")
            .required(false)
            .default_value("4"))
        .arg(arg!(-v --verbose "Print debug information, or set `RUST_LOG=debug`")
            .action(ArgAction::SetTrue)
            .required(false))
        .get_matches();

    if matches.get_flag("verbose") {
        std::env::set_var("RUST_LOG", "debug");
    }
    init_logs();

    let image = matches.get_one::<String>("image").unwrap();
    let cmd = matches.get_one::<String>("command").unwrap();
    let path = matches.get_one::<String>("path").unwrap();
    let fstype = matches.get_one::<String>("fstype").unwrap();

    match cmd.as_str() {
        "mkfs-ext2" => {
            let mut dev = open_device(image, false);
            ext2::format(dev.as_mut(), &ext2::FormatOpts::default())?;
            info!("ext2 filesystem written to {}", image);
            Ok(())
        }
        "mkfs-fat" => {
            let spc: u8 = matches.get_one::<String>("cluster").unwrap().parse()?;
            let mut dev = open_device(image, false);
            let opts = fat::FormatOpts {
                sectors_per_cluster: spc,
                ..Default::default()
            };
            fat::format(dev.as_mut(), &opts)?;
            info!("FAT filesystem written to {}", image);
            Ok(())
        }
        "ls" => {
            let fs = mount_image(image, fstype, true)?;
            let fd = fs.open(path, flags::O_RDONLY | flags::O_DIR)?;
            while let Some(ent) = fs.readdir(fd)? {
                let tag = match ent.kind {
                    NodeKind::Dir => "d",
                    NodeKind::Symlink => "l",
                    _ => "-",
                };
                println!("{} {:>10}  {}", tag, ent.size, ent.name);
            }
            fs.close(fd)?;
            fs.shutdown()?;
            Ok(())
        }
        "stat" => {
            let fs = mount_image(image, fstype, true)?;
            let st = fs.stat(path, true)?;
            println!(
                "{}: ino {} kind {:?} perm {:o} links {} size {} blocks {}",
                path, st.ino, st.kind, st.perm, st.nlink, st.size, st.blocks
            );
            fs.shutdown()?;
            Ok(())
        }
        "cat" => {
            let fs = mount_image(image, fstype, true)?;
            let fd = fs.open(path, flags::O_RDONLY)?;
            let mut buf = vec![0u8; 64 * 1024];
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            loop {
                let n = fs.read(fd, &mut buf)?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n])?;
            }
            fs.close(fd)?;
            fs.shutdown()?;
            Ok(())
        }
        "readlink" => {
            let fs = mount_image(image, fstype, true)?;
            println!("{}", fs.readlink(path)?);
            fs.shutdown()?;
            Ok(())
        }
        other => Err(anyhow!("unknown command {}", other)),
    }
}
