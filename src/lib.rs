//! Read/write ext2 and FAT (FAT12/16/32 + VFAT long names) filesystem
//! engines over a pluggable block-device contract, with a POSIX-shaped
//! file API and a mount-point registry.

pub use block_dev;

pub mod cache;
pub mod errors;
pub mod ext2;
pub mod fat;
pub mod fspath;
pub mod mount;
pub mod ucs2;

pub use errors::{FsError, FsResult};
pub use mount::{DirEntry, FcntlCmd, FileSystem, MountTable, NodeKind, Stat, Whence};

/// Initialize logging from RUST_LOG. Safe to call more than once.
pub fn init_logs() {
    let _ = env_logger::builder().try_init();
}
