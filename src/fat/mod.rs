//! The FAT engine: FAT12/FAT16/FAT32 with VFAT long names.

pub mod desc;
pub mod dir;
pub mod format;
pub mod fs;
pub mod table;
pub mod vfs;

pub use desc::{FatDentry, FatLongName, FatType};
pub use format::{format, FormatOpts};
pub use fs::{FatFs, FatSuperBlock, Loc};
pub use vfs::FatVfs;
