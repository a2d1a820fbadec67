//! The ext2 engine: on-disk structures, the metadata engine, directory
//! management, and the POSIX-shaped mounted-volume layer.

pub mod desc;
pub mod dir;
pub mod format;
pub mod fs;
pub mod vfs;

pub use desc::{Ext2FileType, Ext2GroupDesc, Ext2INode, Ext2SuperBlock};
pub use format::{format, FormatOpts};
pub use fs::Ext2Fs;
pub use vfs::Ext2Vfs;
