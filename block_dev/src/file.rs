use crate::{check_range, BlockDevice, BlockStats};
use anyhow::{anyhow, Context, Result};
use log::debug;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Block device backed by a host image file.
pub struct FileBlockDevice {
    pub stats: BlockStats,
    path: PathBuf,
    file: Option<File>,
    log_block_size: u32,
    read_only: bool,
    block_count: u64,
}

impl FileBlockDevice {
    pub fn new<P: AsRef<Path>>(path: P, log_block_size: u32, read_only: bool) -> Self {
        Self {
            stats: BlockStats::default(),
            path: path.as_ref().to_path_buf(),
            file: None,
            log_block_size,
            read_only,
            block_count: 0,
        }
    }

    fn file(&mut self) -> Result<&mut File> {
        self.file.as_mut().ok_or_else(|| anyhow!("device not initialized"))
    }
}

impl BlockDevice for FileBlockDevice {
    fn init(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(!self.read_only)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        let len = file.metadata()?.len();
        self.block_count = len >> self.log_block_size;
        debug!(
            "opened {} ({} blocks of {} bytes)",
            self.path.display(),
            self.block_count,
            1u64 << self.log_block_size
        );
        self.file = Some(file);
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }

    fn read_blocks(&mut self, block: u64, count: usize, buf: &mut [u8]) -> Result<()> {
        let bs = self.block_size();
        check_range(block, count, self.block_count, buf.len(), bs)?;
        let file = self.file()?;
        file.seek(SeekFrom::Start(block * bs as u64))?;
        file.read_exact(&mut buf[..count * bs])?;
        self.stats.read_cnt += count as u64;
        Ok(())
    }

    fn write_blocks(&mut self, block: u64, count: usize, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(anyhow!("device is read-only"));
        }
        let bs = self.block_size();
        check_range(block, count, self.block_count, buf.len(), bs)?;
        let file = self.file()?;
        file.seek(SeekFrom::Start(block * bs as u64))?;
        file.write_all(&buf[..count * bs])?;
        self.stats.write_cnt += count as u64;
        Ok(())
    }

    fn count_blocks(&mut self) -> u64 {
        self.block_count
    }

    fn log_block_size(&self) -> u32 {
        self.log_block_size
    }

    fn writable(&self) -> bool {
        !self.read_only
    }
}
