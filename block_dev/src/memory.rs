use crate::{check_range, BlockDevice, BlockStats};
use anyhow::{anyhow, Result};

/// RAM-backed block device. Mostly used by tests, where the read/write
/// counters let a suite assert that a read-only mount never touches the
/// backing store.
pub struct MemBlockDevice {
    pub stats: BlockStats,
    mem: Vec<u8>,
    log_block_size: u32,
    read_only: bool,
}

impl MemBlockDevice {
    pub fn new(size: usize, log_block_size: u32) -> Self {
        assert_eq!(size & ((1 << log_block_size) - 1), 0);
        Self {
            stats: BlockStats::default(),
            mem: vec![0u8; size],
            log_block_size,
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Hand the raw image over, e.g. to re-open it with a different block
    /// size or reload it after an unmount.
    pub fn into_inner(self) -> Vec<u8> {
        self.mem
    }

    pub fn from_image(mem: Vec<u8>, log_block_size: u32) -> Self {
        assert_eq!(mem.len() & ((1 << log_block_size) - 1), 0);
        Self {
            stats: BlockStats::default(),
            mem,
            log_block_size,
            read_only: false,
        }
    }

    pub fn image(&self) -> &[u8] {
        &self.mem
    }
}

impl BlockDevice for MemBlockDevice {
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_blocks(&mut self, block: u64, count: usize, buf: &mut [u8]) -> Result<()> {
        let bs = self.block_size();
        check_range(block, count, self.count_blocks(), buf.len(), bs)?;
        let off = block as usize * bs;
        buf[..count * bs].copy_from_slice(&self.mem[off..off + count * bs]);
        self.stats.read_cnt += count as u64;
        Ok(())
    }

    fn write_blocks(&mut self, block: u64, count: usize, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(anyhow!("device is read-only"));
        }
        let bs = self.block_size();
        check_range(block, count, self.count_blocks(), buf.len(), bs)?;
        let off = block as usize * bs;
        self.mem[off..off + count * bs].copy_from_slice(&buf[..count * bs]);
        self.stats.write_cnt += count as u64;
        Ok(())
    }

    fn count_blocks(&mut self) -> u64 {
        (self.mem.len() >> self.log_block_size) as u64
    }

    fn log_block_size(&self) -> u32 {
        self.log_block_size
    }

    fn writable(&self) -> bool {
        !self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() -> Result<()> {
        let mut dev = MemBlockDevice::new(8192, 9);
        assert_eq!(dev.count_blocks(), 16);
        let data = [0xA5u8; 1024];
        dev.write_blocks(3, 2, &data)?;
        let mut back = [0u8; 1024];
        dev.read_blocks(3, 2, &mut back)?;
        assert_eq!(&back[..], &data[..]);
        assert_eq!(dev.stats.write_cnt, 2);
        Ok(())
    }

    #[test]
    fn rejects_out_of_range() {
        let mut dev = MemBlockDevice::new(4096, 9);
        let mut buf = [0u8; 512];
        assert!(dev.read_blocks(8, 1, &mut buf).is_err());
        assert!(dev.read_blocks(7, 2, &mut buf).is_err());
    }

    #[test]
    fn read_only_rejects_writes() {
        let mut dev = MemBlockDevice::new(4096, 9).read_only();
        assert!(!dev.writable());
        assert!(dev.write_blocks(0, 1, &[0u8; 512]).is_err());
        assert_eq!(dev.stats.write_cnt, 0);
    }
}
