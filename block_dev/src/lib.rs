use anyhow::{anyhow, Result};

pub mod file;
pub mod memory;

pub use file::FileBlockDevice;
pub use memory::MemBlockDevice;

#[derive(Default, Debug, Clone, Copy)]
pub struct BlockStats {
    pub read_cnt: u64,
    pub write_cnt: u64,
}

/// Abstract block device. All engine I/O flows through this trait; a block
/// is always `1 << log_block_size()` bytes and transfers never straddle the
/// device end.
pub trait BlockDevice: Send {
    /// One-time device acquisition.
    fn init(&mut self) -> Result<()>;

    /// Release the device. Idempotent.
    fn shutdown(&mut self) -> Result<()>;

    /// Read exactly `count` blocks starting at `block` into `buf`.
    fn read_blocks(&mut self, block: u64, count: usize, buf: &mut [u8]) -> Result<()>;

    /// Write exactly `count` blocks starting at `block` from `buf`.
    /// Fails on a read-only device.
    fn write_blocks(&mut self, block: u64, count: usize, buf: &[u8]) -> Result<()>;

    /// Total number of blocks on the device.
    fn count_blocks(&mut self) -> u64;

    /// log2 of the block size in bytes, typically 9 (512 B).
    fn log_block_size(&self) -> u32;

    /// Whether write_blocks is usable at all.
    fn writable(&self) -> bool;

    fn block_size(&self) -> usize {
        1 << self.log_block_size()
    }
}

pub(crate) fn check_range(
    block: u64,
    count: usize,
    total: u64,
    buf_len: usize,
    block_size: usize,
) -> Result<()> {
    if buf_len < count * block_size {
        return Err(anyhow!("buffer too small for {} blocks", count));
    }
    if block + count as u64 > total {
        return Err(anyhow!(
            "block range {}..{} out of bounds ({} total)",
            block,
            block + count as u64,
            total
        ));
    }
    Ok(())
}
