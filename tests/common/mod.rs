//! Test support: a RAM disk whose image survives unmount, so suites can
//! remount and count device writes.

use anyhow::{anyhow, Result};
use retrofs::block_dev::BlockDevice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub struct SharedDisk {
    data: Arc<Mutex<Vec<u8>>>,
    log_bs: u32,
    read_only: bool,
    writes: Arc<AtomicU64>,
}

impl SharedDisk {
    pub fn new(size: usize, log_bs: u32) -> Self {
        assert_eq!(size & ((1 << log_bs) - 1), 0);
        Self {
            data: Arc::new(Mutex::new(vec![0u8; size])),
            log_bs,
            read_only: false,
            writes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Another handle onto the same image.
    pub fn handle(&self) -> SharedDisk {
        SharedDisk {
            data: Arc::clone(&self.data),
            log_bs: self.log_bs,
            read_only: false,
            writes: Arc::clone(&self.writes),
        }
    }

    pub fn read_only_handle(&self) -> SharedDisk {
        SharedDisk {
            read_only: true,
            ..self.handle()
        }
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn reset_write_count(&self) {
        self.writes.store(0, Ordering::SeqCst);
    }
}

impl BlockDevice for SharedDisk {
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_blocks(&mut self, block: u64, count: usize, buf: &mut [u8]) -> Result<()> {
        let bs = 1usize << self.log_bs;
        let data = self.data.lock().unwrap();
        let off = block as usize * bs;
        if off + count * bs > data.len() {
            return Err(anyhow!("read past device end"));
        }
        buf[..count * bs].copy_from_slice(&data[off..off + count * bs]);
        Ok(())
    }

    fn write_blocks(&mut self, block: u64, count: usize, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(anyhow!("device is read-only"));
        }
        let bs = 1usize << self.log_bs;
        let mut data = self.data.lock().unwrap();
        let off = block as usize * bs;
        if off + count * bs > data.len() {
            return Err(anyhow!("write past device end"));
        }
        data[off..off + count * bs].copy_from_slice(&buf[..count * bs]);
        self.writes.fetch_add(count as u64, Ordering::SeqCst);
        Ok(())
    }

    fn count_blocks(&mut self) -> u64 {
        (self.data.lock().unwrap().len() >> self.log_bs) as u64
    }

    fn log_block_size(&self) -> u32 {
        self.log_bs
    }

    fn writable(&self) -> bool {
        !self.read_only
    }
}
