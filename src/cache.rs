use crate::errors::{FsError, FsResult};
use log::warn;

pub const CACHE_FLAG_VALID: u8 = 1;
pub const CACHE_FLAG_DIRTY: u8 = 2;

/// Backing store of a cache: how a record id turns into device I/O. Each
/// engine supplies one backend per cache (FAT sectors, FAT clusters, ext2
/// blocks), so the same replacement logic serves every record shape.
pub trait CacheBackend<K> {
    fn read_record(&mut self, id: K, buf: &mut [u8]) -> FsResult<()>;
    fn write_record(&mut self, id: K, buf: &[u8]) -> FsResult<()>;
}

struct Slot<K> {
    id: K,
    flags: u8,
    data: Vec<u8>,
}

/// Fixed-size write-back cache of equally-sized records, kept in strict
/// recency order: slot 0 is least recently used, the last slot most
/// recently used. Eviction always takes slot 0, writing it back first when
/// dirty, so a working set no larger than the slot count never evicts.
pub struct Cache<K> {
    slots: Vec<Slot<K>>,
    record_size: usize,
}

impl<K: Copy + Eq + Default> Cache<K> {
    pub fn new(slot_count: usize, record_size: usize) -> Self {
        assert!(slot_count >= 1);
        let slots = (0..slot_count)
            .map(|_| Slot {
                id: K::default(),
                flags: 0,
                data: vec![0u8; record_size],
            })
            .collect();
        Self { slots, record_size }
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    fn make_mru(&mut self, index: usize) {
        self.slots[index..].rotate_left(1);
    }

    fn find(&self, id: K) -> Option<usize> {
        // Scan from the most recently used slot down.
        (0..self.slots.len())
            .rev()
            .find(|&i| self.slots[i].flags != 0 && self.slots[i].id == id)
    }

    /// Evict slot 0, writing it back if dirty, and leave it invalid for the
    /// caller to refill.
    fn evict_lru<B: CacheBackend<K>>(&mut self, backend: &mut B) -> FsResult<()> {
        let slot = &mut self.slots[0];
        if slot.flags & CACHE_FLAG_DIRTY != 0 {
            backend.write_record(slot.id, &slot.data)?;
        }
        slot.flags = 0;
        Ok(())
    }

    /// Fetch a record, refilling from the device on a miss.
    pub fn get<B: CacheBackend<K>>(&mut self, backend: &mut B, id: K) -> FsResult<&mut [u8]> {
        if let Some(i) = self.find(id) {
            self.make_mru(i);
            let last = self.slots.len() - 1;
            return Ok(&mut self.slots[last].data);
        }

        self.evict_lru(backend)?;

        let slot = &mut self.slots[0];
        if let Err(e) = backend.read_record(id, &mut slot.data) {
            // The refill failed; leave the slot invalid.
            slot.flags = 0;
            return Err(e);
        }
        slot.id = id;
        slot.flags = CACHE_FLAG_VALID;

        self.make_mru(0);
        let last = self.slots.len() - 1;
        Ok(&mut self.slots[last].data)
    }

    /// Fetch a record that is about to be fully overwritten: skip the
    /// refill read, zero the buffer and mark it dirty.
    pub fn get_cleared<B: CacheBackend<K>>(
        &mut self,
        backend: &mut B,
        id: K,
    ) -> FsResult<&mut [u8]> {
        let i = match self.find(id) {
            Some(i) => i,
            None => {
                self.evict_lru(backend)?;
                self.slots[0].id = id;
                0
            }
        };
        self.slots[i].flags = CACHE_FLAG_VALID | CACHE_FLAG_DIRTY;
        self.make_mru(i);
        let last = self.slots.len() - 1;
        let slot = &mut self.slots[last];
        slot.data.fill(0);
        Ok(&mut slot.data)
    }

    /// Mark a resident record dirty. The record must be present; a miss
    /// here means the engine modified a buffer it never fetched.
    pub fn mark_dirty(&mut self, id: K) -> FsResult<()> {
        match self.find(id) {
            Some(i) => {
                self.slots[i].flags |= CACHE_FLAG_DIRTY;
                self.make_mru(i);
                Ok(())
            }
            None => {
                warn!("mark_dirty on a record not in cache");
                Err(FsError::InvalidArg)
            }
        }
    }

    /// Write every dirty record back and clear its dirty flag. Stops at the
    /// first device error.
    pub fn writeback_all<B: CacheBackend<K>>(&mut self, backend: &mut B) -> FsResult<()> {
        for slot in self.slots.iter_mut().rev() {
            if slot.flags & CACHE_FLAG_DIRTY != 0 {
                backend.write_record(slot.id, &slot.data)?;
                slot.flags &= !CACHE_FLAG_DIRTY;
            }
        }
        Ok(())
    }

    /// Valid records and their flags, for consistency checks in tests.
    pub fn records(&self) -> impl Iterator<Item = (K, u8)> + '_ {
        self.slots
            .iter()
            .filter(|s| s.flags != 0)
            .map(|s| (s.id, s.flags))
    }
}
