//! A durable FIFO of words.
//!
//! Slot 0 holds the next offset to write and slot 1 the next offset to read;
//! entries live at the offsets in between. Both counters start at 2 so the
//! entries never overlap them.

use ethereum_types::H256;

use super::{Storage, StorageBackedUint64, StorageResult};
use crate::util::u64_to_hash;

const NEXT_PUT_OFFSET: u64 = 0;
const NEXT_GET_OFFSET: u64 = 1;
const FIRST_ENTRY_OFFSET: u64 = 2;

/// A FIFO queue occupying one sub-space.
#[derive(Clone, Debug)]
pub struct Queue {
    storage: Storage,
    next_put: StorageBackedUint64,
    next_get: StorageBackedUint64,
}

impl Queue {
    /// Writes the counters of an empty queue.
    pub fn initialize(storage: &Storage) -> StorageResult<()> {
        storage.set_u64_by_u64(NEXT_PUT_OFFSET, FIRST_ENTRY_OFFSET)?;
        storage.set_u64_by_u64(NEXT_GET_OFFSET, FIRST_ENTRY_OFFSET)
    }

    /// Opens a queue previously written by [`Queue::initialize`].
    pub fn open(storage: Storage) -> Self {
        Self {
            next_put: storage.open_uint64(NEXT_PUT_OFFSET),
            next_get: storage.open_uint64(NEXT_GET_OFFSET),
            storage,
        }
    }

    pub fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.size()? == 0)
    }

    /// Number of entries waiting to be dequeued.
    pub fn size(&self) -> StorageResult<u64> {
        let put = self.next_put.get()?;
        let get = self.next_get.get()?;
        Ok(put.saturating_sub(get))
    }

    /// The head of the queue, without removing it.
    pub fn peek(&self) -> StorageResult<Option<H256>> {
        let get = self.next_get.get()?;
        if get >= self.next_put.get()? {
            return Ok(None);
        }
        self.storage.get_by_u64(get).map(Some)
    }

    /// Removes and returns the head of the queue, zeroing its slot.
    pub fn get(&self) -> StorageResult<Option<H256>> {
        let get = self.next_get.get()?;
        if get >= self.next_put.get()? {
            return Ok(None);
        }
        let value = self.storage.swap(u64_to_hash(get), H256::zero())?;
        self.next_get.increment()?;
        Ok(Some(value))
    }

    pub fn put(&self, value: H256) -> StorageResult<()> {
        let put = self.next_put.get()?;
        self.storage.set_by_u64(put, value)?;
        self.next_put.increment()?;
        Ok(())
    }

    /// Every queued entry, head first, without dequeuing anything.
    pub fn entries(&self) -> StorageResult<Vec<H256>> {
        let get = self.next_get.get()?;
        let put = self.next_put.get()?;
        (get..put).map(|i| self.storage.get_by_u64(i)).collect()
    }
}
