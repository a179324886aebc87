//! Ring buffer of the last 256 base-layer block hashes.

use ethereum_types::H256;
use log::trace;
use thiserror::Error;

use crate::storage::{Storage, StorageBackedUint64, StorageError, StorageResult};

/// Number of recent hashes kept.
pub const BLOCKHASH_WINDOW: u64 = 256;

const L1_BLOCK_NUMBER_OFFSET: u64 = 0;

/// Version from which filled-in hashes commit to their own block number.
const NUMBERED_FILL_VERSION: u64 = 8;

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum BlockhashError {
    #[error("no hash recorded for L1 block {requested}, next expected is {next}")]
    NotFound { requested: u64, next: u64 },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Clone, Debug)]
pub struct Blockhashes {
    backing: Storage,
    l1_block_number: StorageBackedUint64,
}

impl Blockhashes {
    pub fn initialize(storage: &Storage) -> StorageResult<()> {
        storage.set_u64_by_u64(L1_BLOCK_NUMBER_OFFSET, 0)
    }

    pub fn open(storage: Storage) -> Self {
        Self {
            l1_block_number: storage.open_uint64(L1_BLOCK_NUMBER_OFFSET),
            backing: storage,
        }
    }

    /// The next L1 block number expected to be recorded.
    pub fn l1_block_number(&self) -> StorageResult<u64> {
        self.l1_block_number.get()
    }

    fn hash_offset(number: u64) -> u64 {
        1 + number % BLOCKHASH_WINDOW
    }

    /// The hash of L1 block `number`, if it is among the last
    /// [`BLOCKHASH_WINDOW`] recorded.
    pub fn block_hash(&self, number: u64) -> Result<H256, BlockhashError> {
        let next = self.l1_block_number.get()?;
        if number >= next || number.saturating_add(BLOCKHASH_WINDOW) < next {
            return Err(BlockhashError::NotFound {
                requested: number,
                next,
            });
        }
        Ok(self.backing.get_by_u64(Self::hash_offset(number))?)
    }

    /// Records `hash` as the hash of L1 block `number`. Numbers skipped since
    /// the last record get synthetic hashes derived from `hash`. Numbers below
    /// the next expected one are ignored.
    pub fn record_new_l1_block(&self, number: u64, hash: H256, version: u64) -> StorageResult<()> {
        let mut next = self.l1_block_number.get()?;
        if number < next {
            return Ok(());
        }
        if next.saturating_add(BLOCKHASH_WINDOW) < number {
            // Anything older would be overwritten anyway.
            next = number - BLOCKHASH_WINDOW;
        }

        while next < number {
            let salt = if version >= NUMBERED_FILL_VERSION {
                next.to_le_bytes()
            } else {
                [0u8; 8]
            };
            let filler = self.backing.keccak(&[hash.as_bytes(), &salt[..]])?;
            trace!("filling L1 block hash {next} with {filler:?}");
            self.backing.set_by_u64(Self::hash_offset(next), filler)?;
            next += 1;
        }

        self.backing.set_by_u64(Self::hash_offset(number), hash)?;
        self.l1_block_number.set(number + 1)
    }
}
