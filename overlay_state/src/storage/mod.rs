//! Typed, metered view over the overlay's slice of world-state storage.
//!
//! All overlay state lives in the storage of a single fictional account,
//! [`OVERLAY_STATE_ADDRESS`]. That flat key-value space is carved into a tree
//! of disjoint sub-spaces: the root has an empty [`SubspaceTag`], and a child
//! opened with label `l` gets the tag `keccak256(parent_tag ‖ l)`.
//!
//! A logical key `K` inside a sub-space with tag `T` lands at the physical slot
//! `keccak256(T ‖ K[..31])[..31] ‖ K[31]`. Hashing only the first 31 bytes
//! keeps "pages" of 256 consecutive keys contiguous, and two slots can only
//! alias through a keccak collision.

use std::rc::Rc;

use ethereum_types::{Address, H256};
use keccak_hash::keccak;
use overlay_common::{
    KECCAK256_GAS, KECCAK256_WORD_GAS, OVERLAY_STATE_ADDRESS, SLOAD_GAS_EIP2200,
    SSTORE_SET_GAS_EIP2200,
};
use thiserror::Error;

use crate::{
    burn::Burner,
    util::u64_to_hash,
    world::{SharedWorld, WorldError},
};

mod address_set;
mod queue;
mod slots;

pub use address_set::AddressSet;
pub use queue::Queue;
pub use slots::{
    StorageBackedAddress, StorageBackedAddressOrNil, StorageBackedBigInt, StorageBackedBigUint,
    StorageBackedBool, StorageBackedBytes, StorageBackedInt64, StorageBackedUint64, StorageSlot,
};

/// Stores the result of storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// An error type for storage operations.
#[derive(Clone, Debug, Eq, Error, Hash, PartialEq)]
pub enum StorageError {
    /// The caller's resource meter cannot cover the access.
    #[error("resource meter exhausted: needed {needed}, {available} available")]
    ResourceExhausted {
        /// Units the access would have charged.
        needed: u64,
        /// Units left on the meter.
        available: u64,
    },

    /// A value does not fit in the slot type it is written to.
    #[error("value does not fit in a {bits}-bit slot")]
    ValueTooLarge {
        /// Width of the slot type.
        bits: u32,
    },

    /// A counter was decremented below zero.
    #[error("counter underflow")]
    Underflow,

    /// A stored word does not decode as the requested type.
    #[error("slot {slot:?} does not hold a valid {expected}")]
    Undecodable {
        /// Physical slot that was read.
        slot: H256,
        /// Name of the expected type.
        expected: &'static str,
    },

    /// The world-state store failed.
    #[error(transparent)]
    World(#[from] WorldError),
}

impl StorageError {
    /// Whether this error means the meter ran dry.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, StorageError::ResourceExhausted { .. })
    }
}

/// Identifies one sub-space of overlay storage.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct SubspaceTag(Option<H256>);

impl SubspaceTag {
    /// The root sub-space.
    pub const ROOT: SubspaceTag = SubspaceTag(None);

    /// Tag of the child sub-space labelled `label`.
    pub fn child(&self, label: &[u8]) -> SubspaceTag {
        let mut preimage = self.as_bytes().to_vec();
        preimage.extend_from_slice(label);
        SubspaceTag(Some(keccak(preimage)))
    }

    /// The tag's bytes; empty for the root.
    pub fn as_bytes(&self) -> &[u8] {
        match &self.0 {
            Some(h) => h.as_bytes(),
            None => &[],
        }
    }

    /// Maps a logical key in this sub-space to its physical slot.
    pub fn physical_slot(&self, key: H256) -> H256 {
        let boundary = H256::len_bytes() - 1;
        let mut preimage = self.as_bytes().to_vec();
        preimage.extend_from_slice(&key.as_bytes()[..boundary]);

        let mut out = keccak(preimage);
        out.as_bytes_mut()[boundary] = key.as_bytes()[boundary];
        out
    }
}

/// A metered view over one sub-space of overlay storage.
///
/// Cloning a view is cheap and yields another handle to the same sub-space.
#[derive(Clone, Debug)]
pub struct Storage {
    account: Address,
    world: SharedWorld,
    burner: Rc<dyn Burner>,
    tag: SubspaceTag,
}

impl Storage {
    /// Opens the root view over the overlay account.
    pub fn new(world: SharedWorld, burner: Rc<dyn Burner>) -> Self {
        Self {
            account: OVERLAY_STATE_ADDRESS,
            world,
            burner,
            tag: SubspaceTag::ROOT,
        }
    }

    /// The world state this view writes through to.
    pub fn world(&self) -> &SharedWorld {
        &self.world
    }

    /// The meter this view charges.
    pub fn burner(&self) -> &Rc<dyn Burner> {
        &self.burner
    }

    /// The tag of this view's sub-space.
    pub fn tag(&self) -> SubspaceTag {
        self.tag
    }

    /// Opens the child sub-space labelled `label`.
    pub fn open_sub_storage(&self, label: &[u8]) -> Storage {
        Storage {
            account: self.account,
            world: self.world.clone(),
            burner: self.burner.clone(),
            tag: self.tag.child(label),
        }
    }

    /// The physical slot a logical key maps to.
    pub fn physical_slot(&self, key: H256) -> H256 {
        self.tag.physical_slot(key)
    }

    /// Reads the word at `key`.
    pub fn get(&self, key: H256) -> StorageResult<H256> {
        self.burner.burn(SLOAD_GAS_EIP2200)?;
        let slot = self.physical_slot(key);
        Ok(self.world.borrow().storage(self.account, slot)?)
    }

    /// Writes the word at `key`.
    pub fn set(&self, key: H256, value: H256) -> StorageResult<()> {
        self.burner.burn(SSTORE_SET_GAS_EIP2200)?;
        let slot = self.physical_slot(key);
        Ok(self
            .world
            .borrow_mut()
            .set_storage(self.account, slot, value)?)
    }

    /// Writes `value` at `key`, returning what was there before.
    pub fn swap(&self, key: H256, value: H256) -> StorageResult<H256> {
        let old = self.get(key)?;
        self.set(key, value)?;
        Ok(old)
    }

    /// Zeroes the word at `key`.
    pub fn clear(&self, key: H256) -> StorageResult<()> {
        self.set(key, H256::zero())
    }

    pub fn get_by_u64(&self, key: u64) -> StorageResult<H256> {
        self.get(u64_to_hash(key))
    }

    pub fn set_by_u64(&self, key: u64, value: H256) -> StorageResult<()> {
        self.set(u64_to_hash(key), value)
    }

    pub fn clear_by_u64(&self, key: u64) -> StorageResult<()> {
        self.clear(u64_to_hash(key))
    }

    /// Reads `key` as a `u64`, failing if the word holds a larger value.
    pub fn get_u64(&self, key: H256) -> StorageResult<u64> {
        StorageSlot::new(self.clone(), key).get_u64()
    }

    pub fn get_u64_by_u64(&self, key: u64) -> StorageResult<u64> {
        self.get_u64(u64_to_hash(key))
    }

    pub fn set_u64_by_u64(&self, key: u64, value: u64) -> StorageResult<()> {
        self.set_by_u64(key, u64_to_hash(value))
    }

    /// Metered keccak256 over the concatenation of `data`.
    pub fn keccak(&self, data: &[&[u8]]) -> StorageResult<H256> {
        let len: usize = data.iter().map(|d| d.len()).sum();
        let words = (len as u64).div_ceil(32);
        self.burner
            .burn(KECCAK256_GAS.saturating_add(KECCAK256_WORD_GAS.saturating_mul(words)))?;
        Ok(keccak(data.concat()))
    }

    /// Stores a byte string as a length word at key 0 followed by the data in
    /// 32-byte words, the final one left-padded with zeroes.
    pub fn set_bytes(&self, mut b: &[u8]) -> StorageResult<()> {
        self.clear_bytes()?;
        self.set_u64_by_u64(0, b.len() as u64)?;
        let mut offset = 1;
        while b.len() >= 32 {
            self.set_by_u64(offset, H256::from_slice(&b[..32]))?;
            b = &b[32..];
            offset += 1;
        }
        self.set_by_u64(offset, left_pad(b))
    }

    /// Reads a byte string written by [`Self::set_bytes`].
    pub fn get_bytes(&self) -> StorageResult<Vec<u8>> {
        let mut bytes_left = self.get_u64_by_u64(0)?;
        let mut ret = Vec::with_capacity(bytes_left as usize);
        let mut offset = 1;
        while bytes_left >= 32 {
            ret.extend_from_slice(self.get_by_u64(offset)?.as_bytes());
            bytes_left -= 32;
            offset += 1;
        }
        let last = self.get_by_u64(offset)?;
        ret.extend_from_slice(&last.as_bytes()[32 - bytes_left as usize..]);
        Ok(ret)
    }

    /// Length of the byte string written by [`Self::set_bytes`].
    pub fn bytes_size(&self) -> StorageResult<u64> {
        self.get_u64_by_u64(0)
    }

    /// Zeroes every word of a byte string written by [`Self::set_bytes`].
    pub fn clear_bytes(&self) -> StorageResult<()> {
        let mut bytes_left = self.get_u64_by_u64(0)?;
        let mut offset = 1;
        while bytes_left > 0 {
            self.clear_by_u64(offset)?;
            offset += 1;
            bytes_left = bytes_left.saturating_sub(32);
        }
        self.clear_by_u64(0)
    }

    pub fn open_slot(&self, offset: u64) -> StorageSlot {
        StorageSlot::new(self.clone(), u64_to_hash(offset))
    }

    pub fn open_uint64(&self, offset: u64) -> StorageBackedUint64 {
        StorageBackedUint64::new(self.open_slot(offset))
    }

    pub fn open_int64(&self, offset: u64) -> StorageBackedInt64 {
        StorageBackedInt64::new(self.open_slot(offset))
    }

    pub fn open_big_uint(&self, offset: u64) -> StorageBackedBigUint {
        StorageBackedBigUint::new(self.open_slot(offset))
    }

    pub fn open_big_int(&self, offset: u64) -> StorageBackedBigInt {
        StorageBackedBigInt::new(self.open_slot(offset))
    }

    pub fn open_address(&self, offset: u64) -> StorageBackedAddress {
        StorageBackedAddress::new(self.open_slot(offset))
    }

    pub fn open_address_or_nil(&self, offset: u64) -> StorageBackedAddressOrNil {
        StorageBackedAddressOrNil::new(self.open_slot(offset))
    }

    pub fn open_bool(&self, offset: u64) -> StorageBackedBool {
        StorageBackedBool::new(self.open_slot(offset))
    }

    /// Opens a byte string stored in the child sub-space labelled `label`.
    pub fn open_bytes(&self, label: &[u8]) -> StorageBackedBytes {
        StorageBackedBytes::new(self.open_sub_storage(label))
    }
}

fn left_pad(b: &[u8]) -> H256 {
    let mut word = H256::zero();
    word.as_bytes_mut()[32 - b.len()..].copy_from_slice(b);
    word
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::{
        burn::GasMeter,
        testing_utils::{common_setup, memory_storage},
        world::{MemoryWorldState, WorldState as _},
    };

    #[test]
    fn sibling_sub_spaces_never_share_slots() {
        common_setup();
        let (_, root) = memory_storage();
        let key = u64_to_hash(7);

        let mut seen = HashSet::new();
        assert!(seen.insert(root.physical_slot(key)));
        for label in [&[0u8][..], &[1], &[2], &[0, 0], b"a"] {
            let child = root.open_sub_storage(label);
            assert!(seen.insert(child.physical_slot(key)));
            assert!(seen.insert(child.open_sub_storage(&[0]).physical_slot(key)));
        }
    }

    #[test]
    fn pages_stay_contiguous() {
        let tag = SubspaceTag::ROOT.child(&[3]);
        let a = tag.physical_slot(u64_to_hash(0x100));
        let b = tag.physical_slot(u64_to_hash(0x1ff));
        assert_eq!(a.as_bytes()[..31], b.as_bytes()[..31]);
        assert_eq!(a.as_bytes()[31], 0x00);
        assert_eq!(b.as_bytes()[31], 0xff);
    }

    #[test]
    fn writes_are_visible_through_clones() {
        let (_, root) = memory_storage();
        let sub = root.open_sub_storage(b"x");
        sub.clone().set_u64_by_u64(3, 99).unwrap();
        assert_eq!(sub.get_u64_by_u64(3).unwrap(), 99);
        assert_eq!(root.get_u64_by_u64(3).unwrap(), 0);
    }

    #[test]
    fn bytes_round_trip_and_clear() {
        let (world, root) = memory_storage();
        let sto = root.open_sub_storage(b"bytes");

        for len in [0usize, 1, 31, 32, 33, 64, 100] {
            let data: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_add(1)).collect();
            sto.set_bytes(&data).unwrap();
            assert_eq!(sto.bytes_size().unwrap(), len as u64);
            assert_eq!(sto.get_bytes().unwrap(), data);
        }

        sto.clear_bytes().unwrap();
        assert_eq!(sto.get_bytes().unwrap(), Vec::<u8>::new());
        assert_eq!(world.borrow().storage_len(OVERLAY_STATE_ADDRESS), 0);
    }

    #[test]
    fn shorter_bytes_overwrite_longer() {
        let (world, root) = memory_storage();
        root.set_bytes(&[0xaa; 70]).unwrap();
        root.set_bytes(&[0xbb; 3]).unwrap();
        assert_eq!(root.get_bytes().unwrap(), vec![0xbb; 3]);
        // Length word and one data word remain.
        assert_eq!(world.borrow().storage_len(OVERLAY_STATE_ADDRESS), 2);
    }

    #[test]
    fn writes_fail_when_meter_is_exhausted() {
        let (world, shared) = MemoryWorldState::new_shared();
        let meter = Rc::new(GasMeter::new(SSTORE_SET_GAS_EIP2200 + SLOAD_GAS_EIP2200));
        let sto = Storage::new(shared, meter.clone());

        sto.set_u64_by_u64(0, 1).unwrap();
        assert_eq!(sto.get_u64_by_u64(0).unwrap(), 1);
        let err = sto.set_u64_by_u64(0, 2).unwrap_err();
        assert!(err.is_resource_exhaustion());
        // The failed write never reached the world state.
        assert_eq!(
            world
                .borrow()
                .storage(OVERLAY_STATE_ADDRESS, sto.physical_slot(u64_to_hash(0)))
                .unwrap(),
            u64_to_hash(1)
        );
    }

    #[test]
    fn keccak_is_metered() {
        let (_, shared) = MemoryWorldState::new_shared();
        let meter = Rc::new(GasMeter::new(1_000));
        let sto = Storage::new(shared, meter.clone());
        let h = sto.keccak(&[&b"ab"[..], &b"c"[..]]).unwrap();
        assert_eq!(h, keccak(b"abc"));
        assert_eq!(meter.burned(), KECCAK256_GAS + KECCAK256_WORD_GAS);
    }
}
