//! An ordered set of addresses.
//!
//! The size lives at slot 0 and members at slots `1..=size`. The child
//! sub-space `[0]` maps each member (as a word) to its slot, so membership and
//! removal never scan.

use ethereum_types::{Address, H256};

use super::{Storage, StorageBackedUint64, StorageResult};
use crate::util::u64_to_hash;

const SIZE_OFFSET: u64 = 0;

#[derive(Clone, Debug)]
pub struct AddressSet {
    backing: Storage,
    size: StorageBackedUint64,
    by_address: Storage,
}

impl AddressSet {
    /// Writes an empty set.
    pub fn initialize(storage: &Storage) -> StorageResult<()> {
        storage.set_u64_by_u64(SIZE_OFFSET, 0)
    }

    pub fn open(storage: Storage) -> Self {
        Self {
            size: storage.open_uint64(SIZE_OFFSET),
            by_address: storage.open_sub_storage(&[0]),
            backing: storage,
        }
    }

    pub fn size(&self) -> StorageResult<u64> {
        self.size.get()
    }

    pub fn is_member(&self, addr: Address) -> StorageResult<bool> {
        Ok(!self.by_address.get(addr.into())?.is_zero())
    }

    /// Up to `max` members, in slot order.
    pub fn all_members(&self, max: u64) -> StorageResult<Vec<Address>> {
        let size = self.size()?.min(max);
        (1..=size)
            .map(|i| self.backing.open_address(i).get())
            .collect()
    }

    /// Adds `addr`; a no-op if it is already a member.
    pub fn add(&self, addr: Address) -> StorageResult<()> {
        if self.is_member(addr)? {
            return Ok(());
        }
        let slot = self.size.increment()?;
        self.by_address.set(addr.into(), u64_to_hash(slot))?;
        self.backing.open_address(slot).set(addr)
    }

    /// Removes `addr` by moving the last member into its slot; a no-op if it
    /// is not a member.
    pub fn remove(&self, addr: Address) -> StorageResult<()> {
        let key: H256 = addr.into();
        let slot = self.by_address.get_u64(key)?;
        if slot == 0 {
            return Ok(());
        }
        self.by_address.clear(key)?;

        let size = self.size()?;
        if slot < size {
            let last = self.backing.open_address(size).get()?;
            self.backing.open_address(slot).set(last)?;
            self.by_address.set(last.into(), u64_to_hash(slot))?;
        }
        self.backing.clear_by_u64(size)?;
        self.size.decrement()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing_utils::memory_storage;

    fn addr(i: u8) -> Address {
        Address::repeat_byte(i)
    }

    fn open_empty() -> AddressSet {
        let (_, root) = memory_storage();
        let sto = root.open_sub_storage(b"set");
        AddressSet::initialize(&sto).unwrap();
        AddressSet::open(sto)
    }

    #[test]
    fn add_is_idempotent() {
        let set = open_empty();
        set.add(addr(1)).unwrap();
        set.add(addr(1)).unwrap();
        set.add(addr(2)).unwrap();
        assert_eq!(set.size().unwrap(), 2);
        assert!(set.is_member(addr(1)).unwrap());
        assert!(!set.is_member(addr(3)).unwrap());
        assert_eq!(set.all_members(10).unwrap(), vec![addr(1), addr(2)]);
        assert_eq!(set.all_members(1).unwrap(), vec![addr(1)]);
    }

    #[test]
    fn remove_swaps_with_last() {
        let set = open_empty();
        for i in 1..=4 {
            set.add(addr(i)).unwrap();
        }
        set.remove(addr(2)).unwrap();
        assert_eq!(
            set.all_members(10).unwrap(),
            vec![addr(1), addr(4), addr(3)]
        );
        assert!(!set.is_member(addr(2)).unwrap());

        // The moved member can still be removed through its new slot.
        set.remove(addr(4)).unwrap();
        set.remove(addr(4)).unwrap();
        assert_eq!(set.all_members(10).unwrap(), vec![addr(1), addr(3)]);

        set.remove(addr(3)).unwrap();
        set.remove(addr(1)).unwrap();
        assert_eq!(set.size().unwrap(), 0);
    }

    #[test]
    fn zero_address_is_a_valid_member() {
        let set = open_empty();
        set.add(Address::zero()).unwrap();
        assert!(set.is_member(Address::zero()).unwrap());
        set.remove(Address::zero()).unwrap();
        assert!(!set.is_member(Address::zero()).unwrap());
    }
}
