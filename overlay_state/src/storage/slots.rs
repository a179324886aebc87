//! Single-slot typed accessors.
//!
//! Every accessor re-validates on read: a word that does not decode as the
//! slot's type is reported as [`StorageError::Undecodable`] rather than being
//! truncated, so a corrupted slot fails the same way on every node.

use ethereum_types::{Address, H256, U256};
use num::BigInt;

use super::{Storage, StorageError, StorageResult};
use crate::util::{hash_to_u256, u256_to_hash, u64_to_hash};

/// One word of storage at a fixed offset within a sub-space.
#[derive(Clone, Debug)]
pub struct StorageSlot {
    storage: Storage,
    key: H256,
}

impl StorageSlot {
    pub(super) fn new(storage: Storage, key: H256) -> Self {
        Self { storage, key }
    }

    pub fn get(&self) -> StorageResult<H256> {
        self.storage.get(self.key)
    }

    pub fn set(&self, value: H256) -> StorageResult<()> {
        self.storage.set(self.key, value)
    }

    pub(super) fn undecodable(&self, expected: &'static str) -> StorageError {
        StorageError::Undecodable {
            slot: self.storage.physical_slot(self.key),
            expected,
        }
    }

    pub(super) fn get_u64(&self) -> StorageResult<u64> {
        let raw = hash_to_u256(self.get()?);
        if raw > U256::from(u64::MAX) {
            return Err(self.undecodable("u64"));
        }
        Ok(raw.low_u64())
    }
}

/// A `u64` counter.
#[derive(Clone, Debug)]
pub struct StorageBackedUint64(StorageSlot);

impl StorageBackedUint64 {
    pub(super) fn new(slot: StorageSlot) -> Self {
        Self(slot)
    }

    pub fn get(&self) -> StorageResult<u64> {
        self.0.get_u64()
    }

    pub fn set(&self, value: u64) -> StorageResult<()> {
        self.0.set(u64_to_hash(value))
    }

    /// Writes a wide value, failing with [`StorageError::ValueTooLarge`] if it
    /// does not fit in 64 bits.
    pub fn set_checked(&self, value: U256) -> StorageResult<()> {
        if value > U256::from(u64::MAX) {
            return Err(StorageError::ValueTooLarge { bits: 64 });
        }
        self.set(value.low_u64())
    }

    /// Adds one, returning the new value.
    pub fn increment(&self) -> StorageResult<u64> {
        let new = self
            .get()?
            .checked_add(1)
            .ok_or(StorageError::ValueTooLarge { bits: 64 })?;
        self.set(new)?;
        Ok(new)
    }

    /// Subtracts one, returning the new value.
    pub fn decrement(&self) -> StorageResult<u64> {
        let new = self.get()?.checked_sub(1).ok_or(StorageError::Underflow)?;
        self.set(new)?;
        Ok(new)
    }
}

/// An `i64`, stored sign-extended to 256 bits.
#[derive(Clone, Debug)]
pub struct StorageBackedInt64(StorageSlot);

impl StorageBackedInt64 {
    pub(super) fn new(slot: StorageSlot) -> Self {
        Self(slot)
    }

    pub fn get(&self) -> StorageResult<i64> {
        let value = decode_signed(self.0.get()?);
        i64::try_from(value).map_err(|_| self.0.undecodable("i64"))
    }

    pub fn set(&self, value: i64) -> StorageResult<()> {
        // An i64 always fits in 256 bits.
        let word = encode_signed(&BigInt::from(value)).unwrap_or_default();
        self.0.set(word)
    }
}

/// An unsigned 256-bit integer.
#[derive(Clone, Debug)]
pub struct StorageBackedBigUint(StorageSlot);

impl StorageBackedBigUint {
    pub(super) fn new(slot: StorageSlot) -> Self {
        Self(slot)
    }

    pub fn get(&self) -> StorageResult<U256> {
        Ok(hash_to_u256(self.0.get()?))
    }

    pub fn set(&self, value: U256) -> StorageResult<()> {
        self.0.set(u256_to_hash(value))
    }
}

/// A signed integer in 256-bit two's complement.
#[derive(Clone, Debug)]
pub struct StorageBackedBigInt(StorageSlot);

impl StorageBackedBigInt {
    pub(super) fn new(slot: StorageSlot) -> Self {
        Self(slot)
    }

    pub fn get(&self) -> StorageResult<BigInt> {
        Ok(decode_signed(self.0.get()?))
    }

    /// Fails with [`StorageError::ValueTooLarge`] outside `[-2^255, 2^255)`.
    pub fn set(&self, value: &BigInt) -> StorageResult<()> {
        let word = encode_signed(value).ok_or(StorageError::ValueTooLarge { bits: 256 })?;
        self.0.set(word)
    }
}

/// An address, right-aligned in its word.
#[derive(Clone, Debug)]
pub struct StorageBackedAddress(StorageSlot);

impl StorageBackedAddress {
    pub(super) fn new(slot: StorageSlot) -> Self {
        Self(slot)
    }

    pub fn get(&self) -> StorageResult<Address> {
        let word = self.0.get()?;
        if word.as_bytes()[..12].iter().any(|b| *b != 0) {
            return Err(self.0.undecodable("address"));
        }
        Ok(Address::from_slice(&word.as_bytes()[12..]))
    }

    pub fn set(&self, value: Address) -> StorageResult<()> {
        self.0.set(value.into())
    }
}

/// An optional address; `None` is stored as `1 << 255`.
#[derive(Clone, Debug)]
pub struct StorageBackedAddressOrNil(StorageSlot);

fn nil_address_representation() -> H256 {
    u256_to_hash(U256::one() << 255)
}

impl StorageBackedAddressOrNil {
    pub(super) fn new(slot: StorageSlot) -> Self {
        Self(slot)
    }

    pub fn get(&self) -> StorageResult<Option<Address>> {
        let word = self.0.get()?;
        if word == nil_address_representation() {
            return Ok(None);
        }
        if word.as_bytes()[..12].iter().any(|b| *b != 0) {
            return Err(self.0.undecodable("optional address"));
        }
        Ok(Some(Address::from_slice(&word.as_bytes()[12..])))
    }

    pub fn set(&self, value: Option<Address>) -> StorageResult<()> {
        match value {
            Some(addr) => self.0.set(addr.into()),
            None => self.0.set(nil_address_representation()),
        }
    }
}

/// A boolean stored as 0 or 1.
#[derive(Clone, Debug)]
pub struct StorageBackedBool(StorageSlot);

impl StorageBackedBool {
    pub(super) fn new(slot: StorageSlot) -> Self {
        Self(slot)
    }

    pub fn get(&self) -> StorageResult<bool> {
        match self.0.get_u64() {
            Ok(0) => Ok(false),
            Ok(1) => Ok(true),
            _ => Err(self.0.undecodable("bool")),
        }
    }

    pub fn set(&self, value: bool) -> StorageResult<()> {
        self.0.set(u64_to_hash(value.into()))
    }
}

/// A byte string occupying its own sub-space.
#[derive(Clone, Debug)]
pub struct StorageBackedBytes(Storage);

impl StorageBackedBytes {
    pub(super) fn new(storage: Storage) -> Self {
        Self(storage)
    }

    pub fn get(&self) -> StorageResult<Vec<u8>> {
        self.0.get_bytes()
    }

    pub fn set(&self, value: &[u8]) -> StorageResult<()> {
        self.0.set_bytes(value)
    }

    pub fn clear(&self) -> StorageResult<()> {
        self.0.clear_bytes()
    }

    pub fn size(&self) -> StorageResult<u64> {
        self.0.bytes_size()
    }
}

fn decode_signed(word: H256) -> BigInt {
    BigInt::from_signed_bytes_be(word.as_bytes())
}

fn encode_signed(value: &BigInt) -> Option<H256> {
    let bytes = value.to_signed_bytes_be();
    if bytes.len() > 32 {
        return None;
    }
    let fill = if value.sign() == num::bigint::Sign::Minus {
        0xff
    } else {
        0x00
    };
    let mut word = [fill; 32];
    word[32 - bytes.len()..].copy_from_slice(&bytes);
    Some(H256(word))
}

#[cfg(test)]
mod tests {
    use ethereum_types::BigEndianHash as _;

    use super::*;
    use crate::testing_utils::memory_storage;

    #[test]
    fn uint64_rejects_wide_values() {
        let (_, sto) = memory_storage();
        let slot = sto.open_uint64(0);

        slot.set(u64::MAX).unwrap();
        assert_eq!(
            slot.increment().unwrap_err(),
            StorageError::ValueTooLarge { bits: 64 }
        );
        assert_eq!(
            slot.set_checked(U256::from(u64::MAX) + 1).unwrap_err(),
            StorageError::ValueTooLarge { bits: 64 }
        );

        sto.open_big_uint(0).set(U256::from(u64::MAX) + 1).unwrap();
        assert!(matches!(
            slot.get().unwrap_err(),
            StorageError::Undecodable { expected: "u64", .. }
        ));
    }

    #[test]
    fn uint64_counts_down_to_zero_only() {
        let (_, sto) = memory_storage();
        let slot = sto.open_uint64(4);
        assert_eq!(slot.increment().unwrap(), 1);
        assert_eq!(slot.decrement().unwrap(), 0);
        assert_eq!(slot.decrement().unwrap_err(), StorageError::Underflow);
    }

    #[test]
    fn signed_values_round_trip() {
        let (_, sto) = memory_storage();
        let small = sto.open_int64(1);
        for v in [0, 1, -1, i64::MIN, i64::MAX] {
            small.set(v).unwrap();
            assert_eq!(small.get().unwrap(), v);
        }

        let big = sto.open_big_int(2);
        let min: BigInt = -(BigInt::from(1) << 255u32);
        let max: BigInt = (BigInt::from(1) << 255u32) - 1;
        for v in [BigInt::from(-12345), min.clone(), max.clone()] {
            big.set(&v).unwrap();
            assert_eq!(big.get().unwrap(), v);
        }
        assert_eq!(
            big.set(&(max + 1)).unwrap_err(),
            StorageError::ValueTooLarge { bits: 256 }
        );
        assert_eq!(
            big.set(&(min - 1)).unwrap_err(),
            StorageError::ValueTooLarge { bits: 256 }
        );
    }

    #[test]
    fn negative_int64_is_sign_extended() {
        let (_, sto) = memory_storage();
        sto.open_int64(0).set(-1).unwrap();
        assert_eq!(sto.get_by_u64(0).unwrap(), H256::repeat_byte(0xff));
        assert_eq!(sto.open_big_int(0).get().unwrap(), BigInt::from(-1));
    }

    #[test]
    fn addresses() {
        let (_, sto) = memory_storage();
        let addr = Address::repeat_byte(0x42);

        sto.open_address(0).set(addr).unwrap();
        assert_eq!(sto.open_address(0).get().unwrap(), addr);

        let opt = sto.open_address_or_nil(1);
        opt.set(None).unwrap();
        assert_eq!(opt.get().unwrap(), None);
        opt.set(Some(Address::zero())).unwrap();
        assert_eq!(opt.get().unwrap(), Some(Address::zero()));

        sto.set_by_u64(2, H256::from_uint(&U256::MAX)).unwrap();
        assert!(sto.open_address(2).get().is_err());
        assert!(sto.open_address_or_nil(2).get().is_err());
    }

    #[test]
    fn bools_are_strict() {
        let (_, sto) = memory_storage();
        let flag = sto.open_bool(0);
        assert!(!flag.get().unwrap());
        flag.set(true).unwrap();
        assert!(flag.get().unwrap());
        sto.set_u64_by_u64(0, 2).unwrap();
        assert!(flag.get().is_err());
    }

    #[test]
    fn bytes_live_in_their_own_sub_space() {
        let (_, sto) = memory_storage();
        let bytes = sto.open_bytes(&[7]);
        bytes.set(b"calldata").unwrap();
        assert_eq!(bytes.size().unwrap(), 8);
        assert_eq!(bytes.get().unwrap(), b"calldata");
        // The parent's key 0 is untouched.
        assert_eq!(sto.get_u64_by_u64(0).unwrap(), 0);
        bytes.clear().unwrap();
        assert!(bytes.get().unwrap().is_empty());
    }
}
