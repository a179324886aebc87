//! Conversions between words, fixed-width integers and arbitrary-precision
//! integers.

use ethereum_types::{BigEndianHash as _, H256, U256};
use num::{bigint::Sign, BigInt, Integer as _, Signed as _, Zero as _};
use overlay_common::ONE_IN_BIPS;

pub(crate) fn u64_to_hash(v: u64) -> H256 {
    H256::from_low_u64_be(v)
}

pub(crate) fn hash_to_u256(h: H256) -> U256 {
    h.into_uint()
}

pub(crate) fn u256_to_hash(v: U256) -> H256 {
    H256::from_uint(&v)
}

/// Lossless widening of a [`U256`].
pub fn u256_to_bigint(v: U256) -> BigInt {
    let mut buf = [0u8; 32];
    v.to_big_endian(&mut buf);
    BigInt::from_bytes_be(Sign::Plus, &buf)
}

/// Narrows to a [`U256`], clamping negatives to zero and saturating at
/// [`U256::MAX`].
pub fn bigint_to_u256_saturating(v: &BigInt) -> U256 {
    if v.is_negative() || v.is_zero() {
        return U256::zero();
    }
    let (_, bytes) = v.to_bytes_be();
    if bytes.len() > 32 {
        return U256::MAX;
    }
    U256::from_big_endian(&bytes)
}

/// Floor division, the rounding every pricing formula is specified with.
///
/// # Panics
/// If `d` is zero.
pub(crate) fn floor_div(n: &BigInt, d: &BigInt) -> BigInt {
    n.div_floor(d)
}

/// `v * bips / 10000`, saturating.
pub(crate) fn mul_by_bips(v: U256, bips: u64) -> U256 {
    v.saturating_mul(bips.into()) / U256::from(ONE_IN_BIPS)
}

/// `a * b / c`, saturating the product. `c` must be non-zero.
pub(crate) fn saturating_mul_div(a: u64, b: u64, c: u64) -> u64 {
    a.saturating_mul(b) / c
}

/// Serde adapter for byte strings as `0x`-prefixed hex.
pub(crate) mod hex_bytes {
    use serde::{de::Error as _, Deserialize as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s.strip_prefix("0x").unwrap_or(&s)).map_err(D::Error::custom)
    }
}
