use ethereum_types::{Address, H160, U256};
use hex_literal::hex;

/// The fictional account whose storage holds every piece of overlay state.
/// 0xA4B05FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF
pub const OVERLAY_STATE_ADDRESS: Address = H160(hex!("A4B05FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF"));

/// Sender of deposits and internal transactions originating on the base
/// layer.
pub const L1_SYSTEM_SENDER: Address = H160(hex!("00000000000000000000000000000000000a4b05"));

/// The default batch poster. Poster data costs are only charged for blocks
/// whose coinbase is this address.
pub const BATCH_POSTER_ADDRESS: Address = H160(hex!("A4B000000000000000000073657175656e636572"));

/// Escrow account collecting L1 data fees until they are paid out to batch
/// posters and the rewards recipient.
pub const L1_PRICER_FUNDS_POOL_ADDRESS: Address =
    H160(hex!("A4B00000000000000000000000000000000000f6"));

/// Intrinsic gas of a plain transaction.
pub const TX_GAS: u64 = 21_000;
/// Calldata cost of a zero byte.
pub const TX_DATA_ZERO_GAS: u64 = 4;
/// Calldata cost of a non-zero byte (EIP-2028).
pub const TX_DATA_NON_ZERO_GAS_EIP2028: u64 = 16;

/// Cost charged for reading one storage word.
pub const SLOAD_GAS_EIP2200: u64 = 800;
/// Cost charged for writing one storage word.
pub const SSTORE_SET_GAS_EIP2200: u64 = 20_000;
/// Base cost of a keccak256 invocation.
pub const KECCAK256_GAS: u64 = 30;
/// Per-word cost of a keccak256 invocation.
pub const KECCAK256_WORD_GAS: u64 = 6;

/// Number of basis points in one whole.
pub const ONE_IN_BIPS: u64 = 10_000;

/// Converts an amount in `ETH` to `wei` units.
pub fn eth_to_wei(eth: U256) -> U256 {
    // 1 ether = 10^18 wei.
    eth * U256::from(10).pow(18.into())
}

/// Converts an amount in `gwei` to `wei` units.
/// This also works for converting `ETH` to `gwei`.
pub fn gwei_to_wei(eth: U256) -> U256 {
    // 1 ether = 10^9 gwei = 10^18 wei.
    eth * U256::from(10).pow(9.into())
}

/// Calldata cost of `data`, counted the EIP-2028 way.
pub fn calldata_gas(data: &[u8]) -> u64 {
    data.iter().fold(0u64, |acc, b| {
        let cost = if *b == 0 {
            TX_DATA_ZERO_GAS
        } else {
            TX_DATA_NON_ZERO_GAS_EIP2028
        };
        acc.saturating_add(cost)
    })
}

#[test]
fn test_eth_conversion() {
    assert_eq!(
        eth_to_wei(U256::one()),
        gwei_to_wei(gwei_to_wei(U256::one()))
    );
}

#[test]
fn test_calldata_gas() {
    assert_eq!(calldata_gas(&[]), 0);
    assert_eq!(calldata_gas(&[0, 0, 1]), 4 + 4 + 16);
}

#[test]
fn test_well_known_addresses_are_distinct() {
    let all = [
        OVERLAY_STATE_ADDRESS,
        L1_SYSTEM_SENDER,
        BATCH_POSTER_ADDRESS,
        L1_PRICER_FUNDS_POOL_ADDRESS,
    ];
    for (i, a) in all.iter().enumerate() {
        for b in &all[i + 1..] {
            assert_ne!(a, b);
        }
    }
}

#[test]
fn test_batch_poster_address_tail() {
    assert_eq!(&BATCH_POSTER_ADDRESS.as_bytes()[11..], b"sequencer");
}
