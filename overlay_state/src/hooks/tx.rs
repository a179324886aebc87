//! Transaction kinds the hooks know how to charge and settle.

use enum_as_inner::EnumAsInner;
use ethereum_types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{retryables::RetryTx, world::WorldError};

/// Fixed part of the submission fee, in units of L1 base fee.
pub const RETRYABLE_SUBMISSION_FIXED_BYTES: u64 = 1_400;
/// Per-calldata-byte part of the submission fee, in units of L1 base fee.
pub const RETRYABLE_SUBMISSION_BYTE_FACTOR: u64 = 6;

/// Why a single transaction was rejected. The block goes on without it.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum TxError {
    #[error("deposit sent by {0:?} rather than the L1 system sender")]
    DepositNotFromSystem(Address),

    #[error("gas limit {gas_limit} cannot cover {poster_gas} gas of L1 data cost")]
    InsufficientGasForPoster { gas_limit: u64, poster_gas: u64 },

    #[error("fee cap {fee_cap} is below the base fee {base_fee}")]
    FeeCapBelowBaseFee { fee_cap: U256, base_fee: U256 },

    #[error("{address:?} needs {needed} wei but only has {available}")]
    InsufficientFunds {
        address: Address,
        needed: U256,
        available: U256,
    },

    #[error("submission fee {fee} exceeds the maximum {max}")]
    SubmissionFeeTooHigh { fee: U256, max: U256 },

    #[error("retryable ticket {0:?} not found")]
    RetryableNotFound(H256),
}

impl TxError {
    /// Maps a failed debit onto the transaction that caused it.
    pub(crate) fn from_world(err: &WorldError) -> Option<Self> {
        match *err {
            WorldError::InsufficientBalance {
                address,
                needed,
                available,
            } => Some(TxError::InsufficientFunds {
                address,
                needed,
                available,
            }),
            _ => None,
        }
    }
}

/// A user transaction executed by the engine.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct OrdinaryTx {
    pub from: Address,
    pub to: Option<Address>,
    pub gas_limit: u64,
    /// Zero for gas estimation calls.
    #[serde(default)]
    pub gas_fee_cap: U256,
    #[serde(default, with = "crate::util::hex_bytes")]
    pub data: Vec<u8>,
}

/// Funds bridged in from the base layer.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DepositTx {
    pub from: Address,
    pub to: Address,
    pub value: U256,
}

/// A base-layer request to create a retryable ticket and possibly redeem it
/// right away.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SubmitRetryableTx {
    /// Becomes the ticket id.
    pub ticket_id: H256,
    pub from: Address,
    /// L1 base fee when the request was made; prices the submission fee.
    pub l1_base_fee: U256,
    /// Bridged in and minted to `from` before anything else.
    pub deposit_value: U256,
    pub to: Option<Address>,
    /// Callvalue of the ticket, held in escrow until redeemed.
    pub value: U256,
    pub beneficiary: Address,
    pub max_submission_fee: U256,
    /// Receives the unspent part of `max_submission_fee` and the refund of
    /// unused redeem gas.
    pub fee_refund_addr: Address,
    /// Gas offered for the automatic redeem.
    pub gas: u64,
    pub gas_fee_cap: U256,
    #[serde(default, with = "crate::util::hex_bytes")]
    pub data: Vec<u8>,
}

/// Every transaction kind the hooks accept.
#[derive(Clone, Debug, Deserialize, EnumAsInner, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OverlayTx {
    Ordinary(OrdinaryTx),
    Deposit(DepositTx),
    SubmitRetryable(SubmitRetryableTx),
    Retry(RetryTx),
}

impl OverlayTx {
    pub fn from(&self) -> Address {
        match self {
            OverlayTx::Ordinary(tx) => tx.from,
            OverlayTx::Deposit(tx) => tx.from,
            OverlayTx::SubmitRetryable(tx) => tx.from,
            OverlayTx::Retry(tx) => tx.from,
        }
    }
}

/// What the base layer charges for keeping a retryable's calldata.
pub fn retryable_submission_fee(calldata_len: usize, l1_base_fee: U256) -> U256 {
    let units = RETRYABLE_SUBMISSION_FIXED_BYTES
        .saturating_add(RETRYABLE_SUBMISSION_BYTE_FACTOR.saturating_mul(calldata_len as u64));
    l1_base_fee.saturating_mul(units.into())
}

/// What the overlay did at the start of a transaction.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TxStart {
    /// Gas charged up front for the transaction's share of a batch; the
    /// engine must deduct it before executing.
    pub poster_gas: u64,
    /// Set when the overlay handled the whole transaction. The engine must not
    /// execute it, and must not call the end hook for it.
    pub end_tx_now: bool,
    /// Gas consumed when `end_tx_now` is set.
    pub gas_used: u64,
    /// Redeem scheduled by a retryable submission, to run next.
    pub scheduled_retry: Option<RetryTx>,
}

/// What the engine reports back after executing a transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TxExecution {
    /// Total gas used, including the poster gas.
    pub gas_used: u64,
    pub success: bool,
}

/// Balance movements made while settling a transaction.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TxSettlement {
    /// Credited to the network fee account.
    pub network_fee: U256,
    /// Credited to the L1 pricer's funds pool, or to the block's coinbase
    /// before version 2.
    pub poster_fee: U256,
    /// Unused gas refunded.
    pub refund: U256,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submission_fee_scales_with_calldata() {
        let base = U256::from(10);
        assert_eq!(retryable_submission_fee(0, base), 14_000.into());
        assert_eq!(retryable_submission_fee(100, base), 20_000.into());
    }

    #[test]
    fn txs_parse_from_tagged_json() {
        let tx: OverlayTx = serde_json::from_str(
            r#"{
                "kind": "ordinary",
                "from": "0x00000000000000000000000000000000000000aa",
                "to": null,
                "gas_limit": 100000,
                "gas_fee_cap": "0x3b9aca00",
                "data": "0x0102"
            }"#,
        )
        .unwrap();
        let tx = tx.into_ordinary().unwrap();
        assert_eq!(tx.from, Address::from_low_u64_be(0xaa));
        assert_eq!(tx.gas_fee_cap, 1_000_000_000u64.into());
        assert_eq!(tx.data, vec![1, 2]);
    }

    #[test]
    fn world_errors_map_to_tx_errors() {
        let err = WorldError::InsufficientBalance {
            address: Address::zero(),
            needed: 2.into(),
            available: 1.into(),
        };
        assert_eq!(
            TxError::from_world(&err),
            Some(TxError::InsufficientFunds {
                address: Address::zero(),
                needed: 2.into(),
                available: 1.into()
            })
        );
        assert_eq!(
            TxError::from_world(&WorldError::BalanceOverflow(Address::zero())),
            None
        );
    }
}
