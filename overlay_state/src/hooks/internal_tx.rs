//! Signatureless transactions recording the overlay's own pseudo-operations.
//!
//! Each pseudo-op a block runs is logged as an [`InternalTx`] so that it shares
//! the audit trail of user transactions. The wire form is
//! `0x6A ‖ rlp([selector, fields...])`, where the selector is the first four
//! bytes of the keccak of the operation's signature.

use enum_as_inner::EnumAsInner;
use ethereum_types::{Address, H256, U256};
use keccak_hash::keccak;
use rlp::{DecoderError, Rlp};
use rlp_derive::{RlpDecodable, RlpEncodable};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Type byte prefixed to every encoded internal transaction.
pub const INTERNAL_TX_TYPE: u8 = 0x6A;

const START_BLOCK_SIGNATURE: &str = "startBlock(uint64,uint64,uint64)";
const BATCH_POSTING_REPORT_SIGNATURE: &str =
    "batchPostingReport(uint64,address,uint64,uint64,uint256)";

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum InternalTxError {
    #[error("empty internal transaction")]
    Empty,

    #[error("unexpected transaction type {0:#04x}")]
    WrongType(u8),

    #[error("unknown internal transaction selector {0:02x?}")]
    UnknownSelector(Vec<u8>),

    #[error("malformed internal transaction: {0}")]
    Rlp(#[from] DecoderError),
}

#[derive(Clone, Debug, Deserialize, EnumAsInner, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InternalTx {
    /// Opens an L2 block.
    StartBlock {
        l1_block_number: u64,
        l2_block_number: u64,
        /// Seconds since the previous block.
        time_passed: u64,
    },
    /// Reports what posting one batch to the base layer cost.
    BatchPostingReport {
        batch_timestamp: u64,
        poster: Address,
        batch_number: u64,
        batch_data_gas: u64,
        l1_base_fee: U256,
    },
}

#[derive(RlpEncodable, RlpDecodable)]
struct StartBlockRlp {
    selector: Vec<u8>,
    l1_block_number: u64,
    l2_block_number: u64,
    time_passed: u64,
}

#[derive(RlpEncodable, RlpDecodable)]
struct BatchPostingReportRlp {
    selector: Vec<u8>,
    batch_timestamp: u64,
    poster: Address,
    batch_number: u64,
    batch_data_gas: u64,
    l1_base_fee: U256,
}

fn selector(signature: &str) -> Vec<u8> {
    keccak(signature.as_bytes()).as_bytes()[..4].to_vec()
}

impl InternalTx {
    /// The typed wire encoding.
    pub fn encode(&self) -> Vec<u8> {
        let body = match *self {
            InternalTx::StartBlock {
                l1_block_number,
                l2_block_number,
                time_passed,
            } => rlp::encode(&StartBlockRlp {
                selector: selector(START_BLOCK_SIGNATURE),
                l1_block_number,
                l2_block_number,
                time_passed,
            }),
            InternalTx::BatchPostingReport {
                batch_timestamp,
                poster,
                batch_number,
                batch_data_gas,
                l1_base_fee,
            } => rlp::encode(&BatchPostingReportRlp {
                selector: selector(BATCH_POSTING_REPORT_SIGNATURE),
                batch_timestamp,
                poster,
                batch_number,
                batch_data_gas,
                l1_base_fee,
            }),
        };

        let mut out = Vec::with_capacity(body.len() + 1);
        out.push(INTERNAL_TX_TYPE);
        out.extend_from_slice(&body);
        out
    }

    /// Identifies the transaction in the block's audit trail.
    pub fn hash(&self) -> H256 {
        keccak(self.encode())
    }

    /// Parses the output of [`InternalTx::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, InternalTxError> {
        let (&ty, body) = bytes.split_first().ok_or(InternalTxError::Empty)?;
        if ty != INTERNAL_TX_TYPE {
            return Err(InternalTxError::WrongType(ty));
        }

        let sel: Vec<u8> = Rlp::new(body).val_at(0)?;
        if sel == selector(START_BLOCK_SIGNATURE) {
            let fields: StartBlockRlp = rlp::decode(body)?;
            Ok(InternalTx::StartBlock {
                l1_block_number: fields.l1_block_number,
                l2_block_number: fields.l2_block_number,
                time_passed: fields.time_passed,
            })
        } else if sel == selector(BATCH_POSTING_REPORT_SIGNATURE) {
            let fields: BatchPostingReportRlp = rlp::decode(body)?;
            Ok(InternalTx::BatchPostingReport {
                batch_timestamp: fields.batch_timestamp,
                poster: fields.poster,
                batch_number: fields.batch_number,
                batch_data_gas: fields.batch_data_gas,
                l1_base_fee: fields.l1_base_fee,
            })
        } else {
            Err(InternalTxError::UnknownSelector(sel))
        }
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    fn report() -> InternalTx {
        InternalTx::BatchPostingReport {
            batch_timestamp: 1_700_000_000,
            poster: Address::repeat_byte(0xa4),
            batch_number: 12,
            batch_data_gas: 45_000,
            l1_base_fee: 30_000_000_000u64.into(),
        }
    }

    #[test]
    fn start_block_wire_format() {
        let tx = InternalTx::StartBlock {
            l1_block_number: 1,
            l2_block_number: 2,
            time_passed: 3,
        };
        let sel = selector(START_BLOCK_SIGNATURE);
        let mut expected = vec![INTERNAL_TX_TYPE, 0xc8, 0x84];
        expected.extend_from_slice(&sel);
        expected.extend_from_slice(&hex!("010203"));
        assert_eq!(tx.encode(), expected);
        assert_eq!(InternalTx::decode(&expected).unwrap(), tx);
    }

    #[test]
    fn report_decodes_to_itself() {
        let tx = report();
        let decoded = InternalTx::decode(&tx.encode()).unwrap();
        assert_eq!(decoded.as_batch_posting_report().map(|r| *r.2), Some(12));
        assert_eq!(decoded.hash(), tx.hash());
    }

    #[test]
    fn rejects_foreign_encodings() {
        assert_eq!(InternalTx::decode(&[]).unwrap_err(), InternalTxError::Empty);

        let mut bytes = report().encode();
        bytes[0] = 0x02;
        assert_eq!(
            InternalTx::decode(&bytes).unwrap_err(),
            InternalTxError::WrongType(0x02)
        );

        bytes[0] = INTERNAL_TX_TYPE;
        // Corrupt the first selector byte.
        bytes[3] ^= 0xff;
        assert!(matches!(
            InternalTx::decode(&bytes).unwrap_err(),
            InternalTxError::UnknownSelector(_)
        ));
    }

    #[test]
    fn selectors_differ() {
        assert_ne!(
            selector(START_BLOCK_SIGNATURE),
            selector(BATCH_POSTING_REPORT_SIGNATURE)
        );
    }
}
