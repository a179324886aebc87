//! The JSON scenario format read by the replay driver.

use std::{collections::BTreeMap, fs::File, path::Path};

use anyhow::Context as _;
use ethereum_types::{Address, H256, U256};
use overlay_state::{
    hooks::{BatchPostingReport, OverlayTx},
    ChainConfig,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// A chain's genesis and the blocks to replay on top of it.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Scenario {
    #[serde(default)]
    pub config: ChainConfig,
    /// Balances credited before the first block.
    #[serde(default)]
    pub alloc: BTreeMap<Address, U256>,
    pub blocks: Vec<BlockInput>,
}

impl Scenario {
    pub fn from_json_str(s: &str) -> anyhow::Result<Self> {
        Ok(serde_path_to_error::deserialize(
            &mut serde_json::Deserializer::from_str(s),
        )?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        json(path)
    }
}

/// One L2 block as block assembly hands it over.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BlockInput {
    pub number: u64,
    pub timestamp: u64,
    /// The base-layer block the rollup has caught up to.
    pub l1_block_number: u64,
    #[serde(default)]
    pub coinbase: Address,
    #[serde(default)]
    pub parent_hash: H256,
    /// Applied before the block starts, so it may take effect in this block.
    #[serde(default)]
    pub schedule_upgrade: Option<UpgradeInput>,
    #[serde(default)]
    pub txs: Vec<TxInput>,
    /// Processed after every transaction of the block.
    #[serde(default)]
    pub batch_posting_report: Option<BatchPostingReport>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct UpgradeInput {
    pub target: u64,
    pub activate_at: u64,
}

/// A transaction and what the execution engine made of it.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TxInput {
    pub tx: OverlayTx,
    #[serde(default)]
    pub execution: ExecutionInput,
    /// How the automatic redeem scheduled by a retryable submission runs.
    #[serde(default)]
    pub redeem: ExecutionInput,
}

/// The engine's side of a transaction.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutionInput {
    /// Gas the engine itself consumed, on top of any poster gas.
    pub compute_gas: u64,
    pub success: bool,
}

impl Default for ExecutionInput {
    fn default() -> Self {
        Self {
            compute_gas: overlay_common::TX_GAS,
            success: true,
        }
    }
}

fn json<T: DeserializeOwned>(path: impl AsRef<Path>) -> anyhow::Result<T> {
    fn _imp<T: DeserializeOwned>(path: impl AsRef<Path>) -> anyhow::Result<T> {
        let file = File::open(path)?;
        Ok(serde_path_to_error::deserialize(
            &mut serde_json::Deserializer::from_reader(file),
        )?)
    }

    _imp(&path).context(format!("couldn't load {}", path.as_ref().display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let scenario = Scenario::from_json_str(
            r#"{
                "blocks": [
                    { "number": 1, "timestamp": 10, "l1_block_number": 3 }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(scenario.config, ChainConfig::default());
        assert!(scenario.alloc.is_empty());
        let block = &scenario.blocks[0];
        assert!(block.txs.is_empty());
        assert_eq!(block.coinbase, Address::zero());
        assert!(block.batch_posting_report.is_none());
    }

    #[test]
    fn errors_name_the_offending_field() {
        let err = Scenario::from_json_str(
            r#"{ "blocks": [ { "number": 1, "timestamp": "soon", "l1_block_number": 3 } ] }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("blocks[0].timestamp"), "{err}");
    }
}
