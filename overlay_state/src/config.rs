//! Construction-time chain configuration.
//!
//! A [`ChainConfig`] is only read when the overlay is first initialized: every
//! value it carries is copied into storage, and from then on the stored copy is
//! authoritative.

use ethereum_types::{Address, U256};
use overlay_common::{gwei_to_wei, BATCH_POSTER_ADDRESS};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::MAX_SUPPORTED_VERSION;

/// Errors raised by [`ChainConfig::validate`].
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum ConfigError {
    #[error("the L2 speed limit must be positive")]
    ZeroSpeedLimit,

    #[error("{which} must be positive")]
    ZeroPoolSeconds { which: &'static str },

    #[error("the per-block gas limit must be positive")]
    ZeroBlockGasLimit,

    #[error("initial version {version} is not in 1..={max}")]
    UnsupportedInitialVersion { version: u64, max: u64 },
}

/// Genesis parameters of the L2 execution-gas pricer.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct L2PricingParams {
    /// Gas the pools refill by every second.
    pub speed_limit_per_second: u64,
    /// Upper bound on the gas available to a single block.
    pub per_block_gas_limit: u64,
    /// Capacity of the long-horizon pool, in seconds of refill.
    pub gas_pool_seconds: u64,
    /// Capacity of the short-horizon pool, in seconds of refill.
    pub small_gas_pool_seconds: u64,
    /// Floor of the execution gas price. Also the genesis price.
    pub minimum_gas_price_wei: U256,
}

impl Default for L2PricingParams {
    fn default() -> Self {
        Self {
            speed_limit_per_second: 1_000_000,
            per_block_gas_limit: 20_000_000,
            gas_pool_seconds: 600,
            small_gas_pool_seconds: 60,
            // 0.1 gwei
            minimum_gas_price_wei: gwei_to_wei(U256::one()) / 10,
        }
    }
}

/// Everything the overlay needs to write its genesis state.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct ChainConfig {
    pub chain_id: u64,
    /// Protocol version the chain starts at. Versions above 1 are reached by
    /// running every migration in order during initialization.
    pub initial_version: u64,
    /// Recipient of L2 execution fees.
    pub network_fee_account: Address,
    pub initial_l1_price_per_unit: U256,
    /// The batch poster registered at genesis. It also receives the L1
    /// pricing rewards.
    pub batch_poster: Address,
    /// Where the genesis batch poster's reimbursements are sent.
    pub batch_poster_pay_to: Address,
    /// First member of the chain owner set.
    pub chain_owner: Address,
    pub l2_pricing: L2PricingParams,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: 412_346,
            initial_version: MAX_SUPPORTED_VERSION,
            network_fee_account: Address::zero(),
            initial_l1_price_per_unit: gwei_to_wei(50.into()),
            batch_poster: BATCH_POSTER_ADDRESS,
            batch_poster_pay_to: BATCH_POSTER_ADDRESS,
            chain_owner: Address::zero(),
            l2_pricing: L2PricingParams::default(),
        }
    }
}

impl ChainConfig {
    /// Rejects configurations the overlay could not run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_version == 0 || self.initial_version > MAX_SUPPORTED_VERSION {
            return Err(ConfigError::UnsupportedInitialVersion {
                version: self.initial_version,
                max: MAX_SUPPORTED_VERSION,
            });
        }

        let l2 = &self.l2_pricing;
        if l2.speed_limit_per_second == 0 {
            return Err(ConfigError::ZeroSpeedLimit);
        }
        if l2.gas_pool_seconds == 0 {
            return Err(ConfigError::ZeroPoolSeconds {
                which: "gas_pool_seconds",
            });
        }
        if l2.small_gas_pool_seconds == 0 {
            return Err(ConfigError::ZeroPoolSeconds {
                which: "small_gas_pool_seconds",
            });
        }
        if l2.per_block_gas_limit == 0 {
            return Err(ConfigError::ZeroBlockGasLimit);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        ChainConfig::default().validate().unwrap();
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let cfg: ChainConfig = serde_json::from_str(
            r#"{
                "chain_id": 42161,
                "initial_version": 6,
                "l2_pricing": { "speed_limit_per_second": 7000000 }
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.chain_id, 42161);
        assert_eq!(cfg.initial_version, 6);
        assert_eq!(cfg.batch_poster, BATCH_POSTER_ADDRESS);
        assert_eq!(cfg.l2_pricing.speed_limit_per_second, 7_000_000);
        assert_eq!(cfg.l2_pricing.gas_pool_seconds, 600);
    }

    #[test]
    fn rejects_unusable_parameters() {
        let mut cfg = ChainConfig {
            initial_version: MAX_SUPPORTED_VERSION + 1,
            ..Default::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::UnsupportedInitialVersion {
                version: MAX_SUPPORTED_VERSION + 1,
                max: MAX_SUPPORTED_VERSION
            })
        );

        cfg.initial_version = 1;
        cfg.l2_pricing.small_gas_pool_seconds = 0;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::ZeroPoolSeconds {
                which: "small_gas_pool_seconds"
            })
        );

        cfg.l2_pricing.small_gas_pool_seconds = 60;
        cfg.l2_pricing.speed_limit_per_second = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroSpeedLimit));
    }
}
