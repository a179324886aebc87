//! Leaky-bucket pricing of L2 execution gas.
//!
//! Two pools of gas, a long-horizon one and a short-horizon one, refill at
//! `speed_limit_per_second` up to `speed × pool_seconds`. Transactions drain
//! both. Each elapsed second nudges the price by how depleted the pools are:
//! full pools decay the price by 1/120 per second (a half-life of about 83
//! seconds), fully drained pools raise it by 1/120 per second. The price never
//! drops below the configured minimum.

use ethereum_types::U256;
use log::debug;
use overlay_common::ONE_IN_BIPS;

use crate::{
    config::L2PricingParams,
    storage::{Storage, StorageBackedBigUint, StorageBackedInt64, StorageBackedUint64, StorageResult},
};

const GAS_POOL_OFFSET: u64 = 0;
const SMALL_GAS_POOL_OFFSET: u64 = 1;
const GAS_PRICE_OFFSET: u64 = 2;
const SPEED_LIMIT_OFFSET: u64 = 3;
const GAS_POOL_SECONDS_OFFSET: u64 = 4;
const SMALL_GAS_POOL_SECONDS_OFFSET: u64 = 5;
const PER_BLOCK_GAS_LIMIT_OFFSET: u64 = 6;
const MINIMUM_GAS_PRICE_OFFSET: u64 = 7;

/// Seconds over which a saturated pool halves the price.
pub const PRICE_HALF_LIFE_SECONDS: u64 = 83;

/// Denominator of the per-second price adjustment, in bips.
const ADJUSTMENT_DENOMINATOR: u64 = 120 * ONE_IN_BIPS;
/// Numerator of the per-second adjustment with both pools full.
const ADJUSTMENT_BASE: u64 = 119 * ONE_IN_BIPS;

#[derive(Clone, Debug)]
pub struct L2PricingState {
    gas_pool: StorageBackedInt64,
    small_gas_pool: StorageBackedInt64,
    gas_price_wei: StorageBackedBigUint,
    speed_limit_per_second: StorageBackedUint64,
    gas_pool_seconds: StorageBackedUint64,
    small_gas_pool_seconds: StorageBackedUint64,
    per_block_gas_limit: StorageBackedUint64,
    minimum_gas_price_wei: StorageBackedBigUint,
}

impl L2PricingState {
    /// Writes the genesis parameters, with both pools full and the price at
    /// its minimum.
    pub fn initialize(storage: &Storage, params: &L2PricingParams) -> StorageResult<()> {
        let speed = params.speed_limit_per_second;
        storage.set_u64_by_u64(SPEED_LIMIT_OFFSET, speed)?;
        storage.set_u64_by_u64(GAS_POOL_SECONDS_OFFSET, params.gas_pool_seconds)?;
        storage.set_u64_by_u64(SMALL_GAS_POOL_SECONDS_OFFSET, params.small_gas_pool_seconds)?;
        storage.set_u64_by_u64(PER_BLOCK_GAS_LIMIT_OFFSET, params.per_block_gas_limit)?;

        storage
            .open_int64(GAS_POOL_OFFSET)
            .set(pool_max(speed, params.gas_pool_seconds))?;
        storage
            .open_int64(SMALL_GAS_POOL_OFFSET)
            .set(pool_max(speed, params.small_gas_pool_seconds))?;

        storage
            .open_big_uint(MINIMUM_GAS_PRICE_OFFSET)
            .set(params.minimum_gas_price_wei)?;
        storage
            .open_big_uint(GAS_PRICE_OFFSET)
            .set(params.minimum_gas_price_wei)
    }

    pub fn open(storage: Storage) -> Self {
        Self {
            gas_pool: storage.open_int64(GAS_POOL_OFFSET),
            small_gas_pool: storage.open_int64(SMALL_GAS_POOL_OFFSET),
            gas_price_wei: storage.open_big_uint(GAS_PRICE_OFFSET),
            speed_limit_per_second: storage.open_uint64(SPEED_LIMIT_OFFSET),
            gas_pool_seconds: storage.open_uint64(GAS_POOL_SECONDS_OFFSET),
            small_gas_pool_seconds: storage.open_uint64(SMALL_GAS_POOL_SECONDS_OFFSET),
            per_block_gas_limit: storage.open_uint64(PER_BLOCK_GAS_LIMIT_OFFSET),
            minimum_gas_price_wei: storage.open_big_uint(MINIMUM_GAS_PRICE_OFFSET),
        }
    }

    pub fn gas_pool(&self) -> StorageResult<i64> {
        self.gas_pool.get()
    }

    pub fn small_gas_pool(&self) -> StorageResult<i64> {
        self.small_gas_pool.get()
    }

    /// The current L2 base fee.
    pub fn gas_price_wei(&self) -> StorageResult<U256> {
        self.gas_price_wei.get()
    }

    pub fn minimum_gas_price_wei(&self) -> StorageResult<U256> {
        self.minimum_gas_price_wei.get()
    }

    /// Changes the price floor. The current price is raised to it if needed.
    pub fn set_minimum_gas_price_wei(&self, price: U256) -> StorageResult<()> {
        self.minimum_gas_price_wei.set(price)?;
        if self.gas_price_wei.get()? < price {
            self.gas_price_wei.set(price)?;
        }
        Ok(())
    }

    pub fn speed_limit_per_second(&self) -> StorageResult<u64> {
        self.speed_limit_per_second.get()
    }

    pub fn set_speed_limit_per_second(&self, speed: u64) -> StorageResult<()> {
        self.speed_limit_per_second.set(speed)
    }

    pub fn per_block_gas_limit(&self) -> StorageResult<u64> {
        self.per_block_gas_limit.get()
    }

    pub fn set_per_block_gas_limit(&self, limit: u64) -> StorageResult<()> {
        self.per_block_gas_limit.set(limit)
    }

    pub fn gas_pool_max(&self) -> StorageResult<i64> {
        Ok(pool_max(
            self.speed_limit_per_second.get()?,
            self.gas_pool_seconds.get()?,
        ))
    }

    pub fn small_gas_pool_max(&self) -> StorageResult<i64> {
        Ok(pool_max(
            self.speed_limit_per_second.get()?,
            self.small_gas_pool_seconds.get()?,
        ))
    }

    /// Gas a new block may use: the long-horizon pool's level clamped to
    /// `[0, per_block_gas_limit]`.
    pub fn per_block_gas_available(&self) -> StorageResult<u64> {
        let pool = u64::try_from(self.gas_pool.get()?).unwrap_or(0);
        Ok(pool.min(self.per_block_gas_limit.get()?))
    }

    /// Adds `delta` to both pools; negative values drain them. Each pool stays
    /// within `[-max, max]`.
    pub fn add_to_gas_pools(&self, delta: i64) -> StorageResult<()> {
        let max = self.gas_pool_max()?;
        let small_max = self.small_gas_pool_max()?;
        self.gas_pool
            .set(self.gas_pool.get()?.saturating_add(delta).clamp(-max, max))?;
        self.small_gas_pool.set(
            self.small_gas_pool
                .get()?
                .saturating_add(delta)
                .clamp(-small_max, small_max),
        )
    }

    /// Advances the pricer by `seconds`, refilling the pools and adjusting
    /// the price one second at a time.
    pub fn notify_time_elapsed(&self, seconds: u64) -> StorageResult<()> {
        if seconds == 0 {
            return Ok(());
        }
        let speed = self.speed_limit_per_second.get()?;
        let max = self.gas_pool_max()?;
        let small_max = self.small_gas_pool_max()?;
        let minimum = self.minimum_gas_price_wei.get()?;

        let mut pool = self.gas_pool.get()?;
        let mut small_pool = self.small_gas_pool.get()?;
        let mut price = self.gas_price_wei.get()?;
        let refill = i64::try_from(speed).unwrap_or(i64::MAX);

        let mut remaining = seconds;
        while remaining > 0 {
            if pool >= max && small_pool >= small_max {
                price = fast_forward_saturated(price, remaining).max(minimum);
                break;
            }
            pool = pool.saturating_add(refill).min(max);
            small_pool = small_pool.saturating_add(refill).min(small_max);

            let numerator =
                ADJUSTMENT_BASE + depletion_bips(pool, max) + depletion_bips(small_pool, small_max);
            price = (price.saturating_mul(numerator.into()) / ADJUSTMENT_DENOMINATOR).max(minimum);
            remaining -= 1;
        }

        debug!("L2 pricing after {seconds}s: pools {pool}/{small_pool}, price {price}");
        self.gas_pool.set(pool)?;
        self.small_gas_pool.set(small_pool)?;
        self.gas_price_wei.set(price)
    }
}

fn pool_max(speed: u64, seconds: u64) -> i64 {
    i64::try_from(speed.saturating_mul(seconds)).unwrap_or(i64::MAX)
}

/// How far below `max` the pool is, in bips of `max`, within `[0, 10000]`.
fn depletion_bips(pool: i64, max: i64) -> u64 {
    if max <= 0 || pool >= max {
        return 0;
    }
    let missing = i128::from(max) - i128::from(pool);
    let bips = missing * i128::from(ONE_IN_BIPS) / i128::from(max);
    bips.min(i128::from(ONE_IN_BIPS)) as u64
}

/// Price after `seconds` with both pools full: one halving per whole
/// half-life, then the per-second decay for the rest.
fn fast_forward_saturated(price: U256, seconds: u64) -> U256 {
    let halvings = seconds / PRICE_HALF_LIFE_SECONDS;
    let mut price = if halvings >= 256 {
        U256::zero()
    } else {
        price >> halvings as usize
    };
    for _ in 0..seconds % PRICE_HALF_LIFE_SECONDS {
        price = price.saturating_mul(ADJUSTMENT_BASE.into()) / ADJUSTMENT_DENOMINATOR;
    }
    price
}
