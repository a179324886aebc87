//! Pricing of the base-layer data every transaction occupies once posted.
//!
//! Users are charged `price_per_unit` for every unit of calldata they put in a
//! batch; the fees land in the [`L1_PRICER_FUNDS_POOL_ADDRESS`] escrow. When a
//! batch poster reports what posting actually cost, the poster is reimbursed
//! from the escrow and the price is nudged toward the level at which income and
//! spending balance out.

use ethereum_types::{Address, U256};
use log::{debug, info};
use num::{BigInt, Signed as _};
use overlay_common::{
    calldata_gas, BATCH_POSTER_ADDRESS, L1_PRICER_FUNDS_POOL_ADDRESS,
    TX_DATA_NON_ZERO_GAS_EIP2028,
};
use thiserror::Error;

use crate::{
    storage::{
        Storage, StorageBackedAddress, StorageBackedBigInt, StorageBackedBigUint,
        StorageBackedInt64, StorageBackedUint64, StorageError, StorageResult,
    },
    world::transfer_balance,
};

mod batch_posters;
pub mod formulas;

pub use batch_posters::{BatchPosterState, BatchPostersTable};
use formulas::{PosterAccount, PricingSnapshot, SpendingFormula, SpendingOutcome, SpendingUpdate};

/// Stores the result of L1 pricing operations.
pub type L1PricingResult<T> = Result<T, L1PricingError>;

/// An error raised by the L1 pricing engine.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum L1PricingError {
    /// A spending report is dated before the last one or after the block
    /// processing it.
    #[error(
        "spending reported at {update_time} is outside [{last_update_time}, {current_time}]"
    )]
    InvalidTimeOrdering {
        update_time: u64,
        last_update_time: u64,
        current_time: u64,
    },

    #[error("{0:?} is not a batch poster")]
    PosterNotFound(Address),

    #[error("{0:?} is already a batch poster")]
    PosterAlreadyExists(Address),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl L1PricingError {
    /// Whether the error leaves the state unusable, as opposed to rejecting
    /// one report.
    pub fn is_fatal(&self) -> bool {
        matches!(self, L1PricingError::Storage(_))
    }
}

const PAY_REWARDS_TO_OFFSET: u64 = 0;
const EQUILIBRATION_UNITS_OFFSET: u64 = 1;
const INERTIA_OFFSET: u64 = 2;
const PER_UNIT_REWARD_OFFSET: u64 = 3;
const LAST_UPDATE_TIME_OFFSET: u64 = 4;
const FUNDS_DUE_FOR_REWARDS_OFFSET: u64 = 5;
const UNITS_SINCE_OFFSET: u64 = 6;
const PRICE_PER_UNIT_OFFSET: u64 = 7;
const LAST_SURPLUS_OFFSET: u64 = 8;
const PER_BATCH_GAS_COST_OFFSET: u64 = 9;
const AMORTIZED_COST_CAP_BIPS_OFFSET: u64 = 10;
const L1_FEES_AVAILABLE_OFFSET: u64 = 11;

const BATCH_POSTER_TABLE_KEY: &[u8] = &[0];

pub const INITIAL_EQUILIBRATION_UNITS_V0: u64 = 60 * TX_DATA_NON_ZERO_GAS_EIP2028 * 100_000;
pub const INITIAL_EQUILIBRATION_UNITS_V6: u64 = TX_DATA_NON_ZERO_GAS_EIP2028 * 10_000_000;
pub const INITIAL_INERTIA: u64 = 10;
pub const INITIAL_PER_UNIT_REWARD: u64 = 10;
pub const INITIAL_PER_BATCH_GAS_COST_V3: i64 = 100_000;
pub const INITIAL_PER_BATCH_GAS_COST_V11: i64 = 210_000;

/// Bytes of overhead a transaction is assumed to add to a batch on top of its
/// calldata.
pub const TX_FIXED_COST_ESTIMATE_BYTES: u64 = 140;

/// The first version that persists `last_surplus` with its sign.
const SIGNED_SURPLUS_VERSION: u64 = 7;

#[derive(Clone, Debug)]
pub struct L1PricingState {
    storage: Storage,
    batch_poster_table: BatchPostersTable,
    pay_rewards_to: StorageBackedAddress,
    equilibration_units: StorageBackedBigUint,
    inertia: StorageBackedUint64,
    per_unit_reward: StorageBackedUint64,
    last_update_time: StorageBackedUint64,
    funds_due_for_rewards: StorageBackedBigUint,
    units_since_update: StorageBackedUint64,
    price_per_unit: StorageBackedBigUint,
    last_surplus: StorageBackedBigInt,
    per_batch_gas_cost: StorageBackedInt64,
    amortized_cost_cap_bips: StorageBackedUint64,
    l1_fees_available: StorageBackedBigUint,
}

impl L1PricingState {
    /// Writes the genesis parameters and registers the first batch poster.
    pub fn initialize(
        storage: &Storage,
        rewards_recipient: Address,
        batch_poster: Address,
        batch_poster_pay_to: Address,
        initial_price_per_unit: U256,
    ) -> L1PricingResult<()> {
        let table_storage = storage.open_sub_storage(BATCH_POSTER_TABLE_KEY);
        BatchPostersTable::initialize(&table_storage)?;
        BatchPostersTable::open(&table_storage).add_poster(batch_poster, batch_poster_pay_to)?;

        storage
            .open_address(PAY_REWARDS_TO_OFFSET)
            .set(rewards_recipient)?;
        storage
            .open_big_uint(EQUILIBRATION_UNITS_OFFSET)
            .set(INITIAL_EQUILIBRATION_UNITS_V0.into())?;
        storage.set_u64_by_u64(INERTIA_OFFSET, INITIAL_INERTIA)?;
        storage.set_u64_by_u64(PER_UNIT_REWARD_OFFSET, INITIAL_PER_UNIT_REWARD)?;
        storage
            .open_big_uint(PRICE_PER_UNIT_OFFSET)
            .set(initial_price_per_unit)?;
        Ok(())
    }

    pub fn open(storage: Storage) -> Self {
        Self {
            batch_poster_table: BatchPostersTable::open(
                &storage.open_sub_storage(BATCH_POSTER_TABLE_KEY),
            ),
            pay_rewards_to: storage.open_address(PAY_REWARDS_TO_OFFSET),
            equilibration_units: storage.open_big_uint(EQUILIBRATION_UNITS_OFFSET),
            inertia: storage.open_uint64(INERTIA_OFFSET),
            per_unit_reward: storage.open_uint64(PER_UNIT_REWARD_OFFSET),
            last_update_time: storage.open_uint64(LAST_UPDATE_TIME_OFFSET),
            funds_due_for_rewards: storage.open_big_uint(FUNDS_DUE_FOR_REWARDS_OFFSET),
            units_since_update: storage.open_uint64(UNITS_SINCE_OFFSET),
            price_per_unit: storage.open_big_uint(PRICE_PER_UNIT_OFFSET),
            last_surplus: storage.open_big_int(LAST_SURPLUS_OFFSET),
            per_batch_gas_cost: storage.open_int64(PER_BATCH_GAS_COST_OFFSET),
            amortized_cost_cap_bips: storage.open_uint64(AMORTIZED_COST_CAP_BIPS_OFFSET),
            l1_fees_available: storage.open_big_uint(L1_FEES_AVAILABLE_OFFSET),
            storage,
        }
    }

    pub fn batch_poster_table(&self) -> &BatchPostersTable {
        &self.batch_poster_table
    }

    pub fn pay_rewards_to(&self) -> StorageResult<Address> {
        self.pay_rewards_to.get()
    }

    pub fn set_pay_rewards_to(&self, addr: Address) -> StorageResult<()> {
        self.pay_rewards_to.set(addr)
    }

    pub fn equilibration_units(&self) -> StorageResult<U256> {
        self.equilibration_units.get()
    }

    pub fn set_equilibration_units(&self, units: U256) -> StorageResult<()> {
        self.equilibration_units.set(units)
    }

    pub fn inertia(&self) -> StorageResult<u64> {
        self.inertia.get()
    }

    pub fn set_inertia(&self, inertia: u64) -> StorageResult<()> {
        self.inertia.set(inertia)
    }

    pub fn per_unit_reward(&self) -> StorageResult<u64> {
        self.per_unit_reward.get()
    }

    pub fn set_per_unit_reward(&self, reward: u64) -> StorageResult<()> {
        self.per_unit_reward.set(reward)
    }

    pub fn last_update_time(&self) -> StorageResult<u64> {
        self.last_update_time.get()
    }

    pub fn set_last_update_time(&self, time: u64) -> StorageResult<()> {
        self.last_update_time.set(time)
    }

    pub fn funds_due_for_rewards(&self) -> StorageResult<U256> {
        self.funds_due_for_rewards.get()
    }

    pub fn units_since_update(&self) -> StorageResult<u64> {
        self.units_since_update.get()
    }

    pub fn set_units_since_update(&self, units: u64) -> StorageResult<()> {
        self.units_since_update.set(units)
    }

    /// Records `units` more of posted data awaiting a spending report.
    pub fn add_to_units_since_update(&self, units: u64) -> StorageResult<()> {
        let current = self.units_since_update.get()?;
        self.units_since_update.set(current.saturating_add(units))
    }

    pub fn price_per_unit(&self) -> StorageResult<U256> {
        self.price_per_unit.get()
    }

    pub fn set_price_per_unit(&self, price: U256) -> StorageResult<()> {
        self.price_per_unit.set(price)
    }

    pub fn last_surplus(&self) -> StorageResult<BigInt> {
        self.last_surplus.get()
    }

    /// Stores the surplus seen by the last price adjustment. Before version 7
    /// only its magnitude was kept.
    pub fn set_last_surplus(&self, surplus: &BigInt, version: u64) -> StorageResult<()> {
        if version < SIGNED_SURPLUS_VERSION {
            self.last_surplus.set(&surplus.abs())
        } else {
            self.last_surplus.set(surplus)
        }
    }

    /// Gas charged per batch on top of its data gas.
    pub fn per_batch_gas_cost(&self) -> StorageResult<i64> {
        self.per_batch_gas_cost.get()
    }

    pub fn set_per_batch_gas_cost(&self, cost: i64) -> StorageResult<()> {
        self.per_batch_gas_cost.set(cost)
    }

    pub fn amortized_cost_cap_bips(&self) -> StorageResult<u64> {
        self.amortized_cost_cap_bips.get()
    }

    pub fn set_amortized_cost_cap_bips(&self, bips: u64) -> StorageResult<()> {
        self.amortized_cost_cap_bips.set(bips)
    }

    pub fn l1_fees_available(&self) -> StorageResult<U256> {
        self.l1_fees_available.get()
    }

    pub fn set_l1_fees_available(&self, amount: U256) -> StorageResult<()> {
        self.l1_fees_available.set(amount)
    }

    /// Credits fees paid into the funds pool. Returns the new total.
    pub fn add_to_l1_fees_available(&self, amount: U256) -> StorageResult<U256> {
        let total = self.l1_fees_available.get()?.saturating_add(amount);
        self.l1_fees_available.set(total)?;
        Ok(total)
    }

    /// What a transaction with `calldata` owes for its share of a batch, and
    /// the units of data it adds. Only blocks built by the default batch
    /// poster are charged.
    pub fn poster_data_cost(&self, poster: Address, calldata: &[u8]) -> StorageResult<(U256, u64)> {
        if poster != BATCH_POSTER_ADDRESS {
            return Ok((U256::zero(), 0));
        }
        let units = calldata_gas(calldata)
            .saturating_add(TX_FIXED_COST_ESTIMATE_BYTES * TX_DATA_NON_ZERO_GAS_EIP2028);
        let cost = self.price_per_unit.get()?.saturating_mul(units.into());
        Ok((cost, units))
    }

    fn funds_pool_balance(&self) -> StorageResult<U256> {
        Ok(self
            .storage
            .world()
            .borrow()
            .balance(L1_PRICER_FUNDS_POOL_ADDRESS)?)
    }

    fn snapshot(
        &self,
        formula: SpendingFormula,
        posters: &[BatchPosterState],
        spender: usize,
    ) -> StorageResult<PricingSnapshot> {
        let available_funds = if formula.uses_fee_counter() {
            self.l1_fees_available.get()?
        } else {
            self.funds_pool_balance()?
        };
        let posters = posters
            .iter()
            .map(|p| {
                Ok(PosterAccount {
                    address: p.address(),
                    pay_to: p.pay_to()?,
                    funds_due: p.funds_due()?,
                })
            })
            .collect::<StorageResult<_>>()?;

        Ok(PricingSnapshot {
            last_update_time: self.last_update_time.get()?,
            units_since_update: self.units_since_update.get()?,
            price_per_unit: self.price_per_unit.get()?,
            equilibration_units: self.equilibration_units.get()?,
            inertia: self.inertia.get()?,
            per_unit_reward: self.per_unit_reward.get()?,
            amortized_cost_cap_bips: self.amortized_cost_cap_bips.get()?,
            last_surplus: self.last_surplus.get()?,
            funds_due_for_rewards: self.funds_due_for_rewards.get()?,
            pay_rewards_to: self.pay_rewards_to.get()?,
            available_funds,
            total_funds_due: self.batch_poster_table.total_funds_due()?,
            posters,
            spender,
        })
    }

    /// Accounts for `wei_spent` by `poster` at `update_time` to post a batch,
    /// reimbursing the poster and adjusting the price with the formula of
    /// protocol `version`.
    ///
    /// Returns `Ok(None)` if the formula ignored the report.
    pub fn update_for_batch_poster_spending(
        &self,
        version: u64,
        update_time: u64,
        current_time: u64,
        poster: Address,
        wei_spent: U256,
        l1_base_fee: U256,
    ) -> L1PricingResult<Option<SpendingOutcome>> {
        let formula = SpendingFormula::for_version(version);
        let table = &self.batch_poster_table;
        let spending_poster = table.open_poster(poster, true)?;

        let (posters, spender) = match formula {
            SpendingFormula::Legacy => {
                let posters = table
                    .all_posters(u64::MAX)?
                    .into_iter()
                    .map(|addr| table.open_poster(addr, false))
                    .collect::<L1PricingResult<Vec<_>>>()?;
                let spender = posters
                    .iter()
                    .position(|p| p.address() == poster)
                    .ok_or(L1PricingError::PosterNotFound(poster))?;
                (posters, spender)
            }
            _ => (vec![spending_poster], 0),
        };

        let snap = self.snapshot(formula, &posters, spender)?;
        let update = SpendingUpdate {
            update_time,
            current_time,
            wei_spent,
            l1_base_fee,
        };
        let Some(outcome) = formulas::compute(formula, &snap, &update)? else {
            return Ok(None);
        };

        self.units_since_update.set(outcome.units_since_update)?;
        for (handle, (before, after)) in posters
            .iter()
            .zip(snap.posters.iter().zip(&outcome.posters))
        {
            if before.funds_due != after.funds_due {
                handle.set_funds_due(after.funds_due)?;
            }
        }
        self.funds_due_for_rewards
            .set(outcome.funds_due_for_rewards)?;

        {
            let mut world = self.storage.world().borrow_mut();
            for payment in &outcome.payments {
                debug!(
                    "L1 pricing pays {} to {:?} ({:?})",
                    payment.amount, payment.to, payment.reason
                );
                transfer_balance(
                    &mut *world,
                    Some(L1_PRICER_FUNDS_POOL_ADDRESS),
                    Some(payment.to),
                    payment.amount,
                )
                .map_err(StorageError::from)?;
            }
        }
        if formula.uses_fee_counter() {
            self.l1_fees_available.set(outcome.available_funds)?;
        }

        self.last_update_time.set(outcome.last_update_time)?;
        if outcome.units_allocated > 0 {
            if let Some(surplus) = &outcome.surplus {
                self.set_last_surplus(surplus, version)?;
            }
            self.price_per_unit.set(outcome.price_per_unit)?;
        }

        info!(
            "batch poster {poster:?} spent {wei_spent} wei: {} units allocated, price per unit now {}",
            outcome.units_allocated, outcome.price_per_unit
        );
        Ok(Some(outcome))
    }
}
