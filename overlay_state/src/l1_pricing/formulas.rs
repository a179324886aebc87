//! The batch-poster spending formulas, one per protocol era.
//!
//! Each formula is a pure function from a [`PricingSnapshot`] of the stored
//! parameters to a [`SpendingOutcome`] describing every value to write back
//! and every payment to make. Historical blocks must replay with the formula
//! that was active when they were produced, so old formulas are kept verbatim
//! and selected by protocol version.

use ethereum_types::{Address, U256};
use log::debug;
use num::BigInt;

use super::{L1PricingError, L1PricingResult};
use crate::util::{
    bigint_to_u256_saturating, floor_div, mul_by_bips, saturating_mul_div, u256_to_bigint,
};

/// Which spending formula a protocol version uses.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SpendingFormula {
    /// Versions 0 and 1. Out-of-order reports are ignored, and payouts come
    /// from a time-proportional share of the funds pool.
    Legacy,
    /// Version 2. Payouts come from the whole funds pool.
    Uncapped,
    /// Versions 3 to 9. Adds the amortized cost cap.
    Capped,
    /// Version 10 onwards. Payouts are limited by the `l1FeesAvailable`
    /// counter instead of the pool's balance.
    Accounted,
}

impl SpendingFormula {
    pub fn for_version(version: u64) -> Self {
        match version {
            0..=1 => SpendingFormula::Legacy,
            2 => SpendingFormula::Uncapped,
            3..=9 => SpendingFormula::Capped,
            _ => SpendingFormula::Accounted,
        }
    }

    pub fn applies_cost_cap(self) -> bool {
        matches!(self, SpendingFormula::Capped | SpendingFormula::Accounted)
    }

    /// Whether available funds come from the `l1FeesAvailable` counter rather
    /// than the funds pool's balance.
    pub fn uses_fee_counter(self) -> bool {
        matches!(self, SpendingFormula::Accounted)
    }
}

/// A poster's reimbursement account, as seen by a formula.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PosterAccount {
    pub address: Address,
    pub pay_to: Address,
    pub funds_due: U256,
}

/// The stored pricing parameters a formula reads.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PricingSnapshot {
    pub last_update_time: u64,
    pub units_since_update: u64,
    pub price_per_unit: U256,
    pub equilibration_units: U256,
    pub inertia: u64,
    pub per_unit_reward: u64,
    pub amortized_cost_cap_bips: u64,
    pub last_surplus: BigInt,
    pub funds_due_for_rewards: U256,
    pub pay_rewards_to: Address,
    /// Funds payouts may draw on.
    pub available_funds: U256,
    pub total_funds_due: U256,
    /// The posters the formula may pay. [`SpendingFormula::Legacy`] sees the
    /// whole table in order; the others only the spending poster.
    pub posters: Vec<PosterAccount>,
    /// Index of the spending poster in `posters`.
    pub spender: usize,
}

/// One batch poster's reported spending.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SpendingUpdate {
    /// When the reported spending happened.
    pub update_time: u64,
    /// Timestamp of the block processing the report.
    pub current_time: u64,
    pub wei_spent: U256,
    pub l1_base_fee: U256,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PaymentReason {
    Reward,
    PosterReimbursement,
}

/// A transfer out of the funds pool.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Payment {
    pub to: Address,
    pub amount: U256,
    pub reason: PaymentReason,
}

/// Everything a formula decided.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SpendingOutcome {
    pub units_allocated: u64,
    pub units_since_update: u64,
    pub last_update_time: u64,
    pub funds_due_for_rewards: U256,
    /// `PricingSnapshot::posters` with their new `funds_due`.
    pub posters: Vec<PosterAccount>,
    /// Payouts, in the order they are made.
    pub payments: Vec<Payment>,
    /// Funds left after the payouts.
    pub available_funds: U256,
    pub price_per_unit: U256,
    /// The surplus to remember for the next update, if the formula tracks it.
    pub surplus: Option<BigInt>,
}

impl SpendingOutcome {
    fn new(snap: &PricingSnapshot, units_allocated: u64, update_time: u64) -> Self {
        Self {
            units_allocated,
            units_since_update: snap.units_since_update.saturating_sub(units_allocated),
            last_update_time: update_time,
            funds_due_for_rewards: snap.funds_due_for_rewards,
            posters: snap.posters.clone(),
            payments: Vec::new(),
            available_funds: snap.available_funds,
            price_per_unit: snap.price_per_unit,
            surplus: None,
        }
    }

    fn pay(&mut self, to: Address, amount: U256, reason: PaymentReason) {
        if amount.is_zero() {
            return;
        }
        self.available_funds -= amount;
        self.payments.push(Payment { to, amount, reason });
    }

    /// Pays `poster` as much of what it is owed as the funds allow, drawing
    /// on at most `budget`. Returns the amount paid.
    fn settle_poster(&mut self, poster: usize, budget: U256) -> U256 {
        let account = &self.posters[poster];
        let amount = account.funds_due.min(budget).min(self.available_funds);
        let pay_to = account.pay_to;
        self.posters[poster].funds_due -= amount;
        self.pay(pay_to, amount, PaymentReason::PosterReimbursement);
        amount
    }

    /// Every poster's dues after the update, given their sum before it.
    fn total_funds_due(&self, snap: &PricingSnapshot) -> U256 {
        let before = snap.posters.iter().map(|p| p.funds_due);
        let after = self.posters.iter().map(|p| p.funds_due);
        let total = before.fold(snap.total_funds_due, |acc, due| acc.saturating_sub(due));
        after.fold(total, |acc, due| acc.saturating_add(due))
    }
}

/// Runs `formula`. `Ok(None)` means the update was ignored and nothing may be
/// written. `snap.spender` must index `snap.posters`.
pub(super) fn compute(
    formula: SpendingFormula,
    snap: &PricingSnapshot,
    update: &SpendingUpdate,
) -> L1PricingResult<Option<SpendingOutcome>> {
    match formula {
        SpendingFormula::Legacy => Ok(legacy(snap, update)),
        _ => current(formula, snap, update).map(Some),
    }
}

fn allocation_fraction(numerator: u64, denominator: u64) -> (u64, u64) {
    if denominator == 0 {
        (1, 1)
    } else {
        (numerator, denominator)
    }
}

fn current(
    formula: SpendingFormula,
    snap: &PricingSnapshot,
    update: &SpendingUpdate,
) -> L1PricingResult<SpendingOutcome> {
    let mut last_update_time = snap.last_update_time;
    if last_update_time == 0 && update.update_time > 0 {
        // First update ever.
        last_update_time = update.update_time - 1;
    }
    if update.update_time > update.current_time || update.update_time < last_update_time {
        return Err(L1PricingError::InvalidTimeOrdering {
            update_time: update.update_time,
            last_update_time,
            current_time: update.current_time,
        });
    }

    let (num, den) = allocation_fraction(
        update.update_time - last_update_time,
        update.current_time - last_update_time,
    );
    let units_allocated = saturating_mul_div(snap.units_since_update, num, den);
    let mut out = SpendingOutcome::new(snap, units_allocated, update.update_time);

    let mut wei_spent = update.wei_spent;
    if formula.applies_cost_cap() && snap.amortized_cost_cap_bips != 0 {
        let cap = mul_by_bips(
            update.l1_base_fee.saturating_mul(units_allocated.into()),
            snap.amortized_cost_cap_bips,
        );
        // Anything above the cap is a loss for the poster.
        wei_spent = wei_spent.min(cap);
    }
    let spender = &mut out.posters[snap.spender];
    spender.funds_due = spender.funds_due.saturating_add(wei_spent);

    let reward = U256::from(units_allocated).saturating_mul(snap.per_unit_reward.into());
    out.funds_due_for_rewards = out.funds_due_for_rewards.saturating_add(reward);
    let paid_reward = reward.min(out.available_funds);
    out.funds_due_for_rewards -= paid_reward;
    out.pay(snap.pay_rewards_to, paid_reward, PaymentReason::Reward);

    out.settle_poster(snap.spender, U256::MAX);

    if units_allocated > 0 {
        let surplus = surplus(&out, snap);
        let equilibration_units = u256_to_bigint(snap.equilibration_units.max(U256::one()));
        let inertia_units = floor_div(&equilibration_units, &BigInt::from(snap.inertia.max(1)));
        let units = BigInt::from(units_allocated);

        let desired_derivative = floor_div(&-&surplus, &equilibration_units);
        let actual_derivative = floor_div(&(&surplus - &snap.last_surplus), &units);
        let change_derivative_by = desired_derivative - actual_derivative;
        let price_change = floor_div(
            &(change_derivative_by * &units),
            &(inertia_units + &units),
        );

        out.price_per_unit =
            bigint_to_u256_saturating(&(u256_to_bigint(snap.price_per_unit) + price_change));
        out.surplus = Some(surplus);
    }
    Ok(out)
}

fn legacy(snap: &PricingSnapshot, update: &SpendingUpdate) -> Option<SpendingOutcome> {
    let old_surplus = u256_to_bigint(snap.available_funds)
        - (u256_to_bigint(snap.total_funds_due) + u256_to_bigint(snap.funds_due_for_rewards));

    let mut last_update_time = snap.last_update_time;
    if last_update_time == 0 && update.current_time > 0 {
        // First update ever. An update at time zero wraps and is ignored below.
        last_update_time = update.update_time.wrapping_sub(1);
    }
    if update.update_time >= update.current_time || update.update_time < last_update_time {
        debug!(
            "ignoring batch poster spending at {} (last update {}, now {})",
            update.update_time, last_update_time, update.current_time
        );
        return None;
    }

    let (num, den) = allocation_fraction(
        update.update_time - last_update_time,
        update.current_time - last_update_time,
    );
    let units_allocated = saturating_mul_div(snap.units_since_update, num, den);
    let mut out = SpendingOutcome::new(snap, units_allocated, update.update_time);

    let spender = &mut out.posters[snap.spender];
    spender.funds_due = spender.funds_due.saturating_add(update.wei_spent);

    let reward = U256::from(units_allocated).saturating_mul(snap.per_unit_reward.into());
    out.funds_due_for_rewards = out.funds_due_for_rewards.saturating_add(reward);

    // Only the share of the pool collected before the update may be paid out.
    let mut budget = bigint_to_u256_saturating(&floor_div(
        &(u256_to_bigint(snap.available_funds) * num),
        &BigInt::from(den),
    ));
    let paid_reward = reward.min(budget);
    out.funds_due_for_rewards -= paid_reward;
    out.pay(snap.pay_rewards_to, paid_reward, PaymentReason::Reward);
    budget -= paid_reward;

    for poster in 0..out.posters.len() {
        budget -= out.settle_poster(poster, budget);
    }

    if units_allocated > 0 {
        let surplus = surplus(&out, snap);
        let equilibration_units = u256_to_bigint(snap.equilibration_units.max(U256::one()));
        let inertia_units = floor_div(&equilibration_units, &BigInt::from(snap.inertia.max(1)));
        let alloc_plus_inert = inertia_units + units_allocated;

        let price_change = floor_div(
            &(&surplus * (&equilibration_units - BigInt::from(1u8)) - &old_surplus * &equilibration_units),
            &(&equilibration_units * alloc_plus_inert),
        );
        out.price_per_unit =
            bigint_to_u256_saturating(&(u256_to_bigint(snap.price_per_unit) + price_change));
    }
    Some(out)
}

/// Funds left over once every debt is paid; negative when in deficit.
fn surplus(out: &SpendingOutcome, snap: &PricingSnapshot) -> BigInt {
    let owed = u256_to_bigint(out.total_funds_due(snap)) + u256_to_bigint(out.funds_due_for_rewards);
    u256_to_bigint(out.available_funds) - owed
}

#[cfg(test)]
mod tests {
    use super::*;

    const POSTER: Address = Address::repeat_byte(0x05);
    const PAY_TO: Address = Address::repeat_byte(0x06);
    const REWARDS: Address = Address::repeat_byte(0x07);

    fn snapshot() -> PricingSnapshot {
        PricingSnapshot {
            last_update_time: 0,
            units_since_update: 0,
            price_per_unit: 1_000.into(),
            equilibration_units: 1_000_000.into(),
            inertia: 10,
            per_unit_reward: 10,
            amortized_cost_cap_bips: 0,
            last_surplus: BigInt::from(0),
            funds_due_for_rewards: U256::zero(),
            pay_rewards_to: REWARDS,
            available_funds: U256::zero(),
            total_funds_due: U256::zero(),
            posters: vec![PosterAccount {
                address: POSTER,
                pay_to: PAY_TO,
                funds_due: U256::zero(),
            }],
            spender: 0,
        }
    }

    fn spend(update_time: u64, current_time: u64, wei_spent: u64) -> SpendingUpdate {
        SpendingUpdate {
            update_time,
            current_time,
            wei_spent: wei_spent.into(),
            l1_base_fee: 10.into(),
        }
    }

    #[test]
    fn version_dispatch() {
        assert_eq!(SpendingFormula::for_version(0), SpendingFormula::Legacy);
        assert_eq!(SpendingFormula::for_version(1), SpendingFormula::Legacy);
        assert_eq!(SpendingFormula::for_version(2), SpendingFormula::Uncapped);
        assert_eq!(SpendingFormula::for_version(3), SpendingFormula::Capped);
        assert_eq!(SpendingFormula::for_version(9), SpendingFormula::Capped);
        assert_eq!(SpendingFormula::for_version(10), SpendingFormula::Accounted);
        assert_eq!(SpendingFormula::for_version(11), SpendingFormula::Accounted);
    }

    #[test]
    fn first_update_allocates_everything() {
        let snap = PricingSnapshot {
            units_since_update: 78,
            ..snapshot()
        };
        let out = compute(SpendingFormula::Accounted, &snap, &spend(1, 1, 0))
            .unwrap()
            .unwrap();
        assert_eq!(out.units_allocated, 78);
        assert_eq!(out.units_since_update, 0);
        assert_eq!(out.last_update_time, 1);
    }

    #[test]
    fn allocation_is_proportional_to_elapsed_time() {
        let snap = PricingSnapshot {
            last_update_time: 100,
            units_since_update: 1_000,
            ..snapshot()
        };
        let out = compute(SpendingFormula::Capped, &snap, &spend(130, 200, 0))
            .unwrap()
            .unwrap();
        assert_eq!(out.units_allocated, 300);
        assert_eq!(out.units_since_update, 700);
    }

    #[test]
    fn time_ordering_is_enforced_or_ignored_by_era() {
        let snap = PricingSnapshot {
            last_update_time: 100,
            ..snapshot()
        };
        assert_eq!(
            compute(SpendingFormula::Uncapped, &snap, &spend(99, 200, 0)).unwrap_err(),
            L1PricingError::InvalidTimeOrdering {
                update_time: 99,
                last_update_time: 100,
                current_time: 200
            }
        );
        assert!(compute(SpendingFormula::Accounted, &snap, &spend(201, 200, 0)).is_err());

        assert_eq!(
            compute(SpendingFormula::Legacy, &snap, &spend(99, 200, 0)).unwrap(),
            None
        );
        // Legacy also ignores reports for the current instant.
        assert_eq!(
            compute(SpendingFormula::Legacy, &snap, &spend(200, 200, 0)).unwrap(),
            None
        );
    }

    #[test]
    fn payouts_never_exceed_available_funds() {
        let snap = PricingSnapshot {
            last_update_time: 10,
            units_since_update: 100,
            available_funds: 1_500.into(),
            ..snapshot()
        };
        let out = compute(SpendingFormula::Accounted, &snap, &spend(20, 20, 5_000))
            .unwrap()
            .unwrap();

        // Rewards first (100 units * 10), then the poster gets the rest.
        assert_eq!(
            out.payments,
            vec![
                Payment {
                    to: REWARDS,
                    amount: 1_000.into(),
                    reason: PaymentReason::Reward
                },
                Payment {
                    to: PAY_TO,
                    amount: 500.into(),
                    reason: PaymentReason::PosterReimbursement
                },
            ]
        );
        assert_eq!(out.available_funds, U256::zero());
        assert_eq!(out.posters[0].funds_due, 4_500.into());
        assert_eq!(out.surplus, Some(BigInt::from(-4_500)));
    }

    #[test]
    fn cost_cap_limits_reimbursement() {
        let snap = PricingSnapshot {
            last_update_time: 10,
            units_since_update: 100,
            amortized_cost_cap_bips: 5_000,
            per_unit_reward: 0,
            ..snapshot()
        };
        // Cap: 10 wei * 100 units * 50% = 500.
        let capped = compute(SpendingFormula::Capped, &snap, &spend(20, 20, 5_000))
            .unwrap()
            .unwrap();
        assert_eq!(capped.posters[0].funds_due, 500.into());

        let uncapped = compute(SpendingFormula::Uncapped, &snap, &spend(20, 20, 5_000))
            .unwrap()
            .unwrap();
        assert_eq!(uncapped.posters[0].funds_due, 5_000.into());
    }

    #[test]
    fn deficit_raises_the_price_and_surplus_lowers_it() {
        let base = PricingSnapshot {
            last_update_time: 10,
            units_since_update: 10_000,
            per_unit_reward: 0,
            ..snapshot()
        };

        let deficit = compute(SpendingFormula::Accounted, &base, &spend(20, 20, 1_000_000))
            .unwrap()
            .unwrap();
        assert!(deficit.price_per_unit > base.price_per_unit);

        let flush = PricingSnapshot {
            available_funds: 1_000_000_000.into(),
            ..base.clone()
        };
        let surplus = compute(SpendingFormula::Accounted, &flush, &spend(20, 20, 0))
            .unwrap()
            .unwrap();
        assert!(surplus.price_per_unit < base.price_per_unit);
    }

    #[test]
    fn price_floors_at_zero() {
        let snap = PricingSnapshot {
            last_update_time: 10,
            units_since_update: 1,
            price_per_unit: 1.into(),
            available_funds: U256::MAX / 4,
            per_unit_reward: 0,
            ..snapshot()
        };
        let out = compute(SpendingFormula::Accounted, &snap, &spend(20, 20, 0))
            .unwrap()
            .unwrap();
        assert_eq!(out.price_per_unit, U256::zero());
    }

    #[test]
    fn legacy_pays_every_poster_in_table_order() {
        let other = PosterAccount {
            address: Address::repeat_byte(0x08),
            pay_to: Address::repeat_byte(0x09),
            funds_due: 300.into(),
        };
        let snap = PricingSnapshot {
            last_update_time: 10,
            units_since_update: 0,
            available_funds: 1_000.into(),
            total_funds_due: 300.into(),
            posters: vec![other.clone(), snapshot().posters[0].clone()],
            spender: 1,
            ..snapshot()
        };
        // Half the elapsed time, so half the pool may be paid out.
        let out = compute(SpendingFormula::Legacy, &snap, &spend(55, 100, 400))
            .unwrap()
            .unwrap();
        assert_eq!(
            out.payments,
            vec![
                Payment {
                    to: other.pay_to,
                    amount: 300.into(),
                    reason: PaymentReason::PosterReimbursement
                },
                Payment {
                    to: PAY_TO,
                    amount: 200.into(),
                    reason: PaymentReason::PosterReimbursement
                },
            ]
        );
        assert_eq!(out.posters[1].funds_due, 200.into());
        assert_eq!(out.available_funds, 500.into());
        assert_eq!(out.surplus, None);
    }

    #[test]
    fn legacy_first_update_starts_one_second_back() {
        let snap = PricingSnapshot {
            units_since_update: 100,
            available_funds: 5_100.into(),
            per_unit_reward: 0,
            ..snapshot()
        };
        // Last update becomes 49, so 1/51 of the units and of the pool.
        let out = compute(SpendingFormula::Legacy, &snap, &spend(50, 100, 1_000))
            .unwrap()
            .unwrap();
        assert_eq!(out.units_allocated, 1);
        assert_eq!(out.units_since_update, 99);
        assert_eq!(
            out.payments,
            vec![Payment {
                to: PAY_TO,
                amount: 100.into(),
                reason: PaymentReason::PosterReimbursement
            }]
        );

        // An update at time zero has no second to step back to.
        assert_eq!(
            compute(SpendingFormula::Legacy, &snap, &spend(0, 100, 1_000)).unwrap(),
            None
        );
    }

    /// Ten of twenty seconds elapsed: 50 of 100 units, 500 wei of rewards.
    fn era_snapshot() -> PricingSnapshot {
        PricingSnapshot {
            last_update_time: 10,
            units_since_update: 100,
            equilibration_units: 1_000.into(),
            available_funds: 10_000.into(),
            ..snapshot()
        }
    }

    fn reward(amount: u64) -> Payment {
        Payment {
            to: REWARDS,
            amount: amount.into(),
            reason: PaymentReason::Reward,
        }
    }

    fn reimbursement(amount: u64) -> Payment {
        Payment {
            to: PAY_TO,
            amount: amount.into(),
            reason: PaymentReason::PosterReimbursement,
        }
    }

    #[test]
    fn legacy_era_price_update() {
        let out = compute(SpendingFormula::Legacy, &era_snapshot(), &spend(20, 30, 2_000))
            .unwrap()
            .unwrap();
        assert_eq!(out.units_allocated, 50);
        assert_eq!(out.payments, vec![reward(500), reimbursement(2_000)]);
        assert_eq!(out.available_funds, 7_500.into());
        // (7500 * 999 - 10000 * 1000) / (1000 * (100 + 50)), floored.
        assert_eq!(out.price_per_unit, 983.into());
        assert_eq!(out.surplus, None);
    }

    #[test]
    fn uncapped_era_price_update() {
        let out = compute(SpendingFormula::Uncapped, &era_snapshot(), &spend(20, 30, 2_000))
            .unwrap()
            .unwrap();
        assert_eq!(out.units_allocated, 50);
        assert_eq!(out.payments, vec![reward(500), reimbursement(2_000)]);
        // Desired derivative -8, actual 150: (-158 * 50) / 150, floored.
        assert_eq!(out.price_per_unit, 947.into());
        assert_eq!(out.surplus, Some(BigInt::from(7_500)));
    }

    #[test]
    fn capped_era_price_update() {
        let snap = PricingSnapshot {
            amortized_cost_cap_bips: 5_000,
            ..era_snapshot()
        };
        let out = compute(SpendingFormula::Capped, &snap, &spend(20, 30, 2_000))
            .unwrap()
            .unwrap();
        // Cap: 10 wei * 50 units * 50%.
        assert_eq!(out.payments, vec![reward(500), reimbursement(250)]);
        assert_eq!(out.posters[0].funds_due, U256::zero());
        // Desired derivative -10, actual 185: (-195 * 50) / 150.
        assert_eq!(out.price_per_unit, 935.into());
        assert_eq!(out.surplus, Some(BigInt::from(9_250)));
    }

    #[test]
    fn accounted_era_price_update() {
        let snap = PricingSnapshot {
            available_funds: 300.into(),
            last_surplus: BigInt::from(-1_000),
            ..era_snapshot()
        };
        let out = compute(SpendingFormula::Accounted, &snap, &spend(20, 30, 2_000))
            .unwrap()
            .unwrap();
        assert_eq!(out.units_allocated, 50);
        assert_eq!(out.payments, vec![reward(300)]);
        assert_eq!(out.funds_due_for_rewards, 200.into());
        assert_eq!(out.posters[0].funds_due, 2_000.into());
        assert_eq!(out.available_funds, U256::zero());
        // Desired derivative 2, actual -24: (26 * 50) / 150, floored.
        assert_eq!(out.price_per_unit, 1_008.into());
        assert_eq!(out.surplus, Some(BigInt::from(-2_200)));
    }
}
