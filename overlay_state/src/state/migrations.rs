//! One hard-coded migration per protocol version.

use overlay_common::L1_PRICER_FUNDS_POOL_ADDRESS;

use super::OverlayState;
use crate::{
    l1_pricing::{
        INITIAL_EQUILIBRATION_UNITS_V6, INITIAL_PER_BATCH_GAS_COST_V11,
        INITIAL_PER_BATCH_GAS_COST_V3,
    },
    storage::StorageResult,
};

/// Brings the state from `version - 1` to `version`.
///
/// Versions without an entry only change behavior that is gated on the
/// version number at the call site.
pub(super) fn run(state: &OverlayState, version: u64) -> StorageResult<()> {
    let l1 = state.l1_pricing();
    match version {
        // The amortized cost cap starts applying.
        3 => l1.set_per_batch_gas_cost(INITIAL_PER_BATCH_GAS_COST_V3),
        6 => l1.set_equilibration_units(INITIAL_EQUILIBRATION_UNITS_V6.into()),
        // Payouts are bounded by the fee counter from here on.
        10 => {
            let balance = state
                .world()
                .borrow()
                .balance(L1_PRICER_FUNDS_POOL_ADDRESS)?;
            l1.set_l1_fees_available(balance)
        }
        11 => l1.set_per_batch_gas_cost(INITIAL_PER_BATCH_GAS_COST_V11),
        _ => Ok(()),
    }
}
