//! The fixed sequence of calls an execution engine makes into the overlay.
//!
//! A [`BlockProcessor`] walks one block through
//! `NotStarted → InProgress → (Reported) → Finalized`:
//!
//! 1. [`BlockProcessor::start_block`] runs the block-start pseudo-op: records
//!    base-layer block history, reaps up to two expired retryables, advances L2
//!    pricing by the elapsed time and runs any upgrade that is due.
//! 2. For every transaction, [`BlockProcessor::start_tx`] charges the
//!    overlay's share before execution and [`BlockProcessor::end_tx`] settles
//!    fees after it.
//! 3. Optionally, [`BlockProcessor::batch_posting_report`] feeds what a
//!    batch cost to post into L1 pricing.
//! 4. [`BlockProcessor::finalize`] closes the block.
//!
//! Both pseudo-ops are logged as [`InternalTx`]s. Calling a hook out of order
//! fails with [`HookError::OutOfOrder`].

use ethereum_types::{Address, H256, U256};
use log::{debug, error, info, warn};
use overlay_common::{L1_PRICER_FUNDS_POOL_ADDRESS, L1_SYSTEM_SENDER, TX_GAS};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    l1_pricing::formulas::SpendingOutcome,
    retryables::{
        retryable_escrow_address, NewRetryable, ReapOutcome, RetryTx, RETRYABLE_LIFETIME_SECONDS,
    },
    state::{OverlayState, StateError},
    storage::StorageError,
    world::{transfer_balance, WorldError},
};

mod internal_tx;
mod tx;

pub use internal_tx::{InternalTx, InternalTxError, INTERNAL_TX_TYPE};
pub use tx::{
    retryable_submission_fee, DepositTx, OrdinaryTx, OverlayTx, SubmitRetryableTx, TxError,
    TxExecution, TxSettlement, TxStart,
};

/// Retryables reaped at the start of every block, at most.
pub const RETRYABLES_REAPED_PER_BLOCK: usize = 2;

/// Stores the result of hook calls.
pub type HookResult<T> = Result<T, HookError>;

/// An error raised by a hook.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum HookError {
    #[error("{hook} called while the block is {phase:?}")]
    OutOfOrder {
        hook: &'static str,
        phase: BlockPhase,
    },

    /// The engine reported more gas used than the transaction had.
    #[error("transaction used {gas_used} gas with a limit of {gas_limit}")]
    GasOverrun { gas_used: u64, gas_limit: u64 },

    #[error(transparent)]
    Tx(#[from] TxError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl HookError {
    /// Whether block processing has to stop. Anything else only rejects the
    /// current transaction.
    pub fn is_fatal(&self) -> bool {
        match self {
            HookError::Tx(_) => false,
            HookError::State(e) => e.is_fatal(),
            _ => true,
        }
    }
}

impl From<WorldError> for HookError {
    fn from(err: WorldError) -> Self {
        HookError::Storage(err.into())
    }
}

/// Where a block is in the hook sequence.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BlockPhase {
    NotStarted,
    InProgress,
    Reported,
    Finalized,
}

/// The block-assembly fields the hooks read.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct BlockHeaderInfo {
    /// L2 block number.
    pub number: u64,
    pub timestamp: u64,
    /// Price of L2 gas in this block.
    pub base_fee: U256,
    /// The block's poster. Only blocks from the designated batch poster pay
    /// for L1 data.
    pub coinbase: Address,
    /// Hash of the previous L2 block.
    pub parent_hash: H256,
}

/// A base-layer batch and what it cost to post.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct BatchPostingReport {
    pub batch_timestamp: u64,
    pub poster: Address,
    pub batch_number: u64,
    /// Calldata gas of the batch on the base layer.
    pub batch_data_gas: u64,
    pub l1_base_fee: U256,
}

/// What the block-start pseudo-op did.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StartBlockOutcome {
    pub internal_tx: InternalTx,
    /// One entry per reap attempt.
    pub reaped: Vec<ReapOutcome>,
    pub upgraded_to: Option<u64>,
    /// Gas the block may use.
    pub gas_available: u64,
}

/// An ordinary transaction between its start and end hooks.
#[derive(Clone, Debug)]
struct PendingOrdinary {
    from: Address,
    gas_limit: u64,
    gas_fee_cap: U256,
    poster_gas: u64,
    poster_fee: U256,
    /// Bought up front for the whole gas limit.
    prepaid: U256,
    /// L1 data units the transaction adds to the next batch.
    units: u64,
}

#[derive(Clone, Debug)]
enum PendingTx {
    Ordinary(PendingOrdinary),
    Retry(RetryTx),
}

/// Drives one block through the hook sequence.
#[derive(Debug)]
pub struct BlockProcessor<'a> {
    state: &'a mut OverlayState,
    phase: BlockPhase,
    header: Option<BlockHeaderInfo>,
    pending: Option<PendingTx>,
    internal_txs: Vec<InternalTx>,
}

impl<'a> BlockProcessor<'a> {
    pub fn new(state: &'a mut OverlayState) -> Self {
        Self {
            state,
            phase: BlockPhase::NotStarted,
            header: None,
            pending: None,
            internal_txs: Vec::new(),
        }
    }

    pub fn phase(&self) -> BlockPhase {
        self.phase
    }

    pub fn state(&self) -> &OverlayState {
        self.state
    }

    /// Pseudo-ops run so far, in order.
    pub fn internal_txs(&self) -> &[InternalTx] {
        &self.internal_txs
    }

    fn expect_phase(&self, hook: &'static str, allowed: &[BlockPhase]) -> HookResult<()> {
        if !allowed.contains(&self.phase) || self.pending.is_some() {
            return Err(HookError::OutOfOrder {
                hook,
                phase: self.phase,
            });
        }
        Ok(())
    }

    fn header(&self, hook: &'static str) -> HookResult<BlockHeaderInfo> {
        self.header.clone().ok_or(HookError::OutOfOrder {
            hook,
            phase: self.phase,
        })
    }

    /// Runs the block-start pseudo-op. `l1_block_number` is the base-layer
    /// block the rollup has caught up to.
    pub fn start_block(
        &mut self,
        header: BlockHeaderInfo,
        l1_block_number: u64,
    ) -> HookResult<StartBlockOutcome> {
        self.expect_phase("start_block", &[BlockPhase::NotStarted])?;

        let last_timestamp = self.state.last_timestamp_seen()?;
        if header.timestamp < last_timestamp {
            return Err(StateError::TimestampDecreased {
                last: last_timestamp,
                new: header.timestamp,
            }
            .into());
        }
        let internal_tx = InternalTx::StartBlock {
            l1_block_number,
            l2_block_number: header.number,
            time_passed: header.timestamp - last_timestamp,
        };

        let version = self.state.version();
        let blockhashes = self.state.blockhashes();
        if blockhashes.l1_block_number()? < l1_block_number {
            blockhashes.record_new_l1_block(l1_block_number - 1, header.parent_hash, version)?;
        }

        let mut reaped = Vec::with_capacity(RETRYABLES_REAPED_PER_BLOCK);
        for _ in 0..RETRYABLES_REAPED_PER_BLOCK {
            let outcome = self.state.retryables().try_to_reap_one(header.timestamp)?;
            debug!("reap at {}: {outcome:?}", header.timestamp);
            reaped.push(outcome);
        }

        self.state.set_last_timestamp_seen(header.timestamp)?;
        let upgraded_to = self.state.upgrade_if_due(header.timestamp)?;
        let gas_available = self.state.l2_pricing().per_block_gas_available()?;

        info!(
            "started block {} at {} (L1 block {l1_block_number}), {gas_available} gas available",
            header.number, header.timestamp
        );
        self.internal_txs.push(internal_tx.clone());
        self.header = Some(header);
        self.phase = BlockPhase::InProgress;

        Ok(StartBlockOutcome {
            internal_tx,
            reaped,
            upgraded_to,
            gas_available,
        })
    }

    /// Charges the overlay's share of `tx` before the engine executes it.
    pub fn start_tx(&mut self, tx: &OverlayTx) -> HookResult<TxStart> {
        self.expect_phase("start_tx", &[BlockPhase::InProgress])?;
        match tx {
            OverlayTx::Ordinary(tx) => self.start_ordinary(tx),
            OverlayTx::Deposit(tx) => self.apply_deposit(tx),
            OverlayTx::SubmitRetryable(tx) => self.submit_retryable(tx),
            OverlayTx::Retry(tx) => self.start_retry(tx),
        }
    }

    fn start_ordinary(&mut self, tx: &OrdinaryTx) -> HookResult<TxStart> {
        let header = self.header("start_tx")?;
        let base_fee = header.base_fee;
        if !tx.gas_fee_cap.is_zero() && tx.gas_fee_cap < base_fee {
            return Err(TxError::FeeCapBelowBaseFee {
                fee_cap: tx.gas_fee_cap,
                base_fee,
            }
            .into());
        }

        let (poster_cost, units) = self
            .state
            .l1_pricing()
            .poster_data_cost(header.coinbase, &tx.data)?;
        // Estimation calls get a slightly cheaper gas price, so they ask for
        // more poster gas than a real call would.
        let gas_price = if tx.gas_fee_cap.is_zero() {
            base_fee.saturating_mul(15.into()) / 16
        } else {
            base_fee
        };
        let (poster_gas, poster_fee) = if gas_price.is_zero() {
            (0, U256::zero())
        } else {
            let gas = poster_cost / gas_price;
            let gas = if gas > U256::from(u64::MAX) {
                u64::MAX
            } else {
                gas.as_u64()
            };
            (gas, gas_price.saturating_mul(gas.into()))
        };

        if tx.gas_limit < poster_gas {
            return Err(TxError::InsufficientGasForPoster {
                gas_limit: tx.gas_limit,
                poster_gas,
            }
            .into());
        }
        let max_cost = base_fee.saturating_mul(tx.gas_limit.into());
        let available = self.state.world().borrow().balance(tx.from)?;
        if available < max_cost {
            return Err(TxError::InsufficientFunds {
                address: tx.from,
                needed: max_cost,
                available,
            }
            .into());
        }
        // Gas for the whole limit leaves the sender before execution.
        transfer_balance(
            &mut *self.state.world().borrow_mut(),
            Some(tx.from),
            None,
            max_cost,
        )?;

        self.pending = Some(PendingTx::Ordinary(PendingOrdinary {
            from: tx.from,
            gas_limit: tx.gas_limit,
            gas_fee_cap: tx.gas_fee_cap,
            poster_gas,
            poster_fee,
            prepaid: max_cost,
            units,
        }));
        Ok(TxStart {
            poster_gas,
            ..TxStart::default()
        })
    }

    fn apply_deposit(&mut self, tx: &DepositTx) -> HookResult<TxStart> {
        if tx.from != L1_SYSTEM_SENDER {
            return Err(TxError::DepositNotFromSystem(tx.from).into());
        }
        self.state
            .world()
            .borrow_mut()
            .add_balance(tx.to, tx.value)?;
        debug!("deposited {} wei to {:?}", tx.value, tx.to);
        Ok(TxStart {
            end_tx_now: true,
            ..TxStart::default()
        })
    }

    fn submit_retryable(&mut self, tx: &SubmitRetryableTx) -> HookResult<TxStart> {
        let header = self.header("start_tx")?;
        // The deposit is already paid on the base layer and lands whatever
        // happens to the submission.
        self.state
            .world()
            .borrow_mut()
            .add_balance(tx.from, tx.deposit_value)?;

        let submission_fee = retryable_submission_fee(tx.data.len(), tx.l1_base_fee);
        if submission_fee > tx.max_submission_fee {
            return Err(TxError::SubmissionFeeTooHigh {
                fee: submission_fee,
                max: tx.max_submission_fee,
            }
            .into());
        }

        let network_fee_account = self.state.network_fee_account()?;
        let escrow = retryable_escrow_address(tx.ticket_id);
        {
            let mut world = self.state.world().borrow_mut();
            let available = world.balance(tx.from)?;
            let needed = tx.max_submission_fee.saturating_add(tx.value);
            if available < needed {
                return Err(TxError::InsufficientFunds {
                    address: tx.from,
                    needed,
                    available,
                }
                .into());
            }

            transfer_balance(
                &mut *world,
                Some(tx.from),
                Some(network_fee_account),
                submission_fee,
            )?;
            transfer_balance(
                &mut *world,
                Some(tx.from),
                Some(tx.fee_refund_addr),
                tx.max_submission_fee - submission_fee,
            )?;
            transfer_balance(&mut *world, Some(tx.from), Some(escrow), tx.value)?;
        }

        let retryables = self.state.retryables();
        let ticket = retryables.create_retryable(&NewRetryable {
            id: tx.ticket_id,
            timeout: header.timestamp.saturating_add(RETRYABLE_LIFETIME_SECONDS),
            from: tx.from,
            to: tx.to,
            callvalue: tx.value,
            beneficiary: tx.beneficiary,
            calldata: tx.data.clone(),
        })?;
        info!("created retryable {:?} from {:?}", tx.ticket_id, tx.from);

        let base_fee = header.base_fee;
        let gas_cost = base_fee.saturating_mul(tx.gas.into());
        let balance = self.state.world().borrow().balance(tx.from)?;
        if balance < gas_cost || tx.gas < TX_GAS || tx.gas_fee_cap < base_fee {
            debug!("retryable {:?} is not redeemed automatically", tx.ticket_id);
            return Ok(TxStart {
                end_tx_now: true,
                ..TxStart::default()
            });
        }

        transfer_balance(
            &mut *self.state.world().borrow_mut(),
            Some(tx.from),
            Some(network_fee_account),
            gas_cost,
        )?;
        self.state
            .l2_pricing()
            .add_to_gas_pools(-i64::try_from(tx.gas).unwrap_or(i64::MAX))?;

        let nonce = ticket.num_tries()?;
        ticket.increment_num_tries()?;
        let retry = ticket.make_retry_tx(nonce, tx.gas, base_fee, tx.fee_refund_addr, gas_cost)?;
        info!(
            "scheduled redeem of {:?} with {} gas (attempt {nonce})",
            tx.ticket_id, tx.gas
        );
        Ok(TxStart {
            poster_gas: 0,
            end_tx_now: true,
            gas_used: tx.gas,
            scheduled_retry: Some(retry),
        })
    }

    fn start_retry(&mut self, tx: &RetryTx) -> HookResult<TxStart> {
        let now = self.header("start_tx")?.timestamp;
        if self
            .state
            .retryables()
            .open_retryable(tx.ticket_id, now)?
            .is_none()
        {
            return Err(TxError::RetryableNotFound(tx.ticket_id).into());
        }

        let escrow = retryable_escrow_address(tx.ticket_id);
        transfer_balance(
            &mut *self.state.world().borrow_mut(),
            Some(escrow),
            Some(tx.from),
            tx.value,
        )
        .map_err(|e| match TxError::from_world(&e) {
            Some(tx_err) => HookError::Tx(tx_err),
            None => e.into(),
        })?;

        self.pending = Some(PendingTx::Retry(tx.clone()));
        Ok(TxStart::default())
    }

    /// Settles the transaction started by the last [`Self::start_tx`].
    pub fn end_tx(&mut self, execution: TxExecution) -> HookResult<TxSettlement> {
        let Some(pending) = self.pending.take() else {
            return Err(HookError::OutOfOrder {
                hook: "end_tx",
                phase: self.phase,
            });
        };
        match pending {
            PendingTx::Ordinary(tx) => self.end_ordinary(execution, tx),
            PendingTx::Retry(tx) => self.end_retry(execution, &tx),
        }
    }

    fn end_ordinary(
        &mut self,
        execution: TxExecution,
        tx: PendingOrdinary,
    ) -> HookResult<TxSettlement> {
        if execution.gas_used > tx.gas_limit {
            return Err(HookError::GasOverrun {
                gas_used: execution.gas_used,
                gas_limit: tx.gas_limit,
            });
        }
        let header = self.header("end_tx")?;
        let version = self.state.version();
        let network_fee_account = self.state.network_fee_account()?;

        let total_cost = header
            .base_fee
            .saturating_mul(execution.gas_used.into())
            .min(tx.prepaid);
        let refund = tx.prepaid - total_cost;
        let mut poster_fee = tx.poster_fee;
        if total_cost < poster_fee {
            error!("total cost {total_cost} is below the poster fee {poster_fee}");
            poster_fee = U256::zero();
        }
        let compute_cost = total_cost - poster_fee;
        let poster_fee_recipient = if version < 2 {
            header.coinbase
        } else {
            L1_PRICER_FUNDS_POOL_ADDRESS
        };

        {
            let mut world = self.state.world().borrow_mut();
            world.add_balance(tx.from, refund)?;
            world.add_balance(network_fee_account, compute_cost)?;
            world.add_balance(poster_fee_recipient, poster_fee)?;
        }

        let l1 = self.state.l1_pricing();
        if version >= 10 {
            l1.add_to_l1_fees_available(poster_fee)?;
        }
        l1.add_to_units_since_update(tx.units)?;

        if !tx.gas_fee_cap.is_zero() {
            if execution.gas_used < tx.poster_gas {
                error!(
                    "gas used {} is below the poster gas {}",
                    execution.gas_used, tx.poster_gas
                );
            }
            let compute_gas = execution.gas_used.saturating_sub(tx.poster_gas);
            self.state
                .l2_pricing()
                .add_to_gas_pools(-i64::try_from(compute_gas).unwrap_or(i64::MAX))?;
        }

        Ok(TxSettlement {
            network_fee: compute_cost,
            poster_fee,
            refund,
        })
    }

    fn end_retry(&mut self, execution: TxExecution, tx: &RetryTx) -> HookResult<TxSettlement> {
        if execution.gas_used > tx.gas {
            return Err(HookError::GasOverrun {
                gas_used: execution.gas_used,
                gas_limit: tx.gas,
            });
        }
        let gas_left = tx.gas - execution.gas_used;
        let network_fee_account = self.state.network_fee_account()?;

        let mut refund = tx
            .gas_fee_cap
            .saturating_mul(gas_left.into())
            .min(tx.max_refund);
        {
            let mut world = self.state.world().borrow_mut();
            if let Err(e) = transfer_balance(
                &mut *world,
                Some(network_fee_account),
                Some(tx.refund_to),
                refund,
            ) {
                error!("network fee account cannot refund unused redeem gas: {e}");
                refund = U256::zero();
            }
            if !execution.success {
                let escrow = retryable_escrow_address(tx.ticket_id);
                transfer_balance(&mut *world, Some(tx.from), Some(escrow), tx.value)?;
            }
        }

        if execution.success {
            self.state.retryables().delete_retryable(tx.ticket_id)?;
            info!("redeemed retryable {:?}", tx.ticket_id);
        } else {
            info!(
                "redeem of {:?} failed, callvalue returned to escrow",
                tx.ticket_id
            );
        }
        self.state
            .l2_pricing()
            .add_to_gas_pools(i64::try_from(gas_left).unwrap_or(i64::MAX))?;

        Ok(TxSettlement {
            refund,
            ..TxSettlement::default()
        })
    }

    /// Accounts for the cost of posting a batch. Reports the pricing engine
    /// rejects are logged and dropped; only storage failures are returned.
    pub fn batch_posting_report(
        &mut self,
        report: &BatchPostingReport,
    ) -> HookResult<Option<SpendingOutcome>> {
        self.expect_phase("batch_posting_report", &[BlockPhase::InProgress])?;
        let internal_tx = InternalTx::BatchPostingReport {
            batch_timestamp: report.batch_timestamp,
            poster: report.poster,
            batch_number: report.batch_number,
            batch_data_gas: report.batch_data_gas,
            l1_base_fee: report.l1_base_fee,
        };
        self.internal_txs.push(internal_tx);
        self.phase = BlockPhase::Reported;

        let current_time = self.header("batch_posting_report")?.timestamp;
        let l1 = self.state.l1_pricing();
        let per_batch_gas = u64::try_from(l1.per_batch_gas_cost()?).unwrap_or(0);
        let wei_spent = report
            .l1_base_fee
            .saturating_mul(per_batch_gas.saturating_add(report.batch_data_gas).into());

        match l1.update_for_batch_poster_spending(
            self.state.version(),
            report.batch_timestamp,
            current_time,
            report.poster,
            wei_spent,
            report.l1_base_fee,
        ) {
            Ok(outcome) => Ok(outcome),
            Err(e) if !e.is_fatal() => {
                warn!("dropping batch posting report {}: {e}", report.batch_number);
                Ok(None)
            }
            Err(e) => Err(StateError::from(e).into()),
        }
    }

    /// Closes the block.
    pub fn finalize(&mut self) -> HookResult<()> {
        self.expect_phase("finalize", &[BlockPhase::InProgress, BlockPhase::Reported])?;
        self.phase = BlockPhase::Finalized;
        debug!(
            "finalized block with {} internal txs",
            self.internal_txs.len()
        );
        Ok(())
    }
}
