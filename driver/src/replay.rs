//! Drives a [`Scenario`] through the overlay hooks, the way an execution
//! engine would, and summarizes what happened.

use std::{collections::BTreeMap, rc::Rc};

use anyhow::Context as _;
use ethereum_types::{Address, H256, U256};
use overlay_state::{
    hooks::{BlockHeaderInfo, BlockProcessor, HookError, OverlayTx, TxExecution, TxStart},
    retryables::{ReapOutcome, RetryTx},
    MemoryWorldState, OverlayState, SystemBurner, WorldState as _,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::scenario::{BlockInput, ExecutionInput, Scenario, TxInput};

/// Everything a replay produced.
#[derive(Clone, Debug, Serialize)]
pub struct ReplaySummary {
    pub chain_id: u64,
    pub final_version: u64,
    pub blocks: Vec<BlockSummary>,
    pub l1_price_per_unit: U256,
    pub l2_gas_price: U256,
    pub balances: BTreeMap<Address, U256>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct BlockSummary {
    pub number: u64,
    /// Set when the overlay refused to start the block.
    pub rejected: Option<String>,
    pub base_fee: U256,
    pub gas_available: u64,
    pub upgraded_to: Option<u64>,
    pub reaped: Vec<ReapOutcome>,
    pub txs: Vec<TxSummary>,
    pub report: Option<ReportSummary>,
    /// The block's internal transactions, `0x`-hex encoded.
    pub internal_txs: Vec<String>,
    pub internal_tx_hashes: Vec<H256>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct TxSummary {
    pub from: Address,
    /// Set when the overlay rejected the transaction.
    pub rejected: Option<String>,
    pub poster_gas: u64,
    pub gas_used: u64,
    pub network_fee: U256,
    pub poster_fee: U256,
    pub refund: U256,
    /// The automatic redeem, for retryable submissions that scheduled one.
    pub redeem: Option<Box<TxSummary>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ReportSummary {
    pub batch_number: u64,
    /// `None` when the report was dropped.
    pub units_allocated: Option<u64>,
    pub price_per_unit: U256,
}

/// Replays `scenario` on an empty in-memory world.
///
/// Transactions and blocks the overlay rejects are recorded in the summary;
/// any fatal error aborts the replay.
pub fn run(scenario: &Scenario) -> anyhow::Result<ReplaySummary> {
    let (world, shared) = MemoryWorldState::new_shared();
    for (&address, &amount) in &scenario.alloc {
        world.borrow_mut().add_balance(address, amount)?;
    }

    let config = &scenario.config;
    let mut state = OverlayState::initialize(
        shared,
        Rc::new(SystemBurner::new()),
        config.initial_version,
        config,
    )
    .context("failed to initialize the overlay state")?;
    info!(
        "replaying {} blocks on chain {} from version {}",
        scenario.blocks.len(),
        config.chain_id,
        state.version()
    );

    let mut blocks = Vec::with_capacity(scenario.blocks.len());
    for block in &scenario.blocks {
        let summary = replay_block(&mut state, block)
            .with_context(|| format!("fatal error in block {}", block.number))?;
        blocks.push(summary);
    }

    let balances = world
        .borrow()
        .balances()
        .map(|(&address, &balance)| (address, balance))
        .collect();
    Ok(ReplaySummary {
        chain_id: state.chain_id()?,
        final_version: state.version(),
        blocks,
        l1_price_per_unit: state.l1_pricing().price_per_unit()?,
        l2_gas_price: state.l2_pricing().gas_price_wei()?,
        balances,
    })
}

fn replay_block(state: &mut OverlayState, block: &BlockInput) -> anyhow::Result<BlockSummary> {
    if let Some(upgrade) = block.schedule_upgrade {
        state.schedule_upgrade(upgrade.target, upgrade.activate_at)?;
    }

    // Block assembly prices the block at the current L2 gas price.
    let base_fee = state.l2_pricing().gas_price_wei()?;
    let mut summary = BlockSummary {
        number: block.number,
        base_fee,
        ..BlockSummary::default()
    };

    let mut bp = BlockProcessor::new(state);
    let header = BlockHeaderInfo {
        number: block.number,
        timestamp: block.timestamp,
        base_fee,
        coinbase: block.coinbase,
        parent_hash: block.parent_hash,
    };
    let start = match bp.start_block(header, block.l1_block_number) {
        Ok(start) => start,
        Err(e) if !e.is_fatal() => {
            warn!("block {} rejected: {e}", block.number);
            summary.rejected = Some(e.to_string());
            return Ok(summary);
        }
        Err(e) => return Err(e.into()),
    };
    summary.gas_available = start.gas_available;
    summary.upgraded_to = start.upgraded_to;
    summary.reaped = start.reaped;

    for input in &block.txs {
        summary.txs.push(replay_tx(&mut bp, input)?);
    }

    if let Some(report) = &block.batch_posting_report {
        let outcome = bp.batch_posting_report(report)?;
        summary.report = Some(ReportSummary {
            batch_number: report.batch_number,
            units_allocated: outcome.as_ref().map(|o| o.units_allocated),
            price_per_unit: bp.state().l1_pricing().price_per_unit()?,
        });
    }
    bp.finalize()?;

    for tx in bp.internal_txs() {
        summary
            .internal_txs
            .push(format!("0x{}", hex::encode(tx.encode())));
        summary.internal_tx_hashes.push(tx.hash());
    }
    debug!("block {} done: {} txs", block.number, summary.txs.len());
    Ok(summary)
}

fn replay_tx(bp: &mut BlockProcessor<'_>, input: &TxInput) -> anyhow::Result<TxSummary> {
    let mut summary = TxSummary {
        from: input.tx.from(),
        ..TxSummary::default()
    };
    let Some(start) = start_or_reject(bp, &input.tx, &mut summary)? else {
        return Ok(summary);
    };
    summary.poster_gas = start.poster_gas;

    if start.end_tx_now {
        summary.gas_used = start.gas_used;
        if let Some(retry) = start.scheduled_retry {
            summary.redeem = Some(Box::new(replay_redeem(bp, retry, input.redeem)?));
        }
        return Ok(summary);
    }

    execute(bp, &start, input.execution, &mut summary)?;
    Ok(summary)
}

fn replay_redeem(
    bp: &mut BlockProcessor<'_>,
    retry: RetryTx,
    execution: ExecutionInput,
) -> anyhow::Result<TxSummary> {
    let tx = OverlayTx::Retry(retry);
    let mut summary = TxSummary {
        from: tx.from(),
        ..TxSummary::default()
    };
    if let Some(start) = start_or_reject(bp, &tx, &mut summary)? {
        execute(bp, &start, execution, &mut summary)?;
    }
    Ok(summary)
}

/// Runs the start hook, recording a rejection in `summary`.
fn start_or_reject(
    bp: &mut BlockProcessor<'_>,
    tx: &OverlayTx,
    summary: &mut TxSummary,
) -> anyhow::Result<Option<TxStart>> {
    match bp.start_tx(tx) {
        Ok(start) => Ok(Some(start)),
        Err(HookError::Tx(e)) => {
            warn!("transaction from {:?} rejected: {e}", tx.from());
            summary.rejected = Some(e.to_string());
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn execute(
    bp: &mut BlockProcessor<'_>,
    start: &TxStart,
    execution: ExecutionInput,
    summary: &mut TxSummary,
) -> anyhow::Result<()> {
    let gas_used = start.poster_gas.saturating_add(execution.compute_gas);
    let settlement = bp.end_tx(TxExecution {
        gas_used,
        success: execution.success,
    })?;
    summary.gas_used = gas_used;
    summary.network_fee = settlement.network_fee;
    summary.poster_fee = settlement.poster_fee;
    summary.refund = settlement.refund;
    Ok(())
}
