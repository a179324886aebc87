use ethereum_types::{Address, U256};
use overlay_driver::{run, Scenario};

fn init_logger() {
    let _ = pretty_env_logger::try_init();
}

fn basic() -> anyhow::Result<Scenario> {
    Scenario::from_json_str(include_str!("../scenarios/basic.json"))
}

#[test]
fn replays_the_basic_scenario() -> anyhow::Result<()> {
    init_logger();
    let summary = run(&basic()?)?;
    assert_eq!(summary.chain_id, 412_346);
    assert_eq!(summary.final_version, 11);
    assert_eq!(summary.blocks.len(), 2);

    let first = &summary.blocks[0];
    assert!(first.rejected.is_none());
    assert_eq!(first.txs.len(), 3);
    assert!(first.txs.iter().all(|tx| tx.rejected.is_none()));

    let transfer = &first.txs[1];
    assert!(transfer.poster_gas > 0);
    assert_eq!(transfer.gas_used, transfer.poster_gas + 30_000);
    assert_eq!(transfer.network_fee, first.base_fee * U256::from(30_000));

    let redeem = first.txs[2].redeem.as_deref().expect("redeem was scheduled");
    assert!(redeem.rejected.is_none());
    assert_eq!(redeem.gas_used, 50_000);
    assert_eq!(redeem.refund, first.base_fee * U256::from(50_000));

    let report = first.report.as_ref().expect("report was processed");
    assert!(report.units_allocated.unwrap_or_default() > 0);
    assert_eq!(first.internal_txs.len(), 2);
    assert_eq!(first.internal_tx_hashes.len(), 2);

    let second = &summary.blocks[1];
    assert_eq!(second.txs.len(), 1);
    assert!(second.txs[0].rejected.is_some());
    assert_eq!(second.internal_txs.len(), 1);

    let refund_addr = Address::repeat_byte(0x33);
    assert!(summary.balances[&refund_addr] > U256::zero());
    Ok(())
}

#[test]
fn replay_is_deterministic() -> anyhow::Result<()> {
    init_logger();
    let scenario = basic()?;
    let a = serde_json::to_string(&run(&scenario)?)?;
    let b = serde_json::to_string(&run(&scenario)?)?;
    assert_eq!(a, b);
    Ok(())
}

#[test]
fn rejected_blocks_do_not_stop_the_replay() -> anyhow::Result<()> {
    init_logger();
    let mut scenario = basic()?;
    // Goes back in time.
    scenario.blocks[1].timestamp = 10;
    let summary = run(&scenario)?;
    assert!(summary.blocks[1].rejected.is_some());
    assert!(summary.blocks[1].txs.is_empty());
    Ok(())
}
