use std::path::PathBuf;

use clap::{Parser, ValueHint};

/// Replays a block scenario through the overlay and prints a JSON summary.
#[derive(Parser)]
#[command(version = overlay_driver::version(), propagate_version = true)]
pub(crate) struct Cli {
    /// The scenario to replay.
    #[arg(short, long, env = "OVERLAY_SCENARIO", value_hint = ValueHint::FilePath)]
    pub(crate) scenario: PathBuf,
    /// Where to write the summary. Defaults to stdout.
    #[arg(short, long, env = "OVERLAY_OUTPUT", value_hint = ValueHint::FilePath)]
    pub(crate) output: Option<PathBuf>,
    /// Overrides the scenario's genesis protocol version.
    #[arg(long, env = "OVERLAY_INITIAL_VERSION")]
    pub(crate) initial_version: Option<u64>,
    /// Overrides the scenario's chain id.
    #[arg(long, env = "OVERLAY_CHAIN_ID")]
    pub(crate) chain_id: Option<u64>,
    /// Pretty-print the summary.
    #[arg(long, env = "OVERLAY_PRETTY", default_value_t = false)]
    pub(crate) pretty: bool,
}
