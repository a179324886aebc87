use std::{fs::File, io};

use anyhow::{Context as _, Result};
use clap::Parser;
use overlay_driver::{env::load_dotenvy_vars_if_present, Scenario};
use tracing::{debug, info, warn};

mod replay {
    pub mod cli;
}

use self::replay::cli;

fn main() -> Result<()> {
    let env_file = load_dotenvy_vars_if_present();
    overlay_driver::tracing::init();
    match env_file {
        Ok(Some(path)) => debug!("loaded environment from {}", path.display()),
        Ok(None) => (),
        Err(e) => warn!("ignoring malformed `.env` file: {e}"),
    }

    let args = cli::Cli::parse();

    let mut scenario = Scenario::from_path(&args.scenario)?;
    if let Some(version) = args.initial_version {
        scenario.config.initial_version = version;
    }
    if let Some(chain_id) = args.chain_id {
        scenario.config.chain_id = chain_id;
    }

    let summary = overlay_driver::run(&scenario)
        .with_context(|| format!("replay of {} failed", args.scenario.display()))?;
    info!(
        "replayed {} blocks, ending at version {}",
        summary.blocks.len(),
        summary.final_version
    );

    let writer: Box<dyn io::Write> = match &args.output {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("couldn't create {}", path.display()))?,
        ),
        None => Box::new(io::stdout().lock()),
    };
    if args.pretty {
        serde_json::to_writer_pretty(writer, &summary)?;
    } else {
        serde_json::to_writer(writer, &summary)?;
    }

    Ok(())
}
