//! Replays recorded or hand-written block scenarios through the overlay, for
//! debugging and regression testing without an execution engine.

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_debug_implementations)]

pub mod env;
pub mod replay;
pub mod scenario;
pub mod tracing;

pub use replay::{run, ReplaySummary};
pub use scenario::Scenario;

/// Common information for the `--version` CLI flags.
pub fn version() -> String {
    format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}
