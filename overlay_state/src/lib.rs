//! The versioned state-transition overlay of a rollup node.
//!
//! Every block and every transaction a rollup node replays passes through the
//! overlay. It decides the fees users pay for base-layer data and for L2
//! execution, manages deferred "retryable" calls submitted from the base
//! layer, and applies protocol upgrades one version at a time. All of it is
//! deterministic: independent nodes replaying the same message log end up with
//! bit-identical storage.
//!
//! The overlay keeps its state in the storage of a single fictional account
//! of the world state it is handed ([`world::WorldState`]). The
//! [`storage::Storage`] view carves that account into hash-derived sub-spaces,
//! one per component:
//!
//! - [`state::OverlayState`], the root container tracking the protocol version
//!   and owning everything below.
//! - [`l1_pricing::L1PricingState`], the congestion-priced fee for posting
//!   transaction data to the base layer.
//! - [`l2_pricing::L2PricingState`], the leaky-bucket price of L2 execution
//!   gas.
//! - [`retryables::RetryableState`], deferred calls with amortized expiry.
//! - [`blockhash::Blockhashes`], recent base-layer block hashes.
//!
//! [`hooks`] ties these together into the fixed sequence of calls an execution
//! engine makes per block and per transaction.

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_debug_implementations)]

pub mod blockhash;
pub mod burn;
pub mod config;
pub mod hooks;
pub mod l1_pricing;
pub mod l2_pricing;
pub mod retryables;
pub mod state;
pub mod storage;
pub mod util;
pub mod world;

#[cfg(test)]
pub(crate) mod testing_utils;

pub use burn::{Burner, GasMeter, SystemBurner};
pub use config::ChainConfig;
pub use state::{OverlayState, MAX_SUPPORTED_VERSION};
pub use world::{MemoryWorldState, SharedWorld, WorldState};
