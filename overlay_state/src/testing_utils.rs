use std::{cell::RefCell, rc::Rc};

use crate::{
    burn::SystemBurner, config::ChainConfig, state::OverlayState, storage::Storage,
    world::MemoryWorldState,
};

pub(crate) type TestWorld = Rc<RefCell<MemoryWorldState>>;

pub(crate) fn common_setup() {
    // Try init since multiple tests calling `init` will cause an error.
    let _ = pretty_env_logger::try_init();
}

/// A root storage view over a fresh in-memory world, metered by a
/// [`SystemBurner`].
pub(crate) fn memory_storage() -> (TestWorld, Storage) {
    let (world, shared) = MemoryWorldState::new_shared();
    (world, Storage::new(shared, Rc::new(SystemBurner::new())))
}

/// A freshly initialized overlay at `version`, using the default chain
/// configuration.
pub(crate) fn initialized_state(version: u64) -> (TestWorld, OverlayState) {
    common_setup();
    let (world, shared) = MemoryWorldState::new_shared();
    let state = OverlayState::initialize(
        shared,
        Rc::new(SystemBurner::new()),
        version,
        &ChainConfig::default(),
    )
    .unwrap();
    (world, state)
}
