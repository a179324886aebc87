//! The versioned root of all overlay state.
//!
//! [`OverlayState`] owns the root sub-space of overlay storage and hands out
//! the pricing, retryable and block-hash sub-states living below it. The
//! protocol version stored at offset 0 only ever moves forward, one migration
//! at a time, through [`OverlayState::upgrade_to`].

use std::rc::Rc;

use ethereum_types::Address;
use log::{debug, info};
use thiserror::Error;

use crate::{
    blockhash::Blockhashes,
    burn::Burner,
    config::{ChainConfig, ConfigError},
    l1_pricing::{L1PricingError, L1PricingState},
    l2_pricing::L2PricingState,
    retryables::RetryableState,
    storage::{AddressSet, Storage, StorageBackedAddress, StorageBackedUint64, StorageError},
    world::SharedWorld,
};

mod migrations;

/// Highest protocol version this build knows how to run.
pub const MAX_SUPPORTED_VERSION: u64 = 11;

const VERSION_OFFSET: u64 = 0;
const UPGRADE_VERSION_OFFSET: u64 = 1;
const UPGRADE_TIMESTAMP_OFFSET: u64 = 2;
const LAST_TIMESTAMP_SEEN_OFFSET: u64 = 3;
const NETWORK_FEE_ACCOUNT_OFFSET: u64 = 4;
const CHAIN_ID_OFFSET: u64 = 5;

const L1_PRICING_SUBSPACE: &[u8] = &[0];
const L2_PRICING_SUBSPACE: &[u8] = &[1];
const RETRYABLES_SUBSPACE: &[u8] = &[2];
const BLOCKHASHES_SUBSPACE: &[u8] = &[3];
const CHAIN_OWNERS_SUBSPACE: &[u8] = &[4];

/// Stores the result of state container operations.
pub type StateResult<T> = Result<T, StateError>;

/// An error raised while opening, initializing or upgrading the overlay.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum StateError {
    #[error("overlay state is not initialized")]
    Uninitialized,

    #[error("overlay state is already initialized at version {version}")]
    AlreadyInitialized { version: u64 },

    /// This build cannot run the requested version; the operator has to
    /// upgrade the node.
    #[error("protocol version {version} is not supported (max {max})")]
    UnsupportedVersion { version: u64, max: u64 },

    #[error("migration to version {version} failed")]
    MigrationFailed {
        version: u64,
        #[source]
        source: StorageError,
    },

    #[error("{0:?} is not a chain owner")]
    NotChainOwner(Address),

    #[error("block timestamp {new} is before the last one seen ({last})")]
    TimestampDecreased { last: u64, new: u64 },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    L1Pricing(#[from] L1PricingError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl StateError {
    /// Whether the node has to stop processing blocks.
    pub fn is_fatal(&self) -> bool {
        match self {
            StateError::MigrationFailed { .. }
            | StateError::Storage(_)
            | StateError::UnsupportedVersion { .. } => true,
            StateError::L1Pricing(e) => e.is_fatal(),
            _ => false,
        }
    }
}

/// Handle to the overlay state of one world-state snapshot.
#[derive(Clone, Debug)]
pub struct OverlayState {
    version: u64,
    backing: Storage,
    upgrade_version: StorageBackedUint64,
    upgrade_timestamp: StorageBackedUint64,
    last_timestamp_seen: StorageBackedUint64,
    network_fee_account: StorageBackedAddress,
    chain_id: StorageBackedUint64,
    l1_pricing: L1PricingState,
    l2_pricing: L2PricingState,
    retryables: RetryableState,
    blockhashes: Blockhashes,
    chain_owners: AddressSet,
}

impl OverlayState {
    /// Opens previously initialized overlay state.
    pub fn open(world: SharedWorld, burner: Rc<dyn Burner>) -> StateResult<Self> {
        let backing = Storage::new(world, burner);
        let version = backing.get_u64_by_u64(VERSION_OFFSET)?;
        if version == 0 {
            return Err(StateError::Uninitialized);
        }
        if version > MAX_SUPPORTED_VERSION {
            return Err(StateError::UnsupportedVersion {
                version,
                max: MAX_SUPPORTED_VERSION,
            });
        }
        Ok(Self::open_at(backing, version))
    }

    fn open_at(backing: Storage, version: u64) -> Self {
        Self {
            version,
            upgrade_version: backing.open_uint64(UPGRADE_VERSION_OFFSET),
            upgrade_timestamp: backing.open_uint64(UPGRADE_TIMESTAMP_OFFSET),
            last_timestamp_seen: backing.open_uint64(LAST_TIMESTAMP_SEEN_OFFSET),
            network_fee_account: backing.open_address(NETWORK_FEE_ACCOUNT_OFFSET),
            chain_id: backing.open_uint64(CHAIN_ID_OFFSET),
            l1_pricing: L1PricingState::open(backing.open_sub_storage(L1_PRICING_SUBSPACE)),
            l2_pricing: L2PricingState::open(backing.open_sub_storage(L2_PRICING_SUBSPACE)),
            retryables: RetryableState::open(backing.open_sub_storage(RETRYABLES_SUBSPACE)),
            blockhashes: Blockhashes::open(backing.open_sub_storage(BLOCKHASHES_SUBSPACE)),
            chain_owners: AddressSet::open(backing.open_sub_storage(CHAIN_OWNERS_SUBSPACE)),
            backing,
        }
    }

    /// Writes the genesis state described by `config` at version 1, then
    /// upgrades straight to `desired_version`.
    pub fn initialize(
        world: SharedWorld,
        burner: Rc<dyn Burner>,
        desired_version: u64,
        config: &ChainConfig,
    ) -> StateResult<Self> {
        config.validate()?;
        if desired_version == 0 || desired_version > MAX_SUPPORTED_VERSION {
            return Err(StateError::UnsupportedVersion {
                version: desired_version,
                max: MAX_SUPPORTED_VERSION,
            });
        }

        let backing = Storage::new(world, burner);
        let existing = backing.get_u64_by_u64(VERSION_OFFSET)?;
        if existing != 0 {
            return Err(StateError::AlreadyInitialized { version: existing });
        }

        backing.set_u64_by_u64(VERSION_OFFSET, 1)?;
        backing.set_u64_by_u64(UPGRADE_VERSION_OFFSET, 0)?;
        backing.set_u64_by_u64(UPGRADE_TIMESTAMP_OFFSET, 0)?;
        backing.set_u64_by_u64(LAST_TIMESTAMP_SEEN_OFFSET, 0)?;
        backing
            .open_address(NETWORK_FEE_ACCOUNT_OFFSET)
            .set(config.network_fee_account)?;
        backing.set_u64_by_u64(CHAIN_ID_OFFSET, config.chain_id)?;

        L1PricingState::initialize(
            &backing.open_sub_storage(L1_PRICING_SUBSPACE),
            config.batch_poster,
            config.batch_poster,
            config.batch_poster_pay_to,
            config.initial_l1_price_per_unit,
        )?;
        L2PricingState::initialize(
            &backing.open_sub_storage(L2_PRICING_SUBSPACE),
            &config.l2_pricing,
        )?;
        RetryableState::initialize(&backing.open_sub_storage(RETRYABLES_SUBSPACE))?;
        Blockhashes::initialize(&backing.open_sub_storage(BLOCKHASHES_SUBSPACE))?;
        let owners = backing.open_sub_storage(CHAIN_OWNERS_SUBSPACE);
        AddressSet::initialize(&owners)?;
        AddressSet::open(owners).add(config.chain_owner)?;

        info!(
            "initialized overlay state for chain {} at version 1",
            config.chain_id
        );
        let mut state = Self::open_at(backing, 1);
        state.upgrade_to(desired_version)?;
        Ok(state)
    }

    /// Runs every migration from the current version up to `target`, in
    /// order, returning the versions reached. Targets at or below the current
    /// version do nothing.
    pub fn upgrade_to(&mut self, target: u64) -> StateResult<Vec<u64>> {
        if target > MAX_SUPPORTED_VERSION {
            return Err(StateError::UnsupportedVersion {
                version: target,
                max: MAX_SUPPORTED_VERSION,
            });
        }

        let mut reached = Vec::new();
        while self.version < target {
            let next = self.version + 1;
            migrations::run(self, next)
                .map_err(|source| StateError::MigrationFailed {
                    version: next,
                    source,
                })?;
            self.backing.set_u64_by_u64(VERSION_OFFSET, next)?;
            self.version = next;
            debug!("overlay state migrated to version {next}");
            reached.push(next);
        }

        if !reached.is_empty() {
            info!("overlay state upgraded to version {target}");
        }
        Ok(reached)
    }

    /// Arranges for [`Self::upgrade_if_due`] to upgrade to `target` once a
    /// block at or after `activate_at` starts.
    ///
    /// The target is only checked against [`MAX_SUPPORTED_VERSION`] when the
    /// upgrade runs, so a node can learn of an upgrade it cannot perform yet.
    pub fn schedule_upgrade(&self, target: u64, activate_at: u64) -> StateResult<()> {
        self.upgrade_version.set(target)?;
        self.upgrade_timestamp.set(activate_at)?;
        info!("scheduled upgrade to version {target} at timestamp {activate_at}");
        Ok(())
    }

    /// [`Self::schedule_upgrade`] on behalf of `caller`, who has to be a chain
    /// owner.
    pub fn schedule_upgrade_by(
        &self,
        caller: Address,
        target: u64,
        activate_at: u64,
    ) -> StateResult<()> {
        if !self.chain_owners.is_member(caller)? {
            return Err(StateError::NotChainOwner(caller));
        }
        self.schedule_upgrade(target, activate_at)
    }

    /// Performs the scheduled upgrade if it is due at `block_timestamp`,
    /// returning the version upgraded to.
    pub fn upgrade_if_due(&mut self, block_timestamp: u64) -> StateResult<Option<u64>> {
        let target = self.upgrade_version.get()?;
        if target <= self.version || block_timestamp < self.upgrade_timestamp.get()? {
            return Ok(None);
        }
        self.upgrade_to(target)?;
        Ok(Some(target))
    }

    /// The current protocol version.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn scheduled_upgrade(&self) -> StateResult<(u64, u64)> {
        Ok((self.upgrade_version.get()?, self.upgrade_timestamp.get()?))
    }

    /// Accounts allowed to administer the chain.
    pub fn chain_owners(&self) -> &AddressSet {
        &self.chain_owners
    }

    pub fn last_timestamp_seen(&self) -> StateResult<u64> {
        Ok(self.last_timestamp_seen.get()?)
    }

    /// Advances the clock to `timestamp`, letting L2 pricing catch up on the
    /// elapsed time.
    pub fn set_last_timestamp_seen(&self, timestamp: u64) -> StateResult<()> {
        let last = self.last_timestamp_seen.get()?;
        if timestamp < last {
            return Err(StateError::TimestampDecreased {
                last,
                new: timestamp,
            });
        }
        if timestamp > last {
            self.last_timestamp_seen.set(timestamp)?;
            self.l2_pricing.notify_time_elapsed(timestamp - last)?;
        }
        Ok(())
    }

    pub fn network_fee_account(&self) -> StateResult<Address> {
        Ok(self.network_fee_account.get()?)
    }

    pub fn set_network_fee_account(&self, account: Address) -> StateResult<()> {
        Ok(self.network_fee_account.set(account)?)
    }

    pub fn chain_id(&self) -> StateResult<u64> {
        Ok(self.chain_id.get()?)
    }

    pub fn l1_pricing(&self) -> &L1PricingState {
        &self.l1_pricing
    }

    pub fn l2_pricing(&self) -> &L2PricingState {
        &self.l2_pricing
    }

    pub fn retryables(&self) -> &RetryableState {
        &self.retryables
    }

    pub fn blockhashes(&self) -> &Blockhashes {
        &self.blockhashes
    }

    /// The root storage view.
    pub fn backing_storage(&self) -> &Storage {
        &self.backing
    }

    pub fn world(&self) -> &SharedWorld {
        self.backing.world()
    }

    pub fn burner(&self) -> &Rc<dyn Burner> {
        self.backing.burner()
    }
}
