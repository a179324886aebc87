//! The table of accounts that post batches to the base layer and are
//! reimbursed for it.

use ethereum_types::{Address, U256};

use super::{L1PricingError, L1PricingResult};
use crate::storage::{
    AddressSet, Storage, StorageBackedAddress, StorageBackedBigUint, StorageResult,
};

const TOTAL_FUNDS_DUE_OFFSET: u64 = 0;
const POSTER_ADDRS_KEY: &[u8] = &[0];
const POSTER_INFO_KEY: &[u8] = &[1];

const PAY_TO_OFFSET: u64 = 0;
const FUNDS_DUE_OFFSET: u64 = 1;

#[derive(Clone, Debug)]
pub struct BatchPostersTable {
    poster_addrs: AddressSet,
    poster_info: Storage,
    total_funds_due: StorageBackedBigUint,
}

/// One poster's reimbursement account.
#[derive(Clone, Debug)]
pub struct BatchPosterState {
    address: Address,
    funds_due: StorageBackedBigUint,
    pay_to: StorageBackedAddress,
    total_funds_due: StorageBackedBigUint,
}

impl BatchPostersTable {
    pub fn initialize(storage: &Storage) -> StorageResult<()> {
        storage.open_big_uint(TOTAL_FUNDS_DUE_OFFSET).set(U256::zero())?;
        AddressSet::initialize(&storage.open_sub_storage(POSTER_ADDRS_KEY))
    }

    pub fn open(storage: &Storage) -> Self {
        Self {
            poster_addrs: AddressSet::open(storage.open_sub_storage(POSTER_ADDRS_KEY)),
            poster_info: storage.open_sub_storage(POSTER_INFO_KEY),
            total_funds_due: storage.open_big_uint(TOTAL_FUNDS_DUE_OFFSET),
        }
    }

    fn internal_open(&self, poster: Address) -> BatchPosterState {
        let sto = self.poster_info.open_sub_storage(poster.as_bytes());
        BatchPosterState {
            address: poster,
            funds_due: sto.open_big_uint(FUNDS_DUE_OFFSET),
            pay_to: sto.open_address(PAY_TO_OFFSET),
            total_funds_due: self.total_funds_due.clone(),
        }
    }

    /// Opens `poster`'s account. An unknown poster is registered, paying to
    /// itself, when `create_if_missing` is set.
    pub fn open_poster(
        &self,
        poster: Address,
        create_if_missing: bool,
    ) -> L1PricingResult<BatchPosterState> {
        if self.poster_addrs.is_member(poster)? {
            return Ok(self.internal_open(poster));
        }
        if !create_if_missing {
            return Err(L1PricingError::PosterNotFound(poster));
        }
        self.add_poster(poster, poster)
    }

    pub fn contains_poster(&self, poster: Address) -> StorageResult<bool> {
        self.poster_addrs.is_member(poster)
    }

    /// Registers a new poster with nothing due.
    pub fn add_poster(&self, poster: Address, pay_to: Address) -> L1PricingResult<BatchPosterState> {
        if self.poster_addrs.is_member(poster)? {
            return Err(L1PricingError::PosterAlreadyExists(poster));
        }
        let state = self.internal_open(poster);
        state.funds_due.set(U256::zero())?;
        state.pay_to.set(pay_to)?;
        self.poster_addrs.add(poster)?;
        Ok(state)
    }

    /// Up to `max` posters, in registration order.
    pub fn all_posters(&self, max: u64) -> StorageResult<Vec<Address>> {
        self.poster_addrs.all_members(max)
    }

    /// Sum of every poster's `funds_due`.
    pub fn total_funds_due(&self) -> StorageResult<U256> {
        self.total_funds_due.get()
    }
}

impl BatchPosterState {
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn funds_due(&self) -> StorageResult<U256> {
        self.funds_due.get()
    }

    /// Sets what this poster is owed, keeping the table's total in step.
    pub fn set_funds_due(&self, value: U256) -> StorageResult<()> {
        let prev = self.funds_due.get()?;
        let total = self.total_funds_due.get()?;
        self.total_funds_due
            .set(total.saturating_sub(prev).saturating_add(value))?;
        self.funds_due.set(value)
    }

    pub fn pay_to(&self) -> StorageResult<Address> {
        self.pay_to.get()
    }

    pub fn set_pay_to(&self, pay_to: Address) -> StorageResult<()> {
        self.pay_to.set(pay_to)
    }
}
