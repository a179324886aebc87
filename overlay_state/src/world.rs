//! The boundary to the world-state store the overlay lives in.
//!
//! The overlay never owns the world state: the driver hands it a
//! [`SharedWorld`] for the duration of a block and reads the results back out
//! of the same handle afterwards.

use std::{cell::RefCell, collections::BTreeMap, fmt::Debug, rc::Rc};

use ethereum_types::{Address, H256, U256};
use thiserror::Error;

/// Stores the result of world-state accesses.
pub type WorldResult<T> = Result<T, WorldError>;

/// An error raised by the world-state store.
#[derive(Clone, Debug, Eq, Error, Hash, PartialEq)]
pub enum WorldError {
    /// The account does not hold enough funds for a debit.
    #[error("insufficient balance in {address:?}: needed {needed}, have {available}")]
    InsufficientBalance {
        /// Account that was debited.
        address: Address,
        /// Amount requested.
        needed: U256,
        /// Balance at the time of the request.
        available: U256,
    },

    /// A credit would overflow the account balance.
    #[error("balance overflow in {0:?}")]
    BalanceOverflow(Address),

    /// The backing store failed.
    #[error("world state backend failure: {0}")]
    Backend(String),
}

/// Accessors the overlay needs from the trie-backed world state.
pub trait WorldState: Debug {
    /// Reads a storage word. Unset slots read as zero.
    fn storage(&self, account: Address, slot: H256) -> WorldResult<H256>;
    /// Writes a storage word.
    fn set_storage(&mut self, account: Address, slot: H256, value: H256) -> WorldResult<()>;
    /// Reads an account balance.
    fn balance(&self, account: Address) -> WorldResult<U256>;
    /// Credits an account.
    fn add_balance(&mut self, account: Address, amount: U256) -> WorldResult<()>;
    /// Debits an account, failing if the balance is too low.
    fn sub_balance(&mut self, account: Address, amount: U256) -> WorldResult<()>;
}

/// Shared handle to the world state for one block.
///
/// `Rc<RefCell<..>>` keeps the handle `!Send`, so only one thread can ever
/// mutate a snapshot.
pub type SharedWorld = Rc<RefCell<dyn WorldState>>;

/// Moves `amount` between accounts. A missing `from` mints and a missing `to`
/// burns.
pub fn transfer_balance(
    world: &mut dyn WorldState,
    from: Option<Address>,
    to: Option<Address>,
    amount: U256,
) -> WorldResult<()> {
    if let Some(from) = from {
        world.sub_balance(from, amount)?;
    }
    if let Some(to) = to {
        world.add_balance(to, amount)?;
    }
    Ok(())
}

/// An in-memory [`WorldState`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MemoryWorldState {
    storage: BTreeMap<(Address, H256), H256>,
    balances: BTreeMap<Address, U256>,
}

impl MemoryWorldState {
    /// Creates an empty world.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a fresh empty world into a [`SharedWorld`] while keeping a typed
    /// handle for inspection.
    pub fn new_shared() -> (Rc<RefCell<MemoryWorldState>>, SharedWorld) {
        let typed = Rc::new(RefCell::new(Self::new()));
        let shared: SharedWorld = typed.clone();
        (typed, shared)
    }

    /// Number of non-zero storage words held for `account`.
    pub fn storage_len(&self, account: Address) -> usize {
        self.storage.keys().filter(|(a, _)| *a == account).count()
    }

    /// Every account with a non-zero balance, in address order.
    pub fn balances(&self) -> impl Iterator<Item = (&Address, &U256)> {
        self.balances.iter()
    }
}

impl WorldState for MemoryWorldState {
    fn storage(&self, account: Address, slot: H256) -> WorldResult<H256> {
        Ok(self
            .storage
            .get(&(account, slot))
            .copied()
            .unwrap_or_default())
    }

    fn set_storage(&mut self, account: Address, slot: H256, value: H256) -> WorldResult<()> {
        if value.is_zero() {
            self.storage.remove(&(account, slot));
        } else {
            self.storage.insert((account, slot), value);
        }
        Ok(())
    }

    fn balance(&self, account: Address) -> WorldResult<U256> {
        Ok(self.balances.get(&account).copied().unwrap_or_default())
    }

    fn add_balance(&mut self, account: Address, amount: U256) -> WorldResult<()> {
        if amount.is_zero() {
            return Ok(());
        }
        let balance = self.balances.entry(account).or_default();
        *balance = balance
            .checked_add(amount)
            .ok_or(WorldError::BalanceOverflow(account))?;
        Ok(())
    }

    fn sub_balance(&mut self, account: Address, amount: U256) -> WorldResult<()> {
        if amount.is_zero() {
            return Ok(());
        }
        let available = self.balance(account)?;
        let remaining = available
            .checked_sub(amount)
            .ok_or(WorldError::InsufficientBalance {
                address: account,
                needed: amount,
                available,
            })?;
        if remaining.is_zero() {
            self.balances.remove(&account);
        } else {
            self.balances.insert(account, remaining);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_words_are_not_stored() {
        let mut world = MemoryWorldState::new();
        let acct = Address::repeat_byte(1);
        let slot = H256::repeat_byte(2);

        world.set_storage(acct, slot, H256::repeat_byte(3)).unwrap();
        assert_eq!(world.storage_len(acct), 1);
        world.set_storage(acct, slot, H256::zero()).unwrap();
        assert_eq!(world.storage_len(acct), 0);
        assert_eq!(world.storage(acct, slot).unwrap(), H256::zero());
    }

    #[test]
    fn transfers_mint_burn_and_move() {
        let mut world = MemoryWorldState::new();
        let a = Address::repeat_byte(0xa);
        let b = Address::repeat_byte(0xb);

        transfer_balance(&mut world, None, Some(a), 10.into()).unwrap();
        transfer_balance(&mut world, Some(a), Some(b), 4.into()).unwrap();
        transfer_balance(&mut world, Some(b), None, 1.into()).unwrap();

        assert_eq!(world.balance(a).unwrap(), 6.into());
        assert_eq!(world.balance(b).unwrap(), 3.into());

        let err = transfer_balance(&mut world, Some(b), Some(a), 4.into()).unwrap_err();
        assert_eq!(
            err,
            WorldError::InsufficientBalance {
                address: b,
                needed: 4.into(),
                available: 3.into(),
            }
        );
        // A failed debit leaves both sides untouched.
        assert_eq!(world.balance(a).unwrap(), 6.into());
    }
}
